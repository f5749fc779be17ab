//! Pluggable content ciphers.
//!
//! A module turns fixed-size plaintext blocks into self-contained ciphertext
//! blocks and back. The module id is written into the file header, so a file
//! is always decrypted by the module that produced it; an unknown id is an
//! error, never a silent fall-through to raw bytes.

use std::sync::Arc;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use dashmap::DashMap;
use rand::RngCore;

use crate::encryption::keys::FileKey;
use crate::error::StorageError;

/// Block cipher plugin surface.
pub trait EncryptionModule: Send + Sync {
    /// Identifier written into file headers.
    fn id(&self) -> &str;

    /// Plaintext bytes per block.
    fn unencrypted_block_size(&self) -> usize;

    /// Ciphertext bytes per block (plaintext plus per-block overhead).
    fn encrypted_block_size(&self) -> usize;

    fn encrypt_block(
        &self,
        key: &FileKey,
        block_index: u64,
        header_nonce: &[u8; 12],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, StorageError>;

    fn decrypt_block(
        &self,
        key: &FileKey,
        block_index: u64,
        header_nonce: &[u8; 12],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, StorageError>;
}

/// Default module: AES-256-GCM over 32 KiB blocks.
///
/// Each block is `12-byte nonce || ciphertext || 16-byte tag`. The AAD binds
/// the block to its position and to the file: block index (u64 BE) followed
/// by the header nonce, so blocks cannot be reordered or swapped between
/// files without failing authentication.
#[derive(Debug, Default)]
pub struct AesGcmModule;

pub const AES_GCM_MODULE_ID: &str = "strata/aes-gcm";

const PLAIN_BLOCK: usize = 32 * 1024;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const BLOCK_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

fn aad(block_index: u64, header_nonce: &[u8; 12]) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..8].copy_from_slice(&block_index.to_be_bytes());
    aad[8..].copy_from_slice(header_nonce);
    aad
}

impl AesGcmModule {
    fn cipher(&self, key: &FileKey) -> Result<Aes256Gcm, StorageError> {
        Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| StorageError::Module {
            module: AES_GCM_MODULE_ID.to_string(),
            message: "invalid key length".to_string(),
        })
    }

    fn module_error(&self, message: &str) -> StorageError {
        StorageError::Module {
            module: AES_GCM_MODULE_ID.to_string(),
            message: message.to_string(),
        }
    }
}

impl EncryptionModule for AesGcmModule {
    fn id(&self) -> &str {
        AES_GCM_MODULE_ID
    }

    fn unencrypted_block_size(&self) -> usize {
        PLAIN_BLOCK
    }

    fn encrypted_block_size(&self) -> usize {
        PLAIN_BLOCK + BLOCK_OVERHEAD
    }

    fn encrypt_block(
        &self,
        key: &FileKey,
        block_index: u64,
        header_nonce: &[u8; 12],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        if plaintext.len() > PLAIN_BLOCK {
            return Err(self.module_error("plaintext block too large"));
        }
        let mut block_nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut block_nonce);

        let aad = aad(block_index, header_nonce);
        let sealed = self
            .cipher(key)?
            .encrypt(
                Nonce::from_slice(&block_nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| self.module_error("block encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&block_nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt_block(
        &self,
        key: &FileKey,
        block_index: u64,
        header_nonce: &[u8; 12],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        if ciphertext.len() < BLOCK_OVERHEAD || ciphertext.len() > PLAIN_BLOCK + BLOCK_OVERHEAD {
            return Err(self.module_error("ciphertext block length out of range"));
        }
        let (block_nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let aad = aad(block_index, header_nonce);
        self.cipher(key)?
            .decrypt(
                Nonce::from_slice(block_nonce),
                Payload { msg: sealed, aad: &aad },
            )
            .map_err(|_| self.module_error("block authentication failed"))
    }
}

/// Module id to implementation mapping consulted when reading headers.
pub struct ModuleRegistry {
    modules: DashMap<String, Arc<dyn EncryptionModule>>,
    default_id: String,
}

impl ModuleRegistry {
    /// Registry with the AES-GCM module registered as the default.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            modules: DashMap::new(),
            default_id: AES_GCM_MODULE_ID.to_string(),
        };
        registry.register(Arc::new(AesGcmModule));
        registry
    }

    pub fn register(&self, module: Arc<dyn EncryptionModule>) {
        self.modules.insert(module.id().to_string(), module);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn EncryptionModule>, StorageError> {
        self.modules
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| StorageError::Module {
                module: id.to_string(),
                message: "module is not registered".to_string(),
            })
    }

    /// Module used for new writes and for legacy headerless files.
    pub fn default_module(&self) -> Result<Arc<dyn EncryptionModule>, StorageError> {
        self.get(&self.default_id)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
