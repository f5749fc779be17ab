//! Per-file encryption header.
//!
//! A fixed 64-byte prefix written before any ciphertext block:
//!
//! ```text
//! offset  size  field
//! 0       8     magic "STRA1FE\0"
//! 8       2     format version, u16 big-endian
//! 10      2     flags, u16 big-endian (bit 0: per-file signature present)
//! 12      1     module id length
//! 13      n     module id bytes (ASCII)
//! 13+n    12    header nonce
//! ..64          zero padding
//! ```
//!
//! The header names the module that wrote the file; readers never guess.
//! Files without the magic are either plaintext or legacy headerless
//! ciphertext, which the metadata flag distinguishes.

use crate::error::StorageError;

pub const HEADER_LEN: usize = 64;
pub const MAGIC: &[u8; 8] = b"STRA1FE\0";
pub const FORMAT_VERSION: u16 = 1;

const FLAG_SIGNED: u16 = 1;
const NONCE_LEN: usize = 12;
const MAX_MODULE_ID: usize = HEADER_LEN - MAGIC.len() - 2 - 2 - 1 - NONCE_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub signed: bool,
    pub module_id: String,
    pub nonce: [u8; NONCE_LEN],
}

impl FileHeader {
    #[must_use]
    pub fn new(module_id: &str, nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            version: FORMAT_VERSION,
            signed: false,
            module_id: module_id.to_string(),
            nonce,
        }
    }

    /// Whether a content prefix carries the header magic.
    #[must_use]
    pub fn is_present(content: &[u8]) -> bool {
        content.len() >= MAGIC.len() && &content[..MAGIC.len()] == MAGIC
    }

    pub fn encode(&self) -> Result<[u8; HEADER_LEN], StorageError> {
        if self.module_id.len() > MAX_MODULE_ID || !self.module_id.is_ascii() {
            return Err(StorageError::Module {
                module: self.module_id.clone(),
                message: "module id does not fit the header".to_string(),
            });
        }
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(MAGIC);
        out[8..10].copy_from_slice(&self.version.to_be_bytes());
        let flags = if self.signed { FLAG_SIGNED } else { 0 };
        out[10..12].copy_from_slice(&flags.to_be_bytes());
        let id = self.module_id.as_bytes();
        out[12] = id.len() as u8;
        out[13..13 + id.len()].copy_from_slice(id);
        out[13 + id.len()..13 + id.len() + NONCE_LEN].copy_from_slice(&self.nonce);
        Ok(out)
    }

    pub fn decode(path: &str, bytes: &[u8]) -> Result<Self, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidHeader {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        if bytes.len() < HEADER_LEN {
            return Err(invalid("truncated header"));
        }
        if !Self::is_present(bytes) {
            return Err(invalid("missing magic"));
        }
        let version = u16::from_be_bytes([bytes[8], bytes[9]]);
        if version == 0 || version > FORMAT_VERSION {
            return Err(invalid("unsupported format version"));
        }
        let flags = u16::from_be_bytes([bytes[10], bytes[11]]);
        let id_len = bytes[12] as usize;
        if id_len == 0 || id_len > MAX_MODULE_ID {
            return Err(invalid("module id length out of range"));
        }
        let module_id = std::str::from_utf8(&bytes[13..13 + id_len])
            .map_err(|_| invalid("module id is not ASCII"))?
            .to_string();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[13 + id_len..13 + id_len + NONCE_LEN]);
        Ok(Self {
            version,
            signed: flags & FLAG_SIGNED != 0,
            module_id,
            nonce,
        })
    }
}
