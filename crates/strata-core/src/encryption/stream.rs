//! Block-transforming streams and ciphertext size arithmetic.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::debug;

use crate::encryption::header::FileHeader;
use crate::encryption::keys::FileKey;
use crate::encryption::module::EncryptionModule;
use crate::error::StorageError;
use crate::storage::{ReadStream, WriteStream};

/// Callback run after the backing stream commits, with the logical
/// (plaintext) byte count.
pub type Finalize = Box<dyn FnOnce(u64) -> Result<(), StorageError> + Send>;

/// Callback run when the write is undone.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Physical (ciphertext) size of a file holding `logical` plaintext bytes,
/// including `header_len` bytes of prefix.
#[must_use]
pub fn encrypted_size(module: &dyn EncryptionModule, logical: u64, header_len: u64) -> u64 {
    let plain = module.unencrypted_block_size() as u64;
    let sealed = module.encrypted_block_size() as u64;
    let overhead = sealed - plain;
    let full = logical / plain;
    let rem = logical % plain;
    header_len + full * sealed + if rem > 0 { rem + overhead } else { 0 }
}

/// Logical (plaintext) size recovered from a physical size. Fails when the
/// physical size cannot be produced by whole blocks plus one shorter tail
/// block.
pub fn decrypted_size(
    module: &dyn EncryptionModule,
    physical: u64,
    header_len: u64,
) -> Result<u64, StorageError> {
    let plain = module.unencrypted_block_size() as u64;
    let sealed = module.encrypted_block_size() as u64;
    let overhead = sealed - plain;
    let body = physical.checked_sub(header_len).ok_or(StorageError::Module {
        module: module.id().to_string(),
        message: "physical size smaller than the header".to_string(),
    })?;
    let full = body / sealed;
    let rem = body % sealed;
    if rem == 0 {
        return Ok(full * plain);
    }
    if rem <= overhead {
        return Err(StorageError::Module {
            module: module.id().to_string(),
            message: "trailing bytes shorter than the block overhead".to_string(),
        });
    }
    Ok(full * plain + (rem - overhead))
}

/// Stream transform sealing plaintext into header-prefixed ciphertext
/// blocks.
///
/// The header goes out before the first content byte. Plaintext is buffered
/// to whole blocks; the tail block flushes on commit, so a zero-byte file is
/// just the header. `commit` reports the logical byte count, then runs the
/// finalize hook (key persistence, metadata bookkeeping); `abort` undoes the
/// backing write and runs the cleanup hook.
pub struct EncryptWriter {
    inner: Option<Box<dyn WriteStream>>,
    module: Arc<dyn EncryptionModule>,
    key: FileKey,
    header_nonce: [u8; 12],
    pending: Vec<u8>,
    block_index: u64,
    logical: u64,
    on_commit: Option<Finalize>,
    on_abort: Option<Cleanup>,
}

impl EncryptWriter {
    pub fn new(
        mut inner: Box<dyn WriteStream>,
        module: Arc<dyn EncryptionModule>,
        key: FileKey,
        header: &FileHeader,
        on_commit: Finalize,
        on_abort: Cleanup,
    ) -> Result<Self, StorageError> {
        let encoded = header.encode()?;
        if let Err(err) = inner.write_all(&encoded) {
            let _ = inner.abort();
            on_abort();
            return Err(err);
        }
        Ok(Self {
            inner: Some(inner),
            module,
            key,
            header_nonce: header.nonce,
            pending: Vec::new(),
            block_index: 0,
            logical: 0,
            on_commit: Some(on_commit),
            on_abort: Some(on_abort),
        })
    }

    fn fail(&mut self, err: StorageError) -> StorageError {
        if let Some(inner) = self.inner.take() {
            let _ = inner.abort();
        }
        if let Some(cleanup) = self.on_abort.take() {
            cleanup();
        }
        err
    }

    fn seal_pending_block(&mut self, len: usize) -> Result<(), StorageError> {
        let block: Vec<u8> = self.pending.drain(..len).collect();
        let sealed = match self.module.encrypt_block(
            &self.key,
            self.block_index,
            &self.header_nonce,
            &block,
        ) {
            Ok(sealed) => sealed,
            Err(err) => return Err(self.fail(err)),
        };
        let Some(inner) = self.inner.as_mut() else {
            return Err(StorageError::Unsupported { op: "write" });
        };
        if let Err(err) = inner.write_all(&sealed) {
            return Err(self.fail(err));
        }
        self.block_index += 1;
        Ok(())
    }
}

impl WriteStream for EncryptWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if self.inner.is_none() {
            return Err(StorageError::Unsupported { op: "write" });
        }
        self.pending.extend_from_slice(data);
        self.logical += data.len() as u64;
        let block = self.module.unencrypted_block_size();
        while self.pending.len() >= block {
            self.seal_pending_block(block)?;
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<u64, StorageError> {
        if !self.pending.is_empty() {
            let len = self.pending.len();
            self.seal_pending_block(len)?;
        }
        let Some(inner) = self.inner.take() else {
            return Err(StorageError::Unsupported { op: "commit" });
        };
        match inner.commit() {
            Ok(physical) => {
                debug!(
                    logical = self.logical,
                    physical,
                    blocks = self.block_index,
                    "encrypted write committed"
                );
                if let Some(finalize) = self.on_commit.take() {
                    finalize(self.logical)?;
                }
                Ok(self.logical)
            }
            Err(err) => {
                if let Some(cleanup) = self.on_abort.take() {
                    cleanup();
                }
                Err(err)
            }
        }
    }

    fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        let result = match self.inner.take() {
            Some(inner) => inner.abort(),
            None => Ok(()),
        };
        if let Some(cleanup) = self.on_abort.take() {
            cleanup();
        }
        result
    }
}

/// Seekable plaintext view over header-prefixed ciphertext.
///
/// Seeks translate logical offsets into block indices; only the blocks a
/// read actually touches are fetched and opened, one at a time.
pub struct DecryptReader {
    inner: Box<dyn ReadStream>,
    module: Arc<dyn EncryptionModule>,
    key: FileKey,
    header_nonce: [u8; 12],
    header_len: u64,
    logical_size: u64,
    pos: u64,
    current: Option<(u64, Vec<u8>)>,
}

impl DecryptReader {
    #[must_use]
    pub fn new(
        inner: Box<dyn ReadStream>,
        module: Arc<dyn EncryptionModule>,
        key: FileKey,
        header_nonce: [u8; 12],
        header_len: u64,
        logical_size: u64,
    ) -> Self {
        Self {
            inner,
            module,
            key,
            header_nonce,
            header_len,
            logical_size,
            pos: 0,
            current: None,
        }
    }

    fn load_block(&mut self, index: u64) -> io::Result<()> {
        let sealed_len = self.module.encrypted_block_size();
        let offset = self.header_len + index * sealed_len as u64;
        self.inner.seek(SeekFrom::Start(offset))?;

        let mut sealed = vec![0u8; sealed_len];
        let mut filled = 0;
        while filled < sealed_len {
            let n = self.inner.read(&mut sealed[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        sealed.truncate(filled);

        let plaintext = self
            .module
            .decrypt_block(&self.key, index, &self.header_nonce, &sealed)
            .map_err(io::Error::other)?;
        self.current = Some((index, plaintext));
        Ok(())
    }
}

impl Read for DecryptReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.logical_size {
            return Ok(0);
        }
        let plain = self.module.unencrypted_block_size() as u64;
        let index = self.pos / plain;
        if self.current.as_ref().map(|(i, _)| *i) != Some(index) {
            self.load_block(index)?;
        }
        let Some((_, block)) = self.current.as_ref() else {
            return Ok(0);
        };
        let offset = (self.pos - index * plain) as usize;
        let available = block
            .len()
            .saturating_sub(offset)
            .min((self.logical_size - self.pos) as usize);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&block[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for DecryptReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => i128::from(self.logical_size) + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = u64::try_from(target)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;
        Ok(self.pos)
    }
}
