pub mod cache;
pub mod clock;
pub mod encryption;
pub mod error;
pub mod lock;
pub mod path;
pub mod storage;
pub mod wrapper;

pub use error::StorageError;
pub use storage::{
    ChecksumAlgo, FileType, FreeSpace, Metadata, Permissions, ReadStream, Stat, Storage,
    WriteMode, WriteStream,
};
pub use wrapper::{Wrapper, bottom, same_backend, unwrap_to, wraps};
