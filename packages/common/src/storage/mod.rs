mod error;
mod hash;
mod traits;

pub mod azure;
pub mod filesystem;

pub use azure::AzureObjectStore;
pub use error::StorageError;
pub use filesystem::LocalObjectStore;
pub use hash::{Fingerprint, FingerprintBuilder};
pub use traits::{BoxReader, ObjectInfo, ObjectStore, validate_key};
