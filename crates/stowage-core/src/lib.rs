use error::StoreError;

pub mod document;
pub mod error;
pub mod revision;
pub mod storage;
pub mod upload;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
