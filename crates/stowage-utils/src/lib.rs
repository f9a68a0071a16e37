//! Shared helpers for the stowage registry: atomic filesystem writes, blake3 checksums,
//! per-package commit locks, size/duration parsing and name validation.

pub mod bytes;
pub mod error;
pub mod fs;
pub mod hash;
pub mod lock;
pub mod name;
pub mod path;
pub mod string;
pub mod time;
