pub mod publish;
pub mod types;

pub use publish::*;
pub use types::*;
