pub mod config;
pub mod durable;
pub mod error;
pub mod types;

pub use error::{ErrorKind, KwError, KwResult};
pub use types::{
    FilesystemId, KeyState, PolicyDescriptor, ProtectorDescriptor, ProtectorKind,
};
