//! Common types for the LabGen studio workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
