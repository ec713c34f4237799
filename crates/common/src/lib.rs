//! Common types shared by the keyrelay crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
