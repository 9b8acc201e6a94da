//! Common types shared by the account rotator crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
