//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers don't depend on the secrecy crate
//! directly.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
