//! LLM provider setup via rig-core.
//!
//! Provides a helper function to create an Anthropic [`Client`] from a
//! [`SecretString`]-wrapped API key. The intent classifier builds its
//! agent from this client.
//!
//! [`Client`]: rig::providers::anthropic::Client
//! [`SecretString`]: secrecy::SecretString

use secrecy::{ExposeSecret, SecretString};

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}
