//! Session start authentication against the gateway auth mode.

use sha2::{Digest, Sha256};

use parley_core::config::GatewayAuthConfig;
use parley_core::error::{ParleyError, Result};

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check the `authToken` of a `start_session` message.
///
/// In `password` mode the token carries the password; hashes are compared.
pub fn authenticate(auth: Option<&GatewayAuthConfig>, provided: Option<&str>) -> Result<()> {
    let Some(auth) = auth else {
        return Ok(());
    };
    let provided = provided.filter(|t| !t.is_empty());

    match auth.effective_mode() {
        "none" => Ok(()),
        "token" => {
            let expected = auth
                .resolve_token()
                .ok_or_else(|| ParleyError::Config("server token not configured".into()))?;
            let token = provided.ok_or_else(|| ParleyError::Auth("authToken required".into()))?;
            if constant_time_eq(token, &expected) {
                Ok(())
            } else {
                Err(ParleyError::Auth("invalid token".into()))
            }
        }
        "password" => {
            let expected = auth
                .resolve_password()
                .ok_or_else(|| ParleyError::Config("server password not configured".into()))?;
            let password =
                provided.ok_or_else(|| ParleyError::Auth("authToken required".into()))?;
            let expected_hash = format!("{:x}", Sha256::digest(expected.as_bytes()));
            let provided_hash = format!("{:x}", Sha256::digest(password.as_bytes()));
            if constant_time_eq(&provided_hash, &expected_hash) {
                Ok(())
            } else {
                Err(ParleyError::Auth("invalid password".into()))
            }
        }
        other => Err(ParleyError::Config(format!("unknown auth mode: {other}"))),
    }
}
