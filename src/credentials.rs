//! Credential construction for hub authentication
//!
//! Every connect attempt derives three strings from the static device
//! identity: the token scope, the username identity string and a
//! time-bounded SAS token used as the MQTT password. Nothing here is cached;
//! the session rebuilds a [`Credential`] for every (re)connect.

use crate::clock::Clock;
use crate::config::DeviceIdentity;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Client type reported to the hub in the username
pub const CLIENT_DEVICE_TYPE_PREFIX: &str = "iothubclient";

/// Version reported to the hub in the username
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Device key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("Device key cannot be used as an HMAC key")]
    InvalidHmacKey,
}

/// `<hub>.<suffix>/devices/<device id>`
pub fn build_scope(hub_name: &str, hub_suffix: &str, device_id: &str) -> String {
    format!("{hub_name}.{hub_suffix}/devices/{device_id}")
}

/// `<hub>.<suffix>/<device id>/DeviceClientType=<prefix>%2F<version>`
pub fn build_username(
    hub_name: &str,
    hub_suffix: &str,
    device_id: &str,
    client_type_prefix: &str,
    sdk_version: &str,
) -> String {
    format!("{hub_name}.{hub_suffix}/{device_id}/DeviceClientType={client_type_prefix}%2F{sdk_version}")
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Build a shared access signature for `scope` valid until `expiry`.
///
/// The signed string is `url_encode(scope) + "\n" + expiry`, keyed with the
/// base64-decoded device key. `skn` is only emitted for a non-empty key name.
pub fn build_sas_token(
    device_key: &str,
    scope: &str,
    key_name: &str,
    expiry: u64,
) -> Result<String, CredentialError> {
    let key = base64::engine::general_purpose::STANDARD.decode(device_key)?;
    let encoded_scope = url_encode(scope);

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| CredentialError::InvalidHmacKey)?;
    mac.update(format!("{encoded_scope}\n{expiry}").as_bytes());
    let signature =
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={encoded_scope}&sig={}&se={expiry}",
        url_encode(&signature)
    );
    if !key_name.is_empty() {
        token.push_str("&skn=");
        token.push_str(&url_encode(key_name));
    }
    Ok(token)
}

/// Authentication material for one connect attempt
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub scope: String,
    pub username: String,
    pub token: String,
    /// Seconds since the Unix epoch
    pub expiry: u64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("scope", &self.scope)
            .field("username", &self.username)
            .field("token", &"***")
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl Credential {
    /// Derive a fresh credential expiring `lifetime` from now
    pub fn issue(
        identity: &DeviceIdentity,
        clock: &dyn Clock,
        lifetime: Duration,
    ) -> Result<Self, CredentialError> {
        let scope = build_scope(&identity.hub_name, &identity.hub_suffix, &identity.device_id);
        let username = build_username(
            &identity.hub_name,
            &identity.hub_suffix,
            &identity.device_id,
            CLIENT_DEVICE_TYPE_PREFIX,
            SDK_VERSION,
        );
        let expiry = clock.unix_time_secs().saturating_add(lifetime.as_secs());
        let token = build_sas_token(&identity.device_key, &scope, "", expiry)?;

        Ok(Self {
            scope,
            username,
            token,
            expiry,
        })
    }
}
