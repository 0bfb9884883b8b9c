//! Provisioning token lifecycle.
//!
//! A device is provisioned once it holds a non-empty token issued by the
//! service. The token is persisted and only read back during initialization,
//! so acquiring one always ends in a restart and leaves the in-memory view
//! untouched until then.

use heapless::String;

use crate::config::{ServiceCommand, ServiceEndpoints};
use crate::error::{CheckInError, ProtocolFault, StateFault};
use crate::platform::{KeyValueStore, ResponseBody, Transport};
use crate::restart::{RestartReason, RestartRequest};

/// Store key holding `"1"` once a token has been issued.
pub const PROVISIONED_KEY: &str = "provisioned";

/// Store key holding the token itself.
pub const TOKEN_KEY: &str = "token";

pub const MAX_TOKEN_LEN: usize = 64;

pub type Token = String<MAX_TOKEN_LEN>;

/// In-memory view of the persisted provisioning state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisioningStore {
    provisioned: bool,
    token: Token,
}

impl ProvisioningStore {
    /// Unprovisioned, empty token.
    pub const fn new() -> Self {
        Self {
            provisioned: false,
            token: String::new(),
        }
    }

    /// Reads the persisted flag and, when set, the token.
    pub fn load<S: KeyValueStore>(&mut self, store: &mut S) {
        self.provisioned = store.read_flag(PROVISIONED_KEY);
        self.token.clear();

        if self.provisioned {
            match store.read_string(TOKEN_KEY) {
                Some(token) => {
                    // Stored values share the token capacity.
                    let _ = self.token.push_str(token.as_str());
                }
                None => warn!("provisioning: flag set but token missing"),
            }
        }
    }

    #[must_use]
    pub const fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Clears the persisted flag and token. Does not restart.
    pub fn unprovision<S: KeyValueStore>(&mut self, store: &mut S) {
        if !store.write(PROVISIONED_KEY, "0") || !store.write(TOKEN_KEY, "") {
            warn!("provisioning: failed to clear persisted state");
        }
        self.provisioned = false;
        self.token.clear();
        info!("provisioning: device unprovisioned");
    }
}

/// Requests a token and persists it on success. The caller's
/// [`ProvisioningStore`] picks it up after the restart.
///
/// # Errors
///
/// Returns the transport or HTTP failure, [`ProtocolFault::EmptyBody`] for
/// an empty 200 response, [`ProtocolFault::TokenTooLong`] when the token
/// does not fit, and [`StateFault::StorageWrite`] when it cannot be
/// persisted. None of these mark the device provisioned.
pub fn acquire_token<T, S>(
    transport: &mut T,
    store: &mut S,
    endpoints: &ServiceEndpoints<'_>,
) -> Result<RestartRequest, CheckInError>
where
    T: Transport,
    S: KeyValueStore,
{
    let url = endpoints.url(ServiceCommand::Token, "")?;
    let mut body = ResponseBody::new();

    info!("provisioning: requesting token");
    let status = transport.get(&url, &mut body);
    if !status.is_ok() {
        warn!("provisioning: token request failed status={}", status);
        return Err(CheckInError::from_status(status));
    }

    let issued = body.trim();
    if issued.is_empty() {
        warn!("provisioning: empty token payload");
        return Err(ProtocolFault::EmptyBody.into());
    }

    let mut token = Token::new();
    token
        .push_str(issued)
        .map_err(|_| ProtocolFault::TokenTooLong)?;

    // Flag last, so a partial write leaves the device unprovisioned.
    if !store.write(TOKEN_KEY, &token) || !store.write(PROVISIONED_KEY, "1") {
        error!("provisioning: failed to persist token");
        return Err(StateFault::StorageWrite.into());
    }

    info!("provisioning: token acquired");

    Ok(RestartRequest::new(RestartReason::TokenAcquired))
}
