//! Over-the-air firmware update engine.
//!
//! ```text
//! Idle -> CheckingVersion -> Downloading -> Applying -> Rebooting
//!               \                 \             \
//!                +-----------------+-------------+--> Failed
//! ```
//!
//! Every network step runs at most once per invocation; a failure leaves the
//! engine in [`UpdateState::Failed`] until the next check-in resets it.

use core::fmt;

use crate::config::{AgentConfig, ServiceCommand};
use crate::error::{CheckInError, IntegrityFault, ProtocolFault};
use crate::platform::{Download, FirmwareUpdater, KeyValueStore, ResponseBody, Transport};
use crate::provisioning::{ProvisioningStore, acquire_token};
use crate::restart::{RestartReason, RestartRequest};

/// Version payloads must be shorter than this.
pub const MAX_VERSION_PAYLOAD: usize = 5;

/// Observable engine state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateState {
    #[default]
    Idle,
    CheckingVersion,
    Downloading,
    Applying,
    Rebooting,
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdateState::Idle => "idle",
            UpdateState::CheckingVersion => "checking-version",
            UpdateState::Downloading => "downloading",
            UpdateState::Applying => "applying",
            UpdateState::Rebooting => "rebooting",
            UpdateState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Result of a download that reached the updater.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ApplyOutcome {
    /// Image written in full and verified.
    Applied,
    /// Transfer ended early; the image was not finalized.
    Truncated { expected: u32, written: u32 },
}

impl ApplyOutcome {
    /// Restart that must follow this outcome.
    #[must_use]
    pub const fn restart(self) -> RestartRequest {
        match self {
            ApplyOutcome::Applied => RestartRequest::new(RestartReason::FirmwareApplied),
            ApplyOutcome::Truncated { .. } => RestartRequest::new(RestartReason::FirmwareTruncated),
        }
    }
}

/// Result of one update decision.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// Remote build is not newer than the running one.
    NoUpdateNeeded,
    /// A token was acquired; the rest of the check-in waits for the restart.
    TokenAcquired(RestartRequest),
    /// A download reached the updater.
    Flashed(ApplyOutcome),
}

impl UpdateOutcome {
    /// Restart the host must perform, if any.
    #[must_use]
    pub const fn restart(self) -> Option<RestartRequest> {
        match self {
            UpdateOutcome::NoUpdateNeeded => None,
            UpdateOutcome::TokenAcquired(request) => Some(request),
            UpdateOutcome::Flashed(outcome) => Some(outcome.restart()),
        }
    }

    /// Failure carried alongside a forced restart.
    #[must_use]
    pub const fn fault(self) -> Option<CheckInError> {
        match self {
            UpdateOutcome::Flashed(ApplyOutcome::Truncated { expected, written }) => Some(
                CheckInError::Integrity(IntegrityFault::Truncated { expected, written }),
            ),
            _ => None,
        }
    }
}

/// Drives version checks and image downloads.
#[derive(Clone, Debug, Default)]
pub struct UpdateEngine {
    state: UpdateState,
    last_remote: Option<u32>,
}

impl UpdateEngine {
    pub const fn new() -> Self {
        Self {
            state: UpdateState::Idle,
            last_remote: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> UpdateState {
        self.state
    }

    /// Build number from the most recent successful version check.
    #[must_use]
    pub const fn last_remote_build(&self) -> Option<u32> {
        self.last_remote
    }

    /// Fetches the build number the service currently offers.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures, an empty body, or a payload that is not a
    /// short decimal number. A failed check never means "no update".
    pub fn check_remote_version<T: Transport>(
        &mut self,
        transport: &mut T,
        config: &AgentConfig,
        token: &str,
    ) -> Result<u32, CheckInError> {
        self.state = UpdateState::CheckingVersion;
        let result = Self::fetch_version(transport, config, token);
        match result {
            Ok(build) => {
                self.last_remote = Some(build);
                self.state = UpdateState::Idle;
            }
            Err(err) => {
                warn!("ota: version check failed: {}", err);
                self.state = UpdateState::Failed;
            }
        }
        result
    }

    fn fetch_version<T: Transport>(
        transport: &mut T,
        config: &AgentConfig,
        token: &str,
    ) -> Result<u32, CheckInError> {
        let url = config.endpoints().url(ServiceCommand::Version, token)?;
        let mut body = ResponseBody::new();

        let status = transport.get(&url, &mut body);
        if !status.is_ok() {
            return Err(CheckInError::from_status(status));
        }

        if body.is_empty() {
            return Err(ProtocolFault::EmptyBody.into());
        }
        if body.len() >= MAX_VERSION_PAYLOAD {
            return Err(ProtocolFault::MalformedVersion.into());
        }

        body.trim()
            .parse::<u32>()
            .map_err(|_| ProtocolFault::MalformedVersion.into())
    }

    /// Downloads the offered image and hands it to the updater.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures, a missing content length,
    /// [`CheckInError::Capacity`] when the updater refuses the size, and
    /// [`IntegrityFault::VerifyFailed`] when the written image does not
    /// verify. A short transfer is not an error: it is reported as
    /// [`ApplyOutcome::Truncated`] because it always forces a restart.
    pub fn apply_update<T, U>(
        &mut self,
        transport: &mut T,
        updater: &mut U,
        config: &AgentConfig,
        token: &str,
    ) -> Result<ApplyOutcome, CheckInError>
    where
        T: Transport,
        U: FirmwareUpdater,
    {
        let result = self.download_and_flash(transport, updater, config, token);
        if let Err(err) = result {
            warn!("ota: update failed: {}", err);
            self.state = UpdateState::Failed;
        }
        result
    }

    fn download_and_flash<T, U>(
        &mut self,
        transport: &mut T,
        updater: &mut U,
        config: &AgentConfig,
        token: &str,
    ) -> Result<ApplyOutcome, CheckInError>
    where
        T: Transport,
        U: FirmwareUpdater,
    {
        self.state = UpdateState::Downloading;
        let url = config.endpoints().url(ServiceCommand::Firmware, token)?;

        let Download {
            content_length,
            mut stream,
        } = transport.download(&url).map_err(CheckInError::from_status)?;

        if content_length == 0 {
            return Err(ProtocolFault::MissingContentLength.into());
        }
        if config.debug() {
            debug!("ota: downloading bytes={}", content_length);
        }

        if !updater.begin(content_length) {
            return Err(CheckInError::Capacity {
                requested: content_length,
            });
        }

        self.state = UpdateState::Applying;
        let written = updater.write_stream(&mut stream);
        if written != content_length {
            error!(
                "ota: short write written={} expected={}",
                written, content_length
            );
            self.state = UpdateState::Rebooting;
            return Ok(ApplyOutcome::Truncated {
                expected: content_length,
                written,
            });
        }

        if !updater.finalize_and_verify() {
            return Err(IntegrityFault::VerifyFailed.into());
        }

        info!("ota: image verified bytes={}", written);
        self.state = UpdateState::Rebooting;
        Ok(ApplyOutcome::Applied)
    }

    /// Acquires a token when needed, then updates if the service offers a
    /// newer build than `config.local_build()`.
    ///
    /// # Errors
    ///
    /// The first failing step's error; later steps do not run.
    pub fn decide_and_apply<T, S, U>(
        &mut self,
        config: &AgentConfig,
        provisioning: &ProvisioningStore,
        transport: &mut T,
        store: &mut S,
        updater: &mut U,
    ) -> Result<UpdateOutcome, CheckInError>
    where
        T: Transport,
        S: KeyValueStore,
        U: FirmwareUpdater,
    {
        self.state = UpdateState::Idle;

        if !provisioning.is_provisioned() {
            let restart = acquire_token(transport, store, &config.endpoints())?;
            return Ok(UpdateOutcome::TokenAcquired(restart));
        }

        let remote = self.check_remote_version(transport, config, provisioning.token())?;
        let local = config.local_build();
        if remote <= local {
            if config.debug() {
                debug!("ota: up to date local={} remote={}", local, remote);
            }
            return Ok(UpdateOutcome::NoUpdateNeeded);
        }

        info!("ota: fetching build {} (running {})", remote, local);
        let outcome = self.apply_update(transport, updater, config, provisioning.token())?;
        Ok(UpdateOutcome::Flashed(outcome))
    }
}
