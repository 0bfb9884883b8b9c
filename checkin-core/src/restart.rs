//! Restart requests handed back to the host.
//!
//! The core never resets the device itself. Components that need a restart
//! return a [`RestartRequest`] and the host performs it after the delay.

use core::fmt;
use core::time::Duration;

/// Why a restart was requested.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RestartReason {
    /// A provisioning token was persisted; it is loaded on the next boot.
    TokenAcquired,
    /// A verified firmware image is ready to boot.
    FirmwareApplied,
    /// The firmware transfer ended short; the partial image was abandoned.
    FirmwareTruncated,
    /// The server asked for a reboot.
    RebootDirective,
    /// Persistent storage does not match the expected flash layout.
    StorageLayout,
}

impl RestartReason {
    /// Delay the host should observe before restarting.
    #[must_use]
    pub const fn delay(self) -> Duration {
        match self {
            RestartReason::TokenAcquired | RestartReason::FirmwareApplied => Duration::from_secs(2),
            RestartReason::FirmwareTruncated | RestartReason::RebootDirective => {
                Duration::from_secs(5)
            }
            RestartReason::StorageLayout => Duration::from_secs(10),
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestartReason::TokenAcquired => "token acquired",
            RestartReason::FirmwareApplied => "firmware applied",
            RestartReason::FirmwareTruncated => "firmware transfer truncated",
            RestartReason::RebootDirective => "server reboot directive",
            RestartReason::StorageLayout => "storage layout mismatch",
        };
        f.write_str(label)
    }
}

/// A restart the host must perform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RestartRequest {
    pub reason: RestartReason,
    pub delay: Duration,
}

impl RestartRequest {
    /// Restart with the standard delay for `reason`.
    #[must_use]
    pub const fn new(reason: RestartReason) -> Self {
        Self {
            reason,
            delay: reason.delay(),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for RestartRequest {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "restart in {=u128} ms ({})",
            self.delay.as_millis(),
            self.reason
        );
    }
}

impl fmt::Display for RestartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "restart in {} ms ({})", self.delay.as_millis(), self.reason)
    }
}
