//! Error taxonomy shared by every check-in component.
//!
//! Each component reports a [`CheckInError`]; the agent collapses them into a
//! single `Failed` outcome per tick and keeps the cause around for
//! diagnostics only.

use core::fmt;

use crate::platform::HttpStatus;
use crate::timesync::TimeSyncError;

/// Failure detail for a response that arrived but could not be used.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolFault {
    /// Server answered with a status other than 200.
    UnexpectedStatus(i32),
    /// Server answered 200 with an empty body.
    EmptyBody,
    /// Version payload was too long or not a number.
    MalformedVersion,
    /// Issued token does not fit in the persisted slot.
    TokenTooLong,
    /// Firmware response declared no usable content length.
    MissingContentLength,
    /// Request target or body exceeded its fixed buffer.
    RequestTooLarge,
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFault::UnexpectedStatus(code) => write!(f, "unexpected HTTP status {code}"),
            ProtocolFault::EmptyBody => f.write_str("empty response body"),
            ProtocolFault::MalformedVersion => f.write_str("malformed build number"),
            ProtocolFault::TokenTooLong => f.write_str("provisioning token too long"),
            ProtocolFault::MissingContentLength => f.write_str("missing firmware content length"),
            ProtocolFault::RequestTooLarge => f.write_str("request exceeds buffer capacity"),
        }
    }
}

/// Failure detail for a firmware image that cannot be trusted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IntegrityFault {
    /// Fewer (or more) bytes reached the updater than were declared.
    Truncated { expected: u32, written: u32 },
    /// The updater could not finalize or verify the written image.
    VerifyFailed,
}

impl fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFault::Truncated { expected, written } => {
                write!(f, "wrote {written} of {expected} firmware bytes")
            }
            IntegrityFault::VerifyFailed => f.write_str("firmware finalize/verify failed"),
        }
    }
}

/// Operation attempted while the device is not in a usable state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StateFault {
    Disconnected,
    /// Persistent storage refused a write.
    StorageWrite,
}

impl fmt::Display for StateFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateFault::Disconnected => f.write_str("no network connection"),
            StateFault::StorageWrite => f.write_str("storage write failed"),
        }
    }
}

/// Any failure surfaced by a check-in component.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CheckInError {
    /// Connect, DNS, or timeout failure below HTTP (status <= 0).
    Transport(HttpStatus),
    Protocol(ProtocolFault),
    /// Updater refused to reserve space for the declared image size.
    Capacity { requested: u32 },
    Integrity(IntegrityFault),
    State(StateFault),
    TimeSync(TimeSyncError),
}

impl CheckInError {
    /// Classifies a non-successful HTTP status.
    pub const fn from_status(status: HttpStatus) -> Self {
        if status.is_transport_failure() {
            CheckInError::Transport(status)
        } else {
            CheckInError::Protocol(ProtocolFault::UnexpectedStatus(status.code()))
        }
    }
}

impl fmt::Display for CheckInError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckInError::Transport(status) => write!(f, "transport failure: {status}"),
            CheckInError::Protocol(fault) => write!(f, "protocol error: {fault}"),
            CheckInError::Capacity { requested } => {
                write!(f, "not enough space for {requested} byte image")
            }
            CheckInError::Integrity(fault) => write!(f, "integrity error: {fault}"),
            CheckInError::State(fault) => write!(f, "state error: {fault}"),
            CheckInError::TimeSync(err) => write!(f, "time sync failed: {err}"),
        }
    }
}

impl From<ProtocolFault> for CheckInError {
    fn from(value: ProtocolFault) -> Self {
        CheckInError::Protocol(value)
    }
}

impl From<IntegrityFault> for CheckInError {
    fn from(value: IntegrityFault) -> Self {
        CheckInError::Integrity(value)
    }
}

impl From<StateFault> for CheckInError {
    fn from(value: StateFault) -> Self {
        CheckInError::State(value)
    }
}

impl From<TimeSyncError> for CheckInError {
    fn from(value: TimeSyncError) -> Self {
        CheckInError::TimeSync(value)
    }
}
