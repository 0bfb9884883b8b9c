#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Device check-in agent: provisioning, time sync, firmware updates, and
// telemetry upload against the management service.
//
// The crate stays portable across MCU firmware and host tooling by avoiding
// the Rust standard library; hardware and network access go through the
// collaborator traits in `platform`.

mod fmt;

pub mod agent;
pub mod config;
pub mod directives;
pub mod error;
pub mod platform;
pub mod provisioning;
pub mod restart;
pub mod samples;
pub mod signal;
pub mod timesync;
pub mod update;

pub use agent::{CheckInAgent, CheckInClock, CheckInOutcome, InitReport, TickReport};
pub use config::AgentConfig;
pub use error::CheckInError;
pub use platform::{Collaborators, Platform};
pub use restart::{RestartReason, RestartRequest};
pub use timesync::Timestamp;
