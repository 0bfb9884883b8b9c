//! Host-side device emulator for the check-in agent.

pub mod device;
pub mod session;
