//! Wall-clock acquisition with bounded polling and bounded retries.
//!
//! Network time queries silently drop, so every wait here is capped twice:
//! each attempt polls for at most [`SyncPolicy::attempt_timeout`], and at most
//! [`SyncPolicy::attempts`] attempts run per check-in.

use core::fmt;
use core::time::Duration;

use crate::platform::{Connectivity, SystemTimer, WallClock};

/// Earliest year accepted as a real network time.
pub const PLAUSIBLE_YEAR: u16 = 2020;

/// Cadence at which the clock primitive is polled during an attempt.
pub const POLL_INTERVAL_MS: u32 = 50;

pub const DEFAULT_SYNC_ATTEMPTS: u8 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Civil local time as reported by the clock collaborator.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    /// Placeholder used for samples recorded before the clock was ever set.
    pub const UNSET: Self = Self::new(0, 0, 0, 0, 0, 0);

    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        }
    }

    /// Returns `true` when the value looks like a synchronized clock.
    pub const fn is_plausible(&self) -> bool {
        self.year >= PLAUSIBLE_YEAR
    }
}

/// Renders the canonical `YYYY-MM-DD HH:MM:SS` form the service stores.
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Reasons a time synchronization did not produce a usable timestamp.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeSyncError {
    /// The attempt timed out; carries the last value observed, if any.
    Implausible { last: Option<Timestamp> },
    /// Every attempt in the retry budget failed.
    AttemptsExhausted { attempts: u8 },
    /// The radio dropped between attempts.
    ConnectivityLost,
}

impl fmt::Display for TimeSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSyncError::Implausible { last: Some(last) } => {
                write!(f, "implausible clock value {last}")
            }
            TimeSyncError::Implausible { last: None } => f.write_str("clock never reported a time"),
            TimeSyncError::AttemptsExhausted { attempts } => {
                write!(f, "no valid time after {attempts} attempts")
            }
            TimeSyncError::ConnectivityLost => f.write_str("connectivity lost during time sync"),
        }
    }
}

/// Retry budget for a check-in's time synchronization.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SyncPolicy {
    attempts: u8,
    attempt_timeout: Duration,
    backoff: Duration,
}

impl SyncPolicy {
    pub const fn new(attempts: u8, attempt_timeout: Duration, backoff: Duration) -> Self {
        Self {
            attempts,
            attempt_timeout,
            backoff,
        }
    }

    pub const fn attempts(&self) -> u8 {
        self.attempts
    }

    pub const fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub const fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_SYNC_ATTEMPTS,
            DEFAULT_ATTEMPT_TIMEOUT,
            DEFAULT_RETRY_BACKOFF,
        )
    }
}

/// Tracks the most recent synchronized time.
#[derive(Clone, Debug)]
pub struct TimeSync {
    policy: SyncPolicy,
    last: Option<Timestamp>,
    never_set: bool,
}

impl TimeSync {
    pub const fn new(policy: SyncPolicy) -> Self {
        Self {
            policy,
            last: None,
            never_set: true,
        }
    }

    pub const fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Last successfully synchronized timestamp.
    pub const fn last(&self) -> Option<Timestamp> {
        self.last
    }

    /// `true` until the first successful synchronization. Informational only.
    pub const fn clock_never_set(&self) -> bool {
        self.never_set
    }

    /// Timestamp to stamp new samples with.
    pub fn sample_time(&self) -> Timestamp {
        self.last.unwrap_or(Timestamp::UNSET)
    }

    /// Polls `clock` until it reports a plausible time or `timeout` elapses.
    pub fn sync<C, T>(&mut self, clock: &mut C, timer: &mut T, timeout: Duration) -> Result<Timestamp, TimeSyncError>
    where
        C: WallClock,
        T: SystemTimer,
    {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let started = timer.uptime_ms();

        loop {
            let observed = clock.now();
            if let Some(now) = observed
                && now.is_plausible()
            {
                self.record(now);
                return Ok(now);
            }

            if timer.uptime_ms().saturating_sub(started) >= timeout_ms {
                return Err(TimeSyncError::Implausible { last: observed });
            }

            timer.delay_ms(POLL_INTERVAL_MS);
        }
    }

    /// Runs [`Self::sync`] under the retry policy, aborting if the radio drops.
    pub fn sync_with_retry<C, T, R>(
        &mut self,
        clock: &mut C,
        timer: &mut T,
        radio: &R,
    ) -> Result<Timestamp, TimeSyncError>
    where
        C: WallClock,
        T: SystemTimer,
        R: Connectivity,
    {
        let policy = self.policy;
        let backoff_ms = u32::try_from(policy.backoff.as_millis()).unwrap_or(u32::MAX);

        for attempt in 1..=policy.attempts {
            match self.sync(clock, timer, policy.attempt_timeout) {
                Ok(now) => {
                    info!(
                        "ntp: {}-{}-{} {}:{}:{}",
                        now.year,
                        now.month,
                        now.day,
                        now.hour,
                        now.minute,
                        now.second
                    );
                    return Ok(now);
                }
                Err(err) => {
                    warn!("ntp: attempt {} of {} failed: {}", attempt, policy.attempts, err);
                    if attempt == policy.attempts {
                        break;
                    }
                    timer.delay_ms(backoff_ms);
                    if !radio.is_connected() {
                        return Err(TimeSyncError::ConnectivityLost);
                    }
                }
            }
        }

        Err(TimeSyncError::AttemptsExhausted {
            attempts: policy.attempts,
        })
    }

    fn record(&mut self, now: Timestamp) {
        self.last = Some(now);
        self.never_set = false;
    }
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new(SyncPolicy::default())
    }
}
