//! Check-in orchestration.
//!
//! [`CheckInAgent`] owns every piece of mutable device state plus the
//! platform collaborators. The host calls [`CheckInAgent::tick`] periodically
//! with its uptime; the agent decides whether a check-in is due and, if so,
//! runs time sync, the update decision, built-in sensor collection, and the
//! sample upload in that order. Any failing step ends the tick.

use core::fmt;
use core::time::Duration;

use heapless::{String, Vec as HeaplessVec};

use crate::config::{AgentConfig, MIN_CHECKIN_INTERVAL, ServiceCommand, TIME_SERVERS};
use crate::directives::{Directive, MAX_DIRECTIVES, parse_reply};
use crate::error::{CheckInError, ProtocolFault, StateFault};
use crate::platform::{
    BuiltinSensors, Collaborators, Connectivity, KeyValueStore, MAX_RESPONSE_LEN, Platform,
    ResponseBody, Transport, WallClock,
};
use crate::provisioning::ProvisioningStore;
use crate::restart::{RestartReason, RestartRequest};
use crate::samples::{
    CHANNEL_CORE_TEMPERATURE, CHANNEL_SIGNAL_QUALITY, CHANNEL_SUPPLY_VOLTAGE, FormBody,
    SampleBuffer,
};
use crate::signal::{average_strength, signal_quality};
use crate::timesync::{SyncPolicy, TimeSync, Timestamp};
use crate::update::{UpdateEngine, UpdateState};

/// Longest configuration payload surfaced to the host. A payload is a slice
/// of one reply, so it always fits.
pub const MAX_CONFIG_PAYLOAD_LEN: usize = MAX_RESPONSE_LEN;

pub type ConfigPayload = String<MAX_CONFIG_PAYLOAD_LEN>;
pub type ConfigPayloads = HeaplessVec<ConfigPayload, MAX_DIRECTIVES>;

/// Check-in schedule.
///
/// The stamp is signed: a failure early in uptime backs it off below zero
/// rather than clamping to the "never checked in" state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CheckInClock {
    last_checkin_ms: Option<i64>,
    interval: Duration,
}

impl CheckInClock {
    pub const fn new(interval: Duration) -> Self {
        Self {
            last_checkin_ms: None,
            interval,
        }
    }

    /// Stamp of the last outcome, `None` before the first check-in.
    #[must_use]
    pub const fn last_checkin_ms(&self) -> Option<i64> {
        self.last_checkin_ms
    }

    /// Interval as configured.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Interval with [`MIN_CHECKIN_INTERVAL`] applied.
    #[must_use]
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_CHECKIN_INTERVAL)
    }

    /// Uptime at which the next check-in becomes due, `None` if one is due
    /// immediately because none has run yet.
    #[must_use]
    pub fn next_due_ms(&self) -> Option<u64> {
        let last = self.last_checkin_ms?;
        let due_at = last.saturating_add(duration_ms(self.effective_interval()));
        Some(u64::try_from(due_at).unwrap_or(0))
    }

    /// Returns `true` when a check-in should run at `now_ms`.
    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_due_ms().is_none_or(|due_at| now_ms >= due_at)
    }

    pub fn record_success(&mut self, now_ms: u64) {
        self.last_checkin_ms = Some(signed_ms(now_ms));
    }

    /// Schedules the retry an eighth of the configured interval early.
    pub fn record_failure(&mut self, now_ms: u64) {
        let backoff = duration_ms(self.interval) / 8;
        self.last_checkin_ms = Some(signed_ms(now_ms).saturating_sub(backoff));
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn signed_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Terminal state of one tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CheckInOutcome {
    Success,
    Failed,
    /// Not due yet; nothing was touched.
    Skipped,
}

impl fmt::Display for CheckInOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckInOutcome::Success => "success",
            CheckInOutcome::Failed => "failed",
            CheckInOutcome::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Everything the host needs to know after a tick.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TickReport {
    pub outcome: CheckInOutcome,
    /// Diagnostic cause of a `Failed` outcome.
    pub cause: Option<CheckInError>,
    /// Restart the host must perform.
    pub restart: Option<RestartRequest>,
    /// `SETCMD` payloads received during the upload, in order.
    pub config_payloads: ConfigPayloads,
    /// Directives the server sent that could not be kept.
    pub dropped_directives: usize,
}

impl TickReport {
    const fn new(outcome: CheckInOutcome) -> Self {
        Self {
            outcome,
            cause: None,
            restart: None,
            config_payloads: HeaplessVec::new(),
            dropped_directives: 0,
        }
    }
}

/// Result of [`CheckInAgent::initialize`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InitReport {
    pub provisioned: bool,
    /// Storage could not be mounted and was formatted.
    pub formatted: bool,
    pub restart: Option<RestartRequest>,
}

/// Early exit from a check-in, optionally paired with a forced restart.
struct Interrupted {
    cause: CheckInError,
    restart: Option<RestartRequest>,
}

impl From<CheckInError> for Interrupted {
    fn from(cause: CheckInError) -> Self {
        Self {
            cause,
            restart: None,
        }
    }
}

/// Device-side check-in agent.
pub struct CheckInAgent<P: Platform> {
    config: AgentConfig,
    io: Collaborators<P>,
    provisioning: ProvisioningStore,
    samples: SampleBuffer,
    clock: CheckInClock,
    time: TimeSync,
    update: UpdateEngine,
}

impl<P: Platform> CheckInAgent<P> {
    pub fn new(config: AgentConfig, io: Collaborators<P>) -> Self {
        let clock = CheckInClock::new(config.checkin_interval());
        Self {
            config,
            io,
            provisioning: ProvisioningStore::new(),
            samples: SampleBuffer::new(),
            clock,
            time: TimeSync::default(),
            update: UpdateEngine::new(),
        }
    }

    /// Replaces the time sync retry budget.
    #[must_use]
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.time = TimeSync::new(policy);
        self
    }

    /// Mounts storage, loads provisioning, and configures the wall clock.
    ///
    /// A storage layout mismatch stops initialization and requests a delayed
    /// restart.
    pub fn initialize(&mut self) -> InitReport {
        info!("checkin: init build={}", self.config.local_build());

        let mut formatted = false;
        if !self.io.store.mount() {
            warn!("storage: mount failed, formatting");
            formatted = self.io.store.format();
            if !formatted {
                error!("storage: format failed");
            }
            self.provisioning.unprovision(&mut self.io.store);
        }

        if !self.io.store.verify_layout() {
            error!("storage: flash layout mismatch");
            return InitReport {
                provisioned: false,
                formatted,
                restart: Some(RestartRequest::new(RestartReason::StorageLayout)),
            };
        }

        self.provisioning.load(&mut self.io.store);
        self.io
            .clock
            .configure(self.config.time_zone(), &TIME_SERVERS);

        info!(
            "checkin: ready provisioned={}",
            self.provisioning.is_provisioned()
        );

        InitReport {
            provisioned: self.provisioning.is_provisioned(),
            formatted,
            restart: None,
        }
    }

    /// Runs a check-in if one is due at `now_ms` (host uptime).
    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        if !self.clock.is_due(now_ms) {
            return TickReport::new(CheckInOutcome::Skipped);
        }

        info!("checkin: starting now_ms={}", now_ms);
        let mut report = TickReport::new(CheckInOutcome::Success);

        match self.run_checkin(&mut report) {
            Ok(restart) => {
                self.clock.record_success(now_ms);
                info!("checkin: finished now_ms={}", now_ms);
                report.restart = restart;
            }
            Err(Interrupted { cause, restart }) => {
                self.clock.record_failure(now_ms);
                warn!("checkin: failed: {}", cause);
                report.outcome = CheckInOutcome::Failed;
                report.cause = Some(cause);
                report.restart = restart;
            }
        }
        report
    }

    fn run_checkin(
        &mut self,
        report: &mut TickReport,
    ) -> Result<Option<RestartRequest>, Interrupted> {
        if !self.io.radio.is_connected() {
            return Err(CheckInError::from(StateFault::Disconnected).into());
        }

        self.time
            .sync_with_retry(&mut self.io.clock, &mut self.io.timer, &self.io.radio)
            .map_err(CheckInError::from)?;

        let outcome = self.update.decide_and_apply(
            &self.config,
            &self.provisioning,
            &mut self.io.transport,
            &mut self.io.store,
            &mut self.io.updater,
        )?;
        if let Some(restart) = outcome.restart() {
            return match outcome.fault() {
                Some(cause) => Err(Interrupted {
                    cause,
                    restart: Some(restart),
                }),
                None => Ok(Some(restart)),
            };
        }

        self.collect_builtin_samples();

        if self.samples.is_empty() {
            return Ok(None);
        }
        self.upload_samples(report).map_err(Interrupted::from)
    }

    fn collect_builtin_samples(&mut self) {
        let stamp = self.time.sample_time();

        if let Some(volts) = self.io.sensors.supply_voltage() {
            self.record(CHANNEL_SUPPLY_VOLTAGE, volts, stamp);
        }

        let dbm = average_strength(&mut self.io.radio, &mut self.io.timer);
        self.record(CHANNEL_SIGNAL_QUALITY, f32::from(signal_quality(dbm)), stamp);

        if let Some(celsius) = self.io.sensors.core_temperature() {
            self.record(CHANNEL_CORE_TEMPERATURE, celsius, stamp);
        }
    }

    fn upload_samples(
        &mut self,
        report: &mut TickReport,
    ) -> Result<Option<RestartRequest>, CheckInError> {
        let mut form = FormBody::new();
        self.samples.encode_form(&mut form)?;

        let url = self
            .config
            .endpoints()
            .url(ServiceCommand::Sensor, self.provisioning.token())?;
        let mut body = ResponseBody::new();

        let status = self.io.transport.post_form(&url, &form, &mut body);
        if !status.is_ok() {
            return Err(CheckInError::from_status(status));
        }
        if body.is_empty() {
            return Err(ProtocolFault::EmptyBody.into());
        }

        let reply = parse_reply(&body);
        if reply.accepted {
            info!("checkin: upload accepted samples={}", self.samples.len());
        } else {
            warn!(
                "checkin: upload rejected status={}",
                reply.status.unwrap_or("")
            );
        }
        if self.config.debug()
            && let Some(summary) = reply.summary
        {
            debug!("checkin: server summary {}", summary);
        }

        self.samples.clear();

        report.dropped_directives = reply.dropped;
        for directive in &reply.directives {
            if let Directive::SetConfig(payload) = directive {
                let mut copy = ConfigPayload::new();
                if copy.push_str(payload).is_err() || report.config_payloads.push(copy).is_err() {
                    warn!("checkin: dropping config payload len={}", payload.len());
                    report.dropped_directives += 1;
                }
            }
        }

        if reply.reboot {
            info!("checkin: server requested reboot");
            return Ok(Some(RestartRequest::new(RestartReason::RebootDirective)));
        }
        Ok(None)
    }

    fn record(&mut self, channel: u16, value: f32, stamp: Timestamp) {
        if self.config.debug() {
            debug!(
                "samples: add index={} channel={} value={}",
                self.samples.len(),
                channel,
                value
            );
        }
        if self.samples.push(channel, value, stamp).is_some() {
            warn!("samples: buffer full, oldest reading evicted");
        }
    }

    /// Buffers a caller reading stamped with the last synchronized time.
    pub fn push_sample(&mut self, channel: u16, value: f32) {
        let stamp = self.time.sample_time();
        self.record(channel, value, stamp);
    }

    /// Clears the persisted token. Takes effect immediately, no restart.
    pub fn unprovision(&mut self) {
        self.provisioning.unprovision(&mut self.io.store);
    }

    /// Reads the wall clock, falling back to the last synchronized time.
    pub fn current_time(&mut self) -> Option<Timestamp> {
        let timeout = self.time.policy().attempt_timeout();
        match self
            .time
            .sync(&mut self.io.clock, &mut self.io.timer, timeout)
        {
            Ok(now) => Some(now),
            Err(err) => {
                warn!("ntp: falling back to cached time: {}", err);
                self.time.last()
            }
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub const fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    #[must_use]
    pub const fn provisioning(&self) -> &ProvisioningStore {
        &self.provisioning
    }

    #[must_use]
    pub const fn clock(&self) -> &CheckInClock {
        &self.clock
    }

    #[must_use]
    pub const fn update_state(&self) -> UpdateState {
        self.update.state()
    }

    /// Build number reported by the last successful version check.
    #[must_use]
    pub const fn last_remote_build(&self) -> Option<u32> {
        self.update.last_remote_build()
    }

    #[must_use]
    pub const fn clock_never_set(&self) -> bool {
        self.time.clock_never_set()
    }

    #[must_use]
    pub const fn collaborators(&self) -> &Collaborators<P> {
        &self.io
    }

    pub const fn collaborators_mut(&mut self) -> &mut Collaborators<P> {
        &mut self.io
    }

    /// Releases the collaborators, e.g. to re-initialize after a restart.
    pub fn into_collaborators(self) -> Collaborators<P> {
        self.io
    }
}
