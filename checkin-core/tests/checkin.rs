mod support;

use core::time::Duration;

use checkin_core::error::{CheckInError, ProtocolFault, StateFault};
use checkin_core::samples::CHANNEL_SIGNAL_QUALITY;
use checkin_core::timesync::{TimeSyncError, Timestamp};
use checkin_core::update::UpdateState;
use checkin_core::{CheckInAgent, CheckInOutcome, RestartReason};

use support::{MemoryStore, Reply, SYNCED, TOKEN, collaborators, config, provisioned_agent};

const HOUR_MS: u64 = 3_600_000;
const MINUTE_MS: u64 = 60_000;

fn stamp(ms: u64) -> Option<i64> {
    Some(i64::try_from(ms).unwrap())
}

#[test]
fn mount_failure_formats_and_unprovisions() {
    let mut io = collaborators();
    io.store = MemoryStore::provisioned(TOKEN);
    io.store.mountable = false;

    let mut agent = CheckInAgent::new(config(), io);
    let report = agent.initialize();

    assert!(report.formatted);
    assert!(!report.provisioned);
    assert_eq!(report.restart, None);

    let store = &agent.collaborators().store;
    assert!(store.formatted);
    assert_eq!(store.value("provisioned"), Some("0"));
    assert_eq!(store.value("token"), Some(""));
}

#[test]
fn initialize_loads_persisted_token_and_configures_clock() {
    let agent = provisioned_agent();

    assert!(agent.provisioning().is_provisioned());
    assert_eq!(agent.provisioning().token(), TOKEN);

    let clock = &agent.collaborators().clock;
    assert_eq!(clock.time_zone.as_deref(), Some("MST7MDT"));
    assert_eq!(clock.servers, 2);
}

#[test]
fn layout_mismatch_requests_delayed_restart() {
    let mut io = collaborators();
    io.store.layout_ok = false;

    let mut agent = CheckInAgent::new(config(), io);
    let report = agent.initialize();

    let restart = report.restart.expect("layout mismatch must restart");
    assert_eq!(restart.reason, RestartReason::StorageLayout);
    assert_eq!(restart.delay, Duration::from_secs(10));
}

#[test]
fn unprovisioned_tick_acquires_token_then_restarts() {
    let mut agent = CheckInAgent::new(config(), collaborators());
    assert!(!agent.initialize().provisioned);

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Success);
    let restart = report.restart.expect("token acquisition restarts");
    assert_eq!(restart.reason, RestartReason::TokenAcquired);
    assert_eq!(restart.delay, Duration::from_secs(2));

    // The new token takes effect after the restart re-initializes.
    assert!(!agent.provisioning().is_provisioned());
    let io = agent.collaborators();
    assert_eq!(io.store.value("provisioned"), Some("1"));
    assert_eq!(io.store.value("token"), Some(TOKEN));
    assert_eq!(io.transport.commands().as_slice(), &["gettoken"]);
    assert!(!io.transport.urls[0].contains("token="));
}

#[test]
fn empty_token_leaves_device_unprovisioned() {
    let mut io = collaborators();
    io.transport.token = Reply::ok("");
    let mut agent = CheckInAgent::new(config(), io);
    agent.initialize();

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Failed);
    assert_eq!(
        report.cause,
        Some(CheckInError::Protocol(ProtocolFault::EmptyBody))
    );
    assert_eq!(report.restart, None);
    assert!(!agent.provisioning().is_provisioned());
    assert_eq!(agent.collaborators().store.value("provisioned"), None);
}

#[test]
fn token_that_cannot_be_persisted_fails_without_restart() {
    let mut agent = CheckInAgent::new(config(), collaborators());
    agent.initialize();
    agent.collaborators_mut().store.read_only = true;

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Failed);
    assert_eq!(
        report.cause,
        Some(CheckInError::State(StateFault::StorageWrite))
    );
    assert_eq!(report.restart, None);
    assert!(!agent.provisioning().is_provisioned());
    assert_eq!(agent.collaborators().store.value("provisioned"), None);
    assert_eq!(agent.collaborators().store.value("token"), None);
}

#[test]
fn tick_before_interval_is_skipped_without_side_effects() {
    let mut agent = provisioned_agent();
    assert_eq!(agent.tick(HOUR_MS).outcome, CheckInOutcome::Success);

    agent.push_sample(7, 1.5);
    let before_clock = *agent.clock();
    let before_requests = agent.collaborators().transport.urls.len();

    let report = agent.tick(HOUR_MS + 30 * MINUTE_MS);

    assert_eq!(report.outcome, CheckInOutcome::Skipped);
    assert_eq!(report.cause, None);
    assert_eq!(*agent.clock(), before_clock);
    assert_eq!(agent.samples().len(), 1);
    assert_eq!(agent.collaborators().transport.urls.len(), before_requests);
}

#[test]
fn short_interval_is_clamped_to_five_minutes() {
    let mut agent = CheckInAgent::new(
        config().with_checkin_interval(Duration::from_secs(30)),
        {
            let mut io = collaborators();
            io.store = MemoryStore::provisioned(TOKEN);
            io
        },
    );
    agent.initialize();

    assert_eq!(agent.tick(HOUR_MS).outcome, CheckInOutcome::Success);
    assert_eq!(
        agent.tick(HOUR_MS + 4 * MINUTE_MS).outcome,
        CheckInOutcome::Skipped
    );
    assert_eq!(
        agent.tick(HOUR_MS + 5 * MINUTE_MS).outcome,
        CheckInOutcome::Success
    );
}

#[test]
fn disconnected_tick_fails_and_backs_off() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().radio.connected = false;

    let now = 10 * HOUR_MS;
    let report = agent.tick(now);

    assert_eq!(report.outcome, CheckInOutcome::Failed);
    assert_eq!(
        report.cause,
        Some(CheckInError::State(StateFault::Disconnected))
    );
    // Default interval is four hours; retry is stamped half an hour early.
    assert_eq!(agent.clock().last_checkin_ms(), stamp(now - 30 * MINUTE_MS));
    assert!(agent.collaborators().transport.urls.is_empty());
}

#[test]
fn failed_tick_is_skipped_until_backoff_elapses() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.version = Reply::status(503);

    let now = 10 * HOUR_MS;
    assert_eq!(agent.tick(now).outcome, CheckInOutcome::Failed);
    let requests = agent.collaborators().transport.urls.len();

    assert_eq!(agent.tick(now + 1).outcome, CheckInOutcome::Skipped);
    // Four hour interval less the half hour backoff.
    let due = now + 210 * MINUTE_MS;
    assert_eq!(agent.tick(due - 1).outcome, CheckInOutcome::Skipped);
    assert_eq!(agent.collaborators().transport.urls.len(), requests);

    assert_eq!(agent.tick(due).outcome, CheckInOutcome::Failed);
    assert_eq!(agent.collaborators().transport.urls.len(), requests + 1);
}

#[test]
fn failure_early_in_uptime_does_not_retry_at_once() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.version = Reply::status(503);

    let report = agent.tick(MINUTE_MS);
    assert_eq!(report.outcome, CheckInOutcome::Failed);
    assert_eq!(agent.clock().last_checkin_ms(), Some(-29 * 60_000));
    assert_eq!(agent.collaborators().transport.urls.len(), 1);

    assert_eq!(agent.tick(MINUTE_MS + 1).outcome, CheckInOutcome::Skipped);
    assert_eq!(agent.tick(MINUTE_MS + 2).outcome, CheckInOutcome::Skipped);
    assert_eq!(agent.collaborators().transport.urls.len(), 1);
    assert_eq!(agent.clock().next_due_ms(), Some(211 * MINUTE_MS));
}

#[test]
fn successful_tick_uploads_samples_and_clears_buffer() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().sensors.volts = Some(3.3);
    agent.collaborators_mut().sensors.celsius = Some(41.0);
    agent.push_sample(12, 20.5);

    let now = 2 * HOUR_MS;
    let report = agent.tick(now);

    assert_eq!(report.outcome, CheckInOutcome::Success);
    assert_eq!(report.restart, None);
    assert!(agent.samples().is_empty());
    assert_eq!(agent.clock().last_checkin_ms(), stamp(now));
    assert!(!agent.clock_never_set());

    let transport = &agent.collaborators().transport;
    assert_eq!(transport.commands().as_slice(), &["getversion", "sensor"]);
    assert!(transport.urls[1].ends_with("&token=tok-123"));

    let form = transport.forms[0].as_str();
    // Pushed before the first sync, so stamped with the placeholder.
    assert!(form.starts_with(
        "&sensor[0][datetime]=0000-00-00 00:00:00&sensor[0][sensornum]=12&sensor[0][sensorval]=20.50"
    ));
    assert!(form.contains("&sensor[1][datetime]=2021-05-01 10:00:00&sensor[1][sensornum]=255"));
    assert!(form.contains("&sensor[2][sensornum]=256&sensor[2][sensorval]=50.00"));
    assert!(form.contains("&sensor[3][sensornum]=257&sensor[3][sensorval]=41.00"));
}

#[test]
fn failed_upload_keeps_samples() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.sensor = Reply::status(500);
    agent.push_sample(1, 2.0);

    let now = 2 * HOUR_MS;
    let report = agent.tick(now);

    assert_eq!(report.outcome, CheckInOutcome::Failed);
    assert_eq!(
        report.cause,
        Some(CheckInError::Protocol(ProtocolFault::UnexpectedStatus(500)))
    );
    // Caller sample plus signal quality.
    assert_eq!(agent.samples().len(), 2);
    assert_eq!(
        agent.samples().drain_for_transmission()[1].channel,
        CHANNEL_SIGNAL_QUALITY
    );
    assert_eq!(agent.clock().last_checkin_ms(), stamp(now - 30 * MINUTE_MS));
}

#[test]
fn empty_upload_reply_is_a_failure() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.sensor = Reply::ok("");

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Failed);
    assert_eq!(
        report.cause,
        Some(CheckInError::Protocol(ProtocolFault::EmptyBody))
    );
    assert_eq!(agent.samples().len(), 1);
}

#[test]
fn rejected_status_still_counts_as_delivered() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.sensor = Reply::ok("ERR\rbad data\r");

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Success);
    assert!(agent.samples().is_empty());
}

#[test]
fn reboot_directive_requests_restart_and_surfaces_config() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.sensor =
        Reply::ok("OK\r2 sensors updated\rREBOOT\rSETCMD x(1)\r");

    let now = 3 * HOUR_MS;
    let report = agent.tick(now);

    assert_eq!(report.outcome, CheckInOutcome::Success);
    let restart = report.restart.expect("reboot directive");
    assert_eq!(restart.reason, RestartReason::RebootDirective);
    assert_eq!(restart.delay, Duration::from_secs(5));
    assert_eq!(report.config_payloads.len(), 1);
    assert_eq!(report.config_payloads[0].as_str(), "x(1)");
    assert_eq!(agent.clock().last_checkin_ms(), stamp(now));
}

#[test]
fn reboot_after_many_config_directives_still_restarts() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.sensor = Reply::ok(
        "OK\r1 sensors updated\rSETCMD a\rSETCMD b\rSETCMD c\rSETCMD d\r\
         SETCMD e\rSETCMD f\rSETCMD g\rSETCMD h\rREBOOT\r",
    );

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Success);
    let restart = report.restart.expect("reboot directive");
    assert_eq!(restart.reason, RestartReason::RebootDirective);
    assert_eq!(report.config_payloads.len(), 8);
    assert_eq!(report.config_payloads[7].as_str(), "h");
    assert_eq!(report.dropped_directives, 1);
}

#[test]
fn long_config_payload_is_surfaced_whole() {
    const PAYLOAD: &str = "enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),";
    let mut agent = provisioned_agent();
    agent.collaborators_mut().transport.sensor =
        Reply::ok("OK\r1 sensors updated\rSETCMD enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),enable(1),\r");

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Success);
    assert_eq!(report.config_payloads.len(), 1);
    assert_eq!(report.config_payloads[0].as_str(), PAYLOAD);
    assert_eq!(PAYLOAD.len(), 200);
    assert_eq!(report.dropped_directives, 0);
}

#[test]
fn time_sync_failure_fails_tick() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().clock.time = Some(Timestamp::new(1970, 1, 1, 0, 0, 1));

    let report = agent.tick(HOUR_MS);

    assert_eq!(report.outcome, CheckInOutcome::Failed);
    assert_eq!(
        report.cause,
        Some(CheckInError::TimeSync(TimeSyncError::AttemptsExhausted {
            attempts: 3
        }))
    );
    assert!(agent.clock_never_set());
    assert!(agent.collaborators().transport.urls.is_empty());
    // Three 15 s attempts plus two 3 s backoffs of simulated waiting.
    assert!(agent.collaborators().timer.now_ms >= 51_000);
}

#[test]
fn current_time_falls_back_to_cached_value() {
    let mut agent = provisioned_agent();
    assert_eq!(agent.current_time(), Some(SYNCED));

    agent.collaborators_mut().clock.time = None;
    assert_eq!(agent.current_time(), Some(SYNCED));
}

#[test]
fn current_time_is_none_before_any_sync() {
    let mut agent = provisioned_agent();
    agent.collaborators_mut().clock.time = None;
    assert_eq!(agent.current_time(), None);
}

#[test]
fn unprovision_clears_persisted_state_without_restart() {
    let mut agent = provisioned_agent();
    agent.unprovision();

    assert!(!agent.provisioning().is_provisioned());
    assert_eq!(agent.provisioning().token(), "");
    let store = &agent.collaborators().store;
    assert_eq!(store.value("provisioned"), Some("0"));
    assert_eq!(store.value("token"), Some(""));
}

#[test]
fn up_to_date_device_leaves_update_engine_idle() {
    let mut agent = provisioned_agent();
    agent.tick(HOUR_MS);
    assert_eq!(agent.update_state(), UpdateState::Idle);
    assert_eq!(agent.last_remote_build(), Some(12));
}
