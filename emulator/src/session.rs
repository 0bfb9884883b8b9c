use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant as HostInstant};

use checkin_core::config::{DEFAULT_CHECKIN_INTERVAL, LOCAL_BUILD_NUMBER};
use checkin_core::platform::SystemTimer;
use checkin_core::{
    AgentConfig, CheckInAgent, CheckInOutcome, InitReport, RestartRequest, TickReport,
};

use crate::device::{BOOT_UPTIME_MS, EmulatedPlatform, SimulatedService, VirtualTime, factory_collaborators};

pub const DEFAULT_PRODUCT: &str = "radio2";
pub const DEFAULT_SECRET: &str = "hunter2";

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "tick",
        "tick                          - run a check-in at the current uptime",
    ),
    (
        "advance",
        "advance <duration>            - move uptime forward (500ms, 10s, 30m, 4h)",
    ),
    (
        "push",
        "push <channel> <value>        - buffer a sensor reading",
    ),
    (
        "status",
        "status                        - display agent state",
    ),
    (
        "network",
        "offline | online              - drop or restore connectivity",
    ),
    (
        "publish",
        "publish <build> [short=<n>]   - offer a firmware build, optionally truncated",
    ),
    (
        "directive",
        "directive <line>              - append a directive to the next upload reply",
    ),
    (
        "unprovision",
        "unprovision                   - clear the persisted token",
    ),
    (
        "time",
        "time                          - read the wall clock",
    ),
    (
        "restart",
        "restart [wipe]                - power-cycle, optionally corrupting storage",
    ),
    (
        "help",
        "help [topic]                  - show help for a command",
    ),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    Healthy,
    Update,
    Flaky,
}

impl TranscriptProfile {
    pub fn log_path(self) -> &'static str {
        match self {
            TranscriptProfile::Healthy => "transcripts/emulator-healthy.log",
            TranscriptProfile::Update => "transcripts/emulator-update.log",
            TranscriptProfile::Flaky => "transcripts/emulator-flaky.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            TranscriptProfile::Healthy => "Check-in Emulator healthy device transcript",
            TranscriptProfile::Update => "Check-in Emulator firmware update transcript",
            TranscriptProfile::Flaky => "Check-in Emulator degraded device transcript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("healthy") {
            Ok(Self::Healthy)
        } else if tag.eq_ignore_ascii_case("update") {
            Ok(Self::Update)
        } else if tag.eq_ignore_ascii_case("flaky") {
            Ok(Self::Flaky)
        } else {
            Err(format!("Unknown transcript profile `{tag}`"))
        }
    }
}

/// Command-line settings for a session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub profile: TranscriptProfile,
    pub product: String,
    pub secret: String,
    pub interval: Duration,
    pub debug: bool,
}

impl SessionOptions {
    pub fn new(profile: TranscriptProfile) -> Self {
        Self {
            profile,
            product: DEFAULT_PRODUCT.to_string(),
            secret: DEFAULT_SECRET.to_string(),
            interval: DEFAULT_CHECKIN_INTERVAL,
            debug: false,
        }
    }

    /// Parses `--profile`, `--product`, `--secret`, `--interval`, and `--debug`.
    /// A bare argument is taken as the profile tag.
    pub fn from_args<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::new(TranscriptProfile::Healthy);
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };

            if flag == "--debug" {
                options.debug = true;
                continue;
            }
            if !flag.starts_with("--") {
                options.profile = TranscriptProfile::from_tag(&flag)?;
                continue;
            }

            let value = match inline {
                Some(value) => value,
                None => args
                    .next()
                    .ok_or_else(|| format!("Expected value after {flag}"))?,
            };
            match flag.as_str() {
                "--profile" => options.profile = TranscriptProfile::from_tag(&value)?,
                "--product" => options.product = value,
                "--secret" => options.secret = value,
                "--interval" => options.interval = parse_duration(&value)?,
                other => return Err(format!("Unknown option `{other}`")),
            }
        }

        Ok(options)
    }

    fn agent_config(&self, local_build: u32) -> io::Result<AgentConfig> {
        AgentConfig::new(&self.product, &self.secret)
            .map(|config| {
                config
                    .with_checkin_interval(self.interval)
                    .with_local_build(local_build)
                    .with_debug(self.debug)
            })
            .map_err(|err| io::Error::other(err.to_string()))
    }
}

pub struct Session {
    options: SessionOptions,
    agent: CheckInAgent<EmulatedPlatform>,
    time: VirtualTime,
    local_build: u32,
    boots: usize,
    transcript: TranscriptLogger,
    started_at: HostInstant,
}

impl Session {
    pub fn new(options: SessionOptions) -> io::Result<Self> {
        let transcript = TranscriptLogger::new(options.profile)?;
        let time = VirtualTime::new(BOOT_UPTIME_MS);

        let offered = match options.profile {
            TranscriptProfile::Healthy => LOCAL_BUILD_NUMBER,
            TranscriptProfile::Update | TranscriptProfile::Flaky => LOCAL_BUILD_NUMBER + 1,
        };
        let service = SimulatedService::new(&options.product, &options.secret, offered);
        let mut io = factory_collaborators(service, &time);
        if options.profile == TranscriptProfile::Flaky {
            io.store.healthy = false;
            io.transport.short_by = 1;
            io.radio.dbm = -92;
        }

        let agent = CheckInAgent::new(options.agent_config(LOCAL_BUILD_NUMBER)?, io);

        Ok(Self {
            options,
            agent,
            time,
            local_build: LOCAL_BUILD_NUMBER,
            boots: 0,
            transcript,
            started_at: HostInstant::now(),
        })
    }

    /// Runs device initialization and reports it.
    pub fn boot(&mut self) -> io::Result<Vec<String>> {
        let elapsed = self.started_at.elapsed();
        let mut lines = Vec::new();
        let report = self.agent.initialize();
        self.describe_boot(&report, &mut lines);
        self.record_output(elapsed, &lines)?;
        Ok(lines)
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.transcript
            .append_line(elapsed, TranscriptRole::Host, trimmed)?;

        let mut words = trimmed.split_whitespace();
        let keyword = words.next().unwrap_or_default().to_ascii_lowercase();
        let rest: Vec<&str> = words.collect();

        let lines = match keyword.as_str() {
            "help" => Self::help(rest.first().copied()),
            "tick" => self.tick()?,
            "advance" => self.advance(&rest),
            "push" => self.push(&rest),
            "status" => self.status(),
            "offline" => self.set_online(false),
            "online" => self.set_online(true),
            "publish" => self.publish(&rest),
            "directive" => self.queue_directive(trimmed),
            "unprovision" => {
                self.agent.unprovision();
                vec!["OK unprovisioned (takes effect without restart)".to_string()]
            }
            "time" => match self.agent.current_time() {
                Some(now) => vec![format!("OK time {now}")],
                None => vec!["ERR time clock never set".to_string()],
            },
            "restart" => self.manual_restart(rest.first().copied())?,
            other => vec![format!("ERR syntax unknown command `{other}`")],
        };

        self.record_output(elapsed, &lines)?;
        Ok(lines)
    }

    fn help(topic: Option<&str>) -> Vec<String> {
        let mut lines = Vec::new();
        match topic {
            Some(target) => {
                if let Some((_, detail)) = HELP_TOPICS
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(target))
                {
                    lines.push((*detail).to_string());
                } else {
                    lines.push(format!("No help available for `{target}`."));
                    lines.push(format!("Available topics: {}", help_topic_list()));
                }
            }
            None => {
                lines.push("Available commands:".to_string());
                for (_, detail) in HELP_TOPICS {
                    lines.push(format!("  {detail}"));
                }
                lines.push("Type `help <topic>` for a specific command.".to_string());
            }
        }
        lines
    }

    fn uptime_ms(&self) -> u64 {
        self.agent.collaborators().timer.uptime_ms()
    }

    fn tick(&mut self) -> io::Result<Vec<String>> {
        let now = self.uptime_ms();
        let report = self.agent.tick(now);

        let mut lines = vec![self.describe_tick(now, &report)];
        lines.extend(self.agent.collaborators_mut().transport.take_requests());
        for payload in &report.config_payloads {
            lines.push(format!("config payload: {payload}"));
        }
        if report.dropped_directives > 0 {
            lines.push(format!(
                "WARN dropped {} directive(s) past capacity",
                report.dropped_directives
            ));
        }
        if let Some(request) = report.restart {
            self.perform_restart(request, &mut lines)?;
        }
        Ok(lines)
    }

    fn describe_tick(&self, now: u64, report: &TickReport) -> String {
        let next_due = self.next_due_ms();
        match report.outcome {
            CheckInOutcome::Skipped => {
                format!("OK checkin skipped at=+{now}ms next-due=+{next_due}ms")
            }
            CheckInOutcome::Success => format!(
                "OK checkin success at=+{now}ms next-due=+{next_due}ms buffered={}",
                self.agent.samples().len()
            ),
            CheckInOutcome::Failed => {
                let cause = report
                    .cause
                    .map_or_else(|| "unknown".to_string(), |cause| cause.to_string());
                format!(
                    "ERR checkin failed at=+{now}ms next-due=+{next_due}ms buffered={} cause={cause}",
                    self.agent.samples().len()
                )
            }
        }
    }

    fn next_due_ms(&self) -> u64 {
        self.agent
            .clock()
            .next_due_ms()
            .unwrap_or_else(|| self.uptime_ms())
    }

    fn advance(&mut self, args: &[&str]) -> Vec<String> {
        let Some(raw) = args.first() else {
            return vec!["ERR syntax advance <duration>".to_string()];
        };
        match parse_duration(raw) {
            Ok(step) => {
                self.time
                    .advance(u64::try_from(step.as_millis()).unwrap_or(u64::MAX));
                vec![format!("OK uptime=+{}ms", self.uptime_ms())]
            }
            Err(err) => vec![format!("ERR syntax {err}")],
        }
    }

    fn push(&mut self, args: &[&str]) -> Vec<String> {
        let parsed = match args {
            [channel, value] => channel.parse::<u16>().ok().zip(value.parse::<f32>().ok()),
            _ => None,
        };
        let Some((channel, value)) = parsed else {
            return vec!["ERR syntax push <channel> <value>".to_string()];
        };

        self.agent.push_sample(channel, value);
        vec![format!(
            "OK buffered channel={channel} value={value:.2} count={}",
            self.agent.samples().len()
        )]
    }

    fn status(&self) -> Vec<String> {
        let provisioning = self.agent.provisioning();
        let service = &self.agent.collaborators().transport;
        let last = self.agent.clock().last_checkin_ms();
        vec![
            format!(
                "build={} boots={} uptime=+{}ms",
                self.local_build,
                self.boots,
                self.uptime_ms()
            ),
            format!(
                "provisioned={} token={}",
                provisioning.is_provisioned(),
                if provisioning.token().is_empty() {
                    "-"
                } else {
                    provisioning.token()
                }
            ),
            format!(
                "buffered={} last-checkin={} next-due=+{}ms interval={}",
                self.agent.samples().len(),
                last.map_or_else(|| "never".to_string(), |last| format!("{last:+}ms")),
                self.next_due_ms(),
                format_duration_short(self.agent.clock().effective_interval()),
            ),
            format!(
                "update={} remote-build={} clock-never-set={}",
                self.agent.update_state(),
                self.agent
                    .last_remote_build()
                    .map_or_else(|| "-".to_string(), |build| build.to_string()),
                self.agent.clock_never_set()
            ),
            format!(
                "service offered-build={} readings-stored={} online={}",
                service.offered_build,
                service.readings_stored,
                self.agent.collaborators().radio.connected
            ),
        ]
    }

    fn set_online(&mut self, online: bool) -> Vec<String> {
        let io = self.agent.collaborators_mut();
        io.radio.connected = online;
        io.transport.reachable = online;
        io.clock.reachable = online;
        vec![format!("OK network {}", if online { "online" } else { "offline" })]
    }

    fn publish(&mut self, args: &[&str]) -> Vec<String> {
        let Some(build) = args.first().and_then(|raw| raw.parse::<u32>().ok()) else {
            return vec!["ERR syntax publish <build> [short=<n>]".to_string()];
        };
        let short_by = args
            .get(1)
            .and_then(|raw| raw.strip_prefix("short="))
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0);

        let service = &mut self.agent.collaborators_mut().transport;
        service.offered_build = build;
        service.short_by = short_by;
        vec![format!(
            "OK publish build={build} size={} short-by={short_by}",
            service.image_size
        )]
    }

    fn queue_directive(&mut self, line: &str) -> Vec<String> {
        let directive = line
            .split_once(char::is_whitespace)
            .map_or("", |(_, rest)| rest.trim());
        if directive.is_empty() {
            return vec!["ERR syntax directive <line>".to_string()];
        }
        self.agent
            .collaborators_mut()
            .transport
            .pending_directives
            .push(directive.to_string());
        vec![format!("OK directive queued `{directive}`")]
    }

    fn manual_restart(&mut self, mode: Option<&str>) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        match mode {
            Some(flag) if flag.eq_ignore_ascii_case("wipe") => {
                self.agent.collaborators_mut().store.healthy = false;
                lines.push("storage marked corrupt".to_string());
            }
            Some(other) => return Ok(vec![format!("ERR syntax unknown restart mode `{other}`")]),
            None => {}
        }
        self.reboot(Duration::ZERO, &mut lines)?;
        Ok(lines)
    }

    fn perform_restart(&mut self, request: RestartRequest, lines: &mut Vec<String>) -> io::Result<()> {
        lines.push(format!("device: {request}"));
        self.reboot(request.delay, lines)
    }

    /// Power-cycles the device: the agent is rebuilt from the surviving
    /// collaborators and re-initialized.
    fn reboot(&mut self, delay: Duration, lines: &mut Vec<String>) -> io::Result<()> {
        self.time
            .advance(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));

        let placeholder = factory_collaborators(
            SimulatedService::new(&self.options.product, &self.options.secret, 0),
            &self.time,
        );
        let previous = std::mem::replace(
            &mut self.agent,
            CheckInAgent::new(self.options.agent_config(self.local_build)?, placeholder),
        );
        let mut io = previous.into_collaborators();

        if io.updater.staged {
            io.updater.staged = false;
            self.local_build = io.transport.offered_build;
            lines.push(format!("device: booting new image build={}", self.local_build));
        }
        io.clock.power_cycle();

        self.agent = CheckInAgent::new(self.options.agent_config(self.local_build)?, io);
        let report = self.agent.initialize();
        self.describe_boot(&report, lines);
        Ok(())
    }

    fn describe_boot(&mut self, report: &InitReport, lines: &mut Vec<String>) {
        self.boots += 1;
        lines.push(format!(
            "device: boot #{} build={} provisioned={} formatted={}",
            self.boots, self.local_build, report.provisioned, report.formatted
        ));
        if let Some(request) = report.restart {
            lines.push(format!(
                "device: init requested {request}; use `restart` once storage is repaired"
            ));
        }
    }

    fn record_output(&mut self, elapsed: Duration, lines: &[String]) -> io::Result<()> {
        for line in lines {
            self.transcript
                .append_line(elapsed, TranscriptRole::Emulator, line)?;
        }
        Ok(())
    }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let path = Path::new(profile.log_path());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        logger.write_header(profile)?;
        Ok(logger)
    }

    fn write_header(&mut self, profile: TranscriptProfile) -> io::Result<()> {
        writeln!(self.writer, "# {}", profile.header())?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses `<n>ms`, `<n>s`, `<n>m`, or `<n>h`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration `{raw}`"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3_600)),
        _ => Err(format!("invalid duration unit in `{raw}`")),
    }
}

fn format_duration_short(duration: Duration) -> String {
    if duration.as_secs() == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.3}s", duration.as_secs_f64())
    }
}
