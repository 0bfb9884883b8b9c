//! Simulated device collaborators and management service.
//!
//! Time is virtual: blocking delays advance a shared counter instead of
//! sleeping, so a full time-sync retry cycle completes instantly.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use checkin_core::platform::{
    BuiltinSensors, ByteSource, Collaborators, Connectivity, Download, FirmwareUpdater,
    HttpStatus, KeyValueStore, Platform, ResponseBody, StoredValue, SystemTimer, Transport,
    WallClock, celsius_from_fahrenheit,
};
use checkin_core::timesync::Timestamp;

/// Uptime the simulated device reports right after power-on.
pub const BOOT_UPTIME_MS: u64 = 1_000;

pub const DEFAULT_IMAGE_SIZE: u32 = 4_096;

pub struct EmulatedPlatform;

impl Platform for EmulatedPlatform {
    type Transport = SimulatedService;
    type Store = FlashStore;
    type Updater = FlashUpdater;
    type Clock = HostClock;
    type Radio = SimulatedRadio;
    type Timer = VirtualTimer;
    type Sensors = HostSensors;
}

/// Monotonic virtual milliseconds shared by the timer and the clock.
#[derive(Clone, Debug, Default)]
pub struct VirtualTime(Rc<Cell<u64>>);

impl VirtualTime {
    pub fn new(start_ms: u64) -> Self {
        Self(Rc::new(Cell::new(start_ms)))
    }

    pub fn now_ms(&self) -> u64 {
        self.0.get()
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get().saturating_add(ms));
    }
}

pub struct VirtualTimer {
    time: VirtualTime,
}

impl VirtualTimer {
    pub fn new(time: VirtualTime) -> Self {
        Self { time }
    }
}

impl SystemTimer for VirtualTimer {
    fn uptime_ms(&self) -> u64 {
        self.time.now_ms()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.time.advance(u64::from(ms));
    }
}

/// Wall clock derived from host time at session start plus virtual uptime.
pub struct HostClock {
    time: VirtualTime,
    epoch_secs: u64,
    offset_secs: i64,
    configured: bool,
    synced: bool,
    /// Network time servers answer.
    pub reachable: bool,
}

impl HostClock {
    pub fn new(time: VirtualTime) -> Self {
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        Self {
            time,
            epoch_secs,
            offset_secs: 0,
            configured: false,
            synced: false,
            reachable: true,
        }
    }

    /// Forgets the synchronized time, as a power cycle would.
    pub fn power_cycle(&mut self) {
        self.configured = false;
        self.synced = false;
    }
}

impl WallClock for HostClock {
    fn configure(&mut self, time_zone: &str, servers: &[&str]) {
        self.offset_secs = posix_offset_secs(time_zone);
        self.configured = !servers.is_empty();
    }

    fn now(&mut self) -> Option<Timestamp> {
        if !self.configured {
            return None;
        }
        if self.reachable {
            self.synced = true;
        }
        if !self.synced {
            // Unsynchronized RTC counts from the epoch.
            return Some(civil_from_unix(self.time.now_ms() / 1_000));
        }

        let utc = self.epoch_secs + self.time.now_ms() / 1_000;
        let local = utc.saturating_add_signed(self.offset_secs);
        Some(civil_from_unix(local))
    }
}

/// Standard-time offset of a POSIX TZ string such as `MST7MDT`.
///
/// POSIX offsets count hours west of UTC. Daylight rules are ignored.
fn posix_offset_secs(time_zone: &str) -> i64 {
    let rest = time_zone.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let end = rest
        .char_indices()
        .find(|&(index, c)| !(c.is_ascii_digit() || (index == 0 && (c == '-' || c == '+'))))
        .map_or(rest.len(), |(index, _)| index);
    rest[..end]
        .parse::<i64>()
        .map_or(0, |hours_west| -hours_west * 3_600)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn civil_from_unix(secs: u64) -> Timestamp {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    Timestamp::new(
        year as u16,
        month as u8,
        day as u8,
        (rem / 3_600) as u8,
        (rem % 3_600 / 60) as u8,
        (rem % 60) as u8,
    )
}

/// In-memory stand-in for the flash filesystem.
pub struct FlashStore {
    entries: HashMap<String, String>,
    /// Filesystem mounts cleanly.
    pub healthy: bool,
    pub layout_ok: bool,
    pub formats: usize,
}

impl FlashStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            healthy: true,
            layout_ok: true,
            formats: 0,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

impl Default for FlashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for FlashStore {
    fn mount(&mut self) -> bool {
        self.healthy
    }

    fn format(&mut self) -> bool {
        self.entries.clear();
        self.formats += 1;
        self.healthy = true;
        true
    }

    fn verify_layout(&mut self) -> bool {
        self.layout_ok
    }

    fn read_string(&mut self, key: &str) -> Option<StoredValue> {
        let value = self.entries.get(key)?;
        let mut out = StoredValue::new();
        out.push_str(value).ok()?;
        Some(out)
    }

    fn write(&mut self, key: &str, value: &str) -> bool {
        self.entries.insert(key.to_string(), value.to_string());
        true
    }
}

/// Counts image bytes into the inactive slot.
#[derive(Default)]
pub struct FlashUpdater {
    expected: Option<u32>,
    written: u32,
    /// A verified image waits for the next boot.
    pub staged: bool,
    /// Reservation limit of the inactive slot.
    pub slot_size: Option<u32>,
}

impl FirmwareUpdater for FlashUpdater {
    fn begin(&mut self, expected_size: u32) -> bool {
        if self.slot_size.is_some_and(|limit| expected_size > limit) {
            return false;
        }
        self.expected = Some(expected_size);
        self.written = 0;
        self.staged = false;
        true
    }

    fn write_stream<S: ByteSource>(&mut self, source: &mut S) -> u32 {
        let mut chunk = [0_u8; 256];
        loop {
            let read = source.read_chunk(&mut chunk);
            if read == 0 {
                return self.written;
            }
            self.written = self
                .written
                .saturating_add(u32::try_from(read).unwrap_or(u32::MAX));
        }
    }

    fn finalize_and_verify(&mut self) -> bool {
        self.staged = self.expected == Some(self.written);
        self.staged
    }
}

pub struct SimulatedRadio {
    pub connected: bool,
    pub dbm: i32,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self {
            connected: true,
            dbm: -67,
        }
    }
}

impl Connectivity for SimulatedRadio {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn signal_strength(&mut self) -> i32 {
        self.dbm
    }
}

/// Built-in sensors of an ESP32-class part: no supply monitor, die sensor in
/// Fahrenheit.
pub struct HostSensors {
    pub supply_volts: Option<f32>,
    pub die_fahrenheit: Option<f32>,
}

impl Default for HostSensors {
    fn default() -> Self {
        Self {
            supply_volts: None,
            die_fahrenheit: Some(113.0),
        }
    }
}

impl BuiltinSensors for HostSensors {
    fn supply_voltage(&mut self) -> Option<f32> {
        self.supply_volts
    }

    fn core_temperature(&mut self) -> Option<f32> {
        self.die_fahrenheit.map(celsius_from_fahrenheit)
    }
}

/// Firmware image body of a fixed size.
pub struct ImageStream {
    remaining: u32,
}

impl ByteSource for ImageStream {
    fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        let available = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let len = buf.len().min(available);
        buf[..len].fill(0xE9);
        self.remaining -= u32::try_from(len).unwrap_or(self.remaining);
        len
    }
}

/// In-process management service.
pub struct SimulatedService {
    product: String,
    secret: String,
    token: String,
    /// Service answers at all.
    pub reachable: bool,
    pub offered_build: u32,
    pub image_size: u32,
    /// Bytes withheld from the end of every image transfer.
    pub short_by: u32,
    /// Directive lines appended to the next upload reply.
    pub pending_directives: Vec<String>,
    pub readings_stored: usize,
    requests: Vec<String>,
}

impl SimulatedService {
    pub fn new(product: &str, secret: &str, offered_build: u32) -> Self {
        Self {
            product: product.to_string(),
            secret: secret.to_string(),
            token: format!("{product}-0001"),
            reachable: true,
            offered_build,
            image_size: DEFAULT_IMAGE_SIZE,
            short_by: 0,
            pending_directives: Vec::new(),
            readings_stored: 0,
            requests: Vec::new(),
        }
    }

    /// Request log lines accumulated since the last call.
    pub fn take_requests(&mut self) -> Vec<String> {
        std::mem::take(&mut self.requests)
    }

    fn authorize<'a>(&mut self, method: &str, url: &'a str) -> Result<Query<'a>, HttpStatus> {
        let query = Query::parse(url);
        self.requests
            .push(format!("service: {method} cmd={}", query.command));

        if !self.reachable {
            return Err(HttpStatus::new(-1));
        }
        if query.product != self.product || query.secret != self.secret {
            return Err(HttpStatus::new(403));
        }
        if query.command != "gettoken" && query.token != Some(self.token.as_str()) {
            return Err(HttpStatus::new(401));
        }
        Ok(query)
    }
}

fn respond(body: &mut ResponseBody, text: &str) -> HttpStatus {
    body.clear();
    if body.push_str(text).is_err() {
        // Oversized reply; keep the status line only.
        let status = text.split('\r').next().unwrap_or_default();
        let _ = body.push_str(status);
    }
    HttpStatus::OK
}

impl Transport for SimulatedService {
    type Stream = ImageStream;

    fn get(&mut self, url: &str, body: &mut ResponseBody) -> HttpStatus {
        let query = match self.authorize("GET", url) {
            Ok(query) => query,
            Err(status) => return status,
        };
        match query.command {
            "gettoken" => {
                let token = self.token.clone();
                respond(body, &token)
            }
            "getversion" => respond(body, &self.offered_build.to_string()),
            _ => HttpStatus::new(400),
        }
    }

    fn post_form(&mut self, url: &str, form: &str, body: &mut ResponseBody) -> HttpStatus {
        if let Err(status) = self.authorize("POST", url) {
            return status;
        }

        let count = form.matches("][sensornum]=").count();
        self.readings_stored += count;

        let mut reply = format!("OK\r{count} sensors updated\r");
        for directive in self.pending_directives.drain(..) {
            reply.push_str(&directive);
            reply.push('\r');
        }
        respond(body, &reply)
    }

    fn download(&mut self, url: &str) -> Result<Download<Self::Stream>, HttpStatus> {
        let query = self.authorize("GET", url)?;
        if query.command != "getfirmware" {
            return Err(HttpStatus::new(400));
        }
        Ok(Download {
            content_length: self.image_size,
            stream: ImageStream {
                remaining: self.image_size.saturating_sub(self.short_by),
            },
        })
    }
}

struct Query<'a> {
    command: &'a str,
    product: &'a str,
    secret: &'a str,
    token: Option<&'a str>,
}

impl<'a> Query<'a> {
    fn parse(url: &'a str) -> Self {
        let mut query = Query {
            command: "",
            product: "",
            secret: "",
            token: None,
        };
        let params = url.split_once('?').map_or("", |(_, params)| params);
        for pair in params.split('&') {
            match pair.split_once('=') {
                Some(("cmd", value)) => query.command = value,
                Some(("prodID", value)) => query.product = value,
                Some(("prodIDpass", value)) => query.secret = value,
                Some(("token", value)) => query.token = Some(value),
                _ => {}
            }
        }
        query
    }
}

/// Fresh collaborators for a device that has never booted.
pub fn factory_collaborators(
    service: SimulatedService,
    time: &VirtualTime,
) -> Collaborators<EmulatedPlatform> {
    Collaborators {
        transport: service,
        store: FlashStore::new(),
        updater: FlashUpdater::default(),
        clock: HostClock::new(time.clone()),
        radio: SimulatedRadio::default(),
        timer: VirtualTimer::new(time.clone()),
        sensors: HostSensors::default(),
    }
}
