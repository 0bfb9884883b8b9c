#![allow(dead_code)]

use checkin_core::config::{AgentConfig, RequestUrl};
use checkin_core::platform::{
    BuiltinSensors, ByteSource, Collaborators, Connectivity, Download, FirmwareUpdater,
    HttpStatus, KeyValueStore, Platform, ResponseBody, StoredValue, SystemTimer, Transport,
    WallClock,
};
use checkin_core::samples::FormBody;
use checkin_core::timesync::Timestamp;
use checkin_core::CheckInAgent;
use heapless::{String, Vec as HeaplessVec};

pub const PRODUCT_ID: &str = "radio2";
pub const PRODUCT_SECRET: &str = "hunter2";
pub const TOKEN: &str = "tok-123";
pub const SYNCED: Timestamp = Timestamp::new(2021, 5, 1, 10, 0, 0);

pub struct MockPlatform;

impl Platform for MockPlatform {
    type Transport = MockTransport;
    type Store = MemoryStore;
    type Updater = MockUpdater;
    type Clock = MockClock;
    type Radio = MockRadio;
    type Timer = MockTimer;
    type Sensors = MockSensors;
}

#[derive(Clone, Copy, Debug)]
pub struct Reply {
    pub status: i32,
    pub body: &'static str,
}

impl Reply {
    pub const fn ok(body: &'static str) -> Self {
        Self { status: 200, body }
    }

    pub const fn status(status: i32) -> Self {
        Self { status, body: "" }
    }
}

pub struct MockTransport {
    pub token: Reply,
    pub version: Reply,
    /// Declared content length, or the failing status.
    pub firmware: Result<u32, i32>,
    /// Bytes the firmware stream actually yields.
    pub firmware_bytes: u32,
    pub sensor: Reply,
    pub urls: HeaplessVec<RequestUrl, 16>,
    pub forms: HeaplessVec<FormBody, 4>,
}

impl MockTransport {
    fn respond(reply: Reply, body: &mut ResponseBody) -> HttpStatus {
        body.clear();
        body.push_str(reply.body).expect("reply fits");
        HttpStatus::new(reply.status)
    }

    fn log(&mut self, url: &str) {
        let mut logged = RequestUrl::new();
        logged.push_str(url).expect("url fits");
        self.urls.push(logged).expect("request log capacity");
    }

    pub fn commands(&self) -> HeaplessVec<&str, 16> {
        self.urls
            .iter()
            .filter_map(|url| {
                let start = url.find("cmd=")? + 4;
                let rest = &url[start..];
                Some(&rest[..rest.find('&').unwrap_or(rest.len())])
            })
            .collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            token: Reply::ok(TOKEN),
            version: Reply::ok("12"),
            firmware: Ok(1000),
            firmware_bytes: 1000,
            sensor: Reply::ok("OK\r1 sensors updated\r"),
            urls: HeaplessVec::new(),
            forms: HeaplessVec::new(),
        }
    }
}

pub struct CountingStream {
    remaining: u32,
}

impl ByteSource for CountingStream {
    fn read_chunk(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.remaining as usize);
        buf[..len].fill(0xA5);
        self.remaining -= len as u32;
        len
    }
}

impl Transport for MockTransport {
    type Stream = CountingStream;

    fn get(&mut self, url: &str, body: &mut ResponseBody) -> HttpStatus {
        self.log(url);
        if url.contains("cmd=gettoken") {
            Self::respond(self.token, body)
        } else if url.contains("cmd=getversion") {
            Self::respond(self.version, body)
        } else {
            HttpStatus::new(404)
        }
    }

    fn post_form(&mut self, url: &str, form: &str, body: &mut ResponseBody) -> HttpStatus {
        self.log(url);
        let mut logged = FormBody::new();
        logged.push_str(form).expect("form fits");
        self.forms.push(logged).expect("form log capacity");
        Self::respond(self.sensor, body)
    }

    fn download(&mut self, url: &str) -> Result<Download<Self::Stream>, HttpStatus> {
        self.log(url);
        match self.firmware {
            Ok(content_length) => Ok(Download {
                content_length,
                stream: CountingStream {
                    remaining: self.firmware_bytes,
                },
            }),
            Err(code) => Err(HttpStatus::new(code)),
        }
    }
}

pub struct MemoryStore {
    pub mountable: bool,
    pub layout_ok: bool,
    pub formatted: bool,
    /// Every write is refused.
    pub read_only: bool,
    pub entries: HeaplessVec<(String<16>, StoredValue), 8>,
}

impl MemoryStore {
    pub fn provisioned(token: &str) -> Self {
        let mut store = Self::default();
        store.write("provisioned", "1");
        store.write("token", token);
        store
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name.as_str() == key)
            .map(|(_, value)| value.as_str())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            mountable: true,
            layout_ok: true,
            formatted: false,
            read_only: false,
            entries: HeaplessVec::new(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn mount(&mut self) -> bool {
        self.mountable
    }

    fn format(&mut self) -> bool {
        self.entries.clear();
        self.formatted = true;
        self.mountable = true;
        true
    }

    fn verify_layout(&mut self) -> bool {
        self.layout_ok
    }

    fn read_string(&mut self, key: &str) -> Option<StoredValue> {
        self.value(key).map(|value| {
            let mut out = StoredValue::new();
            out.push_str(value).expect("value fits");
            out
        })
    }

    fn write(&mut self, key: &str, value: &str) -> bool {
        if self.read_only {
            return false;
        }
        let mut stored = StoredValue::new();
        if stored.push_str(value).is_err() {
            return false;
        }
        if let Some(entry) = self.entries.iter_mut().find(|(name, _)| name.as_str() == key) {
            entry.1 = stored;
            return true;
        }
        let mut name = String::new();
        name.push_str(key).is_ok() && self.entries.push((name, stored)).is_ok()
    }
}

pub struct MockUpdater {
    pub accept_begin: bool,
    pub verify: bool,
    pub begun: Option<u32>,
    pub written: u32,
    pub finalized: bool,
}

impl Default for MockUpdater {
    fn default() -> Self {
        Self {
            accept_begin: true,
            verify: true,
            begun: None,
            written: 0,
            finalized: false,
        }
    }
}

impl FirmwareUpdater for MockUpdater {
    fn begin(&mut self, expected_size: u32) -> bool {
        if self.accept_begin {
            self.begun = Some(expected_size);
        }
        self.accept_begin
    }

    fn write_stream<S: ByteSource>(&mut self, source: &mut S) -> u32 {
        let mut chunk = [0_u8; 128];
        loop {
            let read = source.read_chunk(&mut chunk);
            if read == 0 {
                return self.written;
            }
            self.written += read as u32;
        }
    }

    fn finalize_and_verify(&mut self) -> bool {
        self.finalized = true;
        self.verify
    }
}

pub struct MockClock {
    pub time: Option<Timestamp>,
    pub time_zone: Option<String<48>>,
    pub servers: usize,
}

impl Default for MockClock {
    fn default() -> Self {
        Self {
            time: Some(SYNCED),
            time_zone: None,
            servers: 0,
        }
    }
}

impl WallClock for MockClock {
    fn configure(&mut self, time_zone: &str, servers: &[&str]) {
        let mut tz = String::new();
        tz.push_str(time_zone).expect("tz fits");
        self.time_zone = Some(tz);
        self.servers = servers.len();
    }

    fn now(&mut self) -> Option<Timestamp> {
        self.time
    }
}

pub struct MockRadio {
    pub connected: bool,
    pub dbm: i32,
}

impl Default for MockRadio {
    fn default() -> Self {
        Self {
            connected: true,
            dbm: -75,
        }
    }
}

impl Connectivity for MockRadio {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn signal_strength(&mut self) -> i32 {
        self.dbm
    }
}

#[derive(Default)]
pub struct MockTimer {
    pub now_ms: u64,
}

impl SystemTimer for MockTimer {
    fn uptime_ms(&self) -> u64 {
        self.now_ms
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now_ms += u64::from(ms);
    }
}

#[derive(Default)]
pub struct MockSensors {
    pub volts: Option<f32>,
    pub celsius: Option<f32>,
}

impl BuiltinSensors for MockSensors {
    fn supply_voltage(&mut self) -> Option<f32> {
        self.volts
    }

    fn core_temperature(&mut self) -> Option<f32> {
        self.celsius
    }
}

pub fn collaborators() -> Collaborators<MockPlatform> {
    Collaborators {
        transport: MockTransport::default(),
        store: MemoryStore::default(),
        updater: MockUpdater::default(),
        clock: MockClock::default(),
        radio: MockRadio::default(),
        timer: MockTimer::default(),
        sensors: MockSensors::default(),
    }
}

pub fn config() -> AgentConfig {
    AgentConfig::new(PRODUCT_ID, PRODUCT_SECRET).expect("valid config")
}

/// Initialized agent whose store already holds [`TOKEN`].
pub fn provisioned_agent() -> CheckInAgent<MockPlatform> {
    let mut io = collaborators();
    io.store = MemoryStore::provisioned(TOKEN);
    let mut agent = CheckInAgent::new(config(), io);
    let report = agent.initialize();
    assert!(report.provisioned);
    agent
}
