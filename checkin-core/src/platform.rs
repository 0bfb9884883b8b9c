//! Collaborator contracts the check-in engine is written against.
//!
//! Nothing in this module talks to hardware. Firmware targets and the host
//! emulator provide concrete implementations (TLS client, flash-backed
//! key/value store, OTA partition writer, NTP-backed clock, radio driver) and
//! hand them to the agent through a [`Platform`] bundle.

use core::fmt;

use heapless::String;

use crate::timesync::Timestamp;

/// Maximum response body retained from a GET/POST exchange.
pub const MAX_RESPONSE_LEN: usize = 512;

/// Maximum length of a value read back from the persistent store.
pub const MAX_STORED_VALUE_LEN: usize = 64;

/// Response body buffer handed to the transport.
pub type ResponseBody = String<MAX_RESPONSE_LEN>;

/// Value read back from the persistent store.
pub type StoredValue = String<MAX_STORED_VALUE_LEN>;

/// HTTP status as reported by the transport.
///
/// Values `<= 0` are transport-layer failures (connect, TLS, timeout) using
/// the HTTP client's negative error codes; positive values are HTTP status
/// codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HttpStatus(i32);

impl HttpStatus {
    pub const OK: Self = Self(200);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }

    /// Returns `true` when the request never produced an HTTP response.
    pub const fn is_transport_failure(self) -> bool {
        self.0 <= 0
    }

    /// Returns `true` for the only status the service uses for success.
    pub const fn is_ok(self) -> bool {
        self.0 == 200
    }

    /// Name of the transport failure, when the code is a known client error.
    pub const fn transport_label(self) -> Option<&'static str> {
        match self.0 {
            -1 => Some("CONNECTION_REFUSED"),
            -2 => Some("SEND_HEADER_FAILED"),
            -3 => Some("SEND_PAYLOAD_FAILED"),
            -4 => Some("NOT_CONNECTED"),
            -5 => Some("CONNECTION_LOST"),
            -6 => Some("NO_STREAM"),
            -7 => Some("NO_HTTP_SERVER"),
            -8 => Some("NOT_ENOUGH_RAM"),
            -9 => Some("ENCODING"),
            -10 => Some("STREAM_WRITE"),
            -11 => Some("READ_TIMEOUT"),
            _ => None,
        }
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport_label() {
            Some(label) => write!(f, "HTTPERR:{label}"),
            None if self.is_transport_failure() => write!(f, "HTTPERR:{}", self.0),
            None => write!(f, "HTTP {}", self.0),
        }
    }
}

/// Pull-based byte stream used to feed firmware images into the updater.
pub trait ByteSource {
    /// Reads up to `buf.len()` bytes; returns 0 once the stream is exhausted.
    fn read_chunk(&mut self, buf: &mut [u8]) -> usize;
}

/// Successful (HTTP 200) firmware download handle.
pub struct Download<S> {
    /// Content length declared by the server (0 when absent).
    pub content_length: u32,
    pub stream: S,
}

/// Secure HTTP client.
pub trait Transport {
    type Stream: ByteSource;

    /// Issues a GET, filling `body` with the response payload when one arrives.
    fn get(&mut self, url: &str, body: &mut ResponseBody) -> HttpStatus;

    /// Issues a form-encoded POST, filling `body` with the response payload.
    fn post_form(&mut self, url: &str, form: &str, body: &mut ResponseBody) -> HttpStatus;

    /// Opens a streaming GET. Returns the status as an error for anything but 200.
    fn download(&mut self, url: &str) -> Result<Download<Self::Stream>, HttpStatus>;
}

/// Persistent key/value storage (flash filesystem on device).
pub trait KeyValueStore {
    /// Mounts the backing filesystem; `false` means unusable or unformatted.
    fn mount(&mut self) -> bool;

    /// Erases and re-creates the backing filesystem.
    fn format(&mut self) -> bool;

    /// Confirms the flash layout matches what the firmware was built for.
    fn verify_layout(&mut self) -> bool {
        true
    }

    fn read_string(&mut self, key: &str) -> Option<StoredValue>;

    fn write(&mut self, key: &str, value: &str) -> bool;

    /// Reads a flag persisted as `"1"`/`"0"`.
    fn read_flag(&mut self, key: &str) -> bool {
        self.read_string(key)
            .is_some_and(|value| value.as_str().trim() == "1")
    }
}

/// Writer for the inactive boot image.
pub trait FirmwareUpdater {
    /// Reserves space for an image of `expected_size` bytes.
    fn begin(&mut self, expected_size: u32) -> bool;

    /// Copies the stream into the image, returning the number of bytes written.
    fn write_stream<S: ByteSource>(&mut self, source: &mut S) -> u32;

    /// Finalizes the image and confirms it is complete and valid.
    fn finalize_and_verify(&mut self) -> bool;
}

/// Wall-clock source, typically backed by network time.
pub trait WallClock {
    /// Applies the POSIX time-zone string and network time servers.
    fn configure(&mut self, time_zone: &str, servers: &[&str]);

    /// Current local time, or `None` while the clock is unset.
    fn now(&mut self) -> Option<Timestamp>;
}

/// Radio link status.
pub trait Connectivity {
    fn is_connected(&self) -> bool;

    /// Instantaneous received signal strength in dBm.
    fn signal_strength(&mut self) -> i32;
}

/// Monotonic uptime plus a blocking delay.
pub trait SystemTimer {
    fn uptime_ms(&self) -> u64;

    fn delay_ms(&mut self, ms: u32);
}

/// Sensors built into the controller itself.
pub trait BuiltinSensors {
    /// Supply rail in volts, when the part can measure it.
    fn supply_voltage(&mut self) -> Option<f32> {
        None
    }

    /// Die temperature in degrees Celsius, when the part has a sensor.
    fn core_temperature(&mut self) -> Option<f32> {
        None
    }
}

/// Converts a raw die reading in Fahrenheit to Celsius.
#[must_use]
pub fn celsius_from_fahrenheit(fahrenheit: f32) -> f32 {
    (fahrenheit - 32.0) / 1.8
}

/// Bundle of collaborator types for one target.
pub trait Platform {
    type Transport: Transport;
    type Store: KeyValueStore;
    type Updater: FirmwareUpdater;
    type Clock: WallClock;
    type Radio: Connectivity;
    type Timer: SystemTimer;
    type Sensors: BuiltinSensors;
}

/// Owned collaborator instances for a [`Platform`].
pub struct Collaborators<P: Platform> {
    pub transport: P::Transport,
    pub store: P::Store,
    pub updater: P::Updater,
    pub clock: P::Clock,
    pub radio: P::Radio,
    pub timer: P::Timer,
    pub sensors: P::Sensors,
}
