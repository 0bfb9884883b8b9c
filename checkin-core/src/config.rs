//! Host-supplied agent configuration and service endpoint construction.

use core::fmt::{self, Write};
use core::time::Duration;

use heapless::String;

use crate::error::ProtocolFault;

/// Build number compiled into this firmware.
pub const LOCAL_BUILD_NUMBER: u32 = 12;

/// Default check-in cadence.
pub const DEFAULT_CHECKIN_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Floor applied to every configured check-in interval.
///
/// Agreed with the service operator to bound server load. Lowering it needs
/// that agreement, not a code review.
pub const MIN_CHECKIN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// POSIX time-zone string used when none is configured.
pub const DEFAULT_TIME_ZONE: &str = "MST7MDT";

/// Management service host name.
pub const DEFAULT_SERVICE_HOST: &str = "deviceio-devices.goodprototyping.com";

/// Network time servers handed to the wall clock.
pub const TIME_SERVERS: [&str; 2] = ["pool.ntp.org", "time.nist.gov"];

pub const MAX_PRODUCT_ID_LEN: usize = 32;
pub const MAX_SECRET_LEN: usize = 64;
pub const MAX_TIME_ZONE_LEN: usize = 48;
pub const MAX_HOST_LEN: usize = 64;

/// Capacity of a fully-expanded request target.
pub const MAX_URL_LEN: usize = 256;

/// Request target buffer.
pub type RequestUrl = String<MAX_URL_LEN>;

/// Configuration value that did not fit its fixed-capacity slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    ProductIdTooLong,
    SecretTooLong,
    TimeZoneTooLong,
    HostTooLong,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = match self {
            ConfigError::ProductIdTooLong => "product id",
            ConfigError::SecretTooLong => "product secret",
            ConfigError::TimeZoneTooLong => "time zone",
            ConfigError::HostTooLong => "service host",
        };
        write!(f, "{field} exceeds its configured capacity")
    }
}

/// Static configuration for the lifetime of the agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentConfig {
    product_id: String<MAX_PRODUCT_ID_LEN>,
    product_secret: String<MAX_SECRET_LEN>,
    time_zone: String<MAX_TIME_ZONE_LEN>,
    service_host: String<MAX_HOST_LEN>,
    checkin_interval: Duration,
    local_build: u32,
    debug: bool,
}

impl AgentConfig {
    /// Creates a configuration with default interval, time zone, and host.
    pub fn new(product_id: &str, product_secret: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            product_id: bounded(product_id, ConfigError::ProductIdTooLong)?,
            product_secret: bounded(product_secret, ConfigError::SecretTooLong)?,
            time_zone: bounded(DEFAULT_TIME_ZONE, ConfigError::TimeZoneTooLong)?,
            service_host: bounded(DEFAULT_SERVICE_HOST, ConfigError::HostTooLong)?,
            checkin_interval: DEFAULT_CHECKIN_INTERVAL,
            local_build: LOCAL_BUILD_NUMBER,
            debug: false,
        })
    }

    /// Overrides the check-in interval. Values below [`MIN_CHECKIN_INTERVAL`]
    /// are accepted but clamped when the schedule is evaluated.
    #[must_use]
    pub const fn with_checkin_interval(mut self, interval: Duration) -> Self {
        self.checkin_interval = interval;
        self
    }

    /// Overrides the build number compared against the service.
    #[must_use]
    pub const fn with_local_build(mut self, build: u32) -> Self {
        self.local_build = build;
        self
    }

    /// Enables verbose diagnostics.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_time_zone(mut self, time_zone: &str) -> Result<Self, ConfigError> {
        self.time_zone = bounded(time_zone, ConfigError::TimeZoneTooLong)?;
        Ok(self)
    }

    pub fn with_service_host(mut self, host: &str) -> Result<Self, ConfigError> {
        self.service_host = bounded(host, ConfigError::HostTooLong)?;
        Ok(self)
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn product_secret(&self) -> &str {
        &self.product_secret
    }

    pub fn time_zone(&self) -> &str {
        &self.time_zone
    }

    pub fn service_host(&self) -> &str {
        &self.service_host
    }

    /// Interval exactly as configured.
    pub const fn checkin_interval(&self) -> Duration {
        self.checkin_interval
    }

    /// Interval after applying [`MIN_CHECKIN_INTERVAL`].
    pub fn effective_interval(&self) -> Duration {
        self.checkin_interval.max(MIN_CHECKIN_INTERVAL)
    }

    pub const fn local_build(&self) -> u32 {
        self.local_build
    }

    pub const fn debug(&self) -> bool {
        self.debug
    }

    /// Endpoint builder bound to this configuration.
    pub fn endpoints(&self) -> ServiceEndpoints<'_> {
        ServiceEndpoints { config: self }
    }
}

fn bounded<const N: usize>(value: &str, error: ConfigError) -> Result<String<N>, ConfigError> {
    let mut out = String::new();
    out.push_str(value).map_err(|_| error)?;
    Ok(out)
}

/// Management service commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceCommand {
    Token,
    Version,
    Firmware,
    Sensor,
}

impl ServiceCommand {
    pub const fn query_value(self) -> &'static str {
        match self {
            ServiceCommand::Token => "gettoken",
            ServiceCommand::Version => "getversion",
            ServiceCommand::Firmware => "getfirmware",
            ServiceCommand::Sensor => "sensor",
        }
    }

    /// Whether the request must carry the provisioning token.
    pub const fn requires_token(self) -> bool {
        !matches!(self, ServiceCommand::Token)
    }
}

/// Builds request targets for the management service.
#[derive(Copy, Clone, Debug)]
pub struct ServiceEndpoints<'a> {
    config: &'a AgentConfig,
}

impl ServiceEndpoints<'_> {
    /// Expands the request target for `command`.
    ///
    /// `token` is appended only for commands that carry it.
    pub fn url(&self, command: ServiceCommand, token: &str) -> Result<RequestUrl, ProtocolFault> {
        let mut url = RequestUrl::new();
        write!(
            url,
            "https://{}/manage-device?cmd={}&prodID={}&prodIDpass={}",
            self.config.service_host(),
            command.query_value(),
            self.config.product_id(),
            self.config.product_secret(),
        )
        .map_err(|_| ProtocolFault::RequestTooLarge)?;

        if command.requires_token() {
            write!(url, "&token={token}").map_err(|_| ProtocolFault::RequestTooLarge)?;
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig::new("radio2", "hunter2").unwrap()
    }

    #[test]
    fn interval_is_clamped_to_operator_floor() {
        let short = config().with_checkin_interval(Duration::from_secs(30));
        assert_eq!(short.checkin_interval(), Duration::from_secs(30));
        assert_eq!(short.effective_interval(), MIN_CHECKIN_INTERVAL);

        let long = config().with_checkin_interval(Duration::from_secs(3_600));
        assert_eq!(long.effective_interval(), Duration::from_secs(3_600));
    }

    #[test]
    fn defaults_match_service_expectations() {
        let config = config();
        assert_eq!(config.checkin_interval(), DEFAULT_CHECKIN_INTERVAL);
        assert_eq!(config.time_zone(), DEFAULT_TIME_ZONE);
        assert_eq!(config.local_build(), LOCAL_BUILD_NUMBER);
        assert!(!config.debug());
    }

    #[test]
    fn token_request_omits_token() {
        let config = config();
        let url = config.endpoints().url(ServiceCommand::Token, "ignored").unwrap();
        assert_eq!(
            url.as_str(),
            "https://deviceio-devices.goodprototyping.com/manage-device?cmd=gettoken&prodID=radio2&prodIDpass=hunter2"
        );
    }

    #[test]
    fn provisioned_requests_append_token() {
        let config = config();
        let url = config.endpoints().url(ServiceCommand::Version, "tok-1").unwrap();
        assert!(url.ends_with("cmd=getversion&prodID=radio2&prodIDpass=hunter2&token=tok-1"));

        let url = config.endpoints().url(ServiceCommand::Sensor, "tok-1").unwrap();
        assert!(url.contains("cmd=sensor&"));
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let long = [b'x'; MAX_PRODUCT_ID_LEN + 1];
        let long = core::str::from_utf8(&long).unwrap();
        assert_eq!(
            AgentConfig::new(long, "secret"),
            Err(ConfigError::ProductIdTooLong)
        );
    }
}
