use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Write, time::Duration};

/// Default user agent sent in the handshake
pub const USER_AGENT: &str = concat!("NTRIP ", env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
/// Default socket timeout
pub const SOCKET_TIMEOUT: Duration = Duration::from_millis(15000);
/// Default delay before reconnecting
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(2000);
/// Default caster port
pub const DEFAULT_PORT: u16 = 2101;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Connection settings for an [`NtripClient`](crate::NtripClient).
///
/// A zero `report_interval` disables position reports, a zero
/// `reconnect_interval` disables reconnection after the first fault.
pub struct ClientConfig {
    /// Caster host name or address
    pub host: String,
    /// Caster port
    pub port: u16,
    /// Mountpoint to stream from, without the leading `/`
    pub mountpoint: String,
    /// User agent header value
    pub user_agent: String,
    /// Basic authentication user
    pub username: String,
    /// Basic authentication password
    pub password: String,
    /// Extra headers sent with the handshake
    pub headers: BTreeMap<String, String>,
    /// Initial ECEF position (m) reported to the caster
    pub position: [f64; 3],
    /// Interval between position reports
    #[serde(with = "millis")]
    pub report_interval: Duration,
    /// Delay between a fault and the next connection attempt
    #[serde(with = "millis")]
    pub reconnect_interval: Duration,
    /// Idle timeout on the socket, also used when connecting
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            mountpoint: String::new(),
            user_agent: USER_AGENT.into(),
            username: String::new(),
            password: String::new(),
            headers: BTreeMap::new(),
            position: [0.0; 3],
            report_interval: Duration::ZERO,
            reconnect_interval: RECONNECT_INTERVAL,
            timeout: SOCKET_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for a mountpoint with default settings
    pub fn new(host: impl Into<String>, port: u16, mountpoint: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            mountpoint: mountpoint.into(),
            ..Default::default()
        }
    }

    /// Set the Basic authentication credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the initial ECEF position
    pub fn with_position(mut self, position: [f64; 3]) -> Self {
        self.position = position;
        self
    }

    /// Report the position every `interval`
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Add a handshake header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// `host:port` of the caster
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the `Authorization` header. Always present, even without credentials.
    pub fn authorization(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }

    /// The request for `path` on the caster: the mountpoint for a stream,
    /// an empty path for the source table.
    pub fn request(&self, path: &str) -> String {
        let mut req = format!("GET /{path} HTTP/1.1\r\nUser-Agent: {}\r\n", self.user_agent);
        // writing into a String cannot fail
        for (key, value) in &self.headers {
            let _ = write!(req, "{key}: {value}\r\n");
        }
        let _ = write!(req, "Authorization: {}\r\n\r\n", self.authorization());
        req
    }

    /// The handshake sent when the stream connection opens
    pub fn handshake(&self) -> String {
        self.request(&self.mountpoint)
    }
}

/// Serialize a [`Duration`] as integer milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
