use std::{path::PathBuf, time::Duration};

use argh::FromArgs;
use directories::ProjectDirs;
use ntrip_client::{ecef, ClientConfig, ClientError, SourceTableError};
use thiserror::Error;

#[derive(Error, Debug)]
/// Anything that stops the recorder
pub enum RecorderError {
    /// File or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration file is not valid JSON5
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] json5::Error),
    /// The configuration could not be stored
    #[error("Could not serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    /// A required setting was given nowhere
    #[error("{0}")]
    Missing(&'static str),
    /// The client could not start
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The source table could not be fetched
    #[error("Source table: {0}")]
    SourceTable(#[from] SourceTableError),
    /// The interrupt handler could not be installed
    #[error("Could not install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

#[derive(FromArgs, Debug)]
/// Record the correction stream of an NTRIP mountpoint
pub struct RecorderCfg {
    /// mountpoint to record
    #[argh(positional)]
    pub mountpoint: Option<String>,
    /// caster host
    #[argh(option)]
    pub host: Option<String>,
    /// caster port
    #[argh(option, short = 'p')]
    pub port: Option<u16>,
    /// user name
    #[argh(option, short = 'u')]
    pub user: Option<String>,
    /// password
    #[argh(option)]
    pub password: Option<String>,
    /// user agent sent to the caster
    #[argh(option)]
    pub user_agent: Option<String>,
    /// extra request header as `Key: Value`, may be repeated
    #[argh(option, from_str_fn(parse_header))]
    pub header: Vec<(String, String)>,
    /// ECEF position reported to the caster, `x,y,z` in meters
    #[argh(option, from_str_fn(parse_triplet))]
    pub position: Option<[f64; 3]>,
    /// position reported to the caster, `lat,lon,height` in degrees and meters
    #[argh(option, from_str_fn(parse_triplet))]
    pub llh: Option<[f64; 3]>,
    /// milliseconds between position reports, 0 disables them
    #[argh(option)]
    pub report_interval: Option<u64>,
    /// milliseconds before reconnecting, 0 disables reconnection
    #[argh(option)]
    pub reconnect_interval: Option<u64>,
    /// socket timeout in milliseconds
    #[argh(option)]
    pub timeout: Option<u64>,
    /// save data to this directory
    #[argh(option, default = "PathBuf::from(\".\")")]
    pub save_dir: PathBuf,
    /// compress each finished day
    #[argh(switch)]
    pub compress: bool,
    /// print the source table of the caster and exit
    #[argh(switch)]
    pub list: bool,
    /// JSON5 client configuration to start from
    #[argh(option)]
    pub config: Option<PathBuf>,
    /// store the resulting client configuration as the default
    #[argh(switch)]
    pub save_config: bool,
}

impl RecorderCfg {
    /// Client configuration: the file given with `--config` or the stored
    /// default, overridden by command line options
    pub fn client_config(&self) -> Result<ClientConfig, RecorderError> {
        let mut cfg = match &self.config {
            Some(path) => load(path)?,
            None => load_default()?.unwrap_or_default(),
        };
        if let Some(host) = &self.host {
            cfg.host = host.clone();
        }
        if let Some(mountpoint) = &self.mountpoint {
            cfg.mountpoint = mountpoint.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(user) = &self.user {
            cfg.username = user.clone();
        }
        if let Some(password) = &self.password {
            cfg.password = password.clone();
        }
        if let Some(ua) = &self.user_agent {
            cfg.user_agent = ua.clone();
        }
        cfg.headers.extend(self.header.iter().cloned());
        if let Some([lat, lon, h]) = self.llh {
            cfg.position = ecef::geodetic_to_ecef(lat, lon, h);
        }
        if let Some(xyz) = self.position {
            cfg.position = xyz;
        }
        if let Some(ms) = self.report_interval {
            cfg.report_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_interval {
            cfg.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout {
            cfg.timeout = Duration::from_millis(ms);
        }
        if cfg.host.is_empty() {
            return Err(RecorderError::Missing("No caster host given"));
        }
        if cfg.mountpoint.is_empty() && !self.list {
            return Err(RecorderError::Missing("No mountpoint given"));
        }
        Ok(cfg)
    }
}

/// Load a client configuration from a JSON5 file
pub fn load(path: &PathBuf) -> Result<ClientConfig, RecorderError> {
    let data = std::fs::read_to_string(path)?;
    Ok(json5::from_str(&data)?)
}

/// Load the client configuration from the default location, if there is one
pub fn load_default() -> Result<Option<ClientConfig>, RecorderError> {
    let path = get_default_path();
    if !path.exists() {
        return Ok(None);
    }
    load(&path).map(Some)
}

/// Store the client configuration in the default location
pub fn store_default(cfg: &ClientConfig) -> Result<PathBuf, RecorderError> {
    let path = get_default_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(cfg)?)?;
    Ok(path)
}

fn get_default_path() -> PathBuf {
    let dir = if let Some(path) = ProjectDirs::from("", "", "ntrip_recorder") {
        path.config_dir().to_path_buf()
    } else {
        PathBuf::from(".")
    };
    dir.join("config.json5")
}

fn parse_header(inp: &str) -> Result<(String, String), String> {
    let (key, value) = inp
        .split_once(':')
        .ok_or_else(|| format!("Expected `Key: Value`, got {inp:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Empty header name in {inp:?}"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_triplet(inp: &str) -> Result<[f64; 3], String> {
    let values = inp
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Invalid number in {inp:?}: {e}"))?;
    values
        .try_into()
        .map_err(|_| format!("Expected three comma separated values, got {inp:?}"))
}
