//! Caster source table records.
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::{config::ClientConfig, transport::connect};

const STR_KEYS: [&str; 18] = [
    "type", "mountpoint", "identifier", "format", "formatDetails", "carrier", "navSystem",
    "network", "country", "latitude", "longitude", "nmea", "solution", "generator",
    "comprEncryp", "authentication", "fee", "bitrate",
];
const CAS_KEYS: [&str; 11] = [
    "type", "host", "port", "identifier", "operator", "nmea", "country", "latitude", "longitude",
    "fallbackHost", "fallbackPort",
];
const NET_KEYS: [&str; 8] = [
    "type", "identifier", "operator", "authentication", "fee", "webNet", "webStr", "webReg",
];

const END_MARKER: &[u8] = b"ENDSOURCETABLE";
/// Largest source table accepted before giving up on the end marker
const MAX_TABLE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
/// Failure to retrieve a source table
pub enum SourceTableError {
    /// Connecting or reading failed
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
    /// The caster answered with something other than a source table
    #[error("Caster refused the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Kind of a source table record
pub enum RecordKind {
    /// A stream (mountpoint)
    Str,
    /// Another caster
    Cas,
    /// A network of streams
    Net,
}

impl RecordKind {
    fn from_line(line: &str) -> Option<Self> {
        if line.starts_with("STR;") {
            Some(Self::Str)
        } else if line.starts_with("CAS;") {
            Some(Self::Cas)
        } else if line.starts_with("NET;") {
            Some(Self::Net)
        } else {
            None
        }
    }

    /// Field names of this record kind, in wire order
    pub fn keys(&self) -> &'static [&'static str] {
        match self {
            Self::Str => &STR_KEYS,
            Self::Cas => &CAS_KEYS,
            Self::Net => &NET_KEYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One record of a source table. Fields the caster did not send are absent.
pub struct SourceTableEntry {
    kind: RecordKind,
    values: Vec<String>,
}

impl SourceTableEntry {
    /// Parse a single `STR;`, `CAS;` or `NET;` line
    pub fn parse(line: &str) -> Option<Self> {
        let kind = RecordKind::from_line(line)?;
        let values = line
            .split(';')
            .take(kind.keys().len())
            .map(String::from)
            .collect();
        Some(Self { kind, values })
    }

    /// Record type from the leading field
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Value of the named field, if the caster supplied it
    pub fn get(&self, key: &str) -> Option<&str> {
        let idx = self.kind.keys().iter().position(|&k| k == key)?;
        self.values.get(idx).map(String::as_str)
    }

    /// `(name, value)` pairs in wire order
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.kind
            .keys()
            .iter()
            .copied()
            .zip(self.values.iter().map(String::as_str))
    }

    /// Number of fields present
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no field is present
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Split a source table into records, skipping anything that is not a record
pub fn parse(text: &str) -> Vec<SourceTableEntry> {
    text.lines()
        .map(str::trim)
        .filter_map(SourceTableEntry::parse)
        .collect()
}

/// Request the source table of the caster in `config`
pub fn fetch(config: &ClientConfig) -> Result<Vec<SourceTableEntry>, SourceTableError> {
    let mut stream = connect(&config.address(), config.timeout)?;
    let idle = (!config.timeout.is_zero()).then_some(config.timeout);
    stream.set_read_timeout(idle)?;
    stream.set_write_timeout(idle)?;
    stream.write_all(config.request("").as_bytes())?;
    let body = read_table(&mut stream, MAX_TABLE_SIZE)?;
    let text = String::from_utf8_lossy(&body);
    let status = text.lines().next().unwrap_or_default();
    if !status.contains(" 200 ") && !status.ends_with(" 200 OK") {
        return Err(SourceTableError::Rejected(status.to_string()));
    }
    log::debug!("Source table from {}: {} bytes", config.address(), body.len());
    Ok(parse(&text))
}

fn read_table<R: Read>(reader: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(4096);
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        // search from the tail of the previous chunk in case the marker was split
        let from = body.len().saturating_sub(END_MARKER.len());
        body.extend_from_slice(&buf[..n]);
        if body[from..].windows(END_MARKER.len()).any(|w| w == END_MARKER) {
            break;
        }
        if body.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("No end of source table within {limit} bytes"),
            ));
        }
    }
    Ok(body)
}
