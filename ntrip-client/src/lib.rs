#![deny(missing_docs)]
//! # NTRIP Client
//! A client for NTRIP casters.
//!
//! Connects to a caster mountpoint with Basic authentication, hands the
//! correction stream to the caller and reconnects after faults. While the
//! stream is up the receiver position can be reported back as NMEA GGA
//! sentences, as VRS networks require.
//!
//! Also provides the GGA codec and the WGS84 geodetic/ECEF transform the
//! position reports are built with, and a source table parser.
mod client;
mod config;
mod decoder;
pub mod ecef;
pub mod nmea;
mod session;
pub mod sourcetable;
mod transport;

pub use client::{ClientError, ClientEvent, ClientHandle, NtripClient};
pub use config::{ClientConfig, DEFAULT_PORT, RECONNECT_INTERVAL, SOCKET_TIMEOUT, USER_AGENT};
pub use decoder::{passthrough, DecodeError, DecoderFactory, Passthrough, StreamDecoder};
pub use nmea::{GgaSentence, NmeaError};
pub use session::{ConnectionState, READY_BANNER};
pub use sourcetable::{SourceTableEntry, SourceTableError};
