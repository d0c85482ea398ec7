#![deny(missing_docs)]
//! # Recorder
//! Records the correction stream of an NTRIP mountpoint to hourly files,
//! or lists the source table of a caster.
mod config;
mod store;
use chrono::Utc;
use ntrip_client::{sourcetable, ClientConfig, ClientEvent, NtripClient, READY_BANNER};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use config::{RecorderCfg, RecorderError};
use store::StreamStore;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args: RecorderCfg = argh::from_env();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &RecorderCfg) -> Result<(), RecorderError> {
    let cfg = args.client_config()?;
    if args.save_config {
        let path = config::store_default(&cfg)?;
        log::info!("Saved configuration to {path:?}");
    }
    if args.list {
        list(&cfg)
    } else {
        record(cfg, args)
    }
}

fn list(cfg: &ClientConfig) -> Result<(), RecorderError> {
    for entry in sourcetable::fetch(cfg)? {
        let line = entry
            .fields()
            .skip(1)
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:?}: {line}", entry.kind());
    }
    Ok(())
}

fn record(cfg: ClientConfig, args: &RecorderCfg) -> Result<(), RecorderError> {
    let mut store = StreamStore::new(args.save_dir.clone(), args.compress)?;
    log::info!(
        "Recording {}/{} to {:?}",
        cfg.address(),
        cfg.mountpoint,
        args.save_dir
    );
    let (mut client, events) = NtripClient::new(cfg);
    let handle = client.handle();
    ctrlc::set_handler(move || {
        log::info!("Interrupted, closing");
        handle.close();
    })?;
    client.run()?;

    let mut total = 0usize;
    for event in events.iter() {
        match event {
            ClientEvent::Data(data) => {
                let data = strip_banner(&data);
                if data.is_empty() {
                    continue;
                }
                total += data.len();
                if let Err(e) = store.store(Utc::now(), data) {
                    log::warn!("Failed to store {} bytes: {e}", data.len());
                }
            }
            ClientEvent::Error(e) => log::warn!("{e}"),
            ClientEvent::Close => break,
        }
    }
    log::info!("Recorded {total} bytes");
    Ok(())
}

/// The caster answers with a banner line before the stream proper
fn strip_banner(data: &[u8]) -> &[u8] {
    if !data.starts_with(READY_BANNER) {
        return data;
    }
    let rest = match data.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => &data[pos + 2..],
        None => return &[],
    };
    rest.strip_prefix(b"\r\n").unwrap_or(rest)
}
