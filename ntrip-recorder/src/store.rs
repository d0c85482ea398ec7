use std::{
    ffi::OsStr,
    fs::{remove_dir_all, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
};

use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};

const EXTENSION: &str = "rtcm";

/// Records the raw correction stream into hourly files under
/// `<root>/<YYYYMMDD>/<YYYYMMDDHH>0000.rtcm`
#[derive(Debug)]
pub struct StreamStore {
    root_dir: PathBuf,
    current_dir: PathBuf,
    last_date: Option<String>,
    last_hour: Option<String>,
    writer: Option<File>,
    compressor: Option<Compressor>,
}

impl StreamStore {
    /// With `compress`, every day directory left behind is packed into
    /// `<YYYYMMDD>.tar.gz` on a background thread and removed.
    pub fn new(root_dir: PathBuf, compress: bool) -> io::Result<Self> {
        std::fs::create_dir_all(&root_dir)?;
        let compressor = if compress {
            Some(Compressor::spawn()?)
        } else {
            None
        };
        Ok(Self {
            root_dir,
            current_dir: PathBuf::new(),
            last_date: None,
            last_hour: None,
            writer: None,
            compressor,
        })
    }

    /// Append `data` to the file covering `tstamp`
    pub fn store(&mut self, tstamp: DateTime<Utc>, data: &[u8]) -> io::Result<()> {
        let date = tstamp.format("%Y%m%d").to_string();
        let hour = tstamp.format("%H").to_string();
        if self.last_date.as_deref() != Some(&date) {
            self.writer = None;
            if self.last_date.is_some() {
                if let Some(compressor) = &self.compressor {
                    compressor.submit(self.current_dir.clone());
                }
            }
            self.current_dir = self.root_dir.join(&date);
            std::fs::create_dir_all(&self.current_dir)?;
            self.last_date = Some(date.clone());
            self.last_hour = None;
        }
        if self.last_hour.as_deref() != Some(&hour) {
            let filename = self
                .current_dir
                .join(format!("{date}{hour}0000.{EXTENSION}"));
            log::info!("Recording to {filename:?}");
            self.writer = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(filename)?,
            );
            self.last_hour = Some(hour);
        }
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(data)?;
                writer.flush()
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "No file writer")),
        }
    }
}

#[derive(Debug)]
struct Compressor {
    tx: mpsc::Sender<Option<PathBuf>>,
    hdl: Option<thread::JoinHandle<()>>,
}

impl Compressor {
    fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Option<PathBuf>>();
        let hdl = thread::Builder::new()
            .name("compressor".into())
            .spawn(move || {
                log::debug!("Compression thread started");
                while let Ok(Some(dir)) = rx.recv() {
                    compress(&dir);
                }
                log::debug!("Compression thread exiting");
            })?;
        Ok(Self { tx, hdl: Some(hdl) })
    }

    fn submit(&self, dir: PathBuf) {
        let _ = self.tx.send(Some(dir));
    }
}

impl Drop for Compressor {
    fn drop(&mut self) {
        if let Some(hdl) = self.hdl.take() {
            let _ = self.tx.send(None);
            let _ = hdl.join();
        }
    }
}

fn compress(dir: &Path) {
    let mut outfile = dir.to_path_buf();
    outfile.set_extension("tar.gz");
    log::info!("Compressing {dir:?} to {outfile:?}...");
    let res = archive(dir, &outfile);
    match res {
        Ok(()) => match remove_dir_all(dir) {
            Ok(()) => log::info!("Compression successful! Deleted {dir:?}"),
            Err(e) => log::warn!("Error deleting directory {dir:?}: {e}"),
        },
        Err(e) => log::warn!("Compression error {e}: {dir:?}"),
    }
}

fn archive(dir: &Path, outfile: &Path) -> io::Result<()> {
    let gz = GzEncoder::new(File::create(outfile)?, Compression::default());
    let mut tar = tar::Builder::new(gz);
    let root = dir.file_name().unwrap_or(OsStr::new("."));
    tar.append_dir_all(root, dir)?;
    tar.into_inner()?.finish()?;
    Ok(())
}
