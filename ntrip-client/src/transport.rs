use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use crate::config::ClientConfig;

/// What a transport reports back to the event loop
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Connected,
    Data(Vec<u8>),
    Timeout,
    End,
    Error(io::Error),
}

/// Everything the event loop consumes, in arrival order
#[derive(Debug)]
pub(crate) enum Message {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Write(Vec<u8>),
    SetPosition([f64; 3]),
    Close,
}

/// Posts the events of one connection, tagged with its generation
#[derive(Debug, Clone)]
pub(crate) struct Link {
    generation: u64,
    tx: Sender<Message>,
}

impl Link {
    pub fn new(generation: u64, tx: Sender<Message>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the event loop is gone
    pub fn post(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Message::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// A live connection to the caster
pub(crate) trait Transport: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    /// Force the connection closed. No further events are reported.
    fn destroy(&mut self);
}

/// Opens connections. The returned transport reports through `link`,
/// starting with [`TransportEvent::Connected`] once the socket is up.
pub(crate) trait Connector: Send {
    fn open(&mut self, config: &ClientConfig, link: Link) -> Box<dyn Transport>;
}

#[derive(Debug, Default)]
pub(crate) struct TcpConnector;

impl Connector for TcpConnector {
    fn open(&mut self, config: &ClientConfig, link: Link) -> Box<dyn Transport> {
        let shared = Arc::new(Shared::default());
        let addr = config.address();
        let timeout = config.timeout;
        let worker = shared.clone();
        let fallback = link.clone();
        let spawned = thread::Builder::new()
            .name(format!("ntrip-reader-{}", link.generation()))
            .spawn(move || worker.run(&addr, timeout, link));
        if let Err(e) = spawned {
            fallback.post(TransportEvent::Error(e));
        }
        Box::new(TcpTransport { shared })
    }
}

#[derive(Debug, Default)]
struct Shared {
    stream: Mutex<Option<TcpStream>>,
    destroyed: AtomicBool,
}

impl Shared {
    fn run(&self, addr: &str, timeout: Duration, link: Link) {
        let mut reader = match self.attach(addr, timeout) {
            Ok(Some(reader)) => reader,
            Ok(None) => return,
            Err(e) => {
                self.report(&link, classify(e));
                return;
            }
        };
        log::debug!("Connected to {addr}");
        if !link.post(TransportEvent::Connected) {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    self.report(&link, TransportEvent::End);
                    break;
                }
                Ok(n) => {
                    if !link.post(TransportEvent::Data(buf[..n].to_vec())) {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.report(&link, classify(e));
                    break;
                }
            }
        }
    }

    /// Connect and keep a writer half. `None` if destroyed in the meantime.
    fn attach(&self, addr: &str, timeout: Duration) -> io::Result<Option<TcpStream>> {
        let stream = connect(addr, timeout)?;
        let idle = (!timeout.is_zero()).then_some(timeout);
        stream.set_read_timeout(idle)?;
        stream.set_write_timeout(idle)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if self.destroyed.load(Ordering::Acquire) {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(None);
        }
        *slot = Some(stream);
        Ok(Some(reader))
    }

    fn report(&self, link: &Link, event: TransportEvent) {
        if !self.destroyed.load(Ordering::Acquire) {
            link.post(event);
        }
    }
}

pub(crate) fn connect(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last = None;
    for sa in addr.to_socket_addrs()? {
        let res = if timeout.is_zero() {
            TcpStream::connect(sa)
        } else {
            TcpStream::connect_timeout(&sa, timeout)
        };
        match res {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("No address found for {addr}"))
    }))
}

fn classify(e: io::Error) -> TransportEvent {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportEvent::Timeout,
        _ => TransportEvent::Error(e),
    }
}

#[derive(Debug)]
struct TcpTransport {
    shared: Arc<Shared>,
}

impl Transport for TcpTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut slot = self.shared.stream.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(stream) => stream.write_all(data),
            None => Err(io::Error::new(ErrorKind::NotConnected, "Socket is not connected")),
        }
    }

    fn destroy(&mut self) {
        self.shared.destroyed.store(true, Ordering::Release);
        let mut slot = self.shared.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = slot.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}
