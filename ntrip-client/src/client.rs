use std::{
    io,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Instant,
};
use thiserror::Error;

use crate::{
    config::ClientConfig,
    decoder::{self, DecodeError, DecoderFactory},
    session::{ConnectionState, Session},
    transport::{Connector, Message, TcpConnector},
};

#[derive(Error, Debug)]
/// Faults reported by an [`NtripClient`]
pub enum ClientError {
    /// No data within the socket timeout
    #[error("Socket timed out")]
    Timeout,
    /// The caster closed the connection
    #[error("Socket ended")]
    Ended,
    /// Connecting, reading or writing failed
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
    /// The stream decoder rejected the data
    #[error("Stream decoder failed: {0}")]
    Decode(#[from] DecodeError),
    /// [`NtripClient::run`] was called twice
    #[error("Client is already running")]
    AlreadyRunning,
}

#[derive(Debug)]
/// Notifications delivered to the caller
pub enum ClientEvent {
    /// A record from the stream decoder, the caster banner included
    Data(Vec<u8>),
    /// The connection failed; a reconnect follows unless disabled
    Error(ClientError),
    /// The client was closed
    Close,
}

#[derive(Debug, Clone)]
/// Cloneable control handle for a running client
pub struct ClientHandle {
    tx: Sender<Message>,
    state: Arc<Mutex<ConnectionState>>,
}

impl ClientHandle {
    /// Connection state as last published by the event loop
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send bytes to the caster. Dropped silently while not connected.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        let _ = self.tx.send(Message::Write(data.into()));
    }

    /// Replace the ECEF position used for the next position report
    pub fn set_position(&self, position: [f64; 3]) {
        let _ = self.tx.send(Message::SetPosition(position));
    }

    /// Close the client. No reconnection is attempted afterwards.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }
}

/// An NTRIP client streaming one mountpoint.
///
/// ```no_run
/// use ntrip_client::{ClientConfig, ClientEvent, NtripClient};
///
/// let config = ClientConfig::new("rtk2go.com", 2101, "ACACU")
///     .with_credentials("test@test.com", "test");
/// let (mut client, events) = NtripClient::new(config);
/// client.run().expect("Failed to start client");
/// for event in events {
///     match event {
///         ClientEvent::Data(data) => println!("{} bytes", data.len()),
///         ClientEvent::Error(e) => eprintln!("{e}"),
///         ClientEvent::Close => break,
///     }
/// }
/// ```
pub struct NtripClient {
    handle: ClientHandle,
    pending: Option<(Session, Receiver<Message>)>,
    worker: Option<JoinHandle<()>>,
}

impl NtripClient {
    /// Create a client handing stream chunks through unchanged
    pub fn new(config: ClientConfig) -> (Self, Receiver<ClientEvent>) {
        Self::with_decoder(config, decoder::passthrough())
    }

    /// Create a client framing the stream with decoders from `decoders`
    pub fn with_decoder(config: ClientConfig, decoders: DecoderFactory) -> (Self, Receiver<ClientEvent>) {
        Self::with_connector(config, Box::new(TcpConnector), decoders)
    }

    pub(crate) fn with_connector(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        decoders: DecoderFactory,
    ) -> (Self, Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel();
        let (events_tx, events) = mpsc::channel();
        let state = Arc::new(Mutex::new(ConnectionState::Idle));
        let session = Session::new(config, connector, decoders, tx.clone(), events_tx, state.clone());
        let client = Self {
            handle: ClientHandle { tx, state },
            pending: Some((session, rx)),
            worker: None,
        };
        (client, events)
    }

    /// Start connecting on a background event loop
    pub fn run(&mut self) -> Result<(), ClientError> {
        let (mut session, rx) = self.pending.take().ok_or(ClientError::AlreadyRunning)?;
        let worker = thread::Builder::new()
            .name("ntrip-client".into())
            .spawn(move || {
                session.start(Instant::now());
                event_loop(&mut session, &rx);
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// A handle that can control this client from other threads
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// See [`ClientHandle::state`]
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// See [`ClientHandle::write`]
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        self.handle.write(data);
    }

    /// See [`ClientHandle::set_position`]
    pub fn set_position(&self, position: [f64; 3]) {
        self.handle.set_position(position);
    }

    /// See [`ClientHandle::close`]
    pub fn close(&self) {
        self.handle.close();
    }
}

impl Drop for NtripClient {
    fn drop(&mut self) {
        self.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn event_loop(session: &mut Session, rx: &Receiver<Message>) {
    while !session.is_finished() {
        let msg = match session.next_deadline() {
            Some(at) => {
                let now = Instant::now();
                if at <= now {
                    session.poll(now);
                    continue;
                }
                match rx.recv_timeout(at - now) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };
        session.handle(msg, Instant::now());
    }
    log::debug!("Client event loop finished");
}
