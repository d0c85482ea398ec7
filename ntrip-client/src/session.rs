use chrono::Utc;
use log::{debug, info, warn};
use std::{
    sync::{mpsc::Sender, Arc, Mutex, PoisonError},
    time::Instant,
};

use crate::{
    client::{ClientError, ClientEvent},
    config::ClientConfig,
    decoder::{DecoderFactory, StreamDecoder},
    nmea,
    transport::{Connector, Link, Message, Transport, TransportEvent},
};

/// Banner a caster answers a successful stream request with
pub const READY_BANNER: &[u8] = b"ICY 200 OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Where a client is in its connection lifecycle
pub enum ConnectionState {
    /// Not connected, possibly waiting to reconnect
    Idle,
    /// Transport open or opening, caster banner not seen yet
    Connecting,
    /// Caster accepted the request, stream is flowing
    Ready,
    /// A fault is being handled, or reconnection is disabled after one
    Erroring,
    /// Closed by the caller, terminal
    Closed,
}

/// True unless some axis is exactly zero, which stands for "no fix yet"
fn has_fix(position: &[f64; 3]) -> bool {
    position.iter().all(|&v| v != 0.0)
}

/// Connection manager and position reporter. Owns the single transport and
/// decoder of a client; all mutation happens on the event loop driving it.
pub(crate) struct Session {
    config: ClientConfig,
    position: [f64; 3],
    state: ConnectionState,
    // snapshot of `state` for client handles
    shared: Arc<Mutex<ConnectionState>>,
    connector: Box<dyn Connector>,
    decoders: DecoderFactory,
    transport: Option<Box<dyn Transport>>,
    decoder: Option<Box<dyn StreamDecoder>>,
    // transport reported Connected and the handshake went out
    linked: bool,
    generation: u64,
    tx: Sender<Message>,
    events: Sender<ClientEvent>,
    reconnect_at: Option<Instant>,
    report_at: Option<Instant>,
}

impl Session {
    pub fn new(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        decoders: DecoderFactory,
        tx: Sender<Message>,
        events: Sender<ClientEvent>,
        shared: Arc<Mutex<ConnectionState>>,
    ) -> Self {
        Self {
            position: config.position,
            config,
            state: ConnectionState::Idle,
            shared,
            connector,
            decoders,
            transport: None,
            decoder: None,
            linked: false,
            generation: 0,
            tx,
            events,
            reconnect_at: None,
            report_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{:?} -> {:?}", self.state, state);
        }
        self.state = state;
        *self.shared.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// First connection attempt, and the report timer if enabled
    pub fn start(&mut self, now: Instant) {
        self.connect();
        if !self.config.report_interval.is_zero() {
            self.report_at = Some(now + self.config.report_interval);
        }
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.reconnect_at, self.report_at].into_iter().flatten().min()
    }

    /// Closed. Timers still pending would fire into a no-op, so the loop
    /// does not wait for them.
    pub fn is_finished(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn handle(&mut self, msg: Message, now: Instant) {
        match msg {
            Message::Transport { generation, event } => self.on_transport(generation, event, now),
            Message::Write(data) => self.write(&data, now),
            Message::SetPosition(position) => self.position = position,
            Message::Close => self.close(),
        }
    }

    /// Fire the timers that are due at `now`
    pub fn poll(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at {
            if at <= now {
                self.reconnect_at = None;
                if self.state == ConnectionState::Closed {
                    debug!("Client closed, dropping scheduled reconnect");
                } else {
                    self.connect();
                }
            }
        }
        if let Some(at) = self.report_at {
            if at <= now {
                self.tick(at, now);
            }
        }
    }

    fn connect(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.generation += 1;
        info!(
            "Connecting to {} for /{} (attempt {})",
            self.config.address(),
            self.config.mountpoint,
            self.generation
        );
        self.decoder = Some((self.decoders)());
        let link = Link::new(self.generation, self.tx.clone());
        self.transport = Some(self.connector.open(&self.config, link));
        self.linked = false;
        self.set_state(ConnectionState::Connecting);
    }

    fn on_transport(&mut self, generation: u64, event: TransportEvent, now: Instant) {
        if generation != self.generation || self.transport.is_none() {
            debug!("Ignoring {event:?} from released connection {generation}");
            return;
        }
        match event {
            TransportEvent::Connected => {
                self.linked = true;
                debug!("Sending request for /{}", self.config.mountpoint);
                let request = self.config.handshake();
                if let Err(e) = self.send(request.as_bytes()) {
                    self.on_error(e.into(), now);
                }
            }
            TransportEvent::Data(chunk) => {
                let Some(decoder) = self.decoder.as_mut() else {
                    return;
                };
                match decoder.decode(&chunk) {
                    Ok(records) => records.into_iter().for_each(|r| self.on_record(r)),
                    Err(e) => self.on_error(e.into(), now),
                }
            }
            TransportEvent::Timeout => self.on_error(ClientError::Timeout, now),
            TransportEvent::End => self.on_error(ClientError::Ended, now),
            TransportEvent::Error(e) => self.on_error(e.into(), now),
        }
    }

    fn on_record(&mut self, record: Vec<u8>) {
        if self.state == ConnectionState::Connecting && record.starts_with(READY_BANNER) {
            info!("Caster accepted /{}", self.config.mountpoint);
            self.set_state(ConnectionState::Ready);
        }
        self.emit(ClientEvent::Data(record));
    }

    /// Single fault path for the transport and the decoder
    fn on_error(&mut self, err: ClientError, now: Instant) {
        if matches!(self.state, ConnectionState::Erroring | ConnectionState::Closed) {
            debug!("Already handling a fault, ignoring: {err}");
            return;
        }
        self.set_state(ConnectionState::Erroring);
        self.release();
        warn!("Connection to {} failed: {err}", self.config.address());
        self.emit(ClientEvent::Error(err));
        self.reconnect(now);
    }

    fn reconnect(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let interval = self.config.reconnect_interval;
        if interval.is_zero() {
            info!("Reconnection disabled, giving up on {}", self.config.address());
            return;
        }
        self.set_state(ConnectionState::Idle);
        self.reconnect_at = Some(now + interval);
        info!("Reconnecting in {} ms", interval.as_millis());
    }

    fn release(&mut self) {
        self.linked = false;
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
    }

    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("Closing connection to {}", self.config.address());
        self.emit(ClientEvent::Close);
        self.set_state(ConnectionState::Closed);
        self.release();
    }

    /// Dropped silently unless connected and not closed or erroring
    pub fn write(&mut self, data: &[u8], now: Instant) {
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Erroring) || !self.linked {
            debug!("Dropping {} byte write in state {:?}", data.len(), self.state);
            return;
        }
        if let Err(e) = self.send(data) {
            self.on_error(e.into(), now);
        }
    }

    fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.write(data),
            None => Ok(()),
        }
    }

    fn tick(&mut self, at: Instant, now: Instant) {
        if self.state == ConnectionState::Closed {
            debug!("Client closed, stopping position reports");
            self.report_at = None;
            return;
        }
        self.report(now);
        let interval = self.config.report_interval;
        let mut next = at + interval;
        if next <= now {
            next = now + interval;
        }
        self.report_at = Some(next);
    }

    fn report(&mut self, now: Instant) {
        if !has_fix(&self.position) || self.state != ConnectionState::Ready {
            return;
        }
        let sentence = nmea::position_report(self.position, Utc::now());
        match nmea::encode(&sentence) {
            Ok(mut text) => {
                debug!("Reporting position {text}");
                text.push_str("\r\n");
                self.write(text.as_bytes(), now);
            }
            Err(e) => warn!("Could not build position report: {e}"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoder::{self, DecodeError};
    use std::{
        io,
        sync::{
            mpsc::{self, Receiver},
            Arc, Mutex,
        },
        time::Duration,
    };

    #[derive(Debug, Default)]
    struct Wire {
        opened: Vec<u64>,
        writes: Vec<(u64, Vec<u8>)>,
        destroyed: Vec<u64>,
        broken: bool,
    }

    struct MockConnector(Arc<Mutex<Wire>>);

    struct MockTransport {
        generation: u64,
        wire: Arc<Mutex<Wire>>,
    }

    impl Connector for MockConnector {
        fn open(&mut self, _config: &ClientConfig, link: Link) -> Box<dyn Transport> {
            self.0.lock().unwrap().opened.push(link.generation());
            Box::new(MockTransport {
                generation: link.generation(),
                wire: self.0.clone(),
            })
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            let mut wire = self.wire.lock().unwrap();
            if wire.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
            }
            wire.writes.push((self.generation, data.to_vec()));
            Ok(())
        }

        fn destroy(&mut self) {
            self.wire.lock().unwrap().destroyed.push(self.generation);
        }
    }

    struct Failing;

    impl StreamDecoder for Failing {
        fn decode(&mut self, _chunk: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
            Err(DecodeError::Invalid("garbage".into()))
        }

        fn close(&mut self) {}
    }

    const POSITION: [f64; 3] = [-2695649.011, -4298906.870, 3851433.129];

    struct Harness {
        session: Session,
        wire: Arc<Mutex<Wire>>,
        events: Receiver<ClientEvent>,
        t0: Instant,
    }

    impl Harness {
        fn new(config: ClientConfig) -> Self {
            Self::with_decoder(config, decoder::passthrough())
        }

        fn with_decoder(config: ClientConfig, decoders: DecoderFactory) -> Self {
            let wire = Arc::new(Mutex::new(Wire::default()));
            let (tx, _rx) = mpsc::channel();
            let (etx, events) = mpsc::channel();
            let shared = Arc::new(Mutex::new(ConnectionState::Idle));
            let connector = Box::new(MockConnector(wire.clone()));
            let session = Session::new(config, connector, decoders, tx, etx, shared);
            Self {
                session,
                wire,
                events,
                t0: Instant::now(),
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.t0 + Duration::from_millis(ms)
        }

        fn post(&mut self, event: TransportEvent, ms: u64) {
            let generation = self.session.generation;
            self.post_from(generation, event, ms);
        }

        fn post_from(&mut self, generation: u64, event: TransportEvent, ms: u64) {
            let now = self.at(ms);
            self.session.handle(Message::Transport { generation, event }, now);
        }

        /// Start, connect and see the banner
        fn ready(&mut self) {
            self.session.start(self.t0);
            self.post(TransportEvent::Connected, 0);
            self.post(TransportEvent::Data(b"ICY 200 OK\r\n\r\n".to_vec()), 0);
            assert_eq!(self.session.state(), ConnectionState::Ready);
        }

        fn drain(&self) -> Vec<ClientEvent> {
            self.events.try_iter().collect()
        }

        fn writes(&self) -> Vec<(u64, Vec<u8>)> {
            self.wire.lock().unwrap().writes.clone()
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::new("caster.test", 2101, "MOUNT").with_credentials("user", "pass")
    }

    #[test]
    fn handshake_then_ready() {
        let mut h = Harness::new(config());
        h.session.start(h.t0);
        assert_eq!(h.session.state(), ConnectionState::Connecting);
        assert_eq!(h.wire.lock().unwrap().opened, vec![1]);
        assert!(h.writes().is_empty());

        h.post(TransportEvent::Connected, 10);
        assert_eq!(h.writes(), vec![(1, config().handshake().into_bytes())]);
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        h.post(TransportEvent::Data(b"ICY 200 OK\r\n\r\n".to_vec()), 20);
        assert_eq!(h.session.state(), ConnectionState::Ready);
        h.post(TransportEvent::Data(vec![0xd3, 0x00, 0x13]), 30);
        let events = h.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ClientEvent::Data(d) if d == &[0xd3, 0x00, 0x13]));
    }

    #[test]
    fn other_banner_never_ready() {
        let mut h = Harness::new(config());
        h.session.start(h.t0);
        h.post(TransportEvent::Connected, 0);
        h.post(TransportEvent::Data(b"HTTP/1.1 200 OK\r\n\r\n".to_vec()), 0);
        h.post(TransportEvent::Data(b" ICY 200 OK".to_vec()), 0);
        assert_eq!(h.session.state(), ConnectionState::Connecting);
        assert_eq!(h.drain().len(), 2);
    }

    #[test]
    fn duplicate_faults() {
        let mut h = Harness::new(config());
        h.ready();
        h.drain();
        h.post(TransportEvent::Timeout, 100);
        h.post(TransportEvent::End, 100);
        h.post(TransportEvent::Error(io::Error::new(io::ErrorKind::ConnectionReset, "reset")), 100);
        assert_eq!(h.wire.lock().unwrap().destroyed, vec![1]);
        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ClientEvent::Error(ClientError::Timeout)));
        assert_eq!(h.session.state(), ConnectionState::Idle);
        assert_eq!(h.session.next_deadline(), Some(h.at(2100)));
    }

    #[test]
    fn fault_while_erroring_ignored() {
        let mut cfg = config();
        cfg.reconnect_interval = Duration::ZERO;
        let mut h = Harness::new(cfg);
        h.ready();
        h.drain();
        h.session.on_error(ClientError::Timeout, h.at(5));
        h.session.on_error(ClientError::Ended, h.at(5));
        assert_eq!(h.drain().len(), 1);
        assert_eq!(h.wire.lock().unwrap().destroyed, vec![1]);
        assert_eq!(h.session.next_deadline(), None);
    }

    #[test]
    fn reconnect_after_interval() {
        let mut h = Harness::new(config());
        h.ready();
        h.post(TransportEvent::End, 500);
        h.session.poll(h.at(1500));
        assert_eq!(h.wire.lock().unwrap().opened, vec![1]);
        h.session.poll(h.at(2500));
        assert_eq!(h.wire.lock().unwrap().opened, vec![1, 2]);
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        // late events from the first connection are detached
        h.post_from(1, TransportEvent::Data(b"ICY 200 OK".to_vec()), 2600);
        h.post_from(1, TransportEvent::Timeout, 2600);
        assert_eq!(h.session.state(), ConnectionState::Connecting);

        h.post(TransportEvent::Connected, 2700);
        let writes = h.writes();
        assert_eq!(writes.last().unwrap().0, 2);
        h.post(TransportEvent::Data(b"ICY 200 OK\r\n".to_vec()), 2800);
        assert_eq!(h.session.state(), ConnectionState::Ready);
    }

    #[test]
    fn reconnect_disabled() {
        let mut cfg = config();
        cfg.reconnect_interval = Duration::ZERO;
        let mut h = Harness::new(cfg);
        h.ready();
        h.post(TransportEvent::End, 100);
        assert_eq!(h.session.state(), ConnectionState::Erroring);
        h.session.poll(h.at(60_000));
        assert_eq!(h.wire.lock().unwrap().opened, vec![1]);
        let before = h.writes().len();
        h.session.write(b"hello", h.at(60_000));
        assert_eq!(h.writes().len(), before);
    }

    #[test]
    fn close_cancels_reconnect() {
        let mut h = Harness::new(config());
        h.ready();
        h.post(TransportEvent::End, 100);
        h.drain();
        h.session.handle(Message::Close, h.at(200));
        assert!(matches!(h.drain()[..], [ClientEvent::Close]));
        assert!(h.session.is_finished());
        h.session.poll(h.at(5000));
        assert_eq!(h.wire.lock().unwrap().opened, vec![1]);
        assert_eq!(h.session.next_deadline(), None);

        // idempotent, and a late fault stays silent
        h.session.close();
        h.session.on_error(ClientError::Ended, h.at(6000));
        assert!(h.drain().is_empty());
    }

    #[test]
    fn write_gating() {
        let mut h = Harness::new(config());
        h.session.start(h.t0);
        h.session.write(b"early", h.at(0));
        assert!(h.writes().is_empty());
        h.post(TransportEvent::Connected, 0);
        h.session.handle(Message::Write(b"hello".to_vec()), h.at(1));
        assert_eq!(h.writes()[1], (1, b"hello".to_vec()));
        h.session.close();
        h.session.write(b"late", h.at(2));
        assert_eq!(h.writes().len(), 2);
        assert_eq!(h.wire.lock().unwrap().destroyed, vec![1]);
    }

    #[test]
    fn failed_write_is_a_fault() {
        let mut h = Harness::new(config());
        h.ready();
        h.drain();
        h.wire.lock().unwrap().broken = true;
        h.session.write(b"hello", h.at(10));
        assert!(matches!(h.drain()[..], [ClientEvent::Error(ClientError::Io(_))]));
        assert_eq!(h.session.state(), ConnectionState::Idle);
    }

    #[test]
    fn decoder_fault() {
        let failing: DecoderFactory = Box::new(|| Box::new(Failing) as Box<dyn StreamDecoder>);
        let mut h = Harness::with_decoder(config(), failing);
        h.session.start(h.t0);
        h.post(TransportEvent::Connected, 0);
        h.post(TransportEvent::Data(b"ICY 200 OK".to_vec()), 0);
        assert!(matches!(h.drain()[..], [ClientEvent::Error(ClientError::Decode(_))]));
        assert_eq!(h.wire.lock().unwrap().destroyed, vec![1]);
        assert_eq!(h.session.state(), ConnectionState::Idle);
    }

    fn reports(h: &Harness) -> Vec<String> {
        h.writes()
            .into_iter()
            .skip(1)
            .map(|(_, w)| String::from_utf8(w).unwrap())
            .collect()
    }

    #[test]
    fn reports_while_ready() {
        let cfg = config()
            .with_position(POSITION)
            .with_report_interval(Duration::from_millis(1000));
        let mut h = Harness::new(cfg);
        h.ready();
        assert_eq!(h.session.next_deadline(), Some(h.at(1000)));
        h.session.poll(h.at(999));
        assert!(reports(&h).is_empty());
        h.session.poll(h.at(1000));
        h.session.poll(h.at(2000));
        let sent = reports(&h);
        assert_eq!(sent.len(), 2);
        for line in &sent {
            assert!(line.starts_with("$GPGGA,"));
            assert!(line.ends_with("\r\n"));
            let gga = nmea::decode(line);
            assert!(gga.valid);
            let loc = gga.location.unwrap();
            assert!((loc.latitude() - 37.385).abs() < 1e-3);
        }
    }

    #[test]
    fn no_report_without_fix() {
        let cfg = config().with_report_interval(Duration::from_millis(1000));
        let mut h = Harness::new(cfg);
        h.ready();
        h.session.poll(h.at(1000));
        h.session.handle(Message::SetPosition([POSITION[0], 0.0, POSITION[2]]), h.at(1500));
        h.session.poll(h.at(2000));
        assert!(reports(&h).is_empty());
        h.session.handle(Message::SetPosition(POSITION), h.at(2500));
        h.session.poll(h.at(3000));
        assert_eq!(reports(&h).len(), 1);
    }

    #[test]
    fn no_report_before_ready() {
        let cfg = config()
            .with_position(POSITION)
            .with_report_interval(Duration::from_millis(1000));
        let mut h = Harness::new(cfg);
        h.session.start(h.t0);
        h.post(TransportEvent::Connected, 0);
        h.session.poll(h.at(1000));
        assert!(reports(&h).is_empty());
    }

    #[test]
    fn reporter_stops_after_close() {
        let cfg = config()
            .with_position(POSITION)
            .with_report_interval(Duration::from_millis(1000));
        let mut h = Harness::new(cfg);
        h.ready();
        h.session.close();
        assert_eq!(h.session.next_deadline(), Some(h.at(1000)));
        h.session.poll(h.at(1000));
        assert_eq!(h.session.next_deadline(), None);
        assert!(h.session.is_finished());
        assert!(reports(&h).is_empty());
    }

    #[test]
    fn reporter_disabled() {
        let mut h = Harness::new(config().with_position(POSITION));
        h.ready();
        assert_eq!(h.session.next_deadline(), None);
    }
}
