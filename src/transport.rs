//! The Transport Listener: owns one endpoint, accepts one peer at a time,
//! and hands out [RawFrame]s read from that peer.
//!
//! ```text
//!                listen()             accept_one()
//! Disconnected ----------> Listening --------------> Connected
//!      ^                       ^                         |
//!      |                       | accept_one()            | peer closed, read error
//!      |                       +-------------------------+
//!      |                                                 | stop requested
//!      +------------------ Draining <--------------------+
//! ```
//!
//! Every blocking wait polls in slices of [POLL_INTERVAL], so a stop request
//! is noticed promptly even while nothing arrives.

use crate::framing::{decode_frame, Decoded, Framing};
use crate::stop::StopSignal;

use log::{debug, info, warn};
use serial2::SerialPort;
use std::{
    fmt,
    io::{self, Read},
    net::{SocketAddr, TcpListener, TcpStream},
    path::PathBuf,
    thread,
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;

/// Longest a single blocking call waits before rechecking the stop signal.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a draining session may keep reading to finish a partial frame.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 4096;

/// Where a [Listener] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No endpoint claimed, or the last session just ended
    Disconnected,
    /// Bound and waiting for a peer
    Listening,
    /// A peer is attached and frames are being read
    Connected,
    /// Stop requested; finishing a partially received frame
    Draining,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One compressed chunk as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Position of the frame within its session, starting at 0
    pub seq: u64,
    /// When the last byte of the frame arrived
    pub received_at: SystemTime,
    /// Payload exactly as framed, still compressed
    pub bytes: Vec<u8>,
}

impl RawFrame {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Everything that can go wrong while listening, accepting or reading.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be claimed
    #[error("cannot bind {endpoint}: {source}")]
    Bind {
        /// Printable name of the endpoint
        endpoint: String,
        /// Why binding failed
        #[source]
        source: io::Error,
    },
    /// The configured wait elapsed with nothing to show for it
    #[error("nothing arrived within {0:?}")]
    Timeout(Duration),
    /// The peer closed the connection between frames
    #[error("peer closed the stream")]
    EndOfStream,
    /// A frame over the size limit was skipped
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced or received size
        len: usize,
        /// Configured limit
        max: usize,
    },
    /// The session ended part way through a frame, which was dropped
    #[error("connection ended {len} bytes into a frame")]
    Truncated {
        /// Bytes of the incomplete frame that had arrived
        len: usize,
    },
    /// The stop signal was raised
    #[error("stop requested")]
    Stopped,
    /// `accept_one` was called before `listen`
    #[error("listener is not bound")]
    NotListening,
    /// Any other failure of the underlying device or socket
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True for errors that only affect the current wait, after which the
    /// same call can simply be made again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::FrameTooLarge { .. }
        )
    }
}

/// An endpoint that peers can connect to.
///
/// Streams handed out by [Transport::poll_accept] must not block a read for
/// much longer than [POLL_INTERVAL]; a read that times out should fail with
/// [io::ErrorKind::WouldBlock] or [io::ErrorKind::TimedOut].
pub trait Transport {
    /// What a connected peer reads from.
    type Stream: Read;

    /// Claims the endpoint.
    fn bind(&mut self) -> io::Result<()>;

    /// Waits up to about [POLL_INTERVAL] for a peer. Returns the peer's
    /// stream and a printable name for it, or `None` if nobody showed up.
    fn poll_accept(&mut self) -> io::Result<Option<(Self::Stream, String)>>;

    /// Releases the endpoint.
    fn unbind(&mut self);

    /// A printable name of the endpoint for logs.
    fn describe(&self) -> String;
}

/// Knobs of a [Listener].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// How long `accept_one` and `read_frame` wait, `None` for forever
    pub timeout: Option<Duration>,
    /// How the byte stream is cut into frames
    pub framing: Framing,
    /// Frames above this many bytes are skipped
    pub max_frame_bytes: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_millis(5000)),
            framing: Framing::default(),
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// A connected peer. Only the [Listener] that accepted it reads from it.
pub struct Session<S> {
    stream: S,
    peer: String,
    buf: Vec<u8>,
    eof: bool,
    discarding: bool,
    // Payload bytes of an oversized frame still to be thrown away.
    skip_remaining: usize,
    next_seq: u64,
}

impl<S: Read> Session<S> {
    fn new(stream: S, peer: String) -> Self {
        Self {
            stream,
            peer,
            buf: Vec::new(),
            eof: false,
            discarding: false,
            skip_remaining: 0,
            next_seq: 0,
        }
    }

    /// Printable name of the peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Bytes received but not yet handed out as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn make_frame(&mut self, bytes: Vec<u8>) -> RawFrame {
        let seq = self.next_seq;
        self.next_seq += 1;
        RawFrame {
            seq,
            received_at: SystemTime::now(),
            bytes,
        }
    }

    /// Pulls the next complete frame out of the buffer, if there is one.
    fn next_buffered(
        &mut self,
        framing: Framing,
        max: usize,
    ) -> Result<Option<RawFrame>, TransportError> {
        match framing {
            Framing::LengthPrefixed => loop {
                if self.skip_remaining > 0 {
                    let n = self.skip_remaining.min(self.buf.len());
                    self.buf.drain(..n);
                    self.skip_remaining -= n;
                    if self.skip_remaining > 0 {
                        return Ok(None);
                    }
                }

                match decode_frame(&self.buf, max) {
                    Decoded::Frame { payload, consumed } => {
                        let bytes = self.buf[payload].to_vec();
                        self.buf.drain(..consumed);
                        return Ok(Some(self.make_frame(bytes)));
                    }
                    Decoded::Incomplete => return Ok(None),
                    Decoded::Garbage { skip } => {
                        warn!(
                            "{} : resync, skipped {} bytes before frame marker",
                            self.peer, skip
                        );
                        self.buf.drain(..skip);
                    }
                    Decoded::TooLarge { len, skip } => {
                        self.buf.drain(..skip);
                        self.skip_remaining = len;
                        return Err(TransportError::FrameTooLarge { len, max });
                    }
                }
            },
            Framing::UntilClose => {
                if self.buf.len() > max {
                    let len = self.buf.len();
                    self.buf.clear();
                    self.discarding = true;
                    return Err(TransportError::FrameTooLarge { len, max });
                }
                if self.eof && !self.buf.is_empty() {
                    let bytes = std::mem::take(&mut self.buf);
                    return Ok(Some(self.make_frame(bytes)));
                }
                Ok(None)
            }
        }
    }

    /// One read from the stream into the buffer. Returns the number of
    /// bytes read; zero means the peer is gone.
    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else if !self.discarding {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }
}

fn is_idle(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Drives a [Transport] through the connection state machine.
pub struct Listener<T: Transport> {
    transport: T,
    options: ListenerOptions,
    state: ConnectionState,
    bound: bool,
}

impl<T: Transport> Listener<T> {
    /// Wraps `transport`; nothing is bound until [Listener::listen].
    pub fn new(transport: T, options: ListenerOptions) -> Self {
        Self {
            transport,
            options,
            state: ConnectionState::Disconnected,
            bound: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(
                "{} : {} -> {}",
                self.transport.describe(),
                self.state,
                state
            );
            self.state = state;
        }
    }

    /// Binds the configured endpoint.
    pub fn listen(&mut self) -> Result<(), TransportError> {
        if !self.bound {
            self.transport
                .bind()
                .map_err(|source| TransportError::Bind {
                    endpoint: self.transport.describe(),
                    source,
                })?;
            self.bound = true;
            info!("{} : listening", self.transport.describe());
        }
        self.set_state(ConnectionState::Listening);
        Ok(())
    }

    /// Blocks until one peer connects.
    pub fn accept_one(&mut self, stop: &StopSignal) -> Result<Session<T::Stream>, TransportError> {
        if !self.bound {
            return Err(TransportError::NotListening);
        }
        self.set_state(ConnectionState::Listening);

        let started = Instant::now();
        loop {
            if stop.is_stopped() {
                return Err(TransportError::Stopped);
            }
            if let Some((stream, peer)) = self.transport.poll_accept()? {
                info!("{} : accepted connection from {}", self.transport.describe(), peer);
                self.set_state(ConnectionState::Connected);
                return Ok(Session::new(stream, peer));
            }
            if let Some(timeout) = self.options.timeout {
                if started.elapsed() >= timeout {
                    return Err(TransportError::Timeout(timeout));
                }
            }
        }
    }

    /// Blocks until the next complete frame from `session` is available.
    ///
    /// After [TransportError::EndOfStream], [TransportError::Truncated],
    /// [TransportError::Stopped] or an i/o error the session is finished and
    /// the listener is Disconnected. A partial frame left at the end of a
    /// session is reported as [TransportError::Truncated] and discarded.
    pub fn read_frame(
        &mut self,
        session: &mut Session<T::Stream>,
        stop: &StopSignal,
    ) -> Result<RawFrame, TransportError> {
        let ListenerOptions {
            timeout,
            framing,
            max_frame_bytes,
        } = self.options;

        let mut idle_since = Instant::now();
        let mut drain_deadline = None;

        loop {
            if let Some(frame) = session.next_buffered(framing, max_frame_bytes)? {
                return Ok(frame);
            }

            if session.eof {
                info!("{} : peer closed the connection", session.peer);
                self.set_state(ConnectionState::Disconnected);
                if !session.buf.is_empty() {
                    let len = session.buf.len();
                    session.buf.clear();
                    return Err(TransportError::Truncated { len });
                }
                return Err(TransportError::EndOfStream);
            }

            if stop.is_stopped() {
                if session.buf.is_empty() {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(TransportError::Stopped);
                }
                let deadline = *drain_deadline.get_or_insert_with(|| Instant::now() + DRAIN_GRACE);
                self.set_state(ConnectionState::Draining);
                if Instant::now() >= deadline {
                    let len = session.buf.len();
                    session.buf.clear();
                    self.set_state(ConnectionState::Disconnected);
                    return Err(TransportError::Truncated { len });
                }
            } else if let Some(timeout) = timeout {
                if idle_since.elapsed() >= timeout {
                    return Err(TransportError::Timeout(timeout));
                }
            }

            match session.fill() {
                Ok(_) => idle_since = Instant::now(),
                Err(e) if is_idle(&e) => {}
                Err(e) => {
                    warn!("{} : read failed: {}", session.peer, e);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(TransportError::Io(e));
                }
            }
        }
    }

    /// Ends a session, returning to Disconnected.
    pub fn disconnect(&mut self, session: Session<T::Stream>) {
        debug!("{} : closing session with {}", self.transport.describe(), session.peer);
        drop(session);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Releases the endpoint. Also happens when the listener is dropped.
    pub fn close(&mut self) {
        if self.bound {
            self.transport.unbind();
            self.bound = false;
            info!("{} : closed", self.transport.describe());
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

impl<T: Transport> Drop for Listener<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A TCP listening socket.
pub struct TcpTransport {
    address: String,
    listener: Option<TcpListener>,
}

impl TcpTransport {
    /// A transport for `address`, such as `0.0.0.0:5000`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            listener: None,
        }
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn bind(&mut self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.address)?;
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        Ok(())
    }

    fn poll_accept(&mut self) -> io::Result<Option<(TcpStream, String)>> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(POLL_INTERVAL))?;
                Ok(Some((stream, addr.to_string())))
            }
            Err(e) if is_idle(&e) => {
                thread::sleep(POLL_INTERVAL / 5);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn unbind(&mut self) {
        self.listener = None;
    }

    fn describe(&self) -> String {
        match self.local_addr() {
            Some(addr) => format!("tcp://{}", addr),
            None => format!("tcp://{}", self.address),
        }
    }
}

/// A serial device. A Bluetooth RFCOMM channel bound with `rfcomm bind`
/// shows up as `/dev/rfcommN` and is served the same way.
///
/// There is no accept on a serial line: the open device is the peer. When
/// the device fails, the next accept reopens it.
pub struct SerialTransport {
    path: PathBuf,
    baud_rate: u32,
    port: Option<SerialPort>,
}

impl SerialTransport {
    /// A transport for the device at `path`.
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }

    fn open(&self) -> io::Result<SerialPort> {
        let mut port = SerialPort::open(&self.path, self.baud_rate)?;
        port.set_read_timeout(POLL_INTERVAL)?;
        Ok(port)
    }
}

impl Transport for SerialTransport {
    type Stream = SerialPort;

    fn bind(&mut self) -> io::Result<()> {
        self.port = Some(self.open()?);
        Ok(())
    }

    fn poll_accept(&mut self) -> io::Result<Option<(SerialPort, String)>> {
        let port = match self.port.take() {
            Some(port) => port,
            None => match self.open() {
                Ok(port) => port,
                Err(e) => {
                    debug!("{} : not ready: {}", self.describe(), e);
                    thread::sleep(POLL_INTERVAL);
                    return Ok(None);
                }
            },
        };
        Ok(Some((port, self.path.display().to_string())))
    }

    fn unbind(&mut self) {
        self.port = None;
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path.display(), self.baud_rate)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::framing::encode_frame;
    use std::collections::VecDeque;
    use std::io::{Cursor, Write};

    /// Reads hand out one scripted chunk at a time; `None` entries act like
    /// a read that timed out after a millisecond.
    pub struct ScriptedStream {
        chunks: VecDeque<Option<Vec<u8>>>,
    }

    impl ScriptedStream {
        pub fn new(chunks: Vec<Option<Vec<u8>>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                None => Ok(0),
                Some(None) => {
                    thread::sleep(Duration::from_millis(1));
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                Some(Some(mut chunk)) => {
                    let n = chunk.len().min(out.len());
                    out[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(Some(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    /// A transport whose peers are queued up in advance.
    #[derive(Default)]
    pub struct MemoryTransport {
        pub peers: VecDeque<ScriptedStream>,
        pub fail_bind: bool,
        pub bound: bool,
    }

    impl MemoryTransport {
        pub fn with_peers(peers: Vec<ScriptedStream>) -> Self {
            Self {
                peers: peers.into(),
                ..Self::default()
            }
        }
    }

    impl Transport for MemoryTransport {
        type Stream = ScriptedStream;

        fn bind(&mut self) -> io::Result<()> {
            if self.fail_bind {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }
            self.bound = true;
            Ok(())
        }

        fn poll_accept(&mut self) -> io::Result<Option<(ScriptedStream, String)>> {
            match self.peers.pop_front() {
                Some(peer) => Ok(Some((peer, "memory".to_owned()))),
                None => {
                    thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            }
        }

        fn unbind(&mut self) {
            self.bound = false;
        }

        fn describe(&self) -> String {
            "memory".to_owned()
        }
    }

    fn options(framing: Framing) -> ListenerOptions {
        ListenerOptions {
            timeout: Some(Duration::from_millis(200)),
            framing,
            max_frame_bytes: 64,
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        encode_frame(payload).unwrap()
    }

    #[test]
    fn state_machine_round_trip() {
        let peer = ScriptedStream::new(vec![Some(frame(b"abc"))]);
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![peer]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        assert_eq!(listener.state(), ConnectionState::Disconnected);

        listener.listen().unwrap();
        assert_eq!(listener.state(), ConnectionState::Listening);

        let mut session = listener.accept_one(&stop).unwrap();
        assert_eq!(listener.state(), ConnectionState::Connected);

        let raw = listener.read_frame(&mut session, &stop).unwrap();
        assert_eq!(raw.bytes, b"abc");
        assert_eq!(raw.seq, 0);

        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::EndOfStream)
        ));
        assert_eq!(listener.state(), ConnectionState::Disconnected);

        listener.close();
        assert!(!listener.transport().bound);
    }

    #[test]
    fn frames_split_across_reads() {
        let mut bytes = frame(b"first");
        bytes.extend(frame(b"second"));
        let chunks = bytes.chunks(3).map(|c| Some(c.to_vec())).collect();
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        assert_eq!(listener.read_frame(&mut session, &stop).unwrap().bytes, b"first");
        let second = listener.read_frame(&mut session, &stop).unwrap();
        assert_eq!(second.bytes, b"second");
        assert_eq!(second.seq, 1);
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let mut bytes = b"noise".to_vec();
        bytes.extend(frame(b"data"));
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(vec![Some(bytes)])]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();
        assert_eq!(listener.read_frame(&mut session, &stop).unwrap().bytes, b"data");
    }

    #[test]
    fn oversized_frame_is_reported_then_stream_resyncs() {
        let mut bytes = frame(&[7; 100]);
        bytes.extend(frame(b"small"));
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(vec![Some(bytes)])]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::FrameTooLarge { len: 100, max: 64 })
        ));
        assert_eq!(listener.read_frame(&mut session, &stop).unwrap().bytes, b"small");
    }

    #[test]
    fn oversized_payload_is_skipped_even_if_it_looks_like_a_header() {
        let mut payload = vec![7; 94];
        payload.extend_from_slice(b"BP");
        payload.extend_from_slice(&20u32.to_le_bytes());
        assert_eq!(payload.len(), 100);

        let mut bytes = frame(&payload);
        bytes.extend(frame(b"small"));
        // Arrives in pieces, so the skip has to carry over between reads.
        let chunks = bytes.chunks(16).map(|c| Some(c.to_vec())).collect();
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::FrameTooLarge { len: 100, max: 64 })
        ));
        let next = listener.read_frame(&mut session, &stop).unwrap();
        assert_eq!(next.bytes, b"small");
        assert_eq!(next.seq, 0);
        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::EndOfStream)
        ));
    }

    #[test]
    fn until_close_collects_whole_connection() {
        let chunks = vec![Some(b"par".to_vec()), None, Some(b"tial".to_vec())];
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::UntilClose),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        assert_eq!(listener.read_frame(&mut session, &stop).unwrap().bytes, b"partial");
        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::EndOfStream)
        ));
    }

    #[test]
    fn until_close_over_limit_is_discarded() {
        let chunks = vec![Some(vec![1; 40]), Some(vec![2; 40]), Some(vec![3; 40])];
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::UntilClose),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::FrameTooLarge { len: 80, max: 64 })
        ));
        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::EndOfStream)
        ));
    }

    #[test]
    fn truncated_frame_at_close_is_reported() {
        let bytes = frame(b"complete");
        let chunks = vec![Some(bytes[..5].to_vec())];
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();
        let err = listener.read_frame(&mut session, &stop).unwrap_err();
        assert!(matches!(err, TransportError::Truncated { len: 5 }));
        assert!(!err.is_retryable());
        assert_eq!(session.buffered(), 0);
        assert_eq!(listener.state(), ConnectionState::Disconnected);
        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::EndOfStream)
        ));
    }

    #[test]
    fn idle_read_times_out() {
        let chunks = (0..1000).map(|_| None).collect();
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            ListenerOptions {
                timeout: Some(Duration::from_millis(1)),
                ..options(Framing::LengthPrefixed)
            },
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        let err = listener.read_frame(&mut session, &stop).unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(err.is_retryable());
        assert_eq!(listener.state(), ConnectionState::Connected);
    }

    #[test]
    fn accept_times_out_without_peers() {
        let mut listener = Listener::new(
            MemoryTransport::default(),
            ListenerOptions {
                timeout: Some(Duration::from_millis(10)),
                ..options(Framing::LengthPrefixed)
            },
        );
        listener.listen().unwrap();
        assert!(matches!(
            listener.accept_one(&StopSignal::new()),
            Err(TransportError::Timeout(_))
        ));
        assert_eq!(listener.state(), ConnectionState::Listening);
    }

    #[test]
    fn accept_before_listen_fails() {
        let mut listener = Listener::new(MemoryTransport::default(), ListenerOptions::default());
        assert!(matches!(
            listener.accept_one(&StopSignal::new()),
            Err(TransportError::NotListening)
        ));
    }

    #[test]
    fn bind_failure_is_bind_error() {
        let transport = MemoryTransport {
            fail_bind: true,
            ..MemoryTransport::default()
        };
        let mut listener = Listener::new(transport, ListenerOptions::default());
        assert!(matches!(listener.listen(), Err(TransportError::Bind { .. })));
        assert_eq!(listener.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stop_while_idle_returns_stopped() {
        let chunks = (0..1000).map(|_| None).collect();
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();
        stop.stop();
        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::Stopped)
        ));
        assert_eq!(listener.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stop_drains_a_partial_frame() {
        let bytes = frame(b"late");
        let chunks = vec![Some(bytes[..4].to_vec()), None, Some(bytes[4..].to_vec())];
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        // Pull the first chunk in, then ask to stop mid-frame.
        session.fill().unwrap();
        stop.stop();

        assert_eq!(listener.read_frame(&mut session, &stop).unwrap().bytes, b"late");
        assert_eq!(listener.state(), ConnectionState::Draining);
        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::Stopped)
        ));
        assert_eq!(listener.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn partial_frame_is_dropped_when_the_drain_grace_runs_out() {
        let bytes = frame(b"never finished");
        let mut chunks = vec![Some(bytes[..9].to_vec())];
        chunks.extend((0..2000).map(|_| None));
        let mut listener = Listener::new(
            MemoryTransport::with_peers(vec![ScriptedStream::new(chunks)]),
            options(Framing::LengthPrefixed),
        );
        let stop = StopSignal::new();
        listener.listen().unwrap();
        let mut session = listener.accept_one(&stop).unwrap();

        session.fill().unwrap();
        stop.stop();

        let started = Instant::now();
        assert!(matches!(
            listener.read_frame(&mut session, &stop),
            Err(TransportError::Truncated { len: 9 })
        ));
        assert!(started.elapsed() >= DRAIN_GRACE);
        assert_eq!(listener.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn tcp_loopback_reconnect() {
        let mut listener = Listener::new(
            TcpTransport::new("127.0.0.1:0"),
            ListenerOptions {
                timeout: Some(Duration::from_secs(5)),
                ..ListenerOptions::default()
            },
        );
        listener.listen().unwrap();
        let addr = listener.transport().local_addr().unwrap();
        let stop = StopSignal::new();

        for round in 0..2u8 {
            let sender = thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.write_all(&encode_frame(&[round; 8]).unwrap()).unwrap();
            });

            let mut session = listener.accept_one(&stop).unwrap();
            let raw = listener.read_frame(&mut session, &stop).unwrap();
            assert_eq!(raw.bytes, vec![round; 8]);
            sender.join().unwrap();

            assert!(matches!(
                listener.read_frame(&mut session, &stop),
                Err(TransportError::EndOfStream)
            ));
            assert_eq!(listener.state(), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn tcp_bind_conflict() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let mut listener = Listener::new(TcpTransport::new(addr.to_string()), ListenerOptions::default());
        assert!(matches!(listener.listen(), Err(TransportError::Bind { .. })));
    }

    #[test]
    fn cursor_streams_work_as_sessions() {
        let mut session = Session::new(Cursor::new(frame(b"xy")), "cursor".to_owned());
        session.fill().unwrap();
        let raw = session
            .next_buffered(Framing::LengthPrefixed, 64)
            .unwrap()
            .unwrap();
        assert_eq!(raw.bytes, b"xy");
    }
}
