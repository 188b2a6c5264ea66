use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::message::Message;
use crate::net::protocol::{ErrorCode, Frame, FrameError};
use crate::representation::Representation;
use crate::scheduler::{Descriptor, descriptor};
use crate::token::Token;

pub type ConnectionId = u32;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// Unsent output beyond this means the peer is not reading; it is dropped.
pub const MAX_OUTGOING: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Server: waiting for the Initial Message. Client: waiting for the
    /// Representation Message.
    AwaitingFirst,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side; a Final Message is sent.
    Local,
    PeerFinal,
    PeerError(u16),
    /// The peer broke the protocol; an Error Message is sent.
    Violation(ErrorCode),
    Lost,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("peer is not reading, {0} bytes unsent")]
    Backlog(usize),
    #[error("no representation has been established")]
    NoRepresentation,
    #[error("reserved token {0} may not be transmitted")]
    Reserved(Token),
    #[error("token {0} is not in the representation")]
    Unrepresentable(Token),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SendError {
    /// The Error Message code matching this refusal, if there is one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            SendError::NoRepresentation => Some(ErrorCode::EarlyDiplomacy),
            SendError::Reserved(_) => Some(ErrorCode::ReservedToken),
            SendError::Frame(FrameError::Violation(code)) => Some(*code),
            _ => None,
        }
    }
}

/// The writing half of one connection, shared between the owning
/// registrant and whoever answers through it.
pub struct Link {
    id: ConnectionId,
    role: Role,
    peer: SocketAddr,
    stream: TcpStream,
    echo_final: bool,
    outgoing: RefCell<Vec<u8>>,
    representation: RefCell<Option<Rc<Representation>>>,
    state: Cell<ConnectionState>,
    close_reason: Cell<Option<CloseReason>>,
    close_deadline: Cell<Option<Instant>>,
    syntax_level: Cell<i32>,
    last_activity: Cell<Instant>,
}

impl Link {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        role: Role,
        echo_final: bool,
    ) -> io::Result<Rc<Self>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Rc::new(Self {
            id,
            role,
            peer,
            stream,
            echo_final,
            outgoing: RefCell::new(Vec::new()),
            representation: RefCell::new(None),
            state: Cell::new(ConnectionState::AwaitingFirst),
            close_reason: Cell::new(None),
            close_deadline: Cell::new(None),
            syntax_level: Cell::new(0),
            last_activity: Cell::new(Instant::now()),
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn fileno(&self) -> Option<Descriptor> {
        descriptor(&self.stream)
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state.get() == ConnectionState::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get()
    }

    pub fn syntax_level(&self) -> i32 {
        self.syntax_level.get()
    }

    pub fn set_syntax_level(&self, level: i32) {
        self.syntax_level.set(level);
    }

    pub fn representation(&self) -> Option<Rc<Representation>> {
        self.representation.borrow().clone()
    }

    pub fn set_representation(&self, rep: Rc<Representation>) {
        *self.representation.borrow_mut() = Some(rep);
    }

    pub(crate) fn touch(&self) {
        self.last_activity.set(Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.get().elapsed()
    }

    pub fn wants_write(&self) -> bool {
        !self.outgoing.borrow().is_empty()
    }

    /// Sends a Diplomacy Message. Refused before the representation is
    /// known, after closing, and for tokens the peer could not decode.
    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        if matches!(
            self.state.get(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(SendError::Closed);
        }
        let rep = self.representation().ok_or(SendError::NoRepresentation)?;
        if self.state.get() != ConnectionState::Open {
            return Err(SendError::NoRepresentation);
        }
        for token in message {
            if token.is_reserved() {
                return Err(SendError::Reserved(*token));
            }
            if !rep.contains(token) {
                return Err(SendError::Unrepresentable(*token));
            }
        }
        log::trace!("{}: sending {}", self, message);
        self.write_frame(&Frame::diplomacy(message))
    }

    pub(crate) fn write_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let bytes = frame.encode()?;
        self.outgoing.borrow_mut().extend_from_slice(&bytes);
        self.flush()?;
        let pending = self.outgoing.borrow().len();
        if pending > MAX_OUTGOING {
            log::warn!("{}: {} bytes unsent, dropping the peer", self, pending);
            self.close_with(CloseReason::Lost);
            return Err(SendError::Backlog(pending));
        }
        Ok(())
    }

    /// Writes as much buffered output as the socket takes without blocking.
    pub fn flush(&self) -> io::Result<()> {
        let mut outgoing = self.outgoing.borrow_mut();
        let mut written = 0;
        while written < outgoing.len() {
            match (&self.stream).write(&outgoing[written..]) {
                Ok(0) => {
                    outgoing.drain(..written);
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    outgoing.drain(..written);
                    return Err(e);
                }
            }
        }
        outgoing.drain(..written);
        Ok(())
    }

    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Queues the closing frame the reason calls for and starts shutting
    /// the link down. The link stays `Closing` while output is pending;
    /// `progress_close` finishes the job. Later calls do nothing.
    pub fn close_with(&self, reason: CloseReason) {
        if matches!(
            self.state.get(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.state.set(ConnectionState::Closing);
        self.close_reason.set(Some(reason));
        if reason == CloseReason::Lost {
            self.finish_close();
            return;
        }

        let frame = match reason {
            CloseReason::Local => Some(Frame::final_message()),
            CloseReason::PeerFinal | CloseReason::PeerError(_) if self.echo_final => {
                Some(Frame::final_message())
            }
            CloseReason::Violation(code) => Some(Frame::error(code)),
            _ => None,
        };
        if let Some(frame) = frame {
            if let Ok(bytes) = frame.encode() {
                self.outgoing.borrow_mut().extend_from_slice(&bytes);
            }
        }
        self.close_deadline
            .set(Some(Instant::now() + CLOSE_FLUSH_TIMEOUT));
        self.progress_close();
    }

    /// Pushes out pending output of a closing link and shuts it down once
    /// the buffer is empty, the peer fails or the flush deadline passes.
    pub fn progress_close(&self) {
        if self.state.get() != ConnectionState::Closing {
            return;
        }
        if let Err(e) = self.flush() {
            log::debug!("{}: could not flush on close: {}", self, e);
            self.finish_close();
        } else if !self.wants_write() {
            self.finish_close();
        } else if self.close_time_left().is_some_and(|left| left.is_zero()) {
            log::debug!(
                "{}: dropping {} unsent bytes on close",
                self,
                self.outgoing.borrow().len()
            );
            self.finish_close();
        }
    }

    /// Time until a closing link gives up on its pending output.
    pub fn close_time_left(&self) -> Option<Duration> {
        if self.state.get() != ConnectionState::Closing {
            return None;
        }
        self.close_deadline
            .get()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Finishes a close without waiting for pending output.
    pub(crate) fn abandon_close(&self) {
        if self.state.get() == ConnectionState::Closing {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.outgoing.borrow_mut().clear();
        self.close_deadline.set(None);
        self.state.set(ConnectionState::Closed);
        let reason = self.close_reason.get().unwrap_or(CloseReason::Local);
        log::info!("{}: closed ({:?})", self, reason);
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Client => "client",
            Role::Server => "service",
        };
        write!(f, "{} #{} ({})", role, self.id, self.peer)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{BRA, ENG, HLO, KET, Token};
    use std::io::Read;
    use std::net::TcpListener;

    fn pair(echo_final: bool) -> (Rc<Link>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let link = Link::new(1, stream, Role::Server, echo_final).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (link, peer)
    }

    fn read_frame(peer: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        peer.read_exact(&mut header).unwrap();
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut bytes = header.to_vec();
        bytes.resize(4 + len, 0);
        peer.read_exact(&mut bytes[4..]).unwrap();
        bytes
    }

    #[test]
    fn test_send_requires_representation() {
        let (link, _peer) = pair(false);
        let err = link.send(&Message::from_tokens([HLO])).unwrap_err();
        assert!(matches!(err, SendError::NoRepresentation));
        assert_eq!(err.error_code(), Some(ErrorCode::EarlyDiplomacy));
    }

    #[test]
    fn test_send_refuses_reserved_and_unknown() {
        let (link, mut peer) = pair(false);
        link.set_representation(Rc::new(Representation::base()));
        link.set_state(ConnectionState::Open);

        let reserved = Token::new(0x5800, b"RSV");
        let err = link.send(&Message::from_tokens([HLO, reserved])).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::ReservedToken));

        let province = Token::new(0x5000, b"LON");
        assert!(matches!(
            link.send(&Message::from_tokens([province])),
            Err(SendError::Unrepresentable(_))
        ));

        link.send(&Message::from_tokens([HLO, BRA, ENG, KET])).unwrap();
        let bytes = read_frame(&mut peer);
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes.len(), 4 + 8);
    }

    #[test]
    fn test_close_sends_final_once() {
        let (link, mut peer) = pair(false);
        link.close();
        link.close();
        assert!(link.is_closed());
        assert_eq!(link.close_reason(), Some(CloseReason::Local));
        assert_eq!(read_frame(&mut peer), vec![3, 0, 0, 0]);
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert!(matches!(
            link.send(&Message::from_tokens([HLO])),
            Err(SendError::Closed)
        ));
    }

    #[test]
    fn test_violation_sends_error_message() {
        let (link, mut peer) = pair(false);
        link.close_with(CloseReason::Violation(ErrorCode::LengthMismatch));
        assert_eq!(read_frame(&mut peer), vec![4, 0, 0, 2, 0, 0x09]);
    }

    #[test]
    fn test_peer_final_echo_follows_option() {
        let (quiet, mut peer) = pair(false);
        quiet.close_with(CloseReason::PeerFinal);
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        let (echoing, mut peer) = pair(true);
        echoing.close_with(CloseReason::PeerFinal);
        assert_eq!(read_frame(&mut peer), vec![3, 0, 0, 0]);
    }

    fn open_pair() -> (Rc<Link>, TcpStream) {
        let (link, peer) = pair(false);
        link.set_representation(Rc::new(Representation::base()));
        link.set_state(ConnectionState::Open);
        (link, peer)
    }

    fn bulk() -> Message {
        Message::from_tokens(std::iter::repeat_n(HLO, 10_000))
    }

    #[test]
    fn test_close_waits_for_pending_output() {
        let (link, _peer) = open_pair();
        let message = bulk();
        for _ in 0..10_000 {
            if link.wants_write() {
                break;
            }
            link.send(&message).unwrap();
        }
        assert!(link.wants_write());
        for _ in 0..20 {
            link.send(&message).unwrap();
        }

        link.close();
        assert_eq!(link.state(), ConnectionState::Closing);
        assert!(link.close_time_left().is_some());
        assert!(matches!(link.send(&message), Err(SendError::Closed)));

        link.progress_close();
        assert_eq!(link.state(), ConnectionState::Closing);
        std::thread::sleep(CLOSE_FLUSH_TIMEOUT + Duration::from_millis(50));
        link.progress_close();
        assert!(link.is_closed());
        assert!(!link.wants_write());
        assert_eq!(link.close_reason(), Some(CloseReason::Local));
    }

    #[test]
    fn test_unread_backlog_drops_peer() {
        let (link, _peer) = open_pair();
        let message = bulk();
        let mut refused = None;
        for _ in 0..10_000 {
            if let Err(e) = link.send(&message) {
                refused = Some(e);
                break;
            }
        }
        assert!(matches!(refused, Some(SendError::Backlog(n)) if n > MAX_OUTGOING));
        assert!(link.is_closed());
        assert_eq!(link.close_reason(), Some(CloseReason::Lost));
    }
}
