use std::io::{self, Read};
use std::rc::Rc;

use crate::message::Message;
use crate::net::link::{CloseReason, ConnectionState, Link, Role};
use crate::net::protocol::{ErrorCode, Frame, FrameError, FrameReader, MessageType};
use crate::representation::Representation;

const READ_CHUNK: usize = 4096;
/// Upper bound on what one `receive` takes off the socket, so a peer that
/// never pauses cannot keep the scheduler from its other registrants.
const MAX_READ_PER_RECEIVE: usize = 16 * READ_CHUNK;

/// What a role learns from one batch of received frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Server side: the peer's Initial Message was accepted and the
    /// Representation Message sent.
    Handshake,
    /// Client side: the server's representation is now in force.
    Representation,
    Diplomacy(Message),
}

/// Receive side of a link: reassembles frames and enforces the
/// handshake ordering for the link's role.
pub struct Connection {
    link: Rc<Link>,
    reader: FrameReader,
    null_rep: bool,
}

impl Connection {
    pub fn new(link: Rc<Link>, null_rep: bool) -> Self {
        Self {
            link,
            reader: FrameReader::new(),
            null_rep,
        }
    }

    pub fn link(&self) -> &Rc<Link> {
        &self.link
    }

    /// Reads what the socket has, up to a fixed amount, and returns the
    /// events from every complete frame. Protocol violations and lost peers
    /// close the link. A closing link only drains its pending output.
    pub fn receive(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        match self.link.state() {
            ConnectionState::Closed => return events,
            ConnectionState::Closing => {
                self.discard_available();
                self.link.progress_close();
                return events;
            }
            _ => {}
        }

        let eof = match self.read_available() {
            Ok(eof) => eof,
            Err(e) => {
                log::warn!("{}: read failed: {}", self.link, e);
                true
            }
        };

        while self.link.state() < ConnectionState::Closing {
            match self.reader.next_frame() {
                Ok(Some(frame)) => {
                    self.link.touch();
                    match self.handle_frame(frame) {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => {}
                        Err(code) => self.violation(code),
                    }
                }
                Ok(None) => break,
                Err(code) => self.violation(code),
            }
        }

        if eof && self.link.state() < ConnectionState::Closing {
            if self.reader.has_partial() {
                log::warn!("{}: connection dropped mid-frame", self.link);
            } else {
                log::info!("{}: peer disconnected without a Final Message", self.link);
            }
            self.link.close_with(CloseReason::Lost);
        }
        events
    }

    /// Returns true once the peer has closed its side. Data left on the
    /// socket keeps it readable for the next round.
    fn read_available(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut taken = 0;
        while taken < MAX_READ_PER_RECEIVE {
            match self.link.stream().read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    taken += n;
                    self.reader.feed(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Throws away input arriving while the link closes. A peer that hangs
    /// up meanwhile gets no more output.
    fn discard_available(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        let mut taken = 0;
        while taken < MAX_READ_PER_RECEIVE {
            match self.link.stream().read(&mut chunk) {
                Ok(0) => {
                    self.link.abandon_close();
                    return;
                }
                Ok(n) => taken += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }

    fn violation(&self, code: ErrorCode) {
        log::warn!("{}: protocol violation {}", self.link, code);
        self.link.close_with(CloseReason::Violation(code));
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Event>, ErrorCode> {
        match frame.kind {
            MessageType::Error => {
                match frame.error_code() {
                    Ok(code) => log::warn!("{}: peer reported error {}", self.link, code),
                    Err(e) => log::warn!("{}: peer reported {}", self.link, e),
                }
                let raw = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                self.link.close_with(CloseReason::PeerError(raw));
                return Ok(None);
            }
            MessageType::Final => {
                log::debug!("{}: peer sent Final Message", self.link);
                self.link.close_with(CloseReason::PeerFinal);
                return Ok(None);
            }
            _ => {}
        }

        match self.link.role() {
            Role::Server => self.handle_server_frame(frame),
            Role::Client => self.handle_client_frame(frame),
        }
    }

    fn handle_server_frame(&mut self, frame: Frame) -> Result<Option<Event>, ErrorCode> {
        let awaiting = self.link.state() == ConnectionState::AwaitingFirst;
        match frame.kind {
            MessageType::Initial if awaiting => {
                frame.check_initial()?;
                let rep = self
                    .link
                    .representation()
                    .ok_or(ErrorCode::EarlyDiplomacy)?;
                self.link.set_state(ConnectionState::Open);
                if let Err(e) = self
                    .link
                    .write_frame(&Frame::representation(&rep, self.null_rep))
                {
                    log::warn!("{}: could not send representation: {}", self.link, e);
                    self.link.close_with(CloseReason::Lost);
                    return Ok(None);
                }
                log::info!("{}: handshake complete", self.link);
                Ok(Some(Event::Handshake))
            }
            _ if awaiting => Err(ErrorCode::InitialNotFirst),
            MessageType::Initial => Err(ErrorCode::DuplicateInitial),
            MessageType::Representation => Err(ErrorCode::ClientRepresentation),
            _ => self.decode(&frame),
        }
    }

    fn handle_client_frame(&mut self, frame: Frame) -> Result<Option<Event>, ErrorCode> {
        let awaiting = self.link.state() == ConnectionState::AwaitingFirst;
        match frame.kind {
            MessageType::Initial => Err(ErrorCode::ServerInitial),
            MessageType::Representation if awaiting => {
                match Representation::decode_payload(&frame.payload) {
                    Ok(rep) => {
                        self.link.set_representation(Rc::new(rep));
                        self.link.set_state(ConnectionState::Open);
                        log::info!("{}: representation received", self.link);
                        Ok(Some(Event::Representation))
                    }
                    Err(e) => {
                        log::error!("{}: unusable representation: {}", self.link, e);
                        self.link.close();
                        Ok(None)
                    }
                }
            }
            MessageType::Representation => Err(ErrorCode::UnexpectedRepresentation),
            _ if awaiting => Err(ErrorCode::RepresentationNotFirst),
            _ => self.decode(&frame),
        }
    }

    fn decode(&mut self, frame: &Frame) -> Result<Option<Event>, ErrorCode> {
        let rep = self
            .link
            .representation()
            .ok_or(ErrorCode::EarlyDiplomacy)?;
        match frame.decode_message(&rep) {
            Ok(message) => {
                log::trace!("{}: received {}", self.link, message);
                Ok(Some(Event::Diplomacy(message)))
            }
            Err(FrameError::Violation(code)) => Err(code),
            Err(e) => {
                log::error!("{}: undecodable message: {}", self.link, e);
                self.link.close();
                Ok(None)
            }
        }
    }
}
