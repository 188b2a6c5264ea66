use std::cell::RefCell;
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::message::Message;
use crate::net::connection::{Connection, Event};
use crate::net::link::{CloseReason, ConnectionId, ConnectionState, Link, Role};
use crate::net::protocol::{ErrorCode, Frame};
use crate::options::Options;
use crate::representation::Representation;
use crate::scheduler::{Context, Descriptor, Registrant, Registration};
use crate::token::{ADM, OFF};
use crate::validation::Validator;

/// The game a server's connections talk to. Every service holds the same
/// `Rc<RefCell<dyn Game>>`; the scheduler never borrows it re-entrantly.
pub trait Game {
    fn representation(&self) -> Rc<Representation>;

    /// Handles one syntactically valid message. An error counts against the
    /// sender and is reported back to it.
    fn handle_message(&mut self, link: &Rc<Link>, message: Message) -> anyhow::Result<()>;

    /// Called exactly once per connection when it closes or moves to
    /// another game.
    fn disconnect(&mut self, link: &Link);

    /// Hands the connection to another game after a message, e.g. when a
    /// waiting room starts a match.
    fn reassign(&mut self, _link: &Link) -> Option<Rc<RefCell<dyn Game>>> {
        None
    }
}

/// `ADM ( 'Server' ) ( '<text>' )`
pub fn admin_notice(text: &str) -> Message {
    let mut message = Message::from_tokens([ADM]);
    message.push_group(&Message::text("Server"));
    message.push_group(&Message::text(text));
    message
}

/// Server end of one client connection.
pub struct Service {
    connection: Connection,
    game: Rc<RefCell<dyn Game>>,
    validator: Arc<Validator>,
    validate_incoming: bool,
    errors: u32,
    max_errors: u32,
    null_rep: bool,
    notified: bool,
}

impl Service {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        options: &Options,
        game: Rc<RefCell<dyn Game>>,
        validator: Arc<Validator>,
    ) -> std::io::Result<Self> {
        let link = Link::new(id, stream, Role::Server, options.echo_final)?;
        link.set_representation(game.borrow().representation());
        link.set_syntax_level(options.syntax_level);
        log::info!("{}: connected", link);
        Ok(Self {
            connection: Connection::new(link, options.null_rep),
            game,
            validator,
            validate_incoming: options.validate_incoming,
            errors: 0,
            max_errors: options.max_errors,
            null_rep: options.null_rep,
            notified: false,
        })
    }

    pub fn link(&self) -> &Rc<Link> {
        self.connection.link()
    }

    /// Closes the connection with a Timeout error if no Initial Message
    /// has arrived by the time it fires.
    pub fn first_message_timer(&self, timeout: Duration) -> Registration {
        Registration::after(
            timeout,
            FirstMessageTimer {
                link: Rc::clone(self.link()),
                timeout,
                fired: false,
            },
        )
    }

    pub fn idle_watch(&self, limit: Duration) -> Registration {
        Registration::dynamic(IdleWatch {
            link: Rc::clone(self.link()),
            limit,
        })
    }

    /// Moves the connection to `game`. The old game sees it disconnect;
    /// an open connection is sent the new game's representation.
    pub fn rebind(&mut self, game: Rc<RefCell<dyn Game>>) {
        let link = Rc::clone(self.link());
        self.game.borrow_mut().disconnect(&link);
        let rep = game.borrow().representation();
        link.set_representation(Rc::clone(&rep));
        self.game = game;
        log::info!("{}: moved to another game", link);

        if link.is_open() {
            if let Err(e) = link.write_frame(&Frame::representation(&rep, self.null_rep)) {
                log::warn!("{}: could not send the new representation: {}", link, e);
            }
        }
    }

    fn handle_diplomacy(&mut self, message: Message) {
        let link = Rc::clone(self.link());
        if self.validate_incoming {
            if let Some(reply) =
                self.validator
                    .validate(&message, "client_message", link.syntax_level())
            {
                log::debug!("{}: rejected {} with {}", link, message, reply);
                if let Err(e) = link.send(&reply) {
                    log::warn!("{}: could not send {}: {}", link, reply, e);
                }
                return;
            }
        }

        let text = message.to_string();
        let result = self.game.borrow_mut().handle_message(&link, message);
        if result.is_ok() {
            let next = self.game.borrow_mut().reassign(&link);
            if let Some(game) = next {
                self.rebind(game);
            }
        }
        if let Err(e) = result {
            self.errors += 1;
            log::warn!("{}: error processing {}: {:#}", link, text, e);
            let notice = admin_notice(&format!("Error processing command: {}", text));
            if let Err(e) = link.send(&notice) {
                log::debug!("{}: could not report error: {}", link, e);
            }
            if self.errors > self.max_errors {
                log::warn!("{}: too many errors, disconnecting", link);
                let off = Message::from_tokens([OFF]);
                if let Err(e) = link.send(&off) {
                    log::debug!("{}: could not send {}: {}", link, off, e);
                }
                link.close();
            }
        }
    }
}

impl Registrant for Service {
    fn prefix(&self) -> String {
        self.link().to_string()
    }

    fn run(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        let link = Rc::clone(self.link());
        if link.wants_write() {
            if let Err(e) = link.flush() {
                log::warn!("{}: write failed: {}", link, e);
                link.close_with(CloseReason::Lost);
            }
        }
        for event in self.connection.receive() {
            if let Event::Diplomacy(message) = event {
                self.handle_diplomacy(message);
            }
            if link.state() >= ConnectionState::Closing {
                break;
            }
        }
        if link.is_closed() {
            self.close();
        }
        Ok(())
    }

    fn close(&mut self) {
        let link = Rc::clone(self.link());
        link.close();
        if !self.notified {
            self.notified = true;
            self.game.borrow_mut().disconnect(&link);
        }
    }

    fn closed(&self) -> bool {
        self.link().is_closed()
    }

    fn fileno(&self) -> Option<Descriptor> {
        self.link().fileno()
    }

    fn wants_write(&self) -> bool {
        self.link().wants_write()
    }

    fn time_left(&self, _now: Instant) -> Option<Duration> {
        self.link().close_time_left()
    }
}

/// Retires itself as soon as the handshake is done.
pub struct FirstMessageTimer {
    link: Rc<Link>,
    timeout: Duration,
    fired: bool,
}

impl Registrant for FirstMessageTimer {
    fn prefix(&self) -> String {
        format!("{} first message timer", self.link)
    }

    fn run(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        self.fired = true;
        if self.link.state() == ConnectionState::AwaitingFirst {
            log::warn!("{}: no Initial Message within {:?}", self.link, self.timeout);
            self.link.close_with(CloseReason::Violation(ErrorCode::Timeout));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.fired = true;
    }

    fn closed(&self) -> bool {
        self.fired || self.link.state() != ConnectionState::AwaitingFirst
    }
}

/// Closes a link that has been silent for longer than the limit.
pub struct IdleWatch {
    link: Rc<Link>,
    limit: Duration,
}

impl Registrant for IdleWatch {
    fn prefix(&self) -> String {
        format!("{} idle watch", self.link)
    }

    fn run(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        if self.link.idle_for() >= self.limit {
            log::warn!("{}: idle for {:?}", self.link, self.link.idle_for());
            self.link.close_with(CloseReason::Violation(ErrorCode::Timeout));
        }
        Ok(())
    }

    fn close(&mut self) {}

    fn closed(&self) -> bool {
        self.link.is_closed()
    }

    fn time_left(&self, _now: Instant) -> Option<Duration> {
        Some(self.limit.saturating_sub(self.link.idle_for()))
    }
}
