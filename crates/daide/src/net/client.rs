use std::net::{TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::message::Message;
use crate::net::connection::{Connection, Event};
use crate::net::link::{CloseReason, ConnectionId, Link, Role};
use crate::net::protocol::Frame;
use crate::options::Options;
use crate::scheduler::{Context, Descriptor, Registrant};
use crate::validation::Validator;

/// The program behind a client connection.
pub trait Player {
    /// The representation is known; the player may start sending.
    fn register(&mut self, link: &Rc<Link>) -> anyhow::Result<()>;

    fn handle_message(&mut self, link: &Rc<Link>, message: &Message) -> anyhow::Result<()>;

    fn closed(&mut self, _reason: Option<CloseReason>) {}
}

/// Client end of a connection to a server.
pub struct Client<P: Player> {
    connection: Connection,
    player: P,
    validator: Option<Arc<Validator>>,
    notified: bool,
}

impl<P: Player> Client<P> {
    /// Connects and sends the Initial Message.
    pub fn connect(
        id: ConnectionId,
        addr: impl ToSocketAddrs,
        options: &Options,
        player: P,
        validator: Option<Arc<Validator>>,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let link = Link::new(id, stream, Role::Client, options.echo_final)?;
        link.set_syntax_level(options.syntax_level);
        link.write_frame(&Frame::initial())?;
        log::info!("{}: connected", link);
        Ok(Self {
            connection: Connection::new(link, options.null_rep),
            player,
            validator,
            notified: false,
        })
    }

    pub fn link(&self) -> &Rc<Link> {
        self.connection.link()
    }

    pub fn player(&self) -> &P {
        &self.player
    }
}

impl<P: Player> Registrant for Client<P> {
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
            match event {
                Event::Representation => self.player.register(&link)?,
                Event::Diplomacy(message) => {
                    if let Some(validator) = &self.validator {
                        if let Some(reply) =
                            validator.validate(&message, "server_message", link.syntax_level())
                        {
                            log::warn!("{}: server sent invalid message {}", link, reply);
                        }
                    }
                    self.player.handle_message(&link, &message)?;
                }
                Event::Handshake => {}
            }
        }

        if link.is_closed() {
            self.close();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.link().close();
        if !self.notified {
            self.notified = true;
            let reason = self.link().close_reason();
            self.player.closed(reason);
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
