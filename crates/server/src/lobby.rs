use std::collections::HashMap;
use std::rc::Rc;

use anyhow::bail;
use daide::net::ConnectionId;
use daide::token::{ADM, IAM, MAP, MDF, NME, OBS, REJ, YES};
use daide::{Game, Link, Message, Representation};

pub const MAP_NAME: &str = "STANDARD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seat {
    Player { name: String, version: String },
    Observer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Sender(Message),
    Everyone(Message),
}

/// Waiting room: clients sign on as players or observers and may chat
/// through admin messages. No game is ever started.
pub struct Lobby {
    representation: Rc<Representation>,
    seats: HashMap<ConnectionId, Seat>,
    links: HashMap<ConnectionId, Rc<Link>>,
}

impl Lobby {
    pub fn new() -> Self {
        Self {
            representation: Rc::new(Representation::standard().clone()),
            seats: HashMap::new(),
            links: HashMap::new(),
        }
    }

    pub fn seat(&self, id: ConnectionId) -> Option<&Seat> {
        self.seats.get(&id)
    }

    pub fn players(&self) -> usize {
        self.seats
            .values()
            .filter(|s| matches!(s, Seat::Player { .. }))
            .count()
    }

    /// Decides the answers to one message from connection `id`.
    pub fn answer(&mut self, id: ConnectionId, message: &Message) -> anyhow::Result<Vec<Reply>> {
        let Some(command) = message.first() else {
            bail!("empty message");
        };
        let joined = self.seats.contains_key(&id);

        let replies = match command {
            NME | OBS if joined => vec![Reply::Sender(answer(REJ, message))],
            NME => {
                let groups = message.fold();
                let text = |i: usize| groups.get(i).and_then(Message::as_text).unwrap_or_default();
                let (name, version) = (text(1), text(2));
                self.seats.insert(id, Seat::Player { name, version });
                log::info!("#{} joined, {} players", id, self.players());
                vec![
                    Reply::Sender(answer(YES, message)),
                    Reply::Sender(map_message()),
                ]
            }
            OBS => {
                log::info!("#{} joined as an observer", id);
                self.seats.insert(id, Seat::Observer);
                vec![
                    Reply::Sender(answer(YES, message)),
                    Reply::Sender(map_message()),
                ]
            }
            // Nobody has a power to take over yet.
            IAM => vec![Reply::Sender(answer(REJ, message))],
            MAP => vec![Reply::Sender(map_message())],
            MDF => vec![Reply::Sender(answer(REJ, message))],
            YES | REJ => {
                log::debug!("#{} acknowledged: {}", id, message);
                Vec::new()
            }
            ADM if !joined => bail!("admin message before joining"),
            ADM => vec![Reply::Everyone(message.clone())],
            _ if !joined => bail!("{} before joining", command),
            _ => vec![Reply::Sender(answer(REJ, message))],
        };
        Ok(replies)
    }
}

impl Default for Lobby {
    fn default() -> Self {
        Self::new()
    }
}

impl Game for Lobby {
    fn representation(&self) -> Rc<Representation> {
        Rc::clone(&self.representation)
    }

    fn handle_message(&mut self, link: &Rc<Link>, message: Message) -> anyhow::Result<()> {
        let replies = self.answer(link.id(), &message)?;
        if self.seat(link.id()).is_some() {
            self.links
                .entry(link.id())
                .or_insert_with(|| Rc::clone(link));
        }

        for reply in replies {
            match reply {
                Reply::Sender(reply) => {
                    if let Err(e) = link.send(&reply) {
                        log::warn!("{}: could not send {}: {}", link, reply, e);
                    }
                }
                Reply::Everyone(reply) => {
                    for peer in self.links.values().filter(|l| l.is_open()) {
                        if let Err(e) = peer.send(&reply) {
                            log::warn!("{}: could not send {}: {}", peer, reply, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, link: &Link) {
        self.links.remove(&link.id());
        if let Some(seat) = self.seats.remove(&link.id()) {
            log::info!("{} left the lobby ({:?})", link, seat);
        }
    }
}

/// `<token> ( message )`
fn answer(token: daide::Token, message: &Message) -> Message {
    let mut reply = Message::from_tokens([token]);
    reply.push_group(message);
    reply
}

fn map_message() -> Message {
    let mut message = Message::from_tokens([MAP]);
    message.push_group(&Message::text(MAP_NAME));
    message
}
