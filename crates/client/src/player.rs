use std::rc::Rc;

use daide::token::{ADM, HUH, MAP, OFF, PRN, REJ, YES};
use daide::{CloseReason, Link, Message, Player};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reply(Message),
    Close,
    Nothing,
}

/// Signs on, accepts whatever map the server offers and watches.
pub struct Observer {
    name: Option<(String, String)>,
    map: Option<String>,
    received: usize,
}

impl Observer {
    /// Joins with `OBS`.
    pub fn new() -> Self {
        Self {
            name: None,
            map: None,
            received: 0,
        }
    }

    /// Joins as a named player with `NME`.
    pub fn named(name: &str, version: &str) -> Self {
        Self {
            name: Some((name.to_string(), version.to_string())),
            ..Self::new()
        }
    }

    pub fn greeting(&self) -> Message {
        match &self.name {
            Some((name, version)) => {
                let mut message = Message::from_tokens([daide::token::NME]);
                message.push_group(&Message::text(name));
                message.push_group(&Message::text(version));
                message
            }
            None => Message::from_tokens([daide::token::OBS]),
        }
    }

    pub fn respond(&mut self, message: &Message) -> Action {
        self.received += 1;
        let groups = message.fold();
        match message.first() {
            Some(MAP) => {
                let name = groups.get(1).and_then(Message::as_text).unwrap_or_default();
                log::info!("server offers map {:?}", name);
                self.map = Some(name);
                let mut reply = Message::from_tokens([YES]);
                reply.push_group(message);
                Action::Reply(reply)
            }
            Some(OFF) => {
                log::info!("server asked us to leave");
                Action::Close
            }
            Some(HUH) | Some(PRN) => {
                log::warn!("server could not parse our message: {}", message);
                Action::Nothing
            }
            Some(ADM) => {
                let text = |i: usize| groups.get(i).and_then(Message::as_text).unwrap_or_default();
                log::info!("[{}] {}", text(1), text(2));
                Action::Nothing
            }
            Some(YES) | Some(REJ) => {
                log::info!("{}", message);
                Action::Nothing
            }
            _ => {
                log::debug!("ignoring {}", message);
                Action::Nothing
            }
        }
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

impl Player for Observer {
    fn register(&mut self, link: &Rc<Link>) -> anyhow::Result<()> {
        let greeting = self.greeting();
        log::info!("{}: sending {}", link, greeting);
        link.send(&greeting)?;
        Ok(())
    }

    fn handle_message(&mut self, link: &Rc<Link>, message: &Message) -> anyhow::Result<()> {
        match self.respond(message) {
            Action::Reply(reply) => link.send(&reply)?,
            Action::Close => link.close(),
            Action::Nothing => {}
        }
        Ok(())
    }

    fn closed(&mut self, reason: Option<CloseReason>) {
        log::info!(
            "connection closed after {} messages on map {:?}: {:?}",
            self.received,
            self.map,
            reason
        );
    }
}
