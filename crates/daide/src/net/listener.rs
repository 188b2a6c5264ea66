use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::net::link::ConnectionId;
use crate::net::service::{Game, Service};
use crate::options::Options;
use crate::scheduler::{Context, Descriptor, Registrant, Registration, descriptor};
use crate::validation::Validator;

const FIRST_BIND_RETRY: Duration = Duration::from_millis(125);

/// Listening socket; every accepted connection becomes a `Service`.
pub struct ServerSocket {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    options: Arc<Options>,
    game: Rc<RefCell<dyn Game>>,
    validator: Arc<Validator>,
    next_id: ConnectionId,
}

impl ServerSocket {
    pub fn bind(
        options: Arc<Options>,
        game: Rc<RefCell<dyn Game>>,
        validator: Arc<Validator>,
    ) -> io::Result<Self> {
        let listener = bind_with_retry(&options.address(), options.bind_attempts)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        log::info!("listening on {}", local_addr);
        Ok(Self {
            listener: Some(listener),
            local_addr,
            options,
            game,
            validator,
            next_id: 1,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn accept(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                log::warn!("accept failed: {}", e);
                return Ok(());
            }
        };

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        log::debug!("accepted {} as #{}", addr, id);

        let service = match Service::new(
            id,
            stream,
            &self.options,
            Rc::clone(&self.game),
            Arc::clone(&self.validator),
        ) {
            Ok(service) => service,
            Err(e) => {
                log::warn!("could not set up connection from {}: {}", addr, e);
                return Ok(());
            }
        };
        ctx.register(service.first_message_timer(self.options.first_message_timeout()));
        if let Some(limit) = self.options.peer_idle_timeout() {
            ctx.register(service.idle_watch(limit));
        }
        ctx.register(Registration::polled(service));
        Ok(())
    }
}

fn bind_with_retry(addr: &str, attempts: u32) -> io::Result<TcpListener> {
    let mut delay = FIRST_BIND_RETRY;
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < attempts => {
                log::warn!("{} in use, retrying in {:?}", addr, delay);
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl Registrant for ServerSocket {
    fn prefix(&self) -> String {
        format!("server {}", self.local_addr)
    }

    fn run(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        self.accept(ctx)
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            log::info!("stopped listening on {}", self.local_addr);
        }
    }

    fn closed(&self) -> bool {
        self.listener.is_none()
    }

    fn fileno(&self) -> Option<Descriptor> {
        self.listener.as_ref().and_then(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_retry_gives_up() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = bind_with_retry(&addr, 2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_bind_retry_waits_for_port() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            drop(taken);
        });

        let listener = bind_with_retry(&addr.to_string(), 4).unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
        holder.join().unwrap();
    }
}
