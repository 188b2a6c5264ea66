mod client;
mod connection;
mod link;
mod listener;
pub mod protocol;
mod service;

pub use client::{Client, Player};
pub use connection::{Connection, Event};
pub use link::{CloseReason, ConnectionId, ConnectionState, Link, Role, SendError};
pub use listener::ServerSocket;
pub use protocol::{DEFAULT_PORT, ErrorCode, Frame, FrameError, FrameReader, MessageType};
pub use service::{FirstMessageTimer, Game, IdleWatch, Service, admin_notice};
