pub mod message;
pub mod net;
pub mod options;
pub mod representation;
pub mod scheduler;
pub mod token;
pub mod validation;

pub use message::{Message, MessageError};
pub use net::{
    Client, CloseReason, ConnectionState, ErrorCode, Game, Link, Player, SendError, ServerSocket,
    Service,
};
pub use options::Options;
pub use representation::{Representation, RepresentationError};
pub use scheduler::{Registrant, Registration, Scheduler, SchedulerHandle};
pub use token::Token;
pub use validation::Validator;
