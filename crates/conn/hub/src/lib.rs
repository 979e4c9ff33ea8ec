//! Live registry of connections keyed by address, with a single broadcast
//! event stream. The hub never opens sockets itself; dialing goes through
//! an injected [`Dialer`].

mod dialer;
mod events;
mod hub;
mod state;

pub use dialer::{Connection, DialError, Dialer};
pub use events::{HubEvent, HubEventKind};
pub use hub::{Hub, HubEntry, HubError};
pub use state::ConnectionState;
