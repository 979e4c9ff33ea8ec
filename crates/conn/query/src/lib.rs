//! Read-only joined view over the address book, hub, and staging pools,
//! with the composable filters the scheduler's policy passes are built on.

mod predicates;
mod query;

pub use predicates::{group_key, passes_exp_backoff};
pub use query::{Origin, PeerQuery, Query};
