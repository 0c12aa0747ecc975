//! Unistore store: the durable backend and the watch broadcaster it feeds.

#![forbid(unsafe_code)]

mod backend;
pub mod broadcast;
mod token;

pub use backend::{Backend, BackendOptions};
pub use broadcast::{Broadcaster, Subscription};
pub use token::ContinueToken;
