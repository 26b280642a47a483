//! Client-side session handling: one editing session per client, kept honest
//! against server-side lease state.

mod authority;
mod controller;
mod service;
mod watcher;

pub use authority::{Authority, ReadOnly, Signal, reduce};
pub use controller::{Session, SessionConfig, SessionController, SessionState};
pub use service::LeaseService;
pub use watcher::{LeaseWatcher, NotifyWatcher, PollingWatcher};
