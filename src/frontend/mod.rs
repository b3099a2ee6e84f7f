//! Client-facing listener.
//!
//! Accepts connections and hands each one to the splicer in its own tracked task.

mod listener;

pub use listener::{is_transient_accept_error, AcceptBackoff, FrontendListener, ListenerError};
