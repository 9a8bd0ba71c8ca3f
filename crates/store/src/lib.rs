//! Durable session/message/event storage plus volatile runtime state.

mod store;

pub use store::{SessionStore, Subscription};
