//! Event notification for the application file system.
//!
//! Provides:
//! - `EventsBus`: publish/subscribe by topic with explicit subscription handles
//! - `InMemoryEventsBus`: bounded per-listener channels with a delivery timeout
//! - `EventsStore`: durable append-only per-topic event log that also fans out live

pub mod bus;
pub mod error;
pub mod store;

pub use bus::{EventsBus, InMemoryEventsBus, ListenerId, Subscription, TopicFilter};
pub use error::EventsError;
pub use store::{EventsStore, StoredEvent};
