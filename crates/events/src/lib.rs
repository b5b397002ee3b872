//! Stream events and the keyed event bus.
//!
//! Everything observable about in-flight work (a single `search`/`scrape` call
//! or a whole bulk job) is expressed as a [`StreamEvent`] published on an
//! [`EventBus`] under a stream id.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, Subscription};
pub use envelope::StreamEvent;
pub use event::{EventPayload, LogLevel, TaskProgress};
pub use in_memory_bus::InMemoryEventBus;
