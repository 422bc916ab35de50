//! Domain event plumbing: the `Event` contract, the envelope events travel in,
//! and the publish/subscribe bus consumers attach to.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
