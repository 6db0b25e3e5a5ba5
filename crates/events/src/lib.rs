//! Audit events: typed event trait, stored records and the notification bus.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod record;

pub use bus::{EventBus, Subscription};
pub use event::{Event, EventType};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use record::{AuditEvent, EventPage, NewAuditEvent};
