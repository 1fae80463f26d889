//! cronflow-events: Keyed publish/subscribe bus.
//!
//! Pushes job lifecycle and task progress events to live observers (e.g.
//! WebSocket clients). Delivery is best-effort.

pub mod bus;
pub mod events;

pub use bus::{EventBus, Subscription};
pub use events::BusEvent;
