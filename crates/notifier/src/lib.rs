//! Notifier turns trigger state-change events into delivered notifications,
//! and watches over the health of the alerting platform it's a part of.
//!
//! Three workers communicate only through a shared [`store::Store`]:
//! the [`events::FetchEventsWorker`] schedules notifications for each event,
//! the [`notifications::NotificationsWorker`] dispatches them as they come due,
//! and the optional [`selfstate::Monitor`] alerts admins when subsystems stall.
pub mod backoff;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod selfstate;
pub mod senders;
pub mod store;

pub use config::Config;
pub use events::FetchEventsWorker;
pub use lifecycle::{Coordinator, Worker};
pub use notifications::{Disposition, NotificationsWorker};
pub use selfstate::Monitor;
pub use senders::{Registry, Sender};
pub use store::{MemoryStore, Store};
