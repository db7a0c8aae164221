//! `notewise-events`: typed publish/subscribe.
//!
//! Every component reports observable state changes (job lifecycle, queue state, spend)
//! as an [`Event`] on a shared [`EventBus`]; nothing holds a direct reference to its
//! listeners.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventHandler, SubscriberId, Subscription, SubscriptionHandle};
pub use event::{Event, EventKind};
