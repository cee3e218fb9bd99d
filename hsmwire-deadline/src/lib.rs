//! # hsmwire-deadline
//!
//! Bounds the lifetime of outstanding requests.
//!
//! A [`DeadlineCoordinator`] tracks every pending wait that carries a
//! deadline. A single periodic sweep fires the timeout path of expired waits;
//! completing a wait first cancels it. Whichever side removes the wait from
//! the tracked set owns its terminal transition, so a wait ends exactly once.

pub mod coordinator;
pub mod deadline;
pub mod error;

pub use coordinator::{CoordinatorConfig, DeadlineCoordinator, Delivery, RequestMeta, WaitHandle};
pub use deadline::Deadline;
pub use error::DeadlineError;
