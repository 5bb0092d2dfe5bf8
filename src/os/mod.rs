//! RTOS-style primitives built on tokio: the bounded message queue and the
//! software timer service.

pub mod queue;
pub mod timer;

pub use queue::MessageQueue;
pub use timer::{OsTimer, TimerCallback, TimerInfo, TimerService};
