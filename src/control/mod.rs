//! # Control bus
//!
//! The message fabric every other part of the node hangs off. Messages are
//! keyed by a [`Code`] plus an event bitmask; subscribers register a mask per
//! code and are called for every message whose event intersects it.
//!
//! ```text
//!  producers                         ControlBus<C>                  single consumer
//!  ─────────                         ─────────────                  ───────────────
//!  port callbacks ─┐                ┌──────────────┐
//!  timer callbacks ├─ publish() ──▶ │ MessageQueue │ ──▶ meshx_control_task
//!  application ────┤  try_publish() └──────────────┘        │
//!  bus handlers ───┘                                         ▼
//!                                   Registry[code] ── mask ∧ event ≠ 0 ──▶ Handler::on_event
//! ```
//!
//! - `codes`: the closed [`Code`] set and the stable event bits under each.
//! - `registry`: per-code subscription lists in insertion order.
//! - `dispatch`: [`ControlBus`], the envelope type, stats and the dispatcher task.

pub mod codes;
pub mod dispatch;
pub mod registry;

pub use codes::{api, bit, el_state, frm_ble, system, to_ble, to_hal, Code, EventMask, CODE_MAX};
pub use dispatch::{
    start_dispatcher, BusStats, ControlBus, ControlMsg, DispatcherHandle, DEFAULT_MAX_PAYLOAD,
    DEFAULT_QUEUE_DEPTH,
};
pub use registry::{Handler, HandlerRef, Registry};
