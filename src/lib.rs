//! # MeshX - Bluetooth mesh node core
//!
//! MeshX is the platform-independent part of a Bluetooth mesh lighting node:
//! the internal control bus, the element composition, the element and model
//! state machines, the non-volatile store and the application boundary. The
//! mesh stack itself sits behind the [`port::MeshPort`] trait.
//!
//! ## Features
//!
//! - **Control bus**: a bounded queue with a single dispatcher task. Handlers subscribe per message code and event mask.
//! - **Element library**: relay and tunable-white (CWWW) servers and clients, built from a declarative composition list.
//! - **Light CTL**: CTL, temperature, default and range state with the deployed status packings.
//! - **NVS**: a sled-backed namespace with a stability-window auto commit and a product identity check.
//! - **API boundary**: fixed-layout little-endian envelopes to and from the application.
//! - **Test console**: `ut <module> <cmd> <argc> [args…]` commands for NVS, timers and clients.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshx::config::Config;
//! use meshx::node::{MeshxNode, NodeCallbacks};
//! use meshx::port::sim::SimPort;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     let node = MeshxNode::start(config, Arc::new(SimPort::new()), NodeCallbacks::default())?;
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`os`] - message queue and software timers
//! - [`nvs`] - non-volatile store facade
//! - [`control`] - message codes, subscription registry and dispatcher
//! - [`composition`] - elements, models and the composition builder
//! - [`models`] - per-model opcode handling and bus payloads
//! - [`elements`] - element factories and per-instance state
//! - [`api`] - application envelopes and callbacks
//! - [`node`] - ordered bring-up and the shared device context
//! - [`port`] - mesh stack seam and the simulated port
//! - [`txcm`] - acknowledged client request tracking and resend
//! - [`console`] - unit-test console
//! - [`config`] - configuration loading and validation
//!
//! ## Architecture
//!
//! ```text
//!  application ── TO_MESHX ──┐            ┌── TO_APP ──> application
//!                            v            │
//!  mesh port ── FRM_BLE ──> control bus ──┼── TO_HAL ──> hardware
//!      ^                     │   ^        │
//!      └──── TO_BLE ─────────┘   └ EL_STATE_CH / SYSTEM
//! ```

pub mod api;
pub mod composition;
pub mod config;
pub mod console;
pub mod control;
pub mod elements;
pub mod error;
pub mod logutil;
pub mod models;
pub mod node;
pub mod nvs;
pub mod os;
pub mod port;
pub mod txcm;

pub use error::{MeshxError, Result};
