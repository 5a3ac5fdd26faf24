// #![warn(missing_docs)]

//! An event broker for lightweight networked devices.
//!
//! Devices open long-lived connections over plain TCP (newline-framed) or
//! WebSocket (one frame per message), present the `riotp300` handshake,
//! register a name and group memberships in a short header, and then publish
//! named events and subscribe to events from other devices. Subscriptions
//! carry Simple Filter Expressions (see [filter]) selecting on the event
//! name, the sender name, and the sender's groups; the broker delivers
//! matching events in real time, in the order each sender published them.
//!
//! A pluggable [policy](crate::policy::Policy) decides whether a connection
//! may activate, what it may publish and receive, how large its header may
//! grow, and how protocol violations are handled.
//!
//! A minimal broker:
//!
//! ```no_run
//! use riotp_core::config::default_config;
//! use riotp_core::policy::DefaultPolicy;
//! use riotp_core::Runtime;
//!
//! fn main() -> anyhow::Result<()> {
//!     let cfg = default_config();
//!     let policy = DefaultPolicy::from_config(&cfg);
//!     Runtime::new(cfg, Box::new(policy)).run()
//! }
//! ```
//!
//! The broker is single-threaded by design: every connection runs on one
//! cooperative executor and connections interact (event fanout touches every
//! live connection) without any locking. Do not drive it from a
//! multi-threaded runtime.

pub mod config;
pub mod conn;
pub mod filter;
pub mod policy;
pub mod protocol;
mod runtime;
pub mod transport;

pub use self::conn::{Connection, Event, Registry, TriggerKind};
pub use self::filter::Expr;
pub use self::policy::{Action, CasePolicy, DefaultPolicy, Policy, SecurityEvent};
pub use self::protocol::{ErrorCode, PROTOCOL_NAME};
pub use self::runtime::{Broker, Runtime};

#[macro_use]
extern crate pest_derive;
