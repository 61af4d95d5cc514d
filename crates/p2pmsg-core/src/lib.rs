//! # p2pmsg-core
//!
//! The wire protocol, handshake engine, AEAD record layer, connection
//! manager, event bus, and config for the peer-to-peer secure messenger's
//! core channel (spec §4.C–F, H, I).
//!
//! This crate has no UI dependency: callers drive it through
//! [`connection::ConnectionManager`] and observe it through
//! [`event::EventBus`]/[`event::EventSubscriber`].
//!
//! ## Module structure
//!
//! - [`config`]: typed options with §4.I's defaults
//! - [`frame`]: length-prefixed framing and the ten wire message types
//! - [`handshake`]: the four-step authenticated key agreement state machine
//! - [`record`]: the AEAD record layer — nonces, replay window, rekey
//! - [`connection`]: TCP listener/dialer, reader/writer pipelines, backoff
//! - [`event`]: typed events delivered to the UI
//! - [`error`]: the error taxonomy (§7)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod record;

pub use config::Config;
pub use connection::ConnectionManager;
pub use error::Error;
pub use event::{Event, EventBus, EventSubscriber};
pub use frame::{Frame, MessageType};
pub use handshake::{HandshakeEngine, Role};
pub use record::RecordLayer;
