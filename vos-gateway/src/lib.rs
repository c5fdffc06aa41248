//! HTTP control surface for the vos VM controller.
//!
//! Exposes start, stop, status, an engine ping and a server-sent event feed
//! of console output and state transitions.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod routes;
pub mod state;
