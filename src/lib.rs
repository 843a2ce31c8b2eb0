//! Bose ControlSpace / Home Assistant bridge.
//!
//! Keeps zone state (volume, mute, input source) synchronized in both
//! directions between a Bose ControlSpace amplifier, spoken to over a
//! line-oriented TCP text protocol, and a Home Assistant hub, spoken to
//! over its websocket API.
//!
//! The pieces:
//! - each side is a *link* that owns its transport and reconnects on its
//!   own, with tiered backoff ([`links`])
//! - decoded updates flow as observations into a single *router* that
//!   deduplicates against the canonical store and mirrors genuine changes
//!   to the other side ([`router`], [`store`])
//! - committed changes and link transitions are announced on a broadcast
//!   bus for embedding applications ([`bus`])

#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod backoff;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod framing;
pub mod links;
pub mod router;
pub mod store;
pub mod zone;
