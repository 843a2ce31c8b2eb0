//! Managed connections to the two peer systems.
//!
//! Each link owns its transport and runs its own lifecycle state machine
//! inside a supervisor task: connect, serve, tear down, back off, reconnect.

pub mod amp;
pub mod hub;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Connection lifecycle state of a link.
///
/// Outbound transport writes only happen in `Ready`. The state cell is owned
/// by its link; the router only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Socket open, authentication not yet confirmed (hub only).
    AwaitingHandshake,
    Ready,
    Closing,
}

/// Shared read view of a link's lifecycle state.
pub type SharedLinkState = Arc<RwLock<LinkState>>;

pub fn new_link_state() -> SharedLinkState {
    Arc::new(RwLock::new(LinkState::Disconnected))
}

pub async fn is_ready(state: &SharedLinkState) -> bool {
    *state.read().await == LinkState::Ready
}

/// Why a link's serve loop ended.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Recoverable: the supervisor backs off and reconnects.
    #[error("connection lost: {0}")]
    Transient(String),
    /// The hub rejected our credential. Retrying cannot succeed; the
    /// process terminates.
    #[error("authentication rejected by hub: {0}")]
    AuthRejected(String),
}

/// Refresh request targeting one zone/attribute or all of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshRequest {
    /// `None` means all configured zones.
    pub zone: Option<String>,
    /// `None` means all attributes.
    pub attribute: Option<crate::zone::Attribute>,
}
