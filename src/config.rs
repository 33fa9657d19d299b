//! Engine configuration.
//!
//! [`EngineConfig`] carries the values a connection advertises during the
//! handshake and the policies its sessions apply. A single instance is
//! shared by every connection the server accepts.

use crate::codec::{DEFAULT_MAX_FRAME_SIZE, clamp_frame_size};

/// How an inbound `Disposition` selects the outbound deliveries it settles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispositionMode {
    /// Each disposition settles exactly one delivery: the oldest outstanding
    /// one, whatever `[first, last]` range the frame declares.
    #[default]
    FifoHead,
    /// Each disposition settles every outstanding delivery whose id lies in
    /// the frame's `[first, last]` range.
    Range,
}

/// Settings shared by all connections of a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Container identifier sent in the server's `Open`.
    pub container_id: String,
    /// Largest frame the server accepts.
    pub max_frame_size: u32,
    /// Highest link handle a session accepts.
    pub handle_max: u32,
    /// Session incoming and outgoing transfer window.
    pub session_window: u32,
    /// Credit granted to a remote sender on each publish link.
    pub publish_credit: u32,
    /// Disposition settlement policy.
    pub disposition_mode: DispositionMode,
    /// Refuse connections that skip the SASL layer.
    pub require_sasl: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_id: "amqpframe".to_owned(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handle_max: 255,
            session_window: 2048,
            publish_credit: 100,
            disposition_mode: DispositionMode::FifoHead,
            require_sasl: false,
        }
    }
}

impl EngineConfig {
    /// Set the container identifier.
    #[must_use]
    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }

    /// Set the largest accepted frame, clamped to the protocol minimum.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = clamp_frame_size(max_frame_size);
        self
    }

    /// Set the credit granted to remote senders; at least one.
    #[must_use]
    pub fn with_publish_credit(mut self, credit: u32) -> Self {
        self.publish_credit = credit.max(1);
        self
    }

    /// Set the disposition settlement policy.
    #[must_use]
    pub fn with_disposition_mode(mut self, mode: DispositionMode) -> Self {
        self.disposition_mode = mode;
        self
    }

    /// Require peers to authenticate through SASL.
    #[must_use]
    pub fn require_sasl(mut self, required: bool) -> Self {
        self.require_sasl = required;
        self
    }
}
