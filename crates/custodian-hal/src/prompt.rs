//! The capability prompt effect.
//!
//! Requesting an OS capability is a long, user-driven round trip (system
//! dialog, settings screen, activity result).  The runtime models all of it
//! as one awaitable call: [`CapabilityPrompt::request`] resolves exactly once
//! with the user's decision.  There is deliberately no timeout.

use async_trait::async_trait;
use custodian_types::{CapabilityKind, PermissionRequest};

/// Resolution of a single capability prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Granted,
    Denied,
}

#[async_trait]
pub trait CapabilityPrompt: Send + Sync {
    /// Live grant state of `kind` as reported by the OS.
    fn is_granted(&self, kind: CapabilityKind) -> bool;

    /// Show the system prompt for `request` and wait for the user.
    async fn request(&self, request: &PermissionRequest) -> PromptOutcome;
}
