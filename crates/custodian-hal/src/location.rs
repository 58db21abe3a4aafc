//! One-shot location fixes.

use async_trait::async_trait;
use custodian_types::{CustodianError, LocationSample};

#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Obtain the freshest fix the platform can provide.
    ///
    /// # Errors
    ///
    /// Returns [`CustodianError::LocationUnavailable`] when no provider can
    /// produce a fix (provider disabled, no signal, capability missing).
    async fn current_fix(&self) -> Result<LocationSample, CustodianError>;
}
