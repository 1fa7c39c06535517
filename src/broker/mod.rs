//! Brokerage collaborators: where credentials and P/L samples come from.

pub mod http;
pub mod simulated;

pub use http::HttpBroker;
pub use simulated::SimulatedBroker;

use crate::error::{AuthError, FetchError};
use crate::state::CachedCredential;
use crate::threshold::PnlSample;

pub trait CredentialSource {
    /// Obtain a fresh credential from the seed.
    async fn authenticate(&self) -> Result<CachedCredential, AuthError>;

    /// Exchange a credential's refresh token for a new one.
    async fn refresh(&self, credential: &CachedCredential) -> Result<CachedCredential, AuthError>;
}

pub trait PnlSource {
    /// One P/L observation, already normalized to the threshold's kind.
    async fn fetch_pnl(&self, credential: &CachedCredential) -> Result<PnlSample, FetchError>;
}

/// The live broker or the simulated one, picked at startup from `monitor.test_mode`.
pub enum Broker {
    Live(HttpBroker),
    Simulated(SimulatedBroker),
}

impl CredentialSource for Broker {
    async fn authenticate(&self) -> Result<CachedCredential, AuthError> {
        match self {
            Broker::Live(b) => b.authenticate().await,
            Broker::Simulated(b) => b.authenticate().await,
        }
    }

    async fn refresh(&self, credential: &CachedCredential) -> Result<CachedCredential, AuthError> {
        match self {
            Broker::Live(b) => b.refresh(credential).await,
            Broker::Simulated(b) => b.refresh(credential).await,
        }
    }
}

impl PnlSource for Broker {
    async fn fetch_pnl(&self, credential: &CachedCredential) -> Result<PnlSample, FetchError> {
        match self {
            Broker::Live(b) => b.fetch_pnl(credential).await,
            Broker::Simulated(b) => b.fetch_pnl(credential).await,
        }
    }
}
