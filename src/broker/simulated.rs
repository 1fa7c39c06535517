use chrono::{Duration, Utc};

use super::{CredentialSource, PnlSource};
use crate::error::{AuthError, FetchError};
use crate::state::{CachedCredential, Secret};
use crate::threshold::PnlSample;

/// Test-mode broker: a fixed P/L and a credential that never needs the network.
#[derive(Debug, Clone)]
pub struct SimulatedBroker {
    pnl: f64,
}

impl SimulatedBroker {
    pub fn new(pnl: f64) -> Self {
        Self { pnl }
    }
}

impl CredentialSource for SimulatedBroker {
    async fn authenticate(&self) -> Result<CachedCredential, AuthError> {
        let now = Utc::now();
        Ok(CachedCredential {
            token: Secret::new("simulated"),
            refresh_token: Some(Secret::new("simulated-refresh")),
            device_id: "simulated".to_string(),
            account_id: "simulated".to_string(),
            fetched_at: now,
            expires_at: Some(now + Duration::hours(24)),
        })
    }

    async fn refresh(&self, _credential: &CachedCredential) -> Result<CachedCredential, AuthError> {
        self.authenticate().await
    }
}

impl PnlSource for SimulatedBroker {
    async fn fetch_pnl(&self, _credential: &CachedCredential) -> Result<PnlSample, FetchError> {
        Ok(PnlSample::simulated(self.pnl))
    }
}
