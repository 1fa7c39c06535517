//! Live brokerage client.
//!
//! Authentication reads the seed credential produced by the external token tool.
//! Refresh and P/L fetch go over HTTPS with the `access_token`/`did` headers the
//! brokerage expects.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use super::{CredentialSource, PnlSource};
use crate::error::{AuthError, FetchError};
use crate::state::{CachedCredential, Secret};
use crate::threshold::{PnlSample, SampleSource, ThresholdKind};

/// Lifetime granted to a refreshed credential.
const REFRESHED_TTL_HOURS: i64 = 24;

/// Balance fields tried in order.
const BALANCE_FIELDS: [&str; 3] = ["totalCashValue", "netLiquidationValue", "futureBuyingPower"];

pub struct HttpBroker {
    client: reqwest::Client,
    summary_url: String,
    refresh_url: String,
    seed_path: PathBuf,
    kind: ThresholdKind,
}

impl HttpBroker {
    pub fn new(
        summary_url: impl Into<String>,
        refresh_url: impl Into<String>,
        seed_path: PathBuf,
        kind: ThresholdKind,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pnl-guard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            summary_url: summary_url.into(),
            refresh_url: refresh_url.into(),
            seed_path,
            kind,
        })
    }
}

/// Seed credential file layout, as written by the token tool.
#[derive(Debug, Deserialize)]
struct SeedCredential {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_expiry: Option<String>,
    user_id: String,
    device_id: String,
}

impl SeedCredential {
    fn into_credential(self, now: DateTime<Utc>) -> CachedCredential {
        CachedCredential {
            token: Secret::new(self.access_token),
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
            device_id: self.device_id,
            account_id: self.user_id,
            fetched_at: now,
            expires_at: self.token_expiry.as_deref().and_then(parse_expiry),
        }
    }
}

/// RFC 3339, or a bare local timestamp as the token tool writes it.
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl CredentialSource for HttpBroker {
    async fn authenticate(&self) -> Result<CachedCredential, AuthError> {
        let raw = match tokio::fs::read_to_string(&self.seed_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::MissingSeed {
                    path: self.seed_path.clone(),
                })
            }
            Err(e) => {
                return Err(AuthError::MalformedSeed {
                    path: self.seed_path.clone(),
                    details: e.to_string(),
                })
            }
        };
        let seed: SeedCredential =
            serde_json::from_str(&raw).map_err(|e| AuthError::MalformedSeed {
                path: self.seed_path.clone(),
                details: e.to_string(),
            })?;
        Ok(seed.into_credential(Utc::now()))
    }

    async fn refresh(&self, credential: &CachedCredential) -> Result<CachedCredential, AuthError> {
        let refresh_token = credential
            .refresh_token
            .as_ref()
            .ok_or(AuthError::NoRefreshToken)?;
        let body = serde_json::json!({
            "refreshToken": refresh_token.expose(),
            "deviceId": credential.device_id,
        });
        let response = self
            .client
            .post(&self.refresh_url)
            .header("access_token", credential.token.expose())
            .header("did", &credential.device_id)
            .json(&body)
            .send()
            .await
            .map_err(AuthError::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }
        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

        let now = Utc::now();
        Ok(CachedCredential {
            token: Secret::new(parsed.access_token),
            refresh_token: parsed
                .refresh_token
                .map(Secret::new)
                .or_else(|| credential.refresh_token.clone()),
            device_id: credential.device_id.clone(),
            account_id: credential.account_id.clone(),
            fetched_at: now,
            expires_at: Some(now + Duration::hours(REFRESHED_TTL_HOURS)),
        })
    }
}

impl PnlSource for HttpBroker {
    async fn fetch_pnl(&self, credential: &CachedCredential) -> Result<PnlSample, FetchError> {
        let response = self
            .client
            .get(&self.summary_url)
            .query(&[("secAccountId", credential.account_id.as_str())])
            .header("access_token", credential.token.expose())
            .header("did", &credential.device_id)
            .send()
            .await
            .map_err(FetchError::Network)?;

        check_status(response.status())?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        parse_summary(&payload, self.kind, Utc::now())
    }
}

fn check_status(status: StatusCode) -> Result<(), FetchError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Unauthorized {
            status: status.as_u16(),
        }),
        s if s.is_success() => Ok(()),
        s => Err(FetchError::Http { status: s.as_u16() }),
    }
}

/// Extract P/L and balance from an account summary payload.
///
/// PERCENT samples carry `pnl / balance * 100` as their value.
fn parse_summary(
    payload: &Value,
    kind: ThresholdKind,
    observed_at: DateTime<Utc>,
) -> Result<PnlSample, FetchError> {
    let capital = payload
        .get("capital")
        .ok_or_else(|| FetchError::Malformed("missing capital section".to_string()))?;
    let pnl = capital
        .get("unrealizedProfitLoss")
        .and_then(number)
        .ok_or_else(|| FetchError::Malformed("missing capital.unrealizedProfitLoss".to_string()))?;
    let balance = BALANCE_FIELDS
        .iter()
        .find_map(|field| capital.get(*field).and_then(number));

    let value = match kind {
        ThresholdKind::Dollar => pnl,
        ThresholdKind::Percent => match balance {
            Some(b) if b != 0.0 => pnl / b * 100.0,
            Some(_) => return Err(FetchError::ZeroBalance),
            None => {
                return Err(FetchError::Malformed(
                    "no balance field for percent threshold".to_string(),
                ))
            }
        },
    };

    Ok(PnlSample {
        value,
        observed_at,
        source: SampleSource::Live,
        balance,
    })
}

/// The API reports amounts as JSON numbers or numeric strings.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
