//! Client for the external tower simulator (§6). The simulator itself is out
//! of scope; this module is the one place that talks HTTP to it, wrapped in
//! the same retry/timeout machinery used for any other flaky dependency.

use crate::config::Config;
use crate::model::Snapshot;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;
use crate::{Backoff, Jitter, ResilienceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Failure modes talking to the tower simulator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TowerClientError {
    #[error("tower simulator returned HTTP {status}")]
    Http { status: u16 },
    #[error("request to tower simulator failed: {0}")]
    Transport(String),
    #[error("could not decode tower simulator response: {0}")]
    Decode(String),
}

/// Power command target: a single site, or the whole fleet.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SitesTarget {
    One(String),
    All,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AntennaSelector {
    A1,
    A2,
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerRequest {
    pub sites: SitesTarget,
    pub state: PowerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct RruRequest {
    pub site: String,
    pub antenna: AntennaSelector,
    pub state: PowerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioRequest {
    pub site: String,
    pub mode: String,
    pub crq_id: String,
}

/// The four tower-simulator operations, behind a trait so Agent B and the
/// Tower Bridge can be tested against a fake implementation (per §10.4).
#[async_trait]
pub trait TowerClient: Send + Sync {
    async fn get_state(&self) -> Result<Snapshot, TowerClientError>;
    async fn power(&self, req: PowerRequest) -> Result<(), TowerClientError>;
    async fn rru(&self, req: RruRequest) -> Result<(), TowerClientError>;
    async fn scenario(&self, req: ScenarioRequest) -> Result<(), TowerClientError>;
}

/// `reqwest`-backed implementation, wrapped in the shared retry/timeout
/// policies (≤2 retries at 1s spacing, 3s per-request timeout).
pub struct HttpTowerClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy<TowerClientError>,
    timeout: TimeoutPolicy,
}

impl HttpTowerClient {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.tower_request_timeout + Duration::from_secs(1))
            .build()
            .expect("reqwest client must build with static config");
        let retry = RetryPolicy::builder()
            .max_attempts(config.tower_request_retries + 1)
            .expect("retry attempts from config are always >= 1")
            .backoff(Backoff::constant(config.tower_request_retry_spacing))
            .with_jitter(Jitter::None)
            .should_retry(|_: &TowerClientError| true)
            .build();
        let timeout = TimeoutPolicy::new(config.tower_request_timeout)
            .expect("configured tower request timeout must be nonzero and under 30 days");
        Self { http, base_url: config.tower_base_url.clone(), retry, timeout }
    }

    async fn call<T, F, Fut>(&self, f: F) -> Result<T, TowerClientError>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, TowerClientError>> + Send,
    {
        let duration = self.timeout.duration();
        let result = self
            .retry
            .execute(|| async {
                match tokio::time::timeout(duration, f()).await {
                    Ok(inner) => inner.map_err(ResilienceError::Inner),
                    Err(_) => Err(ResilienceError::Inner(TowerClientError::Transport(
                        "request timed out".to_string(),
                    ))),
                }
            })
            .await;
        result.map_err(|e| match e {
            ResilienceError::Inner(inner) => inner,
            ResilienceError::RetryExhausted { failures, .. } => failures
                .into_iter()
                .last()
                .unwrap_or_else(|| TowerClientError::Transport("retries exhausted".to_string())),
            other => TowerClientError::Transport(other.to_string()),
        })
    }
}

#[async_trait]
impl TowerClient for HttpTowerClient {
    async fn get_state(&self) -> Result<Snapshot, TowerClientError> {
        self.call(|| async {
            let resp = self
                .http
                .get(format!("{}/state", self.base_url))
                .send()
                .await
                .map_err(|e| TowerClientError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(TowerClientError::Http { status: resp.status().as_u16() });
            }
            resp.json::<Snapshot>().await.map_err(|e| TowerClientError::Decode(e.to_string()))
        })
        .await
    }

    async fn power(&self, req: PowerRequest) -> Result<(), TowerClientError> {
        self.call(|| async {
            let resp = self
                .http
                .post(format!("{}/power", self.base_url))
                .json(&req)
                .send()
                .await
                .map_err(|e| TowerClientError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(TowerClientError::Http { status: resp.status().as_u16() });
            }
            Ok(())
        })
        .await
    }

    async fn rru(&self, req: RruRequest) -> Result<(), TowerClientError> {
        self.call(|| async {
            let resp = self
                .http
                .post(format!("{}/rru", self.base_url))
                .json(&req)
                .send()
                .await
                .map_err(|e| TowerClientError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(TowerClientError::Http { status: resp.status().as_u16() });
            }
            Ok(())
        })
        .await
    }

    async fn scenario(&self, req: ScenarioRequest) -> Result<(), TowerClientError> {
        self.call(|| async {
            let resp = self
                .http
                .post(format!("{}/scenario", self.base_url))
                .json(&req)
                .send()
                .await
                .map_err(|e| TowerClientError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(TowerClientError::Http { status: resp.status().as_u16() });
            }
            Ok(())
        })
        .await
    }
}

/// A fake `TowerClient` for deterministic tests, shared via `Arc<Mutex<..>>`
/// by the test that constructs it so it can assert on calls made and
/// script the snapshot evolution across calls.
pub struct FakeTowerClient {
    pub state: std::sync::Mutex<Snapshot>,
    pub calls: std::sync::Mutex<Vec<String>>,
}

impl FakeTowerClient {
    pub fn new(initial: Snapshot) -> Arc<Self> {
        Arc::new(Self { state: std::sync::Mutex::new(initial), calls: std::sync::Mutex::new(Vec::new()) })
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().expect("fake tower calls mutex poisoned").push(call.into());
    }
}

#[async_trait]
impl TowerClient for FakeTowerClient {
    async fn get_state(&self) -> Result<Snapshot, TowerClientError> {
        self.log("get_state");
        Ok(self.state.lock().expect("fake tower state mutex poisoned").clone())
    }

    async fn power(&self, req: PowerRequest) -> Result<(), TowerClientError> {
        self.log(format!("power({:?})", req.state));
        let mut state = self.state.lock().expect("fake tower state mutex poisoned");
        let on = req.state == PowerState::On;
        match req.sites {
            SitesTarget::All => {
                for site in state.sites.values_mut() {
                    site.mains_on = on;
                }
            }
            SitesTarget::One(id) => {
                if let Some(site) = state.sites.get_mut(&id) {
                    site.mains_on = on;
                    if on {
                        site.site_alive = true;
                    }
                }
            }
        }
        Ok(())
    }

    async fn rru(&self, req: RruRequest) -> Result<(), TowerClientError> {
        self.log(format!("rru({:?},{:?})", req.antenna, req.state));
        let mut state = self.state.lock().expect("fake tower state mutex poisoned");
        if let Some(site) = state.sites.get_mut(&req.site) {
            let service = if req.state == PowerState::On {
                crate::model::Service::Available
            } else {
                crate::model::Service::Unavailable
            };
            match req.antenna {
                AntennaSelector::A1 => site.antenna1 = service,
                AntennaSelector::A2 => site.antenna2 = service,
            }
        }
        Ok(())
    }

    async fn scenario(&self, req: ScenarioRequest) -> Result<(), TowerClientError> {
        self.log(format!("scenario({})", req.mode));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Site;
    use std::collections::{BTreeMap, BTreeSet};

    fn site(mains_on: bool) -> Site {
        Site {
            mains_on,
            site_alive: mains_on,
            battery_percent: 80,
            antenna1: crate::model::Service::Unavailable,
            antenna2: crate::model::Service::Unavailable,
            alarms: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn fake_power_on_brings_site_alive() {
        let mut sites = BTreeMap::new();
        sites.insert("S1".to_string(), site(false));
        let client = FakeTowerClient::new(Snapshot { sites });

        client
            .power(PowerRequest { sites: SitesTarget::One("S1".into()), state: PowerState::On })
            .await
            .unwrap();

        let state = client.get_state().await.unwrap();
        assert!(state.sites["S1"].mains_on);
        assert!(state.sites["S1"].site_alive);
    }

    #[tokio::test]
    async fn fake_rru_toggles_antenna_service() {
        let mut sites = BTreeMap::new();
        sites.insert("S1".to_string(), site(true));
        let client = FakeTowerClient::new(Snapshot { sites });

        client
            .rru(RruRequest { site: "S1".into(), antenna: AntennaSelector::A1, state: PowerState::On })
            .await
            .unwrap();

        let state = client.get_state().await.unwrap();
        assert_eq!(state.sites["S1"].antenna1, crate::model::Service::Available);
    }
}
