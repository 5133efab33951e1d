//! End-to-end orchestration scenarios wiring the Bus, Supervisor, and all
//! three agents together against scripted tower doubles.

use async_trait::async_trait;
use cellwatch_orchestrator::agents::rca::Resolution;
use cellwatch_orchestrator::policy::{Policy, PolicyPatch, PolicyStore, WaysOfWorking};
use cellwatch_orchestrator::prelude::*;
use cellwatch_orchestrator::tower_client::{
    AntennaSelector, PowerRequest, PowerState, RruRequest, ScenarioRequest, SitesTarget, TowerClientError,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.boot_settle = Duration::from_millis(1);
    config.heal_recheck_interval = Duration::from_millis(1);
    config.inter_step_delay = Duration::from_millis(1);
    config.cold_start_sweep = false;
    config
}

fn auto_policy() -> PolicyStore {
    let store = PolicyStore::new(Policy::default());
    store.patch(
        PolicyPatch { ways_of_working: Some(WaysOfWorking::E2eAutomation), ..Default::default() },
        "test",
    );
    store
}

fn outage_site() -> Site {
    Site {
        mains_on: false,
        site_alive: false,
        battery_percent: 80,
        antenna1: Service::Unavailable,
        antenna2: Service::Unavailable,
        alarms: Default::default(),
    }
}

fn supervisor_for(tower: Arc<dyn TowerClient>, policy: PolicyStore, config: &Config) -> Supervisor {
    let bus = Arc::new(IncidentBus::new(config.bus_ring_capacity, config.bus_hydration_count));
    Supervisor::new(config, tower, bus, policy, Arc::new(InstantSleeper))
}

/// A tower double where one named antenna on one named site never actually
/// heals: every `rru` call for it is recorded but silently ignored, so the
/// service stays `Unavailable` no matter how many times Agent B cycles it.
/// Every other call behaves like the ordinary in-memory fake.
struct StuckAntennaTower {
    state: Mutex<Snapshot>,
    stuck_site: String,
    stuck_antenna: AntennaSelector,
    calls: Mutex<Vec<String>>,
}

impl StuckAntennaTower {
    fn new(initial: Snapshot, stuck_site: &str, stuck_antenna: AntennaSelector) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            stuck_site: stuck_site.to_string(),
            stuck_antenna,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TowerClient for StuckAntennaTower {
    async fn get_state(&self) -> Result<Snapshot, TowerClientError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn power(&self, req: PowerRequest) -> Result<(), TowerClientError> {
        self.calls.lock().unwrap().push("power".to_string());
        let mut state = self.state.lock().unwrap();
        let on = req.state == PowerState::On;
        match req.sites {
            SitesTarget::All => {
                for site in state.sites.values_mut() {
                    site.mains_on = on;
                    if on {
                        site.site_alive = true;
                    }
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
        self.calls.lock().unwrap().push(format!("rru({:?},{:?},{:?})", req.site, req.antenna, req.state));
        if req.site == self.stuck_site && req.antenna == self.stuck_antenna {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        if let Some(site) = state.sites.get_mut(&req.site) {
            let service = if req.state == PowerState::On { Service::Available } else { Service::Unavailable };
            match req.antenna {
                AntennaSelector::A1 => site.antenna1 = service,
                AntennaSelector::A2 => site.antenna2 = service,
            }
        }
        Ok(())
    }

    async fn scenario(&self, _req: ScenarioRequest) -> Result<(), TowerClientError> {
        Ok(())
    }
}

/// Scenario 1: a mains outage under an E2E-automation policy is fully
/// mitigated without any human approval step.
#[tokio::test]
async fn scenario_mains_outage_e2e() {
    let mut sites = BTreeMap::new();
    sites.insert("S1".to_string(), outage_site());
    let tower: Arc<dyn TowerClient> =
        cellwatch_orchestrator::tower_client::FakeTowerClient::new(Snapshot { sites });
    let config = fast_config();
    let supervisor = supervisor_for(tower.clone(), auto_policy(), &config);
    supervisor.start().await.unwrap();

    supervisor
        .handle_event(BusEvent::AlarmRaised {
            site_id: "S1".into(),
            alarm: "MainsFailure".into(),
            ts: cellwatch_orchestrator::model::now_iso(),
            source: "test".into(),
            bootstrap: false,
        })
        .await;

    assert!(supervisor.list_pending_approvals().is_empty());
    let state = tower.get_state().await.unwrap();
    assert!(state.sites["S1"].mains_on);
    assert!(state.sites["S1"].site_alive);
    assert_eq!(state.sites["S1"].antenna1, Service::Available);
    assert_eq!(state.sites["S1"].antenna2, Service::Available);
}

/// Scenario 2: the same outage under a human-intervention policy queues an
/// approval and makes no device calls until an operator approves it.
#[tokio::test]
async fn scenario_mains_outage_hitl() {
    let mut sites = BTreeMap::new();
    sites.insert("S1".to_string(), outage_site());
    let tower = cellwatch_orchestrator::tower_client::FakeTowerClient::new(Snapshot { sites });
    let config = fast_config();
    let supervisor: Supervisor = supervisor_for(tower.clone(), PolicyStore::new(Policy::default()), &config);
    supervisor.start().await.unwrap();

    supervisor
        .handle_event(BusEvent::AlarmRaised {
            site_id: "S1".into(),
            alarm: "MainsFailure".into(),
            ts: cellwatch_orchestrator::model::now_iso(),
            source: "test".into(),
            bootstrap: false,
        })
        .await;

    let pending = supervisor.list_pending_approvals();
    assert_eq!(pending.len(), 1);
    assert!(tower.calls.lock().unwrap().iter().all(|c| c == "get_state"));

    let approved = supervisor.resolve_approval(pending[0].id, true).await.unwrap();
    assert_eq!(approved.status, cellwatch_orchestrator::supervisor::ApprovalStatus::Approved);
    assert!(tower.get_state().await.unwrap().sites["S1"].mains_on);
}

/// Scenario 3: noise codes (`unknown`/`heartbeat`/`noop`) never reach
/// correlation, RCA, or mitigation.
#[tokio::test]
async fn scenario_noise_filter() {
    let mut sites = BTreeMap::new();
    sites.insert("S1".to_string(), outage_site());
    let tower: Arc<dyn TowerClient> =
        cellwatch_orchestrator::tower_client::FakeTowerClient::new(Snapshot { sites });
    let config = fast_config();
    let supervisor = supervisor_for(tower, auto_policy(), &config);
    supervisor.start().await.unwrap();

    for alarm in ["unknown", "heartbeat", "noop"] {
        supervisor
            .handle_event(BusEvent::AlarmRaised {
                site_id: "S1".into(),
                alarm: alarm.into(),
                ts: cellwatch_orchestrator::model::now_iso(),
                source: "test".into(),
                bootstrap: false,
            })
            .await;
    }

    assert!(supervisor.rca_agent().cases_for("S1").is_empty());
    assert!(supervisor.list_pending_approvals().is_empty());
}

/// Scenario 4: redelivering the identical event (same type/site/alarm/ts)
/// must not re-trigger orchestration.
#[tokio::test]
async fn scenario_duplicate_delivery_is_idempotent() {
    let mut sites = BTreeMap::new();
    sites.insert("S1".to_string(), outage_site());
    let tower: Arc<dyn TowerClient> =
        cellwatch_orchestrator::tower_client::FakeTowerClient::new(Snapshot { sites });
    let config = fast_config();
    let supervisor = supervisor_for(tower, auto_policy(), &config);
    supervisor.start().await.unwrap();

    let event = BusEvent::AlarmRaised {
        site_id: "S1".into(),
        alarm: "MainsFailure".into(),
        ts: "2025-06-01T12:00:00.000Z".into(),
        source: "test".into(),
        bootstrap: false,
    };
    supervisor.handle_event(event.clone()).await;
    let first_count = supervisor.rca_agent().cases_for("S1").len();

    supervisor.handle_event(event.clone()).await;
    supervisor.handle_event(event).await;
    let after_redelivery = supervisor.rca_agent().cases_for("S1").len();

    assert_eq!(after_redelivery, first_count);
}

/// Scenario 6: an antenna that never comes back regardless of heal attempts
/// stabilizes (not restores) and the RCA agent suggests field dispatch.
#[tokio::test]
async fn scenario_persistent_radio_failure_suggests_dispatch() {
    let mut sites = BTreeMap::new();
    sites.insert(
        "S1".to_string(),
        Site {
            mains_on: true,
            site_alive: true,
            battery_percent: 90,
            antenna1: Service::Unavailable,
            antenna2: Service::Available,
            alarms: Default::default(),
        },
    );
    let tower = StuckAntennaTower::new(Snapshot { sites }, "S1", AntennaSelector::A1);
    let mut config = fast_config();
    config.sweep_max_passes = 1;
    let supervisor = supervisor_for(tower.clone(), auto_policy(), &config);
    supervisor.start().await.unwrap();

    supervisor
        .handle_event(BusEvent::AlarmRaised {
            site_id: "S1".into(),
            alarm: "Antenna.A1.Unavailable".into(),
            ts: cellwatch_orchestrator::model::now_iso(),
            source: "test".into(),
            bootstrap: false,
        })
        .await;

    let state = tower.get_state().await.unwrap();
    assert_eq!(state.sites["S1"].antenna1, Service::Unavailable, "the antenna never actually heals");

    let cases = supervisor.rca_agent().cases_for("S1");
    let last = cases.last().expect("a case must have been recorded");
    assert_eq!(last.resolution, Resolution::Stabilized);
    assert!(last.dispatch_suggested);

    let (subject, body) = supervisor.rca_agent().compose_dispatch_email("S1").await.unwrap();
    assert!(subject.starts_with("[DISPATCH] S1"));
    assert!(body.contains("Antenna.A1.Unavailable"));
}
