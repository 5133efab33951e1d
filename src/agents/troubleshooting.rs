//! Agent B — Troubleshooting. Builds and (policy permitting) executes a
//! mitigation plan for a site, including the bounded radio-heal loop and
//! post-plan alarm sweeps (§4.6).

use super::{Agent, AgentStatus};
use crate::model::{Service, Site};
use crate::policy::PolicyStore;
use crate::sleeper::Sleeper;
use crate::tower_client::{AntennaSelector, PowerRequest, PowerState, RruRequest, SitesTarget, TowerClient};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timing and attempt-budget knobs Agent B needs from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct MitigationTiming {
    pub boot_settle: Duration,
    pub heal_recheck_interval: Duration,
    pub inter_step_delay: Duration,
    pub heal_max_attempts: usize,
    pub sweep_max_passes: usize,
}

/// A single planned or executed mitigation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    PowerOn,
    RruEnsure(AntennaSelector),
    RruOff(AntennaSelector),
}

/// Outcome of [`TroubleshootingAgent::mitigate_site`].
#[derive(Debug, Clone)]
pub enum MitigationOutcome {
    /// Lifecycle refusal: the agent isn't running.
    NotRunning,
    /// The requested site has no known state.
    SiteNotFound,
    /// Policy requires human sign-off before acting; the caller should enqueue
    /// an approval with the returned plan.
    ApprovalRequired { plan: Vec<PlanStep>, alarms: BTreeSet<String>, site_id: String },
    /// Execution ran (fully automated); `all_clear` reflects whether every
    /// detected alarm cleared by the end of the sweep budget.
    Completed {
        site_id: String,
        actions_taken: Vec<String>,
        cleared_alarms: BTreeSet<String>,
        remaining_alarms: BTreeSet<String>,
        passes: usize,
        all_clear: bool,
    },
}

/// Plan construction from a site snapshot (§4.6.2), ordered.
fn build_plan(site: &Site) -> Vec<PlanStep> {
    let mut plan = Vec::new();
    if !site.mains_on {
        plan.push(PlanStep::PowerOn);
    }
    if site.antenna1 == Service::Unavailable {
        plan.push(PlanStep::RruEnsure(AntennaSelector::A1));
    }
    if site.antenna2 == Service::Unavailable {
        plan.push(PlanStep::RruEnsure(AntennaSelector::A2));
    }
    if !site.mains_on
        && site.battery_percent < 40
        && site.antenna1 == Service::Available
        && site.antenna2 == Service::Available
    {
        plan.push(PlanStep::RruOff(AntennaSelector::A2));
    }
    plan
}

/// Builds and executes mitigation plans against the tower simulator.
pub struct TroubleshootingAgent {
    tower: Arc<dyn TowerClient>,
    sleeper: Arc<dyn Sleeper>,
    policy: PolicyStore,
    timing: MitigationTiming,
    running: AtomicBool,
}

impl TroubleshootingAgent {
    pub fn new(
        tower: Arc<dyn TowerClient>,
        sleeper: Arc<dyn Sleeper>,
        policy: PolicyStore,
        timing: MitigationTiming,
    ) -> Self {
        Self { tower, sleeper, policy, timing, running: AtomicBool::new(false) }
    }

    /// §4.6: decide, and if policy allows, execute a recovery plan for `site_id`.
    pub async fn mitigate_site(&self, site_id: &str) -> MitigationOutcome {
        if self.status() != AgentStatus::Running {
            return MitigationOutcome::NotRunning;
        }

        let snapshot = match self.tower.get_state().await {
            Ok(s) => s,
            Err(_) => return MitigationOutcome::SiteNotFound,
        };
        let Some(site) = snapshot.site(site_id).cloned() else {
            return MitigationOutcome::SiteNotFound;
        };

        let plan = build_plan(&site);
        let alarms = site.detected_alarms(true);

        if !self.policy.auto_effective() {
            return MitigationOutcome::ApprovalRequired { plan, alarms, site_id: site_id.to_string() };
        }

        let mut actions_taken = Vec::new();
        for (i, step) in plan.iter().enumerate() {
            self.execute_step(site_id, step, &mut actions_taken).await;
            if i + 1 < plan.len() {
                self.sleeper.sleep(self.timing.inter_step_delay).await;
            }
        }

        let initial_alarms = alarms.clone();
        let (remaining, passes) = self.run_sweeps(site_id, &mut actions_taken).await;
        let cleared = initial_alarms.difference(&remaining).cloned().collect();

        MitigationOutcome::Completed {
            site_id: site_id.to_string(),
            actions_taken,
            cleared_alarms: cleared,
            remaining_alarms: remaining.clone(),
            passes,
            all_clear: remaining.is_empty(),
        }
    }

    async fn execute_step(&self, site_id: &str, step: &PlanStep, actions_taken: &mut Vec<String>) {
        match step {
            PlanStep::PowerOn => {
                let _ = self
                    .tower
                    .power(PowerRequest {
                        sites: SitesTarget::One(site_id.to_string()),
                        state: PowerState::On,
                    })
                    .await;
                self.sleeper.sleep(self.timing.boot_settle).await;
                actions_taken.push("power.on".to_string());
            }
            PlanStep::RruOff(antenna) => {
                let _ = self
                    .tower
                    .rru(RruRequest {
                        site: site_id.to_string(),
                        antenna: *antenna,
                        state: PowerState::Off,
                    })
                    .await;
                actions_taken.push(format!("rru.off({antenna:?})"));
            }
            PlanStep::RruEnsure(antenna) => {
                let healed = self.radio_heal(site_id, *antenna).await;
                actions_taken.push(format!("rru.ensure({antenna:?}) -> {}", if healed { "ok" } else { "failed" }));
            }
        }
    }

    /// §4.6.4: up to 3 attempts; on each, power the radio on, wait for boot if
    /// needed, and recheck; if still unavailable, bounce the radio off/on once
    /// more before rechecking again.
    async fn radio_heal(&self, site_id: &str, antenna: AntennaSelector) -> bool {
        for _attempt in 0..self.timing.heal_max_attempts {
            let _ = self
                .tower
                .rru(RruRequest { site: site_id.to_string(), antenna, state: PowerState::On })
                .await;
            self.sleeper.sleep(self.timing.heal_recheck_interval).await;

            if let Some(site) = self.read_site_waiting_for_boot(site_id).await {
                if antenna_available(&site, antenna) {
                    return true;
                }
            }

            let _ = self
                .tower
                .rru(RruRequest { site: site_id.to_string(), antenna, state: PowerState::Off })
                .await;
            self.sleeper.sleep(Duration::from_millis(400)).await;
            let _ = self
                .tower
                .rru(RruRequest { site: site_id.to_string(), antenna, state: PowerState::On })
                .await;
            self.sleeper.sleep(self.timing.heal_recheck_interval).await;

            if let Some(site) = self.read_site_waiting_for_boot(site_id).await {
                if antenna_available(&site, antenna) {
                    return true;
                }
            }
        }
        false
    }

    /// Re-read a site, giving it up to 3 extra rechecks to come alive if mains
    /// is on but the site hasn't reported alive yet (§4.6.4 / §4.6.5).
    async fn read_site_waiting_for_boot(&self, site_id: &str) -> Option<Site> {
        let mut site = self.tower.get_state().await.ok()?.site(site_id).cloned()?;
        if site.mains_on && !site.site_alive {
            for _ in 0..3 {
                self.sleeper.sleep(self.timing.heal_recheck_interval).await;
                site = self.tower.get_state().await.ok()?.site(site_id).cloned()?;
                if site.site_alive {
                    break;
                }
            }
        }
        Some(site)
    }

    /// §4.6.5: up to `sweep_max_passes` re-checks after the initial plan.
    async fn run_sweeps(
        &self,
        site_id: &str,
        actions_taken: &mut Vec<String>,
    ) -> (BTreeSet<String>, usize) {
        let mut remaining = BTreeSet::new();
        let mut passes = 0;

        for pass in 0..self.timing.sweep_max_passes {
            passes = pass + 1;

            let mut site = match self.tower.get_state().await.ok().and_then(|s| s.site(site_id).cloned()) {
                Some(s) => s,
                None => break,
            };
            for _ in 0..2 {
                if !(site.mains_on && !site.site_alive) {
                    break;
                }
                self.sleeper.sleep(self.timing.heal_recheck_interval).await;
                site = match self.tower.get_state().await.ok().and_then(|s| s.site(site_id).cloned()) {
                    Some(s) => s,
                    None => break,
                };
            }
            if site.mains_on && !site.site_alive {
                for _ in 0..3 {
                    self.sleeper.sleep(Duration::from_millis(1_500)).await;
                    site = match self.tower.get_state().await.ok().and_then(|s| s.site(site_id).cloned()) {
                        Some(s) => s,
                        None => break,
                    };
                    if site.site_alive {
                        break;
                    }
                }
            }

            remaining = site.detected_alarms(false);
            if remaining.is_empty() {
                break;
            }

            if remaining.contains("Antenna.A1.Unavailable") {
                let healed = self.radio_heal(site_id, AntennaSelector::A1).await;
                actions_taken.push(format!("sweep.rru.ensure(A1) -> {}", if healed { "ok" } else { "failed" }));
            }
            if remaining.contains("Antenna.A2.Unavailable") {
                let healed = self.radio_heal(site_id, AntennaSelector::A2).await;
                actions_taken.push(format!("sweep.rru.ensure(A2) -> {}", if healed { "ok" } else { "failed" }));
            }
            if remaining.contains("Mains.Off") {
                let _ = self
                    .tower
                    .power(PowerRequest {
                        sites: SitesTarget::One(site_id.to_string()),
                        state: PowerState::On,
                    })
                    .await;
                self.sleeper.sleep(self.timing.boot_settle).await;
                actions_taken.push("sweep.power.on".to_string());
            }
        }

        (remaining, passes)
    }
}

fn antenna_available(site: &Site, antenna: AntennaSelector) -> bool {
    match antenna {
        AntennaSelector::A1 => site.antenna1 == Service::Available,
        AntennaSelector::A2 => site.antenna2 == Service::Available,
    }
}

#[async_trait]
impl Agent for TroubleshootingAgent {
    fn name(&self) -> &'static str {
        "agent-b-troubleshooting"
    }

    async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn status(&self) -> AgentStatus {
        if self.running.load(Ordering::SeqCst) {
            AgentStatus::Running
        } else {
            AgentStatus::Stopped
        }
    }
}
