//! The Supervisor: the event-driven orchestration core. Owns the lifecycle
//! FSM, the duplicate-event ledger, the approval queue and log ring, and
//! drives the three agents through the per-event orchestration algorithm
//! (§4.4).

mod approvals;
mod ledger;

pub use approvals::{Approval, ApprovalQueue, ApprovalStatus};
pub use ledger::DuplicateLedger;

use crate::agents::correlation::{CorrelationAgent, CorrelationInput, EventKind};
use crate::agents::rca::{IncidentRecord, RcaAgent, Resolution};
use crate::agents::troubleshooting::{MitigationOutcome, MitigationTiming, TroubleshootingAgent};
use crate::agents::{Agent, AgentStatus};
use crate::bus::IncidentBus;
use crate::config::Config;
use crate::model::BusEvent;
use crate::policy::PolicyStore;
use crate::sleeper::Sleeper;
use crate::tower_client::TowerClient;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Supervisor lifecycle state (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// A point-in-time read of §3's Supervisor state, as returned by the
/// `summary` control operation.
#[derive(Debug, Clone)]
pub struct SupervisorSummary {
    pub status: SupervisorState,
    pub started_at: Option<String>,
    pub runtime_sec: u64,
    pub tasks_routed: u64,
    pub last_note: Option<String>,
}

/// The orchestration core. One instance per running fleet.
pub struct Supervisor {
    bus: Arc<IncidentBus>,
    tower: Arc<dyn TowerClient>,
    policy: PolicyStore,
    correlation: Arc<CorrelationAgent>,
    troubleshooting: Arc<TroubleshootingAgent>,
    rca: Arc<RcaAgent>,
    ledger: DuplicateLedger,
    approvals: ApprovalQueue,
    logs: Mutex<VecDeque<String>>,
    log_capacity: usize,
    state: Mutex<SupervisorState>,
    cold_start_sweep: bool,
    started_at: Mutex<Option<(Instant, String)>>,
    accumulated_runtime: Mutex<Duration>,
    tasks_routed: AtomicU64,
    last_note: Mutex<Option<String>>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        tower: Arc<dyn TowerClient>,
        bus: Arc<IncidentBus>,
        policy: PolicyStore,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let correlation = Arc::new(CorrelationAgent::new(policy.clone(), config.correlation_window));
        let troubleshooting = Arc::new(TroubleshootingAgent::new(
            tower.clone(),
            sleeper,
            policy.clone(),
            MitigationTiming {
                boot_settle: config.boot_settle,
                heal_recheck_interval: config.heal_recheck_interval,
                inter_step_delay: config.inter_step_delay,
                heal_max_attempts: config.heal_max_attempts,
                sweep_max_passes: config.sweep_max_passes,
            },
        ));
        let rca = Arc::new(RcaAgent::new(tower.clone(), config.case_dedup_window));

        Self {
            bus,
            tower,
            policy,
            correlation,
            troubleshooting,
            rca,
            ledger: DuplicateLedger::new(config.ledger_max_entries, config.ledger_ttl),
            approvals: ApprovalQueue::new(),
            logs: Mutex::new(VecDeque::with_capacity(config.log_ring_capacity)),
            log_capacity: config.log_ring_capacity,
            state: Mutex::new(SupervisorState::Idle),
            cold_start_sweep: config.cold_start_sweep,
            started_at: Mutex::new(None),
            accumulated_runtime: Mutex::new(Duration::ZERO),
            tasks_routed: AtomicU64::new(0),
            last_note: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().expect("supervisor state mutex poisoned")
    }

    fn set_state(&self, new: SupervisorState) {
        *self.state.lock().expect("supervisor state mutex poisoned") = new;
    }

    fn agents(&self) -> [Arc<dyn Agent>; 3] {
        [self.correlation.clone(), self.troubleshooting.clone(), self.rca.clone()]
    }

    /// Start every agent, flip to `Running`, and — if configured — run the
    /// cold-start sweep over current device state before accepting live
    /// events, so pre-existing issues at boot aren't silently missed.
    ///
    /// `idle`/`stopped` transition directly; `paused` delegates to
    /// [`Supervisor::resume`]. Any other call (already running) is a no-op
    /// that returns a descriptive message instead of restarting agents or
    /// re-running the sweep (§4.4.1).
    pub async fn start(&self) -> Result<(), String> {
        match self.state() {
            SupervisorState::Paused => return self.resume().await,
            SupervisorState::Running => return Err("already running".to_string()),
            SupervisorState::Idle | SupervisorState::Stopped => {}
        }

        for agent in self.agents() {
            agent.start().await;
        }
        self.begin_runtime_window();
        self.set_state(SupervisorState::Running);
        self.log("supervisor started".to_string());

        if self.cold_start_sweep {
            self.run_cold_start_sweep().await;
        }
        Ok(())
    }

    /// Drive the per-event orchestration loop from the Bus. Runs until the
    /// bus itself is dropped; intended to be spawned as a background task
    /// alongside [`Supervisor::start`].
    pub async fn run(&self) {
        let (backfill, mut sub) = self.bus.subscribe();
        for event in backfill {
            self.handle_event(event).await;
        }
        while let Some(event) = sub.next().await {
            self.handle_event(event).await;
        }
    }

    /// `running` → `paused` only; any other call is a no-op.
    pub async fn pause(&self) -> Result<(), String> {
        if self.state() != SupervisorState::Running {
            return Err("not running".to_string());
        }
        self.accumulate_runtime();
        self.set_state(SupervisorState::Paused);
        self.log("supervisor paused".to_string());
        Ok(())
    }

    /// `paused` → `running` only; re-asserts agent running state and opens a
    /// fresh runtime window, per §4.4.1.
    pub async fn resume(&self) -> Result<(), String> {
        if self.state() != SupervisorState::Paused {
            return Err("not paused".to_string());
        }
        for agent in self.agents() {
            agent.start().await;
        }
        self.begin_runtime_window();
        self.set_state(SupervisorState::Running);
        self.log("supervisor resumed".to_string());
        Ok(())
    }

    /// `running`/`paused` → `stopped` only; any other call is a no-op.
    pub async fn stop(&self) -> Result<(), String> {
        match self.state() {
            SupervisorState::Running | SupervisorState::Paused => {}
            _ => return Err("not running".to_string()),
        }
        self.accumulate_runtime();
        for agent in self.agents() {
            agent.stop().await;
        }
        self.set_state(SupervisorState::Stopped);
        self.log("supervisor stopped".to_string());
        Ok(())
    }

    fn begin_runtime_window(&self) {
        *self.started_at.lock().expect("supervisor started_at mutex poisoned") =
            Some((Instant::now(), crate::model::now_iso()));
    }

    /// Fold the current running window into `accumulated_runtime` and clear
    /// `startedAt`, per §3/§4.4.1 ("Accumulates runtime, clears startedAt").
    fn accumulate_runtime(&self) {
        let mut started = self.started_at.lock().expect("supervisor started_at mutex poisoned");
        if let Some((since, _)) = started.take() {
            *self.accumulated_runtime.lock().expect("supervisor runtime mutex poisoned") +=
                since.elapsed();
        }
    }

    fn runtime_sec(&self) -> u64 {
        let accumulated = *self.accumulated_runtime.lock().expect("supervisor runtime mutex poisoned");
        let live = self
            .started_at
            .lock()
            .expect("supervisor started_at mutex poisoned")
            .as_ref()
            .map(|(since, _)| since.elapsed())
            .unwrap_or(Duration::ZERO);
        (accumulated + live).as_secs()
    }

    /// §6 control operation: a read-only snapshot of the Supervisor's §3
    /// lifecycle state for the control surface.
    pub fn summary(&self) -> SupervisorSummary {
        let started_at = self
            .started_at
            .lock()
            .expect("supervisor started_at mutex poisoned")
            .as_ref()
            .map(|(_, iso)| iso.clone());
        SupervisorSummary {
            status: self.state(),
            started_at,
            runtime_sec: self.runtime_sec(),
            tasks_routed: self.tasks_routed.load(Ordering::Relaxed),
            last_note: self.last_note.lock().expect("supervisor last_note mutex poisoned").clone(),
        }
    }

    /// §6 control operation: record an operator-supplied free-text note.
    pub fn note(&self, message: impl Into<String>) {
        let message = message.into();
        *self.last_note.lock().expect("supervisor last_note mutex poisoned") = Some(message.clone());
        self.log(format!("note: {message}"));
    }

    /// §6 control operation: read the manual auto/HITL override. `None` means
    /// "defer to policy.waysOfWorking".
    pub fn auto_toggle(&self) -> Option<bool> {
        self.policy.manual_auto()
    }

    /// §6 control operation: set (or clear, with `None`) the manual auto/HITL
    /// override independent of the standing policy.
    pub fn set_auto_toggle(&self, value: Option<bool>) {
        self.policy.set_manual_auto(value);
        self.log(format!("auto toggle set to {value:?}"));
    }

    /// §6 convenience wrapper over `resolve_approval(id, true)`.
    pub async fn approve(&self, id: u64) -> Option<Approval> {
        self.resolve_approval(id, true).await
    }

    /// §6 convenience wrapper over `resolve_approval(id, false)`.
    pub async fn reject(&self, id: u64) -> Option<Approval> {
        self.resolve_approval(id, false).await
    }

    async fn run_cold_start_sweep(&self) {
        let snapshot = match self.tower.get_state().await {
            Ok(s) => s,
            Err(err) => {
                self.log(format!("cold start sweep failed to read tower state: {err}"));
                return;
            }
        };
        let ts = crate::model::now_iso();
        for (site_id, site) in &snapshot.sites {
            for alarm in site.detected_alarms(true) {
                self.handle_event(BusEvent::AlarmRaised {
                    site_id: site_id.clone(),
                    alarm,
                    ts: ts.clone(),
                    source: "cold-start".to_string(),
                    bootstrap: false,
                })
                .await;
            }
        }
    }

    /// The per-event orchestration algorithm (§4.4.3):
    /// 1. duplicate check against the ledger
    /// 2. lifecycle status check (must be `Running`)
    /// 3. site-id presence check
    /// 4. event-type filter (only alarm transitions drive mitigation)
    /// 5. Agent A correlation
    /// 6. Agent C "investigating" record
    /// 7. `autoEffective` computation
    /// 8. HITL enqueue-approval, or automated mitigate + final RCA record
    pub async fn handle_event(&self, event: BusEvent) {
        if !self.ledger.observe(event.dedup_key()) {
            tracing::debug!(
                site_id = event.site_id().unwrap_or(""),
                alarm = event.alarm().unwrap_or(""),
                event = "event.duplicate",
                "duplicate suppressed"
            );
            self.log(format!("duplicate suppressed: {:?}", event.dedup_key()));
            return;
        }

        if self.state() != SupervisorState::Running {
            self.log("event dropped: supervisor not running".to_string());
            return;
        }

        if let BusEvent::StateUpdate { payload, .. } = &event {
            // Not routed into correlation/mitigation; only used to close
            // incidents Agent A already has open once a site restores.
            for (site, site_state) in &payload.sites {
                self.correlation.observe_state_update(site, site_state);
            }
            return;
        }

        let Some(site_id) = event.site_id().filter(|id| !id.is_empty() && *id != "all") else {
            self.log("event dropped: no concrete site id".to_string());
            return;
        };
        let site_id = site_id.to_string();

        let (alarm, kind) = match &event {
            BusEvent::AlarmRaised { alarm, .. } => (alarm.clone(), EventKind::Raised),
            BusEvent::AlarmCleared { alarm, .. } => (alarm.clone(), EventKind::Cleared),
            // Accepted at the §4.4.3 step-4 gate (unlike bus-health/snapshot
            // events, which are logged as skipped), but Agent A's window
            // algorithm only clusters alarm transitions (§4.5): a bare
            // antenna flip with no accompanying alarm code never seeds or
            // extends an incident on its own.
            BusEvent::ServiceChanged { antenna, from, to, .. } => {
                self.log(format!("{site_id}: {antenna} {from}->{to}, no alarm correlation input"));
                return;
            }
            _ => {
                self.log(format!("event type not actionable: {}", event.ts()));
                return;
            }
        };

        let incidents = self.correlation.correlate(&[CorrelationInput {
            site_id: site_id.clone(),
            alarm: alarm.clone(),
            kind,
            ts: event.ts().to_string(),
        }]);
        if incidents.is_empty() {
            self.log(format!("{site_id}/{alarm} filtered by correlation policy"));
            return;
        }

        self.rca
            .record_incident(IncidentRecord {
                site_id: site_id.clone(),
                cause: alarm.clone(),
                actions: Vec::new(),
                resolution: Resolution::Investigating,
            })
            .await;

        if kind == EventKind::Cleared {
            self.log(format!("{site_id}/{alarm} cleared, no mitigation dispatched"));
            return;
        }

        if self.policy.auto_effective() {
            self.tasks_routed.fetch_add(1, Ordering::Relaxed);
        }

        match self.troubleshooting.mitigate_site(&site_id).await {
            MitigationOutcome::NotRunning | MitigationOutcome::SiteNotFound => {
                self.log(format!("{site_id}: mitigation skipped, site or agent unavailable"));
            }
            MitigationOutcome::ApprovalRequired { plan, alarms, site_id } => {
                let id = self.approvals.enqueue(site_id.clone(), plan, alarms);
                self.log(format!("{site_id}: mitigation plan queued for approval (#{id})"));
            }
            MitigationOutcome::Completed { site_id, actions_taken, remaining_alarms, all_clear, .. } => {
                let resolution = if all_clear { Resolution::Restored } else { Resolution::Stabilized };
                tracing::info!(
                    site_id = %site_id,
                    alarm = %alarm,
                    all_clear,
                    event = "mitigation.completed",
                    "mitigation run finished"
                );
                self.rca
                    .record_incident(IncidentRecord {
                        site_id: site_id.clone(),
                        cause: alarm.clone(),
                        actions: actions_taken,
                        resolution,
                    })
                    .await;
                self.log(format!(
                    "{site_id}: mitigation complete, all_clear={all_clear}, remaining={remaining_alarms:?}"
                ));
            }
        }
    }

    /// Approve or reject a queued plan. Approval forces automated execution
    /// for this one decision via a scoped manual-auto override, regardless of
    /// the standing policy, then records the outcome with Agent C.
    pub async fn resolve_approval(&self, id: u64, approved: bool) -> Option<Approval> {
        let approval = self.approvals.resolve(id, approved)?;
        if !approved {
            self.log(format!("approval #{id} rejected for {}", approval.site_id));
            return Some(approval);
        }

        self.policy.set_manual_auto(Some(true));
        let outcome = self.troubleshooting.mitigate_site(&approval.site_id).await;
        self.policy.set_manual_auto(None);

        if let MitigationOutcome::Completed { site_id, actions_taken, remaining_alarms, all_clear, .. } =
            outcome
        {
            let resolution = if all_clear { Resolution::Restored } else { Resolution::Stabilized };
            self.rca
                .record_incident(IncidentRecord {
                    site_id: site_id.clone(),
                    cause: "approved_mitigation".to_string(),
                    actions: actions_taken,
                    resolution,
                })
                .await;
            self.log(format!("approval #{id} executed for {site_id}, all_clear={all_clear}"));
        }

        Some(approval)
    }

    pub fn list_pending_approvals(&self) -> Vec<Approval> {
        self.approvals.list_pending()
    }

    pub fn list_all_approvals(&self) -> Vec<Approval> {
        self.approvals.list_all()
    }

    /// Append to the domain-visible log ring and mirror the same line through
    /// `tracing`, so a control surface reading the ring and an operator
    /// tailing stdout see the same event (§10.1).
    fn log(&self, message: String) {
        tracing::info!(supervisor_log = %message, "supervisor");
        let mut logs = self.logs.lock().expect("supervisor log ring mutex poisoned");
        if logs.len() >= self.log_capacity {
            logs.pop_front();
        }
        logs.push_back(message);
    }

    pub fn recent_logs(&self) -> Vec<String> {
        self.logs.lock().expect("supervisor log ring mutex poisoned").iter().cloned().collect()
    }

    pub fn correlation_agent(&self) -> Arc<CorrelationAgent> {
        self.correlation.clone()
    }

    pub fn troubleshooting_agent(&self) -> Arc<TroubleshootingAgent> {
        self.troubleshooting.clone()
    }

    pub fn rca_agent(&self) -> Arc<RcaAgent> {
        self.rca.clone()
    }

    pub fn agent_statuses(&self) -> Vec<(&'static str, AgentStatus)> {
        self.agents().iter().map(|a| (a.name(), a.status())).collect()
    }
}
