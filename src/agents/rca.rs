//! Agent C — RCA. Records a casebook of incident outcomes, applying noise and
//! dedup filters, and composes the dispatch-email template (§4.7).

use super::{Agent, AgentStatus};
use crate::model::{now_iso, Site};
use crate::tower_client::TowerClient;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const NOISE_CAUSES: &[&str] = &["unknown", "heartbeat", "noop"];

/// A recorded case outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Investigating,
    Restored,
    Stabilized,
    Unknown,
}

impl Resolution {
    fn as_str(&self) -> &'static str {
        match self {
            Resolution::Investigating => "investigating",
            Resolution::Restored => "restored",
            Resolution::Stabilized => "stabilized",
            Resolution::Unknown => "unknown",
        }
    }
}

/// One accepted case-file entry.
#[derive(Debug, Clone)]
pub struct Case {
    pub ts: String,
    pub site_id: String,
    pub cause: String,
    pub actions: Vec<String>,
    pub resolution: Resolution,
    pub ongoing: bool,
    pub dispatch_suggested: bool,
    pub summary: String,
}

/// What [`RcaAgent::record_incident`] requests be recorded.
#[derive(Debug, Clone)]
pub struct IncidentRecord {
    pub site_id: String,
    pub cause: String,
    pub actions: Vec<String>,
    pub resolution: Resolution,
}

/// Result of attempting to record a case.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Recorded(Case),
    Skipped { reason: &'static str },
}

fn is_noise_cause(cause: &str) -> bool {
    NOISE_CAUSES.contains(&cause.to_lowercase().as_str())
}

/// Casebook recorder and dispatch-email composer.
pub struct RcaAgent {
    tower: Arc<dyn TowerClient>,
    dedup_window: std::time::Duration,
    cases: Mutex<Vec<Case>>,
    running: AtomicBool,
}

impl RcaAgent {
    pub fn new(tower: Arc<dyn TowerClient>, dedup_window: std::time::Duration) -> Self {
        Self { tower, dedup_window, cases: Mutex::new(Vec::new()), running: AtomicBool::new(false) }
    }

    /// §4.7: filter noise/unknown, dedup against the last case for this site
    /// within the window, then record with a freshly computed ongoing/dispatch
    /// assessment.
    pub async fn record_incident(&self, record: IncidentRecord) -> RecordOutcome {
        if !self.running.load(Ordering::SeqCst) {
            self.running.store(true, Ordering::SeqCst);
        }

        if record.site_id.is_empty()
            || record.site_id.eq_ignore_ascii_case("unknown")
            || is_noise_cause(&record.cause)
        {
            return RecordOutcome::Skipped { reason: "noise_or_unknown" };
        }

        let now = now_iso();
        {
            let cases = self.cases.lock().expect("rca casebook mutex poisoned");
            if let Some(last) = cases.iter().rev().find(|c| c.site_id == record.site_id) {
                if last.cause == record.cause && last.resolution == record.resolution {
                    if let (Some(last_t), Some(now_t)) =
                        (chrono::DateTime::parse_from_rfc3339(&last.ts).ok(), chrono::DateTime::parse_from_rfc3339(&now).ok())
                    {
                        let gap = now_t.signed_duration_since(last_t);
                        if gap <= chrono::Duration::from_std(self.dedup_window).unwrap_or_default() {
                            return RecordOutcome::Skipped { reason: "dedup_suppressed" };
                        }
                    }
                }
            }
        }

        let alarms = match self.tower.get_state().await {
            Ok(snapshot) => snapshot.site(&record.site_id).map(Site::clone).map(|s| s.detected_alarms(false)),
            Err(_) => None,
        }
        .unwrap_or_default();

        let ongoing = record.resolution != Resolution::Restored || !alarms.is_empty();
        let dispatch_suggested = ongoing;
        let summary = format!(
            "{}: {} ({}), {} action(s) taken, resolution={}",
            record.site_id,
            record.cause,
            if alarms.is_empty() { "clear".to_string() } else { format!("{} alarm(s) remain", alarms.len()) },
            record.actions.len(),
            record.resolution.as_str(),
        );

        let case = Case {
            ts: now,
            site_id: record.site_id,
            cause: record.cause,
            actions: record.actions,
            resolution: record.resolution,
            ongoing,
            dispatch_suggested,
            summary,
        };
        self.cases.lock().expect("rca casebook mutex poisoned").push(case.clone());
        RecordOutcome::Recorded(case)
    }

    /// §6: deterministic dispatch-email template for the most recent
    /// unresolved case on a site.
    pub async fn compose_dispatch_email(&self, site_id: &str) -> Result<(String, String), &'static str> {
        let case = {
            let cases = self.cases.lock().expect("rca casebook mutex poisoned");
            cases
                .iter()
                .rev()
                .find(|c| c.site_id == site_id && c.dispatch_suggested)
                .cloned()
                .ok_or("no_unresolved_case")?
        };

        let snapshot = self.tower.get_state().await.map_err(|_| "no_unresolved_case")?;
        let site = snapshot.site(site_id).ok_or("no_unresolved_case")?;
        let alarms: BTreeSet<String> = site.detected_alarms(true);

        let subject = format!("[DISPATCH] {} – {} – Action required", site_id, case.cause);
        let mut body = String::new();
        body.push_str(&format!("Site: {}\n", site_id));
        body.push_str(&format!("Timestamp: {}\n", case.ts));
        body.push_str(&format!("Mains: {}\n", if site.mains_on { "on" } else { "off" }));
        body.push_str(&format!("Alive: {}\n", site.site_alive));
        body.push_str(&format!("Antenna1: {}\n", site.antenna1));
        body.push_str(&format!("Antenna2: {}\n", site.antenna2));
        body.push_str(&format!("Battery: {}%\n", site.battery_percent));
        body.push_str("Open alarms:\n");
        if alarms.is_empty() {
            body.push_str("  (none detected)\n");
        } else {
            for alarm in &alarms {
                body.push_str(&format!("  - {}\n", alarm));
            }
        }
        body.push_str("Actions taken so far:\n");
        if case.actions.is_empty() {
            body.push_str("  (none)\n");
        } else {
            for action in &case.actions {
                body.push_str(&format!("  - {}\n", action));
            }
        }
        body.push_str("Requested next step: field dispatch\n");
        body.push_str(&format!("Summary: {}\n", case.summary));

        Ok((subject, body))
    }

    pub fn cases_for(&self, site_id: &str) -> Vec<Case> {
        self.cases
            .lock()
            .expect("rca casebook mutex poisoned")
            .iter()
            .filter(|c| c.site_id == site_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Agent for RcaAgent {
    fn name(&self) -> &'static str {
        "agent-c-rca"
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
