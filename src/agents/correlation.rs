//! Agent A — Correlation. Groups alarm activity per site into time-windowed
//! incidents (§4.5).

use super::{Agent, AgentStatus};
use crate::model::Site;
use crate::policy::{AlarmPrioritization, PolicyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Codes that count as "critical" under the Critical First policy, matched
/// case-insensitively as a substring of the alarm code (§4.5).
const CRITICAL_PATTERNS: &[&str] = &["serviceunavailable", "heartbeatfailure", "mainsfailure"];

/// Alarm codes that never drive correlation, regardless of policy.
const NOISE_CODES: &[&str] = &["unknown", "heartbeat", "noop"];

fn is_critical(alarm: &str) -> bool {
    let lower = alarm.to_lowercase();
    CRITICAL_PATTERNS.iter().any(|p| lower.contains(p))
}

fn is_noise(alarm: &str) -> bool {
    NOISE_CODES.contains(&alarm.to_lowercase().as_str())
}

/// Whether a correlation input raises or clears an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Raised,
    Cleared,
}

/// A single alarm transition fed into [`CorrelationAgent::correlate`].
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationInput {
    pub site_id: String,
    pub alarm: String,
    pub kind: EventKind,
    pub ts: String,
}

/// A site-scoped cluster of related alarm activity.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub site_id: String,
    pub start: String,
    pub end: String,
    pub count: usize,
    pub types: BTreeSet<String>,
    pub active: BTreeSet<String>,
    pub events: Vec<CorrelationInput>,
    pub closed: bool,
    pub reason: Option<String>,
}

fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts).ok().map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Default)]
struct SiteBuffer {
    open: Option<Incident>,
    closed: Vec<Incident>,
}

/// Windowed per-site incident clustering.
pub struct CorrelationAgent {
    policy: PolicyStore,
    window: Duration,
    buffers: Mutex<BTreeMap<String, SiteBuffer>>,
    running: AtomicBool,
}

impl CorrelationAgent {
    pub fn new(policy: PolicyStore, window: Duration) -> Self {
        Self { policy, window, buffers: Mutex::new(BTreeMap::new()), running: AtomicBool::new(false) }
    }

    /// Feed a batch of alarm transitions through the windowed clustering
    /// algorithm, mutating per-site state and returning the incident each
    /// site ended up with after this call (whether still open or just
    /// closed). Entries filtered as noise or non-critical never appear.
    pub fn correlate(&self, events: &[CorrelationInput]) -> Vec<Incident> {
        let critical_only =
            self.policy.get().alarm_prioritization == AlarmPrioritization::CriticalFirst;

        let mut by_site: BTreeMap<String, Vec<&CorrelationInput>> = BTreeMap::new();
        for event in events {
            if event.site_id.is_empty() || event.site_id.eq_ignore_ascii_case("unknown") {
                continue;
            }
            if is_noise(&event.alarm) {
                continue;
            }
            if critical_only && !is_critical(&event.alarm) {
                continue;
            }
            by_site.entry(event.site_id.clone()).or_default().push(event);
        }

        let mut touched = Vec::new();
        let mut buffers = self.buffers.lock().expect("correlation buffers mutex poisoned");

        for (site_id, mut site_events) in by_site {
            site_events.sort_by_key(|e| e.ts.clone());
            let buffer = buffers.entry(site_id.clone()).or_default();

            for event in site_events {
                Self::apply_event(buffer, event, self.window);
            }

            if let Some(open) = &buffer.open {
                touched.push(open.clone());
            } else if let Some(last_closed) = buffer.closed.last() {
                touched.push(last_closed.clone());
            }
        }

        touched
    }

    fn apply_event(buffer: &mut SiteBuffer, event: &CorrelationInput, window: Duration) {
        let ts_order = parse_ts(&event.ts);

        match &mut buffer.open {
            None => {
                let mut incident = Incident {
                    site_id: event.site_id.clone(),
                    start: event.ts.clone(),
                    end: event.ts.clone(),
                    count: 1,
                    types: BTreeSet::from([event.alarm.clone()]),
                    active: BTreeSet::new(),
                    events: vec![event.clone()],
                    closed: false,
                    reason: None,
                };
                if event.kind == EventKind::Raised {
                    incident.active.insert(event.alarm.clone());
                }
                buffer.open = Some(incident);
            }
            Some(open) => {
                // Anchored to the incident's start, not its last-seen event:
                // the window is fixed at incident creation, not renewed by
                // every extension (§8 scenario 5).
                let within_window = match (parse_ts(&open.start), ts_order) {
                    (Some(start), Some(now)) => {
                        let gap = now.signed_duration_since(start);
                        gap <= chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
                    }
                    _ => true,
                };

                if within_window {
                    open.end = event.ts.clone();
                    open.count += 1;
                    open.types.insert(event.alarm.clone());
                    open.events.push(event.clone());
                    match event.kind {
                        EventKind::Raised => {
                            open.active.insert(event.alarm.clone());
                        }
                        EventKind::Cleared => {
                            open.active.remove(&event.alarm);
                        }
                    }

                    if event.kind == EventKind::Cleared
                        && !open.active.iter().any(|a| is_critical(a))
                    {
                        let mut closed_incident = open.clone();
                        closed_incident.closed = true;
                        closed_incident.reason = Some("alarm_cleared".to_string());
                        buffer.closed.push(closed_incident);
                        buffer.open = None;
                    }
                } else {
                    let mut closed_incident = open.clone();
                    closed_incident.closed = true;
                    closed_incident.reason = Some("window_elapsed".to_string());
                    buffer.closed.push(closed_incident);

                    let mut incident = Incident {
                        site_id: event.site_id.clone(),
                        start: event.ts.clone(),
                        end: event.ts.clone(),
                        count: 1,
                        types: BTreeSet::from([event.alarm.clone()]),
                        active: BTreeSet::new(),
                        events: vec![event.clone()],
                        closed: false,
                        reason: None,
                    };
                    if event.kind == EventKind::Raised {
                        incident.active.insert(event.alarm.clone());
                    }
                    buffer.open = Some(incident);
                }
            }
        }
    }

    /// Close a site's open incident on restoration, observed from a
    /// `state.update` event (§4.5) — this runs outside `correlate` because
    /// `state.update` events are not routed through the per-event orchestration
    /// path the way alarm/service events are.
    pub fn observe_state_update(&self, site_id: &str, site: &Site) {
        if !(site.mains_on && site.site_alive) {
            return;
        }
        let mut buffers = self.buffers.lock().expect("correlation buffers mutex poisoned");
        if let Some(buffer) = buffers.get_mut(site_id) {
            if let Some(open) = buffer.open.take() {
                let mut closed = open;
                closed.closed = true;
                closed.reason = Some("service_restored".to_string());
                buffer.closed.push(closed);
            }
        }
    }

    pub fn closed_incidents(&self, site_id: &str) -> Vec<Incident> {
        self.buffers
            .lock()
            .expect("correlation buffers mutex poisoned")
            .get(site_id)
            .map(|b| b.closed.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Agent for CorrelationAgent {
    fn name(&self) -> &'static str {
        "agent-a-correlation"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Policy, PolicyPatch, WaysOfWorking};

    fn input(site: &str, alarm: &str, kind: EventKind, ts: &str) -> CorrelationInput {
        CorrelationInput { site_id: site.into(), alarm: alarm.into(), kind, ts: ts.into() }
    }

    fn agent_with_window_secs(secs: u64) -> CorrelationAgent {
        CorrelationAgent::new(PolicyStore::new(Policy::default()), Duration::from_secs(secs))
    }

    #[test]
    fn noise_and_unknown_site_are_filtered() {
        let agent = agent_with_window_secs(300);
        let events = vec![
            input("unknown", "MainsFailure", EventKind::Raised, "2025-01-01T00:00:00Z"),
            input("S1", "heartbeat", EventKind::Raised, "2025-01-01T00:00:01Z"),
        ];
        assert!(agent.correlate(&events).is_empty());
    }

    #[test]
    fn critical_first_drops_non_critical_alarms() {
        let agent = agent_with_window_secs(300);
        agent.policy.patch(
            PolicyPatch {
                alarm_prioritization: Some(crate::policy::AlarmPrioritization::CriticalFirst),
                ..Default::default()
            },
            "test",
        );
        let events = vec![input("S1", "SomeOtherThing", EventKind::Raised, "2025-01-01T00:00:00Z")];
        assert!(agent.correlate(&events).is_empty());
    }

    #[test]
    fn new_alarm_starts_an_incident() {
        let agent = agent_with_window_secs(300);
        let events = vec![input("S1", "MainsFailure", EventKind::Raised, "2025-01-01T00:00:00Z")];
        let incidents = agent.correlate(&events);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].count, 1);
        assert!(!incidents[0].closed);
        assert_eq!(incidents[0].events, events);
    }

    #[test]
    fn windowed_clustering_matches_scenario() {
        // §8 scenario 5: events at T, T+4m, T+6m with a 5 min window.
        let agent = agent_with_window_secs(5 * 60);
        let events = vec![
            input("S1", "MainsFailure", EventKind::Raised, "2025-01-01T00:00:00Z"),
            input("S1", "ServiceUnavailable", EventKind::Raised, "2025-01-01T00:04:00Z"),
            input("S1", "ServiceUnavailable", EventKind::Raised, "2025-01-01T00:06:00Z"),
        ];
        let incidents = agent.correlate(&events);
        // Only the final touched incident per site is returned from one call;
        // the closed first incident is retrievable via closed_incidents.
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].count, 1);
        assert_eq!(incidents[0].start, "2025-01-01T00:06:00Z");

        let closed = agent.closed_incidents("S1");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].count, 2);
        assert_eq!(closed[0].reason.as_deref(), Some("window_elapsed"));
        assert_eq!(closed[0].events.len(), 2);
        assert_eq!(closed[0].events[0].ts, "2025-01-01T00:00:00Z");
        assert_eq!(closed[0].events[1].ts, "2025-01-01T00:04:00Z");
    }

    #[test]
    fn boundary_exactly_at_window_extends_not_splits() {
        let agent = agent_with_window_secs(300);
        let events = vec![
            input("S1", "MainsFailure", EventKind::Raised, "2025-01-01T00:00:00Z"),
            input("S1", "ServiceUnavailable", EventKind::Raised, "2025-01-01T00:05:00Z"),
        ];
        let incidents = agent.correlate(&events);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].count, 2, "spacing exactly equal to the window must extend, not split");
    }

    #[test]
    fn clearing_last_critical_alarm_closes_early() {
        let agent = agent_with_window_secs(300);
        agent.correlate(&[input("S1", "MainsFailure", EventKind::Raised, "2025-01-01T00:00:00Z")]);
        let incidents =
            agent.correlate(&[input("S1", "MainsFailure", EventKind::Cleared, "2025-01-01T00:00:10Z")]);
        assert_eq!(incidents.len(), 1);
        assert!(incidents[0].closed);
        assert_eq!(incidents[0].reason.as_deref(), Some("alarm_cleared"));
    }

    #[test]
    fn state_update_restoration_closes_open_incident() {
        let agent = agent_with_window_secs(300);
        agent.correlate(&[input("S1", "MainsFailure", EventKind::Raised, "2025-01-01T00:00:00Z")]);
        let site = Site {
            mains_on: true,
            site_alive: true,
            battery_percent: 100,
            antenna1: crate::model::Service::Available,
            antenna2: crate::model::Service::Available,
            alarms: BTreeSet::new(),
        };
        agent.observe_state_update("S1", &site);
        let closed = agent.closed_incidents("S1");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason.as_deref(), Some("service_restored"));
    }

    #[tokio::test]
    async fn lifecycle_reports_running_after_start() {
        let agent = agent_with_window_secs(300);
        assert_eq!(agent.status(), AgentStatus::Stopped);
        agent.start().await;
        assert_eq!(agent.status(), AgentStatus::Running);
        agent.stop().await;
        assert_eq!(agent.status(), AgentStatus::Stopped);
    }
}
