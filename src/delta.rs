//! The Delta Emitter: diffs successive snapshots into the normalized events
//! the rest of the system reacts to (§4.2).

use crate::model::{Antenna, BusEvent, Service, Snapshot};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
struct AlarmsView(BTreeMap<String, BTreeSet<String>>);

#[derive(Debug, Clone, Default)]
struct ServiceView(BTreeMap<String, (Service, Service)>);

/// Stateful snapshot-diff engine. One instance per Tower Bridge connection —
/// callers must construct a fresh emitter (or call [`DeltaEmitter::reset`]) on
/// reconnect so stale state doesn't manufacture spurious deltas (§4.1).
pub struct DeltaEmitter {
    alarms: Option<AlarmsView>,
    services: Option<ServiceView>,
    bootstrap_emit: bool,
}

impl DeltaEmitter {
    pub fn new(bootstrap_emit: bool) -> Self {
        Self { alarms: None, services: None, bootstrap_emit }
    }

    /// Drop all remembered state so the next `ingest` is treated as a first ingest.
    pub fn reset(&mut self) {
        self.alarms = None;
        self.services = None;
    }

    /// Diff `snapshot` against the last ingested snapshot and return the
    /// events this ingest produces, in the order guaranteed by §4.2: all
    /// raised per site, then all cleared per site, then all service changes,
    /// sites visited in ascending key order. All events share the same `ts`.
    pub fn ingest(&mut self, snapshot: &Snapshot, ts: &str, source: &str) -> Vec<BusEvent> {
        let mut next_alarms = BTreeMap::new();
        let mut next_services = BTreeMap::new();
        for (site_id, site) in &snapshot.sites {
            next_alarms.insert(site_id.clone(), site.alarms.clone());
            next_services.insert(site_id.clone(), (site.antenna1, site.antenna2));
        }

        let (prev_alarms, prev_services) = match (self.alarms.take(), self.services.take()) {
            (Some(a), Some(s)) => (a, s),
            _ => {
                self.alarms = Some(AlarmsView(next_alarms));
                self.services = Some(ServiceView(next_services));
                return if self.bootstrap_emit {
                    self.bootstrap_events(snapshot, ts, source)
                } else {
                    Vec::new()
                };
            }
        };

        let mut raised = Vec::new();
        let mut cleared = Vec::new();
        let mut changed = Vec::new();

        let mut site_ids: BTreeSet<&String> = prev_alarms.0.keys().collect();
        site_ids.extend(next_alarms.keys());

        for site_id in site_ids {
            let prev = prev_alarms.0.get(site_id).cloned().unwrap_or_default();
            let next = next_alarms.get(site_id).cloned().unwrap_or_default();

            for alarm in next.difference(&prev) {
                raised.push(BusEvent::AlarmRaised {
                    site_id: site_id.clone(),
                    alarm: alarm.clone(),
                    ts: ts.to_string(),
                    source: source.to_string(),
                    bootstrap: false,
                });
            }
            for alarm in prev.difference(&next) {
                cleared.push(BusEvent::AlarmCleared {
                    site_id: site_id.clone(),
                    alarm: alarm.clone(),
                    ts: ts.to_string(),
                    source: source.to_string(),
                });
            }

            if let (Some(prev_svc), Some(next_svc)) =
                (prev_services.0.get(site_id), next_services.get(site_id))
            {
                if prev_svc.0 != next_svc.0 {
                    changed.push(BusEvent::ServiceChanged {
                        site_id: site_id.clone(),
                        antenna: Antenna::Antenna1,
                        from: prev_svc.0,
                        to: next_svc.0,
                        ts: ts.to_string(),
                        source: source.to_string(),
                    });
                }
                if prev_svc.1 != next_svc.1 {
                    changed.push(BusEvent::ServiceChanged {
                        site_id: site_id.clone(),
                        antenna: Antenna::Antenna2,
                        from: prev_svc.1,
                        to: next_svc.1,
                        ts: ts.to_string(),
                        source: source.to_string(),
                    });
                }
            }
        }

        self.alarms = Some(AlarmsView(next_alarms));
        self.services = Some(ServiceView(next_services));

        raised.into_iter().chain(cleared).chain(changed).collect()
    }

    fn bootstrap_events(&self, snapshot: &Snapshot, ts: &str, source: &str) -> Vec<BusEvent> {
        let mut out = Vec::new();
        for (site_id, site) in &snapshot.sites {
            for alarm in &site.alarms {
                out.push(BusEvent::AlarmRaised {
                    site_id: site_id.clone(),
                    alarm: alarm.clone(),
                    ts: ts.to_string(),
                    source: source.to_string(),
                    bootstrap: true,
                });
            }
        }
        out
    }
}
