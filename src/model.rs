//! Wire and domain types shared by every component: the fleet snapshot, the
//! normalized events the Bus carries, and small helpers for alarm detection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Availability of a single antenna.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Service {
    Available,
    Unavailable,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::Available => write!(f, "Available"),
            Service::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// An alarm code as reported by a site. Kept as an owned string rather than a
/// closed enum: the simulator's alarm vocabulary is not fixed by this crate.
pub type Alarm = String;

/// A single site's reported state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub mains_on: bool,
    pub site_alive: bool,
    pub battery_percent: u8,
    pub antenna1: Service,
    pub antenna2: Service,
    #[serde(default)]
    pub alarms: BTreeSet<Alarm>,
}

impl Site {
    /// Detected alarms derivable purely from this snapshot (§4.6.1 / §4.7), independent
    /// of whatever the simulator itself reports in `alarms`.
    pub fn detected_alarms(&self, check_battery: bool) -> BTreeSet<Alarm> {
        let mut out = BTreeSet::new();
        if !self.mains_on {
            out.insert("Mains.Off".to_string());
        }
        if !self.site_alive {
            out.insert("Site.Down".to_string());
        }
        if self.antenna1 == Service::Unavailable {
            out.insert("Antenna.A1.Unavailable".to_string());
        }
        if self.antenna2 == Service::Unavailable {
            out.insert("Antenna.A2.Unavailable".to_string());
        }
        if check_battery && !self.mains_on && self.battery_percent < 40 {
            out.insert("Battery.Low.GridDown".to_string());
        }
        out
    }
}

/// A site identifier. `"all"` is reserved for fleet-wide operations/events.
pub type SiteId = String;

/// Full fleet snapshot: every site's last known state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sites: BTreeMap<SiteId, Site>,
}

impl Snapshot {
    pub fn site(&self, id: &str) -> Option<&Site> {
        self.sites.get(id)
    }
}

/// A normalized, Bus-carried event. Every variant except `StateUpdate` and the
/// connectivity markers carries a concrete site id and an ISO-8601 timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    #[serde(rename = "alarm.raised")]
    AlarmRaised {
        site_id: SiteId,
        alarm: Alarm,
        ts: String,
        source: String,
        #[serde(default)]
        bootstrap: bool,
    },
    #[serde(rename = "alarm.cleared")]
    AlarmCleared { site_id: SiteId, alarm: Alarm, ts: String, source: String },
    #[serde(rename = "service.changed")]
    ServiceChanged {
        site_id: SiteId,
        antenna: Antenna,
        from: Service,
        to: Service,
        ts: String,
        source: String,
    },
    #[serde(rename = "state.update")]
    StateUpdate { site_id: SiteId, payload: Snapshot, ts: String },
    #[serde(rename = "bus.disconnected")]
    BusDisconnected { ts: String },
    #[serde(rename = "bus.reconnected")]
    BusReconnected { ts: String },
}

impl BusEvent {
    /// The site this event concerns, or `None` for fleet-wide/connectivity events.
    pub fn site_id(&self) -> Option<&str> {
        match self {
            BusEvent::AlarmRaised { site_id, .. }
            | BusEvent::AlarmCleared { site_id, .. }
            | BusEvent::ServiceChanged { site_id, .. } => Some(site_id.as_str()),
            BusEvent::StateUpdate { site_id, .. } => Some(site_id.as_str()),
            BusEvent::BusDisconnected { .. } | BusEvent::BusReconnected { .. } => None,
        }
    }

    pub fn ts(&self) -> &str {
        match self {
            BusEvent::AlarmRaised { ts, .. }
            | BusEvent::AlarmCleared { ts, .. }
            | BusEvent::ServiceChanged { ts, .. }
            | BusEvent::StateUpdate { ts, .. }
            | BusEvent::BusDisconnected { ts }
            | BusEvent::BusReconnected { ts } => ts.as_str(),
        }
    }

    /// The alarm code this event concerns, if any. Used as part of the
    /// Supervisor's duplicate-identity tuple.
    pub fn alarm(&self) -> Option<&str> {
        match self {
            BusEvent::AlarmRaised { alarm, .. } | BusEvent::AlarmCleared { alarm, .. } => {
                Some(alarm.as_str())
            }
            _ => None,
        }
    }

    /// `(type, siteId, alarm, ts)` duplicate-identity key, per §9: "preserve the
    /// original string rather than reparse it".
    pub fn dedup_key(&self) -> (&'static str, String, String, String) {
        let kind = match self {
            BusEvent::AlarmRaised { .. } => "alarm.raised",
            BusEvent::AlarmCleared { .. } => "alarm.cleared",
            BusEvent::ServiceChanged { .. } => "service.changed",
            BusEvent::StateUpdate { .. } => "state.update",
            BusEvent::BusDisconnected { .. } => "bus.disconnected",
            BusEvent::BusReconnected { .. } => "bus.reconnected",
        };
        (
            kind,
            self.site_id().unwrap_or("").to_string(),
            self.alarm().unwrap_or("").to_string(),
            self.ts().to_string(),
        )
    }
}

/// Which antenna a `service.changed` event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Antenna {
    Antenna1,
    Antenna2,
}

impl std::fmt::Display for Antenna {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Antenna::Antenna1 => write!(f, "antenna1"),
            Antenna::Antenna2 => write!(f, "antenna2"),
        }
    }
}

/// Current wall-clock time as an ISO-8601 string, the timestamp format used
/// throughout the Bus and logs.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
