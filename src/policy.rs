//! The policy store: a small set of validated, versioned operator settings that
//! agents observe at decision time rather than at start (§9).

use crate::adaptive::Adaptive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Alarm prioritization strategy for Agent A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmPrioritization {
    #[serde(rename = "Critical First")]
    CriticalFirst,
    #[serde(rename = "Adaptive Correlation")]
    AdaptiveCorrelation,
}

impl AlarmPrioritization {
    const LABELS: &'static [(&'static str, Self)] =
        &[("critical first", Self::CriticalFirst), ("adaptive correlation", Self::AdaptiveCorrelation)];

    /// Match a raw value against the fixed enum set case-insensitively (§6).
    fn canonicalize(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_lowercase();
        Self::LABELS.iter().find(|(label, _)| *label == needle).map(|(_, v)| *v)
    }
}

/// Whether the Supervisor executes mitigation automatically or routes through
/// the human approval queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaysOfWorking {
    #[serde(rename = "E2E automation")]
    E2eAutomation,
    #[serde(rename = "Human intervention at critical steps")]
    HumanInterventionAtCriticalSteps,
}

impl WaysOfWorking {
    const LABELS: &'static [(&'static str, Self)] = &[
        ("e2e automation", Self::E2eAutomation),
        ("human intervention at critical steps", Self::HumanInterventionAtCriticalSteps),
    ];

    fn canonicalize(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_lowercase();
        Self::LABELS.iter().find(|(label, _)| *label == needle).map(|(_, v)| *v)
    }
}

/// KPI alignment target; informational, carried through for display/reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KpiAlignment {
    #[serde(rename = ">95%")]
    Above95,
    #[serde(rename = "75%")]
    Seventy5,
}

impl KpiAlignment {
    const LABELS: &'static [(&'static str, Self)] = &[(">95%", Self::Above95), ("75%", Self::Seventy5)];

    fn canonicalize(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_lowercase();
        Self::LABELS.iter().find(|(label, _)| *label == needle).map(|(_, v)| *v)
    }
}

/// Current policy snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub alarm_prioritization: AlarmPrioritization,
    pub ways_of_working: WaysOfWorking,
    pub kpi_alignment: KpiAlignment,
    pub updated_at: String,
    pub version: u64,
    pub source: String,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            alarm_prioritization: AlarmPrioritization::AdaptiveCorrelation,
            ways_of_working: WaysOfWorking::HumanInterventionAtCriticalSteps,
            kpi_alignment: KpiAlignment::Above95,
            updated_at: crate::model::now_iso(),
            version: 1,
            source: "default".to_string(),
        }
    }
}

/// A requested patch to the policy. Any field left `None` is left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyPatch {
    pub alarm_prioritization: Option<AlarmPrioritization>,
    pub ways_of_working: Option<WaysOfWorking>,
    pub kpi_alignment: Option<KpiAlignment>,
}

/// The same patch shape, but as the raw strings an untyped caller (e.g. an
/// operator-facing surface) would submit. `PolicyStore::patch_raw` canonicalizes
/// these case-insensitively against the fixed enum sets (§6) before applying.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPolicyPatch {
    pub alarm_prioritization: Option<String>,
    pub ways_of_working: Option<String>,
    pub kpi_alignment: Option<String>,
}

/// A raw patch field didn't match any of its enum's fixed values.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {field} value: {value:?}")]
pub struct UnknownPolicyValue {
    pub field: &'static str,
    pub value: String,
}

/// The policy store. Reads are a cheap `Arc` snapshot; writes go through
/// `patch`, which validates and bumps `version` atomically relative to other
/// writers observing the previous snapshot.
#[derive(Clone)]
pub struct PolicyStore {
    inner: Adaptive<Policy>,
    manual_auto_override: Adaptive<Option<bool>>,
}

impl PolicyStore {
    pub fn new(initial: Policy) -> Self {
        Self { inner: Adaptive::new(initial), manual_auto_override: Adaptive::new(None) }
    }

    /// Current policy snapshot.
    pub fn get(&self) -> Arc<Policy> {
        self.inner.get()
    }

    /// Apply a patch, bumping `version`. Per the invariant in §8, a no-op patch
    /// still counts as an accepted mutation if it was explicitly submitted with
    /// at least one field set; an entirely empty patch returns the unchanged
    /// snapshot without bumping version.
    pub fn patch(&self, patch: PolicyPatch, source: impl Into<String>) -> Arc<Policy> {
        if patch.alarm_prioritization.is_none()
            && patch.ways_of_working.is_none()
            && patch.kpi_alignment.is_none()
        {
            return self.get();
        }
        let source = source.into();
        self.inner.update(|cur| Policy {
            alarm_prioritization: patch.alarm_prioritization.unwrap_or(cur.alarm_prioritization),
            ways_of_working: patch.ways_of_working.unwrap_or(cur.ways_of_working),
            kpi_alignment: patch.kpi_alignment.unwrap_or(cur.kpi_alignment),
            updated_at: crate::model::now_iso(),
            version: cur.version + 1,
            source: source.clone(),
        });
        self.get()
    }

    /// Canonicalize a raw (case-insensitive) patch against the fixed enum sets
    /// and apply it (§6). Rejects the whole patch without mutating state if
    /// any field is set to a value outside its enum (§3, §8).
    pub fn patch_raw(
        &self,
        raw: RawPolicyPatch,
        source: impl Into<String>,
    ) -> Result<Arc<Policy>, UnknownPolicyValue> {
        let alarm_prioritization = raw
            .alarm_prioritization
            .as_deref()
            .map(|v| {
                AlarmPrioritization::canonicalize(v)
                    .ok_or_else(|| UnknownPolicyValue { field: "alarmPrioritization", value: v.to_string() })
            })
            .transpose()?;
        let ways_of_working = raw
            .ways_of_working
            .as_deref()
            .map(|v| {
                WaysOfWorking::canonicalize(v)
                    .ok_or_else(|| UnknownPolicyValue { field: "waysOfWorking", value: v.to_string() })
            })
            .transpose()?;
        let kpi_alignment = raw
            .kpi_alignment
            .as_deref()
            .map(|v| {
                KpiAlignment::canonicalize(v)
                    .ok_or_else(|| UnknownPolicyValue { field: "kpiAlignment", value: v.to_string() })
            })
            .transpose()?;

        Ok(self.patch(PolicyPatch { alarm_prioritization, ways_of_working, kpi_alignment }, source))
    }

    /// Manual override of the auto/HITL toggle, independent of `ways_of_working`.
    /// `None` means "defer to policy".
    pub fn set_manual_auto(&self, value: Option<bool>) {
        self.manual_auto_override.set(value);
    }

    /// Current manual override value, for display by the control surface.
    pub fn manual_auto(&self) -> Option<bool> {
        *self.manual_auto_override.get()
    }

    /// §4.4.3 step 7: `autoEffective = policy.waysOfWorking == E2E automation OR manualAutoToggle`.
    pub fn auto_effective(&self) -> bool {
        if let Some(manual) = *self.manual_auto_override.get() {
            if manual {
                return true;
            }
        }
        self.get().ways_of_working == WaysOfWorking::E2eAutomation
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}
