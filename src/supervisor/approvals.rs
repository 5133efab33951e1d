//! Human-in-the-loop approval queue (§4.4.4): mitigation plans that policy
//! routes for sign-off instead of automatic execution.

use crate::agents::troubleshooting::PlanStep;
use crate::model::now_iso;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Disposition of a queued approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// One queued mitigation plan awaiting an operator decision.
#[derive(Debug, Clone)]
pub struct Approval {
    pub id: u64,
    pub site_id: String,
    pub plan: Vec<PlanStep>,
    pub alarms: BTreeSet<String>,
    pub created_at: String,
    pub status: ApprovalStatus,
}

/// In-memory queue of pending/resolved approvals.
pub struct ApprovalQueue {
    next_id: AtomicU64,
    items: Mutex<Vec<Approval>>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), items: Mutex::new(Vec::new()) }
    }

    pub fn enqueue(&self, site_id: String, plan: Vec<PlanStep>, alarms: BTreeSet<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let approval = Approval {
            id,
            site_id,
            plan,
            alarms,
            created_at: now_iso(),
            status: ApprovalStatus::Pending,
        };
        self.items.lock().expect("approval queue mutex poisoned").push(approval);
        id
    }

    /// All approvals currently pending, oldest first.
    pub fn list_pending(&self) -> Vec<Approval> {
        self.items
            .lock()
            .expect("approval queue mutex poisoned")
            .iter()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Approval> {
        self.items.lock().expect("approval queue mutex poisoned").clone()
    }

    /// Resolve a pending approval. Returns `None` if `id` is unknown or
    /// already resolved.
    pub fn resolve(&self, id: u64, approved: bool) -> Option<Approval> {
        let mut items = self.items.lock().expect("approval queue mutex poisoned");
        let approval = items.iter_mut().find(|a| a.id == id && a.status == ApprovalStatus::Pending)?;
        approval.status = if approved { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
        Some(approval.clone())
    }
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::new()
    }
}
