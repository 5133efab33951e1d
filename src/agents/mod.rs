//! The three agents (Correlation, Troubleshooting, RCA) and the small
//! trait-object registry the Supervisor holds them through.
//!
//! Rather than wiring each agent's concrete type into the Supervisor (which
//! would tangle correlation/troubleshooting/rca imports together), the
//! Supervisor holds `Arc<dyn Agent>` values behind one small interface, the
//! same way `Sleeper`/`Clock`/`TelemetrySink` are kept as trait-object seams
//! instead of per-call-site concrete wiring.

pub mod correlation;
pub mod rca;
pub mod troubleshooting;

use async_trait::async_trait;

/// Lifecycle state any agent can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Stopped,
    Running,
}

/// Minimal lifecycle surface the Supervisor drives every agent through.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self);
    async fn stop(&self);
    fn status(&self) -> AgentStatus;
}

pub use correlation::CorrelationAgent;
pub use rca::RcaAgent;
pub use troubleshooting::TroubleshootingAgent;
