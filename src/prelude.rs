//! Convenient re-exports for common types.
pub use crate::{
    adaptive::Adaptive,
    agents::{Agent, AgentStatus},
    backoff::Backoff,
    bus::IncidentBus,
    config::Config,
    delta::DeltaEmitter,
    jitter::Jitter,
    model::{Alarm, BusEvent, Service, Site, Snapshot},
    policy::{Policy, PolicyStore},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    supervisor::Supervisor,
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
    tower_bridge::TowerBridge,
    tower_client::{TowerClient, TowerClientError},
    tower_stream::{HttpTowerStreamSource, TowerStreamSource},
    ResilienceError,
};
