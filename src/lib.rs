//! Governor heartbeat and live-view broadcast core, plus the wealth-bridge
//! relay and AI proxy used by the sibling binaries.

pub mod auditor;
pub mod config;
pub mod governor;
pub mod heartbeat;
pub mod http;
pub mod ledger;
pub mod matrix;
pub mod orchestrator;
pub mod payload;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod transport;

pub use governor::{
    CountermeasureSet, CycleOutcome, Governor, GovernorAction, GovernorSet, SensorError,
    SignalSource,
};
pub use heartbeat::{Heartbeat, MetricsCollector, TickError, TickReport};
pub use ledger::{LedgerEntry, StressLedger};
pub use orchestrator::{OrchestratorVerdict, STATUS_SYNCED};
pub use payload::{BroadcastPayload, DomainReading};
pub use registry::{BroadcastReport, ConnectionRegistry, SendError, Subscriber, SubscriberId};
pub use telemetry::Telemetry;
