//! Actor-based monitoring pipeline
//!
//! Each actor runs as an independent tokio task and is controlled through a
//! cloneable handle wrapping its mpsc command channel.
//!
//! ```text
//!   CollectorActor (one per target and probe kind)
//!        │ store samples, then publish
//!        ▼
//!   broadcast::Sender<SampleEvent> ──▶ EvaluatorActor ──▶ IncidentManager
//!                                                            │
//!   AggregatorActor ◀── store, thresholds, open incidents    ▼
//!        │                                            status cache
//!        └────────────────────────────────────────────────▶ (active set)
//!
//!   RollupActor: daily totals, cost samples, retention
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: mpsc channel per actor for control messages
//! 2. **Events**: broadcast channel for fan-out of stored samples
//! 3. **Request/Response**: oneshot channels inside commands

pub mod aggregator;
pub mod collector;
pub mod evaluator;
pub mod messages;
pub mod rollup;

pub use aggregator::AggregatorHandle;
pub use collector::{CollectorHandle, CollectorSettings};
pub use evaluator::EvaluatorHandle;
pub use messages::{CollectionReport, SampleEvent};
pub use rollup::{Rollup, RollupHandle, RollupSettings};
