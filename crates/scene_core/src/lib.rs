//! # scene_core
//!
//! Pipeline orchestration engine for SceneForge.
//!
//! This crate turns a natural-language prompt into a 3D scene by driving a
//! fixed set of specialist agents through a staged pipeline, with a critique
//! loop, error recovery and shared token-rate limiting.
//!
//! # Architecture
//!
//! - **Orchestrator**: caller-facing facade owning the shared state
//! - **Pipeline**: per-session state machine and critique loop
//! - **Graph**: concurrent fan-out/fan-in over stage dependencies
//! - **Context bus**: typed publications, subscriptions, shared assets
//! - **Recovery**: error classification, retry, one-hop fallback
//! - **Rate limiter**: per-minute token windows and per-caller pacing
//! - **Registry**: session lifecycle and progress
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scene_agents::TemplateAgent;
//! use scene_core::{GenerationOptions, PipelineConfig, SceneOrchestrator};
//! use scene_runner::DryRunExecutor;
//!
//! let orchestrator = SceneOrchestrator::new(
//!     PipelineConfig::default(),
//!     TemplateAgent::registry(),
//!     Arc::new(DryRunExecutor::new()),
//! )?;
//!
//! let result = orchestrator
//!     .create_scene("a red cube on a wooden table", GenerationOptions::new())
//!     .await;
//! println!("{}", result.summary());
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod persistence;
pub mod pipeline;
pub mod rate_limit;
pub mod recovery;
pub mod registry;
pub mod result;
pub mod stage;
pub mod telemetry;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ExecutionSettings, FallbackEdge, GenerationOptions, PipelineConfig, ResolvedOptions, SchedulingMode};
pub use context::{
    AssetValue, CollaborationEvent, ContextBus, ContextEntry, ContextType, EventType, PendingContext, Publication,
    SharedAsset, SubscriptionId,
};
pub use driver::{DriverSettings, StageDriver, StageOutcome, SCENE_ASSET};
pub use error::{CoreError, CoreResult};
pub use graph::{ExecutionGraph, PassReport};
pub use orchestrator::SceneOrchestrator;
pub use persistence::{GenerationSink, JsonFileSink, SessionRecord};
pub use pipeline::{refine_roles, PipelineOutcome, StagePipeline};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimiter};
pub use recovery::{
    ErrorContext, ErrorKind, FallbackMap, RecoveryAction, RecoveryDecision, RecoveryPolicy, RecoveryRouter,
};
pub use registry::{AgentAction, ProgressEntry, Session, SessionRegistry, SessionStatus};
pub use result::GenerationResult;
pub use stage::{
    default_dependencies, resolve_dependencies, PipelineState, PipelineTrace, StageRecord, StageStatus,
    StateTransition,
};
pub use telemetry::{Telemetry, TelemetrySnapshot};
