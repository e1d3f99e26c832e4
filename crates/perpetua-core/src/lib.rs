//! Perpetua core: the per-agent event-processing engine.
//!
//! Turns an unbounded stream of inbound events (messages, scheduled
//! triggers, proactive wake-ups) into a bounded sequence of LLM-driven
//! steps, each of which may invoke tools, produce outbound messages, mutate
//! agent state, and consume a credit budget.
//!
//! The crate is DB-agnostic: persistence lives behind the store traits in
//! [`traits`], with a complete in-memory backend in [`memory`] and a
//! Postgres backend in the storage crate.

pub mod agent;
pub mod burn_rate;
pub mod clock;
pub mod compute;
pub mod config;
pub mod credit;
pub mod digest;
pub mod dup_guard;
pub mod engine;
pub mod error;
pub mod evals;
pub mod expiration;
pub mod hints;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod message;
pub mod proactive;
pub mod prompt;
pub mod routing;
pub mod skeleton;
pub mod step;
pub mod tools;
pub mod traits;
pub mod transfer;
pub mod variable;

pub use agent::{Agent, AllowlistPolicy, LifeState, OwnerRef, PlanKind, PreferredTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ToolPlanSettings};
pub use credit::{Credits, DailyCreditSettings};
pub use engine::{Engine, EngineParts, LoopOutcome};
pub use error::{EngineError, Result};
pub use lifecycle::{LifecycleRegistry, ShutdownHandler, ShutdownReason};
pub use llm::{CompletionDriver, DriverRegistry, EmbeddingsDriver};
pub use memory::InMemoryStore;
pub use message::{CommsChannel, CommsEndpoint, Conversation, Message, NewMessage};
pub use routing::{ProviderBackend, RoutingProfile};
pub use step::{Step, SystemStep, SystemStepCode, ToolCallRecord};
pub use tools::{Tool, ToolRegistry};
pub use variable::Variable;
