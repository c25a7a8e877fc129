//! # Gauntlet
//!
//! A capability-evaluation and adaptive-teaching engine for tool-calling
//! language models. It answers three questions: did a model invoke the
//! right capability with the right arguments, even under a non-canonical
//! name; does that competence hold up over long multi-turn sessions; and
//! when a model fails, can a corrective "prosthetic" prompt be
//! synthesized — optionally by distilling a stronger model's behavior —
//! and verified to fix the failure.
//!
//! Component order, leaf first: the capability [`catalog`], the fuzzy
//! tool-call [`resolver`], the probe [`registry`], the [`battery`]
//! executor, the [`stateful`] degradation tester, the [`scoring`]
//! aggregator, the [`failure`] log and observer, and the [`prosthetic`]
//! subsystem. External collaborators (model invocation, resource
//! management, persistence, broadcast) live behind the traits in
//! [`interfaces`]; the HTTP surface in [`server`] is a thin pass-through.

pub mod battery;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod failure;
pub mod interfaces;
pub mod prosthetic;
pub mod registry;
pub mod resolver;
pub mod scoring;
pub mod server;
pub mod stateful;

pub use battery::{BatteryExecutor, CancelToken, ComboTestResult, RunRequest, RunStatus};
pub use catalog::{Capability, CapabilityCatalog};
pub use config::EngineConfig;
pub use errors::{EngineError, Result};
pub use registry::{Category, ProbeResult, TestMode, TestRegistry, Tier};
pub use resolver::{MatchMethod, ObservedCall, ResolutionResult, Resolver};
pub use scoring::{aggregate, ScoreReport};

pub const VERSION: &str = "0.1.0";
