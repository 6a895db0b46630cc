//! User script management and injection engine.
//!
//! Greasemonkey-style scripts live as flat files in a storage directory. The
//! repository loads and reconciles them against persisted preferences, then
//! serializes the active set into a read-only distribution region. Consumers
//! decode duplicates of that region and schedule injection per document
//! lifecycle stage through an embedder-provided host.
//!
//! ## Pieces
//!
//! - **script**: the record model and metadata header parser
//! - **matcher**: glob / URL-pattern admission and origin fallback
//! - **repository**: storage scan, preference reconciliation, distribution
//! - **distribution**: the versioned binary wire format and region handle
//! - **scheduler**: per-document lifecycle state machine and injection passes

pub mod cache;
pub mod config;
pub mod distribution;
pub mod matcher;
pub mod repository;
pub mod scheduler;
pub mod script;
pub mod types;

pub use cache::SourceCache;
pub use config::ScriptsConfig;
pub use distribution::{ScriptRegion, MAX_SCRIPT_COUNT};
pub use repository::{ScriptEvent, ScriptRepository};
pub use scheduler::{
    InjectionHost, InjectionKind, InjectionOutcome, InjectionRequest, InjectionScheduler,
    ScriptSet, Stage,
};
pub use script::{MatchOriginAsFallback, RunLocation, ScriptFile, UserScript};
pub use types::{ContextId, Result, ScriptError};
