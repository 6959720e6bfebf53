mod context;
pub mod executor;
pub mod listeners;
pub mod orphans;
pub mod planner;

use serde::{Deserialize, Serialize};

pub use executor::{FlushExecutor, FlushReport};
pub use listeners::{ListenerPhase, ListenerRegistry, ViewTransition};
pub use orphans::{CollectOutcome, OrphanCollector};
pub use planner::{FlushPlan, FlushPlanner, PlannedDelete, PlannedWrite, WriteKind};

/// How wide update statements are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlushMode {
    /// Rewrite every updatable attribute of a dirty instance.
    Full,
    /// Write only the attributes that effectively changed.
    #[default]
    Partial,
}

/// How provider adapters are expected to issue writes. Forwarded, never
/// interpreted by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlushStrategy {
    /// Direct statements per operation.
    #[default]
    Query,
    /// Materialize provider-side entities and let the provider flush.
    Entity,
}

/// Flush behavior for one view type, or the manager-wide default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushConfig {
    pub mode: FlushMode,
    pub strategy: FlushStrategy,
    /// Carry version guards on updates and removes of versioned types.
    pub optimistic_locking: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            mode: FlushMode::Partial,
            strategy: FlushStrategy::Query,
            optimistic_locking: true,
        }
    }
}

impl FlushConfig {
    pub fn full(mut self) -> Self {
        self.mode = FlushMode::Full;
        self
    }

    pub fn partial(mut self) -> Self {
        self.mode = FlushMode::Partial;
        self
    }

    pub fn with_strategy(mut self, strategy: FlushStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn without_optimistic_locking(mut self) -> Self {
        self.optimistic_locking = false;
        self
    }
}

/// Per-call flush options.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    /// Treat every type as [`FlushMode::Full`] for this flush only.
    pub force_full: bool,
}
