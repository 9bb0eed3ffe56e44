//! coedit engine - block locks, intent queue and concurrent pipeline analysis

pub mod coordinator;
pub mod events;
pub mod intents;
pub mod locks;
pub mod pipeline;
pub mod session;
pub mod sqlite;
pub mod store;

pub use coordinator::{Coordinator, DisconnectReport, LockGrants};
pub use events::EventBus;
pub use intents::{GrantHandler, IntentQueue};
pub use locks::{LockManager, SweepReport};
pub use pipeline::{
    AnalysisReport, PipelineCoordinator, PreparedAnalysis, SimulatedTurns, TurnContext,
    TurnExecutor,
};
pub use session::{AnalysisRegistry, AnalysisSession};
pub use sqlite::SqliteLockStore;
pub use store::{InsertOutcome, LockStore, MemoryLockStore};
