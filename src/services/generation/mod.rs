//! Generation orchestration services

pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod phase;
pub mod phase_parser;
pub mod spawner;

pub use events::{FailureKind, GenerationEvent, GenerationEventEmitter, GenerationEventKind};
pub use executor::{RunnerConfig, RunnerExecutor};
pub use lifecycle::GenerationLifecycleManager;
pub use phase::{ExecutionPhase, PhaseCursor, PhaseTransition};
pub use spawner::{CliRunConfig, CliSpawnResult, CliSpawner, SpawnerConfig};
