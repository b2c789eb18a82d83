//! Property-based test execution engine built on typed choice sequences.
//!
//! All randomness flows through strongly-typed choices with associated
//! constraints, so any generated input can be replayed, persisted and
//! shrunk as plain data. Strategies draw values through
//! [`ConjectureData`]; the [`engine::Runner`] drives attempts through
//! explicit, reuse, generate, shrink and explain phases; failures are
//! minimized by a pass-based shrinker and stored in a pluggable example
//! database.

pub mod choice;
pub mod data;
pub mod database;
pub mod engine;
pub mod errors;
pub mod observe;
pub mod provider;
pub mod shrinker;
pub mod stateful;
pub mod strategy;
pub mod target;

// Re-export the surface most tests touch.
pub use choice::{ChoiceNode, ChoiceType, ChoiceValue, Constraints};
pub use data::{ConjectureData, ConjectureResult, InterestingOrigin, Span, Status};
pub use database::{
    choices_from_bytes, choices_to_bytes, database_key, default_database, set_default_database,
    BackgroundWriteDatabase, DirectoryDatabase, ExampleDatabase, InMemoryDatabase,
    MultiplexedDatabase, ReadOnlyDatabase,
};
pub use engine::{
    check, default_settings, set_default_settings, FailureReport, FuzzOutcome, Phase, RunReport,
    Runner, RunStats, Settings, Verbosity,
};
pub use errors::{assume, verify, DrawError, EngineError, HealthCheck, TestError};
pub use observe::Observation;
pub use provider::{make_provider, register_provider, PrimitiveProvider, StandardProvider};
pub use shrinker::{ShrinkOutcome, Shrinker};
pub use stateful::{check_state_machine, run_state_machine, Bundle, RuleDef, RuleSet};
pub use strategy::{
    any_float, any_integer, binary, booleans, deferred, floats, integers, just, one_of,
    sampled_from, text, vec_of, weighted, BoxedStrategy, Strategy,
};
pub use target::TargetState;
