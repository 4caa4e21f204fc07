//! Kairn apply engine: ordering, diffing, apply/prune orchestration and result rendering.

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod collection;
pub mod deploy;
pub mod diff;
pub mod error;
pub mod kinds;
pub mod ordering;
pub mod quantity;
pub mod record;
pub mod render;

pub use aggregate::ResultCollector;
pub use collection::{DeploymentCollection, DeploymentItem, Hint, InclusionFilter, Prepared, PreparedItem};
pub use deploy::{DeployOptions, Deployer};
pub use diff::{diff, IgnoreRules, ObjectDiff, TaggedRule};
pub use error::{ConfigError, EngineError, ItemError};
pub use kinds::KindRegistry;
pub use ordering::{OrderNode, OrderingIndex, Rank};
pub use record::{Action, ChangeKind, ChangeRecord, CommandResult, FieldChange, Outcome, RunMessage, Summary};
