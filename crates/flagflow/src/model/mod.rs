//! The flag and segment data model shared by ingestion, storage, and
//! evaluation.

pub mod clause;
pub mod flag;
pub mod preprocessed;
pub mod segment;

pub use clause::{Clause, Operator};
pub use flag::{
    FeatureFlag, FlagRule, Prerequisite, Rollout, RolloutKind, Target, VariationOrRollout,
    WeightedVariation,
};
pub use segment::{Segment, SegmentRule, SegmentTarget};
