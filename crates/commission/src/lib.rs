//! Commission — rule evaluation and immutable commission snapshots.
//!
//! Rules are read-only inputs; the engine writes one append-only snapshot
//! set per approved conversion and compensating reversals on rejection.
//! Stores are `DashMap`-backed in this crate; a database implementation
//! plugs in behind [`RuleStore`] and [`SnapshotStore`].

pub mod engine;
pub mod rules;
pub mod store;

pub use engine::{CommissionEngine, CommissionOutcome};
pub use rules::{CommissionAction, CommissionRule, RuleCondition, TierBracket};
pub use store::{InMemoryRuleStore, InMemorySnapshotStore, RuleStore, SnapshotStore};
