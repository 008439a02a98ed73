//! Attribution — assigns conversion credit among partner touches under the
//! `first_click`, `last_click`, `linear`, and `time_decay` models, and
//! tracks the funnel journeys those touches belong to.

pub mod engine;
pub mod journey;

pub use engine::AttributionEngine;
pub use journey::{JourneyTracker, TouchStore};
