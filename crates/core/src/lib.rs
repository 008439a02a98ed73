//! Shared foundation for the affiliate settlement engine: configuration,
//! error taxonomy, domain types, exact-decimal money helpers, and the
//! tracking-boundary stores.

pub mod config;
pub mod error;
pub mod money;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{AffiliateError, AffiliateResult};
