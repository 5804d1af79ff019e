//! Runtime adapters for Forge (config, rules/history, artifact storage).

pub mod config;
pub mod rules;
pub mod store;
pub mod util;

pub use config::{Config, RetrySettings};
pub use rules::{FileRulesStore, RulesProvider};
pub use store::{ArtifactStore, DirArtifactStore, StoreError};
