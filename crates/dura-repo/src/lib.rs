//! Layered, mergeable repositories on top of the durable registry.
//!
//! A [`Repo`] is a durable object holding sequenced updates in a stack of
//! immutable [`DataLayer`]s. An ordered [`Mapping`] lists the live layers;
//! merge steps publish new mappings and hand replaced layers to the
//! [`RemovalQueue`], which reclaims them once no mapping references them.
//!
//! # Key Types
//!
//! - [`RepoManager`]: registry, merge workers, and layer cleaner in one
//! - [`Repo`] / [`RepoView`]: the repository and a read snapshot of it
//! - [`Mapping`] / [`Entry`] / [`DataLayer`]: the layer hierarchy
//! - [`LayerFiles`]: storage for the layer files of safe repositories
//! - [`EngineConfig`]: TOML-loadable configuration

pub mod config;
pub mod error;
pub mod files;
pub mod layer;
pub mod manager;
pub mod mapping;
pub mod removal;
pub mod repo;
pub mod update;

pub use config::EngineConfig;
pub use error::{RepoError, RepoResult};
pub use files::{DirLayerFiles, FileMeta, InMemoryLayerFiles, LayerFiles};
pub use layer::{DataLayer, LayerId, LayerSource};
pub use manager::RepoManager;
pub use mapping::{Entry, Mapping};
pub use removal::{LayerCleaner, RemovalConfig, RemovalQueue};
pub use repo::{generation_for, Repo, RepoContext, RepoLocks, RepoOptions, RepoView, StepLocks};
pub use update::Update;
