//! Core types and configuration for hoist.
//!
//! This crate defines the `hoist.toml` schema ([`HoistConfig`]), platform
//! identifiers ([`Platform`]), dependency resolution ([`Resolver`] producing a
//! [`DependencySet`]), the declarative stage model ([`StageDescriptor`]) and
//! shared error types.

pub mod config;
pub mod dependency;
pub mod error;
pub mod platform;
pub mod resolver;
pub mod stage;

pub use config::{
    BackendConfig, BuildConfig, BuildStep, CacheConfig, ExcludeConfig, HoistConfig,
    InstallersConfig, IsolationMode, PlatformConfig, RetryConfig, RuntimeConfig,
};
pub use dependency::{
    Dependency, DependencyKind, DependencySet, Exclusion, PackageSource, VersionConstraint,
};
pub use error::{Error, Result};
pub use platform::{OsFamily, Platform};
pub use resolver::Resolver;
pub use stage::{StageDescriptor, StageKind};
