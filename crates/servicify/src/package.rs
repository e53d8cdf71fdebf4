//! # Package Resolution
//!
//! Offering a package by identifier instead of by callable. Turning an
//! identifier into an export plus `{name, version}` is the resolver's job;
//! this module only screens identifiers and defines the seam.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::target::Export;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("refusing relative path {0:?}; use a package name or an absolute path")]
    RelativePath(String),
    #[error("unable to find package for {0}")]
    NotFound(String),
    #[error("cannot load {identifier}: {reason}")]
    Load { identifier: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A package export together with the package's own metadata.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub export: Export,
}

/// Resolves a package identifier (a name, or an absolute directory).
pub trait PackageResolver: Send + Sync {
    fn resolve(&self, identifier: &str) -> Result<ResolvedPackage>;
}

/// True for `.`, `..`, and anything starting with `./` or `../`.
pub fn is_relative_path(identifier: &str) -> bool {
    let normalized = identifier.replace('\\', "/");
    normalized == "."
        || normalized == ".."
        || normalized.starts_with("./")
        || normalized.starts_with("../")
}

/// Screens the identifier, then asks the resolver.
pub fn resolve(resolver: &dyn PackageResolver, identifier: &str) -> Result<ResolvedPackage> {
    if is_relative_path(identifier) {
        return Err(Error::RelativePath(identifier.to_string()));
    }
    resolver.resolve(identifier)
}

/// An in-memory resolver the host fills in ahead of time.
#[derive(Default)]
pub struct StaticPackages {
    packages: RwLock<HashMap<String, ResolvedPackage>>,
}

impl StaticPackages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `package` resolvable under `identifier`; replaces any earlier entry.
    pub fn insert(&self, identifier: impl Into<String>, package: ResolvedPackage) {
        let mut packages = match self.packages.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        packages.insert(identifier.into(), package);
    }

    pub fn with(self, identifier: impl Into<String>, package: ResolvedPackage) -> Self {
        self.insert(identifier, package);
        self
    }
}

impl PackageResolver for StaticPackages {
    fn resolve(&self, identifier: &str) -> Result<ResolvedPackage> {
        let packages = match self.packages.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        packages
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::NotFound(identifier.to_string()))
    }
}
