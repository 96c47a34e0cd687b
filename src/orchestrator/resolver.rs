//! Binary resolution seam.
//!
//! Locating and version-checking the host CLI is owned by an external
//! collaborator. The orchestrator only needs a path it can execute.

use std::path::{Path, PathBuf};

use crate::{AppError, Result};

/// An executable ready to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinary {
    /// Absolute or PATH-resolved executable path.
    pub path: PathBuf,
    /// Version reported by the resolver, when known.
    pub version: Option<String>,
}

/// Produces the executable for new sessions.
pub trait BinaryResolver: Send + Sync + std::fmt::Debug {
    /// Resolve the executable.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Resolve`] if no usable executable is available.
    fn resolve(&self) -> Result<ResolvedBinary>;
}

/// Resolves a fixed program name or path, searching `PATH` for bare names.
#[derive(Debug, Clone)]
pub struct StaticBinaryResolver {
    program: PathBuf,
    version: Option<String>,
}

impl StaticBinaryResolver {
    /// Resolve `program` with no version information.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            version: None,
        }
    }

    /// Attach a version string reported with every resolution.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl BinaryResolver for StaticBinaryResolver {
    fn resolve(&self) -> Result<ResolvedBinary> {
        let path = if self.program.components().count() > 1 || self.program.is_absolute() {
            if self.program.is_file() {
                self.program.clone()
            } else {
                return Err(AppError::Resolve(format!(
                    "{} does not exist",
                    self.program.display()
                )));
            }
        } else {
            search_path(&self.program).ok_or_else(|| {
                AppError::Resolve(format!("{} not found on PATH", self.program.display()))
            })?
        };
        Ok(ResolvedBinary {
            path,
            version: self.version.clone(),
        })
    }
}

fn search_path(program: &Path) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
