use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::version::Version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;
pub use anyhow::format_err;

/// Which flavor of path failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Module,
    Import,
    File,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Module => f.write_str("module"),
            PathKind::Import => f.write_str("import"),
            PathKind::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, Error)]
#[error("malformed {kind} path {path:?}: {cause}")]
pub struct InvalidPath {
    pub kind: PathKind,
    pub path: String,
    pub cause: String,
}

#[derive(Debug, Error)]
#[error("invalid version {version:?}: {cause}")]
pub struct InvalidVersion {
    pub version: String,
    pub cause: String,
}

/// No module in the requirements (or the registry) provides the import.
#[derive(Debug, Error)]
#[error("cannot find module providing package {import_path}")]
pub struct ImportMissing {
    pub import_path: String,
}

/// More than one module in the requirements provides the import.
#[derive(Debug, Error)]
pub struct AmbiguousImport {
    pub import_path: String,
    pub candidates: Vec<Version>,
}

impl fmt::Display for AmbiguousImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ambiguous import: found package {} in multiple modules:",
            self.import_path
        )?;
        for c in &self.candidates {
            write!(f, "\n\t{}", c)?;
        }
        Ok(())
    }
}

/// The entity is known to be absent from the registry, as opposed to
/// being unreachable or denied.
#[derive(Debug, Error)]
#[error("{what}: not found")]
pub struct NotFound {
    pub what: String,
}

/// The registry has a repository for the module but no version tags
/// satisfying the query.
#[derive(Debug, Error)]
#[error("no versions found for module {module_path}")]
pub struct NoVersionsFound {
    pub module_path: String,
}

/// An error loading the module graph, carrying the shortest requirement
/// chain from a root to the module that failed.
#[derive(Debug, Error)]
pub struct BuildListError {
    pub chain: Vec<Version>,
    pub cause: anyhow::Error,
}

impl fmt::Display for BuildListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.chain.len();
        for (i, m) in self.chain.iter().enumerate() {
            if i + 1 < n {
                write!(f, "{} requires\n\t", m)?;
            } else {
                write!(f, "{}: ", m)?;
            }
        }
        write!(f, "{:#}", self.cause)
    }
}

/// The manifest's dependency list is not tidy.
#[derive(Debug, Error)]
pub struct NotTidy {
    pub reason: Option<String>,
}

impl fmt::Display for NotTidy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(r) => write!(f, "module is not tidy: {}", r),
            None => f.write_str("module is not tidy"),
        }
    }
}

#[derive(Debug, Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// An error produced once and observed by several waiters.
///
/// The in-memory caches hand the same failure to every caller of a key.
/// `anyhow::Error` is not `Clone`, so the shared copy travels behind an
/// `Arc`; use [`is_not_found`] rather than a direct downcast when probing
/// an error that may have passed through a cache.
#[derive(Debug, Clone)]
pub struct SharedError(pub Arc<anyhow::Error>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl SharedError {
    pub fn new(err: anyhow::Error) -> SharedError {
        SharedError(Arc::new(err))
    }

    pub fn to_error(&self) -> anyhow::Error {
        anyhow::Error::new(self.clone())
    }
}

/// Reports whether `err` is a registry not-found error, looking through
/// [`SharedError`] wrappers introduced by the caches.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<NotFound>().is_some() {
        return true;
    }
    if let Some(shared) = err.downcast_ref::<SharedError>() {
        return is_not_found(&shared.0);
    }
    false
}

/// Like [`is_not_found`] but for [`NoVersionsFound`].
pub fn is_no_versions(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<NoVersionsFound>().is_some() {
        return true;
    }
    if let Some(shared) = err.downcast_ref::<SharedError>() {
        return is_no_versions(&shared.0);
    }
    false
}
