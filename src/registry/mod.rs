//! The registry capability set the resolver core consumes.
//!
//! Implementations: the on-disk [`crate::cache::Cache`] layered over an
//! OCI client ([`oci::OciClient`]), the local-replacement wrapper
//! ([`crate::replace::ReplacedRegistry`]), and in-memory registries in
//! tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::errors::Result;
use crate::manifest::Manifest;
use crate::par::Cancellation;
use crate::version::Version;

pub mod oci;

/// A read-only file tree plus a directory within it.
///
/// The tree is always rooted in the OS file system; `os_root` is the
/// escape hatch for callers that need to run native tools against it.
#[derive(Debug, Clone)]
pub struct SourceLoc {
    os_root: Arc<PathBuf>,
    dir: PathBuf,
    local: bool,
}

impl SourceLoc {
    /// A location inside the registry cache.
    pub fn new(root: impl Into<PathBuf>) -> SourceLoc {
        SourceLoc {
            os_root: Arc::new(root.into()),
            dir: PathBuf::new(),
            local: false,
        }
    }

    /// A location inside the main module tree (or a local replacement
    /// directory); candidates found here are subject to the
    /// nested-module guard.
    pub fn new_local(root: impl Into<PathBuf>) -> SourceLoc {
        SourceLoc {
            os_root: Arc::new(root.into()),
            dir: PathBuf::new(),
            local: true,
        }
    }

    /// The same tree, with `rel` appended to the directory.
    pub fn join(&self, rel: impl AsRef<Path>) -> SourceLoc {
        SourceLoc {
            os_root: Arc::clone(&self.os_root),
            dir: self.dir.join(rel),
            local: self.local,
        }
    }

    /// The root of the tree on the OS file system.
    pub fn os_root(&self) -> &Path {
        &self.os_root
    }

    /// The directory within the tree, relative to the root.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The directory as an absolute OS path.
    pub fn abs_dir(&self) -> PathBuf {
        self.os_root.join(&self.dir)
    }

    /// Whether the tree belongs to the main module rather than the
    /// registry cache.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn read_file(&self, rel: impl AsRef<Path>) -> Result<String> {
        let p = self.abs_dir().join(rel);
        fs::read_to_string(&p).with_context(|| format!("cannot read {}", p.display()))
    }

    pub fn file_exists(&self, rel: impl AsRef<Path>) -> bool {
        self.abs_dir().join(rel).is_file()
    }

    pub fn dir_exists(&self) -> bool {
        self.abs_dir().is_dir()
    }

    /// Whether the directory contains at least one regular file with
    /// the given extension (not recursively).
    pub fn has_files_with_ext(&self, ext: &str) -> bool {
        let dir = self.abs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return false,
        };
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_file() && p.extension().map(|e| e == ext).unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

/// The resolution-facing registry interface.
pub trait Registry: Send + Sync {
    /// The direct requirements of one module version.
    fn requirements(&self, cancel: &Cancellation, m: &Version) -> Result<Vec<Version>>;

    /// The source tree of one module version.
    fn fetch(&self, cancel: &Cancellation, m: &Version) -> Result<SourceLoc>;

    /// All canonical versions available for a module path, sorted by
    /// SemVer precedence. A path with a major suffix restricts the list
    /// to that major; without one, versions of every major are
    /// returned.
    fn module_versions(&self, cancel: &Cancellation, mpath: &str) -> Result<Vec<String>>;
}

/// The wire-level download interface the cache sits on top of.
pub trait Remote: Send + Sync {
    /// The raw `cue.mod/module.cue` text of a module version.
    fn module_file(&self, cancel: &Cancellation, m: &Version) -> Result<Vec<u8>>;

    /// Streams the module archive into `out`.
    fn module_zip(
        &self,
        cancel: &Cancellation,
        m: &Version,
        out: &mut dyn std::io::Write,
    ) -> Result<u64>;

    /// Same contract as [`Registry::module_versions`].
    fn module_versions(&self, cancel: &Cancellation, mpath: &str) -> Result<Vec<String>>;
}

/// Derives a module version's direct requirements from its manifest
/// text: the sorted dependency list of `cue.mod/module.cue`.
pub fn requirements_from_module_file(data: &str, m: &Version) -> Result<Vec<Version>> {
    let mf = Manifest::parse_non_strict(data, &format!("{}: cue.mod/module.cue", m))?;
    mf.dep_versions()
}
