//! Local-filesystem and remote replacements that bypass the registry.
//!
//! A replacement maps a qualified module path either to a directory
//! relative to the main module root or to another `(path, version)`
//! served by the underlying registry. Requirements and source fetches
//! for a locally replaced module come straight from the directory; the
//! module never touches the network.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::errors::Result;
use crate::manifest::Manifest;
use crate::par::Cancellation;
use crate::path;
use crate::registry::{Registry, SourceLoc};
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    /// A directory relative to the main module root.
    Local(PathBuf),
    /// Another module version in the underlying registry.
    Remote(Version),
}

#[derive(Debug, Clone, Default)]
pub struct Replacements {
    map: BTreeMap<String, Replacement>,
}

fn check_local_replacement_path(spec: &str) -> Result<()> {
    if spec.is_empty() {
        anyhow::bail!("empty replacement path");
    }
    if spec.starts_with('/') && !spec.starts_with("//") {
        anyhow::bail!("replacement path {:?} is absolute", spec);
    }
    if spec.starts_with("\\\\") || spec.starts_with("//") {
        anyhow::bail!("replacement path {:?} is a UNC path", spec);
    }
    if spec.starts_with('\\') {
        anyhow::bail!("replacement path {:?} is absolute", spec);
    }
    let bytes = spec.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        anyhow::bail!("replacement path {:?} has a drive letter root", spec);
    }
    Ok(())
}

impl Replacements {
    /// Parses `(module path, replacement)` pairs. A replacement of the
    /// form `path@version` is remote; anything else is a local
    /// directory. Strict mode rejects local directories outright, and
    /// a module path may be replaced at most once.
    pub fn parse<I, S>(entries: I, strict: bool) -> Result<Replacements>
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for (mpath, spec) in entries {
            let (mpath, spec) = (mpath.as_ref(), spec.as_ref());
            path::check_module_path(mpath)?;
            if mpath == "local" {
                anyhow::bail!("the local module cannot be replaced");
            }
            let replacement = match Version::parse(spec) {
                Ok(v) => Replacement::Remote(v),
                Err(_) => {
                    check_local_replacement_path(spec)
                        .with_context(|| format!("invalid replacement for {}", mpath))?;
                    if strict {
                        anyhow::bail!(
                            "local replacement {:?} for {} not allowed in strict mode",
                            spec,
                            mpath
                        );
                    }
                    Replacement::Local(PathBuf::from(spec))
                }
            };
            match map.entry(mpath.to_string()) {
                Entry::Vacant(e) => {
                    e.insert(replacement);
                }
                Entry::Occupied(_) => {
                    anyhow::bail!("multiple replacements for module {}", mpath);
                }
            }
        }
        Ok(Replacements { map })
    }

    pub fn get(&self, module_path: &str) -> Option<&Replacement> {
        self.map.get(module_path)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A registry wrapper that intercepts replaced modules.
pub struct ReplacedRegistry {
    inner: Arc<dyn Registry>,
    replacements: Replacements,
    main_root: PathBuf,
}

impl ReplacedRegistry {
    pub fn new(
        inner: Arc<dyn Registry>,
        replacements: Replacements,
        main_root: impl Into<PathBuf>,
    ) -> ReplacedRegistry {
        ReplacedRegistry {
            inner,
            replacements,
            main_root: main_root.into(),
        }
    }

    fn local_dir(&self, rel: &Path) -> PathBuf {
        self.main_root.join(rel)
    }
}

impl Registry for ReplacedRegistry {
    fn requirements(&self, cancel: &Cancellation, m: &Version) -> Result<Vec<Version>> {
        match self.replacements.get(m.path()) {
            None => self.inner.requirements(cancel, m),
            Some(Replacement::Remote(r)) => self.inner.requirements(cancel, r),
            Some(Replacement::Local(rel)) => {
                let dir = self.local_dir(rel);
                let file = dir.join("cue.mod").join("module.cue");
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("cannot read {}", file.display()))?;
                let mf = Manifest::parse_non_strict(&text, &file.display().to_string())?;
                log::debug!("module {} replaced by local directory {}", m, dir.display());
                mf.dep_versions()
            }
        }
    }

    fn fetch(&self, cancel: &Cancellation, m: &Version) -> Result<SourceLoc> {
        match self.replacements.get(m.path()) {
            None => self.inner.fetch(cancel, m),
            Some(Replacement::Remote(r)) => self.inner.fetch(cancel, r),
            Some(Replacement::Local(rel)) => {
                let dir = self.local_dir(rel);
                if !dir.is_dir() {
                    anyhow::bail!(
                        "replacement directory {} for module {} does not exist",
                        dir.display(),
                        m
                    );
                }
                Ok(SourceLoc::new_local(dir))
            }
        }
    }

    fn module_versions(&self, cancel: &Cancellation, mpath: &str) -> Result<Vec<String>> {
        self.inner.module_versions(cancel, mpath)
    }
}
