//! The on-disk module cache.
//!
//! Per module version the cache holds the raw zip and manifest text
//! under `download/<esc-path>/@v/<esc-version>.{zip,mod}` and the
//! extracted tree under `extract/<esc-path>@<esc-version>/`. Writers to
//! one version are serialized across processes by a `.lock` file; a
//! `.partial` marker brackets extraction so that a crash is recovered
//! by the next reader. Extracted trees are complete exactly when they
//! exist without their marker, and are made read-only on success.
//!
//! In memory, both artifacts are memoized per version: the first caller
//! downloads, concurrent callers wait and observe the same result,
//! errors included.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use fs4::FileExt;

use crate::errors::{Result, SharedError};
use crate::memo::OnceMap;
use crate::modzip;
use crate::par::Cancellation;
use crate::path;
use crate::registry::{self, Registry, Remote, SourceLoc};
use crate::version::Version;

pub struct Cache {
    root: PathBuf,
    remote: Arc<dyn Remote>,
    mod_files: OnceMap<Version, std::result::Result<Arc<String>, SharedError>>,
    extracts: OnceMap<Version, std::result::Result<SourceLoc, SharedError>>,
}

/// The default cache root for this user: `<os cache dir>/cuemod/mod`.
pub fn default_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("cannot determine the user cache directory")?;
    Ok(base.join("cuemod").join("mod"))
}

// Held for the duration of one version's download and extraction.
struct LockGuard {
    file: fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_file(path: &Path) -> Result<LockGuard> {
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("cannot lock {}", path.display()))?;
    Ok(LockGuard { file })
}

fn remove_dir_all_force(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    // Extracted trees are read-only; restore write permission so the
    // removal can proceed.
    for entry in walkdir::WalkDir::new(dir).into_iter().flatten() {
        let mut perms = match entry.metadata() {
            Ok(md) => md.permissions(),
            Err(_) => continue,
        };
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        let _ = fs::set_permissions(entry.path(), perms);
    }
    fs::remove_dir_all(dir).with_context(|| format!("cannot remove {}", dir.display()))
}

fn make_readonly(dir: &Path) {
    // Best effort: a cache on a file system without permission support
    // still works, it just loses the accidental-write protection.
    for entry in walkdir::WalkDir::new(dir).contents_first(true).into_iter().flatten() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if entry.file_type().is_dir() { 0o555 } else { 0o444 };
            let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode));
        }
        #[cfg(not(unix))]
        {
            if entry.file_type().is_file() {
                if let Ok(md) = entry.metadata() {
                    let mut perms = md.permissions();
                    perms.set_readonly(true);
                    let _ = fs::set_permissions(entry.path(), perms);
                }
            }
        }
    }
}

impl Cache {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, remote: Arc<dyn Remote>) -> Result<Cache> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("cannot create cache directory {}", root.display()))?;
        Ok(Cache {
            root,
            remote,
            mod_files: OnceMap::new(),
            extracts: OnceMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn download_dir(&self, m: &Version) -> Result<PathBuf> {
        let esc = path::escape_path(m.path())?;
        Ok(self.root.join("download").join(esc).join("@v"))
    }

    fn artifact_path(&self, m: &Version, ext: &str) -> Result<PathBuf> {
        let esc = path::escape_version(m.version())?;
        Ok(self.download_dir(m)?.join(format!("{}.{}", esc, ext)))
    }

    fn extract_dir(&self, m: &Version) -> Result<PathBuf> {
        let p = path::escape_path(m.path())?;
        let v = path::escape_version(m.version())?;
        Ok(self.root.join("extract").join(format!("{}@{}", p, v)))
    }

    /// The manifest text of a module version, downloading it on a miss.
    pub fn read_mod_file(&self, cancel: &Cancellation, m: &Version) -> Result<Arc<String>> {
        cancel.check()?;
        self.mod_files
            .get_or_init(m, || {
                self.read_mod_file_uncached(cancel, m)
                    .map_err(SharedError::new)
            })
            .map_err(|e| e.to_error())
    }

    fn read_mod_file_uncached(&self, cancel: &Cancellation, m: &Version) -> Result<Arc<String>> {
        let mod_path = self.artifact_path(m, "mod")?;
        if mod_path.is_file() {
            log::debug!("module file cache hit for {}", m);
            let text = fs::read_to_string(&mod_path)
                .with_context(|| format!("cannot read {}", mod_path.display()))?;
            return Ok(Arc::new(text));
        }
        log::debug!("module file cache miss for {}; downloading", m);
        let dl_dir = self.download_dir(m)?;
        fs::create_dir_all(&dl_dir)
            .with_context(|| format!("cannot create {}", dl_dir.display()))?;
        let _lock = lock_file(&self.artifact_path(m, "lock")?)?;
        // Another process may have won the race while we waited.
        if mod_path.is_file() {
            let text = fs::read_to_string(&mod_path)?;
            return Ok(Arc::new(text));
        }
        let data = self.remote.module_file(cancel, m)?;
        let text = String::from_utf8(data)
            .with_context(|| format!("module file for {} is not valid UTF-8", m))?;
        let tmp = tempfile::NamedTempFile::new_in(&dl_dir)
            .with_context(|| format!("cannot create temporary file in {}", dl_dir.display()))?;
        fs::write(tmp.path(), &text)?;
        tmp.persist(&mod_path)
            .with_context(|| format!("cannot write {}", mod_path.display()))?;
        Ok(Arc::new(text))
    }

    /// The extracted source tree of a module version, downloading and
    /// extracting its archive on a miss.
    pub fn fetch(&self, cancel: &Cancellation, m: &Version) -> Result<SourceLoc> {
        cancel.check()?;
        self.extracts
            .get_or_init(m, || {
                self.fetch_uncached(cancel, m).map_err(SharedError::new)
            })
            .map_err(|e| e.to_error())
    }

    fn fetch_uncached(&self, cancel: &Cancellation, m: &Version) -> Result<SourceLoc> {
        let dir = self.extract_dir(m)?;
        let partial = self.artifact_path(m, "partial")?;

        // Happy path: a complete extraction needs no lock.
        if dir.is_dir() && !partial.exists() {
            log::debug!("extract cache hit for {}", m);
            return Ok(SourceLoc::new(dir));
        }

        let dl_dir = self.download_dir(m)?;
        fs::create_dir_all(&dl_dir)
            .with_context(|| format!("cannot create {}", dl_dir.display()))?;
        let _lock = lock_file(&self.artifact_path(m, "lock")?)?;

        // Re-check under the lock: another process may have finished.
        if dir.is_dir() && !partial.exists() {
            return Ok(SourceLoc::new(dir));
        }
        // A leftover marker means a previous extraction died part-way.
        if partial.exists() || dir.exists() {
            log::debug!("recovering partial extraction for {}", m);
            remove_dir_all_force(&dir)?;
            let _ = fs::remove_file(&partial);
        }

        let zip_path = self.download_zip(cancel, m)?;

        fs::write(&partial, b"")
            .with_context(|| format!("cannot write {}", partial.display()))?;
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = modzip::unzip(&dir, m, &zip_path) {
            let _ = remove_dir_all_force(&dir);
            let _ = fs::remove_file(&partial);
            return Err(e.context(format!("cannot extract module {}", m)));
        }
        make_readonly(&dir);
        fs::remove_file(&partial)
            .with_context(|| format!("cannot remove {}", partial.display()))?;
        Ok(SourceLoc::new(dir))
    }

    /// Deletes every cached artifact under the cache root, restoring
    /// write permission on extracted trees first. In-memory
    /// memoization is not reset; use a fresh cache afterwards.
    pub fn remove_all(&self) -> Result<()> {
        for sub in ["download", "extract"] {
            remove_dir_all_force(&self.root.join(sub))?;
        }
        Ok(())
    }

    // Ensures the verified zip for `m` is present, returning its path.
    // Caller holds the per-version lock.
    fn download_zip(&self, cancel: &Cancellation, m: &Version) -> Result<PathBuf> {
        let zip_path = self.artifact_path(m, "zip")?;
        if zip_path.is_file() {
            return Ok(zip_path);
        }
        log::debug!("downloading module zip for {}", m);
        let dl_dir = self.download_dir(m)?;
        let tmp = tempfile::NamedTempFile::new_in(&dl_dir)
            .with_context(|| format!("cannot create temporary file in {}", dl_dir.display()))?;
        {
            let mut f = tmp.reopen()?;
            self.remote
                .module_zip(cancel, m, &mut f)
                .with_context(|| format!("cannot download module zip for {}", m))?;
        }
        let f = tmp.reopen()?;
        let size = f.metadata()?.len();
        let cf = modzip::check_zip(m, f, size)?;
        cf.result()
            .with_context(|| format!("downloaded module zip for {} is invalid", m))?;
        tmp.persist(&zip_path)
            .with_context(|| format!("cannot write {}", zip_path.display()))?;
        Ok(zip_path)
    }
}

impl Registry for Cache {
    fn requirements(&self, cancel: &Cancellation, m: &Version) -> Result<Vec<Version>> {
        let text = self.read_mod_file(cancel, m)?;
        registry::requirements_from_module_file(&text, m)
    }

    fn fetch(&self, cancel: &Cancellation, m: &Version) -> Result<SourceLoc> {
        Cache::fetch(self, cancel, m)
    }

    fn module_versions(&self, cancel: &Cancellation, mpath: &str) -> Result<Vec<String>> {
        self.remote.module_versions(cancel, mpath)
    }
}
