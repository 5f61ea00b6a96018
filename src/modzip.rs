//! Module archive packaging: building, checking and extracting the zip
//! file that carries one module version.
//!
//! Invariants enforced on every archive: clean slash-separated paths
//! only, no case-folded aliases, `cue.mod` only at the module root and
//! its `pkg`, `usr`, `gen` and `vendor` subdirectories absent, exactly
//! one `cue.mod/module.cue`, and the size ceilings below. Declared
//! uncompressed sizes are enforced with limited readers during both
//! creation and extraction; an overrun is a hard error, not a
//! truncation.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::Result;
use crate::path;
use crate::version::Version;

/// Maximum total uncompressed size of a module zip.
pub const MAX_ZIP_FILE: u64 = 500 << 20;
/// Maximum size of the `cue.mod/module.cue` file inside an archive.
pub const MAX_CUE_MOD: u64 = 16 << 20;
/// Maximum size of a top-level `LICENSE` file inside an archive.
pub const MAX_LICENSE: u64 = 16 << 20;

const MODULE_FILE: &str = "cue.mod/module.cue";

// Reserved for main-module local packages; never present in an archive.
const RESERVED_DIRS: [&str; 4] = ["cue.mod/pkg/", "cue.mod/usr/", "cue.mod/gen/", "cue.mod/vendor/"];

/// A source file to be packed into a module archive.
pub trait ArchiveFile {
    /// The slash-separated path of the file within the module.
    fn path(&self) -> String;
    /// The declared size of the file in bytes.
    fn size(&self) -> Result<u64>;
    fn open(&self) -> Result<Box<dyn Read>>;
}

/// An archive file backed by the OS file system.
pub struct DiskFile {
    rel: String,
    abs: PathBuf,
}

impl ArchiveFile for DiskFile {
    fn path(&self) -> String {
        self.rel.clone()
    }

    fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.abs)
            .with_context(|| format!("cannot stat {}", self.abs.display()))?
            .len())
    }

    fn open(&self) -> Result<Box<dyn Read>> {
        let f = fs::File::open(&self.abs)
            .with_context(|| format!("cannot open {}", self.abs.display()))?;
        Ok(Box::new(f))
    }
}

/// A path that failed or was excluded from an archive check.
#[derive(Debug)]
pub struct FileError {
    pub path: String,
    pub error: anyhow::Error,
}

/// The outcome of checking a set of archive entries.
#[derive(Debug, Default)]
pub struct CheckedFiles {
    /// Paths that will be (or were) included.
    pub valid: Vec<String>,
    /// Entries skipped without making the archive invalid, such as
    /// directory entries.
    pub omitted: Vec<FileError>,
    /// Entries that make the archive invalid.
    pub invalid: Vec<FileError>,
    size_error: Option<anyhow::Error>,
    has_module_file: bool,
}

impl CheckedFiles {
    /// Ok if the checked set forms a valid module archive.
    pub fn result(&self) -> Result<()> {
        if let Some(e) = &self.size_error {
            anyhow::bail!("{:#}", e);
        }
        if !self.invalid.is_empty() {
            let mut msg = String::from("found invalid files in module archive:");
            for fe in &self.invalid {
                msg.push_str(&format!("\n\t{}: {:#}", fe.path, fe.error));
            }
            anyhow::bail!("{}", msg);
        }
        if !self.has_module_file {
            anyhow::bail!("no {} file found in module archive", MODULE_FILE);
        }
        Ok(())
    }
}

fn check_entry(p: &str) -> Result<()> {
    if p.starts_with('/') {
        anyhow::bail!("file path is absolute");
    }
    if p.contains('\\') {
        anyhow::bail!("file path contains a backslash");
    }
    path::check_file_path(p)?;
    for reserved in RESERVED_DIRS {
        if p.starts_with(reserved) {
            anyhow::bail!("{} is a reserved directory", &reserved[..reserved.len() - 1]);
        }
    }
    // cue.mod marks a module root; a nested one means the entry belongs
    // to a different module.
    if p.split('/').skip(1).any(|elem| elem == "cue.mod") {
        anyhow::bail!("cue.mod directory is only allowed at the module root");
    }
    Ok(())
}

/// Checks a list of `(path, declared size)` entries against the module
/// archive rules.
pub fn check_entries<I>(entries: I) -> CheckedFiles
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut cf = CheckedFiles::default();
    let mut folded = std::collections::HashMap::<String, String>::new();
    let mut total: u64 = 0;
    for (p, size) in entries {
        if p.ends_with('/') {
            cf.omitted.push(FileError {
                path: p,
                error: anyhow::anyhow!("directory entry"),
            });
            continue;
        }
        if let Err(e) = check_entry(&p) {
            cf.invalid.push(FileError { path: p, error: e });
            continue;
        }
        let fold = p.to_lowercase();
        if let Some(prev) = folded.get(&fold) {
            cf.invalid.push(FileError {
                path: p,
                error: anyhow::anyhow!(
                    "case-insensitive file name collision with {:?}",
                    prev
                ),
            });
            continue;
        }
        folded.insert(fold, p.clone());

        if p == MODULE_FILE {
            cf.has_module_file = true;
            if size > MAX_CUE_MOD {
                cf.invalid.push(FileError {
                    path: p,
                    error: anyhow::anyhow!(
                        "file size {} exceeds maximum module file size {}",
                        size,
                        MAX_CUE_MOD
                    ),
                });
                continue;
            }
        } else if p == "LICENSE" && size > MAX_LICENSE {
            cf.invalid.push(FileError {
                path: p,
                error: anyhow::anyhow!(
                    "file size {} exceeds maximum license size {}",
                    size,
                    MAX_LICENSE
                ),
            });
            continue;
        }

        total = total.saturating_add(size);
        if cf.size_error.is_none() && total > MAX_ZIP_FILE {
            cf.size_error = Some(anyhow::anyhow!(
                "total uncompressed size of module contents exceeds maximum {} bytes",
                MAX_ZIP_FILE
            ));
        }
        cf.valid.push(p);
    }
    cf
}

/// Verifies every module archive invariant over a zip stream.
pub fn check_zip<R: Read + Seek>(m: &Version, r: R, size: u64) -> Result<CheckedFiles> {
    if size > MAX_ZIP_FILE {
        let mut cf = CheckedFiles::default();
        cf.size_error = Some(anyhow::anyhow!(
            "module zip for {} is {} bytes, exceeding maximum {}",
            m,
            size,
            MAX_ZIP_FILE
        ));
        return Ok(cf);
    }
    let mut archive =
        ZipArchive::new(r).with_context(|| format!("cannot open module zip for {}", m))?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .with_context(|| format!("cannot read entry {} of module zip for {}", i, m))?;
        entries.push((entry.name().to_string(), entry.size()));
    }
    Ok(check_entries(entries))
}

// Copies exactly `declared` bytes, treating any deviation as an error.
fn copy_declared(mut from: impl Read, to: &mut impl Write, declared: u64, what: &str) -> Result<()> {
    let mut limited = (&mut from).take(declared);
    let copied = io::copy(&mut limited, to).with_context(|| format!("cannot copy {}", what))?;
    if copied < declared {
        anyhow::bail!("{}: read {} bytes, declared size is {}", what, copied, declared);
    }
    let mut probe = [0u8; 1];
    if from.read(&mut probe).with_context(|| format!("cannot read {}", what))? != 0 {
        anyhow::bail!("{}: larger than its declared size {}", what, declared);
    }
    Ok(())
}

/// Creates a module archive for `m` from the given files.
pub fn create<W, F>(w: W, m: &Version, files: &[F]) -> Result<()>
where
    W: Write + Seek,
    F: ArchiveFile,
{
    if m.version().is_empty() {
        anyhow::bail!("cannot create archive for module {} without a version", m);
    }
    let mut sized = Vec::with_capacity(files.len());
    for f in files {
        sized.push((f.path(), f.size()?));
    }
    let cf = check_entries(sized.iter().cloned());
    cf.result()
        .with_context(|| format!("cannot create module zip for {}", m))?;

    let mut zw = ZipWriter::new(w);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (f, (p, size)) in files.iter().zip(&sized) {
        if !cf.valid.contains(p) {
            continue;
        }
        zw.start_file(p.as_str(), options)
            .with_context(|| format!("cannot add {} to module zip", p))?;
        let src = f.open()?;
        copy_declared(src, &mut zw, *size, p)?;
    }
    zw.finish().context("cannot finalize module zip")?;
    Ok(())
}

fn files_in_dir(dir: &Path) -> Result<Vec<DiskFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("cannot walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walked path is under its root");
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(DiskFile {
            rel,
            abs: entry.path().to_path_buf(),
        });
    }
    Ok(files)
}

/// Creates a module archive for `m` from a directory tree.
pub fn create_from_dir<W: Write + Seek>(w: W, m: &Version, dir: &Path) -> Result<()> {
    create(w, m, &files_in_dir(dir)?)
}

/// Checks a directory tree against the module archive rules without
/// zipping it, so publishers can validate before packaging.
pub fn check_dir(dir: &Path) -> Result<CheckedFiles> {
    let mut entries = Vec::new();
    for f in files_in_dir(dir)? {
        entries.push((f.path(), f.size()?));
    }
    Ok(check_entries(entries))
}

/// Reads the manifest text out of a module archive without extracting
/// the rest of it.
pub fn read_module_file<R: Read + Seek>(r: R) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(r).context("cannot open module zip")?;
    let entry = archive
        .by_name(MODULE_FILE)
        .with_context(|| format!("module archive has no {}", MODULE_FILE))?;
    let declared = entry.size();
    if declared > MAX_CUE_MOD {
        anyhow::bail!(
            "{} is {} bytes, exceeding maximum {}",
            MODULE_FILE,
            declared,
            MAX_CUE_MOD
        );
    }
    let mut out = Vec::with_capacity(declared as usize);
    copy_declared(entry, &mut out, declared, MODULE_FILE)?;
    Ok(out)
}

/// Extracts the module archive for `m` into `dir`, which must either
/// not exist or be empty.
pub fn unzip(dir: &Path, m: &Version, zip_file: &Path) -> Result<()> {
    if dir.exists() {
        let mut entries = fs::read_dir(dir)
            .with_context(|| format!("cannot read extraction directory {}", dir.display()))?;
        if entries.next().is_some() {
            anyhow::bail!("extraction directory {} is not empty", dir.display());
        }
    }
    let f = fs::File::open(zip_file)
        .with_context(|| format!("cannot open module zip {}", zip_file.display()))?;
    let size = f.metadata()?.len();
    let cf = check_zip(m, &f, size)?;
    cf.result()
        .with_context(|| format!("module zip for {} is invalid", m))?;

    let mut archive = ZipArchive::new(&f)?;
    fs::create_dir_all(dir)?;
    for p in &cf.valid {
        let entry = archive
            .by_name(p)
            .with_context(|| format!("cannot reopen archive entry {}", p))?;
        let declared = entry.size();
        let out_path = dir.join(p);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("cannot create {}", out_path.display()))?;
        copy_declared(entry, &mut out, declared, p)?;
    }
    Ok(())
}
