//! Import-path resolution and the transitive package graph.
//!
//! Packages live in an arena and refer to their imports by index, so
//! the (potentially cyclic) import graph never owns itself. Resolution
//! maps an import path to the module providing it by walking the
//! path's prefixes longest-first and keeping every prefix whose module
//! actually contains the package directory; local packages under
//! `cue.mod/{gen,usr,pkg}` take priority and belong to the synthetic
//! `local` module.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;

use regex::Regex;

use crate::errors::{AmbiguousImport, ImportMissing, Result};
use crate::par::Cancellation;
use crate::path;
use crate::registry::SourceLoc;
use crate::requirements::{DefaultMajorStatus, Requirements};
use crate::version::Version;

/// The source file extension of the configuration language.
pub const LANG_EXT: &str = "cue";

/// Directories of the main module owned by the synthetic `local`
/// module, in the order they are searched.
pub const LOCAL_PKG_DIRS: [&str; 3] = ["cue.mod/gen", "cue.mod/usr", "cue.mod/pkg"];

/// Extracts the import paths declared by the package files in a
/// directory. The language's own parser is a collaborator of this
/// crate, not part of it, so the boundary is a narrow trait.
pub trait ImportScanner: Send + Sync {
    fn scan_imports(&self, loc: &SourceLoc) -> Result<Vec<String>>;
}

/// A scanner that reads the import declarations out of `.cue` files
/// textually: single-line `import "..."` forms and parenthesized
/// import blocks, with or without aliases.
pub struct FileImportScanner;

impl ImportScanner for FileImportScanner {
    fn scan_imports(&self, loc: &SourceLoc) -> Result<Vec<String>> {
        let dir = loc.abs_dir();
        let mut out = BTreeSet::new();
        let single = Regex::new(r#"^\s*import\s+(?:[\w$]+\s+)?"([^"]+)""#).expect("static regex");
        let in_block = Regex::new(r#"^\s*(?:[\w$]+\s+)?"([^"]+)""#).expect("static regex");
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };
        let mut files: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map(|e| e == LANG_EXT).unwrap_or(false))
            .collect();
        files.sort();
        for file in files {
            let text = match fs::read_to_string(&file) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let mut block = false;
            for line in text.lines() {
                let trimmed = line.trim();
                if block {
                    if trimmed.starts_with(')') {
                        block = false;
                    } else if let Some(c) = in_block.captures(trimmed) {
                        out.insert(c[1].to_string());
                    }
                    continue;
                }
                if trimmed.starts_with("import (") {
                    block = true;
                } else if let Some(c) = single.captures(trimmed) {
                    out.insert(c[1].to_string());
                }
            }
        }
        Ok(out.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// The package was named directly by the caller.
    pub is_root: bool,
    /// The package is in the import closure of the main module.
    pub in_all: bool,
    /// The package comes from a module other than the main and local
    /// ones.
    pub from_external_module: bool,
}

pub struct Package {
    import_path: String,
    module: Version,
    locs: Vec<SourceLoc>,
    imports: Vec<usize>,
    error: Option<anyhow::Error>,
    flags: Flags,
}

impl Package {
    pub fn import_path(&self) -> &str {
        &self.import_path
    }

    /// The module providing this package; meaningless when
    /// [`Package::error`] is set.
    pub fn module(&self) -> &Version {
        &self.module
    }

    /// On-disk locations of the package files. Local packages may have
    /// several, one per `cue.mod` subdirectory that contains the path.
    pub fn locations(&self) -> &[SourceLoc] {
        &self.locs
    }

    pub fn imports(&self) -> &[usize] {
        &self.imports
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }
}

/// The loaded transitive package graph, an arena indexed by package id.
pub struct Packages {
    pkgs: Vec<Package>,
    index: BTreeMap<String, usize>,
}

impl Packages {
    pub fn get(&self, import_path: &str) -> Option<&Package> {
        self.index.get(import_path).map(|&i| &self.pkgs[i])
    }

    pub fn package(&self, id: usize) -> &Package {
        &self.pkgs[id]
    }

    /// All packages in import-path order.
    pub fn all(&self) -> impl Iterator<Item = &Package> {
        self.index.values().map(move |&i| &self.pkgs[i])
    }

    pub fn len(&self) -> usize {
        self.pkgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pkgs.is_empty()
    }

    /// The packages with errors, in import-path order.
    pub fn errors(&self) -> impl Iterator<Item = &Package> {
        self.all().filter(|p| p.error.is_some())
    }
}

struct Resolved {
    module: Version,
    locs: Vec<SourceLoc>,
}

/// Loads the transitive package graph rooted at `root_import_paths`.
///
/// Individual resolution failures are recorded on their packages; only
/// infrastructure-level failures abort the load. Output is
/// deterministic for a fixed requirement set.
pub fn load_packages(
    cancel: &Cancellation,
    main_loc: &SourceLoc,
    reqs: &Requirements,
    scanner: &dyn ImportScanner,
    root_import_paths: &[String],
) -> Result<Packages> {
    let mut seeds: Vec<String> = root_import_paths
        .iter()
        .filter(|p| path::is_external_import(p))
        .cloned()
        .collect();
    seeds.sort();
    seeds.dedup();
    log::debug!("loading packages for {} root import paths", seeds.len());

    let mut pkgs: Vec<Package> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut queue: VecDeque<usize> = VecDeque::new();

    let add_pkg = |pkgs: &mut Vec<Package>,
                       index: &mut BTreeMap<String, usize>,
                       queue: &mut VecDeque<usize>,
                       import_path: &str,
                       is_root: bool|
     -> usize {
        if let Some(&i) = index.get(import_path) {
            return i;
        }
        let id = pkgs.len();
        pkgs.push(Package {
            import_path: import_path.to_string(),
            module: Version::local(),
            locs: Vec::new(),
            imports: Vec::new(),
            error: None,
            flags: Flags {
                is_root,
                in_all: true,
                from_external_module: false,
            },
        });
        index.insert(import_path.to_string(), id);
        queue.push_back(id);
        id
    };

    for seed in &seeds {
        add_pkg(&mut pkgs, &mut index, &mut queue, seed, true);
    }

    while let Some(id) = queue.pop_front() {
        cancel.check()?;
        let import_path = pkgs[id].import_path.clone();
        match resolve_import(cancel, main_loc, reqs, &import_path) {
            Err(e) => {
                pkgs[id].error = Some(e);
                continue;
            }
            Ok(r) => {
                pkgs[id].flags.from_external_module =
                    !r.module.is_local() && r.module.path() != reqs.main_module().path();
                pkgs[id].module = r.module;
                pkgs[id].locs = r.locs;
            }
        }
        let mut imports = BTreeSet::new();
        for loc in pkgs[id].locs.clone() {
            for imp in scanner.scan_imports(&loc)? {
                let ip = path::parse_import_path(&imp);
                if path::is_external_import(ip.path) {
                    imports.insert(ip.unqualified());
                }
            }
        }
        let mut import_ids = Vec::with_capacity(imports.len());
        for imp in imports {
            // A package importing itself adds no edge.
            if imp == import_path {
                continue;
            }
            import_ids.push(add_pkg(&mut pkgs, &mut index, &mut queue, &imp, false));
        }
        pkgs[id].imports = import_ids;
    }

    Ok(Packages { pkgs, index })
}

// Maps one import path to the module providing it, two-phase: root
// requirements first, the full graph only on a miss.
fn resolve_import(
    cancel: &Cancellation,
    main_loc: &SourceLoc,
    reqs: &Requirements,
    import_path: &str,
) -> Result<Resolved> {
    let ip = path::parse_import_path(import_path);
    path::check_import_path(&ip.unqualified())?;

    // Local packages shadow external candidates entirely; coexistence
    // is not ambiguity.
    let mut local_locs = Vec::new();
    for d in LOCAL_PKG_DIRS {
        let loc = main_loc.join(d).join(ip.path);
        if loc.has_files_with_ext(LANG_EXT) {
            local_locs.push(loc);
        }
    }
    if !local_locs.is_empty() {
        return Ok(Resolved {
            module: Version::local(),
            locs: local_locs,
        });
    }

    match import_from_modules(cancel, main_loc, reqs, &ip, true)? {
        Candidates::Found(r) => return Ok(r),
        Candidates::Ambiguous(e) => return Err(e.into()),
        Candidates::Missing => {}
    }
    // Not among the roots: pay for the full graph and retry once.
    match import_from_modules(cancel, main_loc, reqs, &ip, false)? {
        Candidates::Found(r) => Ok(r),
        Candidates::Ambiguous(e) => Err(e.into()),
        Candidates::Missing => Err(ImportMissing {
            import_path: import_path.to_string(),
        }
        .into()),
    }
}

enum Candidates {
    Found(Resolved),
    Missing,
    Ambiguous(AmbiguousImport),
}

fn import_from_modules(
    cancel: &Cancellation,
    main_loc: &SourceLoc,
    reqs: &Requirements,
    ip: &path::ImportPath<'_>,
    roots_only: bool,
) -> Result<Candidates> {
    let elems: Vec<&str> = ip.path.split('/').collect();
    let mut found: Vec<(Version, SourceLoc)> = Vec::new();

    for n in (1..=elems.len()).rev() {
        cancel.check()?;
        let prefix = elems[..n].join("/");
        let mpath = match ip.major {
            Some(mj) => format!("{}@{}", prefix, mj),
            None => {
                if prefix == reqs.main_module().base_path() {
                    reqs.main_module().path().to_string()
                } else {
                    match reqs.default_major_version(&prefix) {
                        (DefaultMajorStatus::NoDefault, _) => continue,
                        (DefaultMajorStatus::Ambiguous, _) => {
                            anyhow::bail!(
                                "ambiguous default major version for module path {}",
                                prefix
                            );
                        }
                        (_, Some(mj)) => format!("{}@{}", prefix, mj),
                        (_, None) => continue,
                    }
                }
            }
        };

        let suffix = elems[n..].join("/");
        if mpath == reqs.main_module().path() {
            let dir = main_loc.join(&suffix);
            if dir.has_files_with_ext(LANG_EXT) && !inside_nested_module(main_loc, &dir) {
                found.push((reqs.main_module().clone(), dir));
            }
            continue;
        }

        let vers = if roots_only {
            match reqs.root_selected(&mpath) {
                Some(v) => v.to_string(),
                None => continue,
            }
        } else {
            let mg = reqs.graph(cancel)?;
            let v = mg.selected(&mpath);
            if v == "none" {
                continue;
            }
            v.to_string()
        };
        let m = Version::new(&mpath, &vers)?;
        let loc = reqs.registry().fetch(cancel, &m)?;
        let dir = loc.join(&suffix);
        if !dir.has_files_with_ext(LANG_EXT) {
            continue;
        }
        if dir.is_local() && inside_nested_module(&loc, &dir) {
            continue;
        }
        found.push((m, dir));
    }

    match found.len() {
        0 => Ok(Candidates::Missing),
        1 => {
            let (module, loc) = found.into_iter().next().expect("one candidate");
            Ok(Candidates::Found(Resolved {
                module,
                locs: vec![loc],
            }))
        }
        _ => {
            let mut candidates: Vec<Version> = found.into_iter().map(|(m, _)| m).collect();
            // Shortest module path first.
            candidates.sort_by(|a, b| {
                a.path()
                    .len()
                    .cmp(&b.path().len())
                    .then_with(|| a.cmp(b))
            });
            Ok(Candidates::Ambiguous(AmbiguousImport {
                import_path: ip.unqualified(),
                candidates,
            }))
        }
    }
}

// A candidate directory inside the main module is suppressed when some
// directory between it and the module root declares a nested module.
fn inside_nested_module(module_root: &SourceLoc, dir: &SourceLoc) -> bool {
    let mut rel = dir.dir().to_path_buf();
    loop {
        if rel.as_os_str().is_empty() {
            return false;
        }
        if module_root
            .join(&rel)
            .file_exists("cue.mod/module.cue")
        {
            return true;
        }
        if !rel.pop() {
            return false;
        }
    }
}

/// Gathers the external import paths of the main module's own
/// packages: every directory with language files outside `cue.mod`.
pub fn main_module_import_paths(
    main_loc: &SourceLoc,
    scanner: &dyn ImportScanner,
) -> Result<Vec<String>> {
    let root = main_loc.abs_dir();
    let mut dirs = BTreeSet::new();
    for entry in walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_entry(|e| e.file_name() != "cue.mod")
        .flatten()
    {
        if entry.file_type().is_file()
            && entry.path().extension().map(|e| e == LANG_EXT).unwrap_or(false)
        {
            if let Some(parent) = entry.path().parent() {
                if let Ok(rel) = parent.strip_prefix(&root) {
                    dirs.insert(rel.to_path_buf());
                }
            }
        }
    }
    let mut out = BTreeSet::new();
    for dir in dirs {
        let loc = main_loc.join(&dir);
        // Directories under a nested module are not the main module's.
        if !dir.as_os_str().is_empty() && inside_nested_module(main_loc, &loc) {
            continue;
        }
        for imp in scanner.scan_imports(&loc)? {
            let ip = path::parse_import_path(&imp);
            if path::is_external_import(ip.path) {
                out.insert(ip.unqualified());
            }
        }
    }
    Ok(out.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write(root: &Path, rel: &str, text: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, text).unwrap();
    }

    #[test]
    fn scans_single_and_block_imports() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "a.cue",
            "package a\n\nimport \"foo.com/x\"\nimport alias \"bar.com/y:q\"\n",
        );
        write(
            tmp.path(),
            "b.cue",
            "package a\n\nimport (\n\t\"foo.com/z@v1\"\n\tq \"strings\"\n)\n\nv: q.x\n",
        );
        let loc = SourceLoc::new_local(tmp.path());
        let mut imports = FileImportScanner.scan_imports(&loc).unwrap();
        imports.sort();
        assert_eq!(
            imports,
            vec!["bar.com/y:q", "foo.com/x", "foo.com/z@v1", "strings"]
        );
    }

    #[test]
    fn main_module_imports_skip_cue_mod() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "x/a.cue", "import \"dep.com/a\"\n");
        write(tmp.path(), "cue.mod/pkg/p.com/b.cue", "import \"hidden.com/b\"\n");
        write(tmp.path(), "y/b.cue", "import \"list\"\n");
        let loc = SourceLoc::new_local(tmp.path());
        let paths = main_module_import_paths(&loc, &FileImportScanner).unwrap();
        assert_eq!(paths, vec!["dep.com/a"]);
    }

    #[test]
    fn nested_module_guard() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "cue.mod/module.cue", "module: \"m.com/m@v0\"\n");
        write(tmp.path(), "sub/cue.mod/module.cue", "module: \"m.com/m/sub@v0\"\n");
        write(tmp.path(), "sub/pkg/p.cue", "package p\n");
        write(tmp.path(), "ok/q.cue", "package q\n");
        let root = SourceLoc::new_local(tmp.path());
        assert!(inside_nested_module(&root, &root.join("sub/pkg")));
        assert!(!inside_nested_module(&root, &root.join("ok")));
    }
}
