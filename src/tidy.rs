//! The resolver fixed point: alternate package loading with
//! missing-module queries until the root set is stable, then shrink it
//! to the minimal set satisfying the pruning invariants.
//!
//! On convergence every module providing a package in the import
//! closure is a root, each root path appears once, and each root sits
//! at its MVS-selected version. Check mode verifies those properties
//! against the manifest as written instead of repairing them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use itertools::Itertools;

use crate::errors::{
    is_no_versions, is_not_found, AmbiguousImport, ImportMissing, NotTidy, Result,
};
use crate::loader::{self, ImportScanner, Packages};
use crate::manifest::{Dep, Manifest};
use crate::par::{Cancellation, Queue};
use crate::query::{self, VersionQuery};
use crate::registry::{Registry, SourceLoc};
use crate::requirements::{DefaultMajorStatus, Requirements};
use crate::version::Version;

/// Produces the tidy manifest for the main module at `main_loc`.
pub fn tidy(
    cancel: &Cancellation,
    main_loc: &SourceLoc,
    manifest: &Manifest,
    registry: Arc<dyn Registry>,
    scanner: &dyn ImportScanner,
) -> Result<Manifest> {
    run(cancel, main_loc, manifest, registry, scanner, false)
}

/// Verifies that the manifest is already tidy without modifying it.
pub fn check_tidy(
    cancel: &Cancellation,
    main_loc: &SourceLoc,
    manifest: &Manifest,
    registry: Arc<dyn Registry>,
    scanner: &dyn ImportScanner,
) -> Result<()> {
    run(cancel, main_loc, manifest, registry, scanner, true).map(|_| ())
}

fn run(
    cancel: &Cancellation,
    main_loc: &SourceLoc,
    manifest: &Manifest,
    registry: Arc<dyn Registry>,
    scanner: &dyn ImportScanner,
    check_only: bool,
) -> Result<Manifest> {
    let main_module = manifest.module_version()?;
    let mut roots = manifest.dep_versions()?;
    roots.dedup();
    if roots.iter().any(|r| r.path() == main_module.path()) {
        anyhow::bail!("module {} lists itself as a dependency", main_module.path());
    }
    let mut rs = Requirements::new(
        Arc::clone(&registry),
        main_module.clone(),
        roots,
        manifest.default_major_versions(),
    );
    let original = rs.with_roots(rs.root_modules().to_vec());

    let root_paths = loader::main_module_import_paths(main_loc, scanner)?;
    log::debug!(
        "tidying {}: {} root import paths",
        main_module,
        root_paths.len()
    );

    let pkgs = loop {
        let pkgs = loader::load_packages(cancel, main_loc, &rs, scanner, &root_paths)?;
        let mut missing: Vec<String> = Vec::new();
        for pkg in pkgs.errors() {
            let err = pkg.error().expect("errors() yields only failed packages");
            if err.downcast_ref::<ImportMissing>().is_some() {
                missing.push(pkg.import_path().to_string());
            } else if let Some(amb) = err.downcast_ref::<AmbiguousImport>() {
                return Err(AmbiguousImport {
                    import_path: amb.import_path.clone(),
                    candidates: amb.candidates.clone(),
                }
                .into());
            } else {
                anyhow::bail!("cannot load package {}: {:#}", pkg.import_path(), err);
            }
        }
        if check_only && !missing.is_empty() {
            return Err(NotTidy {
                reason: Some(format!(
                    "missing dependency providing package {}",
                    missing[0]
                )),
            }
            .into());
        }

        let (added, new_defaults) = resolve_missing_imports(cancel, &rs, &missing)?;
        let defaults_changed = new_defaults != rs.explicit_defaults();
        if added.is_empty() && !defaults_changed {
            if let Some(m) = missing.first() {
                return Err(ImportMissing {
                    import_path: m.clone(),
                }
                .into());
            }
            break pkgs;
        }
        if defaults_changed {
            rs = rs.with_default_majors(new_defaults);
        }
        if !added.is_empty() {
            let prev_roots = rs.root_modules().to_vec();
            let add: Vec<Version> = added.values().cloned().sorted().dedup().collect();
            log::debug!("tidy: adding modules {}", add.iter().join(", "));
            rs = update_roots(cancel, &rs, &pkgs, &add)?;
            if rs.root_modules() == prev_roots.as_slice() && !defaults_changed {
                // The added modules must change the root set; an
                // unchanged set would loop forever.
                panic!("internal error: tidy loop failed to make progress");
            }
        }
    };

    let rs = tidy_roots(cancel, &rs, &pkgs)?;

    if check_only {
        if !rs.same_requirements(&original) {
            return Err(NotTidy {
                reason: Some(requirements_diff(&original, &rs)),
            }
            .into());
        }
        return Ok(manifest.clone());
    }

    let defaults = rs.explicit_defaults();
    let deps = rs.root_modules().iter().map(|r| {
        let default = defaults
            .get(r.base_path())
            .map(|mj| Some(mj.as_str()) == r.major())
            .unwrap_or(false);
        (
            r.path().to_string(),
            Dep {
                version: r.version().to_string(),
                default,
            },
        )
    });
    Ok(manifest.with_deps(deps))
}

// For each missing import, query the registry for the latest version of
// every possible module-path prefix, longest first, skipping prefixes
// the requirements already know about. Queries run concurrently; the
// aggregate is keyed so the outcome is deterministic.
fn resolve_missing_imports(
    cancel: &Cancellation,
    rs: &Requirements,
    missing: &[String],
) -> Result<(BTreeMap<String, Version>, BTreeMap<String, String>)> {
    let mut defaults = rs.explicit_defaults();
    if missing.is_empty() {
        return Ok((BTreeMap::new(), defaults));
    }
    let missing: BTreeSet<String> = missing.iter().cloned().collect();

    type QueryOutcome = std::result::Result<Option<(Version, bool)>, crate::errors::SharedError>;
    let results: Arc<Mutex<BTreeMap<String, QueryOutcome>>> =
        Arc::new(Mutex::new(BTreeMap::new()));
    let queue = Queue::new();
    for import_path in &missing {
        let import_path = import_path.clone();
        let cancel = cancel.clone();
        let registry = Arc::clone(rs.registry());
        let results = Arc::clone(&results);
        // Prefix skipping only reads the root table, which is immutable
        // here; cloning what the query needs keeps the task 'static.
        let root_info: Vec<(String, Option<String>)> = prefix_queries(rs, &import_path);
        queue.add(move || {
            let outcome = query_import(&cancel, registry.as_ref(), &root_info)
                .map_err(crate::errors::SharedError::new);
            results.lock().unwrap().insert(import_path, outcome);
        });
    }
    queue.idle();

    let results = Arc::try_unwrap(results)
        .unwrap_or_else(|_| panic!("query results still shared after queue idle"))
        .into_inner()
        .unwrap();
    let mut added: BTreeMap<String, Version> = BTreeMap::new();
    for (import_path, outcome) in results {
        match outcome {
            Err(e) => return Err(e.to_error()),
            Ok(None) => {
                log::debug!("no module found providing {}", import_path);
            }
            Ok(Some((m, default_required))) => {
                if default_required {
                    if let Some(mj) = m.major() {
                        defaults.insert(m.base_path().to_string(), mj.to_string());
                    }
                }
                added.insert(import_path, m);
            }
        }
    }
    Ok((added, defaults))
}

// The candidate (query path, explicit major) pairs for one import,
// longest prefix first, with prefixes already known to the root set
// left out.
fn prefix_queries(rs: &Requirements, import_path: &str) -> Vec<(String, Option<String>)> {
    let ip = crate::path::parse_import_path(import_path);
    let elems: Vec<&str> = ip.path.split('/').collect();
    let mut out = Vec::new();
    for n in (1..=elems.len()).rev() {
        let prefix = elems[..n].join("/");
        match ip.major {
            Some(mj) => {
                let mpath = format!("{}@{}", prefix, mj);
                if rs.root_selected(&mpath).is_some() {
                    continue;
                }
                out.push((mpath, Some(mj.to_string())));
            }
            None => {
                let (status, _) = rs.default_major_version(&prefix);
                if status != DefaultMajorStatus::NoDefault {
                    continue;
                }
                out.push((prefix, None));
            }
        }
    }
    out
}

// Runs the prefix queries in order, returning the first hit. A prefix
// with no versions is simply not a candidate.
fn query_import(
    cancel: &Cancellation,
    registry: &dyn Registry,
    queries: &[(String, Option<String>)],
) -> Result<Option<(Version, bool)>> {
    for (mpath, explicit_major) in queries {
        match query::resolve_version(cancel, registry, mpath, &VersionQuery::Latest) {
            Ok(m) => {
                log::debug!("query: {} provides the import, at {}", mpath, m);
                return Ok(Some((m, explicit_major.is_none())));
            }
            Err(e) if is_no_versions(&e) || is_not_found(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

// Re-establishes the pruning invariants after new modules join: every
// package's providing module becomes a root, and the set is iterated
// until each root sits at its own graph's selected version.
fn update_roots(
    cancel: &Cancellation,
    rs: &Requirements,
    pkgs: &Packages,
    add: &[Version],
) -> Result<Requirements> {
    let mut need: BTreeMap<String, String> = BTreeMap::new();
    let mut bump = |m: &Version| {
        if m.is_local() || m.path() == rs.main_module().path() || m.version().is_empty() {
            return;
        }
        match need.get(m.path()) {
            Some(cur)
                if crate::version::compare(cur, m.version()) != std::cmp::Ordering::Less => {}
            _ => {
                need.insert(m.path().to_string(), m.version().to_string());
            }
        }
    };
    for r in rs.root_modules() {
        bump(r);
    }
    for pkg in pkgs.all() {
        let flags = pkg.flags();
        if pkg.error().is_none() && (flags.in_all || flags.is_root) {
            bump(pkg.module());
        }
    }
    for m in add {
        bump(m);
    }
    converge_roots(cancel, rs, need)
}

// Shrinks to the minimal satisfying set: only modules providing a
// package in the import closure seed the roots, expanded as MVS
// selection upgrades them.
fn tidy_roots(cancel: &Cancellation, rs: &Requirements, pkgs: &Packages) -> Result<Requirements> {
    let mut need: BTreeMap<String, String> = BTreeMap::new();
    for pkg in pkgs.all() {
        let flags = pkg.flags();
        if pkg.error().is_some() || !(flags.in_all || flags.is_root) {
            continue;
        }
        let m = pkg.module();
        if m.is_local() || m.path() == rs.main_module().path() || m.version().is_empty() {
            continue;
        }
        match need.get(m.path()) {
            Some(cur)
                if crate::version::compare(cur, m.version()) != std::cmp::Ordering::Less => {}
            _ => {
                need.insert(m.path().to_string(), m.version().to_string());
            }
        }
    }
    converge_roots(cancel, rs, need)
}

// Fixed point shared by root updates: each root at the version its own
// root set selects, one root per path.
fn converge_roots(
    cancel: &Cancellation,
    rs: &Requirements,
    mut need: BTreeMap<String, String>,
) -> Result<Requirements> {
    loop {
        let roots: Vec<Version> = need
            .iter()
            .map(|(p, v)| Version::new(p, v))
            .collect::<Result<_>>()?;
        let next_rs = rs.with_roots(roots);
        let mg = next_rs.graph(cancel)?;
        let mut changed = false;
        for (p, v) in need.iter_mut() {
            let sel = mg.selected(p);
            if sel != "none" && sel != v {
                *v = sel.to_string();
                changed = true;
            }
        }
        if !changed {
            return Ok(next_rs);
        }
    }
}

fn requirements_diff(original: &Requirements, tidied: &Requirements) -> String {
    let orig: BTreeMap<&str, &str> = original
        .root_modules()
        .iter()
        .map(|m| (m.path(), m.version()))
        .collect();
    let new: BTreeMap<&str, &str> = tidied
        .root_modules()
        .iter()
        .map(|m| (m.path(), m.version()))
        .collect();
    let mut parts = Vec::new();
    for (p, v) in &new {
        match orig.get(p) {
            None => parts.push(format!("missing dependency {} {}", p, v)),
            Some(ov) if ov != v => {
                parts.push(format!("dependency {} should be at {} not {}", p, v, ov))
            }
            _ => {}
        }
    }
    for (p, v) in &orig {
        if !new.contains_key(p) {
            parts.push(format!("unused dependency {} {}", p, v));
        }
    }
    if parts.is_empty() {
        "default major versions are out of date".to_string()
    } else {
        parts.join("; ")
    }
}
