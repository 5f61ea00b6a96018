//! Resolving version queries (`@latest`, `@vMAJOR`, `@vMAJOR.MINOR`,
//! exact versions) against the registry, and bulk root updates.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use itertools::Itertools;

use crate::errors::{is_not_found, InvalidVersion, NoVersionsFound, Result};
use crate::par::Cancellation;
use crate::path;
use crate::registry::Registry;
use crate::requirements::Requirements;
use crate::version::{self, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionQuery {
    /// The greatest stable version, or the greatest prerelease if no
    /// stable version exists.
    Latest,
    /// The latest version within a `vN` or `vN.M` prefix.
    Prefix(String),
    /// One exact canonical version, which must exist.
    Exact(String),
}

/// Parses the version part of a `module@version` query.
pub fn parse_version_query(s: &str) -> Result<VersionQuery> {
    if s.is_empty() || s == "latest" {
        return Ok(VersionQuery::Latest);
    }
    if version::is_canonical(s) {
        return Ok(VersionQuery::Exact(s.to_string()));
    }
    if version::is_valid(s) {
        // A valid but non-canonical version is a vN or vN.M prefix.
        return Ok(VersionQuery::Prefix(s.to_string()));
    }
    Err(InvalidVersion {
        version: s.to_string(),
        cause: "not \"latest\", a version prefix, or a canonical version".to_string(),
    }
    .into())
}

fn matches_prefix(prefix: &str, v: &str) -> bool {
    if prefix.contains('.') {
        version::major_minor(v).as_deref() == Some(prefix)
    } else {
        version::major(v).as_deref() == Some(prefix)
    }
}

/// Resolves a version query for `mpath` (with or without a major
/// suffix) to a concrete module version.
pub fn resolve_version(
    cancel: &Cancellation,
    registry: &dyn Registry,
    mpath: &str,
    query: &VersionQuery,
) -> Result<Version> {
    let versions = match registry.module_versions(cancel, mpath) {
        Ok(vs) => vs,
        Err(e) if is_not_found(&e) => Vec::new(),
        Err(e) => return Err(e),
    };
    let no_versions = || NoVersionsFound {
        module_path: mpath.to_string(),
    };

    let chosen = match query {
        VersionQuery::Latest => version::latest(versions.iter().map(String::as_str))
            .ok_or_else(no_versions)?
            .to_string(),
        VersionQuery::Prefix(p) => version::latest(
            versions
                .iter()
                .map(String::as_str)
                .filter(|v| matches_prefix(p, v)),
        )
        .ok_or_else(no_versions)?
        .to_string(),
        VersionQuery::Exact(v) => {
            if !versions.iter().any(|have| have == v) {
                return Err(no_versions().into());
            }
            v.clone()
        }
    };

    let qualified = match path::split_path_version(mpath) {
        Some(_) => mpath.to_string(),
        None => format!(
            "{}@{}",
            mpath,
            version::major(&chosen).expect("canonical version has a major")
        ),
    };
    Version::new(&qualified, &chosen)
}

/// Applies a set of version queries to the root modules, converging on
/// a root set where every root sits at its MVS-selected version.
///
/// A requested version that MVS upgrades past is an ordering violation:
/// some module requires a higher version, and the error names the
/// requirement chain that does.
pub fn update_roots_to(
    cancel: &Cancellation,
    rs: &Requirements,
    queries: &[(String, VersionQuery)],
) -> Result<Requirements> {
    // Resolve every query first, detecting conflicting requests.
    let mut requested: BTreeMap<String, Version> = BTreeMap::new();
    for (mpath, q) in queries {
        let m = resolve_version(cancel, rs.registry().as_ref(), mpath, q)?;
        if let Some(prev) = requested.get(m.path()) {
            if prev != &m {
                anyhow::bail!(
                    "conflicting versions requested for {}: {} and {}",
                    m.path(),
                    prev.version(),
                    m.version()
                );
            }
        }
        log::debug!("update: {} resolved to {}", mpath, m);
        requested.insert(m.path().to_string(), m);
    }

    let mut roots: Vec<Version> = rs
        .root_modules()
        .iter()
        .filter(|r| !requested.contains_key(r.path()))
        .cloned()
        .chain(requested.values().cloned())
        .sorted()
        .dedup()
        .collect();

    // Fixed point: every root at the selected version of the graph its
    // own root set induces.
    let mut cur = rs.with_roots(roots.clone());
    loop {
        let mg = cur.graph(cancel)?;
        let mut next: Vec<Version> = Vec::new();
        for r in &roots {
            let sel = mg.selected(r.path());
            if sel == "none" {
                continue;
            }
            next.push(Version::new(r.path(), sel)?);
        }
        next.sort();
        next.dedup();
        if next == roots {
            break;
        }
        roots = next;
        cur = rs.with_roots(roots.clone());
    }

    // A selection above the requested version means something in the
    // graph requires more than the user asked for.
    let mg = cur.graph(cancel)?;
    for (mpath, m) in &requested {
        let sel = mg.selected(mpath);
        if version::compare(sel, m.version()) == Ordering::Greater {
            let chain = mg.find_path(|node| {
                mg.required_by(node)
                    .map(|reqs| {
                        reqs.iter().any(|d| {
                            d.path() == mpath
                                && version::compare(d.version(), m.version()) == Ordering::Greater
                        })
                    })
                    .unwrap_or(false)
            });
            let via = chain
                .map(|c| c.iter().map(|v| v.to_string()).join(" requires "))
                .unwrap_or_default();
            anyhow::bail!(
                "cannot downgrade {} to {}: {} requires {}",
                mpath,
                m.version(),
                via,
                sel
            );
        }
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceLoc;
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;

    struct VersionsRegistry {
        versions: Map<String, Vec<String>>,
        reqs: Map<String, Vec<Version>>,
    }

    impl Registry for VersionsRegistry {
        fn requirements(&self, _c: &Cancellation, m: &Version) -> Result<Vec<Version>> {
            Ok(self.reqs.get(&m.to_string()).cloned().unwrap_or_default())
        }
        fn fetch(&self, _c: &Cancellation, _m: &Version) -> Result<SourceLoc> {
            anyhow::bail!("no fetch in this test")
        }
        fn module_versions(&self, _c: &Cancellation, mpath: &str) -> Result<Vec<String>> {
            self.versions
                .get(mpath)
                .cloned()
                .ok_or_else(|| crate::errors::NotFound {
                    what: mpath.to_string(),
                }
                .into())
        }
    }

    fn registry() -> Arc<VersionsRegistry> {
        let mut versions = Map::new();
        versions.insert(
            "foo.com/a@v1".to_string(),
            vec!["v1.0.0".into(), "v1.2.0".into(), "v1.3.0-beta.1".into()],
        );
        versions.insert(
            "foo.com/a".to_string(),
            vec![
                "v1.0.0".into(),
                "v1.2.0".into(),
                "v2.0.0-alpha.1".into(),
            ],
        );
        Arc::new(VersionsRegistry {
            versions,
            reqs: Map::new(),
        })
    }

    #[test]
    fn parses_queries() {
        assert_eq!(parse_version_query("latest").unwrap(), VersionQuery::Latest);
        assert_eq!(
            parse_version_query("v1").unwrap(),
            VersionQuery::Prefix("v1".into())
        );
        assert_eq!(
            parse_version_query("v1.2").unwrap(),
            VersionQuery::Prefix("v1.2".into())
        );
        assert_eq!(
            parse_version_query("v1.2.3").unwrap(),
            VersionQuery::Exact("v1.2.3".into())
        );
        assert!(parse_version_query("banana").is_err());
    }

    #[test]
    fn resolves_latest_stable() {
        let reg = registry();
        let cancel = Cancellation::new();
        let m = resolve_version(&cancel, reg.as_ref(), "foo.com/a@v1", &VersionQuery::Latest)
            .unwrap();
        assert_eq!(m.to_string(), "foo.com/a@v1.2.0");
    }

    #[test]
    fn resolves_prefix_and_exact() {
        let reg = registry();
        let cancel = Cancellation::new();
        let m = resolve_version(
            &cancel,
            reg.as_ref(),
            "foo.com/a@v1",
            &VersionQuery::Prefix("v1.0".into()),
        )
        .unwrap();
        assert_eq!(m.version(), "v1.0.0");

        let m = resolve_version(
            &cancel,
            reg.as_ref(),
            "foo.com/a@v1",
            &VersionQuery::Exact("v1.2.0".into()),
        )
        .unwrap();
        assert_eq!(m.version(), "v1.2.0");

        let err = resolve_version(
            &cancel,
            reg.as_ref(),
            "foo.com/a@v1",
            &VersionQuery::Exact("v1.9.9".into()),
        )
        .unwrap_err();
        assert!(crate::errors::is_no_versions(&err), "{:#}", err);
    }

    #[test]
    fn majorless_path_gets_qualified() {
        let reg = registry();
        let cancel = Cancellation::new();
        // Only prereleases exist on v2, so latest prefers stable v1.
        let m = resolve_version(&cancel, reg.as_ref(), "foo.com/a", &VersionQuery::Latest)
            .unwrap();
        assert_eq!(m.path(), "foo.com/a@v1");
        assert_eq!(m.version(), "v1.2.0");
    }

    #[test]
    fn unknown_module_is_no_versions() {
        let reg = registry();
        let cancel = Cancellation::new();
        let err =
            resolve_version(&cancel, reg.as_ref(), "gone.com/x@v0", &VersionQuery::Latest)
                .unwrap_err();
        assert!(crate::errors::is_no_versions(&err), "{:#}", err);
    }

    #[test]
    fn update_converges_and_detects_downgrade() {
        let mut versions = Map::new();
        versions.insert(
            "b.com/b@v0".to_string(),
            vec!["v0.1.0".into(), "v0.2.0".into()],
        );
        let mut reqs = Map::new();
        reqs.insert(
            "a.com/a@v0.1.0".to_string(),
            vec![Version::must_parse("b.com/b@v0.2.0")],
        );
        reqs.insert("b.com/b@v0.2.0".to_string(), vec![]);
        reqs.insert("b.com/b@v0.1.0".to_string(), vec![]);
        let reg = Arc::new(VersionsRegistry { versions, reqs });

        let rs = Requirements::new(
            reg,
            Version::must_new("main.com/m@v0", ""),
            vec![
                Version::must_parse("a.com/a@v0.1.0"),
                Version::must_parse("b.com/b@v0.2.0"),
            ],
            BTreeMap::new(),
        );
        let cancel = Cancellation::new();

        // Upgrading b to its current selection is a no-op.
        let rs2 = update_roots_to(
            &cancel,
            &rs,
            &[("b.com/b@v0".to_string(), VersionQuery::Exact("v0.2.0".into()))],
        )
        .unwrap();
        assert!(rs2.same_requirements(&rs));

        // Downgrading below what a.com requires is an ordering violation.
        let err = update_roots_to(
            &cancel,
            &rs,
            &[("b.com/b@v0".to_string(), VersionQuery::Exact("v0.1.0".into()))],
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("cannot downgrade"), "{:#}", err);
    }
}
