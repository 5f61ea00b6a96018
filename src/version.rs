//! Version strings and the module version value type.
//!
//! Versions use the `v`-prefixed form throughout (`v1.2.3-beta.1`). The
//! helpers here accept the short forms `v1` and `v1.2` for comparison and
//! canonicalize them to a full triple; stored versions are always
//! canonical and never carry build metadata.

use std::cmp::Ordering;
use std::fmt;

use semver::{BuildMetadata, Prerelease};

use crate::errors::{InvalidVersion, Result};
use crate::path;

#[derive(Debug, Clone)]
struct Parsed {
    major: u64,
    minor: u64,
    patch: u64,
    pre: Prerelease,
    build: BuildMetadata,
}

fn parse_int(s: &str) -> Option<(u64, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let (digits, rest) = s.split_at(end);
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    Some((digits.parse().ok()?, rest))
}

fn parse_semver(v: &str) -> Option<Parsed> {
    let rest = v.strip_prefix('v')?;
    let (major, rest) = parse_int(rest)?;
    if rest.is_empty() {
        return Some(Parsed {
            major,
            minor: 0,
            patch: 0,
            pre: Prerelease::EMPTY,
            build: BuildMetadata::EMPTY,
        });
    }
    let rest = rest.strip_prefix('.')?;
    let (minor, rest) = parse_int(rest)?;
    if rest.is_empty() {
        return Some(Parsed {
            major,
            minor,
            patch: 0,
            pre: Prerelease::EMPTY,
            build: BuildMetadata::EMPTY,
        });
    }
    let rest = rest.strip_prefix('.')?;
    let (patch, rest) = parse_int(rest)?;

    let (pre, rest) = if let Some(rest) = rest.strip_prefix('-') {
        let end = rest.find('+').unwrap_or(rest.len());
        let (p, r) = rest.split_at(end);
        (Prerelease::new(p).ok()?, r)
    } else {
        (Prerelease::EMPTY, rest)
    };
    let build = if let Some(rest) = rest.strip_prefix('+') {
        BuildMetadata::new(rest).ok()?
    } else if rest.is_empty() {
        BuildMetadata::EMPTY
    } else {
        return None;
    };
    Some(Parsed {
        major,
        minor,
        patch,
        pre,
        build,
    })
}

/// Reports whether `v` is a well-formed version string.
pub fn is_valid(v: &str) -> bool {
    parse_semver(v).is_some()
}

/// The canonical form of `v`: full `vMAJOR.MINOR.PATCH` triple with any
/// prerelease kept and any build metadata dropped. `None` if invalid.
pub fn canonical(v: &str) -> Option<String> {
    let p = parse_semver(v)?;
    if p.pre.is_empty() {
        Some(format!("v{}.{}.{}", p.major, p.minor, p.patch))
    } else {
        Some(format!("v{}.{}.{}-{}", p.major, p.minor, p.patch, p.pre))
    }
}

/// Reports whether `v` is already in canonical form.
pub fn is_canonical(v: &str) -> bool {
    canonical(v).as_deref() == Some(v)
}

/// The major version prefix of `v` (`"v1"`), or `None` if invalid.
pub fn major(v: &str) -> Option<String> {
    parse_semver(v).map(|p| format!("v{}", p.major))
}

/// The `vMAJOR.MINOR` prefix of `v`, or `None` if invalid.
pub fn major_minor(v: &str) -> Option<String> {
    parse_semver(v).map(|p| format!("v{}.{}", p.major, p.minor))
}

/// The prerelease suffix of `v` including the leading `-`, or empty.
pub fn prerelease(v: &str) -> String {
    match parse_semver(v) {
        Some(p) if !p.pre.is_empty() => format!("-{}", p.pre),
        _ => String::new(),
    }
}

/// The build suffix of `v` including the leading `+`, or empty.
pub fn build_metadata(v: &str) -> String {
    match parse_semver(v) {
        Some(p) if !p.build.is_empty() => format!("+{}", p.build),
        _ => String::new(),
    }
}

fn cmp_parsed(a: &Parsed, b: &Parsed) -> Ordering {
    // Build metadata is ignored for precedence.
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| match (a.pre.is_empty(), b.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a.pre.cmp(&b.pre),
        })
}

/// Three-way comparison of two version strings. An invalid version
/// compares below every valid one; two invalid versions compare equal.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse_semver(a), parse_semver(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(pa), Some(pb)) => cmp_parsed(&pa, &pb),
    }
}

/// Selects the version a `latest` query resolves to: the greatest stable
/// version if any stable version exists, otherwise the greatest version
/// overall. Invalid entries are skipped.
pub fn latest<'a, I>(versions: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&str, Parsed)> = None;
    let mut best_stable: Option<(&str, Parsed)> = None;
    for v in versions {
        let p = match parse_semver(v) {
            Some(p) => p,
            None => continue,
        };
        if p.pre.is_empty() {
            match &best_stable {
                Some((_, cur)) if cmp_parsed(&p, cur) != Ordering::Greater => {}
                _ => best_stable = Some((v, p.clone())),
            }
        }
        match &best {
            Some((_, cur)) if cmp_parsed(&p, cur) != Ordering::Greater => {}
            _ => best = Some((v, p)),
        }
    }
    best_stable.or(best).map(|(v, _)| v)
}

/// Sorts version strings into precedence order, invalid entries first.
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| compare(a, b).then_with(|| a.cmp(b)));
}

/// A module path paired with one of its versions.
///
/// The path is either the synthetic `"local"` module or a qualified
/// `base@vMAJOR` path. The version is empty for the main module, `"none"`
/// as the selection sentinel, or a canonical version whose major matches
/// the path suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    path: String,
    version: String,
}

impl Version {
    pub fn new(path: &str, version: &str) -> Result<Version> {
        path::check_module_path(path)?;
        if version.is_empty() || version == "none" {
            return Ok(Version {
                path: path.to_string(),
                version: version.to_string(),
            });
        }
        if path == "local" {
            return Err(InvalidVersion {
                version: version.to_string(),
                cause: "local module cannot have a version".to_string(),
            }
            .into());
        }
        if !is_canonical(version) {
            return Err(InvalidVersion {
                version: version.to_string(),
                cause: "version is not canonical".to_string(),
            }
            .into());
        }
        let (_, path_major) = path::split_path_version(path).expect("checked module path");
        if major(version).as_deref() != Some(path_major) {
            return Err(InvalidVersion {
                version: version.to_string(),
                cause: format!("version does not match major version of path {:?}", path),
            }
            .into());
        }
        Ok(Version {
            path: path.to_string(),
            version: version.to_string(),
        })
    }

    /// Parses a `base@vMAJOR.MINOR.PATCH` string into a version whose
    /// path carries the corresponding major suffix.
    pub fn parse(s: &str) -> Result<Version> {
        let at = s.rfind('@').ok_or_else(|| InvalidVersion {
            version: s.to_string(),
            cause: "no version suffix".to_string(),
        })?;
        let (base, vers) = (&s[..at], &s[at + 1..]);
        if !is_canonical(vers) {
            return Err(InvalidVersion {
                version: s.to_string(),
                cause: format!("{:?} is not a canonical version", vers),
            }
            .into());
        }
        let maj = major(vers).expect("canonical version has a major");
        Version::new(&format!("{}@{}", base, maj), vers)
    }

    /// Panicking [`Version::parse`], for statically known inputs.
    pub fn must_parse(s: &str) -> Version {
        Version::parse(s).unwrap_or_else(|e| panic!("invalid version {:?}: {:#}", s, e))
    }

    /// Panicking [`Version::new`], for statically known inputs.
    pub fn must_new(path: &str, version: &str) -> Version {
        Version::new(path, version)
            .unwrap_or_else(|e| panic!("invalid version ({:?}, {:?}): {:#}", path, version, e))
    }

    /// The synthetic module owning `cue.mod/{gen,usr,pkg}` packages.
    pub fn local() -> Version {
        Version {
            path: "local".to_string(),
            version: String::new(),
        }
    }

    /// The qualified module path, including the major version suffix.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The module path without its major version suffix.
    pub fn base_path(&self) -> &str {
        match path::split_path_version(&self.path) {
            Some((base, _)) => base,
            None => &self.path,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The `vN` major version from the path suffix, if any.
    pub fn major(&self) -> Option<&str> {
        path::split_path_version(&self.path).map(|(_, m)| m)
    }

    pub fn is_local(&self) -> bool {
        self.path == "local"
    }

    /// Whether this is the main module (empty version).
    pub fn is_main(&self) -> bool {
        self.version.is_empty() && !self.is_local()
    }

    /// Returns a copy of this version with a different version string.
    pub fn with_version(&self, version: &str) -> Result<Version> {
        Version::new(&self.path, version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            f.write_str(&self.path)
        } else {
            write!(f, "{}@{}", self.base_path(), self.version)
        }
    }
}

/// Compares two version strings for module selection purposes: the empty
/// string (the main module) ranks above everything else.
pub fn compare_for_selection(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare(a, b),
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Version) -> Ordering {
        self.path
            .cmp(&other.path)
            .then_with(|| compare_for_selection(&self.version, &other.version))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Version) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
