//! Module, import and file path validation and escaping.
//!
//! Module paths double as OCI repository names, so the strictest rules
//! apply to them; import paths and file paths get progressively looser
//! character sets. The `!`-escape keeps distinct paths distinct on
//! case-insensitive file systems and inside registry repositories: it is
//! a wire format, not a convenience.

use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{InvalidPath, PathKind, Result};

// An OCI repository name: lowercase alphanumeric runs joined by
// '.', '_', '__' or one or more dashes, with '/'-separated elements.
fn base_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$")
            .expect("static regex")
    })
}

const MAX_PATH_LEN: usize = 255;

fn bad(kind: PathKind, path: &str, cause: impl Into<String>) -> anyhow::Error {
    InvalidPath {
        kind,
        path: path.to_string(),
        cause: cause.into(),
    }
    .into()
}

/// Splits a well-formed `base@vN` path into `(base, "vN")`.
pub fn split_path_version(p: &str) -> Option<(&str, &str)> {
    let at = p.rfind('@')?;
    let (base, vers) = (&p[..at], &p[at + 1..]);
    if base.is_empty() || !is_major_version(vers) {
        return None;
    }
    Some((base, vers))
}

fn is_major_version(v: &str) -> bool {
    let digits = match v.strip_prefix('v') {
        Some(d) => d,
        None => return false,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    digits == "0" || !digits.starts_with('0')
}

// Windows file systems reserve these names at any case, with or without
// an extension.
fn is_reserved_name(elem: &str) -> bool {
    let short = elem.split('.').next().unwrap_or(elem);
    let lower = short.to_ascii_lowercase();
    match lower.as_str() {
        "con" | "prn" | "aux" | "nul" => true,
        _ => {
            (lower.starts_with("com") || lower.starts_with("lpt"))
                && lower.len() == 4
                && lower.as_bytes()[3].is_ascii_digit()
                && lower.as_bytes()[3] != b'0'
        }
    }
}

// An 8.3 short-name alias like EXAMPL~1 can collide with a long name on
// the same Windows volume.
fn has_short_name_pattern(elem: &str) -> bool {
    if let Some(tilde) = elem.rfind('~') {
        let digits = &elem[tilde + 1..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return true;
        }
    }
    false
}

fn check_elem(kind: PathKind, path: &str, elem: &str) -> Result<()> {
    if elem.is_empty() {
        return Err(bad(kind, path, "empty path element"));
    }
    if elem == "." || elem == ".." {
        return Err(bad(kind, path, format!("path element {:?} is disallowed", elem)));
    }
    if elem.ends_with('.') {
        return Err(bad(kind, path, "path element ends with a dot"));
    }
    if kind != PathKind::File && elem.starts_with('.') {
        return Err(bad(kind, path, "path element begins with a dot"));
    }
    if is_reserved_name(elem) {
        return Err(bad(kind, path, format!("{:?} is a reserved file name", elem)));
    }
    if has_short_name_pattern(elem) {
        return Err(bad(
            kind,
            path,
            format!("{:?} matches a short-name file pattern", elem),
        ));
    }
    let char_ok: fn(char) -> bool = match kind {
        PathKind::Module => |c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-._".contains(c),
        PathKind::Import => |c| c.is_ascii_alphanumeric() || "-._~+".contains(c),
        PathKind::File => |c| c.is_alphanumeric() || "!#$%&()+,-.=@[]^_{}~".contains(c),
    };
    for c in elem.chars() {
        if !char_ok(c) {
            return Err(bad(
                kind,
                path,
                format!("disallowed character {:?} in path element {:?}", c, elem),
            ));
        }
    }
    Ok(())
}

fn check_elems(kind: PathKind, path: &str, base: &str) -> Result<()> {
    if base.starts_with('/') || base.ends_with('/') {
        return Err(bad(kind, path, "leading or trailing slash"));
    }
    for elem in base.split('/') {
        check_elem(kind, path, elem)?;
    }
    Ok(())
}

/// Checks a module path: either the synthetic `"local"` module or an
/// OCI-conformant base path qualified with a `@vN` major version suffix.
pub fn check_module_path(p: &str) -> Result<()> {
    if p == "local" {
        return Ok(());
    }
    let (base, _) = split_path_version(p)
        .ok_or_else(|| bad(PathKind::Module, p, "no major version suffix such as @v0"))?;
    check_base_path(base).map_err(|e| bad(PathKind::Module, p, format!("{:#}", e)))
}

/// Checks a module path without its major version suffix.
pub fn check_base_path(base: &str) -> Result<()> {
    if base.len() > MAX_PATH_LEN {
        return Err(bad(PathKind::Module, base, "path too long"));
    }
    if !base_path_re().is_match(base) {
        return Err(bad(
            PathKind::Module,
            base,
            "path does not conform to OCI repository name grammar",
        ));
    }
    let first = base.split('/').next().unwrap_or("");
    if !first.contains('.') {
        return Err(bad(
            PathKind::Module,
            base,
            "first path element must contain a dot",
        ));
    }
    if first.starts_with('-') {
        return Err(bad(PathKind::Module, base, "first path element begins with a dash"));
    }
    if !first.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(bad(
            PathKind::Module,
            base,
            "first path element may use only lowercase letters, digits, dots and dashes",
        ));
    }
    check_elems(PathKind::Module, base, base)
}

/// Checks an import path as written in a source file. The path may carry
/// a major version suffix; a `:qualifier` must be split off beforehand.
pub fn check_import_path(p: &str) -> Result<()> {
    if p.is_empty() {
        return Err(bad(PathKind::Import, p, "empty path"));
    }
    let base = match split_path_version(p) {
        Some((base, _)) => base,
        None => {
            if p.contains('@') {
                return Err(bad(PathKind::Import, p, "malformed major version suffix"));
            }
            p
        }
    };
    check_elems(PathKind::Import, p, base)
}

/// Checks a file path as stored inside a module archive.
pub fn check_file_path(p: &str) -> Result<()> {
    if p.is_empty() {
        return Err(bad(PathKind::File, p, "empty path"));
    }
    check_elems(PathKind::File, p, p)
}

fn escape(s: &str, what: &str) -> Result<String> {
    if s.contains('!') {
        anyhow::bail!("{} {:?} contains disallowed '!' character", what, s);
    }
    if !s.is_ascii() {
        anyhow::bail!("{} {:?} contains non-ASCII characters", what, s);
    }
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn unescape(s: &str, what: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c.is_ascii_uppercase() {
            anyhow::bail!("escaped {} {:?} contains an uppercase letter", what, s);
        }
        if c == '!' {
            match chars.next() {
                Some(n) if n.is_ascii_lowercase() => out.push(n.to_ascii_uppercase()),
                _ => anyhow::bail!("escaped {} {:?} has invalid '!' sequence", what, s),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Escapes a module path for use as a directory name on case-insensitive
/// file systems: each uppercase letter becomes `!` plus its lowercase form.
pub fn escape_path(p: &str) -> Result<String> {
    escape(p, "path")
}

pub fn unescape_path(p: &str) -> Result<String> {
    unescape(p, "path")
}

/// Escapes a version string the same way as [`escape_path`]; prerelease
/// identifiers may legitimately contain uppercase letters.
pub fn escape_version(v: &str) -> Result<String> {
    escape(v, "version")
}

pub fn unescape_version(v: &str) -> Result<String> {
    unescape(v, "version")
}

/// An import path split into its components: `base[@major][:qualifier]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportPath<'a> {
    /// The slash-separated path, without major suffix or qualifier.
    pub path: &'a str,
    /// The explicit `vN` major version, if the import named one.
    pub major: Option<&'a str>,
    /// The explicit package qualifier, if the import named one.
    pub qualifier: Option<&'a str>,
}

/// Splits an import path as written in source. Never fails: validation
/// is a separate concern ([`check_import_path`]).
pub fn parse_import_path(s: &str) -> ImportPath<'_> {
    let last_elem_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (rest, qualifier) = match s[last_elem_start..].find(':') {
        Some(i) => (&s[..last_elem_start + i], Some(&s[last_elem_start + i + 1..])),
        None => (s, None),
    };
    match split_path_version(rest) {
        Some((path, major)) => ImportPath {
            path,
            major: Some(major),
            qualifier,
        },
        None => ImportPath {
            path: rest,
            major: None,
            qualifier,
        },
    }
}

impl ImportPath<'_> {
    /// The path with its major suffix (when present), qualifier dropped.
    pub fn unqualified(&self) -> String {
        match self.major {
            Some(m) => format!("{}@{}", self.path, m),
            None => self.path.to_string(),
        }
    }
}

/// Reports whether an import path refers to an external module, as
/// opposed to a builtin package: external paths have a dot in their
/// first element.
pub fn is_external_import(p: &str) -> bool {
    let first = p.split('/').next().unwrap_or("");
    first.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_paths() {
        assert!(check_module_path("local").is_ok());
        assert!(check_module_path("foo.com/bar@v0").is_ok());
        assert!(check_module_path("foo.com@v1").is_ok());
        assert!(check_module_path("foo.com/bar-baz/x_y@v10").is_ok());

        assert!(check_module_path("foo.com/bar").is_err());
        assert!(check_module_path("foo.com/bar@v01").is_err());
        assert!(check_module_path("foo.com/bar@1").is_err());
        assert!(check_module_path("Foo.com/bar@v0").is_err());
        assert!(check_module_path("foo/bar@v0").is_err());
        assert!(check_module_path("-foo.com/bar@v0").is_err());
        assert!(check_module_path("foo_bar.com/x@v0").is_err());
        assert!(check_module_path("foo.com//bar@v0").is_err());
        assert!(check_module_path("foo.com/nul@v0").is_err());
        assert!(check_module_path("foo.com/com1@v0").is_err());
    }

    #[test]
    fn import_paths() {
        assert!(check_import_path("foo.com/Bar~x+y").is_ok());
        assert!(check_import_path("foo.com/Bar+y").is_ok());
        assert!(check_import_path("foo.com/bar@v2").is_ok());
        assert!(check_import_path("foo.com/bar@v2x").is_err());
        assert!(check_import_path("foo.com/EXAMPL~1").is_err());
        assert!(check_import_path("foo.com/nul").is_err());
        assert!(check_import_path("foo.com/NUL.txt").is_err());
        assert!(check_import_path("foo.com/a b").is_err());
    }

    #[test]
    fn file_paths() {
        assert!(check_file_path("x/y.cue").is_ok());
        assert!(check_file_path(".hidden/z").is_ok());
        assert!(check_file_path("naïve/σ.cue").is_ok());
        assert!(check_file_path("a/../b").is_err());
        assert!(check_file_path("a//b").is_err());
        assert!(check_file_path("a|b").is_err());
        assert!(check_file_path("aux/x").is_err());
    }

    #[test]
    fn split_major() {
        assert_eq!(split_path_version("foo.com/bar@v1"), Some(("foo.com/bar", "v1")));
        assert_eq!(split_path_version("foo.com/bar@v0"), Some(("foo.com/bar", "v0")));
        assert_eq!(split_path_version("foo.com/bar"), None);
        assert_eq!(split_path_version("foo.com/bar@v1.2"), None);
        assert_eq!(split_path_version("foo.com/bar@v01"), None);
        assert_eq!(split_path_version("@v1"), None);
    }

    #[test]
    fn escape_round_trip() {
        assert_eq!(escape_version("v1.0.0-Beta.1").unwrap(), "v1.0.0-!beta.1");
        assert_eq!(unescape_version("v1.0.0-!beta.1").unwrap(), "v1.0.0-Beta.1");
        assert!(escape_version("v1!x").is_err());
        assert!(unescape_version("v1.0.0-Beta").is_err());
        assert!(unescape_version("v1.0.0-!1").is_err());

        // Distinct inputs keep distinct case-folded escaped forms.
        let a = escape_version("v1.0.0-AA").unwrap();
        let b = escape_version("v1.0.0-aa").unwrap();
        assert_ne!(a.to_lowercase(), b.to_lowercase());
    }

    #[test]
    fn import_path_parts() {
        let ip = parse_import_path("foo.com/bar@v1:baz");
        assert_eq!(ip.path, "foo.com/bar");
        assert_eq!(ip.major, Some("v1"));
        assert_eq!(ip.qualifier, Some("baz"));
        assert_eq!(ip.unqualified(), "foo.com/bar@v1");

        let ip = parse_import_path("foo.com/bar");
        assert_eq!(ip.path, "foo.com/bar");
        assert_eq!(ip.major, None);
        assert_eq!(ip.qualifier, None);

        assert!(is_external_import("foo.com/bar"));
        assert!(!is_external_import("strings"));
    }
}
