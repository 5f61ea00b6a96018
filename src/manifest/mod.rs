//! The `cue.mod/module.cue` manifest: version-gated schema, parse modes
//! and formatting.
//!
//! A manifest declares the language version it was written against, and
//! that version selects the schema it is parsed with. Schemas are keyed
//! by the earliest language version at which they took effect; the parser
//! picks the greatest schema version not exceeding the declared one. The
//! earliest closed schema rejects unknown fields; anything older than it
//! parses in legacy mode, which accepts arbitrary fields and preserves
//! only the module path.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::Result;
use crate::path;
use crate::version::{self, Version};

pub mod syntax;

/// The greatest language version this toolchain knows about.
pub const LATEST_KNOWN_LANGUAGE_VERSION: &str = "v0.9.0";

// Schema epochs, oldest first. v0.0.0 is the pre-closure sentinel.
const SCHEMA_VERSIONS: &[&str] = &["v0.0.0", "v0.8.0", "v0.9.0"];

const SCHEMA_LEGACY: &str = "v0.0.0";
const SCHEMA_CLOSED: &str = "v0.8.0";
const SCHEMA_DEFAULTS: &str = "v0.9.0";

/// One dependency entry in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Dep {
    /// The canonical version of the dependency.
    pub version: String,
    /// Whether this module is the default major version for its base path.
    pub default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Git,
    SelfContained,
}

impl SourceKind {
    fn parse(s: &str) -> Result<SourceKind> {
        match s {
            "git" => Ok(SourceKind::Git),
            "self" => Ok(SourceKind::SelfContained),
            _ => anyhow::bail!("unknown source kind {:?}; must be \"git\" or \"self\"", s),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Git => "git",
            SourceKind::SelfContained => "self",
        }
    }
}

/// A parsed module manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    module: String,
    language_version: Option<String>,
    source: Option<SourceKind>,
    deps: BTreeMap<String, Dep>,
    custom: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    Strict,
    NonStrict,
    Legacy,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LanguageDecl {
    #[allow(dead_code)]
    version: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceDecl {
    kind: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DepDeclClosed {
    v: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DepDeclDefaults {
    v: Option<String>,
    default: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClosed {
    module: Option<String>,
    #[allow(dead_code)]
    language: Option<LanguageDecl>,
    source: Option<SourceDecl>,
    deps: Option<BTreeMap<String, DepDeclClosed>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDefaults {
    module: Option<String>,
    #[allow(dead_code)]
    language: Option<LanguageDecl>,
    source: Option<SourceDecl>,
    deps: Option<BTreeMap<String, DepDeclDefaults>>,
    custom: Option<BTreeMap<String, BTreeMap<String, Value>>>,
}

fn schema_version_for(declared: &str) -> &'static str {
    let mut chosen = SCHEMA_VERSIONS[0];
    for &s in SCHEMA_VERSIONS {
        if version::compare(s, declared) != std::cmp::Ordering::Greater {
            chosen = s;
        }
    }
    chosen
}

impl Manifest {
    /// Parses a manifest strictly: the module path must carry its major
    /// version suffix and every dependency key must match its version.
    pub fn parse(data: &str, filename: &str) -> Result<Manifest> {
        Manifest::parse_mode(data, filename, ParseMode::Strict)
    }

    /// Parses a manifest, defaulting a missing major version to `v0`.
    pub fn parse_non_strict(data: &str, filename: &str) -> Result<Manifest> {
        Manifest::parse_mode(data, filename, ParseMode::NonStrict)
    }

    /// Parses a pre-closure manifest, preserving only the module path.
    pub fn parse_legacy(data: &str, filename: &str) -> Result<Manifest> {
        Manifest::parse_mode(data, filename, ParseMode::Legacy)
    }

    fn parse_mode(data: &str, filename: &str, mode: ParseMode) -> Result<Manifest> {
        let value = syntax::parse(data).with_context(|| format!("cannot parse {}", filename))?;
        if mode == ParseMode::Legacy {
            return Manifest::from_legacy(&value);
        }

        let declared = match syntax::lookup(&value, &["language", "version"]) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) | None => anyhow::bail!(
                "no language version declared in {}",
                filename
            ),
            Some(_) => anyhow::bail!("invalid language.version in {}", filename),
        };
        if !version::is_valid(&declared) {
            anyhow::bail!("invalid language version {:?} in {}", declared, filename);
        }
        if version::compare(&declared, LATEST_KNOWN_LANGUAGE_VERSION) == std::cmp::Ordering::Greater
        {
            anyhow::bail!(
                "language version {:?} declared in {} is greater than the maximum known version {}",
                declared,
                filename,
                LATEST_KNOWN_LANGUAGE_VERSION
            );
        }
        let schema = schema_version_for(&declared);
        if schema == SCHEMA_LEGACY {
            // Pre-closure language version: arbitrary fields were allowed.
            let mut mf = Manifest::from_legacy(&value)?;
            mf.language_version = Some(declared);
            return Ok(mf);
        }

        let (module, source, raw_deps, custom) = if schema == SCHEMA_CLOSED {
            let f: FileClosed = serde_json::from_value(value)
                .with_context(|| format!("invalid module.cue syntax in {}", filename))?;
            let deps = f.deps.unwrap_or_default();
            let deps = deps
                .into_iter()
                .map(|(k, d)| (k, (d.v, false)))
                .collect::<BTreeMap<_, _>>();
            (f.module, f.source, deps, BTreeMap::new())
        } else {
            let f: FileDefaults = serde_json::from_value(value)
                .with_context(|| format!("invalid module.cue syntax in {}", filename))?;
            let deps = f.deps.unwrap_or_default();
            let deps = deps
                .into_iter()
                .map(|(k, d)| (k, (d.v, d.default.unwrap_or(false))))
                .collect::<BTreeMap<_, _>>();
            (f.module, f.source, deps, f.custom.unwrap_or_default())
        };

        let module = module.unwrap_or_default();
        if module.is_empty() {
            anyhow::bail!("no module path declared in {}", filename);
        }
        let module = match path::split_path_version(&module) {
            Some(_) => {
                path::check_module_path(&module)?;
                module
            }
            None => {
                if mode == ParseMode::Strict {
                    anyhow::bail!(
                        "module path {:?} in {} does not contain a major version",
                        module,
                        filename
                    );
                }
                path::check_base_path(&module)?;
                format!("{}@v0", module)
            }
        };

        let source = match source {
            Some(s) => Some(SourceKind::parse(&s.kind)?),
            None => None,
        };

        let mut deps = BTreeMap::new();
        let mut default_base: BTreeMap<String, String> = BTreeMap::new();
        for (key, (vers, default)) in raw_deps {
            let vers = vers.ok_or_else(|| {
                anyhow::anyhow!("no version specified for dependency {:?} in {}", key, filename)
            })?;
            if !version::is_canonical(&vers) {
                anyhow::bail!(
                    "invalid version {:?} for dependency {:?} in {}",
                    vers,
                    key,
                    filename
                );
            }
            let qualified = match path::split_path_version(&key) {
                Some(_) => key.clone(),
                None => {
                    if mode == ParseMode::Strict {
                        anyhow::bail!(
                            "dependency path {:?} in {} does not contain a major version",
                            key,
                            filename
                        );
                    }
                    let maj = version::major(&vers).expect("canonical version has a major");
                    format!("{}@{}", key, maj)
                }
            };
            // Validates path/version consistency.
            let v = Version::new(&qualified, &vers)?;
            if default {
                if let Some(prev) = default_base.insert(v.base_path().to_string(), qualified.clone())
                {
                    anyhow::bail!(
                        "multiple default major versions found for {} in {}: {} and {}",
                        v.base_path(),
                        filename,
                        prev,
                        qualified
                    );
                }
            }
            deps.insert(
                qualified,
                Dep {
                    version: vers,
                    default,
                },
            );
        }

        Ok(Manifest {
            module,
            language_version: Some(declared),
            source,
            deps,
            custom,
        })
    }

    fn from_legacy(value: &Value) -> Result<Manifest> {
        let module = match syntax::lookup(value, &["module"]) {
            Some(Value::String(s)) => s.clone(),
            Some(_) => anyhow::bail!("module field is not a string"),
            None => String::new(),
        };
        Ok(Manifest {
            module,
            language_version: None,
            source: None,
            deps: BTreeMap::new(),
            custom: BTreeMap::new(),
        })
    }

    /// Creates an empty manifest for the given qualified module path.
    pub fn new(module: &str, language_version: &str) -> Result<Manifest> {
        path::check_module_path(module)?;
        if !version::is_valid(language_version) {
            anyhow::bail!("invalid language version {:?}", language_version);
        }
        Ok(Manifest {
            module: module.to_string(),
            language_version: Some(language_version.to_string()),
            source: None,
            deps: BTreeMap::new(),
            custom: BTreeMap::new(),
        })
    }

    /// The module path as stored; qualified except in legacy manifests.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The main module as a [`Version`] with an empty version string,
    /// synthesizing a `v0` major if the stored path has none.
    pub fn module_version(&self) -> Result<Version> {
        match path::split_path_version(&self.module) {
            Some(_) => Version::new(&self.module, ""),
            None => Version::new(&format!("{}@v0", self.module), ""),
        }
    }

    pub fn language_version(&self) -> Option<&str> {
        self.language_version.as_deref()
    }

    /// Declares the language version the manifest is written against.
    pub fn set_language_version(&mut self, v: &str) -> Result<()> {
        if !version::is_valid(v) {
            anyhow::bail!("invalid language version {:?}", v);
        }
        self.language_version = Some(v.to_string());
        Ok(())
    }

    pub fn source(&self) -> Option<SourceKind> {
        self.source
    }

    pub fn set_source(&mut self, kind: SourceKind) {
        self.source = Some(kind);
    }

    pub fn deps(&self) -> &BTreeMap<String, Dep> {
        &self.deps
    }

    pub fn add_dep(&mut self, path: &str, vers: &str, default: bool) -> Result<()> {
        let v = Version::new(path, vers)?;
        self.deps.insert(
            v.path().to_string(),
            Dep {
                version: vers.to_string(),
                default,
            },
        );
        Ok(())
    }

    /// A copy of this manifest with its dependency list replaced.
    pub fn with_deps<I>(&self, deps: I) -> Manifest
    where
        I: IntoIterator<Item = (String, Dep)>,
    {
        let mut m = self.clone();
        m.deps = deps.into_iter().collect();
        m
    }

    /// The dependency list as sorted module versions.
    pub fn dep_versions(&self) -> Result<Vec<Version>> {
        let mut out = Vec::with_capacity(self.deps.len());
        for (p, d) in &self.deps {
            out.push(Version::new(p, &d.version)?);
        }
        out.sort();
        Ok(out)
    }

    /// Map from base path to the `vN` major flagged as its default.
    pub fn default_major_versions(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (p, d) in &self.deps {
            if !d.default {
                continue;
            }
            if let Some((base, major)) = path::split_path_version(p) {
                out.insert(base.to_string(), major.to_string());
            }
        }
        out
    }

    /// Formats the manifest as data-mode text and verifies the result
    /// round-trips under the declared language version.
    pub fn format(&self) -> Result<String> {
        let mut out = String::new();
        syntax::write_field(&mut out, "module", &Value::String(self.module.clone()));
        if let Some(lang) = &self.language_version {
            let mut language = serde_json::Map::new();
            language.insert("version".to_string(), Value::String(lang.clone()));
            syntax::write_field(&mut out, "language", &Value::Object(language));
        }
        if let Some(source) = self.source {
            let mut m = serde_json::Map::new();
            m.insert("kind".to_string(), Value::String(source.as_str().to_string()));
            syntax::write_field(&mut out, "source", &Value::Object(m));
        }
        if !self.deps.is_empty() {
            let mut deps = serde_json::Map::new();
            for (p, d) in &self.deps {
                let mut entry = serde_json::Map::new();
                entry.insert("v".to_string(), Value::String(d.version.clone()));
                if d.default {
                    entry.insert("default".to_string(), Value::Bool(true));
                }
                deps.insert(p.clone(), Value::Object(entry));
            }
            syntax::write_field(&mut out, "deps", &Value::Object(deps));
        }
        if !self.custom.is_empty() {
            let mut custom = serde_json::Map::new();
            for (ns, fields) in &self.custom {
                let mut m = serde_json::Map::new();
                for (k, v) in fields {
                    m.insert(k.clone(), v.clone());
                }
                custom.insert(ns.clone(), Value::Object(m));
            }
            syntax::write_field(&mut out, "custom", &Value::Object(custom));
        }

        // Round-trip check: emitting a modern field under a language
        // version that predates it would silently produce a document
        // that parses to something else.
        let reparsed = match &self.language_version {
            None => Manifest::parse_legacy(&out, "module.cue")?,
            Some(lang) => Manifest::parse_non_strict(&out, "module.cue").map_err(|e| {
                anyhow::anyhow!("language version {} too early for module.cue contents: {:#}", lang, e)
            })?,
        };
        if reparsed != *self {
            let lang = self
                .language_version
                .as_deref()
                .unwrap_or("(none)");
            anyhow::bail!(
                "language version {} too early for module.cue contents",
                lang
            );
        }
        Ok(out)
    }

    pub fn custom(&self) -> &BTreeMap<String, BTreeMap<String, Value>> {
        &self.custom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: &str = r#"
module: "foo.com/bar@v0"
language: {
	version: "v0.9.0"
}
deps: {
	"baz.org/x@v1": {
		v: "v1.2.3"
		default: true
	}
	"other.com/y@v0": {
		v: "v0.4.0"
	}
}
"#;

    #[test]
    fn parse_strict_modern() {
        let mf = Manifest::parse(MODERN, "module.cue").unwrap();
        assert_eq!(mf.module(), "foo.com/bar@v0");
        assert_eq!(mf.language_version(), Some("v0.9.0"));
        let deps = mf.dep_versions().unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].to_string(), "baz.org/x@v1.2.3");
        assert_eq!(deps[1].to_string(), "other.com/y@v0.4.0");
        assert_eq!(
            mf.default_major_versions().get("baz.org/x").map(String::as_str),
            Some("v1")
        );
    }

    #[test]
    fn strict_requires_major() {
        let src = "module: \"foo.com/bar\"\nlanguage: version: \"v0.9.0\"\n";
        assert!(Manifest::parse(src, "module.cue").is_err());
        let mf = Manifest::parse_non_strict(src, "module.cue").unwrap();
        assert_eq!(mf.module(), "foo.com/bar@v0");
    }

    #[test]
    fn rejects_unknown_fields_in_closed_schema() {
        let src = "module: \"foo.com/bar@v0\"\nlanguage: version: \"v0.8.0\"\nwibble: true\n";
        let err = Manifest::parse(src, "module.cue").unwrap_err();
        assert!(format!("{:#}", err).contains("wibble"), "{:#}", err);
    }

    #[test]
    fn default_field_gated_by_language_version() {
        let src = r#"
module: "foo.com/bar@v0"
language: version: "v0.8.0"
deps: "baz.org/x@v1": {
	v: "v1.2.3"
	default: true
}
"#;
        assert!(Manifest::parse(src, "module.cue").is_err());
    }

    #[test]
    fn legacy_keeps_only_module() {
        let src = "module: \"foo.com/bar\"\nextra: { anything: 5 }\n";
        let mf = Manifest::parse_legacy(src, "module.cue").unwrap();
        assert_eq!(mf.module(), "foo.com/bar");
        assert!(mf.deps().is_empty());
        assert_eq!(mf.language_version(), None);
        assert_eq!(mf.module_version().unwrap().path(), "foo.com/bar@v0");
    }

    #[test]
    fn early_language_version_parses_legacy() {
        let src = "module: \"foo.com/bar\"\nlanguage: version: \"v0.4.3\"\nanything: 5\n";
        let mf = Manifest::parse(src, "module.cue").unwrap();
        assert_eq!(mf.module(), "foo.com/bar");
        assert!(mf.deps().is_empty());
    }

    #[test]
    fn language_version_gate() {
        let src = "module: \"foo.com/bar@v0\"\n";
        assert!(Manifest::parse(src, "module.cue").is_err());

        let src = "module: \"foo.com/bar@v0\"\nlanguage: version: \"v99.0.0\"\n";
        let err = Manifest::parse(src, "module.cue").unwrap_err();
        assert!(format!("{:#}", err).contains("greater than the maximum"), "{:#}", err);
    }

    #[test]
    fn rejects_non_canonical_dep_versions() {
        let src = r#"
module: "foo.com/bar@v0"
language: version: "v0.9.0"
deps: "baz.org/x@v1": v: "v1.2"
"#;
        assert!(Manifest::parse(src, "module.cue").is_err());
        assert!(Manifest::parse_non_strict(src, "module.cue").is_err());
    }

    #[test]
    fn rejects_duplicate_defaults() {
        let src = r#"
module: "foo.com/bar@v0"
language: version: "v0.9.0"
deps: {
	"baz.org/x@v1": { v: "v1.2.3", default: true }
	"baz.org/x@v2": { v: "v2.0.0", default: true }
}
"#;
        let err = Manifest::parse(src, "module.cue").unwrap_err();
        assert!(format!("{:#}", err).contains("multiple default major versions"), "{:#}", err);
    }

    #[test]
    fn format_round_trips() {
        let mf = Manifest::parse(MODERN, "module.cue").unwrap();
        let out = mf.format().unwrap();
        let mf2 = Manifest::parse(&out, "module.cue").unwrap();
        assert_eq!(mf, mf2);
    }

    #[test]
    fn format_rejects_too_early_language_version() {
        let mut mf = Manifest::new("foo.com/bar@v0", "v0.8.0").unwrap();
        mf.add_dep("baz.org/x@v1", "v1.2.3", true).unwrap();
        let err = mf.format().unwrap_err();
        assert!(format!("{:#}", err).contains("too early"), "{:#}", err);
    }

    #[test]
    fn format_omits_empty_deps() {
        let mf = Manifest::new("foo.com/bar@v0", "v0.9.0").unwrap();
        let out = mf.format().unwrap();
        assert!(!out.contains("deps"), "{}", out);
    }
}
