//! End-to-end resolution scenarios driving the tidy fixed point
//! against in-memory registries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cuemod::errors::{AmbiguousImport, Result};
use cuemod::loader::FileImportScanner;
use cuemod::manifest::Manifest;
use cuemod::par::Cancellation;
use cuemod::registry::{Registry, SourceLoc};
use cuemod::requirements::Requirements;
use cuemod::tidy::{check_tidy, tidy};
use cuemod::version::Version;

fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (rel, text) in files {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, text).unwrap();
    }
}

/// A registry serving module versions straight from directories.
#[derive(Default)]
struct DirRegistry {
    // qualified module path -> version -> source dir
    modules: BTreeMap<String, BTreeMap<String, PathBuf>>,
    requirement_calls: std::sync::Mutex<Vec<String>>,
    denied: Vec<String>,
}

impl DirRegistry {
    fn add_module(&mut self, tmp: &Path, module: &str, files: &[(&str, &str)]) {
        let m = Version::parse(module).unwrap();
        let dir = tmp.join(format!(
            "registry/{}@{}",
            m.path().replace('/', "_"),
            m.version()
        ));
        fs::create_dir_all(&dir).unwrap();
        write_files(&dir, files);
        self.modules
            .entry(m.path().to_string())
            .or_default()
            .insert(m.version().to_string(), dir);
    }

    /// Any access to this module path fails the test.
    fn deny(&mut self, module_path: &str) {
        self.denied.push(module_path.to_string());
    }

    fn check_denied(&self, mpath: &str) {
        assert!(
            !self.denied.iter().any(|d| d == mpath),
            "unexpected registry access for denied module {}",
            mpath
        );
    }
}

impl Registry for DirRegistry {
    fn requirements(&self, _cancel: &Cancellation, m: &Version) -> Result<Vec<Version>> {
        self.check_denied(m.path());
        self.requirement_calls
            .lock()
            .unwrap()
            .push(m.to_string());
        let dir = self
            .modules
            .get(m.path())
            .and_then(|vs| vs.get(m.version()))
            .ok_or_else(|| cuemod::errors::NotFound {
                what: m.to_string(),
            })?;
        let text = fs::read_to_string(dir.join("cue.mod/module.cue"))?;
        let mf = Manifest::parse_non_strict(&text, "cue.mod/module.cue")?;
        mf.dep_versions()
    }

    fn fetch(&self, _cancel: &Cancellation, m: &Version) -> Result<SourceLoc> {
        self.check_denied(m.path());
        let dir = self
            .modules
            .get(m.path())
            .and_then(|vs| vs.get(m.version()))
            .ok_or_else(|| cuemod::errors::NotFound {
                what: m.to_string(),
            })?;
        Ok(SourceLoc::new(dir.clone()))
    }

    fn module_versions(&self, _cancel: &Cancellation, mpath: &str) -> Result<Vec<String>> {
        self.check_denied(mpath);
        let mut out: Vec<String> = match cuemod::path::split_path_version(mpath) {
            Some(_) => self
                .modules
                .get(mpath)
                .map(|vs| vs.keys().cloned().collect())
                .unwrap_or_default(),
            None => self
                .modules
                .iter()
                .filter(|(p, _)| {
                    cuemod::path::split_path_version(p)
                        .map(|(base, _)| base == mpath)
                        .unwrap_or(false)
                })
                .flat_map(|(_, vs)| vs.keys().cloned())
                .collect(),
        };
        cuemod::version::sort_versions(&mut out);
        out.dedup();
        if out.is_empty() {
            return Err(cuemod::errors::NotFound {
                what: mpath.to_string(),
            }
            .into());
        }
        Ok(out)
    }
}

struct TestModule {
    tmp: tempfile::TempDir,
    main_loc: SourceLoc,
    manifest: Manifest,
}

fn main_module(manifest_text: &str, files: &[(&str, &str)]) -> TestModule {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("main");
    fs::create_dir_all(&root).unwrap();
    write_files(&root, &[("cue.mod/module.cue", manifest_text)]);
    write_files(&root, files);
    let manifest = Manifest::parse_non_strict(manifest_text, "cue.mod/module.cue").unwrap();
    TestModule {
        main_loc: SourceLoc::new_local(root),
        tmp,
        manifest,
    }
}

fn run_tidy(tm: &TestModule, registry: Arc<dyn Registry>) -> Result<Manifest> {
    tidy(
        &Cancellation::new(),
        &tm.main_loc,
        &tm.manifest,
        registry,
        &FileImportScanner,
    )
}

fn dep_strings(mf: &Manifest) -> Vec<String> {
    mf.deps()
        .iter()
        .map(|(p, d)| format!("{} {}", p, d.version))
        .collect()
}

#[test]
fn simple_add() {
    let tm = main_module(
        "module: \"main.com/m@v0\"\nlanguage: version: \"v0.9.0\"\n",
        &[("x/x.cue", "package x\n\nimport \"other.com/x\"\n")],
    );
    let mut reg = DirRegistry::default();
    reg.add_module(
        tm.tmp.path(),
        "other.com/x@v0.1.0",
        &[
            ("cue.mod/module.cue", "module: \"other.com/x@v0\"\nlanguage: version: \"v0.9.0\"\n"),
            ("x.cue", "package x\n"),
        ],
    );
    let reg = Arc::new(reg);

    let tidied = run_tidy(&tm, reg.clone()).unwrap();
    assert_eq!(dep_strings(&tidied), vec!["other.com/x@v0 v0.1.0"]);
    // The import had no major version, so the chosen module becomes the
    // default major for its base path.
    assert!(tidied.deps()["other.com/x@v0"].default);

    // Tidying is idempotent and check mode agrees.
    let tm2 = TestModule {
        manifest: tidied.clone(),
        main_loc: tm.main_loc.clone(),
        tmp: tm.tmp,
    };
    let again = run_tidy(&tm2, reg.clone()).unwrap();
    assert_eq!(dep_strings(&again), dep_strings(&tidied));
    check_tidy(
        &Cancellation::new(),
        &tm2.main_loc,
        &tm2.manifest,
        reg,
        &FileImportScanner,
    )
    .unwrap();
}

#[test]
fn mvs_upgrade_selects_maximum() {
    let tm = main_module(
        r#"module: "main.com/m@v0"
language: version: "v0.9.0"
deps: {
	"a.com/a@v0": v: "v0.1.0"
	"b.com/b@v0": v: "v0.2.0"
}
"#,
        &[(
            "x/x.cue",
            "package x\n\nimport (\n\t\"a.com/a\"\n\t\"b.com/b\"\n)\n",
        )],
    );
    let mut reg = DirRegistry::default();
    reg.add_module(
        tm.tmp.path(),
        "a.com/a@v0.1.0",
        &[
            (
                "cue.mod/module.cue",
                "module: \"a.com/a@v0\"\nlanguage: version: \"v0.9.0\"\ndeps: \"b.com/b@v0\": v: \"v0.1.0\"\n",
            ),
            ("a.cue", "package a\n"),
        ],
    );
    reg.add_module(
        tm.tmp.path(),
        "b.com/b@v0.1.0",
        &[
            ("cue.mod/module.cue", "module: \"b.com/b@v0\"\nlanguage: version: \"v0.9.0\"\n"),
            ("b.cue", "package b\n"),
        ],
    );
    reg.add_module(
        tm.tmp.path(),
        "b.com/b@v0.2.0",
        &[
            ("cue.mod/module.cue", "module: \"b.com/b@v0\"\nlanguage: version: \"v0.9.0\"\n"),
            ("b.cue", "package b\n"),
        ],
    );
    let reg: Arc<DirRegistry> = Arc::new(reg);

    let tidied = run_tidy(&tm, reg.clone()).unwrap();
    assert_eq!(
        dep_strings(&tidied),
        vec!["a.com/a@v0 v0.1.0", "b.com/b@v0 v0.2.0"]
    );

    // The module graph selects b at the maximum required version.
    let rs = Requirements::new(
        reg.clone(),
        tm.manifest.module_version().unwrap(),
        tidied.dep_versions().unwrap(),
        tidied.default_major_versions(),
    );
    let mg = rs.graph(&Cancellation::new()).unwrap();
    assert_eq!(mg.selected("b.com/b@v0"), "v0.2.0");
    let list: Vec<String> = mg
        .build_list()
        .iter()
        .skip(1) // the main module leads the list
        .map(|m| m.to_string())
        .collect();
    assert_eq!(list, vec!["a.com/a@v0.1.0", "b.com/b@v0.2.0"]);
}

#[test]
fn ambiguous_import_lists_candidates() {
    let tm = main_module(
        r#"module: "main.com/m@v0"
language: version: "v0.9.0"
deps: {
	"foo.com/a@v0": v: "v0.1.0"
	"foo.com/a/b@v0": v: "v0.1.0"
}
"#,
        &[("x/x.cue", "package x\n\nimport \"foo.com/a/b\"\n")],
    );
    let mut reg = DirRegistry::default();
    reg.add_module(
        tm.tmp.path(),
        "foo.com/a@v0.1.0",
        &[
            ("cue.mod/module.cue", "module: \"foo.com/a@v0\"\nlanguage: version: \"v0.9.0\"\n"),
            ("b/b.cue", "package b\n"),
        ],
    );
    reg.add_module(
        tm.tmp.path(),
        "foo.com/a/b@v0.1.0",
        &[
            (
                "cue.mod/module.cue",
                "module: \"foo.com/a/b@v0\"\nlanguage: version: \"v0.9.0\"\n",
            ),
            ("b.cue", "package b\n"),
        ],
    );

    let err = run_tidy(&tm, Arc::new(reg)).unwrap_err();
    let amb = err
        .downcast_ref::<AmbiguousImport>()
        .unwrap_or_else(|| panic!("expected AmbiguousImport, got {:#}", err));
    assert_eq!(amb.import_path, "foo.com/a/b");
    let candidates: Vec<String> = amb.candidates.iter().map(|c| c.to_string()).collect();
    // Shortest module path first.
    assert_eq!(candidates, vec!["foo.com/a@v0.1.0", "foo.com/a/b@v0.1.0"]);
}

#[test]
fn tidy_removes_unused_dependency() {
    let tm = main_module(
        r#"module: "main.com/m@v0"
language: version: "v0.9.0"
deps: {
	"unused.com/x@v0": v: "v0.1.0"
	"used.com/y@v0": v: "v0.1.0"
}
"#,
        &[("x/x.cue", "package x\n\nimport \"used.com/y\"\n")],
    );
    let mut reg = DirRegistry::default();
    reg.add_module(
        tm.tmp.path(),
        "unused.com/x@v0.1.0",
        &[
            ("cue.mod/module.cue", "module: \"unused.com/x@v0\"\nlanguage: version: \"v0.9.0\"\n"),
            ("x.cue", "package x\n"),
        ],
    );
    reg.add_module(
        tm.tmp.path(),
        "used.com/y@v0.1.0",
        &[
            ("cue.mod/module.cue", "module: \"used.com/y@v0\"\nlanguage: version: \"v0.9.0\"\n"),
            ("y.cue", "package y\n"),
        ],
    );
    let reg: Arc<DirRegistry> = Arc::new(reg);

    let tidied = run_tidy(&tm, reg.clone()).unwrap();
    assert_eq!(dep_strings(&tidied), vec!["used.com/y@v0 v0.1.0"]);

    // Check mode reports the stale manifest as untidy.
    let err = check_tidy(
        &Cancellation::new(),
        &tm.main_loc,
        &tm.manifest,
        reg,
        &FileImportScanner,
    )
    .unwrap_err();
    let nt = err
        .downcast_ref::<cuemod::errors::NotTidy>()
        .unwrap_or_else(|| panic!("expected NotTidy, got {:#}", err));
    assert!(
        nt.reason.as_deref().unwrap_or("").contains("unused.com/x"),
        "{:?}",
        nt.reason
    );
}

#[test]
fn local_replacement_bypasses_registry() {
    let tm = main_module(
        r#"module: "main.com/m@v0"
language: version: "v0.9.0"
deps: {
	"foo.com/a@v0": v: "v0.1.0"
}
"#,
        &[("x/x.cue", "package x\n\nimport \"foo.com/a\"\n")],
    );
    // The replacement directory lives next to the main module tree.
    let main_root = tm.main_loc.abs_dir();
    write_files(
        &main_root,
        &[
            (
                "local-foo/cue.mod/module.cue",
                "module: \"foo.com/a@v0\"\nlanguage: version: \"v0.9.0\"\ndeps: \"bar.com/b@v0\": v: \"v0.3.0\"\n",
            ),
            ("local-foo/a.cue", "package a\n\nimport \"bar.com/b\"\n"),
        ],
    );

    let mut reg = DirRegistry::default();
    reg.add_module(
        tm.tmp.path(),
        "bar.com/b@v0.3.0",
        &[
            ("cue.mod/module.cue", "module: \"bar.com/b@v0\"\nlanguage: version: \"v0.9.0\"\n"),
            ("b.cue", "package b\n"),
        ],
    );
    // foo.com/a must never hit the network.
    reg.deny("foo.com/a@v0");
    let inner: Arc<DirRegistry> = Arc::new(reg);

    let replacements = cuemod::replace::Replacements::parse(
        [("foo.com/a@v0", "local-foo")],
        false,
    )
    .unwrap();
    let replaced = Arc::new(cuemod::replace::ReplacedRegistry::new(
        inner.clone(),
        replacements,
        main_root,
    ));

    let tidied = run_tidy(&tm, replaced).unwrap();
    assert_eq!(
        dep_strings(&tidied),
        vec!["bar.com/b@v0 v0.3.0", "foo.com/a@v0 v0.1.0"]
    );
    // The local module's requirements were read from disk, and bar's
    // from the registry.
    let calls = inner.requirement_calls.lock().unwrap().clone();
    assert!(
        calls.iter().any(|c| c == "bar.com/b@v0.3.0"),
        "calls: {:?}",
        calls
    );
}

#[test]
fn missing_import_is_reported() {
    let tm = main_module(
        "module: \"main.com/m@v0\"\nlanguage: version: \"v0.9.0\"\n",
        &[("x/x.cue", "package x\n\nimport \"gone.com/x\"\n")],
    );
    let reg = Arc::new(DirRegistry::default());
    let err = run_tidy(&tm, reg).unwrap_err();
    let missing = err
        .downcast_ref::<cuemod::errors::ImportMissing>()
        .unwrap_or_else(|| panic!("expected ImportMissing, got {:#}", err));
    assert_eq!(missing.import_path, "gone.com/x");
}

/// The full pipeline: tidy over a cache over a byte-level remote,
/// verifying the cache ends up with exactly one extracted tree.
#[test]
fn tidy_through_cache_and_remote() {
    use cuemod::modzip;
    use cuemod::registry::Remote;
    use std::io::Cursor;

    struct MemFile {
        path: String,
        data: Vec<u8>,
    }
    impl modzip::ArchiveFile for MemFile {
        fn path(&self) -> String {
            self.path.clone()
        }
        fn size(&self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }
        fn open(&self) -> Result<Box<dyn std::io::Read>> {
            Ok(Box::new(Cursor::new(self.data.clone())))
        }
    }

    struct MemRemote {
        zip: Vec<u8>,
        module_file: String,
        zip_calls: AtomicUsize,
    }
    impl Remote for MemRemote {
        fn module_file(&self, _c: &Cancellation, m: &Version) -> Result<Vec<u8>> {
            if m.to_string() != "other.com/x@v0.1.0" {
                return Err(cuemod::errors::NotFound { what: m.to_string() }.into());
            }
            Ok(self.module_file.as_bytes().to_vec())
        }
        fn module_zip(
            &self,
            _c: &Cancellation,
            m: &Version,
            out: &mut dyn std::io::Write,
        ) -> Result<u64> {
            if m.to_string() != "other.com/x@v0.1.0" {
                return Err(cuemod::errors::NotFound { what: m.to_string() }.into());
            }
            self.zip_calls.fetch_add(1, Ordering::SeqCst);
            out.write_all(&self.zip)?;
            Ok(self.zip.len() as u64)
        }
        fn module_versions(&self, _c: &Cancellation, mpath: &str) -> Result<Vec<String>> {
            if mpath == "other.com/x" || mpath == "other.com/x@v0" {
                Ok(vec!["v0.1.0".to_string()])
            } else {
                Err(cuemod::errors::NotFound {
                    what: mpath.to_string(),
                }
                .into())
            }
        }
    }

    let module_file = "module: \"other.com/x@v0\"\nlanguage: version: \"v0.9.0\"\n";
    let files = vec![
        MemFile {
            path: "cue.mod/module.cue".to_string(),
            data: module_file.as_bytes().to_vec(),
        },
        MemFile {
            path: "x.cue".to_string(),
            data: b"package x\n".to_vec(),
        },
    ];
    let mut zip = Cursor::new(Vec::new());
    modzip::create(&mut zip, &Version::must_parse("other.com/x@v0.1.0"), &files).unwrap();

    let remote = Arc::new(MemRemote {
        zip: zip.into_inner(),
        module_file: module_file.to_string(),
        zip_calls: AtomicUsize::new(0),
    });

    let tm = main_module(
        "module: \"main.com/m@v0\"\nlanguage: version: \"v0.9.0\"\n",
        &[("x/x.cue", "package x\n\nimport \"other.com/x\"\n")],
    );
    let cache_root = tm.tmp.path().join("cache/mod");
    let cache = Arc::new(cuemod::cache::Cache::new(&cache_root, remote.clone()).unwrap());

    let tidied = run_tidy(&tm, cache).unwrap();
    assert_eq!(dep_strings(&tidied), vec!["other.com/x@v0 v0.1.0"]);

    // Exactly one extracted tree, downloaded exactly once.
    assert_eq!(remote.zip_calls.load(Ordering::SeqCst), 1);
    let extract_root = cache_root.join("extract");
    let trees: Vec<_> = fs::read_dir(extract_root)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(trees.len(), 1);
}
