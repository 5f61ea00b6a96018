//! The main module's requirements: the root set, the derived default
//! major versions, and the lazily loaded module graph.
//!
//! Graph loading is deliberately shallow: only the direct requirements
//! of each root are fetched. Under the pruning invariants every module
//! providing a package is itself a root, so transitive requirements
//! only matter when a later pass promotes a module to a root and the
//! graph is rebuilt.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use crate::errors::{BuildListError, Result, SharedError};
use crate::mvs;
use crate::par::{Cancellation, Queue};
use crate::registry::Registry;
use crate::version::Version;

/// How a base path acquired (or failed to acquire) its default major
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultMajorStatus {
    /// Declared with `default: true` in the manifest.
    Explicit,
    /// Derived from the single root with that base path.
    NonExplicit,
    /// No root or declaration mentions the base path.
    NoDefault,
    /// Roots with two distinct majors exist and none is declared
    /// default.
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DefaultEntry {
    major: String,
    explicit: bool,
    ambiguous: bool,
}

/// The lazily computed full module graph.
pub struct ModuleGraph {
    g: mvs::Graph,
}

impl std::fmt::Debug for ModuleGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleGraph")
            .field("build_list", &self.g.build_list())
            .finish()
    }
}

impl ModuleGraph {
    /// The MVS-selected version for `path`, or `"none"`.
    pub fn selected(&self, path: &str) -> &str {
        self.g.selected(path)
    }

    pub fn build_list(&self) -> Vec<Version> {
        self.g.build_list()
    }

    pub fn required_by(&self, m: &Version) -> Option<&[Version]> {
        self.g.required_by(m)
    }

    pub fn walk_breadth_first(&self, visit: impl FnMut(&Version)) {
        self.g.walk_breadth_first(visit)
    }

    pub fn find_path(&self, pred: impl Fn(&Version) -> bool) -> Option<Vec<Version>> {
        self.g.find_path(pred)
    }
}

pub struct Requirements {
    registry: Arc<dyn Registry>,
    main_module: Version,
    root_modules: Vec<Version>,
    max_root_version: HashMap<String, String>,
    defaults: BTreeMap<String, DefaultEntry>,
    graph: OnceLock<std::result::Result<Arc<ModuleGraph>, SharedError>>,
}

impl std::fmt::Debug for Requirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requirements")
            .field("main_module", &self.main_module)
            .field("root_modules", &self.root_modules)
            .field("max_root_version", &self.max_root_version)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Requirements {
    /// Creates the requirement set for one resolution.
    ///
    /// Panics if the roots contain the main module (untrimmed input),
    /// are not sorted, or carry empty versions: these are internal
    /// errors in the caller, not user input.
    pub fn new(
        registry: Arc<dyn Registry>,
        main_module: Version,
        root_modules: Vec<Version>,
        default_majors: BTreeMap<String, String>,
    ) -> Requirements {
        for (i, r) in root_modules.iter().enumerate() {
            if r.path() == main_module.path() {
                panic!("untrimmed roots: main module {} found in root list", r);
            }
            if r.version().is_empty() || r.version() == "none" {
                panic!("root module {} has no version", r.path());
            }
            if i > 0 && root_modules[i - 1] > *r {
                panic!(
                    "root modules are not sorted: {} before {}",
                    root_modules[i - 1],
                    r
                );
            }
        }

        let mut max_root_version: HashMap<String, String> = HashMap::new();
        for r in &root_modules {
            match max_root_version.get(r.path()) {
                Some(cur)
                    if crate::version::compare(cur, r.version())
                        != std::cmp::Ordering::Less => {}
                _ => {
                    max_root_version.insert(r.path().to_string(), r.version().to_string());
                }
            }
        }

        let mut defaults: BTreeMap<String, DefaultEntry> = BTreeMap::new();
        for (base, major) in &default_majors {
            defaults.insert(
                base.clone(),
                DefaultEntry {
                    major: major.clone(),
                    explicit: true,
                    ambiguous: false,
                },
            );
        }
        for r in &root_modules {
            let major = match r.major() {
                Some(m) => m,
                None => continue,
            };
            match defaults.get_mut(r.base_path()) {
                None => {
                    defaults.insert(
                        r.base_path().to_string(),
                        DefaultEntry {
                            major: major.to_string(),
                            explicit: false,
                            ambiguous: false,
                        },
                    );
                }
                Some(e) if e.explicit => {}
                Some(e) => {
                    if e.major != major {
                        e.ambiguous = true;
                        // Of the ambiguous majors, remember the highest.
                        if crate::version::compare(&format!("{}.0.0", e.major), &format!("{}.0.0", major))
                            == std::cmp::Ordering::Less
                        {
                            e.major = major.to_string();
                        }
                    }
                }
            }
        }

        Requirements {
            registry,
            main_module,
            root_modules,
            max_root_version,
            defaults,
            graph: OnceLock::new(),
        }
    }

    pub fn main_module(&self) -> &Version {
        &self.main_module
    }

    pub fn root_modules(&self) -> &[Version] {
        &self.root_modules
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// The greatest root version for `path`, without loading the graph.
    /// The main module's own path selects its empty version.
    pub fn root_selected(&self, path: &str) -> Option<&str> {
        if path == self.main_module.path() {
            return Some("");
        }
        self.max_root_version.get(path).map(String::as_str)
    }

    /// The default major version for a base path.
    pub fn default_major_version(&self, base_path: &str) -> (DefaultMajorStatus, Option<&str>) {
        match self.defaults.get(base_path) {
            None => (DefaultMajorStatus::NoDefault, None),
            Some(e) if e.ambiguous => (DefaultMajorStatus::Ambiguous, Some(&e.major)),
            Some(e) if e.explicit => (DefaultMajorStatus::Explicit, Some(&e.major)),
            Some(e) => (DefaultMajorStatus::NonExplicit, Some(&e.major)),
        }
    }

    /// The explicitly declared defaults, as fed to the constructor.
    pub fn explicit_defaults(&self) -> BTreeMap<String, String> {
        self.defaults
            .iter()
            .filter(|(_, e)| e.explicit)
            .map(|(k, e)| (k.clone(), e.major.clone()))
            .collect()
    }

    /// A copy of this requirement set with different roots; the graph
    /// is recomputed on next use.
    pub fn with_roots(&self, roots: Vec<Version>) -> Requirements {
        Requirements::new(
            Arc::clone(&self.registry),
            self.main_module.clone(),
            roots,
            self.explicit_defaults(),
        )
    }

    /// A copy of this requirement set with different explicit defaults.
    pub fn with_default_majors(&self, defaults: BTreeMap<String, String>) -> Requirements {
        Requirements::new(
            Arc::clone(&self.registry),
            self.main_module.clone(),
            self.root_modules.clone(),
            defaults,
        )
    }

    /// Whether two requirement sets have the same roots and defaults.
    pub fn same_requirements(&self, other: &Requirements) -> bool {
        self.main_module == other.main_module
            && self.root_modules == other.root_modules
            && self.defaults == other.defaults
    }

    /// The full module graph, built once per requirement set.
    pub fn graph(&self, cancel: &Cancellation) -> Result<Arc<ModuleGraph>> {
        let r = self.graph.get_or_init(|| {
            self.read_mod_graph(cancel)
                .map(Arc::new)
                .map_err(SharedError::new)
        });
        r.clone().map_err(|e| e.to_error())
    }

    // Loads the direct requirements of every root concurrently and
    // deterministically: workers only append edges under a mutex, and
    // the graph's own ordering rules take over from there.
    fn read_mod_graph(&self, cancel: &Cancellation) -> Result<ModuleGraph> {
        log::debug!(
            "loading module graph for {} ({} roots)",
            self.main_module,
            self.root_modules.len()
        );
        let mut g = mvs::Graph::new(mvs::selection_cmp(), vec![self.main_module.clone()]);
        g.require(&self.main_module, self.root_modules.clone());
        let g = Arc::new(Mutex::new(g));
        let errors: Arc<Mutex<HashMap<Version, SharedError>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let queue = Queue::new();
        let mut enqueued: HashSet<&Version> = HashSet::new();
        for root in &self.root_modules {
            // Each root is loaded exactly once even when listed twice.
            if !enqueued.insert(root) {
                continue;
            }
            let root = root.clone();
            let registry = Arc::clone(&self.registry);
            let g = Arc::clone(&g);
            let errors = Arc::clone(&errors);
            let cancel = cancel.clone();
            queue.add(move || match registry.requirements(&cancel, &root) {
                Ok(reqs) => {
                    let mut g = g.lock().unwrap();
                    g.require(&root, reqs);
                }
                Err(e) => {
                    errors
                        .lock()
                        .unwrap()
                        .insert(root, SharedError::new(e));
                }
            });
        }
        queue.idle();

        let g = Arc::try_unwrap(g)
            .unwrap_or_else(|_| panic!("module graph still shared after queue idle"))
            .into_inner()
            .unwrap();
        let errors = Arc::try_unwrap(errors)
            .unwrap_or_else(|_| panic!("error map still shared after queue idle"))
            .into_inner()
            .unwrap();
        if !errors.is_empty() {
            // Report the failure closest to a root, deterministically.
            let chain = g
                .find_path(|m| errors.contains_key(m))
                .expect("failed module is reachable");
            let failed = chain.last().expect("chain is never empty").clone();
            let cause = errors[&failed].to_error();
            return Err(BuildListError { chain, cause }.into());
        }
        Ok(ModuleGraph { g })
    }
}
