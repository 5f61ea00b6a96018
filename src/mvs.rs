//! Minimum Version Selection over an incrementally-built requirement
//! graph.
//!
//! The graph is not a pure data structure: alongside the `requires`
//! edges it carries a `selected` table recording, per module path, the
//! highest version observed on any edge out of a root-reachable node.
//! Selection is therefore always current and never re-derived.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::version::Version;

/// Compares two version strings of one module path. The empty string
/// (the main module) must rank above every concrete version.
pub type CmpFn = Box<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

pub struct Graph {
    cmp: CmpFn,
    roots: Vec<Version>,
    required: HashMap<Version, Vec<Version>>,
    reachable: HashSet<Version>,
    selected: HashMap<String, String>,
}

impl Graph {
    /// Creates a graph with the given root modules. Roots are reachable
    /// by definition and immediately participate in selection.
    pub fn new(cmp: CmpFn, roots: Vec<Version>) -> Graph {
        let mut g = Graph {
            cmp,
            roots: Vec::new(),
            required: HashMap::new(),
            reachable: HashSet::new(),
            selected: HashMap::new(),
        };
        for r in &roots {
            g.reachable.insert(r.clone());
            g.update_selected(r);
        }
        g.roots = roots;
        g
    }

    fn update_selected(&mut self, m: &Version) {
        let cur = self
            .selected
            .get(m.path())
            .map(String::as_str)
            .unwrap_or("none");
        if (self.cmp)(cur, m.version()) == Ordering::Less {
            self.selected
                .insert(m.path().to_string(), m.version().to_string());
        }
    }

    /// Records the direct requirements of `m`.
    ///
    /// Panics if `m` is not reachable from a root (the caller has built a
    /// disconnected graph) or if the requirements of `m` were already
    /// recorded.
    pub fn require(&mut self, m: &Version, reqs: Vec<Version>) {
        if !self.reachable.contains(m) {
            panic!("require called for module {} not reachable from any root", m);
        }
        if self.required.contains_key(m) {
            panic!("require called more than once for module {}", m);
        }
        for dep in &reqs {
            self.reachable.insert(dep.clone());
            self.update_selected(dep);
        }
        self.required.insert(m.clone(), reqs);
    }

    /// Whether the requirements of `m` have been recorded.
    pub fn has_required(&self, m: &Version) -> bool {
        self.required.contains_key(m)
    }

    /// The recorded direct requirements of `m`, if any.
    pub fn required_by(&self, m: &Version) -> Option<&[Version]> {
        self.required.get(m).map(Vec::as_slice)
    }

    pub fn roots(&self) -> &[Version] {
        &self.roots
    }

    /// The selected version for `path`, or `"none"`.
    pub fn selected(&self, path: &str) -> &str {
        self.selected.get(path).map(String::as_str).unwrap_or("none")
    }

    /// Materializes the build list: each distinct root path first, at its
    /// selected version and in root order, then every other selected
    /// path in sorted order.
    pub fn build_list(&self) -> Vec<Version> {
        let mut out = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for r in &self.roots {
            if !seen.insert(r.path()) {
                continue;
            }
            let v = self.selected(r.path());
            if v == "none" {
                continue;
            }
            out.push(Version::must_new(r.path(), v));
        }
        let mut rest: Vec<&String> = self
            .selected
            .keys()
            .filter(|p| !seen.contains(p.as_str()))
            .collect();
        rest.sort();
        for p in rest {
            let v = self.selected(p);
            if v == "none" {
                continue;
            }
            out.push(Version::must_new(p, v));
        }
        out
    }

    /// Visits every node reachable over `requires` edges exactly once,
    /// in breadth-first order starting from the roots.
    pub fn walk_breadth_first(&self, mut visit: impl FnMut(&Version)) {
        let mut queue: VecDeque<&Version> = VecDeque::new();
        let mut seen: HashSet<&Version> = HashSet::new();
        for r in &self.roots {
            if seen.insert(r) {
                queue.push_back(r);
            }
        }
        while let Some(m) = queue.pop_front() {
            visit(m);
            if let Some(reqs) = self.required.get(m) {
                for dep in reqs {
                    if seen.insert(dep) {
                        queue.push_back(dep);
                    }
                }
            }
        }
    }

    /// Finds the shortest requirement chain from a root to the first
    /// node satisfying `pred`; ties are broken by BFS insertion order.
    /// The returned chain starts at a root and ends at the found node.
    pub fn find_path(&self, pred: impl Fn(&Version) -> bool) -> Option<Vec<Version>> {
        let mut queue: VecDeque<&Version> = VecDeque::new();
        let mut parent: HashMap<&Version, Option<&Version>> = HashMap::new();
        for r in &self.roots {
            if !parent.contains_key(r) {
                parent.insert(r, None);
                queue.push_back(r);
            }
        }
        while let Some(m) = queue.pop_front() {
            if pred(m) {
                let mut chain = vec![m.clone()];
                let mut cur = m;
                while let Some(Some(p)) = parent.get(cur) {
                    chain.push((*p).clone());
                    cur = p;
                }
                chain.reverse();
                return Some(chain);
            }
            if let Some(reqs) = self.required.get(m) {
                for dep in reqs {
                    if !parent.contains_key(dep) {
                        parent.insert(dep, Some(m));
                        queue.push_back(dep);
                    }
                }
            }
        }
        None
    }
}

/// The selection comparator used for module graphs: the main module's
/// empty version outranks everything, otherwise SemVer precedence with
/// invalid strings (including `"none"`) lowest.
pub fn selection_cmp() -> CmpFn {
    Box::new(crate::version::compare_for_selection)
}
