//! Include/exclude path trees with literal, glob, or POSIX-extended-regex
//! matching at each path component (spec.md §4.7).

use regex::Regex;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchMode {
    Literal,
    Glob,
    Regex,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A non-leaf path component; matching it continues into `children`.
    Link,
    Extract,
    Exclude,
}

enum Pattern {
    Literal(String),
    Glob(String),
    Regex(Regex),
}

impl Pattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Literal(s) => s == name,
            Pattern::Glob(pat) => glob_match(name, pat),
            Pattern::Regex(re) => re.is_match(name),
        }
    }
}

pub struct PathNode {
    name: String,
    kind: NodeKind,
    pattern: Pattern,
    children: Vec<PathNode>,
}

impl PathNode {
    fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Extract | NodeKind::Exclude)
    }
}

/// Independent extract/exclude trees built from CLI path arguments.
#[derive(Default)]
pub struct PathFilter {
    extract: Vec<PathNode>,
    exclude: Vec<PathNode>,
}

fn compile(name: &str, mode: MatchMode) -> Result<Pattern> {
    Ok(match mode {
        MatchMode::Literal => Pattern::Literal(name.to_string()),
        MatchMode::Glob => Pattern::Glob(name.to_string()),
        MatchMode::Regex => Pattern::Regex(Regex::new(&format!("^{name}$"))?),
    })
}

fn insert(nodes: &mut Vec<PathNode>, components: &[&str], kind: NodeKind, mode: MatchMode) -> Result<()> {
    let Some((first, rest)) = components.split_first() else { return Ok(()) };

    if let Some(existing) = nodes.iter_mut().find(|n| n.name == *first) {
        if existing.is_leaf() {
            // a leaf already covers everything under this prefix: a longer
            // path is a no-op (dominance rule, spec.md §4.7).
            return Ok(());
        }
        if rest.is_empty() {
            // shorter path wins: discard whatever was under this component.
            existing.kind = kind;
            existing.children.clear();
            return Ok(());
        }
        return insert(&mut existing.children, rest, kind, mode);
    }

    let mut node = PathNode {
        name: first.to_string(),
        kind: if rest.is_empty() { kind } else { NodeKind::Link },
        pattern: compile(first, mode)?,
        children: Vec::new(),
    };
    if !rest.is_empty() {
        insert(&mut node.children, rest, kind, mode)?;
    }
    nodes.push(node);
    Ok(())
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

impl PathFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_extract(&mut self, path: &str, mode: MatchMode) -> Result<()> {
        let components = split_path(path);
        insert(&mut self.extract, &components, NodeKind::Extract, mode)
    }

    pub fn add_exclude(&mut self, path: &str, mode: MatchMode) -> Result<()> {
        let components = split_path(path);
        insert(&mut self.exclude, &components, NodeKind::Exclude, mode)
    }

    pub fn has_extract_filters(&self) -> bool {
        !self.extract.is_empty()
    }

    pub fn has_exclude_filters(&self) -> bool {
        !self.exclude.is_empty()
    }

    /// No `-extract-file` patterns means "extract everything", so an empty
    /// tree must stay unconstrained rather than matching zero entries.
    pub fn extract_roots(&self) -> ActiveSet<'_> {
        if self.extract.is_empty() {
            ActiveSet::unconstrained()
        } else {
            ActiveSet(Some(self.extract.iter().collect()))
        }
    }

    pub fn exclude_roots(&self) -> ActiveSet<'_> {
        ActiveSet(Some(self.exclude.iter().collect()))
    }
}

/// The "active sets" of filter nodes currently in play at a directory
/// depth. `None` means "match everything" (no filter constrains this
/// subtree any further).
#[derive(Clone)]
pub struct ActiveSet<'a>(Option<Vec<&'a PathNode>>);

impl<'a> ActiveSet<'a> {
    pub fn unconstrained() -> Self {
        ActiveSet(None)
    }

    pub fn is_unconstrained(&self) -> bool {
        self.0.is_none()
    }

    /// `extract_matches`: a matching leaf means "everything underneath is
    /// implicitly included" (`next` becomes unconstrained); a matching
    /// non-leaf contributes its children to `next`.
    pub fn extract_matches(&self, name: &str) -> (bool, ActiveSet<'a>) {
        let Some(nodes) = &self.0 else {
            return (true, ActiveSet(None));
        };
        let mut next = Vec::new();
        let mut leaf_hit = false;
        for node in nodes {
            if node.pattern.matches(name) {
                if node.is_leaf() {
                    leaf_hit = true;
                } else {
                    next.extend(node.children.iter());
                }
            }
        }
        if leaf_hit {
            return (true, ActiveSet(None));
        }
        if next.is_empty() {
            (false, ActiveSet(Some(Vec::new())))
        } else {
            (true, ActiveSet(Some(next)))
        }
    }

    /// `exclude_matches`: symmetric to `extract_matches`, except a leaf
    /// match tells the caller to skip the entry entirely.
    pub fn exclude_matches(&self, name: &str) -> (bool, ActiveSet<'a>) {
        let Some(nodes) = &self.0 else {
            return (false, ActiveSet(None));
        };
        let mut next = Vec::new();
        let mut leaf_hit = false;
        for node in nodes {
            if node.pattern.matches(name) {
                if node.is_leaf() {
                    leaf_hit = true;
                } else {
                    next.extend(node.children.iter());
                }
            }
        }
        if leaf_hit {
            return (true, ActiveSet(None));
        }
        (false, ActiveSet(Some(next)))
    }
}

/// `fnmatch(3)` with `FNM_PATHNAME|FNM_PERIOD[|FNM_EXTMATCH]`, the same
/// flags original_source's `extract_matches`/`exclude_matches` use.
#[cfg(unix)]
fn glob_match(name: &str, pattern: &str) -> bool {
    use std::ffi::CString;
    let Ok(c_name) = CString::new(name) else { return false };
    let Ok(c_pattern) = CString::new(pattern) else { return false };

    #[cfg(target_os = "linux")]
    let flags = libc::FNM_PATHNAME | libc::FNM_PERIOD | libc::FNM_EXTMATCH;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::FNM_PATHNAME | libc::FNM_PERIOD;

    unsafe { libc::fnmatch(c_pattern.as_ptr(), c_name.as_ptr(), flags) == 0 }
}

#[cfg(not(unix))]
fn glob_match(_name: &str, _pattern: &str) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_insertion() {
        let mut a = PathFilter::new();
        a.add_extract("/etc/a.conf", MatchMode::Literal).unwrap();
        a.add_extract("/etc/a.conf", MatchMode::Literal).unwrap();

        let mut b = PathFilter::new();
        b.add_extract("/etc/a.conf", MatchMode::Literal).unwrap();

        assert_eq!(a.extract.len(), b.extract.len());
    }

    #[test]
    fn shorter_prefix_dominates_longer() {
        let mut f = PathFilter::new();
        f.add_extract("/etc", MatchMode::Literal).unwrap();
        f.add_extract("/etc/a.conf", MatchMode::Literal).unwrap();
        assert_eq!(f.extract.len(), 1);
        assert!(f.extract[0].is_leaf());
        assert!(f.extract[0].children.is_empty());
    }

    #[test]
    fn longer_path_under_leaf_is_noop() {
        let mut f = PathFilter::new();
        f.add_extract("/etc/a.conf", MatchMode::Literal).unwrap();
        // "/etc/a.conf" is already a leaf; nothing under it should insert.
        f.add_extract("/etc/a.conf/sub", MatchMode::Literal).unwrap();
        assert!(f.extract[0].children[0].is_leaf());
    }

    #[test]
    fn glob_extract_matches_conf_only() {
        let mut f = PathFilter::new();
        f.add_extract("/etc/*.conf", MatchMode::Glob).unwrap();

        let root = f.extract_roots();
        let (m, next) = root.extract_matches("etc");
        assert!(m);
        let (m, _) = next.extract_matches("a.conf");
        assert!(m);
        let (m, _) = next.extract_matches("b.cfg");
        assert!(!m);
    }

    #[test]
    fn no_extract_filters_means_extract_everything() {
        let f = PathFilter::new();
        let (m, next) = f.extract_roots().extract_matches("anything");
        assert!(m);
        assert!(next.is_unconstrained());
    }

    #[test]
    fn no_exclude_filters_means_exclude_nothing() {
        let f = PathFilter::new();
        let (excluded, _) = f.exclude_roots().exclude_matches("anything");
        assert!(!excluded);
    }

    #[test]
    fn unconstrained_matches_everything() {
        let set = ActiveSet::unconstrained();
        let (m, next) = set.extract_matches("anything");
        assert!(m);
        assert!(next.is_unconstrained());
    }
}
