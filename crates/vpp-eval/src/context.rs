//! Per-file compilation contexts and the shared registry.
//!
//! Each input file compiles into a [`Context`]: its path, its source
//! buffer, and its parsed tree (absent when compilation failed). After
//! the compile phase finishes for every file the contexts freeze into a
//! [`Registry`], which `include` consults at evaluation time. The
//! registry is read-only from then on, so worker threads generating
//! different files may share it freely.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use vpp_par::Stmt;

/// One input file: source buffer plus parse result.
#[derive(Debug)]
pub struct Context {
    pub path: PathBuf,
    /// The immutable source buffer; shared so tokens and macro bodies
    /// can be sliced from it for the file's whole lifetime.
    pub source: Arc<str>,
    /// The parsed tree, or `None` when compilation failed.
    pub ast: Option<Stmt>,
}

impl Context {
    pub fn new(path: PathBuf, source: Arc<str>, ast: Option<Stmt>) -> Self {
        Self { path, source, ast }
    }
}

/// The read-only set of all compiled files, indexed by path.
#[derive(Debug, Default)]
pub struct Registry {
    contexts: Vec<Context>,
    by_path: FxHashMap<PathBuf, usize>,
}

impl Registry {
    pub fn new(contexts: Vec<Context>) -> Self {
        let by_path = contexts
            .iter()
            .enumerate()
            .map(|(index, context)| (context.path.clone(), index))
            .collect();
        Self { contexts, by_path }
    }

    /// The context for `path`, if that file was on the command line.
    pub fn lookup(&self, path: &Path) -> Option<&Context> {
        self.by_path.get(path).map(|&index| &self.contexts[index])
    }

    /// All contexts, in command-line order.
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_path() {
        let registry = Registry::new(vec![
            Context::new("a.src".into(), Arc::from("a"), None),
            Context::new("sub/b.dat".into(), Arc::from("b"), None),
        ]);
        assert!(registry.lookup(Path::new("a.src")).is_some());
        assert!(registry.lookup(Path::new("sub/b.dat")).is_some());
        assert!(registry.lookup(Path::new("c.src")).is_none());
        assert_eq!(registry.contexts().len(), 2);
    }
}
