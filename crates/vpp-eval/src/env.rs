//! Scoped evaluation environment.
//!
//! Two stacks back name resolution:
//!
//! - a stack of *call frames*, each owning a stack of *block scopes*
//!   (ordered name → value maps). A macro call pushes a fresh frame, so
//!   macros never see caller locals; `include` pushes no frame and the
//!   included file reads and writes the caller's scopes.
//! - a process-flat map of *globals*, consulted after every block scope
//!   of the current frame missed.
//!
//! The environment also tracks which file is executing and the stack of
//! call/include sites, which is what turns a semantic error into a
//! diagnostic with `from <file>:<line>:<column>` frames.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;

use vpp_util::{Handler, Sink, SourceError};

use crate::value::Variant;

/// Name resolution or scope management failure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("identifier already defined")]
    AlreadyDefined,
    #[error("identifier undefined")]
    Undefined,
    #[error("no open scope")]
    NoScope,
}

/// One call/include site remembered for diagnostics: the file the call
/// was made *from* and where.
#[derive(Clone, Debug)]
struct CallSite {
    caller: PathBuf,
    line: u32,
    column: u32,
}

/// One call frame: the block scopes a macro body (or the top level of a
/// file) resolves names against.
#[derive(Debug)]
struct Frame {
    scopes: Vec<IndexMap<String, Variant>>,
}

impl Frame {
    /// A frame opened with its first block scope.
    fn with_scope() -> Self {
        Self {
            scopes: vec![IndexMap::new()],
        }
    }
}

/// The evaluation environment for one `generate` run of one file.
pub struct Environment {
    frames: Vec<Frame>,
    globals: IndexMap<String, Variant>,
    curr_file: PathBuf,
    call_stack: Vec<CallSite>,
    handler: Handler,
}

impl Environment {
    /// A fresh environment for evaluating `file`, reporting through
    /// `sink`. Starts with one call frame holding one block scope.
    pub fn new(file: impl Into<PathBuf>, sink: Sink) -> Self {
        Self {
            frames: vec![Frame::with_scope()],
            globals: IndexMap::new(),
            curr_file: file.into(),
            call_stack: Vec::new(),
            handler: Handler::new(sink),
        }
    }

    // =========================================================================
    // DEFINITIONS AND LOOKUP
    // =========================================================================

    /// Bind a global. Fails if the name is already bound globally.
    pub fn put_global(&mut self, name: String, value: Variant) -> Result<(), EnvError> {
        if self.globals.contains_key(&name) {
            return Err(EnvError::AlreadyDefined);
        }
        self.globals.insert(name, value);
        Ok(())
    }

    /// Bind a local in the innermost block scope of the current call
    /// frame. Fails only on a duplicate in that same scope.
    pub fn put_local(&mut self, name: String, value: Variant) -> Result<(), EnvError> {
        let scope = self
            .frames
            .last_mut()
            .and_then(|frame| frame.scopes.last_mut())
            .ok_or(EnvError::NoScope)?;
        if scope.contains_key(&name) {
            return Err(EnvError::AlreadyDefined);
        }
        scope.insert(name, value);
        Ok(())
    }

    /// Look a name up: innermost-out through the current frame's block
    /// scopes, then the globals.
    pub fn get(&self, name: &str) -> Result<Variant, EnvError> {
        let frame = self.frames.last().ok_or(EnvError::NoScope)?;
        for scope in frame.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        self.globals.get(name).cloned().ok_or(EnvError::Undefined)
    }

    /// Like [`Environment::get`], but a mutable handle to the binding
    /// itself (the l-value form of an identifier).
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Variant, EnvError> {
        let frame = self.frames.last_mut().ok_or(EnvError::NoScope)?;
        for scope in frame.scopes.iter_mut().rev() {
            if let Some(value) = scope.get_mut(name) {
                return Ok(value);
            }
        }
        self.globals.get_mut(name).ok_or(EnvError::Undefined)
    }

    // =========================================================================
    // SCOPE MANAGEMENT
    // =========================================================================

    /// Open a block scope in the current call frame.
    pub fn push_block(&mut self) -> Result<(), EnvError> {
        self.frames
            .last_mut()
            .ok_or(EnvError::NoScope)?
            .scopes
            .push(IndexMap::new());
        Ok(())
    }

    /// Close the innermost block scope.
    pub fn pop_block(&mut self) -> Result<(), EnvError> {
        self.frames
            .last_mut()
            .and_then(|frame| frame.scopes.pop())
            .ok_or(EnvError::NoScope)?;
        Ok(())
    }

    /// Enter a macro call: a fresh frame with one scope, hiding caller
    /// locals. `line`/`column` locate the call site in the caller.
    pub fn push_call(&mut self, file: PathBuf, line: u32, column: u32) {
        self.frames.push(Frame::with_scope());
        self.call_stack.push(CallSite {
            caller: std::mem::replace(&mut self.curr_file, file),
            line,
            column,
        });
    }

    /// Leave a macro call.
    pub fn pop_call(&mut self) {
        self.frames.pop();
        if let Some(site) = self.call_stack.pop() {
            self.curr_file = site.caller;
        }
    }

    /// Enter an include: shares the caller's block scopes, changes only
    /// the current file and the diagnostic stack.
    pub fn push_include(&mut self, file: PathBuf, line: u32, column: u32) {
        self.call_stack.push(CallSite {
            caller: std::mem::replace(&mut self.curr_file, file),
            line,
            column,
        });
    }

    /// Leave an include.
    pub fn pop_include(&mut self) {
        if let Some(site) = self.call_stack.pop() {
            self.curr_file = site.caller;
        }
    }

    /// Depth of the call/include stack; zero at the outermost file.
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// The file currently executing, for diagnostics.
    pub fn current_file(&self) -> &Path {
        &self.curr_file
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    /// Report a semantic error: the rendered diagnostic prefixed with
    /// the current file, followed by one `from` line per enclosing
    /// call/include site, innermost first.
    pub fn report(&self, error: &SourceError) {
        let mut block = format!("{}:{}\n", self.curr_file.display(), error.render());
        for site in self.call_stack.iter().rev() {
            block.push_str(&format!(
                "from {}:{}:{}\n",
                site.caller.display(),
                site.line,
                site.column
            ));
        }
        self.handler.report(&block);
    }

    pub fn error_count(&self) -> usize {
        self.handler.error_count()
    }

    pub fn suppressed(&self) -> usize {
        self.handler.suppressed()
    }

    pub fn sink(&self) -> &Sink {
        self.handler.sink()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpp_util::Span;

    fn env() -> Environment {
        Environment::new("top.src", Sink::buffer())
    }

    #[test]
    fn test_put_local_then_get() {
        let mut env = env();
        env.put_local("x".into(), Variant::Int(42)).unwrap();
        assert_eq!(env.get("x").unwrap().get_int().unwrap(), 42);
    }

    #[test]
    fn test_duplicate_local_in_same_scope() {
        let mut env = env();
        env.put_local("x".into(), Variant::Int(1)).unwrap();
        assert_eq!(
            env.put_local("x".into(), Variant::Int(2)),
            Err(EnvError::AlreadyDefined)
        );
    }

    #[test]
    fn test_shadowing_in_inner_scope() {
        let mut env = env();
        env.put_local("x".into(), Variant::Int(1)).unwrap();
        env.push_block().unwrap();
        env.put_local("x".into(), Variant::Int(2)).unwrap();
        assert_eq!(env.get("x").unwrap().get_int().unwrap(), 2);
        env.pop_block().unwrap();
        assert_eq!(env.get("x").unwrap().get_int().unwrap(), 1);
    }

    #[test]
    fn test_pop_block_drops_bindings() {
        let mut env = env();
        env.push_block().unwrap();
        env.put_local("tmp".into(), Variant::Int(1)).unwrap();
        env.pop_block().unwrap();
        assert_eq!(env.get("tmp"), Err(EnvError::Undefined));
    }

    #[test]
    fn test_globals_visible_after_scopes_miss() {
        let mut env = env();
        env.put_global("g".into(), Variant::Int(7)).unwrap();
        env.push_block().unwrap();
        assert_eq!(env.get("g").unwrap().get_int().unwrap(), 7);
    }

    #[test]
    fn test_duplicate_global() {
        let mut env = env();
        env.put_global("g".into(), Variant::Int(1)).unwrap();
        assert_eq!(
            env.put_global("g".into(), Variant::Int(2)),
            Err(EnvError::AlreadyDefined)
        );
    }

    #[test]
    fn test_local_shadows_global() {
        let mut env = env();
        env.put_global("n".into(), Variant::Int(1)).unwrap();
        env.put_local("n".into(), Variant::Int(2)).unwrap();
        assert_eq!(env.get("n").unwrap().get_int().unwrap(), 2);
    }

    #[test]
    fn test_call_frame_hides_caller_locals() {
        let mut env = env();
        env.put_local("secret".into(), Variant::Int(1)).unwrap();
        env.push_call("macro.dat".into(), 3, 2);
        assert_eq!(env.get("secret"), Err(EnvError::Undefined));
        // But globals remain visible.
        env.put_global("g".into(), Variant::Int(9)).unwrap();
        assert_eq!(env.get("g").unwrap().get_int().unwrap(), 9);
        env.pop_call();
        assert_eq!(env.get("secret").unwrap().get_int().unwrap(), 1);
    }

    #[test]
    fn test_call_frame_locals_are_dropped() {
        let mut env = env();
        env.push_call("macro.dat".into(), 1, 1);
        env.put_local("p".into(), Variant::Int(5)).unwrap();
        env.pop_call();
        assert_eq!(env.get("p"), Err(EnvError::Undefined));
    }

    #[test]
    fn test_include_shares_caller_scopes() {
        let mut env = env();
        env.put_local("k".into(), Variant::Int(1)).unwrap();
        env.push_include("inc.dat".into(), 2, 1);
        assert_eq!(env.get("k").unwrap().get_int().unwrap(), 1);
        env.put_local("from_include".into(), Variant::Int(2)).unwrap();
        env.pop_include();
        // Definitions made by the include stay visible in the caller.
        assert_eq!(env.get("from_include").unwrap().get_int().unwrap(), 2);
    }

    #[test]
    fn test_current_file_tracks_calls_and_includes() {
        let mut env = env();
        assert_eq!(env.current_file(), Path::new("top.src"));
        env.push_include("a.dat".into(), 1, 1);
        assert_eq!(env.current_file(), Path::new("a.dat"));
        env.push_call("b.dat".into(), 2, 2);
        assert_eq!(env.current_file(), Path::new("b.dat"));
        env.pop_call();
        assert_eq!(env.current_file(), Path::new("a.dat"));
        env.pop_include();
        assert_eq!(env.current_file(), Path::new("top.src"));
        assert_eq!(env.call_depth(), 0);
    }

    #[test]
    fn test_get_mut_writes_through() {
        let mut env = env();
        env.put_local("x".into(), Variant::Int(1)).unwrap();
        *env.get_mut("x").unwrap() = Variant::Int(8);
        assert_eq!(env.get("x").unwrap().get_int().unwrap(), 8);
    }

    #[test]
    fn test_report_includes_frames() {
        let sink = Sink::buffer();
        let mut env = Environment::new("top.src", sink.clone());
        env.push_include("defs.dat".into(), 4, 2);
        env.push_call("lib.dat".into(), 7, 3);
        let error = SourceError::semantic(
            Span::new(0, 1, 1, 1),
            "x\n",
            "cannot find 'x'; identifier undefined",
        );
        env.report(&error);
        let output = sink.contents();
        assert!(output.starts_with("lib.dat:1:1: semantic error:"));
        // Innermost call site first.
        let from_defs = output.find("from defs.dat:7:3").expect("call frame line");
        let from_top = output.find("from top.src:4:2").expect("include frame line");
        assert!(from_defs < from_top);
        assert_eq!(env.error_count(), 1);
    }
}
