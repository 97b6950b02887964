//! vpp-eval - Value model, environment and evaluator.
//!
//! The back half of the pipeline: parsed trees from `vpp-par` are
//! walked into output text. The pieces:
//!
//! - [`Variant`]: the dynamic value model of the directive language
//! - [`Environment`]: lexical scoping with call and include frames,
//!   plus the diagnostic call stack
//! - [`Context`] / [`Registry`]: the per-file compilation results that
//!   `include` resolves against
//! - [`visit`]: the tree walk producing a file's output string
//!
//! Evaluation of one file is strictly single-threaded; the registry is
//! read-only during evaluation, which is the only state shared between
//! files.

pub mod context;
pub mod env;
pub mod eval;
pub mod value;

pub use context::{Context, Registry};
pub use env::{EnvError, Environment};
pub use eval::{visit, Evaluator, GenerationFailed, Place};
pub use value::{AccessError, Variant};
