//! vpp-util - Shared infrastructure for the vpp preprocessor.
//!
//! This crate holds the pieces every pipeline phase needs:
//!
//! - [`Span`]: byte-offset + line/column source locations
//! - [`SourceError`] / [`Category`]: located, categorized errors that
//!   render with a caret snippet
//! - [`Handler`] / [`Sink`]: per-file error accounting over a
//!   process-wide line-atomic output channel
//!
//! The phase crates (`vpp-lex`, `vpp-par`, `vpp-eval`, `vpp-drv`) depend
//! on this crate and nothing here depends on them.

pub mod diagnostic;
pub mod span;

pub use diagnostic::{Category, Handler, Sink, SourceError, MAX_SHOWN_ERRORS};
pub use span::Span;
