//! The crash-dump processing pipeline.
//!
//! This crate turns a parsed crash dump of a native process into a
//! [`ProcessState`]: a symbolicated, per-thread list of stack traces
//! suitable for bucketing and triage.
//!
//! The pipeline has three collaborators:
//!
//! - A **dump reader** (out of scope here) parses the OS dump format into
//!   the typed views in [`dump`]: system info, module lists, thread register
//!   contexts and stack memory.
//! - A **symbol supplier** implements [`SymbolSupplier`] and hands symbol
//!   file bytes to the [`Symbolizer`], which caches one parsed
//!   [`SymbolFile`](retrace_symbols::SymbolFile) per module.
//! - The **stackwalkers** in [`walker`] reconstruct each thread's call chain
//!   from its register context and stack memory, applying per-architecture
//!   recovery strategies in a fixed order: CFI evaluation, frame-pointer
//!   chasing, and bounded stack scanning. Every emitted frame records which
//!   strategy produced it as its [`FrameTrust`].
//!
//! The [`Processor`] drives the whole thing: it substitutes the exception
//! context for the crashing thread, walks every thread, attaches source
//! info, and assembles the final [`ProcessState`].

#![warn(missing_docs)]

pub mod dump;
pub mod walker;

mod context;
mod frame;
mod module;
mod process_state;
mod processor;
mod symbolizer;

pub use crate::context::*;
pub use crate::frame::*;
pub use crate::module::*;
pub use crate::process_state::*;
pub use crate::processor::*;
pub use crate::symbolizer::*;
