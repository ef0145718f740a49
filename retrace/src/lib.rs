//! `retrace` is a library for post-mortem processing of crash dumps: it
//! matches the register state captured in an OS-generated process dump
//! against previously extracted symbol information and reconstructs a
//! symbolicated stack trace for every thread.
//!
//! It consists of multiple largely independent crates, re-exported here as
//! modules:
//!
//! - [`common`]: CPU architecture model and shared leaf types.
//! - [`symbols`]: the text-based symbol file format with its parsers, the
//!   aggregated per-module symbol database and a canonical writer.
//! - [`unwind`]: the call frame information expression language and its
//!   evaluator.
//! - [`processor`]: the processing pipeline itself, from per-architecture
//!   stackwalkers to the final [`ProcessState`](processor::ProcessState).
//!
//! Parsing the OS dump binary format and locating symbol files are the
//! caller's side of the contract: a dump reader fills the typed views in
//! [`processor::dump`], and a
//! [`SymbolSupplier`](processor::SymbolSupplier) hands over symbol file
//! bytes on request.
//!
//! # Features
//!
//! - **`processor`** (default): the processing pipeline together with the
//!   `symbols` and `unwind` crates it builds on. Without it, only `common`
//!   remains.
//! - **`serde`**: serialization for suitable types.

#![warn(missing_docs)]

#[doc(inline)]
pub use retrace_common as common;
#[doc(inline)]
#[cfg(feature = "processor")]
pub use retrace_processor as processor;
#[doc(inline)]
#[cfg(feature = "processor")]
pub use retrace_symbols as symbols;
#[doc(inline)]
#[cfg(feature = "processor")]
pub use retrace_unwind as unwind;
