//! Common types used across the `retrace` crates.
//!
//! This crate is a dependency of all other `retrace` crates and intentionally
//! small. It contains the CPU architecture model shared by the stackwalkers
//! and the symbol format, and [`ByteView`], the byte container that symbol
//! suppliers hand to the processing pipeline.

#![warn(missing_docs)]

mod byteview;
mod types;

pub use crate::byteview::*;
pub use crate::types::*;

pub use debugid::{CodeId, DebugId, ParseDebugIdError};
pub use uuid::Uuid;
