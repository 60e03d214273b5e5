//! # burrow-common
//!
//! Common types, errors, and utilities for BurrowDB.
//!
//! This crate provides the foundational pieces shared by the storage engine
//! components:
//!
//! - **Types**: core identifiers (`BlockAddr`) and sentinels
//! - **Errors**: unified error handling with `BurrowError`
//! - **Constants**: system-wide sizing constants and limits
//! - **Memory**: the scratch-buffer pool used for disk-image staging

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod error;
pub mod memory;
pub mod types;

pub use error::{BurrowError, BurrowResult, ErrorCode};
pub use types::BlockAddr;
