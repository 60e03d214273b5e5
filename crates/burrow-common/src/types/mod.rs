//! Type definitions for BurrowDB.

mod ids;

pub use ids::BlockAddr;
