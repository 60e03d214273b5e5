//! # burrow-storage
//!
//! The BurrowDB storage engine core.
//!
//! Two tightly-coupled subsystems live here:
//!
//! - The **data handle registry** (`handle`), which mediates access to named
//!   tables and their checkpoints across concurrent sessions, guaranteeing
//!   at most one open descriptor per `(name, checkpoint)` pair.
//! - The **page reconciler** (`rec`), the only path by which a dirty
//!   in-memory B-tree page becomes durable: it walks the page, builds cells,
//!   splits oversized images at tracked boundaries, promotes oversized items
//!   to overflow blocks, and writes the resulting chunks through the block
//!   manager.
//!
//! Supporting modules provide the disk image format (`page`), the block
//! manager and metadata catalog collaborators (`block`, `meta`), per-table
//! configuration (`config`), and the backing tree with its checkpoint
//! pathway (`tree`).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod codec;
pub mod config;
pub mod handle;
pub mod meta;
pub mod page;
pub mod rec;
pub mod tree;

pub use block::{
    BlockManager, BlockRef, BlockSource, BlockStats, FileBlockManager, MemBlockManager,
    MemBlockSource,
};
pub use codec::{Codec, CodecSet};
pub use config::BtreeConfig;
pub use handle::{Connection, DataHandle, HandleGuard, OpenFlags, SchemaGuard, SchemaLock};
pub use meta::{Catalog, MemCatalog};
pub use page::{Page, PageType};
pub use rec::SalvageState;
pub use tree::Btree;
