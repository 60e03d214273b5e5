//! Compression codec seam.
//!
//! Key suffixes and values can optionally pass through an entropy coder
//! (the original engine uses Huffman tables) before landing in cells. The
//! coder itself is an external collaborator; this trait is the contract the
//! cell builder and the page decoder consume.

use std::sync::Arc;

/// A reversible byte-string codec.
pub trait Codec: Send + Sync {
    /// Encodes logical bytes into their on-page form.
    fn encode(&self, data: &[u8]) -> Vec<u8>;

    /// Decodes on-page bytes back to their logical form.
    fn decode(&self, data: &[u8]) -> Vec<u8>;
}

/// The codecs configured for a table, if any.
#[derive(Clone, Default)]
pub struct CodecSet {
    /// Codec applied to key suffixes.
    pub key: Option<Arc<dyn Codec>>,
    /// Codec applied to values.
    pub value: Option<Arc<dyn Codec>>,
}

impl CodecSet {
    /// A codec set with no codecs configured.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for CodecSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecSet")
            .field("key", &self.key.is_some())
            .field("value", &self.value.is_some())
            .finish()
    }
}
