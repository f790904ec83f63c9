//! String objects
//!
//! Short strings (up to [`crate::defaults::MAX_SHORT_LEN`] bytes) are interned
//! in the shared object space and hashed on creation. Long strings are plain
//! objects whose hash is computed on first use and cached.

use once_cell::sync::OnceCell;
use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::sync::Arc;

/// Seeded content hash shared by interning and map keys
pub fn hash_str(seed: u64, s: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write(s.as_bytes());
    hasher.finish()
}

/// Byte string
#[derive(Debug)]
pub struct StrObj {
    content: Arc<str>,
    hash: OnceCell<u64>,
}

impl StrObj {
    /// Short string with a precomputed hash
    pub fn short(content: Arc<str>, hash: u64) -> Self {
        Self {
            content,
            hash: OnceCell::with_value(hash),
        }
    }

    /// Long string; the hash is computed lazily
    pub fn long(content: Arc<str>) -> Self {
        Self {
            content,
            hash: OnceCell::new(),
        }
    }

    /// String contents
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.content
    }

    /// Shared handle to the contents
    #[inline]
    pub fn content(&self) -> &Arc<str> {
        &self.content
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the string is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Whether the hash has been computed
    pub fn is_hashed(&self) -> bool {
        self.hash.get().is_some()
    }

    /// Content hash, computed on first call
    pub fn hash(&self, seed: u64) -> u64 {
        *self.hash.get_or_init(|| hash_str(seed, &self.content))
    }
}

/// UTF-8 string with its character count cached
#[derive(Debug)]
pub struct U8StrObj {
    content: Arc<str>,
    chars: usize,
}

impl U8StrObj {
    /// Wrap UTF-8 contents
    pub fn new(content: Arc<str>) -> Self {
        let chars = content.chars().count();
        Self { content, chars }
    }

    /// String contents
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.content
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the string is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Number of characters
    #[inline]
    pub fn char_count(&self) -> usize {
        self.chars
    }

    /// Character at `index`
    pub fn char_at(&self, index: usize) -> Option<char> {
        self.content.chars().nth(index)
    }
}
