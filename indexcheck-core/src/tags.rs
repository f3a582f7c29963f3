//! Run-scoped random image tags
//!
//! Bundle and index images are pushed under short random tags so concurrent
//! runs sharing a registry namespace do not overwrite each other. Uniqueness is
//! statistical only: with 36 symbols and the default length of 6 there are
//! about 2.2 billion tags.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

/// Symbols a tag is drawn from
pub const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Default tag length
pub const DEFAULT_TAG_LENGTH: usize = 6;

/// Generates random lowercase alphanumeric tags
///
/// The RNG is seeded once; reseeding per call from the clock can hand out the
/// same tag twice within one clock tick.
pub struct TagGenerator {
    rng: StdRng,
}

impl TagGenerator {
    /// Create a generator seeded from the current time
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::with_seed(nanos ^ u64::from(std::process::id()))
    }

    /// Create a generator with a fixed seed
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Produce a tag of exactly `length` characters from [`CHARSET`]
    pub fn generate(&mut self, length: usize) -> String {
        (0..length)
            .map(|_| CHARSET[self.rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::from_clock()
    }
}

/// Tags for one pipeline run: one per bundle plus one for the index
///
/// Generated once at startup and never recomputed, so every stage that refers
/// to "the index tag" sees the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentifiers {
    bundle_tags: Vec<String>,
    index_tag: String,
}

impl RunIdentifiers {
    /// Draw `bundle_count` bundle tags followed by the index tag
    pub fn generate(generator: &mut TagGenerator, bundle_count: usize, length: usize) -> Self {
        let bundle_tags = (0..bundle_count)
            .map(|_| generator.generate(length))
            .collect();
        let index_tag = generator.generate(length);
        Self {
            bundle_tags,
            index_tag,
        }
    }

    /// Build from known tags
    pub fn from_parts(bundle_tags: Vec<String>, index_tag: String) -> Self {
        Self {
            bundle_tags,
            index_tag,
        }
    }

    pub fn bundle_tags(&self) -> &[String] {
        &self.bundle_tags
    }

    pub fn index_tag(&self) -> &str {
        &self.index_tag
    }
}
