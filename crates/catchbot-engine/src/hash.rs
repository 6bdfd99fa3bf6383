//! Average-hash digests and the digest → identity index.
//!
//! An image is flattened onto a white background, reduced to an 8×8 grid,
//! converted to luma and thresholded against its mean: one bit per cell,
//! row-major, most significant bit first.

use std::collections::HashMap;
use std::fmt;

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use thiserror::Error;
use tracing::{debug, warn};

pub const HASH_SIDE: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashDigest(u64);

impl HashDigest {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Number of differing bits.
    pub fn distance(self, other: HashDigest) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

pub fn average_hash(bytes: &[u8]) -> Result<HashDigest, image::ImageError> {
    let image = image::load_from_memory(bytes)?;
    Ok(average_hash_image(&image))
}

pub fn average_hash_image(image: &DynamicImage) -> HashDigest {
    let reduced = DynamicImage::ImageRgb8(flatten_alpha(image))
        .resize_exact(HASH_SIDE, HASH_SIDE, FilterType::Triangle)
        .to_luma8();
    let cells = reduced.as_raw();
    let total: u64 = cells.iter().map(|luma| u64::from(*luma)).sum();
    let mean = total as f64 / cells.len().max(1) as f64;

    let mut bits = 0u64;
    for (idx, luma) in cells.iter().enumerate() {
        if f64::from(*luma) > mean {
            bits |= 1 << (63 - idx);
        }
    }
    HashDigest(bits)
}

/// Composite onto white so transparent sprite backgrounds hash the same
/// as the game's rendered spawn images.
fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Keep the first identity registered for a digest and log the rest.
    #[default]
    KeepFirst,
    /// Fail the build on the first collision.
    Reject,
}

impl CollisionPolicy {
    pub fn from_reject_flag(reject: bool) -> Self {
        if reject {
            Self::Reject
        } else {
            Self::KeepFirst
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCollision {
    pub digest: HashDigest,
    pub kept: String,
    pub dropped: String,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to decode reference image for {identity}: {source}")]
    Decode {
        identity: String,
        #[source]
        source: image::ImageError,
    },
    #[error("reference images {kept} and {dropped} share digest {digest}")]
    Collision {
        digest: HashDigest,
        kept: String,
        dropped: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct HashIndex {
    entries: HashMap<HashDigest, String>,
    collisions: Vec<HashCollision>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build<I, S, B>(references: I, policy: CollisionPolicy) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = (S, B)>,
        S: Into<String>,
        B: AsRef<[u8]>,
    {
        let mut index = Self::new();
        for (identity, bytes) in references {
            let identity = identity.into();
            let digest = match average_hash(bytes.as_ref()) {
                Ok(digest) => digest,
                Err(source) => return Err(IndexError::Decode { identity, source }),
            };
            debug!(%digest, identity = %identity, "indexed reference image");
            if let Some(collision) = index.insert(digest, identity) {
                if policy == CollisionPolicy::Reject {
                    return Err(IndexError::Collision {
                        digest: collision.digest,
                        kept: collision.kept,
                        dropped: collision.dropped,
                    });
                }
                warn!(
                    digest = %collision.digest,
                    kept = %collision.kept,
                    dropped = %collision.dropped,
                    "reference images share a digest; keeping the first"
                );
            }
        }
        Ok(index)
    }

    /// Register `identity` under `digest`. An existing different identity
    /// wins and the collision is returned and recorded.
    pub fn insert(&mut self, digest: HashDigest, identity: String) -> Option<HashCollision> {
        match self.entries.get(&digest) {
            Some(existing) if *existing == identity => None,
            Some(existing) => {
                let collision = HashCollision {
                    digest,
                    kept: existing.clone(),
                    dropped: identity,
                };
                self.collisions.push(collision.clone());
                Some(collision)
            }
            None => {
                self.entries.insert(digest, identity);
                None
            }
        }
    }

    pub fn get(&self, digest: HashDigest) -> Option<&str> {
        self.entries.get(&digest).map(String::as_str)
    }

    /// Closest identity within `max_distance` bits. Ties go to the
    /// lexicographically smallest identity so results are stable.
    pub fn nearest(&self, digest: HashDigest, max_distance: u32) -> Option<(&str, u32)> {
        self.entries
            .iter()
            .map(|(candidate, identity)| (identity.as_str(), candidate.distance(digest)))
            .filter(|(_, distance)| *distance <= max_distance)
            .min_by(|left, right| left.1.cmp(&right.1).then_with(|| left.0.cmp(right.0)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn collisions(&self) -> &[HashCollision] {
        &self.collisions
    }
}
