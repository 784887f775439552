//! Resolution ladder selection
//!
//! Maps a probed source resolution to the fixed set of renditions produced for
//! it. Only known source resolutions ("buckets") get a ladder; anything else
//! yields an empty ladder and the job is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when `self` fits inside `other` in both dimensions
    pub fn fits_within(&self, other: &Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Error returned when a `"WxH"` string cannot be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid resolution '{0}', expected WIDTHxHEIGHT")]
pub struct ParseResolutionError(String);

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseResolutionError(s.to_string());
        let (w, h) = s.split_once('x').ok_or_else(err)?;
        let width: u32 = w.parse().map_err(|_| err())?;
        let height: u32 = h.parse().map_err(|_| err())?;
        if width == 0 || height == 0 {
            return Err(err());
        }
        Ok(Self { width, height })
    }
}

/// One rung of a ladder: a quality label and the frame size it is encoded at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionTier {
    /// Externally visible quality tag, e.g. "1080"
    pub label: &'static str,
    pub target: Resolution,
}

const fn tier(label: &'static str, width: u32, height: u32) -> RenditionTier {
    RenditionTier {
        label,
        target: Resolution::new(width, height),
    }
}

const T4320: RenditionTier = tier("4320", 7680, 4320);
const T2160: RenditionTier = tier("2160", 3840, 2160);
const T1440: RenditionTier = tier("1440", 2560, 1440);
const T1080: RenditionTier = tier("1080", 1920, 1080);
const T720: RenditionTier = tier("720", 1280, 720);
const T480: RenditionTier = tier("480", 640, 480);
const T360: RenditionTier = tier("360", 640, 360);

/// A known source resolution and the hand-picked ladder produced for it
#[derive(Debug)]
pub struct Bucket {
    pub name: &'static str,
    pub source: Resolution,
    pub tiers: &'static [RenditionTier],
}

/// Bucket catalog, highest source resolution first.
///
/// Each ladder is listed explicitly; they are not derived from one another.
pub static BUCKETS: &[Bucket] = &[
    Bucket {
        name: "8K",
        source: Resolution::new(7680, 4320),
        tiers: &[T4320, T2160, T1440, T1080, T720, T480],
    },
    Bucket {
        name: "4K",
        source: Resolution::new(3840, 2160),
        tiers: &[T2160, T1440, T1080, T720, T480],
    },
    Bucket {
        name: "2K",
        source: Resolution::new(2560, 1440),
        tiers: &[T1440, T1080, T720, T480],
    },
    Bucket {
        name: "Full HD",
        source: Resolution::new(1920, 1080),
        tiers: &[T1080, T720, T480],
    },
    Bucket {
        name: "HD",
        source: Resolution::new(1280, 720),
        tiers: &[T720, T480],
    },
    Bucket {
        name: "SD",
        source: Resolution::new(640, 360),
        tiers: &[T360],
    },
];

/// Ordered renditions planned for one source, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionLadder {
    tiers: &'static [RenditionTier],
}

impl RenditionLadder {
    pub const EMPTY: RenditionLadder = RenditionLadder { tiers: &[] };

    pub fn tiers(&self) -> &'static [RenditionTier] {
        self.tiers
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.label).collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// Look up the bucket whose source resolution exactly equals `source`
pub fn find_bucket(source: Resolution) -> Option<&'static Bucket> {
    BUCKETS.iter().find(|b| b.source == source)
}

/// Select the rendition ladder for a source resolution.
///
/// Exact match only: a resolution that is not in [`BUCKETS`] produces
/// [`RenditionLadder::EMPTY`], never a best-effort guess.
pub fn plan(source: Resolution) -> RenditionLadder {
    match find_bucket(source) {
        Some(bucket) => RenditionLadder {
            tiers: bucket.tiers,
        },
        None => RenditionLadder::EMPTY,
    }
}
