//! Output file naming for renditions.

use crate::ladder::RenditionTier;
use uuid::Uuid;

/// Extension of every produced rendition; matches the encoder's fixed container.
pub const RENDITION_EXTENSION: &str = "mp4";

/// Generates file names for the renditions of one job.
///
/// Names are `<token>_<label>p.mp4`. The token is random per namer, so two
/// jobs never collide, and labels are unique within a ladder, so two tiers of
/// the same job never collide either.
#[derive(Debug, Clone)]
pub struct RenditionNamer {
    token: String,
}

impl RenditionNamer {
    /// Create a namer with a fresh random token
    pub fn new() -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Create a namer with a caller-chosen token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn name(&self, tier: &RenditionTier) -> String {
        format!("{}_{}p.{}", self.token, tier.label, RENDITION_EXTENSION)
    }
}

impl Default for RenditionNamer {
    fn default() -> Self {
        Self::new()
    }
}
