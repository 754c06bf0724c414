//! Nearest-embedding matching under a distance threshold.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchError, MatchResult};

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Return the closest enrolled face if its distance is strictly below `threshold`.
    fn find_best_match(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<Option<MatchResult>, MatchError>;
}

/// Euclidean distance matcher.
///
/// Scans the whole gallery. Entries without a usable embedding are skipped.
/// On an exact distance tie the entry that comes first in gallery order wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_best_match(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<Option<MatchResult>, MatchError> {
        let mut best: Option<(usize, f32)> = None;

        for (i, face) in gallery.faces().iter().enumerate() {
            let Some(enrolled) = face.embedding.as_ref() else {
                continue;
            };
            let distance = probe
                .euclidean_distance(enrolled)
                .ok_or_else(|| MatchError::DimensionMismatch {
                    employee_id: face.employee_id.clone(),
                    probe: probe.dim(),
                    enrolled: enrolled.dim(),
                })?;

            // Strict comparison keeps the first entry on ties.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        let Some((idx, distance)) = best else {
            return Ok(None);
        };

        if distance < threshold {
            let face = &gallery.faces()[idx];
            tracing::debug!(employee_id = %face.employee_id, distance, threshold, "probe matched");
            Ok(Some(MatchResult {
                employee_id: face.employee_id.clone(),
                display_name: face.display_name.clone(),
                distance,
            }))
        } else {
            tracing::debug!(distance, threshold, "closest face above threshold");
            Ok(None)
        }
    }
}
