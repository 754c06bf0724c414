use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: probe has {probe}, enrolled face {employee_id} has {enrolled}")]
    DimensionMismatch {
        employee_id: String,
        probe: usize,
        enrolled: usize,
    },
}

/// Face bounding box reported by the extractor alongside an embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for the default extractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance. Returns `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// An employee's enrolled reference face, as cached from the backend.
#[derive(Debug, Clone, Serialize)]
pub struct EnrolledFace {
    pub employee_id: String,
    pub display_name: String,
    /// `None` when the stored embedding could not be used; such entries never match.
    pub embedding: Option<Embedding>,
}

impl EnrolledFace {
    pub fn new(
        employee_id: impl Into<String>,
        display_name: impl Into<String>,
        embedding: Embedding,
    ) -> Self {
        Self {
            employee_id: employee_id.into(),
            display_name: display_name.into(),
            embedding: Some(embedding),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Best gallery candidate for a probe, already accepted under the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub employee_id: String,
    pub display_name: String,
    /// Euclidean distance to the probe. Lower = more similar.
    pub distance: f32,
}

impl MatchResult {
    /// Display-only percentage derived from the distance. Never used for acceptance.
    pub fn confidence(&self) -> f32 {
        confidence_from_distance(self.distance)
    }
}

/// Monotonically non-increasing map from distance to a 0–100 score.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0) * 100.0
}

/// Which attendance event a session records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceMode {
    CheckIn,
    CheckOut,
}

impl fmt::Display for AttendanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceMode::CheckIn => f.write_str("checkIn"),
            AttendanceMode::CheckOut => f.write_str("checkOut"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&a.clone()), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0, 0.0]);
        let d = a.euclidean_distance(&b).unwrap();
        assert!((d - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_confidence_is_monotonic() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
        assert!(confidence_from_distance(0.2) > confidence_from_distance(0.4));
        assert_eq!(confidence_from_distance(1.4), 0.0);
    }

    #[test]
    fn test_attendance_mode_wire_names() {
        assert_eq!(serde_json::to_string(&AttendanceMode::CheckIn).unwrap(), "\"checkIn\"");
        assert_eq!(serde_json::to_string(&AttendanceMode::CheckOut).unwrap(), "\"checkOut\"");
        assert_eq!(AttendanceMode::CheckOut.to_string(), "checkOut");
    }
}
