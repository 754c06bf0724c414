//! Enrolled face gallery and its wire format.
//!
//! The backend delivers `{employeeId, displayName, embedding}` records where
//! the embedding is either a numeric array or a JSON-encoded string of one.
//! A malformed record only costs that record: it is logged and kept out of
//! matching, the rest of the payload still loads.

use crate::types::{Embedding, EnrolledFace};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

/// Payload-level failure. Individual records never produce this.
#[derive(Error, Debug)]
pub enum GalleryParseError {
    #[error("gallery payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("gallery payload has no face list (expected an array, or an object with `data` or `faces`)")]
    MissingFaceList,
}

/// Why a single record's embedding was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingParseError {
    #[error("embedding missing")]
    Missing,
    #[error("embedding string is not a JSON array of numbers: {0}")]
    InvalidEncoding(String),
    #[error("embedding element {0} is not a number")]
    NotNumeric(usize),
    #[error("embedding element {0} is not finite")]
    NonFinite(usize),
    #[error("embedding is empty")]
    Empty,
    #[error("expected {expected}-dim embedding, got {actual}")]
    WrongDimension { expected: usize, actual: usize },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s.trim().to_string(),
            RawId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFace {
    #[serde(alias = "employee_id", alias = "id")]
    employee_id: RawId,
    #[serde(default, alias = "display_name", alias = "name")]
    display_name: Option<String>,
    #[serde(default)]
    embedding: Value,
}

/// Read-only snapshot of enrolled faces, unique by employee id.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    faces: Vec<EnrolledFace>,
    loaded_at: Option<DateTime<Utc>>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a gallery, keeping the first entry for each employee id.
    pub fn new(faces: Vec<EnrolledFace>) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(faces.len());
        for face in faces {
            if seen.insert(face.employee_id.clone()) {
                unique.push(face);
            } else {
                tracing::warn!(employee_id = %face.employee_id, "duplicate gallery entry dropped");
            }
        }
        Self {
            faces: unique,
            loaded_at: None,
        }
    }

    pub fn with_loaded_at(mut self, at: DateTime<Utc>) -> Self {
        self.loaded_at = Some(at);
        self
    }

    /// Parse a raw response body. See [`Gallery::from_json`].
    pub fn from_slice(body: &[u8], expected_dim: Option<usize>) -> Result<Self, GalleryParseError> {
        let payload: Value = serde_json::from_slice(body)?;
        Self::from_json(&payload, expected_dim)
    }

    /// Parse a decoded payload.
    ///
    /// With `expected_dim = None` the dimension shared by most parsed
    /// embeddings wins (earliest on a tie); entries of any other length are
    /// kept out of matching.
    pub fn from_json(
        payload: &Value,
        expected_dim: Option<usize>,
    ) -> Result<Self, GalleryParseError> {
        let records = match payload {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("data").or_else(|| map.get("faces")) {
                Some(Value::Array(items)) => items,
                _ => return Err(GalleryParseError::MissingFaceList),
            },
            _ => return Err(GalleryParseError::MissingFaceList),
        };

        let mut parsed = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let raw = match RawFace::deserialize(record) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping malformed gallery record");
                    continue;
                }
            };
            let employee_id = raw.employee_id.into_string();
            if employee_id.is_empty() {
                tracing::warn!(index, "skipping gallery record with empty employee id");
                continue;
            }
            let display_name = raw
                .display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| employee_id.clone());
            let embedding = parse_embedding(&raw.embedding, expected_dim);
            parsed.push((employee_id, display_name, embedding));
        }

        let dim = expected_dim.or_else(|| {
            majority_dim(parsed.iter().filter_map(|(_, _, e)| e.as_ref().ok().map(Embedding::dim)))
        });

        let faces = parsed
            .into_iter()
            .map(|(employee_id, display_name, embedding)| {
                let embedding = embedding.and_then(|e| match dim {
                    Some(expected) if e.dim() != expected => {
                        Err(EmbeddingParseError::WrongDimension {
                            expected,
                            actual: e.dim(),
                        })
                    }
                    _ => Ok(e),
                });
                let embedding = match embedding {
                    Ok(embedding) => Some(embedding),
                    Err(e) => {
                        tracing::warn!(
                            employee_id = %employee_id,
                            error = %e,
                            "unusable embedding; entry excluded from matching"
                        );
                        None
                    }
                };
                EnrolledFace {
                    employee_id,
                    display_name,
                    embedding,
                }
            })
            .collect();

        Ok(Self::new(faces))
    }

    pub fn faces(&self) -> &[EnrolledFace] {
        &self.faces
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnrolledFace> {
        self.faces.iter()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Number of entries that can take part in matching.
    pub fn usable_len(&self) -> usize {
        self.faces.iter().filter(|f| f.is_usable()).count()
    }

    pub fn get(&self, employee_id: &str) -> Option<&EnrolledFace> {
        self.faces.iter().find(|f| f.employee_id == employee_id)
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

/// Most common length among `dims`; the earliest seen wins a tie.
fn majority_dim(dims: impl Iterator<Item = usize>) -> Option<usize> {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for dim in dims {
        match counts.iter_mut().find(|(d, _)| *d == dim) {
            Some((_, n)) => *n += 1,
            None => counts.push((dim, 1)),
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(usize, usize)>, (dim, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((dim, n)),
        })
        .map(|(dim, _)| dim)
}

/// Decode one embedding from either a numeric array or a JSON-encoded string.
pub fn parse_embedding(
    value: &Value,
    expected_dim: Option<usize>,
) -> Result<Embedding, EmbeddingParseError> {
    let decoded;
    let items = match value {
        Value::Array(items) => items,
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s)
                .map_err(|e| EmbeddingParseError::InvalidEncoding(e.to_string()))?;
            match &decoded {
                Value::Array(items) => items,
                _ => return Err(EmbeddingParseError::InvalidEncoding("not an array".into())),
            }
        }
        Value::Null => return Err(EmbeddingParseError::Missing),
        _ => {
            let msg = format!("unexpected JSON type: {value}");
            return Err(EmbeddingParseError::InvalidEncoding(msg));
        }
    };

    if items.is_empty() {
        return Err(EmbeddingParseError::Empty);
    }

    let mut values = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let v = item.as_f64().ok_or(EmbeddingParseError::NotNumeric(i))? as f32;
        if !v.is_finite() {
            return Err(EmbeddingParseError::NonFinite(i));
        }
        values.push(v);
    }

    if let Some(expected) = expected_dim {
        if values.len() != expected {
            return Err(EmbeddingParseError::WrongDimension {
                expected,
                actual: values.len(),
            });
        }
    }

    Ok(Embedding::new(values))
}
