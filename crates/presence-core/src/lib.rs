//! presence-core — Enrolled face gallery and nearest-embedding matching.
//!
//! Embeddings are produced elsewhere; this crate only decides whether a
//! probe belongs to an enrolled employee, using Euclidean distance under a
//! single configured threshold.

pub mod gallery;
pub mod matcher;
pub mod types;

pub use gallery::{parse_embedding, EmbeddingParseError, Gallery, GalleryParseError};
pub use matcher::{EuclideanMatcher, Matcher};
pub use types::{
    confidence_from_distance, AttendanceMode, BoundingBox, Embedding, EnrolledFace, MatchError,
    MatchResult,
};

/// Default acceptance threshold on Euclidean distance.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Embedding length produced by the default extractor model.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;
