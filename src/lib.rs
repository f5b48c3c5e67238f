//! Hierarchical bag-of-visual-words vocabularies and image databases.
//!
//! `hbow` turns sets of floating-point feature descriptors (SURF, SIFT, ...)
//! into sparse weighted word vectors and answers image similarity queries:
//!
//! 1. [`Vocabulary::create`] clusters a training corpus into a k-branching,
//!    L-deep tree with hierarchical k-means++; the leaves are the visual words.
//! 2. [`Vocabulary::transform`] maps an image's descriptors to a [`BowVector`]
//!    under tf-idf, tf, idf or binary weighting, honoring the stop list.
//! 3. [`Database`] keeps an inverted index over bag-of-words entries and ranks
//!    them with L1, L2, chi-square, KL, Bhattacharyya or dot-product scoring.
//!
//! Vocabularies and databases persist to an interoperable binary or text
//! format with auto-detection on load.

pub mod bow;
pub mod database;
pub mod desc;
pub mod error;
pub mod params;
pub mod scoring;
pub mod storage;
pub mod vocab;

pub use bow::{BowEntry, BowOps, BowVector};
pub use database::{Database, QueryResult, QueryResults};
pub use error::{Error, Result};
pub use params::{
    DatabaseInfo, Norm, Scoring, VocabKind, VocabParams, VocabularyInfo, Weighting,
};
pub use storage::FileFormat;
pub use vocab::Vocabulary;

/// Id of a word: a leaf of the vocabulary tree.
pub type WordId = u32;

/// Weighted value of a word in a bag-of-words vector.
pub type WordValue = f64;

/// Id of a node in the vocabulary tree. The root is node 0.
pub type NodeId = u32;

/// Id of an entry (image) in a database. Assigned sequentially from 0.
pub type EntryId = u32;

/// Smallest value a word is assumed to take under KL scoring.
pub const EPSILON: WordValue = f64::EPSILON;

/// `EPSILON.ln()`, precomputed. KL scoring charges missing coordinates with
/// this floor instead of `ln(0)`.
pub const LOG_EPS: f64 = -36.043653389117156;
