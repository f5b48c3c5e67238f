//! Vocabulary parameters: weighting and scoring modes, normalization policy,
//! and the info records returned by `retrieve_info`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of vocabulary structure. Stored as the leading tag of every
/// persistence stream so loaders can pick the right layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VocabKind {
    /// Tree vocabulary built with hierarchical k-means (Nister & Stewenius).
    Hierarchical,
}

impl VocabKind {
    pub fn tag(self) -> i32 {
        match self {
            VocabKind::Hierarchical => 0,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(VocabKind::Hierarchical),
            _ => Err(Error::InvalidParameter(format!(
                "unknown vocabulary type tag {tag}"
            ))),
        }
    }
}

/// Word weighting applied when a vocabulary is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weighting {
    /// `ln(N / N_i)` per word, times the in-document term frequency.
    TfIdf,
    /// In-document term frequency only.
    Tf,
    /// `ln(N / N_i)` per word; multiplicity does not accumulate.
    Idf,
    /// Fixed value 1 for every present word.
    Binary,
}

impl Weighting {
    pub fn tag(self) -> i32 {
        match self {
            Weighting::TfIdf => 0,
            Weighting::Tf => 1,
            Weighting::Idf => 2,
            Weighting::Binary => 3,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(Weighting::TfIdf),
            1 => Ok(Weighting::Tf),
            2 => Ok(Weighting::Idf),
            3 => Ok(Weighting::Binary),
            _ => Err(Error::InvalidParameter(format!(
                "unknown weighting tag {tag}"
            ))),
        }
    }
}

impl fmt::Display for Weighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Weighting::TfIdf => "tf-idf",
            Weighting::Tf => "tf",
            Weighting::Idf => "idf",
            Weighting::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Norm used to normalize a bag-of-words vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Norm {
    L1,
    L2,
}

/// Scoring function used to compare two bag-of-words vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scoring {
    L1Norm,
    L2Norm,
    ChiSquare,
    Kl,
    Bhattacharyya,
    DotProduct,
}

impl Scoring {
    pub fn tag(self) -> i32 {
        match self {
            Scoring::L1Norm => 0,
            Scoring::L2Norm => 1,
            Scoring::ChiSquare => 2,
            Scoring::Kl => 3,
            Scoring::Bhattacharyya => 4,
            Scoring::DotProduct => 5,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(Scoring::L1Norm),
            1 => Ok(Scoring::L2Norm),
            2 => Ok(Scoring::ChiSquare),
            3 => Ok(Scoring::Kl),
            4 => Ok(Scoring::Bhattacharyya),
            5 => Ok(Scoring::DotProduct),
            _ => Err(Error::InvalidParameter(format!(
                "unknown scoring tag {tag}"
            ))),
        }
    }

    /// Norm that vectors must be normalized with before applying this
    /// scoring, or `None` for scorings computed on raw values.
    pub fn norm(self) -> Option<Norm> {
        match self {
            Scoring::L2Norm => Some(Norm::L2),
            Scoring::L1Norm | Scoring::ChiSquare | Scoring::Kl | Scoring::Bhattacharyya => {
                Some(Norm::L1)
            }
            Scoring::DotProduct => None,
        }
    }
}

impl fmt::Display for Scoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scoring::L1Norm => "L1 norm",
            Scoring::L2Norm => "L2 norm",
            Scoring::ChiSquare => "chi-square",
            Scoring::Kl => "KL",
            Scoring::Bhattacharyya => "Bhattacharyya",
            Scoring::DotProduct => "dot product",
        };
        f.write_str(name)
    }
}

/// Parameters a vocabulary is created with. Preserved across persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VocabParams {
    pub kind: VocabKind,
    pub weighting: Weighting,
    pub scoring: Scoring,
    /// Map raw scores into `[0, 1]` where the scoring supports it.
    pub scale_score: bool,
    /// Number of floats per descriptor (64 or 128 for SURF, 128 for SIFT).
    pub descriptor_length: usize,
    /// Branching factor of the tree.
    pub k: usize,
    /// Maximum depth of the tree.
    pub l: usize,
}

impl VocabParams {
    /// Parameters for a hierarchical vocabulary.
    pub fn hierarchical(
        k: usize,
        l: usize,
        descriptor_length: usize,
        weighting: Weighting,
        scoring: Scoring,
        scale_score: bool,
    ) -> Self {
        Self {
            kind: VocabKind::Hierarchical,
            weighting,
            scoring,
            scale_score,
            descriptor_length,
            k,
            l,
        }
    }
}

impl fmt::Display for VocabParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vocabulary type: hierarchical")?;
        writeln!(f, "Weighting: {}", self.weighting)?;
        writeln!(
            f,
            "Scoring: {}{}",
            self.scoring,
            if self.scale_score {
                " scaling to 0..1"
            } else {
                " without scaling"
            }
        )?;
        writeln!(f, "k: {}, L: {}, D: {}", self.k, self.l, self.descriptor_length)
    }
}

/// Snapshot of a vocabulary's configuration and word statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyInfo {
    pub kind: VocabKind,
    pub word_count: usize,
    pub stopped_frequent: usize,
    pub stopped_infrequent: usize,
    pub params: VocabParams,
}

impl fmt::Display for VocabularyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.params)?;
        writeln!(f, "Words: {}", self.word_count)?;
        writeln!(
            f,
            "Stopped words: {} frequent, {} infrequent",
            self.stopped_frequent, self.stopped_infrequent
        )
    }
}

/// Snapshot of a database: its vocabulary info plus the entry count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub vocabulary: VocabularyInfo,
    pub entry_count: usize,
}

impl fmt::Display for DatabaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vocabulary)?;
        writeln!(f, "Entries: {}", self.entry_count)
    }
}
