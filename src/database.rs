//! Image database: an inverted index over a vocabulary.
//!
//! Each word of the vocabulary owns a row of `(entry id, value)` postings.
//! Entries are appended with monotonically increasing ids, so rows stay
//! sorted without explicit sorting, and every scoring can be evaluated over
//! the query/row intersections only instead of a dense scan.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bow::{BowOps, BowVector};
use crate::error::{Error, Result};
use crate::params::{DatabaseInfo, Scoring};
use crate::storage::{
    detect_format, BinaryReader, BinaryWriter, FileFormat, TextReader, TextWriter, TokenRead,
    TokenWrite,
};
use crate::vocab::Vocabulary;
use crate::{EntryId, WordValue, LOG_EPS};

/// One posting of an inverted-file row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub entry: EntryId,
    pub value: WordValue,
}

/// A scored database entry returned by queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryResult {
    pub id: EntryId,
    pub score: f64,
}

/// Query results, best first under the active scoring's convention.
pub type QueryResults = Vec<QueryResult>;

/// Database of bag-of-words entries backed by an inverted index.
///
/// The database owns its vocabulary. Word ids fed through the bag-of-words
/// API must come from that vocabulary.
///
/// # Examples
///
/// ```
/// use hbow::{Database, Scoring, VocabParams, Vocabulary, Weighting};
///
/// let params = VocabParams::hierarchical(2, 1, 1, Weighting::Tf, Scoring::L1Norm, true);
/// let mut voc = Vocabulary::new(params)?;
/// voc.create_with_seed(&[vec![1.0], vec![5.0]], 3)?;
///
/// let mut db = Database::new(voc);
/// let first = db.add_entry(&[1.0])?;
/// db.add_entry(&[5.0])?;
///
/// let results = db.query(&[1.0], 1)?;
/// assert_eq!(results[0].id, first);
/// # Ok::<(), hbow::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    voc: Vocabulary,
    /// `index[word_id]` holds postings in ascending entry order.
    index: Vec<Vec<IndexEntry>>,
    entries: u32,
}

impl Database {
    /// Create an empty database over a vocabulary.
    pub fn new(voc: Vocabulary) -> Self {
        let words = voc.number_of_words();
        Self {
            voc,
            index: vec![Vec::new(); words],
            entries: 0,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.voc
    }

    /// Number of entries added so far.
    pub fn number_of_entries(&self) -> usize {
        self.entries as usize
    }

    /// Snapshot of the database configuration and sizes.
    pub fn retrieve_info(&self) -> DatabaseInfo {
        DatabaseInfo {
            vocabulary: self.voc.retrieve_info(),
            entry_count: self.number_of_entries(),
        }
    }

    /// Empty the inverted index and reset the entry counter. The vocabulary
    /// is kept.
    pub fn clear(&mut self) {
        self.index = vec![Vec::new(); self.voc.number_of_words()];
        self.entries = 0;
    }

    /// Transform an image's descriptors and add them as a new entry.
    /// Returns the id of the entry, assigned sequentially from 0.
    pub fn add_entry(&mut self, features: &[f32]) -> Result<EntryId> {
        let v = self.voc.transform_with(features, false)?;
        Ok(self.add_bow_entry(v))
    }

    /// Add a bag-of-words vector as a new entry. The vector is stored
    /// normalized when the active scoring calls for it.
    pub fn add_bow_entry(&mut self, mut v: BowVector) -> EntryId {
        if let Some(norm) = self.voc.scoring().norm() {
            v.normalize(norm);
        }

        let eid = self.entries;
        for e in &v {
            // ids ascend across calls, so rows stay sorted
            self.index[e.id as usize].push(IndexEntry {
                entry: eid,
                value: e.value,
            });
        }
        self.entries += 1;
        eid
    }

    /// Transform an image's descriptors and rank the closest entries.
    pub fn query(&self, features: &[f32], max_results: usize) -> Result<QueryResults> {
        let v = self.voc.transform_with(features, false)?;
        Ok(self.query_bow(&v, max_results))
    }

    /// Rank the entries closest to a bag-of-words vector, best first, at
    /// most `max_results` of them.
    pub fn query_bow(&self, v: &BowVector, max_results: usize) -> QueryResults {
        let mut v = v.clone();
        if let Some(norm) = self.voc.scoring().norm() {
            v.normalize(norm);
        }

        let scale = self.voc.params().scale_score;
        match self.voc.scoring() {
            Scoring::L1Norm => self.query_l1(&v, max_results, scale),
            Scoring::L2Norm => self.query_l2(&v, max_results, scale),
            Scoring::ChiSquare => self.query_chi_square(&v, max_results, scale),
            Scoring::Kl => self.query_kl(&v, max_results),
            Scoring::Bhattacharyya => self.query_bhattacharyya(&v, max_results),
            Scoring::DotProduct => self.query_dot_product(&v, max_results),
        }
    }

    fn query_l1(&self, v: &BowVector, max_results: usize, scale: bool) -> QueryResults {
        let mut ret = QueryResults::new();
        for e in v {
            for p in self.row(e.id) {
                let value = (e.value - p.value).abs() - e.value.abs() - p.value.abs();
                accumulate(&mut ret, p.entry, value);
            }
        }

        // running scores are in [-2 best .. 0 worst]
        sort_ascending(&mut ret);
        ret.truncate(max_results);

        // ||v - w||_L1 = 2 + sum(|vi - wi| - |vi| - |wi|) over common words
        for r in ret.iter_mut() {
            r.score = if scale { -r.score / 2.0 } else { 2.0 + r.score };
        }
        ret
    }

    fn query_l2(&self, v: &BowVector, max_results: usize, scale: bool) -> QueryResults {
        let mut ret = QueryResults::new();
        for e in v {
            for p in self.row(e.id) {
                // negated against the pairwise scorer so the common
                // ascending sort still puts the best entry first
                let value = -(e.value * p.value);
                accumulate(&mut ret, p.entry, value);
            }
        }

        // running scores are in [-1 best .. 0 worst]
        sort_ascending(&mut ret);
        ret.truncate(max_results);

        // ||v - w||_L2 = sqrt(2 - 2 * sum(vi * wi)) over common words
        for r in ret.iter_mut() {
            r.score = if scale {
                1.0 - (1.0 + r.score).sqrt()
            } else {
                (2.0 + 2.0 * r.score).sqrt()
            };
        }
        ret
    }

    fn query_chi_square(&self, v: &BowVector, max_results: usize, scale: bool) -> QueryResults {
        let mut ret = QueryResults::new();
        for e in v {
            for p in self.row(e.id) {
                let (vi, wi) = (e.value, p.value);
                let value = (vi - wi) * (vi - wi) / (vi + wi) - vi - wi;
                accumulate(&mut ret, p.entry, value);
            }
        }

        sort_ascending(&mut ret);
        ret.truncate(max_results);

        // both sides are L1-normalized and assumed non-negative, so the
        // missing-word terms sum to 2 and the full score is 2 + running
        for r in ret.iter_mut() {
            r.score = if scale { -r.score / 2.0 } else { 2.0 + r.score };
        }
        ret
    }

    fn query_kl(&self, v: &BowVector, max_results: usize) -> QueryResults {
        let mut ret = QueryResults::new();
        for e in v {
            for p in self.row(e.id) {
                let (vi, wi) = (e.value, p.value);
                if vi > 0.0 && wi > 0.0 {
                    accumulate(&mut ret, p.entry, vi * (vi / wi).ln());
                }
            }
        }

        // the running sums alone do not rank candidates; every query word
        // missing from an entry still owes its epsilon term
        for r in ret.iter_mut() {
            let mut missing = 0.0;
            for e in v {
                if e.value <= 0.0 {
                    continue;
                }
                let row = self.row(e.id);
                if row.binary_search_by_key(&r.id, |p| p.entry).is_err() {
                    missing += e.value * (e.value.ln() - LOG_EPS);
                }
            }
            r.score += missing;
        }

        // complete scores are in [0 best .. inf worst]; KL has no scaled form
        sort_ascending(&mut ret);
        ret.truncate(max_results);
        ret
    }

    fn query_bhattacharyya(&self, v: &BowVector, max_results: usize) -> QueryResults {
        let mut ret = QueryResults::new();
        for e in v {
            for p in self.row(e.id) {
                accumulate(&mut ret, p.entry, (e.value * p.value).sqrt());
            }
        }

        // already in [0 worst .. 1 best]
        sort_descending(&mut ret);
        ret.truncate(max_results);
        ret
    }

    fn query_dot_product(&self, v: &BowVector, max_results: usize) -> QueryResults {
        let mut ret = QueryResults::new();
        for e in v {
            for p in self.row(e.id) {
                accumulate(&mut ret, p.entry, e.value * p.value);
            }
        }

        // higher is better; dot product has no scaled form
        sort_descending(&mut ret);
        ret.truncate(max_results);
        ret
    }

    fn row(&self, word: crate::WordId) -> &[IndexEntry] {
        &self.index[word as usize]
    }

    /// Save the database (vocabulary included) to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P, format: FileFormat) -> Result<()> {
        let file = File::create(path)?;
        let mut buf = BufWriter::new(file);
        match format {
            FileFormat::Binary => {
                let mut w = BinaryWriter::new(&mut buf);
                self.write_to(&mut w)?;
                w.finish()
            }
            FileFormat::Text => {
                let mut w = TextWriter::new(&mut buf);
                self.write_to(&mut w)?;
                w.finish()
            }
        }
    }

    /// Load a database from a file, auto-detecting the encoding.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let format = detect_format(path.as_ref())?;
        let file = File::open(path.as_ref())?;
        let mut buf = BufReader::new(file);
        let db = match format {
            FileFormat::Binary => {
                let mut r = BinaryReader::new(&mut buf);
                Self::read_from(&mut r)?
            }
            FileFormat::Text => {
                let mut r = TextReader::new(&mut buf);
                Self::read_from(&mut r)?
            }
        };
        info!(entries = db.entries, ?format, "database loaded");
        Ok(db)
    }

    /// Save only the vocabulary of this database.
    pub fn export_vocabulary<P: AsRef<Path>>(&self, path: P, format: FileFormat) -> Result<()> {
        self.voc.save(path, format)
    }

    /// The database tail follows the vocabulary stream: entry count, number
    /// of non-empty rows, then each row as word id, length and postings.
    fn write_to(&self, f: &mut dyn TokenWrite) -> Result<()> {
        self.voc.write_to(f)?;

        let non_empty = self.index.iter().filter(|row| !row.is_empty()).count();
        f.put_i32(self.entries as i32)?;
        f.put_i32(non_empty as i32)?;

        for (word, row) in self.index.iter().enumerate() {
            if row.is_empty() {
                continue;
            }
            f.put_i32(word as i32)?;
            f.put_i32(row.len() as i32)?;
            for p in row {
                f.put_i32(p.entry as i32)?;
                f.put_f64(p.value)?;
            }
        }
        Ok(())
    }

    fn read_from(f: &mut dyn TokenRead) -> Result<Self> {
        let voc = Vocabulary::read_from(f)?;

        let entries = f.next_i32()?;
        let rows = f.next_i32()?;
        if entries < 0 || rows < 0 {
            return Err(Error::MalformedFile("negative database tail field".into()));
        }

        let mut index = vec![Vec::new(); voc.number_of_words()];
        for _ in 0..rows {
            let word = f.next_i32()?;
            let len = f.next_i32()?;
            if len < 0 {
                return Err(Error::MalformedFile("negative row length".into()));
            }
            if word < 0 || word as usize >= index.len() {
                return Err(Error::MalformedFile(format!(
                    "row word id {word} out of range"
                )));
            }
            let row = &mut index[word as usize];
            row.reserve(len as usize);
            for _ in 0..len {
                let entry = f.next_i32()?;
                let value = f.next_f64()?;
                if entry < 0 || entry >= entries {
                    return Err(Error::MalformedFile(format!(
                        "posting entry id {entry} out of range"
                    )));
                }
                row.push(IndexEntry {
                    entry: entry as EntryId,
                    value,
                });
            }
        }

        Ok(Self {
            voc,
            index,
            entries: entries as u32,
        })
    }
}

/// Fold a scoring term into the running result of one entry.
fn accumulate(ret: &mut QueryResults, id: EntryId, value: f64) {
    match ret.iter_mut().find(|r| r.id == id) {
        Some(r) => r.score += value,
        None => ret.push(QueryResult { id, score: value }),
    }
}

// ties break on ascending entry id so results are reproducible

fn sort_ascending(ret: &mut QueryResults) {
    ret.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.id.cmp(&b.id)));
}

fn sort_descending(ret: &mut QueryResults) {
    ret.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
}
