//! Visual vocabulary tree.
//!
//! The tree is built once from a training corpus with hierarchical k-means++
//! and is immutable afterwards except for the stop list and loading. Nodes
//! live in a flat arena indexed by [`NodeId`]; the leaves are the words, with
//! a `words[word_id] -> NodeId` table for direct access.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bow::{BowEntry, BowOps, BowVector};
use crate::desc::{descriptors, squared_distance};
use crate::error::{Error, Result};
use crate::params::{VocabKind, VocabParams, VocabularyInfo, Weighting};
use crate::scoring;
use crate::storage::{
    detect_format, BinaryReader, BinaryWriter, FileFormat, TextReader, TextWriter, TokenRead,
    TokenWrite,
};
use crate::{NodeId, WordId, WordValue};

/// A node of the vocabulary tree.
///
/// The root is node 0 and carries no descriptor. Exactly the leaves carry a
/// word id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub children: Vec<NodeId>,
    pub weight: WordValue,
    pub descriptor: Vec<f32>,
    pub word: Option<WordId>,
}

impl Node {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            children: Vec::new(),
            weight: 0.0,
            descriptor: Vec::new(),
            word: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Feature vocabulary built from a corpus of image descriptors. Can be:
/// 1. Created from training data.
/// 2. Saved to a file, in binary or text form.
/// 3. Loaded from a file.
/// 4. Used to transform a new set of descriptors into a [`BowVector`].
///
/// # Examples
///
/// ```
/// use hbow::{Scoring, VocabParams, Vocabulary, Weighting};
///
/// let params = VocabParams::hierarchical(2, 1, 2, Weighting::TfIdf, Scoring::L1Norm, true);
/// let mut voc = Vocabulary::new(params)?;
/// voc.create_with_seed(&[vec![0.0, 0.0, 10.0, 10.0]], 1)?;
///
/// assert_eq!(voc.number_of_words(), 2);
/// let bow = voc.transform(&[0.2, 0.1])?;
/// assert_eq!(bow.len(), 1);
/// # Ok::<(), hbow::Error>(())
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    params: VocabParams,
    created: bool,
    nodes: Vec<Node>,
    /// `words[word_id]` is the arena index of the leaf holding that word.
    words: Vec<NodeId>,
    /// Normalized corpus frequency per word; sums to 1 when any word occurs.
    frequencies: Vec<f32>,
    word_stopped: Vec<bool>,
    stop_list: Vec<WordId>,
    /// Word ids sorted by ascending frequency, ties by ascending id.
    words_in_order: Vec<WordId>,
    frequent_stopped: usize,
    infrequent_stopped: usize,
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vocabulary")
            .field("words", &self.words.len())
            .field("nodes", &self.nodes.len())
            .field("k", &self.params.k)
            .field("levels", &self.params.l)
            .field("weighting", &self.params.weighting)
            .field("scoring", &self.params.scoring)
            .field("stopped", &self.stop_list.len())
            .finish()
    }
}

impl Vocabulary {
    /// Create an empty vocabulary with the given parameters.
    pub fn new(params: VocabParams) -> Result<Self> {
        if params.k < 2 {
            return Err(Error::InvalidParameter(format!(
                "branching factor k must be at least 2, got {}",
                params.k
            )));
        }
        if params.l < 1 {
            return Err(Error::InvalidParameter("depth L must be at least 1".into()));
        }
        if params.descriptor_length == 0 {
            return Err(Error::InvalidParameter(
                "descriptor length must be positive".into(),
            ));
        }
        Ok(Self::with_params_unchecked(params))
    }

    fn with_params_unchecked(params: VocabParams) -> Self {
        Self {
            params,
            created: false,
            nodes: Vec::new(),
            words: Vec::new(),
            frequencies: Vec::new(),
            word_stopped: Vec::new(),
            stop_list: Vec::new(),
            words_in_order: Vec::new(),
            frequent_stopped: 0,
            infrequent_stopped: 0,
        }
    }

    /// Whether the vocabulary has been created (or loaded) yet.
    pub fn is_empty(&self) -> bool {
        !self.created
    }

    /// Number of words in the vocabulary; 0 until created.
    pub fn number_of_words(&self) -> usize {
        if self.created {
            self.words.len()
        } else {
            0
        }
    }

    pub fn params(&self) -> &VocabParams {
        &self.params
    }

    pub fn weighting(&self) -> Weighting {
        self.params.weighting
    }

    pub fn scoring(&self) -> crate::params::Scoring {
        self.params.scoring
    }

    /// Snapshot of the vocabulary configuration and word statistics.
    pub fn retrieve_info(&self) -> VocabularyInfo {
        VocabularyInfo {
            kind: self.params.kind,
            word_count: self.number_of_words(),
            stopped_frequent: if self.created { self.frequent_stopped } else { 0 },
            stopped_infrequent: if self.created { self.infrequent_stopped } else { 0 },
            params: self.params,
        }
    }

    /// Build the vocabulary from training data, one descriptor group per
    /// image. Any previous content is cleared.
    ///
    /// Each group must hold a whole number of descriptors. An empty corpus
    /// leaves the vocabulary empty and is not an error.
    pub fn create(&mut self, training: &[Vec<f32>]) -> Result<()> {
        self.create_with_seed(training, rand::rng().random())
    }

    /// Same as [`Vocabulary::create`] with a fixed clustering seed, so equal
    /// inputs reproduce the exact same tree.
    pub fn create_with_seed(&mut self, training: &[Vec<f32>], seed: u64) -> Result<()> {
        let d = self.params.descriptor_length;

        // validate before touching any state
        for group in training {
            let _ = descriptors(group, d)?;
        }

        self.clear_contents();

        let mut features: Vec<&[f32]> = Vec::new();
        for group in training {
            features.extend(group.chunks_exact(d));
        }
        if features.is_empty() {
            return Ok(());
        }

        // reserve the whole worst-case tree so node creation never reallocates
        let k = self.params.k as f64;
        let expected = ((k.powi(self.params.l as i32 + 1) - 1.0) / (k - 1.0)) as usize;
        self.nodes.reserve(expected);
        self.nodes.push(Node::new(0));

        let mut rng = StdRng::seed_from_u64(seed);
        self.hkmeans_step(0, &features, 1, &mut rng);
        self.create_words();
        self.created = true;
        self.set_node_weights(training)?;

        info!(
            words = self.words.len(),
            nodes = self.nodes.len(),
            features = features.len(),
            "vocabulary created"
        );
        Ok(())
    }

    fn clear_contents(&mut self) {
        self.created = false;
        self.nodes.clear();
        self.words.clear();
        self.frequencies.clear();
        self.word_stopped.clear();
        self.stop_list.clear();
        self.words_in_order.clear();
        self.frequent_stopped = 0;
        self.infrequent_stopped = 0;
    }

    /// One recursive k-means step: cluster `features`, emit one child of
    /// `parent` per cluster, recurse while below the depth limit.
    fn hkmeans_step(
        &mut self,
        parent: NodeId,
        features: &[&[f32]],
        level: usize,
        rng: &mut StdRng,
    ) {
        if features.is_empty() {
            return;
        }
        debug!(
            features = features.len(),
            parent, level, "hierarchical k-means step"
        );

        let k = self.params.k;
        let clusters: Vec<Vec<f32>>;
        let groups: Vec<Vec<usize>>;

        if features.len() <= k {
            // trivial case: each feature is its own cluster
            clusters = features.iter().map(|f| f.to_vec()).collect();
            groups = (0..features.len()).map(|i| vec![i]).collect();
        } else {
            let mut centers = self.seed_clusters_plus_plus(features, rng);
            let mut current_groups;
            let mut last_assignment: Vec<usize> = Vec::new();

            loop {
                // associate each feature with its nearest center,
                // ties to the lowest center index
                let mut assignment = Vec::with_capacity(features.len());
                let mut new_groups = vec![Vec::new(); centers.len()];
                for (i, f) in features.iter().enumerate() {
                    let mut best = 0;
                    let mut best_sqd = squared_distance(f, &centers[0]);
                    for (j, c) in centers.iter().enumerate().skip(1) {
                        let sqd = squared_distance(f, c);
                        if sqd < best_sqd {
                            best_sqd = sqd;
                            best = j;
                        }
                    }
                    new_groups[best].push(i);
                    assignment.push(best);
                }
                current_groups = new_groups;

                // converged when the assignment repeats exactly
                if assignment == last_assignment {
                    break;
                }
                last_assignment = assignment;

                // recompute each center as the mean of its members; a center
                // that lost every member keeps its previous position
                for (center, group) in centers.iter_mut().zip(&current_groups) {
                    if group.is_empty() {
                        continue;
                    }
                    center.iter_mut().for_each(|x| *x = 0.0);
                    for &i in group {
                        for (x, v) in center.iter_mut().zip(features[i]) {
                            *x += v;
                        }
                    }
                    let n = group.len() as f32;
                    center.iter_mut().for_each(|x| *x /= n);
                }
            }

            clusters = centers;
            groups = current_groups;
        }

        // one child per cluster, in cluster-index order
        let mut child_ids = Vec::with_capacity(clusters.len());
        for centroid in clusters {
            let id = self.nodes.len() as NodeId;
            let mut node = Node::new(id);
            node.descriptor = centroid;
            self.nodes.push(node);
            self.nodes[parent as usize].children.push(id);
            child_ids.push(id);
        }

        if level < self.params.l {
            for (&id, group) in child_ids.iter().zip(&groups) {
                if group.len() > 1 {
                    let child_features: Vec<&[f32]> =
                        group.iter().map(|&i| features[i]).collect();
                    self.hkmeans_step(id, &child_features, level + 1, rng);
                }
            }
        }
    }

    /// k-means++ seeding: first center uniform, then each new center drawn
    /// with probability proportional to the squared distance to the nearest
    /// chosen one. May return fewer than k centers when the residual distance
    /// mass runs out.
    fn seed_clusters_plus_plus(&self, features: &[&[f32]], rng: &mut StdRng) -> Vec<Vec<f32>> {
        let k = self.params.k;
        let mut used = vec![false; features.len()];
        let mut centers: Vec<Vec<f32>> = Vec::with_capacity(k);

        let first = rng.random_range(0..features.len());
        used[first] = true;
        centers.push(features[first].to_vec());

        let mut sqdistances: Vec<f64> = Vec::with_capacity(features.len());
        let mut candidates: Vec<usize> = Vec::with_capacity(features.len());

        while centers.len() < k {
            sqdistances.clear();
            candidates.clear();
            for (i, f) in features.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let min_sqd = centers
                    .iter()
                    .map(|c| squared_distance(f, c))
                    .fold(f64::INFINITY, f64::min);
                sqdistances.push(min_sqd);
                candidates.push(i);
            }

            let total: f64 = sqdistances.iter().sum();
            if total <= 0.0 {
                break;
            }
            let mut cut = 0.0;
            while cut == 0.0 {
                cut = rng.random_range(0.0..total);
            }

            let mut acc = 0.0;
            let mut chosen = candidates.len() - 1;
            for (j, &sqd) in sqdistances.iter().enumerate() {
                acc += sqd;
                if acc >= cut {
                    chosen = j;
                    break;
                }
            }

            let i = candidates[chosen];
            used[i] = true;
            centers.push(features[i].to_vec());
        }

        centers
    }

    /// Number the leaves in arena (creation) order and fill the word table.
    fn create_words(&mut self) {
        self.words.clear();
        for node in self.nodes.iter_mut() {
            if node.is_leaf() {
                node.word = Some(self.words.len() as WordId);
                self.words.push(node.id);
            }
        }
    }

    /// Compute per-word weights and corpus frequencies from the training
    /// data, store the weights in the leaves and rebuild the stop machinery.
    fn set_node_weights(&mut self, training: &[Vec<f32>]) -> Result<()> {
        let d = self.params.descriptor_length;
        let nwords = self.words.len();
        let ndocs = training.len();

        let mut weights: Vec<WordValue> = vec![0.0; nwords];
        self.frequencies = vec![0.0; nwords];

        match self.params.weighting {
            Weighting::Idf | Weighting::TfIdf => {
                // the stored weight is only the idf part ln(N / Ni); the tf
                // part is accumulated per document in transform
                let mut ni = vec![0u32; nwords];
                let mut counted = vec![false; nwords];

                for group in training {
                    counted.fill(false);
                    for f in descriptors(group, d)? {
                        let id = self.descend(f) as usize;
                        self.frequencies[id] += 1.0;
                        if !counted[id] {
                            ni[id] += 1;
                            counted[id] = true;
                        }
                    }
                }

                for (w, &n) in weights.iter_mut().zip(&ni) {
                    if n > 0 {
                        *w = (ndocs as f64 / n as f64).ln();
                    }
                }
            }
            Weighting::Tf | Weighting::Binary => {
                // binary ignores weights entirely; tf applies its whole
                // score at transform time
                if self.params.weighting == Weighting::Tf {
                    weights.iter_mut().for_each(|w| *w = 1.0);
                }
                for group in training {
                    for f in descriptors(group, d)? {
                        let id = self.descend(f) as usize;
                        self.frequencies[id] += 1.0;
                    }
                }
            }
        }

        let total: f32 = self.frequencies.iter().sum();
        if total > 0.0 {
            for fr in self.frequencies.iter_mut() {
                *fr /= total;
            }
        }

        for (word, &weight) in weights.iter().enumerate() {
            let node = self.words[word] as usize;
            self.nodes[node].weight = weight;
        }

        self.create_stop_list();
        Ok(())
    }

    /// Rebuild the frequency ordering and clear all stop flags.
    fn create_stop_list(&mut self) {
        self.stop_list.clear();
        self.word_stopped = vec![false; self.frequencies.len()];
        self.frequent_stopped = 0;
        self.infrequent_stopped = 0;

        let mut pairs: Vec<(f32, WordId)> = self
            .frequencies
            .iter()
            .enumerate()
            .map(|(id, &fr)| (fr, id as WordId))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        self.words_in_order = pairs.into_iter().map(|(_, id)| id).collect();
    }

    /// Stop the `frequent` highest-frequency and `infrequent`
    /// lowest-frequency words. Later transforms will not emit them.
    ///
    /// Calls do not stack: each call replaces the previous stop set, and
    /// `stop_words(0, 0)` restores every word. Bag-of-words vectors built
    /// before stopping may still contain stopped words; recompute them for
    /// correct scoring.
    pub fn stop_words(&mut self, frequent: usize, infrequent: usize) {
        if !self.created {
            return;
        }
        let nwords = self.words_in_order.len();
        let nfrequent = frequent.min(nwords);
        let ninfrequent = infrequent.min(nwords);

        for &id in &self.stop_list {
            self.word_stopped[id as usize] = false;
        }
        self.stop_list.clear();

        for i in 0..ninfrequent {
            let id = self.words_in_order[i];
            self.stop_list.push(id);
            self.word_stopped[id as usize] = true;
        }
        for i in 0..nfrequent {
            let id = self.words_in_order[nwords - i - 1];
            self.stop_list.push(id);
            self.word_stopped[id as usize] = true;
        }

        self.frequent_stopped = nfrequent;
        self.infrequent_stopped = ninfrequent;
    }

    /// Fractional form of [`Vocabulary::stop_words`]: fractions of the word
    /// count, truncated.
    pub fn stop_words_fraction(&mut self, frequent: f32, infrequent: f32) {
        if !self.created {
            return;
        }
        let nwords = self.words_in_order.len() as f32;
        self.stop_words(
            (frequent * nwords) as usize,
            (infrequent * nwords) as usize,
        );
    }

    pub fn is_word_stopped(&self, id: WordId) -> bool {
        (id as usize) < self.word_stopped.len() && self.word_stopped[id as usize]
    }

    /// Weight of a word; 0 for an empty vocabulary.
    pub fn word_weight(&self, id: WordId) -> WordValue {
        if self.is_empty() {
            return 0.0;
        }
        self.nodes[self.words[id as usize] as usize].weight
    }

    /// Normalized corpus frequency of a word; 0 for an empty vocabulary.
    pub fn word_frequency(&self, id: WordId) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        self.frequencies[id as usize]
    }

    /// Propagate a single descriptor down the tree to its word id. An empty
    /// vocabulary maps everything to word 0.
    pub fn descend(&self, feature: &[f32]) -> WordId {
        if self.is_empty() || self.nodes.len() <= 1 {
            return 0;
        }

        let mut node = 0usize;
        while !self.nodes[node].is_leaf() {
            let children = &self.nodes[node].children;
            let mut best = children[0] as usize;
            let mut best_sqd = squared_distance(feature, &self.nodes[best].descriptor);
            for &c in &children[1..] {
                let sqd = squared_distance(feature, &self.nodes[c as usize].descriptor);
                if sqd < best_sqd {
                    best_sqd = sqd;
                    best = c as usize;
                }
            }
            node = best;
        }
        self.nodes[node].word.unwrap_or(0)
    }

    /// Transform a set of image descriptors into an in-order bag-of-words
    /// vector under the vocabulary's weighting.
    pub fn transform(&self, features: &[f32]) -> Result<BowVector> {
        self.transform_with(features, true)
    }

    /// Like [`Vocabulary::transform`] but only sorts the result when
    /// `arrange` is set. Unarranged vectors are fine for database use but
    /// must not be fed to [`Vocabulary::score`].
    pub fn transform_with(&self, features: &[f32], arrange: bool) -> Result<BowVector> {
        let d = self.params.descriptor_length;
        let feats = descriptors(features, d)?;

        let mut v: BowVector = Vec::new();
        if self.is_empty() {
            return Ok(v);
        }
        v.reserve(features.len() / d);

        match self.params.weighting {
            Weighting::TfIdf | Weighting::Tf | Weighting::Idf => {
                // n_d counts distinct words of the document, stopped ones
                // included; the tf part of the score is n_i_d / n_d
                let mut nd = 0usize;
                let mut stopped: Vec<WordId> = Vec::new();

                for f in feats {
                    let id = self.descend(f);
                    if self.is_word_stopped(id) {
                        if !stopped.contains(&id) {
                            stopped.push(id);
                            nd += 1;
                        }
                    } else if let Some(entry) = v.iter_mut().find(|e| e.id == id) {
                        if self.params.weighting != Weighting::Idf {
                            // n_i_d accumulates implicitly
                            entry.value += self.word_weight(id);
                        }
                    } else {
                        v.push(BowEntry::new(id, self.word_weight(id)));
                        nd += 1;
                    }
                }

                if nd > 0 && self.params.weighting != Weighting::Idf {
                    let nd = nd as f64;
                    for e in v.iter_mut() {
                        e.value /= nd;
                    }
                }
            }
            Weighting::Binary => {
                for f in feats {
                    let id = self.descend(f);
                    if !self.is_word_stopped(id) && !v.iter().any(|e| e.id == id) {
                        v.push(BowEntry::new(id, 1.0));
                    }
                }
            }
        }

        if arrange {
            v.put_in_order();
        }
        Ok(v)
    }

    /// Score two in-order bag-of-words vectors under the vocabulary's
    /// scoring and scaling configuration.
    pub fn score(&self, v: &BowVector, w: &BowVector) -> f64 {
        scoring::score(self.params.scoring, self.params.scale_score, v, w)
    }

    /// Save the vocabulary to a file.
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

    /// Load a vocabulary from a file, auto-detecting the encoding from the
    /// first byte.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let format = detect_format(path.as_ref())?;
        let file = File::open(path.as_ref())?;
        let mut buf = BufReader::new(file);
        let voc = match format {
            FileFormat::Binary => {
                let mut r = BinaryReader::new(&mut buf);
                Self::read_from(&mut r)?
            }
            FileFormat::Text => {
                let mut r = TextReader::new(&mut buf);
                Self::read_from(&mut r)?
            }
        };
        info!(words = voc.words.len(), ?format, "vocabulary loaded");
        Ok(voc)
    }

    /// Serialize the vocabulary onto a token stream.
    ///
    /// Layout: sentinel, 8-integer header (type, weighting, scoring, scale
    /// flag, D, word count, frequent stopped, infrequent stopped), `k L N`,
    /// then one record per non-root node (id, parent, weight, descriptor)
    /// and one per word (id, frequency, node).
    pub(crate) fn write_to(&self, f: &mut dyn TokenWrite) -> Result<()> {
        f.put_magic()?;
        f.put_i32(self.params.kind.tag())?;
        f.put_i32(self.params.weighting.tag())?;
        f.put_i32(self.params.scoring.tag())?;
        f.put_i32(i32::from(self.params.scale_score))?;
        f.put_i32(self.params.descriptor_length as i32)?;
        f.put_i32(self.number_of_words() as i32)?;
        f.put_i32(self.frequent_stopped as i32)?;
        f.put_i32(self.infrequent_stopped as i32)?;

        f.put_i32(self.params.k as i32)?;
        f.put_i32(self.params.l as i32)?;
        f.put_i32(self.nodes.len() as i32)?;

        // depth-first walk from the root; children go out in order, leafness
        // is re-derived on load from the parent links
        let mut parents: Vec<usize> = if self.nodes.is_empty() { vec![] } else { vec![0] };
        while let Some(pid) = parents.pop() {
            for &cid in &self.nodes[pid].children {
                let child = &self.nodes[cid as usize];
                f.put_i32(child.id as i32)?;
                f.put_i32(pid as i32)?;
                f.put_f64(child.weight)?;
                for &x in &child.descriptor {
                    f.put_f32(x)?;
                }
                if !child.is_leaf() {
                    parents.push(cid as usize);
                }
            }
        }

        for (word, &node) in self.words.iter().enumerate() {
            f.put_i32(word as i32)?;
            f.put_f32(self.frequencies[word])?;
            f.put_i32(node as i32)?;
        }
        Ok(())
    }

    /// Deserialize a vocabulary from a token stream, leaving the stream
    /// positioned right after the word table (where a database tail starts).
    pub(crate) fn read_from(f: &mut dyn TokenRead) -> Result<Self> {
        f.skip_magic()?;
        let kind = VocabKind::from_tag(f.next_i32()?)?;
        let weighting = Weighting::from_tag(f.next_i32()?)?;
        let scoring = crate::params::Scoring::from_tag(f.next_i32()?)?;
        let scale_score = f.next_i32()? != 0;
        let d = f.next_i32()?;
        let nwords = f.next_i32()?;
        let nfrequent = f.next_i32()?;
        let ninfrequent = f.next_i32()?;

        let k = f.next_i32()?;
        let l = f.next_i32()?;
        let nnodes = f.next_i32()?;

        if d < 0 || nwords < 0 || nfrequent < 0 || ninfrequent < 0 || k < 0 || l < 0 || nnodes < 0
        {
            return Err(Error::MalformedFile("negative header field".into()));
        }
        let d = d as usize;
        let nwords = nwords as usize;
        let nnodes = nnodes as usize;

        let params = VocabParams {
            kind,
            weighting,
            scoring,
            scale_score,
            descriptor_length: d,
            k: k as usize,
            l: l as usize,
        };
        let mut voc = Self::with_params_unchecked(params);

        voc.nodes = (0..nnodes).map(|i| Node::new(i as NodeId)).collect();
        for _ in 1..nnodes.max(1) {
            let id = f.next_i32()?;
            let parent = f.next_i32()?;
            if id <= 0 || id as usize >= nnodes || parent < 0 || parent as usize >= nnodes {
                return Err(Error::MalformedFile(format!(
                    "node id {id} with parent {parent} out of range"
                )));
            }
            let weight = f.next_f64()?;
            let mut descriptor = Vec::with_capacity(d);
            for _ in 0..d {
                descriptor.push(f.next_f32()?);
            }
            let node = &mut voc.nodes[id as usize];
            node.weight = weight;
            node.descriptor = descriptor;
            voc.nodes[parent as usize].children.push(id as NodeId);
        }

        voc.words = vec![0; nwords];
        voc.frequencies = vec![0.0; nwords];
        for _ in 0..nwords {
            let word = f.next_i32()?;
            let frequency = f.next_f32()?;
            let node = f.next_i32()?;
            if word < 0 || word as usize >= nwords || node < 0 || node as usize >= nnodes {
                return Err(Error::MalformedFile(format!(
                    "word {word} on node {node} out of range"
                )));
            }
            voc.nodes[node as usize].word = Some(word as WordId);
            voc.words[word as usize] = node as NodeId;
            voc.frequencies[word as usize] = frequency;
        }

        voc.created = true;
        voc.create_stop_list();
        voc.stop_words(nfrequent as usize, ninfrequent as usize);
        Ok(voc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Scoring;
    use proptest::prelude::*;

    fn params(
        k: usize,
        l: usize,
        d: usize,
        weighting: Weighting,
        scoring: Scoring,
    ) -> VocabParams {
        VocabParams::hierarchical(k, l, d, weighting, scoring, true)
    }

    fn tfidf_3doc_vocab() -> Vocabulary {
        let mut voc =
            Vocabulary::new(params(2, 1, 1, Weighting::TfIdf, Scoring::L1Norm)).unwrap();
        voc.create_with_seed(&[vec![1.0], vec![1.0], vec![5.0]], 7)
            .unwrap();
        voc
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(Vocabulary::new(params(1, 1, 2, Weighting::Tf, Scoring::L1Norm)).is_err());
        assert!(Vocabulary::new(params(2, 0, 2, Weighting::Tf, Scoring::L1Norm)).is_err());
        assert!(Vocabulary::new(params(2, 1, 0, Weighting::Tf, Scoring::L1Norm)).is_err());
    }

    #[test]
    fn tiny_tree_puts_words_on_the_training_points() {
        let mut voc = Vocabulary::new(params(2, 1, 2, Weighting::Tf, Scoring::L1Norm)).unwrap();
        voc.create_with_seed(&[vec![0.0, 0.0, 10.0, 10.0]], 1).unwrap();

        assert!(!voc.is_empty());
        assert_eq!(voc.number_of_words(), 2);

        // trivial clustering keeps feature order: word 0 sits at (0, 0)
        let near_origin = voc.transform(&[0.1, 0.1]).unwrap();
        assert_eq!(near_origin.len(), 1);
        assert_eq!(near_origin[0].id, 0);

        let near_far = voc.transform(&[9.0, 9.5]).unwrap();
        assert_eq!(near_far[0].id, 1);
        assert_ne!(near_origin[0].id, near_far[0].id);
    }

    #[test]
    fn word_table_is_consistent() {
        let voc = tfidf_3doc_vocab();
        for (word, &node) in voc.words.iter().enumerate() {
            let n = &voc.nodes[node as usize];
            assert!(n.is_leaf());
            assert_eq!(n.word, Some(word as WordId));
        }
    }

    #[test]
    fn frequencies_sum_to_one() {
        let voc = tfidf_3doc_vocab();
        let total: f32 = voc.frequencies.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tf_idf_weights_follow_document_counts() {
        let voc = tfidf_3doc_vocab();

        // N = 3 docs; the word near 1.0 appears in two, the one near 5.0 in one
        let common = voc.descend(&[1.0]);
        let rare = voc.descend(&[5.0]);
        assert_ne!(common, rare);
        assert!((voc.word_weight(common) - (3.0f64 / 2.0).ln()).abs() < 1e-12);
        assert!((voc.word_weight(rare) - 3.0f64.ln()).abs() < 1e-12);

        // 2 of 3 training occurrences hit the common word
        assert!((voc.word_frequency(common) - 2.0 / 3.0).abs() < 1e-6);
        assert!((voc.word_frequency(rare) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn stop_words_suppresses_and_restores() {
        let mut voc = tfidf_3doc_vocab();
        let common = voc.descend(&[1.0]);

        voc.stop_words(1, 0);
        assert!(voc.is_word_stopped(common));
        assert_eq!(voc.word_stopped.iter().filter(|&&s| s).count(), 1);
        assert!(voc.transform(&[1.0]).unwrap().is_empty());
        assert!(!voc.transform(&[5.0]).unwrap().is_empty());

        voc.stop_words(0, 0);
        assert!(!voc.is_word_stopped(common));
        assert_eq!(voc.word_stopped.iter().filter(|&&s| s).count(), 0);
        assert!(!voc.transform(&[1.0]).unwrap().is_empty());
    }

    #[test]
    fn stop_words_calls_replace_each_other() {
        let mut voc = tfidf_3doc_vocab();
        let common = voc.descend(&[1.0]);
        let rare = voc.descend(&[5.0]);

        voc.stop_words(1, 0);
        assert!(voc.is_word_stopped(common));
        assert!(!voc.is_word_stopped(rare));

        voc.stop_words(0, 1);
        assert!(!voc.is_word_stopped(common));
        assert!(voc.is_word_stopped(rare));

        let info = voc.retrieve_info();
        assert_eq!(info.stopped_frequent, 0);
        assert_eq!(info.stopped_infrequent, 1);
    }

    #[test]
    fn fractional_stop_words_truncate() {
        let mut voc = tfidf_3doc_vocab();
        // 2 words: 0.5 * 2 = 1 frequent word stopped
        voc.stop_words_fraction(0.5, 0.0);
        assert_eq!(voc.retrieve_info().stopped_frequent, 1);
        // 0.4 * 2 truncates to 0
        voc.stop_words_fraction(0.4, 0.4);
        assert_eq!(voc.retrieve_info().stopped_frequent, 0);
        assert_eq!(voc.retrieve_info().stopped_infrequent, 0);
    }

    #[test]
    fn stopped_words_still_count_in_the_tf_denominator() {
        let mut voc = tfidf_3doc_vocab();
        let common = voc.descend(&[1.0]);
        let rare = voc.descend(&[5.0]);

        let before = voc.transform(&[1.0, 5.0]).unwrap();
        let rare_before = before.iter().find(|e| e.id == rare).unwrap().value;

        voc.stop_words(1, 0);
        let after = voc.transform(&[1.0, 5.0]).unwrap();
        assert!(after.iter().all(|e| e.id != common));
        let rare_after = after.iter().find(|e| e.id == rare).unwrap().value;

        // n_d still counts the stopped hit, so the rare word's tf part
        // stays 1/2 instead of growing to 1
        assert!((rare_after - rare_before).abs() < 1e-12);
    }

    #[test]
    fn idf_does_not_accumulate_multiplicity() {
        let mut voc =
            Vocabulary::new(params(2, 1, 1, Weighting::Idf, Scoring::L1Norm)).unwrap();
        voc.create_with_seed(&[vec![1.0], vec![1.0], vec![5.0]], 7)
            .unwrap();
        let rare = voc.descend(&[5.0]);

        let once = voc.transform(&[5.0]).unwrap();
        let thrice = voc.transform(&[5.0, 5.0, 5.0]).unwrap();
        let v1 = once.iter().find(|e| e.id == rare).unwrap().value;
        let v3 = thrice.iter().find(|e| e.id == rare).unwrap().value;
        assert!((v1 - v3).abs() < 1e-12);
        assert!((v1 - 3.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn binary_weighting_emits_ones() {
        let mut voc =
            Vocabulary::new(params(2, 1, 1, Weighting::Binary, Scoring::L1Norm)).unwrap();
        voc.create_with_seed(&[vec![1.0], vec![1.0], vec![5.0]], 7)
            .unwrap();
        let v = voc.transform(&[1.0, 1.0, 5.0]).unwrap();
        assert_eq!(v.len(), 2);
        assert!(v.iter().all(|e| e.value == 1.0));
    }

    #[test]
    fn empty_training_leaves_the_vocabulary_empty() {
        let mut voc = Vocabulary::new(params(2, 1, 2, Weighting::Tf, Scoring::L1Norm)).unwrap();
        voc.create(&[]).unwrap();
        assert!(voc.is_empty());
        assert_eq!(voc.number_of_words(), 0);
        assert!(voc.transform(&[1.0, 2.0]).unwrap().is_empty());

        voc.create(&[vec![], vec![]]).unwrap();
        assert!(voc.is_empty());
    }

    #[test]
    fn bad_descriptor_multiple_is_rejected() {
        let mut voc = Vocabulary::new(params(2, 1, 2, Weighting::Tf, Scoring::L1Norm)).unwrap();
        assert!(voc.create(&[vec![1.0, 2.0, 3.0]]).is_err());
        assert!(voc.is_empty());

        voc.create_with_seed(&[vec![0.0, 0.0, 10.0, 10.0]], 1).unwrap();
        assert!(matches!(
            voc.transform(&[1.0]),
            Err(Error::BadDescriptorBuffer { .. })
        ));
    }

    #[test]
    fn deeper_trees_bound_the_word_count() {
        // 40 clustered points in 2-d, k = 3, L = 2
        let mut group = Vec::new();
        for i in 0..40 {
            let c = (i % 4) as f32 * 25.0;
            group.push(c + (i / 4) as f32 * 0.1);
            group.push(c - (i / 4) as f32 * 0.1);
        }
        let mut voc = Vocabulary::new(params(3, 2, 2, Weighting::TfIdf, Scoring::L1Norm)).unwrap();
        voc.create_with_seed(&[group], 42).unwrap();

        assert!(voc.number_of_words() <= 9); // k^L
        assert!(voc.number_of_words() >= 4); // one per point cluster
        for (word, &node) in voc.words.iter().enumerate() {
            assert_eq!(voc.nodes[node as usize].word, Some(word as WordId));
        }
        // every descriptor of the corpus lands on some word
        let v = voc.transform(&[25.0, 25.0]).unwrap();
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn save_load_round_trip_binary_is_exact() {
        let voc = tfidf_3doc_vocab();
        let dir = std::env::temp_dir();
        let path = dir.join("hbow_voc_roundtrip.bin");
        voc.save(&path, FileFormat::Binary).unwrap();
        let loaded = Vocabulary::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(voc, loaded);
        assert_eq!(voc.retrieve_info(), loaded.retrieve_info());
    }

    #[test]
    fn save_load_round_trip_text_within_tolerance() {
        let mut voc = tfidf_3doc_vocab();
        voc.stop_words(1, 0);
        let dir = std::env::temp_dir();
        let path = dir.join("hbow_voc_roundtrip.txt");
        voc.save(&path, FileFormat::Text).unwrap();
        let loaded = Vocabulary::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(voc.retrieve_info(), loaded.retrieve_info());
        assert_eq!(voc.number_of_words(), loaded.number_of_words());
        for w in 0..voc.number_of_words() as WordId {
            assert!((voc.word_weight(w) - loaded.word_weight(w)).abs() < 1e-6);
            assert!((voc.word_frequency(w) - loaded.word_frequency(w)).abs() < 1e-6);
            assert_eq!(voc.is_word_stopped(w), loaded.is_word_stopped(w));
        }
    }

    #[test]
    fn format_auto_detection_reads_the_first_byte() {
        let voc = tfidf_3doc_vocab();
        let dir = std::env::temp_dir();
        let bin = dir.join("hbow_voc_detect.bin");
        let txt = dir.join("hbow_voc_detect.txt");
        voc.save(&bin, FileFormat::Binary).unwrap();
        voc.save(&txt, FileFormat::Text).unwrap();

        let first_bin = std::fs::read(&bin).unwrap()[0];
        let first_txt = std::fs::read(&txt).unwrap()[0];
        assert_eq!(first_bin, 0);
        assert!(first_txt >= 32);

        let from_bin = Vocabulary::load(&bin).unwrap();
        let from_txt = Vocabulary::load(&txt).unwrap();
        std::fs::remove_file(&bin).ok();
        std::fs::remove_file(&txt).ok();
        assert_eq!(from_bin.number_of_words(), from_txt.number_of_words());
    }

    #[test]
    fn truncated_file_is_malformed() {
        let voc = tfidf_3doc_vocab();
        let dir = std::env::temp_dir();
        let path = dir.join("hbow_voc_truncated.bin");
        voc.save(&path, FileFormat::Binary).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            Vocabulary::load(&path),
            Err(Error::MalformedFile(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn serde_round_trip_preserves_the_vocabulary() {
        let voc = tfidf_3doc_vocab();
        let bytes = bincode::serialize(&voc).unwrap();
        let back: Vocabulary = bincode::deserialize(&bytes).unwrap();
        assert_eq!(voc, back);
    }

    #[test]
    fn unknown_tags_fail_to_load() {
        let dir = std::env::temp_dir();

        // weighting tag 9 does not exist
        let path = dir.join("hbow_voc_bad_weighting.txt");
        std::fs::write(&path, "0 9 0 1 1 2 0 0 2 1 3 ").unwrap();
        assert!(matches!(
            Vocabulary::load(&path),
            Err(Error::InvalidParameter(_))
        ));
        std::fs::remove_file(&path).ok();

        // scoring tag 6 does not exist either
        let path = dir.join("hbow_voc_bad_scoring.txt");
        std::fs::write(&path, "0 0 6 1 1 2 0 0 2 1 3 ").unwrap();
        assert!(matches!(
            Vocabulary::load(&path),
            Err(Error::InvalidParameter(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    proptest! {
        #[test]
        fn creation_is_deterministic_given_a_seed(
            seed in any::<u64>(),
            raw in proptest::collection::vec(-10.0f32..10.0, 8..64),
        ) {
            let n = raw.len() - raw.len() % 2;
            let group = raw[..n].to_vec();

            let p = VocabParams::hierarchical(3, 2, 2, Weighting::TfIdf, Scoring::L1Norm, true);
            let mut a = Vocabulary::new(p).unwrap();
            let mut b = Vocabulary::new(p).unwrap();
            a.create_with_seed(&[group.clone()], seed).unwrap();
            b.create_with_seed(&[group], seed).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn stop_words_zero_zero_restores_all_words(
            frequent in 0usize..6,
            infrequent in 0usize..6,
        ) {
            let mut voc = tfidf_3doc_vocab();
            let baseline = voc.word_stopped.clone();

            voc.stop_words(frequent, infrequent);
            voc.stop_words(0, 0);

            prop_assert_eq!(&voc.word_stopped, &baseline);
            prop_assert_eq!(voc.retrieve_info().stopped_frequent, 0);
            prop_assert_eq!(voc.retrieve_info().stopped_infrequent, 0);
        }
    }
}
