//! End-to-end retrieval: train a vocabulary on a synthetic corpus, index the
//! corpus in a database, and check that every image retrieves itself first.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hbow::{
    BowOps, Database, FileFormat, Scoring, VocabParams, Vocabulary, Weighting,
};

const D: usize = 8;
const IMAGES: usize = 12;
const DESCRIPTORS_PER_IMAGE: usize = 30;

/// Synthetic corpus of `IMAGES` images. Each image draws its descriptors
/// around one of four well-separated scene centers, with a per-image offset
/// so images of the same scene stay distinguishable.
fn corpus(rng: &mut StdRng) -> Vec<Vec<f32>> {
    (0..IMAGES)
        .map(|i| {
            let scene = (i % 4) as f32 * 20.0;
            let offset = (i / 4) as f32 * 0.5;
            (0..DESCRIPTORS_PER_IMAGE * D)
                .map(|_| scene + offset + rng.random_range(-1.0f32..1.0))
                .collect()
        })
        .collect()
}

fn trained(scoring: Scoring, scale: bool, rng: &mut StdRng) -> (Vocabulary, Vec<Vec<f32>>) {
    let images = corpus(rng);
    let params = VocabParams::hierarchical(4, 2, D, Weighting::TfIdf, scoring, scale);
    let mut voc = Vocabulary::new(params).unwrap();
    voc.create_with_seed(&images, 99).unwrap();
    (voc, images)
}

#[test]
fn training_produces_a_usable_vocabulary() {
    let mut rng = StdRng::seed_from_u64(5);
    let (voc, images) = trained(Scoring::L1Norm, true, &mut rng);

    assert!(!voc.is_empty());
    let words = voc.number_of_words();
    assert!(words >= 4, "four scenes should give at least four words");
    assert!(words <= 16, "k^L bounds the vocabulary");

    // every image transforms into a non-empty, in-order vector
    for image in &images {
        let v = voc.transform(image).unwrap();
        assert!(!v.is_empty());
        assert!(v.is_in_order());
        assert!(v.iter().all(|e| e.id < words as u32));
    }
}

#[test]
fn pairwise_scores_separate_same_scene_from_different_scene() {
    let mut rng = StdRng::seed_from_u64(6);
    let (voc, images) = trained(Scoring::L1Norm, true, &mut rng);

    let bows: Vec<_> = images.iter().map(|i| voc.transform(i).unwrap()).collect();

    // image 0 and image 4 share a scene; image 1 does not
    let same_scene = voc.score(&bows[0], &bows[4]);
    let other_scene = voc.score(&bows[0], &bows[1]);
    assert!(
        same_scene > other_scene,
        "same scene {same_scene} vs other {other_scene}"
    );

    // self score is perfect under scaled L1
    for b in &bows {
        assert!((voc.score(b, b) - 1.0).abs() < 1e-9);
    }
}

#[test]
fn one_image_per_scene_retrieves_itself_first() {
    let mut rng = StdRng::seed_from_u64(7);
    let (voc, images) = trained(Scoring::L1Norm, true, &mut rng);

    // one image per scene: vocabularies of different scenes share no words,
    // so the exact match cannot tie with anything
    let mut db = Database::new(voc);
    for image in images.iter().take(4) {
        db.add_entry(image).unwrap();
    }
    assert_eq!(db.number_of_entries(), 4);

    for (i, image) in images.iter().take(4).enumerate() {
        let ret = db.query(image, 3).unwrap();
        assert!(ret.len() <= 3);
        assert_eq!(ret[0].id as usize, i, "image {i} should match itself");
        assert!((ret[0].score - 1.0).abs() < 1e-9);
    }
}

#[test]
fn full_database_queries_return_perfect_same_scene_matches() {
    let mut rng = StdRng::seed_from_u64(12);
    let (voc, images) = trained(Scoring::L1Norm, true, &mut rng);

    let mut db = Database::new(voc);
    for image in &images {
        db.add_entry(image).unwrap();
    }
    assert_eq!(db.number_of_entries(), IMAGES);

    for (i, image) in images.iter().enumerate() {
        let ret = db.query(image, IMAGES).unwrap();
        // the indexed copy of the query scores a perfect match; an identical
        // same-scene histogram may tie with it, but never beat it
        assert!((ret[0].score - 1.0).abs() < 1e-9);
        assert_eq!(ret[0].id as usize % 4, i % 4, "query {i} left its scene");
        assert!(ret
            .iter()
            .any(|r| r.id as usize == i && (r.score - 1.0).abs() < 1e-9));
    }
}

#[test]
fn retrieval_works_under_bhattacharyya_too() {
    let mut rng = StdRng::seed_from_u64(8);
    let (voc, images) = trained(Scoring::Bhattacharyya, false, &mut rng);

    let mut db = Database::new(voc);
    for image in images.iter().take(4) {
        db.add_entry(image).unwrap();
    }

    for (i, image) in images.iter().take(4).enumerate() {
        let ret = db.query(image, 2).unwrap();
        assert_eq!(ret[0].id as usize, i);
        assert!((ret[0].score - 1.0).abs() < 1e-9);
        if ret.len() > 1 {
            // descending order: runner-up cannot beat the exact match
            assert!(ret[1].score <= ret[0].score);
        }
    }
}

#[test]
fn stopping_frequent_words_changes_transforms_reversibly() {
    let mut rng = StdRng::seed_from_u64(9);
    let (mut voc, images) = trained(Scoring::L1Norm, true, &mut rng);

    let reference: Vec<_> = images.iter().map(|i| voc.transform(i).unwrap()).collect();

    voc.stop_words_fraction(0.25, 0.0);
    let info = voc.retrieve_info();
    assert_eq!(info.stopped_frequent, voc.number_of_words() / 4);

    let stopped: Vec<_> = images.iter().map(|i| voc.transform(i).unwrap()).collect();
    assert!(
        stopped
            .iter()
            .zip(&reference)
            .any(|(s, r)| s.len() < r.len()),
        "stopping the most frequent quarter should shrink some vector"
    );

    voc.stop_words(0, 0);
    let restored: Vec<_> = images.iter().map(|i| voc.transform(i).unwrap()).collect();
    assert_eq!(restored, reference);
}

#[test]
fn full_pipeline_survives_persistence_in_both_formats() {
    let mut rng = StdRng::seed_from_u64(10);
    let (voc, images) = trained(Scoring::L1Norm, true, &mut rng);

    let mut db = Database::new(voc);
    for image in &images {
        db.add_entry(image).unwrap();
    }

    let dir = std::env::temp_dir();
    for (format, name) in [
        (FileFormat::Binary, "hbow_pipeline.bin"),
        (FileFormat::Text, "hbow_pipeline.txt"),
    ] {
        let path = dir.join(name);
        db.save(&path, format).unwrap();
        let loaded = Database::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.number_of_entries(), db.number_of_entries());
        assert_eq!(
            loaded.vocabulary().number_of_words(),
            db.vocabulary().number_of_words()
        );

        // per-entry scores are preserved across the round trip (text mode
        // may reorder exact ties by a rounding hair, so match by id)
        for (i, image) in images.iter().enumerate() {
            let before = db.query(image, IMAGES).unwrap();
            let after = loaded.query(image, IMAGES).unwrap();
            assert_eq!(before.len(), after.len(), "{format:?} query {i}");
            for b in &before {
                let a = after
                    .iter()
                    .find(|a| a.id == b.id)
                    .unwrap_or_else(|| panic!("{format:?} query {i} lost entry {}", b.id));
                assert!((b.score - a.score).abs() < 1e-6, "{format:?} query {i}");
            }
        }
    }
}

#[test]
fn exported_vocabulary_reproduces_the_database_transforms() {
    let mut rng = StdRng::seed_from_u64(11);
    let (voc, images) = trained(Scoring::L1Norm, true, &mut rng);

    let mut db = Database::new(voc);
    for image in &images {
        db.add_entry(image).unwrap();
    }

    let path = std::env::temp_dir().join("hbow_exported.voc");
    db.export_vocabulary(&path, FileFormat::Binary).unwrap();
    let standalone = Vocabulary::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    for image in &images {
        let a = standalone.transform(image).unwrap();
        let b = db.vocabulary().transform(image).unwrap();
        assert_eq!(a, b);
    }
}
