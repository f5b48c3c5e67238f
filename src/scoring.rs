//! Pairwise scoring of two in-order bag-of-words vectors.
//!
//! This path is independent from the inverted-index scoring in
//! [`crate::database`]: both compute the same scores, but the database
//! rearranges the accumulators so results of every distance-like scoring can
//! be sorted ascending before the final mapping (notably L2, which negates
//! the `sum(v_i * w_i)` term accumulated positively here).

use crate::bow::{BowOps, BowVector};
use crate::params::Scoring;
use crate::LOG_EPS;

/// Score two bag-of-words vectors. Both must be in ascending id order.
///
/// KL is not commutative: the scan covers `v` in full and charges every
/// coordinate missing from `w` with the epsilon floor, so `score(v, w)` and
/// `score(w, v)` differ in general. For all other scorings the shorter vector
/// is scanned and the longer binary-searched.
pub fn score(scoring: Scoring, scale: bool, v: &BowVector, w: &BowVector) -> f64 {
    debug_assert!(v.is_in_order() && w.is_in_order());

    let keep_order = scoring == Scoring::Kl;
    let (nv, nw);
    let (a, b) = if let Some(norm) = scoring.norm() {
        let mut v2 = v.clone();
        let mut w2 = w.clone();
        v2.normalize(norm);
        w2.normalize(norm);
        nv = v2;
        nw = w2;
        if keep_order || nv.len() < nw.len() {
            (&nv, &nw)
        } else {
            (&nw, &nv)
        }
    } else if keep_order || v.len() < w.len() {
        (v, w)
    } else {
        (w, v)
    };

    let mut s = 0.0;
    let mut first = 0; // hits only move forward in b
    for ea in a {
        match b[first..].binary_search_by_key(&ea.id, |e| e.id) {
            Ok(offset) => {
                let pos = first + offset;
                let vi = ea.value;
                let wi = b[pos].value;
                first = pos + 1;

                match scoring {
                    Scoring::L1Norm => s += (vi - wi).abs() - vi.abs() - wi.abs(),
                    Scoring::L2Norm | Scoring::DotProduct => s += vi * wi,
                    Scoring::ChiSquare => s += (vi - wi) * (vi - wi) / (vi + wi) - vi - wi,
                    Scoring::Kl => {
                        if vi > 0.0 {
                            if wi > 0.0 {
                                s += vi * (vi / wi).ln();
                            } else {
                                s += vi * (vi.ln() - LOG_EPS);
                            }
                        }
                    }
                    Scoring::Bhattacharyya => s += (vi * wi).sqrt(),
                }
            }
            Err(_) => {
                // KL charges coordinates of v that w misses
                if scoring == Scoring::Kl && ea.value > 0.0 {
                    s += ea.value * (ea.value.ln() - LOG_EPS);
                }
            }
        }
    }

    match scoring {
        Scoring::L1Norm => {
            // ||v - w||_L1 = 2 + sum(|vi - wi| - |vi| - |wi|) over common words
            if scale {
                -s / 2.0
            } else {
                2.0 + s
            }
        }
        Scoring::L2Norm => {
            // ||v - w||_L2 = sqrt(2 - 2 * sum(vi * wi)) over common words
            if scale {
                1.0 - (1.0 - s).sqrt()
            } else {
                (2.0 - 2.0 * s).sqrt()
            }
        }
        Scoring::ChiSquare => {
            // sum (vi - wi)^2 / (vi + wi) over all words reduces to the
            // common-word accumulator plus both vector sums
            let full = s + a.value_sum() + b.value_sum();
            if scale {
                1.0 - full / 2.0
            } else {
                full
            }
        }
        // KL and dot product have no scaled form; Bhattacharyya is in [0,1]
        Scoring::Kl | Scoring::Bhattacharyya | Scoring::DotProduct => s,
    }
}
