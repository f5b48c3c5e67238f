//! Descriptor views over caller-owned buffers.
//!
//! Feature extractors hand over one flat `&[f32]` per image holding its
//! descriptors back to back. Nothing here owns descriptor data; the
//! vocabulary only copies centroids into its own nodes.

use crate::error::{Error, Result};

/// Iterate the descriptors packed in `features`, `descriptor_length` floats
/// each. Fails if the buffer does not hold a whole number of descriptors.
pub fn descriptors(
    features: &[f32],
    descriptor_length: usize,
) -> Result<impl Iterator<Item = &[f32]>> {
    if descriptor_length == 0 || features.len() % descriptor_length != 0 {
        return Err(Error::BadDescriptorBuffer {
            len: features.len(),
            descriptor_length,
        });
    }
    Ok(features.chunks_exact(descriptor_length))
}

/// Squared Euclidean distance between two descriptors of equal length,
/// unrolled in blocks of four dimensions.
#[inline]
pub fn squared_distance(v: &[f32], w: &[f32]) -> f64 {
    debug_assert_eq!(v.len(), w.len());

    let mut sqd = 0.0f64;
    let mut va = v.chunks_exact(4);
    let mut wa = w.chunks_exact(4);
    for (a, b) in va.by_ref().zip(wa.by_ref()) {
        let d0 = a[0] - b[0];
        let d1 = a[1] - b[1];
        let d2 = a[2] - b[2];
        let d3 = a[3] - b[3];
        sqd += f64::from(d0 * d0) + f64::from(d1 * d1) + f64::from(d2 * d2) + f64::from(d3 * d3);
    }
    for (x, y) in va.remainder().iter().zip(wa.remainder()) {
        let d = x - y;
        sqd += f64::from(d * d);
    }
    sqd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(v: &[f32], w: &[f32]) -> f64 {
        v.iter()
            .zip(w)
            .map(|(a, b)| {
                let d = a - b;
                f64::from(d * d)
            })
            .sum()
    }

    #[test]
    fn unrolled_distance_matches_naive_loop() {
        for len in 1..=9usize {
            let v: Vec<f32> = (0..len).map(|i| i as f32 * 0.7 - 1.3).collect();
            let w: Vec<f32> = (0..len).map(|i| 2.1 - i as f32 * 0.4).collect();
            let got = squared_distance(&v, &w);
            let want = naive(&v, &w);
            assert!((got - want).abs() < 1e-9, "len {len}: {got} vs {want}");
        }
    }

    #[test]
    fn distance_to_self_is_zero() {
        let v = [1.0f32, -2.0, 3.5, 0.25, 7.0];
        assert_eq!(squared_distance(&v, &v), 0.0);
    }

    #[test]
    fn descriptors_splits_buffer() {
        let buf = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0];
        let views: Vec<&[f32]> = descriptors(&buf, 2).unwrap().collect();
        assert_eq!(views.len(), 3);
        assert_eq!(views[1], &[2.0, 3.0]);
    }

    #[test]
    fn descriptors_rejects_partial_buffer() {
        let buf = [0.0f32, 1.0, 2.0];
        assert!(matches!(
            descriptors(&buf, 2),
            Err(Error::BadDescriptorBuffer { len: 3, .. })
        ));
        assert!(descriptors(&buf, 0).is_err());
    }
}
