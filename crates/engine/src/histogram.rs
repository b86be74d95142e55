//! Similarity heuristics for element matching: a 2-byte-sequence histogram
//! distance, and an outlier detector over the resulting distances.

use marrow_core::buffer::read_u16_le;

/// Detects outliers in a list of samples using Chauvenet's criterion:
/// compute mean and standard deviation, then test whether a query value
/// lies beyond a fixed number of sigmas from the mean. This reduces the
/// chance of false-positive ensemble matches.
#[derive(Default)]
pub struct OutlierDetector {
    n: usize,
    sum: f64,
    sum_of_squares: f64,
    mean: f64,
    standard_deviation: f64,
}

impl OutlierDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Incorporates `sample` (typically in `[0, 1]`) into the statistics.
    pub fn add(&mut self, sample: f64) {
        self.n += 1;
        self.sum += sample;
        self.sum_of_squares += sample * sample;
    }

    /// Prepares statistics for [`decide_outlier`](Self::decide_outlier).
    /// Call after all samples have been added.
    pub fn prepare(&mut self) {
        if self.n > 0 {
            self.mean = self.sum / self.n as f64;
            self.standard_deviation = ((self.sum_of_squares - self.sum * self.mean)
                / core::cmp::max(1, self.n - 1) as f64)
                .sqrt();
        }
    }

    /// Renders current statistics for logging.
    #[must_use]
    pub fn render_stats(&self) -> String {
        format!(
            "Mean = {:.5}, StdDev = {:.5} over {} samples",
            self.mean, self.standard_deviation, self.n
        )
    }

    /// Heuristically decides whether `sample` is an outlier: 1 if too high,
    /// 0 if normal, -1 if too low. Must be called after
    /// [`prepare`](Self::prepare).
    #[must_use]
    pub fn decide_outlier(&self, sample: f64) -> i32 {
        // Tolerance floor avoids divide-by-zero and penalizing tight
        // clusters.
        const MIN_TOLERANCE: f64 = 0.1;
        // Sigmas away from the mean for a value to become an outlier.
        const SIGMA_BOUND: f64 = 1.9;
        if self.n <= 1 {
            return 0;
        }
        let tolerance = MIN_TOLERANCE.max(self.standard_deviation);
        let num_sigma = (sample - self.mean) / tolerance;
        if num_sigma > SIGMA_BOUND {
            1
        } else if num_sigma < -SIGMA_BOUND {
            -1
        } else {
            0
        }
    }
}

const NUM_BINS: usize = 1 << 16;

/// Similarity between binary data, via a 65536-bin histogram counting
/// consecutive (overlapping) 2-byte sequences. Data shorter than 2 bytes
/// are invalid.
pub struct BinaryDataHistogram {
    size: usize,
    // Signed counts simplify computing distances.
    histogram: Option<Vec<i32>>,
}

impl BinaryDataHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self { size: 0, histogram: None }
    }

    /// Attempts to compute the histogram; returns whether `region` was
    /// large enough.
    pub fn compute(&mut self, region: &[u8]) -> bool {
        debug_assert!(self.histogram.is_none());
        if region.len() < 2 {
            return false;
        }
        debug_assert!(region.len() <= i32::MAX as usize);
        let mut histogram = vec![0i32; NUM_BINS];
        for pos in 0..region.len() - 1 {
            let bin = read_u16_le(region, pos).unwrap_or(0);
            histogram[bin as usize] += 1;
        }
        self.size = region.len();
        self.histogram = Some(histogram);
        true
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.histogram.is_some()
    }

    /// L1 distance to another histogram, normalized by the combined sizes
    /// so the result lies in `[0, 1]`. Identical data have distance 0; the
    /// converse does not hold ("aba" and "bab" also have distance 0).
    #[must_use]
    pub fn distance(&self, other: &Self) -> f64 {
        let (Some(lhs), Some(rhs)) = (&self.histogram, &other.histogram) else {
            debug_assert!(false, "distance on invalid histogram");
            return 1.0;
        };
        let total_diff: f64 =
            lhs.iter().zip(rhs).map(|(&a, &b)| f64::from((a - b).abs())).sum();
        total_diff / (self.size + other.size) as f64
    }
}

impl Default for BinaryDataHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_identity_and_disjoint_distances() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut a = BinaryDataHistogram::new();
        assert!(a.compute(data));
        let mut b = BinaryDataHistogram::new();
        assert!(b.compute(data));
        assert_eq!(a.distance(&b), 0.0);

        // Completely disjoint pair sets: maximal normalized distance.
        let mut c = BinaryDataHistogram::new();
        assert!(c.compute(&[0xEE; 44]));
        let d = a.distance(&c);
        assert!(d > 0.9, "distance = {d}");
    }

    #[test]
    fn histogram_rejects_tiny_input() {
        let mut histogram = BinaryDataHistogram::new();
        assert!(!histogram.compute(&[1]));
        assert!(!histogram.is_valid());
    }

    #[test]
    fn outlier_detection_flags_extremes() {
        let mut detector = OutlierDetector::new();
        for sample in [0.10, 0.11, 0.12, 0.09, 0.10, 0.11] {
            detector.add(sample);
        }
        detector.prepare();
        assert_eq!(detector.decide_outlier(0.10), 0);
        // The tolerance floor (0.1) protects tight clusters, so only values
        // far above the mean are rejected.
        assert_eq!(detector.decide_outlier(0.15), 0);
        assert_eq!(detector.decide_outlier(0.35), 1);
        assert_eq!(detector.decide_outlier(-0.2), -1);
    }

    #[test]
    fn outlier_detection_needs_samples() {
        let mut detector = OutlierDetector::new();
        detector.add(0.5);
        detector.prepare();
        assert_eq!(detector.decide_outlier(99.0), 0);
    }
}
