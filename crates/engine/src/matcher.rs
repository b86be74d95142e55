//! Ensemble matching: detects the executables embedded in an "old" and a
//! "new" archive and pairs each new element with an old one — either
//! heuristically (histogram distance with outlier rejection) or as imposed
//! by a match string.
//!
//! Notes on the output:
//! * A matched pair always has the same executable type.
//! * Byte-identical matches are trivial and excluded (counted separately).
//! * Multiple new elements may match one common old element.
//! * A new element may have no match at all.

use log::{info, warn};
use marrow_core::buffer::BufferRegion;
use marrow_disasm::prelude::*;
use marrow_image::types::{Element, ElementMatch, ExecutableType};

use crate::histogram::{BinaryDataHistogram, OutlierDetector};

/// Maximum number of elements per archive. Matching is O(n^2), which
/// suffices for regular archives holding tens of executables; hundreds are
/// pathological and rejected.
pub const ELEMENT_LIMIT: usize = 256;

/// Strategy interface for ensemble matching. `run_match` should be called
/// at most once per instance.
pub trait EnsembleMatcher {
    /// Returns whether matching succeeded (finding no matches is still a
    /// success).
    fn run_match(&mut self, old_image: &[u8], new_image: &[u8]) -> bool;

    /// Matched pairs, with new elements in increasing, non-overlapping
    /// offset order. May be empty.
    fn matches(&self) -> &[ElementMatch];

    /// Number of identical matches found (excluded from `matches`).
    fn num_identical(&self) -> usize;
}

// Finds embedded executables, or `None` if there are too many.
fn find_embedded_elements(image: &[u8], name: &str) -> Option<Vec<Element>> {
    let mut elements = Vec::new();
    for element in ElementFinder::new(image) {
        if elements.len() >= ELEMENT_LIMIT {
            warn!("{name}: Found too many elements.");
            return None;
        }
        elements.push(element);
    }
    info!("{name}: Found {} elements.", elements.len());
    Some(elements)
}

// Rejects proposed comparisons early when the size difference is too large
// (absolute and relative), to reduce costly false-positive matches.
fn unsafe_difference(old_element: &Element, new_element: &Element) -> bool {
    const MAX_BLOAT: f64 = 2.0;
    const MIN_WORRYSOME_DIFFERENCE: usize = 2 << 20; // 2 MiB.
    let lo_size = old_element.region.size.min(new_element.region.size);
    let hi_size = old_element.region.size.max(new_element.region.size);
    if hi_size - lo_size < MIN_WORRYSOME_DIFFERENCE {
        return false;
    }
    if (hi_size as f64) < lo_size as f64 * MAX_BLOAT {
        return false;
    }
    true
}

// If more than one matched pair is a DEX file, drop all DEX pairs: MultiDex
// moves content across file boundaries, which defeats per-element patching
// and can produce patches larger than naive ones.
fn trim_matches(matches: &mut Vec<ElementMatch>) {
    let num_dex =
        matches.iter().filter(|m| m.exe_type() == ExecutableType::Dex).count();
    if num_dex > 1 {
        warn!("Found {num_dex} DEX: Ignoring all.");
        matches.retain(|m| m.exe_type() != ExecutableType::Dex);
    }
}

/// Matches elements by 2-byte-histogram distance, with identical-match
/// skipping and statistical outlier rejection.
#[derive(Default)]
pub struct HeuristicEnsembleMatcher {
    matches: Vec<ElementMatch>,
    num_identical: usize,
}

impl HeuristicEnsembleMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnsembleMatcher for HeuristicEnsembleMatcher {
    fn run_match(&mut self, old_image: &[u8], new_image: &[u8]) -> bool {
        debug_assert!(self.matches.is_empty());
        info!("Start matching.");

        let Some(old_elements) = find_embedded_elements(old_image, "Old file") else {
            return false;
        };
        let Some(new_elements) = find_embedded_elements(new_image, "New file") else {
            return false;
        };

        // For each new element, find the nearest old element by histogram
        // distance. Outcomes per new element: type mismatch or unsafe size
        // difference exclude a pair; an identical match is trivial and
        // skipped; otherwise the minimum-distance pair is kept.
        struct MatchCandidate {
            iold: usize,
            inew: usize,
            dist: f64,
        }
        let mut results: Vec<MatchCandidate> = Vec::new();

        // Precompute "old" histograms, since they get reused.
        let mut old_histograms = Vec::with_capacity(old_elements.len());
        for old_element in &old_elements {
            let mut histogram = BinaryDataHistogram::new();
            // Detection imposes a minimal element size, so this holds.
            let computed =
                histogram.compute(old_element.region.slice(old_image).unwrap_or(&[]));
            debug_assert!(computed);
            old_histograms.push(histogram);
        }

        for (inew, new_element) in new_elements.iter().enumerate() {
            let new_sub_image = match new_element.region.slice(new_image) {
                Some(slice) => slice,
                None => continue,
            };
            let mut new_histogram = BinaryDataHistogram::new();
            let computed = new_histogram.compute(new_sub_image);
            debug_assert!(computed);

            let mut best_dist = f64::INFINITY;
            let mut best_iold = None;
            let mut is_identical = false;

            for (iold, old_element) in old_elements.iter().enumerate() {
                if old_element.exe_type != new_element.exe_type {
                    continue;
                }
                if unsafe_difference(old_element, new_element) {
                    continue;
                }
                let dist = old_histograms[iold].distance(&new_histogram);
                // Tie resolution: first-come, first-served.
                if best_dist > dist {
                    best_iold = Some(iold);
                    best_dist = dist;
                    if best_dist == 0.0 {
                        let old_sub_image =
                            old_element.region.slice(old_image).unwrap_or(&[]);
                        if old_sub_image == new_sub_image {
                            is_identical = true;
                            break;
                        }
                    }
                }
            }

            if let Some(best_iold) = best_iold {
                if is_identical {
                    self.num_identical += 1;
                    info!(
                        "Skipped old ({}) - identical to new ({})",
                        old_elements[best_iold].exe_type, new_element.exe_type
                    );
                } else {
                    results.push(MatchCandidate { iold: best_iold, inew, dist: best_dist });
                    info!(
                        "Matched old {:X} +{:X} to new {:X} +{:X} --> {best_dist:.5}",
                        old_elements[best_iold].region.offset,
                        old_elements[best_iold].region.size,
                        new_element.region.offset,
                        new_element.region.size,
                    );
                }
            }
        }

        // Compute statistics over the distances and reject outliers, to
        // reduce the chance of false-positive matches.
        if !results.is_empty() {
            let mut detector = OutlierDetector::new();
            for result in &results {
                if result.dist > 0.0 {
                    detector.add(result.dist);
                }
            }
            detector.prepare();
            info!("Best dists: {}", detector.render_stats());
            for result in &results {
                if detector.decide_outlier(result.dist) > 0 {
                    info!("Rejected outlier match (dist = {:.5})", result.dist);
                } else {
                    self.matches.push(ElementMatch {
                        old_element: old_elements[result.iold],
                        new_element: new_elements[result.inew],
                    });
                }
            }
        }

        trim_matches(&mut self.matches);
        true
    }

    fn matches(&self) -> &[ElementMatch] {
        &self.matches
    }

    fn num_identical(&self) -> usize {
        self.num_identical
    }
}

/// Failure modes of the imposed-match parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImposedMatchError {
    ParseError,
    OutOfBound,
    OverlapInNew,
    TypeMismatch,
}

/// Result of parsing an imposed-match string.
#[derive(Default)]
pub struct ImposedMatchParser {
    num_identical: usize,
    matches: Vec<ElementMatch>,
    // "Forgiven" bad matches, so callers may impose matches over
    // unsupported image types (which are simply ignored).
    bad_matches: Vec<ElementMatch>,
}

impl ImposedMatchParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `imposed_matches`, formatted as `"#+#=#+#,#+#=#+#,..."`
    /// where each tuple holds the offset and size in "old", then the offset
    /// and size in "new", as decimal unsigned integers. Performs bounds
    /// checks against the images, rejects overlaps in "new", detects the
    /// executable type of each sub-image, drops identical and unknown-type
    /// pairs, and errors on type conflicts.
    pub fn parse(
        &mut self,
        imposed_matches: &str,
        old_image: &[u8],
        new_image: &[u8],
    ) -> Result<(), ImposedMatchError> {
        debug_assert!(self.matches.is_empty());
        debug_assert!(self.bad_matches.is_empty());

        for tuple in imposed_matches.split(',') {
            let (old_part, new_part) =
                tuple.split_once('=').ok_or(ImposedMatchError::ParseError)?;
            let parse_pair = |part: &str| -> Result<(usize, usize), ImposedMatchError> {
                let (offset, size) =
                    part.split_once('+').ok_or(ImposedMatchError::ParseError)?;
                // Strict decimal: no signs, no blanks, no empties.
                let offset = parse_strict_usize(offset)?;
                let size = parse_strict_usize(size)?;
                Ok((offset, size))
            };
            let (old_offset, old_size) = parse_pair(old_part)?;
            let (new_offset, new_size) = parse_pair(new_part)?;
            if old_size == 0
                || new_size == 0
                || !BufferRegion::new(old_offset, old_size).fits_in(old_image.len())
                || !BufferRegion::new(new_offset, new_size).fits_in(new_image.len())
            {
                return Err(ImposedMatchError::OutOfBound);
            }
            // Types are assigned below, after detection.
            self.matches.push(ElementMatch {
                old_element: Element::raw(BufferRegion::new(old_offset, old_size)),
                new_element: Element::raw(BufferRegion::new(new_offset, new_size)),
            });
        }

        // Sort by "new" offsets; this simplifies the overlap check.
        self.matches.sort_by_key(|m| m.new_element.region.offset);
        for pair in self.matches.windows(2) {
            if pair[0].new_element.region.hi() > pair[1].new_element.region.lo() {
                return Err(ImposedMatchError::OverlapInNew);
            }
        }

        // Detect types and verify consistency; remove identical matches and
        // matches where either sub-image has an unknown type.
        let mut kept = Vec::with_capacity(self.matches.len());
        for mut element_match in self.matches.drain(..) {
            let old_sub_image =
                element_match.old_element.region.slice(old_image).unwrap_or(&[]);
            let new_sub_image =
                element_match.new_element.region.slice(new_image).unwrap_or(&[]);
            if old_sub_image == new_sub_image {
                self.num_identical += 1;
                continue;
            }
            let old_element = detect_element(old_sub_image);
            let new_element = detect_element(new_sub_image);
            match (old_element, new_element) {
                (Some(old_element), Some(new_element)) => {
                    if old_element.exe_type != new_element.exe_type {
                        // Known but inconsistent types are an error.
                        return Err(ImposedMatchError::TypeMismatch);
                    }
                    element_match.old_element.exe_type = old_element.exe_type;
                    element_match.new_element.exe_type = new_element.exe_type;
                    kept.push(element_match);
                }
                _ => {
                    // Unknown types (including mixed with known) are
                    // skipped, not fatal.
                    self.bad_matches.push(element_match);
                }
            }
        }
        self.matches = kept;
        Ok(())
    }

    #[must_use]
    pub fn num_identical(&self) -> usize {
        self.num_identical
    }

    #[must_use]
    pub fn matches(&self) -> &[ElementMatch] {
        &self.matches
    }

    #[must_use]
    pub fn bad_matches(&self) -> &[ElementMatch] {
        &self.bad_matches
    }
}

fn parse_strict_usize(text: &str) -> Result<usize, ImposedMatchError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ImposedMatchError::ParseError);
    }
    text.parse().map_err(|_| ImposedMatchError::ParseError)
}

/// An ensemble matcher that obeys an imposed match string instead of the
/// heuristics.
pub struct ImposedEnsembleMatcher {
    imposed_matches: String,
    matches: Vec<ElementMatch>,
    num_identical: usize,
}

impl ImposedEnsembleMatcher {
    #[must_use]
    pub fn new(imposed_matches: &str) -> Self {
        Self { imposed_matches: imposed_matches.to_owned(), matches: Vec::new(), num_identical: 0 }
    }
}

impl EnsembleMatcher for ImposedEnsembleMatcher {
    fn run_match(&mut self, old_image: &[u8], new_image: &[u8]) -> bool {
        debug_assert!(self.matches.is_empty());
        info!("Start matching.");
        let mut parser = ImposedMatchParser::new();
        let result = parser.parse(&self.imposed_matches, old_image, new_image);
        for bad_match in parser.bad_matches() {
            warn!("Skipped match with unknown type: {bad_match}");
        }
        if let Err(error) = result {
            log::error!("Imposed match failed: {error:?}.");
            return false;
        }
        self.num_identical = parser.num_identical();
        self.matches = parser.matches().to_vec();
        trim_matches(&mut self.matches);
        true
    }

    fn matches(&self) -> &[ElementMatch] {
        &self.matches
    }

    fn num_identical(&self) -> usize {
        self.num_identical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imposed_parser_accepts_well_formed_strings() {
        let old_image = vec![1u8; 100];
        let new_image = vec![2u8; 100];
        let mut parser = ImposedMatchParser::new();
        // Sub-images differ but are not executables: forgiven, not fatal.
        assert_eq!(parser.parse("0+10=0+20,40+20=30+20", &old_image, &new_image), Ok(()));
        assert_eq!(parser.matches().len(), 0);
        assert_eq!(parser.bad_matches().len(), 2);
    }

    #[test]
    fn imposed_parser_counts_identical() {
        let image = vec![7u8; 64];
        let mut parser = ImposedMatchParser::new();
        assert_eq!(parser.parse("0+16=0+16", &image, &image), Ok(()));
        assert_eq!(parser.num_identical(), 1);
        assert!(parser.matches().is_empty());
    }

    #[test]
    fn imposed_parser_rejects_malformed_strings() {
        let image = vec![0u8; 50];
        for bad in ["", "1+2=3", "1+2=3+4x", "1+2=3+4,", "a+2=3+4", "1 +2=3+4", "-1+2=3+4"] {
            let mut parser = ImposedMatchParser::new();
            assert_eq!(
                parser.parse(bad, &image, &image),
                Err(ImposedMatchError::ParseError),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn imposed_parser_rejects_out_of_bounds() {
        // Scenario: "0+100=0+100" against 50-byte images must never pass.
        let image = vec![0u8; 50];
        let mut parser = ImposedMatchParser::new();
        assert_eq!(
            parser.parse("0+100=0+100", &image, &image),
            Err(ImposedMatchError::OutOfBound)
        );
        let mut parser = ImposedMatchParser::new();
        assert_eq!(
            parser.parse("0+0=0+10", &image, &image),
            Err(ImposedMatchError::OutOfBound)
        );
    }

    #[test]
    fn imposed_parser_rejects_new_overlap() {
        let old_image = vec![1u8; 100];
        let new_image = vec![2u8; 100];
        let mut parser = ImposedMatchParser::new();
        assert_eq!(
            parser.parse("0+10=0+20,50+10=10+20", &old_image, &new_image),
            Err(ImposedMatchError::OverlapInNew)
        );
    }

    #[test]
    fn heuristic_matcher_pairs_embedded_executables() {
        // Old and new archives each hold one PE, slightly shifted.
        let pe = crate::testing::build_pe32();
        let mut old_archive = vec![0x11u8; 0x10];
        old_archive.extend_from_slice(&pe);
        let mut new_archive = vec![0x22u8; 0x30];
        let mut new_pe = pe.clone();
        new_pe[0x450] ^= 0xFF; // Avoid the identical-match path.
        new_archive.extend_from_slice(&new_pe);

        let mut matcher = HeuristicEnsembleMatcher::new();
        assert!(matcher.run_match(&old_archive, &new_archive));
        assert_eq!(matcher.matches().len(), 1);
        let element_match = &matcher.matches()[0];
        assert_eq!(element_match.old_element.region.offset, 0x10);
        assert_eq!(element_match.new_element.region.offset, 0x30);
        assert_eq!(element_match.exe_type(), ExecutableType::Win32X86);
        assert_eq!(matcher.num_identical(), 0);
    }

    #[test]
    fn heuristic_matcher_skips_identical_elements() {
        let pe = crate::testing::build_pe32();
        let mut archive = vec![0u8; 8];
        archive.extend_from_slice(&pe);

        let mut matcher = HeuristicEnsembleMatcher::new();
        assert!(matcher.run_match(&archive, &archive));
        assert!(matcher.matches().is_empty());
        assert_eq!(matcher.num_identical(), 1);
    }

}
