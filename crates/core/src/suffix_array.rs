//! Suffix array construction over an abstract unsigned alphabet.
//!
//! The main implementation is suffix array induced sorting (SA-IS), which
//! runs in linear time and memory
//! (see <http://ieeexplore.ieee.org/abstract/document/5582081/>).
//! [`naive_suffix_sort`] is a reference implementation retained for tests.
//!
//! Terminology: given a string S of length n, suf(S,i) denotes the suffix
//! S[i..n). S is treated as terminated by an implicit sentinel smaller than
//! every character; the sentinel is never stored. A suffix is S-type if it
//! is smaller than the next suffix, L-type if larger. A character is LMS
//! (leftmost S-type) if it is S-type and its predecessor is L-type.

/// Sorts all suffixes of `text` with a plain comparison sort. O(n^2 log n)
/// worst case; only meant as a reference for testing.
#[must_use]
pub fn naive_suffix_sort(text: &[u32]) -> Vec<u32> {
    let mut suffix_array: Vec<u32> = (0..text.len() as u32).collect();
    suffix_array.sort_by(|&a, &b| text[a as usize..].cmp(&text[b as usize..]));
    suffix_array
}

/// Builds the suffix array of `text` with SA-IS. All characters must be in
/// `[0, key_bound)`.
#[must_use]
pub fn induced_suffix_sort(text: &[u32], key_bound: usize) -> Vec<u32> {
    debug_assert!(text.iter().all(|&key| (key as usize) < key_bound));
    let mut suffix_array = vec![0u32; text.len()];
    suffix_sort(text, key_bound, &mut suffix_array);
    suffix_array
}

/// Returns the number of suffixes of `text` (per `suffix_array`) that are
/// lexicographically smaller than `pattern`, i.e., the lower-bound index of
/// `pattern` in the sorted suffix list. This does not necessarily locate the
/// longest matching substring.
#[must_use]
pub fn suffix_lower_bound(suffix_array: &[u32], text: &[u32], pattern: &[u32]) -> usize {
    suffix_array.partition_point(|&i| text[i as usize..] < *pattern)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlType {
    SType,
    LType,
}
use SlType::{LType, SType};

/// Partitions every suffix by SL-type, filling `sl` back to front. Returns
/// the number of LMS suffixes.
fn build_sl_partition(text: &[u32], key_bound: usize, sl: &mut [SlType]) -> usize {
    let mut lms_count = 0;
    // Travel backward, as if prepending one character at a time: the
    // repeated-character case inherits the type seen so far.
    let mut previous_type = LType;
    let mut previous_key = key_bound; // Dummy, impossible key.
    for i in (0..text.len()).rev() {
        let current_key = text[i] as usize;
        if current_key > previous_key || previous_key == key_bound {
            if previous_type == SType {
                lms_count += 1;
            }
            previous_type = LType;
        } else if current_key < previous_key {
            previous_type = SType;
        }
        sl[i] = previous_type;
        previous_key = current_key;
    }
    lms_count
}

/// Returns the indices of LMS suffixes, in the order they appear in `text`.
fn find_lms_suffixes(sl: &[SlType], lms_count: usize) -> Vec<u32> {
    let mut lms_indices = Vec::with_capacity(lms_count);
    let mut previous_type = SType;
    for (i, &cur) in sl.iter().enumerate() {
        if cur == SType && previous_type == LType {
            lms_indices.push(i as u32);
        }
        previous_type = cur;
    }
    lms_indices
}

fn make_bucket_count(text: &[u32], key_bound: usize) -> Vec<u32> {
    let mut buckets = vec![0u32; key_bound];
    for &key in text {
        buckets[key as usize] += 1;
    }
    buckets
}

/// Writes bucket end positions (exclusive prefix sums shifted by one) into
/// `bounds`.
fn fill_bucket_ends(buckets: &[u32], bounds: &mut [u32]) {
    let mut sum = 0;
    for (bound, &count) in bounds.iter_mut().zip(buckets) {
        sum += count;
        *bound = sum;
    }
}

/// Writes bucket head positions into `bounds`.
fn fill_bucket_heads(buckets: &[u32], bounds: &mut [u32]) {
    let mut sum = 0;
    for (bound, &count) in bounds.iter_mut().zip(buckets) {
        *bound = sum;
        sum += count;
    }
}

/// Applies induced sort from `lms_indices` to `suffix_array`. Unset entries
/// are marked with `text.len()`, which is convenient for unsigned indices.
fn induced_sort(
    text: &[u32],
    sl: &[SlType],
    lms_indices: &[u32],
    buckets: &[u32],
    suffix_array: &mut [u32],
) {
    let n = text.len() as u32;
    suffix_array.fill(n);

    debug_assert!(!buckets.is_empty());
    let mut bucket_bounds = vec![0u32; buckets.len()];

    // Step 1: Place LMS suffixes at the ends of their buckets, processed
    // backward to preserve relative order.
    fill_bucket_ends(buckets, &mut bucket_bounds);
    for &lms_index in lms_indices.iter().rev() {
        let key = text[lms_index as usize] as usize;
        bucket_bounds[key] -= 1;
        suffix_array[bucket_bounds[key] as usize] = lms_index;
    }

    // Step 2: Scan forward; for each placed suf(S,i) whose predecessor is
    // L-type, place suf(S,i-1) at the head of its bucket and advance the
    // head. The implicit sentinel would sit at position 0, so the last
    // suffix is handled up front.
    fill_bucket_heads(buckets, &mut bucket_bounds);
    if sl[text.len() - 1] == LType {
        let key = text[text.len() - 1] as usize;
        suffix_array[bucket_bounds[key] as usize] = n - 1;
        bucket_bounds[key] += 1;
    }
    for it in 0..suffix_array.len() {
        let suffix_index = suffix_array[it];
        if suffix_index != n && suffix_index > 0 && sl[suffix_index as usize - 1] == LType {
            let key = text[suffix_index as usize - 1] as usize;
            suffix_array[bucket_bounds[key] as usize] = suffix_index - 1;
            bucket_bounds[key] += 1;
        }
    }

    // Step 3: Scan backward; for each placed suf(S,i) whose predecessor is
    // S-type, place suf(S,i-1) at the end of its bucket and retreat the end.
    fill_bucket_ends(buckets, &mut bucket_bounds);
    for it in (0..suffix_array.len()).rev() {
        let suffix_index = suffix_array[it];
        if suffix_index != n && suffix_index > 0 && sl[suffix_index as usize - 1] == SType {
            let key = text[suffix_index as usize - 1] as usize;
            bucket_bounds[key] -= 1;
            suffix_array[bucket_bounds[key] as usize] = suffix_index - 1;
        }
    }
    if sl[text.len() - 1] == SType {
        let key = text[text.len() - 1] as usize;
        bucket_bounds[key] -= 1;
        suffix_array[bucket_bounds[key] as usize] = n - 1;
    }
}

/// Given lexicographically ordered LMS-terminated substrings in
/// `suffix_array`, assigns a label to every unique LMS substring. Sorted
/// labels are written to `lms_str` and the corresponding LMS suffix indices
/// to `lms_indices`. Returns the number of distinct labels.
fn label_lms_substrings(
    text: &[u32],
    sl: &[SlType],
    suffix_array: &[u32],
    lms_indices: &mut [u32],
    lms_str: &mut [u32],
) -> u32 {
    let n = text.len();
    let mut label = 0u32;
    // suf(S,0) is never LMS, so 0 can mark "unset".
    let mut previous_lms = 0usize;
    let mut out = 0usize;
    for &si in suffix_array {
        let si = si as usize;
        if si > 0 && sl[si] == SType && sl[si - 1] == LType {
            let current_lms = si;
            if previous_lms != 0 {
                // Compare current against previous LMS substring; a new
                // label is needed iff they differ.
                let mut current_type = SType;
                let mut previous_type = SType;
                let mut k = 0usize;
                loop {
                    let current_end = current_lms + k >= n
                        || (current_type == LType && sl[current_lms + k] == SType);
                    let previous_end = previous_lms + k >= n
                        || (previous_type == LType && sl[previous_lms + k] == SType);
                    if current_end && previous_end {
                        break;
                    }
                    if current_end != previous_end
                        || text[current_lms + k] != text[previous_lms + k]
                    {
                        label += 1;
                        break;
                    }
                    current_type = sl[current_lms + k];
                    previous_type = sl[previous_lms + k];
                    k += 1;
                }
            }
            lms_indices[out] = si as u32;
            lms_str[out] = label;
            out += 1;
            previous_lms = current_lms;
        }
    }
    label + 1
}

/// The SA-IS algorithm. Writes the sorted suffix indices of `text` into
/// `suffix_array`, which must have the same length.
fn suffix_sort(text: &[u32], key_bound: usize, suffix_array: &mut [u32]) {
    let n = text.len();
    if n == 1 {
        suffix_array[0] = 0;
    }
    if n < 2 {
        return;
    }

    let mut sl = vec![SType; n];
    let lms_count = build_sl_partition(text, key_bound, &mut sl);
    let mut lms_indices = find_lms_suffixes(&sl, lms_count);
    let buckets = make_bucket_count(text, key_bound);

    if lms_indices.len() > 1 {
        // Induce the relative order of LMS substrings.
        induced_sort(text, &sl, &lms_indices, &buckets, suffix_array);
        let mut lms_str = vec![0u32; lms_indices.len()];

        // Map LMS substrings to labels, forming a reduced string.
        let label_count =
            label_lms_substrings(text, &sl, suffix_array, &mut lms_indices, &mut lms_str);

        if (label_count as usize) < lms_str.len() {
            // Labels are not yet unique: reorder |lms_str| to hold LMS
            // suffixes in text order, then recurse on the reduced string.
            for i in 0..lms_indices.len() {
                suffix_array[lms_indices[i] as usize] = lms_str[i];
            }
            let mut previous_type = SType;
            let mut j = 0usize;
            for i in 0..n {
                if sl[i] == SType && previous_type == LType {
                    lms_str[j] = suffix_array[i];
                    lms_indices[j] = i as u32;
                    j += 1;
                }
                previous_type = sl[i];
            }

            // The reduced string is at most half the length of |text|.
            let m = lms_str.len();
            suffix_sort(&lms_str, label_count as usize, &mut suffix_array[..m]);

            // Map labels back to indices in |text|, using |suffix_array| as
            // scratch space.
            for i in 0..m {
                suffix_array[i] = lms_indices[suffix_array[i] as usize];
            }
            lms_indices.copy_from_slice(&suffix_array[..m]);
        }
    }
    // With LMS suffixes now sorted, induce the full suffix order.
    induced_sort(text, &sl, &lms_indices, &buckets, suffix_array);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_against_naive(text: &[u32], key_bound: usize) {
        assert_eq!(induced_suffix_sort(text, key_bound), naive_suffix_sort(text), "{text:?}");
    }

    #[test]
    fn empty_and_tiny_inputs() {
        check_against_naive(&[], 256);
        check_against_naive(&[7], 256);
        check_against_naive(&[3, 3], 256);
        check_against_naive(&[1, 2], 256);
        check_against_naive(&[2, 1], 256);
    }

    #[test]
    fn classic_strings() {
        let banana: Vec<u32> = b"banana".iter().map(|&b| u32::from(b)).collect();
        assert_eq!(induced_suffix_sort(&banana, 256), vec![5, 3, 1, 0, 4, 2]);

        let missis: Vec<u32> = b"mississippi".iter().map(|&b| u32::from(b)).collect();
        check_against_naive(&missis, 256);
    }

    #[test]
    fn repeated_and_periodic_inputs() {
        check_against_naive(&[0; 16], 1);
        check_against_naive(&[5; 16], 256);
        let periodic: Vec<u32> = (0..64).map(|i| (i % 3) as u32).collect();
        check_against_naive(&periodic, 3);
    }

    #[test]
    fn wide_alphabet() {
        // Values beyond the byte range, as produced by the encoded view.
        let text = [300u32, 1, 257, 257, 300, 2, 1, 257, 90_000, 1];
        check_against_naive(&text, 90_001);
    }

    #[test]
    fn pseudo_random_inputs() {
        // Simple LCG so the test is deterministic.
        let mut state = 0x2545_F491u32;
        let mut next = || {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            state >> 24
        };
        for len in [10usize, 100, 1000] {
            let text: Vec<u32> = (0..len).map(|_| next()).collect();
            check_against_naive(&text, 256);
        }
    }

    #[test]
    fn lower_bound_finds_first_match() {
        let text: Vec<u32> = b"banana".iter().map(|&b| u32::from(b)).collect();
        let sa = induced_suffix_sort(&text, 256);
        let to_u32 = |s: &[u8]| s.iter().map(|&b| u32::from(b)).collect::<Vec<u32>>();

        // "ana" first matches at sorted position 1 ("ana" <= "ana..." suffixes).
        let pos = suffix_lower_bound(&sa, &text, &to_u32(b"ana"));
        assert_eq!(pos, 1);
        assert!(text[sa[pos] as usize..].starts_with(&to_u32(b"ana")));

        // A pattern above everything lands at the end.
        assert_eq!(suffix_lower_bound(&sa, &text, &to_u32(b"z")), sa.len());
        // The empty pattern is below everything.
        assert_eq!(suffix_lower_bound(&sa, &text, &[]), 0);
    }
}
