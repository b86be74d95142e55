//! Diagnostic operations for tooling: reference listings, element
//! detection, and match inspection. Output is rendered into a string so the
//! CLI can print it.

use core::fmt::Write as _;

use marrow_core::buffer::BufferRegion;
use marrow_disasm::prelude::*;
use marrow_image::types::ElementMatch;

use crate::matcher::{EnsembleMatcher, HeuristicEnsembleMatcher, ImposedEnsembleMatcher};
use crate::Status;

/// Prints stats on the references found in `image`; with `do_dump`, also
/// prints every reference's location and target.
pub fn read_references(image: &[u8], do_dump: bool, out: &mut String) -> Status {
    let Some(disasm) = make_disassembler(image) else {
        let _ = writeln!(out, "Input file not recognized as executable.");
        return Status::InvalidOldImage;
    };

    for traits in disasm.reference_groups() {
        let mut locations = Vec::new();
        let mut targets = Vec::new();
        {
            let mut reader =
                disasm.make_reader(traits.type_tag, image, 0, image.len() as u32);
            while let Some(reference) = reader.next_ref() {
                locations.push(reference.location);
                targets.push(reference.target);
            }
        }
        let num_locations = locations.len();
        targets.sort_unstable();
        targets.dedup();
        let num_targets = targets.len();

        let _ = write!(
            out,
            "Type {}: Pool={}, width={}, #locations={}, #targets={}",
            traits.type_tag.value(),
            traits.pool_tag.value(),
            traits.width,
            num_locations,
            num_targets
        );
        if num_targets > 0 {
            let _ = write!(out, " (ratio={:.4})", num_locations as f64 / num_targets as f64);
        }
        let _ = writeln!(out);

        if do_dump {
            let mut reader =
                disasm.make_reader(traits.type_tag, image, 0, image.len() as u32);
            while let Some(reference) = reader.next_ref() {
                let _ = writeln!(out, "  {:08X} {:08X}", reference.location, reference.target);
            }
        }
    }
    Status::Success
}

/// Prints the regions and types of all executables detected in `image`,
/// and appends their regions to `sub_region_list`.
pub fn detect_all(
    image: &[u8],
    out: &mut String,
    sub_region_list: &mut Vec<BufferRegion>,
) -> Status {
    sub_region_list.clear();

    let size = image.len();
    let mut last_out_pos = 0usize;
    let mut total_bytes_found = 0usize;

    let print_range = |out: &mut String, pos: usize, size: usize, message: &str| {
        let _ = writeln!(out, "-- {pos:08X} +{size:08X}: {message}");
    };

    for element in ElementFinder::new(image) {
        let pos = element.region.lo();
        let prog_size = element.region.size;
        if last_out_pos < pos {
            print_range(out, last_out_pos, pos - last_out_pos, "?");
        }
        let description = make_disassembler(&image[pos..pos + prog_size])
            .map_or("(unknown)", |disasm| disasm.description());
        print_range(out, pos, prog_size, description);
        sub_region_list.push(element.region);
        total_bytes_found += prog_size;
        last_out_pos = pos + prog_size;
    }
    if last_out_pos < size {
        print_range(out, last_out_pos, size - last_out_pos, "?");
    }
    let _ = writeln!(out);

    // Summary, in decimal.
    let percent = if size > 0 { total_bytes_found as f64 * 100.0 / size as f64 } else { 0.0 };
    let _ = writeln!(out, "Detected {total_bytes_found}/{size} bytes => {percent:.2}%.");

    Status::Success
}

/// Runs element matching between two archives and prints the resulting
/// matches in impose-string form. `imposed_matches`, if non-empty, encodes
/// custom matching that overrides the heuristics.
pub fn match_all(
    old_image: &[u8],
    new_image: &[u8],
    imposed_matches: &str,
    out: &mut String,
) -> Status {
    let mut heuristic;
    let mut imposed;
    let matcher: &mut dyn EnsembleMatcher = if imposed_matches.is_empty() {
        heuristic = HeuristicEnsembleMatcher::new();
        &mut heuristic
    } else {
        imposed = ImposedEnsembleMatcher::new(imposed_matches);
        &mut imposed
    };
    if !matcher.run_match(old_image, new_image) {
        let _ = writeln!(out, "Matching failed.");
        return Status::Fatal;
    }
    let _ = writeln!(
        out,
        "Found {} nontrivial matches and {} identical matches.",
        matcher.matches().len(),
        matcher.num_identical()
    );
    let _ = writeln!(out, "To impose the same matches by command line, use:");
    let impose_string = matcher
        .matches()
        .iter()
        .map(ElementMatch::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(out, "  --impose={impose_string}");

    Status::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_references_reports_counts() {
        let image = crate::testing::build_pe32();
        let mut out = String::new();
        assert_eq!(read_references(&image, true, &mut out), Status::Success);
        assert!(out.contains("Type 0"));
        assert!(out.contains("#locations=1"));
        // The dump contains the rel32 reference.
        assert!(out.contains("00000401 00000415"), "{out}");
    }

    #[test]
    fn read_references_rejects_raw_data() {
        let mut out = String::new();
        assert_eq!(read_references(&[0u8; 64], false, &mut out), Status::InvalidOldImage);
    }

    #[test]
    fn detect_all_lists_regions() {
        let pe = crate::testing::build_pe32();
        let mut archive = vec![0u8; 0x10];
        archive.extend_from_slice(&pe);
        let mut out = String::new();
        let mut regions = Vec::new();
        assert_eq!(detect_all(&archive, &mut out, &mut regions), Status::Success);
        assert_eq!(regions, vec![BufferRegion::new(0x10, pe.len())]);
        assert!(out.contains("Windows PE x86"), "{out}");
    }

    #[test]
    fn match_all_prints_impose_string() {
        let pe = crate::testing::build_pe32();
        let mut old_archive = vec![0u8; 0x10];
        old_archive.extend_from_slice(&pe);
        let mut new_archive = vec![0u8; 0x20];
        let mut new_pe = pe;
        new_pe[0x450] ^= 0x5A;
        new_archive.extend_from_slice(&new_pe);

        let mut out = String::new();
        assert_eq!(match_all(&old_archive, &new_archive, "", &mut out), Status::Success);
        assert!(out.contains("--impose=16+1536=32+1536"), "{out}");
    }
}
