//! End-to-end generate/apply round trips over raw data, executables, and
//! archives with embedded executables.

use marrow_core::buffer::{write_u16_le, write_u32_le};
use marrow_engine::apply::apply_buffer;
use marrow_engine::gen::{generate_buffer, generate_buffer_imposed, generate_buffer_raw};
use marrow_engine::Status;
use marrow_patch::reader::EnsemblePatchReader;
use marrow_patch::writer::EnsemblePatchWriter;

// A minimal PE32 with .text (RVA 0x1000, file 0x400..0x500) and .reloc
// (RVA 0x2000, file 0x500..0x600), carrying one reloc, one abs32, and one
// rel32 reference.
fn build_pe32() -> Vec<u8> {
    let mut image = vec![0u8; 0x600];
    image[0] = b'M';
    image[1] = b'Z';
    write_u32_le(&mut image, 0x3C, 0x40);
    image[0x40] = b'P';
    image[0x41] = b'E';
    write_u16_le(&mut image, 0x44, 0x014C);
    write_u16_le(&mut image, 0x46, 2);
    write_u16_le(&mut image, 0x54, 0xE0);
    write_u16_le(&mut image, 0x58, 0x10B);
    write_u32_le(&mut image, 0x58 + 0x1C, 0x0040_0000);
    write_u32_le(&mut image, 0x58 + 0x38, 0x3000);
    write_u32_le(&mut image, 0x58 + 0x5C, 16);
    write_u32_le(&mut image, 0x58 + 0x60 + 5 * 8, 0x2000);
    write_u32_le(&mut image, 0x58 + 0x60 + 5 * 8 + 4, 12);
    let text = 0x138;
    image[text..text + 5].copy_from_slice(b".text");
    write_u32_le(&mut image, text + 8, 0x100);
    write_u32_le(&mut image, text + 12, 0x1000);
    write_u32_le(&mut image, text + 16, 0x100);
    write_u32_le(&mut image, text + 20, 0x400);
    write_u32_le(&mut image, text + 36, 0x6000_0020);
    let reloc = 0x160;
    image[reloc..reloc + 6].copy_from_slice(b".reloc");
    write_u32_le(&mut image, reloc + 8, 0x100);
    write_u32_le(&mut image, reloc + 12, 0x2000);
    write_u32_le(&mut image, reloc + 16, 0x100);
    write_u32_le(&mut image, reloc + 20, 0x500);
    write_u32_le(&mut image, reloc + 36, 0x4000_0040);
    image[0x400] = 0xE8;
    write_u32_le(&mut image, 0x401, 0x10); // rel32 -> RVA 0x1015.
    write_u32_le(&mut image, 0x410, 0x0040_1020); // abs32 -> RVA 0x1020.
    write_u32_le(&mut image, 0x500, 0x1000);
    write_u32_le(&mut image, 0x504, 12);
    write_u16_le(&mut image, 0x508, 0x3010);
    write_u16_le(&mut image, 0x50A, 0x0000);
    image
}

fn deterministic_bytes(len: usize, mut state: u32) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

fn apply_patch_bytes(old_image: &[u8], patch_bytes: &[u8]) -> (Status, Vec<u8>) {
    let patch = EnsemblePatchReader::from_bytes(patch_bytes).expect("well-formed patch");
    let mut new_image = vec![0u8; patch.header().new_size.get() as usize];
    let status = apply_buffer(old_image, &patch, &mut new_image);
    (status, new_image)
}

#[test]
fn raw_round_trip_tiny() {
    let old_image = vec![0x00u8, 0x01, 0x02, 0x03, 0x04];
    let new_image = vec![0x00u8, 0xFF, 0x02, 0x03, 0x04, 0x05];

    let mut writer = EnsemblePatchWriter::new(&old_image, &new_image);
    assert_eq!(generate_buffer_raw(&old_image, &new_image, &mut writer), Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();
    // Tiny inputs produce a patch dominated by fixed framing.
    assert!(patch_bytes.len() <= 96, "patch size = {}", patch_bytes.len());

    let (status, applied) = apply_patch_bytes(&old_image, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_image);
}

#[test]
fn raw_round_trip_identical_images() {
    let image = deterministic_bytes(1024, 0xC0FF_EE01);

    let mut writer = EnsemblePatchWriter::new(&image, &image);
    assert_eq!(generate_buffer_raw(&image, &image, &mut writer), Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();
    // A no-op patch is far smaller than the image.
    assert!(patch_bytes.len() < 300, "patch size = {}", patch_bytes.len());

    let (status, applied) = apply_patch_bytes(&image, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, image);
}

#[test]
fn raw_round_trip_shifted_and_edited() {
    let old_image = deterministic_bytes(2048, 7);
    // New image: a prefix insertion, a large copied chunk, and some edits.
    let mut new_image = vec![0xABu8; 11];
    new_image.extend_from_slice(&old_image[..1500]);
    new_image.extend_from_slice(&old_image[1800..]);
    new_image[600] ^= 0x42;
    new_image[601] = new_image[601].wrapping_add(1);

    let mut writer = EnsemblePatchWriter::new(&old_image, &new_image);
    assert_eq!(generate_buffer_raw(&old_image, &new_image, &mut writer), Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();
    assert!(patch_bytes.len() < new_image.len(), "patch size = {}", patch_bytes.len());

    let (status, applied) = apply_patch_bytes(&old_image, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_image);
}

#[test]
fn crc_gate_rejects_corrupted_old_image() {
    let old_image = deterministic_bytes(512, 99);
    let new_image = deterministic_bytes(512, 100);

    let mut writer = EnsemblePatchWriter::new(&old_image, &new_image);
    assert_eq!(generate_buffer_raw(&old_image, &new_image, &mut writer), Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();

    let mut corrupted = old_image.clone();
    corrupted[100] ^= 1;
    let patch = EnsemblePatchReader::from_bytes(&patch_bytes).unwrap();
    let mut out = vec![0u8; patch.header().new_size.get() as usize];
    assert_eq!(apply_buffer(&corrupted, &patch, &mut out), Status::InvalidOldImage);

    // The pristine old image still applies.
    let (status, applied) = apply_patch_bytes(&old_image, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_image);
}

#[test]
fn imposed_out_of_bounds_falls_back_without_corruption() {
    // Imposing "0+100=0+100" against 50-byte images must never corrupt:
    // matching fails and generation falls back to a raw patch.
    let old_image = deterministic_bytes(50, 1);
    let new_image = deterministic_bytes(50, 2);

    let mut writer = EnsemblePatchWriter::new(&old_image, &new_image);
    let status = generate_buffer_imposed(&old_image, &new_image, "0+100=0+100", &mut writer);
    assert_eq!(status, Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();

    let (status, applied) = apply_patch_bytes(&old_image, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_image);
}

#[test]
fn executable_round_trip_with_reference_changes() {
    let old_image = build_pe32();
    let mut new_image = build_pe32();
    // Shift all three reference targets and edit a raw code byte.
    write_u32_le(&mut new_image, 0x401, 0x20); // rel32 -> RVA 0x1025.
    write_u32_le(&mut new_image, 0x410, 0x0040_1024); // abs32 -> RVA 0x1024.
    new_image[0x450] = 0x77;

    let mut writer = EnsemblePatchWriter::new(&old_image, &new_image);
    assert_eq!(generate_buffer(&old_image, &new_image, &mut writer), Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();

    let (status, applied) = apply_patch_bytes(&old_image, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_image);
}

#[test]
fn identity_executable_patch_is_small() {
    let image = build_pe32();

    let mut writer = EnsemblePatchWriter::new(&image, &image);
    assert_eq!(generate_buffer(&image, &image, &mut writer), Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();
    assert!(
        patch_bytes.len() < image.len() / 4,
        "patch size = {} for image size {}",
        patch_bytes.len(),
        image.len()
    );

    let (status, applied) = apply_patch_bytes(&image, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, image);
}

#[test]
fn archive_round_trip_with_embedded_executable() {
    // Archives: raw padding around an embedded PE that changes between old
    // and new, plus trailing data that also changes.
    let pe = build_pe32();
    let mut old_archive = vec![0x11u8; 0x20];
    old_archive.extend_from_slice(&pe);
    old_archive.extend_from_slice(&deterministic_bytes(0x40, 5));

    let mut new_pe = pe.clone();
    write_u32_le(&mut new_pe, 0x401, 0x20);
    new_pe[0x455] = 0x66;
    let mut new_archive = vec![0x22u8; 0x18];
    new_archive.extend_from_slice(&new_pe);
    new_archive.extend_from_slice(&deterministic_bytes(0x48, 6));

    let mut writer = EnsemblePatchWriter::new(&old_archive, &new_archive);
    assert_eq!(generate_buffer(&old_archive, &new_archive, &mut writer), Status::Success);
    let patch_bytes = writer.to_bytes().unwrap();

    let (status, applied) = apply_patch_bytes(&old_archive, &patch_bytes);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_archive);
}

#[test]
fn imposed_match_round_trip_agrees_with_heuristic() {
    let pe = build_pe32();
    let mut old_archive = vec![0x11u8; 0x10];
    old_archive.extend_from_slice(&pe);

    let mut new_pe = pe.clone();
    write_u32_le(&mut new_pe, 0x410, 0x0040_1030);
    let mut new_archive = vec![0x22u8; 0x20];
    new_archive.extend_from_slice(&new_pe);

    // Impose exactly the match the heuristic would find.
    let impose = format!("16+{}=32+{}", pe.len(), pe.len());
    let mut imposed_writer = EnsemblePatchWriter::new(&old_archive, &new_archive);
    assert_eq!(
        generate_buffer_imposed(&old_archive, &new_archive, &impose, &mut imposed_writer),
        Status::Success
    );
    let imposed_patch = imposed_writer.to_bytes().unwrap();
    let (status, applied) = apply_patch_bytes(&old_archive, &imposed_patch);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_archive);

    let mut heuristic_writer = EnsemblePatchWriter::new(&old_archive, &new_archive);
    assert_eq!(generate_buffer(&old_archive, &new_archive, &mut heuristic_writer), Status::Success);
    let heuristic_patch = heuristic_writer.to_bytes().unwrap();
    let (status, applied) = apply_patch_bytes(&old_archive, &heuristic_patch);
    assert_eq!(status, Status::Success);
    assert_eq!(applied, new_archive);
}
