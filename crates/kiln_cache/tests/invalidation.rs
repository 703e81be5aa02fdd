mod common;

use common::*;
use kiln_cache::format::{CacheHeader, HEADER_SIZE};
use kiln_cache::reader::{CACHE_ABSENT, CACHE_CHECKSUM_MISMATCH};
use kiln_cache::{CacheReader, KernelOrigin, LoadStage, MissReason};
use kiln_diagnostics::{DiagnosticSink, Severity};
use std::fs;

fn prime(base: usize, dir: &std::path::Path) -> kiln_cache::KernelCache {
    let cache = cache(base, dir, toggles());
    let sink = DiagnosticSink::new();
    drop(
        cache
            .load_or_compile(&request(b"v1"), &mut FakeBackend::new(), &sink)
            .unwrap(),
    );
    cache
}

fn load_miss(cache: &kiln_cache::KernelCache) -> kiln_cache::Miss {
    let request = request(b"v1");
    let deps = cache.dependencies(&request);
    CacheReader::new(cache.slots(), &deps)
        .load(&cache.paths(&request.name))
        .miss()
        .cloned()
        .expect("expected a miss")
}

#[test]
fn missing_files_are_a_quiet_miss() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(0x5f10_0000_0000, dir.path(), toggles());
    let sink = DiagnosticSink::new();
    let kernel = cache
        .load_or_compile(&request(b"v1"), &mut FakeBackend::new(), &sink)
        .unwrap();
    assert_eq!(kernel.origin, KernelOrigin::Compiled { persisted: true });
    let diags = sink.take_all();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].code, CACHE_ABSENT);
    assert_eq!(diags[0].severity, Severity::Info);
}

#[test]
fn tampered_image_fails_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let cache = prime(0x5f20_0000_0000, dir.path());
    let object = cache.paths("blur").object;
    let mut image = fs::read(&object).unwrap();
    image[100] ^= 0x40;
    fs::write(&object, &image).unwrap();

    let miss = load_miss(&cache);
    assert_eq!(miss.stage, LoadStage::ChecksumValidated);
    assert_eq!(miss.reason, MissReason::ChecksumMismatch);
    assert_eq!(miss.to_diagnostic().code, CACHE_CHECKSUM_MISMATCH);
    // The rejected mapping is released.
    assert_eq!(cache.slots().occupied_count(), 0);
}

#[test]
fn tampered_data_area_fails_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let cache = prime(0x5f30_0000_0000, dir.path());
    let object = cache.paths("blur").object;
    let mut image = fs::read(&object).unwrap();
    let last = image.len() - 1;
    image[last] = 0xFF;
    fs::write(&object, &image).unwrap();
    assert_eq!(load_miss(&cache).stage, LoadStage::ChecksumValidated);
}

#[test]
fn header_byte_changes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = prime(0x5f40_0000_0000, dir.path());
    let info = cache.paths("blur").info;
    let pristine = fs::read(&info).unwrap();

    // Magic, version, endianness, and each word size.
    for offset in [0, 3, 8, 10, 12, 13, 14, 15] {
        let mut bytes = pristine.clone();
        bytes[offset] ^= 0x01;
        fs::write(&info, &bytes).unwrap();
        let miss = load_miss(&cache);
        assert_eq!(miss.stage, LoadStage::HeaderValidated, "offset {offset}");
    }

    fs::write(&info, &pristine[..HEADER_SIZE - 1]).unwrap();
    assert_eq!(load_miss(&cache).reason, MissReason::FileTooSmall);
}

#[test]
fn relocated_address_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = prime(0x5f50_0000_0000, dir.path());
    let info = cache.paths("blur").info;
    let mut bytes = fs::read(&info).unwrap();
    let mut reader = kiln_cache::format::ByteReader::new(&bytes);
    let header = CacheHeader::decode(&mut reader).unwrap();
    // Shift down by a page so the function table still lies inside the image.
    let moved = header.artifact_address - 0x1000;
    bytes[16..24].copy_from_slice(&moved.to_ne_bytes());
    fs::write(&info, &bytes).unwrap();

    let miss = load_miss(&cache);
    assert_eq!(miss.stage, LoadStage::Mapped);
    assert_eq!(miss.reason, MissReason::NotSlotAddress(moved));
}

#[test]
fn truncated_object_is_not_mapped() {
    let dir = tempfile::tempdir().unwrap();
    let cache = prime(0x5f60_0000_0000, dir.path());
    let object = cache.paths("blur").object;
    let image = fs::read(&object).unwrap();
    fs::write(&object, &image[..image.len() / 2]).unwrap();

    let miss = load_miss(&cache);
    assert_eq!(miss.stage, LoadStage::Mapped);
    assert!(matches!(miss.reason, MissReason::ObjectTruncated { .. }));
    assert_eq!(cache.slots().occupied_count(), 0);
}

#[test]
fn changed_runtime_library_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = prime(0x5f70_0000_0000, dir.path());
    let request = request(b"v1");
    let mut deps = cache.dependencies(&request);
    deps[0].digest = kiln_cache::DependencyHasher::hash(b"runtime library v2");

    let outcome = CacheReader::new(cache.slots(), &deps).load(&cache.paths("blur"));
    let miss = outcome.miss().unwrap();
    assert_eq!(miss.stage, LoadStage::DependenciesValidated);
    assert!(matches!(
        &miss.reason,
        MissReason::DependencyMismatch { index: 0, field: "digest", .. }
    ));
}

#[test]
fn renamed_source_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = prime(0x5f80_0000_0000, dir.path());
    let request = request(b"v1");
    let mut deps = cache.dependencies(&request);
    deps[1].name = "sharpen.bc".into();

    let outcome = CacheReader::new(cache.slots(), &deps).load(&cache.paths("blur"));
    assert!(matches!(
        &outcome.miss().unwrap().reason,
        MissReason::DependencyMismatch { index: 1, field: "name", .. }
    ));
}
