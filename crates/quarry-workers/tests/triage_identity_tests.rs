use quarry_core::report::{parser_for, ReportParser, UnifiedParser};
use quarry_workers::triage::pentuple_fingerprint;

const ASAN_OUTPUT: &str = "\
INFO: Seed: 77
==7==ERROR: AddressSanitizer: heap-use-after-free on address 0x6020000000f0 at pc 0x55ee
READ of size 8 at 0x6020000000f0 thread T0
    #0 0x55ee72 in png_read_row /src/libpng/pngread.c:42:7
    #1 0x55ee99 in LLVMFuzzerTestOneInput /src/fuzz/libpng_read_fuzzer.cc:150:3
";

/// Replaying the same message must land on the same profile identity: the
/// parsed pentuple and its fingerprint are stable across runs.
#[test]
fn replayed_output_maps_to_the_same_fingerprint() {
    let first = UnifiedParser.parse(ASAN_OUTPUT).unwrap();
    let second = parser_for(ASAN_OUTPUT).parse(ASAN_OUTPUT).unwrap();
    assert_eq!(first, second);

    let fp_a = pentuple_fingerprint("T1", "fuzz_png", "address", &first.bug_type, &first.trigger_point);
    let fp_b = pentuple_fingerprint("T1", "fuzz_png", "address", &second.bug_type, &second.trigger_point);
    assert_eq!(fp_a, fp_b);
}

/// Different sanitizers give distinct identities even for the same trigger
/// point, so one PoC can yield several profiles.
#[test]
fn sanitizer_is_part_of_the_identity() {
    let report = UnifiedParser.parse(ASAN_OUTPUT).unwrap();
    let asan = pentuple_fingerprint("T1", "fuzz_png", "address", &report.bug_type, &report.trigger_point);
    let msan = pentuple_fingerprint("T1", "fuzz_png", "memory", &report.bug_type, &report.trigger_point);
    assert_ne!(asan, msan);
}

/// The pentuple fingerprint must be usable directly as a
/// coordination-store key segment.
#[test]
fn fingerprint_is_key_safe() {
    let fp = pentuple_fingerprint(
        "T1",
        "H",
        "address",
        "AddressSanitizer: heap-use-after-free",
        "src/foo.c:42",
    );
    assert_eq!(fp.len(), 32);
    assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    let key = quarry_core::keys::triage_profile("T1", &fp);
    assert!(key.starts_with("triage:T1:"));
}
