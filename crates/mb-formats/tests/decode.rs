//! End-to-end decoding through container unwrapping and dispatch.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use mb_formats::{decode, Format, FormatError, LoadOptions};
use mb_ir::{Chip, Note};

fn sample_header(name: &[u8], words: u16, volume: u8) -> [u8; 30] {
    let mut h = [0u8; 30];
    h[..name.len()].copy_from_slice(name);
    h[22..24].copy_from_slice(&words.to_be_bytes());
    h[25] = volume;
    h[28..30].copy_from_slice(&1u16.to_be_bytes());
    h
}

/// Four-channel ProTracker module: two orders over patterns 0 and 1, a
/// C-3 on the first row of pattern 0 and an 8-byte sample.
fn protracker() -> Vec<u8> {
    let mut data = vec![0u8; 1084];
    data[..5].copy_from_slice(b"intro");
    data[20..50].copy_from_slice(&sample_header(b"piano", 4, 64));
    data[950] = 2;
    data[951] = 0x7F;
    data[952] = 0;
    data[953] = 1;
    data[1080..1084].copy_from_slice(b"M.K.");
    let mut patterns = vec![0u8; 2 * 64 * 4 * 4];
    patterns[..4].copy_from_slice(&[0x01, 0xAC, 0x10, 0x00]);
    data.extend(patterns);
    data.extend([0, 10, 20, 30, 40, 50, 60, 70]);
    data
}

/// 15-sample module with the Soundtracker restart signature and no tag.
fn soundtracker() -> Vec<u8> {
    let mut data = vec![0u8; 600];
    data[..4].copy_from_slice(b"old!");
    data[20..50].copy_from_slice(&sample_header(b"kick", 2, 40));
    data[470] = 1;
    data[471] = 0x78;
    data.extend(vec![0u8; 64 * 4 * 4]);
    data.extend([1, 2, 3, 4]);
    data
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
    z.write_all(data).unwrap();
    z.finish().unwrap()
}

#[test]
fn protracker_module_decodes() {
    let decoded = decode(protracker(), Some("intro.mod"), &LoadOptions::default()).unwrap();
    assert_eq!(decoded.format, Format::Mod);
    assert!(decoded.warnings.is_empty(), "{:?}", decoded.warnings);

    let song = &decoded.song;
    assert_eq!(song.name, "intro");
    assert_eq!(song.systems[0].chip, Chip::Amiga);
    let sub = song.main();
    assert_eq!(sub.channels.len(), 4);
    assert_eq!(sub.pat_len, 64);
    assert_eq!(sub.orders_len, 2);
    assert_eq!(sub.channels[0].orders[..2], [0, 1]);
    let first = sub.row_at(0, 0, 0).unwrap();
    assert_eq!(first.note, Note::On(108));
    assert_eq!(first.instrument, Some(0));
    assert_eq!(song.samples[0].len(), 8);
}

#[test]
fn zlib_container_is_transparent() {
    let raw = decode(protracker(), None, &LoadOptions::default()).unwrap();
    let wrapped = decode(zlib(&protracker()), None, &LoadOptions::default()).unwrap();
    assert_eq!(wrapped.format, Format::Mod);
    assert_eq!(wrapped.song, raw.song);
}

#[test]
fn soundtracker_needs_an_extension() {
    let opts = LoadOptions::default();
    assert_eq!(decode(soundtracker(), None, &opts).unwrap_err(), FormatError::Unrecognized);

    let decoded = decode(soundtracker(), Some("OLD.STK"), &opts).unwrap();
    assert_eq!(decoded.format, Format::Soundtracker);
    assert_eq!(decoded.song.samples.len(), 15);
    assert_eq!(decoded.song.main().channels.len(), 4);

    let strict = LoadOptions { trust_extension: false, ..LoadOptions::default() };
    assert_eq!(decode(soundtracker(), Some("old.stk"), &strict).unwrap_err(), FormatError::Unrecognized);
}

#[test]
fn bad_soundtracker_signature_is_rejected() {
    let mut data = soundtracker();
    data[471] = 0x10;
    let err = decode(data, Some("old.mod"), &LoadOptions::default()).unwrap_err();
    assert!(matches!(err, FormatError::InvalidHeader(_)), "{err}");
}

#[test]
fn truncation_never_panics() {
    let full = protracker();
    for cut in 0..full.len() {
        match decode(full[..cut].to_vec(), None, &LoadOptions::default()) {
            // only the sample data may be missing
            Ok(decoded) => {
                assert!(cut >= 1084 + 2 * 64 * 16);
                assert_eq!(decoded.song.main().channels.len(), 4);
            }
            Err(
                FormatError::Truncated { .. }
                | FormatError::Unrecognized
                | FormatError::InvalidHeader(_)
                | FormatError::OutOfRange { .. },
            ) => {}
        }
    }
}

#[test]
fn order_past_pattern_bound_is_out_of_range() {
    let mut data = protracker();
    data[953] = 40;
    let opts = LoadOptions { max_patterns: 16, ..LoadOptions::default() };
    let err = decode(data, None, &opts).unwrap_err();
    assert!(matches!(err, FormatError::OutOfRange { value: 40, .. }), "{err}");
    assert!(err.to_string().contains("order 1"), "{err}");
}
