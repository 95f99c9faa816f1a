//! TFM Music Maker run-length coding.
//!
//! `0x80` followed by anything but another `0x80` starts a run: a length in
//! 7-bit groups, least significant first, the last group flagged with bit
//! 7. The run repeats the byte written just before the marker until that
//! byte appears `length` times in a row. `0x80 0x80` is a literal `0x80`.

use super::Sink;

const MARKER: u8 = 0x80;

pub fn decompress(src: &[u8], dst: &mut [u8]) -> usize {
    let mut out = Sink::new(dst);
    let mut prev = 0u8;
    let mut i = 0;
    while let Some(&b) = src.get(i) {
        i += 1;
        if b != MARKER || src.get(i).is_none() {
            if !out.push(b) {
                break;
            }
            prev = b;
            continue;
        }
        if src[i] == MARKER {
            i += 1;
            if !out.push(MARKER) {
                break;
            }
            prev = MARKER;
            continue;
        }
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let Some(&group) = src.get(i) else { return out.written() };
            i += 1;
            len |= usize::from(group & 0x7F) << shift;
            shift += 7;
            if group & 0x80 != 0 {
                break;
            }
            if shift > 28 {
                return out.written();
            }
        }
        for _ in 1..len {
            if !out.push(prev) {
                return out.written();
            }
        }
    }
    out.written()
}
