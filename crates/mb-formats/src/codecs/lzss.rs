//! LZSS with a 4 KiB ring buffer (AT2 versions 3 and 7).
//!
//! A control byte supplies eight flags, least significant first: 1 is a
//! literal byte, 0 is a two-byte (position, length) reference into the
//! ring. Position is 12 bits (low byte plus the high nibble of the second
//! byte); the low nibble plus 3 is the copy length.

use super::Sink;

const N: usize = 4096;
const F: usize = 18;
const THRESHOLD: usize = 2;

pub fn decompress(src: &[u8], dst: &mut [u8]) -> usize {
    let mut out = Sink::new(dst);
    let mut ring = [0u8; N];
    let mut r = N - F;
    let mut input = src.iter().copied();
    let mut flags: u32 = 0;

    'outer: while !out.is_full() {
        flags >>= 1;
        if flags & 0x100 == 0 {
            let Some(c) = input.next() else { break };
            flags = u32::from(c) | 0xFF00;
        }
        if flags & 1 != 0 {
            let Some(c) = input.next() else { break };
            if !out.push(c) {
                break;
            }
            ring[r] = c;
            r = (r + 1) & (N - 1);
        } else {
            let (Some(lo), Some(hi)) = (input.next(), input.next()) else { break };
            let pos = usize::from(lo) | (usize::from(hi & 0xF0) << 4);
            let len = usize::from(hi & 0x0F) + THRESHOLD + 1;
            for k in 0..len {
                let c = ring[(pos + k) & (N - 1)];
                if !out.push(c) {
                    break 'outer;
                }
                ring[r] = c;
                r = (r + 1) & (N - 1);
            }
        }
    }
    out.written()
}
