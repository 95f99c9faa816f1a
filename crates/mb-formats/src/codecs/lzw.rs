//! Variable-width LZW (AT2 versions 2 and 6).
//!
//! Codes are packed least significant bit first. Widths start at 9 bits
//! and grow to 13; code 0x100 clears the dictionary and 0x101 ends the
//! stream. The first free dictionary slot is 0x102.

use super::Sink;

const CLEAR: u16 = 0x100;
const END: u16 = 0x101;
const FIRST: u16 = 0x102;
const MIN_BITS: u32 = 9;
const MAX_BITS: u32 = 13;
const TABLE: usize = 1 << MAX_BITS;

struct BitReader<'a> {
    src: &'a [u8],
    bitpos: usize,
}

impl BitReader<'_> {
    fn read(&mut self, bits: u32) -> Option<u16> {
        if self.bitpos + bits as usize > self.src.len() * 8 {
            return None;
        }
        let byte = self.bitpos >> 3;
        let mut window = 0u32;
        for i in 0..3 {
            if let Some(&b) = self.src.get(byte + i) {
                window |= u32::from(b) << (8 * i);
            }
        }
        let code = (window >> (self.bitpos & 7)) & ((1 << bits) - 1);
        self.bitpos += bits as usize;
        Some(code as u16)
    }
}

pub fn decompress(src: &[u8], dst: &mut [u8]) -> usize {
    let mut out = Sink::new(dst);
    let mut bits = BitReader { src, bitpos: 0 };

    let mut prefix = vec![0u16; TABLE];
    let mut suffix = vec![0u8; TABLE];
    let mut stack: Vec<u8> = Vec::with_capacity(TABLE);

    let mut width = MIN_BITS;
    let mut next = FIRST;
    let mut prev: Option<u16> = None;
    let mut first_char = 0u8;

    while !out.is_full() {
        let Some(code) = bits.read(width) else { break };
        match code {
            END => break,
            CLEAR => {
                width = MIN_BITS;
                next = FIRST;
                prev = None;
                continue;
            }
            _ => {}
        }

        let Some(last) = prev else {
            if code > 0xFF {
                break;
            }
            first_char = code as u8;
            if !out.push(first_char) {
                break;
            }
            prev = Some(code);
            continue;
        };

        // expand the code into the stack, last byte first
        stack.clear();
        let mut cur = if code < next {
            code
        } else if code == next {
            stack.push(first_char);
            last
        } else {
            break;
        };
        while cur > 0xFF {
            stack.push(suffix[usize::from(cur)]);
            cur = prefix[usize::from(cur)];
        }
        first_char = cur as u8;
        stack.push(first_char);

        while let Some(b) = stack.pop() {
            if !out.push(b) {
                return out.written();
            }
        }

        if usize::from(next) < TABLE {
            prefix[usize::from(next)] = last;
            suffix[usize::from(next)] = first_char;
            next += 1;
        }
        if u32::from(next) + 1 >= 1 << width && width < MAX_BITS {
            width += 1;
        }
        prev = Some(code);
    }
    out.written()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    struct BitWriter {
        out: Vec<u8>,
        acc: u32,
        n: u32,
    }

    impl BitWriter {
        fn put(&mut self, code: u16, bits: u32) {
            self.acc |= u32::from(code) << self.n;
            self.n += bits;
            while self.n >= 8 {
                self.out.push(self.acc as u8);
                self.acc >>= 8;
                self.n -= 8;
            }
        }

        fn finish(mut self) -> Vec<u8> {
            if self.n > 0 {
                self.out.push(self.acc as u8);
            }
            self.out
        }
    }

    /// Reference compressor: clears the dictionary when it fills up.
    pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
        let mut w = BitWriter { out: Vec::new(), acc: 0, n: 0 };
        let mut dict: HashMap<(u16, u8), u16> = HashMap::new();
        let mut width = MIN_BITS;
        let mut next = FIRST;
        let mut cur: Option<u16> = None;
        for &b in data {
            let Some(c) = cur else {
                cur = Some(u16::from(b));
                continue;
            };
            if let Some(&code) = dict.get(&(c, b)) {
                cur = Some(code);
                continue;
            }
            w.put(c, width);
            dict.insert((c, b), next);
            next += 1;
            if usize::from(next) == TABLE {
                w.put(CLEAR, width);
                dict.clear();
                width = MIN_BITS;
                next = FIRST;
            } else if u32::from(next) >= 1 << width && width < MAX_BITS {
                width += 1;
            }
            cur = Some(u16::from(b));
        }
        if let Some(c) = cur {
            w.put(c, width);
            // the decoder registers one more entry before reading END
            next += 1;
            if u32::from(next) >= 1 << width && width < MAX_BITS {
                width += 1;
            }
        }
        w.put(END, width);
        w.finish()
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut x = 0x1234_5678u32;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
                b"ABCDEFGH"[(x >> 16) as usize % 8]
            })
            .collect()
    }

    #[test]
    fn literal_codes() {
        let packed = compress(b"AT");
        let mut dst = [0u8; 4];
        assert_eq!(decompress(&packed, &mut dst), 2);
        assert_eq!(&dst[..2], b"AT");
    }

    #[test]
    fn repeated_run_uses_pending_code() {
        let data = vec![b'x'; 200];
        let packed = compress(&data);
        let mut dst = vec![0u8; 200];
        assert_eq!(decompress(&packed, &mut dst), 200);
        assert_eq!(dst, data);
    }

    #[test]
    fn round_trip_through_width_changes_and_clear() {
        let data = noise(60_000);
        let packed = compress(&data);
        let mut dst = vec![0u8; data.len()];
        assert_eq!(decompress(&packed, &mut dst), data.len());
        assert_eq!(dst, data);
    }

    #[test]
    fn undersized_destination() {
        let data = noise(4000);
        let packed = compress(&data);
        let mut dst = vec![0u8; 777];
        assert_eq!(decompress(&packed, &mut dst), 777);
        assert_eq!(&dst[..], &data[..777]);
    }

    #[test]
    fn garbage_is_not_fatal() {
        let mut dst = vec![0u8; 64];
        let _ = decompress(&[0xFF; 40], &mut dst);
        let _ = decompress(&[], &mut dst);
    }
}
