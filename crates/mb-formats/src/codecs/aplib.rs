//! aPLib depacker (AT2 versions 9 to 11).
//!
//! Tag bits are read most significant first from interleaved tag bytes.
//! Prefixes: `0` literal, `10` gamma-coded match, `110` short match from a
//! single byte (length 2 or 3, offset 0 ends the stream), `111` 4-bit
//! offset single byte (offset 0 writes a zero byte).

use super::Sink;

struct Bits<'a> {
    src: &'a [u8],
    pos: usize,
    tag: u8,
    count: u8,
}

impl Bits<'_> {
    fn byte(&mut self) -> Option<u8> {
        let b = *self.src.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn bit(&mut self) -> Option<u32> {
        if self.count == 0 {
            self.tag = self.byte()?;
            self.count = 8;
        }
        self.count -= 1;
        let bit = (self.tag >> 7) & 1;
        self.tag <<= 1;
        Some(u32::from(bit))
    }

    fn gamma(&mut self) -> Option<u32> {
        let mut v: u32 = 1;
        loop {
            v = v.checked_mul(2)?.checked_add(self.bit()?)?;
            if self.bit()? == 0 {
                return Some(v);
            }
        }
    }
}

pub fn decompress(src: &[u8], dst: &mut [u8]) -> usize {
    let mut out = Sink::new(dst);
    let mut bits = Bits { src, pos: 0, tag: 0, count: 0 };
    run(&mut bits, &mut out);
    out.written()
}

fn run(bits: &mut Bits<'_>, out: &mut Sink<'_>) -> Option<()> {
    let mut last_offset: usize = 0;
    let mut last_was_match = false;

    let first = bits.byte()?;
    if !out.push(first) {
        return None;
    }

    loop {
        if bits.bit()? == 0 {
            if !out.push(bits.byte()?) {
                return None;
            }
            last_was_match = false;
            continue;
        }

        if bits.bit()? == 0 {
            let hi = bits.gamma()? as usize;
            if !last_was_match && hi == 2 {
                let len = bits.gamma()? as usize;
                if !out.copy_back(last_offset, len) {
                    return None;
                }
            } else {
                let hi = hi - if last_was_match { 2 } else { 3 };
                let offset = (hi << 8) + usize::from(bits.byte()?);
                let mut len = bits.gamma()? as usize;
                if offset >= 32000 {
                    len += 1;
                }
                if offset >= 1280 {
                    len += 1;
                }
                if offset < 128 {
                    len += 2;
                }
                if !out.copy_back(offset, len) {
                    return None;
                }
                last_offset = offset;
            }
            last_was_match = true;
            continue;
        }

        if bits.bit()? == 0 {
            let b = usize::from(bits.byte()?);
            let offset = b >> 1;
            if offset == 0 {
                return Some(());
            }
            let len = 2 + (b & 1);
            if !out.copy_back(offset, len) {
                return None;
            }
            last_offset = offset;
            last_was_match = true;
        } else {
            let mut offset = 0usize;
            for _ in 0..4 {
                offset = (offset << 1) | bits.bit()? as usize;
            }
            let ok = if offset == 0 { out.push(0) } else { out.copy_back(offset, 1) };
            if !ok {
                return None;
            }
            last_was_match = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit/byte interleaving writer mirroring the depacker's reader.
    struct Packer {
        out: Vec<u8>,
        tag_pos: usize,
        used: u8,
    }

    impl Packer {
        fn new(first: u8) -> Self {
            Packer { out: vec![first], tag_pos: 0, used: 8 }
        }

        fn bit(&mut self, b: u32) {
            if self.used == 8 {
                self.tag_pos = self.out.len();
                self.out.push(0);
                self.used = 0;
            }
            if b != 0 {
                self.out[self.tag_pos] |= 0x80 >> self.used;
            }
            self.used += 1;
        }

        fn gamma(&mut self, v: u32) {
            let top = 31 - v.leading_zeros();
            for i in (0..top).rev() {
                self.bit((v >> i) & 1);
                self.bit(u32::from(i != 0));
            }
        }

        fn literal(&mut self, b: u8) {
            self.bit(0);
            self.out.push(b);
        }

        fn long_match(&mut self, offset: usize, len: u32) {
            self.bit(1);
            self.bit(0);
            // first match after a literal: high part is offset/256 + 3
            self.gamma((offset >> 8) as u32 + 3);
            self.out.push(offset as u8);
            self.gamma(len);
        }

        fn end(mut self) -> Vec<u8> {
            self.bit(1);
            self.bit(1);
            self.bit(0);
            self.out.push(0);
            self.out
        }
    }

    #[test]
    fn literals_then_end() {
        let mut p = Packer::new(b'a');
        p.literal(b'p');
        p.literal(b'l');
        let packed = p.end();
        let mut dst = [0u8; 8];
        assert_eq!(decompress(&packed, &mut dst), 3);
        assert_eq!(&dst[..3], b"apl");
    }

    #[test]
    fn gamma_match_with_length_bonus() {
        let mut p = Packer::new(b'x');
        p.literal(b'y');
        // offset 2 < 128 adds two to the coded length
        p.long_match(2, 4);
        let packed = p.end();
        let mut dst = [0u8; 16];
        assert_eq!(decompress(&packed, &mut dst), 8);
        assert_eq!(&dst[..8], b"xyxyxyxy");
    }

    #[test]
    fn nibble_offset_and_zero_byte() {
        let mut p = Packer::new(b'q');
        // 111 + offset 0001 copies one byte back, 111 + 0000 writes zero
        for bits in [[1, 1, 1, 0, 0, 0, 1], [1, 1, 1, 0, 0, 0, 0]] {
            for b in bits {
                p.bit(b);
            }
        }
        let packed = p.end();
        let mut dst = [0xFFu8; 4];
        assert_eq!(decompress(&packed, &mut dst), 3);
        assert_eq!(&dst[..3], &[b'q', b'q', 0]);
    }

    #[test]
    fn undersized_destination() {
        let mut p = Packer::new(b'x');
        p.literal(b'y');
        p.long_match(2, 100);
        let packed = p.end();
        let mut dst = [0u8; 10];
        assert_eq!(decompress(&packed, &mut dst), 10);
        assert_eq!(&dst, b"xyxyxyxyxy");
    }

    #[test]
    fn bad_offset_stops() {
        let mut p = Packer::new(b'x');
        p.long_match(200, 2);
        let packed = p.end();
        let mut dst = [0u8; 16];
        assert_eq!(decompress(&packed, &mut dst), 1);
    }
}
