//! Sixpack adaptive Huffman + LZ77 (AT2 versions 1 and 5).
//!
//! Input is a sequence of little-endian 16-bit words consumed most
//! significant bit first. Each symbol walks a Huffman tree whose weights
//! are updated after every symbol and halved when the root reaches
//! `MAX_FREQ`. Symbols below 256 are literals, 256 terminates, and the
//! rest select a copy length and one of six distance ranges.

use super::Sink;

const MAX_FREQ: u16 = 2000;
const MIN_COPY: usize = 3;
const MAX_COPY: usize = 255;
const COPY_RANGES: usize = 6;
const CODES_PER_RANGE: usize = MAX_COPY - MIN_COPY + 1;
const TERMINATE: usize = 256;
const FIRST_CODE: usize = 257;
const MAX_CHAR: usize = FIRST_CODE + COPY_RANGES * CODES_PER_RANGE - 1;
const SUCC_MAX: usize = MAX_CHAR + 1;
const TWICE_MAX: usize = 2 * MAX_CHAR + 1;
const ROOT: usize = 1;
const WINDOW: usize = 21389 + MAX_COPY;
/// Larger inputs are rejected outright by the depacker.
const MAX_INPUT: usize = 42 * 1024 - 4096;

const COPY_BITS: [u32; COPY_RANGES] = [4, 6, 8, 10, 12, 14];
const COPY_MIN: [usize; COPY_RANGES] = [0, 16, 80, 336, 1360, 5456];

pub(crate) struct Tree {
    left: Vec<u16>,
    right: Vec<u16>,
    dad: Vec<u16>,
    freq: Vec<u16>,
}

impl Tree {
    pub(crate) fn new() -> Self {
        let mut t = Tree {
            left: vec![0; MAX_CHAR + 1],
            right: vec![0; MAX_CHAR + 1],
            dad: vec![0; TWICE_MAX + 1],
            freq: vec![0; TWICE_MAX + 1],
        };
        for i in 2..=TWICE_MAX {
            t.dad[i] = (i / 2) as u16;
            t.freq[i] = 1;
        }
        for i in 1..=MAX_CHAR {
            t.left[i] = (2 * i) as u16;
            t.right[i] = (2 * i + 1) as u16;
        }
        t
    }

    fn sibling(&self, node: usize) -> usize {
        let parent = usize::from(self.dad[node]);
        if usize::from(self.left[parent]) == node {
            usize::from(self.right[parent])
        } else {
            usize::from(self.left[parent])
        }
    }

    fn update_freq(&mut self, mut a: usize, mut b: usize) {
        loop {
            let parent = usize::from(self.dad[a]);
            self.freq[parent] = self.freq[a].wrapping_add(self.freq[b]);
            a = parent;
            if a == ROOT {
                break;
            }
            b = self.sibling(a);
        }
        if self.freq[ROOT] == MAX_FREQ {
            for f in &mut self.freq[1..] {
                *f >>= 1;
            }
        }
    }

    pub(crate) fn update_model(&mut self, code: usize) {
        let mut a = code + SUCC_MAX;
        self.freq[a] = self.freq[a].wrapping_add(1);
        if usize::from(self.dad[a]) == ROOT {
            return;
        }
        let mut code1 = usize::from(self.dad[a]);
        let sib = self.sibling(a);
        self.update_freq(a, sib);

        loop {
            let code2 = usize::from(self.dad[code1]);
            let b = if usize::from(self.left[code2]) == code1 {
                usize::from(self.right[code2])
            } else {
                usize::from(self.left[code2])
            };

            if self.freq[a] > self.freq[b] {
                if usize::from(self.left[code2]) == code1 {
                    self.right[code2] = a as u16;
                } else {
                    self.left[code2] = a as u16;
                }
                let c = if usize::from(self.left[code1]) == a {
                    self.left[code1] = b as u16;
                    usize::from(self.right[code1])
                } else {
                    self.right[code1] = b as u16;
                    usize::from(self.left[code1])
                };
                self.dad[b] = code1 as u16;
                self.dad[a] = code2 as u16;
                self.update_freq(b, c);
                a = b;
            }

            a = usize::from(self.dad[a]);
            code1 = usize::from(self.dad[a]);
            if code1 == ROOT {
                break;
            }
        }
    }

    /// Path from the root to the leaf of `code`, as right-branch flags.
    #[cfg(test)]
    pub(crate) fn path(&self, code: usize) -> Vec<bool> {
        let mut node = code + SUCC_MAX;
        let mut bits = Vec::new();
        while node != ROOT {
            let parent = usize::from(self.dad[node]);
            bits.push(usize::from(self.right[parent]) == node);
            node = parent;
        }
        bits.reverse();
        bits
    }
}

struct WordBits<'a> {
    src: &'a [u8],
    idx: usize,
    buffer: u16,
    count: u8,
}

impl WordBits<'_> {
    fn bit(&mut self) -> Option<bool> {
        if self.count == 0 {
            let lo = *self.src.get(self.idx)?;
            let hi = *self.src.get(self.idx + 1)?;
            self.buffer = u16::from_le_bytes([lo, hi]);
            self.idx += 2;
            self.count = 15;
        } else {
            self.count -= 1;
        }
        let bit = self.buffer & 0x8000 != 0;
        self.buffer <<= 1;
        Some(bit)
    }

    /// Extra bits arrive least significant first.
    fn code(&mut self, bits: u32) -> Option<usize> {
        let mut v = 0usize;
        for i in 0..bits {
            if self.bit()? {
                v |= 1 << i;
            }
        }
        Some(v)
    }
}

fn next_symbol(tree: &mut Tree, input: &mut WordBits<'_>) -> Option<usize> {
    let mut a = ROOT;
    while a <= MAX_CHAR {
        a = if input.bit()? {
            usize::from(tree.right[a])
        } else {
            usize::from(tree.left[a])
        };
    }
    let code = a - SUCC_MAX;
    tree.update_model(code);
    Some(code)
}

pub fn decompress(src: &[u8], dst: &mut [u8]) -> usize {
    if src.len() > MAX_INPUT {
        tracing::debug!("sixpack: input of {} bytes exceeds depacker buffer", src.len());
        return 0;
    }
    let mut out = Sink::new(dst);
    let mut tree = Tree::new();
    let mut input = WordBits { src, idx: 0, buffer: 0, count: 0 };
    let mut window = vec![0u8; WINDOW];
    let mut count = 0usize;

    while !out.is_full() {
        let Some(c) = next_symbol(&mut tree, &mut input) else { break };
        if c == TERMINATE {
            break;
        }
        if c < 256 {
            if !out.push(c as u8) {
                break;
            }
            window[count] = c as u8;
            count = (count + 1) % WINDOW;
            continue;
        }

        let t = c - FIRST_CODE;
        let index = t / CODES_PER_RANGE;
        let len = t + MIN_COPY - index * CODES_PER_RANGE;
        let Some(extra) = input.code(COPY_BITS[index]) else { break };
        let dist = extra + len + COPY_MIN[index];

        let mut j = count;
        let mut k = (count + 2 * WINDOW - dist) % WINDOW;
        for _ in 0..len {
            let b = window[k];
            if !out.push(b) {
                return out.written();
            }
            window[j] = b;
            j = (j + 1) % WINDOW;
            k = (k + 1) % WINDOW;
        }
        count = (count + len) % WINDOW;
    }
    out.written()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    struct WordWriter {
        words: Vec<u16>,
        cur: u16,
        n: u8,
    }

    impl WordWriter {
        fn bit(&mut self, b: bool) {
            self.cur = (self.cur << 1) | u16::from(b);
            self.n += 1;
            if self.n == 16 {
                self.words.push(self.cur);
                self.cur = 0;
                self.n = 0;
            }
        }

        fn finish(mut self) -> Vec<u8> {
            if self.n > 0 {
                self.cur <<= 16 - self.n;
                self.words.push(self.cur);
            }
            self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
        }
    }

    fn emit(tree: &mut Tree, w: &mut WordWriter, code: usize) {
        for b in tree.path(code) {
            w.bit(b);
        }
        tree.update_model(code);
    }

    /// Reference compressor: greedy matches within the first distance
    /// range, literals otherwise.
    pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
        let mut tree = Tree::new();
        let mut w = WordWriter { words: Vec::new(), cur: 0, n: 0 };
        let mut p = 0;
        while p < data.len() {
            let mut best = (0usize, 0usize);
            for dist in 1..=(15 + MIN_COPY).min(p) {
                let mut len = 0;
                while len < MAX_COPY && p + len < data.len() && data[p + len - dist] == data[p + len] {
                    len += 1;
                }
                // range 0 encodes distances len..=len + 15
                if len >= MIN_COPY && dist >= len && dist - len <= 15 && len > best.1 {
                    best = (dist, len);
                }
                if len >= MIN_COPY && dist < len {
                    // shorten so the distance fits range 0
                    let l = dist.max(MIN_COPY);
                    if dist >= l && l > best.1 {
                        best = (dist, l);
                    }
                }
            }
            if best.1 >= MIN_COPY {
                let (dist, len) = best;
                emit(&mut tree, &mut w, FIRST_CODE + len - MIN_COPY);
                let extra = dist - len;
                for i in 0..COPY_BITS[0] {
                    w.bit(extra >> i & 1 != 0);
                }
                p += len;
            } else {
                emit(&mut tree, &mut w, usize::from(data[p]));
                p += 1;
            }
        }
        emit(&mut tree, &mut w, TERMINATE);
        w.finish()
    }

    fn sample() -> Vec<u8> {
        let mut v = Vec::new();
        for i in 0..3000u32 {
            v.push(b"abcab"[(i % 5) as usize]);
            if i % 97 == 0 {
                v.push((i % 251) as u8);
            }
        }
        v
    }

    #[test]
    fn literals_and_terminator() {
        let packed = compress(b"sixpack");
        let mut dst = [0u8; 16];
        assert_eq!(decompress(&packed, &mut dst), 7);
        assert_eq!(&dst[..7], b"sixpack");
    }

    #[test]
    fn round_trip_with_copies() {
        let data = sample();
        let packed = compress(&data);
        assert!(packed.len() < data.len());
        let mut dst = vec![0u8; data.len() + 10];
        assert_eq!(decompress(&packed, &mut dst), data.len());
        assert_eq!(&dst[..data.len()], &data[..]);
    }

    #[test]
    fn many_literals_trigger_frequency_halving() {
        let data: Vec<u8> = (0..6000u32).map(|i| (i * 7 % 256) as u8).collect();
        let packed = compress(&data);
        let mut dst = vec![0u8; data.len()];
        assert_eq!(decompress(&packed, &mut dst), data.len());
        assert_eq!(dst, data);
    }

    #[test]
    fn undersized_destination() {
        let data = sample();
        let packed = compress(&data);
        let mut dst = vec![0u8; 100];
        assert_eq!(decompress(&packed, &mut dst), 100);
        assert_eq!(&dst[..], &data[..100]);
    }

    #[test]
    fn oversized_input_rejected() {
        let mut dst = [0u8; 4];
        assert_eq!(decompress(&vec![0u8; 40_000], &mut dst), 0);
    }
}
