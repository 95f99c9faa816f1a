//! Static Huffman LZ77 in the ar002 family (AT2 versions 12 to 14).
//!
//! The stream starts with a flag byte and the unpacked size (u32 LE).
//! Blocks carry their own code-length tables for literals/lengths (`NC`
//! symbols) and positions (`NP` symbols), themselves coded with a small
//! `NT`-symbol tree. Output is produced in dictionary-sized chunks; a
//! chunk is always emitted whole, so the result is exactly
//! `min(unpacked size, dst.len())` bytes.

const DIC_BITS: u32 = 14;
const DIC_SIZE: usize = 1 << DIC_BITS;
const MAX_MATCH: usize = 256;
const THRESHOLD: usize = 2;
const NC: usize = 255 + MAX_MATCH + 2 - THRESHOLD;
const C_BITS: u32 = 16;
const CODE_BITS: usize = 16;
const NP: usize = DIC_BITS as usize + 1;
const NT: usize = CODE_BITS + 3;
const P_BITS: u32 = 14;
const T_BITS: u32 = 15;
const NPT: usize = 1 << T_BITS;
const BITBUF_BITS: u32 = 16;

/// Malformed table data. Decoding ends at the current position.
struct Corrupt;

struct Decoder<'a> {
    src: &'a [u8],
    pos: usize,
    bitbuf: u16,
    subbitbuf: u32,
    bitcount: i32,

    left: Vec<u16>,
    right: Vec<u16>,
    c_len: Vec<u8>,
    pt_len: Vec<u8>,
    c_table: Vec<u16>,
    pt_table: Vec<u16>,
    blocksize: u32,

    // copy state carried across chunks
    pending: usize,
    copy_from: usize,
    done: bool,
}

impl<'a> Decoder<'a> {
    fn new(src: &'a [u8]) -> Self {
        let mut d = Decoder {
            src,
            pos: 0,
            bitbuf: 0,
            subbitbuf: 0,
            bitcount: 0,
            left: vec![0; 2 * NC - 1],
            right: vec![0; 2 * NC - 1],
            c_len: vec![0; NC],
            pt_len: vec![0; NPT],
            c_table: vec![0; 4096],
            pt_table: vec![0; 256],
            blocksize: 0,
            pending: 0,
            copy_from: 0,
            done: false,
        };
        d.fill(BITBUF_BITS as i32);
        d
    }

    fn next_byte(&mut self) -> u32 {
        match self.src.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                u32::from(b)
            }
            None => 0,
        }
    }

    /// Shift `n` new bits into the bit buffer.
    fn fill(&mut self, mut n: i32) {
        self.bitbuf = ((u32::from(self.bitbuf) << n) & 0xFFFF) as u16;
        while n > self.bitcount {
            n -= self.bitcount;
            self.bitbuf |= ((self.subbitbuf << n) & 0xFFFF) as u16;
            self.subbitbuf = self.next_byte();
            self.bitcount = 8;
        }
        self.bitcount -= n;
        self.bitbuf |= (self.subbitbuf >> self.bitcount) as u16;
    }

    fn bits(&mut self, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        let x = u32::from(self.bitbuf) >> (BITBUF_BITS - n);
        self.fill(n as i32);
        x
    }

    fn make_table(&mut self, which: Table, nchar: usize, tablebits: u32) -> Result<(), Corrupt> {
        let (mut table, bitlen) = match which {
            Table::C => (std::mem::take(&mut self.c_table), self.c_len[..nchar].to_vec()),
            Table::Pt => (std::mem::take(&mut self.pt_table), self.pt_len[..nchar].to_vec()),
        };
        let result = self.build_table(&mut table, &bitlen, tablebits);
        match which {
            Table::C => self.c_table = table,
            Table::Pt => self.pt_table = table,
        }
        result
    }

    /// Canonical Huffman lookup table over the top `tablebits` bits, with
    /// longer codes continuing into the left/right overflow tree.
    fn build_table(&mut self, table: &mut [u16], bitlen: &[u8], tablebits: u32) -> Result<(), Corrupt> {
        let mut count = [0u16; 17];
        let mut weight = [0u16; 17];
        let mut start = [0u16; 18];

        for &len in bitlen {
            *count.get_mut(usize::from(len)).ok_or(Corrupt)? += 1;
        }
        for i in 1..=16 {
            start[i + 1] = start[i].wrapping_add(count[i].wrapping_shl(16 - i as u32));
        }
        if start[17] != 0 {
            return Err(Corrupt);
        }

        let tb = tablebits as usize;
        let jutbits = 16 - tablebits;
        for i in 1..=tb {
            start[i] >>= jutbits;
            weight[i] = 1 << (tb - i);
        }
        for (i, w) in weight.iter_mut().enumerate().skip(tb + 1) {
            *w = 1 << (16 - i);
        }

        let table_len = 1usize << tablebits;
        let first_free = usize::from(start[tb + 1] >> jutbits);
        if first_free != 0 {
            table.get_mut(first_free..table_len).ok_or(Corrupt)?.fill(0);
        }

        let mut avail = bitlen.len();
        let mask = 1u32 << (15 - tablebits);
        for (ch, &len) in bitlen.iter().enumerate() {
            let len = usize::from(len);
            if len == 0 {
                continue;
            }
            let next_code = usize::from(start[len]) + usize::from(weight[len]);
            if len <= tb {
                table.get_mut(usize::from(start[len])..next_code).ok_or(Corrupt)?.fill(ch as u16);
            } else {
                let mut k = u32::from(start[len]);
                let mut node = Node::Table((k >> jutbits) as usize);
                for _ in 0..len - tb {
                    let cur = match self.node_get(table, node).ok_or(Corrupt)? {
                        0 => {
                            if avail >= self.left.len() {
                                return Err(Corrupt);
                            }
                            self.left[avail] = 0;
                            self.right[avail] = 0;
                            self.node_set(table, node, avail as u16).ok_or(Corrupt)?;
                            avail += 1;
                            avail - 1
                        }
                        n => usize::from(n),
                    };
                    node = if k & mask != 0 { Node::Right(cur) } else { Node::Left(cur) };
                    k <<= 1;
                }
                self.node_set(table, node, ch as u16).ok_or(Corrupt)?;
            }
            start[len] = next_code as u16;
        }
        Ok(())
    }

    fn node_get(&self, table: &[u16], node: Node) -> Option<u16> {
        match node {
            Node::Table(i) => table.get(i).copied(),
            Node::Left(i) => self.left.get(i).copied(),
            Node::Right(i) => self.right.get(i).copied(),
        }
    }

    fn node_set(&mut self, table: &mut [u16], node: Node, v: u16) -> Option<()> {
        let slot = match node {
            Node::Table(i) => table.get_mut(i)?,
            Node::Left(i) => self.left.get_mut(i)?,
            Node::Right(i) => self.right.get_mut(i)?,
        };
        *slot = v;
        Some(())
    }

    /// Follow the overflow tree below a table entry.
    fn walk(&self, mut j: usize, limit: usize, lookup_bits: u32) -> Result<usize, Corrupt> {
        let mut mask = 1u16 << (BITBUF_BITS - 1 - lookup_bits);
        while j >= limit {
            if mask == 0 {
                return Err(Corrupt);
            }
            let next = if self.bitbuf & mask != 0 { self.right.get(j) } else { self.left.get(j) };
            j = usize::from(*next.ok_or(Corrupt)?);
            mask >>= 1;
        }
        Ok(j)
    }

    fn read_pt_len(&mut self, nn: usize, nbit: u32, special: Option<usize>) -> Result<(), Corrupt> {
        let n = self.bits(nbit) as usize;
        if n == 0 {
            let c = self.bits(nbit) as u16;
            self.pt_len[..nn].fill(0);
            self.pt_table.fill(c);
            return Ok(());
        }
        let mut i = 0;
        while i < n {
            let mut c = usize::from(self.bitbuf >> (BITBUF_BITS - 3));
            if c == 7 {
                let mut mask = 1u16 << (BITBUF_BITS - 1 - 3);
                while mask & self.bitbuf != 0 {
                    mask >>= 1;
                    c += 1;
                }
                if c > 16 {
                    return Err(Corrupt);
                }
            }
            self.fill(if c < 7 { 3 } else { c as i32 - 3 });
            *self.pt_len.get_mut(i).ok_or(Corrupt)? = c as u8;
            i += 1;
            if Some(i) == special {
                for _ in 0..self.bits(2) {
                    *self.pt_len.get_mut(i).ok_or(Corrupt)? = 0;
                    i += 1;
                }
            }
        }
        while i < nn {
            self.pt_len[i] = 0;
            i += 1;
        }
        self.make_table(Table::Pt, nn, 8)
    }

    fn read_c_len(&mut self) -> Result<(), Corrupt> {
        let n = self.bits(C_BITS) as usize;
        if n == 0 {
            let c = self.bits(C_BITS) as u16;
            self.c_len.fill(0);
            self.c_table.fill(c);
            return Ok(());
        }
        let mut i = 0;
        while i < n {
            let first = usize::from(self.pt_table[usize::from(self.bitbuf >> (BITBUF_BITS - 8))]);
            let c = self.walk(first, NT, 8)?;
            let len = *self.pt_len.get(c).ok_or(Corrupt)?;
            self.fill(i32::from(len));
            if c <= 2 {
                let zeros = match c {
                    0 => 1,
                    1 => self.bits(4) as usize + 3,
                    _ => self.bits(C_BITS) as usize + 20,
                };
                for _ in 0..zeros {
                    *self.c_len.get_mut(i).ok_or(Corrupt)? = 0;
                    i += 1;
                }
            } else {
                *self.c_len.get_mut(i).ok_or(Corrupt)? = (c - 2) as u8;
                i += 1;
            }
        }
        self.c_len[i.min(NC)..].fill(0);
        self.make_table(Table::C, NC, 12)
    }

    fn decode_c(&mut self) -> Result<usize, Corrupt> {
        if self.blocksize == 0 {
            self.blocksize = self.bits(16);
            if self.blocksize == 0 {
                return Ok(NC);
            }
            self.read_pt_len(NT, T_BITS, Some(3))?;
            self.read_c_len()?;
            self.read_pt_len(NP, P_BITS, None)?;
        }
        self.blocksize -= 1;
        let first = usize::from(self.c_table[usize::from(self.bitbuf >> (BITBUF_BITS - 12))]);
        let j = self.walk(first, NC, 12)?;
        let len = *self.c_len.get(j).ok_or(Corrupt)?;
        self.fill(i32::from(len));
        Ok(j)
    }

    fn decode_p(&mut self) -> Result<usize, Corrupt> {
        let first = usize::from(self.pt_table[usize::from(self.bitbuf >> (BITBUF_BITS - 8))]);
        let j = self.walk(first, NP, 8)?;
        let len = *self.pt_len.get(j).ok_or(Corrupt)?;
        self.fill(i32::from(len));
        if j == 0 {
            return Ok(0);
        }
        Ok((1usize << (j - 1)) + self.bits(j as u32 - 1) as usize)
    }

    /// Decode up to `count` bytes into the front of `window`, which doubles
    /// as the dictionary. Returns the number of fresh bytes.
    fn decode(&mut self, count: usize, window: &mut [u8]) -> usize {
        let mut r = 0;
        while self.pending > 0 {
            self.pending -= 1;
            window[r] = window[self.copy_from];
            self.copy_from = (self.copy_from + 1) & (DIC_SIZE - 1);
            r += 1;
            if r == count {
                return r;
            }
        }
        loop {
            let c = match self.decode_c() {
                Ok(c) if c < NC => c,
                _ => {
                    self.done = true;
                    return r;
                }
            };
            if c <= 0xFF {
                window[r] = c as u8;
                r += 1;
                if r == count {
                    return r;
                }
                continue;
            }
            let Ok(p) = self.decode_p() else {
                self.done = true;
                return r;
            };
            self.pending = c - (0xFF + 1 - THRESHOLD);
            self.copy_from = r.wrapping_sub(p).wrapping_sub(1) & (DIC_SIZE - 1);
            while self.pending > 0 {
                self.pending -= 1;
                window[r] = window[self.copy_from];
                self.copy_from = (self.copy_from + 1) & (DIC_SIZE - 1);
                r += 1;
                if r == count {
                    return r;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Table {
    C,
    Pt,
}

#[derive(Clone, Copy)]
enum Node {
    Table(usize),
    Left(usize),
    Right(usize),
}

pub fn decompress(src: &[u8], dst: &mut [u8]) -> usize {
    if src.len() < 5 {
        return 0;
    }
    let unpacked = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
    let total = unpacked.min(dst.len());
    let mut d = Decoder::new(&src[5..]);
    let mut window = vec![0u8; DIC_SIZE];

    let mut written = 0;
    while written < total {
        let chunk = (unpacked - written).min(DIC_SIZE);
        if !d.done {
            d.decode(chunk, &mut window);
        }
        let n = chunk.min(total - written);
        dst[written..written + n].copy_from_slice(&window[..n]);
        written += n;
    }
    tracing::trace!("lzh: {} of {} declared bytes", written, unpacked);
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MSB-first bit packer.
    struct Bits {
        out: Vec<u8>,
        acc: u64,
        n: u32,
    }

    impl Bits {
        fn new() -> Self {
            Bits { out: Vec::new(), acc: 0, n: 0 }
        }

        fn put(&mut self, v: u32, bits: u32) {
            self.acc = (self.acc << bits) | u64::from(v & ((1 << bits) - 1));
            self.n += bits;
            while self.n >= 8 {
                self.n -= 8;
                self.out.push((self.acc >> self.n) as u8);
            }
        }

        fn finish(mut self) -> Vec<u8> {
            if self.n > 0 {
                self.out.push((self.acc << (8 - self.n)) as u8);
            }
            self.out
        }
    }

    /// A block whose three tables each hold a single zero-length symbol,
    /// so every decoded symbol is `c` and every position is `p`.
    fn constant_block(bits: &mut Bits, size: u32, c: u32, p: u32) {
        bits.put(size, 16);
        bits.put(0, T_BITS);
        bits.put(0, T_BITS);
        bits.put(0, C_BITS);
        bits.put(c, C_BITS);
        bits.put(0, P_BITS);
        bits.put(p, P_BITS);
    }

    fn stream(unpacked: u32, body: Bits) -> Vec<u8> {
        let mut v = vec![1u8];
        v.extend_from_slice(&unpacked.to_le_bytes());
        v.extend(body.finish());
        v
    }

    #[test]
    fn literal_then_copy_blocks() {
        let mut b = Bits::new();
        constant_block(&mut b, 2, u32::from(b'Z'), 0);
        // symbol 300 copies 300 - 254 = 46 bytes from distance 1
        constant_block(&mut b, 1, 300, 0);
        b.put(0, 16);
        let src = stream(48, b);
        let mut dst = vec![0u8; 64];
        assert_eq!(decompress(&src, &mut dst), 48);
        assert!(dst[..48].iter().all(|&x| x == b'Z'));
        assert_eq!(dst[48], 0);
    }

    #[test]
    fn position_with_extra_bits() {
        let mut b = Bits::new();
        constant_block(&mut b, 4, u32::from(b'a'), 0);
        // position code 2 reads one extra bit: distance 2 + 1 = 3, and
        // symbol 257 copies three bytes from four back
        constant_block(&mut b, 1, 257, 2);
        b.put(1, 1);
        b.put(0, 16);
        let src = stream(7, b);
        let mut dst = vec![0u8; 7];
        assert_eq!(decompress(&src, &mut dst), 7);
        assert_eq!(&dst, b"aaaaaaa");
    }

    #[test]
    fn stops_at_declared_size() {
        let mut b = Bits::new();
        constant_block(&mut b, 1000, u32::from(b'k'), 0);
        let src = stream(10, b);
        let mut dst = vec![0xEEu8; 32];
        assert_eq!(decompress(&src, &mut dst), 10);
        assert!(dst[..10].iter().all(|&x| x == b'k'));
        assert_eq!(dst[10], 0xEE);
    }

    #[test]
    fn undersized_destination() {
        let mut b = Bits::new();
        constant_block(&mut b, 1000, u32::from(b'k'), 0);
        let src = stream(1000, b);
        let mut dst = vec![0u8; 5];
        assert_eq!(decompress(&src, &mut dst), 5);
    }

    #[test]
    fn garbage_is_not_fatal() {
        let src: Vec<u8> = (0..300u32).map(|i| (i * 151 % 256) as u8).collect();
        let mut dst = vec![0u8; 40_000];
        let _ = decompress(&src, &mut dst);
        assert_eq!(decompress(&[0, 1], &mut dst), 0);
    }
}
