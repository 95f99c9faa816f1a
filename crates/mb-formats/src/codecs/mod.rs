//! Legacy block decompressors used by Adlib Tracker II and TFM modules.
//!
//! Every codec has the same contract: `decompress(src, dst) -> usize`
//! writes at most `dst.len()` bytes, returns how many were written, and
//! stops cleanly on malformed or exhausted input.

pub mod aplib;
pub mod lzh;
pub mod lzss;
pub mod lzw;
pub mod rle;
pub mod sixpack;

/// Block compression scheme selected by an AT2 file version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Sixpack,
    Lzw,
    Lzss,
    Stored,
    Aplib,
    Lzh,
}

impl Codec {
    /// Codec used for every sub-block of an AT2 file of `version`.
    pub fn for_at2_version(version: u8) -> Option<Codec> {
        match version {
            1 | 5 => Some(Codec::Sixpack),
            2 | 6 => Some(Codec::Lzw),
            3 | 7 => Some(Codec::Lzss),
            4 | 8 => Some(Codec::Stored),
            9..=11 => Some(Codec::Aplib),
            12..=14 => Some(Codec::Lzh),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Sixpack => "sixpack",
            Codec::Lzw => "lzw",
            Codec::Lzss => "lzss",
            Codec::Stored => "stored",
            Codec::Aplib => "aplib",
            Codec::Lzh => "lzh",
        }
    }

    pub fn decompress(self, src: &[u8], dst: &mut [u8]) -> usize {
        let n = match self {
            Codec::Sixpack => sixpack::decompress(src, dst),
            Codec::Lzw => lzw::decompress(src, dst),
            Codec::Lzss => lzss::decompress(src, dst),
            Codec::Stored => {
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
                n
            }
            Codec::Aplib => aplib::decompress(src, dst),
            Codec::Lzh => lzh::decompress(src, dst),
        };
        tracing::trace!("{}: {} -> {} bytes", self.name(), src.len(), n);
        n
    }
}

/// Bounded output cursor shared by the codecs.
pub(crate) struct Sink<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Sink<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn written(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_full(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Append one byte. Returns false once the buffer is full.
    pub(crate) fn push(&mut self, b: u8) -> bool {
        match self.buf.get_mut(self.pos) {
            Some(slot) => {
                *slot = b;
                self.pos += 1;
                true
            }
            None => false,
        }
    }

    /// LZ77 back-reference into already written output. Overlapping copies
    /// repeat the pattern. Returns false when the distance points before
    /// the start of output or the buffer fills up.
    pub(crate) fn copy_back(&mut self, dist: usize, len: usize) -> bool {
        if dist == 0 || dist > self.pos {
            return false;
        }
        for _ in 0..len {
            let b = self.buf[self.pos - dist];
            if !self.push(b) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_table() {
        assert_eq!(Codec::for_at2_version(1), Some(Codec::Sixpack));
        assert_eq!(Codec::for_at2_version(6), Some(Codec::Lzw));
        assert_eq!(Codec::for_at2_version(7), Some(Codec::Lzss));
        assert_eq!(Codec::for_at2_version(8), Some(Codec::Stored));
        assert_eq!(Codec::for_at2_version(10), Some(Codec::Aplib));
        assert_eq!(Codec::for_at2_version(14), Some(Codec::Lzh));
        assert_eq!(Codec::for_at2_version(0), None);
        assert_eq!(Codec::for_at2_version(15), None);
    }

    #[test]
    fn stored_truncates_to_destination() {
        let mut dst = [0u8; 3];
        assert_eq!(Codec::Stored.decompress(b"abcdef", &mut dst), 3);
        assert_eq!(&dst, b"abc");
    }

    #[test]
    fn sink_overlapping_copy() {
        let mut buf = [0u8; 8];
        let mut s = Sink::new(&mut buf);
        assert!(s.push(b'a'));
        assert!(s.push(b'b'));
        assert!(s.copy_back(2, 5));
        assert!(!s.copy_back(9, 1));
        assert_eq!(s.written(), 7);
        assert_eq!(&buf[..7], b"abababa");
    }

    #[test]
    fn sink_stops_at_bound() {
        let mut buf = [0u8; 2];
        let mut s = Sink::new(&mut buf);
        assert!(s.push(1));
        assert!(!s.copy_back(1, 4));
        assert!(s.is_full());
        assert_eq!(buf, [1, 1]);
    }
}
