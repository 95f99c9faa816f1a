//! Raw PCM sample data as trackers store it.

use mb_ir::SampleData;

/// Storage shape of one sample's data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PcmLayout {
    /// Frames per side.
    pub frames: usize,
    /// 16-bit words instead of bytes.
    pub wide: bool,
    /// Left block followed by right block.
    pub stereo: bool,
    pub signed: bool,
    pub big_endian: bool,
    /// Each word is the difference from the previous one.
    pub delta: bool,
}

impl PcmLayout {
    fn width(&self) -> usize {
        if self.wide {
            2
        } else {
            1
        }
    }

    fn sides(&self) -> usize {
        if self.stereo {
            2
        } else {
            1
        }
    }

    /// Bytes the data occupies in the file.
    pub fn stored_len(&self) -> usize {
        self.frames * self.width() * self.sides()
    }

    fn word(&self, c: &[u8]) -> i32 {
        if self.wide {
            let raw = if self.big_endian {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from_le_bytes([c[0], c[1]])
            };
            let raw = if self.signed { raw } else { raw ^ 0x8000 };
            i32::from(raw as i16)
        } else {
            let b = if self.signed { c[0] } else { c[0] ^ 0x80 };
            i32::from(b as i8)
        }
    }

    /// Decode to signed frames, averaging the two sides of stereo data.
    /// Frames missing from a short `raw` are dropped; a missing right side
    /// leaves the left one as is.
    pub fn decode(&self, raw: &[u8]) -> SampleData {
        let mut values: Vec<i32> = raw
            .chunks_exact(self.width())
            .take(self.frames * self.sides())
            .map(|c| self.word(c))
            .collect();
        if self.delta {
            let mut acc = 0i32;
            for v in &mut values {
                acc = if self.wide {
                    i32::from((acc + *v) as i16)
                } else {
                    i32::from((acc + *v) as i8)
                };
                *v = acc;
            }
        }
        let count = values.len().min(self.frames);
        let mixed = (0..count).map(|i| match values.get(self.frames + i) {
            Some(right) if self.stereo => (values[i] + right) >> 1,
            _ => values[i],
        });
        if self.wide {
            SampleData::Pcm16(mixed.map(|v| v as i16).collect())
        } else {
            SampleData::Pcm8(mixed.map(|v| v as i8).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_bytes_are_recentered() {
        let unsigned = PcmLayout { frames: 3, ..PcmLayout::default() };
        let signed = PcmLayout { signed: true, ..unsigned };
        assert_eq!(signed.decode(&[0x80, 0x00, 0xFF]), SampleData::Pcm8(vec![-128, 0, -1]));
        assert_eq!(unsigned.decode(&[0x80, 0x00, 0xFF]), SampleData::Pcm8(vec![0, -128, 127]));
    }

    #[test]
    fn stereo_sides_are_averaged() {
        let layout = PcmLayout { frames: 2, stereo: true, signed: true, ..PcmLayout::default() };
        assert_eq!(layout.stored_len(), 4);
        assert_eq!(layout.decode(&[10, 20, 30, 40]), SampleData::Pcm8(vec![20, 30]));
        // right side cut short
        assert_eq!(layout.decode(&[10, 20, 30]), SampleData::Pcm8(vec![20, 20]));
    }

    #[test]
    fn wide_words_honor_byte_order() {
        let le = PcmLayout { frames: 1, wide: true, signed: true, ..PcmLayout::default() };
        let be = PcmLayout { big_endian: true, ..le };
        assert_eq!(le.decode(&[0x34, 0x12]), SampleData::Pcm16(vec![0x1234]));
        assert_eq!(be.decode(&[0x12, 0x34]), SampleData::Pcm16(vec![0x1234]));
    }

    #[test]
    fn delta_accumulates_with_wrap() {
        let layout = PcmLayout { frames: 4, signed: true, delta: true, ..PcmLayout::default() };
        assert_eq!(layout.decode(&[5, 5, 0xF6, 0x7F]), SampleData::Pcm8(vec![5, 10, 0, 127]));
        assert_eq!(layout.decode(&[0x7F, 1]), SampleData::Pcm8(vec![127, -128]));
    }

    #[test]
    fn short_data_drops_frames() {
        let layout = PcmLayout { frames: 4, wide: true, signed: true, ..PcmLayout::default() };
        assert_eq!(layout.decode(&[1, 0, 2]), SampleData::Pcm16(vec![1]));
    }
}
