//! Sample and wavetable data types.

use alloc::vec::Vec;
use arrayvec::ArrayString;

/// A sample definition.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Sample name
    pub name: ArrayString<64>,
    /// Audio data
    pub data: SampleData,
    /// Loop region, if any
    pub loop_region: Option<SampleLoop>,
    /// Playback rate in Hz
    pub rate: u32,
    /// Rate at which the sample plays at C-4
    pub center_rate: u32,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            name: ArrayString::new(),
            data: SampleData::Pcm8(Vec::new()),
            loop_region: None,
            rate: 32000,
            center_rate: 8363,
        }
    }
}

impl Sample {
    /// Create a new empty sample.
    pub fn new(name: &str) -> Self {
        Self {
            name: crate::pattern::bounded_name(name),
            ..Self::default()
        }
    }

    /// Length in frames.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if the sample has a usable loop.
    pub fn has_loop(&self) -> bool {
        matches!(self.loop_region, Some(l) if l.end > l.start)
    }

    /// Set a loop, clamping it into the data.
    pub fn set_loop(&mut self, start: u32, end: u32, mode: LoopMode) {
        let len = self.len() as u32;
        let end = end.min(len);
        if start < end {
            self.loop_region = Some(SampleLoop { start, end, mode });
        } else {
            self.loop_region = None;
        }
    }
}

/// Sample loop region in frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleLoop {
    pub start: u32,
    pub end: u32,
    pub mode: LoopMode,
}

/// Loop playback mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopMode {
    #[default]
    Forward,
    Backward,
    PingPong,
}

/// Sample audio data. Stereo sources are downmixed on import.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleData {
    /// 8-bit signed PCM
    Pcm8(Vec<i8>),
    /// 16-bit signed PCM
    Pcm16(Vec<i16>),
    /// 1-bit delta (NES DPCM), raw bytes
    Dpcm(Vec<u8>),
}

impl SampleData {
    /// Get the number of sample frames.
    pub fn len(&self) -> usize {
        match self {
            SampleData::Pcm8(v) => v.len(),
            SampleData::Pcm16(v) => v.len(),
            SampleData::Dpcm(v) => v.len() * 8,
        }
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bits per stored frame.
    pub fn depth(&self) -> u8 {
        match self {
            SampleData::Pcm8(_) => 8,
            SampleData::Pcm16(_) => 16,
            SampleData::Dpcm(_) => 1,
        }
    }
}

/// A wavetable: `data.len()` steps, each in `0..=max`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Wavetable {
    pub max: i32,
    pub data: Vec<i32>,
}

impl Wavetable {
    pub fn new(max: i32, data: Vec<i32>) -> Self {
        Self { max, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_clamped_to_data() {
        let mut s = Sample::new("kick");
        s.data = SampleData::Pcm8(alloc::vec![0; 100]);
        s.set_loop(10, 500, LoopMode::Forward);
        assert_eq!(s.loop_region.map(|l| l.end), Some(100));
        assert!(s.has_loop());

        s.set_loop(100, 120, LoopMode::Forward);
        assert!(!s.has_loop());
    }

    #[test]
    fn dpcm_len_counts_bits() {
        assert_eq!(SampleData::Dpcm(alloc::vec![0; 3]).len(), 24);
    }
}
