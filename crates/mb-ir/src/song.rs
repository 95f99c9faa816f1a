//! Song structure and sequencing types.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::instrument::Instrument;
use crate::pattern::{Pattern, Row, MAX_EFFECT_COLS};
use crate::sample::{Sample, Wavetable};

/// A complete song.
#[derive(Clone, Debug, PartialEq)]
pub struct Song {
    /// Song title
    pub name: String,
    pub author: String,
    pub notes: String,
    /// Sound chips, in channel order
    pub systems: Vec<SystemEntry>,
    /// At least one subsong
    pub subsongs: Vec<Subsong>,
    pub instruments: Vec<Instrument>,
    pub samples: Vec<Sample>,
    pub wavetables: Vec<Wavetable>,
    /// Reusable speed sequences
    pub grooves: Vec<Vec<u8>>,
    /// A-4 frequency in Hz
    pub tuning: f32,
    pub compat: CompatFlags,
}

impl Default for Song {
    fn default() -> Self {
        Self {
            name: String::new(),
            author: String::new(),
            notes: String::new(),
            systems: Vec::new(),
            subsongs: alloc::vec![Subsong::default()],
            instruments: Vec::new(),
            samples: Vec::new(),
            wavetables: Vec::new(),
            grooves: Vec::new(),
            tuning: 440.0,
            compat: CompatFlags::default(),
        }
    }
}

impl Song {
    /// Create a song with one subsong of `channels` channels.
    pub fn with_channels(name: &str, channels: usize, pat_len: usize) -> Self {
        Self {
            name: String::from(name),
            subsongs: alloc::vec![Subsong::new(channels, pat_len)],
            ..Self::default()
        }
    }

    /// First subsong. Decoders always create one.
    pub fn main(&self) -> &Subsong {
        &self.subsongs[0]
    }

    pub fn main_mut(&mut self) -> &mut Subsong {
        &mut self.subsongs[0]
    }

    /// Total channel count declared by the systems.
    pub fn system_channels(&self) -> usize {
        self.systems.iter().map(|s| s.chip.channels()).sum()
    }

    pub fn add_system(&mut self, chip: Chip) {
        self.systems.push(SystemEntry::new(chip));
    }
}

/// Playback-compatibility switches set by decoders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompatFlags {
    pub linear_pitch: bool,
    pub pitch_slide_speed: u8,
    pub limit_slides: bool,
    pub no_slides_on_first_tick: bool,
    pub row_resets_arp_pos: bool,
    pub ignore_jump_at_end: bool,
    pub pitch_macro_is_linear: bool,
}

impl Default for CompatFlags {
    fn default() -> Self {
        Self {
            linear_pitch: true,
            pitch_slide_speed: 4,
            limit_slides: false,
            no_slides_on_first_tick: false,
            row_resets_arp_pos: false,
            ignore_jump_at_end: false,
            pitch_macro_is_linear: true,
        }
    }
}

/// A sound chip and its mix settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SystemEntry {
    pub chip: Chip,
    pub volume: f32,
    pub panning: f32,
}

impl SystemEntry {
    pub fn new(chip: Chip) -> Self {
        Self { chip, volume: 1.0, panning: 0.0 }
    }
}

/// Target sound chips.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chip {
    Opl2,
    Opl3,
    Opl3Drums,
    Amiga,
    Ym2612,
    Ym2612Ext,
    Sms,
    Opll,
    GameBoy,
    PcEngine,
    Nes,
    Vrc6,
    Vrc7,
    Fds,
    Mmc5,
    N163,
    Ay8910,
    C64_6581,
    C64_8580,
    Ym2151,
    SegaPcm,
    Ym2610,
    Ym2610Ext,
    Ymu759,
    Es5506,
}

impl Chip {
    /// Channels this chip contributes.
    pub const fn channels(self) -> usize {
        match self {
            Chip::Opl2 => 9,
            Chip::Opl3 => 18,
            Chip::Opl3Drums => 20,
            Chip::Amiga => 4,
            Chip::Ym2612 => 6,
            Chip::Ym2612Ext => 9,
            Chip::Sms => 4,
            Chip::Opll => 9,
            Chip::GameBoy => 4,
            Chip::PcEngine => 6,
            Chip::Nes => 5,
            Chip::Vrc6 => 3,
            Chip::Vrc7 => 6,
            Chip::Fds => 1,
            Chip::Mmc5 => 3,
            Chip::N163 => 8,
            Chip::Ay8910 => 3,
            Chip::C64_6581 | Chip::C64_8580 => 3,
            Chip::Ym2151 => 8,
            Chip::SegaPcm => 5,
            Chip::Ym2610 => 13,
            Chip::Ym2610Ext => 16,
            Chip::Ymu759 => 17,
            Chip::Es5506 => 32,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Chip::Opl2 => "OPL2",
            Chip::Opl3 => "OPL3",
            Chip::Opl3Drums => "OPL3 (drums)",
            Chip::Amiga => "Amiga",
            Chip::Ym2612 => "YM2612",
            Chip::Ym2612Ext => "YM2612 (extended ch3)",
            Chip::Sms => "SN76489",
            Chip::Opll => "YM2413",
            Chip::GameBoy => "Game Boy",
            Chip::PcEngine => "PC Engine",
            Chip::Nes => "NES",
            Chip::Vrc6 => "VRC6",
            Chip::Vrc7 => "VRC7",
            Chip::Fds => "FDS",
            Chip::Mmc5 => "MMC5",
            Chip::N163 => "N163",
            Chip::Ay8910 => "Sunsoft 5B",
            Chip::C64_6581 => "C64 (6581)",
            Chip::C64_8580 => "C64 (8580)",
            Chip::Ym2151 => "YM2151",
            Chip::SegaPcm => "SegaPCM",
            Chip::Ym2610 => "YM2610",
            Chip::Ym2610Ext => "YM2610 (extended ch2)",
            Chip::Ymu759 => "YMU759",
            Chip::Es5506 => "ES5506",
        }
    }
}

/// A subsong: timing, order list and per-channel pattern pools.
#[derive(Clone, Debug, PartialEq)]
pub struct Subsong {
    pub name: String,
    pub notes: String,
    /// Tick rate in Hz
    pub hz: f32,
    /// Speed sequence (ticks per row, cycled)
    pub speeds: Vec<u8>,
    pub virtual_tempo: (u16, u16),
    /// Row highlight intervals
    pub highlight: (u8, u8),
    /// Rows per pattern
    pub pat_len: usize,
    /// Number of order positions
    pub orders_len: usize,
    /// Macro ticks per engine tick
    pub macro_speed_mult: u8,
    pub channels: Vec<Channel>,
}

impl Default for Subsong {
    fn default() -> Self {
        Self::new(0, 64)
    }
}

impl Subsong {
    pub fn new(channels: usize, pat_len: usize) -> Self {
        Self {
            name: String::new(),
            notes: String::new(),
            hz: 60.0,
            speeds: alloc::vec![6],
            virtual_tempo: (150, 150),
            highlight: (4, 16),
            pat_len,
            orders_len: 1,
            macro_speed_mult: 1,
            channels: (0..channels).map(|_| Channel::new(1)).collect(),
        }
    }

    /// Resize every channel's order list, filling new positions with 0.
    pub fn set_orders_len(&mut self, len: usize) {
        self.orders_len = len;
        for ch in &mut self.channels {
            ch.orders.resize(len, 0);
        }
    }

    /// Set the same pattern index on every channel at an order position.
    pub fn set_order_all(&mut self, pos: usize, pattern: u8) {
        for ch in &mut self.channels {
            if let Some(slot) = ch.orders.get_mut(pos) {
                *slot = pattern;
            }
        }
    }

    /// Pattern played by `channel` at order position `pos`, created on demand.
    pub fn pattern_at_mut(&mut self, channel: usize, pos: usize) -> Option<&mut Pattern> {
        let pat_len = self.pat_len;
        let ch = self.channels.get_mut(channel)?;
        let index = *ch.orders.get(pos)?;
        Some(ch.pattern_mut(index, pat_len))
    }

    /// Row of `channel` at order position `pos`, if present.
    pub fn row_at(&self, channel: usize, pos: usize, row: usize) -> Option<&Row> {
        let ch = self.channels.get(channel)?;
        let index = *ch.orders.get(pos)?;
        ch.pattern(index)?.row(row)
    }

    pub fn row_at_mut(&mut self, channel: usize, pos: usize, row: usize) -> Option<&mut Row> {
        self.pattern_at_mut(channel, pos)?.row_mut(row)
    }

    /// Give every order position of every channel its own pattern.
    ///
    /// After this, order position `p` plays pattern `p` on all channels, so
    /// row edits made while walking the order list never alias.
    pub fn make_patterns_unique(&mut self) {
        let pat_len = self.pat_len;
        let len = self.orders_len.min(256);
        for ch in &mut self.channels {
            let mut fresh = BTreeMap::new();
            for pos in 0..len {
                let index = ch.orders.get(pos).copied().unwrap_or(0);
                let pattern = ch
                    .patterns
                    .get(&index)
                    .cloned()
                    .unwrap_or_else(|| Pattern::new(pat_len));
                fresh.insert(pos as u8, pattern);
            }
            ch.patterns = fresh;
            for (pos, slot) in ch.orders.iter_mut().enumerate().take(len) {
                *slot = pos as u8;
            }
        }
    }

    /// Collapse identical patterns within each channel and renumber the
    /// survivors in order of first use. Unreferenced patterns are dropped.
    pub fn merge_duplicate_patterns(&mut self) {
        let pat_len = self.pat_len;
        let len = self.orders_len.min(256);
        for ch in &mut self.channels {
            let mut kept: Vec<Pattern> = Vec::new();
            for pos in 0..len {
                let index = ch.orders.get(pos).copied().unwrap_or(0);
                let pattern =
                    ch.patterns.get(&index).cloned().unwrap_or_else(|| Pattern::new(pat_len));
                let slot = match kept.iter().position(|p| *p == pattern) {
                    Some(slot) => slot,
                    None => {
                        kept.push(pattern);
                        kept.len() - 1
                    }
                };
                if let Some(order) = ch.orders.get_mut(pos) {
                    *order = slot as u8;
                }
            }
            ch.patterns = kept.into_iter().enumerate().map(|(i, p)| (i as u8, p)).collect();
        }
    }

    /// Recompute each channel's effect column count from the patterns its
    /// order list references (at least 1).
    pub fn fit_effect_columns(&mut self) {
        for ch in &mut self.channels {
            let mut cols = 1usize;
            for index in ch.orders.iter().take(self.orders_len) {
                if let Some(p) = ch.patterns.get(index) {
                    for row in &p.rows {
                        if let Some(last) = row.last_used_slot() {
                            cols = cols.max(last + 1);
                        }
                    }
                }
            }
            ch.effect_cols = cols.min(MAX_EFFECT_COLS) as u8;
        }
    }

    /// Distinct pattern count across all channels.
    pub fn pattern_count(&self) -> usize {
        self.channels.iter().map(|c| c.patterns.len()).sum()
    }
}

/// One channel: order list, pattern pool, reserved effect columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Channel {
    pub name: ArrayString<32>,
    /// Pattern index per order position
    pub orders: Vec<u8>,
    /// Pool of patterns owned by this channel
    pub patterns: BTreeMap<u8, Pattern>,
    /// Effect columns shown/reserved (1-8)
    pub effect_cols: u8,
    pub visible: bool,
}

impl Channel {
    pub fn new(orders_len: usize) -> Self {
        Self {
            name: ArrayString::new(),
            orders: alloc::vec![0; orders_len],
            patterns: BTreeMap::new(),
            effect_cols: 1,
            visible: true,
        }
    }

    pub fn pattern(&self, index: u8) -> Option<&Pattern> {
        self.patterns.get(&index)
    }

    /// Get a pattern, creating an empty one of `len` rows if missing.
    pub fn pattern_mut(&mut self, index: u8, len: usize) -> &mut Pattern {
        self.patterns.entry(index).or_insert_with(|| Pattern::new(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Effect, Note};

    #[test]
    fn orders_resize_all_channels() {
        let mut sub = Subsong::new(3, 64);
        sub.set_orders_len(4);
        sub.set_order_all(2, 7);
        assert!(sub.channels.iter().all(|c| c.orders == [0, 0, 7, 0]));
    }

    #[test]
    fn unique_patterns_do_not_alias() {
        let mut sub = Subsong::new(1, 4);
        sub.set_orders_len(2);
        sub.channels[0].pattern_mut(0, 4).rows[0].note = Note::On(60);

        sub.make_patterns_unique();
        assert_eq!(sub.channels[0].orders, [0, 1]);

        if let Some(row) = sub.row_at_mut(0, 1, 0) {
            row.note = Note::Off;
        }
        assert_eq!(sub.row_at(0, 0, 0).map(|r| r.note), Some(Note::On(60)));
        assert_eq!(sub.row_at(0, 1, 0).map(|r| r.note), Some(Note::Off));
    }

    #[test]
    fn duplicate_patterns_merge() {
        let mut sub = Subsong::new(1, 4);
        sub.set_orders_len(4);
        for (pos, index) in [5u8, 9, 7, 9].into_iter().enumerate() {
            sub.channels[0].orders[pos] = index;
        }
        sub.channels[0].pattern_mut(5, 4).rows[0].note = Note::On(60);
        sub.channels[0].pattern_mut(9, 4).rows[1].note = Note::Off;
        sub.channels[0].pattern_mut(7, 4).rows[0].note = Note::On(60);
        sub.channels[0].pattern_mut(3, 4);

        sub.merge_duplicate_patterns();
        assert_eq!(sub.channels[0].orders, [0, 1, 0, 1]);
        assert_eq!(sub.channels[0].patterns.len(), 2);
        assert_eq!(sub.row_at(0, 1, 1).map(|r| r.note), Some(Note::Off));
    }

    #[test]
    fn effect_columns_follow_content() {
        let mut sub = Subsong::new(2, 8);
        sub.channels[1].pattern_mut(0, 8).rows[3].effects[2] = Some(Effect::new(0x0A, 1));
        sub.fit_effect_columns();
        assert_eq!(sub.channels[0].effect_cols, 1);
        assert_eq!(sub.channels[1].effect_cols, 3);
    }

    #[test]
    fn system_channel_sum() {
        let mut song = Song::default();
        song.add_system(Chip::Ym2612);
        song.add_system(Chip::Sms);
        assert_eq!(song.system_channels(), 10);
    }
}
