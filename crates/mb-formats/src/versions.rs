//! Version-keyed layout and compatibility tables.
//!
//! Decoders look their per-version shape up here once, right after the
//! version field is read, instead of branching on raw version numbers all
//! through the parse.

use mb_ir::Chip;

use crate::codecs::Codec;

// ---------------------------------------------------------------------------
// AdLib Tracker II (A2T / A2M)
// ---------------------------------------------------------------------------

/// Shape of the A2T variable header that follows the fixed header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum At2VarHeader {
    /// Six 16-bit block lengths.
    V1234,
    /// Common flag and ten 16-bit block lengths.
    V5678,
    /// Song geometry and twenty 32-bit block lengths.
    V9,
    /// V9 plus 4-op and lock flags.
    V10,
    /// V10 with a 21st block length.
    V11,
}

/// Storage order and size of one packed pattern group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct At2Patterns {
    /// Compressed groups in the file.
    pub groups: usize,
    /// Patterns per group.
    pub per_group: usize,
    /// Channels stored per pattern.
    pub channels: usize,
    /// Rows stored per pattern.
    pub rows: usize,
    /// Bytes per cell: note, instrument, then one or two effect pairs.
    pub cell: usize,
    /// Cells are stored `[row][channel]` rather than `[channel][row]`.
    pub row_major: bool,
}

impl At2Patterns {
    pub const fn pattern_bytes(&self) -> usize {
        self.channels * self.rows * self.cell
    }

    pub const fn group_bytes(&self) -> usize {
        self.per_group * self.pattern_bytes()
    }

    pub const fn effects_per_cell(&self) -> usize {
        (self.cell - 2) / 2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct At2Layout {
    pub version: u8,
    pub codec: Codec,
    pub var_header: At2VarHeader,
    /// Instrument slots stored.
    pub instruments: usize,
    /// Bytes per instrument record.
    pub instrument_size: usize,
    /// A2M length-table entries.
    pub a2m_lengths: usize,
    /// A2M length-table entries are 32-bit.
    pub wide_lengths: bool,
    /// A2T block holding the order list.
    pub orders_block: usize,
    /// A2T block holding the first pattern group.
    pub patterns_block: usize,
    pub patterns: At2Patterns,
}

impl At2Layout {
    /// Effect numbering switched to the extended table.
    pub const fn new_effects(&self) -> bool {
        self.version >= 5
    }

    /// FM register macros and arpeggio/vibrato tables present.
    pub const fn has_macro_tables(&self) -> bool {
        self.version >= 9
    }

    /// Paired 4-op tracks selected by the song's 4-op flags.
    pub const fn has_4op_tracks(&self) -> bool {
        self.version >= 10
    }

    /// Per-instrument disabled macro columns and pattern names.
    pub const fn has_disabled_columns(&self) -> bool {
        self.version >= 11
    }

    /// Instrument block carries 4-op pair flags and a message area.
    pub const fn has_4op_instruments(&self) -> bool {
        self.version >= 12
    }

    /// Instrument block starts with BPM data.
    pub const fn has_bpm(&self) -> bool {
        self.version >= 14
    }
}

const AT2_OLD_PATTERNS: At2Patterns =
    At2Patterns { groups: 4, per_group: 16, channels: 9, rows: 64, cell: 4, row_major: true };
const AT2_MID_PATTERNS: At2Patterns =
    At2Patterns { groups: 8, per_group: 8, channels: 18, rows: 64, cell: 4, row_major: false };
const AT2_NEW_PATTERNS: At2Patterns =
    At2Patterns { groups: 16, per_group: 8, channels: 20, rows: 256, cell: 6, row_major: false };

/// Layout of AT2 files of `version` (1..=14).
pub fn at2_layout(version: u8) -> Option<At2Layout> {
    let codec = Codec::for_at2_version(version)?;
    let layout = match version {
        1..=4 => At2Layout {
            version,
            codec,
            var_header: At2VarHeader::V1234,
            instruments: 250,
            instrument_size: 13,
            a2m_lengths: 5,
            wide_lengths: false,
            orders_block: 1,
            patterns_block: 2,
            patterns: AT2_OLD_PATTERNS,
        },
        5..=8 => At2Layout {
            version,
            codec,
            var_header: At2VarHeader::V5678,
            instruments: 250,
            instrument_size: 13,
            a2m_lengths: 9,
            wide_lengths: false,
            orders_block: 1,
            patterns_block: 2,
            patterns: AT2_MID_PATTERNS,
        },
        9 | 10 => At2Layout {
            version,
            codec,
            var_header: if version == 9 { At2VarHeader::V9 } else { At2VarHeader::V10 },
            instruments: 255,
            instrument_size: 14,
            a2m_lengths: 17,
            wide_lengths: true,
            orders_block: 3,
            patterns_block: 4,
            patterns: AT2_NEW_PATTERNS,
        },
        _ => At2Layout {
            version,
            codec,
            var_header: At2VarHeader::V11,
            instruments: 255,
            instrument_size: 14,
            a2m_lengths: 17,
            wide_lengths: true,
            orders_block: 4,
            patterns_block: 5,
            patterns: AT2_NEW_PATTERNS,
        },
    };
    Some(layout)
}

/// Song-to-chip channel order for AT2 tracks. Tracks 7-9 land on the
/// OPL3 channels that pair into 4-op voices last.
pub const AT2_CHANNEL_MAP: [usize; 20] =
    [0, 1, 2, 3, 4, 5, 12, 13, 14, 6, 7, 8, 9, 10, 11, 15, 16, 17, 18, 19];

// ---------------------------------------------------------------------------
// DefleMask (DMF)
// ---------------------------------------------------------------------------

/// Newest DMF version the decoder reads.
pub const DMF_MAX_VERSION: u8 = 0x1B;

/// A DMF system id and the chips it expands to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmfSystem {
    pub id: u8,
    pub name: &'static str,
    /// Chips in channel order, with the mix volume of each.
    pub chips: &'static [(Chip, u8)],
}

impl DmfSystem {
    pub fn channels(&self) -> usize {
        self.chips.iter().map(|(c, _)| c.channels()).sum()
    }
}

pub mod dmf_system {
    pub const YMU759: u8 = 0x01;
    pub const GENESIS: u8 = 0x02;
    pub const SMS: u8 = 0x03;
    pub const GAME_BOY: u8 = 0x04;
    pub const PC_ENGINE: u8 = 0x05;
    pub const NES: u8 = 0x06;
    pub const C64_8580: u8 = 0x07;
    pub const ARCADE: u8 = 0x08;
    pub const NEO_GEO: u8 = 0x09;
    pub const GENESIS_EXT: u8 = 0x42;
    pub const SMS_OPLL: u8 = 0x43;
    pub const NES_VRC7: u8 = 0x46;
    pub const C64_6581: u8 = 0x47;
    pub const NEO_GEO_EXT: u8 = 0x49;
    pub const NES_FDS: u8 = 0x86;
}

/// Mix volumes are percent.
const DMF_SYSTEMS: [DmfSystem; 15] = {
    use dmf_system::*;
    [
        DmfSystem { id: YMU759, name: "Yamaha YMU759", chips: &[(Chip::Ymu759, 100)] },
        DmfSystem {
            id: GENESIS,
            name: "Sega Genesis",
            chips: &[(Chip::Ym2612, 100), (Chip::Sms, 50)],
        },
        DmfSystem { id: SMS, name: "Sega Master System", chips: &[(Chip::Sms, 100)] },
        DmfSystem { id: GAME_BOY, name: "Game Boy", chips: &[(Chip::GameBoy, 100)] },
        DmfSystem { id: PC_ENGINE, name: "PC Engine", chips: &[(Chip::PcEngine, 100)] },
        DmfSystem { id: NES, name: "NES", chips: &[(Chip::Nes, 100)] },
        DmfSystem { id: C64_8580, name: "Commodore 64 (8580)", chips: &[(Chip::C64_8580, 100)] },
        DmfSystem {
            id: ARCADE,
            name: "Arcade",
            chips: &[(Chip::Ym2151, 100), (Chip::SegaPcm, 100)],
        },
        DmfSystem { id: NEO_GEO, name: "Neo Geo", chips: &[(Chip::Ym2610, 100)] },
        DmfSystem {
            id: GENESIS_EXT,
            name: "Sega Genesis (extended ch3)",
            chips: &[(Chip::Ym2612Ext, 100), (Chip::Sms, 50)],
        },
        DmfSystem {
            id: SMS_OPLL,
            name: "Sega Master System + FM",
            chips: &[(Chip::Sms, 100), (Chip::Opll, 100)],
        },
        DmfSystem { id: NES_VRC7, name: "NES + VRC7", chips: &[(Chip::Nes, 100), (Chip::Vrc7, 100)] },
        DmfSystem { id: C64_6581, name: "Commodore 64 (6581)", chips: &[(Chip::C64_6581, 100)] },
        DmfSystem {
            id: NEO_GEO_EXT,
            name: "Neo Geo (extended ch2)",
            chips: &[(Chip::Ym2610Ext, 100)],
        },
        DmfSystem { id: NES_FDS, name: "Famicom Disk System", chips: &[(Chip::Nes, 100), (Chip::Fds, 100)] },
    ]
};

pub fn dmf_system(id: u8) -> Option<DmfSystem> {
    DMF_SYSTEMS.iter().find(|s| s.id == id).copied()
}

/// Field presence and legacy value fixes of one DMF version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmfLayout(pub u8);

impl DmfLayout {
    /// System byte present; earlier files are all YMU759.
    pub const fn has_system(self) -> bool {
        self.0 >= 0x09
    }

    pub const fn has_highlights(self) -> bool {
        self.0 > 0x0C
    }

    /// Second speed, PAL flag and custom tempo flag.
    pub const fn has_tick_settings(self) -> bool {
        self.0 > 0x07
    }

    pub const fn has_custom_hz(self) -> bool {
        self.0 > 0x0A
    }

    pub const fn wide_pattern_length(self) -> bool {
        self.0 > 0x17
    }

    pub const fn has_arp_tick(self) -> bool {
        self.0 > 0x03 && self.0 < 0x14
    }

    pub const fn has_pattern_names(self) -> bool {
        self.0 > 0x18
    }

    /// Per-channel starting instrument after the order matrix.
    pub const fn has_column_instruments(self) -> bool {
        self.0 > 0x03 && self.0 < 0x06
    }

    pub const fn has_instrument_names(self) -> bool {
        self.0 > 0x05
    }

    /// Instrument mode byte; earlier instruments are all FM.
    pub const fn has_instrument_mode(self) -> bool {
        self.0 >= 0x0B
    }

    /// OPL-style operator fields interleaved with the OPN ones.
    pub const fn legacy_operators(self) -> bool {
        self.0 < 0x13
    }

    pub const fn has_ksr(self) -> bool {
        self.0 < 0x11
    }

    /// Per-operator RS/DT/D2R/SSG bytes (KSR/VIB/KSL/SSG on OPLL).
    pub const fn has_extended_operators(self) -> bool {
        self.0 > 0x05
    }

    /// C64 "volume is cutoff" flag stored as 32 bits.
    pub const fn wide_cutoff_flag(self) -> bool {
        self.0 < 0x11
    }

    /// Macro values are 32-bit.
    pub const fn wide_macros(self) -> bool {
        self.0 >= 0x0E
    }

    pub const fn has_arp_mode(self) -> bool {
        self.0 > 0x0F
    }

    /// Game Boy instruments carry a hardware envelope instead of a volume macro.
    pub const fn has_gb_envelope(self) -> bool {
        self.0 > 0x11
    }

    pub const fn has_wavetables(self) -> bool {
        self.0 > 0x0B
    }

    /// FDS waves were 4-bit.
    pub const fn narrow_fds_waves(self) -> bool {
        self.0 < 0x1A
    }

    pub const fn has_effect_columns(self) -> bool {
        self.0 >= 0x0A
    }

    /// Rows hold 16-bit fields; older rows are bytes.
    pub const fn wide_rows(self) -> bool {
        self.0 > 0x08
    }

    /// Volumes stored 00-FF.
    pub const fn full_range_volume(self) -> bool {
        self.0 < 0x0A
    }

    /// SMS and Genesis PSG notes an octave high.
    pub const fn high_psg_octave(self) -> bool {
        self.0 < 0x0E
    }

    /// Game Boy noise two octaves low and wave channel volume 0-3.
    pub const fn legacy_gb_channels(self) -> bool {
        self.0 < 0x12
    }

    /// E5 pitch stored at four times the resolution.
    pub const fn coarse_e5(self) -> bool {
        self.0 < 0x14
    }

    pub const fn has_sample_names(self) -> bool {
        self.0 > 0x16
    }

    /// Rate, pitch and amplitude bytes.
    pub const fn has_sample_params(self) -> bool {
        self.0 >= 0x0B
    }

    pub const fn has_sample_depth(self) -> bool {
        self.0 > 0x15
    }

    pub const fn has_sample_cut(self) -> bool {
        self.0 >= 0x1B
    }

    /// Sample length counts bytes rather than 16-bit frames.
    pub const fn byte_sample_length(self) -> bool {
        self.0 < 0x0B
    }

    /// YMZ ADPCM sample data.
    pub const fn adpcm_samples(self) -> bool {
        self.0 <= 0x08
    }
}

/// Sample rates selectable in DMF files.
pub const DMF_SAMPLE_RATES: [u32; 6] = [4000, 8000, 11025, 16000, 22050, 32000];

/// Playback speed factors of the DMF sample pitch setting; 5 is unity.
pub const DMF_SAMPLE_PITCHES: [f64; 11] =
    [1.0 / 6.0, 0.2, 0.25, 1.0 / 3.0, 0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
