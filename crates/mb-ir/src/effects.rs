//! Canonical effect vocabulary.
//!
//! Every decoder translates its source commands into these codes. Values
//! are stored alongside in [`crate::Effect`].

pub const ARPEGGIO: u8 = 0x00;
pub const PORTA_UP: u8 = 0x01;
pub const PORTA_DOWN: u8 = 0x02;
pub const TONE_PORTA: u8 = 0x03;
pub const VIBRATO: u8 = 0x04;
pub const VIBRATO_VOL_SLIDE: u8 = 0x05;
pub const PORTA_VOL_SLIDE: u8 = 0x06;
pub const TREMOLO: u8 = 0x07;
pub const PANNING_SPLIT: u8 = 0x08;
pub const GROOVE: u8 = 0x09;
pub const VOL_SLIDE: u8 = 0x0A;
pub const JUMP: u8 = 0x0B;
pub const RETRIGGER: u8 = 0x0C;
pub const BREAK: u8 = 0x0D;
pub const SPEED: u8 = 0x0F;

/// FM LFO / AM depth toggle
pub const FM_LFO: u8 = 0x10;
pub const FM_FEEDBACK: u8 = 0x11;
/// Operator 1 total level; 0x13..=0x15 address operators 2-4.
pub const FM_TL_OP1: u8 = 0x12;
pub const FM_TL_OP2: u8 = 0x13;
pub const FM_MULT: u8 = 0x16;
pub const FM_VIB_DEPTH: u8 = 0x17;
pub const FM_AR_ALL: u8 = 0x19;
pub const FM_AR_OP1: u8 = 0x1A;
pub const FM_AR_OP2: u8 = 0x1B;
pub const FM_WAVEFORM: u8 = 0x2A;
pub const FM_AM: u8 = 0x50;
pub const FM_SL: u8 = 0x51;
pub const FM_RR: u8 = 0x52;
pub const FM_VIB: u8 = 0x53;
pub const FM_KSL: u8 = 0x54;
pub const FM_SUS: u8 = 0x55;
pub const FM_DR_OP1: u8 = 0x57;
pub const FM_DR_OP2: u8 = 0x58;
pub const FM_KSR: u8 = 0x5B;
pub const FM_ALG: u8 = 0x5C;

pub const PANNING: u8 = 0x80;
pub const SAMPLE_OFFSET: u8 = 0x91;

/// Player hint: riff start (RAD)
pub const RIFF_START: u8 = 0xA0;
/// Player hint: transposed riff (RAD)
pub const RIFF_TRANSPOSE: u8 = 0xA1;

pub const TICK_RATE: u8 = 0xC0;
pub const NOTE_SLIDE_UP: u8 = 0xE1;
pub const NOTE_SLIDE_DOWN: u8 = 0xE2;
pub const VIBRATO_SHAPE: u8 = 0xE3;
pub const VIBRATO_RANGE: u8 = 0xE4;
pub const FINE_PITCH: u8 = 0xE5;
pub const NOTE_CUT: u8 = 0xEC;
pub const NOTE_DELAY: u8 = 0xED;
pub const BPM: u8 = 0xF0;
pub const FINE_PORTA_UP: u8 = 0xF1;
pub const FINE_PORTA_DOWN: u8 = 0xF2;
pub const FINE_VOL_UP: u8 = 0xF3;
pub const FINE_VOL_DOWN: u8 = 0xF4;
pub const SINGLE_VOL_UP: u8 = 0xF8;
pub const SINGLE_VOL_DOWN: u8 = 0xF9;
pub const FAST_VOL_SLIDE: u8 = 0xFA;
pub const STOP_SONG: u8 = 0xFF;

/// Short display name for a canonical command.
pub fn name(cmd: u8) -> &'static str {
    match cmd {
        ARPEGGIO => "Arpeggio",
        PORTA_UP => "PortaUp",
        PORTA_DOWN => "PortaDown",
        TONE_PORTA => "TonePorta",
        VIBRATO => "Vibrato",
        VIBRATO_VOL_SLIDE => "VibratoVolSlide",
        PORTA_VOL_SLIDE => "PortaVolSlide",
        TREMOLO => "Tremolo",
        PANNING_SPLIT => "PanningSplit",
        GROOVE => "Groove",
        VOL_SLIDE => "VolSlide",
        JUMP => "Jump",
        RETRIGGER => "Retrigger",
        BREAK => "Break",
        SPEED => "Speed",
        FM_LFO => "FmLfo",
        FM_FEEDBACK => "FmFeedback",
        0x12..=0x15 => "FmTotalLevel",
        FM_MULT => "FmMultiplier",
        FM_VIB_DEPTH => "FmVibratoDepth",
        FM_AR_ALL..=0x1E => "FmAttack",
        FM_WAVEFORM => "FmWaveform",
        FM_AM => "FmAm",
        FM_SL => "FmSustainLevel",
        FM_RR => "FmRelease",
        FM_VIB => "FmVib",
        FM_KSL => "FmKsl",
        FM_SUS => "FmSustain",
        0x56..=0x5A => "FmDecay",
        FM_KSR => "FmKsr",
        FM_ALG => "FmAlgorithm",
        PANNING => "Panning",
        SAMPLE_OFFSET => "SampleOffset",
        RIFF_START | RIFF_TRANSPOSE => "Riff",
        TICK_RATE => "TickRate",
        NOTE_SLIDE_UP => "NoteSlideUp",
        NOTE_SLIDE_DOWN => "NoteSlideDown",
        VIBRATO_SHAPE => "VibratoShape",
        VIBRATO_RANGE => "VibratoRange",
        FINE_PITCH => "FinePitch",
        NOTE_CUT => "NoteCut",
        NOTE_DELAY => "NoteDelay",
        BPM => "Bpm",
        FINE_PORTA_UP => "FinePortaUp",
        FINE_PORTA_DOWN => "FinePortaDown",
        FINE_VOL_UP => "FineVolUp",
        FINE_VOL_DOWN => "FineVolDown",
        SINGLE_VOL_UP => "SingleVolUp",
        SINGLE_VOL_DOWN => "SingleVolDown",
        FAST_VOL_SLIDE => "FastVolSlide",
        STOP_SONG => "StopSong",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_ranges() {
        assert_eq!(name(0x14), "FmTotalLevel");
        assert_eq!(name(0x58), "FmDecay");
        assert_eq!(name(0xFF), "StopSong");
        assert_eq!(name(0xFE), "Unknown");
    }
}
