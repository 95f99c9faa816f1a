//! Adlib Tracker II effect table.
//!
//! Files before version 5 use the old 16-command set with a nested `Fx`
//! extended table; later files use the 50-command set. Every command turns
//! into zero or more canonical effects, a volume, or a continuation mark.

use mb_ir::{fx, Effect, Row};

use super::continuation::Mark;
use super::Emitter;

mod old {
    pub const ARPEGGIO: u8 = 0x00;
    pub const SLIDE_UP: u8 = 0x01;
    pub const SLIDE_DOWN: u8 = 0x02;
    pub const SLIDE_UP_FINE: u8 = 0x03;
    pub const SLIDE_DOWN_FINE: u8 = 0x04;
    pub const TONE_PORTA: u8 = 0x05;
    pub const PORTA_VOL_SLIDE: u8 = 0x06;
    pub const VIBRATO: u8 = 0x07;
    pub const VIBRATO_VOL_SLIDE: u8 = 0x08;
    pub const OP_INTENSITY: u8 = 0x09;
    pub const INS_VOLUME: u8 = 0x0A;
    pub const PATTERN_BREAK: u8 = 0x0B;
    pub const POSITION_JUMP: u8 = 0x0C;
    pub const TEMPO: u8 = 0x0D;
    pub const TIMER: u8 = 0x0E;
    pub const EXTENDED: u8 = 0x0F;
}

/// Convert one `(command, parameter)` pair, writing into `row`. Returns the
/// slide the command keeps running when it has no canonical form itself.
pub(crate) fn convert(
    version: u8,
    cmd: u8,
    param: u8,
    row: &mut Row,
    out: &mut Emitter<'_>,
) -> Option<Mark> {
    if version < 5 {
        convert_old(cmd, param, row, out);
        None
    } else {
        convert_new(cmd, param, row, out)
    }
}

fn convert_old(cmd: u8, param: u8, row: &mut Row, out: &mut Emitter<'_>) {
    let lo = param & 15;
    let canonical = match cmd {
        old::ARPEGGIO | old::SLIDE_UP | old::SLIDE_DOWN => cmd,
        old::SLIDE_UP_FINE => fx::FINE_PORTA_UP,
        old::SLIDE_DOWN_FINE => fx::FINE_PORTA_DOWN,
        old::TONE_PORTA => fx::TONE_PORTA,
        old::PORTA_VOL_SLIDE => fx::PORTA_VOL_SLIDE,
        old::VIBRATO => fx::VIBRATO,
        old::VIBRATO_VOL_SLIDE => fx::VIBRATO_VOL_SLIDE,
        old::INS_VOLUME => {
            row.volume = Some(param);
            return;
        }
        old::PATTERN_BREAK => fx::BREAK,
        old::POSITION_JUMP => fx::JUMP,
        old::TEMPO => fx::TICK_RATE,
        old::EXTENDED => {
            match param >> 4 {
                0x9 => out.emit(row, fx::RETRIGGER, lo),
                0xE => out.emit(row, fx::FM_FEEDBACK, lo),
                sub => {
                    out.warn(format!("AT2 extended effect F{sub:X}x not supported"));
                    false
                }
            };
            return;
        }
        old::OP_INTENSITY | old::TIMER => {
            out.warn(format!("AT2 effect {cmd:X} not supported"));
            return;
        }
        _ => return,
    };
    out.emit(row, canonical, param);
}

/// F3/F4 from a split-nibble fine volume slide. False if both nibbles are 0.
fn fine_vol_slide(param: u8, row: &mut Row, out: &mut Emitter<'_>) -> bool {
    let (hi, lo) = (param >> 4, param & 15);
    if hi != 0 {
        out.emit(row, fx::FINE_VOL_UP, hi);
    } else if lo != 0 {
        out.emit(row, fx::FINE_VOL_DOWN, lo);
    } else {
        return false;
    }
    true
}

const EFFECT_NAMES: [&str; 50] = [
    "Arpeggio", "SlideUp", "SlideDown", "TonePorta", "Vibrato", "TonePortaVolSlide",
    "VibratoVolSlide", "SlideUpFine", "SlideDownFine", "ModulatorVolume", "VolSlide",
    "PositionJump", "InsVolume", "PatternBreak", "Tempo", "Speed", "TonePortaVolSlideFine",
    "VibratoVolSlideFine", "CarrierVolume", "Waveform", "VolSlideFine", "Retrigger", "Tremolo",
    "Tremor", "ArpeggioVolSlide", "ArpeggioVolSlideFine", "MultiRetrigger", "SlideUpVolSlide",
    "SlideDownVolSlide", "SlideUpFineVolSlide", "SlideDownFineVolSlide",
    "SlideUpVolSlideFine", "SlideDownVolSlideFine", "SlideUpFineVolSlideFine",
    "SlideDownFineVolSlideFine", "Extended", "Extended2", "GlobalVolume", "SwapArpeggio",
    "SwapVibrato", "ForceInsVolume", "Extended3", "ExtraFineArpeggio", "ExtraFineVibrato",
    "ExtraFineTremolo", "CustomSpeedTable", "GlobalSlideUp", "GlobalSlideDown",
    "GlobalSlideUpExtraFine", "GlobalSlideDownExtraFine",
];

fn unsupported(cmd: u8, out: &mut Emitter<'_>) {
    let name = EFFECT_NAMES.get(usize::from(cmd)).copied().unwrap_or("unknown");
    out.warn(format!("AT2 effect {name} ({cmd}) not supported"));
}

fn convert_new(cmd: u8, param: u8, row: &mut Row, out: &mut Emitter<'_>) -> Option<Mark> {
    let (hi, lo) = (param >> 4, param & 15);
    match cmd {
        // same numbering as the canonical set
        0 | 3 | 11 | 13 => {
            out.emit(row, cmd, param);
        }
        1 | 2 => {
            out.emit(row, cmd, param);
            return Some(Mark::Porta);
        }
        4 => {
            out.emit(row, fx::VIBRATO, param);
            return Some(Mark::Vibrato);
        }
        10 => {
            out.emit(row, fx::VOL_SLIDE, param);
            return Some(Mark::VolSlide);
        }
        5 => {
            out.emit(row, fx::PORTA_VOL_SLIDE, param);
            return Some(Mark::VolSlide);
        }
        6 => {
            out.emit(row, fx::VIBRATO_VOL_SLIDE, param);
            return Some(Mark::VolSlide);
        }
        7 => {
            out.emit(row, fx::FINE_PORTA_UP, param);
        }
        8 => {
            out.emit(row, fx::FINE_PORTA_DOWN, param);
        }
        9 => {
            out.emit(row, fx::FM_TL_OP1, 63u8.saturating_sub(param));
        }
        12 => row.volume = Some(param),
        14 => {
            out.emit(row, fx::TICK_RATE, param);
        }
        15 => {
            out.emit(row, fx::GROOVE, param);
        }
        16 => {
            if !fine_vol_slide(param, row, out) {
                return Some(Mark::FineVolSlide);
            }
        }
        17 => {
            if !fine_vol_slide(param, row, out) {
                return Some(Mark::Vibrato);
            }
        }
        18 => {
            out.emit(row, fx::FM_TL_OP2, 63u8.saturating_sub(param));
        }
        19 => {
            if hi != 0xF {
                out.emit(row, fx::FM_WAVEFORM, 0x20 | hi);
            }
            if lo != 0xF {
                out.emit(row, fx::FM_WAVEFORM, 0x10 | lo);
            }
        }
        20 | 25 | 33 | 34 => {
            fine_vol_slide(param, row, out);
        }
        21 => {
            out.emit(row, fx::RETRIGGER, param);
        }
        22 => {
            out.emit(row, fx::TREMOLO, param);
        }
        24 => {
            out.emit(row, fx::VOL_SLIDE, param);
            out.emit(row, fx::ARPEGGIO, param);
        }
        27 | 28 => {
            out.emit(row, fx::VOL_SLIDE, param);
            return Some(Mark::Porta);
        }
        29 | 30 => {
            out.emit(row, fx::VOL_SLIDE, param);
        }
        31 | 32 => {
            if !fine_vol_slide(param, row, out) {
                return Some(Mark::Porta);
            }
        }
        35 => extended(hi, lo, row, out),
        36 => match hi {
            2 => {
                out.emit(row, fx::NOTE_DELAY, lo);
            }
            3 => {
                out.emit(row, fx::NOTE_CUT, lo);
            }
            _ => out.warn(format!("AT2 Extended2 effect {hi:X}x not supported")),
        },
        41 => extended3(hi, lo, row, out),
        _ => unsupported(cmd, out),
    }
    None
}

fn extended(hi: u8, lo: u8, row: &mut Row, out: &mut Emitter<'_>) {
    let effect = match hi {
        1 => Effect::new(fx::VIBRATO_RANGE, lo),
        2 => Effect::new(fx::FM_AR_OP1, lo),
        3 => Effect::new(fx::FM_DR_OP1, lo),
        4 => Effect::new(fx::FM_SL, 0x10 | lo),
        5 => Effect::new(fx::FM_RR, 0x10 | lo),
        6 => Effect::new(fx::FM_AR_OP2, lo),
        7 => Effect::new(fx::FM_DR_OP2, lo),
        8 => Effect::new(fx::FM_SL, 0x20 | lo),
        9 => Effect::new(fx::FM_RR, 0x20 | lo),
        10 => Effect::new(fx::FM_FEEDBACK, lo),
        11 if lo <= 2 => Effect::new(fx::PANNING, [0x80, 0x00, 0xFF][usize::from(lo)]),
        15 if lo == 0 => Effect::new(fx::NOTE_CUT, 0),
        _ => {
            out.warn(format!("AT2 Extended effect {hi:X}{lo:X} not supported"));
            return;
        }
    };
    out.place(row, effect);
}

fn extended3(hi: u8, lo: u8, row: &mut Row, out: &mut Emitter<'_>) {
    // modulator (1..=6) and carrier (7..=12) operator registers
    const OPS: [u8; 6] = [fx::FM_MULT, fx::FM_KSL, fx::FM_AM, fx::FM_VIB, fx::FM_KSR, fx::FM_SUS];
    let effect = match hi {
        0 => Effect::new(fx::FM_ALG, lo),
        1..=6 => Effect::new(OPS[usize::from(hi - 1)], 0x10 | lo),
        7..=12 => Effect::new(OPS[usize::from(hi - 7)], 0x20 | lo),
        _ => {
            out.warn(format!("AT2 Extended3 effect {hi:X}x not supported"));
            return;
        }
    };
    out.place(row, effect);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Warnings;

    fn run(version: u8, cmd: u8, param: u8) -> (Row, Option<Mark>, Warnings) {
        let mut w = Warnings::new();
        let mut row = Row::default();
        let mark = convert(version, cmd, param, &mut row, &mut Emitter::new(8, &mut w));
        (row, mark, w)
    }

    fn fx_of(row: &Row) -> Vec<(u8, u8)> {
        row.effects().map(|e| (e.cmd, e.param())).collect()
    }

    #[test]
    fn old_table() {
        assert_eq!(fx_of(&run(4, 0x03, 0x12).0), [(0xF1, 0x12)]);
        assert_eq!(fx_of(&run(4, 0x0C, 0x05).0), [(0x0B, 5)]);
        assert_eq!(fx_of(&run(1, 0x0F, 0x93).0), [(0x0C, 3)]);
        assert_eq!(run(2, 0x0A, 0x20).0.volume, Some(0x20));
        let (row, _, w) = run(3, 0x0E, 1);
        assert!(row.is_empty());
        assert!(w.contains("not supported"));
    }

    #[test]
    fn slides_carry_marks() {
        let (row, mark, _) = run(9, 1, 0x10);
        assert_eq!(fx_of(&row), [(0x01, 0x10)]);
        assert_eq!(mark, Some(Mark::Porta));

        let (row, mark, _) = run(9, 16, 0x00);
        assert!(row.is_empty());
        assert_eq!(mark, Some(Mark::FineVolSlide));

        let (row, mark, _) = run(9, 16, 0x03);
        assert_eq!(fx_of(&row), [(0xF4, 3)]);
        assert_eq!(mark, None);
    }

    #[test]
    fn operator_levels_are_inverted() {
        assert_eq!(fx_of(&run(10, 9, 0x10).0), [(0x12, 0x2F)]);
        assert_eq!(fx_of(&run(10, 18, 0x50).0), [(0x13, 0)]);
    }

    #[test]
    fn waveform_splits_per_operator() {
        assert_eq!(fx_of(&run(11, 19, 0x2F).0), [(0x2A, 0x22)]);
        assert_eq!(fx_of(&run(11, 19, 0xF3).0), [(0x2A, 0x13)]);
    }

    #[test]
    fn nested_tables() {
        assert_eq!(fx_of(&run(9, 35, 0xB2).0), [(0x80, 0xFF)]);
        assert_eq!(fx_of(&run(9, 35, 0x84).0), [(0x51, 0x24)]);
        assert_eq!(fx_of(&run(9, 36, 0x25).0), [(0xED, 5)]);
        assert_eq!(fx_of(&run(12, 41, 0x85).0), [(0x54, 0x25)]);
        assert_eq!(fx_of(&run(12, 41, 0x03).0), [(0x5C, 3)]);
    }

    #[test]
    fn arpeggio_volume_slide_emits_both() {
        assert_eq!(fx_of(&run(9, 24, 0x37).0), [(0x0A, 0x37), (0x00, 0x37)]);
    }

    #[test]
    fn unhandled_commands_warn() {
        let (row, _, w) = run(14, 23, 0x11);
        assert!(row.is_empty());
        assert!(w.contains("Tremor"));
        let (_, _, w) = run(14, 60, 0);
        assert!(w.contains("unknown (60)"));
    }
}
