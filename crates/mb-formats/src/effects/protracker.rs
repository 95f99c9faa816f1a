//! ProTracker effect memory (MOD, XM).
//!
//! A source row holds a single effect that lasts one row. Canonical slides
//! keep running until stopped, so the engine tracks five sustained axes per
//! channel and writes the carrier command whenever an axis changes value,
//! including the `xx 00` stop form.

use mb_ir::{fx, Effect, Row};

use super::Emitter;

/// Sustained effect families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    Arpeggio,
    Pitch,
    Vibrato,
    Tremolo,
    VolSlide,
}

impl Axis {
    pub const ALL: [Axis; 5] =
        [Axis::Arpeggio, Axis::Pitch, Axis::Vibrato, Axis::Tremolo, Axis::VolSlide];

    const fn index(self) -> usize {
        self as usize
    }

    /// Command written when the axis changes outside a pitch effect.
    pub const fn carrier(self) -> u8 {
        match self {
            Axis::Arpeggio => fx::ARPEGGIO,
            Axis::Pitch => fx::PORTA_UP,
            Axis::Vibrato => fx::VIBRATO,
            Axis::Tremolo => fx::TREMOLO,
            Axis::VolSlide => fx::FAST_VOL_SLIDE,
        }
    }
}

/// Axes a channel touches anywhere in the song. Axes never used are never
/// committed, so a channel without vibrato gets no `04 00` noise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage([bool; 5]);

impl Usage {
    /// Record one source effect.
    pub fn note(&mut self, cmd: u8, value: u8) {
        match cmd {
            0x0 if value != 0 => self.mark(Axis::Arpeggio),
            0x1..=0x3 => self.mark(Axis::Pitch),
            0x4 => self.mark(Axis::Vibrato),
            0x5 => {
                self.mark(Axis::Pitch);
                self.mark(Axis::VolSlide);
            }
            0x6 => {
                self.mark(Axis::Vibrato);
                self.mark(Axis::VolSlide);
            }
            0x7 => self.mark(Axis::Tremolo),
            0xA if value != 0 => self.mark(Axis::VolSlide),
            _ => {}
        }
    }

    pub fn mark(&mut self, axis: Axis) {
        self.0[axis.index()] = true;
    }

    pub fn uses(&self, axis: Axis) -> bool {
        self.0[axis.index()]
    }
}

/// Last committed value on an axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sustain {
    /// Nothing committed yet in this pattern.
    #[default]
    Unknown,
    Idle,
    Active(u8),
}

impl Sustain {
    pub const fn from_param(value: u8) -> Self {
        if value == 0 {
            Sustain::Idle
        } else {
            Sustain::Active(value)
        }
    }

    pub const fn param(self) -> u8 {
        match self {
            Sustain::Active(v) => v,
            _ => 0,
        }
    }
}

/// How `Fxx` splits between speed and tempo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeedSplit {
    /// Values at or above the threshold set BPM.
    Bpm(u8),
    /// Every value is a speed.
    SpeedOnly,
}

/// Per-channel effect memory, reset at every pattern start.
#[derive(Clone, Debug)]
pub struct ChannelMemory {
    last_pitch_cmd: Option<u8>,
    last: [Sustain; 5],
    remembered: [Option<u8>; 5],
    speed: SpeedSplit,
}

impl ChannelMemory {
    pub fn new(speed: SpeedSplit) -> Self {
        Self {
            last_pitch_cmd: None,
            last: [Sustain::Unknown; 5],
            remembered: [None; 5],
            speed,
        }
    }

    /// Translate one row's source effect (0x0..=0xF) and commit the
    /// sustained axes the channel uses. Returns false for commands this
    /// engine does not know, after still committing the axes.
    pub fn convert(
        &mut self,
        usage: &Usage,
        cmd: u8,
        value: u8,
        row: &mut Row,
        out: &mut Emitter<'_>,
    ) -> bool {
        let mut state = [Sustain::Idle; 5];
        let known = self.immediate(cmd, value, &mut state, row, out);

        for axis in Axis::ALL {
            let i = axis.index();
            if !usage.uses(axis) {
                continue;
            }
            let changed = state[i] != self.last[i];
            // volume slides restart on a new volume even when unchanged
            let refresh =
                axis == Axis::VolSlide && state[i] != Sustain::Idle && row.volume.is_some();
            if changed || refresh {
                out.emit(row, axis.carrier(), state[i].param());
            }
        }
        self.last = state;
        known
    }

    fn immediate(
        &mut self,
        mut cmd: u8,
        mut value: u8,
        state: &mut [Sustain; 5],
        row: &mut Row,
        out: &mut Emitter<'_>,
    ) -> bool {
        match cmd {
            0x0 => state[Axis::Arpeggio.index()] = Sustain::from_param(value),
            0x1..=0x3 | 0x5 => {
                if cmd == 0x5 {
                    state[Axis::VolSlide.index()] = Sustain::from_param(value);
                    cmd = 0x3;
                    value = 0;
                }
                let p = Axis::Pitch.index();
                if cmd == 0x3 && value == 0 {
                    match self.remembered[p] {
                        Some(v) => value = v,
                        None => return true,
                    }
                }
                self.remembered[p] = Some(value);
                state[p] = Sustain::from_param(value);
                if state[p] != self.last[p]
                    || self.last_pitch_cmd != Some(cmd)
                    || (value != 0 && !row.note.is_none())
                {
                    out.emit(row, cmd, value);
                }
                self.last_pitch_cmd = Some(cmd);
                self.last[p] = state[p];
            }
            0x4 | 0x6 => {
                if cmd == 0x6 {
                    state[Axis::VolSlide.index()] = Sustain::from_param(value);
                    value = 0;
                }
                self.remember(Axis::Vibrato, value, state);
            }
            0x7 => self.remember(Axis::Tremolo, value, state),
            0x9 => {
                out.emit(row, fx::SAMPLE_OFFSET, value);
            }
            0xA => state[Axis::VolSlide.index()] = Sustain::from_param(value),
            0xB => {
                out.emit(row, fx::JUMP, value);
            }
            0xC => row.volume = Some(value.min(0x40)),
            0xD => {
                out.emit(row, fx::BREAK, (value >> 4) * 10 + (value & 15));
            }
            0xE => return self.extended(value >> 4, value & 15, row, out),
            0xF => {
                let bpm = matches!(self.speed, SpeedSplit::Bpm(t) if value >= t);
                out.emit(row, if bpm { fx::BPM } else { fx::SPEED }, value);
            }
            _ => return false,
        }
        true
    }

    /// Vibrato and tremolo with a zero parameter reuse the last one.
    fn remember(&mut self, axis: Axis, mut value: u8, state: &mut [Sustain; 5]) {
        let i = axis.index();
        if value == 0 {
            match self.remembered[i] {
                Some(v) => value = v,
                None => return,
            }
        }
        state[i] = Sustain::from_param(value);
        self.remembered[i] = Some(value);
    }

    fn extended(&mut self, sub: u8, x: u8, row: &mut Row, out: &mut Emitter<'_>) -> bool {
        let effect = match sub {
            0x0 => Effect::new(fx::FM_LFO, u8::from(x == 0)),
            0x1 => Effect::new(fx::FINE_PORTA_UP, x),
            0x2 => Effect::new(fx::FINE_PORTA_DOWN, x),
            0x4 => Effect::new(fx::VIBRATO_SHAPE, [0x00, 0x05, 0x06, 0x06][usize::from(x & 3)]),
            0x9 => Effect::new(fx::RETRIGGER, x),
            0xA => Effect::new(fx::SINGLE_VOL_UP, x),
            0xB => Effect::new(fx::SINGLE_VOL_DOWN, x),
            0xC => Effect::new(fx::NOTE_CUT, x),
            0xD => Effect::new(fx::NOTE_DELAY, x),
            _ => {
                out.warn(format!("extended effect E{sub:X}x not supported"));
                return true;
            }
        };
        out.place(row, effect);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Warnings;
    use mb_ir::Note;

    fn run(cells: &[(Note, u8, u8)]) -> Vec<Row> {
        let mut usage = Usage::default();
        for &(_, cmd, value) in cells {
            usage.note(cmd, value);
        }
        let mut w = Warnings::new();
        let mut out = Emitter::new(8, &mut w);
        let mut mem = ChannelMemory::new(SpeedSplit::Bpm(0x21));
        cells
            .iter()
            .map(|&(note, cmd, value)| {
                let mut row = Row { note, ..Row::default() };
                mem.convert(&usage, cmd, value, &mut row, &mut out);
                row
            })
            .collect()
    }

    fn fx_of(row: &Row) -> Vec<(u8, u8)> {
        row.effects().map(|e| (e.cmd, e.param())).collect()
    }

    #[test]
    fn slide_stops_explicitly() {
        let rows = run(&[(Note::None, 1, 5), (Note::None, 1, 5), (Note::None, 0, 0)]);
        assert_eq!(fx_of(&rows[0]), [(0x01, 5)]);
        assert!(fx_of(&rows[1]).is_empty());
        assert_eq!(fx_of(&rows[2]), [(0x01, 0)]);
    }

    #[test]
    fn porta_memory_reemits_on_new_note() {
        let rows = run(&[
            (Note::On(70), 3, 8),
            (Note::None, 3, 0),
            (Note::On(72), 3, 0),
        ]);
        assert_eq!(fx_of(&rows[0]), [(0x03, 8)]);
        assert!(fx_of(&rows[1]).is_empty());
        assert_eq!(fx_of(&rows[2]), [(0x03, 8)]);
    }

    #[test]
    fn unused_axes_stay_silent_and_used_ones_start_at_zero() {
        let rows = run(&[(Note::None, 0xF, 6), (Note::None, 4, 0x44)]);
        // vibrato is used by the channel, so row 0 commits it as stopped
        assert_eq!(fx_of(&rows[0]), [(0x0F, 6), (0x04, 0)]);
        assert_eq!(fx_of(&rows[1]), [(0x04, 0x44)]);
    }

    #[test]
    fn combined_vol_slide_uses_fast_slide() {
        let rows = run(&[(Note::None, 3, 4), (Note::None, 5, 0x20), (Note::None, 0, 0)]);
        assert_eq!(fx_of(&rows[0]), [(0x03, 4), (0xFA, 0)]);
        assert_eq!(fx_of(&rows[1]), [(0xFA, 0x20)]);
        assert_eq!(fx_of(&rows[2]), [(0x01, 0), (0xFA, 0)]);
    }

    #[test]
    fn break_is_decimal_and_tempo_split() {
        let rows = run(&[(Note::None, 0xD, 0x12), (Note::None, 0xF, 0x7D), (Note::None, 0xF, 0x20)]);
        assert_eq!(fx_of(&rows[0]), [(0x0D, 12)]);
        assert_eq!(fx_of(&rows[1]), [(0xF0, 0x7D)]);
        assert_eq!(fx_of(&rows[2]), [(0x0F, 0x20)]);
    }

    #[test]
    fn volume_effect_is_clamped() {
        let rows = run(&[(Note::None, 0xC, 0x50)]);
        assert_eq!(rows[0].volume, Some(0x40));
    }

    #[test]
    fn extended_table() {
        let rows = run(&[(Note::None, 0xE, 0x42), (Note::None, 0xE, 0xC3), (Note::None, 0xE, 0x00)]);
        assert_eq!(fx_of(&rows[0]), [(0xE3, 0x06)]);
        assert_eq!(fx_of(&rows[1]), [(0xEC, 3)]);
        assert_eq!(fx_of(&rows[2]), [(0x10, 1)]);
    }
}
