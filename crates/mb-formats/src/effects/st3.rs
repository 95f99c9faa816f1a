//! Scream Tracker 3 letter commands (S3M, IT).
//!
//! Letters only say what happens on their own row. Vibrato, volume slide,
//! portamento and arpeggio are collected while a row is read and committed
//! once the row ends: a canonical command is written when an axis starts,
//! stops or changes parameter. The first row of every pattern also restates
//! idle axes the channel is known to use, so patterns play the same in any
//! order.

use mb_ir::{fx, Effect, Row};

use super::Emitter;

/// Commit decision for one axis at row end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sustained {
    /// No transition this row.
    Idle,
    /// Running with this parameter.
    Active(u8),
    /// Was running on the previous row, not on this one.
    Stopping,
}

#[derive(Clone, Copy, Debug, Default)]
struct Track {
    memory: u8,
    changed: bool,
    now: bool,
    before: bool,
    /// The channel has used this axis; sticky across patterns.
    used: bool,
}

impl Track {
    fn touch(&mut self, value: u8) {
        if value != 0 {
            self.memory = value;
            self.changed = true;
        }
        self.now = true;
    }

    fn sustained(&self) -> Sustained {
        if self.now != self.before || self.changed {
            if self.now {
                Sustained::Active(self.memory)
            } else {
                Sustained::Stopping
            }
        } else {
            Sustained::Idle
        }
    }

    fn reset(&mut self) {
        *self = Track { used: self.used, ..Track::default() };
    }

    fn roll(&mut self) {
        self.before = self.now;
        self.now = false;
        self.changed = false;
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ChannelState {
    vibrato: Track,
    vol_slide: Track,
    porta: Track,
    /// Canonical command of the running pitch effect (01, 02 or 03).
    porta_cmd: u8,
    arpeggio: Track,
}

/// Letter-command engine for one pattern pool of up to `channels` channels.
pub struct St3Engine {
    channels: Vec<ChannelState>,
    first_row: bool,
}

impl St3Engine {
    pub fn new(channels: usize) -> Self {
        Self { channels: vec![ChannelState::default(); channels], first_row: true }
    }

    /// Record, before any pattern is converted, that `channel` uses the
    /// axis behind `letter` somewhere in the song.
    pub fn prescan(&mut self, channel: usize, letter: u8) {
        let Some(st) = self.channels.get_mut(channel) else { return };
        match letter {
            b'D' => st.vol_slide.used = true,
            b'E' | b'F' | b'G' => st.porta.used = true,
            b'H' => st.vibrato.used = true,
            b'J' => st.arpeggio.used = true,
            b'K' => {
                st.vol_slide.used = true;
                st.vibrato.used = true;
            }
            b'L' => {
                st.vol_slide.used = true;
                st.porta.used = true;
            }
            _ => {}
        }
    }

    /// Reset per-pattern state. Axis usage survives.
    pub fn start_pattern(&mut self) {
        for st in &mut self.channels {
            st.vibrato.reset();
            st.vol_slide.reset();
            st.porta.reset();
            st.arpeggio.reset();
            st.porta_cmd = 0;
        }
        self.first_row = true;
    }

    /// Translate one letter command (`b'A'..=b'Z'`). Immediate commands go
    /// straight into `row`; sustained ones wait for [`St3Engine::commit`].
    /// `retrigger` marks a row whose new note or instrument restarts a
    /// volume slide.
    #[allow(clippy::too_many_arguments)]
    pub fn effect(
        &mut self,
        channel: usize,
        letter: u8,
        value: u8,
        retrigger: bool,
        orders: &[u8],
        row: &mut Row,
        out: &mut Emitter<'_>,
    ) {
        let Some(st) = self.channels.get_mut(channel) else { return };
        let immediate = match letter {
            b'A' => Some(Effect::new(fx::SPEED, value)),
            b'B' => Some(Effect::new(fx::JUMP, orders.get(usize::from(value)).copied().unwrap_or(0))),
            b'C' => Some(Effect::new(fx::BREAK, value)),
            b'D' => {
                st.vol_slide.touch(value);
                if retrigger {
                    st.vol_slide.changed = true;
                }
                None
            }
            b'E' | b'F' | b'G' => {
                st.porta.touch(value);
                st.porta_cmd = match letter {
                    b'E' => fx::PORTA_DOWN,
                    b'F' => fx::PORTA_UP,
                    _ => fx::TONE_PORTA,
                };
                None
            }
            b'H' | b'U' => {
                st.vibrato.touch(value);
                None
            }
            b'J' => {
                st.arpeggio.touch(value);
                None
            }
            b'K' => {
                st.vol_slide.touch(value);
                st.vibrato.now = true;
                None
            }
            b'L' => {
                st.vol_slide.touch(value);
                st.porta.now = true;
                st.porta_cmd = fx::TONE_PORTA;
                None
            }
            b'O' => Some(Effect::new(fx::SAMPLE_OFFSET, value)),
            b'Q' => Some(Effect::new(fx::RETRIGGER, value & 15)),
            b'S' => match value >> 4 {
                0xC => Some(Effect::new(fx::NOTE_CUT, value & 15)),
                0xD => Some(Effect::new(fx::NOTE_DELAY, value & 15)),
                sub => {
                    out.warn(format!("effect S{sub:X}x not supported"));
                    None
                }
            },
            b'T' => Some(Effect::new(fx::BPM, value)),
            b'X' => Some(Effect::new(fx::PANNING, value)),
            b'I' | b'M' | b'N' | b'P' | b'R' | b'V' | b'W' | b'Y' | b'Z' => {
                out.warn(format!("effect {} not supported", letter as char));
                None
            }
            _ => None,
        };
        if let Some(e) = immediate {
            out.place(row, e);
        }
    }

    /// Write the sustained axes of `channel` into the row being finished.
    pub fn commit(&mut self, channel: usize, row: &mut Row, out: &mut Emitter<'_>) {
        let first = self.first_row;
        let Some(st) = self.channels.get_mut(channel) else { return };

        match st.vibrato.sustained() {
            Sustained::Active(v) => {
                out.emit(row, fx::VIBRATO, v);
                st.vibrato.used = true;
            }
            Sustained::Stopping => {
                out.emit(row, fx::VIBRATO, 0);
                st.vibrato.used = true;
            }
            Sustained::Idle if st.vibrato.used && first => {
                out.emit(row, fx::VIBRATO, 0);
            }
            Sustained::Idle => {}
        }

        match st.vol_slide.sustained() {
            Sustained::Active(v) if v >= 0xF1 => {
                out.emit(row, fx::SINGLE_VOL_DOWN, v & 15);
                st.vol_slide.now = false;
                st.vol_slide.used = true;
            }
            Sustained::Active(v) if v & 15 == 15 && v >= 0x10 => {
                out.emit(row, fx::SINGLE_VOL_UP, v >> 4);
                st.vol_slide.now = false;
                st.vol_slide.used = true;
            }
            Sustained::Active(v) => {
                out.emit(row, fx::FAST_VOL_SLIDE, v);
                st.vol_slide.used = true;
            }
            Sustained::Stopping => {
                out.emit(row, fx::FAST_VOL_SLIDE, 0);
                st.vol_slide.used = true;
            }
            Sustained::Idle if st.vol_slide.used && first => {
                out.emit(row, fx::FAST_VOL_SLIDE, 0);
            }
            Sustained::Idle => {}
        }

        match st.porta.sustained() {
            Sustained::Active(v) if v >= 0xE0 && st.porta_cmd != fx::TONE_PORTA => {
                // fine and extra fine slides happen once
                out.emit(row, st.porta_cmd | 0xF0, v & 15);
                st.porta.now = false;
                st.porta.used = true;
            }
            Sustained::Active(v) => {
                out.emit(row, st.porta_cmd, v);
                st.porta.used = true;
            }
            Sustained::Stopping => {
                out.emit(row, st.porta_cmd, 0);
                st.porta.used = true;
            }
            Sustained::Idle if st.porta.used && first => {
                out.emit(row, fx::PORTA_UP, 0);
            }
            Sustained::Idle => {}
        }

        match st.arpeggio.sustained() {
            Sustained::Active(v) => {
                out.emit(row, fx::ARPEGGIO, v);
                st.arpeggio.used = true;
            }
            Sustained::Stopping => {
                out.emit(row, fx::ARPEGGIO, 0);
                st.arpeggio.used = true;
            }
            Sustained::Idle if st.arpeggio.used && first => {
                out.emit(row, fx::ARPEGGIO, 0);
            }
            Sustained::Idle => {}
        }
    }

    /// Close the current row on every channel.
    pub fn end_row(&mut self) {
        for st in &mut self.channels {
            st.vibrato.roll();
            st.vol_slide.roll();
            st.porta.roll();
            st.arpeggio.roll();
        }
        self.first_row = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Warnings;

    /// Feed rows of optional `(letter, value)` on channel 0.
    fn run(engine: &mut St3Engine, cells: &[Option<(u8, u8)>]) -> (Vec<Vec<(u8, u8)>>, Warnings) {
        let mut w = Warnings::new();
        let mut rows = Vec::new();
        {
            let mut out = Emitter::new(8, &mut w);
            for cell in cells {
                let mut row = Row::default();
                if let Some((letter, value)) = *cell {
                    engine.effect(0, letter, value, false, &[3, 1, 2], &mut row, &mut out);
                }
                engine.commit(0, &mut row, &mut out);
                engine.end_row();
                rows.push(row.effects().map(|e| (e.cmd, e.param())).collect());
            }
        }
        (rows, w)
    }

    #[test]
    fn vibrato_start_and_stop() {
        let mut e = St3Engine::new(1);
        e.start_pattern();
        let (rows, _) = run(&mut e, &[Some((b'H', 0x46)), Some((b'H', 0)), None]);
        assert_eq!(rows[0], [(0x04, 0x46)]);
        assert!(rows[1].is_empty());
        assert_eq!(rows[2], [(0x04, 0)]);
    }

    #[test]
    fn fine_volume_slides_fire_once() {
        let mut e = St3Engine::new(1);
        e.start_pattern();
        let (rows, _) = run(&mut e, &[Some((b'D', 0xF3)), Some((b'D', 0)), Some((b'D', 0x2F))]);
        assert_eq!(rows[0], [(0xF9, 3)]);
        // the fine slide turned itself off, so the repeat is a new start
        assert_eq!(rows[1], [(0xF9, 3)]);
        assert_eq!(rows[2], [(0xF8, 2)]);
    }

    #[test]
    fn fine_porta_uses_f_form() {
        let mut e = St3Engine::new(1);
        e.start_pattern();
        let (rows, _) = run(&mut e, &[Some((b'F', 0xF4)), Some((b'E', 0x10)), None]);
        assert_eq!(rows[0], [(0xF1, 4)]);
        assert_eq!(rows[1], [(0x02, 0x10)]);
        assert_eq!(rows[2], [(0x02, 0)]);
    }

    #[test]
    fn used_axes_restated_on_first_row() {
        let mut e = St3Engine::new(1);
        e.prescan(0, b'K');
        e.start_pattern();
        let (rows, _) = run(&mut e, &[None, None]);
        assert_eq!(rows[0], [(0x04, 0), (0xFA, 0)]);
        assert!(rows[1].is_empty());
    }

    #[test]
    fn immediate_letters() {
        let mut e = St3Engine::new(1);
        e.start_pattern();
        let (rows, w) = run(
            &mut e,
            &[Some((b'B', 1)), Some((b'S', 0xD3)), Some((b'Q', 0x35)), Some((b'I', 0x11))],
        );
        assert_eq!(rows[0], [(0x0B, 1)]);
        assert_eq!(rows[1], [(0xED, 3)]);
        assert_eq!(rows[2], [(0x0C, 5)]);
        assert!(rows[3].is_empty());
        assert!(w.contains("effect I not supported"));
    }
}
