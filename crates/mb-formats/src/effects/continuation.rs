//! Continuation pass for AT2 and RAD songs.
//!
//! Both trackers only run a slide on the rows that carry it. After a
//! subsong is fully decoded this pass walks each channel in playback
//! order, following jumps and breaks, and rewrites the rows so that a
//! slide starts once, repeats are dropped and an explicit `xx 00` stops it.

use std::collections::BTreeMap;

use mb_ir::{fx, Note, Row, Subsong, MAX_EFFECT_COLS};

use super::{clear_slot, Emitter};

/// Source effects that keep a slide running without a canonical command
/// of their own, such as an AT2 fine volume slide with a zero parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mark {
    Porta,
    Vibrato,
    VolSlide,
    FineVolSlide,
}

impl Mark {
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Marks keyed by channel, source pattern index and row.
#[derive(Clone, Debug, Default)]
pub struct Marks(BTreeMap<(usize, u8, usize), u8>);

impl Marks {
    pub fn insert(&mut self, channel: usize, pattern: u8, row: usize, mark: Mark) {
        *self.0.entry((channel, pattern, row)).or_default() |= mark.bit();
    }

    pub fn has(&self, channel: usize, pattern: u8, row: usize, mark: Mark) -> bool {
        self.0.get(&(channel, pattern, row)).is_some_and(|m| m & mark.bit() != 0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Next position after a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Next,
    Jump(usize),
    Break(usize),
}

/// First forward jump or break on any channel at `(pos, row)`.
fn flow_at(sub: &Subsong, pos: usize, row: usize) -> Flow {
    for ch in 0..sub.channels.len() {
        let Some(r) = sub.row_at(ch, pos, row) else { continue };
        for e in r.effects() {
            match e.cmd {
                fx::JUMP if usize::from(e.param()) > pos => return Flow::Jump(e.param().into()),
                fx::BREAK if pos + 1 < sub.orders_len => return Flow::Break(e.param().into()),
                _ => {}
            }
        }
    }
    Flow::Next
}

/// Visit the rows of `channel` in playback order. Jumps only go forward,
/// so the walk always ends.
fn walk(sub: &mut Subsong, channel: usize, mut visit: impl FnMut(&mut Row, usize, usize)) {
    let (mut pos, mut row) = (0, 0);
    while pos < sub.orders_len {
        if row >= sub.pat_len {
            pos += 1;
            row = 0;
            continue;
        }
        if let Some(r) = sub.row_at_mut(channel, pos, row) {
            visit(r, pos, row);
        }
        match flow_at(sub, pos, row) {
            Flow::Next => row += 1,
            Flow::Jump(target) => {
                pos = target;
                row = 0;
            }
            Flow::Break(target) => {
                pos += 1;
                row = if target < sub.pat_len { target } else { 0 };
            }
        }
    }
}

/// One slide family on one channel.
#[derive(Clone, Copy, Debug, Default)]
struct Slide {
    now: bool,
    before: bool,
    speed: Option<u8>,
    dir: i8,
    dir_before: i8,
}

impl Slide {
    /// Record a source effect. Returns true if it repeats the running
    /// slide and can be dropped.
    fn hit(&mut self, param: u8, dir: i8) -> bool {
        self.now = true;
        self.dir = dir;
        let repeat = self.speed == Some(param) && dir == self.dir_before;
        self.speed = Some(param);
        repeat
    }

    fn mark(&mut self) {
        self.now = true;
        self.speed = None;
    }

    /// True once, on the first row without the slide.
    fn stopped(&mut self) -> bool {
        let stop = !self.now && self.before;
        if stop {
            self.speed = None;
        }
        stop
    }

    fn roll(&mut self) {
        self.before = self.now;
        self.dir_before = self.dir;
        self.now = false;
    }
}

#[derive(Default)]
struct At2Channel {
    porta: Slide,
    vibrato: Slide,
    tone_porta: Slide,
    vol_slide: Slide,
    fine_vol: Slide,
    tremolo: Slide,
}

impl At2Channel {
    fn row(&mut self, row: &mut Row, marked: impl Fn(Mark) -> bool, out: &mut Emitter<'_>) {
        if marked(Mark::Porta) {
            self.porta.mark();
        }
        if marked(Mark::Vibrato) {
            self.vibrato.mark();
        }
        if marked(Mark::VolSlide) {
            self.vol_slide.mark();
        }
        if marked(Mark::FineVolSlide) {
            self.fine_vol.mark();
        }

        for slot in 0..MAX_EFFECT_COLS {
            let Some(e) = row.effects[slot] else { continue };
            let p = e.param();
            let repeat = match e.cmd {
                fx::PORTA_UP => self.porta.hit(p, 1),
                fx::PORTA_DOWN => self.porta.hit(p, -1),
                fx::VIBRATO => self.vibrato.hit(p, 0),
                fx::TONE_PORTA => self.tone_porta.hit(p, 0),
                fx::VOL_SLIDE => self.vol_slide.hit(p, 0),
                fx::FINE_VOL_UP => self.fine_vol.hit(p, 1),
                fx::FINE_VOL_DOWN => self.fine_vol.hit(p, -1),
                fx::TREMOLO => self.tremolo.hit(p, 0),
                _ => false,
            };
            if repeat {
                clear_slot(row, slot);
            }
        }

        let stops = [
            (&mut self.porta, fx::PORTA_UP),
            (&mut self.vibrato, fx::VIBRATO),
            (&mut self.vol_slide, fx::VOL_SLIDE),
            (&mut self.fine_vol, fx::FINE_VOL_UP),
            (&mut self.tremolo, fx::TREMOLO),
            (&mut self.tone_porta, fx::TONE_PORTA),
        ];
        for (slide, cmd) in stops {
            if slide.stopped() {
                out.emit(row, cmd, 0);
            }
            slide.roll();
        }
    }
}

/// Rewrite an AT2 subsong. Patterns are made unique first so edits at one
/// order position never leak into another; `marks` are looked up by the
/// pattern each position played before that.
pub fn apply_at2(sub: &mut Subsong, marks: &Marks, out: &mut Emitter<'_>) {
    let source: Vec<Vec<u8>> = sub.channels.iter().map(|c| c.orders.clone()).collect();
    sub.make_patterns_unique();
    for (channel, orders) in source.iter().enumerate() {
        let mut state = At2Channel::default();
        walk(sub, channel, |row, pos, r| {
            let pattern = orders.get(pos).copied().unwrap_or(0);
            state.row(row, |m| marks.has(channel, pattern, r, m), out);
        });
    }
}

struct RadChannel {
    porta: Slide,
    vol_slide: Slide,
    /// Volume the channel is known to play at; `None` after a slide.
    volume: Option<u8>,
}

impl RadChannel {
    fn new() -> Self {
        Self { porta: Slide::default(), vol_slide: Slide::default(), volume: Some(0) }
    }

    fn row(&mut self, row: &mut Row, out: &mut Emitter<'_>) {
        for slot in 0..MAX_EFFECT_COLS {
            let Some(e) = row.effects[slot] else { continue };
            let p = e.param();
            let drop = match e.cmd {
                fx::PORTA_UP => self.porta.hit(p, 1),
                fx::PORTA_DOWN => self.porta.hit(p, -1),
                fx::TONE_PORTA => p == 0,
                fx::VOL_SLIDE => {
                    self.volume = None;
                    self.vol_slide.hit(p, 0)
                }
                _ => false,
            };
            if drop {
                clear_slot(row, slot);
            }
        }

        if row.volume.is_some() {
            self.volume = row.volume;
        }
        // RAD notes restart at full volume
        if matches!(row.note, Note::On(_)) && row.volume.is_none() && self.volume != Some(0x3F) {
            row.volume = Some(0x3F);
            self.volume = Some(0x3F);
        }

        let tone_porta_first = matches!(row.effects[0], Some(e) if e.cmd == fx::TONE_PORTA);
        if self.porta.stopped() && !tone_porta_first {
            out.emit(row, fx::PORTA_UP, 0);
        }
        if self.vol_slide.stopped() {
            out.emit(row, fx::VOL_SLIDE, 0);
        }
        self.porta.roll();
        self.vol_slide.roll();
    }
}

/// Rewrite one RAD subsong (the main song or a riff). Patterns are made
/// unique first, as for AT2.
pub fn apply_rad(sub: &mut Subsong, out: &mut Emitter<'_>) {
    sub.make_patterns_unique();
    for channel in 0..sub.channels.len() {
        let mut state = RadChannel::new();
        walk(sub, channel, |row, _, _| state.row(row, out));
    }
}
