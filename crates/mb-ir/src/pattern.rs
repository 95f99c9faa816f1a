//! Pattern and row types for per-channel sequences.

use alloc::vec::Vec;
use arrayvec::ArrayString;

/// Hard upper bound on effect columns per channel.
pub const MAX_EFFECT_COLS: usize = 8;

/// Semitone value of C-0. Notes count upwards from C-(-5) = 0.
pub const C0: u8 = 60;

/// A note value in a pattern row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Note {
    /// No note
    #[default]
    None,
    /// Note on, absolute semitone (0 = C-(-5), 60 = C-0, 108 = C-4)
    On(u8),
    /// Note off
    Off,
    /// Envelope release
    Release,
    /// Macro release only
    MacroRelease,
}

impl Note {
    /// Create a note from an octave (-5..=9) and semitone (0-11).
    ///
    /// Returns `Note::None` when the result falls outside the note range.
    pub const fn from_octave_semitone(octave: i8, semitone: u8) -> Self {
        let value = (octave as i16 + 5) * 12 + semitone as i16;
        if value < 0 || value > 179 {
            Note::None
        } else {
            Note::On(value as u8)
        }
    }

    /// Create a note from a semitone offset relative to C-0.
    pub const fn from_c0_offset(offset: i16) -> Self {
        let value = offset + C0 as i16;
        if value < 0 || value > 179 {
            Note::None
        } else {
            Note::On(value as u8)
        }
    }

    /// Get the octave if this is a note on.
    pub const fn octave(self) -> Option<i8> {
        match self {
            Note::On(n) => Some((n / 12) as i8 - 5),
            _ => None,
        }
    }

    /// Get the semitone (0-11) if this is a note on.
    pub const fn semitone(self) -> Option<u8> {
        match self {
            Note::On(n) => Some(n % 12),
            _ => None,
        }
    }

    /// Shift a note on by a number of octaves; other values pass through.
    pub const fn transpose_octaves(self, octaves: i8) -> Self {
        match self {
            Note::On(n) => Note::from_c0_offset(n as i16 - C0 as i16 + octaves as i16 * 12),
            other => other,
        }
    }

    pub const fn is_none(self) -> bool {
        matches!(self, Note::None)
    }
}

/// One canonical effect command. `value` of `None` means the slot holds a
/// command without a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Effect {
    pub cmd: u8,
    pub value: Option<u8>,
}

impl Effect {
    pub const fn new(cmd: u8, value: u8) -> Self {
        Self { cmd, value: Some(value) }
    }

    /// Parameter with an absent value read as zero.
    pub const fn param(self) -> u8 {
        match self.value {
            Some(v) => v,
            None => 0,
        }
    }
}

/// A single row of one channel's pattern.
///
/// Empty fields are `None`, which is distinct from a stored zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub note: Note,
    pub instrument: Option<u16>,
    pub volume: Option<u8>,
    pub effects: [Option<Effect>; MAX_EFFECT_COLS],
}

impl Row {
    /// Returns true if the row is completely empty.
    pub fn is_empty(&self) -> bool {
        self.note.is_none()
            && self.instrument.is_none()
            && self.volume.is_none()
            && self.effects.iter().all(Option::is_none)
    }

    /// Index of the first free effect slot.
    pub fn first_free_slot(&self) -> Option<usize> {
        self.effects.iter().position(Option::is_none)
    }

    /// Index of the last occupied effect slot.
    pub fn last_used_slot(&self) -> Option<usize> {
        self.effects.iter().rposition(Option::is_some)
    }

    /// Find the slot holding a given command.
    pub fn find_effect(&self, cmd: u8) -> Option<usize> {
        self.effects
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.cmd == cmd))
    }

    pub fn has_effect(&self, cmd: u8) -> bool {
        self.find_effect(cmd).is_some()
    }

    /// Iterate over occupied effect slots.
    pub fn effects(&self) -> impl Iterator<Item = Effect> + '_ {
        self.effects.iter().flatten().copied()
    }
}

/// A pattern: the rows of one channel for one pattern index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    pub name: ArrayString<64>,
    pub rows: Vec<Row>,
}

impl Pattern {
    /// Create a new pattern with `len` empty rows.
    pub fn new(len: usize) -> Self {
        Self {
            name: ArrayString::new(),
            rows: alloc::vec![Row::default(); len],
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(Row::is_empty)
    }

    /// Get a row, or `None` past the end.
    pub fn row(&self, row: usize) -> Option<&Row> {
        self.rows.get(row)
    }

    pub fn row_mut(&mut self, row: usize) -> Option<&mut Row> {
        self.rows.get_mut(row)
    }

    /// Resize to `len` rows, filling with empty rows.
    pub fn resize(&mut self, len: usize) {
        self.rows.resize(len, Row::default());
    }
}

/// Copy `s` into a fixed-capacity name, cutting at a char boundary.
pub fn bounded_name<const N: usize>(s: &str) -> ArrayString<N> {
    let mut name = ArrayString::new();
    for c in s.chars() {
        if name.try_push(c).is_err() {
            break;
        }
    }
    name
}
