//! Effect normalization.
//!
//! Source formats each have their own effect vocabulary and their own idea
//! of which effects keep running on rows that do not repeat them. The
//! engines here translate into the canonical [`mb_ir::fx`] commands and make
//! every start and stop explicit.
//!
//! - [`protracker`]: MOD/XM effect memory
//! - [`st3`]: S3M/IT letter commands committed at row end
//! - [`continuation`]: AT2/RAD pass over a whole subsong in playback order
//! - `at2`: the AT2 command table

pub(crate) mod at2;
pub mod continuation;
pub mod protracker;
pub mod st3;

use mb_ir::{fx, Effect, Row, MAX_EFFECT_COLS};

use crate::error::Warnings;

/// Places canonical effects into rows within a column budget.
///
/// An effect that finds no free slot below the budget is dropped and a
/// warning is recorded.
pub struct Emitter<'w> {
    max_cols: usize,
    warnings: &'w mut Warnings,
}

impl<'w> Emitter<'w> {
    pub fn new(max_cols: usize, warnings: &'w mut Warnings) -> Self {
        Self { max_cols: max_cols.clamp(1, MAX_EFFECT_COLS), warnings }
    }

    pub fn max_cols(&self) -> usize {
        self.max_cols
    }

    /// Put `effect` into the first free slot. Returns false if it was dropped.
    pub fn place(&mut self, row: &mut Row, effect: Effect) -> bool {
        match row.first_free_slot().filter(|&slot| slot < self.max_cols) {
            Some(slot) => {
                row.effects[slot] = Some(effect);
                true
            }
            None => {
                self.warnings.push(format!(
                    "effect {:02X} ({}) dropped: all {} effect columns in use",
                    effect.cmd,
                    fx::name(effect.cmd),
                    self.max_cols
                ));
                false
            }
        }
    }

    pub fn emit(&mut self, row: &mut Row, cmd: u8, value: u8) -> bool {
        self.place(row, Effect::new(cmd, value))
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg);
    }

    pub fn warnings(&mut self) -> &mut Warnings {
        self.warnings
    }
}

/// Remove the effect in `slot`, leaving the slot empty.
pub(crate) fn clear_slot(row: &mut Row, slot: usize) {
    if let Some(s) = row.effects.get_mut(slot) {
        *s = None;
    }
}
