//! Canonical song model for modbridge.
//!
//! Every module decoder converges on these types: a [`Song`] with one or
//! more [`Subsong`]s, per-channel order lists and pattern pools, and flat
//! instrument, sample and wavetable lists.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod effects;
mod instrument;
mod pattern;
mod sample;
mod song;

/// Canonical effect codes.
pub use effects as fx;
pub use instrument::{
    C64Params, ChipKind, FmKind, FmOperator, FmPatch, GbEnvelope, Instrument, InstrumentBody,
    Macro, MacroKind, MacroMode, Macros, NoteMapEntry, OpMacro, SampleMap, ARP_FIXED,
};
pub use pattern::{bounded_name, Effect, Note, Pattern, Row, C0, MAX_EFFECT_COLS};
pub use sample::{LoopMode, Sample, SampleData, SampleLoop, Wavetable};
pub use song::{Channel, Chip, CompatFlags, Song, Subsong, SystemEntry};
