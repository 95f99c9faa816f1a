//! Format detection.
//!
//! Signatures are probed in a fixed priority order. Two legacy formats have
//! no reliable magic and are only tried when the filename hint names them.

use std::fmt;
use std::path::Path;

use mb_ir::Song;

use crate::a2m_format::{load_a2m, load_a2t, A2M_MAGIC, A2T_MAGIC};
use crate::dmf_format::{load_dmf, DMF_MAGIC};
use crate::error::{FormatError, Result, Warnings};
use crate::fc_format::{self, load_fc, FC13_MAGIC, FC14_MAGIC};
use crate::ftm_format::{load_ftm, FTM_MAGIC};
use crate::it_format::{load_it, IT_MAGIC};
use crate::mod_format::{load_mod, tag_channels, TAG_OFFSET};
use crate::rad_format::{load_rad, RAD_MAGIC};
use crate::s3m_format::{load_s3m, MAGIC_OFFSET, S3M_MAGIC};
use crate::tfm_format::{load_tfm, TFM_MAGIC};
use crate::xm_format::{load_xm, XM_MAGIC};
use crate::LoadOptions;

type Decoder = fn(&[u8], &LoadOptions, &mut Warnings) -> Result<Song>;

/// Module formats the importer decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Dmf,
    Ftm,
    A2t,
    A2m,
    Rad,
    Tfm,
    S3m,
    It,
    Xm,
    Mod,
    /// 15-sample Soundtracker module, reached by extension only.
    Soundtracker,
    FutureComposer,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Dmf => "DefleMask",
            Format::Ftm => "FamiTracker",
            Format::A2t => "AdLib Tracker 2 (tiny)",
            Format::A2m => "AdLib Tracker 2",
            Format::Rad => "Reality AdLib Tracker",
            Format::Tfm => "TFM Music Maker",
            Format::S3m => "Scream Tracker 3",
            Format::It => "Impulse Tracker",
            Format::Xm => "FastTracker 2",
            Format::Mod => "ProTracker",
            Format::Soundtracker => "Soundtracker",
            Format::FutureComposer => "Future Composer",
        }
    }

    fn decoder(self) -> Decoder {
        match self {
            Format::Dmf => load_dmf,
            Format::Ftm => load_ftm,
            Format::A2t => load_a2t,
            Format::A2m => load_a2m,
            Format::Rad => load_rad,
            Format::Tfm => load_tfm,
            Format::S3m => load_s3m,
            Format::It => load_it,
            Format::Xm => load_xm,
            Format::Mod | Format::Soundtracker => load_mod,
            Format::FutureComposer => load_fc,
        }
    }

    /// Run this format's decoder.
    pub fn decode(self, data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
        (self.decoder())(data, opts, warnings)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Probe {
    Magic { offset: usize, magic: &'static [u8] },
    /// Any channel tag ProTracker and its descendants write at 1080.
    ModTag,
}

impl Probe {
    fn matches(&self, data: &[u8]) -> bool {
        match *self {
            Probe::Magic { offset, magic } => data.get(offset..offset + magic.len()) == Some(magic),
            Probe::ModTag => data.get(TAG_OFFSET..TAG_OFFSET + 4).and_then(tag_channels).is_some(),
        }
    }
}

const fn magic(offset: usize, magic: &'static [u8]) -> Probe {
    Probe::Magic { offset, magic }
}

/// Priority order matters: a tag at 1080 can occur by chance in any
/// large enough file, so the MOD probe comes after every fixed magic.
const SIGNATURES: &[(Probe, Format)] = &[
    (magic(0, DMF_MAGIC), Format::Dmf),
    (magic(0, FTM_MAGIC), Format::Ftm),
    (magic(0, A2T_MAGIC), Format::A2t),
    (magic(0, A2M_MAGIC), Format::A2m),
    (magic(0, RAD_MAGIC), Format::Rad),
    (magic(0, TFM_MAGIC), Format::Tfm),
    (magic(MAGIC_OFFSET, S3M_MAGIC), Format::S3m),
    (magic(0, IT_MAGIC), Format::It),
    (magic(0, XM_MAGIC), Format::Xm),
    (Probe::ModTag, Format::Mod),
    (magic(0, FC13_MAGIC), Format::FutureComposer),
    (magic(0, FC14_MAGIC), Format::FutureComposer),
];

fn extension(hint: Option<&str>) -> Option<String> {
    let ext = Path::new(hint?).extension()?.to_str()?;
    Some(ext.to_ascii_lowercase())
}

/// Pick a decoder for `data`.
///
/// `hint` is a filename; only its extension is used, and only when no
/// signature matches and `opts.trust_extension` is set.
pub fn detect(data: &[u8], hint: Option<&str>, opts: &LoadOptions) -> Result<Format> {
    if let Some(&(_, format)) = SIGNATURES.iter().find(|(probe, _)| probe.matches(data)) {
        return Ok(format);
    }
    if !opts.trust_extension {
        return Err(FormatError::Unrecognized);
    }
    match extension(hint).as_deref() {
        Some("mod" | "stk") => Ok(Format::Soundtracker),
        Some("fc" | "fc13" | "fc14" | "smod") if fc_format::probe(data).is_some() => {
            Ok(Format::FutureComposer)
        }
        _ => Err(FormatError::Unrecognized),
    }
}
