//! Module decoders for modbridge.
//!
//! Parses DMF, FTM, A2T/A2M, RAD, TFM, S3M, IT, XM, MOD and Future
//! Composer files into the canonical [`mb_ir::Song`]. [`decode`] is the
//! single entry point: it unwraps a zlib container if there is one, picks a
//! decoder by signature (or by extension for the two formats that have
//! none) and returns the song with any warnings recorded along the way.

pub mod codecs;
pub mod container;
pub mod dispatch;
pub mod effects;
mod error;
pub mod pcm;
pub mod reader;
pub mod versions;

pub mod a2m_format;
pub mod dmf_format;
pub mod fc_format;
pub mod ftm_format;
pub mod it_format;
pub mod mod_format;
pub mod rad_format;
pub mod s3m_format;
pub mod tfm_format;
pub mod xm_format;

pub use dispatch::{detect, Format};
pub use error::{FormatError, Result, Warning, Warnings};
pub use reader::ByteSource;

pub use a2m_format::{load_a2m, load_a2t};
pub use dmf_format::load_dmf;
pub use fc_format::load_fc;
pub use ftm_format::load_ftm;
pub use it_format::load_it;
pub use mod_format::load_mod;
pub use rad_format::load_rad;
pub use s3m_format::load_s3m;
pub use tfm_format::load_tfm;
pub use xm_format::load_xm;

use mb_ir::{Song, MAX_EFFECT_COLS};

/// Knobs every decoder receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    /// Effect columns a channel may grow to, 1..=8. Effects beyond it are
    /// dropped with a warning.
    pub max_effect_columns: usize,
    /// Upper bound on pattern indices a file may declare.
    pub max_patterns: usize,
    /// Try extension probes when no signature matches.
    pub trust_extension: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { max_effect_columns: MAX_EFFECT_COLS, max_patterns: 256, trust_extension: true }
    }
}

impl LoadOptions {
    fn clamped(&self) -> Self {
        Self {
            max_effect_columns: self.max_effect_columns.clamp(1, MAX_EFFECT_COLS),
            max_patterns: self.max_patterns.clamp(1, 256),
            trust_extension: self.trust_extension,
        }
    }

    /// Reject an order entry naming a pattern past `max_patterns`.
    pub(crate) fn check_order(&self, pos: usize, channel: Option<usize>, index: u8) -> Result<()> {
        if usize::from(index) < self.max_patterns {
            return Ok(());
        }
        let field = match channel {
            Some(ch) => format!("pattern index at order {pos} on channel {ch}"),
            None => format!("pattern index at order {pos}"),
        };
        Err(FormatError::out_of_range(field, index))
    }
}

/// A successfully decoded module.
#[derive(Debug)]
pub struct Decoded {
    pub song: Song,
    pub format: Format,
    pub warnings: Warnings,
}

/// Decode a module file held in memory.
///
/// `hint` is the filename, used only for extension probes.
pub fn decode(bytes: Vec<u8>, hint: Option<&str>, opts: &LoadOptions) -> Result<Decoded> {
    let opts = opts.clamped();
    let data = container::unwrap(bytes);
    let format = detect(&data, hint, &opts)?;
    tracing::info!("detected {} ({} bytes)", format, data.len());

    let mut warnings = Warnings::new();
    let song = format.decode(&data, &opts, &mut warnings)?;
    Ok(Decoded { song, format, warnings })
}
