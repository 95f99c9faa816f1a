//! Live song state for modbridge.
//!
//! [`Loader`] owns the song the rest of the application reads. A load
//! decodes into a fresh [`Song`] without holding any lock and only takes
//! the lock to swap the result in, so readers such as an audio thread wait
//! at most for a value move, never for a decode.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

pub use mb_formats::{Format, FormatError, LoadOptions, Warning, Warnings};
pub use mb_ir::Song;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("empty input")]
    Empty,
    #[error(transparent)]
    Format(#[from] FormatError),
}

struct Live {
    song: Song,
    format: Option<Format>,
    warnings: Warnings,
    last_error: Option<String>,
}

/// Owner of the live song.
pub struct Loader {
    options: LoadOptions,
    live: Mutex<Live>,
}

impl Loader {
    pub fn new() -> Self {
        Self::with_options(LoadOptions::default())
    }

    pub fn with_options(options: LoadOptions) -> Self {
        Self {
            options,
            live: Mutex::new(Live {
                song: Song::with_channels("Untitled", 4, 64),
                format: None,
                warnings: Warnings::new(),
                last_error: None,
            }),
        }
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, Live> {
        // poisoning can only interrupt a reader; the song is never half-written
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Loading ---

    /// Decode `bytes` and make the result the live song.
    ///
    /// `hint` is the source filename, consulted only for formats without a
    /// signature. On failure the live song is left as it was and the error
    /// text is kept for [`Loader::last_error`].
    pub fn load(&self, bytes: Vec<u8>, hint: Option<&str>) -> Result<Format, LoadError> {
        let result = if bytes.is_empty() {
            Err(LoadError::Empty)
        } else {
            mb_formats::decode(bytes, hint, &self.options).map_err(LoadError::from)
        };

        match result {
            Ok(decoded) => {
                tracing::info!(
                    "loaded {} \"{}\" with {} warnings",
                    decoded.format,
                    decoded.song.name,
                    decoded.warnings.len()
                );
                let old = {
                    let mut live = self.lock();
                    live.format = Some(decoded.format);
                    live.warnings = decoded.warnings;
                    live.last_error = None;
                    std::mem::replace(&mut live.song, decoded.song)
                };
                drop(old);
                Ok(decoded.format)
            }
            Err(err) => {
                tracing::warn!("load failed: {}", err);
                self.lock().last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    // --- Song access ---

    /// Run `f` against the live song while holding the lock.
    pub fn with_song<R>(&self, f: impl FnOnce(&Song) -> R) -> R {
        f(&self.lock().song)
    }

    /// Format of the live song, if it came from a file.
    pub fn format(&self) -> Option<Format> {
        self.lock().format
    }

    /// Text of the most recent failed load. Cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Warnings recorded while decoding the live song.
    pub fn warnings(&self) -> Vec<Warning> {
        self.lock().warnings.iter().cloned().collect()
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Smallest four-channel ProTracker module: one empty pattern.
    fn protracker(name: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 1084];
        data[..name.len()].copy_from_slice(name);
        data[950] = 1;
        data[951] = 0x7F;
        data[1080..1084].copy_from_slice(b"M.K.");
        data.extend(vec![0u8; 64 * 4 * 4]);
        data
    }

    #[test]
    fn starts_with_an_empty_song() {
        let loader = Loader::new();
        assert_eq!(loader.with_song(|s| s.name.clone()), "Untitled");
        assert_eq!(loader.format(), None);
        assert_eq!(loader.last_error(), None);
        assert!(loader.warnings().is_empty());
    }

    #[test]
    fn successful_load_swaps_the_song() {
        let loader = Loader::new();
        assert_eq!(loader.load(protracker(b"first"), None), Ok(Format::Mod));
        assert_eq!(loader.with_song(|s| s.name.clone()), "first");
        assert_eq!(loader.with_song(|s| s.main().channels.len()), 4);
        assert_eq!(loader.format(), Some(Format::Mod));
    }

    #[test]
    fn failed_load_keeps_the_live_song() {
        let loader = Loader::new();
        loader.load(protracker(b"keep me"), None).unwrap();

        let err = loader.load(vec![1, 2, 3], Some("junk.bin")).unwrap_err();
        assert_eq!(err, LoadError::Format(FormatError::Unrecognized));
        assert_eq!(loader.last_error().as_deref(), Some("unrecognized format"));
        assert_eq!(loader.with_song(|s| s.name.clone()), "keep me");
        assert_eq!(loader.format(), Some(Format::Mod));

        let mut truncated = protracker(b"short");
        truncated.truncate(1500);
        assert!(matches!(
            loader.load(truncated, None),
            Err(LoadError::Format(FormatError::Truncated { .. }))
        ));
        assert_eq!(loader.with_song(|s| s.name.clone()), "keep me");

        assert_eq!(loader.load(Vec::new(), None), Err(LoadError::Empty));
        assert_eq!(loader.last_error().as_deref(), Some("empty input"));

        loader.load(protracker(b"again"), None).unwrap();
        assert_eq!(loader.last_error(), None);
    }

    #[test]
    fn warnings_follow_the_live_song() {
        let loader = Loader::new();
        let mut data = protracker(b"warn");
        // sample 1 claims 8 bytes that the file does not have
        data[42..44].copy_from_slice(&4u16.to_be_bytes());
        loader.load(data, None).unwrap();
        assert_eq!(loader.warnings().len(), 1);
        assert!(loader.warnings()[0].0.contains("truncated"));

        loader.load(protracker(b"clean"), None).unwrap();
        assert!(loader.warnings().is_empty());
    }

    #[test]
    fn readers_see_whole_songs() {
        let loader = Arc::new(Loader::new());
        std::thread::scope(|s| {
            let reader = Arc::clone(&loader);
            s.spawn(move || {
                for _ in 0..200 {
                    let (name, channels) =
                        reader.with_song(|song| (song.name.clone(), song.main().channels.len()));
                    assert!(name == "Untitled" || name.starts_with("song "));
                    assert_eq!(channels, 4);
                }
            });
            for i in 0..20 {
                loader.load(protracker(format!("song {i}").as_bytes()), None).unwrap();
            }
        });
        assert_eq!(loader.with_song(|s| s.name.clone()), "song 19");
    }
}
