//! FamiTracker modules (`FamiTracker Module`), up to version 0x450.
//!
//! The file is a chain of named, versioned, sized blocks ending in `END`.
//! Song structure (PARAMS, INFO, HEADER, FRAMES, PATTERNS) is imported;
//! instrument, sequence and DPCM blocks are skipped with a warning.

use mb_ir::{fx, Chip, Effect, Note, Row, Song, Subsong};

use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::reader::{latin1, ByteSource};
use crate::LoadOptions;

pub const FTM_MAGIC: &[u8] = b"FamiTracker Module";

const MAX_VERSION: u32 = 0x0450;
const MAX_ROWS: usize = 256;
const MAX_FRAMES: usize = 256;
const NOTE_OFF: u8 = 0x0D;
const NOTE_RELEASE: u8 = 0x0E;

/// FamiTracker effect number to canonical command.
const EFFECTS: [Option<u8>; 44] = [
    None,
    Some(fx::SPEED),
    Some(fx::JUMP),
    Some(fx::BREAK),
    Some(fx::STOP_SONG),
    None, // volume envelope
    Some(fx::TONE_PORTA),
    Some(fx::TONE_PORTA),
    Some(0x13), // sweep up
    Some(0x14), // sweep down
    Some(fx::ARPEGGIO),
    Some(fx::VIBRATO),
    Some(fx::TREMOLO),
    Some(fx::FINE_PITCH),
    Some(fx::NOTE_DELAY),
    Some(0x11), // DAC
    Some(fx::PORTA_UP),
    Some(fx::PORTA_DOWN),
    Some(0x12), // duty
    Some(0x90), // sample offset
    Some(fx::NOTE_SLIDE_UP),
    Some(fx::NOTE_SLIDE_DOWN),
    Some(fx::VOL_SLIDE),
    Some(fx::NOTE_CUT),
    Some(fx::RETRIGGER),
    None, // delayed volume
    Some(0x11), // FDS modulation depth
    Some(0x12),
    Some(0x13),
    Some(0x20), // DPCM pitch
    Some(0x22), // 5B envelope
    Some(0x24),
    Some(0x23),
    Some(0x21),
    None, // VRC7 patch port
    None, // VRC7 patch write
    None, // release
    Some(fx::GROOVE),
    None, // transpose
    Some(0x10), // N163 wave
    None, // FDS volume envelope
    None, // FDS auto FM
    None, // phase reset
    None, // harmonic
];

/// Newest block versions this decoder reads.
fn max_block_version(name: &str) -> Option<u32> {
    Some(match name {
        "PARAMS" => 9,
        "INFO" => 1,
        "HEADER" => 4,
        "FRAMES" => 3,
        "PATTERNS" => 6,
        "INSTRUMENTS" | "SEQUENCES" | "SEQUENCES_VRC6" => 6,
        "DPCM SAMPLES" | "SEQUENCES_N163" | "COMMENTS" => 1,
        _ => return None,
    })
}

/// Expansion chip bits of the PARAMS block, in channel order.
const EXPANSIONS: [(u8, Chip); 6] = [
    (1, Chip::Vrc6),
    (2, Chip::Vrc7),
    (4, Chip::Fds),
    (8, Chip::Mmc5),
    (16, Chip::N163),
    (32, Chip::Ay8910),
];

#[derive(Debug, Default)]
struct Params {
    channels: usize,
    hz: Option<f32>,
    highlight: (u8, u8),
}

fn read_params(src: &mut ByteSource<'_>, version: u32, song: &mut Song) -> Result<Params> {
    if version <= 1 {
        let speed_tempo = src.read_u32_le()?;
        tracing::debug!("old speed/tempo {speed_tempo}");
    }
    let expansions = if version >= 2 { src.read_u8()? } else { 0 };
    let declared = src.read_u32_le()? as usize;
    let pal = src.read_u32_le()? != 0;
    let mut hz = None;
    if version >= 7 {
        let control = src.read_i32_le()?;
        let value = src.read_i32_le()?;
        if control == 1 && value > 0 {
            hz = Some((1_000_000.0 / f64::from(value)) as f32);
        }
    } else {
        let custom = src.read_i32_le()?;
        if custom > 0 {
            hz = Some(custom as f32);
        }
    }
    if version >= 3 {
        let new_vibrato = src.read_u32_le()?;
        tracing::debug!("new vibrato {new_vibrato}");
    }
    if version >= 9 {
        src.skip(4)?; // sweep reset
    }
    let mut highlight = (4, 16);
    if (4..7).contains(&version) {
        highlight = (src.read_u32_le()? as u8, src.read_u32_le()? as u8);
    }
    let mut n163_channels = 0;
    if expansions & 16 != 0 && version >= 5 {
        n163_channels = src.read_u32_le()? as usize;
    }
    if version >= 6 {
        let split = src.read_u32_le()?;
        tracing::debug!("speed/tempo split point {split}");
    }
    if version >= 8 {
        let cents = i32::from(src.read_i8()?) * 100 + i32::from(src.read_i8()?);
        song.tuning = (440.0 * 2f64.powf(f64::from(cents) / 1200.0)) as f32;
    }

    song.systems.clear();
    song.add_system(Chip::Nes);
    let mut channels = Chip::Nes.channels();
    for (bit, chip) in EXPANSIONS {
        if expansions & bit != 0 {
            song.add_system(chip);
            channels += if chip == Chip::N163 { n163_channels } else { chip.channels() };
        }
    }
    tracing::debug!("expansions {expansions:#04x}, {declared} channels, PAL {pal}");
    if channels != declared {
        return Err(FormatError::invalid(format!(
            "channel count {declared} does not match expansion chips ({channels})"
        )));
    }
    let hz = hz.or(Some(if pal { 50.0 } else { 60.0 }));
    Ok(Params { channels, hz, highlight })
}

fn read_header(src: &mut ByteSource<'_>, version: u32, params: &Params, song: &mut Song) -> Result<()> {
    let count = usize::from(src.read_u8()?) + 1;
    let mut subsongs = Vec::with_capacity(count);
    for _ in 0..count {
        let mut sub = Subsong::new(params.channels, 64);
        sub.name = src.read_null_string()?;
        sub.highlight = params.highlight;
        if let Some(hz) = params.hz {
            sub.hz = hz;
        }
        subsongs.push(sub);
    }
    for ch in 0..params.channels {
        let id = src.read_u8()?;
        tracing::debug!("channel {ch} has id {id}");
        for sub in &mut subsongs {
            sub.channels[ch].effect_cols = src.read_u8()?.saturating_add(1);
        }
    }
    if version >= 4 {
        for sub in &mut subsongs {
            sub.highlight = (src.read_u8()?, src.read_u8()?);
        }
    }
    song.subsongs = subsongs;
    Ok(())
}

fn read_frames(src: &mut ByteSource<'_>, version: u32, song: &mut Song, opts: &LoadOptions) -> Result<()> {
    for sub in &mut song.subsongs {
        let frames = src.read_u32_le()? as usize;
        if frames == 0 || frames > MAX_FRAMES {
            return Err(FormatError::out_of_range("frame count", frames as i64));
        }
        if version >= 3 {
            sub.speeds = vec![src.read_u32_le()?.clamp(1, 255) as u8];
        }
        if version >= 2 {
            sub.virtual_tempo.0 = src.read_u32_le()?.min(u32::from(u16::MAX)) as u16;
            let rows = src.read_u32_le()? as usize;
            if rows == 0 || rows > MAX_ROWS {
                return Err(FormatError::out_of_range("pattern length", rows as i64));
            }
            sub.pat_len = rows;
        }
        let stored = if version == 1 { src.read_u32_le()? as usize } else { sub.channels.len() };
        sub.set_orders_len(frames);
        for frame in 0..frames {
            for ch in 0..stored {
                let pattern = src.read_u8()?;
                opts.check_order(frame, Some(ch), pattern)?;
                if let Some(channel) = sub.channels.get_mut(ch) {
                    channel.orders[frame] = pattern;
                }
            }
        }
    }
    Ok(())
}

fn ftm_note(note: u8, octave: u8) -> Note {
    match note {
        NOTE_OFF => Note::Off,
        NOTE_RELEASE => Note::Release,
        1..=12 => Note::from_octave_semitone(octave as i8, note - 1),
        _ => Note::None,
    }
}

fn read_patterns(
    src: &mut ByteSource<'_>,
    version: u32,
    song: &mut Song,
    out: &mut Emitter<'_>,
) -> Result<()> {
    if version == 1 {
        let rows = src.read_u32_le()? as usize;
        if rows == 0 || rows > MAX_ROWS {
            return Err(FormatError::out_of_range("pattern length", rows as i64));
        }
        song.subsongs.iter_mut().for_each(|s| s.pat_len = rows);
    }
    while !src.at_end() {
        let subsong = if version >= 2 { src.read_u32_le()? } else { 0 };
        let ch = src.read_u32_le()?;
        let index = src.read_u32_le()?;
        let items = src.read_u32_le()?;
        let sub = song
            .subsongs
            .get_mut(subsong as usize)
            .ok_or_else(|| FormatError::out_of_range("subsong", subsong))?;
        let pat_len = sub.pat_len;
        let channel = sub
            .channels
            .get_mut(ch as usize)
            .ok_or_else(|| FormatError::out_of_range("channel", ch))?;
        let index = u8::try_from(index).map_err(|_| FormatError::out_of_range("pattern", index))?;
        let cols = if version >= 6 { 4 } else { channel.effect_cols };
        let pattern = channel.pattern_mut(index, pat_len);

        for _ in 0..items {
            let row = if (2..6).contains(&version) {
                src.read_u32_le()? as usize
            } else {
                usize::from(src.read_u8()?)
            };
            let [note, octave, ins, vol] = src.read_array::<4>()?;
            let mut cell = Row {
                note: ftm_note(note, octave),
                instrument: (ins < 0x40).then_some(u16::from(ins)),
                volume: (vol < 0x10).then_some(vol),
                ..Row::default()
            };
            for col in 0..usize::from(cols) {
                let cmd = src.read_u8()?;
                let value = if cmd != 0 || version < 6 { src.read_u8()? } else { 0 };
                if cmd == 0 && value == 0 {
                    continue;
                }
                match EFFECTS.get(usize::from(cmd)).copied().flatten() {
                    Some(mapped) => {
                        let effect = Effect::new(mapped, value);
                        if col < out.max_cols() && cell.effects[col].is_none() {
                            cell.effects[col] = Some(effect);
                        } else {
                            out.place(&mut cell, effect);
                        }
                    }
                    None => out.warn(format!("FamiTracker effect {cmd} not supported")),
                }
            }
            match pattern.row_mut(row) {
                Some(slot) => *slot = cell,
                None => tracing::debug!("row {row} past the pattern length {pat_len}"),
            }
        }
    }
    Ok(())
}

pub fn load_ftm(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    if src.read(FTM_MAGIC.len())? != FTM_MAGIC {
        return Err(FormatError::invalid("not a FamiTracker module"));
    }
    let version = src.read_u32_le()?;
    if version > MAX_VERSION {
        return Err(FormatError::out_of_range("FamiTracker version", version));
    }
    tracing::info!("FamiTracker module version {version:#06x}");

    let mut song = Song::default();
    song.compat.linear_pitch = false;
    let mut params = None;
    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    loop {
        if src.read(3)? == b"END" {
            break;
        }
        src.seek(src.tell() - 3)?;
        let name = latin1(src.read(16)?);
        let block_version = src.read_u32_le()?;
        let size = src.read_u32_le()? as usize;
        let mut block = ByteSource::new(src.read(size)?);
        tracing::debug!("block {name} version {block_version}, {size} bytes");
        match max_block_version(&name) {
            Some(max) if block_version > max => {
                out.warn(format!(
                    "FamiTracker block {name} version {block_version} is newer than supported"
                ));
            }
            None => {
                out.warn(format!("unknown FamiTracker block {name:?} skipped"));
                continue;
            }
            _ => {}
        }

        match name.as_str() {
            "PARAMS" => params = Some(read_params(&mut block, block_version, &mut song)?),
            "INFO" => {
                song.name = latin1(block.read(32)?);
                song.author = latin1(block.read(32)?);
                song.notes = latin1(block.read(32)?);
            }
            "HEADER" => {
                let params = params
                    .as_ref()
                    .ok_or_else(|| FormatError::invalid("HEADER block before PARAMS"))?;
                read_header(&mut block, block_version, params, &mut song)?;
            }
            "FRAMES" => read_frames(&mut block, block_version, &mut song, opts)?,
            "PATTERNS" => read_patterns(&mut block, block_version, &mut song, &mut out)?,
            _ => {
                out.warn(format!("FamiTracker block {name} not imported"));
                continue;
            }
        }
        if !block.at_end() {
            let unread = block.remaining();
            return Err(FormatError::invalid(format!("block {name} has {unread} unread bytes")));
        }
    }

    if params.is_none() || song.main().channels.is_empty() {
        return Err(FormatError::invalid("missing PARAMS or HEADER block"));
    }
    for sub in &mut song.subsongs {
        let declared: Vec<u8> = sub.channels.iter().map(|c| c.effect_cols).collect();
        sub.fit_effect_columns();
        let max = out.max_cols() as u8;
        for (channel, cols) in sub.channels.iter_mut().zip(declared) {
            channel.effect_cols = channel.effect_cols.max(cols.min(max));
        }
    }
    tracing::debug!("{} subsongs, {} patterns", song.subsongs.len(), song.main().pattern_count());
    Ok(song)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes() {
        assert_eq!(ftm_note(0, 0), Note::None);
        assert_eq!(ftm_note(1, 4), Note::On(108));
        assert_eq!(ftm_note(12, 3), Note::On(107));
        assert_eq!(ftm_note(NOTE_OFF, 0), Note::Off);
        assert_eq!(ftm_note(NOTE_RELEASE, 0), Note::Release);
    }

    #[test]
    fn effect_table() {
        assert_eq!(EFFECTS[1], Some(fx::SPEED));
        assert_eq!(EFFECTS[4], Some(fx::STOP_SONG));
        assert_eq!(EFFECTS[16], Some(fx::PORTA_UP));
        assert_eq!(EFFECTS[37], Some(fx::GROOVE));
        assert_eq!(EFFECTS[5], None);
    }

    fn block(d: &mut Vec<u8>, name: &str, version: u32, body: &[u8]) {
        let mut field = name.as_bytes().to_vec();
        field.resize(16, 0);
        d.extend_from_slice(&field);
        d.extend_from_slice(&version.to_le_bytes());
        d.extend_from_slice(&(body.len() as u32).to_le_bytes());
        d.extend_from_slice(body);
    }

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// NES + VRC6 (8 channels), one subsong of two frames.
    fn module() -> Vec<u8> {
        let mut d = FTM_MAGIC.to_vec();
        d.extend_from_slice(&0x0440u32.to_le_bytes());

        let mut params = vec![1u8];
        params.extend(u32s(&[8, 0, 0, 0, 0, 0, 21]));
        params.extend_from_slice(&[0, 0]);
        block(&mut d, "PARAMS", 9, &params);

        let mut info = Vec::new();
        for text in ["Title", "Composer", "2024"] {
            let mut field = text.as_bytes().to_vec();
            field.resize(32, 0);
            info.extend(field);
        }
        block(&mut d, "INFO", 1, &info);

        let mut header = vec![0u8];
        header.extend_from_slice(b"Main\0");
        for ch in 0..8u8 {
            header.extend_from_slice(&[ch, if ch == 0 { 1 } else { 0 }]);
        }
        header.extend_from_slice(&[4, 16]);
        block(&mut d, "HEADER", 4, &header);

        block(&mut d, "INSTRUMENTS", 6, &[0; 4]);

        let mut frames = u32s(&[2, 6, 150, 16]);
        frames.extend_from_slice(&[0; 8]);
        frames.extend_from_slice(&[1; 8]);
        block(&mut d, "FRAMES", 3, &frames);

        let mut patterns = u32s(&[0, 0, 1, 2]);
        // row 0: C-4, instrument 2, volume F, effect F06 then B01
        patterns.extend_from_slice(&[0, 1, 4, 2, 0x0F, 1, 6, 2, 1, 0, 0]);
        // row 3: note off, unsupported effect 5
        patterns.extend_from_slice(&[3, NOTE_OFF, 0, 0x40, 0x10, 5, 3, 0, 0, 0]);
        block(&mut d, "PATTERNS", 6, &patterns);

        d.extend_from_slice(b"END");
        d
    }

    #[test]
    fn order_past_pattern_bound() {
        let mut data = module();
        let frames = data.windows(6).position(|w| w == b"FRAMES").unwrap();
        // name, version, size, four header words, then frame 1 of channel 3
        let cell = frames + 24 + 16 + 8 + 3;
        assert_eq!(data[cell], 1);
        data[cell] = 20;
        let opts = LoadOptions { max_patterns: 16, ..LoadOptions::default() };
        let err = load_ftm(&data, &opts, &mut Warnings::new()).unwrap_err();
        assert_eq!(err, FormatError::out_of_range("pattern index at order 1 on channel 3", 20));
        assert!(load_ftm(&data, &LoadOptions::default(), &mut Warnings::new()).is_ok());
    }

    #[test]
    fn minimal_module() {
        let mut w = Warnings::new();
        let song = load_ftm(&module(), &LoadOptions::default(), &mut w).unwrap();
        assert_eq!(song.name, "Title");
        assert_eq!(song.author, "Composer");
        assert_eq!(song.notes, "2024");
        let chips: Vec<_> = song.systems.iter().map(|s| s.chip).collect();
        assert_eq!(chips, [Chip::Nes, Chip::Vrc6]);
        assert!(!song.compat.linear_pitch);
        assert!(w.contains("FamiTracker block INSTRUMENTS not imported"));
        assert!(w.contains("FamiTracker effect 5 not supported"));

        let sub = song.main();
        assert_eq!(sub.name, "Main");
        assert_eq!(sub.hz, 60.0);
        assert_eq!(sub.speeds, [6]);
        assert_eq!(sub.virtual_tempo.0, 150);
        assert_eq!(sub.pat_len, 16);
        assert_eq!(sub.channels.len(), 8);
        assert_eq!(sub.channels[0].orders, [0, 1]);
        assert_eq!(sub.channels[0].effect_cols, 2);

        let row = sub.row_at(0, 1, 0).unwrap();
        assert_eq!(row.note, Note::On(108));
        assert_eq!(row.instrument, Some(2));
        assert_eq!(row.volume, Some(0x0F));
        assert_eq!(row.effects[0], Some(Effect::new(fx::SPEED, 6)));
        assert_eq!(row.effects[1], Some(Effect::new(fx::JUMP, 1)));
        let off = sub.row_at(0, 1, 3).unwrap();
        assert_eq!(off.note, Note::Off);
        assert_eq!(off.instrument, None);
        assert_eq!(off.volume, None);
        assert!(sub.channels[0].pattern(0).is_none());
    }

    #[test]
    fn channel_count_mismatch() {
        let mut data = module();
        // declared channel count in PARAMS
        let at = FTM_MAGIC.len() + 4 + 24 + 1;
        data[at] = 5;
        let mut w = Warnings::new();
        let err = load_ftm(&data, &LoadOptions::default(), &mut w).unwrap_err();
        assert!(matches!(err, FormatError::InvalidHeader(_)));
    }

    #[test]
    fn rejects_newer_versions_and_truncation() {
        let mut data = module();
        data[FTM_MAGIC.len()..FTM_MAGIC.len() + 4].copy_from_slice(&0x0451u32.to_le_bytes());
        let mut w = Warnings::new();
        assert!(matches!(
            load_ftm(&data, &LoadOptions::default(), &mut w),
            Err(FormatError::OutOfRange { .. })
        ));
        let data = module();
        assert!(matches!(
            load_ftm(&data[..data.len() - 10], &LoadOptions::default(), &mut w),
            Err(FormatError::Truncated { .. })
        ));
    }
}
