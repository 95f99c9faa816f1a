//! FastTracker II extended modules.
//!
//! Channels fill ES5506 chips 32 at a time. The song's pattern length is the
//! longest stored pattern; shorter ones end early with `0D 00`. Effects
//! 0-F go through the ProTracker engine, the lettered extensions are
//! translated here.

use binrw::BinRead;
use mb_ir::{
    bounded_name, fx, Chip, Instrument, InstrumentBody, LoopMode, Note, NoteMapEntry, Row, Sample,
    SampleMap, Song,
};

use crate::effects::protracker::{ChannelMemory, SpeedSplit, Usage};
use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::pcm::PcmLayout;
use crate::reader::{latin1, ByteSource, Record};
use crate::LoadOptions;

pub const XM_MAGIC: &[u8] = b"Extended Module: ";

/// Offset the header size field counts from.
const HEADER_BASE: usize = 60;
const MAX_ROWS: usize = 256;
const KEY_OFF: u8 = 97;

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    magic: [u8; 17],
    name: [u8; 20],
    _eof: u8,
    tracker: [u8; 20],
    version: u16,
    header_size: u32,
    song_length: u16,
    restart: u16,
    channels: u16,
    patterns: u16,
    instruments: u16,
    flags: u16,
    speed: u16,
    bpm: u16,
    orders: [u8; 256],
}

impl Record for Header {
    const SIZE: usize = 336;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct PatternHeader {
    header_len: u32,
    packing: u8,
    rows: u16,
    packed_size: u16,
}

impl Record for PatternHeader {
    const SIZE: usize = 9;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct InstrumentHead {
    size: u32,
    name: [u8; 22],
    _kind: u8,
    sample_count: u16,
}

impl Record for InstrumentHead {
    const SIZE: usize = 29;
}

/// Present only when the instrument has samples.
#[derive(BinRead, Debug)]
#[br(little)]
struct InstrumentExtra {
    sample_header_size: u32,
    keymap: [u8; 96],
    _envelopes: [u8; 96],
    _envelope_params: [u8; 14],
    fadeout: u16,
}

impl Record for InstrumentExtra {
    const SIZE: usize = 212;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    length: u32,
    loop_start: u32,
    loop_length: u32,
    _volume: u8,
    finetune: i8,
    kind: u8,
    _panning: u8,
    relative_note: i8,
    packing: u8,
    name: [u8; 22],
}

impl Record for SampleHeader {
    const SIZE: usize = 40;
}

impl SampleHeader {
    fn wide(&self) -> bool {
        self.kind & 16 != 0
    }

    /// ModPlug 4-bit ADPCM.
    fn adpcm(&self) -> bool {
        self.packing == 0xAD
    }

    /// Bytes the sample data occupies in the file.
    fn stored_len(&self) -> usize {
        if self.adpcm() {
            (self.length as usize).div_ceil(2) + 16
        } else {
            self.length as usize
        }
    }

    fn layout(&self) -> PcmLayout {
        let wide = self.wide();
        PcmLayout {
            frames: self.length as usize / if wide { 2 } else { 1 },
            wide,
            signed: true,
            delta: true,
            ..PcmLayout::default()
        }
    }

    fn center_rate(&self) -> u32 {
        let semitones = f64::from(self.relative_note) + f64::from(self.finetune) / 128.0;
        (8363.0 * 2f64.powf(semitones / 12.0)).round() as u32
    }

    /// Loop in frames; lengths in the header are bytes.
    fn loop_region(&self) -> Option<(u32, u32, LoopMode)> {
        let mode = match self.kind & 3 {
            0 => return None,
            1 => LoopMode::Forward,
            _ => LoopMode::PingPong,
        };
        if self.loop_length == 0 {
            return None;
        }
        let width = if self.wide() { 2 } else { 1 };
        let start = self.loop_start / width;
        let end = self.loop_start.saturating_add(self.loop_length) / width;
        Some((start, end, mode))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cell {
    note: u8,
    instrument: u8,
    volume: u8,
    cmd: u8,
    value: u8,
}

impl Cell {
    /// A leading byte with bit 7 set says which fields follow; otherwise
    /// it is the note and all five fields are present.
    fn read(src: &mut ByteSource<'_>) -> Result<Self> {
        let first = src.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(Cell {
                note: first,
                instrument: src.read_u8()?,
                volume: src.read_u8()?,
                cmd: src.read_u8()?,
                value: src.read_u8()?,
            });
        }
        let mut field = |bit: u8| -> Result<u8> {
            if first & bit != 0 {
                src.read_u8()
            } else {
                Ok(0)
            }
        };
        Ok(Cell {
            note: field(1)?,
            instrument: field(2)?,
            volume: field(4)?,
            cmd: field(8)?,
            value: field(16)?,
        })
    }
}

fn xm_note(note: u8) -> Note {
    match note {
        1..=96 => Note::from_octave_semitone(((note - 1) / 12) as i8, (note - 1) % 12),
        KEY_OFF => Note::Off,
        _ => Note::None,
    }
}

fn command_name(cmd: u8) -> char {
    char::from_digit(u32::from(cmd), 36).map_or('?', |c| c.to_ascii_uppercase())
}

fn volume_column(value: u8, row: &mut Row, out: &mut Emitter<'_>) {
    let x = value & 15;
    match value {
        0x00..=0x0F => {}
        0x10..=0x50 => row.volume = Some(value - 0x10),
        0x80..=0x8F => {
            out.emit(row, fx::SINGLE_VOL_DOWN, x);
        }
        0x90..=0x9F => {
            out.emit(row, fx::SINGLE_VOL_UP, x);
        }
        0xC0..=0xCF => {
            out.emit(row, fx::PANNING, x * 0x11);
        }
        _ => out.warn(format!("volume column command {:X}x not supported", value >> 4)),
    }
}

/// Lettered commands beyond ProTracker's 0-F, plus `8xx`.
fn extended_command(cell: Cell, row: &mut Row, out: &mut Emitter<'_>) {
    match cell.cmd {
        0x8 => {
            out.emit(row, fx::PANNING, cell.value);
        }
        // Kxx
        0x14 if cell.value == 0 => row.note = Note::Off,
        // Rxy
        0x1B => {
            out.emit(row, fx::RETRIGGER, cell.value & 15);
        }
        cmd => out.warn(format!("XM effect {}xx not supported", command_name(cmd))),
    }
}

struct StoredPattern {
    /// [row][channel]
    rows: Vec<Vec<Cell>>,
}

fn read_pattern(src: &mut ByteSource<'_>, channels: usize, index: usize) -> Result<StoredPattern> {
    let start = src.tell();
    let header: PatternHeader = src.read_record()?;
    if header.packing != 0 {
        return Err(FormatError::invalid(format!("pattern {index}: unknown packing {}", header.packing)));
    }
    let rows = usize::from(header.rows);
    if rows == 0 || rows > MAX_ROWS {
        return Err(FormatError::out_of_range(format!("pattern {index} rows"), header.rows));
    }
    src.seek(start + header.header_len as usize)?;
    let packed = src.read(usize::from(header.packed_size))?;
    if packed.is_empty() {
        return Ok(StoredPattern { rows: vec![vec![Cell::default(); channels]; rows] });
    }
    let mut cells = ByteSource::new(packed);
    let rows = (0..rows)
        .map(|_| (0..channels).map(|_| Cell::read(&mut cells)).collect::<Result<Vec<_>>>())
        .collect::<Result<Vec<_>>>()?;
    Ok(StoredPattern { rows })
}

/// One instrument and the samples stored after it.
fn read_instrument(
    src: &mut ByteSource<'_>,
    index: usize,
    samples: &mut Vec<Sample>,
    out: &mut Emitter<'_>,
) -> Result<Instrument> {
    let start = src.tell();
    let head: InstrumentHead = src.read_record()?;
    let name = latin1(&head.name);
    let count = usize::from(head.sample_count);
    if count == 0 {
        src.seek(start + (head.size as usize).max(InstrumentHead::SIZE))?;
        return Ok(Instrument::new(&name, InstrumentBody::Sample(SampleMap::default())));
    }
    let extra: InstrumentExtra = src.read_record()?;
    tracing::debug!("instrument {}: {} samples, fadeout {}", index + 1, count, extra.fadeout);
    src.seek(start + head.size as usize)?;

    let stride = extra.sample_header_size as usize;
    let first = src.tell();
    let mut headers = Vec::with_capacity(count);
    for i in 0..count {
        src.seek(first + i * stride)?;
        headers.push(src.read_record::<SampleHeader>()?);
    }
    src.seek(first + count * stride)?;

    let base = samples.len();
    for (i, header) in headers.iter().enumerate() {
        let mut sample = Sample::new(&latin1(&header.name));
        sample.center_rate = header.center_rate();
        let want = header.stored_len();
        let stored = src.read(want.min(src.remaining()))?;
        if header.adpcm() {
            out.warn(format!("instrument {} sample {}: ADPCM sample not supported", index + 1, i + 1));
        } else {
            if stored.len() < want {
                out.warn(format!("instrument {} sample {}: data truncated", index + 1, i + 1));
            }
            sample.data = header.layout().decode(stored);
            if let Some((start, end, mode)) = header.loop_region() {
                sample.set_loop(start, end, mode);
            }
        }
        samples.push(sample);
    }

    let note_map = extra
        .keymap
        .iter()
        .enumerate()
        .map(|(note, &k)| NoteMapEntry {
            sample: (usize::from(k) < count).then_some((base + usize::from(k)) as u16),
            note: note as u8,
        })
        .collect();
    Ok(Instrument::new(
        &name,
        InstrumentBody::Sample(SampleMap {
            initial_sample: Some(base as u16),
            note_map: Some(note_map),
        }),
    ))
}

pub fn load_xm(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    let header: Header = src.read_record()?;
    if header.magic != XM_MAGIC {
        return Err(FormatError::invalid("not an XM module"));
    }
    let channels = usize::from(header.channels);
    if channels == 0 || channels > 128 {
        return Err(FormatError::out_of_range("channel count", header.channels));
    }
    let order_count = usize::from(header.song_length);
    if order_count == 0 || order_count > 256 {
        return Err(FormatError::out_of_range("song length", header.song_length));
    }
    let pattern_count = usize::from(header.patterns);
    if pattern_count > 256 || pattern_count > opts.max_patterns {
        return Err(FormatError::out_of_range("pattern count", header.patterns));
    }
    let tracker = latin1(&header.tracker);
    tracing::info!("XM version {:#06x}, {} channels", header.version, channels);
    if !tracker.trim().is_empty() {
        tracing::debug!("made with {}", tracker.trim());
    }
    tracing::debug!("restart position {}", header.restart);

    src.seek(HEADER_BASE + header.header_size as usize)?;
    let patterns = (0..pattern_count)
        .map(|i| read_pattern(&mut src, channels, i))
        .collect::<Result<Vec<_>>>()?;

    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    let mut samples = Vec::new();
    let mut instruments = Vec::with_capacity(usize::from(header.instruments));
    for i in 0..usize::from(header.instruments) {
        instruments.push(read_instrument(&mut src, i, &mut samples, &mut out)?);
    }

    let mut usage = vec![Usage::default(); channels];
    for pattern in &patterns {
        for row in &pattern.rows {
            for (ch, cell) in row.iter().enumerate() {
                usage[ch].note(cell.cmd, cell.value);
            }
        }
    }

    let pat_len = patterns.iter().map(|p| p.rows.len()).max().unwrap_or(64);
    let chips = channels.div_ceil(Chip::Es5506.channels());
    let mut song = Song::with_channels(&latin1(&header.name), chips * Chip::Es5506.channels(), pat_len);
    for _ in 0..chips {
        song.add_system(Chip::Es5506);
    }
    song.compat.linear_pitch = header.flags & 1 != 0;
    song.compat.no_slides_on_first_tick = true;
    song.compat.row_resets_arp_pos = true;
    song.compat.ignore_jump_at_end = false;
    song.compat.pitch_slide_speed = 12;

    let sub = song.main_mut();
    sub.speeds = vec![header.speed.clamp(1, 255) as u8];
    sub.hz = f32::from(header.bpm) / 2.5;
    sub.set_orders_len(order_count);
    for (pos, &pattern) in header.orders.iter().take(order_count).enumerate() {
        opts.check_order(pos, None, pattern)?;
        sub.set_order_all(pos, pattern);
    }

    let instrument_count = instruments.len();
    for (ch, channel) in sub.channels.iter_mut().enumerate() {
        if ch >= channels {
            channel.visible = false;
            continue;
        }
        channel.name = bounded_name(&format!("Channel {}", ch + 1));
        for (index, stored) in patterns.iter().enumerate() {
            let mut memory = ChannelMemory::new(SpeedSplit::Bpm(0x20));
            let pattern = channel.pattern_mut(index as u8, pat_len);
            for (row, cells) in pattern.rows.iter_mut().zip(&stored.rows) {
                let cell = cells[ch];
                row.note = xm_note(cell.note);
                match usize::from(cell.instrument) {
                    0 => {}
                    ins if ins <= instrument_count => row.instrument = Some(ins as u16 - 1),
                    ins => out.warn(format!("instrument {ins} out of range")),
                }
                volume_column(cell.volume, row, &mut out);
                let (cmd, value) = match cell.cmd {
                    0x8 | 0x10..=0xFF => {
                        extended_command(cell, row, &mut out);
                        (0, 0)
                    }
                    _ => (cell.cmd, cell.value),
                };
                memory.convert(&usage[ch], cmd, value, row, &mut out);
            }
            if ch == 0 && stored.rows.len() < pat_len {
                if let Some(last) = pattern.row_mut(stored.rows.len() - 1) {
                    out.emit(last, fx::BREAK, 0);
                }
            }
        }
    }
    sub.fit_effect_columns();

    song.instruments = instruments;
    song.samples = samples;
    Ok(song)
}
