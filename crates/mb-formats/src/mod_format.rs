//! ProTracker-family MOD modules and 15-sample Soundtracker modules.
//!
//! A tag at offset 1080 names the channel count. Without one the file is
//! treated as a 15-sample Soundtracker module, accepted only when its
//! restart byte carries the Soundtracker signature.

use binrw::BinRead;
use mb_ir::{bounded_name, Chip, Instrument, LoopMode, Note, Row, Sample, SampleData, Song};

use crate::effects::protracker::{ChannelMemory, SpeedSplit, Usage};
use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::reader::{latin1, ByteSource, Record};
use crate::LoadOptions;

pub const TAG_OFFSET: usize = 1080;

const ROWS: usize = 64;
const HZ: f32 = 50.0;
const PAL_TUNING: f32 = 436.0;
/// Period of C-1 on the Amiga period scale.
const BASE_PERIOD: f64 = 3424.0;
/// Songs whose `Fxx` values above 0x20 are still speeds.
const VBLANK_SONGS: &[&str] = &["klisje paa klisje"];

/// Channel count announced by a tag at offset 1080.
pub fn tag_channels(tag: &[u8]) -> Option<usize> {
    let digit = |b: u8| (b'1'..=b'9').contains(&b).then(|| usize::from(b - b'0'));
    match tag {
        b"M.K." | b"M!K!" | b"M&K!" => Some(4),
        b"CD81" | b"OKTA" | b"OCTA" => Some(8),
        [n, b'C', b'H', b'N'] => digit(*n),
        [b'F', b'L', b'T', n] | [b'T', b'D', b'Z', n] => digit(*n),
        [hi, lo, b'C', b'H'] | [hi, lo, b'C', b'N'] if lo.is_ascii_digit() => {
            digit(*hi).map(|h| h * 10 + usize::from(lo - b'0'))
        }
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    /// 31 samples and a channel tag.
    Tagged { channels: usize },
    /// 15 samples, 4 channels, no tag.
    Soundtracker,
}

impl Layout {
    fn detect(data: &[u8]) -> Self {
        match data.get(TAG_OFFSET..TAG_OFFSET + 4).and_then(tag_channels) {
            Some(channels) => Layout::Tagged { channels },
            None => Layout::Soundtracker,
        }
    }

    fn samples(self) -> usize {
        match self {
            Layout::Tagged { .. } => 31,
            Layout::Soundtracker => 15,
        }
    }

    fn channels(self) -> usize {
        match self {
            Layout::Tagged { channels } => channels,
            Layout::Soundtracker => 4,
        }
    }
}

#[derive(BinRead, Debug)]
#[br(big)]
struct SampleHeader {
    name: [u8; 22],
    /// In words.
    length: u16,
    finetune: u8,
    volume: u8,
    loop_start: u16,
    loop_len: u16,
}

impl Record for SampleHeader {
    const SIZE: usize = 30;
}

impl SampleHeader {
    /// Byte length the data occupies in the file.
    fn stored_len(&self) -> usize {
        usize::from(self.length) * 2
    }

    /// Frames to load. A one-word sample is ProTracker's empty marker.
    fn frames(&self) -> usize {
        match self.stored_len() {
            2 => 0,
            n => n,
        }
    }

    /// Signed finetune in 1/8 semitones.
    fn finetune(&self) -> i8 {
        let ft = (self.finetune & 0x0F) as i8;
        if ft >= 8 {
            ft - 16
        } else {
            ft
        }
    }

    fn center_rate(&self) -> u32 {
        (2f64.powf(f64::from(self.finetune()) / 96.0) * 8363.0) as u32
    }

    /// Loop in bytes. ProTracker marks one-shot samples with short loops.
    fn loop_bytes(&self) -> Option<(u32, u32)> {
        let start = u32::from(self.loop_start) * 2;
        let len = u32::from(self.loop_len) * 2;
        let end = start + len;
        (end >= 4 && len >= 4).then_some((start, end))
    }
}

/// One stored cell, before effect translation.
#[derive(Clone, Copy, Debug, Default)]
struct Cell {
    note: Note,
    instrument: Option<u16>,
    cmd: u8,
    value: u8,
}

impl Cell {
    fn parse(b: [u8; 4]) -> Self {
        let ins = u16::from((b[0] & 0xF0) | (b[2] >> 4));
        let period = u16::from(b[1]) | (u16::from(b[0] & 0x0F) << 8);
        Self {
            note: note_from_period(period),
            instrument: ins.checked_sub(1),
            cmd: b[2] & 0x0F,
            value: b[3],
        }
    }
}

/// Nearest note for an Amiga period. Period 0 is an empty cell.
pub fn note_from_period(period: u16) -> Note {
    if period == 0 || period >= 0xFFF {
        return Note::None;
    }
    let semitones = ((BASE_PERIOD / f64::from(period)).log2() * 12.0).round() as i16;
    Note::from_c0_offset(semitones + 12)
}

pub fn load_mod(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let layout = Layout::detect(data);
    let channels = layout.channels();
    tracing::info!("MOD layout {:?}", layout);

    let mut src = ByteSource::new(data);
    let name = latin1(src.read(20)?);

    let mut headers = Vec::with_capacity(layout.samples());
    for _ in 0..layout.samples() {
        headers.push(src.read_record::<SampleHeader>()?);
    }

    let order_count = src.read_u8()?;
    if order_count == 0 || order_count > 128 {
        return Err(FormatError::out_of_range("order count", order_count));
    }
    let restart = src.read_u8()?;
    if layout == Layout::Soundtracker && !(0x61..=0x7F).contains(&restart) {
        return Err(FormatError::invalid("no Soundtracker signature"));
    }
    let orders: [u8; 128] = src.read_array()?;
    for (pos, &index) in orders.iter().enumerate() {
        opts.check_order(pos, None, index)?;
    }
    let pattern_count = usize::from(orders.iter().copied().max().unwrap_or(0)) + 1;
    if let Layout::Tagged { .. } = layout {
        src.skip(4)?;
    }

    // [pattern][row][channel]
    let mut cells = Vec::with_capacity(pattern_count);
    let mut usage = vec![Usage::default(); channels];
    let mut tiny_periods = false;
    for _ in 0..pattern_count {
        let mut rows = vec![vec![Cell::default(); channels]; ROWS];
        for row in rows.iter_mut() {
            for (ch, cell) in row.iter_mut().enumerate() {
                let raw: [u8; 4] = src.read_array()?;
                let period = u16::from(raw[1]) | (u16::from(raw[0] & 0x0F) << 8);
                tiny_periods |= period > 0 && period < 114;
                *cell = Cell::parse(raw);
                usage[ch].note(cell.cmd, cell.value);
            }
        }
        cells.push(rows);
    }
    if tiny_periods {
        tracing::debug!("periods below the Amiga limit");
    }

    let mut samples = Vec::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        let mut sample = Sample::new(&latin1(&header.name));
        sample.center_rate = header.center_rate();
        let frames = header.frames();
        let stored = src.read(header.stored_len().min(src.remaining()))?;
        if stored.len() < frames {
            warnings.push(format!(
                "sample {} truncated: {} of {} bytes",
                i + 1,
                stored.len(),
                frames
            ));
        }
        sample.data = SampleData::Pcm8(stored.iter().take(frames).map(|&b| b as i8).collect());
        if let Some((start, end)) = header.loop_bytes() {
            sample.set_loop(start, end, LoopMode::Forward);
        }
        samples.push(sample);
    }

    let systems = channels.div_ceil(4);
    let mut song = Song::with_channels(&name, systems * 4, ROWS);
    for _ in 0..systems {
        song.add_system(Chip::Amiga);
    }
    song.tuning = PAL_TUNING;
    song.compat.linear_pitch = false;
    song.compat.no_slides_on_first_tick = true;
    song.compat.row_resets_arp_pos = true;
    song.compat.ignore_jump_at_end = false;

    let split = if VBLANK_SONGS.contains(&name.as_str()) {
        SpeedSplit::SpeedOnly
    } else {
        SpeedSplit::Bpm(0x21)
    };
    let sample_count = samples.len();
    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    let sub = song.main_mut();
    sub.hz = HZ;
    sub.set_orders_len(usize::from(order_count));
    for (pos, &pattern) in orders.iter().take(usize::from(order_count)).enumerate() {
        sub.set_order_all(pos, pattern);
    }
    for (ch, channel) in sub.channels.iter_mut().enumerate() {
        if ch >= channels {
            channel.visible = false;
            continue;
        }
        channel.name = bounded_name(&format!("Channel {}", ch + 1));
        for (index, rows) in cells.iter().enumerate() {
            // effect memory does not carry across patterns
            let mut memory = ChannelMemory::new(split);
            let pattern = channel.pattern_mut(index as u8, ROWS);
            for (row, cell) in pattern.rows.iter_mut().zip(rows.iter().map(|r| r[ch])) {
                fill_row(row, cell, &headers, sample_count, &mut out);
                if !memory.convert(&usage[ch], cell.cmd, cell.value, row, &mut out) {
                    out.warn(format!("MOD effect {:X}xx not supported", cell.cmd));
                }
            }
        }
    }
    sub.fit_effect_columns();

    song.instruments = samples
        .iter()
        .enumerate()
        .map(|(i, s)| Instrument::sampled(s.name.as_str(), i as u16))
        .collect();
    song.samples = samples;
    Ok(song)
}

/// Note and instrument columns. An instrument sets its sample's volume.
fn fill_row(
    row: &mut Row,
    cell: Cell,
    headers: &[SampleHeader],
    sample_count: usize,
    out: &mut Emitter<'_>,
) {
    row.note = cell.note;
    let Some(ins) = cell.instrument else {
        return;
    };
    match headers.get(usize::from(ins)).filter(|_| usize::from(ins) < sample_count) {
        Some(header) => {
            row.instrument = Some(ins);
            row.volume = Some(header.volume.min(0x40));
        }
        None => out.warn(format!("instrument {} out of range", ins + 1)),
    }
}
