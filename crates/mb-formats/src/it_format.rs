//! Impulse Tracker modules.
//!
//! Every channel is a PCM voice; channels fill ES5506 chips 32 at a time.
//! Patterns may have any length up to 256 rows, so each subsong takes the
//! longest pattern it plays and shorter patterns end with a `0D 00` on
//! channel 0. Letter commands share the Scream Tracker engine.

use binrw::BinRead;
use mb_ir::{
    fx, Chip, Instrument, InstrumentBody, LoopMode, Note, NoteMapEntry, Row, Sample, SampleMap,
    Song, Subsong,
};

use crate::effects::st3::St3Engine;
use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::pcm::PcmLayout;
use crate::reader::{latin1, ByteSource, Record};
use crate::LoadOptions;

pub const IT_MAGIC: &[u8] = b"IMPM";

const CHANNELS: usize = 64;
const MAX_ROWS: usize = 256;
const DEFAULT_ROWS: usize = 64;

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    magic: [u8; 4],
    name: [u8; 26],
    highlight: [u8; 2],
    order_count: u16,
    instrument_count: u16,
    sample_count: u16,
    pattern_count: u16,
    tracker: u16,
    compat: u16,
    flags: u16,
    special: u16,
    global_volume: u8,
    mix_volume: u8,
    speed: u8,
    tempo: u8,
    _separation: u8,
    _pitch_wheel: u8,
    message_len: u16,
    message_offset: u32,
    _reserved: u32,
    _channel_pan: [u8; 64],
    _channel_volume: [u8; 64],
}

impl Record for Header {
    const SIZE: usize = 192;
}

impl Header {
    fn uses_instruments(&self) -> bool {
        self.flags & 4 != 0
    }

    fn linear_slides(&self) -> bool {
        self.flags & 8 != 0
    }

    fn has_message(&self) -> bool {
        self.special & 1 != 0 && self.message_len > 0
    }

    /// Instruments written before IT 2.00 use the older field layout.
    fn old_instruments(&self) -> bool {
        self.compat < 0x200
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct InstrumentHeader {
    magic: [u8; 4],
    _dos_name: [u8; 12],
    _zero: u8,
    _params: [u8; 15],
    name: [u8; 26],
    /// Cutoff and resonance in the new layout, reserved in the old one.
    filter: [u8; 2],
    _midi: [u8; 4],
    keyboard: [[u8; 2]; 120],
}

impl Record for InstrumentHeader {
    const SIZE: usize = 304;
}

impl InstrumentHeader {
    fn instrument(&self) -> Instrument {
        let note_map = self
            .keyboard
            .iter()
            .map(|&[note, sample]| NoteMapEntry { sample: u16::from(sample).checked_sub(1), note })
            .collect();
        Instrument::new(
            &latin1(&self.name),
            InstrumentBody::Sample(SampleMap { initial_sample: None, note_map: Some(note_map) }),
        )
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    magic: [u8; 4],
    dos_name: [u8; 12],
    _zero: u8,
    _global_volume: u8,
    flags: u8,
    _volume: u8,
    name: [u8; 26],
    convert: u8,
    _default_pan: u8,
    length: u32,
    loop_start: u32,
    loop_end: u32,
    c5_speed: u32,
    sustain_start: u32,
    sustain_end: u32,
    data_offset: u32,
    _vibrato: [u8; 4],
}

impl Record for SampleHeader {
    const SIZE: usize = 80;
}

impl SampleHeader {
    fn compressed(&self) -> bool {
        self.flags & 8 != 0
    }

    fn layout(&self) -> PcmLayout {
        PcmLayout {
            frames: self.length as usize,
            wide: self.flags & 2 != 0,
            stereo: self.flags & 4 != 0,
            signed: self.convert & 1 != 0,
            big_endian: self.convert & 2 != 0,
            delta: false,
        }
    }

    /// The sustain loop wins over the normal loop when both are set.
    fn loop_region(&self) -> Option<(u32, u32, LoopMode)> {
        let mode = |ping_pong: bool| if ping_pong { LoopMode::PingPong } else { LoopMode::Forward };
        if self.flags & 32 != 0 {
            Some((self.sustain_start, self.sustain_end, mode(self.flags & 128 != 0)))
        } else if self.flags & 16 != 0 {
            Some((self.loop_start, self.loop_end, mode(self.flags & 64 != 0)))
        } else {
            None
        }
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct PatternHeader {
    length: u16,
    rows: u16,
    _reserved: u32,
}

impl Record for PatternHeader {
    const SIZE: usize = 8;
}

// ---------------------------------------------------------------------------
// Packed pattern data
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cell {
    channel: usize,
    note: Option<u8>,
    instrument: Option<u8>,
    volume: Option<u8>,
    effect: Option<(u8, u8)>,
}

impl Cell {
    fn letter(&self) -> Option<(u8, u8)> {
        self.effect
            .and_then(|(cmd, value)| Some((cmd.checked_add(b'@')?, value)))
            .filter(|(letter, _)| letter.is_ascii_uppercase())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    EndOfRow,
    Cell(Cell),
}

#[derive(Clone, Copy, Debug, Default)]
struct Last {
    note: u8,
    instrument: u8,
    volume: u8,
    effect: (u8, u8),
}

/// Walks packed pattern bytes, tracking per-channel masks and the
/// last value of each column. A truncated entry ends the pattern.
struct Packed<'a> {
    src: ByteSource<'a>,
    masks: [u8; CHANNELS],
    last: [Last; CHANNELS],
}

impl<'a> Packed<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { src: ByteSource::new(bytes), masks: [0; CHANNELS], last: [Last::default(); CHANNELS] }
    }
}

impl Iterator for Packed<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let var = self.src.read_u8().ok()?;
        if var == 0 {
            return Some(Event::EndOfRow);
        }
        let channel = usize::from((var - 1) & 63);
        if var & 0x80 != 0 {
            self.masks[channel] = self.src.read_u8().ok()?;
        }
        let mask = self.masks[channel];
        let mut last = self.last[channel];
        if mask & 1 != 0 {
            last.note = self.src.read_u8().ok()?;
        }
        if mask & 2 != 0 {
            last.instrument = self.src.read_u8().ok()?;
        }
        if mask & 4 != 0 {
            last.volume = self.src.read_u8().ok()?;
        }
        if mask & 8 != 0 {
            last.effect = (self.src.read_u8().ok()?, self.src.read_u8().ok()?);
        }
        self.last[channel] = last;
        Some(Event::Cell(Cell {
            channel,
            note: (mask & 0x11 != 0).then_some(last.note),
            instrument: (mask & 0x22 != 0).then_some(last.instrument),
            volume: (mask & 0x44 != 0).then_some(last.volume),
            effect: (mask & 0x88 != 0).then_some(last.effect),
        }))
    }
}

fn it_note(note: u8) -> Note {
    match note {
        255 => Note::Release,
        254 => Note::Off,
        0..=119 => Note::from_octave_semitone((note / 12) as i8, note % 12),
        // note fade
        _ => Note::MacroRelease,
    }
}

fn volume_column(value: u8, row: &mut Row, out: &mut Emitter<'_>) {
    match value {
        0..=64 => row.volume = Some(value),
        128..=192 => {
            let pan = u16::from(value - 128) * 255 / 64;
            out.emit(row, fx::PANNING, pan as u8);
        }
        _ => out.warn(format!("volume column command {value} not supported")),
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

struct StoredPattern<'a> {
    rows: usize,
    data: &'a [u8],
}

pub fn load_it(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    let header: Header = src.read_record()?;
    if header.magic != IT_MAGIC {
        return Err(FormatError::invalid("not an IT module"));
    }
    if header.instrument_count > 256 {
        return Err(FormatError::out_of_range("instrument count", header.instrument_count));
    }
    if header.sample_count > 256 {
        return Err(FormatError::out_of_range("sample count", header.sample_count));
    }
    let pattern_count = usize::from(header.pattern_count);
    if pattern_count > 256 || pattern_count > opts.max_patterns {
        return Err(FormatError::out_of_range("pattern count", header.pattern_count));
    }
    tracing::info!(
        "IT tracker {:#06x} (compatible {:#06x}): {} orders, {} patterns",
        header.tracker,
        header.compat,
        header.order_count,
        header.pattern_count
    );
    tracing::debug!("global volume {}, mix volume {}", header.global_volume, header.mix_volume);

    let raw_orders = src.read(usize::from(header.order_count))?;
    for (pos, &index) in raw_orders.iter().enumerate() {
        // 254 and 255 are markers
        if index < 254 {
            opts.check_order(pos, None, index)?;
        }
    }
    let plan = crate::s3m_format::split_orders(raw_orders);
    let mut read_ptrs = |n: u16| -> Result<Vec<usize>> {
        (0..n).map(|_| Ok(src.read_u32_le()? as usize)).collect()
    };
    let ins_ptrs = read_ptrs(header.instrument_count)?;
    let smp_ptrs = read_ptrs(header.sample_count)?;
    let pat_ptrs = read_ptrs(header.pattern_count)?;

    let mut out = Emitter::new(opts.max_effect_columns, warnings);

    let notes = if header.has_message() {
        let start = header.message_offset as usize;
        match data.get(start..start + usize::from(header.message_len)) {
            Some(text) => latin1(text).replace('\r', "\n"),
            None => {
                out.warn("song message lies outside the file");
                String::new()
            }
        }
    } else {
        String::new()
    };

    let mut instruments = Vec::with_capacity(ins_ptrs.len());
    for &ptr in &ins_ptrs {
        if ptr == 0 {
            instruments.push(Instrument::new("", InstrumentBody::Sample(SampleMap::default())));
            continue;
        }
        src.seek(ptr)?;
        let ins: InstrumentHeader = src.read_record()?;
        if ins.magic != *b"IMPI" {
            return Err(FormatError::invalid("invalid instrument header"));
        }
        if !header.old_instruments() {
            tracing::debug!("instrument filter {:?}", ins.filter);
        }
        instruments.push(ins.instrument());
    }

    let mut samples = Vec::with_capacity(smp_ptrs.len());
    for (i, &ptr) in smp_ptrs.iter().enumerate() {
        if ptr == 0 {
            samples.push(Sample::new(""));
            continue;
        }
        src.seek(ptr)?;
        let smp: SampleHeader = src.read_record()?;
        if smp.magic != *b"IMPS" {
            return Err(FormatError::invalid("invalid sample header"));
        }
        let mut sample = Sample::new(&latin1(&smp.name));
        tracing::debug!("sample {}: {}", i + 1, latin1(&smp.dos_name));
        sample.center_rate = smp.c5_speed / 2;
        if smp.compressed() {
            out.warn(format!("sample {}: compressed sample data not supported", i + 1));
        } else if smp.length > 0 {
            let layout = smp.layout();
            src.seek(smp.data_offset as usize)?;
            let want = layout.stored_len();
            let stored = src.read(want.min(src.remaining()))?;
            if stored.len() < want {
                out.warn(format!("sample {}: data truncated", i + 1));
            }
            sample.data = layout.decode(stored);
            if let Some((start, end, mode)) = smp.loop_region() {
                sample.set_loop(start, end, mode);
            }
        }
        samples.push(sample);
    }
    if !header.uses_instruments() {
        instruments = samples
            .iter()
            .enumerate()
            .map(|(i, s)| Instrument::sampled(s.name.as_str(), i as u16))
            .collect();
    }

    let mut patterns = Vec::with_capacity(pat_ptrs.len());
    for (i, &ptr) in pat_ptrs.iter().enumerate() {
        if ptr == 0 {
            patterns.push(None);
            continue;
        }
        src.seek(ptr)?;
        let ph: PatternHeader = src.read_record()?;
        let rows = usize::from(ph.rows);
        if rows == 0 || rows > MAX_ROWS {
            return Err(FormatError::out_of_range(format!("pattern {i} rows"), ph.rows));
        }
        let len = usize::from(ph.length);
        let data = src.read(len.min(src.remaining()))?;
        patterns.push(Some(StoredPattern { rows, data }));
    }

    let mut engine = St3Engine::new(CHANNELS);
    let mut max_channel = 0;
    for stored in patterns.iter().flatten() {
        for event in Packed::new(stored.data) {
            if let Event::Cell(cell) = event {
                max_channel = max_channel.max(cell.channel);
                if let Some((letter, _)) = cell.letter() {
                    engine.prescan(cell.channel, letter);
                }
            }
        }
    }

    let chips = (max_channel + 32) >> 5;
    let mut song = Song::with_channels(&latin1(&header.name), chips * Chip::Es5506.channels(), DEFAULT_ROWS);
    for _ in 0..chips {
        song.add_system(Chip::Es5506);
    }
    song.notes = notes;
    song.compat.linear_pitch = header.linear_slides();
    song.compat.no_slides_on_first_tick = true;
    song.compat.row_resets_arp_pos = true;
    song.compat.ignore_jump_at_end = false;
    song.compat.pitch_slide_speed = 4;

    let main = song.main_mut();
    main.speeds = vec![header.speed.max(1)];
    let tempo = if header.tempo == 0 { 125 } else { header.tempo };
    main.hz = f32::from(tempo) / 2.5;
    let [first, second] = header.highlight;
    if first > 0 && second > 0 {
        main.highlight = (first, second);
    }
    for ch in main.channels.iter_mut().skip(max_channel + 1) {
        ch.visible = false;
    }

    for (index, stored) in patterns.iter().enumerate() {
        if let Some(stored) = stored {
            let target = PatternTarget { index: index as u8, rows: stored.rows, sub: &mut *main };
            convert_pattern(stored, target, &mut engine, &plan.positions, &mut out);
        }
    }

    let pattern_rows = |index: u8| -> usize {
        match patterns.get(usize::from(index)) {
            Some(Some(stored)) => stored.rows,
            _ => DEFAULT_ROWS,
        }
    };
    let template = song.main().clone();
    song.subsongs = plan
        .subsongs
        .into_iter()
        .enumerate()
        .map(|(i, (name, orders))| {
            let mut sub = template.clone();
            sub.name = name;
            sub.set_orders_len(orders.len().max(1));
            for (pos, &pattern) in orders.iter().enumerate() {
                sub.set_order_all(pos, pattern);
            }
            if i > 0 {
                for ch in &mut sub.channels {
                    ch.patterns.retain(|index, _| orders.contains(index));
                }
            }
            sub.pat_len = orders.iter().map(|&p| pattern_rows(p)).max().unwrap_or(DEFAULT_ROWS);
            fit_pattern_lengths(&mut sub);
            sub.fit_effect_columns();
            sub
        })
        .collect();

    song.instruments = instruments;
    song.samples = samples;
    Ok(song)
}

/// Pad or cut every pattern to the subsong's pattern length.
fn fit_pattern_lengths(sub: &mut Subsong) {
    let len = sub.pat_len;
    for ch in &mut sub.channels {
        for pattern in ch.patterns.values_mut() {
            pattern.resize(len);
        }
    }
}

/// Where one IT pattern's rows land.
struct PatternTarget<'s> {
    index: u8,
    rows: usize,
    sub: &'s mut Subsong,
}

impl PatternTarget<'_> {
    fn finish_row(&mut self, work: &mut [Row; CHANNELS], row: usize, engine: &mut St3Engine, out: &mut Emitter<'_>) {
        for (ch, cell) in work.iter_mut().enumerate() {
            engine.commit(ch, cell, out);
            if !cell.is_empty() {
                if let Some(channel) = self.sub.channels.get_mut(ch) {
                    if let Some(slot) = channel.pattern_mut(self.index, self.rows).row_mut(row) {
                        *slot = *cell;
                    }
                }
            }
            *cell = Row::default();
        }
        engine.end_row();
    }

    /// `0D 00` on the last row so playback leaves short patterns early.
    fn mark_end(&mut self, out: &mut Emitter<'_>) {
        if let Some(first) = self.sub.channels.first_mut() {
            if let Some(last) = first.pattern_mut(self.index, self.rows).row_mut(self.rows - 1) {
                out.emit(last, fx::BREAK, 0);
            }
        }
    }
}

fn convert_pattern(
    stored: &StoredPattern<'_>,
    mut target: PatternTarget<'_>,
    engine: &mut St3Engine,
    positions: &[u8],
    out: &mut Emitter<'_>,
) {
    engine.start_pattern();
    let mut work = [Row::default(); CHANNELS];
    let mut row = 0;
    let mut pending = false;

    for event in Packed::new(stored.data) {
        let cell = match event {
            Event::EndOfRow => {
                target.finish_row(&mut work, row, engine, out);
                pending = false;
                row += 1;
                if row >= stored.rows {
                    break;
                }
                continue;
            }
            Event::Cell(cell) => cell,
        };
        pending = true;
        let dest = &mut work[cell.channel];
        if let Some(note) = cell.note {
            dest.note = it_note(note);
        }
        if let Some(ins) = cell.instrument {
            dest.instrument = u16::from(ins).checked_sub(1);
        }
        if let Some(volume) = cell.volume {
            volume_column(volume, dest, out);
        }
        if let Some((letter, value)) = cell.letter() {
            let retrigger = cell.instrument.is_some();
            engine.effect(cell.channel, letter, value, retrigger, positions, dest, out);
        }
    }
    if pending && row < stored.rows {
        target.finish_row(&mut work, row, engine, out);
    }
    target.mark_end(out);
}
