//! Future Composer 1.3 (`SMOD`) and 1.4 (`FC14`).
//!
//! Four Amiga channels. Every sequence entry becomes one order position
//! with its own 32-row pattern per channel; identical patterns are merged
//! afterwards. Instruments are volume sequences paired with frequency
//! sequences, which become volume, arpeggio, wave and pitch macros.

use binrw::BinRead;
use mb_ir::{
    fx, Chip, Instrument, InstrumentBody, LoopMode, Macro, MacroKind, Note, Row, Sample,
    SampleData, SampleMap, Song, Wavetable, ARP_FIXED,
};

use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::reader::{parse_record, ByteSource, Record};
use crate::LoadOptions;

pub const FC13_MAGIC: &[u8] = b"SMOD";
pub const FC14_MAGIC: &[u8] = b"FC14";

const ROWS: usize = 32;
const CHANNELS: usize = 4;
const SEQUENCE_SIZE: usize = 13;
const MACRO_SIZE: usize = 64;
const SAMPLES: usize = 10;
const FC14_WAVES: usize = 80;
const FC13_WAVES: usize = 48;
const MACRO_LIMIT: usize = 255;
const PAL_TUNING: f32 = 436.0;

const END_NOTE: u8 = 0x49;
const NOTE_OFF: u8 = 0xF0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    Fc13,
    Fc14,
}

impl Variant {
    fn header_len(self) -> usize {
        match self {
            Variant::Fc13 => Header::SIZE,
            Variant::Fc14 => Header::SIZE + FC14_WAVES,
        }
    }
}

#[derive(BinRead, Clone, Copy, Debug)]
#[br(big)]
struct SampleInfo {
    /// In words
    len: u16,
    /// In bytes
    loop_start: u16,
    /// In words
    loop_len: u16,
}

#[derive(BinRead, Debug)]
#[br(big)]
struct Header {
    magic: [u8; 4],
    sequence_len: u32,
    pattern_ptr: u32,
    pattern_len: u32,
    freq_ptr: u32,
    freq_len: u32,
    vol_ptr: u32,
    vol_len: u32,
    sample_ptr: u32,
    /// Sample block size in 1.3, wavetable pointer in 1.4.
    last: u32,
    samples: [SampleInfo; SAMPLES],
}

impl Record for Header {
    const SIZE: usize = 100;
}

impl Header {
    fn fits(&self, len: usize, ptr: u32, size: u32) -> bool {
        (ptr as usize).checked_add(size as usize).is_some_and(|end| end <= len)
    }

    /// Whether the block layout is consistent with `variant` in a file of
    /// `len` bytes.
    fn layout_valid(&self, variant: Variant, len: usize) -> bool {
        let seq = self.sequence_len as usize;
        seq > 0
            && seq % SEQUENCE_SIZE == 0
            && self.pattern_len % 64 == 0
            && self.freq_len % 64 == 0
            && self.vol_len % 64 == 0
            && variant.header_len() + seq <= self.pattern_ptr as usize
            && self.fits(len, self.pattern_ptr, self.pattern_len)
            && self.fits(len, self.freq_ptr, self.freq_len)
            && self.fits(len, self.vol_ptr, self.vol_len)
            && (self.sample_ptr as usize) <= len
            && match variant {
                Variant::Fc13 => true,
                Variant::Fc14 => self.last >= self.sample_ptr && (self.last as usize) <= len,
            }
    }
}

/// Identify the variant from the magic, or failing that from a header
/// layout that holds together.
pub fn probe(data: &[u8]) -> Option<Variant> {
    match data.get(..4)? {
        m if m == FC13_MAGIC => return Some(Variant::Fc13),
        m if m == FC14_MAGIC => return Some(Variant::Fc14),
        _ => {}
    }
    let header: Header = parse_record(data.get(..Header::SIZE)?).ok()?;
    [Variant::Fc14, Variant::Fc13]
        .into_iter()
        .find(|&v| header.layout_valid(v, data.len()))
}

#[derive(Clone, Copy, Debug)]
struct Sequence {
    patterns: [u8; CHANNELS],
    transpose: [i8; CHANNELS],
    instrument_offset: [i8; CHANNELS],
    speed: u8,
}

impl Sequence {
    fn parse(raw: &[u8]) -> Self {
        let mut seq = Sequence {
            patterns: [0; CHANNELS],
            transpose: [0; CHANNELS],
            instrument_offset: [0; CHANNELS],
            speed: raw[12],
        };
        for ch in 0..CHANNELS {
            seq.patterns[ch] = raw[ch * 3];
            seq.transpose[ch] = raw[ch * 3 + 1] as i8;
            seq.instrument_offset[ch] = raw[ch * 3 + 2] as i8;
        }
        seq
    }
}

/// 32 rows of (note, value) byte pairs.
#[derive(Clone, Copy, Debug)]
struct FcPattern([[u8; 2]; ROWS]);

impl FcPattern {
    fn parse(raw: &[u8]) -> Self {
        let mut rows = [[0; 2]; ROWS];
        for (row, pair) in rows.iter_mut().zip(raw.chunks_exact(2)) {
            *row = [pair[0], pair[1]];
        }
        FcPattern(rows)
    }

    fn note(&self, row: usize) -> u8 {
        self.0[row][0]
    }

    fn value(&self, row: usize) -> u8 {
        self.0[row][1]
    }
}

fn fc_note(note: u8, transpose: i8) -> Note {
    let high = if note >= 0x3D { 72 } else { 0 };
    Note::from_c0_offset(24 + i16::from(note) + i16::from(transpose) - high)
}

// ---------------------------------------------------------------------------
// Preset waves
// ---------------------------------------------------------------------------

const XOR_TRIANGLE: [u8; 32] = [
    0xc0, 0xc0, 0xd0, 0xd8, 0xe0, 0xe8, 0xf0, 0xf8, 0x00, 0xf8, 0xf0, 0xe8, 0xe0, 0xd8, 0xd0, 0xc8,
    0xc0, 0xb8, 0xb0, 0xa8, 0xa0, 0x98, 0x90, 0x88, 0x80, 0x88, 0x90, 0x98, 0xa0, 0xa8, 0xb0, 0xb8,
];

const CUSTOM_1: [u8; 32] = [
    0x45, 0x45, 0x79, 0x7d, 0x7a, 0x77, 0x70, 0x66, 0x61, 0x58, 0x53, 0x4d, 0x2c, 0x20, 0x18, 0x12,
    0x04, 0xdb, 0xd3, 0xcd, 0xc6, 0xbc, 0xb5, 0xae, 0xa8, 0xa3, 0x9d, 0x99, 0x93, 0x8e, 0x8b, 0x8a,
];

const CUSTOM_2: [u8; 32] = [
    0x45, 0x45, 0x79, 0x7d, 0x7a, 0x77, 0x70, 0x66, 0x5b, 0x4b, 0x43, 0x37, 0x2c, 0x20, 0x18, 0x12,
    0x04, 0xf8, 0xe8, 0xdb, 0xcf, 0xc6, 0xbe, 0xb0, 0xa8, 0xa4, 0x9e, 0x9a, 0x95, 0x94, 0x8d, 0x83,
];

const TINY_TRIANGLE: [u8; 16] = [
    0x00, 0x00, 0x40, 0x60, 0x7f, 0x60, 0x40, 0x20, 0x00, 0xe0, 0xc0, 0xa0, 0x80, 0xa0, 0xc0, 0xe0,
];

/// Built-in 32-step waveform `index`, unsigned around 0x80.
pub fn preset_wave(index: usize) -> Wavetable {
    let step = |i: usize| -> u8 {
        match index {
            0x00..=0x0F => (XOR_TRIANGLE[i] ^ 0x80) ^ if index + 15 < i { 0x87 } else { 0 },
            0x10..=0x1F => {
                if index > i {
                    0x01
                } else {
                    0xFF
                }
            }
            0x20..=0x27 => {
                if index - 0x18 > (i & 15) {
                    0x01
                } else {
                    0xFF
                }
            }
            0x28 | 0x2E => (i << 3) as u8,
            0x29 | 0x2F => (i << 4) as u8,
            0x2A => CUSTOM_1[i] ^ 0x80,
            0x2B => CUSTOM_2[i] ^ 0x80,
            0x2C | 0x2D => TINY_TRIANGLE[i & 15] ^ 0x80,
            _ => i as u8,
        }
    };
    Wavetable::new(255, (0..32).map(|i| i32::from(step(i))).collect())
}

// ---------------------------------------------------------------------------
// Instrument macros
// ---------------------------------------------------------------------------

/// Volume sequence: speed, frequency sequence, vibrato speed, depth and
/// delay, then volume steps and commands from byte 5.
fn volume_macro(m: &[u8; MACRO_SIZE]) -> Macro {
    let speed = usize::from(m[0].max(1));
    let mut last = m[5];
    let mut values = Vec::new();
    let mut positions = [None; MACRO_SIZE];
    let mut loop_to = None;
    let mut j = 5;
    while j < MACRO_SIZE && values.len() < MACRO_LIMIT {
        positions[j] = Some(values.len());
        match m[j] {
            0xE1 => break,
            0xE0 => {
                loop_to = m.get(j + 1).and_then(|&to| positions[usize::from(to & 63)]);
                break;
            }
            0xE8 => {
                let Some(&time) = m.get(j + 1) else { break };
                values.extend(std::iter::repeat(i32::from(last)).take(usize::from(time) + 1));
                j += 1;
            }
            0xE9 | 0xEA => {
                let (Some(&step), Some(&time)) = (m.get(j + 1), m.get(j + 2)) else { break };
                let step = step as i8;
                for _ in 0..=time {
                    last = if step >= 0 {
                        last.saturating_add(step as u8).min(63)
                    } else {
                        last.saturating_sub(step.unsigned_abs())
                    };
                    values.push(i32::from(last));
                }
                j += 2;
            }
            v => {
                last = v;
                values.extend(std::iter::repeat(i32::from(v)).take(speed));
            }
        }
        j += 1;
    }
    values.truncate(MACRO_LIMIT);
    let mut vol = Macro::from_values(values);
    if let Some(pos) = loop_to {
        vol.set_loop(pos);
    }
    vol
}

/// What a frequency sequence turns into.
#[derive(Debug, Default, PartialEq, Eq)]
struct FreqProgram {
    initial_sample: Option<u16>,
    arpeggio: Macro,
    wave: Option<Macro>,
}

/// Walk frequency sequence `start`. `E7` continues in another sequence;
/// the hop count is bounded so self-references end.
fn freq_program(seqs: &[[u8; MACRO_SIZE]], start: usize) -> FreqProgram {
    let mut program = FreqProgram::default();
    let Some(mut fm) = seqs.get(start) else { return program };
    let mut arp = Vec::new();
    let mut waves = Vec::new();
    let mut wave: Option<i32> = None;
    let mut arp_at = [None; MACRO_SIZE];
    let mut wave_at = [None; MACRO_SIZE];
    let (mut arp_loop, mut wave_loop) = (None, None);
    let mut hops = 0;
    let mut j = 0;
    while j < MACRO_SIZE && arp.len() < MACRO_LIMIT {
        arp_at[j] = Some(arp.len());
        wave_at[j] = Some(waves.len());
        match fm[j] {
            0xE1 => break,
            0xE2 | 0xE4 => {
                let Some(&w) = fm.get(j + 1) else { break };
                if usize::from(w) < SAMPLES {
                    program.initial_sample.get_or_insert(u16::from(w));
                } else {
                    wave = Some(i32::from(w) - SAMPLES as i32);
                }
                j += 1;
            }
            0xE0 => {
                if let Some(&to) = fm.get(j + 1) {
                    let to = usize::from(to & 63);
                    arp_loop = arp_at[to];
                    wave_loop = wave_at[to];
                }
                break;
            }
            0xE7 => {
                let Some(&next) = fm.get(j + 1) else { break };
                hops += 1;
                if hops > seqs.len() {
                    break;
                }
                fm = &seqs[usize::from(next).min(seqs.len() - 1)];
                arp_at = [None; MACRO_SIZE];
                wave_at = [None; MACRO_SIZE];
                j = 0;
                continue;
            }
            0xE3 | 0xE8 | 0xE9 | 0xEA => {
                tracing::debug!("frequency sequence command {:02X} ignored", fm[j]);
            }
            v => {
                arp.push(if v > 0x80 {
                    (i32::from(v) - 0x80 + 24) | ARP_FIXED
                } else {
                    i32::from(v)
                });
                waves.push(wave.unwrap_or(0));
            }
        }
        j += 1;
    }
    program.arpeggio = Macro::from_values(arp);
    if let Some(pos) = arp_loop {
        program.arpeggio.set_loop(pos);
    }
    if let Some(w) = wave {
        if waves.is_empty() {
            waves.push(w);
        }
        let mut m = Macro::from_values(waves);
        if let Some(pos) = wave_loop {
            m.set_loop(pos);
        }
        program.wave = Some(m);
    }
    program
}

/// Triangle pitch vibrato after `delay` ticks, in 1/32 steps.
fn vibrato_macro(speed: u8, depth: u8, delay: u8) -> Option<Macro> {
    if speed == 0 || depth == 0 {
        return None;
    }
    let (speed, depth) = (i32::from(speed), i32::from(depth));
    let mut values = vec![0; usize::from(delay) + 1];
    let loop_start = values.len();
    let mut pos = 0;
    loop {
        pos = (pos + speed).min(depth);
        values.push(pos * 32);
        if pos >= depth {
            break;
        }
    }
    loop {
        pos = (pos - speed).max(-depth);
        values.push(pos * 32);
        if pos <= -depth {
            break;
        }
    }
    loop {
        pos = (pos + speed).min(0);
        values.push(pos * 32);
        if pos >= 0 {
            break;
        }
    }
    values.truncate(MACRO_LIMIT);
    let mut m = Macro::from_values(values);
    m.set_loop(loop_start);
    Some(m)
}

fn instrument(index: usize, m: &[u8; MACRO_SIZE], freq: &[[u8; MACRO_SIZE]]) -> Instrument {
    let program = freq_program(freq, usize::from(m[1]));
    let mut ins = Instrument::new(
        &format!("Instrument {index}"),
        InstrumentBody::Sample(SampleMap { initial_sample: program.initial_sample, note_map: None }),
    );
    ins.macros.set(MacroKind::Volume, volume_macro(m));
    ins.macros.set(MacroKind::Arpeggio, program.arpeggio);
    if let Some(wave) = program.wave {
        ins.macros.set(MacroKind::Wave, wave);
    }
    if let Some(pitch) = vibrato_macro(m[2], m[3], m[4]) {
        ins.macros.set(MacroKind::Pitch, pitch);
    }
    ins
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Per-channel state carried across sequence entries.
#[derive(Clone, Copy, Debug, Default)]
struct Voice {
    last_instrument: Option<u16>,
    last_note: Option<u8>,
    last_transpose: i8,
    sliding: bool,
}

fn instrument_index(value: i16) -> Option<u16> {
    u16::try_from(value).ok()
}

fn convert_pattern(
    source: &FcPattern,
    seq: &Sequence,
    ch: usize,
    voice: &mut Voice,
    rows: &mut [Row],
    out: &mut Emitter<'_>,
) {
    let transpose = seq.transpose[ch];
    let offset = i16::from(seq.instrument_offset[ch]);
    let mut skip_value = false;
    for k in 0..ROWS {
        let note = source.note(k);
        let value = source.value(k);
        if (1..END_NOTE).contains(&note) {
            voice.last_note = Some(note);
            rows[k].note = fc_note(note, transpose);
            if voice.sliding {
                voice.sliding = false;
                out.emit(&mut rows[k], fx::PORTA_DOWN, 0);
            }
        } else if note == END_NOTE {
            if k > 0 {
                out.emit(&mut rows[k - 1], fx::BREAK, 0);
            }
        } else if k == 0 && voice.last_transpose != transpose {
            // transposition change: glide the held note to its new pitch
            rows[0].instrument = voice.last_instrument;
            out.emit(&mut rows[0], fx::TONE_PORTA, 0xFF);
            voice.last_transpose = transpose;
            if let Some(last) = voice.last_note {
                rows[0].note = fc_note(last, transpose);
            }
        }

        if value != 0 {
            if skip_value {
                skip_value = false;
            } else if value == NOTE_OFF {
                rows[k].note = Note::Off;
                rows[k].instrument = None;
            } else if value & 0xE0 != 0 {
                if value & 0x40 != 0 {
                    out.emit(&mut rows[k], fx::PORTA_DOWN, 0);
                    voice.sliding = false;
                } else if value & 0x80 != 0 {
                    voice.sliding = true;
                    if k + 1 < ROWS {
                        let next = source.value(k + 1);
                        let cmd = if next & 0x20 != 0 { fx::PORTA_DOWN } else { fx::PORTA_UP };
                        out.emit(&mut rows[k], cmd, next & 0x1F);
                        skip_value = true;
                    } else {
                        out.emit(&mut rows[k], fx::PORTA_DOWN, 0);
                    }
                }
            } else {
                let ins = instrument_index((i16::from(value) + offset) & 0x3F);
                rows[k].instrument = ins;
                voice.last_instrument = ins;
            }
        } else if (1..END_NOTE).contains(&note) {
            let ins = instrument_index(offset);
            rows[k].instrument = ins;
            voice.last_instrument = ins;
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

fn blocks<const N: usize>(src: &mut ByteSource<'_>, ptr: u32, len: u32) -> Result<Vec<[u8; N]>> {
    src.seek(ptr as usize)?;
    (0..len as usize / N).map(|_| src.read_array::<N>()).collect()
}

pub fn load_fc(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let variant = probe(data).ok_or_else(|| FormatError::invalid("not a Future Composer module"))?;
    let mut src = ByteSource::new(data);
    let header: Header = src.read_record()?;
    if header.magic != FC13_MAGIC && header.magic != FC14_MAGIC {
        warnings.push("damaged magic; loading by header layout");
    }
    tracing::info!("Future Composer {:?}", variant);
    tracing::debug!(
        "patterns at {:#x} ({} bytes), frequency sequences at {:#x}, volume sequences at {:#x}",
        header.pattern_ptr,
        header.pattern_len,
        header.freq_ptr,
        header.vol_ptr
    );
    if header.sequence_len as usize % SEQUENCE_SIZE != 0 {
        tracing::warn!("sequence block is not a multiple of {SEQUENCE_SIZE}");
    }
    if header.pattern_len % 64 != 0 {
        return Err(FormatError::invalid("pattern block is not a multiple of 64"));
    }
    let wave_lens: [u8; FC14_WAVES] = match variant {
        Variant::Fc14 => src.read_array()?,
        Variant::Fc13 => [0; FC14_WAVES],
    };

    let seq_count = header.sequence_len as usize / SEQUENCE_SIZE;
    if seq_count == 0 || seq_count > 256 {
        return Err(FormatError::out_of_range("sequence count", seq_count as i64));
    }
    let sequences = (0..seq_count)
        .map(|_| Ok(Sequence::parse(src.read(SEQUENCE_SIZE)?)))
        .collect::<Result<Vec<_>>>()?;
    let patterns: Vec<FcPattern> = blocks::<64>(&mut src, header.pattern_ptr, header.pattern_len)?
        .iter()
        .map(|raw| FcPattern::parse(raw))
        .collect();
    let freq_seqs = blocks::<MACRO_SIZE>(&mut src, header.freq_ptr, header.freq_len)?;
    let vol_seqs = blocks::<MACRO_SIZE>(&mut src, header.vol_ptr, header.vol_len)?;

    src.seek(header.sample_ptr as usize)?;
    let mut samples = Vec::with_capacity(SAMPLES);
    for (i, info) in header.samples.iter().enumerate() {
        let mut sample = Sample::new(&format!("Sample {}", i + 1));
        let want = usize::from(info.len) * 2;
        let stored = src.read(want.min(src.remaining()))?;
        if stored.len() < want {
            warnings.push(format!("sample {} truncated: {} of {} bytes", i + 1, stored.len(), want));
        }
        sample.data = SampleData::Pcm8(stored.iter().map(|&b| b as i8).collect());
        if info.loop_len > 1 {
            let start = u32::from(info.loop_start);
            sample.set_loop(start, start + u32::from(info.loop_len) * 2, LoopMode::Forward);
        }
        samples.push(sample);
    }

    let wavetables = match variant {
        Variant::Fc13 => (0..FC13_WAVES).map(preset_wave).collect(),
        Variant::Fc14 => {
            src.seek(header.last as usize)?;
            let mut waves = Vec::with_capacity(FC14_WAVES);
            for (i, &len) in wave_lens.iter().enumerate() {
                if len == 0 {
                    waves.push(preset_wave(i));
                    continue;
                }
                let stored = src.read(usize::from(len) * 2)?;
                let data = stored.iter().take(256).map(|&b| i32::from(b as i8) + 128).collect();
                waves.push(Wavetable::new(255, data));
            }
            waves
        }
    };

    let mut song = Song::with_channels("", CHANNELS, ROWS);
    song.add_system(Chip::Amiga);
    song.tuning = PAL_TUNING;
    song.compat.pitch_slide_speed = 8;
    song.compat.ignore_jump_at_end = false;

    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    let sub = song.main_mut();
    sub.hz = 50.0;
    sub.speeds = vec![3];
    sub.set_orders_len(seq_count);
    let mut voices = [Voice::default(); CHANNELS];
    let empty = FcPattern([[0; 2]; ROWS]);
    for (pos, seq) in sequences.iter().enumerate() {
        for (ch, voice) in voices.iter_mut().enumerate() {
            let channel = &mut sub.channels[ch];
            channel.orders[pos] = pos as u8;
            let pattern = channel.pattern_mut(pos as u8, ROWS);
            if ch == CHANNELS - 1 && seq.speed != 0 {
                out.emit(&mut pattern.rows[0], fx::SPEED, seq.speed);
            }
            let source = match patterns.get(usize::from(seq.patterns[ch])) {
                Some(p) => p,
                None => {
                    out.warn(format!("sequence {pos} uses missing pattern {}", seq.patterns[ch]));
                    &empty
                }
            };
            convert_pattern(source, seq, ch, voice, &mut pattern.rows, &mut out);
        }
    }
    sub.merge_duplicate_patterns();
    sub.fit_effect_columns();

    song.instruments = vol_seqs
        .iter()
        .enumerate()
        .map(|(i, m)| instrument(i, m, &freq_seqs))
        .collect();
    song.samples = samples;
    song.wavetables = wavetables;
    Ok(song)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fx_of(row: &Row) -> Vec<(u8, u8)> {
        row.effects().map(|e| (e.cmd, e.param())).collect()
    }

    fn seq_bytes(body: &[u8]) -> [u8; MACRO_SIZE] {
        let mut m = [0xE1; MACRO_SIZE];
        m[..body.len()].copy_from_slice(body);
        m
    }

    #[test]
    fn notes_follow_transpose() {
        assert_eq!(fc_note(1, 0), Note::On(85));
        assert_eq!(fc_note(1, 12), Note::On(97));
        assert_eq!(fc_note(0x3D, 0), Note::On(73));
    }

    #[test]
    fn volume_sequences() {
        let speed2 = volume_macro(&seq_bytes(&[2, 0, 0, 0, 0, 10, 20]));
        assert_eq!(speed2.values, [10, 10, 20, 20]);

        let looped = volume_macro(&seq_bytes(&[1, 0, 0, 0, 0, 5, 6, 0xE0, 6]));
        assert_eq!(looped.values, [5, 6]);
        assert_eq!(looped.loop_start, Some(1));

        let sustain = volume_macro(&seq_bytes(&[1, 0, 0, 0, 0, 8, 0xE8, 2]));
        assert_eq!(sustain.values, [8, 8, 8, 8]);

        let slide = volume_macro(&seq_bytes(&[1, 0, 0, 0, 0, 10, 0xE9, 0xFE, 1]));
        assert_eq!(slide.values, [10, 8, 6]);
    }

    #[test]
    fn frequency_sequences() {
        let seqs = [seq_bytes(&[0xE2, 12, 0x01, 0x85, 0xE0, 0]), seq_bytes(&[0xE2, 3])];
        let waved = freq_program(&seqs, 0);
        assert_eq!(waved.initial_sample, None);
        assert_eq!(waved.arpeggio.values, [1, 29 | ARP_FIXED]);
        assert_eq!(waved.arpeggio.loop_start, Some(0));
        assert_eq!(waved.wave.map(|w| w.values), Some(vec![2, 2]));

        let sampled = freq_program(&seqs, 1);
        assert_eq!(sampled.initial_sample, Some(3));
        assert!(sampled.arpeggio.is_empty());
        assert!(sampled.wave.is_none());

        // a sequence that jumps to itself ends
        let looping = [seq_bytes(&[0xE7, 0])];
        assert!(freq_program(&looping, 0).arpeggio.is_empty());
        assert_eq!(freq_program(&seqs, 9), FreqProgram::default());
    }

    #[test]
    fn vibrato_is_a_looped_triangle() {
        let m = vibrato_macro(1, 2, 1).unwrap();
        assert_eq!(m.values, [0, 0, 32, 64, 32, 0, -32, -64, -32, 0]);
        assert_eq!(m.loop_start, Some(2));
        assert!(vibrato_macro(0, 2, 0).is_none());
    }

    #[test]
    fn preset_waves() {
        assert_eq!(preset_wave(0x10).data[15], 0x01);
        assert_eq!(preset_wave(0x10).data[16], 0xFF);
        assert_eq!(preset_wave(0x28).data[3], 24);
        assert_eq!(preset_wave(0x2C).data[4], 0xFF);
        assert!((0..48).all(|i| preset_wave(i).len() == 32));
    }

    fn be32(d: &mut Vec<u8>, v: u32) {
        d.extend_from_slice(&v.to_be_bytes());
    }

    /// Two sequence entries over one pattern, one instrument, one sample.
    fn module(magic: &[u8]) -> Vec<u8> {
        let mut d = magic.to_vec();
        for v in [26, 126, 64, 190, 64, 254, 64, 318, 4] {
            be32(&mut d, v);
        }
        d.extend_from_slice(&[0, 2, 0, 0, 0, 1]);
        d.resize(Header::SIZE, 0);
        d.extend_from_slice(&[0; 12]);
        d.push(3);
        d.extend_from_slice(&[0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut pattern = [0u8; 64];
        pattern[..8].copy_from_slice(&[0x19, 0x01, 0, 0x80, 0, 0x25, END_NOTE, 0]);
        d.extend_from_slice(&pattern);
        d.extend_from_slice(&seq_bytes(&[0xE2, 0]));
        d.extend_from_slice(&seq_bytes(&[1, 0, 0, 0, 0, 40]));
        d.extend_from_slice(&[1, 2, 3, 4]);
        d
    }

    fn load(data: &[u8]) -> (Result<Song>, Warnings) {
        let mut w = Warnings::new();
        let song = load_fc(data, &LoadOptions::default(), &mut w);
        (song, w)
    }

    #[test]
    fn minimal_module() {
        let data = module(FC13_MAGIC);
        assert_eq!(probe(&data), Some(Variant::Fc13));
        let (song, w) = load(&data);
        let song = song.unwrap();
        assert!(w.is_empty(), "{w:?}");
        assert_eq!(song.systems[0].chip, Chip::Amiga);
        assert_eq!(song.tuning, 436.0);
        assert_eq!(song.wavetables.len(), 48);
        assert_eq!(song.samples.len(), 10);
        assert_eq!(song.samples[0].data, SampleData::Pcm8(vec![1, 2, 3, 4]));
        assert!(song.samples[1].is_empty());

        let ins = &song.instruments[0];
        assert_eq!(ins.name.as_str(), "Instrument 0");
        assert_eq!(ins.body, InstrumentBody::Sample(SampleMap { initial_sample: Some(0), note_map: None }));
        assert_eq!(ins.macros.get(MacroKind::Volume).map(|m| m.values.clone()), Some(vec![40]));

        let sub = song.main();
        assert_eq!(sub.orders_len, 2);
        assert_eq!(sub.speeds, [3]);
        let row = |ch, pos, r| sub.row_at(ch, pos, r).unwrap();
        assert_eq!(row(0, 0, 0).note, Note::On(109));
        assert_eq!(row(0, 0, 0).instrument, Some(1));
        assert_eq!(fx_of(row(0, 0, 1)), [(fx::PORTA_DOWN, 5)]);
        assert_eq!(fx_of(row(0, 0, 2)), [(fx::BREAK, 0)]);
        assert_eq!(fx_of(row(3, 0, 0)), [(fx::SPEED, 3)]);

        // the transposed second entry restarts the slide state
        assert_eq!(row(0, 1, 0).note, Note::On(121));
        assert_eq!(fx_of(row(0, 1, 0)), [(fx::PORTA_DOWN, 0)]);
        assert!(fx_of(row(3, 1, 0)).iter().all(|&(cmd, _)| cmd != fx::SPEED));
    }

    #[test]
    fn damaged_magic_loads_by_layout() {
        let data = module(b"XXXX");
        assert_eq!(probe(&data), Some(Variant::Fc13));
        let (song, w) = load(&data);
        assert!(song.is_ok());
        assert!(w.contains("damaged magic"));

        let mut broken = data.clone();
        broken[7] = 25;
        assert_eq!(probe(&broken), None);
        assert!(matches!(load(&broken).0, Err(FormatError::InvalidHeader(_))));
    }
}
