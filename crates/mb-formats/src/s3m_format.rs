//! Scream Tracker 3 modules.
//!
//! Channels are either PCM (settings 0-15) or AdLib (16-31). PCM channels
//! go to an ES5506, AdLib channels to an OPL2 placed after it. Order lists
//! split into subsongs at every `255` marker; all subsongs share the
//! pattern pool.

use binrw::BinRead;
use mb_ir::{
    fx, Chip, FmKind, Instrument, InstrumentBody, LoopMode, Note, Row, Sample, SampleMap, Song,
    Subsong,
};

use crate::effects::st3::St3Engine;
use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::pcm::PcmLayout;
use crate::rad_format::opl_operator;
use crate::reader::{latin1, parse_record, ByteSource, Record};
use crate::LoadOptions;

pub const S3M_MAGIC: &[u8] = b"SCRM";
pub const MAGIC_OFFSET: usize = 0x2C;

const ROWS: usize = 64;
const SOURCE_CHANNELS: usize = 32;
const OPL_CHANNELS: usize = 9;

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    name: [u8; 28],
    _eof: u8,
    kind: u8,
    _reserved: u16,
    order_count: u16,
    instrument_count: u16,
    pattern_count: u16,
    flags: u16,
    tracker: u16,
    sample_format: u16,
    magic: [u8; 4],
    global_volume: u8,
    speed: u8,
    tempo: u8,
    master_volume: u8,
    _ultraclick: u8,
    default_pan: u8,
    _reserved2: [u8; 10],
    channel_settings: [u8; 32],
}

impl Record for Header {
    const SIZE: usize = 96;
}

impl Header {
    /// ST3.00 and the "ST3.00 volume slides" flag slide on the first tick.
    fn slides_on_first_tick(&self) -> bool {
        self.flags & 64 != 0 || self.tracker == 0x1300
    }

    fn signed_samples(&self) -> bool {
        self.sample_format == 1
    }

    fn stereo(&self) -> bool {
        self.master_volume & 0x80 != 0
    }
}

const INSTRUMENT_SIZE: usize = 80;

#[derive(BinRead, Debug)]
#[br(little)]
struct PcmHeader {
    kind: u8,
    dos_name: [u8; 12],
    mem_seg_hi: u8,
    mem_seg: u16,
    length: u32,
    loop_start: u32,
    loop_end: u32,
    volume: u8,
    _reserved: u8,
    packing: u8,
    flags: u8,
    c2_speed: u32,
    _internal: [u8; 12],
    name: [u8; 28],
    _magic: [u8; 4],
}

impl Record for PcmHeader {
    const SIZE: usize = INSTRUMENT_SIZE;
}

impl PcmHeader {
    fn data_offset(&self) -> usize {
        ((usize::from(self.mem_seg_hi) << 16) | usize::from(self.mem_seg)) * 16
    }

    fn looped(&self) -> bool {
        self.flags & 1 != 0
    }

    fn layout(&self, signed: bool) -> PcmLayout {
        PcmLayout {
            frames: self.length as usize,
            wide: self.flags & 4 != 0,
            stereo: self.flags & 2 != 0,
            signed,
            ..PcmLayout::default()
        }
    }
}

/// AdLib melodic instrument: modulator then carrier register pairs.
#[derive(BinRead, Debug)]
#[br(little)]
struct AdlibHeader {
    kind: u8,
    _dos_name: [u8; 12],
    _reserved: [u8; 3],
    characteristics: [u8; 2],
    scaling_output: [u8; 2],
    attack_decay: [u8; 2],
    sustain_release: [u8; 2],
    waveforms: [u8; 2],
    connection: u8,
    _unused: u8,
    volume: u8,
    _disk: u8,
    _reserved2: u16,
    _c2_speed: u32,
    _internal: [u8; 12],
    name: [u8; 28],
    _magic: [u8; 4],
}

impl Record for AdlibHeader {
    const SIZE: usize = INSTRUMENT_SIZE;
}

impl AdlibHeader {
    fn instrument(&self) -> Instrument {
        let mut ins = Instrument::fm(&latin1(&self.name), FmKind::Opl);
        if let Some(patch) = ins.fm_patch_mut() {
            patch.ops = 2;
            patch.alg = self.connection & 1;
            patch.fb = (self.connection >> 1) & 7;
            for op in 0..2 {
                patch.op[op] = opl_operator(
                    self.characteristics[op],
                    self.scaling_output[op],
                    self.attack_decay[op],
                    self.sustain_release[op],
                    self.waveforms[op] & 7,
                );
            }
        }
        ins
    }
}

// ---------------------------------------------------------------------------
// Channels and orders
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Voice {
    Pcm,
    Adlib,
}

fn voice(setting: u8) -> Option<Voice> {
    match setting & 127 {
        _ if setting == 255 => None,
        0..=15 => Some(Voice::Pcm),
        16..=31 => Some(Voice::Adlib),
        _ => None,
    }
}

/// Where each of the 32 stored channels lands in the song.
#[derive(Debug)]
struct ChannelMap {
    dest: [Option<usize>; SOURCE_CHANNELS],
    voice: [Option<Voice>; SOURCE_CHANNELS],
    pcm: usize,
    has_pcm: bool,
    has_adlib: bool,
}

impl ChannelMap {
    fn new(settings: &[u8; SOURCE_CHANNELS], out: &mut Emitter<'_>) -> Self {
        let voices = settings.map(voice);
        let has_pcm = voices.contains(&Some(Voice::Pcm));
        let has_adlib = voices.contains(&Some(Voice::Adlib));
        let adlib_base = if has_pcm { Chip::Es5506.channels() } else { 0 };
        let mut next_pcm = 0;
        let mut next_adlib = adlib_base;
        let mut dest = [None; SOURCE_CHANNELS];
        for (i, v) in voices.iter().enumerate() {
            dest[i] = match v {
                Some(Voice::Pcm) => {
                    next_pcm += 1;
                    Some(next_pcm - 1)
                }
                Some(Voice::Adlib) if next_adlib < adlib_base + OPL_CHANNELS => {
                    next_adlib += 1;
                    Some(next_adlib - 1)
                }
                Some(Voice::Adlib) => {
                    out.warn(format!("AdLib channel {} beyond the ninth dropped", i + 1));
                    None
                }
                None => None,
            };
        }
        Self { dest, voice: voices, pcm: next_pcm, has_pcm, has_adlib }
    }

    fn chips(&self) -> Vec<Chip> {
        let mut chips = Vec::new();
        if self.has_pcm {
            chips.push(Chip::Es5506);
        }
        if self.has_adlib {
            chips.push(Chip::Opl2);
        }
        chips
    }

    fn max_volume(&self, channel: usize) -> u8 {
        match self.voice[channel] {
            Some(Voice::Adlib) => 63,
            _ => 64,
        }
    }
}

/// Order lists per subsong plus, for every stored order entry, the
/// position it occupies in its own subsong (the target of `Bxx`).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct OrderPlan {
    pub(crate) subsongs: Vec<(String, Vec<u8>)>,
    pub(crate) positions: Vec<u8>,
}

pub(crate) fn split_orders(raw: &[u8]) -> OrderPlan {
    let mut subsongs = vec![(String::new(), Vec::new())];
    let mut positions = Vec::with_capacity(raw.len());
    let mut current = 0;
    let mut pos = 0u8;
    let mut split = false;
    for (i, &order) in raw.iter().enumerate() {
        positions.push(pos);
        match order {
            // "+++" marker
            254 => continue,
            255 => {
                if !split {
                    current += 1;
                    split = true;
                }
                pos = 0;
                continue;
            }
            _ => split = false,
        }
        if subsongs.len() <= current {
            subsongs.push((format!("Order {i:02X}"), Vec::new()));
        }
        subsongs[current].1.push(order);
        pos = pos.wrapping_add(1);
    }
    OrderPlan { subsongs, positions }
}

// ---------------------------------------------------------------------------
// Packed pattern data
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
struct Cell {
    channel: usize,
    note_ins: Option<(u8, u8)>,
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

#[derive(Clone, Copy, Debug)]
enum Event {
    EndOfRow,
    Cell(Cell),
}

/// Walks packed pattern bytes. A truncated entry ends the pattern.
struct Packed<'a> {
    src: ByteSource<'a>,
}

impl<'a> Packed<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { src: ByteSource::new(bytes) }
    }
}

impl Iterator for Packed<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let what = self.src.read_u8().ok()?;
        if what == 0 {
            return Some(Event::EndOfRow);
        }
        let mut cell = Cell { channel: usize::from(what & 31), ..Cell::default() };
        if what & 0x20 != 0 {
            cell.note_ins = Some((self.src.read_u8().ok()?, self.src.read_u8().ok()?));
        }
        if what & 0x40 != 0 {
            cell.volume = Some(self.src.read_u8().ok()?);
        }
        if what & 0x80 != 0 {
            cell.effect = Some((self.src.read_u8().ok()?, self.src.read_u8().ok()?));
        }
        Some(Event::Cell(cell))
    }
}

/// Packed bytes of the pattern at `ptr`, clamped to the end of the file.
fn pattern_bytes<'a>(src: &mut ByteSource<'a>, ptr: usize) -> Result<&'a [u8]> {
    src.seek(ptr)?;
    let len = usize::from(src.read_u16_le()?);
    src.read(len.min(src.remaining()))
}

fn s3m_note(note: u8) -> Note {
    match note {
        254 => Note::Off,
        255 => Note::None,
        n if n & 15 < 12 => Note::from_octave_semitone((n >> 4) as i8, n & 15),
        _ => Note::None,
    }
}

// ---------------------------------------------------------------------------
// Instruments and samples
// ---------------------------------------------------------------------------

/// Instruments, their samples and default volumes, in file order.
struct Bank {
    instruments: Vec<Instrument>,
    samples: Vec<Sample>,
    volumes: Vec<u8>,
}

fn sample_instrument(name: &str, sample: Option<u16>) -> Instrument {
    Instrument::new(name, InstrumentBody::Sample(SampleMap { initial_sample: sample, note_map: None }))
}

fn read_instruments(
    src: &mut ByteSource<'_>,
    ptrs: &[usize],
    signed: bool,
    out: &mut Emitter<'_>,
) -> Result<Bank> {
    let mut bank = Bank { instruments: Vec::new(), samples: Vec::new(), volumes: Vec::new() };
    for (i, &ptr) in ptrs.iter().enumerate() {
        if ptr == 0 {
            bank.instruments.push(sample_instrument("", Some(bank.samples.len() as u16)));
            bank.samples.push(Sample::new(""));
            bank.volumes.push(0);
            continue;
        }
        src.seek(ptr)?;
        let raw = src.read(INSTRUMENT_SIZE)?;
        match &raw[0x4C..0x50] {
            b"SCRS" => {
                let header: PcmHeader = parse_record(raw)?;
                if header.kind > 1 {
                    return Err(FormatError::out_of_range(format!("instrument {} type", i + 1), header.kind));
                }
                let mut sample = Sample::new(&latin1(&header.dos_name));
                sample.center_rate = header.c2_speed;
                if header.packing != 0 {
                    out.warn(format!("instrument {}: ADPCM sample not supported", i + 1));
                } else {
                    src.seek(header.data_offset().min(src.len()))?;
                    let layout = header.layout(signed);
                    let want = layout.stored_len();
                    let data = src.read(want.min(src.remaining()))?;
                    if data.len() < want {
                        out.warn(format!("instrument {}: sample data truncated", i + 1));
                    }
                    sample.data = layout.decode(data);
                    if header.looped() {
                        sample.set_loop(header.loop_start, header.loop_end, LoopMode::Forward);
                    }
                }
                bank.instruments
                    .push(sample_instrument(&latin1(&header.name), Some(bank.samples.len() as u16)));
                bank.samples.push(sample);
                bank.volumes.push(header.volume);
            }
            b"SCRI" => {
                let header: AdlibHeader = parse_record(raw)?;
                if header.kind < 2 {
                    return Err(FormatError::out_of_range(format!("instrument {} type", i + 1), header.kind));
                }
                bank.instruments.push(header.instrument());
                bank.volumes.push(header.volume);
            }
            _ => {
                tracing::debug!("instrument {} has no known signature", i + 1);
                bank.instruments.push(sample_instrument(&latin1(&raw[48..76]), None));
                bank.volumes.push(0);
            }
        }
    }
    Ok(bank)
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

pub fn load_s3m(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    let header: Header = src.read_record()?;
    if header.magic != S3M_MAGIC {
        return Err(FormatError::invalid("not an S3M module"));
    }
    if header.kind != 16 {
        tracing::debug!("S3M file type {}", header.kind);
    }
    if header.order_count > 256 {
        return Err(FormatError::out_of_range("order count", header.order_count));
    }
    if header.instrument_count > 256 {
        return Err(FormatError::out_of_range("instrument count", header.instrument_count));
    }
    let pattern_count = usize::from(header.pattern_count);
    if pattern_count > 256 || pattern_count > opts.max_patterns {
        return Err(FormatError::out_of_range("pattern count", header.pattern_count));
    }
    tracing::info!(
        "S3M tracker {:#06x}: {} orders, {} instruments, {} patterns",
        header.tracker,
        header.order_count,
        header.instrument_count,
        header.pattern_count
    );

    let raw_orders = src.read(usize::from(header.order_count))?;
    for (pos, &index) in raw_orders.iter().enumerate() {
        // 254 and 255 are markers
        if index < 254 {
            opts.check_order(pos, None, index)?;
        }
    }
    let plan = split_orders(raw_orders);
    let mut read_ptrs = |n: u16| -> Result<Vec<usize>> {
        (0..n).map(|_| Ok(usize::from(src.read_u16_le()?) * 16)).collect()
    };
    let ins_ptrs = read_ptrs(header.instrument_count)?;
    let pat_ptrs = read_ptrs(header.pattern_count)?;
    let channel_pan: [u8; 16] = if header.default_pan == 252 { src.read_array()? } else { [16; 16] };

    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    let map = ChannelMap::new(&header.channel_settings, &mut out);
    let chips = map.chips();
    if chips.is_empty() {
        return Err(FormatError::invalid("no enabled channels"));
    }
    let bank = read_instruments(&mut src, &ins_ptrs, header.signed_samples(), &mut out)?;

    let total: usize = chips.iter().map(|c| c.channels()).sum();
    let mut song = Song::with_channels(&latin1(&header.name), total, ROWS);
    for chip in chips {
        song.add_system(chip);
        if chip == Chip::Es5506 {
            if let Some(sys) = song.systems.last_mut() {
                sys.volume = f32::from(header.global_volume) / 64.0;
            }
        }
    }
    song.compat.linear_pitch = false;
    song.compat.pitch_macro_is_linear = false;
    song.compat.no_slides_on_first_tick = !header.slides_on_first_tick();
    song.compat.row_resets_arp_pos = true;
    song.compat.ignore_jump_at_end = false;
    song.compat.pitch_slide_speed = 12;

    {
        let sub = song.main_mut();
        sub.speeds = vec![header.speed.max(1)];
        let tempo = if header.tempo == 0 { 125 } else { header.tempo };
        sub.hz = f32::from(tempo) / 2.5;
        if map.has_pcm {
            for ch in sub.channels.iter_mut().take(SOURCE_CHANNELS).skip(map.pcm) {
                ch.visible = false;
            }
        }
    }

    let mut engine = St3Engine::new(SOURCE_CHANNELS);
    for &ptr in pat_ptrs.iter().filter(|&&p| p != 0) {
        for event in Packed::new(pattern_bytes(&mut src, ptr)?) {
            if let Event::Cell(cell) = event {
                if let Some((letter, _)) = cell.letter() {
                    engine.prescan(cell.channel, letter);
                }
            }
        }
    }

    for (index, &ptr) in pat_ptrs.iter().enumerate() {
        if ptr == 0 {
            continue;
        }
        let bytes = pattern_bytes(&mut src, ptr)?;
        let target = PatternTarget { index: index as u8, map: &map, sub: song.main_mut() };
        convert_pattern(bytes, target, &mut engine, &bank.volumes, &plan.positions, &mut out);
    }

    let template = song.main().clone();
    song.subsongs = plan
        .subsongs
        .into_iter()
        .map(|(name, orders)| {
            let mut sub = template.clone();
            sub.name = name;
            sub.set_orders_len(orders.len().max(1));
            for (pos, &pattern) in orders.iter().enumerate() {
                sub.set_order_all(pos, pattern);
            }
            sub
        })
        .collect();

    for sub in &mut song.subsongs {
        if header.stereo() {
            default_panning(sub, &map, &channel_pan, &mut out);
        }
        sub.fit_effect_columns();
    }

    song.instruments = bank.instruments;
    song.samples = bank.samples;
    Ok(song)
}

/// Pattern being converted, shared by every row.
struct PatternTarget<'s> {
    index: u8,
    map: &'s ChannelMap,
    sub: &'s mut Subsong,
}

impl PatternTarget<'_> {
    /// Commit sustained effects and store the finished row.
    fn finish_row(
        &mut self,
        work: &mut [Row; SOURCE_CHANNELS],
        row: usize,
        engine: &mut St3Engine,
        out: &mut Emitter<'_>,
    ) {
        for (ch, cell) in work.iter_mut().enumerate() {
            engine.commit(ch, cell, out);
            if let Some(dest) = self.map.dest[ch].filter(|_| !cell.is_empty()) {
                let pattern = self.sub.channels[dest].pattern_mut(self.index, ROWS);
                if let Some(slot) = pattern.row_mut(row) {
                    *slot = *cell;
                }
            }
            *cell = Row::default();
        }
        engine.end_row();
    }
}

fn convert_pattern(
    bytes: &[u8],
    mut target: PatternTarget<'_>,
    engine: &mut St3Engine,
    volumes: &[u8],
    positions: &[u8],
    out: &mut Emitter<'_>,
) {
    engine.start_pattern();
    let mut work = [Row::default(); SOURCE_CHANNELS];
    let mut touched = [false; SOURCE_CHANNELS];
    let mut row = 0;
    let mut pending = false;

    for event in Packed::new(bytes) {
        let cell = match event {
            Event::EndOfRow => {
                target.finish_row(&mut work, row, engine, out);
                touched = [false; SOURCE_CHANNELS];
                pending = false;
                row += 1;
                if row >= ROWS {
                    break;
                }
                continue;
            }
            Event::Cell(cell) => cell,
        };
        let ch = cell.channel;
        if touched[ch] {
            tracing::debug!("pattern {} row {} channel {} written twice", target.index, row, ch);
        }
        touched[ch] = true;
        pending = true;

        let dest = &mut work[ch];
        if let Some((note, ins)) = cell.note_ins {
            dest.note = s3m_note(note);
            dest.instrument = u16::from(ins).checked_sub(1);
        }
        let max = target.map.max_volume(ch);
        dest.volume = match cell.volume {
            Some(255) => None,
            Some(v) => Some(v.min(max)),
            None => dest
                .instrument
                .and_then(|i| volumes.get(usize::from(i)))
                .map(|&v| v.min(max))
                .or(dest.volume),
        };
        if let Some((letter, value)) = cell.letter() {
            engine.effect(ch, letter, value, cell.note_ins.is_some(), positions, dest, out);
        }
    }
    if pending && row < ROWS {
        target.finish_row(&mut work, row, engine, out);
    }
}

/// Stereo songs get their channel panning on the first row they play.
fn default_panning(sub: &mut Subsong, map: &ChannelMap, pans: &[u8; 16], out: &mut Emitter<'_>) {
    for (ch, &pan) in pans.iter().enumerate() {
        let Some(dest) = map.dest[ch] else { continue };
        let Some(row) = sub.row_at_mut(dest, 0, 0) else { continue };
        if row.has_effect(fx::PANNING) {
            continue;
        }
        let value = if pan & 16 != 0 {
            if ch & 1 != 0 {
                0xCC
            } else {
                0x33
            }
        } else {
            (pan & 15) * 0x11
        };
        out.emit(row, fx::PANNING, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_ir::SampleData;

    fn fx_of(row: &Row) -> Vec<(u8, u8)> {
        row.effects().map(|e| (e.cmd, e.param())).collect()
    }

    #[test]
    fn record_sizes_match_declared() {
        assert!(parse_record::<Header>(&[0; Header::SIZE]).is_ok());
        assert!(parse_record::<PcmHeader>(&[0; PcmHeader::SIZE]).is_ok());
        assert!(parse_record::<AdlibHeader>(&[0; AdlibHeader::SIZE]).is_ok());
    }

    #[test]
    fn orders_split_into_subsongs() {
        let plan = split_orders(&[0, 1, 254, 255, 255, 2, 3, 255]);
        assert_eq!(
            plan.subsongs,
            vec![(String::new(), vec![0, 1]), ("Order 05".to_string(), vec![2, 3])]
        );
        assert_eq!(plan.positions, [0, 1, 2, 2, 0, 0, 1, 2]);
    }

    #[test]
    fn channels_map_by_voice() {
        let mut settings = [255u8; 32];
        settings[0] = 0;
        settings[1] = 8;
        settings[2] = 16;
        settings[4] = 40;
        let mut w = Warnings::new();
        let map = ChannelMap::new(&settings, &mut Emitter::new(8, &mut w));
        assert_eq!(map.dest[..5], [Some(0), Some(1), Some(32), None, None]);
        assert_eq!(map.chips(), [Chip::Es5506, Chip::Opl2]);
        assert_eq!(map.max_volume(2), 63);
    }

    #[test]
    fn notes() {
        assert_eq!(s3m_note(0x40), Note::On(108));
        assert_eq!(s3m_note(0x3B), Note::On(107));
        assert_eq!(s3m_note(254), Note::Off);
        assert_eq!(s3m_note(255), Note::None);
        assert_eq!(s3m_note(0x4D), Note::None);
    }

    /// Two PCM channels, one unsigned 4-byte sample, one pattern.
    fn module(master_volume: u8, packing: u8) -> Vec<u8> {
        let mut d = vec![0u8; 96];
        d[..4].copy_from_slice(b"tune");
        d[0x1C] = 0x1A;
        d[0x1D] = 16;
        d[0x20..0x22].copy_from_slice(&1u16.to_le_bytes());
        d[0x22..0x24].copy_from_slice(&1u16.to_le_bytes());
        d[0x24..0x26].copy_from_slice(&1u16.to_le_bytes());
        d[0x28..0x2A].copy_from_slice(&0x1320u16.to_le_bytes());
        d[0x2A..0x2C].copy_from_slice(&2u16.to_le_bytes());
        d[0x2C..0x30].copy_from_slice(b"SCRM");
        d[0x30] = 64;
        d[0x31] = 6;
        d[0x32] = 125;
        d[0x33] = master_volume;
        for (i, s) in d[0x40..0x60].iter_mut().enumerate() {
            *s = match i {
                0 => 0,
                1 => 8,
                _ => 255,
            };
        }
        d.push(0); // order
        d.extend(7u16.to_le_bytes()); // instrument at 0x70
        d.extend(13u16.to_le_bytes()); // pattern at 0xD0
        d.resize(0x70, 0);

        let mut ins = [0u8; 80];
        ins[0] = 1;
        ins[1..5].copy_from_slice(b"SMP1");
        ins[0x0E..0x10].copy_from_slice(&12u16.to_le_bytes()); // data at 0xC0
        ins[0x10..0x14].copy_from_slice(&4u32.to_le_bytes());
        ins[0x1C] = 48;
        ins[0x1E] = packing;
        ins[0x20..0x24].copy_from_slice(&8363u32.to_le_bytes());
        ins[0x30..0x34].copy_from_slice(b"Lead");
        ins[0x4C..0x50].copy_from_slice(b"SCRS");
        d.extend(ins);
        d.extend([0x80, 0x90, 0x70, 0xFF]);
        d.resize(0xD0, 0);

        let packed = [0xA0, 0x40, 0x01, 0x08, 0x46, 0, 0, 0x81, 0x01, 0x03, 0];
        d.extend((packed.len() as u16 + 2).to_le_bytes());
        d.extend(packed);
        d
    }

    fn load(data: &[u8]) -> (Result<Song>, Warnings) {
        let mut w = Warnings::new();
        let song = load_s3m(data, &LoadOptions::default(), &mut w);
        (song, w)
    }

    #[test]
    fn order_past_pattern_bound() {
        let mut data = module(0x30, 0);
        data[0x60] = 20;
        let opts = LoadOptions { max_patterns: 16, ..LoadOptions::default() };
        let err = load_s3m(&data, &opts, &mut Warnings::new()).unwrap_err();
        assert_eq!(err, FormatError::out_of_range("pattern index at order 0", 20));
        // markers are not pattern indices
        data[0x60] = 254;
        assert!(load_s3m(&data, &opts, &mut Warnings::new()).is_ok());
    }

    #[test]
    fn minimal_module() {
        let (song, w) = load(&module(0x30, 0));
        let song = song.unwrap();
        assert!(w.is_empty(), "{w:?}");
        assert_eq!(song.name, "tune");
        assert_eq!(song.systems.len(), 1);
        assert_eq!(song.systems[0].chip, Chip::Es5506);
        assert_eq!(song.systems[0].volume, 1.0);
        assert_eq!(song.compat.pitch_slide_speed, 12);
        assert!(song.compat.no_slides_on_first_tick);
        assert_eq!(song.instruments.len(), 1);
        assert_eq!(song.instruments[0].name.as_str(), "Lead");
        assert_eq!(song.samples[0].name.as_str(), "SMP1");
        assert_eq!(song.samples[0].data, SampleData::Pcm8(vec![0, 16, -16, 127]));

        let sub = song.main();
        assert_eq!(sub.hz, 50.0);
        assert_eq!(sub.speeds, [6]);
        assert!(sub.channels[1].visible);
        assert!(!sub.channels[2].visible);

        let row = |ch, r| sub.row_at(ch, 0, r).unwrap();
        assert_eq!(row(0, 0).note, Note::On(108));
        assert_eq!(row(0, 0).instrument, Some(0));
        assert_eq!(row(0, 0).volume, Some(48));
        assert_eq!(fx_of(row(0, 0)), [(0x04, 0x46)]);
        assert_eq!(fx_of(row(0, 1)), [(0x04, 0)]);
        assert_eq!(fx_of(row(1, 2)), [(0x0F, 3)]);
    }

    #[test]
    fn stereo_songs_get_default_panning() {
        let song = load(&module(0xB0, 0)).0.unwrap();
        let sub = song.main();
        assert_eq!(fx_of(sub.row_at(0, 0, 0).unwrap()), [(0x04, 0x46), (0x80, 0x33)]);
        assert_eq!(fx_of(sub.row_at(1, 0, 0).unwrap()), [(0x80, 0xCC)]);
    }

    #[test]
    fn packed_samples_are_skipped_with_warning() {
        let (song, w) = load(&module(0x30, 1));
        assert!(song.unwrap().samples[0].is_empty());
        assert!(w.contains("ADPCM sample not supported"));
    }

    #[test]
    fn bad_magic_and_truncation() {
        let mut data = module(0x30, 0);
        data[0x2C] = b'X';
        assert!(matches!(load(&data).0, Err(FormatError::InvalidHeader(_))));
        let data = module(0x30, 0);
        assert!(matches!(load(&data[..90]).0, Err(FormatError::Truncated { .. })));
    }
}
