//! AdLib Tracker II modules: `.a2m` and the compact `.a2t`, versions 1-14.
//!
//! Both variants are a header, a table of block lengths and a run of
//! compressed blocks. The codec is fixed per version. A2M packs all song
//! data (names, instruments, macro tables, orders) into one block; A2T
//! splits it into several and keeps timing in the header.

use std::collections::BTreeMap;

use binrw::BinRead;
use mb_ir::{
    fx, Chip, Effect, FmKind, FmOperator, FmPatch, Instrument, InstrumentBody, Macro, MacroKind,
    MacroMode, Note, OpMacro, Song, Subsong, ARP_FIXED,
};

use crate::effects::continuation::{self, Marks};
use crate::effects::{at2, Emitter};
use crate::error::{FormatError, Result, Warnings};
use crate::reader::{latin1, parse_record, pascal, ByteSource, Record};
use crate::versions::{at2_layout, At2Layout, At2VarHeader, AT2_CHANNEL_MAP};
use crate::LoadOptions;

pub const A2T_MAGIC: &[u8] = b"_a2tiny_module_";
pub const A2M_MAGIC: &[u8] = b"_a2module_";

const ORDER_SLOTS: usize = 128;
const MAX_TRACKS: usize = 20;
const MACRO_COLUMNS: usize = 28;
const MESSAGE_LINES: usize = 20;
const MESSAGE_WIDTH: usize = 51;

// ---------------------------------------------------------------------------
// On-disk records
// ---------------------------------------------------------------------------

#[derive(BinRead, Debug)]
#[br(little)]
struct A2tHeader {
    _id: [u8; 15],
    _crc: u32,
    version: u8,
    patterns: u8,
    tempo: u8,
    speed: u8,
}

impl Record for A2tHeader {
    const SIZE: usize = 23;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct A2mHeader {
    _id: [u8; 10],
    _crc: u32,
    version: u8,
    patterns: u8,
}

impl Record for A2mHeader {
    const SIZE: usize = 16;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct VarHeaderV1234 {
    len: [u16; 6],
}

impl Record for VarHeaderV1234 {
    const SIZE: usize = 12;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct VarHeaderV5678 {
    common_flag: u8,
    len: [u16; 10],
}

impl Record for VarHeaderV5678 {
    const SIZE: usize = 21;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct VarHeaderV9 {
    common_flag: u8,
    patt_len: u16,
    nm_tracks: u8,
    macro_speedup: u16,
    len: [u32; 20],
}

impl Record for VarHeaderV9 {
    const SIZE: usize = 86;
}

/// Shared by v10 (20 block lengths) and v11-14 (21).
#[derive(BinRead, Debug)]
#[br(little, import(blocks: usize))]
struct VarHeaderV10 {
    common_flag: u8,
    patt_len: u16,
    nm_tracks: u8,
    macro_speedup: u16,
    flag_4op: u8,
    lock_flags: [u8; 20],
    #[br(count = blocks)]
    len: Vec<u32>,
}

/// Raw OPL register image of one instrument (modulator, carrier, connection).
#[derive(BinRead, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[br(little)]
struct FmRegs {
    raw: [u8; 11],
}

impl Record for FmRegs {
    const SIZE: usize = 11;
}

impl FmRegs {
    /// Operator 0 is the modulator, 1 the carrier.
    fn operator(&self, op: usize) -> FmOperator {
        let r = &self.raw;
        FmOperator {
            mult: r[op] & 15,
            ksr: (r[op] >> 4) & 1,
            sus: (r[op] >> 5) & 1,
            vib: (r[op] >> 6) & 1,
            am: r[op] >> 7,
            tl: r[2 + op] & 63,
            ksl: r[2 + op] >> 6,
            dr: r[4 + op] & 15,
            ar: r[4 + op] >> 4,
            rr: r[6 + op] & 15,
            sl: r[6 + op] >> 4,
            ws: r[8 + op] & 7,
            ..FmOperator::default()
        }
    }

    fn connect(&self) -> u8 {
        self.raw[10] & 1
    }

    fn feedback(&self) -> u8 {
        (self.raw[10] >> 1) & 7
    }

    /// Values of the 28 register-macro columns for this step.
    fn columns(&self, freq_slide: i16, panning: u8) -> [i32; MACRO_COLUMNS] {
        let mut out = [0i32; MACRO_COLUMNS];
        for op in 0..2 {
            let o = self.operator(op);
            let base = op * 12;
            let vals = [o.ar, o.dr, o.sl, o.rr, o.ws, 63 - o.tl, o.ksl, o.mult, o.am, o.vib, o.ksr, o.sus];
            for (i, v) in vals.into_iter().enumerate() {
                out[base + i] = i32::from(v);
            }
        }
        out[24] = i32::from(self.connect());
        out[25] = i32::from(self.feedback());
        out[26] = i32::from(freq_slide) * 4;
        out[27] = match panning {
            0 => 3,
            1 => 2,
            2 => 1,
            _ => 0,
        };
        out
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct InstrumentV1 {
    fm: FmRegs,
    panning: u8,
    _fine_tune: i8,
}

impl Record for InstrumentV1 {
    const SIZE: usize = 13;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct InstrumentV9 {
    fm: FmRegs,
    panning: u8,
    _fine_tune: i8,
    perc_voice: u8,
}

impl Record for InstrumentV9 {
    const SIZE: usize = 14;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct RegisterStep {
    fm: FmRegs,
    freq_slide: i16,
    panning: u8,
    duration: u8,
}

impl Record for RegisterStep {
    const SIZE: usize = 15;
}

/// Per-instrument FM register macro.
#[derive(BinRead, Debug)]
#[br(little)]
struct FmregTable {
    length: u8,
    loop_begin: u8,
    _loop_length: u8,
    keyoff_pos: u8,
    arpeggio_table: u8,
    _vibrato_table: u8,
    #[br(count = 255)]
    steps: Vec<RegisterStep>,
}

impl Record for FmregTable {
    const SIZE: usize = 3831;
}

#[derive(BinRead, Debug)]
#[br(little)]
struct ArpVibTable {
    arp_length: u8,
    arp_speed: u8,
    arp_loop_begin: u8,
    _arp_loop_length: u8,
    arp_keyoff_pos: u8,
    arp_data: [u8; 255],
    _vibrato: [u8; 261],
}

impl Record for ArpVibTable {
    const SIZE: usize = 521;
}

// ---------------------------------------------------------------------------
// Decoded song data
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
struct InstrumentData {
    fm: FmRegs,
    panning: u8,
    perc_voice: u8,
}

/// Everything read before the patterns, from either variant.
struct SongInfo {
    name: String,
    author: String,
    tempo: u8,
    speed: u8,
    common_flag: u8,
    patt_len: usize,
    tracks: usize,
    macro_speedup: u16,
    flag_4op: u8,
    lock_flags: [u8; MAX_TRACKS],
    orders: [u8; ORDER_SLOTS],
    /// Trailing empty slots already trimmed.
    instruments: Vec<InstrumentData>,
    instrument_names: Vec<String>,
    fmreg: Vec<FmregTable>,
    arpvib: Vec<ArpVibTable>,
    disabled: Vec<[bool; MACRO_COLUMNS]>,
    pattern_names: Vec<String>,
    four_op_pairs: Vec<u8>,
    message: Vec<u8>,
}

impl SongInfo {
    fn new(tempo: u8, speed: u8) -> Self {
        Self {
            name: String::new(),
            author: String::new(),
            tempo,
            speed,
            common_flag: 0,
            patt_len: 64,
            tracks: 18,
            macro_speedup: 0,
            flag_4op: 0,
            lock_flags: [0; MAX_TRACKS],
            orders: [0xFF; ORDER_SLOTS],
            instruments: Vec::new(),
            instrument_names: Vec::new(),
            fmreg: Vec::new(),
            arpvib: Vec::new(),
            disabled: Vec::new(),
            pattern_names: Vec::new(),
            four_op_pairs: Vec::new(),
            message: Vec::new(),
        }
    }

    fn chip(&self) -> Chip {
        if self.common_flag & 0x40 != 0 || self.tracks > 18 {
            Chip::Opl3Drums
        } else {
            Chip::Opl3
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Load an A2T file.
pub fn load_a2t(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    let header: A2tHeader = src.read_record()?;
    let layout = layout_for(header.version)?;
    tracing::info!("A2T version {}, {} patterns", header.version, header.patterns);

    let mut info = SongInfo::new(header.tempo, header.speed);
    let lens = read_a2t_var_header(&mut src, &layout, &mut info)?;
    let block = |i: usize| lens.get(i).copied().unwrap_or(0);

    let mut instruments = unpack(&mut src, &layout, block(0), instrument_block_size(&layout))?;
    let mut cursor = 0;
    if layout.has_bpm() {
        cursor += 3;
    }
    if layout.has_4op_instruments() {
        info.four_op_pairs = four_op_pairs(&instruments[cursor..cursor + 129]);
        cursor += 129;
        info.message = instruments[cursor..cursor + 1024].to_vec();
        cursor += 1024;
    }
    info.instruments = read_instruments(&layout, &instruments.split_off(cursor))?;

    if layout.has_macro_tables() {
        let raw = unpack(&mut src, &layout, block(1), 255 * FmregTable::SIZE)?;
        info.fmreg = read_table(&raw, 255)?;
        let raw = unpack(&mut src, &layout, block(2), 255 * ArpVibTable::SIZE)?;
        info.arpvib = read_table(&raw, 255)?;
    }
    if layout.has_disabled_columns() {
        let raw = unpack(&mut src, &layout, block(3), 255 * MACRO_COLUMNS)?;
        info.disabled = disabled_columns(&raw);
    }

    let orders = unpack(&mut src, &layout, block(layout.orders_block), ORDER_SLOTS)?;
    info.orders.copy_from_slice(&orders);

    build(&mut src, &layout, &lens, layout.patterns_block, header.patterns, info, opts, warnings)
}

/// Load an A2M file.
pub fn load_a2m(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    let header: A2mHeader = src.read_record()?;
    let layout = layout_for(header.version)?;
    tracing::info!("A2M version {}, {} patterns", header.version, header.patterns);

    let lens = read_a2m_lengths(&mut src, &layout, header.patterns)?;
    let mut info = SongInfo::new(0, 0);
    if layout.has_macro_tables() {
        read_songdata_v9(&mut src, &layout, lens[0], &mut info)?;
    } else {
        read_songdata_v1(&mut src, &layout, lens[0], &mut info)?;
    }

    build(&mut src, &layout, &lens, 1, header.patterns, info, opts, warnings)
}

fn layout_for(version: u8) -> Result<At2Layout> {
    at2_layout(version)
        .ok_or_else(|| FormatError::invalid(format!("unsupported AT2 version {version}")))
}

// ---------------------------------------------------------------------------
// Headers and blocks
// ---------------------------------------------------------------------------

fn read_a2t_var_header(
    src: &mut ByteSource<'_>,
    layout: &At2Layout,
    info: &mut SongInfo,
) -> Result<Vec<usize>> {
    let lens = match layout.var_header {
        At2VarHeader::V1234 => {
            let h: VarHeaderV1234 = src.read_record()?;
            h.len.iter().map(|&l| usize::from(l)).collect()
        }
        At2VarHeader::V5678 => {
            let h: VarHeaderV5678 = src.read_record()?;
            info.common_flag = h.common_flag;
            h.len.iter().map(|&l| usize::from(l)).collect()
        }
        At2VarHeader::V9 => {
            let h: VarHeaderV9 = src.read_record()?;
            info.common_flag = h.common_flag;
            info.patt_len = usize::from(h.patt_len);
            info.tracks = usize::from(h.nm_tracks);
            info.macro_speedup = h.macro_speedup;
            h.len.iter().map(|&l| l as usize).collect()
        }
        At2VarHeader::V10 | At2VarHeader::V11 => {
            let blocks = if layout.var_header == At2VarHeader::V10 { 20 } else { 21 };
            let bytes = src.read(27 + blocks * 4)?;
            let h = VarHeaderV10::read_le_args(&mut std::io::Cursor::new(bytes), (blocks,))
                .map_err(|e| FormatError::invalid(format!("malformed A2T header: {e}")))?;
            info.common_flag = h.common_flag;
            info.patt_len = usize::from(h.patt_len);
            info.tracks = usize::from(h.nm_tracks);
            info.macro_speedup = h.macro_speedup;
            info.flag_4op = h.flag_4op;
            info.lock_flags = h.lock_flags;
            h.len.iter().map(|&l| l as usize).collect()
        }
    };
    tracing::debug!("A2T block lengths {:?}", lens);
    Ok(lens)
}

/// A2M block length table. Versions 1-8 only trust the entries the pattern
/// count can use; the rest may hold rubbish.
fn read_a2m_lengths(src: &mut ByteSource<'_>, layout: &At2Layout, patterns: u8) -> Result<Vec<usize>> {
    let mut lens = Vec::with_capacity(layout.a2m_lengths);
    if layout.wide_lengths {
        let table = src.read(layout.a2m_lengths * 4)?;
        for quad in table.chunks_exact(4) {
            lens.push(u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]) as usize);
        }
    } else {
        let per_group = if layout.version < 5 { 16 } else { 8 };
        let max_block = usize::from(patterns) / per_group + 1;
        let table = src.read(layout.a2m_lengths * 2)?;
        for (i, pair) in table.chunks_exact(2).enumerate() {
            let len = u16::from_le_bytes([pair[0], pair[1]]);
            lens.push(if i <= max_block { usize::from(len) } else { 0 });
        }
    }
    tracing::debug!("A2M block lengths {:?}", lens);
    Ok(lens)
}

/// Read a `len`-byte block and expand it into `size` bytes. Short output
/// leaves the tail zeroed.
fn unpack(src: &mut ByteSource<'_>, layout: &At2Layout, len: usize, size: usize) -> Result<Vec<u8>> {
    let packed = src.read(len)?;
    let mut out = vec![0u8; size];
    let n = layout.codec.decompress(packed, &mut out);
    tracing::debug!("AT2 block: {} packed, {} of {} bytes expanded", len, n, size);
    Ok(out)
}

fn instrument_block_size(layout: &At2Layout) -> usize {
    let extra = if layout.has_4op_instruments() { 3 + 129 + 1024 } else { 0 };
    layout.instruments * layout.instrument_size + extra
}

fn read_instruments(layout: &At2Layout, raw: &[u8]) -> Result<Vec<InstrumentData>> {
    let size = layout.instrument_size;
    let slots: Vec<&[u8]> = raw.chunks_exact(size).take(layout.instruments).collect();
    let count = slots.iter().rposition(|s| s.iter().any(|&b| b != 0)).map_or(0, |i| i + 1);
    slots[..count]
        .iter()
        .map(|bytes| {
            if size == InstrumentV9::SIZE {
                let r: InstrumentV9 = parse_record(bytes)?;
                Ok(InstrumentData { fm: r.fm, panning: r.panning, perc_voice: r.perc_voice })
            } else {
                let r: InstrumentV1 = parse_record(bytes)?;
                Ok(InstrumentData { fm: r.fm, panning: r.panning, perc_voice: 0 })
            }
        })
        .collect()
}

fn read_table<T>(raw: &[u8], count: usize) -> Result<Vec<T>>
where
    T: Record + for<'b> BinRead<Args<'b> = ()>,
{
    raw.chunks_exact(T::SIZE).take(count).map(parse_record).collect()
}

fn disabled_columns(raw: &[u8]) -> Vec<[bool; MACRO_COLUMNS]> {
    raw.chunks_exact(MACRO_COLUMNS)
        .map(|c| {
            let mut cols = [false; MACRO_COLUMNS];
            for (d, &s) in cols.iter_mut().zip(c) {
                *d = s != 0;
            }
            cols
        })
        .collect()
}

/// 4-op pair table: a count, then 128 1-based first-instrument indices.
fn four_op_pairs(raw: &[u8]) -> Vec<u8> {
    match raw.split_first() {
        Some((&n, idx)) => idx.iter().take(usize::from(n)).copied().collect(),
        None => Vec::new(),
    }
}

fn read_songdata_v1(
    src: &mut ByteSource<'_>,
    layout: &At2Layout,
    len: usize,
    info: &mut SongInfo,
) -> Result<()> {
    let raw = unpack(src, layout, len, 11717)?;
    let mut r = ByteSource::new(&raw);
    info.name = pascal(r.read(43)?);
    info.author = pascal(r.read(43)?);
    for _ in 0..250 {
        info.instrument_names.push(instrument_name(r.read(33)?));
    }
    info.instruments = read_instruments(layout, r.read(250 * InstrumentV1::SIZE)?)?;
    info.orders.copy_from_slice(r.read(ORDER_SLOTS)?);
    info.tempo = r.read_u8()?;
    info.speed = r.read_u8()?;
    let common_flag = r.read_u8()?;
    if layout.version > 4 {
        info.common_flag = common_flag;
    }
    Ok(())
}

fn read_songdata_v9(
    src: &mut ByteSource<'_>,
    layout: &At2Layout,
    len: usize,
    info: &mut SongInfo,
) -> Result<()> {
    let raw = unpack(src, layout, len, 1_138_338)?;
    let mut r = ByteSource::new(&raw);
    info.name = pascal(r.read(43)?);
    info.author = pascal(r.read(43)?);
    for _ in 0..255 {
        info.instrument_names.push(instrument_name(r.read(43)?));
    }
    info.instruments = read_instruments(layout, r.read(255 * InstrumentV9::SIZE)?)?;
    info.fmreg = read_table(r.read(255 * FmregTable::SIZE)?, 255)?;
    info.arpvib = read_table(r.read(255 * ArpVibTable::SIZE)?, 255)?;
    info.orders.copy_from_slice(r.read(ORDER_SLOTS)?);
    info.tempo = r.read_u8()?;
    info.speed = r.read_u8()?;
    info.common_flag = r.read_u8()?;
    info.patt_len = usize::from(r.read_u16_le()?);
    info.tracks = usize::from(r.read_u8()?);
    info.macro_speedup = r.read_u16_le()?;
    info.flag_4op = r.read_u8()?;
    info.lock_flags = r.read_array()?;
    for _ in 0..ORDER_SLOTS {
        info.pattern_names.push(latin1(&r.read(43)?[1..]));
    }
    info.disabled = disabled_columns(r.read(255 * MACRO_COLUMNS)?);
    info.four_op_pairs = four_op_pairs(r.read(129)?);
    info.message = r.read(1024)?.to_vec();
    Ok(())
}

/// Instrument names keep at most 31 characters.
fn instrument_name(raw: &[u8]) -> String {
    pascal(raw).chars().take(31).collect()
}

// ---------------------------------------------------------------------------
// Song assembly
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn build(
    src: &mut ByteSource<'_>,
    layout: &At2Layout,
    lens: &[usize],
    first_pattern_block: usize,
    patterns: u8,
    info: SongInfo,
    opts: &LoadOptions,
    warnings: &mut Warnings,
) -> Result<Song> {
    if info.tracks == 0 || info.tracks > MAX_TRACKS {
        return Err(FormatError::out_of_range("track count", info.tracks as i64));
    }
    if info.macro_speedup > 20 {
        return Err(FormatError::out_of_range("macro speedup", info.macro_speedup));
    }
    if info.patt_len == 0 || info.patt_len > layout.patterns.rows.max(64) {
        return Err(FormatError::out_of_range("pattern length", info.patt_len as i64));
    }
    if usize::from(patterns) > opts.max_patterns {
        return Err(FormatError::out_of_range("pattern count", patterns));
    }
    tracing::debug!(
        "tempo {} speed {} rows {} tracks {}",
        info.tempo,
        info.speed,
        info.patt_len,
        info.tracks
    );

    let chip = info.chip();
    let mut song = Song::with_channels(&info.name, chip.channels(), info.patt_len);
    song.add_system(chip);
    song.author = info.author.clone();
    song.compat.linear_pitch = false;
    song.compat.pitch_macro_is_linear = false;
    song.compat.pitch_slide_speed = 8;

    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    {
        let sub = song.main_mut();
        sub.name = info.name.clone();
        sub.hz = f32::from(info.tempo);
        sub.speeds = vec![info.speed];
        let orders_len = info.orders.iter().position(|&o| o > 0x7F).unwrap_or(ORDER_SLOTS).max(1);
        sub.set_orders_len(orders_len);
        for (pos, &pattern) in info.orders.iter().take(orders_len).enumerate() {
            opts.check_order(pos, None, pattern & 0x7F)?;
            sub.set_order_all(pos, pattern & 0x7F);
        }
    }

    let mut marks = Marks::default();
    let highest_instrument =
        read_patterns(src, layout, lens, first_pattern_block, patterns, &info, song.main_mut(), &mut marks, &mut out)?;

    if layout.has_disabled_columns() {
        let sub = song.main_mut();
        for (index, name) in info.pattern_names.iter().enumerate().take(usize::from(patterns)) {
            for &ch in AT2_CHANNEL_MAP.iter().take(info.tracks) {
                if let Some(c) = sub.channels.get_mut(ch) {
                    c.pattern_mut(index as u8, info.patt_len).name = mb_ir::bounded_name(name);
                }
            }
        }
    }

    import_instruments(&mut song, &info, highest_instrument);
    if layout.has_4op_instruments() {
        pair_4op_instruments(&mut song, &info.four_op_pairs)?;
    }
    if layout.has_macro_tables() {
        import_macros(&mut song, &info);
    }

    continuation::apply_at2(song.main_mut(), &marks, &mut out);

    if layout.has_4op_tracks() {
        pair_4op_tracks(&mut song, info.flag_4op);
    }

    if info.macro_speedup > 1 {
        out.warn(format!(
            "macros run {} times faster than the engine rate; conversion may be inaccurate",
            info.macro_speedup
        ));
        song.main_mut().macro_speed_mult = info.macro_speedup as u8;
    }

    finish_channels(song.main_mut(), &info, &mut out);
    song.main_mut().notes = message_text(&info.message);
    song.main_mut().fit_effect_columns();
    Ok(song)
}

/// Decode all pattern groups. Returns the highest instrument index any cell
/// references.
#[allow(clippy::too_many_arguments)]
fn read_patterns(
    src: &mut ByteSource<'_>,
    layout: &At2Layout,
    lens: &[usize],
    first_block: usize,
    patterns: u8,
    info: &SongInfo,
    sub: &mut Subsong,
    marks: &mut Marks,
    out: &mut Emitter<'_>,
) -> Result<Option<u16>> {
    let shape = layout.patterns;
    let channels = info.tracks.min(shape.channels);
    let rows = info.patt_len.min(shape.rows);
    let mut highest = None;

    for group in 0..shape.groups {
        let len = lens.get(first_block + group).copied().unwrap_or(0);
        if len == 0 {
            continue;
        }
        let raw = unpack(src, layout, len, shape.group_bytes())?;
        for p in 0..shape.per_group {
            let index = group * shape.per_group + p;
            if index >= usize::from(patterns) {
                break;
            }
            let base = p * shape.pattern_bytes();
            for c in 0..channels {
                let ch = AT2_CHANNEL_MAP[c];
                for r in 0..rows {
                    let cell = if shape.row_major { r * shape.channels + c } else { c * shape.rows + r };
                    let at = base + cell * shape.cell;
                    let bytes = &raw[at..at + shape.cell];
                    let Some(row) = sub
                        .channels
                        .get_mut(ch)
                        .and_then(|chan| chan.pattern_mut(index as u8, info.patt_len).row_mut(r))
                    else {
                        continue;
                    };

                    row.note = at2_note(bytes[0]);
                    if (1..=128).contains(&bytes[1]) {
                        let ins = u16::from(bytes[1] - 1);
                        row.instrument = Some(ins);
                        highest = highest.max(Some(ins));
                        if !row.note.is_none() {
                            row.volume = Some(0x3F);
                        }
                    }
                    for pair in bytes[2..].chunks_exact(2) {
                        let (def, val) = (pair[0], pair[1]);
                        if def == 0 && val == 0 {
                            continue;
                        }
                        if let Some(mark) = at2::convert(layout.version, def, val, row, out) {
                            marks.insert(ch, index as u8, r, mark);
                        }
                    }
                }
            }
        }
    }
    Ok(highest)
}

fn at2_note(raw: u8) -> Note {
    if raw == 0xFF {
        return Note::Off;
    }
    // fixed-note flag
    let n = if raw > 96 { raw.wrapping_sub(0x90) } else { raw };
    if (1..=96).contains(&n) {
        Note::from_c0_offset(i16::from(n) - 1)
    } else {
        Note::None
    }
}

fn import_instruments(song: &mut Song, info: &SongInfo, highest_used: Option<u16>) {
    let used = highest_used.map_or(0, |i| usize::from(i) + 1);
    let count = info.instruments.len().max(used).max(1);
    for i in 0..count {
        let data = info.instruments.get(i).copied().unwrap_or_default();
        let name = info.instrument_names.get(i).map(String::as_str).unwrap_or("");

        let mut patch = FmPatch::new(FmKind::Opl);
        patch.op[0] = data.fm.operator(0);
        patch.op[1] = data.fm.operator(1);
        patch.alg = data.fm.connect();
        patch.fb = data.fm.feedback();
        if data.perc_voice > 1 {
            patch.kind = FmKind::OplDrums;
            let modulator = patch.op[0];
            if let Some(op) = patch.op.get_mut(usize::from(data.perc_voice) - 2) {
                *op = modulator;
            }
        }

        let mut ins = Instrument::new(name, InstrumentBody::Fm(patch));
        match data.panning {
            1 => ins.macros.set(MacroKind::PanLeft, Macro::from_values(vec![2])),
            2 => ins.macros.set(MacroKind::PanLeft, Macro::from_values(vec![1])),
            _ => {}
        }
        song.instruments.push(ins);
    }
}

/// Operators of a 4-op voice built from two 2-op halves.
fn merge_4op(first: &FmPatch, second: &FmPatch) -> FmPatch {
    let mut patch = first.clone();
    patch.alg = second.alg | (first.alg << 1);
    patch.op = [second.op[0], first.op[0], second.op[1], first.op[1]];
    patch.ops = 4;
    patch
}

fn pair_4op_instruments(song: &mut Song, pairs: &[u8]) -> Result<()> {
    for &idx in pairs {
        let first = usize::from(idx).wrapping_sub(1);
        let second = first.wrapping_add(1);
        let (Some(a), Some(b)) = (song.instruments.get(first), song.instruments.get(second)) else {
            return Err(FormatError::out_of_range("4-op instrument pair", idx));
        };
        let (Some(pa), Some(pb)) = (a.fm_patch(), b.fm_patch()) else { continue };
        let merged = merge_4op(pa, pb);
        if let Some(p) = song.instruments[first].fm_patch_mut() {
            *p = merged;
        }
    }
    Ok(())
}

const REGISTER_COLUMNS: [OpMacro; 12] = [
    OpMacro::Ar,
    OpMacro::Dr,
    OpMacro::Sl,
    OpMacro::Rr,
    OpMacro::Ws,
    OpMacro::Tl,
    OpMacro::Ksl,
    OpMacro::Mult,
    OpMacro::Am,
    OpMacro::Vib,
    OpMacro::Ksr,
    OpMacro::Sus,
];

fn column_kind(col: usize) -> MacroKind {
    match col {
        0..=23 => MacroKind::Op((col / 12) as u8, REGISTER_COLUMNS[col % 12]),
        24 => MacroKind::Algorithm,
        25 => MacroKind::Feedback,
        26 => MacroKind::Pitch,
        _ => MacroKind::PanLeft,
    }
}

fn import_macros(song: &mut Song, info: &SongInfo) {
    for (i, ins) in song.instruments.iter_mut().enumerate() {
        let Some(table) = info.fmreg.get(i) else { break };

        let arp = usize::from(table.arpeggio_table);
        if let Some(a) = arp.checked_sub(1).and_then(|n| info.arpvib.get(n)) {
            if a.arp_length > 0 && a.arp_speed > 0 {
                let values = a.arp_data[..usize::from(a.arp_length)]
                    .iter()
                    .map(|&d| {
                        let v = i32::from(d & 0x7F);
                        if d & 0x80 != 0 && v != 0 {
                            v | ARP_FIXED
                        } else {
                            v
                        }
                    })
                    .collect();
                let mut m = Macro::from_values(values);
                if let Some(lp) = usize::from(a.arp_loop_begin).checked_sub(1) {
                    m.set_loop(lp);
                }
                if a.arp_keyoff_pos > 0 {
                    m.set_release(usize::from(a.arp_keyoff_pos));
                }
                m.speed = a.arp_speed;
                ins.macros.set(MacroKind::Arpeggio, m);
            }
        }

        let disabled = info.disabled.get(i).copied().unwrap_or([false; MACRO_COLUMNS]);
        register_macros(ins, table, &disabled);
    }
}

/// Expand the register macro: each step lasts `duration` ticks, 0 skips it.
fn register_macros(ins: &mut Instrument, table: &FmregTable, disabled: &[bool; MACRO_COLUMNS]) {
    if table.length == 0 {
        return;
    }
    let steps = &table.steps[..usize::from(table.length).min(table.steps.len())];
    let has_slide = steps.iter().any(|s| s.freq_slide != 0 && s.duration != 0);

    let loop0 = i32::from(table.loop_begin) - 1;
    let rel0 = i32::from(table.keyoff_pos) - 1;
    let (mut loop_at, mut release_at) = (loop0, rel0);
    let mut columns: [Vec<i32>; MACRO_COLUMNS] = Default::default();
    let mut pos = 0usize;

    for (j, step) in steps.iter().enumerate() {
        let values = step.fm.columns(step.freq_slide, step.panning);
        for _ in 0..step.duration {
            if pos > 255 {
                break;
            }
            for (col, v) in columns.iter_mut().zip(values) {
                col.push(v);
            }
            pos += 1;
        }
        if step.duration > 1 {
            let extra = i32::from(step.duration) - 1;
            if (j as i32) < loop0 {
                loop_at += extra;
            }
            if (j as i32) < rel0 {
                release_at += extra;
            }
        }
        if pos > 255 {
            break;
        }
    }

    for (col, values) in columns.into_iter().enumerate() {
        if disabled[col] || (col == 26 && !has_slide) {
            continue;
        }
        let mut m = Macro::from_values(values);
        if loop_at >= 0 {
            m.set_loop(loop_at as usize);
        }
        if release_at > 0 {
            m.set_release(release_at as usize);
        }
        if col == 26 {
            m.mode = MacroMode::Relative;
        }
        ins.macros.set(column_kind(col), m);
    }
}

/// Tracks paired into 4-op voices play one instrument built from the two
/// instruments that start together on both tracks.
fn pair_4op_tracks(song: &mut Song, flags: u8) {
    let mut built: BTreeMap<(u16, u16), u16> = BTreeMap::new();
    let (orders_len, pat_len) = (song.main().orders_len, song.main().pat_len);

    for pair in 0..6 {
        if flags & (1 << pair) == 0 {
            continue;
        }
        let (a, b) = (pair * 2, pair * 2 + 1);
        for pos in 0..orders_len {
            for r in 0..pat_len {
                let sub = song.main();
                let (Some(mut ra), Some(mut rb)) = (sub.row_at(a, pos, r).copied(), sub.row_at(b, pos, r).copied())
                else {
                    continue;
                };
                let (Some(ia), Some(ib)) = (ra.instrument, rb.instrument) else { continue };

                if ra.note.is_none() && !rb.note.is_none() {
                    ra.note = rb.note;
                }
                if rb.note.is_none() && !ra.note.is_none() {
                    rb.note = ra.note;
                }

                let known = built.get(&(ia, ib)).copied();
                let index = known.or_else(|| four_op_copy(song, ia, ib));
                if let Some(i) = index {
                    built.insert((ia, ib), i);
                    ra.instrument = Some(i);
                }

                let sub = song.main_mut();
                if let Some(row) = sub.row_at_mut(a, pos, r) {
                    *row = ra;
                }
                if let Some(row) = sub.row_at_mut(b, pos, r) {
                    *row = rb;
                }
            }
        }
    }
}

fn four_op_copy(song: &mut Song, first: u16, second: u16) -> Option<u16> {
    let a = song.instruments.get(usize::from(first))?;
    let b = song.instruments.get(usize::from(second))?;
    let patch = merge_4op(a.fm_patch()?, b.fm_patch()?);

    let mut ins = Instrument::new(
        &format!("{} + {} [4-op copy]", a.name, b.name),
        InstrumentBody::Fm(FmPatch { kind: FmKind::Opl, ..patch }),
    );
    for (kind, m) in a.macros.iter() {
        if !matches!(kind, MacroKind::Op(..)) {
            ins.macros.set(kind, m.clone());
        }
    }
    // operator order matches merge_4op
    for (src, from, to) in [(b, 0, 0), (a, 0, 1), (b, 1, 2), (a, 1, 3)] {
        for (kind, m) in src.macros.iter() {
            if let MacroKind::Op(op, which) = kind {
                if op == from {
                    ins.macros.set(MacroKind::Op(to, which), m.clone());
                }
            }
        }
    }
    song.instruments.push(ins);
    Some((song.instruments.len() - 1) as u16)
}

/// Channel visibility, default panning and global LFO depths.
fn finish_channels(sub: &mut Subsong, info: &SongInfo, out: &mut Emitter<'_>) {
    for ch in &mut sub.channels {
        ch.visible = ch
            .orders
            .iter()
            .filter_map(|&i| ch.patterns.get(&i))
            .any(|p| p.rows.iter().any(|r| !r.is_empty()));
    }

    let channels = sub.channels.len();
    for (i, &flags) in info.lock_flags.iter().enumerate().take(channels) {
        let pan = match flags & 3 {
            1 => 0x00,
            2 => 0xFF,
            _ => continue,
        };
        if let Some(row) = sub.row_at_mut(AT2_CHANNEL_MAP[i], 0, 0) {
            out.emit(row, fx::PANNING, pan);
        }
    }

    if info.common_flag & 0x08 != 0 {
        place_global(sub, Effect::new(fx::FM_LFO, 1), out);
    }
    if info.common_flag & 0x10 != 0 {
        place_global(sub, Effect::new(fx::FM_VIB_DEPTH, 1), out);
    }
}

/// Put a song-wide effect on the first row of the channel with the most
/// free effect columns there.
fn place_global(sub: &mut Subsong, effect: Effect, out: &mut Emitter<'_>) {
    let best = (0..sub.channels.len())
        .filter_map(|ch| sub.row_at(ch, 0, 0).and_then(|r| r.first_free_slot()).map(|s| (s, ch)))
        .min();
    match best.and_then(|(_, ch)| sub.row_at_mut(ch, 0, 0)) {
        Some(row) => {
            out.place(row, effect);
        }
        None => out.warn(format!("no room for song-wide effect {:02X}", effect.cmd)),
    }
}

/// The message area holds twenty fixed-width lines.
fn message_text(raw: &[u8]) -> String {
    let lines: Vec<String> = raw
        .chunks(MESSAGE_WIDTH)
        .take(MESSAGE_LINES)
        .map(|l| latin1(l).trim_end().to_string())
        .collect();
    if lines.iter().all(String::is_empty) {
        return String::new();
    }
    lines.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_declared() {
        let zeros = [0u8; 4000];
        let mut r = ByteSource::new(&zeros);
        r.read_record::<A2tHeader>().unwrap();
        assert_eq!(r.tell(), 23);
        let mut r = ByteSource::new(&zeros);
        r.read_record::<FmregTable>().unwrap();
        assert_eq!(r.tell(), 3831);
        let mut r = ByteSource::new(&zeros);
        r.read_record::<ArpVibTable>().unwrap();
        assert_eq!(r.tell(), 521);
        assert!(parse_record::<VarHeaderV9>(&zeros[..86]).is_ok());
        assert!(parse_record::<InstrumentV9>(&zeros[..13]).is_err());
    }

    #[test]
    fn fm_register_bits() {
        let fm = FmRegs { raw: [0xF1, 0x22, 0x4A, 0x80, 0xF3, 0x12, 0x45, 0x67, 0x03, 0x01, 0x0B] };
        let m = fm.operator(0);
        assert_eq!((m.mult, m.ksr, m.sus, m.vib, m.am), (1, 1, 1, 1, 1));
        assert_eq!((m.tl, m.ksl), (0x0A, 1));
        assert_eq!((m.ar, m.dr, m.sl, m.rr, m.ws), (15, 3, 4, 5, 3));
        let c = fm.operator(1);
        assert_eq!((c.mult, c.ksr, c.sus, c.vib, c.am), (2, 0, 1, 0, 0));
        assert_eq!((c.tl, c.ksl), (0, 2));
        assert_eq!((c.ar, c.dr, c.sl, c.rr, c.ws), (1, 2, 6, 7, 1));
        assert_eq!((fm.connect(), fm.feedback()), (1, 5));
    }

    #[test]
    fn notes() {
        assert_eq!(at2_note(0), Note::None);
        assert_eq!(at2_note(1), Note::On(60));
        assert_eq!(at2_note(13), Note::On(72));
        assert_eq!(at2_note(0xFF), Note::Off);
        // fixed notes drop the flag
        assert_eq!(at2_note(0x91), Note::On(60));
        assert_eq!(at2_note(100), Note::None);
    }

    #[test]
    fn four_op_merge_order() {
        let mut a = FmPatch::new(FmKind::Opl);
        let mut b = FmPatch::new(FmKind::Opl);
        a.alg = 1;
        b.alg = 0;
        for i in 0..2 {
            a.op[i].mult = 10 + i as u8;
            b.op[i].mult = 20 + i as u8;
        }
        let m = merge_4op(&a, &b);
        assert_eq!(m.ops, 4);
        assert_eq!(m.alg, 2);
        let mults: Vec<u8> = m.op.iter().map(|o| o.mult).collect();
        assert_eq!(mults, [20, 10, 21, 11]);
    }

    #[test]
    fn register_macro_expands_durations() {
        let step = |vol: u8, duration: u8| RegisterStep {
            fm: FmRegs { raw: [0, 0, vol, 0, 0, 0, 0, 0, 0, 0, 0] },
            freq_slide: 0,
            panning: 1,
            duration,
        };
        let table = FmregTable {
            length: 3,
            loop_begin: 2,
            _loop_length: 0,
            keyoff_pos: 0,
            arpeggio_table: 0,
            _vibrato_table: 0,
            steps: vec![step(0, 2), step(10, 0), step(20, 1)],
        };
        let mut ins = Instrument::fm("x", FmKind::Opl);
        let mut disabled = [false; MACRO_COLUMNS];
        disabled[12 + 5] = true;
        register_macros(&mut ins, &table, &disabled);

        let tl = ins.macros.get(MacroKind::Op(0, OpMacro::Tl)).unwrap();
        assert_eq!(tl.values, [63, 63, 43]);
        // loop on the second step moves past the doubled first step
        assert_eq!(tl.loop_start, Some(2));
        assert_eq!(tl.release, None);
        assert!(ins.macros.get(MacroKind::Op(1, OpMacro::Tl)).is_none());
        assert!(ins.macros.get(MacroKind::Pitch).is_none());
        assert_eq!(ins.macros.get(MacroKind::PanLeft).map(|m| m.values.clone()), Some(vec![2, 2, 2]));
    }

    #[test]
    fn message_lines() {
        let mut raw = vec![0u8; 1024];
        raw[..5].copy_from_slice(b"hello");
        raw[51..56].copy_from_slice(b"world");
        assert_eq!(message_text(&raw), "hello\nworld");
        assert_eq!(message_text(&[0u8; 1024]), "");
    }

    /// Version 9, 4 patterns, 2 tracks of 64 rows. Every block but the
    /// orders is empty.
    fn tiny_v9(orders: [u8; 5]) -> Vec<u8> {
        let mut file = A2T_MAGIC.to_vec();
        file.extend_from_slice(&[0, 0, 0, 0, 9, 4, 50, 6]);
        file.push(0);
        file.extend_from_slice(&64u16.to_le_bytes());
        file.push(2);
        file.extend_from_slice(&1u16.to_le_bytes());
        // five aPLib literals, then the end code
        let packed = [orders[0], 0x0C, orders[1], orders[2], orders[3], orders[4], 0x00];
        for block in 0..20u32 {
            let len = if block == 3 { packed.len() as u32 } else { 0 };
            file.extend_from_slice(&len.to_le_bytes());
        }
        assert_eq!(file.len(), 23 + 86);
        file.extend_from_slice(&packed);
        file
    }

    #[test]
    fn minimal_v9_file() {
        let mut w = Warnings::new();
        let song = load_a2t(&tiny_v9([0, 1, 2, 3, 0xFF]), &LoadOptions::default(), &mut w).unwrap();
        assert_eq!(song.systems[0].chip, Chip::Opl3);
        let sub = song.main();
        // the OPL3 layout is fixed at 18 channels; only the 2 declared tracks are used
        assert_eq!(sub.channels.len(), 18);
        assert_eq!(sub.pat_len, 64);
        assert_eq!(sub.orders_len, 4);
        assert_eq!(sub.hz, 50.0);
        assert_eq!(sub.speeds, [6]);
        // an all-zero instrument block still yields one default patch
        assert_eq!(song.instruments.len(), 1);
        match &song.instruments[0].body {
            InstrumentBody::Fm(p) => assert_eq!((p.kind, p.alg, p.fb), (FmKind::Opl, 0, 0)),
            other => panic!("expected an FM instrument, got {other:?}"),
        }
    }

    #[test]
    fn order_past_pattern_bound() {
        let opts = LoadOptions { max_patterns: 16, ..LoadOptions::default() };
        let err = load_a2t(&tiny_v9([0, 20, 2, 3, 0xFF]), &opts, &mut Warnings::new()).unwrap_err();
        assert_eq!(err, FormatError::out_of_range("pattern index at order 1", 20));
        assert!(load_a2t(&tiny_v9([0, 20, 2, 3, 0xFF]), &LoadOptions::default(), &mut Warnings::new()).is_ok());
    }

    #[test]
    fn bad_version_is_invalid_header() {
        let mut file = A2T_MAGIC.to_vec();
        file.extend_from_slice(&[0, 0, 0, 0, 15, 1, 50, 6]);
        let mut w = Warnings::new();
        let err = load_a2t(&file, &LoadOptions::default(), &mut w).unwrap_err();
        assert!(matches!(err, FormatError::InvalidHeader(_)));
    }
}
