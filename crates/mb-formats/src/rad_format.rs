//! Reality AdLib Tracker modules, v1.0 and v2.1.
//!
//! v1.0 is a plain OPL2 song: 31 two-operator instruments, an order list
//! and up to 32 patterns addressed through an offset table. v2.1 moves to
//! OPL3 with named 2-op, 4-op and split "2+2" instruments, instrument riffs
//! and global riffs. Riffs become extra subsongs; instrument riffs are also
//! folded into instrument macros where they only drive pitch, level,
//! multiplier or feedback.

use std::collections::{BTreeMap, BTreeSet};

use binrw::BinRead;
use mb_ir::{
    fx, Chip, Effect, FmKind, FmOperator, Instrument, Macro, MacroKind, MacroMode, Note, OpMacro, Row, Song,
    Subsong,
};

use crate::effects::{continuation, Emitter};
use crate::error::{FormatError, Result, Warnings};
use crate::reader::{ByteSource, Record};
use crate::LoadOptions;

pub const RAD_MAGIC: &[u8] = b"RAD by REALiTY!!";

const PAT_LEN: usize = 64;
const LINES: usize = 128;
const RAD_CHANNELS: usize = 9;
const HZ: f32 = 50.0;

/// Order of the four stored v2 operators in the 4-op patch.
const FOUR_OP_SLOTS: [usize; 4] = [3, 1, 2, 0];
/// Operator addressed by the M and V commands on each channel.
const CHANNEL_OPERATOR: [u8; RAD_CHANNELS] = [0, 0, 1, 2, 3, 0, 1, 2, 3];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Version {
    V1,
    V2,
}

impl Version {
    fn max_pattern(self) -> u8 {
        match self {
            Version::V1 => 0x1F,
            Version::V2 => 0x7F,
        }
    }

    fn chip(self) -> Chip {
        match self {
            Version::V1 => Chip::Opl2,
            Version::V2 => Chip::Opl3,
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk records
// ---------------------------------------------------------------------------

/// v1 instrument. Operators are stored carrier first.
#[derive(BinRead, Debug)]
#[br(little)]
struct InstrumentV1 {
    flags: [u8; 2],
    levels: [u8; 2],
    attack_decay: [u8; 2],
    sustain_release: [u8; 2],
    connection: u8,
    waveforms: [u8; 2],
}

impl Record for InstrumentV1 {
    const SIZE: usize = 11;
}

impl InstrumentV1 {
    fn operator(&self, stored: usize) -> FmOperator {
        opl_operator(
            self.flags[stored],
            self.levels[stored],
            self.attack_decay[stored],
            self.sustain_release[stored],
            self.waveforms[stored] & 3,
        )
    }
}

/// v2 instrument header, followed by operator records.
#[derive(BinRead, Debug)]
#[br(little)]
struct InstrumentV2 {
    connection: u8,
    feedback: u8,
    riff: u8,
    _volume: u8,
}

impl Record for InstrumentV2 {
    const SIZE: usize = 4;
}

impl InstrumentV2 {
    fn algorithm(&self) -> u8 {
        self.connection & 7
    }

    fn panning(&self) -> [u8; 2] {
        [(self.connection >> 3) & 3, (self.connection >> 5) & 3]
    }

    fn has_riff(&self) -> bool {
        self.connection & 0x80 != 0
    }

    fn feedback(&self) -> [u8; 2] {
        [self.feedback & 15, self.feedback >> 4]
    }

    fn riff_speed(&self) -> u8 {
        self.riff & 15
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct OperatorV2 {
    flags: u8,
    level: u8,
    attack_decay: u8,
    sustain_release: u8,
    waveform: u8,
}

impl Record for OperatorV2 {
    const SIZE: usize = 5;
}

impl OperatorV2 {
    fn operator(&self) -> FmOperator {
        opl_operator(self.flags, self.level, self.attack_decay, self.sustain_release, self.waveform & 7)
    }
}

/// One OPL operator from its register bytes (0x20, 0x40, 0x60, 0x80, 0xE0).
pub(crate) fn opl_operator(flags: u8, level: u8, ad: u8, sr: u8, ws: u8) -> FmOperator {
    FmOperator {
        mult: flags & 15,
        ksr: (flags >> 4) & 1,
        sus: (flags >> 5) & 1,
        vib: (flags >> 6) & 1,
        am: flags >> 7,
        tl: level & 63,
        ksl: level >> 6,
        dr: ad & 15,
        ar: ad >> 4,
        rr: sr & 15,
        sl: sr >> 4,
        ws,
        ..FmOperator::default()
    }
}

// ---------------------------------------------------------------------------
// Pattern steps
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
struct Step {
    note: u8,
    octave: u8,
    /// Instrument slot, 0 for none.
    instrument: u16,
    effect: Option<(u8, u8)>,
}

type Grid = Vec<[Step; LINES]>;

fn empty_grid() -> Grid {
    vec![[Step::default(); LINES]; RAD_CHANNELS]
}

fn rad_note(step: &Step) -> Note {
    match step.note {
        15 => Note::Release,
        n @ 1..=12 => Note::from_c0_offset(i16::from(n) + i16::from(step.octave) * 12),
        _ => Note::None,
    }
}

/// Translate one RAD command. Commands only act on their own row; the
/// continuation pass makes slides explicit afterwards.
fn convert_effect(channel: usize, effect: u8, param: u8, row: &mut Row, out: &mut Emitter<'_>) {
    let operator = CHANNEL_OPERATOR.get(channel).copied().unwrap_or(0);
    let effect = match effect {
        1..=3 => Some(Effect::new(effect, param)),
        5 => Some(Effect { cmd: fx::PORTA_VOL_SLIDE, value: split_slide(param, |p| p * 15 / 49, |p| p * 15 / 48) }),
        10 => Some(Effect { cmd: fx::VOL_SLIDE, value: split_slide(param, |p| p.min(15), |p| p.min(15)) }),
        12 => {
            row.volume = Some(param.min(0x3F));
            None
        }
        13 => Some(Effect::new(fx::BREAK, param)),
        15 => Some(Effect::new(fx::SPEED, param)),
        22 if channel > 0 => Some(Effect::new(fx::FM_MULT, (operator << 4) | (param & 15))),
        27 => Some(Effect::new(fx::RIFF_START, param)),
        29 => Some(Effect::new(fx::RIFF_TRANSPOSE, param)),
        30 => {
            let value = if param > 7 { param.saturating_sub(10) | 0x10 } else { param };
            Some(Effect::new(fx::FM_FEEDBACK, value))
        }
        31 if channel > 0 => Some(Effect::new(fx::FM_TL_OP1 + operator, 0x3F - param.min(0x3F))),
        18 => {
            out.warn("RAD effect I not supported");
            None
        }
        _ => None,
    };
    if let Some(e) = effect {
        out.place(row, e);
    }
}

/// RAD slide parameters: 1-49 slide down, 51-99 slide up.
fn split_slide(param: u8, down: impl Fn(u16) -> u16, up: impl Fn(u16) -> u16) -> Option<u8> {
    let p = u16::from(param);
    match param {
        1..=49 => Some((down(p) & 15) as u8),
        51..=99 => Some(((up(p - 51) & 15) as u8) << 4),
        _ => None,
    }
}

/// Write grid channel `from` into pattern `pattern` of channel `target`.
fn convert_channel(
    grid: &Grid,
    from: usize,
    sub: &mut Subsong,
    target: usize,
    pattern: u8,
    out: &mut Emitter<'_>,
) {
    let pat_len = sub.pat_len;
    let Some(ch) = sub.channels.get_mut(target) else { return };
    let pat = ch.pattern_mut(pattern, pat_len);
    for (line, step) in grid[from].iter().enumerate().take(pat_len) {
        let Some(row) = pat.row_mut(line) else { break };
        row.note = rad_note(step);
        if step.instrument > 0 {
            row.instrument = Some(step.instrument);
        }
        if let Some((effect, param)) = step.effect {
            convert_effect(from, effect, param, row, out);
        }
    }
}

/// Read one length-prefixed v2 pattern or riff. `forced` places every
/// entry on one channel, as global riffs do. A pattern whose last entry is
/// cut short by its declared length keeps what was read.
fn read_pattern(src: &mut ByteSource<'_>, forced: Option<usize>) -> Result<Grid> {
    let len = usize::from(src.read_u16_le()?);
    let mut block = ByteSource::new(src.read(len)?);
    let mut grid = empty_grid();

    'lines: while !block.at_end() {
        let Ok(line) = block.read_u8() else { break };
        let line_number = usize::from(line & 0x7F);
        loop {
            let Ok(info) = block.read_u8() else { break 'lines };
            let channel = forced.unwrap_or(usize::from(info & 15) % RAD_CHANNELS);
            let step = &mut grid[channel][line_number];
            if info & 0x40 != 0 {
                let Ok(b) = block.read_u8() else { break 'lines };
                step.note = b & 15;
                step.octave = (b >> 4) & 7;
            }
            if info & 0x20 != 0 {
                let Ok(b) = block.read_u8() else { break 'lines };
                if b & 0x7F > 0 {
                    step.instrument = u16::from(b & 0x7F) * 2;
                }
            }
            if info & 0x10 != 0 {
                let Ok(effect) = block.read_u8() else { break 'lines };
                let param = block.read_u8().unwrap_or(0);
                step.effect = Some((effect & 0x1F, param & 0x7F));
            }
            if info & 0x80 != 0 {
                break;
            }
        }
        if line & 0x80 != 0 {
            break;
        }
    }
    Ok(grid)
}

/// Read one v1 pattern at the current position.
fn read_pattern_v1(src: &mut ByteSource<'_>) -> Result<Grid> {
    let mut grid = empty_grid();
    loop {
        let line = src.read_u8()?;
        let line_number = usize::from(line & 0x7F);
        loop {
            let channel = src.read_u8()?;
            let note = src.read_u8()?;
            let effect = src.read_u8()?;
            let param = if effect & 15 != 0 { src.read_u8()? } else { 0 };
            let step = &mut grid[usize::from(channel & 0x7F) % RAD_CHANNELS][line_number];
            step.note = note & 15;
            step.octave = (note >> 4) & 7;
            step.instrument = u16::from(((note >> 7) << 4) | (effect >> 4));
            if effect & 15 != 0 {
                step.effect = Some((effect & 15, param));
            }
            if channel & 0x80 != 0 {
                break;
            }
        }
        if line & 0x80 != 0 {
            return Ok(grid);
        }
    }
}

/// Decode the description: 0x01 is a line break, 0x02-0x1F a run of spaces.
fn read_description(src: &mut ByteSource<'_>) -> Result<String> {
    let mut text = String::new();
    loop {
        match src.read_u8()? {
            0 => return Ok(text),
            1 => text.push('\n'),
            n @ 2..=0x1F => text.extend(std::iter::repeat(' ').take(usize::from(n))),
            c => text.push(char::from(c)),
        }
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Instrument slots as numbered in the file. v2 patterns address slot
/// `2n`; slot `2n + 1` holds the second half of a split 2+2 instrument.
struct Slots {
    slots: Vec<Option<Instrument>>,
    split: BTreeSet<u16>,
}

impl Slots {
    fn new(count: usize) -> Self {
        Self { slots: vec![None; count], split: BTreeSet::new() }
    }

    fn set(&mut self, slot: usize, ins: Instrument) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = Some(ins);
        }
    }

    fn get_mut(&mut self, slot: usize) -> Option<&mut Instrument> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Drop empty slots. Returns the instruments and the new index for
    /// every slot; a reference to an empty slot moves to the next defined
    /// instrument.
    fn compact(self) -> (Vec<Instrument>, Vec<Option<u16>>) {
        let mut instruments = Vec::new();
        let mut remap = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            remap.push(Some(instruments.len() as u16));
            if let Some(ins) = slot {
                instruments.push(ins);
            }
        }
        let count = instruments.len() as u16;
        for r in &mut remap {
            *r = r.filter(|&i| i < count);
        }
        (instruments, remap)
    }
}

fn read_instruments_v1(src: &mut ByteSource<'_>, slots: &mut Slots) -> Result<()> {
    loop {
        let num = src.read_u8()?;
        if num == 0 {
            return Ok(());
        }
        if num > 31 {
            return Err(FormatError::out_of_range("instrument number", num));
        }
        let rec: InstrumentV1 = src.read_record()?;
        let mut ins = Instrument::fm("", FmKind::Opl);
        if let Some(patch) = ins.fm_patch_mut() {
            patch.op[1] = rec.operator(0);
            patch.op[0] = rec.operator(1);
            patch.alg = rec.connection & 1;
            patch.fb = (rec.connection >> 1) & 7;
            patch.ops = 2;
        }
        slots.set(usize::from(num), ins);
    }
}

fn pan_macro(pan: u8) -> Macro {
    Macro::from_values(vec![i32::from(if pan == 0 { 3 } else { pan })])
}

fn read_instruments_v2(
    src: &mut ByteSource<'_>,
    slots: &mut Slots,
    riffs: &mut Vec<Subsong>,
    out: &mut Emitter<'_>,
) -> Result<()> {
    loop {
        let num = src.read_u8()?;
        if num == 0 {
            return Ok(());
        }
        if num > 127 {
            return Err(FormatError::out_of_range("instrument number", num));
        }
        let name = src.read_pascal_string()?;
        let head: InstrumentV2 = src.read_record()?;
        let slot = usize::from(num) * 2;
        let alg = head.algorithm();
        let [fb12, fb34] = head.feedback();
        let [pan12, pan34] = head.panning();

        if alg == 7 {
            src.skip(3)?;
            out.warn(format!("MIDI instrument {num} imported as an empty FM instrument"));
            slots.set(slot, Instrument::fm(&format!("{name} [MIDI]"), FmKind::Opl));
        } else if alg <= 3 {
            let mut ins = Instrument::fm(&name, FmKind::Opl);
            let four = alg > 1;
            let mut ops = Vec::with_capacity(4);
            for _ in 0..4 {
                ops.push(src.read_record::<OperatorV2>()?.operator());
            }
            if let Some(patch) = ins.fm_patch_mut() {
                patch.fb = fb12;
                if four {
                    patch.ops = 4;
                    patch.alg = alg - 2;
                    for (i, op) in ops.into_iter().enumerate() {
                        patch.op[FOUR_OP_SLOTS[i]] = op;
                    }
                } else {
                    patch.ops = 2;
                    patch.alg = alg;
                    patch.op[1] = ops[0];
                    patch.op[0] = ops[1];
                }
            }
            ins.macros.set(MacroKind::PanLeft, pan_macro(pan12));
            slots.set(slot, ins);
        } else {
            // two 2-op voices sharing one instrument number
            let (alg12, alg34) = match alg {
                4 => (0, 0),
                5 => (0, 1),
                _ => (1, 1),
            };
            let mut halves = Vec::with_capacity(2);
            for (suffix, fb, alg, pan) in
                [("first two operators", fb12, alg12, pan12), ("second two operators", fb34, alg34, pan34)]
            {
                let carrier = src.read_record::<OperatorV2>()?.operator();
                let modulator = src.read_record::<OperatorV2>()?.operator();
                let mut ins = Instrument::fm(&format!("{name} [{suffix}]"), FmKind::Opl);
                if let Some(patch) = ins.fm_patch_mut() {
                    patch.ops = 2;
                    patch.alg = alg;
                    patch.fb = fb;
                    patch.op[1] = carrier;
                    patch.op[0] = modulator;
                }
                ins.macros.set(MacroKind::PanLeft, pan_macro(pan));
                halves.push(ins);
            }
            slots.split.insert(slot as u16);
            for (i, ins) in halves.into_iter().enumerate() {
                slots.set(slot + i, ins);
            }
        }

        if head.has_riff() {
            let grid = read_pattern(src, None)?;
            let name = slots.get_mut(slot).map(|i| i.name.to_string()).unwrap_or_default();
            let mut riff = riff_subsong(&format!("Instrument riff: {name}"), head.riff_speed());
            for ch in 0..RAD_CHANNELS {
                convert_channel(&grid, ch, &mut riff, ch, 0, out);
            }
            riff_macros(&riff, slots, slot, alg, head.riff_speed());
            riffs.push(riff);
        }
    }
}

fn riff_subsong(name: &str, speed: u8) -> Subsong {
    let mut sub = Subsong::new(Chip::Opl3.channels(), PAT_LEN);
    sub.name = name.to_string();
    sub.speeds = vec![speed.max(1)];
    sub.hz = HZ;
    for ch in sub.channels.iter_mut().skip(RAD_CHANNELS) {
        ch.visible = false;
    }
    sub
}

/// Values set on some rows of a riff, filled forward into a macro.
#[derive(Default)]
struct RiffTrack(BTreeMap<usize, i32>);

impl RiffTrack {
    fn into_macro(self, base: i32, speed: u8) -> Option<Macro> {
        let last = *self.0.keys().next_back()?;
        let mut current = base;
        let values = (0..=last)
            .map(|row| {
                if let Some(&v) = self.0.get(&row) {
                    current = v;
                }
                current
            })
            .collect();
        Some(Macro { values, speed, ..Macro::default() })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum RiffParam {
    Tl(usize),
    Mult(usize),
    Feedback,
}

/// Fold an instrument riff into macros of the instrument in `slot` (and
/// its second half for split instruments). Stops at the first pattern
/// break.
fn riff_macros(riff: &Subsong, slots: &mut Slots, slot: usize, alg: u8, speed: u8) {
    let speed = speed.max(1);
    let mut tracks: BTreeMap<(usize, RiffParam), RiffTrack> = BTreeMap::new();
    let mut pitch = Vec::new();
    let mut pitch_loops = true;
    let split = alg > 3;

    'rows: for line in 0..riff.pat_len {
        for ch in 0..RAD_CHANNELS {
            let Some(e) = riff.row_at(ch, 0, line).and_then(|r| r.effects[0]) else { continue };
            let v = e.param();
            let target = match e.cmd {
                fx::BREAK => break 'rows,
                fx::PORTA_UP | fx::PORTA_DOWN => {
                    let step = if e.cmd == fx::PORTA_DOWN { -6 } else { 6 };
                    if pitch.len() + usize::from(speed) < 255 {
                        pitch.extend(std::iter::repeat(i32::from(v) * step).take(usize::from(speed)));
                    }
                    if v == 0 {
                        pitch_loops = false;
                    }
                    None
                }
                cmd @ fx::FM_TL_OP1..=0x15 => {
                    let n = usize::from(cmd - fx::FM_TL_OP1);
                    let value = i32::from(v);
                    match alg {
                        0 | 1 if n < 2 => Some((0, RiffParam::Tl(n ^ 1), value)),
                        2 | 3 => Some((0, RiffParam::Tl(FOUR_OP_SLOTS[3 - n]), value)),
                        _ if split && n < 2 => Some((0, RiffParam::Tl(n ^ 1), value)),
                        _ if split => Some((1, RiffParam::Tl((n - 2) ^ 1), value)),
                        _ => None,
                    }
                }
                fx::FM_MULT => {
                    let op = usize::from(v >> 4);
                    let value = i32::from(v & 15);
                    match alg {
                        0 | 1 if op < 2 => Some((0, RiffParam::Mult(op ^ 1), value)),
                        2 | 3 if op < 4 => Some((0, RiffParam::Mult(FOUR_OP_SLOTS[3 - op]), value)),
                        _ if split && op < 2 => Some((0, RiffParam::Mult(op ^ 1), value)),
                        _ if split && op < 4 => Some((1, RiffParam::Mult((op - 2) ^ 1), value)),
                        _ => None,
                    }
                }
                fx::FM_FEEDBACK if split && v & 0x10 != 0 => Some((1, RiffParam::Feedback, i32::from(v & !0x10))),
                fx::FM_FEEDBACK => Some((0, RiffParam::Feedback, i32::from(v))),
                _ => None,
            };
            if let Some((half, param, value)) = target {
                tracks.entry((half, param)).or_default().0.insert(line, value);
            }
        }
    }

    for ((half, param), track) in tracks {
        let Some(ins) = slots.get_mut(slot + half) else { continue };
        let Some(patch) = ins.fm_patch() else { continue };
        let (kind, base) = match param {
            RiffParam::Tl(op) => (MacroKind::Op(op as u8, OpMacro::Tl), patch.op[op].tl),
            RiffParam::Mult(op) => (MacroKind::Op(op as u8, OpMacro::Mult), patch.op[op].mult),
            RiffParam::Feedback => (MacroKind::Feedback, patch.fb),
        };
        if let Some(m) = track.into_macro(i32::from(base), speed) {
            ins.macros.set(kind, m);
        }
    }

    if !pitch.is_empty() {
        let mut m = Macro { values: pitch, mode: MacroMode::Relative, ..Macro::default() };
        if pitch_loops {
            m.set_loop(m.len() - 1);
        }
        let halves = if split { 2 } else { 1 };
        for half in 0..halves {
            if let Some(ins) = slots.get_mut(slot + half) {
                ins.macros.set(MacroKind::Pitch, m.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a RAD file.
pub fn load_rad(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    let magic = src.read(RAD_MAGIC.len())?;
    if magic != RAD_MAGIC {
        return Err(FormatError::invalid("not a RAD module"));
    }
    let version = match src.read_u8()? {
        0x10 => Version::V1,
        0x21 => Version::V2,
        v => return Err(FormatError::invalid(format!("unsupported RAD version {v:#04x}"))),
    };
    tracing::info!("RAD version {:?}", version);

    let chip = version.chip();
    let mut song = Song::with_channels("", chip.channels(), PAT_LEN);
    song.add_system(chip);
    song.compat.linear_pitch = false;
    song.compat.pitch_macro_is_linear = false;
    song.compat.pitch_slide_speed = 8;

    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    let flags = src.read_u8()?;
    {
        let sub = song.main_mut();
        sub.name = "Main song".to_string();
        sub.hz = HZ;
        sub.speeds = vec![(flags & 0x1F).max(1)];
    }
    match version {
        Version::V1 => {
            if flags & 0x80 != 0 {
                song.notes = read_description(&mut src)?;
            }
        }
        Version::V2 => {
            if flags & 0x20 != 0 {
                let bpm = src.read_u16_le()?;
                tracing::debug!("{} BPM", bpm);
                let sub = song.main_mut();
                sub.virtual_tempo.0 = if bpm == 0 { sub.virtual_tempo.1 } else { bpm };
            }
            song.notes = read_description(&mut src)?;
        }
    }

    let mut riffs = Vec::new();
    let slots = match version {
        Version::V1 => {
            let mut slots = Slots::new(32);
            read_instruments_v1(&mut src, &mut slots)?;
            slots
        }
        Version::V2 => {
            let mut slots = Slots::new(257);
            read_instruments_v2(&mut src, &mut slots, &mut riffs, &mut out)?;
            slots
        }
    };

    let order_len = src.read_u8()?;
    if order_len == 0 || order_len > 128 {
        return Err(FormatError::out_of_range("order length", order_len));
    }
    let mut jump_marker = None;
    {
        let sub = song.main_mut();
        sub.set_orders_len(usize::from(order_len));
        for pos in 0..usize::from(order_len) {
            let order = src.read_u8()?;
            if order <= version.max_pattern() {
                opts.check_order(pos, None, order)?;
                sub.set_order_all(pos, order);
            } else if order >= 0x80 {
                jump_marker = Some((pos, order - 0x80));
            } else {
                return Err(FormatError::out_of_range(format!("order {pos}"), order));
            }
        }
    }
    match version {
        Version::V1 => {
            let mut offsets = [0u16; 32];
            for o in &mut offsets {
                *o = src.read_u16_le()?;
            }
            for (index, &offset) in offsets.iter().enumerate() {
                if offset == 0 {
                    continue;
                }
                src.seek(usize::from(offset))?;
                let grid = read_pattern_v1(&mut src)?;
                for ch in 0..RAD_CHANNELS {
                    convert_channel(&grid, ch, song.main_mut(), ch, index as u8, &mut out);
                }
            }
        }
        Version::V2 => {
            loop {
                let index = src.read_u8()?;
                if index == 0xFF {
                    break;
                }
                if usize::from(index) >= opts.max_patterns {
                    return Err(FormatError::out_of_range("pattern number", index));
                }
                let grid = read_pattern(&mut src, None)?;
                let sub = song.main_mut();
                for ch in 0..RAD_CHANNELS {
                    convert_channel(&grid, ch, sub, ch * 2, index, &mut out);
                    sub.channels[ch * 2 + 1].pattern_mut(index, PAT_LEN);
                }
            }
            read_global_riffs(&mut src, &mut riffs, &mut out)?;
        }
    }

    let sub = song.main_mut();
    sub.make_patterns_unique();
    if let Some((pos, dest)) = jump_marker {
        place_jump_marker(sub, pos, dest, &mut out);
    }
    if version == Version::V2 {
        copy_split_voices(sub, &slots.split);
    }

    song.subsongs.extend(riffs);
    for sub in &mut song.subsongs {
        continuation::apply_rad(sub, &mut out);
        sub.fit_effect_columns();
    }

    let (instruments, remap) = slots.compact();
    song.instruments = instruments;
    for sub in &mut song.subsongs {
        for ch in &mut sub.channels {
            for pat in ch.patterns.values_mut() {
                for row in &mut pat.rows {
                    row.instrument = row.instrument.and_then(|i| remap.get(usize::from(i)).copied().flatten());
                }
            }
        }
    }
    Ok(song)
}

/// Global riffs: each record names the riff (high nibble) and the channel
/// (low nibble, 1-9) its data plays on. Consecutive records of one riff
/// share a subsong.
fn read_global_riffs(src: &mut ByteSource<'_>, riffs: &mut Vec<Subsong>, out: &mut Emitter<'_>) -> Result<()> {
    let mut current = None;
    loop {
        let id = src.read_u8()?;
        if id == 0xFF {
            return Ok(());
        }
        let channel = id & 15;
        if !(1..=9).contains(&channel) {
            return Err(FormatError::out_of_range("riff channel", channel));
        }
        let channel = usize::from(channel - 1);
        if current != Some(id >> 4) {
            riffs.push(riff_subsong(&format!("Riff #{}", id >> 4), 6));
            current = Some(id >> 4);
        }
        let grid = read_pattern(src, Some(channel))?;
        if let Some(riff) = riffs.last_mut() {
            convert_channel(&grid, channel, riff, channel, 0, out);
        }
    }
}

/// An order entry of 0x80 or above jumps to `dest`. Only a marker in the
/// last position is kept: it becomes a jump at the end of the previous
/// position, on the row of its pattern break if there is one.
fn place_jump_marker(sub: &mut Subsong, pos: usize, dest: u8, out: &mut Emitter<'_>) {
    if pos + 1 != sub.orders_len || pos == 0 {
        out.warn(format!("jump marker at order {pos} ignored"));
        return;
    }
    let prev = pos - 1;
    let line = (0..sub.channels.len())
        .find_map(|ch| (0..sub.pat_len).find(|&r| sub.row_at(ch, prev, r).is_some_and(|row| row.has_effect(fx::BREAK))))
        .unwrap_or(sub.pat_len - 1);
    if let Some(row) = sub.row_at_mut(0, prev, line) {
        out.emit(row, fx::JUMP, dest);
    }
    sub.set_orders_len(pos);
}

/// A split 2+2 instrument plays on a pair of channels: while one is
/// active on an even channel, its rows are mirrored to the odd neighbour
/// with the second half's instrument. Jumps are not mirrored.
fn copy_split_voices(sub: &mut Subsong, split: &BTreeSet<u16>) {
    if split.is_empty() {
        return;
    }
    for first in (0..sub.channels.len().saturating_sub(1)).step_by(2) {
        let mut active = false;
        for pos in 0..sub.orders_len {
            for line in 0..sub.pat_len {
                let Some(src) = sub.row_at(first, pos, line).copied() else { continue };
                if let Some(ins) = src.instrument {
                    active = split.contains(&ins);
                }
                if !active {
                    continue;
                }
                let mut copy = src;
                copy.instrument = src.instrument.map(|i| i + 1);
                for slot in copy.effects.iter_mut() {
                    if slot.is_some_and(|e| e.cmd == fx::JUMP) {
                        *slot = None;
                    }
                }
                if let Some(dst) = sub.row_at_mut(first + 1, pos, line) {
                    *dst = copy;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::parse_record;

    fn v1_file() -> Vec<u8> {
        let mut f = RAD_MAGIC.to_vec();
        f.push(0x10);
        f.push(6);
        // instrument 1
        f.push(1);
        f.extend_from_slice(&[0x21, 0x01, 0x10, 0x3F, 0xF4, 0xF2, 0x53, 0x74, 0x0B, 0x01, 0x00]);
        f.push(0);
        // orders
        f.extend_from_slice(&[2, 0, 1]);
        let pattern_at = f.len() + 64;
        f.extend_from_slice(&(pattern_at as u16).to_le_bytes());
        f.extend_from_slice(&[0; 62]);
        // line 0 (last), channel 0 (last), C#3, instrument 1 + vol slide down 5
        f.extend_from_slice(&[0x80, 0x80, 0x31, 0x1A, 0x05]);
        f
    }

    fn v2_file() -> Vec<u8> {
        let mut f = RAD_MAGIC.to_vec();
        f.push(0x21);
        f.push(6);
        f.push(0); // empty description
        f.extend_from_slice(&[1, 1, b'a']);
        // split 2+2, feedback 1 and 2
        f.extend_from_slice(&[0x04, 0x21, 0x00, 0x3F]);
        for op in 0..4u8 {
            f.extend_from_slice(&[op + 1, 0x10, 0xF0, 0x0F, 0]);
        }
        f.push(0);
        f.extend_from_slice(&[1, 0]);
        // pattern 0: line 0, channel 0 with note and instrument
        f.push(0);
        f.extend_from_slice(&4u16.to_le_bytes());
        f.extend_from_slice(&[0x80, 0xE0, 0x25, 0x01]);
        f.push(0xFF);
        f.push(0xFF);
        f
    }

    #[test]
    fn record_sizes_match_declared() {
        let zeros = [0u8; 16];
        assert!(parse_record::<InstrumentV1>(&zeros[..11]).is_ok());
        assert!(parse_record::<InstrumentV2>(&zeros[..4]).is_ok());
        assert!(parse_record::<OperatorV2>(&zeros[..5]).is_ok());
        assert!(parse_record::<OperatorV2>(&zeros[..4]).is_err());
    }

    #[test]
    fn slide_scaling() {
        let mut w = Warnings::new();
        let mut out = Emitter::new(8, &mut w);
        let mut row = Row::default();
        convert_effect(0, 5, 49, &mut row, &mut out);
        assert_eq!(row.effects[0], Some(Effect::new(fx::PORTA_VOL_SLIDE, 15)));
        let mut row = Row::default();
        convert_effect(0, 5, 99, &mut row, &mut out);
        assert_eq!(row.effects[0], Some(Effect::new(fx::PORTA_VOL_SLIDE, 0xF0)));
        let mut row = Row::default();
        convert_effect(0, 10, 60, &mut row, &mut out);
        assert_eq!(row.effects[0], Some(Effect::new(fx::VOL_SLIDE, 0x90)));
        // 50 sits between the ranges
        let mut row = Row::default();
        convert_effect(0, 10, 50, &mut row, &mut out);
        assert_eq!(row.effects[0], Some(Effect { cmd: fx::VOL_SLIDE, value: None }));
    }

    #[test]
    fn operator_commands_need_a_channel() {
        let mut w = Warnings::new();
        let mut out = Emitter::new(8, &mut w);
        let mut row = Row::default();
        convert_effect(0, 31, 0x10, &mut row, &mut out);
        assert!(row.is_empty());
        convert_effect(3, 31, 0x10, &mut row, &mut out);
        assert_eq!(row.effects[0], Some(Effect::new(0x14, 0x2F)));
        let mut row = Row::default();
        convert_effect(5, 22, 0x07, &mut row, &mut out);
        assert_eq!(row.effects[0], Some(Effect::new(fx::FM_MULT, 0x07)));
        let mut row = Row::default();
        convert_effect(1, 12, 0x50, &mut row, &mut out);
        assert_eq!(row.volume, Some(0x3F));
        convert_effect(1, 30, 12, &mut row, &mut out);
        assert_eq!(row.effects[0], Some(Effect::new(fx::FM_FEEDBACK, 0x12)));
    }

    #[test]
    fn description_codes() {
        let mut src = ByteSource::new(b"ab\x01\x03c\x00rest");
        assert_eq!(read_description(&mut src).unwrap(), "ab\n   c");
        assert_eq!(src.tell(), 7);
        assert!(read_description(&mut ByteSource::new(b"abc")).is_err());
    }

    #[test]
    fn riff_track_fills_forward() {
        let mut t = RiffTrack::default();
        t.0.insert(2, 10);
        t.0.insert(4, 20);
        let m = t.into_macro(63, 3).unwrap();
        assert_eq!(m.values, [63, 63, 10, 10, 20]);
        assert_eq!(m.speed, 3);
        assert!(RiffTrack::default().into_macro(0, 1).is_none());
    }

    #[test]
    fn v1_minimal() {
        let mut w = Warnings::new();
        let song = load_rad(&v1_file(), &LoadOptions::default(), &mut w).unwrap();
        let sub = song.main();
        assert_eq!(sub.channels.len(), 9);
        assert_eq!(sub.orders_len, 2);
        assert_eq!(sub.pat_len, 64);
        assert_eq!(song.instruments.len(), 1);
        let patch = song.instruments[0].fm_patch().unwrap();
        assert_eq!((patch.alg, patch.fb), (1, 5));
        // carrier is stored first
        assert_eq!((patch.op[1].mult, patch.op[0].mult), (1, 1));
        assert_eq!((patch.op[1].tl, patch.op[0].tl), (0x10, 0x3F));
        let row = sub.row_at(0, 0, 0).unwrap();
        assert_eq!(row.note, Note::On(60 + 1 + 36));
        assert_eq!(row.instrument, Some(0));
        assert_eq!(row.volume, Some(0x3F));
        assert_eq!(row.effects[0], Some(Effect::new(fx::VOL_SLIDE, 5)));
        // the slide stops on the next row
        assert_eq!(sub.row_at(0, 0, 1).unwrap().effects[0], Some(Effect::new(fx::VOL_SLIDE, 0)));
    }

    #[test]
    fn v2_split_instrument_mirrors_channel() {
        let mut w = Warnings::new();
        let song = load_rad(&v2_file(), &LoadOptions::default(), &mut w).unwrap();
        assert_eq!(song.systems[0].chip, Chip::Opl3);
        let sub = song.main();
        assert_eq!(sub.channels.len(), 18);
        assert_eq!(song.instruments.len(), 2);
        assert_eq!(song.instruments[0].name.as_str(), "a [first two operators]");
        assert_eq!(song.instruments[1].fm_patch().map(|p| p.fb), Some(2));
        let first = sub.row_at(0, 0, 0).unwrap();
        let second = sub.row_at(1, 0, 0).unwrap();
        assert_eq!(first.note, Note::On(60 + 5 + 24));
        assert_eq!(first.instrument, Some(0));
        assert_eq!(second.note, first.note);
        assert_eq!(second.instrument, Some(1));
    }

    #[test]
    fn truncated_files_fail_cleanly() {
        let full = v1_file();
        for cut in 0..full.len() {
            let mut w = Warnings::new();
            assert!(load_rad(&full[..cut], &LoadOptions::default(), &mut w).is_err());
        }
        let full = v2_file();
        for cut in 0..full.len() {
            let mut w = Warnings::new();
            assert!(load_rad(&full[..cut], &LoadOptions::default(), &mut w).is_err());
        }
    }

    #[test]
    fn bad_order_length() {
        let mut f = v1_file();
        let at = RAD_MAGIC.len() + 2 + 13;
        f[at] = 0;
        let mut w = Warnings::new();
        assert!(matches!(
            load_rad(&f, &LoadOptions::default(), &mut w),
            Err(FormatError::OutOfRange { .. })
        ));
    }
}
