//! TFM Music Maker modules (`TFMfmtV2`).
//!
//! Six YM2612 channels. A short plain header is followed by a body packed
//! with the TFM run-length code; the body holds strings, the order list,
//! 255 instrument slots and then every pattern up to the highest one the
//! order list uses. Patterns are stored column by column.

use binrw::BinRead;
use mb_ir::{bounded_name, fx, Chip, FmKind, Instrument, Note, Row, Song};

use crate::codecs::rle;
use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::reader::{latin1, ByteSource, Record};
use crate::LoadOptions;

pub const TFM_MAGIC: &[u8] = b"TFMfmtV2";

const CHANNELS: usize = 6;
const INSTRUMENT_SLOTS: usize = 255;
const ROWS: usize = 256;
/// Five 256-byte columns and 1536 bytes of padding per channel.
const CHANNEL_SIZE: usize = 5 * ROWS + 1536;
const PATTERN_SIZE: usize = CHANNELS * CHANNEL_SIZE;
const FIXED_BODY: usize = 64 + 64 + 384 + 256 + INSTRUMENT_SLOTS * (16 + FmData::SIZE) + 256;
const MAX_INTERLEAVE: u8 = 8;
const KEY_OFF: u8 = 1;

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    magic: [u8; 8],
    speed_even: u8,
    speed_odd: u8,
    interleave: u8,
    order_count: u8,
    _loop_position: u8,
    created: u16,
    revised: u16,
    saves: u16,
}

impl Record for Header {
    const SIZE: usize = 19;
}

/// Register values as the editor shows them; levels and rates are stored
/// inverted.
#[derive(BinRead, Clone, Copy, Debug)]
#[br(little)]
struct OperatorData {
    mult: u8,
    dt: u8,
    tl: u8,
    rs: u8,
    ar: u8,
    dr: u8,
    d2r: u8,
    rr: u8,
    sl: u8,
    ssg_env: u8,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct FmData {
    alg: u8,
    fb: u8,
    ops: [OperatorData; 4],
}

impl Record for FmData {
    const SIZE: usize = 42;
}

impl FmData {
    fn instrument(&self, name: &str) -> Instrument {
        let mut ins = Instrument::fm(name, FmKind::Opn);
        if let Some(patch) = ins.fm_patch_mut() {
            patch.alg = self.alg & 7;
            patch.fb = self.fb & 7;
            for (op, data) in patch.op.iter_mut().zip(&self.ops) {
                op.mult = data.mult & 15;
                op.dt = data.dt & 7;
                op.tl = (data.tl ^ 0x7F) & 0x7F;
                op.rs = data.rs & 3;
                op.ar = (data.ar ^ 0x1F) & 0x1F;
                op.dr = (data.dr ^ 0x1F) & 0x1F;
                op.d2r = (data.d2r ^ 0x1F) & 0x1F;
                op.rr = (data.rr ^ 0x0F) & 0x0F;
                op.sl = data.sl & 15;
                op.ssg_env = data.ssg_env & 15;
            }
        }
        ins
    }
}

/// `dd.mm.yy` from the packed editor date.
fn format_date(date: u16) -> String {
    format!("{:02}.{:02}.{:02}", date >> 11, (date >> 7) & 0xF, date & 0x7F)
}

fn speeds(header: &Header) -> Vec<u8> {
    if header.speed_even == header.speed_odd {
        return vec![header.speed_even.max(1)];
    }
    let n = usize::from(header.interleave.clamp(1, MAX_INTERLEAVE));
    let mut speeds = vec![header.speed_even.max(1); n];
    speeds.resize(n * 2, header.speed_odd.max(1));
    speeds
}

/// Notes are stored as the bitwise complement of `octave * 12 + semitone`.
fn tfm_note(raw: u8) -> Note {
    match raw {
        0 => Note::None,
        KEY_OFF => Note::Off,
        _ => {
            let n = !raw;
            Note::from_octave_semitone((n / 12) as i8 - 1, n % 12)
        }
    }
}

fn command_name(cmd: u8) -> char {
    char::from_digit(u32::from(cmd), 36).map_or('?', |c| c.to_ascii_uppercase())
}

fn effect(cmd: u8, value: u8, row: &mut Row, out: &mut Emitter<'_>) {
    let mapped = match cmd {
        0 if value == 0 => return,
        0 => fx::ARPEGGIO,
        1 => fx::PORTA_UP,
        2 => fx::PORTA_DOWN,
        3 => fx::TONE_PORTA,
        4 => fx::VIBRATO,
        5 => fx::PORTA_VOL_SLIDE,
        6 => fx::VIBRATO_VOL_SLIDE,
        _ => {
            out.warn(format!("TFM effect {} not supported", command_name(cmd)));
            return;
        }
    };
    out.emit(row, mapped, value);
}

/// One channel's five columns into `rows`.
fn convert_channel(
    src: &mut ByteSource<'_>,
    rows: &mut [Row],
    instruments: &[Option<u16>],
    out: &mut Emitter<'_>,
) -> Result<()> {
    let notes = src.read(ROWS)?;
    let volumes = src.read(ROWS)?;
    let slots = src.read(ROWS)?;
    let cmds = src.read(ROWS)?;
    let values = src.read(ROWS)?;
    src.skip(CHANNEL_SIZE - 5 * ROWS)?;
    for (k, row) in rows.iter_mut().enumerate() {
        row.note = tfm_note(notes[k]);
        if volumes[k] != 0 {
            row.volume = Some(0x41 + (volumes[k] & 0x1F) * 2);
        }
        if slots[k] != 0 {
            match instruments.get(usize::from(slots[k]) - 1) {
                Some(&Some(ins)) => row.instrument = Some(ins),
                _ => out.warn(format!("instrument slot {} is empty", slots[k])),
            }
        }
        effect(cmds[k], values[k], row, out);
    }
    Ok(())
}

pub fn load_tfm(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    let header: Header = src.read_record()?;
    if header.magic != TFM_MAGIC {
        return Err(FormatError::invalid("not a TFM module"));
    }
    if header.order_count == 0 {
        return Err(FormatError::out_of_range("order count", 0));
    }
    tracing::info!("TFM Music Maker module, {} orders", header.order_count);
    tracing::debug!(
        "created {}, revised {}, saved {} times",
        format_date(header.created),
        format_date(header.revised),
        header.saves
    );
    if header.interleave > MAX_INTERLEAVE {
        warnings.push(format!("interleave factor {} reduced to {MAX_INTERLEAVE}", header.interleave));
    }

    let mut body = vec![0u8; FIXED_BODY + 256 * PATTERN_SIZE];
    let n = rle::decompress(&data[Header::SIZE..], &mut body);
    body.truncate(n);
    let mut src = ByteSource::new(&body);

    let author = latin1(src.read(64)?);
    let name = latin1(src.read(64)?);
    let notes = latin1(src.read(384)?).replace('\r', "");
    let order_list: [u8; 256] = src.read_array()?;
    let orders = &order_list[..usize::from(header.order_count)];
    for (pos, &index) in orders.iter().enumerate() {
        opts.check_order(pos, None, index)?;
    }

    let names = (0..INSTRUMENT_SLOTS)
        .map(|_| src.read_array::<16>())
        .collect::<Result<Vec<_>>>()?;
    let mut slots = Vec::with_capacity(INSTRUMENT_SLOTS);
    let mut instruments = Vec::new();
    for name in &names {
        let data: FmData = src.read_record()?;
        if name.iter().all(|&b| b == 0xFF) {
            slots.push(None);
            continue;
        }
        slots.push(Some(instruments.len() as u16));
        instruments.push(data.instrument(&latin1(name)));
    }
    tracing::debug!("{} instruments in use", instruments.len());

    let lengths: [u8; 256] = src.read_array()?;
    let rows_of = |pattern: u8| match lengths[usize::from(pattern)] {
        0 => ROWS,
        n => usize::from(n),
    };
    let pat_len = orders.iter().map(|&p| rows_of(p)).max().unwrap_or(ROWS);

    let mut song = Song::with_channels(&name, CHANNELS, pat_len);
    song.add_system(Chip::Ym2612);
    song.author = author;
    song.notes = notes;

    let mut out = Emitter::new(opts.max_effect_columns, warnings);
    let sub = song.main_mut();
    sub.hz = 50.0;
    sub.speeds = speeds(&header);
    sub.set_orders_len(orders.len());
    for (pos, &pattern) in orders.iter().enumerate() {
        sub.set_order_all(pos, pattern);
    }
    for (ch, channel) in sub.channels.iter_mut().enumerate() {
        channel.name = bounded_name(&format!("FM {}", ch + 1));
    }

    let max_pattern = orders.iter().copied().max().unwrap_or(0);
    for index in 0..=max_pattern {
        if !orders.contains(&index) {
            src.skip(PATTERN_SIZE)?;
            continue;
        }
        let rows = rows_of(index);
        for (ch, channel) in sub.channels.iter_mut().enumerate() {
            let mut stored = vec![Row::default(); ROWS];
            convert_channel(&mut src, &mut stored, &slots, &mut out)?;
            stored.truncate(pat_len);
            let pattern = channel.pattern_mut(index, pat_len);
            pattern.rows = stored;
            pattern.resize(pat_len);
            if ch == 0 && rows < pat_len {
                if let Some(last) = pattern.row_mut(rows - 1) {
                    out.emit(last, fx::BREAK, 0);
                }
            }
        }
    }
    sub.fit_effect_columns();

    song.instruments = instruments;
    Ok(song)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::parse_record;

    fn fx_of(row: &Row) -> Vec<(u8, u8)> {
        row.effects().map(|e| (e.cmd, e.param())).collect()
    }

    #[test]
    fn record_sizes_match_declared() {
        assert!(parse_record::<Header>(&[0; Header::SIZE]).is_ok());
        assert!(parse_record::<FmData>(&[0; FmData::SIZE]).is_ok());
    }

    #[test]
    fn notes_dates_and_speeds() {
        assert_eq!(tfm_note(0), Note::None);
        assert_eq!(tfm_note(KEY_OFF), Note::Off);
        // complement of 5 * 12 = C-4
        assert_eq!(tfm_note(!60), Note::On(108));
        assert_eq!(format_date((21 << 11) | (3 << 7) | 99), "21.03.99");

        let mut header = parse_record::<Header>(&[0; Header::SIZE]).unwrap();
        header.speed_even = 6;
        header.speed_odd = 6;
        assert_eq!(speeds(&header), [6]);
        header.speed_odd = 5;
        header.interleave = 2;
        assert_eq!(speeds(&header), [6, 6, 5, 5]);
        header.interleave = 20;
        assert_eq!(speeds(&header).len(), 16);
    }

    #[test]
    fn operator_fields_are_inverted() {
        let mut raw = [0u8; FmData::SIZE];
        raw[0] = 4;
        raw[1] = 5;
        raw[2..12].copy_from_slice(&[1, 3, 0x7F, 2, 0x1F, 0x10, 0, 0x0F, 7, 0]);
        let ins = parse_record::<FmData>(&raw).unwrap().instrument("bass");
        let patch = ins.fm_patch().unwrap();
        assert_eq!((patch.alg, patch.fb), (4, 5));
        let op = patch.op[0];
        assert_eq!((op.mult, op.dt, op.tl, op.rs), (1, 3, 0, 2));
        assert_eq!((op.ar, op.dr, op.d2r, op.rr, op.sl), (0, 0x0F, 0x1F, 0, 7));
    }

    /// Body bytes before RLE; the tests write it with every literal `0x80`
    /// doubled.
    fn pack(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len());
        for &b in body {
            out.push(b);
            if b == 0x80 {
                out.push(0x80);
            }
        }
        out
    }

    /// Two orders over patterns 0 and 2 (pattern 1 is skipped), one
    /// instrument in slot 2.
    fn module() -> Vec<u8> {
        let mut d = TFM_MAGIC.to_vec();
        d.extend_from_slice(&[6, 6, 1, 2, 0, 0, 0, 0, 0, 1, 0]);

        let mut body = Vec::new();
        let text = |s: &[u8], len: usize| {
            let mut field = s.to_vec();
            field.resize(len, 0);
            field
        };
        body.extend(text(b"someone", 64));
        body.extend(text(b"demo", 64));
        body.extend(text(b"line\r\nnext", 384));
        let mut orders = [0u8; 256];
        orders[1] = 2;
        body.extend_from_slice(&orders);
        for slot in 0..INSTRUMENT_SLOTS {
            if slot == 1 {
                body.extend(text(b"Piano", 16));
            } else {
                body.extend_from_slice(&[0xFF; 16]);
            }
        }
        body.resize(body.len() + INSTRUMENT_SLOTS * FmData::SIZE, 0);
        let mut lengths = [64u8; 256];
        lengths[2] = 32;
        body.extend_from_slice(&lengths);

        for pattern in 0..3 {
            for ch in 0..CHANNELS {
                let mut columns = vec![0u8; CHANNEL_SIZE];
                if pattern == 0 && ch == 0 {
                    columns[0] = !60;
                    columns[1] = KEY_OFF;
                    columns[ROWS] = 31;
                    columns[2 * ROWS] = 2;
                    columns[3 * ROWS] = 1;
                    columns[4 * ROWS] = 0x10;
                    columns[3 * ROWS + 1] = 0x0B;
                }
                body.extend_from_slice(&columns);
            }
        }
        d.extend_from_slice(&pack(&body));
        d
    }

    #[test]
    fn minimal_module() {
        let mut w = Warnings::new();
        let song = load_tfm(&module(), &LoadOptions::default(), &mut w).unwrap();
        assert_eq!(song.name, "demo");
        assert_eq!(song.author, "someone");
        assert_eq!(song.notes, "line\nnext");
        assert_eq!(song.systems[0].chip, Chip::Ym2612);
        assert_eq!(song.instruments.len(), 1);
        assert_eq!(song.instruments[0].name.as_str(), "Piano");
        assert!(w.contains("TFM effect B not supported"));

        let sub = song.main();
        assert_eq!(sub.pat_len, 64);
        assert_eq!(sub.speeds, [6]);
        assert_eq!(sub.channels[0].orders, [0, 2]);
        let row = |ch, pos, r| sub.row_at(ch, pos, r).unwrap();
        assert_eq!(row(0, 0, 0).note, Note::On(108));
        assert_eq!(row(0, 0, 0).volume, Some(0x7F));
        assert_eq!(row(0, 0, 0).instrument, Some(0));
        assert_eq!(fx_of(row(0, 0, 0)), [(fx::PORTA_UP, 0x10)]);
        assert_eq!(row(0, 0, 1).note, Note::Off);
        assert_eq!(fx_of(row(0, 1, 31)), [(fx::BREAK, 0)]);
        assert!(sub.channels[0].pattern(1).is_none());
    }

    #[test]
    fn truncated_body_fails() {
        let data = module();
        let mut w = Warnings::new();
        let result = load_tfm(&data[..data.len() / 2], &LoadOptions::default(), &mut w);
        assert!(matches!(result, Err(FormatError::Truncated { .. })));
        let result = load_tfm(&data[..10], &LoadOptions::default(), &mut w);
        assert!(matches!(result, Err(FormatError::Truncated { .. })));
    }
}
