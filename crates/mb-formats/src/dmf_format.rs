//! DefleMask modules (`.DelekDefleMask.`), versions up to 0x1B.
//!
//! One system per file, possibly a compound one (Genesis = YM2612 + PSG).
//! Effect numbers are already canonical; the work is in the many
//! per-version layout changes, which live in [`DmfLayout`].

use std::collections::BTreeSet;

use mb_ir::{
    bounded_name, fx, C64Params, ChipKind, Effect, FmKind, FmPatch, GbEnvelope, Instrument,
    InstrumentBody, Macro, MacroKind, Note, Row, Sample, SampleData, Song, Wavetable, ARP_FIXED,
};

use crate::effects::Emitter;
use crate::error::{FormatError, Result, Warnings};
use crate::reader::ByteSource;
use crate::versions::{
    dmf_system, dmf_system as sys, DmfLayout, DmfSystem, DMF_MAX_VERSION, DMF_SAMPLE_PITCHES,
    DMF_SAMPLE_RATES,
};
use crate::LoadOptions;

pub const DMF_MAGIC: &[u8] = b".DelekDefleMask.";

const MAX_PATTERN_LENGTH: usize = 256;
const MAX_ORDERS: usize = 127;
const MAX_WAVE_LENGTH: usize = 65;
const MAX_EFFECT_COLUMNS: u8 = 4;
/// Stored value of an empty row field.
const EMPTY: i16 = -1;

/// Tick rates of the YMU759 time base setting.
const YMU759_TICK_RATES: [f32; 6] = [248.0, 200.0, 100.0, 50.0, 25.0, 20.0];

/// Header, system and the decoder's position in the file.
struct Dmf<'a> {
    src: ByteSource<'a>,
    layout: DmfLayout,
    system: DmfSystem,
}

impl Dmf<'_> {
    fn is(&self, id: u8) -> bool {
        self.system.id == id
    }

    fn is_any(&self, ids: &[u8]) -> bool {
        ids.contains(&self.system.id)
    }

    fn opll(&self) -> bool {
        self.is_any(&[sys::SMS_OPLL, sys::NES_VRC7])
    }

    fn c64(&self) -> bool {
        self.is_any(&[sys::C64_6581, sys::C64_8580])
    }

    /// A macro value, 8-bit signed in old files.
    fn macro_value(&mut self) -> Result<i32> {
        if self.layout.wide_macros() {
            self.src.read_i32_le()
        } else {
            Ok(i32::from(self.src.read_i8()?))
        }
    }

    /// Length, values and (for a non-empty macro) the raw loop byte.
    fn read_macro(&mut self) -> Result<(Vec<i32>, u8)> {
        let len = self.src.read_u8()?;
        let values = (0..len).map(|_| self.macro_value()).collect::<Result<Vec<_>>>()?;
        let loop_pos = if len > 0 { self.src.read_u8()? } else { u8::MAX };
        Ok((values, loop_pos))
    }
}

fn make_macro(values: Vec<i32>, loop_pos: u8) -> Macro {
    let mut m = Macro::from_values(values);
    m.set_loop(usize::from(loop_pos));
    m
}

/// DMF note (1 = C#, 12 = C of the next octave) and octave.
fn dmf_note(note: i16, octave: i16) -> Note {
    let semitones = |n: i32| {
        i16::try_from(i32::from(octave) * 12 + n).map_or(Note::None, Note::from_c0_offset)
    };
    match note {
        0 if octave == 0 => Note::None,
        0 => semitones(0),
        1..=12 => semitones(i32::from(note)),
        100 => Note::Off,
        101 => Note::Release,
        102 => Note::MacroRelease,
        _ => Note::None,
    }
}

fn optional(value: i16) -> Option<u8> {
    (value >= 0).then(|| value.min(255) as u8)
}

/// Resample to the pitch setting and scale by `amp` percent of 50.
/// Eight-bit data is stored unsigned in 16-bit words.
fn resample(data: &[i16], pitch: usize, amp: u8, eight_bit: bool) -> Vec<i16> {
    let step = DMF_SAMPLE_PITCHES[pitch.min(DMF_SAMPLE_PITCHES.len() - 1)];
    let len = data.len() as f64;
    let scaled = (len / step).ceil() as usize;
    let mult = f32::from(amp) / 50.0;
    let mut out = Vec::with_capacity(scaled);
    let mut pos = 0.0;
    while pos < len && out.len() < scaled {
        let v = data[pos as usize];
        let v = if eight_bit {
            ((f32::from(v) - 128.0) * mult).clamp(-128.0, 127.0)
        } else {
            (f32::from(v) * mult).clamp(-32768.0, 32767.0)
        };
        out.push(v as i16);
        pos += step;
    }
    out.resize(scaled, 0);
    out
}

fn parse_hz(text: &str) -> Option<f32> {
    let digits: String = text.trim_start().chars().take_while(char::is_ascii_digit).collect();
    digits.parse::<u16>().ok().map(f32::from)
}

pub fn load_dmf(data: &[u8], opts: &LoadOptions, warnings: &mut Warnings) -> Result<Song> {
    let mut src = ByteSource::new(data);
    if src.read(DMF_MAGIC.len())? != DMF_MAGIC {
        return Err(FormatError::invalid("not a DefleMask module"));
    }
    let version = src.read_u8()?;
    if version > DMF_MAX_VERSION {
        return Err(FormatError::out_of_range("DMF version", version));
    }
    let layout = DmfLayout(version);
    let system_id = if layout.has_system() { src.read_u8()? } else { sys::YMU759 };
    let system = dmf_system(system_id)
        .ok_or_else(|| FormatError::invalid(format!("unknown DefleMask system {system_id:#04x}")))?;
    tracing::info!("DefleMask module version {version:#04x}, {}", system.name);
    let mut dmf = Dmf { src, layout, system };

    let (name, author) = if dmf.is(sys::YMU759) && version < 0x10 {
        let mut fields = (0..13).map(|_| dmf.src.read_pascal_string()).collect::<Result<Vec<_>>>()?;
        tracing::debug!(
            "YMU759 vendor {:?}, carrier {:?}, category {:?}, copyright {:?}",
            fields[0],
            fields[1],
            fields[2],
            fields[8]
        );
        let author = std::mem::take(&mut fields[4]);
        (std::mem::take(&mut fields[3]), author)
    } else {
        let name = dmf.src.read_pascal_string()?;
        (name, dmf.src.read_pascal_string()?)
    };
    tracing::debug!("{name:?} by {author:?}");

    let highlight = if layout.has_highlights() {
        (dmf.src.read_u8()?, dmf.src.read_u8()?)
    } else {
        (4, 16)
    };
    let mut time_base = dmf.src.read_u8()?;
    let mut speeds = vec![dmf.src.read_u8()?];
    let mut hz = 60.0;
    let mut custom_hz = false;
    if layout.has_tick_settings() {
        speeds.push(dmf.src.read_u8()?);
        hz = if dmf.src.read_u8()? != 0 { 60.0 } else { 50.0 };
        custom_hz = dmf.src.read_u8()? != 0;
    }
    if layout.has_custom_hz() {
        let text = dmf.src.read_string(3)?;
        if custom_hz {
            hz = parse_hz(&text).unwrap_or_else(|| {
                warnings.push(format!("invalid custom tick rate {text:?}"));
                60.0
            });
        }
    }
    let pat_len = if layout.wide_pattern_length() {
        let n = dmf.src.read_i32_le()?;
        usize::try_from(n).map_err(|_| FormatError::out_of_range("pattern length", n))?
    } else {
        usize::from(dmf.src.read_u8()?)
    };
    if pat_len == 0 || pat_len > MAX_PATTERN_LENGTH {
        return Err(FormatError::out_of_range("pattern length", pat_len as i64));
    }
    let orders_len = usize::from(dmf.src.read_u8()?);
    if orders_len == 0 || orders_len > MAX_ORDERS {
        return Err(FormatError::out_of_range("order count", orders_len as i64));
    }
    if layout.has_arp_tick() {
        let arp_tick = dmf.src.read_u8()?;
        tracing::debug!("arpeggio tick {arp_tick}");
    }
    if dmf.is(sys::YMU759) {
        hz = YMU759_TICK_RATES.get(usize::from(time_base)).copied().unwrap_or(248.0);
        time_base = 0;
        warnings.push("YMU759 playback is approximate");
    }
    tracing::debug!(
        "time base {time_base}, speeds {speeds:?}, {hz} Hz, {pat_len} rows, {orders_len} orders"
    );

    let channels = system.channels();
    let mut song = Song::with_channels(&name, channels, pat_len);
    song.author = author;
    for &(chip, volume) in system.chips {
        song.add_system(chip);
        if let Some(entry) = song.systems.last_mut() {
            entry.volume = f32::from(volume) / 100.0;
        }
    }
    song.compat.limit_slides = true;
    song.compat.linear_pitch = true;
    song.compat.ignore_jump_at_end = true;

    let sub = song.main_mut();
    sub.hz = hz;
    sub.highlight = highlight;
    sub.speeds = speeds
        .iter()
        .map(|&s| (u16::from(s) * (u16::from(time_base) + 1)).min(255) as u8)
        .collect();
    sub.set_orders_len(orders_len);

    // Per-channel starting instrument of the oldest pattern format.
    let mut column_instruments: Vec<u8> = (0..channels).map(|c| c as u8).collect();
    for ch in 0..channels {
        for pos in 0..orders_len {
            let index = dmf.src.read_u8()?;
            if index > 0x7F {
                return Err(FormatError::out_of_range(format!("pattern index at order {pos} on channel {ch}"), index));
            }
            opts.check_order(pos, Some(ch), index)?;
            sub.channels[ch].orders[pos] = index;
            if layout.has_pattern_names() {
                let name = dmf.src.read_pascal_string()?;
                sub.channels[ch].pattern_mut(index, pat_len).name = bounded_name(&name);
            }
        }
        if layout.has_column_instruments() && ch < 16 {
            column_instruments[ch] = dmf.src.read_u8()?;
        }
    }

    let ins_count = if layout.has_instrument_names() { usize::from(dmf.src.read_u8()?) } else { 16 };
    tracing::debug!("{ins_count} instruments");
    let mut instruments = Vec::with_capacity(ins_count);
    for index in 0..ins_count {
        instruments.push(read_instrument(&mut dmf, index, warnings)?);
    }

    if layout.has_wavetables() {
        song.wavetables = read_wavetables(&mut dmf)?;
    }

    let mut fds_instruments = BTreeSet::new();
    {
        let mut out = Emitter::new(opts.max_effect_columns, warnings);
        let sub = song.main_mut();
        for ch in 0..channels {
            let cols = if layout.has_effect_columns() { dmf.src.read_u8()? } else { 1 };
            if !(1..=MAX_EFFECT_COLUMNS).contains(&cols) {
                return Err(FormatError::out_of_range("effect columns", cols));
            }
            for pos in 0..orders_len {
                let index = sub.channels[ch].orders[pos];
                let pattern = sub.channels[ch].pattern_mut(index, pat_len);
                for (k, row) in pattern.rows.iter_mut().enumerate() {
                    *row = if layout.wide_rows() {
                        read_row(&mut dmf, ch, cols, &mut out)?
                    } else {
                        let start = (k == 0 && ch < 16).then(|| column_instruments[ch]);
                        read_legacy_row(&mut dmf, start)?
                    };
                    if dmf.is(sys::NES_FDS) && ch == 5 {
                        if let Some(ins) = row.instrument {
                            fds_instruments.insert(usize::from(ins));
                        }
                    }
                }
            }
            sub.channels[ch].effect_cols = cols;
        }
        let declared: Vec<u8> = sub.channels.iter().map(|c| c.effect_cols).collect();
        sub.fit_effect_columns();
        let max = out.max_cols() as u8;
        for (channel, cols) in sub.channels.iter_mut().zip(declared) {
            channel.effect_cols = channel.effect_cols.max(cols.min(max));
        }
    }
    for index in fds_instruments {
        if let Some(ins) = instruments.get_mut(index) {
            ins.body = InstrumentBody::Std(ChipKind::Fds);
        }
    }
    song.instruments = instruments;

    song.samples = read_samples(&mut dmf, warnings)?;
    if dmf.src.remaining() > 1 {
        tracing::debug!("{} bytes after the last sample", dmf.src.remaining());
    }
    Ok(song)
}

fn instrument_body(dmf: &Dmf<'_>, fm: bool) -> InstrumentBody {
    use sys::*;
    if fm {
        let kind = match dmf.system.id {
            ARCADE => FmKind::Opm,
            SMS_OPLL | NES_VRC7 => FmKind::Opll,
            YMU759 => FmKind::Opl,
            _ => FmKind::Opn,
        };
        return InstrumentBody::Fm(FmPatch::new(kind));
    }
    match dmf.system.id {
        GAME_BOY => InstrumentBody::GameBoy(GbEnvelope::default()),
        C64_6581 | C64_8580 => InstrumentBody::C64(C64Params::default()),
        NEO_GEO | NEO_GEO_EXT => InstrumentBody::Std(ChipKind::Ay),
        PC_ENGINE => InstrumentBody::Std(ChipKind::PcEngine),
        NES | NES_VRC7 | NES_FDS => InstrumentBody::Std(ChipKind::Nes),
        _ => InstrumentBody::Std(ChipKind::Standard),
    }
}

fn read_instrument(dmf: &mut Dmf<'_>, index: usize, warnings: &mut Warnings) -> Result<Instrument> {
    let layout = dmf.layout;
    let name = if layout.has_instrument_names() { dmf.src.read_pascal_string()? } else { String::new() };
    let fm = if layout.has_instrument_mode() {
        let mode = dmf.src.read_u8()?;
        if mode > 1 {
            warnings.push(format!("instrument {index}: unknown mode {mode}"));
        }
        mode != 0
    } else {
        true
    };
    tracing::debug!("instrument {index} {name:?}, {}", if fm { "FM" } else { "standard" });
    let mut ins = Instrument::new(&name, instrument_body(dmf, fm));
    if fm {
        if let InstrumentBody::Fm(patch) = &mut ins.body {
            read_fm(dmf, patch)?;
        }
    } else {
        read_std(dmf, &mut ins)?;
    }
    Ok(ins)
}

fn read_fm(dmf: &mut Dmf<'_>, patch: &mut FmPatch) -> Result<()> {
    let layout = dmf.layout;
    let src = &mut dmf.src;
    let legacy = layout.legacy_operators();
    let ops;
    if layout.has_extended_operators() {
        patch.alg = src.read_u8()?;
        if legacy {
            src.skip(1)?;
        }
        patch.fb = src.read_u8()?;
        if legacy {
            src.skip(1)?;
        }
        patch.fms = src.read_u8()?;
        ops = if legacy {
            src.skip(1)?;
            let declared = 2 + u16::from(src.read_u8()?) * 2;
            if dmf.system.id == sys::YMU759 { declared } else { 4 }
        } else {
            4
        };
        patch.ams = src.read_u8()?;
    } else {
        patch.alg = src.read_u8()?;
        src.skip(1)?;
        patch.fb = src.read_u8()?;
        src.skip(1)?;
        patch.fms = src.read_u8()?;
        src.skip(1)?;
        ops = 2 + u16::from(src.read_u8()?) * 2;
    }
    if ops != 2 && ops != 4 {
        return Err(FormatError::invalid(format!("FM instrument with {ops} operators")));
    }
    patch.ops = ops as u8;
    tracing::debug!("ALG {} FB {} FMS {} AMS {} OPS {ops}", patch.alg, patch.fb, patch.fms, patch.ams);

    let opll = dmf.opll();
    let mask = if opll { 15 } else { 0xFF };
    for j in 0..usize::from(patch.ops) {
        let src = &mut dmf.src;
        let op = &mut patch.op[j];
        op.am = src.read_u8()?;
        op.ar = src.read_u8()? & mask;
        if legacy {
            op.dam = src.read_u8()?;
        }
        op.dr = src.read_u8()? & mask;
        if legacy {
            op.dvb = src.read_u8()?;
            op.egt = src.read_u8()?;
            op.ksl = src.read_u8()?;
            if layout.has_ksr() {
                op.ksr = src.read_u8()?;
            }
        }
        op.mult = src.read_u8()?;
        op.rr = src.read_u8()?;
        op.sl = src.read_u8()?;
        if legacy {
            op.sus = src.read_u8()?;
        }
        op.tl = src.read_u8()?;
        if legacy {
            op.vib = src.read_u8()?;
            op.ws = src.read_u8()?;
        } else if opll {
            let preset = src.read_u8()?;
            if j == 0 {
                patch.opll_preset = preset;
            }
        } else {
            op.dt2 = src.read_u8()?;
        }
        if layout.has_extended_operators() {
            let op = &mut patch.op[j];
            if opll {
                op.ksr = src.read_u8()?;
                op.vib = src.read_u8()?;
                op.ksl = src.read_u8()?;
            } else {
                op.rs = src.read_u8()?;
                op.dt = src.read_u8()?;
                op.d2r = src.read_u8()?;
            }
            op.ssg_env = src.read_u8()?;
        }
    }

    if dmf.system.id == sys::YMU759 && patch.ops == 4 {
        patch.op.swap(1, 2);
        patch.alg = match patch.alg {
            1 => 2,
            2 => 1,
            a => a,
        };
    }
    Ok(())
}

fn read_std(dmf: &mut Dmf<'_>, ins: &mut Instrument) -> Result<()> {
    let layout = dmf.layout;
    let gb = dmf.is(sys::GAME_BOY);
    let mut volume = None;
    if !(gb && layout.has_gb_envelope()) {
        let (values, loop_pos) = dmf.read_macro()?;
        volume = Some(make_macro(values, loop_pos));
    }

    let (mut arp, arp_loop) = dmf.read_macro()?;
    let fixed = layout.has_arp_mode() && dmf.src.read_u8()? != 0;
    if fixed {
        arp.iter_mut().for_each(|v| *v ^= ARP_FIXED);
        // unlooped fixed sequences end on the base note
        if arp_loop == u8::MAX && arp.len() < 255 {
            arp.push(0);
        }
    } else {
        arp.iter_mut().for_each(|v| *v -= 12);
    }

    let (mut duty, duty_loop) = dmf.read_macro()?;
    let (mut wave, wave_loop) = dmf.read_macro()?;
    if dmf.is_any(&[sys::NEO_GEO, sys::NEO_GEO_EXT]) {
        wave.iter_mut().for_each(|v| *v += 1);
    }

    if dmf.c64() {
        let src = &mut dmf.src;
        let mut c64 = C64Params {
            triangle: src.read_u8()? != 0,
            saw: src.read_u8()? != 0,
            pulse: src.read_u8()? != 0,
            noise: src.read_u8()? != 0,
            attack: src.read_u8()?,
            decay: src.read_u8()?,
            sustain: src.read_u8()?,
            release: src.read_u8()?,
            duty: (u32::from(src.read_u8()?) * 4095 / 100).min(4095) as u16,
            ring_mod: src.read_u8()? != 0,
            osc_sync: src.read_u8()? != 0,
            to_filter: src.read_u8()? != 0,
            ..C64Params::default()
        };
        c64.vol_is_cutoff =
            if layout.wide_cutoff_flag() { src.read_i32_le()? != 0 } else { src.read_u8()? != 0 };
        c64.init_filter = src.read_u8()? != 0;
        c64.resonance = src.read_u8()?;
        c64.cutoff = (u32::from(src.read_u8()?) * 2047 / 100).min(2047) as u16;
        c64.high_pass = src.read_u8()? != 0;
        c64.band_pass = src.read_u8()? != 0;
        c64.low_pass = src.read_u8()? != 0;
        c64.ch3_off = src.read_u8()? != 0;

        if c64.vol_is_cutoff {
            if let Some(vol) = volume.take() {
                let mut cutoff = vol;
                cutoff.values.iter_mut().for_each(|v| *v = 18 - *v);
                ins.macros.set(MacroKind::Algorithm, cutoff);
            }
        }
        duty.iter_mut().for_each(|v| *v -= 12);
        ins.body = InstrumentBody::C64(c64);
    }

    if gb {
        let mut env = GbEnvelope::default();
        if layout.has_gb_envelope() {
            let src = &mut dmf.src;
            env.volume = src.read_u8()?;
            env.direction = src.read_u8()? != 0;
            env.length = src.read_u8()?;
            env.sound_length = src.read_u8()?;
            tracing::debug!("GB envelope {env:?}");
        } else if let Some(vol) = volume.as_ref().filter(|m| !m.is_empty()) {
            // approximate the software envelope with the hardware one
            let v = &vol.values;
            env.volume = v[0].clamp(0, 15) as u8;
            env.direction = v.get(1).is_some_and(|&next| v[0] < next);
            if v.last() == Some(&0) {
                env.sound_length = (v.len() * 2).min(255) as u8;
            }
        }
        ins.body = InstrumentBody::GameBoy(env);
    }

    if let Some(vol) = volume {
        ins.macros.set(MacroKind::Volume, vol);
    }
    ins.macros.set(MacroKind::Arpeggio, make_macro(arp, arp_loop));
    ins.macros.set(MacroKind::Duty, make_macro(duty, duty_loop));
    ins.macros.set(MacroKind::Wave, make_macro(wave, wave_loop));
    Ok(())
}

fn read_wavetables(dmf: &mut Dmf<'_>) -> Result<Vec<Wavetable>> {
    let count = dmf.src.read_u8()?;
    let max = match dmf.system.id {
        sys::GAME_BOY => 15,
        sys::NES_FDS => 63,
        _ => 31,
    };
    let mut waves = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        let len = dmf.src.read_i32_le()? as u8;
        if usize::from(len) > MAX_WAVE_LENGTH {
            return Err(FormatError::out_of_range("wavetable length", len));
        }
        tracing::debug!("wavetable {index}: {len} steps");
        let mut data = (0..len)
            .map(|_| dmf.macro_value().map(|v| v & max))
            .collect::<Result<Vec<_>>>()?;
        if dmf.is(sys::NES_FDS) && dmf.layout.narrow_fds_waves() {
            data.iter_mut().for_each(|v| *v *= 4);
        }
        waves.push(Wavetable::new(max, data));
    }
    // files sometimes hold one empty wavetable
    if waves.len() == 1 && waves[0].is_empty() {
        waves.clear();
    }
    Ok(waves)
}

/// A row of the current pattern format.
fn read_row(dmf: &mut Dmf<'_>, ch: usize, cols: u8, out: &mut Emitter<'_>) -> Result<Row> {
    let layout = dmf.layout;
    let src = &mut dmf.src;
    let note = src.read_i16_le()?;
    let mut octave = src.read_i16_le()?;
    let psg = dmf.system.id == sys::SMS || (dmf.system.id == sys::GENESIS && ch > 5);
    if layout.high_psg_octave() && psg && octave > 0 {
        octave -= 1;
    }
    if layout.legacy_gb_channels() && dmf.system.id == sys::GAME_BOY && ch == 3 && octave > 0 {
        octave -= 2;
    }
    if dmf.system.id == sys::YMU759 && note != 0 {
        octave += 2;
    }

    let mut volume = src.read_i16_le()?;
    if layout.full_range_volume() {
        volume >>= if ch > 5 { 4 } else { 1 };
    }
    if layout.legacy_gb_channels() && dmf.system.id == sys::GAME_BOY && ch == 2 && volume > 0 {
        volume = (volume & 3) * 5;
    }

    let mut row = Row { note: dmf_note(note, octave), volume: optional(volume), ..Row::default() };
    for col in 0..usize::from(cols) {
        let cmd = src.read_i16_le()?;
        let mut value = src.read_i16_le()?;
        if layout.coarse_e5() && cmd == i16::from(fx::FINE_PITCH) && value != EMPTY {
            value = 128 + (value - 128) / 4;
        }
        let Some(cmd) = optional(cmd) else { continue };
        let effect = Effect { cmd, value: optional(value) };
        if col < out.max_cols() && row.effects[col].is_none() {
            row.effects[col] = Some(effect);
        } else {
            out.place(&mut row, effect);
        }
    }
    row.instrument = optional(dmf.src.read_i16_le()?).map(u16::from);
    Ok(row)
}

/// A row of the byte-wide format used before version 0x09.
fn read_legacy_row(dmf: &mut Dmf<'_>, start_instrument: Option<u8>) -> Result<Row> {
    let src = &mut dmf.src;
    let note = src.read_u8()?;
    let mut octave = src.read_u8()?;
    if note != 0 {
        octave = octave.wrapping_add(2);
    }
    let [volume, cmd, value] = src.read_array::<3>()?;
    let absent = |b: u8| b == 0x80 || b == 0xFF;
    let mut row = Row {
        note: dmf_note(i16::from(note), i16::from(octave)),
        volume: (!absent(volume)).then_some(volume),
        instrument: start_instrument.map(u16::from),
        ..Row::default()
    };
    if !absent(cmd) {
        let value = (value != 0x80).then_some(value);
        row.effects[0] = Some(Effect { cmd, value });
    }
    if dmf.layout.has_instrument_names() {
        let ins = src.read_u8()?;
        if !absent(ins) {
            row.instrument = Some(u16::from(ins));
        }
    }
    Ok(row)
}

fn read_samples(dmf: &mut Dmf<'_>, warnings: &mut Warnings) -> Result<Vec<Sample>> {
    let layout = dmf.layout;
    let count = dmf.src.read_u8()?;
    let mut ymu_rate = 20;
    if !layout.has_sample_params() && count > 0 {
        ymu_rate = u32::from(dmf.src.read_u8()?);
    }
    let mut samples = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        let src = &mut dmf.src;
        let length = src.read_i32_le()?;
        let length = usize::try_from(length).map_err(|_| FormatError::out_of_range("sample length", length))?;
        let name = if layout.has_sample_names() { src.read_pascal_string()? } else { String::new() };
        let mut sample = Sample::new(&name);
        sample.rate = 22050;
        let (mut pitch, mut amp) = (5, 50);
        if layout.has_sample_params() {
            let rate = usize::from(src.read_u8()?);
            sample.rate = DMF_SAMPLE_RATES[rate.min(DMF_SAMPLE_RATES.len() - 1)];
            pitch = usize::from(src.read_u8()?);
            amp = src.read_u8()?;
        }
        if layout.adpcm_samples() {
            sample.rate = ymu_rate * 400;
        }
        sample.center_rate = sample.rate;
        let mut eight_bit = false;
        if layout.has_sample_depth() {
            match src.read_u8()? {
                8 => eight_bit = true,
                16 => {}
                depth => warnings.push(format!("sample {index}: unknown depth {depth}, read as 16-bit")),
            }
        }
        let cut = if layout.has_sample_cut() {
            Some((src.read_i32_le()?, src.read_i32_le()?))
        } else {
            None
        };
        tracing::debug!("sample {index} {name:?}: {length} frames at {} Hz", sample.rate);

        if length > 0 && layout.adpcm_samples() {
            src.skip(length)?;
            warnings.push("YMZ ADPCM sample data not supported");
        } else if length > 0 {
            let bytes = if layout.byte_sample_length() { src.read(length)? } else { src.read(length * 2)? };
            let frames: Vec<i16> =
                bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
            let mut data = resample(&frames, pitch, amp, eight_bit);
            if let Some((start, end)) = cut {
                let in_range = |v: i32| usize::try_from(v).ok().filter(|&v| v <= data.len());
                let (Some(start), Some(end)) = (in_range(start), in_range(end)) else {
                    return Err(FormatError::out_of_range("sample cut", start.min(end)));
                };
                if end < start {
                    return Err(FormatError::out_of_range("sample cut end", end as i64));
                }
                data = data[start..end].to_vec();
            }
            sample.data = if eight_bit {
                SampleData::Pcm8(data.iter().map(|&v| v as i8).collect())
            } else {
                SampleData::Pcm16(data)
            };
        }
        samples.push(sample);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_ir::Chip;

    #[test]
    fn notes() {
        assert_eq!(dmf_note(0, 0), Note::None);
        assert_eq!(dmf_note(12, 3), Note::On(108));
        assert_eq!(dmf_note(0, 4), Note::On(108));
        assert_eq!(dmf_note(1, 4), Note::On(109));
        assert_eq!(dmf_note(100, 0), Note::Off);
        assert_eq!(dmf_note(101, 0), Note::Release);
        assert_eq!(dmf_note(50, 2), Note::None);
        assert_eq!(dmf_note(5, i16::MAX), Note::None);
    }

    #[test]
    fn resampling() {
        let data = [100, 200, 300, 400];
        assert_eq!(resample(&data, 5, 50, false), data);
        assert_eq!(resample(&data, 6, 50, false), [100, 300]);
        assert_eq!(resample(&data, 4, 100, false), [200, 200, 400, 400, 600, 600, 800, 800]);
        assert_eq!(resample(&[0x80, 0xFF, 0], 5, 50, true), [0, 127, -128]);
        assert_eq!(resample(&[i16::MAX], 5, 100, false), [i16::MAX]);
    }

    #[test]
    fn custom_tick_rates() {
        assert_eq!(parse_hz("75\0"), Some(75.0));
        assert_eq!(parse_hz(" 50"), Some(50.0));
        assert_eq!(parse_hz("abc"), None);
    }

    struct Builder {
        d: Vec<u8>,
    }

    impl Builder {
        fn u8(&mut self, v: u8) -> &mut Self {
            self.d.push(v);
            self
        }
        fn i16(&mut self, v: i16) -> &mut Self {
            self.d.extend_from_slice(&v.to_le_bytes());
            self
        }
        fn i32(&mut self, v: i32) -> &mut Self {
            self.d.extend_from_slice(&v.to_le_bytes());
            self
        }
        fn text(&mut self, s: &str) -> &mut Self {
            self.d.push(s.len() as u8);
            self.d.extend_from_slice(s.as_bytes());
            self
        }
    }

    /// Version 0x1B file for `system` with two orders over patterns 0 and 1,
    /// one standard instrument, one wave and one 8-bit sample.
    fn module(system: u8) -> Vec<u8> {
        let channels = dmf_system(system).unwrap().channels();
        let mut b = Builder { d: DMF_MAGIC.to_vec() };
        b.u8(DMF_MAX_VERSION).u8(system).text("Song").text("Me");
        b.u8(4).u8(16); // highlights
        b.u8(0).u8(6).u8(3).u8(1).u8(0); // time base, speeds, 60 Hz, no custom rate
        b.d.extend_from_slice(b"60\0");
        b.i32(8).u8(2); // rows, orders
        for _ in 0..channels {
            b.u8(0).text("intro").u8(1).text("");
        }

        b.u8(1).text("Lead").u8(0);
        if system != sys::GAME_BOY {
            b.u8(3).i32(15).i32(10).i32(5).u8(1); // volume, loop at 1
        }
        b.u8(2).i32(12).i32(19).u8(0xFF).u8(0); // relative arpeggio
        b.u8(0).u8(0); // duty, wave
        if system == sys::GAME_BOY {
            b.u8(12).u8(0).u8(3).u8(0);
        }

        b.u8(1).i32(4).i32(0).i32(40).i32(15).i32(7);

        for ch in 0..channels {
            b.u8(2);
            for pos in 0..2 {
                for row in 0..8 {
                    if ch == 0 && pos == 0 && row == 0 {
                        b.i16(12).i16(3).i16(0x0F).i16(0xE5).i16(0x80).i16(0x0D).i16(EMPTY).i16(0);
                    } else if ch == 0 && pos == 1 && row == 2 {
                        b.i16(100).i16(0).i16(EMPTY).i16(0x12).i16(0x34).i16(EMPTY).i16(EMPTY).i16(EMPTY);
                    } else {
                        b.i16(0).i16(0).i16(EMPTY);
                        b.i16(EMPTY).i16(EMPTY).i16(EMPTY).i16(EMPTY).i16(EMPTY);
                    }
                }
            }
        }

        b.u8(1).i32(4).text("kick").u8(4).u8(5).u8(50).u8(8).i32(1).i32(4);
        for v in [0x80i16, 0x90, 0x70, 0x80] {
            b.i16(v);
        }
        b.d
    }

    #[test]
    fn genesis_module() {
        let mut w = Warnings::new();
        let song = load_dmf(&module(sys::GENESIS), &LoadOptions::default(), &mut w).unwrap();
        assert!(w.is_empty(), "{:?}", w.iter().collect::<Vec<_>>());
        assert_eq!(song.name, "Song");
        assert_eq!(song.author, "Me");
        let chips: Vec<_> = song.systems.iter().map(|s| s.chip).collect();
        assert_eq!(chips, [Chip::Ym2612, Chip::Sms]);
        assert_eq!(song.systems[1].volume, 0.5);
        assert!(song.compat.limit_slides);

        let sub = song.main();
        assert_eq!(sub.channels.len(), 10);
        assert_eq!(sub.speeds, [6, 3]);
        assert_eq!(sub.hz, 60.0);
        assert_eq!(sub.pat_len, 8);
        assert_eq!(sub.channels[0].orders, [0, 1]);
        assert_eq!(sub.channels[0].pattern(0).unwrap().name.as_str(), "intro");
        assert_eq!(sub.channels[0].effect_cols, 2);

        let first = sub.row_at(0, 0, 0).unwrap();
        assert_eq!(first.note, Note::On(108));
        assert_eq!(first.volume, Some(0x0F));
        assert_eq!(first.instrument, Some(0));
        assert_eq!(first.effects[0], Some(Effect::new(fx::FINE_PITCH, 0x80)));
        assert_eq!(first.effects[1], Some(Effect { cmd: fx::BREAK, value: None }));
        let off = sub.row_at(0, 1, 2).unwrap();
        assert_eq!(off.note, Note::Off);
        assert_eq!(off.effects[0], Some(Effect::new(0x12, 0x34)));
        assert!(sub.row_at(3, 1, 5).unwrap().is_empty());

        let ins = &song.instruments[0];
        assert_eq!(ins.name.as_str(), "Lead");
        assert_eq!(ins.body, InstrumentBody::Std(ChipKind::Standard));
        let vol = ins.macros.get(MacroKind::Volume).unwrap();
        assert_eq!(vol.values, [15, 10, 5]);
        assert_eq!(vol.loop_start, Some(1));
        assert_eq!(ins.macros.get(MacroKind::Arpeggio).unwrap().values, [0, 7]);
        assert!(ins.macros.get(MacroKind::Duty).is_none());

        assert_eq!(song.wavetables.len(), 1);
        assert_eq!(song.wavetables[0].data, [0, 8, 15, 7]);

        let kick = &song.samples[0];
        assert_eq!(kick.name.as_str(), "kick");
        assert_eq!(kick.rate, 22050);
        assert_eq!(kick.data, SampleData::Pcm8(vec![16, -16, 0]));
    }

    #[test]
    fn game_boy_envelope() {
        let mut w = Warnings::new();
        let song = load_dmf(&module(sys::GAME_BOY), &LoadOptions::default(), &mut w).unwrap();
        assert_eq!(song.systems[0].chip, Chip::GameBoy);
        let ins = &song.instruments[0];
        let InstrumentBody::GameBoy(env) = ins.body else { panic!("not a GB instrument") };
        assert_eq!((env.volume, env.direction, env.length), (12, false, 3));
        assert!(ins.macros.get(MacroKind::Volume).is_none());
        assert_eq!(song.wavetables[0].max, 15);
        assert_eq!(song.wavetables[0].data, [0, 8, 15, 7]);
    }

    #[test]
    fn order_past_pattern_bound() {
        let mut w = Warnings::new();
        let opts = LoadOptions { max_patterns: 16, ..LoadOptions::default() };
        let mut data = module(sys::SMS);
        // second order of the second channel
        assert_eq!(data[57], 1);
        data[57] = 20;
        let err = load_dmf(&data, &opts, &mut w).unwrap_err();
        assert_eq!(err, FormatError::out_of_range("pattern index at order 1 on channel 1", 20));
        assert!(load_dmf(&data, &LoadOptions::default(), &mut w).is_ok());

        data[57] = 0x80;
        let err = load_dmf(&data, &LoadOptions::default(), &mut w).unwrap_err();
        assert_eq!(err, FormatError::out_of_range("pattern index at order 1 on channel 1", 0x80));
    }

    #[test]
    fn rejects_bad_headers() {
        let mut w = Warnings::new();
        let opts = LoadOptions::default();
        let mut data = module(sys::SMS);
        data[16] = DMF_MAX_VERSION + 1;
        assert!(matches!(load_dmf(&data, &opts, &mut w), Err(FormatError::OutOfRange { .. })));

        let mut data = module(sys::SMS);
        data[17] = 0x55;
        assert!(matches!(load_dmf(&data, &opts, &mut w), Err(FormatError::InvalidHeader(_))));

        let data = module(sys::SMS);
        assert!(matches!(
            load_dmf(&data[..data.len() - 3], &opts, &mut w),
            Err(FormatError::Truncated { .. })
        ));
    }
}
