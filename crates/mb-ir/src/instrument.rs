//! Instrument, FM patch and macro types.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use arrayvec::ArrayString;

/// Flag set on arpeggio macro values that hold a fixed note.
pub const ARP_FIXED: i32 = 1 << 30;

/// An instrument definition.
#[derive(Clone, Debug, PartialEq)]
pub struct Instrument {
    /// Instrument name
    pub name: ArrayString<64>,
    /// Type tag and its parameter block
    pub body: InstrumentBody,
    /// Per-tick macros
    pub macros: Macros,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            name: ArrayString::new(),
            body: InstrumentBody::Std(ChipKind::Standard),
            macros: Macros::default(),
        }
    }
}

impl Instrument {
    /// Create a new instrument with a given body.
    pub fn new(name: &str, body: InstrumentBody) -> Self {
        Self {
            name: crate::pattern::bounded_name(name),
            body,
            macros: Macros::default(),
        }
    }

    /// Default FM instrument for a chip family.
    pub fn fm(name: &str, kind: FmKind) -> Self {
        Self::new(name, InstrumentBody::Fm(FmPatch::new(kind)))
    }

    /// Sample-playback instrument starting on one sample.
    pub fn sampled(name: &str, sample: u16) -> Self {
        Self::new(
            name,
            InstrumentBody::Sample(SampleMap { initial_sample: Some(sample), note_map: None }),
        )
    }

    pub fn fm_patch(&self) -> Option<&FmPatch> {
        match &self.body {
            InstrumentBody::Fm(p) => Some(p),
            _ => None,
        }
    }

    pub fn fm_patch_mut(&mut self) -> Option<&mut FmPatch> {
        match &mut self.body {
            InstrumentBody::Fm(p) => Some(p),
            _ => None,
        }
    }
}

/// Instrument type tag with its parameter block.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrumentBody {
    /// FM operator set
    Fm(FmPatch),
    /// Sample playback
    Sample(SampleMap),
    /// Chip driven purely by macros
    Std(ChipKind),
    /// Game Boy hardware envelope
    GameBoy(GbEnvelope),
    /// SID voice parameters
    C64(C64Params),
}

/// FM chip family an FM patch targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FmKind {
    /// OPL2/OPL3 melodic
    #[default]
    Opl,
    /// OPL rhythm mode voice
    OplDrums,
    /// OPN family (YM2612, YM2610)
    Opn,
    /// OPM (YM2151)
    Opm,
    /// OPLL (YM2413, VRC7)
    Opll,
}

/// Macro-only chip families.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChipKind {
    #[default]
    Standard,
    Sms,
    PcEngine,
    Nes,
    Fds,
    Vrc6,
    N163,
    Mmc5,
    Ay,
}

/// A 2- or 4-operator FM patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FmPatch {
    pub kind: FmKind,
    pub alg: u8,
    pub fb: u8,
    pub fms: u8,
    pub ams: u8,
    /// Operator count in use (2 or 4)
    pub ops: u8,
    pub opll_preset: u8,
    pub op: [FmOperator; 4],
}

impl FmPatch {
    /// Zeroed register set for a chip family. OPL starts 2-op, the rest 4-op.
    pub fn new(kind: FmKind) -> Self {
        Self {
            kind,
            alg: 0,
            fb: 0,
            fms: 0,
            ams: 0,
            ops: match kind {
                FmKind::Opl | FmKind::OplDrums | FmKind::Opll => 2,
                FmKind::Opn | FmKind::Opm => 4,
            },
            opll_preset: 0,
            op: [FmOperator::default(); 4],
        }
    }
}

impl Default for FmPatch {
    fn default() -> Self {
        Self::new(FmKind::Opl)
    }
}

/// One FM operator. Field widths follow the chip registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FmOperator {
    pub enable: bool,
    pub am: u8,
    pub ar: u8,
    pub dr: u8,
    pub mult: u8,
    pub rr: u8,
    pub sl: u8,
    pub tl: u8,
    pub dt2: u8,
    pub rs: u8,
    pub dt: u8,
    pub d2r: u8,
    pub ssg_env: u8,
    pub dam: u8,
    pub dvb: u8,
    pub egt: u8,
    pub ksl: u8,
    pub sus: u8,
    pub vib: u8,
    pub ws: u8,
    pub ksr: u8,
}

impl Default for FmOperator {
    fn default() -> Self {
        Self {
            enable: true,
            am: 0,
            ar: 0,
            dr: 0,
            mult: 0,
            rr: 0,
            sl: 0,
            tl: 0,
            dt2: 0,
            rs: 0,
            dt: 0,
            d2r: 0,
            ssg_env: 0,
            dam: 0,
            dvb: 0,
            egt: 0,
            ksl: 0,
            sus: 0,
            vib: 0,
            ws: 0,
            ksr: 0,
        }
    }
}

/// Sample instrument: start sample plus optional per-note mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleMap {
    pub initial_sample: Option<u16>,
    /// 120 entries when present
    pub note_map: Option<Vec<NoteMapEntry>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoteMapEntry {
    pub sample: Option<u16>,
    pub note: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GbEnvelope {
    pub volume: u8,
    /// true = grow
    pub direction: bool,
    pub length: u8,
    pub sound_length: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct C64Params {
    pub triangle: bool,
    pub saw: bool,
    pub pulse: bool,
    pub noise: bool,
    pub attack: u8,
    pub decay: u8,
    pub sustain: u8,
    pub release: u8,
    pub duty: u16,
    pub ring_mod: bool,
    pub osc_sync: bool,
    pub to_filter: bool,
    pub init_filter: bool,
    pub resonance: u8,
    pub cutoff: u16,
    pub low_pass: bool,
    pub band_pass: bool,
    pub high_pass: bool,
    pub ch3_off: bool,
    pub vol_is_cutoff: bool,
    pub duty_is_abs: bool,
    pub filter_is_abs: bool,
}

/// Which parameter a macro drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MacroKind {
    Volume,
    Arpeggio,
    Duty,
    Wave,
    Pitch,
    Ex1,
    Ex2,
    Ex3,
    Algorithm,
    Feedback,
    Fms,
    Ams,
    PanLeft,
    PanRight,
    PhaseReset,
    /// Per-operator macro, operator 0-3
    Op(u8, OpMacro),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpMacro {
    Am,
    Ar,
    Dr,
    Mult,
    Rr,
    Sl,
    Tl,
    Dt2,
    Rs,
    Dt,
    D2r,
    Ssg,
    Dam,
    Dvb,
    Egt,
    Ksl,
    Sus,
    Vib,
    Ws,
    Ksr,
}

/// Value interpretation of a macro.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MacroMode {
    #[default]
    Absolute,
    Relative,
}

/// A per-tick value sequence with optional loop and release points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Macro {
    pub values: Vec<i32>,
    pub loop_start: Option<u8>,
    pub release: Option<u8>,
    pub speed: u8,
    pub delay: u8,
    pub mode: MacroMode,
}

impl Default for Macro {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            loop_start: None,
            release: None,
            speed: 1,
            delay: 0,
            mode: MacroMode::Absolute,
        }
    }
}

impl Macro {
    pub fn from_values(values: Vec<i32>) -> Self {
        Self { values, ..Self::default() }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Set loop start, ignoring positions past the end.
    pub fn set_loop(&mut self, pos: usize) {
        self.loop_start = (pos < self.values.len()).then_some(pos as u8);
    }

    /// Set release point, ignoring positions past the end.
    pub fn set_release(&mut self, pos: usize) {
        self.release = (pos < self.values.len()).then_some(pos as u8);
    }
}

/// Macro set keyed by target parameter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Macros(BTreeMap<MacroKind, Macro>);

impl Macros {
    pub fn get(&self, kind: MacroKind) -> Option<&Macro> {
        self.0.get(&kind)
    }

    /// Get or create the macro for `kind`.
    pub fn entry(&mut self, kind: MacroKind) -> &mut Macro {
        self.0.entry(kind).or_default()
    }

    pub fn set(&mut self, kind: MacroKind, m: Macro) {
        if m.is_empty() {
            self.0.remove(&kind);
        } else {
            self.0.insert(kind, m);
        }
    }

    pub fn remove(&mut self, kind: MacroKind) -> Option<Macro> {
        self.0.remove(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MacroKind, &Macro)> {
        self.0.iter().map(|(k, m)| (*k, m))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opl_patch_is_two_op() {
        let ins = Instrument::fm("bass", FmKind::Opl);
        assert_eq!(ins.fm_patch().map(|p| p.ops), Some(2));
        assert_eq!(FmPatch::new(FmKind::Opn).ops, 4);
    }

    #[test]
    fn macro_loop_bounds() {
        let mut m = Macro::from_values(alloc::vec![1, 2, 3]);
        m.set_loop(1);
        m.set_release(3);
        assert_eq!(m.loop_start, Some(1));
        assert_eq!(m.release, None);
    }

    #[test]
    fn empty_macro_not_stored() {
        let mut macros = Macros::default();
        macros.set(MacroKind::Volume, Macro::default());
        assert!(macros.is_empty());
        macros.entry(MacroKind::Op(1, OpMacro::Tl)).values.push(63);
        assert_eq!(macros.len(), 1);
        assert_eq!(
            macros.get(MacroKind::Op(1, OpMacro::Tl)).map(|m| m.values.clone()),
            Some(alloc::vec![63])
        );
    }
}
