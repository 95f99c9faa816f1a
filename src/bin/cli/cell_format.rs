//! Text rendering of pattern rows.

use mb_ir::{Effect, Note, Row};

const NAMES: [&str; 12] = ["C-", "C#", "D-", "D#", "E-", "F-", "F#", "G-", "G#", "A-", "A#", "B-"];

pub fn format_note(note: Note) -> String {
    match (note, note.octave(), note.semitone()) {
        (Note::None, ..) => "...".to_string(),
        (Note::Off, ..) => "OFF".to_string(),
        (Note::Release, ..) => "===".to_string(),
        (Note::MacroRelease, ..) => "REL".to_string(),
        (Note::On(_), Some(octave), Some(semi)) if octave < 0 => {
            format!("{}{}", &NAMES[usize::from(semi)][..1], octave)
        }
        (Note::On(_), Some(octave), Some(semi)) => format!("{}{}", NAMES[usize::from(semi)], octave),
        (Note::On(_), ..) => "???".to_string(),
    }
}

fn hex_or_dots(v: Option<impl Into<u32>>, width: usize) -> String {
    match v {
        Some(v) => {
            let v: u32 = v.into();
            format!("{v:0width$X}")
        }
        None => ".".repeat(width),
    }
}

pub fn format_effect(effect: Option<Effect>) -> String {
    match effect {
        Some(e) => format!("{:02X}{}", e.cmd, hex_or_dots(e.value, 2)),
        None => "....".to_string(),
    }
}

/// Note, instrument, volume and the first `cols` effect slots.
pub fn format_row(row: &Row, cols: usize) -> String {
    let mut out = format!(
        "{} {} {}",
        format_note(row.note),
        hex_or_dots(row.instrument, 2),
        hex_or_dots(row.volume, 2),
    );
    for slot in row.effects.iter().take(cols) {
        out.push(' ');
        out.push_str(&format_effect(*slot));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes() {
        assert_eq!(format_note(Note::On(108)), "C-4");
        assert_eq!(format_note(Note::On(61)), "C#0");
        assert_eq!(format_note(Note::On(57)), "A-1");
        assert_eq!(format_note(Note::None), "...");
        assert_eq!(format_note(Note::Off), "OFF");
    }

    #[test]
    fn rows() {
        let mut row = Row { note: Note::On(117), instrument: Some(0x1F), ..Row::default() };
        row.effects[0] = Some(Effect::new(0x0A, 0x0F));
        row.effects[1] = Some(Effect { cmd: 0xEC, value: None });
        assert_eq!(format_row(&row, 3), "A-4 1F .. 0A0F EC.. ....");
        assert_eq!(format_row(&Row::default(), 1), "... .. .. ....");
    }
}
