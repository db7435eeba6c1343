//! Glyph metrics for the fixed annotation font set.
//!
//! Widths are the standard-14 AFM advance widths in 1/1000 em units for the
//! printable ASCII range. They drive both the on-screen text box auto-fit and
//! the occlusion-rectangle measurement at compose time, so the two always
//! agree on how wide a line of text renders.

use serde::{Deserialize, Serialize};

/// The enumerated font set available to text annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FontFamily {
    Helvetica,
    TimesRoman,
    Courier,
}

impl Default for FontFamily {
    fn default() -> Self {
        FontFamily::Helvetica
    }
}

impl FontFamily {
    /// PDF standard-14 base font name.
    pub fn base_name(&self) -> &'static str {
        match self {
            FontFamily::Helvetica => "Helvetica",
            FontFamily::TimesRoman => "Times-Roman",
            FontFamily::Courier => "Courier",
        }
    }

    fn missing_glyph_width(&self) -> u16 {
        match self {
            FontFamily::Helvetica => 556,
            FontFamily::TimesRoman => 500,
            FontFamily::Courier => 600,
        }
    }
}

const ASCII_FIRST: usize = 0x20;
const ASCII_LAST: usize = 0x7e;

// Helvetica AFM advance widths for 0x20..=0x7e.
#[rustfmt::skip]
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556,
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778,
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556,
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556,
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584,
];

// Times-Roman AFM advance widths for 0x20..=0x7e.
#[rustfmt::skip]
const TIMES_ROMAN_WIDTHS: [u16; 95] = [
    250, 333, 408, 500, 500, 833, 778, 180, 333, 333, 500, 564, 250, 333, 250, 278,
    500, 500, 500, 500, 500, 500, 500, 500, 500, 500, 278, 278, 564, 564, 564, 444,
    921, 722, 667, 667, 722, 611, 556, 722, 722, 333, 389, 722, 611, 889, 722, 722,
    556, 722, 667, 556, 611, 722, 722, 944, 722, 722, 611, 333, 278, 333, 469, 500,
    333, 444, 500, 444, 500, 444, 333, 500, 500, 278, 278, 500, 278, 778, 500, 500,
    500, 500, 333, 389, 278, 500, 500, 722, 500, 500, 444, 480, 200, 480, 541,
];

const COURIER_WIDTH: u16 = 600;

/// Advance width of a single character in 1/1000 em units.
pub fn advance(family: FontFamily, ch: char) -> u16 {
    let code = ch as usize;
    if !(ASCII_FIRST..=ASCII_LAST).contains(&code) {
        return family.missing_glyph_width();
    }
    match family {
        FontFamily::Helvetica => HELVETICA_WIDTHS[code - ASCII_FIRST],
        FontFamily::TimesRoman => TIMES_ROMAN_WIDTHS[code - ASCII_FIRST],
        FontFamily::Courier => COURIER_WIDTH,
    }
}

/// Rendered width of a single line at the given font size.
pub fn line_width(family: FontFamily, font_size: f32, line: &str) -> f32 {
    let units: u32 = line.chars().map(|ch| u32::from(advance(family, ch))).sum();
    units as f32 / 1000.0 * font_size
}

/// Width of the widest line and the number of lines in a text block.
///
/// Empty text still counts as one line so an empty annotation box keeps a
/// visible height.
pub fn measure_block(family: FontFamily, font_size: f32, text: &str) -> (f32, usize) {
    let mut widest = 0.0f32;
    let mut lines = 0usize;
    for line in text.split('\n') {
        lines += 1;
        widest = widest.max(line_width(family, font_size, line));
    }
    if lines == 0 {
        lines = 1;
    }
    (widest, lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn courier_is_monospaced() {
        assert_eq!(
            line_width(FontFamily::Courier, 10.0, "iii"),
            line_width(FontFamily::Courier, 10.0, "WWW")
        );
    }

    #[test]
    fn helvetica_narrow_vs_wide_glyphs() {
        let narrow = line_width(FontFamily::Helvetica, 12.0, "iii");
        let wide = line_width(FontFamily::Helvetica, 12.0, "WWW");
        assert!(narrow < wide);
    }

    #[test]
    fn measure_block_counts_lines_and_takes_widest() {
        let (w, lines) = measure_block(FontFamily::Helvetica, 10.0, "hi\nwider line\nok");
        assert_eq!(lines, 3);
        assert!((w - line_width(FontFamily::Helvetica, 10.0, "wider line")).abs() < 1e-6);
    }

    #[test]
    fn empty_text_is_one_line() {
        let (w, lines) = measure_block(FontFamily::TimesRoman, 14.0, "");
        assert_eq!(lines, 1);
        assert_eq!(w, 0.0);
    }

    #[test]
    fn non_ascii_uses_fallback_width() {
        let w = advance(FontFamily::Helvetica, 'é');
        assert_eq!(w, 556);
    }
}
