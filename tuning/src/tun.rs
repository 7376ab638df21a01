use crate::error::TuningError;
use fancy_regex::Regex;
use lazy_static::lazy_static;
use log::{debug, warn};
use std::fs;
use std::path::Path;

pub const DEFAULT_START_NOTE: u8 = 36;
pub const DEFAULT_END_NOTE: u8 = 96;
pub const HIGHEST_NOTE: u8 = 127;

const SECTION_HEADER: &str = "[Exact Tuning]";

lazy_static! {
    // note [number]=[cents]
    static ref TUNING_LINE: Regex =
        Regex::new(r"^note\s+(\d+)=\s*(-?\d+(?:\.\d+)?)$").expect("Invalid tuning line pattern");
}

/// The inclusive span of notes an offset table covers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TuningRange {
    start: u8,
    end: u8,
}

impl TuningRange {
    pub fn new(start: u8, end: u8) -> Result<Self, TuningError> {
        if start > end || end > HIGHEST_NOTE {
            return Err(TuningError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn index_of(&self, note: i64) -> Option<usize> {
        if note < self.start as i64 || note > self.end as i64 {
            return None;
        }
        Some((note - self.start as i64) as usize)
    }
}

impl Default for TuningRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_START_NOTE,
            end: DEFAULT_END_NOTE,
        }
    }
}

/// Twelve tone equal temperament, 100 cents per semitone counted from note 0.
pub fn ideal_cents(note: i64) -> i64 {
    note * 100
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Section {
    Before,
    Inside,
    // A blank line ended the section, nothing afterwards is read.
    Finished,
}

/// Builds the cent offset table for `range` from the `[Exact Tuning]` section of a .tun file.
///
/// Anything that can't be understood is skipped, so a file without a usable section produces a
/// table of zeros rather than an error.
pub fn parse(content: &str, range: TuningRange) -> Vec<i32> {
    let content = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut offsets = vec![0; range.len()];
    let mut section = Section::Before;
    let mut mapped = 0;

    for line in content.split('\n') {
        if section == Section::Before && line.starts_with(SECTION_HEADER) {
            section = Section::Inside;
        }
        if section != Section::Inside {
            continue;
        }

        if line.is_empty() {
            section = Section::Finished;
            continue;
        }

        if let Some((note, cents)) = parse_tuning_line(line) {
            if let Some(index) = range.index_of(note) {
                let offset = cents.saturating_sub(ideal_cents(note));
                offsets[index] = offset.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                mapped += 1;
            }
        }
    }

    debug!("Mapped {} of {} notes from tuning data", mapped, range.len());
    offsets
}

/// Parses with the default 36..=96 note range.
pub fn offsets_from_tun(content: &str) -> Vec<i32> {
    parse(content, TuningRange::default())
}

pub fn read_tun_file(path: &Path, range: TuningRange) -> Result<Vec<i32>, TuningError> {
    let content = fs::read_to_string(path)?;
    Ok(parse(&content, range))
}

fn parse_tuning_line(line: &str) -> Option<(i64, i64)> {
    let captures = match TUNING_LINE.captures(line) {
        Ok(Some(captures)) => captures,
        Ok(None) => return None,
        Err(error) => {
            warn!("Unable to match tuning line {:?}: {}", line, error);
            return None;
        }
    };

    let note = captures.get(1)?.as_str().parse::<i64>().ok()?;
    let cents = captures.get(2)?.as_str().parse::<f64>().ok()?;

    // Halves round upwards, so -0.5 lands on 0 and 0.5 on 1.
    Some((note, (cents + 0.5).floor() as i64))
}
