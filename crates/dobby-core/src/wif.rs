//! Reader for WIF (Weaving Information File) patterns.
//!
//! WIF is an INI-style format. Only the sections needed to weave and thread
//! are read; everything else is ignored. All WIF indices are 1-based, while
//! the resulting [`ReducedPattern`] uses 0-based color and shaft indices.

use std::collections::{BTreeMap, HashMap};

use crate::error::PatternError;
use crate::pattern::{shaft_word_from_shaft_set, Pick, ReducedPattern, MAX_SHAFTS};

const DEFAULT_COLORS: [&str; 2] = ["#ffffff", "#000000"];

/// Largest warp or weft index accepted; tables are sized by the largest index.
pub const MAX_WIF_ITEMS: usize = 100_000;

/// Sections of a WIF file, keyed by lowercase section name.
#[derive(Debug, Default)]
struct WifFile {
    sections: HashMap<String, Vec<(String, String)>>,
}

impl WifFile {
    fn parse(text: &str) -> Result<Self, PatternError> {
        let mut file = WifFile::default();
        let mut current: Option<String> = None;
        for (line_index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| wif_error(line_index, "unterminated section header"))?;
                let name = name.trim().to_lowercase();
                file.sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some(section) = current.as_ref() else {
                return Err(wif_error(line_index, "entry before first section"));
            };
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| wif_error(line_index, "expected key=value"))?;
            if let Some(entries) = file.sections.get_mut(section) {
                entries.push((key.trim().to_lowercase(), value.trim().to_string()));
            }
        }
        Ok(file)
    }

    fn value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Read a section of `index=n1,n2,...` entries.
    fn int_table(&self, section: &str) -> Result<BTreeMap<usize, Vec<usize>>, PatternError> {
        let mut table = BTreeMap::new();
        let Some(entries) = self.sections.get(section) else {
            return Ok(table);
        };
        for (key, value) in entries {
            let index = parse_int(section, key)?;
            table.insert(index, parse_int_list(section, value)?);
        }
        Ok(table)
    }

    /// Read a section of `index=color` entries.
    fn color_index_table(&self, section: &str) -> Result<BTreeMap<usize, i32>, PatternError> {
        Ok(self
            .int_table(section)?
            .into_iter()
            .filter_map(|(index, values)| values.first().map(|&c| (index, c as i32)))
            .collect())
    }

    fn first_int(&self, section: &str, key: &str) -> Result<Option<i32>, PatternError> {
        match self.value(section, key) {
            Some(value) => Ok(parse_int_list(section, value)?.first().map(|&v| v as i32)),
            None => Ok(None),
        }
    }
}

/// Parse WIF text into a pattern named `name`.
pub fn parse_wif(name: &str, text: &str) -> Result<ReducedPattern, PatternError> {
    let wif = WifFile::parse(text)?;

    let threading_table = wif.int_table("threading")?;
    let num_warps = *threading_table
        .keys()
        .next_back()
        .ok_or_else(|| PatternError::Wif("no THREADING section".into()))?;
    check_item_count("warp", num_warps)?;

    let liftplan = wif.int_table("liftplan")?;
    let treadling = wif.int_table("treadling")?;
    let use_liftplan = !liftplan.is_empty();
    let num_wefts = if use_liftplan {
        liftplan.keys().next_back().copied()
    } else {
        treadling.keys().next_back().copied()
    }
    .ok_or_else(|| PatternError::Wif("no LIFTPLAN or TREADLING section".into()))?;
    check_item_count("weft", num_wefts)?;

    let color_table = read_color_table(&wif)?;

    let default_warp_color = wif.first_int("warp", "color")?.unwrap_or(1);
    let default_weft_color = wif.first_int("weft", "color")?.unwrap_or(2);
    let warp_color_table = wif.color_index_table("warp colors")?;
    let weft_color_table = wif.color_index_table("weft colors")?;
    let warp_colors = (1..=num_warps)
        .map(|warp| warp_color_table.get(&warp).copied().unwrap_or(default_warp_color) - 1)
        .collect();

    let shaft_sets: Vec<Vec<usize>> = if use_liftplan {
        (1..=num_wefts)
            .map(|weft| liftplan.get(&weft).cloned().unwrap_or_default())
            .collect()
    } else {
        let tieup = wif.int_table("tieup")?;
        (1..=num_wefts)
            .map(|weft| {
                let mut shafts: Vec<usize> = treadling
                    .get(&weft)
                    .into_iter()
                    .flatten()
                    .filter_map(|treadle| tieup.get(treadle))
                    .flatten()
                    .copied()
                    .collect();
                shafts.sort_unstable();
                shafts.dedup();
                shafts
            })
            .collect()
    };

    let num_shafts = shaft_sets
        .iter()
        .flatten()
        .copied()
        .filter(|&shaft| shaft > 0)
        .max()
        .ok_or_else(|| PatternError::Invalid("no shafts are raised".into()))?;
    if num_shafts > MAX_SHAFTS {
        return Err(PatternError::Invalid(format!(
            "pattern uses {num_shafts} shafts; at most {MAX_SHAFTS} are supported"
        )));
    }

    let rising_shed = wif
        .value("weaving", "rising shed")
        .map(parse_bool)
        .unwrap_or(true);
    let all_shafts = shaft_word_from_shaft_set(1..=num_shafts);
    let picks = shaft_sets
        .iter()
        .enumerate()
        .map(|(i, shafts)| {
            let word = shaft_word_from_shaft_set(shafts.iter().copied());
            Pick {
                color_index: weft_color_table
                    .get(&(i + 1))
                    .copied()
                    .unwrap_or(default_weft_color)
                    - 1,
                shaft_word: if rising_shed { word } else { all_shafts & !word },
            }
        })
        .collect();

    let threading = (1..=num_warps)
        .map(|warp| {
            threading_table
                .get(&warp)
                .and_then(|shafts| shafts.iter().copied().filter(|&s| s > 0).min())
                .map_or(-1, |shaft| shaft as i32 - 1)
        })
        .collect();

    let pattern = ReducedPattern::new(
        name,
        color_table,
        warp_colors,
        threading,
        picks,
        Pick {
            color_index: default_weft_color - 1,
            shaft_word: 0,
        },
    );
    pattern.validate()?;
    Ok(pattern)
}

fn read_color_table(wif: &WifFile) -> Result<Vec<String>, PatternError> {
    let Some(entries) = wif.sections.get("color table") else {
        return Ok(DEFAULT_COLORS.iter().map(|c| c.to_string()).collect());
    };
    let (min, max) = match wif.value("color palette", "range") {
        Some(range) => match parse_int_list("color palette", range)?.as_slice() {
            [min, max] => (*min as f64, *max as f64),
            _ => return Err(PatternError::Wif(format!("bad color range {range:?}"))),
        },
        None => (0.0, 255.0),
    };
    if max <= min {
        return Err(PatternError::Wif(format!("empty color range {min}..{max}")));
    }
    let scale = 255.0 / (max - min);

    let mut colors = BTreeMap::new();
    for (key, value) in entries {
        let index = parse_int("color table", key)?;
        let rgb = parse_int_list("color table", value)?;
        let [r, g, b] = rgb.as_slice() else {
            return Err(PatternError::Wif(format!("bad color {value:?}")));
        };
        let channel = |v: usize| ((v as f64 - min) * scale).round().clamp(0.0, 255.0) as u8;
        colors.insert(index, format!("#{:02x}{:02x}{:02x}", channel(*r), channel(*g), channel(*b)));
    }
    if colors.is_empty() {
        return Ok(DEFAULT_COLORS.iter().map(|c| c.to_string()).collect());
    }
    Ok(colors.into_values().collect())
}

fn check_item_count(kind: &str, count: usize) -> Result<(), PatternError> {
    if count > MAX_WIF_ITEMS {
        return Err(PatternError::Wif(format!(
            "{kind} number {count} is too large; at most {MAX_WIF_ITEMS} are supported"
        )));
    }
    Ok(())
}

fn parse_int(section: &str, text: &str) -> Result<usize, PatternError> {
    text.trim()
        .parse()
        .map_err(|_| PatternError::Wif(format!("[{section}]: {text:?} is not a number")))
}

fn parse_int_list(section: &str, text: &str) -> Result<Vec<usize>, PatternError> {
    text.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_int(section, item))
        .collect()
}

fn parse_bool(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "true" | "on" | "yes" | "1"
    )
}

fn wif_error(line_index: usize, msg: &str) -> PatternError {
    PatternError::Wif(format!("line {}: {}", line_index + 1, msg))
}
