//! Turn uploaded pattern files into [`ReducedPattern`]s.

use std::path::Path;

use crate::error::PatternError;
use crate::pattern::ReducedPattern;
use crate::wif::parse_wif;

/// Parse an uploaded pattern file.
///
/// The format is chosen from the suffix of `name`: `.wif` or `.json`
/// (a serialized [`ReducedPattern`]). The result is named `name`, has its
/// cursor at the start and uses `thread_group_size`.
pub fn parse_pattern(
    name: &str,
    data: &str,
    thread_group_size: usize,
) -> Result<ReducedPattern, PatternError> {
    let suffix = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let mut pattern = match suffix.as_str() {
        "wif" => parse_wif(name, data)?,
        "json" => serde_json::from_str::<ReducedPattern>(data)?,
        _ => return Err(PatternError::UnsupportedFileType(name.to_string())),
    };
    pattern.name = name.to_string();
    pattern.reset_cursor(thread_group_size);
    pattern.validate()?;
    log::debug!(
        "Parsed pattern {:?}: {} picks, {} ends",
        name,
        pattern.num_picks(),
        pattern.num_ends()
    );
    Ok(pattern)
}
