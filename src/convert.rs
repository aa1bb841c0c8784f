//! Strict conversion of textual instrument replies into numbers.

use std::str::FromStr;

use crate::{error::Result, InstrumentError};

/// Parse `text` into `T`.
///
/// Surrounding ASCII whitespace and NUL padding (instruments terminate replies
/// with `\n` and some interfaces pad buffers with `\0`) are ignored. Everything
/// in between must be a valid representation of `T`.
///
/// # Errors
/// [`InstrumentError::ConversionError`] if the content is not a valid `T`.
pub fn convert_to<T: FromStr>(text: &str) -> Result<T> {
    let trimmed = text.trim_matches(|c: char| c == char::from(0) || c.is_ascii_whitespace());
    trimmed
        .parse::<T>()
        .map_err(|_| InstrumentError::ConversionError {
            value: text.to_string(),
            target: std::any::type_name::<T>(),
        })
}
