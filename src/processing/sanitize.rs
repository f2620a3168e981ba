//! Helpers for normalizing request values.

/// Sanitize arbitrary string input by trimming whitespace and dropping empties.
pub(crate) fn sanitize_string(value: Option<String>) -> Option<String> {
    value.and_then(|input| {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Normalize an OCR language hint (`eng`, `eng+deu`, `chi_sim`).
///
/// The hint is passed to the OCR engine as an argument, so anything outside ASCII
/// alphanumerics, `_` and `+` is rejected and the configured default is used instead.
pub fn sanitize_language(value: Option<String>, default: &str) -> String {
    sanitize_string(value)
        .map(|candidate| candidate.to_ascii_lowercase())
        .filter(|candidate| candidate.split('+').all(is_language_code))
        .unwrap_or_else(|| default.to_string())
}

fn is_language_code(part: &str) -> bool {
    !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Sanitize an uploaded file name for logging.
pub fn sanitize_file_name(value: Option<String>) -> Option<String> {
    sanitize_string(value).map(|name| {
        name.rsplit(['/', '\\'])
            .next()
            .unwrap_or(&name)
            .chars()
            .filter(|c| !c.is_control())
            .collect()
    })
}
