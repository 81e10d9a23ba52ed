//! Output excerpts attached to command failures.

/// Trims ASCII whitespace from both ends of `data`.
#[must_use]
pub fn trim_space(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &data[start..end]
}

/// Renders the excerpt that stands in for an error when a failed command
/// produced output.
///
/// Multi-line outputs are wrapped in `-----` fences; single-line outputs
/// are used verbatim. Returns `None` when the trimmed output is empty, in
/// which case the caller keeps its original error.
#[must_use]
pub fn excerpt(output: &[u8]) -> Option<String> {
    let trimmed = trim_space(output);
    if trimmed.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(trimmed);
    if text.contains('\n') {
        Some(format!("\n-----\n{text}\n-----"))
    } else {
        Some(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_both_ends() {
        assert_eq!(trim_space(b"  padded \n"), b"padded");
        assert_eq!(trim_space(b"\n\t \n"), b"");
        assert_eq!(trim_space(b"solid"), b"solid");
    }

    #[test]
    fn empty_output_yields_none() {
        assert_eq!(excerpt(b"   \n"), None);
    }

    #[test]
    fn single_line_is_verbatim() {
        assert_eq!(excerpt(b"boom\n"), Some("boom".to_string()));
    }

    #[test]
    fn multi_line_is_fenced() {
        assert_eq!(
            excerpt(b"first\nsecond\n"),
            Some("\n-----\nfirst\nsecond\n-----".to_string())
        );
    }
}
