//! TERMLOG repair.
//!
//! Connecting to a node over the testbed can leave garbage bytes in front of
//! the first prompt of a captured terminal log. The first line is cut back to
//! its last `>`; the rest of the file is left alone.

use std::io;
use std::path::Path;

use tracing::debug;

use crate::channel::decode_lenient;

/// Repair the first line of a TERMLOG in place.
///
/// Returns whether the file was rewritten. Invalid UTF-8 anywhere in the file
/// is dropped when it is.
pub fn sanitize_termlog(path: &Path) -> io::Result<bool> {
    let bytes = std::fs::read(path)?;
    let text = decode_lenient(&bytes);
    let (first, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first, Some(rest)),
        None => (text.as_str(), None),
    };
    let Some(marker) = first.rfind('>') else {
        debug!(path = %path.display(), "No prompt on first line, leaving TERMLOG untouched");
        return Ok(false);
    };

    let mut repaired = String::with_capacity(text.len());
    repaired.push_str(&first[marker..]);
    repaired.push('\n');
    if let Some(rest) = rest {
        repaired.push_str(rest);
    }
    std::fs::write(path, repaired)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn termlog(content: &[u8]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[test]
    fn test_strips_leading_garbage() {
        let file = termlog(b"\x00\x01\xff>hello\nworld\n> {\"epoch\": 1}\n");
        assert!(sanitize_termlog(file.path()).unwrap());
        assert_eq!(
            std::fs::read_to_string(file.path()).unwrap(),
            ">hello\nworld\n> {\"epoch\": 1}\n"
        );
    }

    #[test]
    fn test_cuts_at_last_prompt() {
        let file = termlog(b"x> y> pepper get uid\nrest");
        assert!(sanitize_termlog(file.path()).unwrap());
        assert_eq!(
            std::fs::read_to_string(file.path()).unwrap(),
            "> pepper get uid\nrest"
        );
    }

    #[test]
    fn test_keeps_line_ending_bytes() {
        let file = termlog(b"\xfe\xfe> \r\nmain(): This is RIOT!\r\n");
        assert!(sanitize_termlog(file.path()).unwrap());
        assert_eq!(
            std::fs::read_to_string(file.path()).unwrap(),
            "> \r\nmain(): This is RIOT!\r\n"
        );
    }

    #[test]
    fn test_no_prompt_leaves_file_untouched() {
        let content = b"\x00garbage\n> later\n";
        let file = termlog(content);
        assert!(!sanitize_termlog(file.path()).unwrap());
        assert_eq!(std::fs::read(file.path()).unwrap(), content);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_termlog(&dir.path().join("missing.log")).is_err());
    }
}
