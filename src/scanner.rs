//! Delimiter detection over an accumulated byte stream.
//!
//! A delimiter may arrive split across several reads, so detection runs over
//! everything buffered so far. Rescanning only needs to start
//! `delimiter.len() - 1` bytes before the newly appended chunk, since any
//! earlier match would already have been reported.

/// Returns true if `delimiter` occurs as a contiguous sequence in `haystack`.
///
/// An empty delimiter never matches.
pub fn scan(haystack: &[u8], delimiter: &[u8]) -> bool {
    find(haystack, delimiter).is_some()
}

/// Position of the first occurrence of `delimiter` in `haystack`.
pub fn find(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    if delimiter.is_empty() || haystack.len() < delimiter.len() {
        return None;
    }
    haystack
        .windows(delimiter.len())
        .position(|window| window == delimiter)
}

/// Find a delimiter in a buffer that just grew by `appended` bytes.
///
/// Only the region that could contain a match involving the new bytes is
/// inspected. The returned position is relative to the whole buffer.
pub fn find_appended(buffer: &[u8], appended: usize, delimiter: &[u8]) -> Option<usize> {
    let previous = buffer.len().saturating_sub(appended);
    let start = previous.saturating_sub(delimiter.len().saturating_sub(1));
    find(&buffer[start..], delimiter).map(|pos| start + pos)
}
