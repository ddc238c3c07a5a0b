//! Invocation identifiers as emitted by the tracer.
//!
//! Raw identifiers look like `a.js:10_count3`: a call-site location followed
//! by the occurrence counter of that call site within one page load.

const OCCURRENCE_MARKER: &str = "_count";

/// Strip the trailing `_count<N>` occurrence counter, leaving the call-site
/// location. Identifiers without a well-formed counter are returned unchanged.
pub fn strip_occurrence(id: &str) -> &str {
    match id.rfind(OCCURRENCE_MARKER) {
        Some(idx) => {
            let counter = &id[idx + OCCURRENCE_MARKER.len()..];
            if !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()) {
                &id[..idx]
            } else {
                id
            }
        }
        None => id,
    }
}
