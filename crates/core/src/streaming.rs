//! Incremental text deltas over a growing decoded snapshot.
//!
//! Decoding a partial id sequence can end in U+FFFD while a multi-byte character
//! is still being assembled across tokens. The tracker withholds that unstable
//! tail and emits only text that will not change on the next step.

/// Tracks what has already been handed to a progress callback.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    emitted: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn snapshot(&self) -> &str {
        &self.emitted
    }

    /// Compare `current` against what was already emitted and return the new
    /// stable suffix, if any. Unless `is_final`, trailing replacement characters
    /// are held back for the next call. A snapshot that rewrites already-emitted
    /// text yields nothing; text is never emitted twice.
    pub fn advance(&mut self, current: &str, is_final: bool) -> Option<String> {
        let stable = if is_final {
            current
        } else {
            current.trim_end_matches('\u{FFFD}')
        };
        let delta = stable.strip_prefix(self.emitted.as_str())?;
        if delta.is_empty() {
            return None;
        }
        self.emitted.push_str(delta);
        Some(delta.to_owned())
    }
}
