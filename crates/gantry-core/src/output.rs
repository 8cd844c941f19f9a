//! Capture handle for output produced during stage execution.
//!
//! Ambient interception of the process-wide stdout stream is not
//! portably expressible in-process, so stages receive an explicit
//! capture handle instead. With capture enabled, writes accumulate and
//! the orchestrator drains them into a single stdout report (then echoes
//! to the real stream); with capture disabled, writes pass straight
//! through.

use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct CaptureState {
    buffer: String,
}

/// Shared line sink handed to every stage of one invocation.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    enabled: bool,
    state: Arc<Mutex<CaptureState>>,
}

impl OutputCapture {
    /// Create a capture handle. When `enabled` is false, writes are
    /// echoed immediately and nothing accumulates.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Arc::new(Mutex::new(CaptureState::default())),
        }
    }

    /// Write one line of output.
    pub fn write_line(&self, line: &str) {
        if self.enabled {
            let mut state = self.state.lock().expect("output capture lock poisoned");
            state.buffer.push_str(line);
            state.buffer.push('\n');
        } else {
            println!("{line}");
        }
    }

    /// Drain everything captured so far.
    #[must_use]
    pub fn take(&self) -> String {
        let mut state = self.state.lock().expect("output capture lock poisoned");
        std::mem::take(&mut state.buffer)
    }

    /// Returns `true` when capture is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_accumulates_and_drains() {
        let capture = OutputCapture::new(true);
        capture.write_line("first");
        capture.write_line("second");
        assert_eq!(capture.take(), "first\nsecond\n");
        assert_eq!(capture.take(), "");
    }

    #[test]
    fn test_disabled_capture_stays_empty() {
        let capture = OutputCapture::new(false);
        capture.write_line("passes straight through");
        assert_eq!(capture.take(), "");
    }

    #[test]
    fn test_clones_share_one_buffer() {
        let capture = OutputCapture::new(true);
        let clone = capture.clone();
        clone.write_line("shared");
        assert_eq!(capture.take(), "shared\n");
    }
}
