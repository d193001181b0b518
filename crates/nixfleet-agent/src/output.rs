//! Deployment output capture.

use nixfleet_state::DeploymentOutcome;

use crate::collaborators::CommandOutput;

/// Cap on the raw output bytes kept with a deployment outcome (900 KiB).
/// The serialized record is fitted to the bucket limit by [`fit_outcome`].
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 900 * 1024;

/// Output of every step of one deployment attempt, in execution order.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    buf: Vec<u8>,
}

impl CapturedOutput {
    /// Append a step's stdout, then its stderr.
    pub fn push_command(&mut self, output: &CommandOutput) {
        self.buf.extend_from_slice(&output.stdout);
        self.buf.extend_from_slice(&output.stderr);
    }

    /// Append one line of agent-side text (errors the commands didn't print).
    pub fn push_line(&mut self, line: &str) {
        if !self.buf.is_empty() && !self.buf.ends_with(b"\n") {
            self.buf.push(b'\n');
        }
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(b'\n');
    }

    /// Lossy UTF-8 text, keeping only the last `max` bytes when longer.
    pub fn into_string(self, max: usize) -> String {
        truncate_tail(String::from_utf8_lossy(&self.buf).into_owned(), max)
    }
}

/// Keep the last `max` bytes of `text`, prefixed with a notice of how
/// much was dropped.
pub fn truncate_tail(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!(
        "[output truncated: {} earlier bytes omitted]\n{}",
        start,
        &text[start..]
    )
}

/// Placeholder for output that could not be stored at all.
pub fn omitted_notice(bytes: usize) -> String {
    format!("[output omitted: {bytes} bytes]\n")
}

/// Shrink `outcome.output` until the JSON record is at most `limit` bytes.
///
/// The budget is the serialized size, not the raw output size: control
/// bytes serialize as six-byte `\u00XX` escapes. Each round keeps half as
/// much of the output's tail as the last one. If even an empty tail does
/// not fit, only a notice of the original size is kept.
pub fn fit_outcome(mut outcome: DeploymentOutcome, limit: usize) -> DeploymentOutcome {
    let full = std::mem::take(&mut outcome.output);
    let mut keep = full.len();
    loop {
        outcome.output = truncate_tail(full.clone(), keep);
        if record_size(&outcome) <= limit {
            return outcome;
        }
        if keep == 0 {
            break;
        }
        keep /= 2;
    }
    outcome.output = omitted_notice(full.len());
    outcome
}

fn record_size(outcome: &DeploymentOutcome) -> usize {
    serde_json::to_vec(outcome).map_or(usize::MAX, |json| json.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_captured_in_order() {
        let mut output = CapturedOutput::default();
        output.push_command(&CommandOutput {
            stdout: b"copying\n".to_vec(),
            stderr: b"warning\n".to_vec(),
        });
        output.push_command(&CommandOutput::stdout("activating\n"));

        assert_eq!(
            output.into_string(DEFAULT_MAX_OUTPUT_BYTES),
            "copying\nwarning\nactivating\n"
        );
    }

    #[test]
    fn push_line_starts_on_a_new_line() {
        let mut output = CapturedOutput::default();
        output.push_command(&CommandOutput::stdout("partial"));
        output.push_line("fetch failed");
        assert_eq!(output.into_string(1024), "partial\nfetch failed\n");
    }

    fn outcome(output: String) -> DeploymentOutcome {
        DeploymentOutcome {
            deployment: nixfleet_state::DeploymentDescriptor {
                closure: "/nix/store/xyz-system".to_string(),
                action: nixfleet_state::Action::Switch,
                dry_run: false,
            },
            success: false,
            output,
            elapsed_ms: 3,
            finished_at: 1_700_000_000,
        }
    }

    #[test]
    fn small_record_is_left_alone() {
        let fitted = fit_outcome(outcome("done\n".to_string()), 1024);
        assert_eq!(fitted.output, "done\n");
    }

    #[test]
    fn escapes_count_against_the_record_limit() {
        // 600 KiB of ESC is 3.6 MiB once serialized.
        let raw = "\u{1b}".repeat(600 * 1024);
        let limit = 1024 * 1024;
        let fitted = fit_outcome(outcome(raw), limit);

        let size = serde_json::to_vec(&fitted).unwrap().len();
        assert!(size <= limit, "{size}");
        assert!(fitted.output.starts_with("[output truncated"));
        assert!(fitted.output.ends_with('\u{1b}'));
    }

    #[test]
    fn notice_only_when_nothing_fits() {
        let fitted = fit_outcome(outcome("x".repeat(4096)), 190);
        assert_eq!(fitted.output, "[output omitted: 4096 bytes]\n");
    }

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_tail("abc".to_string(), 3), "abc");
    }

    #[test]
    fn long_output_keeps_the_tail() {
        let text = "0123456789".to_string();
        let truncated = truncate_tail(text, 4);
        assert!(truncated.starts_with("[output truncated: 6 earlier bytes omitted]\n"));
        assert!(truncated.ends_with("6789"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; a cut in the middle moves forward.
        let text = "aéé".to_string();
        let truncated = truncate_tail(text, 3);
        assert!(truncated.ends_with("é"));
        assert!(!truncated.ends_with("éé"));
    }
}
