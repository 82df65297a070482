//! Cargo-style progress output for blocksync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!    Uploaded docs/report.docx (3 blocks, 12.00 KiB)
//!  Downloaded notes.md
//!    Conflict plan.txt (keep_both)
//!      Synced 952 files in 3.2s
//! ```

use std::io::Write as _;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use blocksync_core::{SyncEvent, SyncReport};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SYNCING: &str = "Syncing";
    const SYNCED: &str = "Synced";
    const CONFLICT: &str = "Conflict";
    const RESOLVED: &str = "Resolved";
    const FAILED: &str = "Failed";
    const SCOPE: &str = "Scope";
}

/// Log writer that keeps tracing output from tearing progress bars
pub struct ProgressWriter;

pub fn writer() -> ProgressWriter {
    ProgressWriter
}

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        MULTI.suspend(|| std::io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

fn print_styled(style: &console::Style, status: &str, message: &str) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    print_styled(&console::Style::new().green().bold(), status, message);
}

pub fn print_warning(status: &str, message: &str) {
    print_styled(&console::Style::new().yellow().bold(), status, message);
}

pub fn print_error(status: &str, message: &str) {
    print_styled(&console::Style::new().red().bold(), status, message);
}

/// Capitalized verb for a session action, e.g. "uploaded" -> "Uploaded"
fn verb(action: &str) -> String {
    let mut chars = action.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

/// Progress tracker for one sync pass
pub struct SyncProgress {
    start: Instant,
    spinner: ProgressBar,
}

impl SyncProgress {
    pub fn start(root: &str) -> Self {
        let spinner = MULTI.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg:>12} {prefix}") {
            spinner.set_style(style);
        }
        spinner.set_message(Status::SYNCING);
        spinner.set_prefix(root.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self {
            start: Instant::now(),
            spinner,
        }
    }

    /// Report one engine event
    pub fn event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::SessionCompleted {
                path,
                action,
                uploaded,
                downloaded,
                ..
            } => {
                if action == "unchanged" || action == "out of scope" {
                    return;
                }
                let detail = match (uploaded, downloaded) {
                    (0, 0) => String::new(),
                    (up, 0) => format!(" ({up} blocks up)"),
                    (0, down) => format!(" ({down} blocks down)"),
                    (up, down) => format!(" ({up} up, {down} down)"),
                };
                print_status(&verb(action), &format!("{path}{detail}"));
            }
            SyncEvent::SessionFailed { path, error, .. } => {
                print_error(Status::FAILED, &format!("{path}: {error}"));
            }
            SyncEvent::ConflictDetected { path, policy, .. } => {
                print_warning(Status::CONFLICT, &format!("{path} ({policy})"));
            }
            SyncEvent::ConflictResolved {
                path,
                resolution,
                copy_path,
            } => {
                let message = match copy_path {
                    Some(copy) => format!("{path} {resolution}, other version at {copy}"),
                    None => format!("{path} {resolution}"),
                };
                print_warning(Status::RESOLVED, &message);
            }
            SyncEvent::ScopeChanged {
                newly_excluded,
                newly_included,
            } => {
                print_status(
                    Status::SCOPE,
                    &format!(
                        "{} paths excluded, {} included",
                        newly_excluded.len(),
                        newly_included.len()
                    ),
                );
            }
        }
    }

    /// Show final summary
    pub fn finish(&self, report: &SyncReport) {
        self.spinner.finish_and_clear();
        let elapsed = self.start.elapsed();
        let elapsed_str = if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        };

        let changed = report.changed().count();
        let bytes: u64 = report
            .sessions
            .iter()
            .map(|s| s.uploaded.bytes + s.downloaded.bytes)
            .sum();
        let moved = humansize::format_size(bytes, humansize::BINARY);

        if report.failures.is_empty() {
            print_status(
                Status::SYNCED,
                &format!(
                    "{} files ({changed} changed, {moved} moved) in {elapsed_str}",
                    report.sessions.len()
                ),
            );
        } else {
            print_warning(
                "Finished",
                &format!(
                    "{} synced, {} failed in {elapsed_str}",
                    report.sessions.len(),
                    report.failures.len()
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_capitalizes() {
        assert_eq!(verb("uploaded"), "Uploaded");
        assert_eq!(verb("deleted remote"), "Deleted remote");
        assert_eq!(verb(""), "");
    }
}
