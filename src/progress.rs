use std::io::{IsTerminal, stderr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::config::Config;
use crate::report::EntryStatus;

const ENTRY_BAR_TEMPLATE: &str = "{prefix} [{bar:40}] {pos:>5}/{len:<5} | {percent:>3}% | {elapsed_precise}<{eta_precise} | {msg}";

/// Receiver of run progress.
///
/// The engine calls a sink from one thread at a time; implementations need
/// no internal locking. `must_cancel` is polled before each catalog entry is
/// started.
pub trait ProgressSink {
    fn init(&mut self, label: &str);
    fn progress(&mut self, label: &str, total: usize, current: usize);
    fn done(&mut self, label: &str, result_folder: &Path);
    /// Final call of a run that stopped on request.
    fn cancelled(&mut self, label: &str);
    fn error(&mut self, err: &anyhow::Error);
    fn set_processed(&mut self, entries: &[EntryStatus]);
    fn set_errors(&mut self, entries: &[EntryStatus]);
    fn must_cancel(&self) -> bool;
    fn set_must_cancel(&mut self, flag: bool);
}

fn ellipsize(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut shortened: String = input.chars().take(keep).collect();
    shortened.push_str("...");
    shortened
}

fn format_duration(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

#[cfg(test)]
thread_local! {
    static FORCE_PROGRESS_TTY: std::cell::Cell<Option<bool>> = const { std::cell::Cell::new(None) };
}

fn stderr_supports_progress() -> bool {
    #[cfg(test)]
    {
        if let Some(flag) = FORCE_PROGRESS_TTY.with(|cell| cell.get()) {
            return flag;
        }
    }
    stderr().is_terminal()
}

#[cfg(test)]
pub(crate) fn force_progress_tty_for_tests(flag: Option<bool>) {
    FORCE_PROGRESS_TTY.with(|cell| cell.set(flag));
}

/// Terminal sink: a progress bar on stderr plus an end-of-run summary.
pub struct ConsoleSink {
    bar: Option<ProgressBar>,
    cancel: Arc<AtomicBool>,
    verbosity: u8,
    quiet: bool,
    started_at: Option<Instant>,
    passed: usize,
    failed: Vec<EntryStatus>,
}

impl ConsoleSink {
    pub fn new(config: &Config) -> Self {
        let quiet = config.quiet > 0;
        let bar = (!quiet && stderr_supports_progress()).then(|| {
            let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
            if let Ok(style) = ProgressStyle::with_template(ENTRY_BAR_TEMPLATE) {
                bar.set_style(style.progress_chars("=>-"));
            }
            bar
        });
        Self {
            bar,
            cancel: Arc::new(AtomicBool::new(false)),
            verbosity: config.verbose,
            quiet,
            started_at: None,
            passed: 0,
            failed: Vec::new(),
        }
    }

    /// Shared flag another thread can raise to stop the run.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn has_bar(&self) -> bool {
        self.bar.is_some()
    }

    fn finish_bar(&self, message: &str) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(message.to_string());
        }
    }

    fn emit_summary(&self, headline: &str) {
        if self.quiet {
            return;
        }
        let elapsed = self
            .started_at
            .map(|start| format_duration(start.elapsed()))
            .unwrap_or_else(|| "n/a".to_string());
        eprintln!("\n=== {headline} ===");
        eprintln!(
            "Sets -> passed: {} | failed: {}",
            self.passed,
            self.failed.len()
        );
        let max_entries = if self.verbosity >= 1 { usize::MAX } else { 10 };
        for status in self.failed.iter().take(max_entries) {
            let details: Vec<String> = status
                .findings
                .iter()
                .map(|f| match &f.target {
                    Some(target) => format!("{target}: {}", f.reason),
                    None => f.reason.to_string(),
                })
                .collect();
            eprintln!("  - {} -> {}", status.name, details.join(", "));
        }
        if self.failed.len() > max_entries {
            eprintln!("  ... and {} more", self.failed.len() - max_entries);
            eprintln!("(increase --verbose to list every failing set)");
        }
        eprintln!("Total runtime: {elapsed}");
    }
}

impl ProgressSink for ConsoleSink {
    fn init(&mut self, label: &str) {
        self.started_at = Some(Instant::now());
        if let Some(bar) = &self.bar {
            bar.set_prefix("[VERIFY]");
            bar.set_message(ellipsize(label, 60));
        }
        vprintln!(self.verbosity, 1, "Verifying {label}");
    }

    fn progress(&mut self, label: &str, total: usize, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_length(total as u64);
            bar.set_position(current as u64);
            bar.set_message(ellipsize(label, 40));
        }
    }

    fn done(&mut self, label: &str, result_folder: &Path) {
        self.finish_bar("done");
        self.emit_summary(&format!("{label} verified"));
        if !self.quiet {
            eprintln!("Results in {}", result_folder.display());
        }
    }

    fn cancelled(&mut self, label: &str) {
        self.finish_bar("cancelled");
        self.emit_summary(&format!("{label} cancelled"));
    }

    fn error(&mut self, err: &anyhow::Error) {
        if let Some(bar) = &self.bar {
            bar.abandon_with_message("failed");
        }
        eprintln!("error: {err:#}");
    }

    fn set_processed(&mut self, entries: &[EntryStatus]) {
        self.passed = entries.len();
    }

    fn set_errors(&mut self, entries: &[EntryStatus]) {
        self.failed = entries.to_vec();
    }

    fn must_cancel(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn set_must_cancel(&mut self, flag: bool) {
        self.cancel.store(flag, Ordering::SeqCst);
    }
}

impl Drop for ConsoleSink {
    fn drop(&mut self) {
        if let Some(bar) = &self.bar {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_mode_disables_progress_even_when_tty_exists() {
        force_progress_tty_for_tests(Some(true));
        let cfg = Config {
            quiet: 1,
            ..Config::default()
        };
        assert!(!ConsoleSink::new(&cfg).has_bar());
        force_progress_tty_for_tests(None);
    }

    #[test]
    fn progress_initializes_when_tty_is_forced() {
        force_progress_tty_for_tests(Some(true));
        let sink = ConsoleSink::new(&Config::default());
        assert!(sink.has_bar());
        force_progress_tty_for_tests(None);
    }

    #[test]
    fn cancel_handle_is_shared() {
        force_progress_tty_for_tests(Some(false));
        let mut sink = ConsoleSink::new(&Config::default());
        let handle = sink.cancel_handle();
        assert!(!sink.must_cancel());
        handle.store(true, Ordering::SeqCst);
        assert!(sink.must_cancel());
        sink.set_must_cancel(false);
        assert!(!handle.load(Ordering::SeqCst));
        force_progress_tty_for_tests(None);
    }

    #[test]
    fn ellipsize_keeps_short_labels() {
        assert_eq!(ellipsize("mslug", 10), "mslug");
        assert_eq!(ellipsize("abcdefghijkl", 8), "abcde...");
    }
}
