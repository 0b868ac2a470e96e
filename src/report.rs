//! Operator-facing progress output.

use crate::cache::CacheEntry;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;

/// Prints per-artifact outcomes and owns transfer progress bars.
#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    enabled: bool,
    is_tty: bool,
}

impl Reporter {
    pub fn new() -> Self {
        Self {
            enabled: true,
            is_tty: std::io::stderr().is_terminal(),
        }
    }

    /// Reporter that prints nothing, for library and test use.
    pub fn silent() -> Self {
        Self {
            enabled: false,
            is_tty: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn skipped(&self, name: &str) {
        if self.enabled {
            eprintln!("{} {} {}", "↷".dimmed(), name.bold(), "(already cached)".dimmed());
        }
    }

    pub fn downloaded(&self, name: &str, entry: &CacheEntry) {
        if !self.enabled {
            return;
        }
        let version = entry
            .version
            .as_deref()
            .map(|v| format!(" {}", v))
            .unwrap_or_default();
        eprintln!(
            "{} {}{} {}",
            "✓".green(),
            name.bold().green(),
            version,
            format!("[{} {}]", entry.lock_type, entry.cache_type.as_str()).dimmed()
        );
    }

    pub fn candidate_failed(&self, name: &str, candidate: &str, error: &str) {
        if self.enabled {
            eprintln!(
                "{} {} via {}: {}",
                "⚠".yellow(),
                name.bold(),
                candidate.cyan(),
                error
            );
        }
    }

    pub fn failed(&self, name: &str, error: &str) {
        if self.enabled {
            eprintln!("{} {}: {}", "✗".red(), name.bold(), error);
        }
    }

    pub fn extracted(&self, name: &str, target: &str) {
        if self.enabled {
            eprintln!("{} Extracted {} to {}", "✓".green(), name.bold(), target.dimmed());
        }
    }

    /// Byte progress bar for one transfer; hidden when output is not a terminal.
    pub fn transfer_bar(&self, label: &str) -> ProgressBar {
        if !self.enabled || !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("⬇ {}", label));
        pb
    }

    /// Spinner for work with no byte count, such as a clone.
    pub fn spinner(&self, message: String) -> ProgressBar {
        if !self.enabled || !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}
