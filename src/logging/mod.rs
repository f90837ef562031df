//! Logging and output control
//!
//! This module provides the [`Logger`] handed to every component. It keeps the
//! verbosity switches and the run start time, and emits everything through
//! `tracing` so the subscriber installed by the binary decides formatting and
//! filtering. [`init_tracing`] installs that subscriber.

use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
    pub start_time: Instant,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            start_time: Instant::now(),
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
            start_time: Instant::now(),
        }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if !self.quiet {
            info!("=== {} ===", title);
        }
    }

    /// Sub-section heading
    pub fn subsection(&self, title: &str) {
        if !self.quiet {
            info!("--- {} ---", title);
        }
    }

    /// Information message
    pub fn info(&self, message: &str) {
        if !self.quiet {
            info!("ℹ️  {}", message);
        }
    }

    /// Success message
    pub fn success(&self, message: &str) {
        if !self.quiet {
            info!("✅ {}", message);
        }
    }

    /// Warning message
    pub fn warning(&self, message: &str) {
        warn!("⚠️  {}", message);
    }

    /// Error message
    pub fn error(&self, message: &str) {
        error!("❌ {}", message);
    }

    /// Step information
    pub fn step(&self, message: &str) {
        if !self.quiet {
            info!("▶️  {}", message);
        }
    }

    /// Progress information
    pub fn progress(&self, message: &str) {
        if !self.quiet {
            info!("⏳ {}", message);
        }
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        if self.verbose {
            debug!("   {}", message);
        }
    }

    /// Key-value pair summary display
    pub fn summary_kv(&self, title: &str, items: &[(&str, String)]) {
        if self.quiet {
            return;
        }
        info!("📋 {}", title);
        for (key, value) in items {
            info!("  • {}: {}", key, value);
        }
    }

    /// Format byte counts in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", bytes, UNITS[0])
        } else {
            format!("{:.1} {}", size, UNITS[unit_index])
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{:.1}s", duration.as_secs_f64())
        } else if secs < 3600 {
            format!("{}m{:02}s", secs / 60, secs % 60)
        } else {
            format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }

    pub fn elapsed_time(&self) -> String {
        self.format_duration(self.start_time.elapsed())
    }
}

/// Install the global `tracing` subscriber on stderr.
///
/// `RUST_LOG` wins when set; otherwise the level follows the verbosity flags.
pub fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);

    // try_init: a subscriber may already be installed (tests, embedding)
    if verbose {
        let _ = builder.try_init();
    } else {
        let _ = builder.without_time().try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_uses_binary_units() {
        let logger = Logger::default();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(1536), "1.5 KB");
        assert_eq!(logger.format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn format_duration_switches_units() {
        let logger = Logger::default();
        assert_eq!(logger.format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(logger.format_duration(Duration::from_secs(125)), "2m05s");
        assert_eq!(logger.format_duration(Duration::from_secs(3725)), "1h02m05s");
    }
}
