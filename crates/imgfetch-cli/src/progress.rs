//! Progress display for the CLI
//!
//! Acquisition progress arrives as [`ProgressEvent`]s. They are rendered as
//! one indicatif bar per phase, or as JSON lines for scripting.

use imgfetch_core::{Phase, ProgressEvent};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// How progress events are shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Interactive bars on stderr
    Bars,
    /// One JSON object per event on stdout
    Json,
    /// Nothing
    Hidden,
}

impl ProgressMode {
    /// Pick the mode from the command line flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            ProgressMode::Json
        } else if quiet {
            ProgressMode::Hidden
        } else {
            ProgressMode::Bars
        }
    }
}

/// Renders progress events for every phase of an acquisition
pub struct ProgressReporter {
    mode: ProgressMode,
    current: Mutex<Option<(Phase, ProgressBar)>>,
}

impl ProgressReporter {
    /// Create a reporter that renders in `mode`
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            current: Mutex::new(None),
        }
    }

    /// Show one event
    pub fn handle(&self, event: ProgressEvent) {
        match self.mode {
            ProgressMode::Hidden => {}
            ProgressMode::Json => {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{}", line);
                }
            }
            ProgressMode::Bars => self.draw(event),
        }
    }

    fn draw(&self, event: ProgressEvent) {
        let Ok(mut current) = self.current.lock() else {
            return;
        };

        if current.as_ref().map(|(phase, _)| *phase) != Some(event.phase) {
            if let Some((_, bar)) = current.take() {
                bar.finish();
            }
            *current = Some((event.phase, create_progress_bar(phase_label(event.phase))));
        }

        if let Some((_, bar)) = current.as_ref() {
            if event.percentage >= 0.0 {
                bar.set_position(event.percentage.round() as u64);
            }
            if event.percentage >= 100.0 {
                bar.finish_with_message("done");
            } else {
                bar.set_message(describe(&event));
            }
        }
    }

    /// Leave the last bar on screen as it stands
    pub fn finish(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some((_, bar)) = current.take() {
                if !bar.is_finished() {
                    bar.abandon();
                }
            }
        }
    }
}

/// Create a percentage bar with the standard style
pub fn create_progress_bar(label: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("  {spinner:.green} {prefix:<9} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
    pb.set_style(style);
    pb.set_prefix(label.to_string());
    pb
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Download => "Download",
        Phase::Checksum => "Checksum",
    }
}

fn describe(event: &ProgressEvent) -> String {
    format!("{} ({} left)", format_speed(event.speed), format_eta(event.eta))
}

/// Format bytes per second for display, `--` when unknown
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes_per_sec < 0.0 {
        "--".to_string()
    } else if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

/// Format remaining seconds for display, `--` when unknown
pub fn format_eta(seconds: i64) -> String {
    if seconds < 0 {
        "--".to_string()
    } else if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(500.0), "500 B/s");
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1024.0 * 1024.0), "1.00 MB/s");
        assert_eq!(format_speed(1024.0 * 1024.0 * 1024.0), "1.00 GB/s");
    }

    #[test]
    fn test_format_speed_unknown() {
        assert_eq!(format_speed(-1.0), "--");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(30), "30s");
        assert_eq!(format_eta(90), "1m 30s");
        assert_eq!(format_eta(3661), "1h 1m");
        assert_eq!(format_eta(-1), "--");
    }

    #[test]
    fn test_progress_mode_from_flags() {
        assert_eq!(ProgressMode::from_flags(true, true), ProgressMode::Json);
        assert_eq!(ProgressMode::from_flags(false, true), ProgressMode::Hidden);
        assert_eq!(ProgressMode::from_flags(false, false), ProgressMode::Bars);
    }

    #[test]
    fn test_reporter_switches_bar_per_phase() {
        let reporter = ProgressReporter::new(ProgressMode::Bars);
        let mut event = ProgressEvent {
            phase: Phase::Download,
            percentage: 40.0,
            eta: 5,
            speed: 2048.0,
        };
        reporter.handle(event);
        event.phase = Phase::Checksum;
        event.percentage = 10.0;
        reporter.handle(event);

        let current = reporter.current.lock().unwrap();
        let (phase, bar) = current.as_ref().unwrap();
        assert_eq!(*phase, Phase::Checksum);
        assert_eq!(bar.position(), 10);
    }

    #[test]
    fn test_reporter_unknown_percentage_keeps_position() {
        let reporter = ProgressReporter::new(ProgressMode::Bars);
        reporter.handle(ProgressEvent {
            phase: Phase::Download,
            percentage: -1.0,
            eta: -1,
            speed: -1.0,
        });

        let current = reporter.current.lock().unwrap();
        assert_eq!(current.as_ref().unwrap().1.position(), 0);
    }
}
