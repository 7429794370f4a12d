//! Progress bar for a running batch

use crate::output::format_speed;
use batchdl_types::CoreEvent;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

/// Renders the events of one download onto a progress bar
pub struct DownloadProgress {
    id: Uuid,
    bar: ProgressBar,
}

impl DownloadProgress {
    pub fn new(id: Uuid, label: String) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({msg}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        bar.set_prefix(label);
        bar.set_message(format!("{} queued", style("·").dim()));
        Self { id, bar }
    }

    /// Update the bar from an event of this download
    pub fn handle_event(&self, event: &CoreEvent) {
        if event.id() != self.id {
            return;
        }

        match event {
            CoreEvent::Queued { position, .. } | CoreEvent::QueuePositionChanged { position, .. } => {
                if *position > 1 {
                    self.bar
                        .set_message(format!("{} queued #{}", style("·").dim(), position));
                }
            }
            CoreEvent::Started { .. } | CoreEvent::Resumed { .. } => {
                self.bar.set_message(format!("{} starting", style("↓").cyan()));
            }
            CoreEvent::Progress(progress) => {
                if progress.file_size > 0 {
                    self.bar.set_length(progress.file_size);
                }
                self.bar.set_position(progress.downloaded);
                let speed = format_speed(progress.download_speed);
                match (progress.current_part_index, progress.total_parts) {
                    (Some(index), Some(total)) => {
                        self.bar
                            .set_message(format!("{} - file {}/{}", speed, index + 1, total))
                    }
                    _ => self.bar.set_message(speed),
                }
            }
            CoreEvent::Paused { .. } => {
                self.bar
                    .abandon_with_message(format!("{} Paused", style("⏸").yellow()));
            }
            CoreEvent::Completed { .. } => {
                self.bar.finish_with_message(format!(
                    "{} Download complete",
                    style("✓").green().bold()
                ));
            }
            CoreEvent::Error { reason, .. } => {
                self.bar.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    reason
                ));
            }
            CoreEvent::Cancelled { .. } => {
                self.bar
                    .abandon_with_message(format!("{} Cancelled", style("○").dim()));
            }
            CoreEvent::Notification { .. } => {}
        }
    }
}
