use hlsvault_engine::{EngineEvent, ProgressUpdate, TaskId};
use indicatif::ProgressStyle;
use tokio::sync::broadcast;
use tracing::{Span, debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// Drives the task progress bar from engine events.
pub struct ProgressReporter {
    task_id: TaskId,
    span: Span,
    enabled: bool,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, span: Span, enabled: bool) -> Self {
        if enabled {
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} segments {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            span.pb_set_style(&style);
            span.pb_set_message(&task_id);
        }
        Self {
            task_id,
            span,
            enabled,
        }
    }

    /// Consume events until the task reports an outcome or the channel closes.
    pub async fn run(self, mut events: broadcast::Receiver<EngineEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress reporter lagged behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if event.task_id() != Some(self.task_id.as_str()) {
                if let EngineEvent::EngineAlert { report, .. } = &event {
                    warn!(category = ?report.category, "{}", report.message);
                }
                continue;
            }

            match event {
                EngineEvent::Progress(update) => self.on_progress(&update),
                EngineEvent::StatusChanged { old, new, .. } => {
                    debug!(task_id = %self.task_id, %old, %new, "Status changed");
                }
                EngineEvent::EngineAlert { report, .. } => {
                    warn!(category = ?report.category, "{}", report.message);
                }
                EngineEvent::Completed {
                    success, message, ..
                } => {
                    if self.enabled {
                        let label = if success { "done" } else { "stopped" };
                        self.span.pb_set_finish_message(&format!("{label}: {message}"));
                    }
                    info!(task_id = %self.task_id, success, "{message}");
                    break;
                }
            }
        }
    }

    fn on_progress(&self, update: &ProgressUpdate) {
        if !self.enabled {
            debug!(
                completed = update.completed,
                total = update.total,
                bytes = update.bytes_downloaded,
                "Progress"
            );
            return;
        }
        self.span.pb_set_length(update.total);
        self.span.pb_set_position(update.completed);

        let eta = update
            .eta
            .map(|eta| format!(", eta {}s", eta.as_secs()))
            .unwrap_or_default();
        self.span.pb_set_message(&format!(
            "{} @ {}/s{eta}",
            format_bytes(update.bytes_downloaded as f64),
            format_bytes(update.speed_bytes_per_sec)
        ));
    }
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.50 KiB");
        assert_eq!(format_bytes(5.0 * 1024.0 * 1024.0), "5.00 MiB");
    }
}
