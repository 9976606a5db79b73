use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// One progress bar per pipeline stage, replaced when the stage changes.
pub struct StageBars {
    hidden: bool,
    current: Mutex<Option<(String, ProgressBar)>>,
}

impl StageBars {
    pub fn new(hidden: bool) -> Self {
        Self {
            hidden,
            current: Mutex::new(None),
        }
    }

    pub fn update(&self, stage: &str, current: u64, total: u64, message: &str) {
        if self.hidden {
            return;
        }
        let Ok(mut guard) = self.current.lock() else {
            return;
        };
        let stale = guard.as_ref().is_some_and(|(s, _)| s != stage);
        if stale {
            if let Some((_, pb)) = guard.take() {
                pb.finish_and_clear();
            }
        }
        let (_, pb) = guard.get_or_insert_with(|| (stage.to_string(), new_bar(total)));
        pb.set_message(message.to_string());
        pb.set_position(current + 1);
        if current + 1 >= total {
            pb.finish_and_clear();
            *guard = None;
        }
    }

    pub fn finish(&self) {
        if let Ok(mut guard) = self.current.lock() {
            if let Some((_, pb)) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }
}

fn new_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "  {spinner:.cyan} [{bar:30.cyan/dim}] {pos}/{len} {msg} ({eta} remaining)",
    ) {
        pb.set_style(style.progress_chars("━╸─"));
    }
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}
