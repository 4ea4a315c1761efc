use context_indexer::HostEvent;
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}";

/// Terminal rendering of the host events of one run. Hidden in quiet mode.
pub(crate) struct RunProgress {
    bar: Option<ProgressBar>,
}

impl RunProgress {
    pub(crate) fn new(hidden: bool) -> Self {
        if hidden {
            return Self { bar: None };
        }
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar: Some(bar) }
    }

    pub(crate) fn apply(&self, event: &HostEvent) {
        let Some(bar) = &self.bar else {
            return;
        };
        match event {
            HostEvent::Start => bar.set_message("scanning"),
            HostEvent::Total { total } => bar.set_message(format!("{total} files")),
            HostEvent::Progress { value } => bar.set_position(percent(*value)),
            HostEvent::Done => bar.set_position(100),
            HostEvent::Error { message } => bar.println(format!("error: {message}")),
        }
    }

    pub(crate) fn finish(&self, aborted: bool) {
        let Some(bar) = &self.bar else {
            return;
        };
        if aborted {
            bar.abandon_with_message("aborted");
        } else {
            bar.finish_with_message("done");
        }
    }
}

fn percent(value: f64) -> u64 {
    value.clamp(0.0, 100.0).round() as u64
}
