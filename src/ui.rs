use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// Stderr progress for the CLIs: spinners and bars on a terminal, `==>` lines otherwise.
#[derive(Clone, Copy, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `flag` is the `--ui` value (auto|plain|pretty). Auto goes plain when
    /// stdout is piped so tables and JSON stay clean.
    pub fn from_args(flag: &str, stderr_tty: bool, stdout_piped: bool) -> Self {
        let pretty = stderr_tty
            && match flag {
                "pretty" => true,
                "plain" => false,
                _ => !stdout_piped,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> Stage {
        let spinner = if self.pretty {
            let spinner = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg} {elapsed:.dim}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner.set_message(name.to_string());
            Some(spinner)
        } else {
            eprintln!("==> {}", name);
            None
        };
        Stage {
            name: name.to_string(),
            started: Instant::now(),
            spinner,
            failure: None,
        }
    }

    /// Bounded counter, e.g. GPS poll attempts. Hidden in plain mode.
    pub fn counter(&self, name: &str, total: u64) -> ProgressBar {
        if !self.pretty {
            eprintln!("==> {} (up to {})", name, total);
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(name.to_string());
        bar
    }
}

/// Reports the stage outcome and its duration when dropped.
pub struct Stage {
    name: String,
    started: Instant,
    spinner: Option<ProgressBar>,
    failure: Option<String>,
}

impl Stage {
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let took = short_duration(self.started.elapsed());
        let line = match &self.failure {
            Some(reason) => format!("✘ {}: {} ({})", self.name, reason, took),
            None => format!("✔ {} ({})", self.name, took),
        };
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(line),
            None => eprintln!("{line}"),
        }
    }
}

fn short_duration(duration: Duration) -> String {
    match duration.as_millis() {
        ms if ms < 1000 => format!("{ms}ms"),
        _ => format!("{:.1}s", duration.as_secs_f64()),
    }
}
