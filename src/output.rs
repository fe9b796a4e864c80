// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Normal and quiet (cron) modes print text; JSON mode prints one event per line.

use serde::Serialize;
use std::time::Instant;

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Progress messages and results
    Normal,
    /// Results and problems only, for cron mails
    Quiet,
    /// JSON lines for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
pub struct Output {
    mode: OutputMode,
    started: Option<Instant>,
    deployment: Option<String>,
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            started: None,
            deployment: None,
        }
    }

    /// Start timing the operation on `ident`; later events are tagged with it.
    pub fn start(&mut self, ident: Option<&str>) {
        self.started = Some(Instant::now());
        self.deployment = ident.map(String::from);
    }

    fn elapsed_secs(&self) -> Option<f64> {
        self.started.map(|t| t.elapsed().as_secs_f64())
    }

    /// Print a progress message (normal mode only).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Print the final result of a command, with its duration when timed.
    pub fn success(&self, message: &str) {
        match (self.mode, self.elapsed_secs()) {
            (OutputMode::Json, _) => self.emit("success", message),
            (OutputMode::Normal, Some(elapsed)) => println!("{message} ({elapsed:.1}s)"),
            _ => println!("{message}"),
        }
    }

    /// Print a non-fatal warning.
    pub fn warning(&self, message: &str) {
        match self.mode {
            OutputMode::Json => self.emit("warning", message),
            _ => eprintln!("Warning: {message}"),
        }
    }

    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Json => self.emit("error", message),
            _ => eprintln!("Error: {message}"),
        }
    }

    /// Print a result: `human` in text modes, `value` as one JSON line otherwise.
    pub fn record<T: Serialize>(&self, human: &str, value: &T) {
        if self.mode != OutputMode::Json {
            println!("{human}");
        } else if let Ok(json) = serde_json::to_string(value) {
            println!("{json}");
        }
    }

    /// Write an event line; successes go to stdout, problems to stderr.
    fn emit(&self, event: &str, message: &str) {
        let line = JsonEvent {
            event,
            deployment: self.deployment.as_deref(),
            message,
            duration_secs: self.elapsed_secs(),
        };
        let Ok(json) = serde_json::to_string(&line) else {
            return;
        };
        if event == "success" {
            println!("{json}");
        } else {
            eprintln!("{json}");
        }
    }
}
