//! Output formatting: JSON, compact JSON, plain.
//!
//! Renders results and live query events in the format selected by
//! `--output`. Plain output is a human-readable event log.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::Value;

use tidepool_core::{LiveEvent, LiveEventKind, LiveResult};

use crate::cli::{ColorMode, OutputFormat};

/// Output settings resolved from flags and config.
#[derive(Debug, Clone, Copy)]
pub struct OutputOpts {
    pub format: OutputFormat,
    pub color: bool,
    pub quiet: bool,
}

impl OutputOpts {
    pub fn print(&self, output: &str) {
        print_output(output, self.quiet);
    }
}

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

/// Print rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render an arbitrary JSON value.
pub fn render_value(format: OutputFormat, value: &Value) -> String {
    match format {
        OutputFormat::Json => render_json_pretty(value),
        OutputFormat::JsonCompact => render_json_compact(value),
        OutputFormat::Plain => render_plain(value),
    }
}

/// Render a materialized live query result.
pub fn render_result(format: OutputFormat, result: &LiveResult) -> String {
    match format {
        OutputFormat::Json => render_json_pretty(result),
        OutputFormat::JsonCompact => render_json_compact(result),
        OutputFormat::Plain => match result {
            LiveResult::List(docs) => docs
                .iter()
                .map(render_json_compact)
                .collect::<Vec<_>>()
                .join("\n"),
            LiveResult::One(Some(doc)) => render_json_compact(doc),
            LiveResult::One(None) => "(no document)".into(),
            LiveResult::Count(n) => n.to_string(),
            LiveResult::Distinct(values) => values
                .iter()
                .map(render_plain)
                .collect::<Vec<_>>()
                .join("\n"),
        },
    }
}

/// Render one live query event.
///
/// Structured formats emit `{"event", "payload", "hint"}` objects; plain
/// output prefixes a (colored) event label.
pub fn render_event(format: OutputFormat, event: &LiveEvent, color: bool) -> String {
    let kind = event.kind();
    let (payload, hint) = match event {
        LiveEvent::Init(response) => (response.clone(), Value::Null),
        LiveEvent::Mutation(m) => (m.payload.clone(), m.hint.clone()),
        LiveEvent::Error { mutation, message } => {
            (Value::String(message.clone()), mutation.payload.clone())
        }
    };

    match format {
        OutputFormat::Json | OutputFormat::JsonCompact => {
            let record = serde_json::json!({
                "event": kind.as_ref(),
                "payload": payload,
                "hint": hint,
            });
            if format == OutputFormat::Json {
                render_json_pretty(&record)
            } else {
                render_json_compact(&record)
            }
        }
        OutputFormat::Plain => {
            let label = format!("{:<12}", kind.as_ref());
            let label = if color { paint(kind, &label) } else { label };
            let detail = match hint {
                Value::Null => render_plain(&payload),
                hint => format!("{} @ {}", render_plain(&payload), render_plain(&hint)),
            };
            format!("{label} {detail}")
        }
    }
}

fn paint(kind: LiveEventKind, label: &str) -> String {
    match kind {
        LiveEventKind::Init => label.bold().to_string(),
        LiveEventKind::Add => label.green().to_string(),
        LiveEventKind::Update => label.yellow().to_string(),
        LiveEventKind::Remove => label.red().to_string(),
        LiveEventKind::DistinctSync => label.cyan().to_string(),
        LiveEventKind::Error => label.bright_red().bold().to_string(),
    }
}

// ── Format-specific renderers ────────────────────────────────────────

fn render_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => render_json_compact(other),
    }
}

/// Pretty-printed JSON.
pub(crate) fn render_json_pretty<T: Serialize + ?Sized>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

/// Compact single-line JSON.
pub(crate) fn render_json_compact<T: Serialize + ?Sized>(data: &T) -> String {
    serde_json::to_string(data).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}
