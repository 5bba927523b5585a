use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// `[timestamp] [component] [level] message` lines
pub struct MeshLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl MeshLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    #[cfg(test)]
    fn plain(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            color_enabled: false,
        }
    }

    /// Fixed-width service column; a `component` field replaces the service name
    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(&self, level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, timestamp: &str, level: &Level, fields: &FieldVisitor) -> String {
        let (cyan, color, reset) = if self.color_enabled {
            (COLOR_CYAN, self.color_for_level(level), COLOR_RESET)
        } else {
            ("", "", "")
        };
        format!(
            "{}[{}] [{}] [{}{}{}] {}{}",
            cyan,
            timestamp,
            self.format_service_name(fields.component.as_deref()),
            color,
            self.format_log_level(level),
            reset,
            fields.message,
            reset
        )
    }
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let mut fields = FieldVisitor::default();
        event.record(&mut fields);
        writeln!(writer, "{}", self.render(&timestamp, event.metadata().level(), &fields))
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

fn unquote(rendered: String) -> String {
    match rendered.strip_prefix('"').and_then(|inner| inner.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => rendered,
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = unquote(format!("{:?}", value)),
            "component" => self.component = Some(unquote(format!("{:?}", value))),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

fn color_supported() -> bool {
    std::env::var("TERM").map_or(false, |term| term != "dumb") && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_column_is_fixed_width() {
        let formatter = MeshLogFormatter::plain("mesh");
        assert_eq!(formatter.format_service_name(None).len(), SERVICE_NAME_WIDTH);
        assert!(formatter.format_service_name(Some("peers")).starts_with("mesh-peers "));

        let long = formatter.format_service_name(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), SERVICE_NAME_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_plain_line_layout() {
        let formatter = MeshLogFormatter::plain("mesh");
        let fields = FieldVisitor {
            message: "Peer 10.0.0.2:7400 connected".to_string(),
            component: Some("peers".to_string()),
        };
        let line = formatter.render("2024-01-01 00:00:00.000", &Level::INFO, &fields);
        assert_eq!(
            line,
            "[2024-01-01 00:00:00.000] [mesh-peers          ] [ℹ INFO   ] Peer 10.0.0.2:7400 connected"
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"peers\"".to_string()), "peers");
        assert_eq!(unquote("plain".to_string()), "plain");
        assert_eq!(unquote("\"".to_string()), "\"");
    }
}
