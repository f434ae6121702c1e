use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths
const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 9;

/// `[timestamp] [component] [level] message`
pub struct MsgPakLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with a component tag, e.g. `component_info!("admin", "listening on {}", addr)`
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl MsgPakLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_color(service_name, color_supported())
    }

    pub fn with_color(service_name: impl Into<String>, color_enabled: bool) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled,
        }
    }

    /// Fixed-width component column; events without a component use the
    /// service name.
    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    /// Padded level label and its color
    fn level_style(&self, level: &tracing::Level) -> (String, &'static str) {
        let (label, color) = match *level {
            tracing::Level::ERROR => ("✗ ERROR", COLOR_BRIGHT_RED),
            tracing::Level::WARN => ("⚠ WARN", COLOR_BRIGHT_YELLOW),
            tracing::Level::INFO => ("ℹ INFO", COLOR_GREEN),
            tracing::Level::DEBUG => ("◦ DEBUG", COLOR_BRIGHT_GRAY),
            tracing::Level::TRACE => ("◦ TRACE", COLOR_BRIGHT_GRAY),
        };
        let color = if self.color_enabled { color } else { "" };
        (format!("{:<width$}", label, width = LOG_LEVEL_WIDTH), color)
    }
}

impl<S, N> FormatEvent<S, N> for MsgPakLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let (label, color) = self.level_style(level);
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_component(visitor.component.as_deref()),
            color,
            label,
            reset
        )?;

        writeln!(writer, "{}{}", visitor.message, reset)
    }
}

/// Pulls `message` and `component` out of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                let comp = format!("{:?}", value);
                self.component = Some(comp.trim_matches('"').to_string());
            }
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
    if std::env::var("TERM").map(|t| t == "dumb").unwrap_or(false) {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_column() {
        let f = MsgPakLogFormatter::with_color("msgpak", false);
        assert_eq!(f.format_component(None).len(), COMPONENT_WIDTH);
        assert!(f.format_component(Some("admin")).starts_with("msgpak-admin "));

        let long = f.format_component(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_no_color_codes_when_disabled() {
        let f = MsgPakLogFormatter::with_color("msgpak", false);
        let (label, color) = f.level_style(&tracing::Level::WARN);
        assert!(label.starts_with("⚠ WARN"));
        assert_eq!(color, "");

        let f = MsgPakLogFormatter::with_color("msgpak", true);
        assert_eq!(f.level_style(&tracing::Level::ERROR).1, COLOR_BRIGHT_RED);
    }
}
