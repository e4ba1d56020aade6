#![forbid(unsafe_code)]

//! Tracing output for the browser.
//!
//! A page has no stdout, so `boot()` installs a registry with a
//! [`ConsoleLayer`] that forwards warnings and errors to `console.warn` and
//! `console.error`. Hosts that install their own global subscriber first
//! keep theirs; the layer is then skipped.

use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Where formatted lines go.
pub type ConsoleSink = fn(Level, &str);

/// Forwards events at or above `max_level` severity to a sink.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleLayer {
    max_level: Level,
    sink: ConsoleSink,
}

impl ConsoleLayer {
    #[must_use]
    pub fn new(max_level: Level, sink: ConsoleSink) -> Self {
        Self { max_level, sink }
    }
}

impl<S: Subscriber> Layer<S> for ConsoleLayer {
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        *metadata.level() <= self.max_level
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level {
            return;
        }
        let mut fields = EventLine::default();
        event.record(&mut fields);
        (self.sink)(*metadata.level(), &fields.finish(metadata.target()));
    }
}

/// `[virtualizer] target: message key=value ...`
#[derive(Default)]
struct EventLine {
    message: String,
    fields: String,
}

impl EventLine {
    fn finish(self, target: &str) -> String {
        let mut line = format!("[virtualizer] {target}: {}", self.message);
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                line.push(' ');
            }
            line.push_str(&self.fields);
        }
        line
    }

    fn push_field(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={value}", field.name());
    }
}

impl Visit for EventLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.push_field(field, format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field, format_args!("{value:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    static LINES: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

    fn collect(level: Level, line: &str) {
        LINES.lock().unwrap().push((level, line.to_owned()));
    }

    #[test]
    fn warnings_and_errors_reach_the_sink() {
        let subscriber =
            tracing_subscriber::registry().with(ConsoleLayer::new(Level::WARN, collect));
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("pass finished");
            tracing::info!(tracked = 3, "installed");
            tracing::warn!(err = %"detached", "install failed");
            tracing::error!(selector = "main p", "selector rejected");
        });
        let lines = std::mem::take(&mut *LINES.lock().unwrap());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, Level::WARN);
        assert!(lines[0].1.starts_with("[virtualizer] "));
        assert!(lines[0].1.ends_with(": install failed err=detached"));
        assert_eq!(lines[1].0, Level::ERROR);
        assert!(lines[1].1.ends_with(": selector rejected selector=main p"));
    }
}
