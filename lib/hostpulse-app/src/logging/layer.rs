use std::fmt::{self, Write as _};

use chrono::{SecondsFormat, Utc};
use tracing::{field, Event, Subscriber};
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

pub fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn layer::Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json {
        Layer::new()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_writer(writer)
            .boxed()
    } else {
        Layer::new()
            .event_format(PipeDelimitedFormatter)
            .with_ansi(false)
            .with_writer(writer)
            .boxed()
    }
}

/// Formats events as pipe-delimited lines.
///
/// ```text
/// 2026-01-31T23:59:59.123Z | HOSTPULSE | WARN | hostpulse_core::pipeline | worker:reader,elapsed_ms:9500 | Reader cycle is close to overrunning its interval.
/// ```
///
/// Structured fields come before the message, as comma-separated `key:value` pairs, and are omitted entirely when the
/// event has none. Fields of the enclosing spans are written ahead of the event's own fields.
pub struct PipeDelimitedFormatter;

impl<S, N> FormatEvent<S, N> for PipeDelimitedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} | HOSTPULSE | {} | {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            metadata.level(),
            metadata.target()
        )?;

        // Span fields are already rendered by the field formatter, so we just splice them in.
        let mut span_fields = String::new();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        if !span_fields.is_empty() {
                            span_fields.push(',');
                        }
                        span_fields.push_str(fields);
                    }
                }
            }
        }

        let mut visitor = FieldVisitor::new(writer.by_ref(), span_fields);
        event.record(&mut visitor);
        visitor.finish()?;

        writeln!(writer)
    }
}

struct FieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields: String,
    message: String,
}

impl<'writer> FieldVisitor<'writer> {
    fn new(writer: Writer<'writer>, span_fields: String) -> Self {
        Self {
            writer,
            fields: span_fields,
            message: String::new(),
        }
    }

    fn push_field(&mut self, field: &field::Field, value: fmt::Arguments<'_>) {
        // Writing into a `String` cannot fail.
        if field.name() == "message" {
            let _ = self.message.write_fmt(value);
        } else {
            if !self.fields.is_empty() {
                self.fields.push(',');
            }
            let _ = write!(self.fields, "{}:{}", field.name(), value);
        }
    }
}

impl field::Visit for FieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.push_field(field, format_args!("{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.push_field(field, format_args!("{}", value));
    }

    fn record_f64(&mut self, field: &field::Field, value: f64) {
        self.push_field(field, format_args!("{}", value));
    }

    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.push_field(field, format_args!("{}", value));
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.push_field(field, format_args!("{}", value));
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.push_field(field, format_args!("{}", value));
    }

    fn record_error(&mut self, field: &field::Field, value: &(dyn std::error::Error + 'static)) {
        self.push_field(field, format_args!("{}", value));
    }
}

impl VisitOutput<fmt::Result> for FieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        if !self.fields.is_empty() {
            write!(self.writer, " | {}", self.fields)?;
        }

        if !self.message.is_empty() {
            write!(self.writer, " | {}", self.message)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture<F: FnOnce()>(json: bool, f: F) -> String {
        let buffer = SharedBuffer::default();
        let mut config = LoggingConfiguration::console(tracing_subscriber::filter::LevelFilter::TRACE);
        config.log_format_json = json;

        let writer = buffer.clone();
        let subscriber = tracing_subscriber::registry().with(build_formatting_layer(&config, move || writer.clone()));
        tracing::subscriber::with_default(subscriber, f);

        buffer.contents()
    }

    #[test]
    fn fields_precede_message() {
        let output = capture(false, || {
            tracing::warn!(worker = "reader", elapsed_ms = 9500u64, "Cycle is close to overrunning.");
        });

        let line = output.trim_end();
        assert!(line.contains(" | HOSTPULSE | WARN | "), "{}", line);
        assert!(
            line.ends_with(" | worker:reader,elapsed_ms:9500 | Cycle is close to overrunning."),
            "{}",
            line
        );
    }

    #[test]
    fn message_only() {
        let output = capture(false, || tracing::info!("Started."));
        assert!(output.trim_end().ends_with("INFO | hostpulse_app::logging::layer::tests | Started."));
    }

    #[test]
    fn json_output() {
        let output = capture(true, || tracing::error!(attempt = 3u64, "Giving up."));
        let value: serde_json::Value = serde_json::from_str(output.trim_end()).unwrap();

        assert_eq!(value["level"], "ERROR");
        assert_eq!(value["message"], "Giving up.");
        assert_eq!(value["attempt"], 3);
    }
}
