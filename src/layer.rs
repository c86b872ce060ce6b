use crate::async_sink::{in_worker, AsyncSink};
use crate::record::{Level, LogRecord};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events emitted by this crate are never forwarded, otherwise a failing
/// store would log its own failures into itself.
const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .map_or(false, |rest| rest.is_empty() || rest.starts_with("::"))
}

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and
/// fires them into an [`AsyncSink`].
///
/// The layer does no level filtering of its own: register filters on the
/// sink (see [`crate::filter`]) to decide what gets persisted. Database
/// I/O happens on the sink's worker, so an event only costs the caller a
/// queue push unless the queue is full.
pub struct SinkLayer {
    sink: AsyncSink,
}

impl SinkLayer {
    pub fn new(sink: AsyncSink) -> Self {
        SinkLayer { sink }
    }

    pub fn sink(&self) -> &AsyncSink {
        &self.sink
    }
}

/// Build a [`LogRecord`] from a `tracing` event.
pub fn record_from_event(event: &Event<'_>) -> LogRecord {
    let mut fields = BTreeMap::new();
    let mut message: Option<String> = None;

    let mut visitor = FieldVisitor { fields: &mut fields, message: &mut message };
    event.record(&mut visitor);

    let meta = event.metadata();
    LogRecord {
        timestamp: Utc::now(),
        level: Level::from(meta.level()),
        message: message.unwrap_or_default(),
        target: Some(meta.target().to_string()),
        fields,
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Store drivers log from inside the worker; queueing those would
        // feed the worker its own output.
        if is_own_target(event.metadata().target()) || in_worker() {
            return;
        }

        if let Err(e) = self.sink.fire_blocking(record_from_event(event)) {
            // Going through `tracing` here would re-enter this layer.
            eprintln!("log sink refused record: {}", e);
        }
    }
}

/// Collects an event's fields, pulling `message` out into its own slot.
pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, serde_json::Value>,
    pub message: &'a mut Option<String>,
}

impl FieldVisitor<'_> {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }

    fn put_text(&mut self, field: &Field, text: String) {
        match field.name() {
            "message" => *self.message = Some(text),
            _ => self.put(field, serde_json::Value::String(text)),
        }
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_text(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put_text(field, format!("{:?}", value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, value.to_string().into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}
