use serde_json::{json, Map, Value};
use std::io::Write;
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Writes every event as one JSON line, with the fields of each enclosing
/// span (e.g. `watch{analysis_id, mode}`) attached.
pub struct NdjsonTraceLayer<W: Write + Send + Sync + 'static> {
    writer: std::sync::Mutex<W>,
}

impl<W: Write + Send + Sync + 'static> NdjsonTraceLayer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: std::sync::Mutex::new(writer),
        }
    }
}

struct SpanFields(Map<String, Value>);

impl<S, W> Layer<S> for NdjsonTraceLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Write + Send + Sync + 'static,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut fields = Value::Object(Map::new());
        attrs.record(&mut JsonVisitor(&mut fields));
        if let (Some(span), Value::Object(map)) = (ctx.span(id), fields) {
            span.extensions_mut().insert(SpanFields(map));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let span = match ctx.span(id) {
            Some(s) => s,
            None => return,
        };
        let mut update = Value::Object(Map::new());
        values.record(&mut JsonVisitor(&mut update));
        let mut extensions = span.extensions_mut();
        if let (Some(existing), Value::Object(map)) = (extensions.get_mut::<SpanFields>(), update) {
            existing.0.extend(map);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut fields = json!({});
        event.record(&mut JsonVisitor(&mut fields));

        let mut span_list = Vec::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                let recorded = match span.extensions().get::<SpanFields>() {
                    Some(f) => Value::Object(f.0.clone()),
                    None => json!({}),
                };
                span_list.push(json!({
                    "name": span.name(),
                    "id": span.id().into_u64(),
                    "fields": recorded,
                }));
            }
        }

        let trace_id = match span_list.first().and_then(|s| s.get("id")) {
            Some(id) => id.to_string(),
            None => "none".to_string(),
        };

        let output = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": event.metadata().level().to_string(),
            "target": event.metadata().target(),
            "trace_id": trace_id,
            "span_list": span_list,
            "fields": fields,
        });

        if let Ok(mut w) = self.writer.lock() {
            let _ = writeln!(w, "{}", output);
        }
    }
}

struct JsonVisitor<'a>(&'a mut Value);

impl<'a> tracing::field::Visit for JsonVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0[field.name()] = json!(format!("{:?}", value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0[field.name()] = json!(value);
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0[field.name()] = json!(value);
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0[field.name()] = json!(value);
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0[field.name()] = json!(value);
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0[field.name()] = json!(value);
    }
}
