//! Line-oriented server-sent-events decoder.
//!
//! Fed one line at a time with the line terminator already stripped. A blank
//! line dispatches the accumulated frame. `retry:` is ignored: reconnect
//! timing belongs to the caller's retry policy.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // comment / keep-alive
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                }
            }
            other => {
                tracing::trace!("[sse] ignoring unknown field {:?}", other);
            }
        }
        None
    }

    /// Called at end of stream. A frame without its terminating blank line is
    /// incomplete and dropped.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.data.is_empty() {
            tracing::debug!(
                "[sse] discarding unterminated frame ({} data lines) at end of stream",
                self.data.len()
            );
        }
        self.reset_frame();
        None
    }

    /// Drops whatever the current frame has accumulated, e.g. after one of
    /// its lines turned out to be unreadable.
    pub fn discard_frame(&mut self) {
        if !self.data.is_empty() || self.event.is_some() {
            tracing::debug!("[sse] discarding partial frame ({} data lines)", self.data.len());
        }
        self.reset_frame();
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.reset_frame();
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(frame)
    }

    fn reset_frame(&mut self) {
        self.event = None;
        self.data.clear();
        self.id = None;
    }
}
