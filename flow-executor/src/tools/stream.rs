// Streaming Tool Output
// Forward-only recording proxy over a tool's lazy output sequence

use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

type CompletionHook = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Wraps a tool's output stream and buffers every yielded item.
///
/// The stream can be consumed once. When the inner stream is exhausted the
/// buffered items are handed to the completion hook, which the invoker uses to
/// finalize and persist the node's run info.
pub struct RecordingStream {
    inner: BoxStream<'static, Value>,
    buffer: Vec<Value>,
    on_complete: Option<CompletionHook>,
}

impl RecordingStream {
    pub fn new(inner: BoxStream<'static, Value>) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            on_complete: None,
        }
    }

    pub fn on_complete(mut self, hook: impl FnOnce(Vec<Value>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Items yielded so far
    pub fn buffered_items(&self) -> &[Value] {
        &self.buffer
    }

    /// Drain the stream and return its materialized value
    pub async fn materialize(mut self) -> Value {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        materialize(&items)
    }
}

impl Stream for RecordingStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(item)) => {
                this.buffer.push(item.clone());
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                if let Some(hook) = this.on_complete.take() {
                    hook(std::mem::take(&mut this.buffer));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for RecordingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingStream")
            .field("buffered", &self.buffer.len())
            .field("completed", &self.on_complete.is_none())
            .finish()
    }
}

/// Collapse streamed items into one value: string items are concatenated,
/// anything else (or an empty stream) becomes an array
pub fn materialize(items: &[Value]) -> Value {
    if !items.is_empty() && items.iter().all(Value::is_string) {
        let text: String = items.iter().filter_map(Value::as_str).collect();
        Value::String(text)
    } else {
        Value::Array(items.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_materialize_strings_concatenate() {
        assert_eq!(materialize(&[json!("Hel"), json!("lo")]), json!("Hello"));
        assert_eq!(materialize(&[json!(1), json!("a")]), json!([1, "a"]));
        assert_eq!(materialize(&[]), json!([]));
    }

    #[tokio::test]
    async fn test_recording_stream_replays_buffer_once_exhausted() {
        let recorded = Arc::new(Mutex::new(None));
        let sink = recorded.clone();

        let inner = stream::iter(vec![json!("a"), json!("b"), json!("c")]).boxed();
        let mut proxy = RecordingStream::new(inner).on_complete(move |items| {
            *sink.lock().unwrap() = Some(items);
        });

        assert_eq!(proxy.next().await, Some(json!("a")));
        assert_eq!(proxy.buffered_items().len(), 1);
        assert!(recorded.lock().unwrap().is_none());

        let rest: Vec<Value> = proxy.collect().await;
        assert_eq!(rest, vec![json!("b"), json!("c")]);

        let items = recorded.lock().unwrap().take().unwrap();
        assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_materialize_drains_stream() {
        let inner = stream::iter(vec![json!(1), json!(2)]).boxed();
        let value = RecordingStream::new(inner).materialize().await;
        assert_eq!(value, json!([1, 2]));
    }
}
