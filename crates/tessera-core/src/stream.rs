//! Streamed partial output of a running generation.
//!
//! An [`OutputBuffer`] is written by exactly one task (the one driving the
//! generation) and read by any number of observers. Chunks are never
//! rewritten or removed, so a reader that drops can resume from the offset it
//! last saw. Closing the buffer is the terminal marker.

use std::sync::{Arc, Mutex};

use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// One entry in an output buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputChunk {
    /// Partial text produced by the capability.
    Delta { text: String },
    /// A new attempt started; deltas after this belong to it.
    Retry { attempt: u32 },
}

#[derive(Default)]
struct BufferState {
    chunks: Vec<OutputChunk>,
    closed: bool,
}

/// Append-only chunk sequence with a terminal marker.
pub struct OutputBuffer {
    state: Mutex<BufferState>,
    version: watch::Sender<u64>,
}

impl OutputBuffer {
    pub fn new() -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(BufferState::default()),
            version,
        })
    }

    /// Append a chunk. Returns false once the buffer is closed.
    pub fn push(&self, chunk: OutputChunk) -> bool {
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.closed {
                return false;
            }
            state.chunks.push(chunk);
        }
        self.version.send_modify(|v| *v += 1);
        true
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(OutputChunk::Delta { text: text.into() })
    }

    /// Write the terminal marker. Idempotent.
    pub fn close(&self) {
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.version.send_modify(|v| *v += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    pub fn len(&self) -> usize {
        self.with_state(|s| s.chunks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<OutputChunk> {
        self.with_state(|s| s.chunks.clone())
    }

    /// Concatenated text of the latest attempt.
    pub fn latest_text(&self) -> String {
        self.with_state(|s| {
            let start = s
                .chunks
                .iter()
                .rposition(|c| matches!(c, OutputChunk::Retry { .. }))
                .map(|i| i + 1)
                .unwrap_or(0);
            s.chunks[start..]
                .iter()
                .filter_map(|c| match c {
                    OutputChunk::Delta { text } => Some(text.as_str()),
                    OutputChunk::Retry { .. } => None,
                })
                .collect()
        })
    }

    /// A reader starting at `offset` (0 = from the beginning).
    pub fn reader(self: &Arc<Self>, offset: usize) -> OutputReader {
        OutputReader {
            buffer: Arc::clone(self),
            offset,
            version: self.version.subscribe(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&BufferState) -> T) -> T {
        match self.state.lock() {
            Ok(s) => f(&s),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

/// Cursor over an [`OutputBuffer`].
pub struct OutputReader {
    buffer: Arc<OutputBuffer>,
    offset: usize,
    version: watch::Receiver<u64>,
}

impl OutputReader {
    /// Next chunk, waiting for the producer if needed. `None` once the buffer
    /// is closed and fully read.
    pub async fn next(&mut self) -> Option<OutputChunk> {
        loop {
            let (chunk, closed) = self.buffer.with_state(|s| {
                (s.chunks.get(self.offset).cloned(), s.closed)
            });
            if let Some(chunk) = chunk {
                self.offset += 1;
                return Some(chunk);
            }
            if closed {
                return None;
            }
            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Offset of the next chunk this reader will yield.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn into_stream(self) -> impl Stream<Item = OutputChunk> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|chunk| (chunk, reader))
        })
    }
}

/// Write-only handle given to the execution capability.
#[derive(Clone)]
pub struct OutputSink {
    buffer: Arc<OutputBuffer>,
}

impl OutputSink {
    pub fn new(buffer: Arc<OutputBuffer>) -> Self {
        Self { buffer }
    }

    /// A sink whose output nobody observes.
    pub fn discard() -> Self {
        Self::new(OutputBuffer::new())
    }

    pub fn emit(&self, text: impl Into<String>) {
        self.buffer.push_text(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reader_sees_all_chunks_then_end() {
        let buffer = OutputBuffer::new();
        buffer.push_text("hel");
        buffer.push_text("lo");
        buffer.close();

        let chunks: Vec<_> = buffer.reader(0).into_stream().collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(buffer.latest_text(), "hello");
    }

    #[tokio::test]
    async fn test_reader_waits_for_producer() {
        let buffer = OutputBuffer::new();
        let mut reader = buffer.reader(0);

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                buffer.push_text("late");
                buffer.close();
            })
        };

        assert_eq!(
            reader.next().await,
            Some(OutputChunk::Delta {
                text: "late".into()
            })
        );
        assert_eq!(reader.next().await, None);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_from_offset() {
        let buffer = OutputBuffer::new();
        for word in ["a", "b", "c"] {
            buffer.push_text(word);
        }

        let mut first = buffer.reader(0);
        first.next().await;
        let resume_at = first.offset();
        drop(first);

        buffer.close();
        let rest: Vec<_> = buffer.reader(resume_at).into_stream().collect().await;
        assert_eq!(
            rest,
            vec![
                OutputChunk::Delta { text: "b".into() },
                OutputChunk::Delta { text: "c".into() },
            ]
        );
    }

    #[test]
    fn test_closed_buffer_rejects_writes() {
        let buffer = OutputBuffer::new();
        buffer.close();
        buffer.close();
        assert!(!buffer.push_text("x"));
        assert!(buffer.is_empty());
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_latest_text_after_retry() {
        let buffer = OutputBuffer::new();
        buffer.push_text("partial");
        buffer.push(OutputChunk::Retry { attempt: 2 });
        buffer.push_text("fresh");
        assert_eq!(buffer.latest_text(), "fresh");
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_sink_emits_into_buffer() {
        let buffer = OutputBuffer::new();
        let sink = OutputSink::new(buffer.clone());
        sink.emit("token");
        assert_eq!(buffer.latest_text(), "token");
    }
}
