use std::collections::VecDeque;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

/// One decoded unit of the engine's stdout, in byte order of arrival
/// (spec §4.3).
#[derive(Debug, Clone)]
pub enum Frame {
    /// A line that parsed as a JSON object.
    Framed { raw: Value, line_number: u64 },
    /// A line that did not parse as JSON — forwarded non-fatally so the
    /// classifier can still attempt a best-effort extraction (spec §4.4
    /// "unknown event type" path covers this at the classifier layer; the
    /// codec itself never drops a line).
    Log { text: String, line_number: u64 },
    /// The read loop hit a terminal IO error; one `Error` frame is emitted
    /// then the loop stops.
    Error { message: String },
}

/// Fixed-capacity ring buffer of recent stderr lines, used only for
/// diagnostics on process death (spec §4.3 ADD note — bounded, not an
/// unbounded forwarding channel, since nothing consumes stderr live).
pub struct StderrRing {
    capacity: usize,
    lines: VecDeque<String>,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Reads an async byte stream one line at a time and decodes each line into
/// a [`Frame`]. Never blocks the writer side: backpressure is the caller's
/// responsibility (it simply stops calling `next_frame`). The line stream
/// itself is a [`LinesStream`], following the teacher's `tokio_stream::
/// wrappers::LinesStream` + `StreamExt` idiom for adapting `tokio::io::Lines`
/// into a pollable stream (`api/routes.rs`'s stdout-line SSE relay).
pub struct FrameCodec<R> {
    lines: LinesStream<BufReader<R>>,
    line_number: u64,
}

impl<R: AsyncRead + Unpin> FrameCodec<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LinesStream::new(BufReader::new(reader).lines()),
            line_number: 0,
        }
    }

    /// Returns the next frame, or `None` on clean EOF.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match self.lines.next().await.transpose() {
            Ok(Some(line)) => {
                self.line_number += 1;
                let line_number = self.line_number;
                if line.trim().is_empty() {
                    return Some(Frame::Log {
                        text: line,
                        line_number,
                    });
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) if value.is_object() => Some(Frame::Framed {
                        raw: value,
                        line_number,
                    }),
                    _ => Some(Frame::Log {
                        text: line,
                        line_number,
                    }),
                }
            }
            Ok(None) => None,
            Err(e) => Some(Frame::Error {
                message: e.to_string(),
            }),
        }
    }
}
