//! Delta streamer — batches the handler's parts into throttled,
//! compacted delta writes.
//!
//! Compaction rules, applied pre-write: drop `tool-input-delta` parts,
//! strip provider metadata from every part, and join adjacent
//! text/reasoning deltas that share an id.

use std::time::{Duration, Instant};

use uuid::Uuid;

use strand_domain::{Part, Result};

use crate::Engine;

pub(crate) struct DeltaStreamer<'e> {
    engine: &'e Engine,
    stream_id: Uuid,
    lock_id: String,
    msg_id: Option<String>,
    queue: Vec<Part>,
    next_seq: u64,
    last_flush: Instant,
    throttle: Duration,
}

impl<'e> DeltaStreamer<'e> {
    pub fn new(engine: &'e Engine, stream_id: Uuid, lock_id: String, next_seq: u64) -> Self {
        Self {
            engine,
            stream_id,
            lock_id,
            msg_id: None,
            queue: Vec::new(),
            next_seq,
            last_flush: Instant::now(),
            throttle: Duration::from_millis(engine.config.throttle_ms),
        }
    }

    /// Set the current message id, flushing queued parts of the previous
    /// message first.
    pub fn set_message(&mut self, msg_id: String) -> Result<()> {
        if self.msg_id.as_deref() != Some(msg_id.as_str()) {
            self.flush()?;
            self.msg_id = Some(msg_id);
        }
        Ok(())
    }

    /// Queue a part; writes go out at most once per throttle window.
    pub fn push(&mut self, part: Part) -> Result<()> {
        self.queue.push(part);
        if self.last_flush.elapsed() >= self.throttle {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the queued parts as one compacted delta.
    pub fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let parts = compact_parts(std::mem::take(&mut self.queue));
        if parts.is_empty() {
            return Ok(());
        }
        let Some(msg_id) = self.msg_id.clone() else {
            tracing::warn!(
                stream_id = %self.stream_id,
                "dropping {} parts streamed before any start part",
                parts.len()
            );
            return Ok(());
        };
        self.engine
            .add_delta(self.stream_id, &self.lock_id, self.next_seq, &msg_id, parts)?;
        self.next_seq += 1;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Flush the tail and mark the stream finished.
    pub fn finish(mut self) -> Result<()> {
        self.flush()?;
        self.engine.finish_stream(self.stream_id)
    }
}

/// Pre-write delta compaction.
pub(crate) fn compact_parts(parts: Vec<Part>) -> Vec<Part> {
    let mut out: Vec<Part> = Vec::new();
    for mut part in parts {
        if matches!(part, Part::ToolInputDelta { .. }) {
            continue;
        }
        part.strip_provider_metadata();

        if let Some(last) = out.last_mut() {
            match (last, &part) {
                (
                    Part::TextDelta {
                        id: last_id,
                        delta: last_delta,
                        ..
                    },
                    Part::TextDelta { id, delta, .. },
                ) if last_id == id => {
                    last_delta.push_str(delta);
                    continue;
                }
                (
                    Part::ReasoningDelta {
                        id: last_id,
                        delta: last_delta,
                        ..
                    },
                    Part::ReasoningDelta { id, delta, .. },
                ) if last_id == id => {
                    last_delta.push_str(delta);
                    continue;
                }
                _ => {}
            }
        }
        out.push(part);
    }
    out
}
