//! Transactional in-memory document store.
//!
//! Typed tables behind a single mutex; a transaction is a closure run under
//! the lock. Secondary access paths (messages per thread, streams per
//! thread, deltas per stream, tool calls per thread) are maintained inline.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use strand_domain::{Delta, Message, StreamRecord, Thread, ToolCallRecord, ToolCallStatus};

/// All persistent tables. Only ever touched inside [`Store::read`] /
/// [`Store::mutate`] closures.
#[derive(Default)]
pub struct Tables {
    threads: HashMap<Uuid, Thread>,
    /// Messages per thread, insertion-ordered.
    messages: HashMap<Uuid, Vec<Message>>,
    streams: HashMap<Uuid, StreamRecord>,
    /// Stream ids per thread, allocation-ordered (ascending seq).
    streams_by_thread: HashMap<Uuid, Vec<Uuid>>,
    /// Deltas per stream, ascending seq (dense from 0).
    deltas: HashMap<Uuid, Vec<Delta>>,
    /// Tool calls per thread, creation-ordered.
    tool_calls: HashMap<Uuid, Vec<ToolCallRecord>>,
}

impl Tables {
    // ── Threads ────────────────────────────────────────────────────

    pub fn insert_thread(&mut self, thread: Thread) {
        self.threads.insert(thread.id, thread);
    }

    pub fn thread(&self, id: &Uuid) -> Option<&Thread> {
        self.threads.get(id)
    }

    pub fn thread_mut(&mut self, id: &Uuid) -> Option<&mut Thread> {
        self.threads.get_mut(id)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// Remove a thread and everything it owns. Returns the removed
    /// records so the caller can cancel any scheduled work they hold.
    pub fn remove_thread(&mut self, id: &Uuid) -> Option<RemovedThread> {
        let thread = self.threads.remove(id)?;
        let messages = self.messages.remove(id).unwrap_or_default();
        let tool_calls = self.tool_calls.remove(id).unwrap_or_default();
        let stream_ids = self.streams_by_thread.remove(id).unwrap_or_default();
        let mut streams = Vec::with_capacity(stream_ids.len());
        for stream_id in stream_ids {
            if let Some(stream) = self.streams.remove(&stream_id) {
                streams.push(stream);
            }
            self.deltas.remove(&stream_id);
        }
        Some(RemovedThread {
            thread,
            messages,
            streams,
            tool_calls,
        })
    }

    // ── Messages ───────────────────────────────────────────────────

    pub fn push_message(&mut self, message: Message) {
        self.messages
            .entry(message.thread_id)
            .or_default()
            .push(message);
    }

    pub fn messages(&self, thread_id: &Uuid) -> &[Message] {
        self.messages
            .get(thread_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message_mut(&mut self, thread_id: &Uuid, msg_id: &str) -> Option<&mut Message> {
        self.messages
            .get_mut(thread_id)?
            .iter_mut()
            .find(|m| m.id == msg_id)
    }

    /// Insert or overwrite a message by id (a message only ever overwrites
    /// its own parts).
    pub fn upsert_message(&mut self, message: Message) {
        let list = self.messages.entry(message.thread_id).or_default();
        match list.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => list.push(message),
        }
    }

    // ── Streams & deltas ───────────────────────────────────────────

    pub fn insert_stream(&mut self, stream: StreamRecord) {
        self.streams_by_thread
            .entry(stream.thread_id)
            .or_default()
            .push(stream.id);
        self.deltas.insert(stream.id, Vec::new());
        self.streams.insert(stream.id, stream);
    }

    pub fn stream(&self, id: &Uuid) -> Option<&StreamRecord> {
        self.streams.get(id)
    }

    pub fn stream_mut(&mut self, id: &Uuid) -> Option<&mut StreamRecord> {
        self.streams.get_mut(id)
    }

    /// Stream ids of a thread in allocation order (ascending seq).
    pub fn thread_streams(&self, thread_id: &Uuid) -> &[Uuid] {
        self.streams_by_thread
            .get(thread_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn remove_stream(&mut self, id: &Uuid) -> Option<StreamRecord> {
        let stream = self.streams.remove(id)?;
        if let Some(ids) = self.streams_by_thread.get_mut(&stream.thread_id) {
            ids.retain(|s| s != id);
        }
        self.deltas.remove(id);
        Some(stream)
    }

    /// Number of deltas written to a stream (== the next dense seq).
    pub fn delta_count(&self, stream_id: &Uuid) -> usize {
        self.deltas.get(stream_id).map(Vec::len).unwrap_or(0)
    }

    /// Append a delta. The caller supplies the expected seq; appending is
    /// refused unless it equals the current count (dense from 0).
    pub fn push_delta(&mut self, delta: Delta) -> bool {
        let list = self.deltas.entry(delta.stream_id).or_default();
        if delta.seq as usize != list.len() {
            return false;
        }
        list.push(delta);
        true
    }

    pub fn deltas(&self, stream_id: &Uuid) -> &[Delta] {
        self.deltas
            .get(stream_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove up to `batch` deltas from the front of a stream's log.
    /// Returns how many remain.
    pub fn drain_deltas(&mut self, stream_id: &Uuid, batch: usize) -> usize {
        match self.deltas.get_mut(stream_id) {
            Some(list) => {
                let take = batch.min(list.len());
                list.drain(..take);
                list.len()
            }
            None => 0,
        }
    }

    // ── Tool calls ─────────────────────────────────────────────────

    pub fn push_tool_call(&mut self, record: ToolCallRecord) {
        self.tool_calls
            .entry(record.thread_id)
            .or_default()
            .push(record);
    }

    pub fn tool_calls(&self, thread_id: &Uuid) -> &[ToolCallRecord] {
        self.tool_calls
            .get(thread_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn tool_call(&self, thread_id: &Uuid, tool_call_id: &str) -> Option<&ToolCallRecord> {
        self.tool_calls
            .get(thread_id)?
            .iter()
            .find(|c| c.tool_call_id == tool_call_id)
    }

    pub fn tool_call_mut(
        &mut self,
        thread_id: &Uuid,
        tool_call_id: &str,
    ) -> Option<&mut ToolCallRecord> {
        self.tool_calls
            .get_mut(thread_id)?
            .iter_mut()
            .find(|c| c.tool_call_id == tool_call_id)
    }

    pub fn pending_tool_calls(&self, thread_id: &Uuid) -> usize {
        self.tool_calls(thread_id)
            .iter()
            .filter(|c| c.status == ToolCallStatus::Pending)
            .count()
    }

    /// All pending tool calls across threads (the recovery sweep input).
    pub fn all_pending_tool_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.tool_calls
            .values()
            .flatten()
            .filter(|c| c.status == ToolCallStatus::Pending)
    }
}

/// Everything removed by a cascading thread delete.
pub struct RemovedThread {
    pub thread: Thread,
    pub messages: Vec<Message>,
    pub streams: Vec<StreamRecord>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// The store: tables behind one lock. A closure passed to `mutate` is a
/// transaction — it observes and produces a consistent snapshot.
#[derive(Default)]
pub struct Store {
    inner: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a read-only transaction.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Run a mutating transaction.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
