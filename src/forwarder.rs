//! Collapsed forwarding of one upstream response to many clients
//!
//! The first request for an uncached object streams the origin response
//! into a [`CollapsedForwarder`]. Requests arriving while the fetch is in
//! flight attach a [`ForwarderReader`] and replay the blocks already written
//! before following the live stream, so the origin is fetched only once.
//! When the origin body fails or ends early, every reader gets the blocks
//! already written followed by the error, never a clean end of stream.

use crate::error::{CacheError, Result};
use crate::ranges::ByteRange;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    blocks: usize,
    written: usize,
    closed: bool,
    failed: bool,
}

struct Buffer {
    /// Unused tail of the pre-sized backing allocation
    spare: BytesMut,
    blocks: Vec<Bytes>,
    written: usize,
    closed: bool,
    error: Option<CacheError>,
}

/// A fixed-size response buffer written once and read by many
pub struct CollapsedForwarder {
    status: u16,
    headers: HeaderMap,
    capacity: usize,
    buffer: Mutex<Buffer>,
    progress: watch::Sender<Progress>,
}

impl std::fmt::Debug for CollapsedForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollapsedForwarder")
            .field("status", &self.status)
            .field("capacity", &self.capacity)
            .field("progress", &*self.progress.borrow())
            .finish()
    }
}

impl CollapsedForwarder {
    /// Create a forwarder for a response of known length
    ///
    /// Returns `None` when the length is unknown (negative), in which case the
    /// response cannot be collapsed.
    pub fn new(status: u16, headers: HeaderMap, content_length: i64) -> Option<Arc<Self>> {
        if content_length < 0 {
            return None;
        }
        let capacity = content_length as usize;
        let (progress, _) = watch::channel(Progress::default());
        Some(Arc::new(CollapsedForwarder {
            status,
            headers,
            capacity,
            buffer: Mutex::new(Buffer {
                spare: BytesMut::with_capacity(capacity),
                blocks: Vec::new(),
                written: 0,
                closed: false,
                error: None,
            }),
            progress,
        }))
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far
    pub fn written(&self) -> usize {
        self.buffer.lock().written
    }

    pub fn is_closed(&self) -> bool {
        self.progress.borrow().closed
    }

    /// Append a block
    ///
    /// Data beyond the declared length is not accepted: the part that fits is
    /// written and a short-write error reports how much.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return Err(CacheError::InternalError(
                "write to a closed forwarder".to_string(),
            ));
        }

        let n = data.len().min(self.capacity - buffer.written);
        if n > 0 {
            buffer.spare.extend_from_slice(&data[..n]);
            let block = buffer.spare.split().freeze();
            buffer.blocks.push(block);
            buffer.written += n;
            let blocks = buffer.blocks.len();
            self.progress.send_replace(Progress {
                blocks,
                written: buffer.written,
                closed: false,
                failed: false,
            });
        }

        if n < data.len() {
            return Err(CacheError::ShortWrite {
                written: n,
                requested: data.len(),
            });
        }
        Ok(n)
    }

    /// Mark the stream complete; later calls have no effect
    pub fn close(&self) {
        self.finish(None);
    }

    /// Mark the stream failed; readers see `error` after the written blocks
    pub fn fail(&self, error: CacheError) {
        self.finish(Some(error));
    }

    fn finish(&self, error: Option<CacheError>) {
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return;
        }
        buffer.closed = true;
        let failed = error.is_some();
        buffer.error = error;
        let blocks = buffer.blocks.len();
        self.progress.send_replace(Progress {
            blocks,
            written: buffer.written,
            closed: true,
            failed,
        });
    }

    pub fn is_failed(&self) -> bool {
        self.progress.borrow().failed
    }

    fn failure(&self) -> CacheError {
        self.buffer
            .lock()
            .error
            .clone()
            .unwrap_or_else(|| CacheError::UpstreamError("collapsed fetch failed".to_string()))
    }

    /// Copy an upstream body stream into the forwarder, closing it at the end
    ///
    /// A body error, or a body shorter than the declared length, fails the
    /// forwarder. A body longer than the declared length is cut at capacity:
    /// readers get a complete response but the short-write error is returned.
    pub async fn forward(&self, mut body: BoxStream<'static, Result<Bytes>>) -> Result<()> {
        let mut result = Ok(());
        while let Some(chunk) = body.next().await {
            if let Err(e) = chunk.and_then(|c| self.write(&c)) {
                result = Err(e);
                break;
            }
        }

        let written = self.written();
        match &result {
            Err(CacheError::ShortWrite { .. }) => self.close(),
            Err(e) => self.fail(e.clone()),
            Ok(()) if written < self.capacity => {
                let e = CacheError::UpstreamError(format!(
                    "origin body ended after {} of {} bytes",
                    written, self.capacity
                ));
                self.fail(e.clone());
                result = Err(e);
            }
            Ok(()) => self.close(),
        }
        debug!("Collapsed forwarder finished: written={}, capacity={}", written, self.capacity);
        result
    }

    /// Attach a reader that replays from the first block
    pub fn reader(self: &Arc<Self>) -> ForwarderReader {
        ForwarderReader {
            forwarder: self.clone(),
            rx: self.progress.subscribe(),
            next: 0,
            failure_reported: false,
        }
    }

    /// Wait until the producer has closed the stream
    pub async fn wait_complete(&self) {
        let mut rx = self.progress.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|p| p.closed).await;
    }

    /// Copy out a closed range of the body as soon as it has been written
    ///
    /// Fails when the range lies outside the declared length, or when the
    /// stream fails before reaching the end of the range.
    pub async fn read_range(&self, range: ByteRange) -> Result<Bytes> {
        if range.is_open() || range.start > range.end || range.end as u64 >= self.capacity as u64 {
            return Err(CacheError::InternalError(format!(
                "range {} outside forwarded length {}",
                range, self.capacity
            )));
        }
        let (start, end) = (range.start as usize, range.end as usize + 1);
        let mut rx = self.progress.subscribe();
        let written = rx
            .wait_for(|p| p.written >= end || p.closed)
            .await
            .map(|p| p.written)
            .unwrap_or(0);
        if written < end {
            return Err(self.failure());
        }

        let buffer = self.buffer.lock();
        let mut out = BytesMut::with_capacity(end - start);
        let mut offset = 0;
        for block in &buffer.blocks {
            let block_end = offset + block.len();
            if block_end > start {
                let lo = start.max(offset) - offset;
                let hi = end.min(block_end) - offset;
                out.extend_from_slice(&block[lo..hi]);
            }
            offset = block_end;
            if offset >= end {
                break;
            }
        }
        Ok(out.freeze())
    }

    /// The complete body, once the producer has closed the stream
    pub fn body(&self) -> Result<Bytes> {
        let buffer = self.buffer.lock();
        if !buffer.closed {
            return Err(CacheError::InternalError(
                "forwarder body requested before close".to_string(),
            ));
        }
        if let Some(e) = &buffer.error {
            return Err(e.clone());
        }
        if buffer.blocks.len() == 1 {
            return Ok(buffer.blocks[0].clone());
        }
        let mut body = BytesMut::with_capacity(buffer.written);
        for block in &buffer.blocks {
            body.extend_from_slice(block);
        }
        Ok(body.freeze())
    }
}

/// Follows a forwarder from its first block to the end of the stream
pub struct ForwarderReader {
    forwarder: Arc<CollapsedForwarder>,
    rx: watch::Receiver<Progress>,
    next: usize,
    failure_reported: bool,
}

impl ForwarderReader {
    /// The next block, waiting for the producer if needed
    ///
    /// `None` at the end of a complete stream. A failed stream yields its
    /// error once after the last written block.
    pub async fn next_block(&mut self) -> Option<Result<Bytes>> {
        loop {
            let progress = *self.rx.borrow_and_update();
            if self.next < progress.blocks {
                let block = self.forwarder.buffer.lock().blocks.get(self.next).cloned();
                self.next += 1;
                return block.map(Ok);
            }
            if progress.closed {
                if progress.failed && !self.failure_reported {
                    self.failure_reported = true;
                    return Some(Err(self.forwarder.failure()));
                }
                return None;
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_block().await.map(|b| (b, reader))
        })
        .boxed()
    }
}

/// In-flight forwarders by cache key
#[derive(Debug, Default)]
pub struct ForwarderRegistry {
    inflight: Mutex<HashMap<String, Arc<CollapsedForwarder>>>,
}

impl ForwarderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CollapsedForwarder>> {
        self.inflight.lock().get(key).cloned()
    }

    /// Register a forwarder unless one is already in flight for `key`
    pub fn register(&self, key: &str, forwarder: Arc<CollapsedForwarder>) -> bool {
        let mut inflight = self.inflight.lock();
        if inflight.contains_key(key) {
            return false;
        }
        inflight.insert(key.to_string(), forwarder);
        true
    }

    pub fn remove(&self, key: &str) {
        self.inflight.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }
}
