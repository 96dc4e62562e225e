//! Serialized output for capture records.
//!
//! [`SyncWriter`] makes every write to the wrapped writer exclusive, and
//! [`CaptureSink`] moves the writes off the exchange path onto a dedicated
//! thread so a slow sink never holds up traffic.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A cloneable writer whose writes are serialized by a shared lock.
#[derive(Debug)]
pub struct SyncWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SyncWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write> SyncWriter<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Writes all of `buf` and flushes while holding the lock once, so the
    /// record is never interleaved with another writer's output.
    pub fn write_record(&self, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.write_all(buf)?;
        inner.flush()
    }

    /// Locks the underlying writer.
    pub fn lock(&self) -> MutexGuard<'_, W> {
        self.inner.lock()
    }
}

impl<W: Write> Write for SyncWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// Queue of capture records drained by a background thread.
///
/// [`submit`](Self::submit) never blocks. Write failures are logged and
/// otherwise ignored. The worker exits once every handle has been dropped and
/// the queue is drained.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    tx: mpsc::UnboundedSender<String>,
}

/// Join handle for a [`CaptureSink`] worker.
#[derive(Debug)]
pub struct SinkWorker {
    handle: thread::JoinHandle<()>,
}

impl SinkWorker {
    /// Blocks until the worker has written every queued record and exited.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("capture sink worker panicked");
        }
    }
}

impl CaptureSink {
    /// Starts a worker writing records to `writer`.
    pub fn spawn<W>(writer: SyncWriter<W>) -> io::Result<(Self, SinkWorker)>
    where
        W: Write + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let handle = thread::Builder::new()
            .name("hflow-capture".to_string())
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    if let Err(e) = writer.write_record(record.as_bytes()) {
                        tracing::error!("unable to write capture record: {}", e);
                    }
                }
                tracing::trace!("capture sink closed");
            })?;

        Ok((Self { tx }, SinkWorker { handle }))
    }

    /// Queues `record` for writing.
    pub fn submit(&self, record: String) {
        if self.tx.send(record).is_err() {
            tracing::error!("capture sink is closed, dropping record");
        }
    }
}
