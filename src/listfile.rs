// ABOUTME: `WriteHandle` contract plus buffer- and file-backed sinks, and the listfile
// ABOUTME: writer thread function. Container format (ZIP/LZ4 packaging, magic/endian/config
// ABOUTME: preamble) is out of scope.

use std::fs::File;
use std::io::{self, Write};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::warn;

use crate::readout_worker::{BufferPool, ReadoutBuffer};

/// Sink contract the readout worker's listfile writer thread drives. Replaces
/// the original's inheritance hierarchy (file / zip-entry / network sinks)
/// with one trait implemented independently by each concrete sink.
pub trait WriteHandle: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// In-memory sink, mainly for tests and for callers who want to inspect
/// captured data without touching the filesystem.
#[derive(Debug, Default)]
pub struct BufferWriteHandle {
    pub buffer: Vec<u8>,
}

impl BufferWriteHandle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WriteHandle for BufferWriteHandle {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }
}

/// Plain, unpackaged file sink: one flat file of raw captured buffers, no
/// magic/preamble/compression. A real listfile container is an adapter built
/// on top of `WriteHandle`, not part of this core.
pub struct FileWriteHandle {
    file: File,
}

impl FileWriteHandle {
    pub fn create(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }
}

impl WriteHandle for FileWriteHandle {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    Running,
}

#[derive(Debug, Clone)]
pub struct ListfileWriterCounters {
    pub state: WriterState,
    pub t_start: Option<Instant>,
    pub t_end: Option<Instant>,
    pub writes: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
}

impl Default for ListfileWriterCounters {
    fn default() -> Self {
        Self {
            state: WriterState::Idle,
            t_start: None,
            t_end: None,
            writes: 0,
            bytes_written: 0,
            write_errors: 0,
        }
    }
}

/// Words to little-endian bytes, matching the wire byte order everywhere
/// else in this crate.
fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// Drains `filled_rx` until the sender side (the readout worker) drops it,
/// writing each buffer through `lfh` (if present — a `None` handle still
/// drains and recycles buffers, matching the original's "lfh may be null"
/// note) and returning the buffer to `pool` afterward.
pub fn run_writer(
    mut lfh: Option<Box<dyn WriteHandle>>,
    filled_rx: Receiver<ReadoutBuffer>,
    pool: Arc<BufferPool>,
    counters: Arc<Mutex<ListfileWriterCounters>>,
) {
    {
        let mut c = counters.lock().unwrap();
        c.state = WriterState::Running;
        c.t_start = Some(Instant::now());
    }

    for buffer in filled_rx.iter() {
        if let Some(handle) = lfh.as_mut() {
            let bytes = words_to_bytes(&buffer.words);
            match handle.write_all(&bytes) {
                Ok(()) => {
                    let mut c = counters.lock().unwrap();
                    c.writes += 1;
                    c.bytes_written += bytes.len() as u64;
                }
                Err(e) => {
                    warn!(error = %e, "listfile write failed");
                    counters.lock().unwrap().write_errors += 1;
                }
            }
        }
        pool.release(buffer);
    }

    let mut c = counters.lock().unwrap();
    c.state = WriterState::Idle;
    c.t_end = Some(Instant::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::thread;

    #[test]
    fn writer_drains_and_recycles_buffers() {
        let pool = BufferPool::new(2, 16);
        let (tx, rx) = channel();

        let mut buf = pool.acquire();
        buf.words.extend_from_slice(&[1, 2, 3]);
        tx.send(buf.into_inner()).unwrap();
        drop(tx);

        let counters = Arc::new(Mutex::new(ListfileWriterCounters::default()));
        let sink = Box::new(BufferWriteHandle::new());
        let pool2 = Arc::clone(&pool);
        let counters2 = Arc::clone(&counters);

        // run inline (single-threaded) since BufferWriteHandle isn't shared
        // across the boundary; we only need to observe the counters here.
        run_writer(Some(sink), rx, pool2, counters2);

        let snapshot = counters.lock().unwrap().clone();
        assert_eq!(snapshot.writes, 1);
        assert_eq!(snapshot.bytes_written, 12);
        assert_eq!(snapshot.state, WriterState::Idle);
    }

    #[test]
    fn writer_with_no_handle_still_drains_and_recycles() {
        let pool = BufferPool::new(1, 16);
        let (tx, rx) = channel();
        let mut buf = pool.acquire();
        buf.words.push(0xdead_beef);
        tx.send(buf.into_inner()).unwrap();
        drop(tx);

        let counters = Arc::new(Mutex::new(ListfileWriterCounters::default()));
        run_writer(None, rx, Arc::clone(&pool), Arc::clone(&counters));
        assert_eq!(counters.lock().unwrap().writes, 0);

        // buffer should be back in the pool, cleared
        let recycled = pool.acquire();
        assert!(recycled.words.is_empty());
        let _t: Option<thread::JoinHandle<()>> = None;
    }
}
