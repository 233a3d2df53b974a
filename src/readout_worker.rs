// ABOUTME: Owns the data pipe: fills buffers, fixes up framing at buffer boundaries,
// ABOUTME: routes them to the listfile writer and an optional snoop consumer, and runs
// ABOUTME: periodic plugins.

use std::collections::VecDeque;
use std::sync::mpsc::{Sender, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command_pipe::CommandPipeShared;
use crate::commands::{StackCommandBuilder, SuperCommandBuilder};
use crate::error::{Error, Result};
use crate::eth_envelope;
use crate::frame;
use crate::registers;
use crate::transaction::{stack_executor, TransactionEngine};
use crate::transport::{ConnectionType, Pipe};

/// One unit of captured readout data, handed around by identity between the
/// fill loop, the listfile writer, and the snoop consumer.
#[derive(Debug, Default, Clone)]
pub struct ReadoutBuffer {
    pub words: Vec<u32>,
}

/// An empty-buffer pool callers `acquire` from and `release` back into.
/// Buffers are owned values, handed around by identity, never shared.
pub struct BufferPool {
    empty: Mutex<VecDeque<ReadoutBuffer>>,
    cv: Condvar,
}

impl BufferPool {
    pub fn new(count: usize, capacity_words: usize) -> Arc<Self> {
        let mut dq = VecDeque::with_capacity(count);
        for _ in 0..count {
            dq.push_back(ReadoutBuffer {
                words: Vec::with_capacity(capacity_words),
            });
        }
        Arc::new(Self {
            empty: Mutex::new(dq),
            cv: Condvar::new(),
        })
    }

    /// Blocks until a buffer is available.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let mut guard = self.empty.lock().unwrap();
        while guard.is_empty() {
            guard = self.cv.wait(guard).unwrap();
        }
        let buf = guard.pop_front().unwrap();
        drop(guard);
        PooledBuffer {
            pool: Arc::clone(self),
            buf: Some(buf),
        }
    }

    pub fn release(&self, mut buf: ReadoutBuffer) {
        buf.words.clear();
        self.empty.lock().unwrap().push_back(buf);
        self.cv.notify_one();
    }
}

/// Scope-acquired handle returned by `BufferPool::acquire`: returns its
/// buffer to the pool on every exit path, including early returns, unless
/// `into_inner` hands ownership elsewhere first.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: Option<ReadoutBuffer>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = ReadoutBuffer;
    fn deref(&self) -> &ReadoutBuffer {
        self.buf.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut ReadoutBuffer {
        self.buf.as_mut().unwrap()
    }
}

impl PooledBuffer {
    /// Consumes the guard and hands the buffer to its next owner (the filled
    /// queue) without returning it to the pool.
    pub fn into_inner(mut self) -> ReadoutBuffer {
        self.buf.take().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Splits `input` at the last frame boundary fully contained in it. The
/// trailing partial frame is copied into `carry`; the caller prepends it to
/// the next read.
pub fn fixup_usb_words<'a>(input: &'a [u32], carry: &mut Vec<u32>) -> &'a [u32] {
    let mut pos = 0usize;
    while pos < input.len() {
        let info = frame::decode(input[pos]);
        let frame_words = 1 + info.length as usize;
        if pos + frame_words > input.len() {
            break;
        }
        pos += frame_words;
    }
    carry.clear();
    carry.extend_from_slice(&input[pos..]);
    &input[..pos]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
}

struct StateCell {
    state: Mutex<WorkerState>,
    cv: Condvar,
}

impl StateCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WorkerState::Idle),
            cv: Condvar::new(),
        })
    }

    fn get(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    fn set(&self, s: WorkerState) {
        *self.state.lock().unwrap() = s;
        self.cv.notify_all();
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReadoutWorkerCounters {
    pub buffers_read: u64,
    pub buffers_flushed: u64,
    pub bytes_read: u64,
    pub snoop_missed_buffers: u64,
    pub usb_framing_fixups: u64,
    pub usb_words_carried: u64,
    pub read_timeouts: u64,
    pub eth_packet_loss: u64,
    pub stack_hits: [u64; registers::STACK_COUNT],
}

/// A scheduled hook run once per fill-loop iteration.
/// `emit` lets a plugin push a complete system-event word sequence into a
/// fresh buffer headed for the same downstream consumers as readout data.
pub trait ReadoutLoopPlugin: Send {
    fn readout_start(&mut self) {}
    fn readout_stop(&mut self) {}
    fn poll(&mut self, emit: &mut dyn FnMut(&[u32])) -> PluginOutcome;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOutcome {
    ContinueReadout,
    StopReadout,
}

/// Emits a `UnixTimetick` system event once per second.
pub struct TimetickPlugin {
    last: Option<Instant>,
}

impl TimetickPlugin {
    pub fn new() -> Self {
        Self { last: None }
    }
}

impl Default for TimetickPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadoutLoopPlugin for TimetickPlugin {
    fn poll(&mut self, emit: &mut dyn FnMut(&[u32])) -> PluginOutcome {
        let now = Instant::now();
        let due = self.last.map(|t| now.duration_since(t) >= Duration::from_secs(1)).unwrap_or(true);
        if due {
            let header = frame::encode_system_event(frame::system_event::UNIX_TIMETICK, false, 0, 0);
            emit(&[header]);
            self.last = Some(now);
        }
        PluginOutcome::ContinueReadout
    }

    fn name(&self) -> &'static str {
        "timetick"
    }
}

/// Emits a `StackErrors` system event whenever the command pipe's stack-error
/// counters have changed since the last check, throttled to once per second.
pub struct StackErrorsPlugin {
    shared: Arc<CommandPipeShared>,
    last_total: u64,
    last_emit: Option<Instant>,
}

impl StackErrorsPlugin {
    pub fn new(shared: Arc<CommandPipeShared>) -> Self {
        Self {
            shared,
            last_total: 0,
            last_emit: None,
        }
    }
}

impl ReadoutLoopPlugin for StackErrorsPlugin {
    fn poll(&mut self, emit: &mut dyn FnMut(&[u32])) -> PluginOutcome {
        let now = Instant::now();
        if self.last_emit.map(|t| now.duration_since(t) < Duration::from_secs(1)).unwrap_or(false) {
            return PluginOutcome::ContinueReadout;
        }
        let total = self.shared.stack_errors.lock().unwrap().total_count();
        if total != self.last_total {
            let header = frame::encode_system_event(frame::system_event::STACK_ERRORS, false, 0, 0);
            emit(&[header]);
            self.last_total = total;
            self.last_emit = Some(now);
        }
        PluginOutcome::ContinueReadout
    }

    fn name(&self) -> &'static str {
        "stack_errors"
    }
}

/// Requests termination once `duration` has elapsed since `readout_start`.
pub struct ReadoutDurationPlugin {
    start: Option<Instant>,
    duration: Duration,
}

impl ReadoutDurationPlugin {
    pub fn new(duration: Duration) -> Self {
        Self { start: None, duration }
    }
}

impl ReadoutLoopPlugin for ReadoutDurationPlugin {
    fn readout_start(&mut self) {
        self.start = Some(Instant::now());
    }

    fn poll(&mut self, _emit: &mut dyn FnMut(&[u32])) -> PluginOutcome {
        match self.start {
            Some(t) if Instant::now().duration_since(t) >= self.duration => PluginOutcome::StopReadout,
            _ => PluginOutcome::ContinueReadout,
        }
    }

    fn name(&self) -> &'static str {
        "readout_duration"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadoutWorkerConfig {
    pub crate_id: u8,
    pub read_capacity_bytes: usize,
    /// Maximum attempts for the MCST DAQ start/stop command sequences.
    /// Default is 3 — USB2/ETH packet loss can need more than one try.
    pub mcst_max_tries: u32,
}

impl Default for ReadoutWorkerConfig {
    fn default() -> Self {
        Self {
            crate_id: 0,
            read_capacity_bytes: 1024 * 1024,
            mcst_max_tries: 3,
        }
    }
}

/// Lightweight control surface shared with the spawned worker thread: state
/// transitions are validated here and observed by the thread via the
/// condvar-backed `StateCell`.
pub struct ReadoutWorkerHandle {
    state: Arc<StateCell>,
    counters: Arc<Mutex<ReadoutWorkerCounters>>,
}

impl ReadoutWorkerHandle {
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn counters(&self) -> ReadoutWorkerCounters {
        self.counters.lock().unwrap().clone()
    }

    pub fn pause(&self) -> Result<()> {
        if self.state.get() != WorkerState::Running {
            return Err(Error::ReadoutNotRunning);
        }
        self.state.set(WorkerState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if self.state.get() != WorkerState::Paused {
            return Err(Error::ReadoutNotPaused);
        }
        self.state.set(WorkerState::Running);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        match self.state.get() {
            WorkerState::Idle | WorkerState::Stopping => Err(Error::ReadoutNotRunning),
            _ => {
                self.state.set(WorkerState::Stopping);
                Ok(())
            }
        }
    }
}

/// Construct with `new`, optionally configure MCST commands and plugins,
/// then `spawn` it onto its own thread — spawning plays the role of
/// `start()` in the `start()/stop()/pause()/resume()` state machine.
pub struct ReadoutWorker {
    shared: Arc<CommandPipeShared>,
    engine: Arc<TransactionEngine>,
    pool: Arc<BufferPool>,
    filled_tx: Sender<ReadoutBuffer>,
    snoop_tx: Option<SyncSender<ReadoutBuffer>>,
    state: Arc<StateCell>,
    counters: Arc<Mutex<ReadoutWorkerCounters>>,
    config: ReadoutWorkerConfig,
    mcst_start: Option<StackCommandBuilder>,
    mcst_stop: Option<StackCommandBuilder>,
    plugins: Vec<Box<dyn ReadoutLoopPlugin>>,
    usb_carry: Vec<u32>,
}

impl ReadoutWorker {
    pub fn new(
        shared: Arc<CommandPipeShared>,
        engine: Arc<TransactionEngine>,
        pool: Arc<BufferPool>,
        filled_tx: Sender<ReadoutBuffer>,
        snoop_tx: Option<SyncSender<ReadoutBuffer>>,
        config: ReadoutWorkerConfig,
    ) -> Self {
        Self {
            shared,
            engine,
            pool,
            filled_tx,
            snoop_tx,
            state: StateCell::new(),
            counters: Arc::new(Mutex::new(ReadoutWorkerCounters::default())),
            config,
            mcst_start: None,
            mcst_stop: None,
            plugins: Vec::new(),
            usb_carry: Vec::new(),
        }
    }

    pub fn set_mcst_daq_start_commands(&mut self, commands: StackCommandBuilder) {
        self.mcst_start = Some(commands);
    }

    pub fn set_mcst_daq_stop_commands(&mut self, commands: StackCommandBuilder) {
        self.mcst_stop = Some(commands);
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn ReadoutLoopPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn handle(&self) -> ReadoutWorkerHandle {
        ReadoutWorkerHandle {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn spawn(self) -> (thread::JoinHandle<ReadoutWorkerCounters>, ReadoutWorkerHandle) {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("readout-worker".into())
            .spawn(move || self.run())
            .expect("spawn readout worker thread");
        (join, handle)
    }

    fn run(mut self) -> ReadoutWorkerCounters {
        self.state.set(WorkerState::Starting);
        if let Some(start_cmds) = self.mcst_start.take() {
            self.run_mcst_sequence(&start_cmds, "start");
        }
        for p in &mut self.plugins {
            p.readout_start();
        }
        self.state.set(WorkerState::Running);

        loop {
            match self.state.get() {
                WorkerState::Stopping => break,
                WorkerState::Paused => {
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                _ => {}
            }

            let mut pooled = self.pool.acquire();
            match self.fill(&mut pooled) {
                Ok(0) => continue,
                Ok(n) => {
                    self.counters.lock().unwrap().buffers_read += 1;
                    let _ = n;
                    self.route(pooled);
                }
                Err(e) if crate::transport::is_fatal(&e) => {
                    warn!(error = %e, "readout worker transport error, stopping");
                    break;
                }
                Err(Error::Timeout) | Err(Error::SocketReadTimeout) => {
                    self.counters.lock().unwrap().read_timeouts += 1;
                }
                Err(e) => {
                    warn!(error = %e, "readout worker read error, continuing");
                }
            }

            if self.run_plugins_once() {
                break;
            }
        }

        self.terminate();
        self.counters.lock().unwrap().clone()
    }

    /// Runs every plugin once, routing any system events it emits through
    /// the same pool/filled-queue/snoop path as readout data. Returns `true`
    /// if any plugin requested termination.
    fn run_plugins_once(&mut self) -> bool {
        let mut stop_requested = false;
        for plugin in &mut self.plugins {
            let pool = &self.pool;
            let filled_tx = &self.filled_tx;
            let snoop_tx = &self.snoop_tx;
            let counters = &self.counters;
            let mut emit = |words: &[u32]| {
                let mut b = pool.acquire();
                b.words.extend_from_slice(words);
                let buffer = b.into_inner();
                if let Some(tx) = snoop_tx {
                    if let Err(TrySendError::Full(_)) = tx.try_send(buffer.clone()) {
                        counters.lock().unwrap().snoop_missed_buffers += 1;
                    }
                }
                let _ = filled_tx.send(buffer);
                counters.lock().unwrap().buffers_flushed += 1;
            };
            if plugin.poll(&mut emit) == PluginOutcome::StopReadout {
                debug!(plugin = plugin.name(), "plugin requested termination");
                stop_requested = true;
            }
        }
        stop_requested
    }

    fn fill(&mut self, pooled: &mut PooledBuffer) -> Result<usize> {
        let connection_type = self.shared.transport.lock().unwrap().connection_type();
        match connection_type {
            ConnectionType::Usb => self.fill_usb(pooled),
            ConnectionType::Eth => self.fill_eth(pooled),
        }
    }

    fn fill_usb(&mut self, pooled: &mut PooledBuffer) -> Result<usize> {
        let mut raw = vec![0u8; self.config.read_capacity_bytes];
        let n = {
            let mut transport = self.shared.transport.lock().unwrap();
            transport.read(Pipe::Data, &mut raw)?
        };
        self.counters.lock().unwrap().bytes_read += n as u64;

        let whole_words = n / 4;
        let mut words: Vec<u32> = self.usb_carry.drain(..).collect();
        for chunk in raw[..whole_words * 4].chunks_exact(4) {
            words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        let before = words.len();
        let usable_len = {
            let usable = fixup_usb_words(&words, &mut self.usb_carry);
            usable.len()
        };
        if usable_len < before {
            let mut c = self.counters.lock().unwrap();
            c.usb_framing_fixups += 1;
            c.usb_words_carried += (before - usable_len) as u64;
        }
        pooled.words.extend_from_slice(&words[..usable_len]);
        Ok(usable_len)
    }

    fn fill_eth(&mut self, pooled: &mut PooledBuffer) -> Result<usize> {
        let mut packet = vec![0u8; eth_envelope::JUMBO_FRAME_MAX_SIZE];
        let result = {
            let mut transport = self.shared.transport.lock().unwrap();
            let eth = transport.as_eth_mut().expect("eth readout worker requires an eth transport");
            eth.read_packet(Pipe::Data, &mut packet)?
        };
        if result.lost_packets > 0 {
            self.counters.lock().unwrap().eth_packet_loss += result.lost_packets as u64;
        }
        let total_words = result.payload_words as usize;
        let start_byte = eth_envelope::HEADER_WORDS * 4;
        let word_bytes = &packet[start_byte..start_byte + total_words * 4];
        for chunk in word_bytes.chunks_exact(4) {
            pooled
                .words
                .push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        self.counters.lock().unwrap().bytes_read += (total_words * 4) as u64;
        Ok(total_words)
    }

    fn route(&mut self, pooled: PooledBuffer) {
        let buffer = pooled.into_inner();
        if let Some(tx) = &self.snoop_tx {
            if let Err(TrySendError::Full(_)) = tx.try_send(buffer.clone()) {
                self.counters.lock().unwrap().snoop_missed_buffers += 1;
            }
        }
        let _ = self.filled_tx.send(buffer);
        self.counters.lock().unwrap().buffers_flushed += 1;
    }

    fn run_mcst_sequence(&self, commands: &StackCommandBuilder, phase: &str) {
        for attempt in 1..=self.config.mcst_max_tries {
            match stack_executor::run_command(
                &self.engine,
                registers::IMMEDIATE_STACK_START_OFFSET_WORDS,
                registers::IMMEDIATE_STACK_START_OFFSET_BYTES,
                commands,
            ) {
                Ok(_) => return,
                Err(e) => warn!(phase, attempt, error = %e, "mcst daq command sequence failed"),
            }
        }
    }

    /// Disables triggers, drains remaining buffered data for one read-timeout
    /// cycle, and writes the final `EndOfFile` system event.
    fn terminate(&mut self) {
        self.state.set(WorkerState::Stopping);

        if let Some(stop_cmds) = self.mcst_stop.take() {
            self.run_mcst_sequence(&stop_cmds, "stop");
        }

        let disable_ref = self.engine.next_super_reference();
        let disable_words = SuperCommandBuilder::new()
            .add_reference_word(disable_ref)
            .add_write_local(registers::DAQ_MODE, 0)
            .to_words();
        if let Err(e) = self.engine.super_transaction(&disable_words) {
            warn!(error = %e, "failed to disable daq_mode during termination");
        }

        loop {
            let mut pooled = self.pool.acquire();
            match self.fill(&mut pooled) {
                Ok(0) => break,
                Ok(_) => self.route(pooled),
                Err(_) => break,
            }
        }

        let mut final_buf = self.pool.acquire();
        final_buf
            .words
            .push(frame::encode_system_event(frame::system_event::END_OF_FILE, false, 0, 0));
        self.route(final_buf);

        for p in &mut self.plugins {
            p.readout_stop();
        }
        self.state.set(WorkerState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode, FrameFlags, FrameType};

    #[test]
    fn fixup_no_fixup_needed_single_complete_frame() {
        let mut carry = Vec::new();
        let input = [0xF300_0000u32];
        let usable = fixup_usb_words(&input, &mut carry);
        assert_eq!(usable, &input);
        assert!(carry.is_empty());
    }

    #[test]
    fn fixup_incomplete_trailing_frame_moves_to_carry() {
        let mut carry = Vec::new();
        let input = [0xF300_0001u32]; // header claims 1 payload word, none present
        let usable = fixup_usb_words(&input, &mut carry);
        assert!(usable.is_empty());
        assert_eq!(carry, input);
    }

    #[test]
    fn fixup_splits_at_last_complete_frame_and_resumes_next_call() {
        let mut carry = Vec::new();
        let first = [0xF300_0001u32, 0x1111_1111, 0xF300_0002, 0x2222_2222];
        let usable = fixup_usb_words(&first, &mut carry).to_vec();
        assert_eq!(usable, vec![0xF300_0001, 0x1111_1111]);
        assert_eq!(carry, vec![0xF300_0002, 0x2222_2222]);

        let mut next_input = carry.clone();
        next_input.push(0x3333_3333);
        let mut carry2 = Vec::new();
        let usable2 = fixup_usb_words(&next_input, &mut carry2);
        assert_eq!(usable2, &[0xF300_0002, 0x2222_2222, 0x3333_3333]);
        assert!(carry2.is_empty());
    }

    #[test]
    fn buffer_pool_acquire_and_release_roundtrip() {
        let pool = BufferPool::new(1, 8);
        {
            let mut b = pool.acquire();
            b.words.push(1);
            b.words.push(2);
        } // dropped, returns to pool and clears
        let b2 = pool.acquire();
        assert!(b2.words.is_empty());
    }

    #[test]
    fn timetick_plugin_fires_once_then_waits() {
        let mut plugin = TimetickPlugin::new();
        let mut emitted = Vec::new();
        let mut emit = |words: &[u32]| emitted.push(words.to_vec());
        plugin.poll(&mut emit);
        assert_eq!(emitted.len(), 1);
        plugin.poll(&mut emit);
        assert_eq!(emitted.len(), 1, "second poll within the same second should not re-fire");
    }

    #[test]
    fn duration_plugin_requests_stop_after_elapsed() {
        let mut plugin = ReadoutDurationPlugin::new(Duration::from_millis(1));
        plugin.readout_start();
        std::thread::sleep(Duration::from_millis(5));
        let mut emit = |_: &[u32]| {};
        assert_eq!(plugin.poll(&mut emit), PluginOutcome::StopReadout);
    }

    #[test]
    fn handle_rejects_invalid_transitions() {
        let state = StateCell::new();
        let handle = ReadoutWorkerHandle {
            state: Arc::clone(&state),
            counters: Arc::new(Mutex::new(ReadoutWorkerCounters::default())),
        };
        assert!(matches!(handle.pause(), Err(Error::ReadoutNotRunning)));
        state.set(WorkerState::Running);
        assert!(handle.pause().is_ok());
        assert!(matches!(handle.pause(), Err(Error::ReadoutNotRunning)));
        assert!(handle.resume().is_ok());
    }

    #[test]
    fn stack_error_header_shape_is_recognized_by_is_known_header() {
        let header = encode(FrameType::StackError, FrameFlags::default(), 0, 0, 1);
        assert!(crate::frame::is_known_header(header));
    }
}
