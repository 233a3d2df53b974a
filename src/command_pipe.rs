// ABOUTME: Background command-pipe reader thread; demuxes incoming words into
// ABOUTME: super/stack/error response streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::buffer::LinearBuffer;
use crate::error::Error;
use crate::frame::{self, FrameType};
use crate::stack_errors::StackErrorCounters;
use crate::sync::PendingCell;
use crate::transport::{Pipe, Transport};

/// Super-command opcode identifying a `ReferenceWord` (mirrors
/// `commands::SuperCommandType::ReferenceWord`'s encoding).
const SUPER_REFERENCE_OPCODE: u16 = 0x0101;

const MIN_READ_SIZE: usize = 4096;
const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Default, Clone)]
pub struct CommandPipeCounters {
    pub reads: u64,
    pub bytes_read: u64,
    pub timeouts: u64,
    pub invalid_headers: u64,
    pub words_skipped: u64,
    pub malformed_chains_dropped: u64,
    pub short_super_buffer: u64,
    pub super_format_errors: u64,
    pub super_ref_mismatches: u64,
    pub super_no_pending: u64,
    pub stack_format_errors: u64,
    pub stack_ref_mismatches: u64,
    pub stack_no_pending: u64,
    pub system_events_on_command_pipe: u64,
    pub eth_packets_lost: u64,
    pub unexpected_top_level_frames: u64,
}

/// Shared handles the reader thread drains into; also held by the
/// transaction engine and the connection object to register requests and
/// read stats.
pub struct CommandPipeShared {
    pub transport: Mutex<Transport>,
    pub pending_super: Arc<PendingCell<Vec<u32>>>,
    pub pending_stack: Arc<PendingCell<Vec<u32>>>,
    pub stack_errors: Mutex<StackErrorCounters>,
    pub counters: Mutex<CommandPipeCounters>,
    pub quit: AtomicBool,
}

impl CommandPipeShared {
    pub fn new(transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            transport: Mutex::new(transport),
            pending_super: PendingCell::new(),
            pending_stack: PendingCell::new(),
            stack_errors: Mutex::new(StackErrorCounters::new()),
            counters: Mutex::new(CommandPipeCounters::default()),
            quit: AtomicBool::new(false),
        })
    }

    pub fn counters_snapshot(&self) -> CommandPipeCounters {
        self.counters.lock().unwrap().clone()
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

/// Runs the command-pipe reader loop until `shared.quit` is set or a fatal
/// transport error occurs. Intended to run on its own thread, spawned by the
/// connection object (`connection::Connection::connect`).
pub fn run(shared: Arc<CommandPipeShared>) {
    let mut buf = LinearBuffer::with_capacity(INITIAL_BUFFER_CAPACITY);

    loop {
        if shared.quit.load(Ordering::SeqCst) {
            break;
        }

        drain(&shared, &mut buf);

        if shared.quit.load(Ordering::SeqCst) {
            break;
        }

        match fill(&shared, &mut buf) {
            Ok(()) => {}
            Err(e) if crate::transport::is_fatal(&e) => {
                warn!(error = %e, "command pipe transport error, disconnecting");
                shared.quit.store(true, Ordering::SeqCst);
                break;
            }
            Err(Error::Timeout) | Err(Error::SocketReadTimeout) => {
                shared.counters.lock().unwrap().timeouts += 1;
            }
            Err(e) => {
                warn!(error = %e, "command pipe read error, continuing");
            }
        }
    }

    let reason = || Error::IsDisconnected;
    shared.pending_super.fulfill_any(reason);
    shared.pending_stack.fulfill_any(reason);
}

/// Drain as many complete logical frames as the buffer currently holds.
fn drain(shared: &Arc<CommandPipeShared>, buf: &mut LinearBuffer) {
    loop {
        // Skip words that aren't known headers, each one tallied individually.
        let mut skipped = 0u64;
        while let Some(w) = buf.view_u32(0) {
            if frame::is_known_header(w) {
                break;
            }
            buf.consume(4);
            skipped += 1;
        }
        if skipped > 0 {
            let mut c = shared.counters.lock().unwrap();
            c.invalid_headers += skipped;
            c.words_skipped += skipped;
        }

        let words = borrow_words(buf);
        match scan_complete_frame(&words) {
            ScanResult::Incomplete => return,
            ScanResult::Malformed => {
                warn!("malformed continuation chain on command pipe, dropping leading word");
                shared.counters.lock().unwrap().malformed_chains_dropped += 1;
                buf.consume(4);
            }
            ScanResult::Complete { total_words, top_type } => {
                dispatch(shared, &words[..total_words], top_type);
                buf.consume(total_words * 4);
            }
        }
    }
}

fn borrow_words(buf: &LinearBuffer) -> Vec<u32> {
    let n = buf.word_count();
    (0..n).map(|i| buf.view_u32(i).unwrap()).collect()
}

enum ScanResult {
    Incomplete,
    Malformed,
    Complete { total_words: usize, top_type: FrameType },
}

/// Walks a continuation chain starting at `words[0]`, returning the total
/// word count of the complete logical frame once every chained header (and
/// its payload) has arrived.
fn scan_complete_frame(words: &[u32]) -> ScanResult {
    if words.is_empty() {
        return ScanResult::Incomplete;
    }
    let head = frame::decode(words[0]);
    let Some(head_type) = head.frame_type else {
        return ScanResult::Malformed;
    };
    let mut total = 1 + head.length as usize;
    let mut cont = head.flags.continue_;
    let expected_next = match head_type {
        FrameType::SuperFrame | FrameType::SuperContinuation => Some(FrameType::SuperContinuation),
        FrameType::StackFrame | FrameType::StackContinuation => Some(FrameType::StackContinuation),
        FrameType::SystemEvent => Some(FrameType::SystemEvent),
        _ => None,
    };

    while cont {
        if words.len() <= total {
            return ScanResult::Incomplete;
        }
        let next_word = words[total];
        if !frame::is_known_header(next_word) {
            return ScanResult::Malformed;
        }
        let next_info = frame::decode(next_word);
        if next_info.frame_type != expected_next {
            return ScanResult::Malformed;
        }
        let next_len = 1 + next_info.length as usize;
        if words.len() < total + next_len {
            return ScanResult::Incomplete;
        }
        total += next_len;
        cont = next_info.flags.continue_;
    }

    ScanResult::Complete {
        total_words: total,
        top_type: head_type,
    }
}

fn dispatch(shared: &Arc<CommandPipeShared>, frame_words: &[u32], top_type: FrameType) {
    match top_type {
        FrameType::StackError => {
            let mut counters = shared.stack_errors.lock().unwrap();
            crate::stack_errors::update_stack_error_counters(&mut counters, frame_words);
        }
        FrameType::SuperFrame | FrameType::SuperContinuation => {
            handle_super(shared, frame_words);
        }
        FrameType::StackFrame | FrameType::StackContinuation => {
            handle_stack(shared, frame_words);
        }
        FrameType::SystemEvent => {
            // The command pipe never carries system events; observed only as
            // firmware noise. Skip and tally.
            shared.counters.lock().unwrap().system_events_on_command_pipe += 1;
            trace!("unexpected SystemEvent frame on command pipe, skipping");
        }
        FrameType::BlockRead => {
            shared.counters.lock().unwrap().unexpected_top_level_frames += 1;
            warn!("unexpected top-level BlockRead frame on command pipe, skipping");
        }
    }
}

fn handle_super(shared: &Arc<CommandPipeShared>, frame_words: &[u32]) {
    let head = frame::decode(frame_words[0]);
    if head.length == 0 {
        shared.counters.lock().unwrap().short_super_buffer += 1;
        return;
    }
    let w1 = frame_words[1];
    let opcode = (w1 >> 16) as u16;
    if opcode != SUPER_REFERENCE_OPCODE {
        shared.counters.lock().unwrap().super_format_errors += 1;
        return;
    }
    let observed = (w1 & 0xffff) as u32;
    let payload = frame_words.to_vec();
    let outcome = shared.pending_super.resolve_observed(
        observed,
        move || payload,
        |expected, actual| Error::SuperReferenceMismatch {
            expected: expected as u16,
            actual: actual as u16,
        },
    );
    let mut counters = shared.counters.lock().unwrap();
    match outcome {
        None => counters.super_no_pending += 1,
        Some(false) => counters.super_ref_mismatches += 1,
        Some(true) => {}
    }
}

fn handle_stack(shared: &Arc<CommandPipeShared>, frame_words: &[u32]) {
    let head = frame::decode(frame_words[0]);
    if head.length == 0 {
        shared.counters.lock().unwrap().stack_format_errors += 1;
        return;
    }
    let observed = frame_words[1];
    let payload = frame_words.to_vec();
    let outcome = shared.pending_stack.resolve_observed(
        observed,
        move || payload,
        |expected, actual| Error::StackReferenceMismatch { expected, actual },
    );
    let mut counters = shared.counters.lock().unwrap();
    match outcome {
        None => {
            debug!(reference = observed, "stack response with no pending transaction");
            counters.stack_no_pending += 1;
        }
        Some(false) => counters.stack_ref_mismatches += 1,
        Some(true) => {}
    }
}

/// Read more bytes from the transport into `buf`'s tail.
fn fill(shared: &Arc<CommandPipeShared>, buf: &mut LinearBuffer) -> crate::error::Result<()> {
    let mut transport = shared.transport.lock().unwrap();
    match &*transport {
        Transport::Usb { .. } => {
            if buf.free() < MIN_READ_SIZE {
                buf.ensure_free_space(MIN_READ_SIZE);
            }
            let want = buf.free();
            let tail = buf.write_tail_mut(want);
            let n = transport.read(Pipe::Command, tail)?;
            buf.commit_write(n);
            let mut c = shared.counters.lock().unwrap();
            c.reads += 1;
            c.bytes_read += n as u64;
            Ok(())
        }
        Transport::Eth { .. } => {
            let mut packet = vec![0u8; crate::eth_envelope::JUMBO_FRAME_MAX_SIZE];
            let eth = transport.as_eth_mut().expect("eth transport");
            let result = eth.read_packet(Pipe::Command, &mut packet)?;
            {
                let mut c = shared.counters.lock().unwrap();
                c.reads += 1;
                if result.lost_packets > 0 {
                    c.eth_packets_lost += result.lost_packets as u64;
                    debug!(lost = result.lost_packets, "command pipe packet loss");
                }
            }
            if result.header1.next_header_pointer == crate::eth_envelope::NO_HEADER_POINTER_PRESENT {
                // No frame starts in this datagram: pure continuation spillover
                // the command pipe does not expect. Drop it.
                return Ok(());
            }
            let skip_words = result.header1.next_header_pointer as usize;
            let total_words = result.payload_words as usize;
            if skip_words > total_words {
                return Err(Error::UDPDataWordCountExceedsPacketSize);
            }
            let payload_bytes = &packet
                [crate::eth_envelope::HEADER_WORDS * 4 + skip_words * 4
                    ..crate::eth_envelope::HEADER_WORDS * 4 + total_words * 4];
            buf.ensure_free_space(payload_bytes.len());
            let tail = buf.write_tail_mut(payload_bytes.len());
            tail.copy_from_slice(payload_bytes);
            buf.commit_write(payload_bytes.len());
            let mut c = shared.counters.lock().unwrap();
            c.bytes_read += payload_bytes.len() as u64;
            Ok(())
        }
    }
}

/// Timeout helper used by the transaction engine when awaiting a pending
/// response; kept here since both share the default duration.
pub const DEFAULT_SUPER_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode, FrameFlags, FrameType};
    use crate::transport::mock::MockUsbBackend;

    fn push_words(backend: &mut MockUsbBackend, pipe: Pipe, words: &[u32]) {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        match pipe {
            Pipe::Command => backend.command_rx.push_back(bytes),
            Pipe::Data => backend.data_rx.push_back(bytes),
        }
    }

    #[test]
    fn super_reference_mismatch_resolves_pending_with_error() {
        let mut backend = MockUsbBackend::new();
        let header = encode(FrameType::SuperFrame, FrameFlags::default(), 0, 0, 2);
        push_words(
            &mut backend,
            Pipe::Command,
            &[header, (SUPER_REFERENCE_OPCODE as u32) << 16 | 0x5678, 0xDEADBEEF],
        );
        let transport = Transport::Usb {
            backend: Box::new(backend),
            stream_pipe_policy: crate::transport::UsbStreamPipePolicy::Default,
        };
        let shared = CommandPipeShared::new(transport);
        let handle = shared.pending_super.acquire(0x1234);

        let mut buf = LinearBuffer::with_capacity(256);
        fill(&shared, &mut buf).unwrap();
        drain(&shared, &mut buf);

        let result = handle.await_result(Duration::from_millis(50));
        assert!(matches!(result, Some(Err(Error::SuperReferenceMismatch { .. }))));
        assert_eq!(shared.counters.lock().unwrap().super_ref_mismatches, 1);
        assert_eq!(buf.word_count(), 0);
    }

    #[test]
    fn matching_super_response_delivers_payload() {
        let mut backend = MockUsbBackend::new();
        let header = encode(FrameType::SuperFrame, FrameFlags::default(), 0, 0, 1);
        push_words(
            &mut backend,
            Pipe::Command,
            &[header, (SUPER_REFERENCE_OPCODE as u32) << 16 | 0x1234],
        );
        let transport = Transport::Usb {
            backend: Box::new(backend),
            stream_pipe_policy: crate::transport::UsbStreamPipePolicy::Default,
        };
        let shared = CommandPipeShared::new(transport);
        let handle = shared.pending_super.acquire(0x1234);

        let mut buf = LinearBuffer::with_capacity(256);
        fill(&shared, &mut buf).unwrap();
        drain(&shared, &mut buf);

        let result = handle.await_result(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn malformed_continuation_drops_leading_word_and_resumes() {
        let header = encode(
            FrameType::SuperFrame,
            FrameFlags {
                continue_: true,
                ..Default::default()
            },
            0,
            0,
            0,
        );
        let words = [header, 0x0000_0000u32]; // not a known header, breaks the chain
        let shared = CommandPipeShared::new(Transport::Usb {
            backend: Box::new(MockUsbBackend::new()),
            stream_pipe_policy: crate::transport::UsbStreamPipePolicy::Default,
        });
        let mut buf = LinearBuffer::with_capacity(64);
        for w in words {
            let tail = buf.write_tail_mut(4);
            tail.copy_from_slice(&w.to_le_bytes());
            buf.commit_write(4);
        }
        drain(&shared, &mut buf);
        assert_eq!(shared.counters.lock().unwrap().malformed_chains_dropped, 1);
    }
}
