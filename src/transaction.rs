// ABOUTME: Transaction engine: super/stack transactions with an upload/trigger/retry
// ABOUTME: ladder, plus a direct/blocking stack executor.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::command_pipe::CommandPipeShared;
use crate::commands::{StackCommand, StackCommandBuilder, SuperCommandBuilder};
use crate::error::{Error, Result};
use crate::registers;
use crate::transport::{ConnectionType, Pipe};

/// Timeouts and retry limits for both transaction kinds. The attempt limit
/// defaults to 10.
#[derive(Debug, Clone, Copy)]
pub struct TransactionConfig {
    pub super_timeout: Duration,
    pub stack_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            super_timeout: Duration::from_secs(2),
            stack_timeout: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

/// Two monotonically increasing atomic counters. Wraparound is fine: the
/// reference only has to match between a request and its own response, and
/// the single-slot pending cells rule out any cross-talk.
#[derive(Debug, Default)]
pub struct ReferenceGenerator {
    next_super: AtomicU16,
    next_stack: AtomicU32,
}

impl ReferenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_super_reference(&self) -> u16 {
        self.next_super.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_stack_reference(&self) -> u32 {
        self.next_stack.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct TransactionEngine {
    shared: Arc<CommandPipeShared>,
    config: TransactionConfig,
    refs: ReferenceGenerator,
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// Flags carried by `stack_exec_status0`, decoded the same way an ordinary
/// frame header's flag bits are.
struct StatusFlags {
    timeout: bool,
    bus_error: bool,
    syntax_error: bool,
}

fn decode_status_flags(status0: u32) -> StatusFlags {
    let info = crate::frame::decode(status0);
    StatusFlags {
        timeout: info.flags.timeout,
        bus_error: info.flags.bus_error,
        syntax_error: info.flags.syntax_error,
    }
}

/// Splits an encoded stack program into the super-command word buffers that
/// upload it, bracketed with `StackStart`/`StackEnd` written into
/// consecutive stack-memory addresses. `next_ref` supplies a fresh reference
/// word for each part.
fn build_stack_upload_parts(
    stack_words: &[u32],
    stack_memory_offset_words: u16,
    part_max_words: usize,
    mut next_ref: impl FnMut() -> u16,
) -> Result<Vec<Vec<u32>>> {
    let part_max_words = part_max_words.max(1);
    let mut write_address =
        registers::STACK_MEMORY_BEGIN + stack_memory_offset_words * registers::STACK_MEMORY_ADDRESS_INCREMENT;

    let chunks: Vec<&[u32]> = if stack_words.is_empty() {
        vec![&[]]
    } else {
        stack_words.chunks(part_max_words).collect()
    };
    let last_index = chunks.len() - 1;

    let mut parts = Vec::with_capacity(chunks.len());

    for (index, chunk) in chunks.into_iter().enumerate() {
        let mut builder = SuperCommandBuilder::new().add_reference_word(next_ref());

        if index == 0 {
            if write_address >= registers::STACK_MEMORY_END {
                return Err(Error::StackMemoryExceeded);
            }
            let start_word = (registers::STACK_COMMAND_TYPE_START << registers::STACK_COMMAND_CMD_SHIFT)
                | (u32::from(Pipe::Command as u8) << registers::STACK_COMMAND_ARG0_SHIFT);
            builder = builder.add_write_local(write_address, start_word);
            write_address += registers::STACK_MEMORY_ADDRESS_INCREMENT;
        }

        for &word in chunk {
            if write_address >= registers::STACK_MEMORY_END {
                return Err(Error::StackMemoryExceeded);
            }
            builder = builder.add_write_local(write_address, word);
            write_address += registers::STACK_MEMORY_ADDRESS_INCREMENT;
        }

        if index == last_index {
            if write_address >= registers::STACK_MEMORY_END {
                return Err(Error::StackMemoryExceeded);
            }
            let end_word = registers::STACK_COMMAND_TYPE_END << registers::STACK_COMMAND_CMD_SHIFT;
            builder = builder.add_write_local(write_address, end_word);
        }

        let words = builder.to_words();
        debug_assert!(words.len() <= registers::MIRROR_TRANSACTION_MAX_WORDS);
        parts.push(words);
    }

    Ok(parts)
}

impl TransactionEngine {
    pub fn new(shared: Arc<CommandPipeShared>, config: TransactionConfig) -> Self {
        Self {
            shared,
            config,
            refs: ReferenceGenerator::new(),
        }
    }

    pub fn next_super_reference(&self) -> u16 {
        self.refs.next_super_reference()
    }

    pub fn next_stack_reference(&self) -> u32 {
        self.refs.next_stack_reference()
    }

    /// Runs a single super transaction, retrying on timeout up to
    /// `config.max_attempts`.
    /// `words` must start with the `ReferenceWord` command whose low 16 bits
    /// are the reference this call awaits.
    pub fn super_transaction(&self, words: &[u32]) -> Result<Vec<u32>> {
        let expected_ref = (words[0] & 0xffff) as u32;
        let mut last_err = Error::SuperCommandTimeout;

        for attempt in 1..=self.config.max_attempts {
            let handle = self.shared.pending_super.acquire(expected_ref);
            let write_result = {
                let mut transport = self.shared.transport.lock().unwrap();
                transport.write(Pipe::Command, &words_to_bytes(words))
            };
            if let Err(e) = write_result {
                handle.release();
                return Err(e);
            }

            match handle.await_result(self.config.super_timeout) {
                Some(Ok(buf)) => return Ok(buf),
                Some(Err(e)) => return Err(e),
                None => {
                    trace!(attempt, "super transaction timed out, retrying");
                    last_err = Error::SuperCommandTimeout;
                }
            }
        }

        Err(last_err)
    }

    /// Uploads an encoded stack program into controller stack memory,
    /// running each part through its own super transaction and aborting on
    /// the first error.
    fn upload_stack(&self, stack_words: &[u32], stack_memory_offset_words: u16) -> Result<()> {
        let part_max = match self.shared.transport.lock().unwrap().connection_type() {
            ConnectionType::Usb => registers::UPLOAD_PART_WORDS_USB,
            ConnectionType::Eth => registers::UPLOAD_PART_WORDS_ETH,
        };

        let parts = build_stack_upload_parts(stack_words, stack_memory_offset_words, part_max, || {
            self.next_super_reference()
        })?;

        for part in &parts {
            self.super_transaction(part)?;
        }
        Ok(())
    }

    /// Executes a command stack exactly once and returns its result frame.
    /// `builder`'s first command must be `WriteMarker(reference)`;
    /// `stack_offset_bytes` is where the immediate
    /// stack's program is placed (by convention `Stack0OffsetRegister`).
    pub fn stack_transaction(
        &self,
        builder: &StackCommandBuilder,
        stack_memory_offset_words: u16,
        stack_offset_bytes: u16,
    ) -> Result<Vec<u32>> {
        assert!(builder.first_is_write_marker(), "stack transaction requires a leading WriteMarker");

        let stack_reference = match builder.commands().first() {
            Some(StackCommand::WriteMarker(r)) => *r,
            _ => unreachable!(),
        };

        self.upload_stack(&builder.to_words(), stack_memory_offset_words)?;

        let mut last_err = Error::StackExecRequestLost;

        for attempt in 1..=self.config.max_attempts {
            let trigger_ref = self.next_super_reference();
            let trigger = SuperCommandBuilder::trigger_stack(trigger_ref, stack_offset_bytes).to_words();

            let super_handle = self.shared.pending_super.acquire(trigger_ref as u32);
            let stack_handle = self.shared.pending_stack.acquire(stack_reference);

            let write_result = {
                let mut transport = self.shared.transport.lock().unwrap();
                transport.write(Pipe::Command, &words_to_bytes(&trigger))
            };
            if let Err(e) = write_result {
                super_handle.release();
                stack_handle.release();
                return Err(e);
            }

            match super_handle.await_result(self.config.super_timeout) {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    stack_handle.release();
                    return Err(e);
                }
                None => {
                    stack_handle.release();
                    match self.diagnose_lost_response(stack_reference)? {
                        Some(definite) => return Err(definite),
                        None => {
                            trace!(attempt, "stack trigger timed out with request apparently lost, retrying");
                            last_err = Error::StackExecRequestLost;
                            continue;
                        }
                    }
                }
            }

            match stack_handle.await_result(self.config.stack_timeout) {
                Some(Ok(buf)) => return Ok(buf),
                Some(Err(e)) => return Err(e),
                None => match self.diagnose_lost_response(stack_reference)? {
                    Some(definite) => return Err(definite),
                    None => {
                        trace!(attempt, "stack response timed out with request apparently lost, retrying");
                        last_err = Error::StackExecRequestLost;
                    }
                },
            }
        }

        Err(last_err)
    }

    /// Reads `stack_exec_status0/1` directly to tell apart "the request was
    /// lost" (retryable) from "the stack executed but the response frame was
    /// lost" (not retryable, diagnosed from the status flags).
    fn diagnose_lost_response(&self, stack_reference: u32) -> Result<Option<Error>> {
        let read_ref = self.next_super_reference();
        let words = SuperCommandBuilder::read_stack_exec_status(read_ref).to_words();
        let response = self.super_transaction(&words)?;

        // response layout: [reference-mirror, status0, status1]
        if response.len() < 3 {
            return Ok(None);
        }
        let status0 = response[1];
        let status1 = response[2];

        if status1 != stack_reference {
            return Ok(None);
        }

        let flags = decode_status_flags(status0);
        let diagnosed = if flags.timeout {
            Error::NoVMEResponse
        } else if flags.bus_error {
            Error::VMEBusError
        } else if flags.syntax_error {
            Error::StackSyntaxError
        } else {
            Error::StackExecResponseLost
        };
        warn!(error = %diagnosed, "stack executed but response was lost, not retrying");
        Ok(Some(diagnosed))
    }
}

/// Direct/blocking stack execution: run one or more already-built command
/// stacks synchronously through the transaction engine, independent of the
/// readout worker.
pub mod stack_executor {
    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct CommandExecOptions {
        /// Keep going after a command stack reports a VME error rather than
        /// aborting the whole run (mirrors `contineOnVMEError` upstream).
        pub continue_on_vme_error: bool,
    }

    fn is_vme_error(e: &Error) -> bool {
        matches!(e, Error::VMEBusError)
    }

    /// Runs a single command stack through a stack transaction and returns
    /// its response words.
    pub fn run_command(
        engine: &TransactionEngine,
        stack_memory_offset_words: u16,
        stack_offset_bytes: u16,
        commands: &StackCommandBuilder,
    ) -> Result<Vec<u32>> {
        engine.stack_transaction(commands, stack_memory_offset_words, stack_offset_bytes)
    }

    /// Runs several command stacks in sequence, concatenating their response
    /// words. With `continue_on_vme_error` set, a VME-level error on one part
    /// does not abort the remaining parts; the first such error is still
    /// returned once the run completes.
    pub fn run_commands(
        engine: &TransactionEngine,
        stack_memory_offset_words: u16,
        stack_offset_bytes: u16,
        parts: &[StackCommandBuilder],
        options: CommandExecOptions,
    ) -> (Vec<u32>, Result<()>) {
        let mut combined = Vec::new();
        let mut first_error = Ok(());

        for part in parts {
            match run_command(engine, stack_memory_offset_words, stack_offset_bytes, part) {
                Ok(mut words) => combined.append(&mut words),
                Err(e) => {
                    let abort = !(options.continue_on_vme_error && is_vme_error(&e));
                    if first_error.is_ok() {
                        first_error = Err(e);
                    }
                    if abort {
                        return (combined, first_error);
                    }
                }
            }
        }

        (combined, first_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockUsbBackend;
    use crate::transport::{Transport, UsbStreamPipePolicy};

    fn push_words(backend: &mut MockUsbBackend, pipe: Pipe, words: &[u32]) {
        let bytes = words_to_bytes(words);
        match pipe {
            Pipe::Command => backend.command_rx.push_back(bytes),
            Pipe::Data => backend.data_rx.push_back(bytes),
        }
    }

    fn make_shared(backend: MockUsbBackend) -> Arc<CommandPipeShared> {
        CommandPipeShared::new(Transport::Usb {
            backend: Box::new(backend),
            stream_pipe_policy: UsbStreamPipePolicy::Default,
        })
    }

    #[test]
    fn upload_parts_split_500_words_into_181_181_138() {
        let stack_words: Vec<u32> = (0..500).collect();
        let mut refs = 0u16..;
        let parts = build_stack_upload_parts(&stack_words, 0, registers::UPLOAD_PART_WORDS_ETH, || {
            refs.next().unwrap()
        })
        .unwrap();

        assert_eq!(parts.len(), 3);
        // part 0: ref + StackStart + 181 data words = 183 words, each WriteLocal
        // encodes as 2 words (head + value).
        assert_eq!(parts[0].len(), 1 + (1 + 181) * 2);
        assert_eq!(parts[1].len(), 1 + 181 * 2);
        // part 2: ref + 138 data words + StackEnd = 139 writes.
        assert_eq!(parts[2].len(), 1 + (138 + 1) * 2);
    }

    #[test]
    fn single_part_upload_brackets_with_start_and_end() {
        let stack_words = vec![0xAAu32, 0xBBu32];
        let parts = build_stack_upload_parts(&stack_words, 0, 512, || 1).unwrap();
        assert_eq!(parts.len(), 1);
        let words = &parts[0];
        // words[0] is the reference word, words[1] the first WriteLocal's head
        // word, words[2] its value — the StackStart bracket word itself.
        let start_value = words[2];
        assert_eq!(start_value >> registers::STACK_COMMAND_CMD_SHIFT, registers::STACK_COMMAND_TYPE_START);
        let end_value = *words.last().unwrap();
        assert_eq!(end_value >> registers::STACK_COMMAND_CMD_SHIFT, registers::STACK_COMMAND_TYPE_END);
    }

    #[test]
    fn upload_exceeding_stack_memory_is_rejected() {
        let huge: Vec<u32> = (0..(registers::STACK_MEMORY_WORDS as usize + 10)).map(|i| i as u32).collect();
        let result = build_stack_upload_parts(&huge, 0, registers::UPLOAD_PART_WORDS_USB, || 0);
        assert!(matches!(result, Err(Error::StackMemoryExceeded)));
    }

    #[test]
    fn super_transaction_returns_mirrored_buffer() {
        use std::thread;

        let mut backend = MockUsbBackend::new();
        let header = crate::frame::encode(crate::frame::FrameType::SuperFrame, crate::frame::FrameFlags::default(), 0, 0, 1);
        push_words(&mut backend, Pipe::Command, &[header, (0x0101u32 << 16) | 7]);
        let shared = make_shared(backend);
        let engine = TransactionEngine::new(Arc::clone(&shared), TransactionConfig::default());

        let request = SuperCommandBuilder::new().add_reference_word(7).to_words();

        // Stand in for the command-pipe reader thread: wait for the engine to
        // register its pending reference, then read the preloaded response
        // off the mock transport and resolve the cell, exactly as
        // `command_pipe::dispatch` would.
        let reader_shared = Arc::clone(&shared);
        let reader = thread::spawn(move || {
            while reader_shared.pending_super.pending_reference() != Some(7) {
                thread::sleep(Duration::from_millis(2));
            }
            let mut transport = reader_shared.transport.lock().unwrap();
            let mut buf = [0u8; 64];
            let n = transport.read(Pipe::Command, &mut buf).unwrap();
            let words: Vec<u32> = buf[..n]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let observed = (words[1] & 0xffff) as u32;
            reader_shared
                .pending_super
                .resolve_observed(observed, || words, |_, _| Error::SuperFormatError);
        });

        let result = engine.super_transaction(&request).unwrap();
        reader.join().unwrap();
        assert_eq!(result[1] & 0xffff, 7);
    }
}
