// ABOUTME: Resumable readout parser state machine (event/module reassembly) over
// ABOUTME: lossy, arbitrarily-split input buffers.

use std::collections::HashMap;

use crate::eth_envelope::{self, PacketChannel};
use crate::error::{Error, Result};
use crate::frame::{self, FrameType};

/// Shape of one VME module's readout inside a stack: up to three parts —
/// fixed prefix reads, an optional block transfer, fixed suffix reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupReadoutStructure {
    pub prefix_len: u8,
    pub has_dynamic: bool,
    pub suffix_len: u8,
}

impl GroupReadoutStructure {
    pub fn is_empty(self) -> bool {
        self.prefix_len == 0 && !self.has_dynamic && self.suffix_len == 0
    }
}

/// Per-stack group structure, indexed `[stack_id - 1][group_index]`.
pub type ReadoutStructure = Vec<Vec<GroupReadoutStructure>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupSpans {
    prefix: Span,
    dynamic: Span,
    suffix: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefix,
    Dynamic,
    Suffix,
}

#[derive(Debug, Clone, Copy)]
struct FrameCounter {
    header: u32,
    words_left: u16,
}

impl FrameCounter {
    fn continue_flag(self) -> bool {
        frame::decode(self.header).flags.continue_
    }
}

struct EventState {
    event_index: usize,
    group_index: usize,
    phase: Phase,
    cur_stack_frame: FrameCounter,
    cur_block_frame: Option<FrameCounter>,
}

/// Everything that survives across `parse_*` calls. Every local that must
/// outlive a resumable return lives here, not on the Rust call stack — this
/// is a plain state machine, not a coroutine.
pub struct ReadoutParserState {
    structure: ReadoutStructure,
    work_buffer: Vec<u32>,
    spans: Vec<GroupSpans>,
    event: Option<EventState>,
    last_packet_number: i32, // -1 == none seen yet
    last_buffer_number: Option<u32>,
}

impl ReadoutParserState {
    pub fn new(structure: ReadoutStructure) -> Self {
        Self {
            structure,
            work_buffer: Vec::new(),
            spans: Vec::new(),
            event: None,
            last_packet_number: -1,
            last_buffer_number: None,
        }
    }

    fn clear_event_state(&mut self) {
        self.event = None;
        self.work_buffer.clear();
        self.spans.clear();
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReadoutParserCounters {
    pub buffers_processed: u64,
    pub internal_buffer_loss: u64,
    pub eth_packets_processed: u64,
    pub eth_packet_loss: u64,
    pub unused_bytes: u64,
    pub words_skipped: u64,
    pub empty_stack_frames: u64,
    pub system_events: HashMap<u8, u64>,
    pub parse_errors: HashMap<&'static str, u64>,
    pub event_hits: HashMap<usize, u64>,
}

impl ReadoutParserCounters {
    fn tally_error(&mut self, err: &Error) {
        let key: &'static str = match err {
            Error::NotAStackFrame => "NotAStackFrame",
            Error::NotABlockFrame => "NotABlockFrame",
            Error::NotAStackContinuation => "NotAStackContinuation",
            Error::StackIndexChanged { .. } => "StackIndexChanged",
            Error::StackIndexOutOfRange(_) => "StackIndexOutOfRange",
            Error::GroupIndexOutOfRange(_) => "GroupIndexOutOfRange",
            Error::EmptyStackFrame => "EmptyStackFrame",
            Error::NoStackFrameFound => "NoStackFrameFound",
            Error::NoHeaderPresent => "NoHeaderPresent",
            Error::UnexpectedEndOfBuffer => "UnexpectedEndOfBuffer",
            _ => "Other",
        };
        *self.parse_errors.entry(key).or_insert(0) += 1;
    }
}

/// Callback surface invoked as events complete. Default bodies are no-ops so
/// a caller only overrides what it needs, mirroring the original's
/// default-constructed `std::function` members.
#[allow(unused_variables)]
pub trait ReadoutParserCallbacks {
    fn begin_event(&mut self, event_index: usize) {}
    fn group_prefix(&mut self, event_index: usize, group_index: usize, words: &[u32]) {}
    fn group_dynamic(&mut self, event_index: usize, group_index: usize, words: &[u32]) {}
    fn group_suffix(&mut self, event_index: usize, group_index: usize, words: &[u32]) {}
    fn end_event(&mut self, event_index: usize) {}
    fn system_event(&mut self, words: &[u32]) {}
}

struct Cursor<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u32> {
        self.words.get(self.pos).copied()
    }
    fn take(&mut self) -> Option<u32> {
        let w = self.peek()?;
        self.pos += 1;
        Some(w)
    }
    fn remaining(&self) -> usize {
        self.words.len() - self.pos
    }
}

/// Buffer-sequence-number loss, matching `calc_buffer_loss` in the original:
/// signed difference, wraparound-tolerant, `diff - 1` lost buffers.
fn calc_buffer_loss(last: Option<u32>, current: u32) -> u64 {
    let last = match last {
        None => return 0,
        Some(l) => l,
    };
    let diff = current as i64 - last as i64;
    let diff = if diff < 1 { (u32::MAX as i64) + diff } else { diff };
    (diff - 1).max(0) as u64
}

/// Flush a fully-assembled event: invoke callbacks in ascending group order,
/// then reset event state so the work buffer can be reused.
fn flush_event(
    state: &mut ReadoutParserState,
    callbacks: &mut dyn ReadoutParserCallbacks,
    counters: &mut ReadoutParserCounters,
    event_index: usize,
) {
    callbacks.begin_event(event_index);
    for (group_index, spans) in state.spans.iter().enumerate() {
        if spans.prefix.size > 0 {
            let s = spans.prefix;
            callbacks.group_prefix(
                event_index,
                group_index,
                &state.work_buffer[s.offset as usize..(s.offset + s.size) as usize],
            );
        }
        if spans.dynamic.size > 0 {
            let s = spans.dynamic;
            callbacks.group_dynamic(
                event_index,
                group_index,
                &state.work_buffer[s.offset as usize..(s.offset + s.size) as usize],
            );
        }
        if spans.suffix.size > 0 {
            let s = spans.suffix;
            callbacks.group_suffix(
                event_index,
                group_index,
                &state.work_buffer[s.offset as usize..(s.offset + s.size) as usize],
            );
        }
    }
    callbacks.end_event(event_index);
    *counters.event_hits.entry(event_index).or_insert(0) += 1;
    state.clear_event_state();
}

fn push_words(state: &mut ReadoutParserState, span: &mut Span, words: &[u32]) {
    if span.size == 0 {
        span.offset = state.work_buffer.len() as u32;
    }
    state.work_buffer.extend_from_slice(words);
    span.size += words.len() as u32;
}

/// Core per-frame parser. Consumes as much of `cursor` as it can; returns
/// `Ok(())` both when an event (or several) completed AND when the input
/// simply ran dry mid-phase — resumability
/// means "ran dry" is not an error, the next call continues from `state`.
fn parse_readout_contents(
    state: &mut ReadoutParserState,
    callbacks: &mut dyn ReadoutParserCallbacks,
    counters: &mut ReadoutParserCounters,
    cursor: &mut Cursor,
) -> Result<()> {
    loop {
        let last_iter_pos = cursor.pos;

        if state.event.is_none() {
            // find_stack_frame_header: walk forward until a StackFrame header
            // or input runs dry. Any non-StackFrame/StackContinuation header
            // while hunting is itself unexpected garbage and is skipped.
            let header = loop {
                match cursor.peek() {
                    None => return Ok(()),
                    Some(w) => {
                        let info = frame::decode(w);
                        match info.frame_type {
                            Some(FrameType::StackFrame) => {
                                cursor.take();
                                break info;
                            }
                            Some(FrameType::SystemEvent) => {
                                // Don't consume the header until the full payload is
                                // known to be buffered: otherwise a split across two
                                // `parse_*` calls would lose the header word, since
                                // `cursor` only spans the words passed to this call.
                                let need = 1 + info.length as usize;
                                if cursor.remaining() < need {
                                    return Ok(());
                                }
                                let mut words = Vec::with_capacity(need);
                                for _ in 0..need {
                                    words.push(cursor.take().unwrap());
                                }
                                callbacks.system_event(&words);
                                *counters
                                    .system_events
                                    .entry(info.sys_event_subtype.unwrap_or(0))
                                    .or_insert(0) += 1;
                                continue;
                            }
                            _ => {
                                cursor.take();
                                counters.words_skipped += 1;
                                continue;
                            }
                        }
                    }
                }
            };

            let stack_id = header.stack;
            if stack_id == 0 || stack_id as usize > state.structure.len() {
                let err = Error::StackIndexOutOfRange(stack_id);
                counters.tally_error(&err);
                return Err(err);
            }
            let event_index = stack_id as usize - 1;
            let group_count = state.structure[event_index].len();
            state.work_buffer.clear();
            state.spans = vec![GroupSpans::default(); group_count];

            if header.length == 0 {
                let all_empty = state.structure[event_index].iter().all(|g| g.is_empty());
                if all_empty {
                    callbacks.begin_event(event_index);
                    callbacks.end_event(event_index);
                    *counters.event_hits.entry(event_index).or_insert(0) += 1;
                    state.clear_event_state();
                    continue;
                } else {
                    counters.empty_stack_frames += 1;
                    state.clear_event_state();
                    continue;
                }
            }

            state.event = Some(EventState {
                event_index,
                group_index: 0,
                phase: Phase::Prefix,
                cur_stack_frame: FrameCounter {
                    header: frame_header_word(header),
                    words_left: header.length,
                },
                cur_block_frame: None,
            });
        } else {
            // An event is in progress but we've run out of words for its
            // current stack frame: expect a StackContinuation next.
            let need_continuation = {
                let ev = state.event.as_ref().unwrap();
                ev.cur_stack_frame.words_left == 0 && ev.cur_block_frame.is_none()
            };
            if need_continuation {
                match cursor.peek() {
                    None => return Ok(()),
                    Some(w) => {
                        let info = frame::decode(w);
                        match info.frame_type {
                            Some(FrameType::StackContinuation) => {
                                let event_index = state.event.as_ref().unwrap().event_index;
                                if info.stack as usize != event_index + 1 {
                                    let err = Error::StackIndexChanged {
                                        expected: (event_index + 1) as u8,
                                        actual: info.stack,
                                    };
                                    counters.tally_error(&err);
                                    state.clear_event_state();
                                    return Err(err);
                                }
                                cursor.take();
                                let ev = state.event.as_mut().unwrap();
                                ev.cur_stack_frame = FrameCounter {
                                    header: w,
                                    words_left: info.length,
                                };
                            }
                            _ => {
                                let err = Error::NotAStackContinuation;
                                counters.tally_error(&err);
                                state.clear_event_state();
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }

        // Drive the current event's group phases as far as the input allows.
        let event_index = state.event.as_ref().unwrap().event_index;
        loop {
            let group_count = state.structure[event_index].len();
            let group_index = state.event.as_ref().unwrap().group_index;
            if group_index >= group_count {
                flush_event(state, callbacks, counters, event_index);
                break;
            }

            let group = state.structure[event_index][group_index];
            if group.is_empty() {
                state.event.as_mut().unwrap().group_index += 1;
                state.event.as_mut().unwrap().phase = Phase::Prefix;
                continue;
            }

            let phase = state.event.as_ref().unwrap().phase;
            match phase {
                Phase::Prefix => {
                    let have_words = state.spans[group_index].prefix.size;
                    let want = (group.prefix_len as u32 - have_words) as usize;
                    let stack_words_left = state.event.as_ref().unwrap().cur_stack_frame.words_left as usize;
                    let take_n = want.min(stack_words_left).min(cursor.remaining());
                    if take_n > 0 {
                        let mut buf = Vec::with_capacity(take_n);
                        for _ in 0..take_n {
                            buf.push(cursor.take().unwrap());
                        }
                        state.event.as_mut().unwrap().cur_stack_frame.words_left -= take_n as u16;
                        let mut span = state.spans[group_index].prefix;
                        push_words(state, &mut span, &buf);
                        state.spans[group_index].prefix = span;
                    }
                    let still_need = want - take_n;
                    if still_need > 0 {
                        // ran dry mid-prefix, or stack frame boundary reached
                        if state.event.as_ref().unwrap().cur_stack_frame.words_left == 0 {
                            if !state.event.as_ref().unwrap().cur_stack_frame.continue_flag() {
                                let err = Error::UnexpectedEndOfBuffer;
                                counters.tally_error(&err);
                                state.clear_event_state();
                                return Err(err);
                            }
                            // expect continuation on next outer loop iteration
                            break;
                        }
                        return Ok(());
                    }
                    let ev = state.event.as_mut().unwrap();
                    ev.phase = if group.has_dynamic {
                        Phase::Dynamic
                    } else {
                        Phase::Suffix
                    };
                }
                Phase::Dynamic => {
                    if state.event.as_ref().unwrap().cur_block_frame.is_none() {
                        let stack_words_left = state.event.as_ref().unwrap().cur_stack_frame.words_left;
                        if stack_words_left == 0 {
                            if !state.event.as_ref().unwrap().cur_stack_frame.continue_flag() {
                                let err = Error::UnexpectedEndOfBuffer;
                                counters.tally_error(&err);
                                state.clear_event_state();
                                return Err(err);
                            }
                            break;
                        }
                        match cursor.peek() {
                            None => return Ok(()),
                            Some(w) => {
                                let info = frame::decode(w);
                                if info.frame_type != Some(FrameType::BlockRead) {
                                    let err = Error::NotABlockFrame;
                                    counters.tally_error(&err);
                                    state.clear_event_state();
                                    return Err(err);
                                }
                                cursor.take();
                                let ev = state.event.as_mut().unwrap();
                                ev.cur_stack_frame.words_left -= 1;
                                ev.cur_block_frame = Some(FrameCounter {
                                    header: w,
                                    words_left: info.length,
                                });
                            }
                        }
                    }

                    let block_words_left = state.event.as_ref().unwrap().cur_block_frame.unwrap().words_left as usize;
                    let take_n = block_words_left.min(cursor.remaining());
                    if take_n > 0 {
                        let mut buf = Vec::with_capacity(take_n);
                        for _ in 0..take_n {
                            buf.push(cursor.take().unwrap());
                        }
                        {
                            let ev = state.event.as_mut().unwrap();
                            ev.cur_stack_frame.words_left -= take_n as u16;
                            ev.cur_block_frame.as_mut().unwrap().words_left -= take_n as u16;
                        }
                        let mut span = state.spans[group_index].dynamic;
                        push_words(state, &mut span, &buf);
                        state.spans[group_index].dynamic = span;
                    }

                    if state.event.as_ref().unwrap().cur_block_frame.unwrap().words_left == 0 {
                        let cont = state.event.as_ref().unwrap().cur_block_frame.unwrap().continue_flag();
                        state.event.as_mut().unwrap().cur_block_frame = None;
                        if !cont {
                            state.event.as_mut().unwrap().phase = Phase::Suffix;
                        }
                        // else: loop again, a new BlockRead continuation is expected
                    } else {
                        // ran dry mid-block
                        return Ok(());
                    }
                }
                Phase::Suffix => {
                    let have_words = state.spans[group_index].suffix.size;
                    let want = (group.suffix_len as u32 - have_words) as usize;
                    let stack_words_left = state.event.as_ref().unwrap().cur_stack_frame.words_left as usize;
                    let take_n = want.min(stack_words_left).min(cursor.remaining());
                    if take_n > 0 {
                        let mut buf = Vec::with_capacity(take_n);
                        for _ in 0..take_n {
                            buf.push(cursor.take().unwrap());
                        }
                        state.event.as_mut().unwrap().cur_stack_frame.words_left -= take_n as u16;
                        let mut span = state.spans[group_index].suffix;
                        push_words(state, &mut span, &buf);
                        state.spans[group_index].suffix = span;
                    }
                    let still_need = want - take_n;
                    if still_need > 0 {
                        if state.event.as_ref().unwrap().cur_stack_frame.words_left == 0 {
                            if !state.event.as_ref().unwrap().cur_stack_frame.continue_flag() {
                                let err = Error::UnexpectedEndOfBuffer;
                                counters.tally_error(&err);
                                state.clear_event_state();
                                return Err(err);
                            }
                            break;
                        }
                        return Ok(());
                    }
                    state.event.as_mut().unwrap().group_index += 1;
                    state.event.as_mut().unwrap().phase = Phase::Prefix;
                }
            }
        }

        if cursor.pos == last_iter_pos {
            // made no progress this iteration and didn't return Ok above:
            // defensive stop to avoid spinning (original: "not advancing").
            return Ok(());
        }
    }
}

fn frame_header_word(info: frame::FrameInfo) -> u32 {
    frame::encode(
        info.frame_type.unwrap(),
        info.flags,
        info.stack,
        info.ctrl,
        info.length,
    )
}

/// Entry point for USB buffers: track the buffer sequence number, clear
/// event state on detected loss, then run the per-frame parser over the
/// whole buffer.
pub fn parse_readout_buffer_usb(
    state: &mut ReadoutParserState,
    callbacks: &mut dyn ReadoutParserCallbacks,
    counters: &mut ReadoutParserCounters,
    buffer_number: u32,
    words: &[u32],
) -> Result<()> {
    let loss = calc_buffer_loss(state.last_buffer_number, buffer_number);
    if loss > 0 {
        counters.internal_buffer_loss += loss;
        state.clear_event_state();
    }
    state.last_buffer_number = Some(buffer_number);
    counters.buffers_processed += 1;

    let mut cursor = Cursor { words, pos: 0 };
    let result = parse_readout_contents(state, callbacks, counters, &mut cursor);
    counters.unused_bytes += ((words.len() - cursor.pos) * 4) as u64;
    result
}

/// Entry point for ETH: each packet in the buffer is framed by the envelope
/// (`eth_envelope`), and packet-number loss is computed per packet rather
/// than per buffer.
pub fn parse_eth_packet(
    state: &mut ReadoutParserState,
    callbacks: &mut dyn ReadoutParserCallbacks,
    counters: &mut ReadoutParserCounters,
    header0: eth_envelope::Header0,
    header1: eth_envelope::Header1,
    payload: &[u32],
) -> Result<()> {
    if header0.packet_channel as u8 == PacketChannel::Data as u8
        || header0.packet_channel as u8 == PacketChannel::Stack as u8
    {
        let loss = eth_envelope::calc_packet_loss(state.last_packet_number, header0.packet_number);
        if loss > 0 {
            counters.eth_packet_loss += loss as u64;
            state.clear_event_state();
        }
        state.last_packet_number = header0.packet_number as i32;
    }
    counters.eth_packets_processed += 1;

    let has_event_in_progress = state.event.is_some();
    let start = if !has_event_in_progress {
        if header1.next_header_pointer == eth_envelope::NO_HEADER_POINTER_PRESENT {
            return Err(Error::NoHeaderPresent);
        }
        header1.next_header_pointer as usize
    } else {
        0
    };

    if start > payload.len() {
        return Err(Error::NoHeaderPresent);
    }
    counters.unused_bytes += (start * 4) as u64;

    let mut cursor = Cursor {
        words: &payload[start..],
        pos: 0,
    };
    let result = parse_readout_contents(state, callbacks, counters, &mut cursor);
    counters.unused_bytes += ((payload[start..].len() - cursor.pos) * 4) as u64;
    result
}
