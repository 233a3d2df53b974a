// ABOUTME: Aggregates hardware-reported stack errors by (stack, line, flags).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::frame::{self, FrameType};
use crate::registers::STACK_COUNT;

const STACK_LINE_MASK: u32 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackErrorInfo {
    pub line: u16,
    pub flags: u8,
}

pub type ErrorInfoCounts = HashMap<StackErrorInfo, u64>;

#[derive(Debug, Default, Clone)]
pub struct StackErrorCounters {
    pub stack_errors: Vec<ErrorInfoCounts>,
    pub non_error_frames: u64,
    pub non_error_header_counts: HashMap<u32, u64>,
}

impl StackErrorCounters {
    pub fn new() -> Self {
        Self {
            stack_errors: (0..STACK_COUNT).map(|_| HashMap::new()).collect(),
            non_error_frames: 0,
            non_error_header_counts: HashMap::new(),
        }
    }

    /// Cheap change-detection signal for periodic pollers (the readout
    /// worker's stack-errors plugin): sums every tallied count rather than
    /// comparing the nested maps themselves.
    pub fn total_count(&self) -> u64 {
        self.non_error_frames + self.stack_errors.iter().flat_map(|m| m.values()).sum::<u64>()
    }
}

/// Thread-safe wrapper: the reader thread writes, any number of readers take
/// a lock only long enough to snapshot-copy.
#[derive(Default)]
pub struct SharedStackErrorCounters {
    inner: Mutex<StackErrorCounters>,
}

impl SharedStackErrorCounters {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StackErrorCounters::new()),
        }
    }

    pub fn snapshot(&self) -> StackErrorCounters {
        self.inner.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap() = StackErrorCounters::new();
    }

    /// `error_frame` is the raw header word followed by the rest of the
    /// frame's payload words, exactly as it appeared on the wire.
    pub fn record(&self, error_frame: &[u32]) {
        let mut counters = self.inner.lock().unwrap();
        update_stack_error_counters(&mut counters, error_frame);
    }
}

/// Expects a 2-word frame: `StackError` header plus a payload word whose low
/// 16 bits are the stack line. Anything else falls into the non-error tally.
pub fn update_stack_error_counters(counters: &mut StackErrorCounters, error_frame: &[u32]) {
    debug_assert!(!error_frame.is_empty());

    let is_error_frame = if error_frame.len() == 2 {
        let info = frame::decode(error_frame[0]);
        matches!(info.frame_type, Some(FrameType::StackError)) && (info.stack as usize) < STACK_COUNT
    } else {
        false
    };

    if is_error_frame {
        let info = frame::decode(error_frame[0]);
        let stack_line = (error_frame[1] & STACK_LINE_MASK) as u16;
        let key = StackErrorInfo {
            line: stack_line,
            flags: info.flags.to_bits() as u8,
        };
        *counters.stack_errors[info.stack as usize].entry(key).or_insert(0) += 1;
    } else if !error_frame.is_empty() {
        counters.non_error_frames += 1;
        *counters
            .non_error_header_counts
            .entry(error_frame[0])
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode, FrameFlags};

    #[test]
    fn records_well_formed_error_frame() {
        let mut counters = StackErrorCounters::new();
        let header = encode(
            FrameType::StackError,
            FrameFlags {
                bus_error: true,
                ..Default::default()
            },
            3,
            0,
            1,
        );
        update_stack_error_counters(&mut counters, &[header, 42]);
        let key = StackErrorInfo { line: 42, flags: 0b010 };
        assert_eq!(counters.stack_errors[3][&key], 1);
    }

    #[test]
    fn continue_bit_is_part_of_the_stored_flags_key() {
        let mut counters = StackErrorCounters::new();
        let header = encode(
            FrameType::StackError,
            FrameFlags {
                bus_error: true,
                continue_: true,
                ..Default::default()
            },
            3,
            0,
            1,
        );
        update_stack_error_counters(&mut counters, &[header, 42]);
        let key = StackErrorInfo { line: 42, flags: 0b1010 };
        assert_eq!(counters.stack_errors[3][&key], 1);
    }

    #[test]
    fn falls_back_to_non_error_tally_on_shape_mismatch() {
        let mut counters = StackErrorCounters::new();
        update_stack_error_counters(&mut counters, &[0xDEADBEEF]);
        assert_eq!(counters.non_error_frames, 1);
        assert_eq!(counters.non_error_header_counts[&0xDEADBEEF], 1);
    }

    #[test]
    fn out_of_range_stack_id_falls_back_too() {
        let mut counters = StackErrorCounters::new();
        let header = encode(FrameType::StackError, FrameFlags::default(), 15, 0, 1);
        update_stack_error_counters(&mut counters, &[header, 1]);
        assert_eq!(counters.non_error_frames, 1);
    }
}
