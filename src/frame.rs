// ABOUTME: 32-bit frame header bitfield codec and classification.
// ABOUTME: Pure functions only; no I/O, no state.

use num_enum::TryFromPrimitive;

const TYPE_SHIFT: u32 = 24;
const TYPE_MASK: u32 = 0xff;
const FLAGS_SHIFT: u32 = 20;
const FLAGS_MASK: u32 = 0xf;
const STACK_SHIFT: u32 = 16;
const STACK_MASK: u32 = 0xf;
const CTRL_SHIFT: u32 = 13;
const CTRL_MASK: u32 = 0b111;
const LENGTH_SHIFT: u32 = 0;
const LENGTH_MASK: u32 = 0x1fff;

const SYSEVENT_CONTINUE_SHIFT: u32 = 23;
const SYSEVENT_CTRL_SHIFT: u32 = 20;
const SYSEVENT_CTRL_MASK: u32 = 0b111;
const SYSEVENT_SUBTYPE_SHIFT: u32 = 13;
const SYSEVENT_SUBTYPE_MASK: u32 = 0x7f;

/// The seven frame types this codec recognizes. The controller firmware's
/// second system-event variant (0xFB) is deliberately not one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    SuperFrame = 0xF1,
    SuperContinuation = 0xF2,
    StackFrame = 0xF3,
    BlockRead = 0xF5,
    StackError = 0xF7,
    StackContinuation = 0xF9,
    SystemEvent = 0xFA,
}

/// Single-bit flags carried by non-system frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    pub continue_: bool,
    pub syntax_error: bool,
    pub bus_error: bool,
    pub timeout: bool,
}

impl FrameFlags {
    const TIMEOUT_BIT: u32 = 0b0001;
    const BUS_ERROR_BIT: u32 = 0b0010;
    const SYNTAX_ERROR_BIT: u32 = 0b0100;
    const CONTINUE_BIT: u32 = 0b1000;

    fn from_bits(bits: u32) -> Self {
        FrameFlags {
            continue_: bits & Self::CONTINUE_BIT != 0,
            syntax_error: bits & Self::SYNTAX_ERROR_BIT != 0,
            bus_error: bits & Self::BUS_ERROR_BIT != 0,
            timeout: bits & Self::TIMEOUT_BIT != 0,
        }
    }

    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.continue_ {
            bits |= Self::CONTINUE_BIT;
        }
        if self.syntax_error {
            bits |= Self::SYNTAX_ERROR_BIT;
        }
        if self.bus_error {
            bits |= Self::BUS_ERROR_BIT;
        }
        if self.timeout {
            bits |= Self::TIMEOUT_BIT;
        }
        bits
    }

    pub fn has_error(self) -> bool {
        self.syntax_error || self.bus_error || self.timeout
    }
}

/// Decoded shape of a single header word. For `SystemEvent` headers,
/// `flags.continue_` is the sole meaningful flag bit and `sys_event_subtype`
/// is populated; `stack`/`ctrl` follow the system-event bit layout instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_type: Option<FrameType>,
    pub raw_type: u8,
    pub flags: FrameFlags,
    pub stack: u8,
    pub ctrl: u8,
    pub length: u16,
    pub sys_event_subtype: Option<u8>,
}

/// Encode a non-system frame header.
pub fn encode(frame_type: FrameType, flags: FrameFlags, stack: u8, ctrl: u8, length: u16) -> u32 {
    ((frame_type as u32 & TYPE_MASK) << TYPE_SHIFT)
        | ((flags.to_bits() & FLAGS_MASK) << FLAGS_SHIFT)
        | ((stack as u32 & STACK_MASK) << STACK_SHIFT)
        | ((ctrl as u32 & CTRL_MASK) << CTRL_SHIFT)
        | ((length as u32 & LENGTH_MASK) << LENGTH_SHIFT)
}

/// Encode a `SystemEvent` header.
pub fn encode_system_event(subtype: u8, continue_flag: bool, ctrl: u8, length: u16) -> u32 {
    let continue_bit = if continue_flag { 1u32 } else { 0 };
    ((FrameType::SystemEvent as u32 & TYPE_MASK) << TYPE_SHIFT)
        | (continue_bit << SYSEVENT_CONTINUE_SHIFT)
        | ((ctrl as u32 & SYSEVENT_CTRL_MASK) << SYSEVENT_CTRL_SHIFT)
        | ((subtype as u32 & SYSEVENT_SUBTYPE_MASK) << SYSEVENT_SUBTYPE_SHIFT)
        | ((length as u32 & LENGTH_MASK) << LENGTH_SHIFT)
}

/// Decode a header word. Branches internally on whether the type byte is
/// `SystemEvent`, since that header reuses its low bits differently.
pub fn decode(header: u32) -> FrameInfo {
    let raw_type = ((header >> TYPE_SHIFT) & TYPE_MASK) as u8;
    let frame_type = FrameType::try_from_primitive(raw_type).ok();
    let length = ((header >> LENGTH_SHIFT) & LENGTH_MASK) as u16;

    if frame_type == Some(FrameType::SystemEvent) {
        let continue_ = (header >> SYSEVENT_CONTINUE_SHIFT) & 1 != 0;
        let ctrl = ((header >> SYSEVENT_CTRL_SHIFT) & SYSEVENT_CTRL_MASK) as u8;
        let subtype = ((header >> SYSEVENT_SUBTYPE_SHIFT) & SYSEVENT_SUBTYPE_MASK) as u8;
        FrameInfo {
            frame_type,
            raw_type,
            flags: FrameFlags {
                continue_,
                ..Default::default()
            },
            stack: 0,
            ctrl,
            length,
            sys_event_subtype: Some(subtype),
        }
    } else {
        let flags = FrameFlags::from_bits((header >> FLAGS_SHIFT) & FLAGS_MASK);
        let stack = ((header >> STACK_SHIFT) & STACK_MASK) as u8;
        let ctrl = ((header >> CTRL_SHIFT) & CTRL_MASK) as u8;
        FrameInfo {
            frame_type,
            raw_type,
            flags,
            stack,
            ctrl,
            length,
            sys_event_subtype: None,
        }
    }
}

/// True exactly for the seven known type codes.
pub fn is_known_header(header: u32) -> bool {
    let raw_type = ((header >> TYPE_SHIFT) & TYPE_MASK) as u8;
    FrameType::try_from_primitive(raw_type).is_ok()
}

/// Known system-event sub-types. Values outside this set (including the
/// `UserMin..=UserMax` range) are carried through as the raw byte by callers;
/// this is only a convenience for the well-known ones.
pub mod system_event {
    pub const ENDIAN_MARKER: u8 = 0x01;
    pub const BEGIN_RUN: u8 = 0x02;
    pub const END_RUN: u8 = 0x03;
    pub const MVME_CONFIG: u8 = 0x10;
    pub const UNIX_TIMETICK: u8 = 0x11;
    pub const PAUSE: u8 = 0x12;
    pub const RESUME: u8 = 0x13;
    pub const MVLC_CRATE_CONFIG: u8 = 0x14;
    pub const STACK_ERRORS: u8 = 0x15;
    pub const USER_MIN: u8 = 0x20;
    pub const USER_MAX: u8 = 0x2F;
    pub const END_OF_FILE: u8 = 0x77;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_known_types() {
        let types = [
            FrameType::SuperFrame,
            FrameType::SuperContinuation,
            FrameType::StackFrame,
            FrameType::BlockRead,
            FrameType::StackError,
            FrameType::StackContinuation,
        ];
        for &frame_type in &types {
            for &flags in &[
                FrameFlags::default(),
                FrameFlags {
                    continue_: true,
                    syntax_error: true,
                    bus_error: true,
                    timeout: true,
                },
            ] {
                for stack in [0u8, 7, 15] {
                    for ctrl in [0u8, 3, 7] {
                        for length in [0u16, 1, 0x1fff] {
                            let header = encode(frame_type, flags, stack, ctrl, length);
                            let info = decode(header);
                            assert_eq!(info.frame_type, Some(frame_type));
                            assert_eq!(info.flags, flags);
                            assert_eq!(info.stack, stack);
                            assert_eq!(info.ctrl, ctrl);
                            assert_eq!(info.length, length);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn system_event_round_trip() {
        let header = encode_system_event(system_event::BEGIN_RUN, true, 3, 5);
        let info = decode(header);
        assert_eq!(info.frame_type, Some(FrameType::SystemEvent));
        assert_eq!(info.sys_event_subtype, Some(system_event::BEGIN_RUN));
        assert!(info.flags.continue_);
        assert_eq!(info.ctrl, 3);
        assert_eq!(info.length, 5);
    }

    #[test]
    fn unknown_type_is_not_a_known_header() {
        let header = 0x00_00_00_00u32;
        assert!(!is_known_header(header));
        let header = 0xFF_00_00_00u32; // SystemEvent2, deliberately unrecognized
        assert!(!is_known_header(header));
    }

    #[test]
    fn step_length_plus_one_lands_on_next_header() {
        let header = encode(FrameType::StackFrame, FrameFlags::default(), 1, 0, 3);
        let words = [header, 0xAAAA_AAAA, 0xBBBB_BBBB, 0xCCCC_CCCC, 0xDEAD_BEEF];
        let info = decode(words[0]);
        let next = 1 + info.length as usize;
        assert_eq!(words[next], 0xDEAD_BEEF);
    }
}
