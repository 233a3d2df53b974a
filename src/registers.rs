// ABOUTME: VME register map and stack-memory layout constants the core touches directly.

/// Writing 1 enables autonomous trigger processing.
pub const DAQ_MODE: u16 = 0x1300;

/// Header word of the last immediate-stack response.
pub const STACK_EXEC_STATUS0: u16 = 0x1400;

/// Second word (marker/reference, by convention) of the last immediate-stack response.
pub const STACK_EXEC_STATUS1: u16 = 0x1404;

/// Number of controller-side command stacks.
pub const STACK_COUNT: usize = 8;

pub const STACK0_TRIGGER_REGISTER: u16 = 0x1100;
pub const STACK0_OFFSET_REGISTER: u16 = 0x1200;

/// Offset, in words, from the start of stack memory where the first stack's
/// immediate-mode program begins.
pub const IMMEDIATE_STACK_START_OFFSET_WORDS: u16 = 1;
pub const IMMEDIATE_STACK_START_OFFSET_BYTES: u16 = IMMEDIATE_STACK_START_OFFSET_WORDS * 4;

/// Words reserved for the immediate stack's program area.
pub const IMMEDIATE_STACK_RESERVED_WORDS: u16 = 255;

/// Bit position of the trigger-type field within the trigger register value,
/// and the "fire immediately" bit written by the transaction engine.
pub const IMMEDIATE_SHIFT: u32 = 8;
pub const TRIGGER_IMMEDIATE: u32 = 1 << IMMEDIATE_SHIFT;

/// Self-referencing VME address used by `WriteLocal`/`ReadLocal` super commands.
pub const SELF_VME_ADDRESS: u32 = 0xFFFF0000;

/// Max words a single mirror (super) transaction response may carry.
pub const MIRROR_TRANSACTION_MAX_WORDS: usize = 2048;
pub const MIRROR_TRANSACTION_MAX_CONTENTS_WORDS: usize = 2046;

/// Stack-upload part size limits.
pub const UPLOAD_PART_WORDS_ETH: usize = 181;
pub const UPLOAD_PART_WORDS_USB: usize = 768;

/// Start of the controller's stack-memory address space and its size in
/// words; `WriteLocal` addresses used during upload must stay inside
/// `[STACK_MEMORY_BEGIN, STACK_MEMORY_END)`.
pub const STACK_MEMORY_BEGIN: u16 = 0x2000;
pub const STACK_MEMORY_WORDS: u16 = 2048;
pub const STACK_MEMORY_BYTES: u16 = STACK_MEMORY_WORDS * 4;
pub const STACK_MEMORY_END: u16 = STACK_MEMORY_BEGIN + STACK_MEMORY_BYTES;

/// `WriteLocal` addresses into stack memory advance by one word (4 bytes)
/// per uploaded word.
pub const STACK_MEMORY_ADDRESS_INCREMENT: u16 = 4;

/// Upload-phase bracketing commands: `StackStart`/`StackEnd` framing words
/// written into stack memory around the uploaded program, encoded the same
/// way the controller encodes on-stack commands (`cmd << 24 | arg0 << 16`).
pub const STACK_COMMAND_CMD_SHIFT: u32 = 24;
pub const STACK_COMMAND_ARG0_SHIFT: u32 = 16;
pub const STACK_COMMAND_TYPE_START: u32 = 0xF3;
pub const STACK_COMMAND_TYPE_END: u32 = 0xF4;
