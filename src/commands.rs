// ABOUTME: Minimal super/stack command builders.
// ABOUTME: Full command construction is out of scope; this is just enough to drive
// ABOUTME: the transaction engine, the readout worker's Mcst hooks, and tests.

use crate::registers;

/// The super-command types the transaction engine and throttle controller
/// need to issue. Not the original's full vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperCommandType {
    ReferenceWord,
    ReadLocal,
    WriteLocal,
    EthDelay,
}

impl SuperCommandType {
    fn opcode(self) -> u16 {
        match self {
            SuperCommandType::ReferenceWord => 0x0101,
            SuperCommandType::ReadLocal => 0x0102,
            SuperCommandType::WriteLocal => 0x0204,
            SuperCommandType::EthDelay => 0x0207,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SuperCommand {
    kind: SuperCommandType,
    address_or_arg: u16,
    value: u32,
}

/// Fluent builder producing a finished super-command word buffer. Mirrors
/// the shape of `SuperCommandBuilder` in the original without reproducing its
/// full command vocabulary.
#[derive(Debug, Clone, Default)]
pub struct SuperCommandBuilder {
    commands: Vec<SuperCommand>,
}

impl SuperCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reference_word(mut self, reference: u16) -> Self {
        self.commands.push(SuperCommand {
            kind: SuperCommandType::ReferenceWord,
            address_or_arg: reference,
            value: 0,
        });
        self
    }

    pub fn add_read_local(mut self, address: u16) -> Self {
        self.commands.push(SuperCommand {
            kind: SuperCommandType::ReadLocal,
            address_or_arg: address,
            value: 0,
        });
        self
    }

    pub fn add_write_local(mut self, address: u16, value: u32) -> Self {
        self.commands.push(SuperCommand {
            kind: SuperCommandType::WriteLocal,
            address_or_arg: address,
            value,
        });
        self
    }

    /// Each super command encodes as one word: `{opcode(16), arg(16)}` for
    /// reference/read, followed by a second value word for writes.
    pub fn to_words(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.commands.len() * 2);
        for cmd in &self.commands {
            let head = ((cmd.kind.opcode() as u32) << 16) | cmd.address_or_arg as u32;
            out.push(head);
            if cmd.kind == SuperCommandType::WriteLocal {
                out.push(cmd.value);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Convenience matching the trigger-phase super command built by the
    /// transaction engine's stack transaction.
    pub fn trigger_stack(reference: u16, stack_offset_bytes: u16) -> Self {
        SuperCommandBuilder::new()
            .add_reference_word(reference)
            .add_write_local(registers::STACK_EXEC_STATUS0, 0)
            .add_write_local(registers::STACK_EXEC_STATUS1, 0)
            .add_write_local(registers::STACK0_OFFSET_REGISTER, stack_offset_bytes as u32)
            .add_write_local(
                registers::STACK0_TRIGGER_REGISTER,
                registers::TRIGGER_IMMEDIATE,
            )
    }

    /// Convenience matching the status-register readback used by the retry
    /// ladder's diagnosis step.
    pub fn read_stack_exec_status(reference: u16) -> Self {
        SuperCommandBuilder::new()
            .add_reference_word(reference)
            .add_read_local(registers::STACK_EXEC_STATUS0)
            .add_read_local(registers::STACK_EXEC_STATUS1)
    }
}

/// A single command inside a stack program. Subset of the original's
/// `StackCommand::CommandType` vocabulary (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCommand {
    WriteMarker(u32),
    VmeRead { address: u32, amod: u8 },
    VmeReadBlock { address: u32, amod: u8, transfers: u16 },
    VmeWrite { address: u32, amod: u8, value: u32 },
}

mod stack_opcode {
    pub const WRITE_MARKER: u8 = 0xC0;
    pub const VME_READ: u8 = 0x12;
    pub const VME_READ_BLOCK: u8 = 0x13;
    pub const VME_WRITE: u8 = 0x23;
}

/// Builds the word sequence for a single immediate stack. Upload chunking
/// (splitting this into transport-sized parts) is the transaction engine's
/// job, not the builder's — see `transaction::upload_stack`.
#[derive(Debug, Clone, Default)]
pub struct StackCommandBuilder {
    commands: Vec<StackCommand>,
}

impl StackCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_write_marker(mut self, reference: u32) -> Self {
        self.commands.push(StackCommand::WriteMarker(reference));
        self
    }

    pub fn add_vme_read(mut self, address: u32, amod: u8) -> Self {
        self.commands.push(StackCommand::VmeRead { address, amod });
        self
    }

    pub fn add_vme_read_block(mut self, address: u32, amod: u8, transfers: u16) -> Self {
        self.commands.push(StackCommand::VmeReadBlock {
            address,
            amod,
            transfers,
        });
        self
    }

    pub fn add_vme_write(mut self, address: u32, amod: u8, value: u32) -> Self {
        self.commands.push(StackCommand::VmeWrite {
            address,
            amod,
            value,
        });
        self
    }

    pub fn commands(&self) -> &[StackCommand] {
        &self.commands
    }

    pub fn first_is_write_marker(&self) -> bool {
        matches!(self.commands.first(), Some(StackCommand::WriteMarker(_)))
    }

    /// Encodes the stack program to words. Each command is `{opcode(8),
    /// amod-or-zero(8), transfers-or-zero(16)}` followed by `address` and,
    /// for writes/markers, a `value` word.
    pub fn to_words(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for cmd in &self.commands {
            match *cmd {
                StackCommand::WriteMarker(reference) => {
                    out.push((stack_opcode::WRITE_MARKER as u32) << 24);
                    out.push(reference);
                }
                StackCommand::VmeRead { address, amod } => {
                    out.push(((stack_opcode::VME_READ as u32) << 24) | ((amod as u32) << 16));
                    out.push(address);
                }
                StackCommand::VmeReadBlock {
                    address,
                    amod,
                    transfers,
                } => {
                    out.push(
                        ((stack_opcode::VME_READ_BLOCK as u32) << 24)
                            | ((amod as u32) << 16)
                            | transfers as u32,
                    );
                    out.push(address);
                }
                StackCommand::VmeWrite {
                    address,
                    amod,
                    value,
                } => {
                    out.push(((stack_opcode::VME_WRITE as u32) << 24) | ((amod as u32) << 16));
                    out.push(address);
                    out.push(value);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_builder_encodes_reference_then_writes() {
        let words = SuperCommandBuilder::new()
            .add_reference_word(0x1234)
            .add_write_local(0x1400, 0)
            .to_words();
        assert_eq!(words[0], (0x0101u32 << 16) | 0x1234);
        assert_eq!(words[1], (0x0204u32 << 16) | 0x1400);
        assert_eq!(words[2], 0);
    }

    #[test]
    fn stack_builder_requires_marker_first_for_transactions() {
        let b = StackCommandBuilder::new().add_write_marker(7).add_vme_read(0x1000, 0x09);
        assert!(b.first_is_write_marker());
    }
}
