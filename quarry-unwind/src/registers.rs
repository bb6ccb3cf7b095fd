//! The x86-64 register-file snapshot unwinding operates on.

use std::fmt;

use crate::{UnwindError, UnwindErrorKind};

/// x86-64 general-purpose registers in unwind-operation encoding order.
pub const REGISTER_NAMES: [&str; 16] = [
    "$rax", "$rcx", "$rdx", "$rbx", "$rsp", "$rbp", "$rsi", "$rdi", "$r8", "$r9", "$r10", "$r11",
    "$r12", "$r13", "$r14", "$r15",
];

/// Encoding of the stack pointer.
pub const RSP: u8 = 4;

/// The conventional frame register.
pub const FRAME_REGISTER: u8 = 5;

/// A snapshot of the integer register state of one frame.
///
/// Registers are addressed by their unwind-operation encoding (0 = rax …
/// 15 = r15); the instruction pointer is kept separately. Unknown
/// registers stay unset, and unwinding propagates that honestly rather
/// than inventing values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    regs: [Option<u64>; 16],
    ip: Option<u64>,
}

impl RegisterFile {
    /// Creates an empty register file.
    pub fn new() -> Self {
        Self::default()
    }

    /// The instruction pointer.
    pub fn ip(&self) -> Option<u64> {
        self.ip
    }

    /// Sets the instruction pointer.
    pub fn set_ip(&mut self, value: u64) {
        self.ip = Some(value);
    }

    /// The value of a register by unwind encoding.
    pub fn get(&self, reg: u8) -> Option<u64> {
        self.regs.get(reg as usize).copied().flatten()
    }

    /// Sets a register by unwind encoding.
    pub fn set(&mut self, reg: u8, value: u64) {
        if let Some(slot) = self.regs.get_mut(reg as usize) {
            *slot = Some(value);
        }
    }

    /// The stack pointer, required by every unwind step.
    pub fn sp(&self) -> Result<u64, UnwindError> {
        self.get(RSP)
            .ok_or_else(|| UnwindError::new(UnwindErrorKind::MissingRegister, "$rsp is unset"))
    }

    /// Sets the stack pointer.
    pub fn set_sp(&mut self, value: u64) {
        self.set(RSP, value);
    }

    /// The display name of a register encoding.
    pub fn name(reg: u8) -> &'static str {
        REGISTER_NAMES.get(reg as usize).copied().unwrap_or("$?")
    }
}

impl fmt::Display for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = self.ip {
            write!(f, "$rip={ip:#x}")?;
        }
        for (index, value) in self.regs.iter().enumerate() {
            if let Some(value) = value {
                write!(f, " {}={value:#x}", Self::name(index as u8))?;
            }
        }
        Ok(())
    }
}
