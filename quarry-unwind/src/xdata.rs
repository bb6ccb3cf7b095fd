//! The table-driven unwinder: exception-table lookup, unwind-info
//! decoding and reverse replay of prologue operations.
//!
//! Every non-leaf function carries an unwind-info block listing the
//! prologue operations that established its frame (pushes, stack
//! allocations, the optional frame-register setup, register saves).
//! Unwinding replays those operations in reverse against a register
//! file: a push becomes a pop, an allocation a deallocation, a save a
//! load. Chained entries are followed transitively. Functions without a
//! table entry, and functions interrupted inside an epilogue, use the
//! leaf rule: the return address sits on top of the stack.

use scroll::{Pread, LE};

use crate::base::ProcessMemory;
use crate::registers::RegisterFile;
use crate::{UnwindError, UnwindErrorKind};

/// Unwind-info flag: the entry chains to a parent function's entry.
pub const UNW_FLAG_CHAININFO: u8 = 0x4;

/// One exception-table entry: a function's begin/end and the location of
/// its unwind info, all image-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind_info: u32,
}

/// The image's exception table (the `.pdata` section): an array of
/// [`RuntimeFunction`] entries sorted by begin address.
#[derive(Debug, Clone)]
pub struct ExceptionTable<'d> {
    data: &'d [u8],
}

impl<'d> ExceptionTable<'d> {
    /// Wraps raw exception-table bytes.
    pub fn parse(data: &'d [u8]) -> Result<Self, UnwindError> {
        if data.len() % 12 != 0 {
            return Err(UnwindError::new(
                UnwindErrorKind::BadUnwindData,
                "exception table size is not a multiple of the entry size",
            ));
        }
        Ok(ExceptionTable { data })
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.data.len() / 12
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn entry(&self, index: usize) -> Result<RuntimeFunction, UnwindError> {
        let mut offset = index * 12;
        let begin = self.data.gread_with(&mut offset, LE).map_err(bad_data)?;
        let end = self.data.gread_with(&mut offset, LE).map_err(bad_data)?;
        let unwind_info = self.data.gread_with(&mut offset, LE).map_err(bad_data)?;
        Ok(RuntimeFunction {
            begin,
            end,
            unwind_info,
        })
    }

    /// Finds the entry covering an image-relative address.
    ///
    /// Zeroed entries (seen in packed exception directories) never match.
    pub fn find(&self, rva: u32) -> Result<Option<RuntimeFunction>, UnwindError> {
        let mut low = 0usize;
        let mut high = self.len();
        let mut best = None;
        while low < high {
            let mid = (low + high) / 2;
            let entry = self.entry(mid)?;
            if entry.begin <= rva {
                best = Some(entry);
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(best.filter(|entry| entry.begin < entry.end && rva < entry.end))
    }
}

/// One prologue operation, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    /// Push of a nonvolatile register.
    PushNonvol(u8),
    /// Stack allocation of the given byte size.
    Alloc(u32),
    /// Establish the frame register at an offset from the stack pointer.
    SetFpreg,
    /// Save of a register to `[frame base + offset]`.
    SaveNonvol(u8, u32),
    /// Save of a vector register; no effect on the integer file.
    SaveXmm128(u8, u32),
    /// A machine frame pushed by the CPU, with or without an error code.
    PushMachframe(bool),
    /// Version-2 epilogue marker; not replayed.
    Epilog,
}

/// One unwind code: the prologue offset at which its operation completed
/// plus the operation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    pub prolog_offset: u8,
    pub op: UnwindOp,
}

/// A decoded unwind-info block.
#[derive(Debug, Clone)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: u8,
    pub prolog_size: u8,
    pub frame_register: u8,
    /// Scaled frame-register offset in bytes.
    pub frame_offset: u32,
    /// Codes in stored order: most recent prologue operation first.
    pub codes: Vec<UnwindCode>,
    /// The parent entry, when the chained flag is set.
    pub chained: Option<RuntimeFunction>,
}

impl UnwindInfo {
    /// Reads and decodes an unwind-info block through the memory
    /// capability.
    pub fn read<M: ProcessMemory>(memory: &M, address: u64) -> Result<Self, UnwindError> {
        let mut header = [0u8; 4];
        memory.read(address, &mut header)?;

        let version = header[0] & 0x07;
        let flags = header[0] >> 3;
        let prolog_size = header[1];
        let count = header[2] as usize;
        let frame_register = header[3] & 0x0f;
        let frame_offset = ((header[3] >> 4) as u32) * 16;

        if version != 1 && version != 2 {
            return Err(UnwindError::new(
                UnwindErrorKind::BadUnwindData,
                format!("unsupported unwind info version {version}"),
            ));
        }

        let mut slot_bytes = vec![0u8; count * 2];
        memory.read(address + 4, &mut slot_bytes)?;
        let slots: Vec<u16> = slot_bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        let mut codes = Vec::new();
        let mut index = 0;
        while index < slots.len() {
            let slot = slots[index];
            let prolog_offset = (slot & 0xff) as u8;
            let op = ((slot >> 8) & 0x0f) as u8;
            let info = (slot >> 12) as u8;
            index += 1;

            // Pulls `n` extra slots; the second word is zero for n == 1.
            let mut take = |n: usize| -> Result<(u32, u32), UnwindError> {
                let taken = slots.get(index..index + n).ok_or_else(|| {
                    UnwindError::new(UnwindErrorKind::BadUnwindData, "truncated unwind codes")
                })?;
                index += n;
                Ok((taken[0] as u32, taken.get(1).copied().unwrap_or(0) as u32))
            };

            let op = match op {
                0 => UnwindOp::PushNonvol(info),
                1 => match info {
                    0 => UnwindOp::Alloc(take(1)?.0 * 8),
                    _ => {
                        let (low, high) = take(2)?;
                        UnwindOp::Alloc(low | (high << 16))
                    }
                },
                2 => UnwindOp::Alloc(info as u32 * 8 + 8),
                3 => UnwindOp::SetFpreg,
                4 => UnwindOp::SaveNonvol(info, take(1)?.0 * 8),
                5 => {
                    let (low, high) = take(2)?;
                    UnwindOp::SaveNonvol(info, low | (high << 16))
                }
                6 if version >= 2 => {
                    // Epilogue descriptors occupy one extra slot.
                    let _ = take(1)?;
                    UnwindOp::Epilog
                }
                6 => UnwindOp::SaveXmm128(info, take(1)?.0 * 8),
                7 => {
                    let _ = take(2)?;
                    UnwindOp::SaveXmm128(info, 0)
                }
                8 => UnwindOp::SaveXmm128(info, take(1)?.0 * 16),
                9 => {
                    let (low, high) = take(2)?;
                    UnwindOp::SaveXmm128(info, low | (high << 16))
                }
                10 => UnwindOp::PushMachframe(info != 0),
                other => {
                    return Err(UnwindError::new(
                        UnwindErrorKind::BadUnwindData,
                        format!("unknown unwind operation {other}"),
                    ));
                }
            };
            codes.push(UnwindCode { prolog_offset, op });
        }

        // A chained entry follows the codes, slot-aligned to pairs.
        let chained = if flags & UNW_FLAG_CHAININFO != 0 {
            let chain_offset = address + 4 + ((count + 1) & !1) as u64 * 2;
            let mut chain = [0u8; 12];
            memory.read(chain_offset, &mut chain)?;
            Some(RuntimeFunction {
                begin: u32::from_le_bytes(chain[0..4].try_into().unwrap()),
                end: u32::from_le_bytes(chain[4..8].try_into().unwrap()),
                unwind_info: u32::from_le_bytes(chain[8..12].try_into().unwrap()),
            })
        } else {
            None
        };

        Ok(UnwindInfo {
            version,
            flags,
            prolog_size,
            frame_register,
            frame_offset,
            codes,
            chained,
        })
    }
}

fn bad_data(e: scroll::Error) -> UnwindError {
    UnwindError::with_source(UnwindErrorKind::BadUnwindData, "truncated unwind data", e)
}

/// Table-driven unwinding over one image's exception table.
pub struct TableUnwinder<'d> {
    image_base: u64,
    table: ExceptionTable<'d>,
}

impl<'d> TableUnwinder<'d> {
    /// Creates an unwinder for an image loaded at `image_base` whose
    /// exception table is `pdata`.
    pub fn new(image_base: u64, pdata: &'d [u8]) -> Result<Self, UnwindError> {
        Ok(TableUnwinder {
            image_base,
            table: ExceptionTable::parse(pdata)?,
        })
    }

    /// Computes the caller's register state from the callee's, in place.
    ///
    /// Uses the table entry covering the instruction pointer when there
    /// is one; otherwise, or when the instruction pointer sits inside an
    /// epilogue, applies the leaf rule.
    pub fn unwind_frame<M: ProcessMemory>(
        &self,
        memory: &M,
        registers: &mut RegisterFile,
    ) -> Result<(), UnwindError> {
        let ip = registers
            .ip()
            .ok_or_else(|| UnwindError::new(UnwindErrorKind::MissingRegister, "$rip is unset"))?;
        let rva = ip
            .checked_sub(self.image_base)
            .and_then(|delta| u32::try_from(delta).ok())
            .ok_or_else(|| {
                UnwindError::new(
                    UnwindErrorKind::BadUnwindData,
                    "instruction pointer below the image base",
                )
            })?;

        let entry = match self.table.find(rva)? {
            Some(entry) => entry,
            None => return leaf_unwind(memory, registers),
        };

        if self.in_epilogue(memory, ip) {
            return leaf_unwind(memory, registers);
        }

        let offset_in_func = rva - entry.begin;
        let mut next = Some(entry);
        let mut first = true;
        let mut machine_frame = false;

        while let Some(entry) = next.take() {
            let info = UnwindInfo::read(memory, self.image_base + entry.unwind_info as u64)?;

            for code in &info.codes {
                // Inside the prologue only the operations already executed
                // are undone; chained parents are always fully replayed.
                if first
                    && offset_in_func < info.prolog_size as u32
                    && code.prolog_offset as u32 > offset_in_func
                {
                    continue;
                }

                let sp = registers.sp()?;
                match code.op {
                    UnwindOp::PushNonvol(reg) => {
                        let value = memory.read_word(sp, 8)?;
                        registers.set(reg, value);
                        registers.set_sp(sp + 8);
                    }
                    UnwindOp::Alloc(size) => {
                        registers.set_sp(sp + size as u64);
                    }
                    UnwindOp::SetFpreg => {
                        let frame = registers.get(info.frame_register).ok_or_else(|| {
                            UnwindError::new(
                                UnwindErrorKind::MissingRegister,
                                format!(
                                    "frame register {} is unset",
                                    RegisterFile::name(info.frame_register)
                                ),
                            )
                        })?;
                        registers.set_sp(frame - info.frame_offset as u64);
                    }
                    UnwindOp::SaveNonvol(reg, offset) => {
                        let base = self.frame_base(registers, &info)?;
                        let value = memory.read_word(base + offset as u64, 8)?;
                        registers.set(reg, value);
                    }
                    UnwindOp::SaveXmm128(..) | UnwindOp::Epilog => {}
                    UnwindOp::PushMachframe(has_error_code) => {
                        let mut frame = registers.sp()?;
                        if has_error_code {
                            frame += 8;
                        }
                        let new_ip = memory.read_word(frame, 8)?;
                        let new_sp = memory.read_word(frame + 24, 8)?;
                        registers.set_ip(new_ip);
                        registers.set_sp(new_sp);
                        machine_frame = true;
                    }
                }
            }

            next = info.chained;
            first = false;
        }

        if !machine_frame {
            let sp = registers.sp()?;
            let return_address = memory.read_word(sp, 8)?;
            registers.set_ip(return_address);
            registers.set_sp(sp + 8);
        }
        Ok(())
    }

    fn frame_base(&self, registers: &RegisterFile, info: &UnwindInfo) -> Result<u64, UnwindError> {
        if info.frame_register != 0 {
            let frame = registers.get(info.frame_register).ok_or_else(|| {
                UnwindError::new(UnwindErrorKind::MissingRegister, "frame register is unset")
            })?;
            Ok(frame - info.frame_offset as u64)
        } else {
            registers.sp()
        }
    }

    /// Matches the fixed epilogue grammar at the instruction pointer:
    /// an optional stack deallocation, a run of register pops, then a
    /// return (or a tail jump).
    fn in_epilogue<M: ProcessMemory>(&self, memory: &M, ip: u64) -> bool {
        let mut code = [0u8; 32];
        if memory.read(ip, &mut code).is_err() {
            return false;
        }
        let mut i = 0;

        // add rsp, imm8 / add rsp, imm32 / lea rsp, [rbp + disp]
        if code[i..].starts_with(&[0x48, 0x83, 0xc4]) {
            i += 4;
        } else if code[i..].starts_with(&[0x48, 0x81, 0xc4]) {
            i += 7;
        } else if code[i..].starts_with(&[0x48, 0x8d, 0x65]) {
            i += 4;
        } else if code[i..].starts_with(&[0x48, 0x8d, 0xa5]) {
            i += 7;
        }

        // pop r64, with or without a REX.B prefix
        loop {
            if i < code.len() && (0x58..0x60).contains(&code[i]) {
                i += 1;
            } else if i + 1 < code.len()
                && (code[i] == 0x41 || code[i] == 0x48)
                && (0x58..0x60).contains(&code[i + 1])
            {
                i += 2;
            } else {
                break;
            }
        }

        match code.get(i) {
            // ret / ret imm16 / jmp rel8 / jmp rel32
            Some(0xc3) | Some(0xc2) | Some(0xeb) | Some(0xe9) => true,
            // jmp [rip+disp32]
            Some(0xff) => code.get(i + 1) == Some(&0x25),
            _ => false,
        }
    }
}

/// The leaf rule: the return address is on top of the stack.
fn leaf_unwind<M: ProcessMemory>(
    memory: &M,
    registers: &mut RegisterFile,
) -> Result<(), UnwindError> {
    let sp = registers.sp()?;
    let return_address = memory.read_word(sp, 8)?;
    registers.set_ip(return_address);
    registers.set_sp(sp + 8);
    Ok(())
}

#[cfg(test)]
mod tests;
