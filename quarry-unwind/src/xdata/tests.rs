use super::*;
use crate::base::ProcessMemory;
use crate::registers::{RegisterFile, FRAME_REGISTER};
use crate::{UnwindError, UnwindErrorKind};

const IMAGE_BASE: u64 = 0x1_4000_0000;

/// Memory stitched together from disjoint captured regions.
struct TestMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl ProcessMemory for TestMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), UnwindError> {
        for (base, contents) in &self.regions {
            if address >= *base {
                let start = (address - base) as usize;
                if let Some(bytes) = contents.get(start..start + buf.len()) {
                    buf.copy_from_slice(bytes);
                    return Ok(());
                }
            }
        }
        Err(UnwindError::new(
            UnwindErrorKind::MemoryUnreadable,
            format!("no region covers {address:#x}"),
        ))
    }
}

fn slot(prolog_offset: u8, op: u8, info: u8) -> u16 {
    prolog_offset as u16 | ((op as u16) << 8) | ((info as u16) << 12)
}

fn unwind_info_bytes(
    flags: u8,
    prolog_size: u8,
    frame: u8,
    slots: &[u16],
    chained: Option<RuntimeFunction>,
) -> Vec<u8> {
    let mut out = vec![1 | (flags << 3), prolog_size, slots.len() as u8, frame];
    for slot in slots {
        out.extend_from_slice(&slot.to_le_bytes());
    }
    if slots.len() % 2 != 0 {
        out.extend_from_slice(&[0, 0]); // slot alignment
    }
    if let Some(chain) = chained {
        out.extend_from_slice(&chain.begin.to_le_bytes());
        out.extend_from_slice(&chain.end.to_le_bytes());
        out.extend_from_slice(&chain.unwind_info.to_le_bytes());
    }
    out
}

fn pdata(entries: &[RuntimeFunction]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(&entry.begin.to_le_bytes());
        out.extend_from_slice(&entry.end.to_le_bytes());
        out.extend_from_slice(&entry.unwind_info.to_le_bytes());
    }
    out
}

fn stack(base: u64, words: &[u64]) -> (u64, Vec<u8>) {
    let mut contents = Vec::new();
    for word in words {
        contents.extend_from_slice(&word.to_le_bytes());
    }
    (base, contents)
}

const RBP: u8 = FRAME_REGISTER;

#[test]
fn leaf_functions_pop_the_return_address() {
    let unwinder = TableUnwinder::new(IMAGE_BASE, &[]).unwrap();
    let memory = TestMemory {
        regions: vec![stack(0x8000, &[0x1_4000_1234])],
    };

    let mut registers = RegisterFile::new();
    registers.set_ip(IMAGE_BASE + 0x5000);
    registers.set_sp(0x8000);
    unwinder.unwind_frame(&memory, &mut registers).unwrap();

    assert_eq!(registers.ip(), Some(0x1_4000_1234));
    assert_eq!(registers.sp().unwrap(), 0x8008);
}

#[test]
fn replays_a_full_prologue_in_reverse() {
    // Prologue: push rbp (completes at +1); sub rsp, 0x30 (completes at +8).
    let entry = RuntimeFunction {
        begin: 0x1000,
        end: 0x1100,
        unwind_info: 0x2000,
    };
    let table = pdata(&[entry]);
    let info = unwind_info_bytes(0, 8, 0, &[slot(8, 2, 5), slot(1, 0, RBP)], None);

    let unwinder = TableUnwinder::new(IMAGE_BASE, &table).unwrap();
    let memory = TestMemory {
        regions: vec![
            (IMAGE_BASE + 0x2000, info),
            // 0x30 bytes of locals, saved rbp, then the return address.
            stack(0x8030, &[0xdead_beef, 0x1_4000_5678]),
        ],
    };

    let mut registers = RegisterFile::new();
    registers.set_ip(IMAGE_BASE + 0x1050);
    registers.set_sp(0x8000);
    unwinder.unwind_frame(&memory, &mut registers).unwrap();

    assert_eq!(registers.get(RBP), Some(0xdead_beef));
    assert_eq!(registers.sp().unwrap(), 0x8040);
    assert_eq!(registers.ip(), Some(0x1_4000_5678));
}

#[test]
fn mid_prologue_replays_only_executed_operations() {
    // Interrupted at +1: the push has executed, the allocation has not.
    let entry = RuntimeFunction {
        begin: 0x1000,
        end: 0x1100,
        unwind_info: 0x2000,
    };
    let table = pdata(&[entry]);
    let info = unwind_info_bytes(0, 8, 0, &[slot(8, 2, 5), slot(1, 0, RBP)], None);

    let unwinder = TableUnwinder::new(IMAGE_BASE, &table).unwrap();
    let memory = TestMemory {
        regions: vec![
            (IMAGE_BASE + 0x2000, info),
            stack(0x8000, &[0xfeed_f00d, 0x1_4000_9999]),
        ],
    };

    let mut registers = RegisterFile::new();
    registers.set_ip(IMAGE_BASE + 0x1001);
    registers.set_sp(0x8000);
    unwinder.unwind_frame(&memory, &mut registers).unwrap();

    // Only the push was undone: no 0x30 deallocation happened.
    assert_eq!(registers.get(RBP), Some(0xfeed_f00d));
    assert_eq!(registers.sp().unwrap(), 0x8010);
    assert_eq!(registers.ip(), Some(0x1_4000_9999));
}

#[test]
fn chained_entries_are_followed_transitively() {
    let parent = RuntimeFunction {
        begin: 0x1000,
        end: 0x1100,
        unwind_info: 0x2000,
    };
    let child = RuntimeFunction {
        begin: 0x1100,
        end: 0x1180,
        unwind_info: 0x2100,
    };
    let table = pdata(&[parent, child]);
    let parent_info = unwind_info_bytes(0, 8, 0, &[slot(8, 2, 5), slot(1, 0, RBP)], None);
    let child_info = unwind_info_bytes(
        UNW_FLAG_CHAININFO,
        4,
        0,
        &[slot(4, 2, 1)], // sub rsp, 0x10
        Some(parent),
    );

    let unwinder = TableUnwinder::new(IMAGE_BASE, &table).unwrap();
    let memory = TestMemory {
        regions: vec![
            (IMAGE_BASE + 0x2000, parent_info),
            (IMAGE_BASE + 0x2100, child_info),
            stack(0x8040, &[0xcafe_f00d, 0x1_4000_4242]),
        ],
    };

    let mut registers = RegisterFile::new();
    registers.set_ip(IMAGE_BASE + 0x1150);
    registers.set_sp(0x8000);
    unwinder.unwind_frame(&memory, &mut registers).unwrap();

    // 0x10 (child) + 0x30 (parent) deallocated, then the push undone.
    assert_eq!(registers.get(RBP), Some(0xcafe_f00d));
    assert_eq!(registers.sp().unwrap(), 0x8050);
    assert_eq!(registers.ip(), Some(0x1_4000_4242));
}

#[test]
fn machine_frames_restore_ip_and_sp_directly() {
    let entry = RuntimeFunction {
        begin: 0x3000,
        end: 0x3040,
        unwind_info: 0x2200,
    };
    let table = pdata(&[entry]);
    let info = unwind_info_bytes(0, 0, 0, &[slot(0, 10, 0)], None);

    let unwinder = TableUnwinder::new(IMAGE_BASE, &table).unwrap();
    let memory = TestMemory {
        regions: vec![
            (IMAGE_BASE + 0x2200, info),
            // rip, cs, eflags, old rsp, ss
            stack(0x9000, &[0x1_4000_7777, 0x33, 0x246, 0xa000, 0x2b]),
        ],
    };

    let mut registers = RegisterFile::new();
    registers.set_ip(IMAGE_BASE + 0x3010);
    registers.set_sp(0x9000);
    unwinder.unwind_frame(&memory, &mut registers).unwrap();

    assert_eq!(registers.ip(), Some(0x1_4000_7777));
    assert_eq!(registers.sp().unwrap(), 0xa000);
}

#[test]
fn epilogues_bypass_the_table() {
    let entry = RuntimeFunction {
        begin: 0x1000,
        end: 0x1100,
        unwind_info: 0x2000,
    };
    let table = pdata(&[entry]);
    // A large allocation that must NOT be replayed from inside the
    // epilogue.
    let info = unwind_info_bytes(0, 8, 0, &[slot(8, 2, 15)], None);

    // add rsp, 0x30; pop rbp; ret
    let epilogue_code = vec![0x48, 0x83, 0xc4, 0x30, 0x5d, 0xc3];
    let mut code_region = epilogue_code;
    code_region.resize(64, 0);

    let unwinder = TableUnwinder::new(IMAGE_BASE, &table).unwrap();
    let memory = TestMemory {
        regions: vec![
            (IMAGE_BASE + 0x2000, info),
            (IMAGE_BASE + 0x10f0, code_region),
            stack(0x8000, &[0x1_4000_1111]),
        ],
    };

    let mut registers = RegisterFile::new();
    registers.set_ip(IMAGE_BASE + 0x10f0);
    registers.set_sp(0x8000);
    unwinder.unwind_frame(&memory, &mut registers).unwrap();

    assert_eq!(registers.ip(), Some(0x1_4000_1111));
    assert_eq!(registers.sp().unwrap(), 0x8008);
}

#[test]
fn rejects_malformed_tables() {
    assert_eq!(
        ExceptionTable::parse(&[0u8; 10]).unwrap_err().kind(),
        UnwindErrorKind::BadUnwindData
    );

    let pdata_bytes = pdata(&[RuntimeFunction {
        begin: 0x1000,
        end: 0x1100,
        unwind_info: 0x2000,
    }]);
    let table = ExceptionTable::parse(&pdata_bytes).unwrap();
    assert!(table.find(0x0fff).unwrap().is_none());
    assert!(table.find(0x1100).unwrap().is_none());
    assert!(table.find(0x1000).unwrap().is_some());
}
