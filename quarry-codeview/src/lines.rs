//! Source-line tables: the per-unit line subsections, the checksum
//! indirection into the global string table, and line lookup by address.
//!
//! Each compilation unit's stream carries, after its symbol records, a
//! sequence of framed debug subsections. Line subsections associate a
//! contiguous code range with arrays of `(offset, line)` pairs grouped by
//! source file; files are referenced through a checksum subsection that
//! points into the container-wide string table, so file names are stored
//! once per container.

use quarry_msf::{StreamWalker, StringTable};

use crate::dbi::DebugInformation;
use crate::symbols::{SymbolGraph, SymbolHandle};
use crate::{annotations, raw, CodeViewError, CodeViewErrorKind, SectionTable, Symbol};

/// A source file referenced by line information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Checksum kind byte (0 none, 1 MD5, 2 SHA-1, 3 SHA-256).
    pub checksum_kind: u8,
    pub checksum: Vec<u8>,
}

/// One resolved line record.
#[derive(Debug, Clone)]
pub struct LineEntry {
    /// Image-relative address of the first instruction of the line.
    pub address: u64,
    pub line: u32,
    /// The source file, resolved through the checksum table.
    pub file: String,
    /// Index of the compilation unit the entry came from.
    module: usize,
    /// Checksum-subsection offset of the file, for re-resolution.
    file_offset: u32,
}

/// One compilation unit's line subsections.
struct UnitLines<'m, 'data> {
    walker: StreamWalker<'m, 'data>,
}

/// The assembled line tables of a container.
pub struct LineTables<'m, 'data> {
    units: Vec<UnitLines<'m, 'data>>,
    sections: SectionTable,
    strings: Option<StringTable<'m, 'data>>,
}

impl<'m, 'data> LineTables<'m, 'data> {
    /// Collects the line subsections of every compilation unit.
    ///
    /// `strings` is the container's global string table; without it file
    /// names cannot be resolved and lookups degrade to
    /// `MissingInformation`.
    pub fn parse(
        dbi: &DebugInformation<'m, 'data>,
        sections: SectionTable,
        strings: Option<StringTable<'m, 'data>>,
    ) -> Result<Self, CodeViewError> {
        let mut units = Vec::new();
        for info in dbi.compilands()? {
            let info = info?;
            if let Ok(walker) = dbi.lines_walker(&info) {
                units.push(UnitLines { walker });
            }
        }
        Ok(LineTables {
            units,
            sections,
            strings,
        })
    }

    /// Iterates subsections of one unit, yielding narrowed walkers of the
    /// requested type.
    fn subsections(
        walker: StreamWalker<'m, 'data>,
        want: u32,
    ) -> impl Iterator<Item = Result<StreamWalker<'m, 'data>, CodeViewError>> {
        let mut cursor = walker;
        std::iter::from_fn(move || loop {
            if cursor.remaining() < 8 {
                return None;
            }
            let kind = match cursor.read_u32() {
                Ok(kind) => kind,
                Err(e) => return Some(Err(e.into())),
            };
            let size = match cursor.read_u32() {
                Ok(size) => size,
                Err(e) => return Some(Err(e.into())),
            };
            let mut sub = cursor;
            cursor.skip(size as u64);
            if kind & raw::DEBUG_S_IGNORE != 0 || kind != want {
                continue;
            }
            if sub.narrow(sub.pos(), size as u64).is_err() {
                tracing::warn!(kind, size, "truncated debug subsection");
                return None;
            }
            return Some(Ok(sub));
        })
    }

    /// Resolves a checksum-subsection offset to a file entry.
    fn file_at(&self, unit: usize, file_offset: u32) -> Result<FileEntry, CodeViewError> {
        let walker = self.units[unit].walker;
        for sub in Self::subsections(walker, raw::DEBUG_S_FILECHKSMS) {
            let mut sub = sub?;
            let base = sub.pos();
            sub.seek(base + file_offset as u64);
            let str_offset = sub.read_u32()?;
            let size = sub.read_u8()?;
            let kind = sub.read_u8()?;
            let mut checksum = vec![0u8; size as usize];
            sub.read(&mut checksum)?;
            let strings = self
                .strings
                .as_ref()
                .ok_or(CodeViewErrorKind::MissingInformation)?;
            let name = strings.get(str_offset)?;
            return Ok(FileEntry {
                name,
                checksum_kind: kind,
                checksum,
            });
        }
        Err(CodeViewErrorKind::MissingInformation.into())
    }

    /// All source files referenced by the container, deduplicated through
    /// the string table.
    pub fn files(&self) -> Result<Vec<FileEntry>, CodeViewError> {
        let mut seen = std::collections::BTreeSet::new();
        let mut files = Vec::new();
        for unit in 0..self.units.len() {
            for sub in Self::subsections(self.units[unit].walker, raw::DEBUG_S_FILECHKSMS) {
                let mut sub = sub?;
                while sub.remaining() >= 6 {
                    let str_offset = sub.read_u32()?;
                    let size = sub.read_u8()?;
                    let kind = sub.read_u8()?;
                    let mut checksum = vec![0u8; size as usize];
                    sub.read(&mut checksum)?;
                    sub.align(4);
                    if seen.insert(str_offset) {
                        let strings = self
                            .strings
                            .as_ref()
                            .ok_or(CodeViewErrorKind::MissingInformation)?;
                        files.push(FileEntry {
                            name: strings.get(str_offset)?,
                            checksum_kind: kind,
                            checksum,
                        });
                    }
                }
            }
        }
        Ok(files)
    }

    /// Finds the tightest line at or before `address`.
    pub fn line_at(&self, address: u64) -> Result<LineEntry, CodeViewError> {
        for unit in 0..self.units.len() {
            match self.line_at_in_unit(unit, address) {
                Ok(entry) => return Ok(entry),
                Err(e) if e.kind() == CodeViewErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CodeViewErrorKind::NotFound.into())
    }

    fn line_at_in_unit(&self, unit: usize, address: u64) -> Result<LineEntry, CodeViewError> {
        let block = self.locate_block(unit, address)?;
        let delta = address - block.base;
        let lines = &block.lines;

        // The last entry matches when nothing later is at-or-before.
        let mut index = lines.len() - 1;
        for i in 0..lines.len() - 1 {
            if lines[i].0 as u64 == delta
                || (lines[i].0 as u64 <= delta && delta < lines[i + 1].0 as u64)
            {
                index = i;
                break;
            }
        }

        let file = self.file_at(unit, block.file_offset)?;
        Ok(LineEntry {
            address: block.base + lines[index].0 as u64,
            line: lines[index].1,
            file: file.name,
            module: unit,
            file_offset: block.file_offset,
        })
    }

    /// Steps a line entry to the closest entry with a different address,
    /// forward or backward, within its file block.
    pub fn advance(&self, entry: &LineEntry, forward: bool) -> Result<LineEntry, CodeViewError> {
        let block = self.locate_block(entry.module, entry.address)?;
        let lines = &block.lines;
        let delta = entry.address - block.base;

        let mut index = lines.len() - 1;
        for i in 0..lines.len() {
            if lines[i].0 as u64 == delta {
                index = i;
                break;
            }
        }

        let found = if forward {
            lines[index + 1..]
                .iter()
                .find(|candidate| candidate.0 as u64 != delta)
        } else {
            lines[..index]
                .iter()
                .rev()
                .find(|candidate| candidate.0 as u64 != delta)
        };

        match found {
            Some(&(offset, line)) => {
                let file = self.file_at(entry.module, block.file_offset)?;
                Ok(LineEntry {
                    address: block.base + offset as u64,
                    line,
                    file: file.name,
                    module: entry.module,
                    file_offset: block.file_offset,
                })
            }
            None => Err(CodeViewErrorKind::NotFound.into()),
        }
    }

    /// Visits every line record whose file passes the filter.
    pub fn enumerate(
        &self,
        mut filter: impl FnMut(&str) -> bool,
        mut visit: impl FnMut(&str, u64, u32),
    ) -> Result<(), CodeViewError> {
        for unit in 0..self.units.len() {
            for sub in Self::subsections(self.units[unit].walker, raw::DEBUG_S_LINES) {
                let mut sub = sub?;
                if sub.remaining() < 24 {
                    // Too small to hold a header and one file block.
                    continue;
                }
                let off_con = sub.read_u32()?;
                let seg_con = sub.read_u16()?;
                let flags = sub.read_u16()?;
                let _cb_con = sub.read_u32()?;
                let Some(base) = self.sections.address_of(seg_con, off_con) else {
                    continue;
                };

                while sub.remaining() >= 12 {
                    let file_offset = sub.read_u32()?;
                    let num_lines = sub.read_u32()?;
                    let _cb_block = sub.read_u32()?;
                    let file = self.file_at(unit, file_offset)?;
                    let matches = filter(&file.name);
                    for _ in 0..num_lines {
                        let offset = sub.read_u32()?;
                        let bits = sub.read_u32()?;
                        if matches {
                            visit(&file.name, base + offset as u64, bits & 0x00ff_ffff);
                        }
                    }
                    if flags & raw::LINES_HAVE_COLUMNS != 0 {
                        sub.skip(num_lines as u64 * 4);
                    }
                }
            }
        }
        Ok(())
    }

    /// Locates the file block covering `address` in one unit.
    fn locate_block(&self, unit: usize, address: u64) -> Result<FileBlock, CodeViewError> {
        for sub in Self::subsections(self.units[unit].walker, raw::DEBUG_S_LINES) {
            let mut sub = sub?;
            if sub.remaining() < 24 {
                continue;
            }
            let off_con = sub.read_u32()?;
            let seg_con = sub.read_u16()?;
            let flags = sub.read_u16()?;
            let cb_con = sub.read_u32()?;
            let Some(base) = self.sections.address_of(seg_con, off_con) else {
                continue;
            };
            if address < base || address >= base + cb_con as u64 {
                continue;
            }

            while sub.remaining() >= 12 {
                let file_offset = sub.read_u32()?;
                let num_lines = sub.read_u32()?;
                let _cb_block = sub.read_u32()?;
                let mut lines = Vec::with_capacity(num_lines as usize);
                for _ in 0..num_lines {
                    let offset = sub.read_u32()?;
                    let bits = sub.read_u32()?;
                    lines.push((offset, bits & 0x00ff_ffff));
                }
                if flags & raw::LINES_HAVE_COLUMNS != 0 {
                    sub.skip(num_lines as u64 * 4);
                }
                if !lines.is_empty() {
                    return Ok(FileBlock {
                        base,
                        file_offset,
                        lines,
                    });
                }
            }
        }
        Err(CodeViewErrorKind::NotFound.into())
    }

    /// Computes the line at `address` inside an inline site by replaying
    /// the site's annotations against the inlinee's base line.
    pub fn inline_line_at(
        &self,
        graph: &SymbolGraph,
        site: SymbolHandle,
        address: u64,
    ) -> Result<LineEntry, CodeViewError> {
        let Symbol::Function(function) = graph.symbols.get(site) else {
            return Err(CodeViewErrorKind::NotFound.into());
        };
        if !function.inline {
            return Err(CodeViewErrorKind::NotFound.into());
        }
        let inlinee = function
            .inlinee
            .ok_or(CodeViewErrorKind::MissingInformation)?;
        let top = function
            .top_function
            .ok_or(CodeViewErrorKind::MissingInformation)?;
        let Symbol::Function(top_function) = graph.symbols.get(top) else {
            return Err(CodeViewErrorKind::NotFound.into());
        };
        let top_address = top_function.address();

        // The unit owning the top function also owns the annotations.
        let unit = self.unit_covering(top_address)?;
        let (mut file_offset, base_line) = self.inlinee_base(unit, inlinee)?;
        let mut file = self.file_at(unit, file_offset)?;

        let mut line = base_line;
        let mut offset: u64 = 0;
        let mut best: Option<(u64, u32)> = None;
        for annotation in annotations::AnnotationIter::new(&function.annotations) {
            let mut check_address = false;
            match annotation.opcode {
                raw::BA_OP_CODE_OFFSET => offset = annotation.arg1 as u64,
                raw::BA_OP_CHANGE_CODE_OFFSET => {
                    offset += annotation.arg1 as u64;
                    check_address = true;
                }
                raw::BA_OP_CHANGE_CODE_LENGTH => offset += annotation.arg1 as u64,
                raw::BA_OP_CHANGE_FILE => {
                    file_offset = annotation.arg1;
                    file = self.file_at(unit, file_offset)?;
                }
                raw::BA_OP_CHANGE_LINE_OFFSET => {
                    line = line.wrapping_add_signed(annotations::decode_signed(annotation.arg1));
                }
                raw::BA_OP_CHANGE_CODE_OFFSET_AND_LINE_OFFSET => {
                    line = line.wrapping_add_signed(annotations::decode_signed(annotation.arg2));
                    offset += annotation.arg1 as u64;
                    check_address = true;
                }
                raw::BA_OP_CHANGE_CODE_LENGTH_AND_CODE_OFFSET => {
                    offset += annotation.arg2 as u64;
                    check_address = true;
                }
                _ => {}
            }
            if check_address {
                if top_address + offset > address {
                    break;
                }
                best = Some((top_address + offset, line));
                if top_address + offset == address {
                    break;
                }
            }
        }

        match best {
            Some((address, line)) => Ok(LineEntry {
                address,
                line,
                file: file.name,
                module: unit,
                file_offset,
            }),
            None => Err(CodeViewErrorKind::NotFound.into()),
        }
    }

    /// The unit whose line subsections cover `address`.
    fn unit_covering(&self, address: u64) -> Result<usize, CodeViewError> {
        for unit in 0..self.units.len() {
            for sub in Self::subsections(self.units[unit].walker, raw::DEBUG_S_LINES) {
                let mut sub = sub?;
                if sub.remaining() < 12 {
                    continue;
                }
                let off_con = sub.read_u32()?;
                let seg_con = sub.read_u16()?;
                let _flags = sub.read_u16()?;
                let cb_con = sub.read_u32()?;
                if let Some(base) = self.sections.address_of(seg_con, off_con) {
                    if address >= base && address < base + cb_con as u64 {
                        return Ok(unit);
                    }
                }
            }
        }
        Err(CodeViewErrorKind::NotFound.into())
    }

    /// Looks up an inlinee's source file and base line in the
    /// inlinee-lines subsection.
    fn inlinee_base(&self, unit: usize, inlinee: u32) -> Result<(u32, u32), CodeViewError> {
        for sub in Self::subsections(self.units[unit].walker, raw::DEBUG_S_INLINEELINES) {
            let mut sub = sub?;
            let kind = sub.read_u32()?;
            // Kind 1 entries carry an extra file-count list.
            let extended = kind == 1;
            while sub.remaining() >= 12 {
                let item = sub.read_u32()?;
                let file_offset = sub.read_u32()?;
                let base_line = sub.read_u32()?;
                if extended {
                    let extra_files = sub.read_u32()?;
                    sub.skip(extra_files as u64 * 4);
                }
                if item == inlinee {
                    return Ok((file_offset, base_line));
                }
            }
        }
        Err(CodeViewErrorKind::MissingInformation.into())
    }
}

/// One file block of a lines subsection, decoded.
struct FileBlock {
    base: u64,
    file_offset: u32,
    lines: Vec<(u32, u32)>,
}
