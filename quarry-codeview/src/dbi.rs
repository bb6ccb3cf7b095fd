//! The debug-information stream: compilation-unit directory, section
//! contributions and the global symbol stream.

use quarry_common::HashTable;
use quarry_msf::raw::STREAM_DBI;
use quarry_msf::{Msf, StreamWalker};

use crate::record::Record;
use crate::{raw, CodeViewError, CodeViewErrorKind};

/// The parsed debug-information stream header.
#[derive(Debug, Clone, Copy)]
struct DbiHeader {
    version: u32,
    sym_record_stream: u16,
    module_info_size: u32,
    section_contribution_size: u32,
    /// Stream offset just past the header.
    end: u64,
}

/// One compilation unit as listed in the module-info substream.
#[derive(Debug, Clone)]
pub struct CompilandInfo {
    /// Stream id of the unit's symbol stream, `0xffff` if absent.
    pub stream: u16,
    /// Byte size of the symbol substream (including its signature).
    pub symbols_size: u32,
    /// Byte size of the line-information substream following the symbols.
    pub lines_size: u32,
    /// The unit's first section contribution.
    pub contribution: SectionContribution,
    /// The module name (usually the object file path).
    pub name: String,
    /// The object file name (the archive member for libraries).
    pub object_name: String,
}

/// A contiguous range of code contributed by one compilation unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionContribution {
    pub segment: u16,
    pub offset: u32,
    pub size: u32,
    /// Index of the contributing compilation unit.
    pub module: u16,
}

/// A symbol from the global symbol stream.
#[derive(Debug, Clone)]
pub enum GlobalSymbol {
    Public {
        name: String,
        segment: u16,
        offset: u32,
        flags: u32,
    },
    Data {
        name: String,
        segment: u16,
        offset: u32,
        type_id: u32,
        global: bool,
    },
    ThreadData {
        name: String,
        offset: u32,
        type_id: u32,
    },
    Typedef {
        name: String,
        type_id: u32,
    },
    Constant {
        name: String,
        type_id: u32,
        value: i64,
    },
    /// A reference into a compilation unit's symbol stream.
    ProcedureRef {
        name: String,
        module: u16,
        symbol_offset: u32,
    },
}

impl GlobalSymbol {
    /// The symbol's name.
    pub fn name(&self) -> &str {
        match self {
            GlobalSymbol::Public { name, .. }
            | GlobalSymbol::Data { name, .. }
            | GlobalSymbol::ThreadData { name, .. }
            | GlobalSymbol::Typedef { name, .. }
            | GlobalSymbol::Constant { name, .. }
            | GlobalSymbol::ProcedureRef { name, .. } => name,
        }
    }
}

/// The debug-information stream of one container.
pub struct DebugInformation<'m, 'data> {
    msf: &'m Msf<'data>,
    header: DbiHeader,
}

impl<'m, 'data> DebugInformation<'m, 'data> {
    /// Parses the debug-information stream header.
    pub fn parse(msf: &'m Msf<'data>) -> Result<Self, CodeViewError> {
        let mut walker = msf.walker(STREAM_DBI)?;

        let signature = walker.read_u32()?;
        let header = if signature == raw::DBI_SIGNATURE {
            let version = walker.read_u32()?;
            let _age = walker.read_u32()?;
            let _global_hash_stream = walker.read_u16()?;
            let _build_number = walker.read_u16()?;
            let _public_stream = walker.read_u16()?;
            let _pdb_dll_version = walker.read_u16()?;
            let sym_record_stream = walker.read_u16()?;
            let _pdb_dll_rbld = walker.read_u16()?;
            let module_info_size = walker.read_u32()?;
            let section_contribution_size = walker.read_u32()?;
            let _section_map_size = walker.read_u32()?;
            let _source_info_size = walker.read_u32()?;
            let _type_server_size = walker.read_u32()?;
            let _mfc_index = walker.read_u32()?;
            let _dbg_header_size = walker.read_u32()?;
            let _ec_size = walker.read_u32()?;
            let _flags = walker.read_u16()?;
            let _machine = walker.read_u16()?;
            let _padding = walker.read_u32()?;
            DbiHeader {
                version,
                sym_record_stream,
                module_info_size,
                section_contribution_size,
                end: walker.pos(),
            }
        } else {
            // Old-style header: the first word is the first hash stream.
            let _hash2_stream = walker.read_u16()?;
            let sym_record_stream = walker.read_u16()?;
            let _pad = walker.read_u16()?;
            let module_info_size = walker.read_u32()?;
            let section_contribution_size = walker.read_u32()?;
            let _section_map_size = walker.read_u32()?;
            let _source_info_size = walker.read_u32()?;
            tracing::debug!("old-style debug-information header");
            DbiHeader {
                version: 0,
                sym_record_stream,
                module_info_size,
                section_contribution_size,
                end: walker.pos(),
            }
        };

        Ok(DebugInformation { msf, header })
    }

    /// Iterates over the compilation units of the container.
    pub fn compilands(&self) -> Result<CompilandIter<'m, 'data>, CodeViewError> {
        let mut walker = self.msf.walker(STREAM_DBI)?;
        walker.narrow(self.header.end, self.header.module_info_size as u64)?;
        Ok(CompilandIter {
            walker,
            new_format: self.header.version >= raw::DBI_NEW_VERSION,
        })
    }

    /// Finds the compilation unit contributing the given address.
    ///
    /// Contributions are stored sorted by segment and offset; lookup is a
    /// binary search over the fixed-size entries.
    pub fn compiland_for(&self, segment: u16, offset: u32) -> Result<u16, CodeViewError> {
        let mut walker = self.msf.walker(STREAM_DBI)?;
        walker.narrow(
            self.header.end + self.header.module_info_size as u64,
            self.header.section_contribution_size as u64,
        )?;
        let base = walker.pos();

        let version = walker.read_u32()?;
        let entry_size: u64 = match version {
            raw::SECTION_CONTRIB_V1 => 28,
            raw::SECTION_CONTRIB_V2 => 32,
            other => {
                tracing::warn!(version = other, "unsupported contribution version");
                return Err(CodeViewErrorKind::UnsupportedVersion.into());
            }
        };
        let body = walker.remaining();
        if body % entry_size != 0 {
            return Err(CodeViewErrorKind::InvalidStreamHeader.into());
        }

        let read_entry = |index: u64| -> Result<SectionContribution, CodeViewError> {
            let mut entry_walker = walker;
            entry_walker.seek(base + 4 + index * entry_size);
            let segment = entry_walker.read_u16()?;
            let _pad = entry_walker.read_u16()?;
            let offset = entry_walker.read_u32()?;
            let size = entry_walker.read_u32()?;
            let _characteristics = entry_walker.read_u32()?;
            let module = entry_walker.read_u16()?;
            Ok(SectionContribution {
                segment,
                offset,
                size,
                module,
            })
        };

        let num_entries = body / entry_size;
        let mut low = 0u64;
        let mut high = num_entries;
        let mut best = None;
        while low < high {
            let mid = (low + high) / 2;
            let entry = read_entry(mid)?;
            if (entry.segment, entry.offset) <= (segment, offset) {
                best = Some(entry);
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        match best {
            Some(entry)
                if entry.segment == segment
                    && offset >= entry.offset
                    && offset < entry.offset + entry.size =>
            {
                Ok(entry.module)
            }
            _ => Err(CodeViewErrorKind::NotFound.into()),
        }
    }

    /// Parses the global symbol stream into an order-preserving name
    /// table. Unexpected module-scope records are logged and skipped.
    pub fn global_symbols(&self) -> Result<GlobalSymbols, CodeViewError> {
        let mut walker = self.msf.walker(self.header.sym_record_stream as u32)?;
        let mut by_name = HashTable::with_buckets(4096);
        let mut all = Vec::new();

        while let Some(record) = Record::read(&mut walker)? {
            let symbol = match decode_global(&record) {
                Ok(Some(symbol)) => symbol,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(kind = record.kind, error = %e, "skipping corrupt global record");
                    continue;
                }
            };
            by_name.insert(symbol.name(), all.len());
            all.push(symbol);
        }

        Ok(GlobalSymbols { by_name, all })
    }

    /// A walker over one compilation unit's symbol records.
    ///
    /// The walker is narrowed past the stream signature, covering exactly
    /// the symbol substream.
    pub fn symbols_walker(
        &self,
        info: &CompilandInfo,
    ) -> Result<StreamWalker<'m, 'data>, CodeViewError> {
        if info.stream == 0xffff {
            return Err(CodeViewErrorKind::MissingInformation.into());
        }
        let mut walker = self.msf.walker(info.stream as u32)?;
        walker.narrow(0, info.symbols_size as u64)?;
        let signature = walker.read_u32()?;
        if signature != raw::CV_SIGNATURE_C13 {
            tracing::warn!(signature, "unsupported symbol stream signature");
            return Err(CodeViewErrorKind::UnsupportedVersion.into());
        }
        Ok(walker)
    }

    /// A walker over one compilation unit's line subsections.
    pub fn lines_walker(
        &self,
        info: &CompilandInfo,
    ) -> Result<StreamWalker<'m, 'data>, CodeViewError> {
        if info.stream == 0xffff || info.lines_size == 0 {
            return Err(CodeViewErrorKind::MissingInformation.into());
        }
        let mut walker = self.msf.walker(info.stream as u32)?;
        walker.narrow(info.symbols_size as u64, info.lines_size as u64)?;
        Ok(walker)
    }
}

impl std::fmt::Debug for DebugInformation<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugInformation")
            .field("version", &self.header.version)
            .field("module_info_size", &self.header.module_info_size)
            .finish()
    }
}

/// Iterator over the module-info substream.
pub struct CompilandIter<'m, 'data> {
    walker: StreamWalker<'m, 'data>,
    new_format: bool,
}

impl CompilandIter<'_, '_> {
    fn read_next(&mut self) -> Result<Option<CompilandInfo>, CodeViewError> {
        // The fixed part of a unit header: 48 bytes old-style, 64 new.
        if self.walker.remaining() < 48 {
            return Ok(None);
        }

        let _unused = self.walker.read_u32()?;
        let segment = self.walker.read_u16()?;
        let _pad = self.walker.read_u16()?;
        let offset = self.walker.read_u32()?;
        let size = self.walker.read_u32()?;
        let _characteristics = self.walker.read_u32()?;
        let module = self.walker.read_u16()?;
        let _pad2 = self.walker.read_u16()?;
        let _data_crc = self.walker.read_u32()?;
        let _reloc_crc = self.walker.read_u32()?;
        let _flags = self.walker.read_u16()?;
        let stream = self.walker.read_u16()?;
        let symbols_size = self.walker.read_u32()?;
        let _lineno_size = self.walker.read_u32()?;
        let lines_size = self.walker.read_u32()?;
        if self.new_format {
            let _num_source_files = self.walker.read_u32()?;
            let _attribute = self.walker.read_u32()?;
            let _reserved1 = self.walker.read_u32()?;
            let _reserved2 = self.walker.read_u32()?;
        }
        let name = self.walker.read_string()?;
        let object_name = self.walker.read_string()?;
        self.walker.align(4);

        Ok(Some(CompilandInfo {
            stream,
            symbols_size,
            lines_size,
            contribution: SectionContribution {
                segment,
                offset,
                size,
                module,
            },
            name,
            object_name,
        }))
    }
}

impl Iterator for CompilandIter<'_, '_> {
    type Item = Result<CompilandInfo, CodeViewError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// The parsed global symbol stream.
pub struct GlobalSymbols {
    by_name: HashTable<usize>,
    all: Vec<GlobalSymbol>,
}

impl GlobalSymbols {
    /// All globals in stream order.
    pub fn iter(&self) -> impl Iterator<Item = &GlobalSymbol> {
        self.all.iter()
    }

    /// All globals with exactly the given name, in stream order.
    ///
    /// Shadowed and overloaded names yield multiple entries, in their
    /// original declaration order.
    pub fn find_all<'s, 'n>(&'s self, name: &'n str) -> impl Iterator<Item = &'s GlobalSymbol> + 'n
    where
        's: 'n,
    {
        self.by_name
            .iter_named(name)
            .filter_map(move |&index| self.all.get(index))
    }

    /// The first global with the given name.
    pub fn find(&self, name: &str) -> Option<&GlobalSymbol> {
        self.find_all(name).next()
    }

    /// The number of parsed globals.
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Returns true if the stream held no usable global.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Decodes one global-stream record; unknown kinds yield `None`.
fn decode_global(record: &Record) -> Result<Option<GlobalSymbol>, CodeViewError> {
    let mut cursor = record.cursor();
    let symbol = match record.kind {
        raw::S_PUB32 => {
            let flags = cursor.read_u32()?;
            let offset = cursor.read_u32()?;
            let segment = cursor.read_u16()?;
            let name = cursor.read_cstring()?;
            GlobalSymbol::Public {
                name,
                segment,
                offset,
                flags,
            }
        }
        raw::S_GDATA32 | raw::S_LDATA32 => {
            let type_id = cursor.read_u32()?;
            let offset = cursor.read_u32()?;
            let segment = cursor.read_u16()?;
            let name = cursor.read_cstring()?;
            GlobalSymbol::Data {
                name,
                segment,
                offset,
                type_id,
                global: record.kind == raw::S_GDATA32,
            }
        }
        raw::S_GTHREAD32 | raw::S_LTHREAD32 => {
            let type_id = cursor.read_u32()?;
            let offset = cursor.read_u32()?;
            let _segment = cursor.read_u16()?;
            let name = cursor.read_cstring()?;
            GlobalSymbol::ThreadData {
                name,
                offset,
                type_id,
            }
        }
        raw::S_UDT => {
            let type_id = cursor.read_u32()?;
            let name = cursor.read_cstring()?;
            GlobalSymbol::Typedef { name, type_id }
        }
        raw::S_CONSTANT => {
            let type_id = cursor.read_u32()?;
            let value = cursor.read_numeric()?;
            let name = cursor.read_cstring()?;
            GlobalSymbol::Constant {
                name,
                type_id,
                value,
            }
        }
        raw::S_PROCREF | raw::S_LPROCREF => {
            let _sum_name = cursor.read_u32()?;
            let symbol_offset = cursor.read_u32()?;
            let module = cursor.read_u16()?;
            let name = cursor.read_cstring()?;
            GlobalSymbol::ProcedureRef {
                name,
                module,
                symbol_offset,
            }
        }
        other => {
            tracing::trace!(kind = other, "ignoring global record");
            return Ok(None);
        }
    };
    Ok(Some(symbol))
}
