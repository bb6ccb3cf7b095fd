//! The symbol graph and the per-compilation-unit record parser.
//!
//! Each compilation unit's symbol stream is a flat sequence of framed
//! records forming a scope machine: a procedure record opens a function
//! scope that nests blocks and inline sites until the matching end
//! record. The parser replays that machine and builds an arena-backed
//! graph whose edges are plain handles, so back-references (inline site →
//! owning function → compilation unit) never entangle ownership.

use smallvec::SmallVec;

use quarry_common::{Arena, Handle, SparseArray};
use quarry_msf::StreamWalker;

use crate::annotations::AnnotationIter;
use crate::dbi::{CompilandInfo, DebugInformation};
use crate::record::Record;
use crate::tpi::{TypeInformation, TypeRecord, TypeRef};
use crate::{raw, CodeViewError, CodeViewErrorKind, SectionTable};

/// A handle to a node in a [`SymbolGraph`].
pub type SymbolHandle = Handle<Symbol>;

/// A half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    /// Returns true if `address` lies inside the range.
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    /// Returns true if the range spans no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Storage scope of a data symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataScope {
    Parameter,
    Local,
    StaticLocal,
    Global,
    FileStatic,
    TlsLocal,
    TlsGlobal,
}

/// Where a data symbol lives.
#[derive(Debug, Clone)]
pub enum Location {
    /// An image-relative address.
    Absolute(u64),
    /// An offset into the thread storage block.
    TlsRel(u32),
    /// A machine register.
    Register(u16),
    /// An offset from a register.
    RegisterRel { reg: u16, offset: i32 },
    /// Live-range dependent locations; see [`Data::location_at`].
    DefRanges(Vec<DefRange>),
}

/// The location flavor of one definition range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefRangeKind {
    Register(u16),
    FramePointerRel(i32),
    /// Frame-relative and valid over the whole function scope.
    FramePointerRelFullScope(i32),
    RegisterRel { reg: u16, offset: i32 },
    /// A field of an aggregate promoted into a register.
    SubfieldRegister { reg: u16, parent_offset: u32 },
}

/// One live range of a local variable, with excluded gaps.
#[derive(Debug, Clone)]
pub struct DefRange {
    pub kind: DefRangeKind,
    /// `None` for full-scope ranges.
    pub range: Option<AddressRange>,
    pub gaps: Vec<AddressRange>,
}

impl DefRange {
    /// Returns true if the range covers `ip`: inside the range and not
    /// inside any excluded gap.
    pub fn covers(&self, ip: u64) -> bool {
        match self.range {
            Some(range) if !range.contains(ip) => false,
            _ => !self.gaps.iter().any(|gap| gap.contains(ip)),
        }
    }
}

/// A function or inline site.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub type_ref: TypeRef,
    /// Disjoint code ranges; machine code may be non-contiguous.
    pub ranges: SmallVec<[AddressRange; 1]>,
    /// Prologue end, relative to the function start.
    pub debug_start: u32,
    /// Epilogue start, relative to the function start.
    pub debug_end: u32,
    pub frame_size: Option<u32>,
    /// True for inline sites.
    pub inline: bool,
    pub compiland: Option<SymbolHandle>,
    /// The scope containing an inline site: a block, another site or the
    /// owning function.
    pub lexical_parent: Option<SymbolHandle>,
    /// The non-inline function an inline site ultimately belongs to.
    pub top_function: Option<SymbolHandle>,
    /// Next inline site in the owning function's list. Sites are linked
    /// at creation in front of the list, so a site's lexical parent
    /// always appears later in the chain than the site itself.
    pub next_inline: Option<SymbolHandle>,
    /// Head of the inline-site list (top functions only).
    pub inline_head: Option<SymbolHandle>,
    pub locals: Vec<SymbolHandle>,
    pub blocks: Vec<SymbolHandle>,
    /// Labels inside the function, as offsets from the function start.
    pub labels: Vec<(String, u64)>,
    /// The id-stream item describing the inlined callee.
    pub inlinee: Option<u32>,
    /// The raw binary-annotation bytes of an inline site.
    pub annotations: Vec<u8>,
    /// Offset of the defining record in its symbol stream.
    pub record_offset: u64,
}

impl Function {
    /// The function's entry address.
    pub fn address(&self) -> u64 {
        self.ranges.first().map(|range| range.start).unwrap_or(0)
    }

    /// Returns true if any of the function's ranges contains `address`.
    pub fn contains(&self, address: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(address))
    }
}

/// A lexical block inside a function scope.
#[derive(Debug)]
pub struct Block {
    pub ranges: SmallVec<[AddressRange; 1]>,
    /// The containing block, inline site or function.
    pub container: SymbolHandle,
    pub locals: Vec<SymbolHandle>,
}

/// A data variable at any scope.
#[derive(Debug)]
pub struct Data {
    pub name: String,
    pub type_ref: TypeRef,
    pub scope: DataScope,
    pub location: Location,
}

impl Data {
    /// Resolves the live location of the variable at an instruction
    /// pointer, honoring range containment and gap exclusion.
    pub fn location_at(&self, ip: u64) -> Option<&DefRange> {
        match &self.location {
            Location::DefRanges(ranges) => ranges.iter().find(|range| range.covers(ip)),
            _ => None,
        }
    }
}

/// A node of the symbol graph.
#[derive(Debug)]
pub enum Symbol {
    Compiland {
        name: String,
        object_name: String,
        children: Vec<SymbolHandle>,
    },
    Function(Function),
    Block(Block),
    Data(Data),
    Label {
        name: String,
        address: u64,
    },
    Thunk {
        name: String,
        address: u64,
        size: u32,
        ordinal: u8,
    },
}

impl Symbol {
    /// The function payload, if this node is a function or inline site.
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Symbol::Function(function) => Some(function),
            _ => None,
        }
    }

    /// The data payload, if this node is a variable.
    pub fn as_data(&self) -> Option<&Data> {
        match self {
            Symbol::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// The arena-backed symbol graph of one container.
#[derive(Default)]
pub struct SymbolGraph {
    pub symbols: Arena<Symbol>,
    pub compilands: Vec<SymbolHandle>,
    /// Top-level functions by entry address.
    functions: SparseArray<u64, SymbolHandle>,
}

impl SymbolGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    fn function(&self, handle: SymbolHandle) -> &Function {
        match self.symbols.get(handle) {
            Symbol::Function(function) => function,
            _ => panic!("handle does not refer to a function"),
        }
    }

    fn function_mut(&mut self, handle: SymbolHandle) -> &mut Function {
        match self.symbols.get_mut(handle) {
            Symbol::Function(function) => function,
            _ => panic!("handle does not refer to a function"),
        }
    }

    /// The top-level function covering `address`.
    pub fn function_at(&self, address: u64) -> Option<SymbolHandle> {
        let (_, &handle) = self.functions.upper_entry(address)?;
        self.function(handle).contains(address).then_some(handle)
    }

    /// The innermost inline site of `function` covering `address`, if any.
    pub fn inline_site_at(&self, function: SymbolHandle, address: u64) -> Option<SymbolHandle> {
        let mut deepest: Option<(u32, SymbolHandle)> = None;
        let mut cursor = self.function(function).inline_head;
        while let Some(handle) = cursor {
            let site = self.function(handle);
            if site.contains(address) {
                let depth = self.inline_depth(handle);
                if deepest.map_or(true, |(best, _)| depth > best) {
                    deepest = Some((depth, handle));
                }
            }
            cursor = site.next_inline;
        }
        deepest.map(|(_, handle)| handle)
    }

    fn inline_depth(&self, mut handle: SymbolHandle) -> u32 {
        let mut depth = 0;
        while let Some(parent) = self.function(handle).lexical_parent {
            depth += 1;
            match self.symbols.get(parent) {
                Symbol::Function(function) if function.inline => handle = parent,
                Symbol::Function(_) => break,
                Symbol::Block(block) => {
                    handle = self.nearest_function(block.container);
                }
                _ => break,
            }
        }
        depth
    }

    /// Walks lexical parents up to the nearest function or inline site.
    fn nearest_function(&self, mut handle: SymbolHandle) -> SymbolHandle {
        loop {
            match self.symbols.get(handle) {
                Symbol::Block(block) => handle = block.container,
                _ => return handle,
            }
        }
    }

    /// Iterates the inline sites of a function in list order.
    pub fn inline_sites(&self, function: SymbolHandle) -> InlineSiteIter<'_> {
        InlineSiteIter {
            graph: self,
            cursor: self.function(function).inline_head,
        }
    }
}

/// Iterator over a function's inline-site list.
pub struct InlineSiteIter<'g> {
    graph: &'g SymbolGraph,
    cursor: Option<SymbolHandle>,
}

impl Iterator for InlineSiteIter<'_> {
    type Item = SymbolHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        self.cursor = self.graph.function(handle).next_inline;
        Some(handle)
    }
}

/// Parses compilation-unit symbol streams into a [`SymbolGraph`].
pub struct SymbolParser<'t, 'm, 'data> {
    sections: SectionTable,
    /// The type stream, for attaching types to symbols.
    types: Option<&'t TypeInformation<'m, 'data>>,
    /// The id stream, for naming inlined callees.
    ids: Option<&'t TypeInformation<'m, 'data>>,
}

impl<'t, 'm, 'data> SymbolParser<'t, 'm, 'data> {
    /// Creates a parser. Both streams are optional; symbols parsed
    /// without them carry unresolved type references.
    pub fn new(
        sections: SectionTable,
        types: Option<&'t TypeInformation<'m, 'data>>,
        ids: Option<&'t TypeInformation<'m, 'data>>,
    ) -> Self {
        SymbolParser {
            sections,
            types,
            ids,
        }
    }

    /// Parses every compilation unit of the container.
    ///
    /// A damaged unit is logged and skipped; the rest of the container
    /// still yields symbols.
    pub fn parse_all(
        &self,
        dbi: &DebugInformation<'m, 'data>,
        graph: &mut SymbolGraph,
    ) -> Result<(), CodeViewError> {
        for info in dbi.compilands()? {
            let info = info?;
            if info.stream == 0xffff {
                continue;
            }
            let mut walker = match dbi.symbols_walker(&info) {
                Ok(walker) => walker,
                Err(e) => {
                    tracing::warn!(module = %info.name, error = %e, "skipping unit without symbols");
                    continue;
                }
            };
            if let Err(e) = self.parse_compiland(graph, &mut walker, &info) {
                tracing::warn!(module = %info.name, error = %e, "skipping damaged compilation unit");
            }
        }
        Ok(())
    }

    fn type_ref(&self, id: u32) -> TypeRef {
        match self.types {
            Some(types) => types.type_ref(id).unwrap_or(TypeRef::raw(id)),
            None => TypeRef::raw(id),
        }
    }

    /// The name and signature of an inlined callee, from the id stream.
    fn inlinee_info(&self, item: u32) -> Result<(String, TypeRef), CodeViewError> {
        let ids = self.ids.ok_or(CodeViewErrorKind::MissingInformation)?;
        match ids.decode_raw(item)? {
            TypeRecord::FuncId {
                signature, name, ..
            } => Ok((name, self.canonical(signature))),
            TypeRecord::MemberFuncId {
                signature, name, ..
            } => Ok((name, self.canonical(signature))),
            _ => {
                tracing::warn!(item, "unexpected inlinee record kind");
                Err(CodeViewErrorKind::InvalidRecord.into())
            }
        }
    }

    fn canonical(&self, type_ref: TypeRef) -> TypeRef {
        match type_ref {
            TypeRef::Raw(id) => self.type_ref(id),
            other => other,
        }
    }

    /// Parses one compilation unit's symbol stream.
    pub fn parse_compiland(
        &self,
        graph: &mut SymbolGraph,
        walker: &mut StreamWalker<'_, '_>,
        info: &CompilandInfo,
    ) -> Result<SymbolHandle, CodeViewError> {
        let compiland = graph.symbols.alloc(Symbol::Compiland {
            name: info.name.clone(),
            object_name: info.object_name.clone(),
            children: Vec::new(),
        });
        graph.compilands.push(compiland);

        let mut state = ParseState {
            compiland,
            top_func: None,
            curr_func: None,
            block: None,
            last_local: None,
        };

        while let Some(record) = Record::read(walker)? {
            if record.kind == 0 {
                break;
            }
            if let Err(e) = self.parse_record(graph, walker, &mut state, &record) {
                // One corrupt record does not abort the unit.
                tracing::warn!(kind = record.kind, error = %e, "skipping corrupt symbol record");
            }
            if !matches!(
                record.kind,
                raw::S_LOCAL
                    | raw::S_DEFRANGE
                    | raw::S_DEFRANGE_SUBFIELD
                    | raw::S_DEFRANGE_REGISTER
                    | raw::S_DEFRANGE_FRAMEPOINTER_REL
                    | raw::S_DEFRANGE_SUBFIELD_REGISTER
                    | raw::S_DEFRANGE_FRAMEPOINTER_REL_FULL_SCOPE
                    | raw::S_DEFRANGE_REGISTER_REL
            ) {
                state.last_local = None;
            }
        }
        Ok(compiland)
    }

    fn attach(&self, graph: &mut SymbolGraph, state: &ParseState, child: SymbolHandle) {
        let parent = state
            .block
            .or(state.curr_func)
            .unwrap_or(state.compiland);
        match graph.symbols.get_mut(parent) {
            Symbol::Compiland { children, .. } => children.push(child),
            Symbol::Function(function) => function.locals.push(child),
            Symbol::Block(block) => block.locals.push(child),
            _ => {}
        }
    }

    fn has_local_named(&self, graph: &SymbolGraph, state: &ParseState, name: &str) -> bool {
        let Some(func) = state.curr_func else {
            return false;
        };
        graph
            .function(func)
            .locals
            .iter()
            .any(|&handle| match graph.symbols.get(handle) {
                Symbol::Data(data) => data.name == name,
                _ => false,
            })
    }

    fn parse_record(
        &self,
        graph: &mut SymbolGraph,
        walker: &mut StreamWalker<'_, '_>,
        state: &mut ParseState,
        record: &Record,
    ) -> Result<(), CodeViewError> {
        let mut cursor = record.cursor();
        match record.kind {
            raw::S_GPROC32 | raw::S_LPROC32 => {
                if state.top_func.is_some() {
                    tracing::warn!("nested function record");
                }
                let _parent = cursor.read_u32()?;
                let _end = cursor.read_u32()?;
                let _next = cursor.read_u32()?;
                let length = cursor.read_u32()?;
                let debug_start = cursor.read_u32()?;
                let debug_end = cursor.read_u32()?;
                let type_id = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let _flags = cursor.read_u8()?;
                let name = cursor.read_cstring()?;
                let address = self
                    .sections
                    .address_of(segment, offset)
                    .ok_or(CodeViewErrorKind::InvalidRecord)?;

                let handle = graph.symbols.alloc(Symbol::Function(Function {
                    name,
                    type_ref: self.type_ref(type_id),
                    ranges: SmallVec::from_elem(
                        AddressRange {
                            start: address,
                            end: address + length as u64,
                        },
                        1,
                    ),
                    debug_start,
                    debug_end,
                    frame_size: None,
                    inline: false,
                    compiland: Some(state.compiland),
                    lexical_parent: None,
                    top_function: None,
                    next_inline: None,
                    inline_head: None,
                    locals: Vec::new(),
                    blocks: Vec::new(),
                    labels: Vec::new(),
                    inlinee: None,
                    annotations: Vec::new(),
                    record_offset: record.start,
                }));
                if let Symbol::Compiland { children, .. } = graph.symbols.get_mut(state.compiland)
                {
                    children.push(handle);
                }
                graph.functions.insert(address, handle);
                state.top_func = Some(handle);
                state.curr_func = Some(handle);
                state.block = None;
            }

            raw::S_FRAMEPROC => {
                let frame_size = cursor.read_u32()?;
                match (state.curr_func, state.top_func) {
                    (Some(curr), Some(top)) if curr == top => {
                        let function = graph.function_mut(curr);
                        if function.frame_size.is_none() {
                            function.frame_size = Some(frame_size);
                        }
                    }
                    _ => tracing::warn!("frame info outside a top-level function"),
                }
            }

            raw::S_BLOCK32 => {
                let _parent = cursor.read_u32()?;
                let _end = cursor.read_u32()?;
                let length = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let container = match state.block.or(state.curr_func) {
                    Some(container) => container,
                    None => {
                        tracing::warn!("block outside a function scope");
                        return Ok(());
                    }
                };
                let address = self
                    .sections
                    .address_of(segment, offset)
                    .ok_or(CodeViewErrorKind::InvalidRecord)?;
                let handle = graph.symbols.alloc(Symbol::Block(Block {
                    ranges: SmallVec::from_elem(
                        AddressRange {
                            start: address,
                            end: address + length as u64,
                        },
                        1,
                    ),
                    container,
                    locals: Vec::new(),
                }));
                if let Some(func) = state.curr_func {
                    graph.function_mut(func).blocks.push(handle);
                }
                state.block = Some(handle);
            }

            raw::S_END => {
                if let Some(block) = state.block {
                    let container = match graph.symbols.get(block) {
                        Symbol::Block(data) => data.container,
                        _ => state.compiland,
                    };
                    state.block = match graph.symbols.get(container) {
                        Symbol::Block(_) => Some(container),
                        _ => None,
                    };
                } else if state.top_func.is_some() {
                    if state.curr_func != state.top_func {
                        tracing::warn!("function closed with an open inline site");
                        return Err(CodeViewErrorKind::InvalidRecord.into());
                    }
                    state.top_func = None;
                    state.curr_func = None;
                }
            }

            raw::S_INLINESITE | raw::S_INLINESITE2 => {
                let _parent = cursor.read_u32()?;
                let end = cursor.read_u32()?;
                let inlinee = cursor.read_u32()?;
                if record.kind == raw::S_INLINESITE2 {
                    let _invocations = cursor.read_u32()?;
                }
                let annotations = record.data[cursor.pos()..].to_vec();

                match self.create_inline_site(graph, state, inlinee, &annotations, record.start) {
                    Ok(handle) => {
                        state.curr_func = Some(handle);
                        state.block = None;
                    }
                    Err(e) => {
                        // Abandon the site: jump to its stored end offset
                        // and consume the matching end record.
                        tracing::warn!(inlinee, error = %e, "abandoning inline site");
                        walker.seek(end as u64);
                        skip_if(walker, raw::S_INLINESITE_END)?;
                    }
                }
            }

            raw::S_INLINESITE_END => {
                let Some(site) = state.curr_func else {
                    tracing::warn!("stray inline site end");
                    return Ok(());
                };
                let parent = graph.function(site).lexical_parent;
                match parent {
                    Some(parent) => {
                        state.block = match graph.symbols.get(parent) {
                            Symbol::Block(_) => Some(parent),
                            _ => None,
                        };
                        state.curr_func = Some(graph.nearest_function(parent));
                    }
                    None => {
                        state.block = None;
                        state.curr_func = state.top_func;
                    }
                }
            }

            raw::S_LOCAL => {
                let type_id = cursor.read_u32()?;
                let flags = cursor.read_u16()?;
                let name = cursor.read_cstring()?;
                if flags & (raw::LOCAL_ENREG_GLOBAL | raw::LOCAL_ENREG_STATIC) != 0 {
                    return Ok(());
                }
                let scope = if flags & raw::LOCAL_IS_PARAM != 0 {
                    DataScope::Parameter
                } else {
                    DataScope::Local
                };
                let handle = graph.symbols.alloc(Symbol::Data(Data {
                    name,
                    type_ref: self.type_ref(type_id),
                    scope,
                    location: Location::DefRanges(Vec::new()),
                }));
                self.attach(graph, state, handle);
                state.last_local = Some(handle);
            }

            raw::S_DEFRANGE_REGISTER
            | raw::S_DEFRANGE_FRAMEPOINTER_REL
            | raw::S_DEFRANGE_SUBFIELD_REGISTER
            | raw::S_DEFRANGE_FRAMEPOINTER_REL_FULL_SCOPE
            | raw::S_DEFRANGE_REGISTER_REL => {
                let Some(local) = state.last_local else {
                    tracing::trace!("definition range without a preceding local");
                    return Ok(());
                };
                let def_range = self.parse_def_range(record, &mut cursor)?;
                if let Symbol::Data(data) = graph.symbols.get_mut(local) {
                    if let Location::DefRanges(ranges) = &mut data.location {
                        ranges.push(def_range);
                    }
                }
            }

            raw::S_DEFRANGE | raw::S_DEFRANGE_SUBFIELD => {
                tracing::trace!("skipping program-based definition range");
            }

            raw::S_REGREL32 => {
                let offset = cursor.read_i32()?;
                let type_id = cursor.read_u32()?;
                let reg = cursor.read_u16()?;
                let name = cursor.read_cstring()?;
                if self.has_local_named(graph, state, &name) {
                    return Ok(());
                }
                let frame_size = state
                    .top_func
                    .and_then(|handle| graph.function(handle).frame_size);
                if frame_size.is_none() {
                    tracing::warn!("register-relative local without frame info");
                }
                let scope = match frame_size {
                    Some(size) if offset >= 0 && offset as u32 >= size => DataScope::Parameter,
                    _ => DataScope::Local,
                };
                let handle = graph.symbols.alloc(Symbol::Data(Data {
                    name,
                    type_ref: self.type_ref(type_id),
                    scope,
                    location: Location::RegisterRel { reg, offset },
                }));
                self.attach(graph, state, handle);
            }

            raw::S_BPREL32 => {
                let offset = cursor.read_i32()?;
                let type_id = cursor.read_u32()?;
                let name = cursor.read_cstring()?;
                if self.has_local_named(graph, state, &name) {
                    return Ok(());
                }
                let scope = if offset > 0 {
                    DataScope::Parameter
                } else {
                    DataScope::Local
                };
                let handle = graph.symbols.alloc(Symbol::Data(Data {
                    name,
                    type_ref: self.type_ref(type_id),
                    scope,
                    // The frame-pointer register is architecture bound;
                    // record the convention value used by 32-bit frames.
                    location: Location::RegisterRel {
                        reg: 22,
                        offset,
                    },
                }));
                self.attach(graph, state, handle);
            }

            raw::S_REGISTER => {
                let type_id = cursor.read_u32()?;
                let reg = cursor.read_u16()?;
                let name = cursor.read_cstring()?;
                if self.has_local_named(graph, state, &name) {
                    return Ok(());
                }
                let handle = graph.symbols.alloc(Symbol::Data(Data {
                    name,
                    type_ref: self.type_ref(type_id),
                    scope: DataScope::Local,
                    location: Location::Register(reg),
                }));
                self.attach(graph, state, handle);
            }

            raw::S_LDATA32 => {
                let type_id = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let name = cursor.read_cstring()?;
                if name.is_empty() {
                    return Ok(());
                }
                let address = self
                    .sections
                    .address_of(segment, offset)
                    .ok_or(CodeViewErrorKind::InvalidRecord)?;
                let scope = if state.curr_func.is_some() {
                    DataScope::StaticLocal
                } else {
                    DataScope::FileStatic
                };
                let handle = graph.symbols.alloc(Symbol::Data(Data {
                    name,
                    type_ref: self.type_ref(type_id),
                    scope,
                    location: Location::Absolute(address),
                }));
                self.attach(graph, state, handle);
            }

            raw::S_LTHREAD32 | raw::S_GTHREAD32 => {
                let type_id = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let _segment = cursor.read_u16()?;
                let name = cursor.read_cstring()?;
                if name.is_empty() {
                    return Ok(());
                }
                let scope = if record.kind == raw::S_LTHREAD32 {
                    DataScope::TlsLocal
                } else {
                    DataScope::TlsGlobal
                };
                let handle = graph.symbols.alloc(Symbol::Data(Data {
                    name,
                    type_ref: self.type_ref(type_id),
                    scope,
                    location: Location::TlsRel(offset),
                }));
                self.attach(graph, state, handle);
            }

            raw::S_LABEL32 => {
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let _flags = cursor.read_u8()?;
                let name = cursor.read_cstring()?;
                let address = self
                    .sections
                    .address_of(segment, offset)
                    .ok_or(CodeViewErrorKind::InvalidRecord)?;
                match state.curr_func {
                    Some(func) => {
                        let start = graph.function(func).address();
                        graph
                            .function_mut(func)
                            .labels
                            .push((name, address.saturating_sub(start)));
                    }
                    None => {
                        let handle = graph.symbols.alloc(Symbol::Label { name, address });
                        self.attach(graph, state, handle);
                    }
                }
            }

            raw::S_THUNK32 => {
                let _parent = cursor.read_u32()?;
                let _end = cursor.read_u32()?;
                let _next = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let size = cursor.read_u16()?;
                let ordinal = cursor.read_u8()?;
                let name = cursor.read_cstring()?;
                let address = self
                    .sections
                    .address_of(segment, offset)
                    .ok_or(CodeViewErrorKind::InvalidRecord)?;
                let handle = graph.symbols.alloc(Symbol::Thunk {
                    name,
                    address,
                    size: size as u32,
                    ordinal,
                });
                self.attach(graph, state, handle);
            }

            raw::S_SEPCODE => {
                let _parent = cursor.read_u32()?;
                let _end = cursor.read_u32()?;
                let length = cursor.read_u32()?;
                let _flags = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let parent_offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let parent_segment = cursor.read_u16()?;
                if state.top_func.is_some() {
                    tracing::warn!("separated code inside a function scope");
                    return Err(CodeViewErrorKind::InvalidRecord.into());
                }
                let parent_address = self
                    .sections
                    .address_of(parent_segment, parent_offset)
                    .ok_or(CodeViewErrorKind::InvalidRecord)?;
                let address = self
                    .sections
                    .address_of(segment, offset)
                    .ok_or(CodeViewErrorKind::InvalidRecord)?;
                match graph.function_at(parent_address) {
                    Some(parent) => {
                        let (name, type_ref) = {
                            let function = graph.function(parent);
                            (function.name.clone(), function.type_ref)
                        };
                        let handle = graph.symbols.alloc(Symbol::Function(Function {
                            name,
                            type_ref,
                            ranges: SmallVec::from_elem(
                                AddressRange {
                                    start: address,
                                    end: address + length as u64,
                                },
                                1,
                            ),
                            debug_start: 0,
                            debug_end: 0,
                            frame_size: None,
                            inline: false,
                            compiland: Some(state.compiland),
                            lexical_parent: None,
                            top_function: None,
                            next_inline: None,
                            inline_head: None,
                            locals: Vec::new(),
                            blocks: Vec::new(),
                            labels: Vec::new(),
                            inlinee: None,
                            annotations: Vec::new(),
                            record_offset: record.start,
                        }));
                        graph.functions.insert(address, handle);
                        state.top_func = Some(handle);
                        state.curr_func = Some(handle);
                    }
                    None => {
                        tracing::warn!(parent_address, "separated code without a parent function")
                    }
                }
            }

            raw::S_GMANPROC | raw::S_LMANPROC => {
                // Managed procedures: skip the whole scope.
                let _parent = cursor.read_u32()?;
                let end = cursor.read_u32()?;
                walker.seek(end as u64);
                skip_if(walker, raw::S_END)?;
            }

            raw::S_COMPILE2 | raw::S_COMPILE3 | raw::S_OBJNAME | raw::S_ENVBLOCK => {
                tracing::trace!(kind = record.kind, "ignoring toolchain record");
            }

            // Records expected only in the global symbol stream.
            raw::S_PUB32 | raw::S_PROCREF | raw::S_LPROCREF | raw::S_TOKENREF | raw::S_GDATA32
            | raw::S_UDT => {
                tracing::warn!(kind = record.kind, "global record in a unit stream");
            }

            raw::S_CONSTANT
            | raw::S_TRAMPOLINE
            | raw::S_FRAMECOOKIE
            | raw::S_SECTION
            | raw::S_COFFGROUP
            | raw::S_EXPORT
            | raw::S_CALLSITEINFO
            | raw::S_BUILDINFO
            | raw::S_FILESTATIC
            | raw::S_CALLEES
            | raw::S_CALLERS
            | raw::S_POGODATA
            | raw::S_UNAMESPACE
            | raw::S_INLINEES
            | raw::S_HEAPALLOCSITE => {
                tracing::trace!(kind = record.kind, "ignoring symbol record");
            }

            other => {
                tracing::warn!(kind = other, "unexpected symbol record");
            }
        }
        Ok(())
    }

    /// Creates an inline site from its annotations, linking it in front
    /// of the owning function's site list.
    fn create_inline_site(
        &self,
        graph: &mut SymbolGraph,
        state: &ParseState,
        inlinee: u32,
        annotations: &[u8],
        record_offset: u64,
    ) -> Result<SymbolHandle, CodeViewError> {
        let top = state.top_func.ok_or(CodeViewErrorKind::InvalidRecord)?;
        let (name, type_ref) = self.inlinee_info(inlinee)?;

        let base = graph.function(top).address();
        let ranges = collect_ranges(annotations, base);
        if ranges.is_empty() {
            return Err(CodeViewErrorKind::InvalidRecord.into());
        }
        if let Some(last) = ranges.last() {
            if last.is_empty() {
                tracing::warn!(name = %name, "pending empty range at end of inline site");
            }
        }

        let lexical_parent = state.block.or(state.curr_func);
        let handle = graph.symbols.alloc(Symbol::Function(Function {
            name,
            type_ref,
            ranges: SmallVec::from_vec(ranges),
            debug_start: 0,
            debug_end: 0,
            frame_size: None,
            inline: true,
            compiland: Some(state.compiland),
            lexical_parent,
            top_function: Some(top),
            next_inline: graph.function(top).inline_head,
            inline_head: None,
            locals: Vec::new(),
            blocks: Vec::new(),
            labels: Vec::new(),
            inlinee: Some(inlinee),
            annotations: annotations.to_vec(),
            record_offset,
        }));
        graph.function_mut(top).inline_head = Some(handle);
        Ok(handle)
    }

    /// Parses one definition-range record body.
    fn parse_def_range(
        &self,
        record: &Record,
        cursor: &mut crate::RecordCursor<'_>,
    ) -> Result<DefRange, CodeViewError> {
        let kind = match record.kind {
            raw::S_DEFRANGE_REGISTER => {
                let reg = cursor.read_u16()?;
                let _attr = cursor.read_u16()?;
                DefRangeKind::Register(reg)
            }
            raw::S_DEFRANGE_FRAMEPOINTER_REL => {
                DefRangeKind::FramePointerRel(cursor.read_i32()?)
            }
            raw::S_DEFRANGE_FRAMEPOINTER_REL_FULL_SCOPE => {
                let offset = cursor.read_i32()?;
                return Ok(DefRange {
                    kind: DefRangeKind::FramePointerRelFullScope(offset),
                    range: None,
                    gaps: Vec::new(),
                });
            }
            raw::S_DEFRANGE_SUBFIELD_REGISTER => {
                let reg = cursor.read_u16()?;
                let _attr = cursor.read_u16()?;
                let parent_offset = cursor.read_u32()? & 0x0fff;
                DefRangeKind::SubfieldRegister { reg, parent_offset }
            }
            raw::S_DEFRANGE_REGISTER_REL => {
                let reg = cursor.read_u16()?;
                let _flags = cursor.read_u16()?;
                let offset = cursor.read_i32()?;
                DefRangeKind::RegisterRel { reg, offset }
            }
            _ => return Err(CodeViewErrorKind::InvalidRecord.into()),
        };

        let offset = cursor.read_u32()?;
        let segment = cursor.read_u16()?;
        let length = cursor.read_u16()?;
        let start = self
            .sections
            .address_of(segment, offset)
            .ok_or(CodeViewErrorKind::InvalidRecord)?;
        let range = AddressRange {
            start,
            end: start + length as u64,
        };

        let mut gaps = Vec::new();
        while cursor.remaining() >= 4 {
            let gap_offset = cursor.read_u16()?;
            let gap_length = cursor.read_u16()?;
            gaps.push(AddressRange {
                start: range.start + gap_offset as u64,
                end: range.start + gap_offset as u64 + gap_length as u64,
            });
        }

        Ok(DefRange {
            kind,
            range: Some(range),
            gaps,
        })
    }
}

/// Scope state while walking one unit's records.
struct ParseState {
    compiland: SymbolHandle,
    top_func: Option<SymbolHandle>,
    curr_func: Option<SymbolHandle>,
    block: Option<SymbolHandle>,
    last_local: Option<SymbolHandle>,
}

/// Consumes the next record if it has the expected kind; rewinds
/// otherwise.
fn skip_if(walker: &mut StreamWalker<'_, '_>, kind: u16) -> Result<(), CodeViewError> {
    let saved = walker.pos();
    match Record::read(walker)? {
        Some(record) if record.kind == kind => Ok(()),
        _ => {
            walker.seek(saved);
            Ok(())
        }
    }
}

/// Builds an inline site's address ranges by replaying its annotations.
///
/// Offset-changing opcodes close the current sub-range and open the next;
/// a range opened without a length stays empty until the following offset
/// change supplies its end.
fn collect_ranges(annotations: &[u8], base: u64) -> Vec<AddressRange> {
    let mut ranges: Vec<AddressRange> = Vec::new();
    let mut offset: u64 = 0;

    let update_last = |ranges: &mut Vec<AddressRange>, hi: u64| {
        if let Some(last) = ranges.last_mut() {
            if last.is_empty() {
                last.end = hi;
            }
        }
    };

    for annotation in AnnotationIter::new(annotations) {
        match annotation.opcode {
            raw::BA_OP_CODE_OFFSET => offset = annotation.arg1 as u64,
            raw::BA_OP_CHANGE_CODE_OFFSET => {
                offset += annotation.arg1 as u64;
                update_last(&mut ranges, base + offset);
                ranges.push(AddressRange {
                    start: base + offset,
                    end: base + offset,
                });
            }
            raw::BA_OP_CHANGE_CODE_LENGTH => {
                offset += annotation.arg1 as u64;
                update_last(&mut ranges, base + offset);
            }
            raw::BA_OP_CHANGE_CODE_OFFSET_AND_LINE_OFFSET => {
                offset += annotation.arg1 as u64;
                update_last(&mut ranges, base + offset);
                ranges.push(AddressRange {
                    start: base + offset,
                    end: base + offset,
                });
            }
            raw::BA_OP_CHANGE_CODE_LENGTH_AND_CODE_OFFSET => {
                offset += annotation.arg2 as u64;
                update_last(&mut ranges, base + offset);
                ranges.push(AddressRange {
                    start: base + offset,
                    end: base + offset + annotation.arg1 as u64,
                });
            }
            _ => {}
        }
    }
    ranges
}

#[cfg(test)]
mod tests;
