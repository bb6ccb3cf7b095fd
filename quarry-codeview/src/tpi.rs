//! The type-information stream: hash-indexed type records, forward
//! declaration resolution and type queries.
//!
//! The stream opens with a header describing the id range `[first, last)`,
//! where the records begin, and the layout of an auxiliary hash stream:
//! one hash value per type id, an optional binary-search table of
//! `(id, offset)` pairs, and an optional incremental-link remap table.
//! Records are only ever located through [`TypeInformation::resolve`] and
//! friends; results are cached per id, and re-resolving an id always
//! yields the same value, so the cache tolerates concurrent readers with
//! a first-write-wins discipline.

use std::collections::HashMap;

use parking_lot::RwLock;

use quarry_msf::{Msf, StreamWalker};

use crate::record::{Record, RecordCursor};
use crate::{raw, CodeViewError, CodeViewErrorKind};

/// An opaque reference to a type.
///
/// Either a predefined basic-type code or a *resolved* index into the type
/// stream. Because forward declarations collapse onto their
/// implementations during resolution, equal references denote the same
/// underlying definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// A predefined basic type, possibly with pointer-mode bits.
    Basic(u32),
    /// A resolved record index into the type stream.
    Index(u32),
    /// An unresolved record index, used when no type stream is at hand.
    Raw(u32),
}

impl TypeRef {
    /// Wraps a raw record id without resolving it.
    pub fn raw(id: u32) -> Self {
        if id < raw::FIRST_DEFINABLE_TYPE {
            TypeRef::Basic(id)
        } else {
            TypeRef::Raw(id)
        }
    }
}

/// The broad classification of a type record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Basic,
    Pointer,
    Array,
    Class,
    Struct,
    Union,
    Enum,
    Procedure,
    MemberFunction,
    ArgList,
    FieldList,
    Modifier,
    Bitfield,
    VtShape,
    FuncId,
}

/// A decoded type record.
#[derive(Debug, Clone)]
pub enum TypeRecord {
    Basic {
        code: u32,
    },
    Modifier {
        underlying: TypeRef,
        flags: u16,
    },
    Pointer {
        pointee: TypeRef,
        attributes: u32,
    },
    Array {
        element: TypeRef,
        index: TypeRef,
        byte_size: u64,
        name: String,
    },
    /// Classes, structs and unions share this shape; unions carry no
    /// derivation or vtable shape.
    Structure {
        kind: TypeKind,
        count: u16,
        property: u16,
        field_list: u32,
        byte_size: u64,
        name: String,
        decorated: Option<String>,
    },
    Enum {
        count: u16,
        property: u16,
        underlying: TypeRef,
        field_list: u32,
        name: String,
        decorated: Option<String>,
    },
    Procedure {
        return_type: TypeRef,
        call_conv: u8,
        param_count: u16,
        arg_list: u32,
    },
    MemberFunction {
        return_type: TypeRef,
        class_type: TypeRef,
        this_type: TypeRef,
        call_conv: u8,
        param_count: u16,
        arg_list: u32,
    },
    ArgList {
        args: Vec<TypeRef>,
    },
    Bitfield {
        underlying: TypeRef,
        bit_length: u8,
        bit_position: u8,
    },
    VtShape {
        count: u16,
    },
    /// Expanded through [`TypeInformation::children`], not decoded here.
    FieldList,
    FuncId {
        scope: u32,
        signature: TypeRef,
        name: String,
    },
    MemberFuncId {
        parent: TypeRef,
        signature: TypeRef,
        name: String,
    },
}

impl TypeRecord {
    /// Returns true for structural records flagged as forward
    /// declarations.
    pub fn is_forward(&self) -> bool {
        match self {
            TypeRecord::Structure { property, .. } | TypeRecord::Enum { property, .. } => {
                property & raw::PROPERTY_FORWARD_REF != 0
            }
            _ => false,
        }
    }

    /// The name of a structural record, if it carries one.
    pub fn name(&self) -> Option<&str> {
        match self {
            TypeRecord::Structure { name, .. }
            | TypeRecord::Enum { name, .. }
            | TypeRecord::Array { name, .. }
            | TypeRecord::FuncId { name, .. }
            | TypeRecord::MemberFuncId { name, .. } => Some(name),
            _ => None,
        }
    }

    fn decorated(&self) -> Option<&str> {
        match self {
            TypeRecord::Structure { decorated, .. } | TypeRecord::Enum { decorated, .. } => {
                decorated.as_deref()
            }
            _ => None,
        }
    }
}

/// A member produced by field-list expansion.
#[derive(Debug, Clone)]
pub struct TypeMember {
    pub name: String,
    pub type_ref: TypeRef,
    /// Byte offset within the containing structure.
    pub offset: i64,
    /// `(bit position, bit length)` when the member is a bitfield.
    pub bits: Option<(u8, u8)>,
}

/// One child yielded by a `children` query.
#[derive(Debug, Clone)]
pub enum TypeChild {
    Member(TypeMember),
    BaseClass {
        type_ref: TypeRef,
        offset: i64,
    },
    VirtualBaseClass {
        base: TypeRef,
        vbptr: TypeRef,
    },
    StaticMember {
        name: String,
        type_ref: TypeRef,
    },
    Method {
        name: String,
        type_ref: TypeRef,
    },
    NestedType {
        name: String,
        type_ref: TypeRef,
    },
    Enumerator {
        name: String,
        value: i64,
    },
    /// An argument in a procedure signature.
    Argument(TypeRef),
}

/// The parsed type-stream header.
#[derive(Debug, Clone, Copy)]
struct TypeStreamHeader {
    first_index: u32,
    last_index: u32,
    records_offset: u32,
    records_size: u32,
    hash_stream: u16,
    hash_value_size: u32,
    hash_num_buckets: u32,
    hash_offset: u32,
    hash_size: u32,
    search_offset: u32,
    search_size: u32,
    remap_offset: u32,
    remap_size: u32,
}

/// Per-id resolution state: the record's stream offset and the id its
/// forward declaration collapsed to.
#[derive(Debug, Clone, Copy, Default)]
struct TypeDetails {
    offset: Option<u64>,
    resolved: Option<u32>,
}

/// The type-information stream of one container.
pub struct TypeInformation<'m, 'data> {
    msf: &'m Msf<'data>,
    stream: u32,
    header: TypeStreamHeader,
    /// Hash buckets over type ids, built from the stream's own per-id
    /// hash values. Chains keep ascending id order; remapped ids are
    /// moved to the head of their chain.
    buckets: Vec<Vec<u32>>,
    cache: RwLock<HashMap<u32, TypeDetails>>,
}

/// The string hash both the name buckets and the remap table are built
/// on: fold the name into a `u32`, force the case bits, then mix.
pub(crate) fn name_hash(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash = 0u32;
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        hash ^= u32::from_le_bytes(chunk.try_into().unwrap());
    }
    let mut rest = chunks.remainder();
    if rest.len() >= 2 {
        hash ^= u16::from_le_bytes([rest[0], rest[1]]) as u32;
        rest = &rest[2..];
    }
    if let Some(&byte) = rest.first() {
        hash ^= byte as u32;
    }
    hash |= 0x2020_2020;
    hash ^= hash >> 11;
    hash ^ (hash >> 16)
}

impl<'m, 'data> TypeInformation<'m, 'data> {
    /// Parses the type stream with the given id (the type stream proper
    /// or the id stream, which shares the layout).
    pub fn parse(msf: &'m Msf<'data>, stream: u32) -> Result<Self, CodeViewError> {
        let mut walker = msf.walker(stream)?;

        let version = walker.read_u32()?;
        let records_offset = walker.read_u32()?;
        let first_index = walker.read_u32()?;
        let last_index = walker.read_u32()?;
        let records_size = walker.read_u32()?;
        let hash_stream = walker.read_u16()?;
        let _hash_aux_stream = walker.read_u16()?;
        let hash_value_size = walker.read_u32()?;
        let hash_num_buckets = walker.read_u32()?;
        let hash_offset = walker.read_u32()?;
        let hash_size = walker.read_u32()?;
        let search_offset = walker.read_u32()?;
        let search_size = walker.read_u32()?;
        let remap_offset = walker.read_u32()?;
        let remap_size = walker.read_u32()?;

        if version < raw::TPI_MIN_VERSION || records_offset < raw::TPI_HEADER_SIZE {
            tracing::warn!(version, "unsupported type stream header");
            return Err(CodeViewErrorKind::UnsupportedVersion.into());
        }
        if last_index < first_index
            || hash_value_size > 4
            || hash_size != (last_index - first_index).wrapping_mul(hash_value_size)
            || search_size % 8 != 0
        {
            return Err(CodeViewErrorKind::InvalidStreamHeader.into());
        }

        let header = TypeStreamHeader {
            first_index,
            last_index,
            records_offset,
            records_size,
            hash_stream,
            hash_value_size,
            hash_num_buckets,
            hash_offset,
            hash_size,
            search_offset,
            search_size,
            remap_offset,
            remap_size,
        };

        let mut tpi = TypeInformation {
            msf,
            stream,
            header,
            buckets: Vec::new(),
            cache: RwLock::new(HashMap::new()),
        };
        tpi.build_buckets()?;
        tpi.apply_remap()?;
        Ok(tpi)
    }

    /// The id range `[first, last)` of this stream.
    pub fn index_range(&self) -> (u32, u32) {
        (self.header.first_index, self.header.last_index)
    }

    /// Builds the hash buckets from the stream's own per-id hash values;
    /// the values are read, not recomputed.
    fn build_buckets(&mut self) -> Result<(), CodeViewError> {
        let header = &self.header;
        self.buckets = vec![Vec::new(); header.hash_num_buckets as usize];
        if header.hash_size == 0 {
            return Ok(());
        }

        let mut walker = self.msf.walker(header.hash_stream as u32)?;
        walker.seek(header.hash_offset as u64);
        for id in header.first_index..header.last_index {
            let value = walker.read_uint(header.hash_value_size as usize)?;
            if value >= header.hash_num_buckets {
                tracing::warn!(id, value, "hash value outside bucket range");
                return Err(CodeViewErrorKind::InvalidStreamHeader.into());
            }
            self.buckets[value as usize].push(id);
        }
        Ok(())
    }

    /// Applies the incremental-link remap table: each remapped id moves to
    /// the head of its bucket chain so that the committed definition wins
    /// name lookup.
    fn apply_remap(&mut self) -> Result<(), CodeViewError> {
        if self.header.remap_size == 0 {
            return Ok(());
        }

        let mut walker = self.msf.walker(self.header.hash_stream as u32)?;
        walker.seek(self.header.remap_offset as u64);
        let _count = walker.read_u32()?;
        let capacity = walker.read_u32()?;
        let present_words = walker.read_u32()?;
        let mut present = walker;
        walker.skip(present_words as u64 * 4);
        let deleted_words = walker.read_u32()?;
        walker.skip(deleted_words as u64 * 4);

        let mut word = 0u32;
        for slot in 0..capacity {
            if slot % 32 == 0 {
                word = if slot / 32 < present_words {
                    present.read_u32()?
                } else {
                    0
                };
            }
            if word & (1 << (slot % 32)) == 0 {
                continue;
            }
            let _name_offset = walker.read_u32()?;
            let target = walker.read_u32()?;

            let hash = self.hash_of(target)?;
            let bucket = &mut self.buckets[hash as usize];
            if let Some(pos) = bucket.iter().position(|&id| id == target) {
                let id = bucket.remove(pos);
                bucket.insert(0, id);
                tracing::trace!(target, "remap promoted type id");
            } else {
                return Err(CodeViewErrorKind::InvalidStreamHeader.into());
            }
        }
        Ok(())
    }

    /// Reads the stored hash value of one type id.
    fn hash_of(&self, id: u32) -> Result<u32, CodeViewError> {
        if id < self.header.first_index || id >= self.header.last_index {
            return Err(CodeViewErrorKind::InvalidTypeIndex.into());
        }
        let mut walker = self.msf.walker(self.header.hash_stream as u32)?;
        walker.seek(
            self.header.hash_offset as u64
                + (id - self.header.first_index) as u64 * self.header.hash_value_size as u64,
        );
        let value = walker.read_uint(self.header.hash_value_size as usize)?;
        if value >= self.header.hash_num_buckets {
            return Err(CodeViewErrorKind::InvalidStreamHeader.into());
        }
        Ok(value)
    }

    /// A walker over the record region of the type stream.
    fn records_walker(&self) -> Result<StreamWalker<'m, 'data>, CodeViewError> {
        let mut walker = self.msf.walker(self.stream)?;
        let base = self.header.records_offset as u64;
        walker.narrow(base, self.header.records_size as u64)?;
        Ok(walker)
    }

    /// The stream offset of the record for `id`.
    ///
    /// Uses the binary-search table when present; on a miss it falls back
    /// to walking record frames forward from the nearest known offset.
    fn offset_of(&self, id: u32) -> Result<u64, CodeViewError> {
        if id < self.header.first_index || id >= self.header.last_index {
            return Err(CodeViewErrorKind::InvalidTypeIndex.into());
        }
        if let Some(details) = self.cache.read().get(&id) {
            if let Some(offset) = details.offset {
                return Ok(offset);
            }
        }

        let (mut cursor_id, mut offset) = self.nearest_known(id)?;
        let mut walker = self.records_walker()?;
        walker.seek(offset);
        while cursor_id < id {
            let len = walker.read_u16()?;
            walker.skip(len as u64);
            cursor_id += 1;
        }
        offset = walker.pos();

        let mut cache = self.cache.write();
        cache.entry(id).or_default().offset.get_or_insert(offset);
        Ok(offset)
    }

    /// The closest `(id, offset)` pair at or before `id` that is known
    /// without walking: from the binary-search table when present,
    /// otherwise the first record of the stream.
    fn nearest_known(&self, id: u32) -> Result<(u32, u64), CodeViewError> {
        let base = self.header.records_offset as u64;
        if self.header.search_size == 0 {
            return Ok((self.header.first_index, base));
        }

        let mut walker = self.msf.walker(self.header.hash_stream as u32)?;
        walker.seek(self.header.search_offset as u64);
        let num_pairs = self.header.search_size as u64 / 8;

        // Find the last pair whose id is <= the target.
        let mut low = 0u64;
        let mut high = num_pairs;
        let mut best: Option<(u32, u32)> = None;
        while low < high {
            let mid = (low + high) / 2;
            let mut pair_walker = walker;
            pair_walker.skip(mid * 8);
            let pair_id = pair_walker.read_u32()?;
            let pair_offset = pair_walker.read_u32()?;
            if pair_id <= id {
                best = Some((pair_id, pair_offset));
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        match best {
            Some((pair_id, pair_offset)) => Ok((pair_id, base + pair_offset as u64)),
            // All table entries lie past the target; walk from the start.
            None => Ok((self.header.first_index, base)),
        }
    }

    /// Reads the framed record for `id` without resolving it.
    fn record(&self, id: u32) -> Result<Record, CodeViewError> {
        let offset = self.offset_of(id)?;
        let mut walker = self.records_walker()?;
        walker.seek(offset);
        Record::read(&mut walker)?.ok_or_else(|| CodeViewErrorKind::InvalidRecord.into())
    }

    /// Decodes the record for `id` without resolving forward declarations.
    pub fn decode_raw(&self, id: u32) -> Result<TypeRecord, CodeViewError> {
        if id < raw::FIRST_DEFINABLE_TYPE {
            return Ok(TypeRecord::Basic { code: id });
        }
        let record = self.record(id)?;
        decode_record(&record)
    }

    /// Resolves a type id: collapses forward declarations onto their
    /// implementations and applies the remapped name lookup.
    ///
    /// Resolution is idempotent and cached. A forward declaration with no
    /// matching implementation resolves to itself; that is not an error.
    pub fn resolve(&self, id: u32) -> Result<u32, CodeViewError> {
        if id < raw::FIRST_DEFINABLE_TYPE {
            return Ok(id);
        }
        if let Some(details) = self.cache.read().get(&id) {
            if let Some(resolved) = details.resolved {
                return Ok(resolved);
            }
        }

        let record = self.record(id)?;
        let resolved = match decode_record(&record) {
            Ok(decoded) if decoded.is_forward() => {
                let name = decoded.name().unwrap_or_default();
                match self.find_definition(record.kind, name, decoded.decorated())? {
                    Some(other) => other,
                    // A forward declaration may legitimately stand alone.
                    None => id,
                }
            }
            Ok(_) => id,
            // Unknown kinds cannot be forward declarations; they resolve
            // to themselves and only fail once actually queried.
            Err(e) if e.kind() == CodeViewErrorKind::Unsupported => id,
            Err(e) => return Err(e),
        };

        self.commit(id, resolved);
        Ok(resolved)
    }

    /// Commits a resolution with first-write-wins discipline: once a
    /// resolved value is recorded, conflicting writes are dropped.
    fn commit(&self, id: u32, resolved: u32) {
        let mut cache = self.cache.write();
        let details = cache.entry(id).or_default();
        match details.resolved {
            None => details.resolved = Some(resolved),
            Some(existing) if existing != resolved => {
                tracing::warn!(id, existing, resolved, "dropping conflicting re-resolution");
            }
            Some(_) => {}
        }
    }

    /// Finds a non-forward record of `kind` whose name (and decorated
    /// name, when the declaration carries one) matches exactly.
    fn find_definition(
        &self,
        kind: u16,
        name: &str,
        decorated: Option<&str>,
    ) -> Result<Option<u32>, CodeViewError> {
        if self.buckets.is_empty() {
            return Ok(None);
        }
        let bucket = name_hash(name) % self.header.hash_num_buckets;
        for &candidate in &self.buckets[bucket as usize] {
            let record = match self.record(candidate) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(candidate, error = %e, "skipping unreadable hash chain entry");
                    continue;
                }
            };
            if record.kind != kind {
                continue;
            }
            let candidate_decoded = match decode_record(&record) {
                Ok(decoded) => decoded,
                Err(_) => continue,
            };
            if candidate_decoded.is_forward() || candidate_decoded.name() != Some(name) {
                continue;
            }
            if decorated.is_some() && candidate_decoded.decorated() != decorated {
                continue;
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }

    /// Looks up a type by name through the hash buckets, preferring a
    /// non-forward record, and returns its resolved reference.
    pub fn find_type_by_name(&self, name: &str) -> Result<TypeRef, CodeViewError> {
        if self.buckets.is_empty() {
            return Err(CodeViewErrorKind::NotFound.into());
        }
        let bucket = name_hash(name) % self.header.hash_num_buckets;
        let mut fallback = None;
        for &candidate in &self.buckets[bucket as usize] {
            let decoded = match self.decode_raw(candidate) {
                Ok(decoded) => decoded,
                Err(_) => continue,
            };
            if decoded.name() != Some(name) {
                continue;
            }
            if decoded.is_forward() {
                fallback.get_or_insert(candidate);
                continue;
            }
            return self.type_ref(candidate);
        }
        match fallback {
            Some(id) => self.type_ref(id),
            None => Err(CodeViewErrorKind::NotFound.into()),
        }
    }

    /// Produces the resolved, structurally comparable reference for a raw
    /// type id as it appears inside records.
    pub fn type_ref(&self, id: u32) -> Result<TypeRef, CodeViewError> {
        if id < raw::FIRST_DEFINABLE_TYPE {
            Ok(TypeRef::Basic(id))
        } else {
            Ok(TypeRef::Index(self.resolve(id)?))
        }
    }

    /// Decodes the resolved record behind a reference.
    pub fn decode(&self, type_ref: TypeRef) -> Result<TypeRecord, CodeViewError> {
        match type_ref {
            TypeRef::Basic(code) => Ok(TypeRecord::Basic { code }),
            TypeRef::Index(id) => self.decode_raw(self.resolve(id)?),
            TypeRef::Raw(id) => self.decode_raw(self.resolve(id)?),
        }
    }

    /// The broad kind of the type behind a reference.
    pub fn kind(&self, type_ref: TypeRef) -> Result<TypeKind, CodeViewError> {
        Ok(match self.decode(type_ref)? {
            TypeRecord::Basic { code } => {
                if code & raw::BASIC_POINTER_MASK != 0 {
                    TypeKind::Pointer
                } else {
                    TypeKind::Basic
                }
            }
            TypeRecord::Modifier { .. } => TypeKind::Modifier,
            TypeRecord::Pointer { .. } => TypeKind::Pointer,
            TypeRecord::Array { .. } => TypeKind::Array,
            TypeRecord::Structure { kind, .. } => kind,
            TypeRecord::Enum { .. } => TypeKind::Enum,
            TypeRecord::Procedure { .. } => TypeKind::Procedure,
            TypeRecord::MemberFunction { .. } => TypeKind::MemberFunction,
            TypeRecord::ArgList { .. } => TypeKind::ArgList,
            TypeRecord::Bitfield { .. } => TypeKind::Bitfield,
            TypeRecord::VtShape { .. } => TypeKind::VtShape,
            TypeRecord::FieldList => TypeKind::FieldList,
            TypeRecord::FuncId { .. } | TypeRecord::MemberFuncId { .. } => TypeKind::FuncId,
        })
    }

    /// The byte size of the type behind a reference.
    pub fn byte_size(&self, type_ref: TypeRef) -> Result<u64, CodeViewError> {
        match self.decode(type_ref)? {
            TypeRecord::Basic { code } => basic_type_size(code),
            TypeRecord::Modifier { underlying, .. } => self.byte_size(underlying),
            TypeRecord::Pointer { attributes, .. } => {
                let size = (attributes >> 13) & 0x3f;
                Ok(if size == 0 { 8 } else { size as u64 })
            }
            TypeRecord::Array { byte_size, .. } => Ok(byte_size),
            TypeRecord::Structure { byte_size, .. } => Ok(byte_size),
            TypeRecord::Enum { underlying, .. } => self.byte_size(underlying),
            TypeRecord::Bitfield { underlying, .. } => self.byte_size(underlying),
            _ => Err(CodeViewErrorKind::Unsupported.into()),
        }
    }

    /// The type a pointer (or modifier) refers to.
    pub fn pointee(&self, type_ref: TypeRef) -> Result<TypeRef, CodeViewError> {
        match self.decode(type_ref)? {
            TypeRecord::Basic { code } if code & raw::BASIC_POINTER_MASK != 0 => {
                Ok(TypeRef::Basic(code & !raw::BASIC_POINTER_MASK))
            }
            TypeRecord::Pointer { pointee, .. } => self.canonical(pointee),
            TypeRecord::Modifier { underlying, .. } => self.canonical(underlying),
            _ => Err(CodeViewErrorKind::Unsupported.into()),
        }
    }

    fn canonical(&self, type_ref: TypeRef) -> Result<TypeRef, CodeViewError> {
        match type_ref {
            TypeRef::Raw(id) | TypeRef::Index(id) => self.type_ref(id),
            basic => Ok(basic),
        }
    }

    /// Expands the children of the type behind a reference: structure
    /// fields, enumerators or procedure arguments.
    ///
    /// An empty field list yields an empty vector; querying a kind that
    /// has no children fails with `Unsupported`.
    pub fn children(&self, type_ref: TypeRef) -> Result<Vec<TypeChild>, CodeViewError> {
        match self.decode(type_ref)? {
            TypeRecord::Structure { field_list, .. } | TypeRecord::Enum { field_list, .. } => {
                let mut children = Vec::new();
                if field_list != 0 {
                    self.expand_field_list(field_list, &mut children)?;
                }
                Ok(children)
            }
            TypeRecord::Procedure { arg_list, .. }
            | TypeRecord::MemberFunction { arg_list, .. } => {
                match self.decode_raw(self.resolve(arg_list)?)? {
                    TypeRecord::ArgList { args } => {
                        Ok(args.into_iter().map(TypeChild::Argument).collect())
                    }
                    _ => Err(CodeViewErrorKind::InvalidRecord.into()),
                }
            }
            TypeRecord::ArgList { args } => {
                Ok(args.into_iter().map(TypeChild::Argument).collect())
            }
            _ => Err(CodeViewErrorKind::Unsupported.into()),
        }
    }

    /// Expands one field list, recursing through continuation records.
    fn expand_field_list(
        &self,
        field_list: u32,
        children: &mut Vec<TypeChild>,
    ) -> Result<(), CodeViewError> {
        let record = self.record(field_list)?;
        if record.kind != raw::LF_FIELDLIST {
            tracing::warn!(kind = record.kind, "expected a field list");
            return Err(CodeViewErrorKind::InvalidRecord.into());
        }

        let data = &record.data;
        let mut cursor = RecordCursor::new(data);
        while cursor.remaining() > 0 {
            // Padding bytes 0xf0..=0xff encode their own width.
            let peek = data[cursor.pos()];
            if peek >= 0xf0 {
                let pad = (peek & 0x0f) as usize;
                if pad == 0 {
                    tracing::warn!("zero-width padding in field list");
                    return Err(CodeViewErrorKind::InvalidRecord.into());
                }
                cursor.skip(pad);
                continue;
            }

            let member_kind = cursor.read_u16()?;
            match member_kind {
                raw::LF_MEMBER => {
                    let _attr = cursor.read_u16()?;
                    let type_id = cursor.read_u32()?;
                    let offset = cursor.read_numeric()?;
                    let name = cursor.read_cstring()?;
                    let (type_ref, bits) = self.member_type(type_id)?;
                    children.push(TypeChild::Member(TypeMember {
                        name,
                        type_ref,
                        offset,
                        bits,
                    }));
                }
                raw::LF_BCLASS => {
                    let _attr = cursor.read_u16()?;
                    let type_id = cursor.read_u32()?;
                    let offset = cursor.read_numeric()?;
                    children.push(TypeChild::BaseClass {
                        type_ref: self.canonical(TypeRef::raw(type_id))?,
                        offset,
                    });
                }
                raw::LF_VBCLASS | raw::LF_IVBCLASS => {
                    let _attr = cursor.read_u16()?;
                    let base = cursor.read_u32()?;
                    let vbptr = cursor.read_u32()?;
                    let _vbp_offset = cursor.read_numeric()?;
                    let _vb_offset = cursor.read_numeric()?;
                    children.push(TypeChild::VirtualBaseClass {
                        base: self.canonical(TypeRef::raw(base))?,
                        vbptr: self.canonical(TypeRef::raw(vbptr))?,
                    });
                }
                raw::LF_ENUMERATE => {
                    let _attr = cursor.read_u16()?;
                    let value = cursor.read_numeric()?;
                    let name = cursor.read_cstring()?;
                    children.push(TypeChild::Enumerator { name, value });
                }
                raw::LF_STMEMBER => {
                    let _attr = cursor.read_u16()?;
                    let type_id = cursor.read_u32()?;
                    let name = cursor.read_cstring()?;
                    children.push(TypeChild::StaticMember {
                        name,
                        type_ref: self.canonical(TypeRef::raw(type_id))?,
                    });
                }
                raw::LF_METHOD => {
                    let _count = cursor.read_u16()?;
                    let method_list = cursor.read_u32()?;
                    let name = cursor.read_cstring()?;
                    children.push(TypeChild::Method {
                        name,
                        type_ref: TypeRef::raw(method_list),
                    });
                }
                raw::LF_ONEMETHOD => {
                    let attr = cursor.read_u16()?;
                    let type_id = cursor.read_u32()?;
                    // Introducing virtual methods carry a vtable offset.
                    if matches!((attr >> 2) & 7, 4 | 6) {
                        let _vtab_offset = cursor.read_u32()?;
                    }
                    let name = cursor.read_cstring()?;
                    children.push(TypeChild::Method {
                        name,
                        type_ref: self.canonical(TypeRef::raw(type_id))?,
                    });
                }
                raw::LF_NESTTYPE => {
                    let _pad = cursor.read_u16()?;
                    let type_id = cursor.read_u32()?;
                    let name = cursor.read_cstring()?;
                    children.push(TypeChild::NestedType {
                        name,
                        type_ref: self.canonical(TypeRef::raw(type_id))?,
                    });
                }
                raw::LF_VFUNCTAB => {
                    let _pad = cursor.read_u16()?;
                    let _type = cursor.read_u32()?;
                }
                raw::LF_INDEX => {
                    let _pad = cursor.read_u16()?;
                    let continuation = cursor.read_u32()?;
                    self.expand_field_list(continuation, children)?;
                }
                other => {
                    // Member layouts are variable-length; an unknown kind
                    // cannot be skipped reliably.
                    tracing::warn!(kind = other, "unknown field-list member");
                    return Err(CodeViewErrorKind::Unsupported.into());
                }
            }
        }
        Ok(())
    }

    /// Resolves a member's type, peeling bitfield wrappers into
    /// `(position, length)` info.
    fn member_type(&self, type_id: u32) -> Result<(TypeRef, Option<(u8, u8)>), CodeViewError> {
        if type_id >= raw::FIRST_DEFINABLE_TYPE {
            if let Ok(TypeRecord::Bitfield {
                underlying,
                bit_length,
                bit_position,
            }) = self.decode_raw(type_id)
            {
                return Ok((self.canonical(underlying)?, Some((bit_position, bit_length))));
            }
        }
        Ok((self.canonical(TypeRef::raw(type_id))?, None))
    }
}

impl std::fmt::Debug for TypeInformation<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInformation")
            .field("first_index", &self.header.first_index)
            .field("last_index", &self.header.last_index)
            .field("num_buckets", &self.header.hash_num_buckets)
            .finish()
    }
}

/// Decodes a framed record into a [`TypeRecord`].
fn decode_record(record: &Record) -> Result<TypeRecord, CodeViewError> {
    let mut cursor = record.cursor();
    let decoded = match record.kind {
        raw::LF_MODIFIER => TypeRecord::Modifier {
            underlying: TypeRef::raw(cursor.read_u32()?),
            flags: cursor.read_u16()?,
        },
        raw::LF_POINTER => TypeRecord::Pointer {
            pointee: TypeRef::raw(cursor.read_u32()?),
            attributes: cursor.read_u32()?,
        },
        raw::LF_PROCEDURE => TypeRecord::Procedure {
            return_type: TypeRef::raw(cursor.read_u32()?),
            call_conv: {
                let conv = cursor.read_u8()?;
                let _attrs = cursor.read_u8()?;
                conv
            },
            param_count: cursor.read_u16()?,
            arg_list: cursor.read_u32()?,
        },
        raw::LF_MFUNCTION => {
            let return_type = TypeRef::raw(cursor.read_u32()?);
            let class_type = TypeRef::raw(cursor.read_u32()?);
            let this_type = TypeRef::raw(cursor.read_u32()?);
            let call_conv = cursor.read_u8()?;
            let _attrs = cursor.read_u8()?;
            let param_count = cursor.read_u16()?;
            let arg_list = cursor.read_u32()?;
            TypeRecord::MemberFunction {
                return_type,
                class_type,
                this_type,
                call_conv,
                param_count,
                arg_list,
            }
        }
        raw::LF_ARGLIST => {
            let count = cursor.read_u32()?;
            // The count is attacker-controlled; size by the actual payload.
            let mut args = Vec::with_capacity((count as usize).min(cursor.remaining() / 4));
            for _ in 0..count {
                args.push(TypeRef::raw(cursor.read_u32()?));
            }
            TypeRecord::ArgList { args }
        }
        raw::LF_BITFIELD => TypeRecord::Bitfield {
            underlying: TypeRef::raw(cursor.read_u32()?),
            bit_length: cursor.read_u8()?,
            bit_position: cursor.read_u8()?,
        },
        raw::LF_ARRAY => {
            let element = TypeRef::raw(cursor.read_u32()?);
            let index = TypeRef::raw(cursor.read_u32()?);
            let byte_size = cursor.read_numeric()? as u64;
            let name = cursor.read_cstring().unwrap_or_default();
            TypeRecord::Array {
                element,
                index,
                byte_size,
                name,
            }
        }
        raw::LF_CLASS | raw::LF_STRUCTURE => {
            let count = cursor.read_u16()?;
            let property = cursor.read_u16()?;
            let field_list = cursor.read_u32()?;
            let _derived = cursor.read_u32()?;
            let _vshape = cursor.read_u32()?;
            let byte_size = cursor.read_numeric()? as u64;
            let name = cursor.read_cstring()?;
            let decorated = read_decorated(&mut cursor, property)?;
            TypeRecord::Structure {
                kind: if record.kind == raw::LF_CLASS {
                    TypeKind::Class
                } else {
                    TypeKind::Struct
                },
                count,
                property,
                field_list,
                byte_size,
                name,
                decorated,
            }
        }
        raw::LF_UNION => {
            let count = cursor.read_u16()?;
            let property = cursor.read_u16()?;
            let field_list = cursor.read_u32()?;
            let byte_size = cursor.read_numeric()? as u64;
            let name = cursor.read_cstring()?;
            let decorated = read_decorated(&mut cursor, property)?;
            TypeRecord::Structure {
                kind: TypeKind::Union,
                count,
                property,
                field_list,
                byte_size,
                name,
                decorated,
            }
        }
        raw::LF_ENUM => {
            let count = cursor.read_u16()?;
            let property = cursor.read_u16()?;
            let underlying = TypeRef::raw(cursor.read_u32()?);
            let field_list = cursor.read_u32()?;
            let name = cursor.read_cstring()?;
            let decorated = read_decorated(&mut cursor, property)?;
            TypeRecord::Enum {
                count,
                property,
                underlying,
                field_list,
                name,
                decorated,
            }
        }
        raw::LF_VTSHAPE => TypeRecord::VtShape {
            count: cursor.read_u16()?,
        },
        raw::LF_FIELDLIST => TypeRecord::FieldList,
        raw::LF_FUNC_ID => TypeRecord::FuncId {
            scope: cursor.read_u32()?,
            signature: TypeRef::raw(cursor.read_u32()?),
            name: cursor.read_cstring()?,
        },
        raw::LF_MFUNC_ID => TypeRecord::MemberFuncId {
            parent: TypeRef::raw(cursor.read_u32()?),
            signature: TypeRef::raw(cursor.read_u32()?),
            name: cursor.read_cstring()?,
        },
        other => {
            tracing::debug!(kind = other, "unsupported type record");
            return Err(CodeViewErrorKind::Unsupported.into());
        }
    };
    Ok(decoded)
}

fn read_decorated(
    cursor: &mut RecordCursor<'_>,
    property: u16,
) -> Result<Option<String>, CodeViewError> {
    if property & raw::PROPERTY_HAS_DECORATED_NAME != 0 && cursor.remaining() > 0 {
        Ok(Some(cursor.read_cstring()?))
    } else {
        Ok(None)
    }
}

/// Byte sizes of the predefined basic types.
fn basic_type_size(code: u32) -> Result<u64, CodeViewError> {
    if code & raw::BASIC_POINTER_MASK != 0 {
        // Pointer-mode variants: 32-bit modes are 4 bytes, 64-bit are 8.
        return Ok(match code & raw::BASIC_POINTER_MASK {
            0x0100 | 0x0200 => 2, // near/far 16-bit
            0x0300 | 0x0400 | 0x0500 => 4,
            _ => 8,
        });
    }
    Ok(match code {
        0x0000 | 0x0003 => 0,                      // notype, void
        0x0010 | 0x0020 | 0x0030 | 0x0070 => 1,    // char, uchar, bool8, rchar
        0x0011 | 0x0021 | 0x0071 | 0x007a => 2,    // short, ushort, wchar, char16
        0x0012 | 0x0022 | 0x0040 | 0x0074 | 0x0075 | 0x007b => 4, // long, ulong, real32, int4, uint4, char32
        0x0013 | 0x0023 | 0x0041 | 0x0076 | 0x0077 => 8, // quad, uquad, real64, int8, uint8
        0x0042 => 10,                              // real80
        _ => return Err(CodeViewErrorKind::Unsupported.into()),
    })
}
