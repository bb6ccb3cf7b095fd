//! Shared builders for synthetic type, symbol and line streams.

use crate::raw;
use crate::tpi::name_hash;

pub const TPI_STREAM: u32 = 2;
pub const IPI_STREAM: u32 = 4;
pub const TPI_HASH_STREAM: u32 = 5;
pub const FIRST_TYPE: u32 = 0x1000;
pub const TYPE_BUCKETS: u32 = 16;

/// Builds a synthetic type (or id) stream plus its hash stream.
pub struct TpiBuilder {
    records: Vec<(u16, Vec<u8>)>,
    hashes: Vec<u32>,
    /// When false, the header advertises no hash/search tables and only
    /// sequential record access works (enough for an id stream).
    with_hash: bool,
}

impl TpiBuilder {
    pub fn new() -> Self {
        TpiBuilder {
            records: Vec::new(),
            hashes: Vec::new(),
            with_hash: true,
        }
    }

    pub fn without_hash() -> Self {
        TpiBuilder {
            records: Vec::new(),
            hashes: Vec::new(),
            with_hash: false,
        }
    }

    pub fn add(&mut self, kind: u16, payload: Vec<u8>, hash: u32) -> u32 {
        let id = FIRST_TYPE + self.records.len() as u32;
        self.records.push((kind, payload));
        self.hashes.push(hash % TYPE_BUCKETS);
        id
    }

    pub fn add_named(&mut self, kind: u16, payload: Vec<u8>, name: &str) -> u32 {
        self.add(kind, payload, name_hash(name))
    }

    /// Serializes the type stream and its hash stream.
    pub fn build(&self) -> (Vec<u8>, Vec<u8>) {
        let mut records = Vec::new();
        let mut offsets = Vec::new();
        for (kind, payload) in &self.records {
            offsets.push(records.len() as u32);
            let len = (payload.len() + 2) as u16;
            records.extend_from_slice(&len.to_le_bytes());
            records.extend_from_slice(&kind.to_le_bytes());
            records.extend_from_slice(payload);
        }

        let count = self.records.len() as u32;
        let hash_size = if self.with_hash { count * 4 } else { 0 };
        let mut search = Vec::new();
        if self.with_hash {
            // Binary-search pairs for every second record; the others are
            // reached by walking forward from the nearest pair.
            for (i, offset) in offsets.iter().enumerate().step_by(2) {
                search.extend_from_slice(&(FIRST_TYPE + i as u32).to_le_bytes());
                search.extend_from_slice(&offset.to_le_bytes());
            }
        }

        let buckets = if self.with_hash { TYPE_BUCKETS } else { 0 };
        let value_size = if self.with_hash { 4u32 } else { 0 };
        let hash_stream = if self.with_hash {
            TPI_HASH_STREAM as u16
        } else {
            0xffff
        };

        let mut header = Vec::new();
        header.extend_from_slice(&2004_0203u32.to_le_bytes()); // version
        header.extend_from_slice(&56u32.to_le_bytes()); // records offset
        header.extend_from_slice(&FIRST_TYPE.to_le_bytes());
        header.extend_from_slice(&(FIRST_TYPE + count).to_le_bytes());
        header.extend_from_slice(&(records.len() as u32).to_le_bytes());
        header.extend_from_slice(&hash_stream.to_le_bytes());
        header.extend_from_slice(&0xffffu16.to_le_bytes()); // aux stream
        header.extend_from_slice(&value_size.to_le_bytes());
        header.extend_from_slice(&buckets.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // hash offset
        header.extend_from_slice(&hash_size.to_le_bytes());
        header.extend_from_slice(&hash_size.to_le_bytes()); // search offset
        header.extend_from_slice(&(search.len() as u32).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // remap offset
        header.extend_from_slice(&0u32.to_le_bytes()); // remap size

        let mut tpi = header;
        tpi.extend_from_slice(&records);

        let mut hash_data = Vec::new();
        for hash in &self.hashes {
            hash_data.extend_from_slice(&hash.to_le_bytes());
        }
        hash_data.extend_from_slice(&search);

        (tpi, hash_data)
    }
}

pub fn structure_payload(
    property: u16,
    field_list: u32,
    size: u16,
    count: u16,
    name: &str,
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&count.to_le_bytes());
    payload.extend_from_slice(&property.to_le_bytes());
    payload.extend_from_slice(&field_list.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes()); // derived
    payload.extend_from_slice(&0u32.to_le_bytes()); // vshape
    payload.extend_from_slice(&size.to_le_bytes()); // numeric leaf
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload
}

fn pad_field(field: &mut Vec<u8>) {
    while field.len() % 4 != 0 {
        let pad = 4 - field.len() % 4;
        field.push(0xf0 + pad as u8);
    }
}

pub fn member_field(type_id: u32, offset: u16, name: &str) -> Vec<u8> {
    let mut field = Vec::new();
    field.extend_from_slice(&raw::LF_MEMBER.to_le_bytes());
    field.extend_from_slice(&3u16.to_le_bytes()); // attributes
    field.extend_from_slice(&type_id.to_le_bytes());
    field.extend_from_slice(&offset.to_le_bytes()); // numeric leaf
    field.extend_from_slice(name.as_bytes());
    field.push(0);
    pad_field(&mut field);
    field
}

pub fn enumerate_field(value: u16, name: &str) -> Vec<u8> {
    let mut field = Vec::new();
    field.extend_from_slice(&raw::LF_ENUMERATE.to_le_bytes());
    field.extend_from_slice(&3u16.to_le_bytes());
    field.extend_from_slice(&value.to_le_bytes()); // numeric leaf
    field.extend_from_slice(name.as_bytes());
    field.push(0);
    pad_field(&mut field);
    field
}

pub fn func_id_payload(signature: u32, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_le_bytes()); // scope
    payload.extend_from_slice(&signature.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload
}

// -------------------------------------------------------------------
// Symbol records.

/// Frames one symbol record, padding the payload to a 4-byte multiple.
pub fn sym_record(kind: u16, mut payload: Vec<u8>) -> Vec<u8> {
    while (payload.len() + 4) % 4 != 0 {
        payload.push(0);
    }
    let mut out = Vec::new();
    out.extend_from_slice(&((payload.len() + 2) as u16).to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

pub fn proc32(
    name: &str,
    segment: u16,
    offset: u32,
    length: u32,
    debug_start: u32,
    debug_end: u32,
    type_id: u32,
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_le_bytes()); // parent
    payload.extend_from_slice(&0u32.to_le_bytes()); // end
    payload.extend_from_slice(&0u32.to_le_bytes()); // next
    payload.extend_from_slice(&length.to_le_bytes());
    payload.extend_from_slice(&debug_start.to_le_bytes());
    payload.extend_from_slice(&debug_end.to_le_bytes());
    payload.extend_from_slice(&type_id.to_le_bytes());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(&segment.to_le_bytes());
    payload.push(0); // flags
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    sym_record(raw::S_GPROC32, payload)
}

pub fn block32(segment: u16, offset: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_le_bytes()); // parent
    payload.extend_from_slice(&0u32.to_le_bytes()); // end
    payload.extend_from_slice(&length.to_le_bytes());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(&segment.to_le_bytes());
    payload.push(0); // name
    sym_record(raw::S_BLOCK32, payload)
}

pub fn end_record() -> Vec<u8> {
    sym_record(raw::S_END, Vec::new())
}

pub fn inline_site(end_offset: u32, inlinee: u32, annotations: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0u32.to_le_bytes()); // parent
    payload.extend_from_slice(&end_offset.to_le_bytes());
    payload.extend_from_slice(&inlinee.to_le_bytes());
    payload.extend_from_slice(annotations);
    sym_record(raw::S_INLINESITE, payload)
}

pub fn inline_site_end() -> Vec<u8> {
    sym_record(raw::S_INLINESITE_END, Vec::new())
}

pub fn local(type_id: u32, flags: u16, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&type_id.to_le_bytes());
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    sym_record(raw::S_LOCAL, payload)
}

pub fn defrange_framerel(
    frame_offset: i32,
    segment: u16,
    offset: u32,
    length: u16,
    gaps: &[(u16, u16)],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&frame_offset.to_le_bytes());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(&segment.to_le_bytes());
    payload.extend_from_slice(&length.to_le_bytes());
    for (gap_offset, gap_length) in gaps {
        payload.extend_from_slice(&gap_offset.to_le_bytes());
        payload.extend_from_slice(&gap_length.to_le_bytes());
    }
    sym_record(raw::S_DEFRANGE_FRAMEPOINTER_REL, payload)
}

pub fn regrel32(offset: i32, type_id: u32, reg: u16, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(&type_id.to_le_bytes());
    payload.extend_from_slice(&reg.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    sym_record(raw::S_REGREL32, payload)
}

pub fn frameproc(frame_size: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&frame_size.to_le_bytes());
    payload.extend_from_slice(&[0u8; 24]); // pads, handler, flags
    sym_record(raw::S_FRAMEPROC, payload)
}

/// Assembles a compilation unit's stream: signature, symbol records,
/// then line subsections.
pub fn module_stream(symbols: &[Vec<u8>], lines: &[u8]) -> (Vec<u8>, u32, u32) {
    let mut stream = Vec::new();
    stream.extend_from_slice(&raw::CV_SIGNATURE_C13.to_le_bytes());
    for record in symbols {
        stream.extend_from_slice(record);
    }
    let symbols_size = stream.len() as u32;
    stream.extend_from_slice(lines);
    (stream, symbols_size, lines.len() as u32)
}

/// Byte offset of the `index`-th record inside a module stream built by
/// [`module_stream`] (the 4-byte signature comes first).
pub fn record_offset(symbols: &[Vec<u8>], index: usize) -> u32 {
    4 + symbols[..index].iter().map(|r| r.len() as u32).sum::<u32>()
}

// -------------------------------------------------------------------
// Debug-information stream.

pub struct DbiModule {
    pub stream: u16,
    pub symbols_size: u32,
    pub lines_size: u32,
    pub segment: u16,
    pub offset: u32,
    pub size: u32,
    pub name: String,
}

/// Serializes a debug-information stream describing `modules`, with the
/// given global symbol record stream id.
pub fn dbi_stream(modules: &[DbiModule], sym_record_stream: u16) -> Vec<u8> {
    let mut module_info = Vec::new();
    for (index, module) in modules.iter().enumerate() {
        module_info.extend_from_slice(&0u32.to_le_bytes()); // unused
        module_info.extend_from_slice(&module.segment.to_le_bytes());
        module_info.extend_from_slice(&0u16.to_le_bytes()); // pad
        module_info.extend_from_slice(&module.offset.to_le_bytes());
        module_info.extend_from_slice(&module.size.to_le_bytes());
        module_info.extend_from_slice(&0u32.to_le_bytes()); // characteristics
        module_info.extend_from_slice(&(index as u16).to_le_bytes());
        module_info.extend_from_slice(&0u16.to_le_bytes()); // pad
        module_info.extend_from_slice(&0u32.to_le_bytes()); // data crc
        module_info.extend_from_slice(&0u32.to_le_bytes()); // reloc crc
        module_info.extend_from_slice(&0u16.to_le_bytes()); // flags
        module_info.extend_from_slice(&module.stream.to_le_bytes());
        module_info.extend_from_slice(&module.symbols_size.to_le_bytes());
        module_info.extend_from_slice(&0u32.to_le_bytes()); // lineno
        module_info.extend_from_slice(&module.lines_size.to_le_bytes());
        module_info.extend_from_slice(&1u32.to_le_bytes()); // num source files
        module_info.extend_from_slice(&0u32.to_le_bytes()); // attribute
        module_info.extend_from_slice(&0u32.to_le_bytes()); // reserved
        module_info.extend_from_slice(&0u32.to_le_bytes()); // reserved
        module_info.extend_from_slice(module.name.as_bytes());
        module_info.push(0);
        module_info.extend_from_slice(module.name.as_bytes()); // object name
        module_info.push(0);
        while module_info.len() % 4 != 0 {
            module_info.push(0);
        }
    }

    let mut contributions = Vec::new();
    contributions.extend_from_slice(&raw::SECTION_CONTRIB_V1.to_le_bytes());
    for (index, module) in modules.iter().enumerate() {
        contributions.extend_from_slice(&module.segment.to_le_bytes());
        contributions.extend_from_slice(&0u16.to_le_bytes());
        contributions.extend_from_slice(&module.offset.to_le_bytes());
        contributions.extend_from_slice(&module.size.to_le_bytes());
        contributions.extend_from_slice(&0u32.to_le_bytes());
        contributions.extend_from_slice(&(index as u16).to_le_bytes());
        contributions.extend_from_slice(&0u16.to_le_bytes());
        contributions.extend_from_slice(&0u32.to_le_bytes());
        contributions.extend_from_slice(&0u32.to_le_bytes());
    }

    let mut dbi = Vec::new();
    dbi.extend_from_slice(&raw::DBI_SIGNATURE.to_le_bytes());
    dbi.extend_from_slice(&1999_0903u32.to_le_bytes()); // version
    dbi.extend_from_slice(&1u32.to_le_bytes()); // age
    dbi.extend_from_slice(&0xffffu16.to_le_bytes()); // global hash stream
    dbi.extend_from_slice(&0u16.to_le_bytes()); // build number
    dbi.extend_from_slice(&0xffffu16.to_le_bytes()); // public stream
    dbi.extend_from_slice(&0u16.to_le_bytes()); // pdb dll version
    dbi.extend_from_slice(&sym_record_stream.to_le_bytes());
    dbi.extend_from_slice(&0u16.to_le_bytes()); // rbld
    dbi.extend_from_slice(&(module_info.len() as u32).to_le_bytes());
    dbi.extend_from_slice(&(contributions.len() as u32).to_le_bytes());
    dbi.extend_from_slice(&0u32.to_le_bytes()); // section map size
    dbi.extend_from_slice(&0u32.to_le_bytes()); // source info size
    dbi.extend_from_slice(&0u32.to_le_bytes()); // type server size
    dbi.extend_from_slice(&0u32.to_le_bytes()); // mfc index
    dbi.extend_from_slice(&0u32.to_le_bytes()); // dbg header size
    dbi.extend_from_slice(&0u32.to_le_bytes()); // ec size
    dbi.extend_from_slice(&0u16.to_le_bytes()); // flags
    dbi.extend_from_slice(&0x8664u16.to_le_bytes()); // machine
    dbi.extend_from_slice(&0u32.to_le_bytes()); // padding
    dbi.extend_from_slice(&module_info);
    dbi.extend_from_slice(&contributions);
    dbi
}

// -------------------------------------------------------------------
// Line subsections.

/// Builds a DEBUG_S_FILECHKSMS subsection with one entry per string-table
/// offset; returns the subsection and each entry's file offset.
pub fn checksum_subsection(string_offsets: &[u32]) -> (Vec<u8>, Vec<u32>) {
    let mut body = Vec::new();
    let mut entry_offsets = Vec::new();
    for str_offset in string_offsets {
        entry_offsets.push(body.len() as u32);
        body.extend_from_slice(&str_offset.to_le_bytes());
        body.push(0); // checksum size
        body.push(0); // checksum kind: none
        while body.len() % 4 != 0 {
            body.push(0);
        }
    }
    let mut out = Vec::new();
    out.extend_from_slice(&raw::DEBUG_S_FILECHKSMS.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    (out, entry_offsets)
}

/// Builds a DEBUG_S_LINES subsection with a single file block.
pub fn lines_subsection(
    segment: u16,
    offset: u32,
    code_size: u32,
    file_offset: u32,
    lines: &[(u32, u32)],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&offset.to_le_bytes());
    body.extend_from_slice(&segment.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // flags
    body.extend_from_slice(&code_size.to_le_bytes());
    body.extend_from_slice(&file_offset.to_le_bytes());
    body.extend_from_slice(&(lines.len() as u32).to_le_bytes());
    body.extend_from_slice(&((12 + lines.len() * 8) as u32).to_le_bytes());
    for (line_offset, line) in lines {
        body.extend_from_slice(&line_offset.to_le_bytes());
        body.extend_from_slice(&(line & 0x00ff_ffff).to_le_bytes());
    }
    let mut out = Vec::new();
    out.extend_from_slice(&raw::DEBUG_S_LINES.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Builds a DEBUG_S_INLINEELINES subsection (plain form).
pub fn inlinee_lines_subsection(entries: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // plain signature
    for (inlinee, file_offset, base_line) in entries {
        body.extend_from_slice(&inlinee.to_le_bytes());
        body.extend_from_slice(&file_offset.to_le_bytes());
        body.extend_from_slice(&base_line.to_le_bytes());
    }
    let mut out = Vec::new();
    out.extend_from_slice(&raw::DEBUG_S_INLINEELINES.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Builds a `/names` string table stream holding the given strings;
/// returns the stream and each string's table offset.
pub fn string_table_stream(strings: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut data = vec![0u8]; // offset 0 is the empty string
    let mut offsets = Vec::new();
    for s in strings {
        offsets.push(data.len() as u32);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }
    let mut out = Vec::new();
    out.extend_from_slice(&0xEFFE_EFFEu32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
    (out, offsets)
}
