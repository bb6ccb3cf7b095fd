//! Record kinds and fixed layouts of the type and symbol streams.
//!
//! Every record is framed as a 2-byte length (counting everything after
//! the length field) followed by a 2-byte kind tag. Only the V2/V3 record
//! families emitted by modern toolchains are decoded; older variants are
//! rejected or skipped at the call sites.

// ---------------------------------------------------------------------
// Type stream (TPI) leaves.

pub const LF_MODIFIER: u16 = 0x1001;
pub const LF_POINTER: u16 = 0x1002;
pub const LF_PROCEDURE: u16 = 0x1008;
pub const LF_MFUNCTION: u16 = 0x1009;
pub const LF_VTSHAPE: u16 = 0x000a;
pub const LF_ARGLIST: u16 = 0x1201;
pub const LF_FIELDLIST: u16 = 0x1203;
pub const LF_BITFIELD: u16 = 0x1205;
pub const LF_METHODLIST: u16 = 0x1206;
pub const LF_ARRAY: u16 = 0x1503;
pub const LF_CLASS: u16 = 0x1504;
pub const LF_STRUCTURE: u16 = 0x1505;
pub const LF_UNION: u16 = 0x1506;
pub const LF_ENUM: u16 = 0x1507;

// Field-list members.
pub const LF_BCLASS: u16 = 0x1400;
pub const LF_VBCLASS: u16 = 0x1401;
pub const LF_IVBCLASS: u16 = 0x1402;
pub const LF_INDEX: u16 = 0x1404;
pub const LF_VFUNCTAB: u16 = 0x1409;
pub const LF_ENUMERATE: u16 = 0x1502;
pub const LF_MEMBER: u16 = 0x150d;
pub const LF_STMEMBER: u16 = 0x150e;
pub const LF_METHOD: u16 = 0x150f;
pub const LF_NESTTYPE: u16 = 0x1510;
pub const LF_ONEMETHOD: u16 = 0x1511;

// Id stream (IPI) leaves.
pub const LF_FUNC_ID: u16 = 0x1601;
pub const LF_MFUNC_ID: u16 = 0x1602;

// Numeric leaves used in variable-length record tails.
pub const LF_NUMERIC: u16 = 0x8000;
pub const LF_CHAR: u16 = 0x8000;
pub const LF_SHORT: u16 = 0x8001;
pub const LF_USHORT: u16 = 0x8002;
pub const LF_LONG: u16 = 0x8003;
pub const LF_ULONG: u16 = 0x8004;
pub const LF_QUADWORD: u16 = 0x8009;
pub const LF_UQUADWORD: u16 = 0x800a;

/// Structural-type property flags.
pub const PROPERTY_FORWARD_REF: u16 = 0x0080;
pub const PROPERTY_HAS_DECORATED_NAME: u16 = 0x0200;

/// First type id that refers to a record rather than a predefined type.
pub const FIRST_DEFINABLE_TYPE: u32 = 0x1000;

/// Pointer-mode bits of a predefined type id.
pub const BASIC_POINTER_MASK: u32 = 0x0700;

/// Supported type-stream header versions start here.
pub const TPI_MIN_VERSION: u32 = 1996_0000;

/// Byte size of the type-stream header.
pub const TPI_HEADER_SIZE: u32 = 56;

// ---------------------------------------------------------------------
// Symbol records.

pub const S_END: u16 = 0x0006;
pub const S_FRAMEPROC: u16 = 0x1012;
pub const S_OBJNAME: u16 = 0x1101;
pub const S_THUNK32: u16 = 0x1102;
pub const S_BLOCK32: u16 = 0x1103;
pub const S_LABEL32: u16 = 0x1105;
pub const S_REGISTER: u16 = 0x1106;
pub const S_CONSTANT: u16 = 0x1107;
pub const S_UDT: u16 = 0x1108;
pub const S_BPREL32: u16 = 0x110b;
pub const S_LDATA32: u16 = 0x110c;
pub const S_GDATA32: u16 = 0x110d;
pub const S_PUB32: u16 = 0x110e;
pub const S_LPROC32: u16 = 0x110f;
pub const S_GPROC32: u16 = 0x1110;
pub const S_REGREL32: u16 = 0x1111;
pub const S_LTHREAD32: u16 = 0x1112;
pub const S_GTHREAD32: u16 = 0x1113;
pub const S_UNAMESPACE: u16 = 0x1124;
pub const S_PROCREF: u16 = 0x1125;
pub const S_TOKENREF: u16 = 0x1126;
pub const S_LPROCREF: u16 = 0x1127;
pub const S_TRAMPOLINE: u16 = 0x112c;
pub const S_SEPCODE: u16 = 0x1132;
pub const S_SECTION: u16 = 0x1136;
pub const S_COFFGROUP: u16 = 0x1137;
pub const S_EXPORT: u16 = 0x1138;
pub const S_CALLSITEINFO: u16 = 0x1139;
pub const S_FRAMECOOKIE: u16 = 0x113a;
pub const S_COMPILE3: u16 = 0x113c;
pub const S_ENVBLOCK: u16 = 0x113d;
pub const S_LOCAL: u16 = 0x113e;
pub const S_DEFRANGE: u16 = 0x113f;
pub const S_DEFRANGE_SUBFIELD: u16 = 0x1140;
pub const S_DEFRANGE_REGISTER: u16 = 0x1141;
pub const S_DEFRANGE_FRAMEPOINTER_REL: u16 = 0x1142;
pub const S_DEFRANGE_SUBFIELD_REGISTER: u16 = 0x1143;
pub const S_DEFRANGE_FRAMEPOINTER_REL_FULL_SCOPE: u16 = 0x1144;
pub const S_DEFRANGE_REGISTER_REL: u16 = 0x1145;
pub const S_BUILDINFO: u16 = 0x114c;
pub const S_INLINESITE: u16 = 0x114d;
pub const S_INLINESITE_END: u16 = 0x114e;
pub const S_FILESTATIC: u16 = 0x1153;
pub const S_CALLEES: u16 = 0x115a;
pub const S_CALLERS: u16 = 0x115b;
pub const S_POGODATA: u16 = 0x115c;
pub const S_INLINESITE2: u16 = 0x115d;
pub const S_HEAPALLOCSITE: u16 = 0x115e;
pub const S_INLINEES: u16 = 0x1168;
pub const S_COMPILE2: u16 = 0x1116;
pub const S_GMANPROC: u16 = 0x112a;
pub const S_LMANPROC: u16 = 0x112b;

/// Local-variable flags on `S_LOCAL`.
pub const LOCAL_IS_PARAM: u16 = 0x0001;
pub const LOCAL_ENREG_GLOBAL: u16 = 0x0200;
pub const LOCAL_ENREG_STATIC: u16 = 0x0400;

/// Signature opening a compilation unit's symbol stream.
pub const CV_SIGNATURE_C13: u32 = 4;

// ---------------------------------------------------------------------
// Debug subsections carrying line information.

pub const DEBUG_S_IGNORE: u32 = 0x8000_0000;
pub const DEBUG_S_SYMBOLS: u32 = 0xf1;
pub const DEBUG_S_LINES: u32 = 0xf2;
pub const DEBUG_S_STRINGTABLE: u32 = 0xf3;
pub const DEBUG_S_FILECHKSMS: u32 = 0xf4;
pub const DEBUG_S_FRAMEDATA: u32 = 0xf5;
pub const DEBUG_S_INLINEELINES: u32 = 0xf6;

/// Flag in the lines header: entries are followed by column records.
pub const LINES_HAVE_COLUMNS: u16 = 0x0001;

// ---------------------------------------------------------------------
// Debug-information (DBI) stream.

/// Signature of the new-style DBI header.
pub const DBI_SIGNATURE: u32 = 0xffff_ffff;

/// Version gate between the old and new compilation-unit header layouts.
pub const DBI_NEW_VERSION: u32 = 1997_0000;

/// Section-contribution substream versions.
pub const SECTION_CONTRIB_V1: u32 = 0xeffe_0000 + 1997_0605;
pub const SECTION_CONTRIB_V2: u32 = 0xeffe_0000 + 2014_0516;

// ---------------------------------------------------------------------
// Binary annotation opcodes on inline sites.

pub const BA_OP_INVALID: u32 = 0;
pub const BA_OP_CODE_OFFSET: u32 = 1;
pub const BA_OP_CHANGE_CODE_OFFSET_BASE: u32 = 2;
pub const BA_OP_CHANGE_CODE_OFFSET: u32 = 3;
pub const BA_OP_CHANGE_CODE_LENGTH: u32 = 4;
pub const BA_OP_CHANGE_FILE: u32 = 5;
pub const BA_OP_CHANGE_LINE_OFFSET: u32 = 6;
pub const BA_OP_CHANGE_LINE_END_DELTA: u32 = 7;
pub const BA_OP_CHANGE_RANGE_KIND: u32 = 8;
pub const BA_OP_CHANGE_COLUMN_START: u32 = 9;
pub const BA_OP_CHANGE_COLUMN_END_DELTA: u32 = 10;
pub const BA_OP_CHANGE_CODE_OFFSET_AND_LINE_OFFSET: u32 = 11;
pub const BA_OP_CHANGE_CODE_LENGTH_AND_CODE_OFFSET: u32 = 12;
pub const BA_OP_CHANGE_COLUMN_END: u32 = 13;
