//! A parser for the type and symbol information stored in program-database
//! debug containers.
//!
//! The container holds several independently framed record streams:
//!
//! - the *type stream*, a hash-indexed sequence of type records with
//!   forward declarations that resolve to their implementations
//!   ([`TypeInformation`]);
//! - the *debug-information stream*, describing compilation units and the
//!   global symbol stream ([`DebugInformation`]);
//! - per-compilation-unit *symbol streams*, a scoped record sequence of
//!   functions, blocks, inline sites and locals that this crate assembles
//!   into an arena-backed symbol graph ([`SymbolGraph`]);
//! - *line subsections* mapping code addresses to source files and lines
//!   ([`LineTables`]).
//!
//! All parsing is bounded: every record is decoded through a cursor that
//! cannot read past the record's declared length, and corrupt records are
//! logged and skipped rather than failing the whole container.

use std::error::Error;

use thiserror::Error;

use quarry_msf::{MsfError, MsfErrorKind};

pub mod raw;

mod annotations;
mod dbi;
mod lines;
mod record;
mod symbols;
mod tpi;

#[cfg(test)]
pub(crate) mod testutil;

pub use annotations::{Annotation, AnnotationIter};
pub use dbi::{
    CompilandInfo, CompilandIter, DebugInformation, GlobalSymbol, GlobalSymbols,
    SectionContribution,
};
pub use lines::{FileEntry, LineEntry, LineTables};
pub use record::{Record, RecordCursor};
pub use symbols::{
    AddressRange, Block, Data, DataScope, DefRange, DefRangeKind, Function, InlineSiteIter,
    Location, Symbol, SymbolGraph, SymbolHandle, SymbolParser,
};
pub use tpi::{TypeChild, TypeInformation, TypeKind, TypeMember, TypeRecord, TypeRef};

/// The kind of a [`CodeViewError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CodeViewErrorKind {
    /// The underlying container could not be read.
    #[error("container error")]
    Container,
    /// A stream header is malformed or inconsistent.
    #[error("invalid stream header")]
    InvalidStreamHeader,
    /// A stream uses a format version this parser does not support.
    #[error("unsupported format version")]
    UnsupportedVersion,
    /// A record is malformed and cannot be decoded.
    #[error("invalid record")]
    InvalidRecord,
    /// A type id lies outside the stream's declared range.
    #[error("type id out of range")]
    InvalidTypeIndex,
    /// The query is not supported for this record kind.
    #[error("unsupported record kind")]
    Unsupported,
    /// A well-formed lookup had no match.
    #[error("not found")]
    NotFound,
    /// An optional substructure (e.g. a checksum table) is absent.
    #[error("missing information")]
    MissingInformation,
}

/// An error encountered while parsing type or symbol information.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CodeViewError {
    kind: CodeViewErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl CodeViewError {
    pub(crate) fn new<E>(kind: CodeViewErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// Returns the corresponding [`CodeViewErrorKind`] for this error.
    pub fn kind(&self) -> CodeViewErrorKind {
        self.kind
    }
}

impl From<CodeViewErrorKind> for CodeViewError {
    fn from(kind: CodeViewErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<MsfError> for CodeViewError {
    fn from(e: MsfError) -> Self {
        // Control-flow kinds keep their meaning across the boundary.
        let kind = match e.kind() {
            MsfErrorKind::NotFound => CodeViewErrorKind::NotFound,
            MsfErrorKind::MissingInformation => CodeViewErrorKind::MissingInformation,
            _ => CodeViewErrorKind::Container,
        };
        Self::new(kind, e)
    }
}

/// Maps segment-relative record addresses to image-relative ones.
///
/// The section layout belongs to the module registry that loaded the
/// image; the debug reader only consumes it. Segment numbers in records
/// are 1-based.
#[derive(Debug, Clone, Default)]
pub struct SectionTable {
    rvas: Vec<u32>,
}

impl SectionTable {
    /// Creates a table from the virtual addresses of each section.
    pub fn new(rvas: Vec<u32>) -> Self {
        SectionTable { rvas }
    }

    /// Resolves `segment:offset` to an image-relative address.
    pub fn address_of(&self, segment: u16, offset: u32) -> Option<u64> {
        if segment == 0 {
            return None;
        }
        let base = *self.rvas.get(segment as usize - 1)?;
        Some(base as u64 + offset as u64)
    }
}
