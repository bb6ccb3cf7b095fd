use quarry_testutils::ContainerBuilder;

use crate::annotations::encode_compressed;
use crate::dbi::{DebugInformation, GlobalSymbol};
use crate::raw;
use crate::testutil::*;
use crate::tpi::TypeInformation;
use crate::{CodeViewErrorKind, SectionTable};

use super::*;

const MODULE_STREAM: u32 = 10;
const GLOBALS_STREAM: u32 = 8;

const T_INT4: u32 = 0x0074;
const T_VOID: u32 = 0x0003;

fn annotate(ops: &[(u32, &[u32])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (opcode, args) in ops {
        encode_compressed(*opcode, &mut out);
        for arg in *args {
            encode_compressed(*arg, &mut out);
        }
    }
    out
}

/// An id stream naming two inlinable callees.
fn ipi_streams() -> (Vec<u8>, u32, u32) {
    let mut builder = TpiBuilder::without_hash();
    let outer = builder.add(raw::LF_FUNC_ID, func_id_payload(T_VOID, "inline_outer"), 0);
    let inner = builder.add(raw::LF_FUNC_ID, func_id_payload(T_VOID, "inline_inner"), 0);
    let (stream, _) = builder.build();
    (stream, outer, inner)
}

struct Fixture {
    data: Vec<u8>,
}

impl Fixture {
    /// One compilation unit with a function at 0x1100..0x1200 carrying a
    /// live-range local, a nested block, and two nested inline sites.
    fn build() -> Fixture {
        let (ipi, outer_id, inner_id) = ipi_streams();

        let symbols = vec![
            proc32("main", 1, 0x100, 0x100, 8, 0xf0, 0),
            frameproc(0x40),
            local(T_INT4, 0, "x"),
            defrange_framerel(-8, 1, 0x110, 0x20, &[(4, 2)]),
            block32(1, 0x120, 0x40),
            local(T_INT4, 0, "y"),
            end_record(),
            inline_site(
                0,
                outer_id,
                &annotate(&[
                    (raw::BA_OP_CHANGE_CODE_OFFSET, &[0x20]),
                    (
                        raw::BA_OP_CHANGE_CODE_LENGTH_AND_CODE_OFFSET,
                        &[0x8, 0x10],
                    ),
                ]),
            ),
            inline_site(
                0,
                inner_id,
                &annotate(&[
                    (raw::BA_OP_CHANGE_CODE_OFFSET, &[0x22]),
                    (raw::BA_OP_CHANGE_CODE_LENGTH, &[0x6]),
                ]),
            ),
            inline_site_end(),
            inline_site_end(),
            end_record(),
        ];
        let (module, symbols_size, lines_size) = module_stream(&symbols, &[]);

        let dbi = dbi_stream(
            &[DbiModule {
                stream: MODULE_STREAM as u16,
                symbols_size,
                lines_size,
                segment: 1,
                offset: 0x100,
                size: 0x100,
                name: "main.obj".into(),
            }],
            GLOBALS_STREAM as u16,
        );

        let data = ContainerBuilder::new(&[Vec::new(), Vec::new()])
            .stream_at(quarry_msf::raw::STREAM_DBI, dbi)
            .stream_at(IPI_STREAM, ipi)
            .stream_at(GLOBALS_STREAM, Vec::new())
            .stream_at(MODULE_STREAM, module)
            .build();
        Fixture { data }
    }

    fn graph(&self) -> (SymbolGraph, quarry_msf::Msf<'_>) {
        let msf = quarry_msf::Msf::parse(&self.data).unwrap();
        let mut graph = SymbolGraph::new();
        {
            let dbi = DebugInformation::parse(&msf).unwrap();
            let ipi = TypeInformation::parse(&msf, IPI_STREAM).unwrap();
            let parser = SymbolParser::new(SectionTable::new(vec![0x1000]), None, Some(&ipi));
            parser.parse_all(&dbi, &mut graph).unwrap();
        }
        (graph, msf)
    }
}

#[test]
fn builds_function_scopes_and_locals() {
    let fixture = Fixture::build();
    let (graph, _msf) = fixture.graph();

    let handle = graph.function_at(0x1150).expect("function covers address");
    let function = graph.symbols.get(handle).as_function().unwrap();
    assert_eq!(function.name, "main");
    assert_eq!(function.frame_size, Some(0x40));
    assert_eq!(function.debug_start, 8);
    assert!(function.contains(0x1100));
    assert!(!function.contains(0x1200));
    assert!(graph.function_at(0x2000).is_none());

    // "x" is attached to the function, "y" to the nested block.
    let local_names: Vec<&str> = function
        .locals
        .iter()
        .filter_map(|&h| graph.symbols.get(h).as_data())
        .map(|data| data.name.as_str())
        .collect();
    assert_eq!(local_names, vec!["x"]);

    assert_eq!(function.blocks.len(), 1);
    let block = match graph.symbols.get(function.blocks[0]) {
        Symbol::Block(block) => block,
        other => panic!("unexpected node {other:?}"),
    };
    assert_eq!(block.ranges[0], AddressRange { start: 0x1120, end: 0x1160 });
    let block_locals: Vec<&str> = block
        .locals
        .iter()
        .filter_map(|&h| graph.symbols.get(h).as_data())
        .map(|data| data.name.as_str())
        .collect();
    assert_eq!(block_locals, vec!["y"]);

    // Block ranges nest inside the function.
    for range in &block.ranges {
        assert!(function
            .ranges
            .iter()
            .any(|outer| outer.start <= range.start && range.end <= outer.end));
    }
}

#[test]
fn definition_ranges_honor_gaps() {
    let fixture = Fixture::build();
    let (graph, _msf) = fixture.graph();

    let handle = graph.function_at(0x1100).unwrap();
    let function = graph.symbols.get(handle).as_function().unwrap();
    let data = graph.symbols.get(function.locals[0]).as_data().unwrap();

    // Live inside the range, dead inside the gap and outside the range.
    let live = data.location_at(0x1110).expect("live at range start");
    assert!(matches!(live.kind, DefRangeKind::FramePointerRel(-8)));
    assert!(data.location_at(0x1113).is_some());
    assert!(data.location_at(0x1114).is_none()); // inside the gap
    assert!(data.location_at(0x1116).is_some()); // past the gap
    assert!(data.location_at(0x1130).is_none()); // past the range
}

#[test]
fn inline_sites_nest_and_stay_disjoint() {
    let fixture = Fixture::build();
    let (graph, _msf) = fixture.graph();

    let main = graph.function_at(0x1100).unwrap();
    let sites: Vec<SymbolHandle> = graph.inline_sites(main).collect();
    assert_eq!(sites.len(), 2);

    // Creation order links sites in front: the inner site comes first,
    // its lexical parent later.
    let inner = graph.symbols.get(sites[0]).as_function().unwrap();
    let outer = graph.symbols.get(sites[1]).as_function().unwrap();
    assert_eq!(inner.name, "inline_inner");
    assert_eq!(outer.name, "inline_outer");
    assert_eq!(inner.lexical_parent, Some(sites[1]));
    assert_eq!(outer.lexical_parent, Some(main));
    assert_eq!(inner.top_function, Some(main));

    assert_eq!(
        outer.ranges.as_slice(),
        &[
            AddressRange { start: 0x1120, end: 0x1130 },
            AddressRange { start: 0x1130, end: 0x1138 },
        ]
    );
    assert_eq!(
        inner.ranges.as_slice(),
        &[AddressRange { start: 0x1122, end: 0x1128 }]
    );

    // Every site's ranges are pairwise disjoint.
    for site in [inner, outer] {
        for (i, a) in site.ranges.iter().enumerate() {
            for b in site.ranges.iter().skip(i + 1) {
                assert!(a.end <= b.start || b.end <= a.start);
            }
        }
    }

    // Each inner range lies inside exactly one range of the parent.
    for range in &inner.ranges {
        let covering = outer
            .ranges
            .iter()
            .filter(|outer| outer.start <= range.start && range.end <= outer.end)
            .count();
        assert_eq!(covering, 1);
    }

    // The deepest site wins address lookup.
    assert_eq!(graph.inline_site_at(main, 0x1124), Some(sites[0]));
    assert_eq!(graph.inline_site_at(main, 0x1132), Some(sites[1]));
    assert_eq!(graph.inline_site_at(main, 0x1180), None);
}

#[test]
fn abandoned_inline_sites_skip_to_their_end() {
    // The inlinee id is unknown, so the site must be skipped wholesale
    // and parsing must resume cleanly after its end record.
    let (ipi, _, _) = ipi_streams();

    let mut symbols = vec![
        proc32("broken", 1, 0x100, 0x100, 0, 0, 0),
        inline_site(0, 0x3fff, &annotate(&[(raw::BA_OP_CHANGE_CODE_OFFSET, &[0x10])])),
        inline_site_end(),
        local(T_INT4, 0, "after"),
        end_record(),
    ];
    // Patch the site's end offset to point at its end record.
    let end_offset = record_offset(&symbols, 2);
    symbols[1] = inline_site(
        end_offset,
        0x3fff,
        &annotate(&[(raw::BA_OP_CHANGE_CODE_OFFSET, &[0x10])]),
    );

    let (module, symbols_size, lines_size) = module_stream(&symbols, &[]);
    let dbi = dbi_stream(
        &[DbiModule {
            stream: MODULE_STREAM as u16,
            symbols_size,
            lines_size,
            segment: 1,
            offset: 0x100,
            size: 0x100,
            name: "broken.obj".into(),
        }],
        GLOBALS_STREAM as u16,
    );
    let data = ContainerBuilder::new(&[Vec::new(), Vec::new()])
        .stream_at(quarry_msf::raw::STREAM_DBI, dbi)
        .stream_at(IPI_STREAM, ipi)
        .stream_at(GLOBALS_STREAM, Vec::new())
        .stream_at(MODULE_STREAM, module)
        .build();

    let msf = quarry_msf::Msf::parse(&data).unwrap();
    let dbi = DebugInformation::parse(&msf).unwrap();
    let ipi = TypeInformation::parse(&msf, IPI_STREAM).unwrap();
    let parser = SymbolParser::new(SectionTable::new(vec![0x1000]), None, Some(&ipi));
    let mut graph = SymbolGraph::new();
    parser.parse_all(&dbi, &mut graph).unwrap();

    let handle = graph.function_at(0x1100).unwrap();
    let function = graph.symbols.get(handle).as_function().unwrap();
    assert!(graph.inline_sites(handle).next().is_none());

    // The local after the abandoned site still landed on the function.
    let names: Vec<&str> = function
        .locals
        .iter()
        .filter_map(|&h| graph.symbols.get(h).as_data())
        .map(|data| data.name.as_str())
        .collect();
    assert_eq!(names, vec!["after"]);
}

#[test]
fn register_relative_records_defer_to_named_locals() {
    let symbols = vec![
        proc32("f", 1, 0x100, 0x40, 0, 0, 0),
        frameproc(0x20),
        local(T_INT4, 0, "kept"),
        // Same name: must not create a second local.
        regrel32(8, T_INT4, 335, "kept"),
        // New name at or past the frame size: a parameter.
        regrel32(0x28, T_INT4, 335, "param"),
        end_record(),
    ];
    let (module, symbols_size, lines_size) = module_stream(&symbols, &[]);
    let dbi = dbi_stream(
        &[DbiModule {
            stream: MODULE_STREAM as u16,
            symbols_size,
            lines_size,
            segment: 1,
            offset: 0x100,
            size: 0x40,
            name: "f.obj".into(),
        }],
        GLOBALS_STREAM as u16,
    );
    let data = ContainerBuilder::new(&[Vec::new(), Vec::new()])
        .stream_at(quarry_msf::raw::STREAM_DBI, dbi)
        .stream_at(GLOBALS_STREAM, Vec::new())
        .stream_at(MODULE_STREAM, module)
        .build();

    let msf = quarry_msf::Msf::parse(&data).unwrap();
    let dbi = DebugInformation::parse(&msf).unwrap();
    let parser = SymbolParser::new(SectionTable::new(vec![0x1000]), None, None);
    let mut graph = SymbolGraph::new();
    parser.parse_all(&dbi, &mut graph).unwrap();

    let handle = graph.function_at(0x1100).unwrap();
    let function = graph.symbols.get(handle).as_function().unwrap();
    let locals: Vec<(&str, DataScope)> = function
        .locals
        .iter()
        .filter_map(|&h| graph.symbols.get(h).as_data())
        .map(|data| (data.name.as_str(), data.scope))
        .collect();
    assert_eq!(
        locals,
        vec![("kept", DataScope::Local), ("param", DataScope::Parameter)]
    );
}

#[test]
fn global_stream_preserves_same_name_order() {
    let globals = [
        sym_record(raw::S_PUB32, {
            let mut p = Vec::new();
            p.extend_from_slice(&0u32.to_le_bytes());
            p.extend_from_slice(&0x10u32.to_le_bytes());
            p.extend_from_slice(&1u16.to_le_bytes());
            p.extend_from_slice(b"shadowed\0");
            p
        }),
        sym_record(raw::S_UDT, {
            let mut p = Vec::new();
            p.extend_from_slice(&T_INT4.to_le_bytes());
            p.extend_from_slice(b"other\0");
            p
        }),
        sym_record(raw::S_PUB32, {
            let mut p = Vec::new();
            p.extend_from_slice(&0u32.to_le_bytes());
            p.extend_from_slice(&0x20u32.to_le_bytes());
            p.extend_from_slice(&1u16.to_le_bytes());
            p.extend_from_slice(b"shadowed\0");
            p
        }),
    ]
    .concat();

    let dbi = dbi_stream(&[], GLOBALS_STREAM as u16);
    let data = ContainerBuilder::new(&[Vec::new(), Vec::new()])
        .stream_at(quarry_msf::raw::STREAM_DBI, dbi)
        .stream_at(GLOBALS_STREAM, globals)
        .build();

    let msf = quarry_msf::Msf::parse(&data).unwrap();
    let dbi = DebugInformation::parse(&msf).unwrap();
    let globals = dbi.global_symbols().unwrap();
    assert_eq!(globals.len(), 3);

    let offsets: Vec<u32> = globals
        .find_all("shadowed")
        .map(|symbol| match symbol {
            GlobalSymbol::Public { offset, .. } => *offset,
            other => panic!("unexpected symbol {other:?}"),
        })
        .collect();
    // Both entries, in their original stream order.
    assert_eq!(offsets, vec![0x10, 0x20]);
}

#[test]
fn contributions_locate_compilands() {
    let fixture = Fixture::build();
    let msf = quarry_msf::Msf::parse(&fixture.data).unwrap();
    let dbi = DebugInformation::parse(&msf).unwrap();

    assert_eq!(dbi.compiland_for(1, 0x150).unwrap(), 0);
    assert_eq!(
        dbi.compiland_for(1, 0x999).unwrap_err().kind(),
        CodeViewErrorKind::NotFound
    );
    assert_eq!(
        dbi.compiland_for(2, 0x150).unwrap_err().kind(),
        CodeViewErrorKind::NotFound
    );
}
