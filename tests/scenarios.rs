// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Byte-level decode and encode scenarios over hand-assembled modules.

use proptest::prelude::*;
use proptest::strategy::Union;
use proptest::{collection, option, sample};

use weft::core_compat::alloc::Global;
use weft::decode::{Error, ErrorWithContext, RetainCustomSections, Unsupported};
use weft::module::{
    DataSegment, ElementItems, ElementMode, ElementSegment, Entity, ExportTarget, Function,
    FunctionBody, Global as GlobalEntity, ImportName, Memory, Table, Tag,
};
use weft::storage::ByteCursor;
use weft::types::{
    AtomicOpcode, BlockType, BulkOpcode, DataId, ElemId, Expression, FuncId, GlobalId, GlobalType,
    GlobalTypeMutability, Handle, Handler, Ieee32, Ieee64, Instruction, Limits, LocalId, MemArg,
    MemId, MemoryType, Opcode, RefType, SectionId, TableId, TableType, TagId, TypeId, ValType,
    VectorOpcode, VectorShape,
};
use weft::{EncodeOptions, ErrorKind, Module};

const HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

// () -> ()
const EMPTY_TYPE: (u8, &[u8]) = (1, &[0x01, 0x60, 0x00, 0x00]);
const ONE_FUNCTION: (u8, &[u8]) = (3, &[0x01, 0x00]);
const ONE_MEMORY: (u8, &[u8]) = (5, &[0x01, 0x00, 0x01]);

// Frames the given (ID, payload) pairs into a module. Payloads must be short
// enough for a one-byte length.
fn assemble(sections: &[(u8, &[u8])]) -> Vec<u8> {
    let mut bytes = HEADER.to_vec();
    for (id, payload) in sections {
        assert!(payload.len() < 0x80);
        bytes.push(*id);
        bytes.push(payload.len() as u8);
        bytes.extend_from_slice(payload);
    }
    bytes
}

fn try_decode(bytes: &[u8]) -> Result<Module<Global>, ErrorWithContext<ByteCursor<&[u8]>>> {
    Module::decode(ByteCursor::new(bytes), &mut RetainCustomSections {}, Global)
}

fn decode(bytes: &[u8]) -> Module<Global> {
    try_decode(bytes).unwrap()
}

fn encode(module: &Module<Global>) -> Vec<u8> {
    let bytes = module.encode(&EncodeOptions::new()).unwrap();
    assert_eq!(
        module.encoded_len(&EncodeOptions::new()).unwrap(),
        bytes.len()
    );
    bytes.to_vec()
}

fn alloc_vec<T>(items: Vec<T>) -> weft::core_compat::vec::Vec<T, Global> {
    let mut vec = weft::core_compat::vec::Vec::new_in(Global);
    vec.extend(items);
    vec
}

fn expression(instrs: Vec<Instruction<Global>>) -> Expression<Global> {
    let mut instrs: Vec<_> = instrs.into_iter().map(Some).collect();
    Expression::from_instructions(&mut instrs, Global).unwrap()
}

fn code(module: &Module<Global>, index: u32) -> &[Instruction<Global>] {
    let id = module.function_at(index).unwrap();
    &module.function(id).unwrap().body().unwrap().code
}

#[test]
fn constant_function() {
    let bytes = assemble(&[
        (1, &[0x01, 0x60, 0x00, 0x01, 0x7f]),
        ONE_FUNCTION,
        (10, &[0x01, 0x04, 0x00, 0x41, 0x2a, 0x0b]),
    ]);
    let module = decode(&bytes);
    assert!(matches!(
        code(&module, 0),
        [Instruction::I32Const(42), Instruction::End]
    ));
    assert_eq!(encode(&module), bytes);

    let section = module
        .encode_section(SectionId::Code, &EncodeOptions::new())
        .unwrap();
    assert_eq!(
        section.as_slice(),
        &[0x0a, 0x06, 0x01, 0x04, 0x00, 0x41, 0x2a, 0x0b]
    );
}

#[test]
fn exported_global() {
    let bytes = assemble(&[
        (6, &[0x01, 0x7f, 0x00, 0x41, 0x80, 0x80, 0x04, 0x0b]),
        (7, &[0x01, 0x07, b'm', b'e', b'm', b'B', b'a', b's', b'e', 0x03, 0x00]),
    ]);
    let mut module = decode(&bytes);
    assert_eq!(encode(&module), bytes);

    let global = module.global_at(0).unwrap();
    let Some(GlobalEntity::Defined { ty, init }) = module.global(global) else {
        panic!("expected a defined global");
    };
    assert_eq!(
        *ty,
        GlobalType {
            value: ValType::I32,
            mutability: GlobalTypeMutability::Const
        }
    );
    assert_eq!(init.const_offset(), Some(65536));

    let exports = module.exports();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].name, "memBase");
    assert_eq!(exports[0].target, ExportTarget::Global(global));
    assert_eq!(module.lookup_global("memBase", None), Some(global));

    assert_eq!(module.remove_exports_by_ref(ExportTarget::Global(global)), 1);
    assert!(module.exports().is_empty());
    assert!(module.global(global).is_some());
}

#[test]
fn shared_memory_import() {
    #[rustfmt::skip]
    let bytes = assemble(&[(2, &[
        0x01,
        0x03, b'e', b'n', b'v',
        0x06, b'm', b'e', b'm', b'o', b'r', b'y',
        0x02, 0x03, 0x10, 0x80, 0x02,
    ])]);
    let module = decode(&bytes);
    let memory = module.memory_at(0).unwrap();
    let Some(Memory::Imported { import, ty }) = module.memory(memory) else {
        panic!("expected an imported memory");
    };
    assert_eq!(import.module, "env");
    assert_eq!(import.field, "memory");
    assert_eq!(ty.limits.min, 16);
    assert_eq!(ty.limits.max, Some(256));
    assert!(ty.limits.shared);
    assert_eq!(module.lookup_memory("memory", Some("env")), Some(memory));
    assert_eq!(module.lookup_memory("memory", Some("other")), None);
    assert_eq!(encode(&module), bytes);
}

#[test]
fn non_canonical_input_is_canonicalized() {
    // i32.const 0 with a two-byte immediate, and two runs of one i32 local.
    let bytes = assemble(&[
        (1, &[0x01, 0x60, 0x00, 0x01, 0x7f]),
        ONE_FUNCTION,
        (10, &[0x01, 0x09, 0x02, 0x01, 0x7f, 0x01, 0x7f, 0x41, 0x80, 0x00, 0x0b]),
    ]);
    let module = decode(&bytes);
    let expected = assemble(&[
        (1, &[0x01, 0x60, 0x00, 0x01, 0x7f]),
        ONE_FUNCTION,
        (10, &[0x01, 0x06, 0x01, 0x02, 0x7f, 0x41, 0x00, 0x0b]),
    ]);
    assert_eq!(encode(&module), expected);

    let canonical = decode(&expected);
    assert!(matches!(
        code(&canonical, 0),
        [Instruction::I32Const(0), Instruction::End]
    ));
    assert_eq!(encode(&canonical), expected);
}

#[test]
fn nested_block() {
    let bytes = assemble(&[
        EMPTY_TYPE,
        ONE_FUNCTION,
        (10, &[0x01, 0x06, 0x00, 0x02, 0x40, 0x01, 0x0b, 0x0b]),
    ]);
    let module = decode(&bytes);
    let [Instruction::Block { ty, body }, Instruction::End] = code(&module, 0) else {
        panic!("expected a block and an end");
    };
    assert_eq!(*ty, BlockType::Empty);
    assert_eq!(body.len(), 1);
    assert!(matches!(body[0], Instruction::Plain(Opcode::Nop)));
    assert_eq!(encode(&module), bytes);
}

#[test]
fn memory_copy() {
    let bytes = assemble(&[
        EMPTY_TYPE,
        ONE_FUNCTION,
        ONE_MEMORY,
        (10, &[0x01, 0x06, 0x00, 0xfc, 0x0a, 0x00, 0x00, 0x0b]),
    ]);
    let module = decode(&bytes);
    let memory = module.memory_at(0).unwrap();
    let instrs = code(&module, 0);
    assert!(matches!(
        instrs[0],
        Instruction::MemoryCopy { dst, src } if dst == memory && src == memory
    ));
    assert_eq!(instrs[0].opcode_key(), (0xfc << 8) | 10);
    let options = EncodeOptions::new();
    assert_eq!(module.instruction_len(&instrs[..1], &options).unwrap(), 4);
    assert_eq!(
        module
            .encode_instructions(&instrs[..1], &options)
            .unwrap()
            .as_slice(),
        &[0xfc, 0x0a, 0x00, 0x00]
    );
    let padded = EncodeOptions::new().padded_indices(true);
    assert_eq!(module.instruction_len(&instrs[..1], &padded).unwrap(), 12);
    assert_eq!(encode(&module), bytes);
}

#[test]
fn all_element_segment_forms() {
    #[rustfmt::skip]
    let elements: &[u8] = &[
        0x08,
        0x00, 0x41, 0x00, 0x0b, 0x01, 0x00,
        0x01, 0x00, 0x01, 0x00,
        0x02, 0x00, 0x41, 0x00, 0x0b, 0x00, 0x01, 0x00,
        0x03, 0x00, 0x01, 0x00,
        0x04, 0x41, 0x00, 0x0b, 0x01, 0xd2, 0x00, 0x0b,
        0x05, 0x70, 0x01, 0xd2, 0x00, 0x0b,
        0x06, 0x00, 0x41, 0x00, 0x0b, 0x70, 0x01, 0xd2, 0x00, 0x0b,
        0x07, 0x70, 0x01, 0xd0, 0x70, 0x0b,
    ];
    let bytes = assemble(&[
        EMPTY_TYPE,
        ONE_FUNCTION,
        (4, &[0x01, 0x70, 0x00, 0x01]),
        (9, elements),
        (10, &[0x01, 0x02, 0x00, 0x0b]),
    ]);
    let module = decode(&bytes);
    let func = module.function_at(0).unwrap();
    let segments: Vec<_> = module.elements().map(|(_, segment)| segment).collect();
    assert_eq!(segments.len(), 8);
    assert!(matches!(segments[0].mode, ElementMode::Active { .. }));
    assert!(matches!(segments[1].mode, ElementMode::Passive));
    assert!(segments[2].explicit_table);
    assert!(matches!(segments[3].mode, ElementMode::Declarative));
    match &segments[0].items {
        ElementItems::Functions(funcs) => assert_eq!(funcs.as_slice(), &[func]),
        ElementItems::Expressions { .. } => panic!("expected function indices"),
    }
    match &segments[7].items {
        ElementItems::Expressions { ty, exprs } => {
            assert_eq!(*ty, RefType::Func);
            assert!(matches!(
                exprs[0].as_slice(),
                [Instruction::RefNull(RefType::Func), Instruction::End]
            ));
        }
        ElementItems::Functions(_) => panic!("expected expressions"),
    }
    assert_eq!(encode(&module), bytes);
}

#[test]
fn exception_handling() {
    #[rustfmt::skip]
    let body: &[u8] = &[
        0x00,
        0x06, 0x40, 0x08, 0x00, 0x07, 0x00, 0x19, 0x0b,
        0x06, 0x40, 0x01, 0x18, 0x00,
        0x0b,
    ];
    let mut code_section = vec![0x01, body.len() as u8];
    code_section.extend_from_slice(body);
    let bytes = assemble(&[
        EMPTY_TYPE,
        ONE_FUNCTION,
        (13, &[0x01, 0x00, 0x00]),
        (10, code_section.as_slice()),
    ]);
    let module = decode(&bytes);
    let tag = module.tag_at(0).unwrap();
    let instrs = code(&module, 0);
    let Instruction::Try {
        body,
        handlers,
        delegate: None,
        ..
    } = &instrs[0]
    else {
        panic!("expected a try block closed by end");
    };
    assert!(matches!(body[..], [Instruction::Throw(thrown)] if thrown == tag));
    assert_eq!(handlers.len(), 2);
    assert_eq!(handlers[0].tag, Some(tag));
    assert_eq!(handlers[1].tag, None);
    assert!(matches!(
        instrs[1],
        Instruction::Try {
            delegate: Some(0),
            ..
        }
    ));
    assert_eq!(encode(&module), bytes);
}

#[test]
fn custom_sections_stay_in_place() {
    let bytes = assemble(&[
        (0, &[0x04, b'f', b'i', b'r', b's', b't']),
        EMPTY_TYPE,
        (0, &[0x04, b's', b'k', b'i', b'p', 0xaa]),
        ONE_FUNCTION,
        (10, &[0x01, 0x02, 0x00, 0x0b]),
    ]);
    let module = decode(&bytes);
    assert_eq!(module.customs.len(), 2);
    assert_eq!(module.customs[1].placement, Some(SectionId::Type));
    assert_eq!(encode(&module), bytes);

    let skip = ["skip"];
    let options = EncodeOptions::new().exclude_custom_sections(&skip);
    let expected = assemble(&[
        (0, &[0x04, b'f', b'i', b'r', b's', b't']),
        EMPTY_TYPE,
        ONE_FUNCTION,
        (10, &[0x01, 0x02, 0x00, 0x0b]),
    ]);
    assert_eq!(module.encode(&options).unwrap().as_slice(), expected.as_slice());
}

#[test]
fn data_count_and_forward_references() {
    #[rustfmt::skip]
    let code_section: &[u8] = &[
        0x01, 0x0c, 0x00,
        0x41, 0x00, 0x41, 0x00, 0x41, 0x00, 0xfc, 0x08, 0x00, 0x00,
        0x0b,
    ];
    let bytes = assemble(&[
        EMPTY_TYPE,
        ONE_FUNCTION,
        ONE_MEMORY,
        (12, &[0x01]),
        (10, code_section),
        (11, &[0x01, 0x00, 0x41, 0x00, 0x0b, 0x01, 0xaa]),
    ]);
    let module = decode(&bytes);
    assert!(module.data_count);
    let data = module.data_at(0).unwrap();
    assert!(matches!(
        code(&module, 0)[3],
        Instruction::MemoryInit { data: init, .. } if init == data
    ));
    assert_eq!(module.data_segment(data).unwrap().bytes.as_slice(), &[0xaa]);
    assert_eq!(encode(&module), bytes);

    // An excluded data section leaves an empty one behind, and the data
    // count follows it.
    let options = EncodeOptions::new().exclude(SectionId::Data);
    assert!(options.is_excluded(SectionId::Data));
    assert_eq!(
        module
            .encode_section(SectionId::DataCount, &options)
            .unwrap()
            .as_slice(),
        &[0x0c, 0x01, 0x00]
    );
    assert_eq!(
        module
            .encode_section(SectionId::Data, &options)
            .unwrap()
            .as_slice(),
        &[0x0b, 0x01, 0x00]
    );

    // Other excluded sections are left out.
    let options = EncodeOptions::new().exclude(SectionId::Code);
    assert!(
        module
            .encode_section(SectionId::Code, &options)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn excluded_data_section_decodes_again() {
    let bytes = assemble(&[
        ONE_MEMORY,
        (12, &[0x01]),
        (11, &[0x01, 0x00, 0x41, 0x00, 0x0b, 0x01, 0xaa]),
    ]);
    let module = decode(&bytes);
    let options = EncodeOptions::new().exclude(SectionId::Data);
    let encoded = module.encode(&options).unwrap();
    let expected = assemble(&[ONE_MEMORY, (12, &[0x00]), (11, &[0x00])]);
    assert_eq!(encoded.as_slice(), expected.as_slice());

    let decoded = decode(encoded.as_slice());
    assert!(decoded.data_count);
    assert_eq!(decoded.data_segments().count(), 0);
    assert!(decoded.memory_at(0).is_some());
}

#[test]
fn data_count_mismatch() {
    let bytes = assemble(&[
        ONE_MEMORY,
        (12, &[0x02]),
        (11, &[0x01, 0x00, 0x41, 0x00, 0x0b, 0x00]),
    ]);
    let err = try_decode(&bytes).unwrap_err();
    assert!(matches!(
        err.error,
        Error::DataCountMismatch {
            expected: 2,
            actual: 1
        }
    ));
}

#[test]
fn passive_data_is_unsupported() {
    let bytes = assemble(&[ONE_MEMORY, (11, &[0x01, 0x01, 0x01, 0xaa])]);
    let err = try_decode(&bytes).unwrap_err();
    assert!(matches!(
        err.error,
        Error::Unsupported(Unsupported::DataSegmentMode(1))
    ));
    assert_eq!(err.error.kind(), ErrorKind::Unsupported);
}

#[test]
fn malformed_modules() {
    let err = try_decode(&[0x00, 0x61, 0x73, 0x6e, 0x01, 0x00, 0x00, 0x00]).unwrap_err();
    assert!(matches!(err.error, Error::InvalidMagic(_)));

    let bytes = assemble(&[ONE_MEMORY, EMPTY_TYPE]);
    let err = try_decode(&bytes).unwrap_err();
    assert!(matches!(
        err.error,
        Error::OutOfOrderSection {
            before: SectionId::Memory,
            after: SectionId::Type
        }
    ));

    let bytes = assemble(&[EMPTY_TYPE, (1, &[0x00])]);
    let err = try_decode(&bytes).unwrap_err();
    assert!(matches!(err.error, Error::DuplicateSection(SectionId::Type)));

    // A type index with no type.
    let bytes = assemble(&[ONE_FUNCTION]);
    let err = try_decode(&bytes).unwrap_err();
    assert_eq!(err.error.kind(), ErrorKind::Reference);

    // A body that runs past its declared size.
    let bytes = assemble(&[
        EMPTY_TYPE,
        ONE_FUNCTION,
        (10, &[0x01, 0x02, 0x00, 0x01, 0x0b]),
    ]);
    assert!(try_decode(&bytes).is_err());
}

#[test]
fn dangling_handle_fails_encode() {
    let mut module = Module::new_in(Global);
    let ty = module.get_or_create_type(&[], &[]).unwrap();
    let mut instrs = [Some(Instruction::Call(FuncId::from_raw(7)))];
    let code = Expression::from_instructions(&mut instrs, Global).unwrap();
    module
        .add_function(Function::Defined(FunctionBody {
            ty,
            locals: weft::core_compat::vec::Vec::new_in(Global),
            code,
        }))
        .unwrap();
    let err = module.encode(&EncodeOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reference);
}

fn importing_module(field: u8) -> Vec<u8> {
    assemble(&[
        EMPTY_TYPE,
        (2, &[0x01, 0x03, b'e', b'n', b'v', 0x01, field, 0x00, 0x00]),
        ONE_FUNCTION,
        (10, &[0x01, 0x04, 0x00, 0x10, 0x00, 0x0b]),
    ])
}

#[test]
fn merge_keeps_imports_first_and_references_intact() {
    let mut module = decode(&importing_module(b'f'));
    module.merge(decode(&importing_module(b'g'))).unwrap();

    let imported: Vec<bool> = module
        .functions()
        .map(|(_, func)| func.is_imported())
        .collect();
    assert_eq!(imported, [true, true, false, false]);
    assert_eq!(module.types().count(), 1);

    let merged = decode(&encode(&module));
    let g = merged.function_at(1).unwrap();
    let Some(Function::Imported { import, .. }) = merged.function(g) else {
        panic!("expected an import");
    };
    assert_eq!(import.field, "g");
    assert!(matches!(
        code(&merged, 3),
        [Instruction::Call(callee), Instruction::End] if *callee == g
    ));
    assert!(matches!(
        code(&merged, 2),
        [Instruction::Call(callee), Instruction::End] if *callee == merged.function_at(0).unwrap()
    ));
}

#[test]
fn merge_moves_every_kind_of_entity() {
    let i32_const = GlobalType {
        value: ValType::I32,
        mutability: GlobalTypeMutability::Const,
    };
    let table_type = TableType {
        reftype: RefType::Func,
        limits: Limits::new(1, None),
    };
    let defined = |ty| {
        Function::Defined(FunctionBody {
            ty,
            locals: alloc_vec(vec![]),
            code: expression(vec![]),
        })
    };

    let mut module = Module::new_in(Global);
    let empty = module.get_or_create_type(&[], &[]).unwrap();
    let f = module.add_function(defined(empty)).unwrap();
    module
        .add_global(GlobalEntity::Defined {
            ty: i32_const,
            init: expression(vec![Instruction::I32Const(1)]),
        })
        .unwrap();
    module.add_table(Table::Defined(table_type)).unwrap();
    module.add_tag(Tag::Defined(empty)).unwrap();
    module
        .add_element(ElementSegment {
            mode: ElementMode::Passive,
            items: ElementItems::Functions(alloc_vec(vec![f])),
            explicit_table: false,
        })
        .unwrap();

    let mut other = Module::new_in(Global);
    let empty = other.get_or_create_type(&[], &[]).unwrap();
    let param = other.get_or_create_type(&[ValType::I32], &[]).unwrap();
    let base = other
        .add_global(GlobalEntity::Imported {
            import: ImportName::new_in("env", "base", Global).unwrap(),
            ty: i32_const,
        })
        .unwrap();
    let derived = other
        .add_global(GlobalEntity::Defined {
            ty: i32_const,
            init: expression(vec![Instruction::GlobalGet(base)]),
        })
        .unwrap();
    let table = other.add_table(Table::Defined(table_type)).unwrap();
    let memory = other
        .add_memory(Memory::Defined(MemoryType {
            limits: Limits::new(1, None),
        }))
        .unwrap();
    let tag = other.add_tag(Tag::Defined(param)).unwrap();
    let data = other
        .add_data(DataSegment {
            offset: expression(vec![Instruction::GlobalGet(base)]),
            bytes: alloc_vec(b"hi".to_vec()),
        })
        .unwrap();
    let run = other.add_function(defined(empty)).unwrap();
    let elem = other
        .add_element(ElementSegment {
            mode: ElementMode::Active {
                table,
                offset: expression(vec![Instruction::GlobalGet(base)]),
            },
            items: ElementItems::Functions(alloc_vec(vec![run])),
            explicit_table: false,
        })
        .unwrap();
    let Some(Function::Defined(body)) = other.function_mut(run) else {
        panic!("expected a defined function");
    };
    body.code = expression(vec![
        Instruction::Throw(tag),
        Instruction::GlobalGet(derived),
        Instruction::MemorySize(memory),
        Instruction::TableSize(table),
        Instruction::DataDrop(data),
        Instruction::ElemDrop(elem),
    ]);
    other.data_count = true;
    other
        .add_export("memory", ExportTarget::Memory(memory))
        .unwrap();
    other.add_export("run", ExportTarget::Function(run)).unwrap();

    module.merge(other).unwrap();
    assert_eq!(module.types().count(), 2);

    // Indices in the re-decoded module follow the merged order: imports
    // first, then this module's entities, then the other's.
    let merged = decode(&encode(&module));
    let base = merged.global_at(0).unwrap();
    assert!(merged.global(base).unwrap().is_imported());
    let derived = merged.global_at(2).unwrap();
    let Some(GlobalEntity::Defined { init, .. }) = merged.global(derived) else {
        panic!("expected a defined global");
    };
    assert!(matches!(&init[..], [Instruction::GlobalGet(g), Instruction::End] if *g == base));

    let table = merged.table_at(1).unwrap();
    let memory = merged.memory_at(0).unwrap();
    let run = merged.function_at(1).unwrap();
    let elem = merged.element_at(1).unwrap();
    let segment = merged.element(elem).unwrap();
    let ElementMode::Active {
        table: target,
        offset,
    } = &segment.mode
    else {
        panic!("expected an active segment");
    };
    assert_eq!(*target, table);
    assert!(matches!(&offset[..], [Instruction::GlobalGet(g), Instruction::End] if *g == base));
    assert!(matches!(&segment.items, ElementItems::Functions(funcs) if funcs[..] == [run]));

    let data = merged.data_at(0).unwrap();
    let segment = merged.data_segment(data).unwrap();
    assert_eq!(segment.bytes.as_slice(), b"hi");
    assert!(matches!(
        &segment.offset[..],
        [Instruction::GlobalGet(g), Instruction::End] if *g == base
    ));

    let tag = merged.tag_at(1).unwrap();
    let ty = merged.tag(tag).unwrap().ty();
    assert_eq!(merged.ty(ty).unwrap().parameters.as_slice(), &[ValType::I32]);

    assert!(matches!(
        code(&merged, 1),
        [
            Instruction::Throw(t),
            Instruction::GlobalGet(g),
            Instruction::MemorySize(m),
            Instruction::TableSize(tb),
            Instruction::DataDrop(d),
            Instruction::ElemDrop(e),
            Instruction::End,
        ] if *t == tag && *g == derived && *m == memory && *tb == table && *d == data && *e == elem
    ));
    assert_eq!(
        merged.export("memory").unwrap().target,
        ExportTarget::Memory(memory)
    );
    assert_eq!(merged.export("run").unwrap().target, ExportTarget::Function(run));
}

#[test]
fn replaced_function_is_redirected() {
    let mut module = decode(&importing_module(b'f'));
    let import = module.function_at(0).unwrap();
    let defined = module.function_at(1).unwrap();
    module
        .add_export("run", ExportTarget::Function(import))
        .unwrap();
    module.replace_function(import, defined).unwrap();

    assert!(module.function(import).is_none());
    assert_eq!(module.export("run").unwrap().target, ExportTarget::Function(defined));
    assert!(matches!(
        code(&module, 0),
        [Instruction::Call(callee), Instruction::End] if *callee == defined
    ));
    assert_eq!(module.function_index(defined), Ok(0));
}

#[test]
fn memory_image_overlay() {
    let mut module = Module::new_in(Global);
    let mut add = |offset: i32, bytes: &[u8]| {
        let mut instrs = [Some(Instruction::I32Const(offset))];
        let offset = Expression::from_instructions(&mut instrs, Global).unwrap();
        let mut data = weft::core_compat::vec::Vec::new_in(Global);
        data.extend_from_slice(bytes);
        module
            .add_data(DataSegment {
                offset,
                bytes: data,
            })
            .unwrap()
    };
    let first = add(0, b"abcd");
    let second = add(2, b"XY");

    let mut image = module.memory_image().unwrap();
    assert_eq!(image.bytes(), b"abXY");
    assert_eq!(image.view(first).unwrap(), b"abXY");
    image.view_mut(second).unwrap().copy_from_slice(b"ZZ");
    assert_eq!(image.view(first).unwrap(), b"abZZ");
    image.commit();

    assert_eq!(module.data_segment(first).unwrap().bytes.as_slice(), b"abZZ");
    assert_eq!(module.data_segment(second).unwrap().bytes.as_slice(), b"ZZ");
}

// Entities for generated instructions to refer to.
#[derive(Clone, Copy, Debug)]
struct Targets {
    func: FuncId,
    ty: TypeId,
    multi_value: TypeId,
    table: TableId,
    memory: MemId,
    global: GlobalId,
    tag: TagId,
    elem: ElemId,
    data: DataId,
}

// A module with an entity of every kind. Function 0 declares two locals.
fn targets_module() -> (Module<Global>, Targets) {
    let mut module = Module::new_in(Global);
    let ty = module.get_or_create_type(&[], &[]).unwrap();
    let multi_value = module
        .get_or_create_type(&[ValType::I32], &[ValType::I32, ValType::I64])
        .unwrap();
    let func = module
        .add_function(Function::Defined(FunctionBody {
            ty,
            locals: alloc_vec(vec![ValType::I32, ValType::I64]),
            code: expression(vec![]),
        }))
        .unwrap();
    let table = module
        .add_table(Table::Defined(TableType {
            reftype: RefType::Func,
            limits: Limits::new(1, None),
        }))
        .unwrap();
    let memory = module
        .add_memory(Memory::Defined(MemoryType {
            limits: Limits::new(1, None),
        }))
        .unwrap();
    let global = module
        .add_global(GlobalEntity::Defined {
            ty: GlobalType {
                value: ValType::I32,
                mutability: GlobalTypeMutability::Var,
            },
            init: expression(vec![Instruction::I32Const(0)]),
        })
        .unwrap();
    let tag = module.add_tag(Tag::Defined(ty)).unwrap();
    let elem = module
        .add_element(ElementSegment {
            mode: ElementMode::Passive,
            items: ElementItems::Functions(alloc_vec(vec![func])),
            explicit_table: false,
        })
        .unwrap();
    let data = module
        .add_data(DataSegment {
            offset: expression(vec![Instruction::I32Const(0)]),
            bytes: alloc_vec(vec![0xaa]),
        })
        .unwrap();
    module.data_count = true;
    let targets = Targets {
        func,
        ty,
        multi_value,
        table,
        memory,
        global,
        tag,
        elem,
        data,
    };
    (module, targets)
}

fn mem_arg() -> impl Strategy<Value = MemArg> {
    (any::<u32>(), any::<u32>()).prop_map(|(align, offset)| MemArg { align, offset })
}

fn value_type() -> impl Strategy<Value = ValType> {
    sample::select(vec![
        ValType::I32,
        ValType::I64,
        ValType::F32,
        ValType::F64,
        ValType::V128,
    ])
}

fn block_type(targets: Targets) -> impl Strategy<Value = BlockType> {
    prop_oneof![
        Just(BlockType::Empty),
        value_type().prop_map(BlockType::Value),
        Just(BlockType::Type(targets.ty)),
        Just(BlockType::Type(targets.multi_value)),
    ]
}

fn vector_opcodes(shape: VectorShape) -> Vec<VectorOpcode> {
    (0..=u32::from(u8::MAX))
        .filter_map(|value| VectorOpcode::try_from(value).ok())
        .filter(|op| op.shape() == shape)
        .collect()
}

// Every instruction shape that opens no scope.
fn leaf_instruction(t: Targets) -> BoxedStrategy<Instruction<Global>> {
    let opcodes: Vec<Opcode> = (0..=u8::MAX)
        .filter_map(|byte| Opcode::try_from(byte).ok())
        .collect();
    let plain: Vec<Opcode> = opcodes.iter().copied().filter(|op| op.is_plain()).collect();
    let memory: Vec<Opcode> = opcodes
        .iter()
        .copied()
        .filter(|op| op.is_memory_access())
        .collect();
    let trunc_sat: Vec<BulkOpcode> = (0..8u32)
        .filter_map(|value| BulkOpcode::try_from(value).ok())
        .collect();
    let atomic: Vec<AtomicOpcode> = (0..=u32::from(u8::MAX))
        .filter_map(|value| AtomicOpcode::try_from(value).ok())
        .filter(|op| *op != AtomicOpcode::AtomicFence)
        .collect();
    let local = (0..2u32).prop_map(LocalId::new);

    Union::new(vec![
        sample::select(plain).prop_map(Instruction::Plain).boxed(),
        (sample::select(memory), mem_arg())
            .prop_map(|(op, arg)| Instruction::Memory { op, arg })
            .boxed(),
        any::<u32>().prop_map(Instruction::Br).boxed(),
        any::<u32>().prop_map(Instruction::BrIf).boxed(),
        (collection::vec(any::<u32>(), 0..4), any::<u32>())
            .prop_map(|(labels, default)| Instruction::BrTable {
                labels: alloc_vec(labels),
                default,
            })
            .boxed(),
        Just(Instruction::Call(t.func)).boxed(),
        Just(Instruction::ReturnCall(t.func)).boxed(),
        Just(Instruction::RefFunc(t.func)).boxed(),
        Just(Instruction::CallIndirect {
            ty: t.ty,
            table: t.table,
        })
        .boxed(),
        Just(Instruction::ReturnCallIndirect {
            ty: t.multi_value,
            table: t.table,
        })
        .boxed(),
        Just(Instruction::Throw(t.tag)).boxed(),
        any::<u32>().prop_map(Instruction::Rethrow).boxed(),
        prop_oneof![Just(RefType::Func), Just(RefType::Extern)]
            .prop_map(Instruction::RefNull)
            .boxed(),
        collection::vec(value_type(), 0..3)
            .prop_map(|types| Instruction::SelectT(alloc_vec(types)))
            .boxed(),
        local.clone().prop_map(Instruction::LocalGet).boxed(),
        local.clone().prop_map(Instruction::LocalSet).boxed(),
        local.prop_map(Instruction::LocalTee).boxed(),
        Just(Instruction::GlobalGet(t.global)).boxed(),
        Just(Instruction::GlobalSet(t.global)).boxed(),
        Just(Instruction::TableGet(t.table)).boxed(),
        Just(Instruction::TableSet(t.table)).boxed(),
        Just(Instruction::MemorySize(t.memory)).boxed(),
        Just(Instruction::MemoryGrow(t.memory)).boxed(),
        any::<i32>().prop_map(Instruction::I32Const).boxed(),
        any::<i64>().prop_map(Instruction::I64Const).boxed(),
        any::<u32>()
            .prop_map(|bits| Instruction::F32Const(Ieee32(bits)))
            .boxed(),
        any::<u64>()
            .prop_map(|bits| Instruction::F64Const(Ieee64(bits)))
            .boxed(),
        sample::select(trunc_sat)
            .prop_map(Instruction::TruncSat)
            .boxed(),
        Just(Instruction::MemoryInit {
            data: t.data,
            memory: t.memory,
        })
        .boxed(),
        Just(Instruction::DataDrop(t.data)).boxed(),
        Just(Instruction::MemoryCopy {
            dst: t.memory,
            src: t.memory,
        })
        .boxed(),
        Just(Instruction::MemoryFill(t.memory)).boxed(),
        Just(Instruction::TableInit {
            elem: t.elem,
            table: t.table,
        })
        .boxed(),
        Just(Instruction::ElemDrop(t.elem)).boxed(),
        Just(Instruction::TableCopy {
            dst: t.table,
            src: t.table,
        })
        .boxed(),
        Just(Instruction::TableGrow(t.table)).boxed(),
        Just(Instruction::TableSize(t.table)).boxed(),
        Just(Instruction::TableFill(t.table)).boxed(),
        sample::select(vector_opcodes(VectorShape::None))
            .prop_map(Instruction::Vector)
            .boxed(),
        (sample::select(vector_opcodes(VectorShape::MemArg)), mem_arg())
            .prop_map(|(op, arg)| Instruction::VectorMemory { op, arg })
            .boxed(),
        (
            sample::select(vector_opcodes(VectorShape::MemArgLane)),
            mem_arg(),
            any::<u8>(),
        )
            .prop_map(|(op, arg, lane)| Instruction::VectorMemoryLane { op, arg, lane })
            .boxed(),
        (sample::select(vector_opcodes(VectorShape::Lane)), any::<u8>())
            .prop_map(|(op, lane)| Instruction::VectorLane { op, lane })
            .boxed(),
        (
            sample::select(vector_opcodes(VectorShape::Bytes16)),
            any::<[u8; 16]>(),
        )
            .prop_map(|(op, bytes)| Instruction::VectorBytes { op, bytes })
            .boxed(),
        Just(Instruction::AtomicFence).boxed(),
        (sample::select(atomic), mem_arg())
            .prop_map(|(op, arg)| Instruction::Atomic { op, arg })
            .boxed(),
    ])
    .boxed()
}

// Instruction trees nested up to three deep. A `try` has either handlers,
// with `catch_all` last, or a `delegate`.
fn instruction(t: Targets) -> impl Strategy<Value = Instruction<Global>> {
    leaf_instruction(t).prop_recursive(3, 48, 4, move |inner| {
        let body = move || collection::vec(inner.clone(), 0..4).prop_map(alloc_vec);
        prop_oneof![
            (block_type(t), body()).prop_map(|(ty, body)| Instruction::Block { ty, body }),
            (block_type(t), body()).prop_map(|(ty, body)| Instruction::Loop { ty, body }),
            (block_type(t), body(), option::of(body())).prop_map(|(ty, then, otherwise)| {
                Instruction::If {
                    ty,
                    then,
                    otherwise,
                }
            }),
            (
                block_type(t),
                body(),
                collection::vec(body(), 0..3),
                option::of(body()),
                option::of(any::<u32>()),
            )
                .prop_map(move |(ty, body, catches, catch_all, label)| {
                    let mut handlers = weft::core_compat::vec::Vec::new_in(Global);
                    handlers.extend(catches.into_iter().map(|body| Handler {
                        tag: Some(t.tag),
                        body,
                    }));
                    handlers.extend(catch_all.map(|body| Handler { tag: None, body }));
                    let delegate = if handlers.is_empty() { label } else { None };
                    Instruction::Try {
                        ty,
                        body,
                        handlers,
                        delegate,
                    }
                }),
        ]
    })
}

fn instructions() -> impl Strategy<Value = Vec<Instruction<Global>>> {
    let (_, targets) = targets_module();
    collection::vec(instruction(targets), 0..8)
}

proptest! {
    #[test]
    fn instruction_length_agrees_with_encoding(instrs in instructions(), padded in any::<bool>()) {
        let (module, _) = targets_module();
        let options = EncodeOptions::new().padded_indices(padded);
        let len = module.instruction_len(&instrs, &options).unwrap();
        let bytes = module.encode_instructions(&instrs, &options).unwrap();
        prop_assert_eq!(len, bytes.len());
    }

    #[test]
    fn instructions_round_trip(instrs in instructions(), padded in any::<bool>()) {
        let (mut module, targets) = targets_module();
        let Some(Function::Defined(body)) = module.function_mut(targets.func) else {
            unreachable!("function 0 is defined");
        };
        body.code = expression(instrs);

        let options = EncodeOptions::new().padded_indices(padded);
        let bytes = module.encode(&options).unwrap();
        prop_assert_eq!(module.encoded_len(&options).unwrap(), bytes.len());

        // Padded indices decode to the same entities.
        let decoded = decode(bytes.as_slice());
        let canonical = EncodeOptions::new();
        let decoded_instrs = decoded.encode_instructions(code(&decoded, 0), &canonical).unwrap();
        let module_instrs = module.encode_instructions(code(&module, 0), &canonical).unwrap();
        prop_assert_eq!(decoded_instrs.as_slice(), module_instrs.as_slice());
        if !padded {
            prop_assert_eq!(encode(&decoded), bytes.to_vec());
        }
    }

    #[test]
    fn globals_round_trip(value in any::<i32>(), mutable in any::<bool>()) {
        let mut module = Module::new_in(Global);
        let mut instrs = [Some(Instruction::I32Const(value))];
        let init = Expression::from_instructions(&mut instrs, Global).unwrap();
        let mutability = if mutable {
            GlobalTypeMutability::Var
        } else {
            GlobalTypeMutability::Const
        };
        module
            .add_global(GlobalEntity::Defined {
                ty: GlobalType { value: ValType::I32, mutability },
                init,
            })
            .unwrap();
        let bytes = encode(&module);
        let decoded = decode(&bytes);
        prop_assert_eq!(encode(&decoded), bytes);
        let global = decoded.global_at(0).unwrap();
        prop_assert_eq!(decoded.global(global).unwrap().ty().mutability, mutability);
    }
}
