// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Decoding of the standard sections into a module.

use log::{trace, warn};
use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::module::{
    DataSegment, ElementItems, ElementMode, ElementSegment, Export, ExportTarget, Function,
    FunctionBody, Global, ImportName, Memory, Module, Table, Tag,
};
use crate::storage::Stream;
use crate::types::{
    Expression, ExternalKind, FuncId, FunctionType, IndexSpace, Name, RefType, ReferenceError,
    SectionId, TableId, TagAttribute, ValType,
};

use super::expr::decode_expression;
use super::{BoundedDecodable, ContextId, ContextStack, Contextual, Decoder, Error, Unsupported};

/// Maximum number of local variables per function. It serves to give a
/// reasonable static upper bound, as the format only gives an upper bound of
/// 2^32 - 1 (unrealistically large) and we need to allocate space for locals
/// upfront.
const MAX_LOCALS_PER_FUNCTION: usize = 50_000;

#[derive(Copy, Clone, Debug, TryFromPrimitive)]
#[repr(u32)]
enum ElementSegmentToken {
    ActiveElemIndices = 0,
    PassiveElemIndices = 1,
    ActiveTableIndexElemIndices = 2,
    DeclarativeElemIndices = 3,
    ActiveElemExprs = 4,
    PassiveElemExprs = 5,
    ActiveTableIndexElemExprs = 6,
    DeclarativeElemExprs = 7,
}

#[derive(Copy, Clone, Debug, TryFromPrimitive)]
#[repr(u8)]
enum ElementKind {
    FuncRef = 0x00,
}

#[derive(Copy, Clone, Debug, TryFromPrimitive)]
#[repr(u32)]
enum DataSegmentToken {
    ActiveNoMemIdx = 0,
    Passive = 1,
    ActiveWithMemIdx = 2,
}

impl Contextual for ElementSegmentToken {
    const ID: ContextId = ContextId::ElemToken;
}

impl Contextual for ElementKind {
    const ID: ContextId = ContextId::ElemKind;
}

impl Contextual for DataSegmentToken {
    const ID: ContextId = ContextId::DataToken;
}

impl BoundedDecodable for ElementSegmentToken {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let val: u32 = decoder.read_leb128_raw()?;
        Self::try_from(val).map_err(|_| Error::InvalidElementToken(val))
    }
}

impl BoundedDecodable for ElementKind {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let byte = decoder.read_byte_raw()?;
        Self::try_from(byte).map_err(|_| Error::InvalidToken(byte))
    }
}

impl BoundedDecodable for DataSegmentToken {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let val: u32 = decoder.read_leb128_raw()?;
        Self::try_from(val).map_err(|_| Error::InvalidDataToken(val))
    }
}

// Cross-section bookkeeping for a module being decoded.
pub(super) struct SectionState<A: Allocator> {
    // The defined functions declared by the function section, awaiting their
    // bodies from the code section.
    pending: Vec<FuncId, A>,
    // The segment count given by the data count section.
    data_count: Option<u32>,
    saw_code: bool,
    saw_data: bool,
}

impl<A: Allocator> SectionState<A> {
    pub(super) fn new_in(alloc: A) -> Self {
        Self {
            pending: Vec::new_in(alloc),
            data_count: None,
            saw_code: false,
            saw_data: false,
        }
    }

    pub(super) fn decode_section<Storage: Stream>(
        &mut self,
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        module: &mut Module<A>,
        id: SectionId,
    ) -> Result<(), Error<Storage>> {
        let context_id = match id {
            SectionId::Custom => ContextId::CustomSec,
            SectionId::Type => ContextId::TypeSec,
            SectionId::Import => ContextId::ImportSec,
            SectionId::Function => ContextId::FuncSec,
            SectionId::Table => ContextId::TableSec,
            SectionId::Memory => ContextId::MemorySec,
            SectionId::Tag => ContextId::TagSec,
            SectionId::Global => ContextId::GlobalSec,
            SectionId::Export => ContextId::ExportSec,
            SectionId::Start => ContextId::StartSec,
            SectionId::Element => ContextId::ElemSec,
            SectionId::DataCount => ContextId::DataCountSec,
            SectionId::Code => ContextId::CodeSec,
            SectionId::Data => ContextId::DataSec,
        };
        decoder.with_context(context, context_id, |decoder, context| match id {
            // Custom sections are handled by the caller.
            SectionId::Custom => Ok(()),
            SectionId::Type => decode_types(decoder, context, module),
            SectionId::Import => decode_imports(decoder, context, module),
            SectionId::Function => self.decode_functions(decoder, context, module),
            SectionId::Table => decode_tables(decoder, context, module),
            SectionId::Memory => decode_memories(decoder, context, module),
            SectionId::Tag => decode_tags(decoder, context, module),
            SectionId::Global => decode_globals(decoder, context, module),
            SectionId::Export => decode_exports(decoder, context, module),
            SectionId::Start => {
                module.start = Some(decoder.read_handle(context, module)?);
                Ok(())
            }
            SectionId::Element => decode_elements(decoder, context, module),
            SectionId::DataCount => self.decode_data_count(decoder, context, module),
            SectionId::Code => self.decode_code(decoder, context, module),
            SectionId::Data => self.decode_data(decoder, context, module),
        })
    }

    // Checks the counts of sections that were expected but never appeared.
    pub(super) fn finish<Storage: Stream>(&self) -> Result<(), Error<Storage>> {
        if !self.saw_code && !self.pending.is_empty() {
            return Err(Error::FunctionCountMismatch {
                functions: self.pending.len() as u32,
                bodies: 0,
            });
        }
        if let Some(expected) = self.data_count
            && expected > 0
            && !self.saw_data
        {
            return Err(Error::DataCountMismatch {
                expected,
                actual: 0,
            });
        }
        Ok(())
    }

    fn decode_functions<Storage: Stream>(
        &mut self,
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        module: &mut Module<A>,
    ) -> Result<(), Error<Storage>> {
        let count: u32 = decoder.read_bounded(context)?;
        module.funcs.reserve(count as usize)?;
        self.pending.try_reserve_exact(count as usize)?;
        for _ in 0..count {
            let ty = decoder.read_handle(context, module)?;
            let alloc = module.allocator().clone();
            let func = Function::Defined(FunctionBody {
                ty,
                locals: Vec::new_in(alloc.clone()),
                code: Expression::empty_in(alloc)?,
            });
            self.pending.push(module.funcs.push(func)?);
        }
        Ok(())
    }

    fn decode_data_count<Storage: Stream>(
        &mut self,
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        module: &mut Module<A>,
    ) -> Result<(), Error<Storage>> {
        let count: u32 = decoder.read_bounded(context)?;
        // Code may refer to segments before the data section defines them, so
        // their slots are created up front.
        module.data.reserve(count as usize)?;
        for _ in 0..count {
            let alloc = module.allocator().clone();
            module.data.push(DataSegment {
                offset: Expression::empty_in(alloc.clone())?,
                bytes: Vec::new_in(alloc),
            })?;
        }
        module.data_count = true;
        self.data_count = Some(count);
        Ok(())
    }

    fn decode_code<Storage: Stream>(
        &mut self,
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        module: &mut Module<A>,
    ) -> Result<(), Error<Storage>> {
        self.saw_code = true;
        let count: u32 = decoder.read_bounded(context)?;
        if count as usize != self.pending.len() {
            return Err(Error::FunctionCountMismatch {
                functions: self.pending.len() as u32,
                bodies: count,
            });
        }
        for &id in self.pending.iter() {
            decoder.with_context(context, ContextId::Func, |decoder, context| {
                let expected_size = decoder.read_bounded::<u32>(context)? as usize;
                let offset_start = decoder.offset();
                let locals = decoder.with_context(context, ContextId::Locals, |decoder, context| {
                    decode_locals(decoder, context, module.allocator())
                })?;
                let parameters = module
                    .function(id)
                    .and_then(|func| module.ty(func.ty()))
                    .map_or(0, |ty| ty.parameters.len());
                let local_count = (parameters + locals.len()) as u32;
                let code = decoder.with_context(context, ContextId::Expr, |decoder, context| {
                    decode_expression(decoder, context, module, Some(local_count))
                })?;
                let actual_size = decoder.offset() - offset_start;
                if expected_size != actual_size {
                    return Err(Error::InvalidFunctionLength {
                        expected: expected_size as u32,
                        actual: actual_size as u32,
                    });
                }
                if let Some(body) = module.function_mut(id).and_then(Function::body_mut) {
                    body.locals = locals;
                    body.code = code;
                }
                Ok(())
            })?;
        }
        trace!("decoded {count} function bodies");
        Ok(())
    }

    fn decode_data<Storage: Stream>(
        &mut self,
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        module: &mut Module<A>,
    ) -> Result<(), Error<Storage>> {
        self.saw_data = true;
        let count: u32 = decoder.read_bounded(context)?;
        if let Some(expected) = self.data_count
            && expected != count
        {
            return Err(Error::DataCountMismatch {
                expected,
                actual: count,
            });
        }
        for index in 0..count {
            let segment = decoder.with_context(context, ContextId::Data, |decoder, context| {
                decode_data_segment(decoder, context, module)
            })?;
            match module.data_at(index) {
                Some(id) if self.data_count.is_some() => {
                    if let Some(slot) = module.data_segment_mut(id) {
                        *slot = segment;
                    }
                }
                _ => {
                    module.data.push(segment)?;
                }
            }
        }
        Ok(())
    }
}

fn decode_types<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let alloc = module.allocator().clone();
    let count: u32 = decoder.read_bounded(context)?;
    module.types.reserve(count as usize)?;
    for _ in 0..count {
        // Decoded types are kept as they are, duplicates included, so that
        // their indices are preserved.
        let ty: FunctionType<A> = decoder.read(context, &alloc)?;
        module.types.push(ty)?;
    }
    Ok(())
}

fn decode_imports<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let alloc = module.allocator().clone();
    let count: u32 = decoder.read_bounded(context)?;
    module.import_kinds.try_reserve_exact(count as usize)?;
    for _ in 0..count {
        decoder.with_context(context, ContextId::Import, |decoder, context| {
            let import = ImportName {
                module: decoder.read(context, &alloc)?,
                field: decoder.read(context, &alloc)?,
            };
            let kind: ExternalKind = decoder.read_bounded(context)?;
            match kind {
                ExternalKind::Function => {
                    let ty = decoder.read_handle(context, module)?;
                    module.funcs.push(Function::Imported { import, ty })?;
                }
                ExternalKind::Table => {
                    let ty = decoder.read_bounded(context)?;
                    module.tables.push(Table::Imported { import, ty })?;
                }
                ExternalKind::Memory => {
                    let ty = decoder.read_bounded(context)?;
                    module.memories.push(Memory::Imported { import, ty })?;
                }
                ExternalKind::Global => {
                    let ty = decoder.read_bounded(context)?;
                    module.globals.push(Global::Imported { import, ty })?;
                }
                ExternalKind::Tag => {
                    decoder.read_bounded::<TagAttribute>(context)?;
                    let ty = decoder.read_handle(context, module)?;
                    module.tags.push(Tag::Imported { import, ty })?;
                }
            }
            module.import_kinds.push(kind);
            Ok(())
        })?;
    }
    Ok(())
}

fn decode_tables<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let count: u32 = decoder.read_bounded(context)?;
    module.tables.reserve(count as usize)?;
    for _ in 0..count {
        module
            .tables
            .push(Table::Defined(decoder.read_bounded(context)?))?;
    }
    Ok(())
}

fn decode_memories<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let count: u32 = decoder.read_bounded(context)?;
    module.memories.reserve(count as usize)?;
    for _ in 0..count {
        module
            .memories
            .push(Memory::Defined(decoder.read_bounded(context)?))?;
    }
    Ok(())
}

fn decode_tags<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let count: u32 = decoder.read_bounded(context)?;
    module.tags.reserve(count as usize)?;
    for _ in 0..count {
        decoder.read_bounded::<TagAttribute>(context)?;
        let ty = decoder.read_handle(context, module)?;
        module.tags.push(Tag::Defined(ty))?;
    }
    Ok(())
}

fn decode_globals<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let count: u32 = decoder.read_bounded(context)?;
    module.globals.reserve(count as usize)?;
    for _ in 0..count {
        let global = decoder.with_context(context, ContextId::Global, |decoder, context| {
            Ok(Global::Defined {
                ty: decoder.read_bounded(context)?,
                init: decode_const_expression(decoder, context, module)?,
            })
        })?;
        module.globals.push(global)?;
    }
    Ok(())
}

fn decode_exports<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let alloc = module.allocator().clone();
    let count: u32 = decoder.read_bounded(context)?;
    module.exports.try_reserve_exact(count as usize)?;
    for _ in 0..count {
        let export = decoder.with_context(context, ContextId::Export, |decoder, context| {
            let name: Name<A> = decoder.read(context, &alloc)?;
            let kind: ExternalKind = decoder.read_bounded(context)?;
            let target = match kind {
                ExternalKind::Function => {
                    ExportTarget::Function(decoder.read_handle(context, module)?)
                }
                ExternalKind::Table => ExportTarget::Table(decoder.read_handle(context, module)?),
                ExternalKind::Memory => ExportTarget::Memory(decoder.read_handle(context, module)?),
                ExternalKind::Global => ExportTarget::Global(decoder.read_handle(context, module)?),
                ExternalKind::Tag => ExportTarget::Tag(decoder.read_handle(context, module)?),
            };
            Ok(Export { name, target })
        })?;
        if module.export(export.name.as_str()).is_some() {
            return Err(Error::DuplicateExport);
        }
        module.exports.push(export);
    }
    Ok(())
}

fn decode_const_expression<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
) -> Result<Expression<A>, Error<Storage>> {
    decoder.with_context(context, ContextId::Expr, |decoder, context| {
        decode_expression(decoder, context, module, None)
    })
}

fn decode_function_handles<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
) -> Result<ElementItems<A>, Error<Storage>> {
    decoder.with_context(context, ContextId::VecFuncIdx, |decoder, context| {
        let count: u32 = decoder.read_bounded(context)?;
        let mut funcs = Vec::new_in(module.allocator().clone());
        funcs.try_reserve_exact(count as usize)?;
        for _ in 0..count {
            funcs.push(decoder.read_handle(context, module)?);
        }
        Ok(ElementItems::Functions(funcs))
    })
}

fn decode_element_expressions<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
    ty: RefType,
) -> Result<ElementItems<A>, Error<Storage>> {
    decoder.with_context(context, ContextId::VecExpr, |decoder, context| {
        let count: u32 = decoder.read_bounded(context)?;
        let mut exprs = Vec::new_in(module.allocator().clone());
        exprs.try_reserve_exact(count as usize)?;
        for _ in 0..count {
            exprs.push(decode_const_expression(decoder, context, module)?);
        }
        Ok(ElementItems::Expressions { ty, exprs })
    })
}

// The implicit table of the compact element segment forms.
fn default_table<A: Allocator, Storage: Stream>(
    module: &Module<A>,
) -> Result<TableId, Error<Storage>> {
    module.table_at(0).ok_or(Error::Reference(ReferenceError {
        space: IndexSpace::Table,
        handle: 0,
    }))
}

fn decode_element_segment<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
) -> Result<ElementSegment<A>, Error<Storage>> {
    type Token = ElementSegmentToken;

    let token: Token = decoder.read_bounded(context)?;
    let explicit_table = matches!(
        token,
        Token::ActiveTableIndexElemIndices | Token::ActiveTableIndexElemExprs
    );
    let mode = match token {
        Token::ActiveElemIndices | Token::ActiveElemExprs => ElementMode::Active {
            table: default_table(module)?,
            offset: decode_const_expression(decoder, context, module)?,
        },
        Token::ActiveTableIndexElemIndices | Token::ActiveTableIndexElemExprs => {
            ElementMode::Active {
                table: decoder.read_handle(context, module)?,
                offset: decode_const_expression(decoder, context, module)?,
            }
        }
        Token::PassiveElemIndices | Token::PassiveElemExprs => ElementMode::Passive,
        Token::DeclarativeElemIndices | Token::DeclarativeElemExprs => ElementMode::Declarative,
    };
    let items = match token {
        Token::ActiveElemIndices => decode_function_handles(decoder, context, module)?,
        Token::PassiveElemIndices
        | Token::ActiveTableIndexElemIndices
        | Token::DeclarativeElemIndices => {
            decoder.read_bounded::<ElementKind>(context)?;
            decode_function_handles(decoder, context, module)?
        }
        Token::ActiveElemExprs => {
            decode_element_expressions(decoder, context, module, RefType::Func)?
        }
        Token::PassiveElemExprs | Token::ActiveTableIndexElemExprs | Token::DeclarativeElemExprs => {
            let ty: RefType = decoder.read_bounded(context)?;
            decode_element_expressions(decoder, context, module, ty)?
        }
    };
    Ok(ElementSegment {
        mode,
        items,
        explicit_table,
    })
}

fn decode_elements<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &mut Module<A>,
) -> Result<(), Error<Storage>> {
    let count: u32 = decoder.read_bounded(context)?;
    module.elems.reserve(count as usize)?;
    for _ in 0..count {
        let segment = decoder.with_context(context, ContextId::Elem, |decoder, context| {
            decode_element_segment(decoder, context, module)
        })?;
        module.elems.push(segment)?;
    }
    Ok(())
}

// Locals are given as runs of a repeated type.
fn decode_locals<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    alloc: &A,
) -> Result<Vec<ValType, A>, Error<Storage>> {
    let num_groups: u32 = decoder.read_bounded(context)?;
    let mut locals = Vec::new_in(alloc.clone());
    for _ in 0..num_groups {
        let count: u32 = decoder.read_bounded(context)?;
        let local: ValType = decoder.read_bounded(context)?;
        let subtotal = locals.len() + (count as usize);
        if subtotal > MAX_LOCALS_PER_FUNCTION {
            return Err(Error::TooManyLocals(subtotal));
        }
        locals.try_reserve_exact(count as usize)?;
        locals.resize(subtotal, local); // No allocation with previous reservation.
    }
    Ok(locals)
}

fn decode_data_segment<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
) -> Result<DataSegment<A>, Error<Storage>> {
    let token: DataSegmentToken = decoder.read_bounded(context)?;
    match token {
        DataSegmentToken::ActiveNoMemIdx => {
            let offset = decode_const_expression(decoder, context, module)?;
            let bytes = decoder.with_context(context, ContextId::VecByte, |decoder, context| {
                let len: u32 = decoder.read_bounded(context)?;
                decoder.read_bytes(context, len as usize, module.allocator())
            })?;
            Ok(DataSegment { offset, bytes })
        }
        DataSegmentToken::Passive | DataSegmentToken::ActiveWithMemIdx => {
            // The segment's length cannot be known without decoding it, so
            // decoding stops here rather than desynchronizing.
            let mode = token as u32;
            warn!(
                "data segment mode {mode} at {:#x} is not supported",
                decoder.offset()
            );
            Err(Error::Unsupported(Unsupported::DataSegmentMode(mode)))
        }
    }
}
