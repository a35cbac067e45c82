// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Instruction decoding.
//!
//! Structured instructions are decoded without recursion: every `block`,
//! `loop`, `if` and `try` pushes a scope whose body collects the instructions
//! that follow, and `end` (or `delegate`) pops it into the enclosing body. The
//! expression ends with the `end` that finds no scope to close.

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::leb128;
use crate::module::Module;
use crate::storage::Stream;
use crate::types::{
    AtomicOpcode, BLOCK_TYPE_EMPTY, BlockType, Body, BulkOpcode, Expression, Handler, IndexSpace,
    Instruction, LocalId, MemArg, Opcode, RefType, ReferenceError, ValType, VectorOpcode,
    VectorShape,
};

use super::{ContextId, ContextStack, Decoder, Error};

// The maximum nesting depth of structured instructions. The encoder and the
// rewriting passes recurse over nested bodies.
const MAX_NESTING: usize = 1024;

// An open scope.
enum Scope<A: Allocator> {
    Block {
        ty: BlockType,
        body: Body<A>,
    },
    Loop {
        ty: BlockType,
        body: Body<A>,
    },
    If {
        ty: BlockType,
        then: Body<A>,
        otherwise: Option<Body<A>>,
    },
    Try {
        ty: BlockType,
        body: Body<A>,
        handlers: Vec<Handler<A>, A>,
    },
}

impl<A: Allocator> Scope<A> {
    // The body new instructions are appended to.
    fn body_mut(&mut self) -> &mut Body<A> {
        match self {
            Scope::Block { body, .. } | Scope::Loop { body, .. } => body,
            Scope::If {
                then, otherwise, ..
            } => otherwise.as_mut().unwrap_or(then),
            Scope::Try { body, handlers, .. } => match handlers.last_mut() {
                Some(handler) => &mut handler.body,
                None => body,
            },
        }
    }

    fn close(self) -> Instruction<A> {
        match self {
            Scope::Block { ty, body } => Instruction::Block { ty, body },
            Scope::Loop { ty, body } => Instruction::Loop { ty, body },
            Scope::If {
                ty,
                then,
                otherwise,
            } => Instruction::If {
                ty,
                then,
                otherwise,
            },
            Scope::Try { ty, body, handlers } => Instruction::Try {
                ty,
                body,
                handlers,
                delegate: None,
            },
        }
    }
}

fn push<A: Allocator, Storage: Stream>(
    body: &mut Body<A>,
    instr: Instruction<A>,
) -> Result<(), Error<Storage>> {
    body.try_reserve(1)?;
    body.push(instr);
    Ok(())
}

/// Decodes an expression up to and including its terminating `end`.
///
/// `locals` is the size of the local index space of the enclosing function,
/// or `None` for constant expressions, which have no locals.
pub(super) fn decode_expression<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
    locals: Option<u32>,
) -> Result<Expression<A>, Error<Storage>> {
    let alloc = module.allocator();
    let mut top = Vec::new_in(alloc.clone());
    let mut scopes: Vec<Scope<A>, A> = Vec::new_in(alloc.clone());

    loop {
        let op: Opcode = decoder.read_bounded(context)?;
        let instr = match op {
            Opcode::Block | Opcode::Loop | Opcode::If | Opcode::Try => {
                if scopes.len() >= MAX_NESTING {
                    return Err(Error::ExcessiveNesting(scopes.len() + 1));
                }
                let ty = decode_block_type(decoder, context, module)?;
                let body = Vec::new_in(alloc.clone());
                let scope = match op {
                    Opcode::Block => Scope::Block { ty, body },
                    Opcode::Loop => Scope::Loop { ty, body },
                    Opcode::If => Scope::If {
                        ty,
                        then: body,
                        otherwise: None,
                    },
                    _ => Scope::Try {
                        ty,
                        body,
                        handlers: Vec::new_in(alloc.clone()),
                    },
                };
                scopes.try_reserve(1)?;
                scopes.push(scope);
                continue;
            }
            Opcode::Else => {
                match scopes.last_mut() {
                    Some(Scope::If { otherwise, .. }) if otherwise.is_none() => {
                        *otherwise = Some(Vec::new_in(alloc.clone()));
                    }
                    _ => return Err(Error::UnexpectedOpcode(op as u8)),
                }
                continue;
            }
            Opcode::Catch | Opcode::CatchAll => {
                // No handler may follow `catch_all`.
                let Some(Scope::Try { handlers, .. }) = scopes.last_mut() else {
                    return Err(Error::UnexpectedOpcode(op as u8));
                };
                if handlers.last().is_some_and(|handler| handler.tag.is_none()) {
                    return Err(Error::UnexpectedOpcode(op as u8));
                }
                let tag = if op == Opcode::Catch {
                    Some(decoder.read_handle(context, module)?)
                } else {
                    None
                };
                handlers.try_reserve(1)?;
                handlers.push(Handler {
                    tag,
                    body: Vec::new_in(alloc.clone()),
                });
                continue;
            }
            Opcode::Delegate => {
                let label = decode_label(decoder, context)?;
                match scopes.pop() {
                    Some(Scope::Try { ty, body, handlers }) if handlers.is_empty() => {
                        Instruction::Try {
                            ty,
                            body,
                            handlers,
                            delegate: Some(label),
                        }
                    }
                    _ => return Err(Error::UnexpectedOpcode(op as u8)),
                }
            }
            Opcode::End => match scopes.pop() {
                Some(scope) => scope.close(),
                None => {
                    push(&mut top, Instruction::End)?;
                    break;
                }
            },
            _ => decode_instruction(decoder, context, module, locals, op)?,
        };
        let body = match scopes.last_mut() {
            Some(scope) => scope.body_mut(),
            None => &mut top,
        };
        push(body, instr)?;
    }
    Ok(Expression::new(top))
}

// A block type is a single byte for the empty type or a value type, and
// otherwise a non-negative 33-bit signed LEB128 type index whose first byte is
// the one already read.
fn decode_block_type<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
) -> Result<BlockType, Error<Storage>> {
    decoder.with_context(context, ContextId::BlockType, |decoder, _| {
        let first = decoder.read_byte_raw()?;
        if first == BLOCK_TYPE_EMPTY {
            return Ok(BlockType::Empty);
        }
        if let Ok(valtype) = ValType::try_from(first) {
            return Ok(BlockType::Value(valtype));
        }
        let mut pending = Some(first);
        let index: i64 = leb128::read(|| match pending.take() {
            Some(byte) => Ok(byte),
            None => decoder.read_byte_raw(),
        })?;
        let index = u32::try_from(index).map_err(|_| Error::InvalidValType(first))?;
        let ty = module.type_at(index).ok_or(Error::Reference(ReferenceError {
            space: IndexSpace::Type,
            handle: index,
        }))?;
        Ok(BlockType::Type(ty))
    })
}

fn decode_label<Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
) -> Result<u32, Error<Storage>> {
    decoder.with_context(context, ContextId::LabelIdx, |decoder, _| {
        decoder.read_leb128_raw()
    })
}

fn decode_local<Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    locals: Option<u32>,
) -> Result<LocalId, Error<Storage>> {
    decoder.with_context(context, ContextId::LocalIdx, |decoder, _| {
        let index: u32 = decoder.read_leb128_raw()?;
        if locals.is_some_and(|count| index < count) {
            Ok(LocalId::new(index))
        } else {
            Err(Error::Reference(ReferenceError {
                space: IndexSpace::Local,
                handle: index,
            }))
        }
    })
}

fn decode_lane<Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
) -> Result<u8, Error<Storage>> {
    decoder.with_context(context, ContextId::Lane, |decoder, _| decoder.read_byte_raw())
}

// Decodes an instruction that opens no scope.
fn decode_instruction<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
    locals: Option<u32>,
    op: Opcode,
) -> Result<Instruction<A>, Error<Storage>> {
    let alloc = module.allocator();
    if op.is_plain() {
        return Ok(Instruction::Plain(op));
    }
    if op.is_memory_access() {
        return Ok(Instruction::Memory {
            op,
            arg: decoder.read_bounded(context)?,
        });
    }
    let instr = match op {
        Opcode::Br => Instruction::Br(decode_label(decoder, context)?),
        Opcode::BrIf => Instruction::BrIf(decode_label(decoder, context)?),
        Opcode::BrTable => Instruction::BrTable {
            labels: decoder.read(context, alloc)?,
            default: decode_label(decoder, context)?,
        },
        Opcode::Call => Instruction::Call(decoder.read_handle(context, module)?),
        Opcode::ReturnCall => Instruction::ReturnCall(decoder.read_handle(context, module)?),
        Opcode::CallIndirect => Instruction::CallIndirect {
            ty: decoder.read_handle(context, module)?,
            table: decoder.read_handle(context, module)?,
        },
        Opcode::ReturnCallIndirect => Instruction::ReturnCallIndirect {
            ty: decoder.read_handle(context, module)?,
            table: decoder.read_handle(context, module)?,
        },
        Opcode::Throw => Instruction::Throw(decoder.read_handle(context, module)?),
        Opcode::Rethrow => Instruction::Rethrow(decode_label(decoder, context)?),
        Opcode::RefNull => Instruction::RefNull(decoder.read_bounded::<RefType>(context)?),
        Opcode::RefFunc => Instruction::RefFunc(decoder.read_handle(context, module)?),
        Opcode::SelectT => Instruction::SelectT(decoder.read(context, alloc)?),
        Opcode::LocalGet => Instruction::LocalGet(decode_local(decoder, context, locals)?),
        Opcode::LocalSet => Instruction::LocalSet(decode_local(decoder, context, locals)?),
        Opcode::LocalTee => Instruction::LocalTee(decode_local(decoder, context, locals)?),
        Opcode::GlobalGet => Instruction::GlobalGet(decoder.read_handle(context, module)?),
        Opcode::GlobalSet => Instruction::GlobalSet(decoder.read_handle(context, module)?),
        Opcode::TableGet => Instruction::TableGet(decoder.read_handle(context, module)?),
        Opcode::TableSet => Instruction::TableSet(decoder.read_handle(context, module)?),
        Opcode::MemorySize => Instruction::MemorySize(decoder.read_handle(context, module)?),
        Opcode::MemoryGrow => Instruction::MemoryGrow(decoder.read_handle(context, module)?),
        Opcode::I32Const => Instruction::I32Const(decoder.read_bounded(context)?),
        Opcode::I64Const => Instruction::I64Const(decoder.read_bounded(context)?),
        Opcode::F32Const => Instruction::F32Const(decoder.read_bounded(context)?),
        Opcode::F64Const => Instruction::F64Const(decoder.read_bounded(context)?),
        Opcode::BulkPrefix => decode_bulk_instruction(decoder, context, module)?,
        Opcode::VectorPrefix => decode_vector_instruction(decoder, context)?,
        Opcode::AtomicPrefix => decode_atomic_instruction(decoder, context)?,
        _ => return Err(Error::UnexpectedOpcode(op as u8)),
    };
    Ok(instr)
}

fn decode_bulk_instruction<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    module: &Module<A>,
) -> Result<Instruction<A>, Error<Storage>> {
    let op: BulkOpcode = decoder.read_bounded(context)?;
    let instr = match op {
        BulkOpcode::MemoryInit => Instruction::MemoryInit {
            data: decoder.read_handle(context, module)?,
            memory: decoder.read_handle(context, module)?,
        },
        BulkOpcode::DataDrop => Instruction::DataDrop(decoder.read_handle(context, module)?),
        BulkOpcode::MemoryCopy => Instruction::MemoryCopy {
            dst: decoder.read_handle(context, module)?,
            src: decoder.read_handle(context, module)?,
        },
        BulkOpcode::MemoryFill => Instruction::MemoryFill(decoder.read_handle(context, module)?),
        BulkOpcode::TableInit => Instruction::TableInit {
            elem: decoder.read_handle(context, module)?,
            table: decoder.read_handle(context, module)?,
        },
        BulkOpcode::ElemDrop => Instruction::ElemDrop(decoder.read_handle(context, module)?),
        BulkOpcode::TableCopy => Instruction::TableCopy {
            dst: decoder.read_handle(context, module)?,
            src: decoder.read_handle(context, module)?,
        },
        BulkOpcode::TableGrow => Instruction::TableGrow(decoder.read_handle(context, module)?),
        BulkOpcode::TableSize => Instruction::TableSize(decoder.read_handle(context, module)?),
        BulkOpcode::TableFill => Instruction::TableFill(decoder.read_handle(context, module)?),
        BulkOpcode::I32TruncSatF32S
        | BulkOpcode::I32TruncSatF32U
        | BulkOpcode::I32TruncSatF64S
        | BulkOpcode::I32TruncSatF64U
        | BulkOpcode::I64TruncSatF32S
        | BulkOpcode::I64TruncSatF32U
        | BulkOpcode::I64TruncSatF64S
        | BulkOpcode::I64TruncSatF64U => Instruction::TruncSat(op),
    };
    Ok(instr)
}

fn decode_vector_instruction<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
) -> Result<Instruction<A>, Error<Storage>> {
    let op: VectorOpcode = decoder.read_bounded(context)?;
    let instr = match op.shape() {
        VectorShape::None => Instruction::Vector(op),
        VectorShape::MemArg => Instruction::VectorMemory {
            op,
            arg: decoder.read_bounded(context)?,
        },
        VectorShape::MemArgLane => Instruction::VectorMemoryLane {
            op,
            arg: decoder.read_bounded(context)?,
            lane: decode_lane(decoder, context)?,
        },
        VectorShape::Lane => Instruction::VectorLane {
            op,
            lane: decode_lane(decoder, context)?,
        },
        VectorShape::Bytes16 => {
            let mut bytes = [0u8; 16];
            decoder.read_exact(context, &mut bytes)?;
            Instruction::VectorBytes { op, bytes }
        }
    };
    Ok(instr)
}

fn decode_atomic_instruction<A: Allocator, Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
) -> Result<Instruction<A>, Error<Storage>> {
    let op: AtomicOpcode = decoder.read_bounded(context)?;
    if op == AtomicOpcode::AtomicFence {
        decoder.read_zero_byte(context)?;
        return Ok(Instruction::AtomicFence);
    }
    let arg: MemArg = decoder.read_bounded(context)?;
    Ok(Instruction::Atomic { op, arg })
}
