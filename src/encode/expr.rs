// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Instruction encoding.

use crate::Allocator;
use crate::types::{
    BLOCK_TYPE_EMPTY, BlockType, Expression, Handle, Instruction, MemArg, Opcode,
};

use super::sink::Sink;
use super::{Encoder, Error};

impl<A: Allocator> Encoder<'_, '_, A> {
    // An entity index within an instruction, padded if so configured.
    fn instr_index<S: Sink, Id: Handle>(&self, sink: &mut S, id: Id) -> Result<(), Error> {
        sink.put_uleb(u64::from(self.index(id)?), self.index_len)
    }

    fn block_type<S: Sink>(&self, sink: &mut S, ty: BlockType) -> Result<(), Error> {
        match ty {
            BlockType::Empty => sink.put_byte(BLOCK_TYPE_EMPTY),
            BlockType::Value(value) => sink.put_byte(value as u8),
            BlockType::Type(id) => sink.put_sleb(i64::from(self.index(id)?)),
        }
    }

    fn mem_arg<S: Sink>(sink: &mut S, arg: MemArg) -> Result<(), Error> {
        sink.put_u32(arg.align)?;
        sink.put_u32(arg.offset)
    }

    pub(super) fn expression<S: Sink>(
        &self,
        sink: &mut S,
        expr: &Expression<A>,
    ) -> Result<(), Error> {
        if !matches!(expr.last(), Some(Instruction::End)) {
            return Err(Error::UnterminatedExpression);
        }
        self.instructions(sink, expr)
    }

    pub(super) fn instructions<S: Sink>(
        &self,
        sink: &mut S,
        instrs: &[Instruction<A>],
    ) -> Result<(), Error> {
        for instr in instrs {
            self.instruction(sink, instr)?;
        }
        Ok(())
    }

    fn instruction<S: Sink>(&self, sink: &mut S, instr: &Instruction<A>) -> Result<(), Error> {
        if let Some((prefix, sub)) = instr.prefixed() {
            sink.put_byte(prefix as u8)?;
            sink.put_u32(sub)?;
            return self.prefixed_immediates(sink, instr);
        }

        let op = instr.opcode();
        match instr {
            Instruction::Plain(_) if !op.is_plain() => {
                return Err(Error::InvalidPlainOpcode(op));
            }
            Instruction::Memory { .. } if !op.is_memory_access() => {
                return Err(Error::InvalidMemoryOpcode(op));
            }
            _ => {}
        }
        sink.put_byte(op as u8)?;

        match instr {
            Instruction::Plain(_) | Instruction::End => Ok(()),
            Instruction::Block { ty, body } | Instruction::Loop { ty, body } => {
                self.block_type(sink, *ty)?;
                self.instructions(sink, body)?;
                sink.put_byte(Opcode::End as u8)
            }
            Instruction::If {
                ty,
                then,
                otherwise,
            } => {
                self.block_type(sink, *ty)?;
                self.instructions(sink, then)?;
                if let Some(otherwise) = otherwise {
                    sink.put_byte(Opcode::Else as u8)?;
                    self.instructions(sink, otherwise)?;
                }
                sink.put_byte(Opcode::End as u8)
            }
            Instruction::Try {
                ty,
                body,
                handlers,
                delegate,
            } => {
                self.block_type(sink, *ty)?;
                self.instructions(sink, body)?;
                for handler in handlers.iter() {
                    match handler.tag {
                        Some(tag) => {
                            sink.put_byte(Opcode::Catch as u8)?;
                            self.instr_index(sink, tag)?;
                        }
                        None => sink.put_byte(Opcode::CatchAll as u8)?,
                    }
                    self.instructions(sink, &handler.body)?;
                }
                match delegate {
                    Some(label) => {
                        sink.put_byte(Opcode::Delegate as u8)?;
                        sink.put_u32(*label)
                    }
                    None => sink.put_byte(Opcode::End as u8),
                }
            }
            Instruction::Br(label) | Instruction::BrIf(label) | Instruction::Rethrow(label) => {
                sink.put_u32(*label)
            }
            Instruction::BrTable { labels, default } => {
                sink.put_len(labels.len())?;
                for label in labels.iter() {
                    sink.put_u32(*label)?;
                }
                sink.put_u32(*default)
            }
            Instruction::Call(func) | Instruction::ReturnCall(func) | Instruction::RefFunc(func) => {
                self.instr_index(sink, *func)
            }
            Instruction::CallIndirect { ty, table }
            | Instruction::ReturnCallIndirect { ty, table } => {
                self.instr_index(sink, *ty)?;
                self.instr_index(sink, *table)
            }
            Instruction::Throw(tag) => self.instr_index(sink, *tag),
            Instruction::RefNull(ty) => sink.put_byte(*ty as u8),
            Instruction::SelectT(types) => {
                sink.put_len(types.len())?;
                for ty in types.iter() {
                    sink.put_byte(*ty as u8)?;
                }
                Ok(())
            }
            Instruction::LocalGet(local)
            | Instruction::LocalSet(local)
            | Instruction::LocalTee(local) => sink.put_u32(**local),
            Instruction::GlobalGet(global) | Instruction::GlobalSet(global) => {
                self.instr_index(sink, *global)
            }
            Instruction::TableGet(table) | Instruction::TableSet(table) => {
                self.instr_index(sink, *table)
            }
            Instruction::Memory { arg, .. } => Self::mem_arg(sink, *arg),
            Instruction::MemorySize(memory) | Instruction::MemoryGrow(memory) => {
                self.instr_index(sink, *memory)
            }
            Instruction::I32Const(value) => sink.put_sleb(i64::from(*value)),
            Instruction::I64Const(value) => sink.put_sleb(*value),
            Instruction::F32Const(value) => sink.put_bytes(&value.0.to_le_bytes()),
            Instruction::F64Const(value) => sink.put_bytes(&value.0.to_le_bytes()),
            // Prefixed instructions were handled above.
            _ => Ok(()),
        }
    }

    // The immediates following a prefix and its sub-opcode.
    fn prefixed_immediates<S: Sink>(
        &self,
        sink: &mut S,
        instr: &Instruction<A>,
    ) -> Result<(), Error> {
        match instr {
            Instruction::MemoryInit { data, memory } => {
                self.instr_index(sink, *data)?;
                self.instr_index(sink, *memory)
            }
            Instruction::DataDrop(data) => self.instr_index(sink, *data),
            Instruction::MemoryCopy { dst, src } => {
                self.instr_index(sink, *dst)?;
                self.instr_index(sink, *src)
            }
            Instruction::MemoryFill(memory) => self.instr_index(sink, *memory),
            Instruction::TableInit { elem, table } => {
                self.instr_index(sink, *elem)?;
                self.instr_index(sink, *table)
            }
            Instruction::ElemDrop(elem) => self.instr_index(sink, *elem),
            Instruction::TableCopy { dst, src } => {
                self.instr_index(sink, *dst)?;
                self.instr_index(sink, *src)
            }
            Instruction::TableGrow(table)
            | Instruction::TableSize(table)
            | Instruction::TableFill(table) => self.instr_index(sink, *table),
            Instruction::VectorMemory { arg, .. } | Instruction::Atomic { arg, .. } => {
                Self::mem_arg(sink, *arg)
            }
            Instruction::VectorMemoryLane { arg, lane, .. } => {
                Self::mem_arg(sink, *arg)?;
                sink.put_byte(*lane)
            }
            Instruction::VectorLane { lane, .. } => sink.put_byte(*lane),
            Instruction::VectorBytes { bytes, .. } => sink.put_bytes(bytes),
            Instruction::AtomicFence => sink.put_byte(0),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::EncodeOptions;
    use super::super::sink::Measure;
    use super::*;
    use crate::core_compat::alloc::Global;
    use crate::core_compat::vec::Vec;
    use crate::module::{Function, FunctionBody, Memory, Module};
    use crate::storage::ByteCursor;
    use crate::types::{FuncId, Handler, Limits, MemId, MemoryType, ValType, VectorOpcode};

    fn body(instrs: &[Instruction<Global>]) -> Vec<Instruction<Global>, Global> {
        let mut body = Vec::new_in(Global);
        body.extend_from_slice(instrs);
        body
    }

    // Encodes through both sinks, checking that they agree.
    fn encode(
        module: &Module<Global>,
        options: EncodeOptions<'_>,
        instrs: &[Instruction<Global>],
    ) -> std::vec::Vec<u8> {
        let encoder = Encoder::new(module, options).unwrap();
        let mut measure = Measure::default();
        encoder.instructions(&mut measure, instrs).unwrap();
        let mut buf = std::vec![0u8; measure.written()];
        let mut cursor = ByteCursor::new(&mut buf[..]);
        encoder.instructions(&mut cursor, instrs).unwrap();
        assert_eq!(cursor.written(), buf.len());
        buf
    }

    fn module_with_function() -> (Module<Global>, FuncId) {
        let mut module = Module::new_in(Global);
        let ty = module.get_or_create_type(&[], &[]).unwrap();
        let func = Function::Defined(FunctionBody {
            ty,
            locals: Vec::new_in(Global),
            code: Expression::empty_in(Global).unwrap(),
        });
        let id = module.add_function(func).unwrap();
        (module, id)
    }

    #[test]
    fn nested_blocks_close_their_bodies() {
        let (module, _) = module_with_function();
        let instrs = [
            Instruction::Block {
                ty: BlockType::Empty,
                body: body(&[Instruction::If {
                    ty: BlockType::Value(ValType::I32),
                    then: body(&[Instruction::I32Const(1)]),
                    otherwise: Some(body(&[Instruction::I32Const(-1)])),
                }]),
            },
            Instruction::End,
        ];
        assert_eq!(
            encode(&module, EncodeOptions::new(), &instrs),
            [0x02, 0x40, 0x04, 0x7f, 0x41, 0x01, 0x05, 0x41, 0x7f, 0x0b, 0x0b, 0x0b]
        );
    }

    #[test]
    fn try_handlers_and_delegate() {
        let (module, _) = module_with_function();
        let handlers = {
            let mut handlers = Vec::new_in(Global);
            handlers.push(Handler {
                tag: None,
                body: body(&[Instruction::Rethrow(0)]),
            });
            handlers
        };
        let instrs = [
            Instruction::Try {
                ty: BlockType::Empty,
                body: body(&[Instruction::Plain(Opcode::Nop)]),
                handlers,
                delegate: None,
            },
            Instruction::Try {
                ty: BlockType::Empty,
                body: Vec::new_in(Global),
                handlers: Vec::new_in(Global),
                delegate: Some(1),
            },
        ];
        assert_eq!(
            encode(&module, EncodeOptions::new(), &instrs),
            [0x06, 0x40, 0x01, 0x19, 0x09, 0x00, 0x0b, 0x06, 0x40, 0x18, 0x01]
        );
    }

    #[test]
    fn prefixed_instructions() {
        let (mut module, _) = module_with_function();
        let memory = module
            .add_memory(Memory::Defined(MemoryType {
                limits: Limits::new(1, None),
            }))
            .unwrap();
        let instrs = [
            Instruction::MemoryCopy {
                dst: memory,
                src: memory,
            },
            Instruction::VectorLane {
                op: VectorOpcode::I8x16ExtractLaneS,
                lane: 3,
            },
            Instruction::AtomicFence,
        ];
        assert_eq!(
            encode(&module, EncodeOptions::new(), &instrs),
            [0xfc, 0x0a, 0x00, 0x00, 0xfd, 0x15, 0x03, 0xfe, 0x03, 0x00]
        );
    }

    #[test]
    fn padded_indices() {
        let (module, func) = module_with_function();
        let instrs = [Instruction::Call(func), Instruction::Br(0)];
        assert_eq!(
            encode(&module, EncodeOptions::new().padded_indices(true), &instrs),
            [0x10, 0x80, 0x80, 0x80, 0x80, 0x00, 0x0c, 0x00]
        );
    }

    #[test]
    fn malformed_instructions() {
        let (module, _) = module_with_function();
        let encoder = Encoder::new(&module, EncodeOptions::new()).unwrap();
        let mut measure = Measure::default();
        assert_eq!(
            encoder.instructions(&mut measure, &[Instruction::Plain(Opcode::I32Const)]),
            Err(Error::InvalidPlainOpcode(Opcode::I32Const))
        );
        let dangling = MemId::from_raw(0);
        assert_eq!(
            encoder.instructions(&mut measure, &[Instruction::MemorySize(dangling)]),
            Err(Error::Reference(dangling.unresolved()))
        );
        let unterminated = {
            let mut instrs = [Some(Instruction::Plain(Opcode::Nop))];
            let mut expr = Expression::from_instructions(&mut instrs, Global).unwrap();
            expr.instructions_mut().pop();
            expr
        };
        assert_eq!(
            encoder.expression(&mut measure, &unterminated),
            Err(Error::UnterminatedExpression)
        );
    }
}
