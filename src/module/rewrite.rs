// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Graph rewrites over entity references: function replacement and module
//! merging.
//!
//! Both are expressed through [`Remap`], which every reference-bearing part of
//! a module is passed through: function bodies and their types, global
//! initializers, tag types, element and data segments, exports and the start
//! function.

use log::trace;

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::types::{
    BlockType, DataId, ElemId, Expression, FuncId, GlobalId, Handle, Instruction, MemId, TableId,
    TagId, TypeId,
};

use super::{
    Arena, DataSegment, ElementItems, ElementMode, ElementSegment, Entity, Error, ExportTarget,
    Function, Global, Module, Tag,
};

/// A substitution of entity references. Each method defaults to the identity.
trait Remap {
    fn ty(&self, id: TypeId) -> TypeId {
        id
    }
    fn func(&self, id: FuncId) -> FuncId {
        id
    }
    fn table(&self, id: TableId) -> TableId {
        id
    }
    fn memory(&self, id: MemId) -> MemId {
        id
    }
    fn global(&self, id: GlobalId) -> GlobalId {
        id
    }
    fn tag(&self, id: TagId) -> TagId {
        id
    }
    fn elem(&self, id: ElemId) -> ElemId {
        id
    }
    fn data(&self, id: DataId) -> DataId {
        id
    }
}

fn remap_block_type<R: Remap>(ty: &mut BlockType, remap: &R) {
    if let BlockType::Type(id) = ty {
        *id = remap.ty(*id);
    }
}

fn remap_instructions<A: Allocator, R: Remap>(
    instrs: &mut [Instruction<A>],
    remap: &R,
) {
    for instr in instrs {
        match instr {
            Instruction::Block { ty, body } | Instruction::Loop { ty, body } => {
                remap_block_type(ty, remap);
                remap_instructions(body, remap);
            }
            Instruction::If {
                ty,
                then,
                otherwise,
            } => {
                remap_block_type(ty, remap);
                remap_instructions(then, remap);
                if let Some(otherwise) = otherwise {
                    remap_instructions(otherwise, remap);
                }
            }
            Instruction::Try {
                ty, body, handlers, ..
            } => {
                remap_block_type(ty, remap);
                remap_instructions(body, remap);
                for handler in handlers.iter_mut() {
                    if let Some(tag) = &mut handler.tag {
                        *tag = remap.tag(*tag);
                    }
                    remap_instructions(&mut handler.body, remap);
                }
            }
            Instruction::Call(func) | Instruction::ReturnCall(func) | Instruction::RefFunc(func) => {
                *func = remap.func(*func);
            }
            Instruction::CallIndirect { ty, table }
            | Instruction::ReturnCallIndirect { ty, table } => {
                *ty = remap.ty(*ty);
                *table = remap.table(*table);
            }
            Instruction::Throw(tag) => *tag = remap.tag(*tag),
            Instruction::GlobalGet(global) | Instruction::GlobalSet(global) => {
                *global = remap.global(*global);
            }
            Instruction::TableGet(table)
            | Instruction::TableSet(table)
            | Instruction::TableGrow(table)
            | Instruction::TableSize(table)
            | Instruction::TableFill(table) => *table = remap.table(*table),
            Instruction::MemorySize(memory)
            | Instruction::MemoryGrow(memory)
            | Instruction::MemoryFill(memory) => *memory = remap.memory(*memory),
            Instruction::MemoryInit { data, memory } => {
                *data = remap.data(*data);
                *memory = remap.memory(*memory);
            }
            Instruction::DataDrop(data) => *data = remap.data(*data),
            Instruction::MemoryCopy { dst, src } => {
                *dst = remap.memory(*dst);
                *src = remap.memory(*src);
            }
            Instruction::TableInit { elem, table } => {
                *elem = remap.elem(*elem);
                *table = remap.table(*table);
            }
            Instruction::ElemDrop(elem) => *elem = remap.elem(*elem),
            Instruction::TableCopy { dst, src } => {
                *dst = remap.table(*dst);
                *src = remap.table(*src);
            }
            _ => {}
        }
    }
}

fn remap_expression<A: Allocator, R: Remap>(expr: &mut Expression<A>, remap: &R) {
    remap_instructions(expr.instructions_mut(), remap);
}

fn remap_function<A: Allocator, R: Remap>(func: &mut Function<A>, remap: &R) {
    match func {
        Function::Imported { ty, .. } => *ty = remap.ty(*ty),
        Function::Defined(body) => {
            body.ty = remap.ty(body.ty);
            remap_expression(&mut body.code, remap);
        }
    }
}

fn remap_global<A: Allocator, R: Remap>(global: &mut Global<A>, remap: &R) {
    if let Global::Defined { init, .. } = global {
        remap_expression(init, remap);
    }
}

fn remap_tag<A: Allocator, R: Remap>(tag: &mut Tag<A>, remap: &R) {
    match tag {
        Tag::Imported { ty, .. } | Tag::Defined(ty) => *ty = remap.ty(*ty),
    }
}

fn remap_element<A: Allocator, R: Remap>(segment: &mut ElementSegment<A>, remap: &R) {
    if let ElementMode::Active { table, offset } = &mut segment.mode {
        *table = remap.table(*table);
        remap_expression(offset, remap);
    }
    match &mut segment.items {
        ElementItems::Functions(funcs) => {
            for func in funcs.iter_mut() {
                *func = remap.func(*func);
            }
        }
        ElementItems::Expressions { exprs, .. } => {
            for expr in exprs.iter_mut() {
                remap_expression(expr, remap);
            }
        }
    }
}

fn remap_data<A: Allocator, R: Remap>(segment: &mut DataSegment<A>, remap: &R) {
    remap_expression(&mut segment.offset, remap);
}

fn remap_export_target<R: Remap>(target: &mut ExportTarget, remap: &R) {
    *target = match *target {
        ExportTarget::Function(id) => ExportTarget::Function(remap.func(id)),
        ExportTarget::Table(id) => ExportTarget::Table(remap.table(id)),
        ExportTarget::Memory(id) => ExportTarget::Memory(remap.memory(id)),
        ExportTarget::Global(id) => ExportTarget::Global(remap.global(id)),
        ExportTarget::Tag(id) => ExportTarget::Tag(remap.tag(id)),
    };
}

struct ReplaceFunction {
    old: FuncId,
    new: FuncId,
}

impl Remap for ReplaceFunction {
    fn func(&self, id: FuncId) -> FuncId {
        if id == self.old { self.new } else { id }
    }
}

// Handle translation from a merged-in module: indexed by the raw handle in
// that module. Handles that were dangling there map to a handle that is
// dangling here too.
struct Translation<Id: Handle, A: Allocator>(Vec<Id, A>);

impl<Id: Handle, A: Allocator> Translation<Id, A> {
    fn new_in(slots: usize, alloc: A) -> Result<Self, Error> {
        let mut map = Vec::new_in(alloc);
        map.try_reserve_exact(slots)?;
        map.resize(slots, Id::from_raw(u32::MAX));
        Ok(Self(map))
    }

    fn set(&mut self, from: Id, to: Id) {
        self.0[from.raw() as usize] = to;
    }

    fn get(&self, id: Id) -> Id {
        self.0
            .get(id.raw() as usize)
            .copied()
            .unwrap_or(Id::from_raw(u32::MAX))
    }
}

struct Merge<A: Allocator> {
    types: Translation<TypeId, A>,
    funcs: Translation<FuncId, A>,
    tables: Translation<TableId, A>,
    memories: Translation<MemId, A>,
    globals: Translation<GlobalId, A>,
    tags: Translation<TagId, A>,
    elems: Translation<ElemId, A>,
    data: Translation<DataId, A>,
}

impl<A: Allocator> Remap for Merge<A> {
    fn ty(&self, id: TypeId) -> TypeId {
        self.types.get(id)
    }
    fn func(&self, id: FuncId) -> FuncId {
        self.funcs.get(id)
    }
    fn table(&self, id: TableId) -> TableId {
        self.tables.get(id)
    }
    fn memory(&self, id: MemId) -> MemId {
        self.memories.get(id)
    }
    fn global(&self, id: GlobalId) -> GlobalId {
        self.globals.get(id)
    }
    fn tag(&self, id: TagId) -> TagId {
        self.tags.get(id)
    }
    fn elem(&self, id: ElemId) -> ElemId {
        self.elems.get(id)
    }
    fn data(&self, id: DataId) -> DataId {
        self.data.get(id)
    }
}

// Moves every entity of `from` into `into`, imported ones after the existing
// imports, recording the translation and the new handles.
fn move_entities<Id: Handle, T: Entity<A>, A: Allocator>(
    into: &mut Arena<Id, T, A>,
    mut from: Arena<Id, T, A>,
    translation: &mut Translation<Id, A>,
    moved: &mut Vec<Id, A>,
) -> Result<(), Error> {
    into.reserve(from.len())?;
    moved.try_reserve(from.len())?;
    let mut import_pos = into.leading(|entity: &T| entity.is_imported());
    let mut ids = Vec::new_in(moved.allocator().clone());
    ids.try_reserve_exact(from.len())?;
    ids.extend_from_slice(from.ids());
    for old in ids {
        let Some(entity) = from.remove(old) else {
            continue;
        };
        let new = if entity.is_imported() {
            let id = into.insert(import_pos, entity)?;
            import_pos += 1;
            id
        } else {
            into.push(entity)?
        };
        translation.set(old, new);
        moved.push(new);
    }
    Ok(())
}

// Segments have no imported variant; they are appended.
fn move_segments<Id: Handle, T, A: Allocator>(
    into: &mut Arena<Id, T, A>,
    mut from: Arena<Id, T, A>,
    translation: &mut Translation<Id, A>,
    moved: &mut Vec<Id, A>,
) -> Result<(), Error> {
    into.reserve(from.len())?;
    moved.try_reserve(from.len())?;
    let mut ids = Vec::new_in(moved.allocator().clone());
    ids.try_reserve_exact(from.len())?;
    ids.extend_from_slice(from.ids());
    for old in ids {
        if let Some(segment) = from.remove(old) {
            let new = into.push(segment)?;
            translation.set(old, new);
            moved.push(new);
        }
    }
    Ok(())
}

impl<A: Allocator> Module<A> {
    fn remap_all<R: Remap>(&mut self, remap: &R) {
        for func in self.funcs.values_mut() {
            remap_function(func, remap);
        }
        for global in self.globals.values_mut() {
            remap_global(global, remap);
        }
        for tag in self.tags.values_mut() {
            remap_tag(tag, remap);
        }
        for segment in self.elems.values_mut() {
            remap_element(segment, remap);
        }
        for segment in self.data.values_mut() {
            remap_data(segment, remap);
        }
        for export in self.exports.iter_mut() {
            remap_export_target(&mut export.target, remap);
        }
        if let Some(start) = &mut self.start {
            *start = remap.func(*start);
        }
    }

    /// Redirects every reference to `old` to `new`, then removes `old`.
    pub fn replace_function(&mut self, old: FuncId, new: FuncId) -> Result<(), Error> {
        self.function_index(old)?;
        self.function_index(new)?;
        if old == new {
            return Ok(());
        }
        self.remap_all(&ReplaceFunction { old, new });
        self.funcs.remove(old);
        trace!("replaced {old:?} with {new:?}");
        Ok(())
    }

    /// Moves all entities of `other` into this module.
    ///
    /// Types are deduplicated structurally. Imported entities of `other` are
    /// placed after this module's imports of the same kind, and defined ones
    /// after its definitions, so that imports stay first. Every reference in
    /// the moved entities is rewritten to the new handles. Custom sections of
    /// `other` are dropped, as their contents may encode its indices.
    ///
    /// Nothing is moved if the export names collide or both modules have a
    /// start function.
    pub fn merge(&mut self, mut other: Module<A>) -> Result<(), Error> {
        if other
            .exports
            .iter()
            .any(|export| self.export(export.name.as_str()).is_some())
        {
            return Err(Error::DuplicateExport);
        }
        if self.start.is_some() && other.start.is_some() {
            return Err(Error::ConflictingStart);
        }

        let alloc = self.alloc.clone();
        let mut map = Merge {
            types: Translation::new_in(other.types.slot_count(), alloc.clone())?,
            funcs: Translation::new_in(other.funcs.slot_count(), alloc.clone())?,
            tables: Translation::new_in(other.tables.slot_count(), alloc.clone())?,
            memories: Translation::new_in(other.memories.slot_count(), alloc.clone())?,
            globals: Translation::new_in(other.globals.slot_count(), alloc.clone())?,
            tags: Translation::new_in(other.tags.slot_count(), alloc.clone())?,
            elems: Translation::new_in(other.elems.slot_count(), alloc.clone())?,
            data: Translation::new_in(other.data.slot_count(), alloc.clone())?,
        };

        for (old, ty) in other.types.iter() {
            let new = self.get_or_create_type(&ty.parameters, &ty.results)?;
            map.types.set(old, new);
        }

        // First move everything, then rewrite what was moved: references may
        // point forward, to entities not yet moved.
        let mut funcs = Vec::new_in(alloc.clone());
        let mut tables = Vec::new_in(alloc.clone());
        let mut memories = Vec::new_in(alloc.clone());
        let mut globals = Vec::new_in(alloc.clone());
        let mut tags = Vec::new_in(alloc.clone());
        let mut elems = Vec::new_in(alloc.clone());
        let mut data = Vec::new_in(alloc.clone());
        move_entities(
            &mut self.funcs,
            core::mem::replace(&mut other.funcs, Arena::new_in(alloc.clone())),
            &mut map.funcs,
            &mut funcs,
        )?;
        move_entities(
            &mut self.tables,
            core::mem::replace(&mut other.tables, Arena::new_in(alloc.clone())),
            &mut map.tables,
            &mut tables,
        )?;
        move_entities(
            &mut self.memories,
            core::mem::replace(&mut other.memories, Arena::new_in(alloc.clone())),
            &mut map.memories,
            &mut memories,
        )?;
        move_entities(
            &mut self.globals,
            core::mem::replace(&mut other.globals, Arena::new_in(alloc.clone())),
            &mut map.globals,
            &mut globals,
        )?;
        move_entities(
            &mut self.tags,
            core::mem::replace(&mut other.tags, Arena::new_in(alloc.clone())),
            &mut map.tags,
            &mut tags,
        )?;
        move_segments(
            &mut self.elems,
            core::mem::replace(&mut other.elems, Arena::new_in(alloc.clone())),
            &mut map.elems,
            &mut elems,
        )?;
        move_segments(
            &mut self.data,
            core::mem::replace(&mut other.data, Arena::new_in(alloc.clone())),
            &mut map.data,
            &mut data,
        )?;

        for id in funcs {
            if let Some(func) = self.funcs.get_mut(id) {
                remap_function(func, &map);
            }
        }
        for id in globals {
            if let Some(global) = self.globals.get_mut(id) {
                remap_global(global, &map);
            }
        }
        for id in tags {
            if let Some(tag) = self.tags.get_mut(id) {
                remap_tag(tag, &map);
            }
        }
        for id in elems {
            if let Some(segment) = self.elems.get_mut(id) {
                remap_element(segment, &map);
            }
        }
        for id in data {
            if let Some(segment) = self.data.get_mut(id) {
                remap_data(segment, &map);
            }
        }

        self.exports.try_reserve(other.exports.len())?;
        for mut export in other.exports.drain(..) {
            remap_export_target(&mut export.target, &map);
            self.exports.push(export);
        }
        if let Some(start) = other.start {
            self.start = Some(map.func(start));
        }
        self.import_kinds.try_reserve(other.import_kinds.len())?;
        self.import_kinds.extend_from_slice(&other.import_kinds);
        self.data_count |= other.data_count;
        trace!(
            "merged {} tables, {} memories and {} dropped custom sections",
            tables.len(),
            memories.len(),
            other.customs.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global as GlobalAlloc;
    use crate::module::{FunctionBody, ImportName};
    use crate::types::ValType;

    type TestModule = Module<GlobalAlloc>;

    fn body(
        module: &mut TestModule,
        instrs: &mut [Option<Instruction<GlobalAlloc>>],
    ) -> Function<GlobalAlloc> {
        let ty = module.get_or_create_type(&[], &[]).unwrap();
        Function::Defined(FunctionBody {
            ty,
            locals: Vec::new_in(GlobalAlloc),
            code: Expression::from_instructions(instrs, GlobalAlloc).unwrap(),
        })
    }

    fn import(module: &mut TestModule, field: &str) -> Function<GlobalAlloc> {
        let ty = module.get_or_create_type(&[ValType::I32], &[]).unwrap();
        Function::Imported {
            import: ImportName::new_in("env", field, GlobalAlloc).unwrap(),
            ty,
        }
    }

    #[test]
    fn replace_function_redirects_calls() {
        let mut module = TestModule::new_in(GlobalAlloc);
        let old = body(&mut module, &mut []);
        let old = module.add_function(old).unwrap();
        let new = body(&mut module, &mut []);
        let new = module.add_function(new).unwrap();
        let caller = body(&mut module, &mut [Some(Instruction::Call(old))]);
        let caller = module.add_function(caller).unwrap();
        module.add_export("f", ExportTarget::Function(old)).unwrap();
        module.start = Some(old);

        module.replace_function(old, new).unwrap();

        assert!(module.function(old).is_none());
        let code = &module.function(caller).unwrap().body().unwrap().code;
        assert!(matches!(code[0], Instruction::Call(id) if id == new));
        assert_eq!(module.exports()[0].target, ExportTarget::Function(new));
        assert_eq!(module.start, Some(new));
        assert_eq!(module.function_index(caller), Ok(1));
    }

    #[test]
    fn merge_preserves_imports_first_and_references() {
        let mut module = TestModule::new_in(GlobalAlloc);
        let first_import = import(&mut module, "a");
        module.add_function(first_import).unwrap();
        let local = body(&mut module, &mut []);
        module.add_function(local).unwrap();

        let mut other = TestModule::new_in(GlobalAlloc);
        let other_import = import(&mut other, "b");
        let imported = other.add_function(other_import).unwrap();
        let callee = body(&mut other, &mut []);
        let callee = other.add_function(callee).unwrap();
        let caller = body(
            &mut other,
            &mut [Some(Instruction::Call(callee)), Some(Instruction::Call(imported))],
        );
        let caller = other.add_function(caller).unwrap();
        other.add_export("caller", ExportTarget::Function(caller)).unwrap();

        module.merge(other).unwrap();

        let imported: std::vec::Vec<bool> = module
            .functions()
            .map(|(_, func)| func.is_imported())
            .collect();
        assert_eq!(imported, [true, true, false, false, false]);
        assert_eq!(module.types().count(), 2);

        let Some(ExportTarget::Function(caller)) = module.export("caller").map(|e| e.target) else {
            panic!("missing export");
        };
        assert_eq!(module.function_index(caller), Ok(4));
        let code = &module.function(caller).unwrap().body().unwrap().code;
        let Instruction::Call(callee) = code[0] else {
            panic!("expected a call");
        };
        let Instruction::Call(imported) = code[1] else {
            panic!("expected a call");
        };
        assert_eq!(module.function_index(callee), Ok(3));
        assert_eq!(module.function_index(imported), Ok(1));
    }

    #[test]
    fn merge_rejects_conflicts() {
        let mut module = TestModule::new_in(GlobalAlloc);
        let f = body(&mut module, &mut []);
        let f = module.add_function(f).unwrap();
        module.add_export("f", ExportTarget::Function(f)).unwrap();

        let mut other = TestModule::new_in(GlobalAlloc);
        let g = body(&mut other, &mut []);
        let g = other.add_function(g).unwrap();
        other.add_export("f", ExportTarget::Function(g)).unwrap();

        assert_eq!(module.merge(other), Err(Error::DuplicateExport));
        assert_eq!(module.functions().count(), 1);
    }
}
