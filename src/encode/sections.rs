// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Standard section payloads.

use crate::Allocator;
use crate::module::{
    DataSegment, ElementItems, ElementMode, ElementSegment, Entity, Function, Global, ImportName,
    Memory, Table, Tag,
};
use crate::types::{
    ExternalKind, GlobalType, Limits, RefType, SectionId, TableType, TagAttribute, ValType,
};

use super::sink::{Measure, Sink};
use super::{Encoder, Error};

// Element segment flags: bit 0 marks a passive or declarative segment, bit 1
// an explicit table (when active) or a declarative segment (when not), and
// bit 2 items given as expressions.
const ELEM_PASSIVE: u32 = 0b001;
const ELEM_EXPLICIT_TABLE: u32 = 0b010;
const ELEM_DECLARATIVE: u32 = 0b011;
const ELEM_EXPRESSIONS: u32 = 0b100;

// The element kind byte of function-index items.
const ELEM_KIND_FUNCREF: u8 = 0x00;

// The mode of an active data segment for memory 0.
const DATA_ACTIVE: u32 = 0;

const FUNCTION_TYPE_TOKEN: u8 = 0x60;

const EXTERNAL_KINDS: [ExternalKind; 5] = [
    ExternalKind::Function,
    ExternalKind::Table,
    ExternalKind::Memory,
    ExternalKind::Global,
    ExternalKind::Tag,
];

impl<A: Allocator> Encoder<'_, '_, A> {
    pub(super) fn standard_section<S: Sink>(&self, sink: &mut S, id: SectionId) -> Result<(), Error> {
        match id {
            SectionId::Custom => Err(Error::NotAStandardSection),
            SectionId::Type => self.types(sink),
            SectionId::Import => self.imports(sink),
            SectionId::Function => self.functions(sink),
            SectionId::Table => self.tables(sink),
            SectionId::Memory => self.memories(sink),
            SectionId::Tag => self.tags(sink),
            SectionId::Global => self.globals(sink),
            SectionId::Export => self.exports(sink),
            SectionId::Start => match self.module.start {
                Some(func) => sink.put_u32(self.index(func)?),
                None => Ok(()),
            },
            SectionId::Element => self.elements(sink),
            SectionId::DataCount => sink.put_len(self.data_segment_count()),
            SectionId::Code => self.code(sink),
            SectionId::Data => self.data(sink),
        }
    }

    // The number of segments the data section will hold, which is none if it
    // is replaced by its placeholder.
    fn data_segment_count(&self) -> usize {
        if self.options.is_excluded(SectionId::Data) {
            0
        } else {
            self.module.data.len()
        }
    }

    fn value_types<S: Sink>(sink: &mut S, types: &[ValType]) -> Result<(), Error> {
        sink.put_len(types.len())?;
        for ty in types {
            sink.put_byte(*ty as u8)?;
        }
        Ok(())
    }

    fn limits<S: Sink>(sink: &mut S, limits: Limits) -> Result<(), Error> {
        sink.put_byte(limits.flags())?;
        sink.put_u32(limits.min)?;
        match limits.max {
            Some(max) => sink.put_u32(max),
            None => Ok(()),
        }
    }

    fn table_type<S: Sink>(sink: &mut S, ty: TableType) -> Result<(), Error> {
        sink.put_byte(ty.reftype as u8)?;
        Self::limits(sink, ty.limits)
    }

    fn global_type<S: Sink>(sink: &mut S, ty: GlobalType) -> Result<(), Error> {
        sink.put_byte(ty.value as u8)?;
        sink.put_byte(ty.mutability as u8)
    }

    fn types<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        sink.put_len(self.module.types.len())?;
        for (_, ty) in self.module.types.iter() {
            sink.put_byte(FUNCTION_TYPE_TOKEN)?;
            Self::value_types(sink, &ty.parameters)?;
            Self::value_types(sink, &ty.results)?;
        }
        Ok(())
    }

    // The number of imported entities of a kind, which lead their arena.
    fn imported(&self, kind: ExternalKind) -> usize {
        let module = self.module;
        match kind {
            ExternalKind::Function => module.funcs.leading(|entity| entity.is_imported()),
            ExternalKind::Table => module.tables.leading(|entity| entity.is_imported()),
            ExternalKind::Memory => module.memories.leading(|entity| entity.is_imported()),
            ExternalKind::Global => module.globals.leading(|entity| entity.is_imported()),
            ExternalKind::Tag => module.tags.leading(|entity| entity.is_imported()),
        }
    }

    pub(super) fn import_count(&self) -> usize {
        EXTERNAL_KINDS.iter().map(|&kind| self.imported(kind)).sum()
    }

    fn import_name<S: Sink>(sink: &mut S, import: &ImportName<A>) -> Result<(), Error> {
        sink.put_name(import.module.as_str())?;
        sink.put_name(import.field.as_str())
    }

    // Writes the import at the given index of its kind, returning false if
    // there is no such import.
    fn import<S: Sink>(&self, sink: &mut S, kind: ExternalKind, index: usize) -> Result<bool, Error> {
        let module = self.module;
        let index = index as u32;
        match kind {
            ExternalKind::Function => {
                let entity = module.function_at(index).and_then(|id| module.function(id));
                let Some(Function::Imported { import, ty }) = entity else {
                    return Ok(false);
                };
                Self::import_name(sink, import)?;
                sink.put_byte(kind as u8)?;
                sink.put_u32(self.index(*ty)?)?;
            }
            ExternalKind::Table => {
                let entity = module.table_at(index).and_then(|id| module.table(id));
                let Some(Table::Imported { import, ty }) = entity else {
                    return Ok(false);
                };
                Self::import_name(sink, import)?;
                sink.put_byte(kind as u8)?;
                Self::table_type(sink, *ty)?;
            }
            ExternalKind::Memory => {
                let entity = module.memory_at(index).and_then(|id| module.memory(id));
                let Some(Memory::Imported { import, ty }) = entity else {
                    return Ok(false);
                };
                Self::import_name(sink, import)?;
                sink.put_byte(kind as u8)?;
                Self::limits(sink, ty.limits)?;
            }
            ExternalKind::Global => {
                let entity = module.global_at(index).and_then(|id| module.global(id));
                let Some(Global::Imported { import, ty }) = entity else {
                    return Ok(false);
                };
                Self::import_name(sink, import)?;
                sink.put_byte(kind as u8)?;
                Self::global_type(sink, *ty)?;
            }
            ExternalKind::Tag => {
                let entity = module.tag_at(index).and_then(|id| module.tag(id));
                let Some(Tag::Imported { import, ty }) = entity else {
                    return Ok(false);
                };
                Self::import_name(sink, import)?;
                sink.put_byte(kind as u8)?;
                sink.put_byte(TagAttribute::Exception as u8)?;
                sink.put_u32(self.index(*ty)?)?;
            }
        }
        Ok(true)
    }

    // Imports are written in their decoded interleaving, followed by any
    // added since, grouped by kind.
    fn imports<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        sink.put_len(self.import_count())?;
        let mut next = [0usize; EXTERNAL_KINDS.len()];
        for &kind in self.module.import_kinds.iter() {
            if self.import(sink, kind, next[kind as usize])? {
                next[kind as usize] += 1;
            }
        }
        for kind in EXTERNAL_KINDS {
            while self.import(sink, kind, next[kind as usize])? {
                next[kind as usize] += 1;
            }
        }
        Ok(())
    }

    fn functions<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        let module = self.module;
        let count = module.funcs.iter().filter(|(_, f)| !f.is_imported()).count();
        sink.put_len(count)?;
        for (_, func) in module.funcs.iter() {
            if let Function::Defined(body) = func {
                sink.put_u32(self.index(body.ty)?)?;
            }
        }
        Ok(())
    }

    fn tables<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        let tables = &self.module.tables;
        sink.put_len(tables.len() - tables.leading(|entity| entity.is_imported()))?;
        for (_, table) in tables.iter() {
            if let Table::Defined(ty) = table {
                Self::table_type(sink, *ty)?;
            }
        }
        Ok(())
    }

    fn memories<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        let memories = &self.module.memories;
        sink.put_len(memories.len() - memories.leading(|entity| entity.is_imported()))?;
        for (_, memory) in memories.iter() {
            if let Memory::Defined(ty) = memory {
                Self::limits(sink, ty.limits)?;
            }
        }
        Ok(())
    }

    fn tags<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        let tags = &self.module.tags;
        sink.put_len(tags.len() - tags.leading(|entity| entity.is_imported()))?;
        for (_, tag) in tags.iter() {
            if let Tag::Defined(ty) = tag {
                sink.put_byte(TagAttribute::Exception as u8)?;
                sink.put_u32(self.index(*ty)?)?;
            }
        }
        Ok(())
    }

    fn globals<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        let globals = &self.module.globals;
        sink.put_len(globals.len() - globals.leading(|entity| entity.is_imported()))?;
        for (_, global) in globals.iter() {
            if let Global::Defined { ty, init } = global {
                Self::global_type(sink, *ty)?;
                self.expression(sink, init)?;
            }
        }
        Ok(())
    }

    fn exports<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        use crate::module::ExportTarget;

        sink.put_len(self.module.exports.len())?;
        for export in self.module.exports.iter() {
            sink.put_name(export.name.as_str())?;
            sink.put_byte(export.target.kind() as u8)?;
            let index = match export.target {
                ExportTarget::Function(id) => self.index(id)?,
                ExportTarget::Table(id) => self.index(id)?,
                ExportTarget::Memory(id) => self.index(id)?,
                ExportTarget::Global(id) => self.index(id)?,
                ExportTarget::Tag(id) => self.index(id)?,
            };
            sink.put_u32(index)?;
        }
        Ok(())
    }

    // The flags of an element segment. Active segments use the compact form,
    // with an implicit table 0 and function references, wherever possible
    // unless they asked otherwise.
    fn element_flags(&self, segment: &ElementSegment<A>) -> Result<u32, Error> {
        let expressions = matches!(segment.items, ElementItems::Expressions { .. });
        let mut flags = if expressions { ELEM_EXPRESSIONS } else { 0 };
        match &segment.mode {
            ElementMode::Active { table, .. } => {
                let funcref = match &segment.items {
                    ElementItems::Functions(_) => true,
                    ElementItems::Expressions { ty, .. } => *ty == RefType::Func,
                };
                if segment.explicit_table || self.index(*table)? != 0 || !funcref {
                    flags |= ELEM_EXPLICIT_TABLE;
                }
            }
            ElementMode::Passive => flags |= ELEM_PASSIVE,
            ElementMode::Declarative => flags |= ELEM_DECLARATIVE,
        }
        Ok(flags)
    }

    fn element<S: Sink>(&self, sink: &mut S, segment: &ElementSegment<A>) -> Result<(), Error> {
        let flags = self.element_flags(segment)?;
        sink.put_u32(flags)?;
        if let ElementMode::Active { table, offset } = &segment.mode {
            if flags & ELEM_EXPLICIT_TABLE != 0 {
                sink.put_u32(self.index(*table)?)?;
            }
            self.expression(sink, offset)?;
        }
        // Only the compact active forms leave out the element kind or type.
        let compact = matches!(segment.mode, ElementMode::Active { .. })
            && flags & ELEM_EXPLICIT_TABLE == 0;
        match &segment.items {
            ElementItems::Functions(funcs) => {
                if !compact {
                    sink.put_byte(ELEM_KIND_FUNCREF)?;
                }
                sink.put_len(funcs.len())?;
                for func in funcs.iter() {
                    sink.put_u32(self.index(*func)?)?;
                }
            }
            ElementItems::Expressions { ty, exprs } => {
                if !compact {
                    sink.put_byte(*ty as u8)?;
                }
                sink.put_len(exprs.len())?;
                for expr in exprs.iter() {
                    self.expression(sink, expr)?;
                }
            }
        }
        Ok(())
    }

    fn elements<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        sink.put_len(self.module.elems.len())?;
        for (_, segment) in self.module.elems.iter() {
            self.element(sink, segment)?;
        }
        Ok(())
    }

    // Declared locals as runs of the same type.
    fn locals<S: Sink>(sink: &mut S, locals: &[ValType]) -> Result<(), Error> {
        let runs = locals.chunk_by(|a, b| a == b);
        sink.put_len(runs.clone().count())?;
        for run in runs {
            sink.put_len(run.len())?;
            sink.put_byte(run[0] as u8)?;
        }
        Ok(())
    }

    fn code<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        let module = self.module;
        let count = module.funcs.iter().filter(|(_, f)| !f.is_imported()).count();
        sink.put_len(count)?;
        for (_, func) in module.funcs.iter() {
            let Function::Defined(body) = func else {
                continue;
            };
            let mut measure = Measure::default();
            Self::locals(&mut measure, &body.locals)?;
            self.expression(&mut measure, &body.code)?;
            sink.put_len(measure.written())?;
            Self::locals(sink, &body.locals)?;
            self.expression(sink, &body.code)?;
        }
        Ok(())
    }

    fn data_segment<S: Sink>(&self, sink: &mut S, segment: &DataSegment<A>) -> Result<(), Error> {
        sink.put_u32(DATA_ACTIVE)?;
        self.expression(sink, &segment.offset)?;
        sink.put_len(segment.bytes.len())?;
        sink.put_bytes(&segment.bytes)
    }

    fn data<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        sink.put_len(self.module.data.len())?;
        for (_, segment) in self.module.data.iter() {
            self.data_segment(sink, segment)?;
        }
        Ok(())
    }
}
