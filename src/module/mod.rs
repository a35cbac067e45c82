// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The entity model of a module.
//!
//! Entities of each kind live in an arena owned by the [`Module`] and refer
//! to one another through typed handles. Indices exist only on the wire: they
//! are resolved to handles on decode and recomputed from positions on encode,
//! so mutation never invalidates a reference.
//!
//! Within each kind that can be imported, imported entities precede defined
//! ones, mirroring the index spaces of the binary format. Every insertion
//! preserves this.

mod arena;
mod image;
mod rewrite;

pub(crate) use arena::Arena;
pub use image::MemoryImage;

use core::fmt;

use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::types::{
    CustomSection, DataId, ElemId, Expression, ExternalKind, FuncId, FunctionType, GlobalId,
    GlobalType, Handle, MemId, MemoryType, Name, RefType, ReferenceError, TableId, TableType,
    TagId, TypeId, ValType, Version,
};
use crate::{Allocator, ErrorKind};

/// Errors from mutating a module.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Failed memory allocation.
    AllocError,
    /// A handle does not refer to an entity of the module.
    Reference(ReferenceError),
    /// An export of the same name already exists.
    DuplicateExport,
    /// Both modules of a merge have a start function.
    ConflictingStart,
    /// A data segment's offset is not a constant expression.
    NonConstantOffset(DataId),
    /// A data segment extends beyond the addressable range.
    OffsetOverflow(DataId),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AllocError => ErrorKind::Allocation,
            Error::Reference(_) => ErrorKind::Reference,
            Error::DuplicateExport
            | Error::ConflictingStart
            | Error::NonConstantOffset(_)
            | Error::OffsetOverflow(_) => ErrorKind::Structural,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::Reference(err) => write!(f, "{err}"),
            Error::DuplicateExport => write!(f, "duplicate export name"),
            Error::ConflictingStart => write!(f, "both modules have a start function"),
            Error::NonConstantOffset(id) => write!(f, "non-constant offset for {id:?}"),
            Error::OffsetOverflow(id) => write!(f, "{id:?} extends past the address space"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::AllocError
    }
}

impl From<ReferenceError> for Error {
    fn from(err: ReferenceError) -> Self {
        Error::Reference(err)
    }
}

/// The two-level name of an import.
#[derive(Debug)]
pub struct ImportName<A: Allocator> {
    /// Name of the module to import from.
    pub module: Name<A>,
    /// Name of the imported entity.
    pub field: Name<A>,
}

impl<A: Allocator> ImportName<A> {
    pub fn new_in(module: &str, field: &str, alloc: A) -> Result<Self, TryReserveError> {
        Ok(Self {
            module: Name::from_str_in(module, alloc.clone())?,
            field: Name::from_str_in(field, alloc)?,
        })
    }
}

/// An entity that is either imported or defined by the module.
pub trait Entity<A: Allocator> {
    /// The import name, if the entity is imported.
    fn import(&self) -> Option<&ImportName<A>>;

    fn is_imported(&self) -> bool {
        self.import().is_some()
    }
}

macro_rules! impl_entity {
    ($type:ident) => {
        impl<A: Allocator> Entity<A> for $type<A> {
            fn import(&self) -> Option<&ImportName<A>> {
                match self {
                    $type::Imported { import, .. } => Some(import),
                    _ => None,
                }
            }
        }
    };
}

/// The code of a defined function.
#[derive(Debug)]
pub struct FunctionBody<A: Allocator> {
    pub ty: TypeId,
    /// The declared locals, which follow the parameters in the local index
    /// space.
    pub locals: Vec<ValType, A>,
    pub code: Expression<A>,
}

#[derive(Debug)]
pub enum Function<A: Allocator> {
    Imported { import: ImportName<A>, ty: TypeId },
    Defined(FunctionBody<A>),
}

impl<A: Allocator> Function<A> {
    pub fn ty(&self) -> TypeId {
        match self {
            Function::Imported { ty, .. } => *ty,
            Function::Defined(body) => body.ty,
        }
    }

    pub fn body(&self) -> Option<&FunctionBody<A>> {
        match self {
            Function::Imported { .. } => None,
            Function::Defined(body) => Some(body),
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut FunctionBody<A>> {
        match self {
            Function::Imported { .. } => None,
            Function::Defined(body) => Some(body),
        }
    }
}

#[derive(Debug)]
pub enum Table<A: Allocator> {
    Imported { import: ImportName<A>, ty: TableType },
    Defined(TableType),
}

impl<A: Allocator> Table<A> {
    pub fn ty(&self) -> TableType {
        match self {
            Table::Imported { ty, .. } | Table::Defined(ty) => *ty,
        }
    }
}

#[derive(Debug)]
pub enum Memory<A: Allocator> {
    Imported { import: ImportName<A>, ty: MemoryType },
    Defined(MemoryType),
}

impl<A: Allocator> Memory<A> {
    pub fn ty(&self) -> MemoryType {
        match self {
            Memory::Imported { ty, .. } | Memory::Defined(ty) => *ty,
        }
    }
}

#[derive(Debug)]
pub enum Global<A: Allocator> {
    Imported {
        import: ImportName<A>,
        ty: GlobalType,
    },
    Defined {
        ty: GlobalType,
        init: Expression<A>,
    },
}

impl<A: Allocator> Global<A> {
    pub fn ty(&self) -> GlobalType {
        match self {
            Global::Imported { ty, .. } | Global::Defined { ty, .. } => *ty,
        }
    }
}

/// An exception tag, whose type gives the exception's payload.
#[derive(Debug)]
pub enum Tag<A: Allocator> {
    Imported { import: ImportName<A>, ty: TypeId },
    Defined(TypeId),
}

impl<A: Allocator> Tag<A> {
    pub fn ty(&self) -> TypeId {
        match self {
            Tag::Imported { ty, .. } | Tag::Defined(ty) => *ty,
        }
    }
}

impl_entity!(Function);
impl_entity!(Table);
impl_entity!(Memory);
impl_entity!(Global);
impl_entity!(Tag);

/// Element segment mode.
#[derive(Debug)]
pub enum ElementMode<A: Allocator> {
    /// Copied into the table at instantiation.
    Active {
        table: TableId,
        offset: Expression<A>,
    },
    Passive,
    Declarative,
}

/// The initial values of an element segment.
#[derive(Debug)]
pub enum ElementItems<A: Allocator> {
    /// Function references, by handle.
    Functions(Vec<FuncId, A>),
    /// Constant reference-typed expressions.
    Expressions {
        ty: RefType,
        exprs: Vec<Expression<A>, A>,
    },
}

#[derive(Debug)]
pub struct ElementSegment<A: Allocator> {
    pub mode: ElementMode<A>,
    pub items: ElementItems<A>,
    /// Whether an active segment spells out its table (and element kind)
    /// even when they could be left implicit.
    pub explicit_table: bool,
}

/// An active data segment for memory 0.
#[derive(Debug)]
pub struct DataSegment<A: Allocator> {
    /// Expression computing the address to copy to.
    pub offset: Expression<A>,
    pub bytes: Vec<u8, A>,
}

/// What an export refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExportTarget {
    Function(FuncId),
    Table(TableId),
    Memory(MemId),
    Global(GlobalId),
    Tag(TagId),
}

impl ExportTarget {
    pub fn kind(self) -> ExternalKind {
        match self {
            ExportTarget::Function(_) => ExternalKind::Function,
            ExportTarget::Table(_) => ExternalKind::Table,
            ExportTarget::Memory(_) => ExternalKind::Memory,
            ExportTarget::Global(_) => ExternalKind::Global,
            ExportTarget::Tag(_) => ExternalKind::Tag,
        }
    }
}

/// An export declaration. Names are unique within a module.
#[derive(Debug)]
pub struct Export<A: Allocator> {
    pub name: Name<A>,
    pub target: ExportTarget,
}

/// A WebAssembly module.
#[derive(Debug)]
pub struct Module<A: Allocator> {
    /// Module version.
    pub version: Version,
    pub(crate) types: Arena<TypeId, FunctionType<A>, A>,
    pub(crate) funcs: Arena<FuncId, Function<A>, A>,
    pub(crate) tables: Arena<TableId, Table<A>, A>,
    pub(crate) memories: Arena<MemId, Memory<A>, A>,
    pub(crate) globals: Arena<GlobalId, Global<A>, A>,
    pub(crate) tags: Arena<TagId, Tag<A>, A>,
    pub(crate) elems: Arena<ElemId, ElementSegment<A>, A>,
    pub(crate) data: Arena<DataId, DataSegment<A>, A>,
    pub(crate) exports: Vec<Export<A>, A>,
    /// The start function, if any.
    pub start: Option<FuncId>,
    // The kinds of the decoded imports, in section order.
    pub(crate) import_kinds: Vec<ExternalKind, A>,
    /// Retained custom sections, in module order.
    pub customs: Vec<CustomSection<A>, A>,
    /// Whether a data count section is emitted.
    pub data_count: bool,
    pub(crate) alloc: A,
}

// Accessors for one entity kind: lookup, iteration and index resolution.
macro_rules! entity_accessors {
    (
        $field:ident, $id:ty, $entity:ty,
        $get:ident, $get_mut:ident, $iter:ident, $index:ident, $at:ident
    ) => {
        pub fn $get(&self, id: $id) -> Option<&$entity> {
            self.$field.get(id)
        }

        pub fn $get_mut(&mut self, id: $id) -> Option<&mut $entity> {
            self.$field.get_mut(id)
        }

        /// All entities of this kind, in index order.
        pub fn $iter(&self) -> impl Iterator<Item = ($id, &$entity)> + '_ {
            self.$field.iter()
        }

        /// The current index of the entity, by positional lookup.
        pub fn $index(&self, id: $id) -> Result<u32, ReferenceError> {
            self.$field.position(id).ok_or_else(|| id.unresolved())
        }

        /// The entity at the given index.
        pub fn $at(&self, index: u32) -> Option<$id> {
            self.$field.handle_at(index)
        }
    };
}

impl<A: Allocator> Module<A> {
    /// Creates an empty module.
    pub fn new_in(alloc: A) -> Self {
        Self {
            version: Version::V1,
            types: Arena::new_in(alloc.clone()),
            funcs: Arena::new_in(alloc.clone()),
            tables: Arena::new_in(alloc.clone()),
            memories: Arena::new_in(alloc.clone()),
            globals: Arena::new_in(alloc.clone()),
            tags: Arena::new_in(alloc.clone()),
            elems: Arena::new_in(alloc.clone()),
            data: Arena::new_in(alloc.clone()),
            exports: Vec::new_in(alloc.clone()),
            start: None,
            import_kinds: Vec::new_in(alloc.clone()),
            customs: Vec::new_in(alloc.clone()),
            data_count: false,
            alloc,
        }
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    entity_accessors!(
        types,
        TypeId,
        FunctionType<A>,
        ty,
        ty_mut,
        types,
        type_index,
        type_at
    );
    entity_accessors!(
        funcs,
        FuncId,
        Function<A>,
        function,
        function_mut,
        functions,
        function_index,
        function_at
    );
    entity_accessors!(
        tables, TableId, Table<A>, table, table_mut, tables, table_index, table_at
    );
    entity_accessors!(
        memories,
        MemId,
        Memory<A>,
        memory,
        memory_mut,
        memories,
        memory_index,
        memory_at
    );
    entity_accessors!(
        globals,
        GlobalId,
        Global<A>,
        global,
        global_mut,
        globals,
        global_index,
        global_at
    );
    entity_accessors!(tags, TagId, Tag<A>, tag, tag_mut, tags, tag_index, tag_at);
    entity_accessors!(
        elems,
        ElemId,
        ElementSegment<A>,
        element,
        element_mut,
        elements,
        element_index,
        element_at
    );
    entity_accessors!(
        data,
        DataId,
        DataSegment<A>,
        data_segment,
        data_segment_mut,
        data_segments,
        data_index,
        data_at
    );

    pub fn exports(&self) -> &[Export<A>] {
        &self.exports
    }

    /// The number of parameters and declared locals of a defined function.
    pub fn local_count(&self, id: FuncId) -> Result<u32, ReferenceError> {
        let func = self.funcs.get(id).ok_or_else(|| id.unresolved())?;
        let ty = self.types.get(func.ty()).ok_or_else(|| func.ty().unresolved())?;
        let declared = func.body().map_or(0, |body| body.locals.len());
        Ok((ty.parameters.len() + declared) as u32)
    }

    /// Returns a type with the given signature, adding one if none exists.
    pub fn get_or_create_type(
        &mut self,
        parameters: &[ValType],
        results: &[ValType],
    ) -> Result<TypeId, Error> {
        if let Some((id, _)) = self
            .types
            .iter()
            .find(|(_, ty)| ty.matches(parameters, results))
        {
            return Ok(id);
        }
        let ty = FunctionType::new_in(parameters, results, self.alloc.clone())?;
        Ok(self.types.push(ty)?)
    }

    // Imported entities go right after the existing imports; defined ones at
    // the end.
    fn add_entity<Id: Handle, T: Entity<A>>(
        arena: &mut Arena<Id, T, A>,
        entity: T,
    ) -> Result<Id, Error> {
        let id = if entity.is_imported() {
            let pos = arena.leading(|entity: &T| entity.is_imported());
            arena.insert(pos, entity)?
        } else {
            arena.push(entity)?
        };
        Ok(id)
    }

    pub fn add_function(&mut self, func: Function<A>) -> Result<FuncId, Error> {
        self.types.get(func.ty()).ok_or_else(|| func.ty().unresolved())?;
        Self::add_entity(&mut self.funcs, func)
    }

    pub fn add_table(&mut self, table: Table<A>) -> Result<TableId, Error> {
        Self::add_entity(&mut self.tables, table)
    }

    pub fn add_memory(&mut self, memory: Memory<A>) -> Result<MemId, Error> {
        Self::add_entity(&mut self.memories, memory)
    }

    pub fn add_global(&mut self, global: Global<A>) -> Result<GlobalId, Error> {
        Self::add_entity(&mut self.globals, global)
    }

    pub fn add_tag(&mut self, tag: Tag<A>) -> Result<TagId, Error> {
        self.types.get(tag.ty()).ok_or_else(|| tag.ty().unresolved())?;
        Self::add_entity(&mut self.tags, tag)
    }

    pub fn add_element(&mut self, segment: ElementSegment<A>) -> Result<ElemId, Error> {
        Ok(self.elems.push(segment)?)
    }

    pub fn add_data(&mut self, segment: DataSegment<A>) -> Result<DataId, Error> {
        Ok(self.data.push(segment)?)
    }

    fn target_exists(&self, target: ExportTarget) -> Result<(), ReferenceError> {
        let exists = match target {
            ExportTarget::Function(id) => self.funcs.contains(id),
            ExportTarget::Table(id) => self.tables.contains(id),
            ExportTarget::Memory(id) => self.memories.contains(id),
            ExportTarget::Global(id) => self.globals.contains(id),
            ExportTarget::Tag(id) => self.tags.contains(id),
        };
        if exists {
            return Ok(());
        }
        Err(match target {
            ExportTarget::Function(id) => id.unresolved(),
            ExportTarget::Table(id) => id.unresolved(),
            ExportTarget::Memory(id) => id.unresolved(),
            ExportTarget::Global(id) => id.unresolved(),
            ExportTarget::Tag(id) => id.unresolved(),
        })
    }

    pub fn export(&self, name: &str) -> Option<&Export<A>> {
        self.exports.iter().find(|export| export.name == name)
    }

    /// Exports `target` under `name`, which must not already be exported.
    pub fn add_export(&mut self, name: &str, target: ExportTarget) -> Result<(), Error> {
        if self.export(name).is_some() {
            return Err(Error::DuplicateExport);
        }
        self.target_exists(target)?;
        let name = Name::from_str_in(name, self.alloc.clone())?;
        self.exports.try_reserve(1)?;
        self.exports.push(Export { name, target });
        Ok(())
    }

    /// Removes the export of the given name, returning what it referred to.
    pub fn remove_export(&mut self, name: &str) -> Option<ExportTarget> {
        let pos = self.exports.iter().position(|export| export.name == name)?;
        Some(self.exports.remove(pos).target)
    }

    /// Removes every export of `target`, returning how many there were. The
    /// entity itself is untouched.
    pub fn remove_exports_by_ref(&mut self, target: ExportTarget) -> usize {
        let before = self.exports.len();
        self.exports.retain(|export| export.target != target);
        before - self.exports.len()
    }

    // Finds an entity by name: first among imports (optionally restricted to
    // an import module), then among exports.
    fn lookup<Id: Handle, T: Entity<A>>(
        &self,
        arena: &Arena<Id, T, A>,
        name: &str,
        namespace: Option<&str>,
        from_export: impl Fn(ExportTarget) -> Option<Id>,
    ) -> Option<Id> {
        let imported = arena.iter().find(|(_, entity)| {
            entity.import().is_some_and(|import| {
                import.field == name && namespace.is_none_or(|ns| import.module == ns)
            })
        });
        if let Some((id, _)) = imported {
            return Some(id);
        }
        if namespace.is_some() {
            return None;
        }
        self.export(name).and_then(|export| from_export(export.target))
    }

    pub fn lookup_function(&self, name: &str, namespace: Option<&str>) -> Option<FuncId> {
        self.lookup(&self.funcs, name, namespace, |target| match target {
            ExportTarget::Function(id) => Some(id),
            _ => None,
        })
    }

    pub fn lookup_table(&self, name: &str, namespace: Option<&str>) -> Option<TableId> {
        self.lookup(&self.tables, name, namespace, |target| match target {
            ExportTarget::Table(id) => Some(id),
            _ => None,
        })
    }

    pub fn lookup_memory(&self, name: &str, namespace: Option<&str>) -> Option<MemId> {
        self.lookup(&self.memories, name, namespace, |target| match target {
            ExportTarget::Memory(id) => Some(id),
            _ => None,
        })
    }

    pub fn lookup_global(&self, name: &str, namespace: Option<&str>) -> Option<GlobalId> {
        self.lookup(&self.globals, name, namespace, |target| match target {
            ExportTarget::Global(id) => Some(id),
            _ => None,
        })
    }

    pub fn lookup_tag(&self, name: &str, namespace: Option<&str>) -> Option<TagId> {
        self.lookup(&self.tags, name, namespace, |target| match target {
            ExportTarget::Tag(id) => Some(id),
            _ => None,
        })
    }
}
