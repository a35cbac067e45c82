// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly type definitions.
//!
//! This module contains the value-level vocabulary shared by the decoder, the
//! encoder and the entity model: value and reference types, limits, names,
//! section identifiers and the typed handles by which entities refer to one
//! another.

mod instr;
pub use instr::*;

use core::{cmp, fmt, str};

use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::boxed::Box;
use crate::core_compat::vec::Vec;

// Defines a public newtype without public mutable access to the underlying
// type, along with some convenience trait implementations like Deref and AsRef.
macro_rules! newtype {
    (
        $(#[$meta:meta])*
        pub struct $type:ident<A: Allocator>($underlying:ty);
    ) => {
        $(#[$meta])*
        pub struct $type<A: Allocator>($underlying);

        newtype!(@impl [A: Allocator], $type<A>, $underlying);
    };
    (
        $(#[$meta:meta])*
        pub struct $type:ident($underlying:ty);
    ) => {
        $(#[$meta])*
        pub struct $type($underlying);

        newtype!(@impl [], $type, $underlying);
    };
    (@impl [$($generic_params:tt)*], $qualified_type:ty, $underlying:ty) => {
        impl<$($generic_params)*> $qualified_type {
            pub fn new(value: $underlying) -> Self {
                Self(value)
            }
        }

        impl<$($generic_params)*> ::core::ops::Deref for $qualified_type {
            type Target = $underlying;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl<$($generic_params)*> AsRef<$underlying> for $qualified_type {
            fn as_ref(&self) -> &$underlying {
                &self.0
            }
        }
    };
}
pub(crate) use newtype;

/// WebAssembly module version.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum Version {
    V1 = 1,
}

newtype!(
    /// A name (of a module, field, export or custom section).
    #[derive(Debug)]
    pub struct Name<A: Allocator>(Box<str, A>);
);

impl<A: Allocator> Name<A> {
    /// Validates `bytes` as UTF-8 and takes ownership of them as a name.
    pub fn from_utf8(bytes: Vec<u8, A>) -> Result<Self, str::Utf8Error> {
        str::from_utf8(&bytes)?;
        let (ptr, alloc) = Box::into_raw_with_allocator(bytes.into_boxed_slice());

        // Safety: The ABIs of [u8] and str are identical, and we have already
        // validated that the byte sequence is valid UTF-8.
        let str = unsafe { Box::from_raw_in(ptr as *mut str, alloc) };
        Ok(Self(str))
    }

    /// Copies `name` into a new allocation.
    pub fn from_str_in(name: &str, alloc: A) -> Result<Self, TryReserveError> {
        let mut bytes = Vec::new_in(alloc);
        bytes.try_reserve_exact(name.len())?;
        bytes.extend_from_slice(name.as_bytes());
        // Already known to be UTF-8.
        Ok(Self::from_utf8(bytes).unwrap_or_else(|_| unreachable!()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<A: Allocator> PartialEq<str> for Name<A> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<A: Allocator> PartialEq<&str> for Name<A> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<A: Allocator> fmt::Display for Name<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The type of a reference to an object in the runtime store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum RefType {
    /// Function reference type.
    Func = 0x70,
    /// External reference type.
    Extern = 0x6f,
}

/// Value types classify the individual values that WebAssembly code can compute
/// with and the values that a variable accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ValType {
    /// 32-bit integer.
    I32 = 0x7f,
    /// 64-bit integer.
    I64 = 0x7e,
    /// 32-bit floating point number.
    F32 = 0x7d,
    /// 64-bit floating point number.
    F64 = 0x7c,
    /// 128-bit SIMD vector.
    V128 = 0x7b,
    /// Function reference.
    FuncRef = RefType::Func as u8,
    /// External reference.
    ExternRef = RefType::Extern as u8,
}

/// The signature of a function, mapping parameters to results. Also used as
/// the signature of multi-value blocks and of exception tags.
///
/// Types are never mutated once they are part of a module; two types with the
/// same parameters and results are interchangeable.
#[derive(Clone, Debug)]
pub struct FunctionType<A: Allocator> {
    pub parameters: Vec<ValType, A>,
    pub results: Vec<ValType, A>,
}

impl<A: Allocator> FunctionType<A> {
    /// Copies the given signature into a new allocation.
    pub fn new_in(
        parameters: &[ValType],
        results: &[ValType],
        alloc: A,
    ) -> Result<Self, TryReserveError> {
        let mut params = Vec::new_in(alloc.clone());
        params.try_reserve_exact(parameters.len())?;
        params.extend_from_slice(parameters);
        let mut res = Vec::new_in(alloc);
        res.try_reserve_exact(results.len())?;
        res.extend_from_slice(results);
        Ok(Self {
            parameters: params,
            results: res,
        })
    }

    /// Whether this type has the given signature.
    pub fn matches(&self, parameters: &[ValType], results: &[ValType]) -> bool {
        self.parameters.as_slice() == parameters && self.results.as_slice() == results
    }
}

/// The size range of the resizeable storage associated with memory (# of pages)
/// and table types (# of elements).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Limits {
    /// Minimum size.
    pub min: u32,
    /// Maximum size, with None indicating that there is no upper limit.
    pub max: Option<u32>,
    /// Whether the storage may be shared between threads. Only memories can
    /// be shared.
    pub shared: bool,
}

impl Limits {
    pub const fn new(min: u32, max: Option<u32>) -> Self {
        Self {
            min,
            max,
            shared: false,
        }
    }

    // The flags byte that leads the limits on the wire.
    pub(crate) const fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.max.is_some() {
            flags |= LIMITS_HAS_MAX;
        }
        if self.shared {
            flags |= LIMITS_SHARED;
        }
        flags
    }
}

pub(crate) const LIMITS_HAS_MAX: u8 = 0x01;
pub(crate) const LIMITS_SHARED: u8 = 0x02;

/// A linear memory type with its size limits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryType {
    pub limits: Limits,
}

impl MemoryType {
    /// The WebAssembly page size.
    pub const PAGE_SIZE: usize = 0x1_0000; // 64 KiB

    /// The minimum size in bytes of the linear memory region.
    pub const fn min_size_bytes(&self) -> usize {
        (self.limits.min as usize) * Self::PAGE_SIZE
    }

    /// The maximum size in bytes of the linear memory region, if any.
    pub fn max_size_bytes(&self) -> Option<usize> {
        self.limits.max.map(|max| (max as usize) * Self::PAGE_SIZE)
    }
}

/// WebAssembly table type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableType {
    /// Type of references stored in table.
    pub reftype: RefType,
    /// Table size limits.
    pub limits: Limits,
}

/// The mutability of a global variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum GlobalTypeMutability {
    /// Immutable.
    Const = 0x00,
    /// Mutable.
    Var = 0x01,
}

/// The type of a global variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GlobalType {
    /// The type of the global.
    pub value: ValType,

    /// The mutability of the global.
    pub mutability: GlobalTypeMutability,
}

/// The kind byte of an import or export descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExternalKind {
    Function = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
    Tag = 0x04,
}

/// The attribute byte of a tag type. Only exceptions are defined.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum TagAttribute {
    Exception = 0x00,
}

/// The index spaces of a module, which are also the kinds of entity a
/// handle can refer to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexSpace {
    Type,
    Function,
    Table,
    Memory,
    Global,
    Tag,
    Element,
    Data,
    Local,
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexSpace::Type => "type",
            IndexSpace::Function => "function",
            IndexSpace::Table => "table",
            IndexSpace::Memory => "memory",
            IndexSpace::Global => "global",
            IndexSpace::Tag => "tag",
            IndexSpace::Element => "element segment",
            IndexSpace::Data => "data segment",
            IndexSpace::Local => "local",
        };
        f.write_str(name)
    }
}

/// A reference to an entity that does not exist in the module it is being
/// resolved against.
///
/// `handle` is the raw handle value when resolving a handle to an index, and
/// the raw index when resolving a decoded index to a handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReferenceError {
    pub space: IndexSpace,
    pub handle: u32,
}

impl fmt::Display for ReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unresolved {} reference ({:#x})", self.space, self.handle)
    }
}

/// A typed, stable reference to an entity owned by a module.
///
/// Handles are never reused within a module: once an entity is removed, its
/// handle stays dangling and resolving it is a [`ReferenceError`].
pub trait Handle: Copy + Eq + fmt::Debug {
    /// The index space the handle resolves into.
    const SPACE: IndexSpace;

    #[doc(hidden)]
    fn from_raw(raw: u32) -> Self;

    /// The raw handle value, which is not an index.
    fn raw(self) -> u32;

    /// The error describing this handle as unresolvable.
    fn unresolved(self) -> ReferenceError {
        ReferenceError {
            space: Self::SPACE,
            handle: self.raw(),
        }
    }
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident => $space:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(u32);

        impl Handle for $name {
            const SPACE: IndexSpace = IndexSpace::$space;

            fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// A handle to a function type.
    TypeId => Type
);
handle!(
    /// A handle to an imported or defined function.
    FuncId => Function
);
handle!(
    /// A handle to an imported or defined table.
    TableId => Table
);
handle!(
    /// A handle to an imported or defined memory.
    MemId => Memory
);
handle!(
    /// A handle to an imported or defined global.
    GlobalId => Global
);
handle!(
    /// A handle to an imported or defined exception tag.
    TagId => Tag
);
handle!(
    /// A handle to an element segment.
    ElemId => Element
);
handle!(
    /// A handle to a data segment.
    DataId => Data
);

newtype!(
    /// A local variable of the enclosing function. Unlike other entities,
    /// locals are identified by position: parameters first, then declared
    /// locals.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct LocalId(u32);
);

/// Section identifier within a module.
///
/// `PartialOrd` is implemented so that, for non-custom section IDs, an ID is
/// less than another precisely when the former must appear in a module
/// before the latter when both are present.
#[derive(Clone, Copy, Debug, Eq, TryFromPrimitive, PartialEq)]
#[repr(u8)]
pub enum SectionId {
    /// Custom section with arbitrary data.
    Custom = 0,
    /// Function type declarations.
    Type = 1,
    /// Import declarations.
    Import = 2,
    /// Function type indices for module functions.
    Function = 3,
    /// Table declarations.
    Table = 4,
    /// Memory declarations.
    Memory = 5,
    /// Global declarations.
    Global = 6,
    /// Export declarations.
    Export = 7,
    /// Start function index.
    Start = 8,
    /// Element segments for table initialization.
    Element = 9,
    /// Function bodies.
    Code = 10,
    /// Data segments for memory initialization.
    Data = 11,
    /// Data segment count (for bulk memory operations).
    DataCount = 12,
    /// Exception tag declarations.
    Tag = 13,
}

impl SectionId {
    /// The non-custom sections in the order they must appear.
    pub const ORDERED: [SectionId; 13] = [
        SectionId::Type,
        SectionId::Import,
        SectionId::Function,
        SectionId::Table,
        SectionId::Memory,
        SectionId::Tag,
        SectionId::Global,
        SectionId::Export,
        SectionId::Start,
        SectionId::Element,
        SectionId::DataCount,
        SectionId::Code,
        SectionId::Data,
    ];

    const fn rank(self) -> u8 {
        match self {
            SectionId::Custom => 0,
            SectionId::Type => 1,
            SectionId::Import => 2,
            SectionId::Function => 3,
            SectionId::Table => 4,
            SectionId::Memory => 5,
            SectionId::Tag => 6,
            SectionId::Global => 7,
            SectionId::Export => 8,
            SectionId::Start => 9,
            SectionId::Element => 10,
            SectionId::DataCount => 11,
            SectionId::Code => 12,
            SectionId::Data => 13,
        }
    }

    pub(crate) const fn bit(self) -> u16 {
        1 << (self as u8)
    }
}

// The logical order, as documented above.
impl PartialOrd for SectionId {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        self.rank().partial_cmp(&other.rank())
    }
}

/// A custom section, kept as raw bytes.
#[derive(Debug)]
pub struct CustomSection<A: Allocator> {
    /// Section name.
    pub name: Name<A>,
    /// Section content, after the name.
    pub bytes: Vec<u8, A>,
    /// The non-custom section this one followed, or `None` if it preceded
    /// all of them. Encoding re-emits it at the same point.
    pub placement: Option<SectionId>,
}
