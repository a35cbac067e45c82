// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary format decoding.
//!
//! Decoding builds a [`Module`] section by section. Indices read from the
//! stream are resolved to handles as soon as they are read, against the
//! entities decoded so far, so a module's sections must appear in canonical
//! order for its references to resolve.

mod expr;
mod leaf;
mod sections;

use core::fmt;

use log::trace;
use num_enum::TryFromPrimitive;

use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::leb128::{self, Leb128};
use crate::module::Module;
use crate::storage::Stream;
use crate::types::{
    CustomSection, DataId, ElemId, FuncId, GlobalId, Handle, MemId, Name, ReferenceError,
    SectionId, TableId, TagId, TypeId, Version,
};
use crate::{Allocator, ErrorKind};

use sections::SectionState;

// The maximum depth of the context stack. Instruction nesting is tracked
// separately and does not count against it.
const MAX_DEPTH: usize = 8;

// We represent this as an enum with one value to leverage existing "decode this
// u32 enum" machinery to check for a valid magic value.
#[derive(Clone, Copy, Debug, TryFromPrimitive)]
#[repr(u32)]
enum Magic {
    Value = 0x6d_73_61_00, // '\0asm'
}

// Defines the decoding contexts along with their descriptions.
macro_rules! context_ids {
    ($($id:ident => $description:literal,)*) => {
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
        #[repr(u8)]
        enum ContextId {
            #[default]
            Invalid,
            $($id,)*
        }

        impl From<ContextId> for &'static str {
            fn from(id: ContextId) -> Self {
                match id {
                    ContextId::Invalid => "<invalid>",
                    $(ContextId::$id => $description,)*
                }
            }
        }
    };
}

context_ids! {
    AtomicOpcode => "atomic opcode",
    BlockType => "blocktype",
    BrTableOperands => "br_table operands",
    BulkOpcode => "bulk opcode",
    Byte => "byte",
    CodeSec => "codesec",
    CustomSec => "customsec",
    Data => "data",
    DataCountSec => "datacountsec",
    DataIdx => "dataidx",
    DataSec => "datasec",
    DataToken => "data token",
    Elem => "elem",
    ElemIdx => "elemidx",
    ElemKind => "elemkind",
    ElemSec => "elemsec",
    ElemToken => "elem token",
    Export => "export",
    ExportSec => "exportsec",
    Expr => "expr",
    ExternalKind => "external kind",
    F32 => "f32",
    F64 => "f64",
    Func => "func",
    FuncIdx => "funcidx",
    FuncSec => "funcsec",
    FuncType => "functype",
    FuncTypeToken => "functype token",
    Global => "global",
    GlobalIdx => "globalidx",
    GlobalSec => "globalsec",
    GlobalType => "globaltype",
    I32 => "i32",
    I64 => "i64",
    Import => "import",
    ImportSec => "importsec",
    LabelIdx => "labelidx",
    Lane => "laneidx",
    Limits => "limits",
    LocalIdx => "localidx",
    Locals => "locals",
    Magic => "magic",
    MemArg => "memarg",
    MemIdx => "memidx",
    MemType => "memtype",
    MemorySec => "memsec",
    Mut => "mut",
    Name => "name",
    Opcode => "opcode",
    ReadingBytes => "reading bytes",
    RefType => "reftype",
    SectionId => "section ID",
    SkippingBytes => "skipping bytes",
    StartSec => "startsec",
    TableIdx => "tableidx",
    TableSec => "tablesec",
    TableType => "tabletype",
    TagAttribute => "tag attribute",
    TagIdx => "tagidx",
    TagSec => "tagsec",
    TypeIdx => "typeidx",
    TypeSec => "typesec",
    U32 => "u32",
    ValType => "valtype",
    VecByte => "vec(byte)",
    VecExpr => "vec(expr)",
    VecFuncIdx => "vec(funcidx)",
    VecValType => "vec(valtype)",
    VectorOpcode => "vector opcode",
    Version => "version",
}

trait Contextual {
    const ID: ContextId;
}

// A frame of decoding context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ContextFrame {
    // A description of what is being decoded.
    context: &'static str,

    // Byte offset in the stream where this context was entered.
    offset: usize,
}

/// Stack for tracking decoding context during error reporting.
#[derive(Clone, Debug, Default)]
pub(crate) struct ContextStack {
    offsets: [usize; MAX_DEPTH],
    ids: [ContextId; MAX_DEPTH],
    depth: u8,
}

impl ContextStack {
    // Pushes a new context frame, returning true if successful.
    fn push(&mut self, id: ContextId, offset: usize) -> bool {
        let depth = self.depth as usize;
        if depth >= MAX_DEPTH {
            return false;
        }
        self.offsets[depth] = offset;
        self.ids[depth] = id;
        self.depth += 1;
        true
    }

    // Pop the top context frame.
    fn pop(&mut self) {
        debug_assert!(self.depth > 0, "{self:#?}");
        self.depth -= 1;
    }

    // Returns an iterator over frames in "pushed" order (outermost to
    // innermost).
    fn iter(&self) -> impl Iterator<Item = ContextFrame> + '_ {
        self.offsets
            .iter()
            .zip(&self.ids)
            .take(self.depth as usize)
            .map(|(&offset, &id)| ContextFrame {
                context: id.into(),
                offset,
            })
    }
}

/// A decoding error with additional context around what hierarchy of things
/// were being decoded at the time.
pub struct ErrorWithContext<Storage: Stream> {
    /// The underlying decoding error.
    pub error: Error<Storage>,
    pub(crate) context: ContextStack,
}

impl<Storage: Stream> ErrorWithContext<Storage> {
    /// The byte offset at which the innermost context was entered.
    pub fn offset(&self) -> Option<usize> {
        self.context.iter().last().map(|frame| frame.offset)
    }
}

impl<Storage: Stream> fmt::Debug for ErrorWithContext<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.error)?;
        for (i, frame) in self.context.iter().enumerate() {
            write!(f, "\n{:#x}: ", frame.offset)?;
            for _ in 0..i {
                write!(f, "  ")?;
            }
            write!(f, "{}", frame.context)?;
        }
        Ok(())
    }
}

impl<Storage: Stream> fmt::Display for ErrorWithContext<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl<Storage: Stream> std::error::Error for ErrorWithContext<Storage> {}

/// A recognized construct that this implementation does not decode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Unsupported {
    /// A passive data segment (mode 1) or one with an explicit memory (mode
    /// 2).
    DataSegmentMode(u32),
    /// A vector sub-opcode outside the known set.
    VectorOpcode(u32),
}

/// Represents errors that can arise during module decoding.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Error<Storage: Stream> {
    /// Failed memory allocation.
    AllocError,
    /// The data section's segment count differs from the data count section.
    DataCountMismatch { expected: u32, actual: u32 },
    /// An export of the same name appears earlier in the export section.
    DuplicateExport,
    /// A given section appears more than once in the module.
    DuplicateSection(SectionId),
    /// Instructions are nested more deeply than this implementation allows.
    ExcessiveNesting(usize),
    /// Decoder context stack exceeded maximum depth to prevent stack overflow.
    ExcessiveParsingDepth {
        context: &'static str,
        offset: usize,
    },
    /// The code section's body count differs from the function section's
    /// function count.
    FunctionCountMismatch { functions: u32, bodies: u32 },
    /// Invalid atomic opcode encountered.
    InvalidAtomicOpcode(u32),
    /// Invalid bulk memory/table operation opcode encountered.
    InvalidBulkOpcode(u32),
    /// Invalid data segment token encountered.
    InvalidDataToken(u32),
    /// Invalid element segment token encountered.
    InvalidElementToken(u32),
    /// Function body length doesn't match the declared length.
    InvalidFunctionLength { expected: u32, actual: u32 },
    /// Invalid LEB128 encoding encountered.
    InvalidLeb128,
    /// Invalid WebAssembly magic number.
    InvalidMagic(u32),
    /// Section length doesn't match the declared length.
    InvalidSectionLength {
        id: SectionId,
        expected: u32,
        actual: u32,
    },
    /// Invalid byte token encountered during decoding.
    InvalidToken(u8),
    /// Invalid UTF-8 encoding in a name field.
    InvalidUtf8,
    /// Invalid value type encoding encountered.
    InvalidValType(u8),
    /// (Non-custom) sections appear in the wrong order.
    OutOfOrderSection { before: SectionId, after: SectionId },
    /// An index does not resolve to an entity decoded so far.
    Reference(ReferenceError),
    /// Error from the underlying storage.
    Storage(Storage::Error),
    /// Function declares too many local variables (exceeding an
    /// implementation-defined limit).
    TooManyLocals(usize),
    /// An opcode that is only valid inside a particular block, like `else`
    /// outside of an `if`.
    UnexpectedOpcode(u8),
    /// Unsupported WebAssembly version number.
    UnknownVersion(u32),
    /// A recognized construct that is not implemented.
    Unsupported(Unsupported),
}

impl<Storage: Stream> Error<Storage> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AllocError => ErrorKind::Allocation,
            Error::Reference(_) => ErrorKind::Reference,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            _ => ErrorKind::Structural,
        }
    }
}

impl<Storage: Stream> fmt::Debug for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::DataCountMismatch { expected, actual } => write!(
                f,
                "data count mismatch: expected {expected} segments; got {actual}"
            ),
            Error::DuplicateExport => write!(f, "duplicate export name"),
            Error::DuplicateSection(id) => write!(f, "duplicate of section ({id:?})"),
            Error::ExcessiveNesting(depth) => write!(f, "instructions nested {depth} deep"),
            Error::ExcessiveParsingDepth { context, offset } => {
                write!(f, "unexpected frame at {offset:#x}: {context}")
            }
            Error::FunctionCountMismatch { functions, bodies } => write!(
                f,
                "function count mismatch: {functions} functions; {bodies} bodies"
            ),
            Error::InvalidAtomicOpcode(op) => write!(f, "invalid atomic opcode ({op:#x})"),
            Error::InvalidBulkOpcode(op) => write!(f, "invalid bulk opcode ({op:#x})"),
            Error::InvalidDataToken(token) => write!(f, "invalid data token ({token:#x})"),
            Error::InvalidElementToken(token) => write!(f, "invalid element token ({token:#x})"),
            Error::InvalidFunctionLength { expected, actual } => write!(
                f,
                "invalid func length: expected {expected:#x}; got {actual:#x}"
            ),
            Error::InvalidLeb128 => write!(f, "invalid LEB128-encoding"),
            Error::InvalidMagic(magic) => write!(f, "invalid magic ({magic:#x})"),
            Error::InvalidSectionLength {
                id,
                expected,
                actual,
            } => write!(
                f,
                "invalid section length for {id:?}: expected {expected:#x}; got {actual:#x}"
            ),
            Error::InvalidToken(token) => write!(f, "invalid byte token ({token:#x})"),
            Error::InvalidUtf8 => write!(f, "invalid UTF-8"),
            Error::InvalidValType(valtype) => write!(f, "invalid valtype ({valtype:#x})"),
            Error::OutOfOrderSection { before, after } => {
                write!(f, "out-of-order sections: {before:?} before {after:?}")
            }
            Error::Reference(err) => write!(f, "{err}"),
            Error::Storage(err) => write!(f, "{err:?}"),
            Error::TooManyLocals(count) => {
                write!(f, "too many locals: at least {count} were specified")
            }
            Error::UnexpectedOpcode(op) => write!(f, "unexpected opcode ({op:#x})"),
            Error::UnknownVersion(version) => write!(f, "unknown version ({version:#x})"),
            Error::Unsupported(Unsupported::DataSegmentMode(mode)) => {
                write!(f, "unsupported data segment mode ({mode})")
            }
            Error::Unsupported(Unsupported::VectorOpcode(op)) => {
                write!(f, "unsupported vector opcode ({op:#x})")
            }
        }
    }
}

impl<Storage: Stream> fmt::Display for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<Storage: Stream> leb128::Error for Error<Storage> {
    fn invalid_leb128() -> Self {
        Error::InvalidLeb128
    }
}

impl<Storage: Stream> From<TryReserveError> for Error<Storage> {
    fn from(_: TryReserveError) -> Self {
        Error::AllocError
    }
}

impl<Storage: Stream> From<ReferenceError> for Error<Storage> {
    fn from(err: ReferenceError) -> Self {
        Error::Reference(err)
    }
}

pub(crate) struct Decoder<Storage: Stream> {
    stream: Storage,
}

impl<Storage: Stream> Decoder<Storage> {
    fn new(stream: Storage) -> Self {
        Self { stream }
    }

    // Pushes a context frame before a call, popping it if successful.
    fn with_context<F, R>(
        &mut self,
        context: &mut ContextStack,
        id: ContextId,
        f: F,
    ) -> Result<R, Error<Storage>>
    where
        F: FnOnce(&mut Self, &mut ContextStack) -> Result<R, Error<Storage>>,
    {
        let offset = self.stream.offset();
        if !context.push(id, offset) {
            return Err(Error::ExcessiveParsingDepth {
                context: id.into(),
                offset,
            });
        }
        let val = f(self, context)?;
        context.pop();
        Ok(val)
    }

    fn offset(&mut self) -> usize {
        self.stream.offset()
    }

    fn read_byte_raw(&mut self) -> Result<u8, Error<Storage>> {
        self.stream.read_byte().map_err(Error::Storage)
    }

    fn read_leb128_raw<T: Leb128>(&mut self) -> Result<T, Error<Storage>> {
        leb128::read(|| self.read_byte_raw())
    }

    fn read_zero_byte(&mut self, context: &mut ContextStack) -> Result<(), Error<Storage>> {
        self.with_context(context, ContextId::Byte, |decoder, _| {
            let byte = decoder.read_byte_raw()?;
            if byte == 0 {
                Ok(())
            } else {
                Err(Error::InvalidToken(byte))
            }
        })
    }

    fn read_exact_raw(&mut self, buf: &mut [u8]) -> Result<(), Error<Storage>> {
        self.stream.read_exact(buf).map_err(Error::Storage)
    }

    fn read_exact(
        &mut self,
        context: &mut ContextStack,
        buf: &mut [u8],
    ) -> Result<(), Error<Storage>> {
        self.with_context(context, ContextId::ReadingBytes, |decoder, _| {
            decoder.read_exact_raw(buf)
        })
    }

    fn skip_bytes(
        &mut self,
        context: &mut ContextStack,
        count: usize,
    ) -> Result<(), Error<Storage>> {
        self.with_context(context, ContextId::SkippingBytes, |decoder, _| {
            decoder.stream.skip_bytes(count).map_err(Error::Storage)
        })
    }

    fn read_bytes<A: Allocator>(
        &mut self,
        context: &mut ContextStack,
        count: usize,
        alloc: &A,
    ) -> Result<Vec<u8, A>, Error<Storage>> {
        let mut buf = Vec::new_in(alloc.clone());
        buf.try_reserve_exact(count)?;
        buf.resize(count, 0);
        self.read_exact(context, &mut buf)?;
        Ok(buf)
    }

    fn read<A: Allocator, T: Decodable<A> + Contextual>(
        &mut self,
        context: &mut ContextStack,
        alloc: &A,
    ) -> Result<T, Error<Storage>> {
        self.with_context(context, T::ID, |decoder, context| {
            T::decode(decoder, context, alloc)
        })
    }

    fn read_bounded<T: BoundedDecodable + Contextual>(
        &mut self,
        context: &mut ContextStack,
    ) -> Result<T, Error<Storage>> {
        self.with_context(context, T::ID, |decoder, context| {
            T::decode(decoder, context)
        })
    }

    // Reads an index and resolves it to the handle at that position.
    fn read_handle<A: Allocator, Id: Resolve<A>>(
        &mut self,
        context: &mut ContextStack,
        module: &Module<A>,
    ) -> Result<Id, Error<Storage>> {
        self.with_context(context, Id::CONTEXT, |decoder, _| {
            let index: u32 = decoder.read_leb128_raw()?;
            Id::at(module, index).ok_or(Error::Reference(ReferenceError {
                space: Id::SPACE,
                handle: index,
            }))
        })
    }
}

// Types that can be decoded from a storage stream, possibly with allocation.
trait Decodable<A>: Sized
where
    A: Allocator,
{
    /// Decode this type from the binary stream.
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        alloc: &A,
    ) -> Result<Self, Error<Storage>>;
}

// Types that can be decoded from a storage stream without allocation.
trait BoundedDecodable: Sized + Copy {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>>;
}

impl<Bounded: BoundedDecodable, A: Allocator> Decodable<A> for Bounded {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        _: &A,
    ) -> Result<Self, Error<Storage>> {
        <Self as BoundedDecodable>::decode(decoder, context)
    }
}

// Handles whose indices are resolved against a module under construction.
trait Resolve<A: Allocator>: Handle {
    const CONTEXT: ContextId;

    fn at(module: &Module<A>, index: u32) -> Option<Self>;
}

macro_rules! impl_resolve {
    ($id:ty, $context:ident, $at:ident) => {
        impl<A: Allocator> Resolve<A> for $id {
            const CONTEXT: ContextId = ContextId::$context;

            fn at(module: &Module<A>, index: u32) -> Option<Self> {
                module.$at(index)
            }
        }
    };
}

impl_resolve!(TypeId, TypeIdx, type_at);
impl_resolve!(FuncId, FuncIdx, function_at);
impl_resolve!(TableId, TableIdx, table_at);
impl_resolve!(MemId, MemIdx, memory_at);
impl_resolve!(GlobalId, GlobalIdx, global_at);
impl_resolve!(TagId, TagIdx, tag_at);
impl_resolve!(ElemId, ElemIdx, element_at);
impl_resolve!(DataId, DataIdx, data_at);

/// Visitor pattern for processing custom sections during module decoding.
pub trait CustomSectionVisitor<A: Allocator> {
    /// Returns whether the custom section with the given name should be
    /// retained in the decoded module.
    fn should_visit(&self, name: &str) -> bool;

    /// Inspects a retained custom section before it is added to the module.
    fn visit(&mut self, _custom: &CustomSection<A>) {}
}

/// A visitor that skips all custom sections.
pub struct NoCustomSectionVisitor {}

impl<A: Allocator> CustomSectionVisitor<A> for NoCustomSectionVisitor {
    fn should_visit(&self, _: &str) -> bool {
        false
    }
}

/// A visitor that retains all custom sections.
pub struct RetainCustomSections {}

impl<A: Allocator> CustomSectionVisitor<A> for RetainCustomSections {
    fn should_visit(&self, _: &str) -> bool {
        true
    }
}

// Decode a WebAssembly module from a storage stream.
//
// # Arguments
// * `storage` - Data stream containing WASM binary
// * `context` - Context stack for error reporting
// * `customsec_visitor` - Handler for custom sections
// * `alloc` - Allocator for decoded data
pub(crate) fn decode_module<Storage, CustomSecVisitor, A>(
    storage: Storage,
    context: &mut ContextStack,
    customsec_visitor: &mut CustomSecVisitor,
    alloc: A,
) -> Result<Module<A>, Error<Storage>>
where
    Storage: Stream,
    CustomSecVisitor: CustomSectionVisitor<A>,
    A: Allocator,
{
    let mut decoder = Decoder::new(storage);
    decoder.read_bounded::<Magic>(context)?;
    let version: Version = decoder.read_bounded(context)?;

    let mut module = Module::new_in(alloc.clone());
    module.version = version;
    let mut state = SectionState::new_in(alloc.clone());

    // The last section ID seen.
    let mut last_id = None;
    loop {
        // There is no in-band signal in the WASM format for the end of a
        // module. The best we can generically do is expect an EOF at a section
        // boundary.
        let id = decoder.read_bounded(context);
        if let Err(Error::Storage(ref err)) = id
            && Storage::is_eof(err)
        {
            break;
        }
        let id = id?;

        // Apart from custom sections, which can appear anywhere in the format,
        // sections must appear at most once and in order.
        if id != SectionId::Custom {
            if let Some(last_id) = last_id {
                if id == last_id {
                    return Err(Error::DuplicateSection(id));
                }
                if id < last_id {
                    return Err(Error::OutOfOrderSection {
                        before: last_id,
                        after: id,
                    });
                }
            }
            last_id = Some(id);
        }

        let len: u32 = decoder.read_bounded(context)?;
        let offset_start = decoder.offset();
        trace!("decoding {id:?} section ({len:#x} bytes at {offset_start:#x})");
        match id {
            SectionId::Custom => {
                let (name, len) = {
                    let name: Name<A> = decoder.read(context, &alloc)?;
                    let name_len = decoder.offset() - offset_start;

                    let len = len as usize;
                    if name_len > len {
                        return Err(Error::InvalidSectionLength {
                            id,
                            expected: len as u32,
                            actual: name_len as u32,
                        });
                    }
                    (name, len - name_len)
                };
                if customsec_visitor.should_visit(name.as_str()) {
                    let bytes = decoder.read_bytes(context, len, &alloc)?;
                    let custom = CustomSection {
                        name,
                        bytes,
                        placement: last_id,
                    };
                    customsec_visitor.visit(&custom);
                    module.customs.try_reserve(1)?;
                    module.customs.push(custom);
                } else {
                    trace!("skipping custom section {name}");
                    decoder.skip_bytes(context, len)?;
                }
            }
            _ => state.decode_section(&mut decoder, context, &mut module, id)?,
        }
        let actual_section_len = decoder.offset() - offset_start;
        if actual_section_len != (len as usize) {
            return Err(Error::InvalidSectionLength {
                id,
                expected: len,
                actual: actual_section_len as u32,
            });
        }
    }

    state.finish()?;
    Ok(module)
}
