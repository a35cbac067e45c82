// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary format encoding.
//!
//! Encoding is two-pass. Each section is first measured, which gives the
//! length prefix and lets the output be allocated at its exact size, and then
//! written. Both passes run the same code (see [`sink`]), and the written
//! length is checked against the measured one all the same.
//!
//! Handles are translated to indices through a table computed once per
//! encoding from the positional order of each kind of entity. A handle with
//! no position is a [`ReferenceError`].

mod expr;
mod sections;
mod sink;

use core::fmt;

use log::{error, trace};

use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::module::{Entity, Module};
use crate::storage::ByteCursor;
use crate::types::{
    CustomSection, Handle, IndexSpace, Instruction, Opcode, ReferenceError, SectionId,
};
use crate::{Allocator, ErrorKind};

pub(crate) use sink::{Measure, Sink};

const MAGIC: [u8; 4] = *b"\0asm";

// The width to which padded indices are written: the longest encoding of a
// 32-bit value.
const PADDED_INDEX_LEN: usize = crate::leb128::MAX_LEN_32;

/// Represents errors that can arise during module encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Failed memory allocation.
    AllocError,
    /// A handle does not resolve to an entity of the module.
    Reference(ReferenceError),
    /// A section's written length differs from its measured length.
    LengthMismatch {
        section: SectionId,
        expected: usize,
        actual: usize,
    },
    /// The output buffer is too small.
    BufferOverflow,
    /// An expression does not end with `end`.
    UnterminatedExpression,
    /// [`Instruction::Plain`] with an opcode that takes immediates.
    InvalidPlainOpcode(Opcode),
    /// [`Instruction::Memory`] with an opcode that is not a load or store.
    InvalidMemoryOpcode(Opcode),
    /// Custom sections are encoded along with the module, not on their own.
    NotAStandardSection,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AllocError => ErrorKind::Allocation,
            Error::Reference(_) => ErrorKind::Reference,
            Error::LengthMismatch { .. } => ErrorKind::Consistency,
            Error::BufferOverflow
            | Error::UnterminatedExpression
            | Error::InvalidPlainOpcode(_)
            | Error::InvalidMemoryOpcode(_)
            | Error::NotAStandardSection => ErrorKind::Structural,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::Reference(err) => write!(f, "{err}"),
            Error::LengthMismatch {
                section,
                expected,
                actual,
            } => write!(
                f,
                "{section:?} section length mismatch: measured {expected:#x}; wrote {actual:#x}"
            ),
            Error::BufferOverflow => write!(f, "output buffer too small"),
            Error::UnterminatedExpression => write!(f, "expression does not end with `end`"),
            Error::InvalidPlainOpcode(op) => write!(f, "{op:?} takes immediates"),
            Error::InvalidMemoryOpcode(op) => write!(f, "{op:?} is not a load or store"),
            Error::NotAStandardSection => write!(f, "not a standard section"),
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

/// Options controlling what is encoded.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncodeOptions<'a> {
    excluded: u16,
    excluded_customs: &'a [&'a str],
    padded_indices: bool,
}

impl<'a> EncodeOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaves out a standard section. An excluded data section is replaced by
    /// one with no segments, so that a data count section stays consistent.
    #[must_use]
    pub fn exclude(mut self, id: SectionId) -> Self {
        self.excluded |= id.bit();
        self
    }

    /// Leaves out the custom sections with the given names.
    #[must_use]
    pub fn exclude_custom_sections(mut self, names: &'a [&'a str]) -> Self {
        self.excluded_customs = names;
        self
    }

    /// Writes the entity indices within instructions at a fixed width of five
    /// bytes, as relocatable code expects.
    #[must_use]
    pub fn padded_indices(mut self, padded: bool) -> Self {
        self.padded_indices = padded;
        self
    }

    pub fn is_excluded(&self, id: SectionId) -> bool {
        self.excluded & id.bit() != 0
    }

    fn is_custom_excluded(&self, name: &str) -> bool {
        self.excluded_customs.contains(&name)
    }
}

// Indices of every kind of entity, by raw handle value.
struct IndexTable<A: Allocator> {
    types: Vec<u32, A>,
    funcs: Vec<u32, A>,
    tables: Vec<u32, A>,
    memories: Vec<u32, A>,
    globals: Vec<u32, A>,
    tags: Vec<u32, A>,
    elems: Vec<u32, A>,
    data: Vec<u32, A>,
}

impl<A: Allocator> IndexTable<A> {
    fn new(module: &Module<A>) -> Result<Self, TryReserveError> {
        let alloc = module.allocator();
        Ok(Self {
            types: module.types.positions(alloc.clone())?,
            funcs: module.funcs.positions(alloc.clone())?,
            tables: module.tables.positions(alloc.clone())?,
            memories: module.memories.positions(alloc.clone())?,
            globals: module.globals.positions(alloc.clone())?,
            tags: module.tags.positions(alloc.clone())?,
            elems: module.elems.positions(alloc.clone())?,
            data: module.data.positions(alloc.clone())?,
        })
    }

    fn index<Id: Handle>(&self, id: Id) -> Result<u32, ReferenceError> {
        let table: &[u32] = match Id::SPACE {
            IndexSpace::Type => &self.types,
            IndexSpace::Function => &self.funcs,
            IndexSpace::Table => &self.tables,
            IndexSpace::Memory => &self.memories,
            IndexSpace::Global => &self.globals,
            IndexSpace::Tag => &self.tags,
            IndexSpace::Element => &self.elems,
            IndexSpace::Data => &self.data,
            IndexSpace::Local => &[],
        };
        table
            .get(id.raw() as usize)
            .copied()
            .filter(|&index| index != u32::MAX)
            .ok_or_else(|| id.unresolved())
    }
}

// What a section consists of.
enum Payload<'m, A: Allocator> {
    Standard(SectionId),
    Custom(&'m CustomSection<A>),
    // Stands in for an excluded data section.
    EmptyData,
}

impl<A: Allocator> Clone for Payload<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: Allocator> Copy for Payload<'_, A> {}

impl<A: Allocator> Payload<'_, A> {
    fn id(self) -> SectionId {
        match self {
            Payload::Standard(id) => id,
            Payload::Custom(_) => SectionId::Custom,
            Payload::EmptyData => SectionId::Data,
        }
    }
}

// Encodes one module, holding the index table for its handles.
struct Encoder<'m, 'o, A: Allocator> {
    module: &'m Module<A>,
    options: EncodeOptions<'o>,
    indices: IndexTable<A>,
    // The minimum length of entity indices within instructions.
    index_len: usize,
}

// What a single encoding produces.
enum Unit<'m, A: Allocator> {
    Module,
    Section(Payload<'m, A>),
    Instructions(&'m [Instruction<A>]),
}

impl<A: Allocator> Clone for Unit<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: Allocator> Copy for Unit<'_, A> {}

impl<'m, 'o, A: Allocator> Encoder<'m, 'o, A> {
    fn new(module: &'m Module<A>, options: EncodeOptions<'o>) -> Result<Self, Error> {
        Ok(Self {
            module,
            options,
            indices: IndexTable::new(module)?,
            index_len: if options.padded_indices {
                PADDED_INDEX_LEN
            } else {
                0
            },
        })
    }

    fn index<Id: Handle>(&self, id: Id) -> Result<u32, Error> {
        Ok(self.indices.index(id)?)
    }

    // A standard section's payload, if the section is to be emitted. Sections
    // with nothing in them are left out.
    fn standard_payload(&self, id: SectionId) -> Option<Payload<'m, A>> {
        let module = self.module;
        let defined_functions = || module.funcs.iter().any(|(_, func)| func.body().is_some());
        let present = match id {
            SectionId::Custom => false,
            SectionId::Type => !module.types.is_empty(),
            SectionId::Import => self.import_count() > 0,
            SectionId::Function | SectionId::Code => defined_functions(),
            SectionId::Table => module.tables.iter().any(|(_, t)| !t.is_imported()),
            SectionId::Memory => module.memories.iter().any(|(_, m)| !m.is_imported()),
            SectionId::Tag => module.tags.iter().any(|(_, t)| !t.is_imported()),
            SectionId::Global => module.globals.iter().any(|(_, g)| !g.is_imported()),
            SectionId::Export => !module.exports.is_empty(),
            SectionId::Start => module.start.is_some(),
            SectionId::Element => !module.elems.is_empty(),
            SectionId::DataCount => module.data_count,
            SectionId::Data => !module.data.is_empty(),
        };
        if !present {
            return None;
        }
        if self.options.is_excluded(id) {
            return (id == SectionId::Data).then_some(Payload::EmptyData);
        }
        Some(Payload::Standard(id))
    }

    fn payload<S: Sink>(&self, sink: &mut S, payload: Payload<'_, A>) -> Result<(), Error> {
        match payload {
            Payload::Standard(id) => self.standard_section(sink, id),
            Payload::Custom(custom) => {
                sink.put_name(custom.name.as_str())?;
                sink.put_bytes(&custom.bytes)
            }
            Payload::EmptyData => sink.put_u32(0),
        }
    }

    // Frames a section: its ID, its measured length and then its payload.
    fn section<S: Sink>(&self, sink: &mut S, payload: Payload<'_, A>) -> Result<(), Error> {
        let id = payload.id();
        let mut measure = Measure::default();
        self.payload(&mut measure, payload)?;
        let expected = measure.written();

        sink.put_byte(id as u8)?;
        sink.put_len(expected)?;
        let start = sink.written();
        self.payload(sink, payload)?;
        let actual = sink.written() - start;
        if actual != expected {
            error!("{id:?} section: measured {expected:#x} bytes but wrote {actual:#x}");
            return Err(Error::LengthMismatch {
                section: id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    // The retained custom sections that followed the given standard section.
    fn customs<S: Sink>(&self, sink: &mut S, placement: Option<SectionId>) -> Result<(), Error> {
        for custom in self.module.customs.iter() {
            if custom.placement != placement
                || self.options.is_custom_excluded(custom.name.as_str())
            {
                continue;
            }
            self.section(sink, Payload::Custom(custom))?;
        }
        Ok(())
    }

    fn module<S: Sink>(&self, sink: &mut S) -> Result<(), Error> {
        sink.put_bytes(&MAGIC)?;
        sink.put_bytes(&(self.module.version as u32).to_le_bytes())?;
        self.customs(sink, None)?;
        for id in SectionId::ORDERED {
            if let Some(payload) = self.standard_payload(id) {
                self.section(sink, payload)?;
            }
            self.customs(sink, Some(id))?;
        }
        Ok(())
    }

    fn unit<S: Sink>(&self, sink: &mut S, unit: Unit<'_, A>) -> Result<(), Error> {
        match unit {
            Unit::Module => self.module(sink),
            Unit::Section(payload) => self.section(sink, payload),
            Unit::Instructions(instrs) => self.instructions(sink, instrs),
        }
    }

    // Measures the unit and then writes it into a buffer of exactly that
    // size.
    fn encode_exact(&self, unit: Unit<'_, A>) -> Result<Vec<u8, A>, Error> {
        let mut measure = Measure::default();
        self.unit(&mut measure, unit)?;
        let len = measure.written();

        let mut bytes = Vec::new_in(self.module.alloc.clone());
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        let mut cursor = ByteCursor::new(bytes.as_mut_slice());
        self.unit(&mut cursor, unit)?;
        if cursor.written() != len {
            let actual = cursor.written();
            error!("measured {len:#x} bytes but wrote {actual:#x}");
            return Err(Error::LengthMismatch {
                section: match unit {
                    Unit::Section(payload) => payload.id(),
                    Unit::Module | Unit::Instructions(_) => SectionId::Custom,
                },
                expected: len,
                actual,
            });
        }
        Ok(bytes)
    }
}

impl<A: Allocator> Module<A> {
    /// Encodes the module.
    pub fn encode(&self, options: &EncodeOptions<'_>) -> Result<Vec<u8, A>, Error> {
        let bytes = Encoder::new(self, *options)?.encode_exact(Unit::Module)?;
        trace!("encoded module ({:#x} bytes)", bytes.len());
        Ok(bytes)
    }

    /// The length of the module's encoding.
    pub fn encoded_len(&self, options: &EncodeOptions<'_>) -> Result<usize, Error> {
        let mut measure = Measure::default();
        Encoder::new(self, *options)?.module(&mut measure)?;
        Ok(measure.written())
    }

    /// Encodes a single standard section, framed with its ID and length. The
    /// result is empty if the section would be left out of the module.
    pub fn encode_section(
        &self,
        id: SectionId,
        options: &EncodeOptions<'_>,
    ) -> Result<Vec<u8, A>, Error> {
        if id == SectionId::Custom {
            return Err(Error::NotAStandardSection);
        }
        let encoder = Encoder::new(self, *options)?;
        match encoder.standard_payload(id) {
            Some(payload) => encoder.encode_exact(Unit::Section(payload)),
            None => Ok(Vec::new_in(self.alloc.clone())),
        }
    }

    /// The encoded length of an instruction sequence of this module. Only the
    /// index padding of the options applies.
    pub fn instruction_len(
        &self,
        instrs: &[Instruction<A>],
        options: &EncodeOptions<'_>,
    ) -> Result<usize, Error> {
        let mut measure = Measure::default();
        Encoder::new(self, *options)?.instructions(&mut measure, instrs)?;
        Ok(measure.written())
    }

    /// Encodes an instruction sequence of this module.
    pub fn encode_instructions(
        &self,
        instrs: &[Instruction<A>],
        options: &EncodeOptions<'_>,
    ) -> Result<Vec<u8, A>, Error> {
        Encoder::new(self, *options)?.encode_exact(Unit::Instructions(instrs))
    }
}
