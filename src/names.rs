// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The `name` custom section.
//!
//! [`NameMap`] is a side table of debug names keyed by handles, so that the
//! names follow their entities through mutation. Function and local indices
//! are resolved against a module on decode and recomputed on encode.

use core::fmt;

use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::encode::{self, Measure, Sink};
use crate::module::Module;
use crate::storage::{ByteCursor, CursorError};
use crate::types::{
    CustomSection, FuncId, Handle, IndexSpace, LocalId, Name, ReferenceError, SectionId,
};
use crate::{Allocator, ErrorKind};

/// The name of the custom section.
pub const SECTION_NAME: &str = "name";

const MODULE_SUBSECTION: u8 = 0;
const FUNCTION_SUBSECTION: u8 = 1;
const LOCAL_SUBSECTION: u8 = 2;

/// Represents errors that can arise decoding or editing a name section.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Failed memory allocation.
    AllocError,
    /// The section is truncated or holds a malformed LEB128 value or name.
    Malformed(CursorError),
    /// A subsection's contents do not fill its declared length.
    SubsectionLength { id: u8, expected: u32, actual: u32 },
    /// A function index does not resolve in the module.
    Reference(ReferenceError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AllocError => ErrorKind::Allocation,
            Error::Reference(_) => ErrorKind::Reference,
            Error::Malformed(_) | Error::SubsectionLength { .. } => ErrorKind::Structural,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::Malformed(err) => write!(f, "malformed name section: {err}"),
            Error::SubsectionLength {
                id,
                expected,
                actual,
            } => write!(
                f,
                "name subsection {id} length mismatch: expected {expected:#x}; got {actual:#x}"
            ),
            Error::Reference(err) => write!(f, "{err}"),
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

impl From<CursorError> for Error {
    fn from(err: CursorError) -> Self {
        Error::Malformed(err)
    }
}

impl From<ReferenceError> for Error {
    fn from(err: ReferenceError) -> Self {
        Error::Reference(err)
    }
}

type LocalNames<A> = Vec<(LocalId, Name<A>), A>;

/// Debug names of a module and its functions and locals.
#[derive(Debug)]
pub struct NameMap<A: Allocator> {
    module: Option<Name<A>>,
    functions: Vec<(FuncId, Name<A>), A>,
    locals: Vec<(FuncId, LocalNames<A>), A>,
    // Subsections other than the above, as (ID, contents).
    others: Vec<(u8, Vec<u8, A>), A>,
    alloc: A,
}

fn read_name<A: Allocator>(cursor: &mut ByteCursor<&[u8]>, alloc: &A) -> Result<Name<A>, Error> {
    let len: u32 = cursor.read_leb128()?;
    let name = cursor.read_utf8(len as usize)?;
    Ok(Name::from_str_in(name, alloc.clone())?)
}

// Reads a function index and resolves it.
fn read_function<A: Allocator>(
    cursor: &mut ByteCursor<&[u8]>,
    module: &Module<A>,
) -> Result<FuncId, Error> {
    let index: u32 = cursor.read_leb128()?;
    module.function_at(index).ok_or(Error::Reference(ReferenceError {
        space: IndexSpace::Function,
        handle: index,
    }))
}

impl<A: Allocator> NameMap<A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            module: None,
            functions: Vec::new_in(alloc.clone()),
            locals: Vec::new_in(alloc.clone()),
            others: Vec::new_in(alloc.clone()),
            alloc,
        }
    }

    /// Decodes the contents of a name section (after the section name),
    /// resolving function indices against `module`.
    pub fn decode(module: &Module<A>, bytes: &[u8]) -> Result<Self, Error> {
        let mut names = Self::new_in(module.allocator().clone());
        let mut cursor = ByteCursor::new(bytes);
        while cursor.remaining() > 0 {
            let id = cursor.read_u8()?;
            let len: u32 = cursor.read_leb128()?;
            let mut sub = ByteCursor::new(cursor.read_bytes(len as usize)?);
            match id {
                MODULE_SUBSECTION => names.module = Some(read_name(&mut sub, &names.alloc)?),
                FUNCTION_SUBSECTION => names.decode_functions(&mut sub, module)?,
                LOCAL_SUBSECTION => names.decode_locals(&mut sub, module)?,
                _ => {
                    let mut contents = Vec::new_in(names.alloc.clone());
                    contents.try_reserve_exact(sub.remaining())?;
                    contents.extend_from_slice(sub.read_bytes(sub.remaining())?);
                    names.others.try_reserve(1)?;
                    names.others.push((id, contents));
                }
            }
            if sub.remaining() > 0 {
                return Err(Error::SubsectionLength {
                    id,
                    expected: len,
                    actual: sub.position() as u32,
                });
            }
        }
        Ok(names)
    }

    /// Decodes the module's retained name section, if any.
    pub fn from_module(module: &Module<A>) -> Result<Option<Self>, Error> {
        module
            .customs
            .iter()
            .find(|custom| custom.name == SECTION_NAME)
            .map(|custom| Self::decode(module, &custom.bytes))
            .transpose()
    }

    fn decode_functions(
        &mut self,
        cursor: &mut ByteCursor<&[u8]>,
        module: &Module<A>,
    ) -> Result<(), Error> {
        let count: u32 = cursor.read_leb128()?;
        for _ in 0..count {
            let func = read_function(cursor, module)?;
            let name = read_name(cursor, &self.alloc)?;
            self.functions.try_reserve(1)?;
            self.functions.push((func, name));
        }
        Ok(())
    }

    fn decode_locals(
        &mut self,
        cursor: &mut ByteCursor<&[u8]>,
        module: &Module<A>,
    ) -> Result<(), Error> {
        let count: u32 = cursor.read_leb128()?;
        for _ in 0..count {
            let func = read_function(cursor, module)?;
            let named: u32 = cursor.read_leb128()?;
            let mut locals = Vec::new_in(self.alloc.clone());
            for _ in 0..named {
                let local = LocalId::new(cursor.read_leb128()?);
                let name = read_name(cursor, &self.alloc)?;
                locals.try_reserve(1)?;
                locals.push((local, name));
            }
            self.locals.try_reserve(1)?;
            self.locals.push((func, locals));
        }
        Ok(())
    }

    pub fn module_name(&self) -> Option<&str> {
        self.module.as_ref().map(Name::as_str)
    }

    pub fn set_module_name(&mut self, name: &str) -> Result<(), Error> {
        self.module = Some(Name::from_str_in(name, self.alloc.clone())?);
        Ok(())
    }

    pub fn function_name(&self, func: FuncId) -> Option<&str> {
        self.functions
            .iter()
            .find(|(id, _)| *id == func)
            .map(|(_, name)| name.as_str())
    }

    pub fn set_function_name(&mut self, func: FuncId, name: &str) -> Result<(), Error> {
        let name = Name::from_str_in(name, self.alloc.clone())?;
        if let Some(entry) = self.functions.iter_mut().find(|(id, _)| *id == func) {
            entry.1 = name;
        } else {
            self.functions.try_reserve(1)?;
            self.functions.push((func, name));
        }
        Ok(())
    }

    pub fn local_name(&self, func: FuncId, local: LocalId) -> Option<&str> {
        let (_, locals) = self.locals.iter().find(|(id, _)| *id == func)?;
        locals
            .iter()
            .find(|(id, _)| *id == local)
            .map(|(_, name)| name.as_str())
    }

    pub fn set_local_name(&mut self, func: FuncId, local: LocalId, name: &str) -> Result<(), Error> {
        let name = Name::from_str_in(name, self.alloc.clone())?;
        let pos = match self.locals.iter().position(|(id, _)| *id == func) {
            Some(pos) => pos,
            None => {
                self.locals.try_reserve(1)?;
                self.locals.push((func, Vec::new_in(self.alloc.clone())));
                self.locals.len() - 1
            }
        };
        let locals = &mut self.locals[pos].1;
        if let Some(entry) = locals.iter_mut().find(|(id, _)| *id == local) {
            entry.1 = name;
        } else {
            locals.try_reserve(1)?;
            locals.push((local, name));
        }
        Ok(())
    }

    /// Drops the names of functions that are no longer in the module.
    pub fn retain_live(&mut self, module: &Module<A>) {
        self.functions.retain(|(func, _)| module.function(*func).is_some());
        self.locals.retain(|(func, _)| module.function(*func).is_some());
    }

    // The named functions as (index, position in `entries`), sorted by index.
    fn by_index<T>(
        &self,
        module: &Module<A>,
        entries: &[(FuncId, T)],
    ) -> Result<Vec<(u32, usize), A>, encode::Error> {
        let positions = module.funcs.positions(self.alloc.clone())?;
        let mut sorted = Vec::new_in(self.alloc.clone());
        sorted.try_reserve_exact(entries.len())?;
        for (i, (func, _)) in entries.iter().enumerate() {
            let index = positions
                .get(func.raw() as usize)
                .copied()
                .filter(|&index| index != u32::MAX)
                .ok_or_else(|| func.unresolved())?;
            sorted.push((index, i));
        }
        sorted.sort_unstable_by_key(|&(index, _)| index);
        Ok(sorted)
    }

    fn subsection<S: Sink, F>(sink: &mut S, id: u8, write: F) -> Result<(), encode::Error>
    where
        F: Fn(&mut dyn Sink) -> Result<(), encode::Error>,
    {
        let mut measure = Measure::default();
        write(&mut measure)?;
        sink.put_byte(id)?;
        sink.put_len(measure.written())?;
        write(sink)
    }

    fn write<S: Sink>(&self, sink: &mut S, module: &Module<A>) -> Result<(), encode::Error> {
        if let Some(name) = &self.module {
            Self::subsection(sink, MODULE_SUBSECTION, |sink| sink.put_name(name.as_str()))?;
        }
        if !self.functions.is_empty() {
            let sorted = self.by_index(module, &self.functions)?;
            Self::subsection(sink, FUNCTION_SUBSECTION, |sink| {
                sink.put_len(sorted.len())?;
                for &(index, i) in sorted.iter() {
                    sink.put_u32(index)?;
                    sink.put_name(self.functions[i].1.as_str())?;
                }
                Ok(())
            })?;
        }
        if !self.locals.is_empty() {
            let sorted = self.by_index(module, &self.locals)?;
            for &(_, i) in sorted.iter() {
                let (func, locals) = &self.locals[i];
                let count = module.local_count(*func)?;
                if let Some((local, _)) = locals.iter().find(|(local, _)| **local >= count) {
                    return Err(ReferenceError {
                        space: IndexSpace::Local,
                        handle: **local,
                    }
                    .into());
                }
            }
            Self::subsection(sink, LOCAL_SUBSECTION, |sink| {
                sink.put_len(sorted.len())?;
                for &(index, i) in sorted.iter() {
                    let locals = &self.locals[i].1;
                    sink.put_u32(index)?;
                    sink.put_len(locals.len())?;
                    let mut order = 0;
                    // Locals are written in ascending index order.
                    while let Some((local, name)) = locals
                        .iter()
                        .filter(|(local, _)| **local >= order)
                        .min_by_key(|(local, _)| **local)
                    {
                        sink.put_u32(**local)?;
                        sink.put_name(name.as_str())?;
                        match local.checked_add(1) {
                            Some(next) => order = next,
                            None => break,
                        }
                    }
                }
                Ok(())
            })?;
        }
        for (id, contents) in self.others.iter() {
            sink.put_byte(*id)?;
            sink.put_len(contents.len())?;
            sink.put_bytes(contents)?;
        }
        Ok(())
    }

    /// Encodes the section contents (after the section name).
    pub fn encode(&self, module: &Module<A>) -> Result<Vec<u8, A>, encode::Error> {
        let mut measure = Measure::default();
        self.write(&mut measure, module)?;
        let len = measure.written();

        let mut bytes = Vec::new_in(self.alloc.clone());
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        self.write(&mut ByteCursor::new(bytes.as_mut_slice()), module)?;
        Ok(bytes)
    }

    /// Encodes the names into the module's name section, replacing the
    /// existing one or else adding one after all standard sections.
    pub fn store(&self, module: &mut Module<A>) -> Result<(), encode::Error> {
        let bytes = self.encode(module)?;
        if let Some(custom) = module
            .customs
            .iter_mut()
            .find(|custom| custom.name == SECTION_NAME)
        {
            custom.bytes = bytes;
            return Ok(());
        }
        let name = Name::from_str_in(SECTION_NAME, self.alloc.clone())?;
        module.customs.try_reserve(1)?;
        module.customs.push(CustomSection {
            name,
            bytes,
            placement: Some(SectionId::Data),
        });
        Ok(())
    }
}
