// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Decodable implementations for the leaf types of the format: integers,
//! tokens, value types, limits and names.

use log::warn;
use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::storage::Stream;
use crate::types::*;

use super::{
    BoundedDecodable, ContextId, ContextStack, Contextual, Decodable, Decoder, Error, Magic,
    Unsupported,
};

macro_rules! impl_contextual {
    ($type:ident<A: Allocator>, $id:path) => {
        impl<A: Allocator> Contextual for $type<A> {
            const ID: ContextId = $id;
        }
    };
    (Vec<$type:ty, A>, $id:path) => {
        impl<A: Allocator> Contextual for Vec<$type, A> {
            const ID: ContextId = $id;
        }
    };
    ($type:ty, $id:path) => {
        impl Contextual for $type {
            const ID: ContextId = $id;
        }
    };
}

macro_rules! impl_decodable_for_u8_enum {
    ($type:ty) => {
        impl BoundedDecodable for $type {
            fn decode<Storage: Stream>(
                decoder: &mut Decoder<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                let byte = decoder.read_byte_raw()?;
                Self::try_from(byte).map_err(|_| Error::InvalidToken(byte))
            }
        }
    };
}

macro_rules! impl_decodable_for_leb128_u32_enum {
    ($type:ty, $make_err:path) => {
        impl BoundedDecodable for $type {
            fn decode<Storage: Stream>(
                decoder: &mut Decoder<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                let val: u32 = decoder.read_leb128_raw()?;
                Self::try_from(val).map_err(|_| $make_err(val))
            }
        }
    };
}

macro_rules! impl_decodable_for_le_u32_enum {
    ($type:ty, $make_err:path) => {
        impl BoundedDecodable for $type {
            fn decode<Storage: Stream>(
                decoder: &mut Decoder<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                let mut buf = [0u8; 4];
                decoder.read_exact_raw(&mut buf)?;
                let val = u32::from_le_bytes(buf);
                Self::try_from(val).map_err(|_| $make_err(val))
            }
        }
    };
}

macro_rules! impl_decodable_for_leb128 {
    ($($type:ty),*) => {$(
        impl BoundedDecodable for $type {
            fn decode<Storage: Stream>(
                decoder: &mut Decoder<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                decoder.read_leb128_raw()
            }
        }
    )*};
}

// Floats are read as their little-endian bit patterns.
macro_rules! impl_decodable_for_float_bits {
    ($($type:ident: $bits:ty),*) => {$(
        impl BoundedDecodable for $type {
            fn decode<Storage: Stream>(
                decoder: &mut Decoder<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                let mut buf = [0u8; size_of::<$bits>()];
                decoder.read_exact_raw(&mut buf)?;
                Ok($type(<$bits>::from_le_bytes(buf)))
            }
        }
    )*};
}

impl<T, A> Decodable<A> for Vec<T, A>
where
    T: Decodable<A> + Contextual,
    A: Allocator,
{
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        alloc: &A,
    ) -> Result<Self, Error<Storage>> {
        let mut len: u32 = decoder.read_bounded(context)?;
        let mut vec = Vec::new_in(alloc.clone());
        vec.try_reserve_exact(len as usize)?;
        while len > 0 {
            vec.push(decoder.read(context, alloc)?);
            len -= 1;
        }
        Ok(vec)
    }
}

impl_contextual!(i32, ContextId::I32);
impl_contextual!(i64, ContextId::I64);
impl_contextual!(u8, ContextId::Byte);
impl_contextual!(u32, ContextId::U32);
impl_contextual!(Ieee32, ContextId::F32);
impl_contextual!(Ieee64, ContextId::F64);
impl_contextual!(AtomicOpcode, ContextId::AtomicOpcode);
impl_contextual!(BulkOpcode, ContextId::BulkOpcode);
impl_contextual!(ExternalKind, ContextId::ExternalKind);
impl_contextual!(FunctionType<A: Allocator>, ContextId::FuncType);
impl_contextual!(FunctionTypeToken, ContextId::FuncTypeToken);
impl_contextual!(GlobalType, ContextId::GlobalType);
impl_contextual!(GlobalTypeMutability, ContextId::Mut);
impl_contextual!(Limits, ContextId::Limits);
impl_contextual!(Magic, ContextId::Magic);
impl_contextual!(MemArg, ContextId::MemArg);
impl_contextual!(MemoryType, ContextId::MemType);
impl_contextual!(Name<A: Allocator>, ContextId::Name);
impl_contextual!(Opcode, ContextId::Opcode);
impl_contextual!(RefType, ContextId::RefType);
impl_contextual!(SectionId, ContextId::SectionId);
impl_contextual!(TableType, ContextId::TableType);
impl_contextual!(TagAttribute, ContextId::TagAttribute);
impl_contextual!(ValType, ContextId::ValType);
impl_contextual!(VectorOpcode, ContextId::VectorOpcode);
impl_contextual!(Version, ContextId::Version);
impl_contextual!(Vec<u32, A>, ContextId::BrTableOperands);
impl_contextual!(Vec<ValType, A>, ContextId::VecValType);

impl_decodable_for_u8_enum!(ExternalKind);
impl_decodable_for_u8_enum!(FunctionTypeToken);
impl_decodable_for_u8_enum!(GlobalTypeMutability);
impl_decodable_for_u8_enum!(Opcode);
impl_decodable_for_u8_enum!(RefType);
impl_decodable_for_u8_enum!(SectionId);
impl_decodable_for_u8_enum!(TagAttribute);

impl_decodable_for_leb128_u32_enum!(AtomicOpcode, Error::InvalidAtomicOpcode);
impl_decodable_for_leb128_u32_enum!(BulkOpcode, Error::InvalidBulkOpcode);

impl_decodable_for_le_u32_enum!(Magic, Error::InvalidMagic);
impl_decodable_for_le_u32_enum!(Version, Error::UnknownVersion);

impl BoundedDecodable for u8 {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        decoder.read_byte_raw()
    }
}

impl_decodable_for_leb128!(u32, i32, i64);
impl_decodable_for_float_bits!(Ieee32: u32, Ieee64: u64);

impl BoundedDecodable for ValType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let byte = decoder.read_byte_raw()?;
        Self::try_from(byte).map_err(|_| Error::InvalidValType(byte))
    }
}

// Unknown vector sub-opcodes are an unsupported extension rather than a
// malformed stream: the vector space is still growing.
impl BoundedDecodable for VectorOpcode {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let val: u32 = decoder.read_leb128_raw()?;
        Self::try_from(val).map_err(|_| {
            warn!("unsupported vector opcode {val:#x} at {:#x}", decoder.offset());
            Error::Unsupported(Unsupported::VectorOpcode(val))
        })
    }
}

impl BoundedDecodable for MemArg {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(Self {
            align: decoder.read_bounded(context)?,
            offset: decoder.read_bounded(context)?,
        })
    }
}

impl<A: Allocator> Decodable<A> for Name<A> {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        alloc: &A,
    ) -> Result<Self, Error<Storage>> {
        let len: u32 = decoder.read_bounded(context)?;
        let bytes = decoder.read_bytes(context, len as usize, alloc)?;
        Name::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, TryFromPrimitive)]
enum FunctionTypeToken {
    Value = 0x60,
}

impl<A: Allocator> Decodable<A> for FunctionType<A> {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
        alloc: &A,
    ) -> Result<Self, Error<Storage>> {
        decoder.read_bounded::<FunctionTypeToken>(context)?;
        Ok(Self {
            parameters: decoder.read(context, alloc)?,
            results: decoder.read(context, alloc)?,
        })
    }
}

// The flags byte leading the limits: whether a maximum follows the minimum
// and whether the memory is shared. Other bits are malformed.
impl BoundedDecodable for Limits {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let flags: u8 = decoder.read_bounded(context)?;
        if flags & !(LIMITS_HAS_MAX | LIMITS_SHARED) != 0 {
            return Err(Error::InvalidToken(flags));
        }
        let min = decoder.read_bounded(context)?;
        let max = if flags & LIMITS_HAS_MAX == 0 {
            None
        } else {
            Some(decoder.read_bounded(context)?)
        };
        Ok(Self {
            min,
            max,
            shared: flags & LIMITS_SHARED != 0,
        })
    }
}

impl BoundedDecodable for MemoryType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(Self {
            limits: decoder.read_bounded(context)?,
        })
    }
}

// Only memories may be shared.
impl BoundedDecodable for TableType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let reftype = decoder.read_bounded(context)?;
        let limits: Limits = decoder.read_bounded(context)?;
        if limits.shared {
            return Err(Error::InvalidToken(limits.flags()));
        }
        Ok(Self { reftype, limits })
    }
}

impl BoundedDecodable for GlobalType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(Self {
            value: decoder.read_bounded(context)?,
            mutability: decoder.read_bounded(context)?,
        })
    }
}
