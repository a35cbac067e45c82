// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly instructions.
//!
//! Opcodes are modeled as byte-valued enums, one per opcode space: the plain
//! one-byte space and the three prefixed spaces (0xfc, 0xfd, 0xfe) whose
//! sub-opcodes are LEB128-encoded. An [`Instruction`] is a variant per
//! immediate shape; structured instructions own their nested bodies, and
//! immediates naming entities hold handles rather than indices.

use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;

use super::{
    DataId, ElemId, FuncId, GlobalId, LocalId, MemId, RefType, TableId, TagId, TypeId, ValType,
    newtype,
};

/// WebAssembly instruction opcode.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum Opcode {
    Unreachable = 0x00,
    Nop = 0x01,
    Block = 0x02,
    Loop = 0x03,
    If = 0x04,
    Else = 0x05,
    Try = 0x06,
    Catch = 0x07,
    Throw = 0x08,
    Rethrow = 0x09,
    End = 0x0b,
    Br = 0x0c,
    BrIf = 0x0d,
    BrTable = 0x0e,
    Return = 0x0f,
    Call = 0x10,
    CallIndirect = 0x11,
    ReturnCall = 0x12,
    ReturnCallIndirect = 0x13,
    Delegate = 0x18,
    CatchAll = 0x19,

    // [wasm]: 5.4.2 Reference Instructions
    RefNull = 0xd0,
    RefIsNull = 0xd1,
    RefFunc = 0xd2,

    // [wasm]: 5.4.3 Parametric Instructions
    Drop = 0x1a,
    Select = 0x1b,
    SelectT = 0x1c,

    // [wasm]: 5.4.4 Variable Instructions
    LocalGet = 0x20,
    LocalSet = 0x21,
    LocalTee = 0x22,
    GlobalGet = 0x23,
    GlobalSet = 0x24,

    // [wasm]: 5.4.5 Table Instructions
    TableGet = 0x25,
    TableSet = 0x26,

    // [wasm]: 5.4.6 Memory Instructions
    I32Load = 0x28,
    I64Load = 0x29,
    F32Load = 0x2a,
    F64Load = 0x2b,
    I32Load8S = 0x2c,
    I32Load8U = 0x2d,
    I32Load16S = 0x2e,
    I32Load16U = 0x2f,
    I64Load8S = 0x30,
    I64Load8U = 0x31,
    I64Load16S = 0x32,
    I64Load16U = 0x33,
    I64Load32S = 0x34,
    I64Load32U = 0x35,
    I32Store = 0x36,
    I64Store = 0x37,
    F32Store = 0x38,
    F64Store = 0x39,
    I32Store8 = 0x3a,
    I32Store16 = 0x3b,
    I64Store8 = 0x3c,
    I64Store16 = 0x3d,
    I64Store32 = 0x3e,
    MemorySize = 0x3f,
    MemoryGrow = 0x40,

    // [wasm]: 5.4.7 Numeric Instructions
    I32Const = 0x41,
    I64Const = 0x42,
    F32Const = 0x43,
    F64Const = 0x44,
    I32Eqz = 0x45,
    I32Eq = 0x46,
    I32Ne = 0x47,
    I32LtS = 0x48,
    I32LtU = 0x49,
    I32GtS = 0x4a,
    I32GtU = 0x4b,
    I32LeS = 0x4c,
    I32LeU = 0x4d,
    I32GeS = 0x4e,
    I32GeU = 0x4f,
    I64Eqz = 0x50,
    I64Eq = 0x51,
    I64Ne = 0x52,
    I64LtS = 0x53,
    I64LtU = 0x54,
    I64GtS = 0x55,
    I64GtU = 0x56,
    I64LeS = 0x57,
    I64LeU = 0x58,
    I64GeS = 0x59,
    I64GeU = 0x5a,
    F32Eq = 0x5b,
    F32Ne = 0x5c,
    F32Lt = 0x5d,
    F32Gt = 0x5e,
    F32Le = 0x5f,
    F32Ge = 0x60,
    F64Eq = 0x61,
    F64Ne = 0x62,
    F64Lt = 0x63,
    F64Gt = 0x64,
    F64Le = 0x65,
    F64Ge = 0x66,
    I32Clz = 0x67,
    I32Ctz = 0x68,
    I32Popcnt = 0x69,
    I32Add = 0x6a,
    I32Sub = 0x6b,
    I32Mul = 0x6c,
    I32DivS = 0x6d,
    I32DivU = 0x6e,
    I32RemS = 0x6f,
    I32RemU = 0x70,
    I32And = 0x71,
    I32Or = 0x72,
    I32Xor = 0x73,
    I32Shl = 0x74,
    I32ShrS = 0x75,
    I32ShrU = 0x76,
    I32Rotl = 0x77,
    I32Rotr = 0x78,
    I64Clz = 0x79,
    I64Ctz = 0x7a,
    I64Popcnt = 0x7b,
    I64Add = 0x7c,
    I64Sub = 0x7d,
    I64Mul = 0x7e,
    I64DivS = 0x7f,
    I64DivU = 0x80,
    I64RemS = 0x81,
    I64RemU = 0x82,
    I64And = 0x83,
    I64Or = 0x84,
    I64Xor = 0x85,
    I64Shl = 0x86,
    I64ShrS = 0x87,
    I64ShrU = 0x88,
    I64Rotl = 0x89,
    I64Rotr = 0x8a,
    F32Abs = 0x8b,
    F32Neg = 0x8c,
    F32Ceil = 0x8d,
    F32Floor = 0x8e,
    F32Trunc = 0x8f,
    F32Nearest = 0x90,
    F32Sqrt = 0x91,
    F32Add = 0x92,
    F32Sub = 0x93,
    F32Mul = 0x94,
    F32Div = 0x95,
    F32Min = 0x96,
    F32Max = 0x97,
    F32Copysign = 0x98,
    F64Abs = 0x99,
    F64Neg = 0x9a,
    F64Ceil = 0x9b,
    F64Floor = 0x9c,
    F64Trunc = 0x9d,
    F64Nearest = 0x9e,
    F64Sqrt = 0x9f,
    F64Add = 0xa0,
    F64Sub = 0xa1,
    F64Mul = 0xa2,
    F64Div = 0xa3,
    F64Min = 0xa4,
    F64Max = 0xa5,
    F64Copysign = 0xa6,
    I32WrapI64 = 0xa7,
    I32TruncF32S = 0xa8,
    I32TruncF32U = 0xa9,
    I32TruncF64S = 0xaa,
    I32TruncF64U = 0xab,
    I64ExtendI32S = 0xac,
    I64ExtendI32U = 0xad,
    I64TruncF32S = 0xae,
    I64TruncF32U = 0xaf,
    I64TruncF64S = 0xb0,
    I64TruncF64U = 0xb1,
    F32ConvertI32S = 0xb2,
    F32ConvertI32U = 0xb3,
    F32ConvertI64S = 0xb4,
    F32ConvertI64U = 0xb5,
    F32DemoteF64 = 0xb6,
    F64ConvertI32S = 0xb7,
    F64ConvertI32U = 0xb8,
    F64ConvertI64S = 0xb9,
    F64ConvertI64U = 0xba,
    F64PromoteF32 = 0xbb,
    I32ReinterpretF32 = 0xbc,
    I64ReinterpretF64 = 0xbd,
    F32ReinterpretI32 = 0xbe,
    F64ReinterpretI64 = 0xbf,
    I32Extend8S = 0xc0,
    I32Extend16S = 0xc1,
    I64Extend8S = 0xc2,
    I64Extend16S = 0xc3,
    I64Extend32S = 0xc4,

    // [wasm]: 5.4.7 Numeric Instructions
    // [wasm]: 5.4.5 Table Instructions
    //
    // Prefix for the bulk memory and table instructions.
    BulkPrefix = 0xfc,

    // [wasm]: 5.4.8 Vector Instructions
    VectorPrefix = 0xfd,

    // Prefix for the threads proposal's atomic instructions.
    AtomicPrefix = 0xfe,
}

impl Opcode {
    /// Whether the opcode takes no immediates and opens no scope, i.e.,
    /// whether it can be represented by [`Instruction::Plain`].
    pub const fn is_plain(self) -> bool {
        let byte = self as u8;
        matches!(
            self,
            Opcode::Unreachable
                | Opcode::Nop
                | Opcode::Return
                | Opcode::Drop
                | Opcode::Select
                | Opcode::RefIsNull
        ) || (byte >= Opcode::I32Eqz as u8 && byte <= Opcode::I64Extend32S as u8)
    }

    /// Whether the opcode is a load or store taking a memarg.
    pub const fn is_memory_access(self) -> bool {
        let byte = self as u8;
        byte >= Opcode::I32Load as u8 && byte <= Opcode::I64Store32 as u8
    }
}

/// Bulk memory and table instruction opcodes (0xfc prefix).
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum BulkOpcode {
    // [wasm]: 5.4.5 Table Instructions
    TableInit = 12,
    ElemDrop = 13,
    TableCopy = 14,
    TableGrow = 15,
    TableSize = 16,
    TableFill = 17,

    // [wasm]: 5.4.6 Memory Instructions
    MemoryInit = 8,
    DataDrop = 9,
    MemoryCopy = 10,
    MemoryFill = 11,

    // [wasm]: 5.4.7 Numeric Instructions
    I32TruncSatF32S = 0,
    I32TruncSatF32U = 1,
    I32TruncSatF64S = 2,
    I32TruncSatF64U = 3,
    I64TruncSatF32S = 4,
    I64TruncSatF32U = 5,
    I64TruncSatF64S = 6,
    I64TruncSatF64U = 7,
}

/// SIMD vector instruction opcodes (0xfd prefix).
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum VectorOpcode {
    V128Load = 0,
    V128Load8x8S = 1,
    V128Load8x8U = 2,
    V128Load16x4S = 3,
    V128Load16x4U = 4,
    V128Load32x2S = 5,
    V128Load32x2U = 6,
    V128Load8Splat = 7,
    V128Load16Splat = 8,
    V128Load32Splat = 9,
    V128Load64Splat = 10,
    V128Store = 11,
    V128Load32Zero = 92,
    V128Load64Zero = 93,

    V128Load8Lane = 84,
    V128Load16Lane = 85,
    V128Load32Lane = 86,
    V128Load64Lane = 87,
    V128Store8Lane = 88,
    V128Store16Lane = 89,
    V128Store32Lane = 90,
    V128Store64Lane = 91,

    V128Const = 12,

    I8x16Shuffle = 13,

    I8x16Swizzle = 14,

    I8x16Splat = 15,
    I16x8Splat = 16,
    I32x4Splat = 17,
    I64x2Splat = 18,
    F32x4Splat = 19,
    F64x2Splat = 20,

    I8x16ExtractLaneS = 21,
    I8x16ExtractLaneU = 22,
    I8x16ReplaceLane = 23,
    I16x8ExtractLaneS = 24,
    I16x8ExtractLaneU = 25,
    I16x8ReplaceLane = 26,
    I32x4ExtractLane = 27,
    I32x4ReplaceLane = 28,
    I64x2ExtractLane = 29,
    I64x2ReplaceLane = 30,
    F32x4ExtractLane = 31,
    F32x4ReplaceLane = 32,
    F64x2ExtractLane = 33,
    F64x2ReplaceLane = 34,

    I8x16Eq = 35,
    I8x16Ne = 36,
    I8x16LtS = 37,
    I8x16LtU = 38,
    I8x16GtS = 39,
    I8x16GtU = 40,
    I8x16LeS = 41,
    I8x16LeU = 42,
    I8x16GeS = 43,
    I8x16GeU = 44,

    I16x8Eq = 45,
    I16x8Ne = 46,
    I16x8LtS = 47,
    I16x8LtU = 48,
    I16x8GtS = 49,
    I16x8GtU = 50,
    I16x8LeS = 51,
    I16x8LeU = 52,
    I16x8GeS = 53,
    I16x8GeU = 54,

    I32x4Eq = 55,
    I32x4Ne = 56,
    I32x4LtS = 57,
    I32x4LtU = 58,
    I32x4GtS = 59,
    I32x4GtU = 60,
    I32x4LeS = 61,
    I32x4LeU = 62,
    I32x4GeS = 63,
    I32x4GeU = 64,

    I64x2Eq = 214,
    I64x2Ne = 215,
    I64x2LtS = 216,
    I64x2GtS = 217,
    I64x2LeS = 218,
    I64x2GeS = 219,

    F32x4Eq = 65,
    F32x4Ne = 66,
    F32x4Lt = 67,
    F32x4Gt = 68,
    F32x4Le = 69,
    F32x4Ge = 70,

    F64x2Eq = 71,
    F64x2Ne = 72,
    F64x2Lt = 73,
    F64x2Gt = 74,
    F64x2Le = 75,
    F64x2Ge = 76,

    V128Not = 77,
    V128And = 78,
    V128Andnot = 79,
    V128Or = 80,
    V128Xor = 81,
    V128Bitselect = 82,
    V128AnyTrue = 83,

    I8x16Abs = 96,
    I8x16Neg = 97,
    I8x16Popcnt = 98,
    I8x16AllTrue = 99,
    I8x16Bitmask = 100,
    I8x16NarrowI16x8S = 101,
    I8x16NarrowI16x8U = 102,
    I8x16Shl = 107,
    I8x16ShrS = 108,
    I8x16ShrU = 109,
    I8x16Add = 110,
    I8x16AddSatS = 111,
    I8x16AddSatU = 112,
    I8x16Sub = 113,
    I8x16SubSatS = 114,
    I8x16SubSatU = 115,
    I8x16MinS = 118,
    I8x16MinU = 119,
    I8x16MaxS = 120,
    I8x16MaxU = 121,
    I8x16AvgrU = 123,

    I16x8ExtaddPairwiseI8x16S = 124,
    I16x8ExtaddPairwiseI8x16U = 125,
    I16x8Abs = 128,
    I16x8Neg = 129,
    I16x8Q15mulrSatS = 130,
    I16x8AllTrue = 131,
    I16x8Bitmask = 132,
    I16x8NarrowI32x4S = 133,
    I16x8NarrowI32x4U = 134,
    I16x8ExtendLowI8x16S = 135,
    I16x8ExtendHighI8x16S = 136,
    I16x8ExtendLowI8x16U = 137,
    I16x8ExtendHighI8x16U = 138,
    I16x8Shl = 139,
    I16x8ShrS = 140,
    I16x8ShrU = 141,
    I16x8Add = 142,
    I16x8AddSatS = 143,
    I16x8AddSatU = 144,
    I16x8Sub = 145,
    I16x8SubSatS = 146,
    I16x8SubSatU = 147,
    I16x8Mul = 149,
    I16x8MinS = 150,
    I16x8MinU = 151,
    I16x8MaxS = 152,
    I16x8MaxU = 153,
    I16x8AvgrU = 155,
    I16x8ExtmulLowI8x16S = 156,
    I16x8ExtmulHighI8x16S = 157,
    I16x8ExtmulLowI8x16U = 158,
    I16x8ExtmulHighI8x16U = 159,

    I32x4ExtaddPairwiseI16x8S = 126,
    I32x4ExtaddPairwiseI16x8U = 127,
    I32x4Abs = 160,
    I32x4Neg = 161,
    I32x4AllTrue = 163,
    I32x4Bitmask = 164,
    I32x4ExtendLowI16x8S = 167,
    I32x4ExtendHighI16x8S = 168,
    I32x4ExtendLowI16x8U = 169,
    I32x4ExtendHighI16x8U = 170,
    I32x4Shl = 171,
    I32x4ShrS = 172,
    I32x4ShrU = 173,
    I32x4Add = 174,
    I32x4Sub = 177,
    I32x4Mul = 181,
    I32x4MinS = 182,
    I32x4MinU = 183,
    I32x4MaxS = 184,
    I32x4MaxU = 185,
    I32x4DotI16x8S = 186,
    I32x4ExtmulLowI16x8S = 188,
    I32x4ExtmulHighI16x8S = 189,
    I32x4ExtmulLowI16x8U = 190,
    I32x4ExtmulHighI16x8U = 191,

    I64x2Abs = 192,
    I64x2Neg = 193,
    I64x2AllTrue = 195,
    I64x2Bitmask = 196,
    I64x2ExtendLowI32x4S = 199,
    I64x2ExtendHighI32x4S = 200,
    I64x2ExtendLowI32x4U = 201,
    I64x2ExtendHighI32x4U = 202,
    I64x2Shl = 203,
    I64x2ShrS = 204,
    I64x2ShrU = 205,
    I64x2Add = 206,
    I64x2Sub = 209,
    I64x2Mul = 213,
    I64x2ExtmulLowI32x4S = 220,
    I64x2ExtmulHighI32x4S = 221,
    I64x2ExtmulLowI32x4U = 222,
    I64x2ExtmulHighI32x4U = 223,

    F32x4Ceil = 103,
    F32x4Floor = 104,
    F32x4Trunc = 105,
    F32x4Nearest = 106,
    F32x4Abs = 224,
    F32x4Neg = 225,
    F32x4Sqrt = 227,
    F32x4Add = 228,
    F32x4Sub = 229,
    F32x4Mul = 230,
    F32x4Div = 231,
    F32x4Min = 232,
    F32x4Max = 233,
    F32x4Pmin = 234,
    F32x4Pmax = 235,

    F64x2Ceil = 116,
    F64x2Floor = 117,
    F64x2Trunc = 122,
    F64x2Nearest = 148,
    F64x2Abs = 236,
    F64x2Neg = 237,
    F64x2Sqrt = 239,
    F64x2Add = 240,
    F64x2Sub = 241,
    F64x2Mul = 242,
    F64x2Div = 243,
    F64x2Min = 244,
    F64x2Max = 245,
    F64x2Pmin = 246,
    F64x2Pmax = 247,

    I32x4TruncSatF32x4S = 248,
    I32x4TruncSatF32x4U = 249,
    F32x4ConvertI32x4S = 250,
    F32x4ConvertI32x4U = 251,
    I32x4TruncSatF64x2SZero = 252,
    I32x4TruncSatF64x2UZero = 253,
    F64x2ConvertLowI32x4S = 254,
    F64x2ConvertLowI32x4U = 255,
    F32x4DemoteF64x2Zero = 94,
    F64x2PromoteLowF32x4 = 95,
}

/// The immediates following a vector sub-opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VectorShape {
    None,
    MemArg,
    MemArgLane,
    Lane,
    Bytes16,
}

impl VectorOpcode {
    pub const fn shape(self) -> VectorShape {
        use VectorOpcode::*;
        match self {
            V128Load | V128Load8x8S | V128Load8x8U | V128Load16x4S | V128Load16x4U
            | V128Load32x2S | V128Load32x2U | V128Load8Splat | V128Load16Splat
            | V128Load32Splat | V128Load64Splat | V128Store | V128Load32Zero
            | V128Load64Zero => VectorShape::MemArg,
            V128Load8Lane | V128Load16Lane | V128Load32Lane | V128Load64Lane
            | V128Store8Lane | V128Store16Lane | V128Store32Lane | V128Store64Lane => {
                VectorShape::MemArgLane
            }
            V128Const | I8x16Shuffle => VectorShape::Bytes16,
            I8x16ExtractLaneS | I8x16ExtractLaneU | I8x16ReplaceLane | I16x8ExtractLaneS
            | I16x8ExtractLaneU | I16x8ReplaceLane | I32x4ExtractLane | I32x4ReplaceLane
            | I64x2ExtractLane | I64x2ReplaceLane | F32x4ExtractLane | F32x4ReplaceLane
            | F64x2ExtractLane | F64x2ReplaceLane => VectorShape::Lane,
            _ => VectorShape::None,
        }
    }
}

/// Atomic memory instruction opcodes (0xfe prefix).
///
/// Every atomic instruction takes a memarg, apart from `atomic.fence`, which
/// takes a single reserved zero byte.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum AtomicOpcode {
    MemoryAtomicNotify = 0x00,
    MemoryAtomicWait32 = 0x01,
    MemoryAtomicWait64 = 0x02,
    AtomicFence = 0x03,

    I32AtomicLoad = 0x10,
    I64AtomicLoad = 0x11,
    I32AtomicLoad8U = 0x12,
    I32AtomicLoad16U = 0x13,
    I64AtomicLoad8U = 0x14,
    I64AtomicLoad16U = 0x15,
    I64AtomicLoad32U = 0x16,
    I32AtomicStore = 0x17,
    I64AtomicStore = 0x18,
    I32AtomicStore8 = 0x19,
    I32AtomicStore16 = 0x1a,
    I64AtomicStore8 = 0x1b,
    I64AtomicStore16 = 0x1c,
    I64AtomicStore32 = 0x1d,

    I32AtomicRmwAdd = 0x1e,
    I64AtomicRmwAdd = 0x1f,
    I32AtomicRmw8AddU = 0x20,
    I32AtomicRmw16AddU = 0x21,
    I64AtomicRmw8AddU = 0x22,
    I64AtomicRmw16AddU = 0x23,
    I64AtomicRmw32AddU = 0x24,

    I32AtomicRmwSub = 0x25,
    I64AtomicRmwSub = 0x26,
    I32AtomicRmw8SubU = 0x27,
    I32AtomicRmw16SubU = 0x28,
    I64AtomicRmw8SubU = 0x29,
    I64AtomicRmw16SubU = 0x2a,
    I64AtomicRmw32SubU = 0x2b,

    I32AtomicRmwAnd = 0x2c,
    I64AtomicRmwAnd = 0x2d,
    I32AtomicRmw8AndU = 0x2e,
    I32AtomicRmw16AndU = 0x2f,
    I64AtomicRmw8AndU = 0x30,
    I64AtomicRmw16AndU = 0x31,
    I64AtomicRmw32AndU = 0x32,

    I32AtomicRmwOr = 0x33,
    I64AtomicRmwOr = 0x34,
    I32AtomicRmw8OrU = 0x35,
    I32AtomicRmw16OrU = 0x36,
    I64AtomicRmw8OrU = 0x37,
    I64AtomicRmw16OrU = 0x38,
    I64AtomicRmw32OrU = 0x39,

    I32AtomicRmwXor = 0x3a,
    I64AtomicRmwXor = 0x3b,
    I32AtomicRmw8XorU = 0x3c,
    I32AtomicRmw16XorU = 0x3d,
    I64AtomicRmw8XorU = 0x3e,
    I64AtomicRmw16XorU = 0x3f,
    I64AtomicRmw32XorU = 0x40,

    I32AtomicRmwXchg = 0x41,
    I64AtomicRmwXchg = 0x42,
    I32AtomicRmw8XchgU = 0x43,
    I32AtomicRmw16XchgU = 0x44,
    I64AtomicRmw8XchgU = 0x45,
    I64AtomicRmw16XchgU = 0x46,
    I64AtomicRmw32XchgU = 0x47,

    I32AtomicRmwCmpxchg = 0x48,
    I64AtomicRmwCmpxchg = 0x49,
    I32AtomicRmw8CmpxchgU = 0x4a,
    I32AtomicRmw16CmpxchgU = 0x4b,
    I64AtomicRmw8CmpxchgU = 0x4c,
    I64AtomicRmw16CmpxchgU = 0x4d,
    I64AtomicRmw32CmpxchgU = 0x4e,
}

/// The composite key of a prefixed opcode: the prefix byte in the high bits
/// and the sub-opcode in the low eight.
pub const fn opcode_key(prefix: Opcode, sub: u32) -> u32 {
    ((prefix as u32) << 8) | sub
}

/// Block type for structured control instructions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockType {
    /// Block takes and produces no values.
    Empty,
    /// Block produces a single result of the given type.
    Value(ValType),
    /// Block signature is a (multi-value) function type.
    Type(TypeId),
}

// The byte denoting an empty block type.
pub(crate) const BLOCK_TYPE_EMPTY: u8 = 0x40;

/// Memory access operands for load and store instructions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemArg {
    /// Alignment hint (log2 of the alignment requirement).
    pub align: u32,
    /// Static offset added to the dynamic address.
    pub offset: u32,
}

/// A 32-bit float immediate, kept as its bit pattern so that NaN payloads
/// survive a round trip.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ieee32(pub u32);

impl Ieee32 {
    pub fn value(self) -> f32 {
        f32::from_bits(self.0)
    }
}

impl From<f32> for Ieee32 {
    fn from(value: f32) -> Self {
        Self(value.to_bits())
    }
}

/// A 64-bit float immediate, kept as its bit pattern.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ieee64(pub u64);

impl Ieee64 {
    pub fn value(self) -> f64 {
        f64::from_bits(self.0)
    }
}

impl From<f64> for Ieee64 {
    fn from(value: f64) -> Self {
        Self(value.to_bits())
    }
}

/// The body of a structured instruction, without its terminating `end`.
pub type Body<A> = Vec<Instruction<A>, A>;

/// A `catch` (with a tag) or `catch_all` (without) clause of a `try` block.
#[derive(Clone, Debug)]
pub struct Handler<A: Allocator> {
    pub tag: Option<TagId>,
    pub body: Body<A>,
}

/// A decoded instruction.
///
/// Structured instructions own their bodies; the `end` closing a body is
/// implied by the nesting. Only the `end` that terminates a whole expression
/// (a function body or an initializer) appears as [`Instruction::End`].
#[derive(Clone, Debug)]
pub enum Instruction<A: Allocator> {
    /// An instruction without immediates, e.g. `nop`, `drop` or `i32.add`.
    /// The opcode must satisfy [`Opcode::is_plain`].
    Plain(Opcode),
    /// The end of an expression.
    End,

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
    /// A legacy exception-handling block. It is closed either by `end`, after
    /// any handlers, or by `delegate` to the given label.
    Try {
        ty: BlockType,
        body: Body<A>,
        handlers: Vec<Handler<A>, A>,
        delegate: Option<u32>,
    },

    Br(u32),
    BrIf(u32),
    BrTable {
        labels: Vec<u32, A>,
        default: u32,
    },
    Call(FuncId),
    CallIndirect {
        ty: TypeId,
        table: TableId,
    },
    ReturnCall(FuncId),
    ReturnCallIndirect {
        ty: TypeId,
        table: TableId,
    },
    Throw(TagId),
    Rethrow(u32),

    RefNull(RefType),
    RefFunc(FuncId),
    SelectT(Vec<ValType, A>),

    LocalGet(LocalId),
    LocalSet(LocalId),
    LocalTee(LocalId),
    GlobalGet(GlobalId),
    GlobalSet(GlobalId),
    TableGet(TableId),
    TableSet(TableId),

    /// A load or store; the opcode satisfies [`Opcode::is_memory_access`].
    Memory {
        op: Opcode,
        arg: MemArg,
    },
    MemorySize(MemId),
    MemoryGrow(MemId),

    I32Const(i32),
    I64Const(i64),
    F32Const(Ieee32),
    F64Const(Ieee64),

    /// A saturating truncation, the 0xfc instructions without immediates.
    TruncSat(BulkOpcode),
    MemoryInit {
        data: DataId,
        memory: MemId,
    },
    DataDrop(DataId),
    MemoryCopy {
        dst: MemId,
        src: MemId,
    },
    MemoryFill(MemId),
    TableInit {
        elem: ElemId,
        table: TableId,
    },
    ElemDrop(ElemId),
    TableCopy {
        dst: TableId,
        src: TableId,
    },
    TableGrow(TableId),
    TableSize(TableId),
    TableFill(TableId),

    /// A vector instruction without immediates.
    Vector(VectorOpcode),
    VectorMemory {
        op: VectorOpcode,
        arg: MemArg,
    },
    VectorMemoryLane {
        op: VectorOpcode,
        arg: MemArg,
        lane: u8,
    },
    VectorLane {
        op: VectorOpcode,
        lane: u8,
    },
    /// `v128.const` or `i8x16.shuffle`.
    VectorBytes {
        op: VectorOpcode,
        bytes: [u8; 16],
    },

    AtomicFence,
    Atomic {
        op: AtomicOpcode,
        arg: MemArg,
    },
}

impl<A: Allocator> Instruction<A> {
    /// The leading opcode byte: the opcode itself, or the prefix of a
    /// prefixed instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Plain(op) | Instruction::Memory { op, .. } => *op,
            Instruction::End => Opcode::End,
            Instruction::Block { .. } => Opcode::Block,
            Instruction::Loop { .. } => Opcode::Loop,
            Instruction::If { .. } => Opcode::If,
            Instruction::Try { .. } => Opcode::Try,
            Instruction::Br(_) => Opcode::Br,
            Instruction::BrIf(_) => Opcode::BrIf,
            Instruction::BrTable { .. } => Opcode::BrTable,
            Instruction::Call(_) => Opcode::Call,
            Instruction::CallIndirect { .. } => Opcode::CallIndirect,
            Instruction::ReturnCall(_) => Opcode::ReturnCall,
            Instruction::ReturnCallIndirect { .. } => Opcode::ReturnCallIndirect,
            Instruction::Throw(_) => Opcode::Throw,
            Instruction::Rethrow(_) => Opcode::Rethrow,
            Instruction::RefNull(_) => Opcode::RefNull,
            Instruction::RefFunc(_) => Opcode::RefFunc,
            Instruction::SelectT(_) => Opcode::SelectT,
            Instruction::LocalGet(_) => Opcode::LocalGet,
            Instruction::LocalSet(_) => Opcode::LocalSet,
            Instruction::LocalTee(_) => Opcode::LocalTee,
            Instruction::GlobalGet(_) => Opcode::GlobalGet,
            Instruction::GlobalSet(_) => Opcode::GlobalSet,
            Instruction::TableGet(_) => Opcode::TableGet,
            Instruction::TableSet(_) => Opcode::TableSet,
            Instruction::MemorySize(_) => Opcode::MemorySize,
            Instruction::MemoryGrow(_) => Opcode::MemoryGrow,
            Instruction::I32Const(_) => Opcode::I32Const,
            Instruction::I64Const(_) => Opcode::I64Const,
            Instruction::F32Const(_) => Opcode::F32Const,
            Instruction::F64Const(_) => Opcode::F64Const,
            Instruction::TruncSat(_)
            | Instruction::MemoryInit { .. }
            | Instruction::DataDrop(_)
            | Instruction::MemoryCopy { .. }
            | Instruction::MemoryFill(_)
            | Instruction::TableInit { .. }
            | Instruction::ElemDrop(_)
            | Instruction::TableCopy { .. }
            | Instruction::TableGrow(_)
            | Instruction::TableSize(_)
            | Instruction::TableFill(_) => Opcode::BulkPrefix,
            Instruction::Vector(_)
            | Instruction::VectorMemory { .. }
            | Instruction::VectorMemoryLane { .. }
            | Instruction::VectorLane { .. }
            | Instruction::VectorBytes { .. } => Opcode::VectorPrefix,
            Instruction::AtomicFence | Instruction::Atomic { .. } => Opcode::AtomicPrefix,
        }
    }

    /// The opcode of the instruction as a single key: the byte itself for
    /// plain opcodes, and [`opcode_key`] for prefixed ones.
    pub fn opcode_key(&self) -> u32 {
        match self.prefixed() {
            Some((prefix, sub)) => opcode_key(prefix, sub),
            None => self.opcode() as u32,
        }
    }

    // The prefix and sub-opcode of a prefixed instruction.
    pub(crate) fn prefixed(&self) -> Option<(Opcode, u32)> {
        let bulk = |op: BulkOpcode| Some((Opcode::BulkPrefix, op as u32));
        let vector = |op: VectorOpcode| Some((Opcode::VectorPrefix, op as u32));
        match self {
            Instruction::TruncSat(op) => bulk(*op),
            Instruction::MemoryInit { .. } => bulk(BulkOpcode::MemoryInit),
            Instruction::DataDrop(_) => bulk(BulkOpcode::DataDrop),
            Instruction::MemoryCopy { .. } => bulk(BulkOpcode::MemoryCopy),
            Instruction::MemoryFill(_) => bulk(BulkOpcode::MemoryFill),
            Instruction::TableInit { .. } => bulk(BulkOpcode::TableInit),
            Instruction::ElemDrop(_) => bulk(BulkOpcode::ElemDrop),
            Instruction::TableCopy { .. } => bulk(BulkOpcode::TableCopy),
            Instruction::TableGrow(_) => bulk(BulkOpcode::TableGrow),
            Instruction::TableSize(_) => bulk(BulkOpcode::TableSize),
            Instruction::TableFill(_) => bulk(BulkOpcode::TableFill),
            Instruction::Vector(op)
            | Instruction::VectorMemory { op, .. }
            | Instruction::VectorMemoryLane { op, .. }
            | Instruction::VectorLane { op, .. }
            | Instruction::VectorBytes { op, .. } => vector(*op),
            Instruction::AtomicFence => {
                Some((Opcode::AtomicPrefix, AtomicOpcode::AtomicFence as u32))
            }
            Instruction::Atomic { op, .. } => Some((Opcode::AtomicPrefix, *op as u32)),
            _ => None,
        }
    }
}

newtype!(
    /// A sequence of instructions terminated by [`Instruction::End`], as
    /// found in function bodies and initializer expressions.
    #[derive(Clone, Debug)]
    pub struct Expression<A: Allocator>(Vec<Instruction<A>, A>);
);

impl<A: Allocator> Expression<A> {
    /// An expression consisting only of `end`.
    pub fn empty_in(alloc: A) -> Result<Self, TryReserveError> {
        Self::from_instructions(&mut [], alloc)
    }

    /// Moves the given instructions into a new expression, appending the
    /// terminating `end`.
    pub fn from_instructions(
        instrs: &mut [Option<Instruction<A>>],
        alloc: A,
    ) -> Result<Self, TryReserveError> {
        let mut vec = Vec::new_in(alloc);
        vec.try_reserve_exact(instrs.len() + 1)?;
        vec.extend(instrs.iter_mut().filter_map(Option::take));
        vec.push(Instruction::End);
        Ok(Self(vec))
    }

    /// The instructions, mutably. Callers are responsible for keeping the
    /// terminating `end` in place.
    pub fn instructions_mut(&mut self) -> &mut Vec<Instruction<A>, A> {
        &mut self.0
    }

    /// The value of a constant `i32.const` or `i64.const` expression.
    pub fn const_offset(&self) -> Option<u64> {
        match self.0.as_slice() {
            [Instruction::I32Const(value), Instruction::End] => Some(u64::from(*value as u32)),
            [Instruction::I64Const(value), Instruction::End] => Some(*value as u64),
            _ => None,
        }
    }
}
