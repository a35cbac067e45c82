// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary format object model.
//!
//! A [`Module`] is decoded from the binary format into per-kind collections
//! of entities that refer to one another by typed handles rather than by
//! index. It can be inspected and rewritten freely and is then encoded back,
//! with indices recomputed from the entities' positions. Modules that are
//! decoded and encoded without modification come out equivalent, and
//! byte-identical when the input was canonically encoded: minimal LEB128
//! integers, locals grouped in runs and no empty sections.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(nightly, feature(allocator_api))]

#[cfg(nightly)]
extern crate alloc;

pub mod core_compat;
pub mod decode;
pub mod encode;
pub mod leb128;
pub mod module;
pub mod names;
pub mod storage;
pub mod types;

use core::fmt;

use decode::{ContextStack, CustomSectionVisitor, decode_module};
use storage::Stream;

pub use encode::EncodeOptions;
pub use module::Module;

/// A convenience trait that captures the required allocation-related trait
/// bounds.
pub trait Allocator: core_compat::alloc::Allocator + fmt::Debug + Clone {}

impl<A> Allocator for A where A: core_compat::alloc::Allocator + fmt::Debug + Clone {}

/// A coarse classification of errors, shared by decoding, encoding and
/// mutation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Malformed input or a malformed object model.
    Structural,
    /// A handle or index that does not resolve.
    Reference,
    /// A recognized construct that is not implemented.
    Unsupported,
    /// Two computations of the same quantity disagree.
    Consistency,
    /// Failed memory allocation.
    Allocation,
}

impl<A: Allocator> Module<A> {
    /// Decodes the module from streaming storage, with a given allocator and a
    /// custom section visitor.
    pub fn decode<Storage: Stream, CustomSecVisitor: CustomSectionVisitor<A>>(
        storage: Storage,
        customsec_visitor: &mut CustomSecVisitor,
        alloc: A,
    ) -> Result<Self, decode::ErrorWithContext<Storage>> {
        let mut context = ContextStack::default();
        decode_module(storage, &mut context, customsec_visitor, alloc)
            .map_err(|error| decode::ErrorWithContext { error, context })
    }
}
