// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-kind entity storage.
//!
//! Entities are stored in slots that are never reused, which gives each one a
//! stable handle. A separate list records the positional order, which is what
//! indices are derived from.

use core::marker::PhantomData;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::types::Handle;

#[derive(Debug)]
pub(crate) struct Arena<Id: Handle, T, A: Allocator> {
    slots: Vec<Option<T>, A>,
    order: Vec<Id, A>,
    _id: PhantomData<Id>,
}

impl<Id: Handle, T, A: Allocator> Arena<Id, T, A> {
    pub(crate) fn new_in(alloc: A) -> Self {
        Self {
            slots: Vec::new_in(alloc.clone()),
            order: Vec::new_in(alloc),
            _id: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    // The number of handles ever issued, which bounds their raw values.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        self.slots.try_reserve(additional)?;
        self.order.try_reserve(additional)
    }

    pub(crate) fn get(&self, id: Id) -> Option<&T> {
        self.slots.get(id.raw() as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.slots.get_mut(id.raw() as usize)?.as_mut()
    }

    pub(crate) fn contains(&self, id: Id) -> bool {
        self.get(id).is_some()
    }

    /// Inserts `value` at the given position of the order.
    pub(crate) fn insert(&mut self, pos: usize, value: T) -> Result<Id, TryReserveError> {
        self.reserve(1)?;
        let id = Id::from_raw(self.slots.len() as u32);
        self.slots.push(Some(value));
        self.order.insert(pos, id);
        Ok(id)
    }

    pub(crate) fn push(&mut self, value: T) -> Result<Id, TryReserveError> {
        self.insert(self.order.len(), value)
    }

    pub(crate) fn remove(&mut self, id: Id) -> Option<T> {
        let value = self.slots.get_mut(id.raw() as usize)?.take()?;
        self.order.retain(|&other| other != id);
        Some(value)
    }

    /// The handle at the given index.
    pub(crate) fn handle_at(&self, index: u32) -> Option<Id> {
        self.order.get(index as usize).copied()
    }

    /// The index of the given handle, by linear scan.
    pub(crate) fn position(&self, id: Id) -> Option<u32> {
        self.order
            .iter()
            .position(|&other| other == id)
            .map(|pos| pos as u32)
    }

    /// A table from raw handle values to indices, where handles of removed
    /// entities map to `u32::MAX`.
    pub(crate) fn positions(&self, alloc: A) -> Result<Vec<u32, A>, TryReserveError> {
        let mut table = Vec::new_in(alloc);
        table.try_reserve_exact(self.slots.len())?;
        table.resize(self.slots.len(), u32::MAX);
        for (pos, id) in self.order.iter().enumerate() {
            table[id.raw() as usize] = pos as u32;
        }
        Ok(table)
    }

    /// The handles in positional order.
    pub(crate) fn ids(&self) -> &[Id] {
        &self.order
    }

    /// The entities in positional order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Id, &T)> + '_ {
        self.order
            .iter()
            .filter_map(|&id| Some((id, self.slots.get(id.raw() as usize)?.as_ref()?)))
    }

    /// The entities in no particular order.
    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.slots.iter_mut().flatten()
    }

    /// The number of leading entities satisfying `pred`.
    pub(crate) fn leading(&self, pred: impl Fn(&T) -> bool) -> usize {
        self.iter().take_while(|(_, value)| pred(value)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global;
    use crate::types::FuncId;

    #[test]
    fn handles_are_stable_across_insertion() {
        let mut arena: Arena<FuncId, &str, Global> = Arena::new_in(Global);
        let b = arena.push("b").unwrap();
        let c = arena.push("c").unwrap();
        let a = arena.insert(0, "a").unwrap();

        assert_eq!(arena.position(a), Some(0));
        assert_eq!(arena.position(b), Some(1));
        assert_eq!(arena.position(c), Some(2));
        assert_eq!(arena.handle_at(1), Some(b));
        assert_eq!(arena.get(c), Some(&"c"));
        assert_eq!(arena.leading(|value| *value != "c"), 2);
        assert_eq!(arena.positions(Global).unwrap().as_slice(), &[1, 2, 0]);
    }

    #[test]
    fn removal_leaves_handle_dangling() {
        let mut arena: Arena<FuncId, u32, Global> = Arena::new_in(Global);
        let first = arena.push(1).unwrap();
        let second = arena.push(2).unwrap();
        assert_eq!(arena.remove(first), Some(1));
        assert_eq!(arena.remove(first), None);
        assert!(!arena.contains(first));
        assert_eq!(arena.position(first), None);
        assert_eq!(arena.position(second), Some(0));
        assert_eq!(arena.len(), 1);

        let third = arena.push(3).unwrap();
        assert_ne!(third, first);
        assert_eq!(arena.slot_count(), 3);
    }
}
