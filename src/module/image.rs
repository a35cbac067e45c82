// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The initial contents of linear memory, as laid down by the data segments.

use core::ops::Range;

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::types::DataId;

use super::{Arena, DataSegment, Error, Module};

/// The initial image of memory 0, built from the module's data segments.
///
/// The image exclusively borrows the segments for its lifetime. Each segment
/// is viewed through its range of the image: reads and writes go to the image,
/// and the segments' own buffers are only brought up to date by
/// [`MemoryImage::commit`]. Where segments overlap, later ones win, and an
/// earlier segment's view shows the overwritten bytes.
#[derive(Debug)]
pub struct MemoryImage<'a, A: Allocator> {
    segments: &'a mut Arena<DataId, DataSegment<A>, A>,
    bytes: Vec<u8, A>,
    ranges: Vec<(DataId, Range<usize>), A>,
}

impl<A: Allocator> MemoryImage<'_, A> {
    /// The whole image, from address zero to the end of the highest segment.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn range(&self, id: DataId) -> Option<Range<usize>> {
        self.ranges
            .iter()
            .find(|(other, _)| *other == id)
            .map(|(_, range)| range.clone())
    }

    /// The part of the image laid down by the given segment.
    pub fn view(&self, id: DataId) -> Option<&[u8]> {
        let range = self.range(id)?;
        Some(&self.bytes[range])
    }

    pub fn view_mut(&mut self, id: DataId) -> Option<&mut [u8]> {
        let range = self.range(id)?;
        Some(&mut self.bytes[range])
    }

    /// Copies each segment's view back into the segment, ending the overlay.
    pub fn commit(self) {
        for (id, range) in self.ranges.iter() {
            if let Some(segment) = self.segments.get_mut(*id) {
                segment.bytes.copy_from_slice(&self.bytes[range.clone()]);
            }
        }
    }
}

impl<A: Allocator> Module<A> {
    /// Computes the initial memory image from the data segments, all of
    /// which must have constant offsets.
    pub fn memory_image(&mut self) -> Result<MemoryImage<'_, A>, Error> {
        let mut ranges = Vec::new_in(self.alloc.clone());
        ranges.try_reserve_exact(self.data.len())?;
        let mut end = 0usize;
        for (id, segment) in self.data.iter() {
            let offset = segment
                .offset
                .const_offset()
                .ok_or(Error::NonConstantOffset(id))?;
            let start = usize::try_from(offset).map_err(|_| Error::OffsetOverflow(id))?;
            let stop = start
                .checked_add(segment.bytes.len())
                .ok_or(Error::OffsetOverflow(id))?;
            end = end.max(stop);
            ranges.push((id, start..stop));
        }

        let mut bytes = Vec::new_in(self.alloc.clone());
        bytes.try_reserve_exact(end)?;
        bytes.resize(end, 0);
        for (id, range) in ranges.iter() {
            if let Some(segment) = self.data.get(*id) {
                bytes[range.clone()].copy_from_slice(&segment.bytes);
            }
        }
        Ok(MemoryImage {
            segments: &mut self.data,
            bytes,
            ranges,
        })
    }
}
