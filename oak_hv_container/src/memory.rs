//
// Copyright 2024 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Physical memory reservation used to stage the hypervisor and its modules.

use alloc::{collections::BTreeMap, vec::Vec};

use log::{trace, warn};
use x86_64::{
    align_down,
    structures::paging::{PageSize, Size4KiB},
    PhysAddr,
};

use crate::PAGE_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("physical memory reservation failed")]
pub struct AllocError;

/// Number of pages needed to hold `size` bytes.
pub fn page_count(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Page-granular physical memory provided by the firmware.
///
/// Reservations are never moved. A reserved region stays accessible through
/// [`PhysicalMemory::region_mut`] until it is freed.
pub trait PhysicalMemory {
    /// Reserves the pages covering `size` bytes starting exactly at `address`.
    fn allocate_fixed(&mut self, address: PhysAddr, size: usize) -> Result<PhysAddr, AllocError>;

    /// Reserves the pages covering `size` bytes at an `align`-aligned address
    /// such that the whole region lies within `[min, max]`.
    fn allocate_range(
        &mut self,
        size: usize,
        align: u64,
        min: PhysAddr,
        max: PhysAddr,
    ) -> Result<PhysAddr, AllocError>;

    /// Releases `pages` pages starting at `address`.
    fn free_pages(&mut self, address: PhysAddr, pages: usize);

    /// Mutable view of `size` bytes of reserved memory starting at `address`.
    fn region_mut(&mut self, address: PhysAddr, size: usize) -> Result<&mut [u8], AllocError>;
}

impl<T: PhysicalMemory + ?Sized> PhysicalMemory for &mut T {
    fn allocate_fixed(&mut self, address: PhysAddr, size: usize) -> Result<PhysAddr, AllocError> {
        (**self).allocate_fixed(address, size)
    }

    fn allocate_range(
        &mut self,
        size: usize,
        align: u64,
        min: PhysAddr,
        max: PhysAddr,
    ) -> Result<PhysAddr, AllocError> {
        (**self).allocate_range(size, align, min, max)
    }

    fn free_pages(&mut self, address: PhysAddr, pages: usize) {
        (**self).free_pages(address, pages)
    }

    fn region_mut(&mut self, address: PhysAddr, size: usize) -> Result<&mut [u8], AllocError> {
        (**self).region_mut(address, size)
    }
}

/// Where a region must be reserved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Exactly at the given address.
    Fixed(PhysAddr),
    /// Anywhere within `[min, max]` at the given alignment.
    Anywhere { align: u64, min: PhysAddr, max: PhysAddr },
}

impl Placement {
    /// Reserves `size` bytes according to this placement. Relocatable regions
    /// are never placed below `floor`.
    pub fn place<M: PhysicalMemory + ?Sized>(
        &self,
        memory: &mut M,
        size: usize,
        floor: PhysAddr,
    ) -> Result<PhysAddr, AllocError> {
        match *self {
            Placement::Fixed(address) => memory.allocate_fixed(address, size),
            Placement::Anywhere { align, min, max } => {
                let min = min.max(floor);
                if min > max {
                    warn!("relocation range {:#x}..={:#x} lies below the floor", min, max);
                    return Err(AllocError);
                }
                memory.allocate_range(size, align, min, max)
            }
        }
    }
}

/// Host-backed stand-in for firmware physical memory.
///
/// Each reservation is backed by a zeroed heap buffer. Ranged reservations are
/// satisfied top-down, which mirrors how UEFI hands out `AllocateMaxAddress`
/// requests.
pub struct SimulatedMemory {
    limit: u64,
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SimulatedMemory {
    /// Creates an empty address space covering `[0, limit)`.
    pub fn new(limit: PhysAddr) -> Self {
        Self { limit: limit.as_u64(), regions: BTreeMap::new() }
    }

    /// Start address and length of every reserved region, in address order.
    pub fn regions(&self) -> impl Iterator<Item = (PhysAddr, usize)> + '_ {
        self.regions.iter().map(|(start, buffer)| (PhysAddr::new_truncate(*start), buffer.len()))
    }

    /// Reads back `len` bytes of reserved memory.
    pub fn read(&self, address: PhysAddr, len: usize) -> Option<&[u8]> {
        let (start, buffer) = self.regions.range(..=address.as_u64()).next_back()?;
        let offset = usize::try_from(address.as_u64() - start).ok()?;
        buffer.get(offset..offset.checked_add(len)?)
    }

    /// Start of the first region overlapping `[start, end)`, if any.
    fn first_overlap(&self, start: u64, end: u64) -> Option<u64> {
        self.regions
            .iter()
            .filter(|(region, buffer)| **region < end && start < **region + buffer.len() as u64)
            .map(|(region, _)| *region)
            .next()
    }

    fn insert(&mut self, start: u64, size: u64) -> Result<PhysAddr, AllocError> {
        let address = PhysAddr::try_new(start).map_err(|_| AllocError)?;
        let len = usize::try_from(size).map_err(|_| AllocError)?;
        trace!("reserving {:#x} bytes at {:#x}", len, start);
        self.regions.insert(start, vec![0u8; len]);
        Ok(address)
    }
}

fn page_round(size: usize) -> Result<u64, AllocError> {
    u64::try_from(page_count(size))
        .ok()
        .and_then(|pages| pages.checked_mul(Size4KiB::SIZE))
        .filter(|size| *size > 0)
        .ok_or(AllocError)
}

impl PhysicalMemory for SimulatedMemory {
    fn allocate_fixed(&mut self, address: PhysAddr, size: usize) -> Result<PhysAddr, AllocError> {
        let start = address.as_u64();
        let size = page_round(size)?;
        if !address.is_aligned(Size4KiB::SIZE) {
            return Err(AllocError);
        }
        let end = start.checked_add(size).filter(|end| *end <= self.limit).ok_or(AllocError)?;
        if self.first_overlap(start, end).is_some() {
            return Err(AllocError);
        }
        self.insert(start, size)
    }

    fn allocate_range(
        &mut self,
        size: usize,
        align: u64,
        min: PhysAddr,
        max: PhysAddr,
    ) -> Result<PhysAddr, AllocError> {
        let size = page_round(size)?;
        let align = align.max(Size4KiB::SIZE);
        if !align.is_power_of_two() {
            return Err(AllocError);
        }
        let top = max.as_u64().min(self.limit);
        let mut candidate = align_down(top.checked_sub(size).ok_or(AllocError)?, align);
        while candidate >= min.as_u64() {
            match self.first_overlap(candidate, candidate + size) {
                None => return self.insert(candidate, size),
                Some(region) => {
                    candidate = align_down(region.checked_sub(size).ok_or(AllocError)?, align);
                }
            }
        }
        Err(AllocError)
    }

    fn free_pages(&mut self, address: PhysAddr, pages: usize) {
        match self.regions.remove(&address.as_u64()) {
            Some(buffer) if page_count(buffer.len()) != pages => {
                warn!(
                    "freed {} pages at {:#x}, but {} were reserved",
                    pages,
                    address,
                    page_count(buffer.len())
                );
            }
            Some(_) => {}
            None => warn!("freeing unreserved memory at {:#x}", address),
        }
    }

    fn region_mut(&mut self, address: PhysAddr, size: usize) -> Result<&mut [u8], AllocError> {
        let (start, buffer) =
            self.regions.range_mut(..=address.as_u64()).next_back().ok_or(AllocError)?;
        let offset = usize::try_from(address.as_u64() - start).map_err(|_| AllocError)?;
        let end = offset.checked_add(size).ok_or(AllocError)?;
        buffer.get_mut(offset..end).ok_or(AllocError)
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    const MIB: u64 = 1 << 20;

    fn memory() -> SimulatedMemory {
        SimulatedMemory::new(PhysAddr::new(4096 * MIB))
    }

    #[googletest::test]
    fn fixed_allocation_rounds_to_pages() {
        let mut memory = memory();

        let base = PhysAddr::new(16 * MIB);
        assert_that!(memory.allocate_fixed(base, 10), ok(eq(base)));
        assert_that!(memory.regions().next(), some(eq((PhysAddr::new(16 * MIB), PAGE_SIZE))));
    }

    #[googletest::test]
    fn fixed_allocation_rejects_overlap_and_misalignment() {
        let mut memory = memory();
        memory.allocate_fixed(PhysAddr::new(16 * MIB), 0x2000).expect("failed to allocate");

        let overlapping = PhysAddr::new(16 * MIB + 0x1000);
        let misaligned = PhysAddr::new(32 * MIB + 1);
        let adjacent = PhysAddr::new(16 * MIB + 0x2000);
        assert_that!(memory.allocate_fixed(overlapping, 0x1000), err(eq(AllocError)));
        assert_that!(memory.allocate_fixed(misaligned, 0x1000), err(eq(AllocError)));
        assert_that!(memory.allocate_fixed(adjacent, 0x1000), ok(anything()));
    }

    #[googletest::test]
    fn range_allocation_is_top_down_and_aligned() {
        let mut memory = memory();
        let min = PhysAddr::new(256 * MIB);
        let max = PhysAddr::new(1024 * MIB);

        assert_that!(
            memory.allocate_range(0x1800, 2 * MIB, min, max),
            ok(eq(PhysAddr::new(1022 * MIB)))
        );
        assert_that!(
            memory.allocate_range(0x1800, 2 * MIB, min, max),
            ok(eq(PhysAddr::new(1020 * MIB)))
        );
    }

    #[googletest::test]
    fn range_allocation_fails_when_range_is_full() {
        let mut memory = memory();
        let min = PhysAddr::new(256 * MIB);
        let max = PhysAddr::new(258 * MIB);
        memory.allocate_range(MIB as usize, 0, min, max).expect("failed to allocate");
        memory.allocate_range(MIB as usize, 0, min, max).expect("failed to allocate");

        assert_that!(memory.allocate_range(0x1000, 0, min, max), err(eq(AllocError)));
    }

    #[googletest::test]
    fn placement_honours_floor() {
        let mut memory = memory();
        let placement = Placement::Anywhere {
            align: 0x1000,
            min: PhysAddr::new(0),
            max: PhysAddr::new(128 * MIB),
        };

        let floor = PhysAddr::new(256 * MIB);
        assert_that!(placement.place(&mut memory, 0x1000, floor), err(eq(AllocError)));
        assert_that!(placement.place(&mut memory, 0x1000, PhysAddr::new(0)), ok(anything()));
    }

    #[googletest::test]
    fn region_access_and_free() {
        let mut memory = memory();
        let base = memory.allocate_fixed(PhysAddr::new(MIB), 0x2000).expect("failed to allocate");

        memory.region_mut(base + 0x1000u64, 4).expect("no region")[..].copy_from_slice(b"test");
        assert_that!(memory.read(base + 0x1000u64, 4), some(eq(&b"test"[..])));
        assert_that!(
            memory.region_mut(base + 0x1ffeu64, 4).map(|region| region.len()),
            err(eq(AllocError))
        );
        assert_that!(
            memory.region_mut(PhysAddr::new(0), 4).map(|region| region.len()),
            err(eq(AllocError))
        );

        memory.free_pages(base, 2);
        assert_that!(memory.regions().count(), eq(0));
    }
}
