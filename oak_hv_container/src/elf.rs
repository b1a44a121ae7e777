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

use goblin::elf::{program_header::PT_LOAD, Elf, ProgramHeader};
use log::{debug, info};
use oak_multiboot::{LoadWindow, Relocation};
use x86_64::PhysAddr;

use crate::{
    error::{LoadError, Result},
    memory::{page_count, PhysicalMemory, Placement},
};

/// A parsed hypervisor ELF image. 32-bit images are expected, 64-bit images
/// are accepted as well.
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    elf: Elf<'a>,
}

impl<'a> ElfImage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let elf =
            Elf::parse(bytes).map_err(|_| LoadError::InvalidElf("failed to parse ELF headers"))?;
        Ok(Self { bytes, elf })
    }

    pub fn entry(&self) -> u64 {
        self.elf.entry
    }

    /// Program headers that carry bytes to load, with their table index.
    fn loadable_segments(&self) -> impl Iterator<Item = (usize, &ProgramHeader)> {
        self.elf
            .program_headers
            .iter()
            .enumerate()
            .filter(|(_, phdr)| phdr.p_type == PT_LOAD && phdr.p_memsz != 0 && phdr.p_offset != 0)
    }

    /// Physical window spanned by the loadable segments, for images whose
    /// Multiboot header does not describe one.
    pub fn load_window(&self) -> Option<LoadWindow> {
        let start = self.loadable_segments().map(|(_, phdr)| phdr.p_paddr).min()?;
        let end = self
            .loadable_segments()
            .map(|(_, phdr)| phdr.p_paddr.checked_add(phdr.p_memsz))
            .try_fold(0u64, |end, segment_end| Some(end.max(segment_end?)))?;
        Some(LoadWindow { start: start.try_into().ok()?, end: end.try_into().ok()? })
    }

    /// Reserves the hypervisor region and copies every loadable segment into it.
    ///
    /// Without `relocation` the region is reserved exactly at the start of
    /// `window`; otherwise anywhere the relocation constraints allow, but not
    /// below `floor`. Returns the base of the region.
    pub fn load<M: PhysicalMemory + ?Sized>(
        &self,
        memory: &mut M,
        window: LoadWindow,
        relocation: Option<&Relocation>,
        floor: PhysAddr,
    ) -> Result<PhysAddr> {
        let placement = match relocation {
            Some(relocation) => Placement::Anywhere {
                align: relocation.align.into(),
                min: PhysAddr::new(relocation.min_addr.into()),
                max: PhysAddr::new(relocation.max_addr.into()),
            },
            None => Placement::Fixed(PhysAddr::new(window.start.into())),
        };
        let size = window.size() as usize;
        let base = placement.place(memory, size, floor)?;
        debug!("reserved {:#x} bytes for the hypervisor at {:#x}", size, base);

        if let Err(err) = self.copy_segments(memory, base, window) {
            memory.free_pages(base, page_count(size));
            return Err(err);
        }
        info!("loaded hypervisor image at {:#x}", base);
        Ok(base)
    }

    fn copy_segments<M: PhysicalMemory + ?Sized>(
        &self,
        memory: &mut M,
        base: PhysAddr,
        window: LoadWindow,
    ) -> Result<()> {
        for (index, phdr) in self.loadable_segments() {
            if phdr.p_filesz > phdr.p_memsz {
                return Err(LoadError::SegmentSizeViolation {
                    index,
                    file_size: phdr.p_filesz,
                    memory_size: phdr.p_memsz,
                });
            }

            let outside = LoadError::SegmentOutsideWindow { index, address: phdr.p_paddr };
            let offset = phdr
                .p_paddr
                .checked_sub(window.start.into())
                .filter(|offset| {
                    offset.checked_add(phdr.p_memsz).is_some_and(|end| end <= window.size().into())
                })
                .ok_or(outside)?;

            let file_size = phdr.p_filesz as usize;
            let source = usize::try_from(phdr.p_offset)
                .ok()
                .and_then(|start| self.bytes.get(start..start.checked_add(file_size)?))
                .ok_or(LoadError::InvalidElf("segment data lies outside the image"))?;

            debug!(
                "segment {}: {:#x} file bytes, {:#x} memory bytes at {:#x}",
                index, phdr.p_filesz, phdr.p_memsz, phdr.p_paddr
            );
            let target = memory.region_mut(base + offset, phdr.p_memsz as usize)?;
            target[..file_size].copy_from_slice(source);
            target[file_size..].fill(0);
        }
        Ok(())
    }
}
