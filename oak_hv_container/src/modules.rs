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

//! Sizing and staging of module binaries.
//!
//! All module binaries share one physical region. Each binary starts on a page
//! boundary, in container order, so the position of a module can always be
//! recomputed from the sizes of the binaries before it.

use log::{debug, info};
use x86_64::PhysAddr;

use crate::{
    error::{LoadError, Result},
    format::MIN_COMPONENTS,
    index::ComponentIndex,
    memory::PhysicalMemory,
    PAGE_SIZE,
};

/// Space a module binary occupies in the module region.
pub fn page_rounded(size: usize) -> usize {
    size.next_multiple_of(PAGE_SIZE)
}

/// Aggregate sizes of the modules in a container.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleLayout {
    pub count: usize,
    /// Sum of the page-rounded binary sizes.
    pub total_size: usize,
    /// Sum of the command line payload sizes.
    pub total_cmd_size: usize,
}

impl ModuleLayout {
    pub fn compute(index: &ComponentIndex<'_>) -> Result<Self> {
        if (index.len() - MIN_COMPONENTS) % 2 != 0 {
            return Err(LoadError::MalformedContainer("module components are not paired"));
        }
        let layout = index.module_pairs().fold(Self::default(), |layout, (command, binary)| Self {
            count: layout.count + 1,
            total_size: layout.total_size + page_rounded(binary.size()),
            total_cmd_size: layout.total_cmd_size + command.size(),
        });
        debug!(
            "{} modules, {:#x} bytes of binaries, {} bytes of command lines",
            layout.count, layout.total_size, layout.total_cmd_size
        );
        Ok(layout)
    }
}

/// Offset of module `module` from the start of the module region.
pub fn module_offset(index: &ComponentIndex<'_>, module: usize) -> usize {
    index.module_pairs().take(module).map(|(_, binary)| page_rounded(binary.size())).sum()
}

/// Copies every module binary into the region starting at `base`, which must
/// already be reserved and hold at least the layout's total size.
pub fn stage<M: PhysicalMemory + ?Sized>(
    index: &ComponentIndex<'_>,
    memory: &mut M,
    base: PhysAddr,
) -> Result<()> {
    let mut offset = 0usize;
    for (module, (_, binary)) in index.module_pairs().enumerate() {
        if !binary.data.is_empty() {
            let target = memory.region_mut(base + offset as u64, binary.size())?;
            target.copy_from_slice(binary.data);
        }
        debug!(
            "module {} ({}): {:#x} bytes at {:#x}",
            module,
            binary.name().escape_ascii(),
            binary.size(),
            base + offset as u64
        );
        offset += page_rounded(binary.size());
    }
    info!("staged modules at {:#x}", base);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use googletest::prelude::*;

    use super::*;
    use crate::{format::ContainerBuilder, memory::SimulatedMemory};

    fn container(module_sizes: &[usize]) -> Vec<u8> {
        let binaries: Vec<Vec<u8>> =
            module_sizes.iter().enumerate().map(|(i, size)| vec![i as u8 + 1; *size]).collect();
        let mut builder =
            ContainerBuilder::new().component(*b"CMDL", b"hv\0").component(*b"MBHV", b"elf");
        for binary in &binaries {
            builder = builder.component(*b"MODC", b"cmd\0").component(*b"MODB", binary);
        }
        builder.component(*b"SIG_", b"sig").build().expect("failed to build container")
    }

    #[googletest::test]
    fn module_count_follows_component_count() {
        for (modules, expected_components) in [(0, 3), (1, 5), (2, 7), (3, 9)] {
            let container = container(&vec![16; modules]);
            let index = ComponentIndex::build(&container).expect("failed to index container");
            assert_that!(index.len(), eq(expected_components));
            assert_that!(ModuleLayout::compute(&index).map(|layout| layout.count), ok(eq(modules)));
        }
    }

    #[googletest::test]
    fn sizes_are_page_rounded() {
        let container = container(&[1, PAGE_SIZE, PAGE_SIZE + 1]);
        let index = ComponentIndex::build(&container).expect("failed to index container");

        assert_that!(
            ModuleLayout::compute(&index),
            ok(eq(ModuleLayout { count: 3, total_size: 4 * PAGE_SIZE, total_cmd_size: 12 }))
        );
        assert_that!(module_offset(&index, 0), eq(0));
        assert_that!(module_offset(&index, 1), eq(PAGE_SIZE));
        assert_that!(module_offset(&index, 2), eq(2 * PAGE_SIZE));
    }

    #[googletest::test]
    fn rejects_unpaired_modules() {
        let container = ContainerBuilder::new()
            .component(*b"CMDL", b"hv\0")
            .component(*b"MBHV", b"elf")
            .component(*b"MODC", b"cmd\0")
            .component(*b"SIG_", b"sig")
            .build()
            .expect("failed to build container");
        let index = ComponentIndex::build(&container).expect("failed to index container");

        assert_that!(
            ModuleLayout::compute(&index),
            err(matches_pattern!(LoadError::MalformedContainer(anything())))
        );
    }

    #[googletest::test]
    fn stages_binaries_on_page_boundaries() {
        let container = container(&[10, 0, 3]);
        let index = ComponentIndex::build(&container).expect("failed to index container");
        let mut memory = SimulatedMemory::new(PhysAddr::new(1 << 32));
        let base = memory
            .allocate_fixed(PhysAddr::new(0x200_0000), 2 * PAGE_SIZE)
            .expect("failed to allocate");

        assert_that!(stage(&index, &mut memory, base), ok(anything()));
        assert_that!(memory.read(base, 10), some(eq(&[1u8; 10][..])));
        assert_that!(memory.read(base + PAGE_SIZE as u64, 3), some(eq(&[3u8; 3][..])));
    }
}
