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

//! Loader for a hypervisor container stitched into a firmware application
//! image.
//!
//! The container carries the hypervisor boot command line, the hypervisor ELF
//! image, a list of (command line, binary) module pairs and a trailing
//! signature. The loader stages the hypervisor and its modules in physical
//! memory and produces the Multiboot2 information tags the hypervisor expects
//! at handoff.
//!
//! Loading happens in two ordered phases: [`HvLoader::load_boot_image`] must
//! succeed before [`HvLoader::load_modules`] is called.

#![no_std]

#[macro_use]
extern crate alloc;
#[cfg(test)]
extern crate std;

use alloc::{boxed::Box, string::String};

pub use oak_multiboot::Version;
use x86_64::PhysAddr;

pub mod cursor;
pub mod elf;
pub mod error;
pub mod format;
pub mod index;
pub mod loader;
pub mod memory;
pub mod modules;
pub mod section;
pub mod tags;
#[cfg(test)]
mod testing;

pub use crate::{
    error::{LoadError, Result},
    loader::ContainerLoader,
    memory::{AllocError, PhysicalMemory, Placement, SimulatedMemory},
    section::{PeLayout, PeSections, SectionLocator},
    tags::LoadOptions,
};

/// Granularity of physical memory reservations.
pub const PAGE_SIZE: usize = 4096;

/// Relocatable images and modules are never placed below this address, which
/// is where guest kernels usually boot from.
pub const RELOCATION_FLOOR: PhysAddr = PhysAddr::new(0x1000_0000);

/// Name of the image section that holds the container.
pub const CONTAINER_SECTION: &str = ".hv";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Image section the container is read from.
    pub section_name: String,
    /// Number of leading boot image bytes searched for a Multiboot2 header.
    pub multiboot2_search: usize,
    /// Number of leading boot image bytes searched for a Multiboot header.
    pub multiboot_search: usize,
    pub relocation_floor: PhysAddr,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            section_name: String::from(CONTAINER_SECTION),
            multiboot2_search: oak_multiboot::MULTIBOOT2_SEARCH,
            multiboot_search: oak_multiboot::MULTIBOOT_SEARCH,
            relocation_floor: RELOCATION_FLOOR,
        }
    }
}

/// Operations the boot sequencer uses to load a hypervisor and hand off to it.
///
/// Accessors return zero values until the phase that computes them has run.
pub trait HvLoader {
    /// Locates the Multiboot header in the hypervisor image and loads the
    /// image's segments into physical memory.
    fn load_boot_image(&mut self) -> Result<()>;

    /// Stages every module binary in a single physical region. Requires a
    /// successful [`HvLoader::load_boot_image`].
    fn load_modules(&mut self) -> Result<()>;

    /// Length of the hypervisor command line, including the extra options.
    fn boot_cmd_size(&self) -> usize;

    fn module_count(&self) -> usize;

    /// Size of the module region contents, each binary rounded up to a page.
    fn total_module_size(&self) -> usize;

    /// Combined length of all module command lines.
    fn total_module_cmd_size(&self) -> usize;

    fn hv_base(&self) -> PhysAddr;

    fn module_base(&self) -> PhysAddr;

    /// Hypervisor entry point, adjusted for relocation.
    fn hv_entry(&self) -> PhysAddr;

    fn multiboot_version(&self) -> Option<Version>;

    /// Size of the physical window the hypervisor occupies.
    fn hv_ram_size(&self) -> usize;

    /// Writes the Multiboot2 command line tag to `buffer` and returns its size.
    fn fill_bootcmd_tag(&self, buffer: &mut [u8]) -> Result<usize>;

    /// Writes the Multiboot2 module tag of module `index` to `buffer` and
    /// returns its size.
    fn fill_module_tag(&self, buffer: &mut [u8], index: usize) -> Result<usize>;

    /// Releases the module region and the component index. The hypervisor
    /// region stays reserved.
    fn deinit(&mut self);
}

/// Finds the container section in `image` and returns a loader for it.
pub fn init<'a, M: PhysicalMemory + 'a>(
    memory: M,
    image: &'a [u8],
    locator: &dyn SectionLocator,
    options: LoadOptions,
    config: LoaderConfig,
) -> Result<Box<dyn HvLoader + 'a>> {
    let loader = ContainerLoader::from_image(memory, image, locator, options, config)?;
    Ok(Box::new(loader))
}
