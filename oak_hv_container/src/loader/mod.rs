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

use log::{debug, info};
use oak_multiboot::{LoadWindow, Relocation, Version};
use x86_64::PhysAddr;

use crate::{
    elf::ElfImage,
    error::{LoadError, Result},
    index::ComponentIndex,
    memory::{page_count, PhysicalMemory, Placement},
    modules::{self, page_rounded, ModuleLayout},
    section::SectionLocator,
    tags::{self, LoadOptions},
    HvLoader, LoaderConfig, PAGE_SIZE,
};


/// State established by a successful boot image load.
#[derive(Copy, Clone, Debug)]
struct BootImage {
    version: Version,
    base: PhysAddr,
    entry: PhysAddr,
    window: LoadWindow,
    relocation: Option<Relocation>,
    cmd_size: usize,
}

/// State established by a successful module load.
#[derive(Copy, Clone, Debug)]
struct StagedModules {
    layout: ModuleLayout,
    /// Base and size of the module region, if one was reserved.
    region: Option<(PhysAddr, usize)>,
}

/// Loads a hypervisor and its modules from a container.
pub struct ContainerLoader<'a, M: PhysicalMemory> {
    memory: M,
    config: LoaderConfig,
    options: LoadOptions,
    index: Option<ComponentIndex<'a>>,
    boot: Option<BootImage>,
    modules: Option<StagedModules>,
}

impl<'a, M: PhysicalMemory> ContainerLoader<'a, M> {
    /// Indexes `container`, the raw bytes of the container section.
    pub fn new(
        memory: M,
        container: &'a [u8],
        options: LoadOptions,
        config: LoaderConfig,
    ) -> Result<Self> {
        let index = ComponentIndex::build(container)?;
        info!("container holds {} components", index.len());
        Ok(Self { memory, config, options, index: Some(index), boot: None, modules: None })
    }

    /// Locates the container section in the firmware application `image`.
    pub fn from_image(
        memory: M,
        image: &'a [u8],
        locator: &dyn SectionLocator,
        options: LoadOptions,
        config: LoaderConfig,
    ) -> Result<Self> {
        let range =
            locator.find_section(image, &config.section_name).ok_or(LoadError::SectionNotFound)?;
        debug!("container section {} at {:#x}..{:#x}", config.section_name, range.start, range.end);
        let container = image.get(range).ok_or(LoadError::SectionNotFound)?;
        Self::new(memory, container, options, config)
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn index(&self) -> Option<&ComponentIndex<'a>> {
        self.index.as_ref()
    }

    fn live_index(&self) -> Result<&ComponentIndex<'a>> {
        self.index.as_ref().ok_or(LoadError::InvalidState("loader has been torn down"))
    }

    /// Reserves the module region: right behind the hypervisor for fixed
    /// images, anywhere within the relocation range otherwise.
    fn reserve_module_region(
        &mut self,
        boot: &BootImage,
        layout: &ModuleLayout,
    ) -> Result<(PhysAddr, usize)> {
        let hv_ram_size = boot.window.size() as usize;
        let (placement, size) = match boot.relocation {
            Some(relocation) => (
                Placement::Anywhere {
                    align: PAGE_SIZE as u64,
                    min: PhysAddr::new(relocation.min_addr.into()),
                    max: PhysAddr::new(relocation.max_addr.into()),
                },
                layout.total_size,
            ),
            None => {
                let address = boot
                    .base
                    .as_u64()
                    .checked_add(page_rounded(hv_ram_size) as u64)
                    .and_then(|address| PhysAddr::try_new(address).ok())
                    .ok_or(LoadError::AddressOverflow(boot.base.as_u64()))?;
                (Placement::Fixed(address), hv_ram_size.max(layout.total_size))
            }
        };
        let size = size.max(PAGE_SIZE);
        let base = placement.place(&mut self.memory, size, self.config.relocation_floor)?;
        debug!("reserved {:#x} bytes for modules at {:#x}", size, base);
        Ok((base, size))
    }
}

/// Resolves the load window and entry point of the boot image. Images whose
/// header does not describe them are placed according to their ELF headers.
fn resolve_placement(
    elf: &ElfImage<'_>,
    window: Option<LoadWindow>,
    entry: Option<u32>,
) -> Result<(LoadWindow, u64)> {
    let window = match window {
        Some(window) => window,
        None => {
            elf.load_window().ok_or(LoadError::InvalidElf("no loadable segments below 4 GiB"))?
        }
    };
    let entry = match entry {
        Some(entry) if entry != 0 => u64::from(entry),
        _ => elf.entry(),
    };
    Ok((window, entry))
}

/// Hypervisor entry point, validated before the image is placed.
#[derive(Copy, Clone, Debug)]
enum EntryPoint {
    Fixed(PhysAddr),
    /// Offset from the start of the load window.
    Relative(u64),
}

impl EntryPoint {
    fn at(self, base: PhysAddr) -> Option<PhysAddr> {
        match self {
            EntryPoint::Fixed(entry) => Some(entry),
            EntryPoint::Relative(offset) => {
                base.as_u64().checked_add(offset).and_then(|entry| PhysAddr::try_new(entry).ok())
            }
        }
    }
}

impl<M: PhysicalMemory> HvLoader for ContainerLoader<'_, M> {
    fn load_boot_image(&mut self) -> Result<()> {
        let index = self.live_index()?;
        if self.boot.is_some() {
            return Err(LoadError::InvalidState("boot image already loaded"));
        }
        let cmd_size = tags::boot_cmd_size(index.boot_command(), &self.options);
        let image = index.boot_image().data;

        let header =
            oak_multiboot::parse(image, self.config.multiboot2_search, self.config.multiboot_search)
                .map_err(|err| match err {
                    oak_multiboot::Error::NotFound => LoadError::NotMultibootCompatible,
                    err => LoadError::InvalidMultibootHeader(err),
                })?;
        info!("hypervisor image is multiboot {} compatible", header.version);

        let elf = ElfImage::parse(image)?;
        let (window, entry) = resolve_placement(&elf, header.load_window, header.entry)?;
        // Checked before anything is reserved.
        let entry_point = match header.relocation {
            Some(_) => EntryPoint::Relative(
                entry
                    .checked_sub(window.start.into())
                    .ok_or(LoadError::InvalidElf("entry point lies below the load window"))?,
            ),
            None => EntryPoint::Fixed(
                PhysAddr::try_new(entry).map_err(|_| LoadError::AddressOverflow(entry))?,
            ),
        };

        let floor = self.config.relocation_floor;
        let base = elf.load(&mut self.memory, window, header.relocation.as_ref(), floor)?;
        let Some(entry) = entry_point.at(base) else {
            self.memory.free_pages(base, page_count(window.size() as usize));
            return Err(LoadError::AddressOverflow(entry));
        };
        info!("hypervisor entry point at {:#x}", entry);

        self.boot = Some(BootImage {
            version: header.version,
            base,
            entry,
            window,
            relocation: header.relocation,
            cmd_size,
        });
        Ok(())
    }

    fn load_modules(&mut self) -> Result<()> {
        let boot = self.boot.ok_or(LoadError::InvalidState("boot image not loaded"))?;
        if self.modules.is_some() {
            return Err(LoadError::InvalidState("modules already loaded"));
        }
        let layout = ModuleLayout::compute(self.live_index()?)?;

        let region = if layout.count == 0 {
            None
        } else {
            let (base, size) = self.reserve_module_region(&boot, &layout)?;
            let index =
                self.index.as_ref().ok_or(LoadError::InvalidState("loader has been torn down"))?;
            if let Err(err) = modules::stage(index, &mut self.memory, base) {
                self.memory.free_pages(base, page_count(size));
                return Err(err);
            }
            Some((base, size))
        };

        self.modules = Some(StagedModules { layout, region });
        Ok(())
    }

    fn boot_cmd_size(&self) -> usize {
        self.boot.map_or(0, |boot| boot.cmd_size)
    }

    fn module_count(&self) -> usize {
        self.modules.map_or(0, |modules| modules.layout.count)
    }

    fn total_module_size(&self) -> usize {
        self.modules.map_or(0, |modules| modules.layout.total_size)
    }

    fn total_module_cmd_size(&self) -> usize {
        self.modules.map_or(0, |modules| modules.layout.total_cmd_size)
    }

    fn hv_base(&self) -> PhysAddr {
        self.boot.map_or(PhysAddr::zero(), |boot| boot.base)
    }

    fn module_base(&self) -> PhysAddr {
        self.modules.and_then(|modules| modules.region).map_or(PhysAddr::zero(), |(base, _)| base)
    }

    fn hv_entry(&self) -> PhysAddr {
        self.boot.map_or(PhysAddr::zero(), |boot| boot.entry)
    }

    fn multiboot_version(&self) -> Option<Version> {
        self.boot.map(|boot| boot.version)
    }

    fn hv_ram_size(&self) -> usize {
        self.boot.map_or(0, |boot| boot.window.size() as usize)
    }

    fn fill_bootcmd_tag(&self, buffer: &mut [u8]) -> Result<usize> {
        let index = self.live_index()?;
        tags::fill_bootcmd_tag(index.boot_command(), &self.options, buffer)
    }

    fn fill_module_tag(&self, buffer: &mut [u8], index: usize) -> Result<usize> {
        let components = self.live_index()?;
        if self.modules.is_none() {
            return Err(LoadError::InvalidState("modules not loaded"));
        }
        tags::fill_module_tag(components, self.module_base(), index, buffer)
    }

    fn deinit(&mut self) {
        if self.index.take().is_none() {
            return;
        }
        if let Some((base, size)) = self.modules.and_then(|modules| modules.region) {
            self.memory.free_pages(base, page_count(size));
            debug!("released module region at {:#x}", base);
        }
        self.modules = None;
    }
}
