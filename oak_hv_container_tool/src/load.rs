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

use anyhow::Context;
use clap::Args;
use oak_hv_container::{init, HvLoader, LoadOptions, LoaderConfig, SimulatedMemory};
use x86_64::PhysAddr;

use crate::{parse_number, Input};

/// Largest tag the dry run renders.
const TAG_BUFFER_SIZE: usize = 4096;

#[derive(Args, Clone)]
pub struct LoadArgs {
    #[command(flatten)]
    input: Input,
    #[arg(long, default_value = "", help = "Extra options appended to the hypervisor command line")]
    options: String,
    #[arg(
        long,
        default_value = "0x100000000",
        value_parser = parse_number,
        help = "Top of simulated physical memory"
    )]
    memory_limit: u64,
    #[arg(
        long,
        value_parser = parse_number,
        help = "Bytes of the boot image searched for a Multiboot2 header"
    )]
    multiboot2_search: Option<u64>,
    #[arg(
        long,
        value_parser = parse_number,
        help = "Bytes of the boot image searched for a Multiboot header"
    )]
    multiboot_search: Option<u64>,
    #[arg(long, value_parser = parse_number, help = "Lowest address for relocatable placements")]
    relocation_floor: Option<u64>,
}

impl LoadArgs {
    fn config(&self) -> anyhow::Result<LoaderConfig> {
        let mut config =
            LoaderConfig { section_name: self.input.section.clone(), ..LoaderConfig::default() };
        if let Some(search) = self.multiboot2_search {
            config.multiboot2_search = usize::try_from(search)?;
        }
        if let Some(search) = self.multiboot_search {
            config.multiboot_search = usize::try_from(search)?;
        }
        if let Some(floor) = self.relocation_floor {
            config.relocation_floor = PhysAddr::try_new(floor)
                .map_err(|_| anyhow::anyhow!("invalid relocation floor {:#x}", floor))?;
        }
        Ok(config)
    }
}

fn print_tag(label: &str, tag: &[u8]) {
    println!("{} tag ({} bytes): {}", label, tag.len(), hex::encode(tag));
}

/// Runs both load phases in order and tears the loader down if either fails.
fn stage(loader: &mut dyn HvLoader) -> anyhow::Result<()> {
    let result = loader
        .load_boot_image()
        .context("couldn't load the hypervisor")
        .and_then(|()| loader.load_modules().context("couldn't stage the modules"));
    if result.is_err() {
        loader.deinit();
    }
    result
}

pub fn run(args: &LoadArgs) -> anyhow::Result<()> {
    let image = args.input.read()?;
    let limit = PhysAddr::try_new(args.memory_limit)
        .map_err(|_| anyhow::anyhow!("invalid memory limit {:#x}", args.memory_limit))?;
    let mut memory = SimulatedMemory::new(limit);
    let locator = args.input.locator();

    let options = LoadOptions::from(args.options.as_str());
    let mut loader = init(&mut memory, &image, locator.as_ref(), options, args.config()?)
        .context("couldn't initialize the loader")?;
    stage(loader.as_mut())?;

    let version = loader.multiboot_version().map_or(0, |version| version as u8);
    println!("Multiboot{}", version);
    println!(
        "Hypervisor: base {:#x}, {:#x} bytes, entry {:#x}",
        loader.hv_base(),
        loader.hv_ram_size(),
        loader.hv_entry()
    );
    println!(
        "Modules: {} at {:#x}, {:#x} bytes, {} bytes of command lines",
        loader.module_count(),
        loader.module_base(),
        loader.total_module_size(),
        loader.total_module_cmd_size()
    );

    let mut buffer = [0u8; TAG_BUFFER_SIZE];
    let size =
        loader.fill_bootcmd_tag(&mut buffer).context("couldn't render the command line tag")?;
    print_tag("Command line", &buffer[..size]);
    for index in 0..loader.module_count() {
        let size =
            loader.fill_module_tag(&mut buffer, index).context("couldn't render a module tag")?;
        print_tag(&format!("Module {}", index), &buffer[..size]);
    }

    loader.deinit();
    drop(loader);
    for (start, len) in memory.regions() {
        println!("Reserved: {:#x}..{:#x}", start, start + len as u64);
    }
    Ok(())
}
