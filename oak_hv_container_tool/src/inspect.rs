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
use oak_hv_container::{index::ComponentIndex, LoaderConfig};

use crate::Input;

#[derive(Args, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    input: Input,
}

pub fn run(args: &InspectArgs) -> anyhow::Result<()> {
    let image = args.input.read()?;
    let container = args.input.container(&image)?;
    let index = ComponentIndex::build(container).context("couldn't parse the container")?;

    let header = index.header();
    println!(
        "Container: signature {}, version {}, {} components, data at {:#x} ({} bytes)",
        header.signature.to_le_bytes().escape_ascii(),
        header.version,
        header.count,
        header.data_offset,
        header.data_size
    );
    for (slot, component) in index.iter().enumerate() {
        let framing = match component.header {
            Some(header) => header
                .compression()
                .map_or_else(|| format!("{:#010x}", header.signature), |kind| kind.to_string()),
            None => String::from("raw"),
        };
        println!(
            "  {:2} {} offset {:#x} size {} ({}, hash {} bytes)",
            slot,
            component.name().escape_ascii(),
            component.entry.offset,
            component.size(),
            framing,
            component.entry.hash_size
        );
    }

    let defaults = LoaderConfig::default();
    let image = index.boot_image().data;
    match oak_multiboot::parse(image, defaults.multiboot2_search, defaults.multiboot_search) {
        Ok(info) => {
            println!("Multiboot{} header at offset {:#x}", info.version as u8, info.offset);
            if let Some(window) = info.load_window {
                println!("  load window {:#x}..{:#x}", window.start, window.end);
            }
            if let Some(entry) = info.entry {
                println!("  entry {:#x}", entry);
            }
            if let Some(relocation) = info.relocation {
                println!(
                    "  relocatable {:#x}..{:#x}, align {:#x}, prefer {}",
                    relocation.min_addr,
                    relocation.max_addr,
                    relocation.align,
                    relocation.preference
                );
            }
        }
        Err(error) => println!("Boot image has no usable multiboot header: {}", error),
    }
    Ok(())
}
