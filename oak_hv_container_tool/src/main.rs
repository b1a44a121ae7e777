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

mod inspect;
mod load;
mod pack;

use std::{ops::Range, path::PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use oak_hv_container::{PeLayout, PeSections, SectionLocator, CONTAINER_SECTION};

#[derive(Parser, Clone)]
#[command(about = "Oak Hypervisor Container Tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Builds a container from a boot command line, a hypervisor image and modules.
    Pack(pack::PackArgs),
    /// Prints the component table and the hypervisor's multiboot header.
    Inspect(inspect::InspectArgs),
    /// Loads the container into simulated physical memory and prints the handoff values.
    Load(load::LoadArgs),
}

/// Where to read a container from.
#[derive(Args, Clone)]
struct Input {
    #[arg(help = "The container, or the firmware application image when --pe is given")]
    path: PathBuf,
    #[arg(long, help = "Read the container from a section of a PE image")]
    pe: bool,
    #[arg(long, default_value = CONTAINER_SECTION, help = "The PE section holding the container")]
    section: String,
}

/// Treats the whole file as the container.
struct WholeFile;

impl SectionLocator for WholeFile {
    fn find_section(&self, image: &[u8], _name: &str) -> Option<Range<usize>> {
        Some(0..image.len())
    }
}

impl Input {
    fn read(&self) -> anyhow::Result<Vec<u8>> {
        std::fs::read(&self.path).with_context(|| format!("couldn't read {}", self.path.display()))
    }

    fn locator(&self) -> Box<dyn SectionLocator> {
        if self.pe {
            Box::new(PeSections::new(PeLayout::File))
        } else {
            Box::new(WholeFile)
        }
    }

    /// The container bytes within `image`.
    fn container<'a>(&self, image: &'a [u8]) -> anyhow::Result<&'a [u8]> {
        let range = self
            .locator()
            .find_section(image, &self.section)
            .with_context(|| format!("couldn't find section {}", self.section))?;
        image.get(range).context("section lies outside the image")
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(value: &str) -> Result<u64, std::num::ParseIntError> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Pack(args) => pack::run(&args),
        Command::Inspect(args) => inspect::run(&args),
        Command::Load(args) => load::run(&args),
    }
}
