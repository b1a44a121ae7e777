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

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use log::info;
use oak_hv_container::format::ContainerBuilder;
use sha2::{Digest, Sha256};

const BOOT_COMMAND_NAME: [u8; 4] = *b"BCMD";
const BOOT_IMAGE_NAME: [u8; 4] = *b"HVEL";
const MODULE_COMMAND_NAME: [u8; 4] = *b"MCMD";
const MODULE_BINARY_NAME: [u8; 4] = *b"MBIN";
const SIGNATURE_NAME: [u8; 4] = *b"SIGN";

#[derive(Args, Clone)]
pub struct PackArgs {
    #[arg(long, help = "File holding the hypervisor boot command line")]
    cmdline: PathBuf,
    #[arg(long, help = "The hypervisor ELF image")]
    hypervisor: PathBuf,
    #[arg(
        long = "module",
        num_args = 2,
        value_names = ["CMDLINE", "BINARY"],
        help = "A module command line file and the module binary; may be repeated"
    )]
    modules: Vec<PathBuf>,
    #[arg(long, help = "Signature blob appended as the last component")]
    signature: Option<PathBuf>,
    #[arg(long, help = "Where to write the container")]
    output: PathBuf,
}

fn read(path: &PathBuf) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("couldn't read {}", path.display()))
}

/// A container component before layout, together with its SHA-256 digest.
struct Part {
    name: [u8; 4],
    data: Vec<u8>,
    hash: Vec<u8>,
}

impl Part {
    fn new(name: [u8; 4], data: Vec<u8>) -> Self {
        let hash = Sha256::digest(&data).to_vec();
        Self { name, data, hash }
    }
}

/// Lays out the boot command, the hypervisor image, every module pair and the
/// signature in slot order.
fn build_container(
    cmdline: Vec<u8>,
    hypervisor: Vec<u8>,
    modules: Vec<(Vec<u8>, Vec<u8>)>,
    signature: Vec<u8>,
) -> anyhow::Result<Vec<u8>> {
    let mut parts =
        vec![Part::new(BOOT_COMMAND_NAME, cmdline), Part::new(BOOT_IMAGE_NAME, hypervisor)];
    for (command, binary) in modules {
        parts.push(Part::new(MODULE_COMMAND_NAME, command));
        parts.push(Part::new(MODULE_BINARY_NAME, binary));
    }
    parts.push(Part::new(SIGNATURE_NAME, signature));

    for part in &parts {
        info!(
            "{}: {} bytes, sha2-256:{}",
            part.name.escape_ascii(),
            part.data.len(),
            hex::encode(&part.hash)
        );
    }

    parts
        .iter()
        .fold(ContainerBuilder::new(), |builder, part| {
            builder.component_with_hash(part.name, &part.data, &part.hash)
        })
        .build()
        .context("couldn't lay out the container")
}

pub fn run(args: &PackArgs) -> anyhow::Result<()> {
    let modules = args
        .modules
        .chunks_exact(2)
        .map(|pair| Ok((read(&pair[0])?, read(&pair[1])?)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let signature = match &args.signature {
        Some(path) => read(path)?,
        None => Vec::new(),
    };
    let module_count = modules.len();

    let container =
        build_container(read(&args.cmdline)?, read(&args.hypervisor)?, modules, signature)?;
    std::fs::write(&args.output, &container)
        .with_context(|| format!("couldn't write {}", args.output.display()))?;

    println!("Container: {} bytes, {} modules", container.len(), module_count);
    println!("Container: sha2-256:{}", hex::encode(Sha256::digest(&container)));
    Ok(())
}
