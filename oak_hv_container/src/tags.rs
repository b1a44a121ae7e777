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

//! Multiboot2 information tags describing the hypervisor command line and the
//! staged modules.

use alloc::vec::Vec;
use core::mem::size_of;

use oak_multiboot::{InfoTagType, ModuleTag, StringTag};
use x86_64::PhysAddr;
use zerocopy::IntoBytes;

use crate::{
    error::{LoadError, Result},
    index::{Component, ComponentIndex},
    modules::module_offset,
};

/// Extra boot options handed to the firmware application, as UCS-2 code units.
/// They are appended to the hypervisor command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions(Vec<u16>);

impl LoadOptions {
    /// Takes the options from a raw buffer of `byte_len` bytes, stopping at
    /// the first NUL.
    pub fn from_ucs2(raw: &[u16], byte_len: usize) -> Self {
        Self(raw.iter().take(byte_len / 2).take_while(|unit| **unit != 0).copied().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The options as single bytes. Characters outside ASCII become `?`.
    fn narrowed(&self) -> impl Iterator<Item = u8> + '_ {
        self.0
            .iter()
            .map(|unit| u8::try_from(*unit).ok().filter(u8::is_ascii).unwrap_or(b'?'))
    }
}

impl From<&str> for LoadOptions {
    fn from(options: &str) -> Self {
        Self(options.encode_utf16().collect())
    }
}

fn tag_buffer(buffer: &mut [u8], needed: usize) -> Result<&mut [u8]> {
    let available = buffer.len();
    buffer.get_mut(..needed).ok_or(LoadError::TagBufferTooSmall { needed, available })
}

fn tag_size(size: usize) -> Result<u32> {
    size.try_into().map_err(|_| LoadError::AddressOverflow(size as u64))
}

/// Length of the hypervisor command line: the command text payload plus the
/// extra options.
pub fn boot_cmd_size(command: &Component<'_>, options: &LoadOptions) -> usize {
    command.size() + options.len()
}

/// Writes the command line tag into `buffer` and returns the tag size.
///
/// The command text is copied up to its terminating NUL. Extra options follow
/// after a single space; whatever remains of the declared size is zeroed.
pub fn fill_bootcmd_tag(
    command: &Component<'_>,
    options: &LoadOptions,
    buffer: &mut [u8],
) -> Result<usize> {
    let cmd_size = boot_cmd_size(command, options);
    let needed = size_of::<StringTag>() + cmd_size;
    let tag = tag_buffer(buffer, needed)?;

    let (header, string) = tag.split_at_mut(size_of::<StringTag>());
    StringTag { tag_type: InfoTagType::Cmdline as u32, size: tag_size(needed)? }
        .write_to(header)
        .map_err(|_| LoadError::TagBufferTooSmall { needed, available: needed })?;
    string.fill(0);

    let text = command.data[..command.size().saturating_sub(1)]
        .split(|byte| *byte == 0)
        .next()
        .unwrap_or_default();
    string[..text.len()].copy_from_slice(text);
    if !options.is_empty() {
        string[text.len()] = b' ';
        for (target, option) in string[text.len() + 1..].iter_mut().zip(options.narrowed()) {
            *target = option;
        }
    }
    Ok(needed)
}

/// Writes the tag of module `module` into `buffer` and returns the tag size.
///
/// The module's address is recomputed from the page-rounded sizes of the
/// modules before it, matching how they were staged at `module_base`.
pub fn fill_module_tag(
    index: &ComponentIndex<'_>,
    module_base: PhysAddr,
    module: usize,
    buffer: &mut [u8],
) -> Result<usize> {
    let count = index.module_pairs().count();
    let (command, binary) = index
        .module_pairs()
        .nth(module)
        .ok_or(LoadError::ModuleIndexOutOfRange { index: module, count })?;

    let needed = size_of::<ModuleTag>() + command.size();
    let tag = tag_buffer(buffer, needed)?;

    let start = module_base.as_u64() + module_offset(index, module) as u64;
    let end = start + binary.size() as u64;
    let (header, cmdline) = tag.split_at_mut(size_of::<ModuleTag>());
    ModuleTag {
        tag_type: InfoTagType::Module as u32,
        size: tag_size(needed)?,
        mod_start: start.try_into().map_err(|_| LoadError::AddressOverflow(start))?,
        mod_end: end.try_into().map_err(|_| LoadError::AddressOverflow(end))?,
    }
    .write_to(header)
    .map_err(|_| LoadError::TagBufferTooSmall { needed, available: needed })?;
    cmdline.copy_from_slice(command.data);
    Ok(needed)
}
