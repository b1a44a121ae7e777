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

use alloc::boxed::Box;

use log::{debug, warn};

use crate::{
    cursor::ByteCursor,
    error::{LoadError, Result},
    format::{
        ComponentEntry, CompressedHeader, Compression, ContainerHeader, BOOT_COMMAND_SLOT,
        BOOT_IMAGE_SLOT, FIRST_MODULE_SLOT, MIN_COMPONENTS,
    },
};

/// A resolved container component: its table entry, its payload header and
/// the payload bytes, borrowed from the container.
#[derive(Clone, Copy, Debug)]
pub struct Component<'a> {
    pub entry: ComponentEntry,
    /// `None` for the trailing signature component, whose bytes are raw.
    pub header: Option<CompressedHeader>,
    pub data: &'a [u8],
}

impl Component<'_> {
    pub fn name(&self) -> [u8; 4] {
        self.entry.name_bytes()
    }

    /// Payload length in bytes. Framed payloads report the size declared by
    /// their header, the trailer the size of its table entry.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Ordered view of every component in a container, built once at init.
pub struct ComponentIndex<'a> {
    header: ContainerHeader,
    components: Box<[Component<'a>]>,
}

impl<'a> ComponentIndex<'a> {
    /// Walks the component table of `container` and resolves every payload.
    ///
    /// Payloads are neither decompressed nor verified.
    pub fn build(container: &'a [u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(container);
        let header: ContainerHeader =
            cursor.read().ok_or(LoadError::MalformedContainer("truncated container header"))?;
        let count = usize::from(header.count);
        if count < MIN_COMPONENTS {
            return Err(LoadError::MalformedContainer(
                "container holds fewer than three components",
            ));
        }

        let data_start = usize::from(header.data_offset);
        let data = data_start
            .checked_add(header.data_size as usize)
            .and_then(|data_end| container.get(data_start..data_end))
            .ok_or(LoadError::MalformedContainer("data section exceeds the container"))?;

        let components = (0..count)
            .map(|index| {
                let entry: ComponentEntry = cursor
                    .read()
                    .ok_or(LoadError::MalformedContainer("truncated component table"))?;
                cursor
                    .skip(usize::from(entry.hash_size))
                    .ok_or(LoadError::MalformedContainer("truncated component hash"))?;

                if index == count - 1 {
                    let bytes = ByteCursor::at(data, entry.offset as usize)
                        .take(entry.size as usize)
                        .ok_or(LoadError::MalformedContainer("trailer outside the data section"))?;
                    debug!(
                        "component {}: {} trailer at data offset {:#x}, {} bytes",
                        index,
                        entry.name_bytes().escape_ascii(),
                        entry.offset,
                        entry.size
                    );
                    return Ok(Component { entry, header: None, data: bytes });
                }

                let mut payload = ByteCursor::at(data, entry.offset as usize);
                let header: CompressedHeader = payload.read().ok_or(
                    LoadError::MalformedContainer("payload header outside the data section"),
                )?;
                let bytes = payload
                    .take(header.size as usize)
                    .ok_or(LoadError::MalformedContainer("payload outside the data section"))?;

                if header.compression() != Some(Compression::Stored) {
                    warn!(
                        "component {} has payload signature {:#010x}; using it as stored data",
                        index, header.signature
                    );
                }
                debug!(
                    "component {}: {} at data offset {:#x}, {} bytes",
                    index,
                    entry.name_bytes().escape_ascii(),
                    entry.offset,
                    header.size
                );
                Ok(Component { entry, header: Some(header), data: bytes })
            })
            .collect::<Result<Box<[_]>>>()?;

        Ok(Self { header, components })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Component<'a>> {
        self.components.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component<'a>> {
        self.components.iter()
    }

    pub fn boot_command(&self) -> &Component<'a> {
        &self.components[BOOT_COMMAND_SLOT]
    }

    pub fn boot_image(&self) -> &Component<'a> {
        &self.components[BOOT_IMAGE_SLOT]
    }

    /// (command, binary) pairs of every module, in table order. The trailing
    /// signature component is never part of a pair.
    pub fn module_pairs(&self) -> impl Iterator<Item = (&Component<'a>, &Component<'a>)> {
        self.components[FIRST_MODULE_SLOT..self.components.len() - 1]
            .chunks_exact(2)
            .map(|pair| (&pair[0], &pair[1]))
    }
}
