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

//! Binary layout of a hypervisor container.
//!
//! A container starts with a [`ContainerHeader`], followed by `count`
//! [`ComponentEntry`] records packed back to back. Each entry is followed by
//! `hash_size` bytes of hash data, so entries have a variable stride. Every
//! component payload lives in the data section starting at `data_offset` and
//! is framed by a [`CompressedHeader`], except for the trailing signature
//! component, which is stored raw.

use alloc::vec::Vec;
use core::mem::size_of;

use static_assertions::assert_eq_size;
use strum::{Display, FromRepr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{LoadError, Result};

/// Slot holding the hypervisor boot command text.
pub const BOOT_COMMAND_SLOT: usize = 0;
/// Slot holding the hypervisor ELF image.
pub const BOOT_IMAGE_SLOT: usize = 1;
/// Slot of the first module command text. Module binaries follow their command.
pub const FIRST_MODULE_SLOT: usize = 2;
/// Boot command, boot image and the trailing signature component.
pub const MIN_COMPONENTS: usize = 3;

/// Container signature written by [`ContainerBuilder`]. The loader itself does
/// not check it.
pub const DEFAULT_CONTAINER_SIGNATURE: [u8; 4] = *b"ACRN";

/// Payload alignment within the data section.
pub const PAYLOAD_ALIGN: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ContainerHeader {
    pub signature: u32,
    pub version: u8,
    pub svn: u8,
    /// Offset of the data section from the start of the container.
    pub data_offset: u16,
    /// Length of the data section.
    pub data_size: u32,
    pub auth_type: u8,
    pub image_type: u8,
    pub flags: u8,
    /// Number of component entries.
    pub count: u8,
}
assert_eq_size!(ContainerHeader, [u8; 16]);

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ComponentEntry {
    /// Four character component name.
    pub name: u32,
    /// Offset of the payload from the start of the data section.
    pub offset: u32,
    pub size: u32,
    pub attribute: u8,
    pub alignment: u8,
    pub auth_type: u8,
    /// Number of hash bytes following this entry.
    pub hash_size: u8,
}
assert_eq_size!(ComponentEntry, [u8; 16]);

impl ComponentEntry {
    pub fn name_bytes(&self) -> [u8; 4] {
        self.name.to_le_bytes()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompressedHeader {
    pub signature: u32,
    pub compressed_size: u32,
    /// Number of payload bytes following the header.
    pub size: u32,
    pub version: u16,
    pub svn: u8,
    pub attribute: u8,
}
assert_eq_size!(CompressedHeader, [u8; 16]);

/// Framing signatures a payload header may carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u32)]
pub enum Compression {
    /// `LZDM`: the payload is stored as-is.
    Stored = u32::from_le_bytes(*b"LZDM"),
    /// `LZ4 `
    Lz4 = u32::from_le_bytes(*b"LZ4 "),
    /// `LZMA`
    Lzma = u32::from_le_bytes(*b"LZMA"),
}

impl CompressedHeader {
    pub fn stored(size: u32) -> Self {
        Self {
            signature: Compression::Stored as u32,
            compressed_size: size,
            size,
            version: 0,
            svn: 0,
            attribute: 0,
        }
    }

    pub fn compression(&self) -> Option<Compression> {
        Compression::from_repr(self.signature)
    }
}

struct PendingComponent<'a> {
    name: [u8; 4],
    data: &'a [u8],
    hash: &'a [u8],
}

/// Lays out a container with stored (uncompressed) payloads. The last
/// component is written without a payload header.
///
/// Components are emitted in the order they are added, so callers are
/// responsible for following the slot convention: boot command, boot image,
/// module (command, binary) pairs and finally the signature component.
pub struct ContainerBuilder<'a> {
    signature: [u8; 4],
    components: Vec<PendingComponent<'a>>,
}

impl Default for ContainerBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ContainerBuilder<'a> {
    pub fn new() -> Self {
        Self { signature: DEFAULT_CONTAINER_SIGNATURE, components: Vec::new() }
    }

    pub fn signature(mut self, signature: [u8; 4]) -> Self {
        self.signature = signature;
        self
    }

    pub fn component(self, name: [u8; 4], data: &'a [u8]) -> Self {
        self.component_with_hash(name, data, &[])
    }

    pub fn component_with_hash(mut self, name: [u8; 4], data: &'a [u8], hash: &'a [u8]) -> Self {
        self.components.push(PendingComponent { name, data, hash });
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let count: u8 = self
            .components
            .len()
            .try_into()
            .map_err(|_| LoadError::MalformedContainer("too many components"))?;

        let table_size: usize = self
            .components
            .iter()
            .map(|component| size_of::<ComponentEntry>() + component.hash.len())
            .sum();
        let data_offset = align_payload(size_of::<ContainerHeader>() + table_size);

        let mut entries = Vec::with_capacity(self.components.len());
        let mut data = Vec::new();
        let trailer = self.components.len().saturating_sub(1);
        for (slot, component) in self.components.iter().enumerate() {
            let hash_size: u8 = component
                .hash
                .len()
                .try_into()
                .map_err(|_| LoadError::MalformedContainer("component hash too large"))?;
            data.resize(align_payload(data.len()), 0);
            let offset = to_u32(data.len())?;
            if slot != trailer {
                let size = to_u32(component.data.len())?;
                data.extend_from_slice(CompressedHeader::stored(size).as_bytes());
            }
            data.extend_from_slice(component.data);
            entries.push(ComponentEntry {
                name: u32::from_le_bytes(component.name),
                offset,
                size: to_u32(data.len() - offset as usize)?,
                attribute: 0,
                alignment: 0,
                auth_type: 0,
                hash_size,
            });
        }

        let header = ContainerHeader {
            signature: u32::from_le_bytes(self.signature),
            version: 1,
            svn: 0,
            data_offset: data_offset
                .try_into()
                .map_err(|_| LoadError::MalformedContainer("component table too large"))?,
            data_size: to_u32(data.len())?,
            auth_type: 0,
            image_type: 0,
            flags: 0,
            count,
        };

        let mut container = Vec::with_capacity(data_offset + data.len());
        container.extend_from_slice(header.as_bytes());
        for (entry, component) in entries.iter().zip(&self.components) {
            container.extend_from_slice(entry.as_bytes());
            container.extend_from_slice(component.hash);
        }
        container.resize(data_offset, 0);
        container.extend_from_slice(&data);
        Ok(container)
    }
}

fn align_payload(offset: usize) -> usize {
    offset.next_multiple_of(PAYLOAD_ALIGN)
}

fn to_u32(value: usize) -> Result<u32> {
    value.try_into().map_err(|_| LoadError::MalformedContainer("container too large"))
}
