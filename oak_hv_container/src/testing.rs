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

//! Builders for hypervisor images used across the unit tests.

use alloc::vec::Vec;
use core::mem::size_of;

use oak_multiboot::{
    align_tag, AddressTag, Architecture, EntryAddressTag, HeaderTag, HeaderTagType,
    Multiboot2Header, MultibootHeader, MultibootHeaderFlags, RelocatableTag, RelocationPreference,
};
use zerocopy::IntoBytes;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const PT_LOAD: u32 = 1;
const EM_386: u16 = 3;

pub fn address_tag(load_addr: u32, load_end_addr: u32) -> Vec<u8> {
    AddressTag {
        header: HeaderTag::new(HeaderTagType::Address, size_of::<AddressTag>() as u32),
        header_addr: load_addr,
        load_addr,
        load_end_addr,
        bss_end_addr: load_end_addr,
    }
    .as_bytes()
    .to_vec()
}

pub fn entry_tag(entry_addr: u32) -> Vec<u8> {
    EntryAddressTag {
        header: HeaderTag::new(HeaderTagType::EntryAddress, size_of::<EntryAddressTag>() as u32),
        entry_addr,
    }
    .as_bytes()
    .to_vec()
}

pub fn relocatable_tag(min_addr: u32, max_addr: u32, align: u32) -> Vec<u8> {
    RelocatableTag {
        header: HeaderTag::new(HeaderTagType::Relocatable, size_of::<RelocatableTag>() as u32),
        min_addr,
        max_addr,
        align,
        preference: RelocationPreference::None as u32,
    }
    .as_bytes()
    .to_vec()
}

/// A complete Multiboot2 header with the given tags and a terminating END tag.
pub fn multiboot2_header(tags: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for tag in tags {
        body.extend_from_slice(tag);
        body.resize(align_tag(body.len()), 0);
    }
    body.extend_from_slice(HeaderTag::new(HeaderTagType::End, 8).as_bytes());

    let length = (size_of::<Multiboot2Header>() + body.len()) as u32;
    let header = Multiboot2Header::new(Architecture::I386, length);
    let mut bytes = header.as_bytes().to_vec();
    bytes.extend_from_slice(&body);
    bytes
}

pub fn multiboot_header() -> Vec<u8> {
    MultibootHeader::new(MultibootHeaderFlags::MEMORY_INFO).as_bytes().to_vec()
}

struct Segment {
    paddr: u32,
    /// Explicit file offset; `None` places `data` after the headers.
    offset: Option<u32>,
    data: Vec<u8>,
    file_size: u32,
    memory_size: u32,
}

/// Assembles a little-endian i386 ELF executable.
pub struct ElfBuilder {
    entry: u32,
    multiboot: Vec<u8>,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        Self { entry, multiboot: Vec::new(), segments: Vec::new() }
    }

    /// Embeds a Multiboot header right after the program header table.
    pub fn multiboot(mut self, header: Vec<u8>) -> Self {
        self.multiboot = header;
        self
    }

    pub fn segment(mut self, paddr: u32, data: &[u8], memory_size: u32) -> Self {
        self.segments.push(Segment {
            paddr,
            offset: None,
            data: data.to_vec(),
            file_size: data.len() as u32,
            memory_size,
        });
        self
    }

    pub fn segment_at_offset(
        mut self,
        paddr: u32,
        offset: u32,
        file_size: u32,
        memory_size: u32,
    ) -> Self {
        self.segments.push(Segment {
            paddr,
            offset: Some(offset),
            data: Vec::new(),
            file_size,
            memory_size,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let headers_end = EHDR_SIZE + PHDR_SIZE * self.segments.len();
        let multiboot_offset = headers_end.next_multiple_of(8);

        let mut image = Vec::new();
        image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        image.extend_from_slice(&[0u8; 8]);
        image.extend_from_slice(&2u16.to_le_bytes()); // e_type: ET_EXEC
        image.extend_from_slice(&EM_386.to_le_bytes());
        image.extend_from_slice(&1u32.to_le_bytes()); // e_version
        image.extend_from_slice(&self.entry.to_le_bytes());
        image.extend_from_slice(&(EHDR_SIZE as u32).to_le_bytes()); // e_phoff
        image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        image.extend_from_slice(&40u16.to_le_bytes()); // e_shentsize
        image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(image.len(), EHDR_SIZE);

        let mut data = Vec::new();
        let mut next = (multiboot_offset + self.multiboot.len()).next_multiple_of(16);
        for segment in &self.segments {
            let offset = match segment.offset {
                Some(offset) => offset,
                None => {
                    let offset = next;
                    next = (next + segment.data.len()).next_multiple_of(16);
                    offset as u32
                }
            };
            for field in [
                PT_LOAD,
                offset,
                segment.paddr,
                segment.paddr,
                segment.file_size,
                segment.memory_size,
                0x7, // PF_R | PF_W | PF_X
                0x1000,
            ] {
                image.extend_from_slice(&field.to_le_bytes());
            }
            if segment.offset.is_none() {
                data.push((offset as usize, &segment.data));
            }
        }

        image.resize(multiboot_offset, 0);
        image.extend_from_slice(&self.multiboot);
        image.resize(next, 0);
        for (offset, bytes) in data {
            image[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        image
    }
}
