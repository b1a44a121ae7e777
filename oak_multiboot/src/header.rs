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

use core::mem::size_of;

use log::{debug, trace};
use zerocopy::FromBytes;

use crate::{
    align_tag, AddressTag, EntryAddressTag, HeaderTag, HeaderTagType, Multiboot2Header,
    MultibootHeader, RelocatableTag, RelocationPreference, Version, MULTIBOOT2_HEADER_ALIGN,
    MULTIBOOT_HEADER_ALIGN,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no multiboot header found in the search window")]
    NotFound,
    #[error("unsupported multiboot2 header tag type {0}")]
    UnsupportedTag(u16),
    #[error("multiboot2 header tags run past the end of the header")]
    Truncated,
    #[error("multiboot2 header tag at offset {offset:#x} has invalid size {size}")]
    InvalidTagSize { offset: usize, size: u32 },
    #[error("load address given without a non-zero entry address")]
    MissingEntryAddress,
    #[error("invalid load window {start:#x}..{end:#x}")]
    InvalidLoadWindow { start: u32, end: u32 },
    #[error("relocation alignment {0:#x} is not a power of two")]
    InvalidAlignment(u32),
}

/// Physical address range `[start, end)` the image expects to be loaded at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadWindow {
    pub start: u32,
    pub end: u32,
}

impl LoadWindow {
    pub fn size(&self) -> u32 {
        self.end - self.start
    }
}

/// Constraints under which a relocatable image may be placed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub min_addr: u32,
    pub max_addr: u32,
    pub align: u32,
    pub preference: RelocationPreference,
}

/// Everything the loader needs from the OS image header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub version: Version,
    /// Offset of the header from the start of the image.
    pub offset: usize,
    pub load_window: Option<LoadWindow>,
    pub entry: Option<u32>,
    pub relocation: Option<Relocation>,
}

impl HeaderInfo {
    fn new(version: Version, offset: usize) -> Self {
        Self { version, offset, load_window: None, entry: None, relocation: None }
    }
}

/// Scans the first `search_len` bytes of `image` for a valid Multiboot2 header.
///
/// Candidates are probed on every header-aligned offset; the whole header must
/// fit inside the search window.
pub fn find_multiboot2_header(
    image: &[u8],
    search_len: usize,
) -> Option<(usize, Multiboot2Header)> {
    let window = &image[..search_len.min(image.len())];
    (0..window.len()).step_by(MULTIBOOT2_HEADER_ALIGN).find_map(|offset| {
        let (header, _) = Multiboot2Header::read_from_prefix(&window[offset..]).ok()?;
        header.is_valid().then_some((offset, header))
    })
}

/// Scans the first `search_len` bytes of `image` for a valid Multiboot header.
pub fn find_multiboot_header(image: &[u8], search_len: usize) -> Option<(usize, MultibootHeader)> {
    let window = &image[..search_len.min(image.len())];
    (0..window.len()).step_by(MULTIBOOT_HEADER_ALIGN).find_map(|offset| {
        let (header, _) = MultibootHeader::read_from_prefix(&window[offset..]).ok()?;
        header.is_valid().then_some((offset, header))
    })
}

/// Locates the OS image header, preferring Multiboot2, and extracts its load
/// metadata.
///
/// Multiboot2 header tags this loader does not understand are rejected rather
/// than skipped, even if the image marks them optional.
pub fn parse(
    image: &[u8],
    multiboot2_search: usize,
    multiboot_search: usize,
) -> Result<HeaderInfo, Error> {
    if let Some((offset, header)) = find_multiboot2_header(image, multiboot2_search) {
        debug!("multiboot2 header at offset {:#x}, length {}", offset, header.header_length);
        let end = offset.checked_add(header.header_length as usize).ok_or(Error::Truncated)?;
        let bytes = image.get(offset..end).ok_or(Error::Truncated)?;
        let mut info = HeaderInfo::new(Version::V2, offset);
        parse_multiboot2_tags(bytes, &mut info)?;
        return Ok(info);
    }

    if let Some((offset, header)) = find_multiboot_header(image, multiboot_search) {
        debug!("multiboot header at offset {:#x}, flags {:?}", offset, header.flags());
        // Nothing to extract: the image is placed according to its ELF headers.
        return Ok(HeaderInfo::new(Version::V1, offset));
    }

    Err(Error::NotFound)
}

/// Walks the tags of a Multiboot2 header. `bytes` spans exactly
/// `header_length` bytes starting at the fixed header.
fn parse_multiboot2_tags(bytes: &[u8], info: &mut HeaderInfo) -> Result<(), Error> {
    let mut offset = size_of::<Multiboot2Header>();
    loop {
        let remaining = bytes.get(offset..).ok_or(Error::Truncated)?;
        let (tag, _) = HeaderTag::read_from_prefix(remaining).map_err(|_| Error::Truncated)?;
        let size = tag.size as usize;
        if size < size_of::<HeaderTag>() {
            return Err(Error::InvalidTagSize { offset, size: tag.size });
        }
        let body = remaining.get(..size).ok_or(Error::Truncated)?;
        let invalid_size = Error::InvalidTagSize { offset, size: tag.size };

        trace!("multiboot2 header tag {} at offset {:#x}, size {}", tag.tag_type, offset, size);
        match HeaderTagType::from_repr(tag.tag_type) {
            Some(HeaderTagType::End) => break,
            Some(HeaderTagType::InformationRequest) => {}
            Some(HeaderTagType::Address) => {
                let (address, _) = AddressTag::read_from_prefix(body).map_err(|_| invalid_size)?;
                if address.load_end_addr <= address.load_addr {
                    return Err(Error::InvalidLoadWindow {
                        start: address.load_addr,
                        end: address.load_end_addr,
                    });
                }
                info.load_window =
                    Some(LoadWindow { start: address.load_addr, end: address.load_end_addr });
            }
            Some(HeaderTagType::EntryAddress) => {
                let (entry, _) = EntryAddressTag::read_from_prefix(body).map_err(|_| invalid_size)?;
                info.entry = Some(entry.entry_addr);
            }
            Some(HeaderTagType::Relocatable) => {
                let (reloc, _) = RelocatableTag::read_from_prefix(body).map_err(|_| invalid_size)?;
                if !reloc.align.is_power_of_two() {
                    return Err(Error::InvalidAlignment(reloc.align));
                }
                info.relocation = Some(Relocation {
                    min_addr: reloc.min_addr,
                    max_addr: reloc.max_addr,
                    align: reloc.align,
                    preference: RelocationPreference::from_repr(reloc.preference)
                        .unwrap_or(RelocationPreference::None),
                });
            }
            _ => return Err(Error::UnsupportedTag(tag.tag_type)),
        }

        offset = offset.checked_add(align_tag(size)).ok_or(Error::Truncated)?;
    }

    if info.load_window.is_some() && info.entry.unwrap_or(0) == 0 {
        return Err(Error::MissingEntryAddress);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{vec, vec::Vec};

    use googletest::prelude::*;
    use zerocopy::IntoBytes;

    use super::*;
    use crate::{Architecture, MultibootHeaderFlags};

    /// Lays out a Multiboot2 header carrying `tags` at `offset` in a zeroed
    /// buffer of `len` bytes.
    fn image_with_tags(offset: usize, len: usize, tags: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        for tag in tags {
            body.extend_from_slice(tag);
            body.resize(align_tag(body.len()), 0);
        }
        body.extend_from_slice(HeaderTag::new(HeaderTagType::End, 8).as_bytes());

        let header = Multiboot2Header::new(
            Architecture::I386,
            (size_of::<Multiboot2Header>() + body.len()) as u32,
        );
        let mut image = vec![0u8; len];
        image[offset..offset + 16].copy_from_slice(header.as_bytes());
        image[offset + 16..offset + 16 + body.len()].copy_from_slice(&body);
        image
    }

    fn address_tag(load_addr: u32, load_end_addr: u32) -> AddressTag {
        AddressTag {
            header: HeaderTag::new(HeaderTagType::Address, 24),
            header_addr: load_addr,
            load_addr,
            load_end_addr,
            bss_end_addr: load_end_addr,
        }
    }

    fn entry_tag(entry_addr: u32) -> EntryAddressTag {
        EntryAddressTag { header: HeaderTag::new(HeaderTagType::EntryAddress, 12), entry_addr }
    }

    #[googletest::test]
    fn checksum_of_new_header_is_valid() {
        let header = Multiboot2Header::new(Architecture::I386, 24);
        assert_that!(header.is_valid(), eq(true));

        let mips = Multiboot2Header::new(Architecture::Mips32, 24);
        assert_that!(mips.is_valid(), eq(false));
    }

    #[googletest::test]
    fn finds_header_on_aligned_offset() {
        let image = image_with_tags(0x40, 0x200, &[]);
        assert_that!(
            find_multiboot2_header(&image, 0x200).map(|(offset, _)| offset),
            some(eq(0x40))
        );
    }

    #[googletest::test]
    fn ignores_misaligned_header() {
        let image = image_with_tags(0x44, 0x200, &[]);
        assert_that!(find_multiboot2_header(&image, 0x200), none());
    }

    #[googletest::test]
    fn ignores_header_with_bad_checksum() {
        let mut image = image_with_tags(0, 0x100, &[]);
        image[12] ^= 1;
        assert_that!(find_multiboot2_header(&image, 0x100), none());
        assert_that!(parse(&image, 0x100, 0x100), err(eq(Error::NotFound)));
    }

    #[googletest::test]
    fn header_outside_search_window_is_not_found() {
        let image = image_with_tags(0x100, 0x200, &[]);
        assert_that!(find_multiboot2_header(&image, 0x100), none());
        // Straddling the end of the window does not count either.
        assert_that!(find_multiboot2_header(&image, 0x108), none());
        assert_that!(
            find_multiboot2_header(&image, 0x110).map(|(offset, _)| offset),
            some(eq(0x100))
        );
    }

    #[googletest::test]
    fn parses_address_entry_and_relocation() {
        let reloc = RelocatableTag {
            header: HeaderTag::new(HeaderTagType::Relocatable, 24),
            min_addr: 0x1000_0000,
            max_addr: 0x4000_0000,
            align: 0x20_0000,
            preference: RelocationPreference::Lowest as u32,
        };
        let image = image_with_tags(
            8,
            0x100,
            &[
                address_tag(0x100_0000, 0x180_0000).as_bytes(),
                entry_tag(0x100_1000).as_bytes(),
                reloc.as_bytes(),
            ],
        );

        assert_that!(
            parse(&image, 0x100, 0x100),
            ok(eq(HeaderInfo {
                version: Version::V2,
                offset: 8,
                load_window: Some(LoadWindow { start: 0x100_0000, end: 0x180_0000 }),
                entry: Some(0x100_1000),
                relocation: Some(Relocation {
                    min_addr: 0x1000_0000,
                    max_addr: 0x4000_0000,
                    align: 0x20_0000,
                    preference: RelocationPreference::Lowest,
                }),
            }))
        );
    }

    #[googletest::test]
    fn information_request_is_skipped() {
        // Information request for the memory map, padded from 12 to 16 bytes.
        let mut request = HeaderTag::new(HeaderTagType::InformationRequest, 12).as_bytes().to_vec();
        request.extend_from_slice(&6u32.to_le_bytes());
        let image = image_with_tags(0, 0x100, &[&request, entry_tag(0x2000).as_bytes()]);

        let info = parse(&image, 0x100, 0x100).expect("failed to parse header");
        assert_that!(info.entry, some(eq(0x2000)));
        assert_that!(info.load_window, none());
        assert_that!(info.relocation, none());
    }

    #[googletest::test]
    fn rejects_unsupported_tag() {
        let framebuffer = HeaderTag::new(HeaderTagType::Framebuffer, 20);
        let mut tag = framebuffer.as_bytes().to_vec();
        tag.extend_from_slice(&[0u8; 12]);
        let image = image_with_tags(0, 0x100, &[&tag]);

        assert_that!(
            parse(&image, 0x100, 0x100),
            err(eq(Error::UnsupportedTag(HeaderTagType::Framebuffer as u16)))
        );
    }

    #[googletest::test]
    fn rejects_address_without_entry() {
        let image = image_with_tags(0, 0x100, &[address_tag(0x100_0000, 0x180_0000).as_bytes()]);
        assert_that!(parse(&image, 0x100, 0x100), err(eq(Error::MissingEntryAddress)));

        let image = image_with_tags(
            0,
            0x100,
            &[address_tag(0x100_0000, 0x180_0000).as_bytes(), entry_tag(0).as_bytes()],
        );
        assert_that!(parse(&image, 0x100, 0x100), err(eq(Error::MissingEntryAddress)));
    }

    #[googletest::test]
    fn rejects_empty_load_window() {
        let image = image_with_tags(
            0,
            0x100,
            &[address_tag(0x100_0000, 0x100_0000).as_bytes(), entry_tag(0x100_0000).as_bytes()],
        );
        assert_that!(
            parse(&image, 0x100, 0x100),
            err(matches_pattern!(Error::InvalidLoadWindow { .. }))
        );
    }

    #[googletest::test]
    fn rejects_non_power_of_two_alignment() {
        let reloc = RelocatableTag {
            header: HeaderTag::new(HeaderTagType::Relocatable, 24),
            min_addr: 0,
            max_addr: u32::MAX,
            align: 0x3000,
            preference: 0,
        };
        let image = image_with_tags(0, 0x100, &[reloc.as_bytes()]);
        assert_that!(parse(&image, 0x100, 0x100), err(eq(Error::InvalidAlignment(0x3000))));
    }

    #[googletest::test]
    fn rejects_undersized_tag() {
        let undersized = HeaderTag::new(HeaderTagType::EntryAddress, 4);
        let image = image_with_tags(0, 0x100, &[undersized.as_bytes()]);
        assert_that!(
            parse(&image, 0x100, 0x100),
            err(eq(Error::InvalidTagSize { offset: 16, size: 4 }))
        );
    }

    #[googletest::test]
    fn rejects_header_without_end_tag() {
        let entry = entry_tag(0x2000);
        let header = Multiboot2Header::new(Architecture::I386, 16 + 12);
        let mut image = vec![0u8; 0x100];
        image[..16].copy_from_slice(header.as_bytes());
        image[16..28].copy_from_slice(entry.as_bytes());

        assert_that!(parse(&image, 0x100, 0x100), err(eq(Error::Truncated)));
    }

    #[googletest::test]
    fn falls_back_to_multiboot() {
        let header = MultibootHeader::new(
            MultibootHeaderFlags::PAGE_ALIGN | MultibootHeaderFlags::MEMORY_INFO,
        );
        let mut image = vec![0u8; 0x100];
        image[0x24..0x30].copy_from_slice(header.as_bytes());

        assert_that!(
            parse(&image, 0x100, 0x100),
            ok(eq(HeaderInfo {
                version: Version::V1,
                offset: 0x24,
                load_window: None,
                entry: None,
                relocation: None,
            }))
        );
        // Multiboot headers are only 4-byte aligned.
        assert_that!(find_multiboot_header(&image[1..], 0x100), none());
    }

    #[googletest::test]
    fn prefers_multiboot2() {
        let mut image = image_with_tags(0x80, 0x100, &[entry_tag(0x2000).as_bytes()]);
        image[..12].copy_from_slice(MultibootHeader::new(MultibootHeaderFlags::empty()).as_bytes());

        let info = parse(&image, 0x100, 0x100).expect("failed to parse header");
        assert_that!(info.version, eq(Version::V2));
        assert_that!(info.offset, eq(0x80));
    }
}
