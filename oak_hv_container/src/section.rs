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

use core::ops::Range;

use goblin::pe::header::{Header, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC};
use log::debug;

/// Finds a named section in an executable image.
#[cfg_attr(test, mockall::automock)]
pub trait SectionLocator {
    /// Byte range of the section `name` within `image`.
    fn find_section(&self, image: &[u8], name: &str) -> Option<Range<usize>>;
}

/// How a PE image is laid out in the buffer being searched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeLayout {
    /// As stored on disk: sections live at their raw data pointers.
    File,
    /// As mapped by the firmware loader: sections live at their virtual
    /// addresses, relative to the image base.
    Loaded,
}

/// Locates sections through the PE/COFF section table.
#[derive(Copy, Clone, Debug)]
pub struct PeSections {
    pub layout: PeLayout,
}

impl PeSections {
    pub fn new(layout: PeLayout) -> Self {
        Self { layout }
    }
}

impl SectionLocator for PeSections {
    fn find_section(&self, image: &[u8], name: &str) -> Option<Range<usize>> {
        let header = Header::parse(image).ok()?;
        let mut offset = (header.dos_header.pe_pointer as usize)
            .checked_add(SIZEOF_PE_MAGIC + SIZEOF_COFF_HEADER)?
            .checked_add(header.coff_header.size_of_optional_header.into())?;
        let sections = header.coff_header.sections(image, &mut offset).ok()?;
        let section = sections.iter().find(|section| section.name().ok() == Some(name))?;

        let (start, size) = match self.layout {
            PeLayout::File => (section.pointer_to_raw_data, section.size_of_raw_data),
            PeLayout::Loaded => (section.virtual_address, section.virtual_size),
        };
        let start = start as usize;
        let end = start.checked_add(size as usize)?;
        debug!("section {} spans {:#x}..{:#x}", name, start, end);
        (end <= image.len()).then_some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use googletest::prelude::*;

    use super::*;

    const PE_POINTER: usize = 0x80;

    /// A PE image without optional header holding a `.text` and a `.hv`
    /// section.
    fn pe_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x3000];
        image[..2].copy_from_slice(b"MZ");
        image[0x3c..0x40].copy_from_slice(&(PE_POINTER as u32).to_le_bytes());
        image[PE_POINTER..PE_POINTER + 4].copy_from_slice(b"PE\0\0");

        let mut coff = Vec::new();
        coff.extend_from_slice(&0x14cu16.to_le_bytes()); // i386
        coff.extend_from_slice(&2u16.to_le_bytes());
        coff.extend_from_slice(&[0u8; 12]);
        coff.extend_from_slice(&0u16.to_le_bytes()); // no optional header
        coff.extend_from_slice(&0u16.to_le_bytes());
        image[PE_POINTER + 4..PE_POINTER + 24].copy_from_slice(&coff);

        // (name, virtual size, virtual address, raw size, raw pointer)
        let sections: [(&[u8; 8], u32, u32, u32, u32); 2] = [
            (b".text\0\0\0", 0x10, 0x1000, 0x10, 0x200),
            (b".hv\0\0\0\0\0", 0x18, 0x2000, 0x20, 0x210),
        ];
        let mut table = PE_POINTER + 24;
        for (name, virtual_size, virtual_address, raw_size, raw_pointer) in sections {
            let mut entry = name.to_vec();
            for field in [virtual_size, virtual_address, raw_size, raw_pointer, 0, 0, 0, 0] {
                entry.extend_from_slice(&field.to_le_bytes());
            }
            entry.truncate(40);
            image[table..table + 40].copy_from_slice(&entry);
            table += 40;
        }
        image
    }

    #[googletest::test]
    fn finds_section_in_file_layout() {
        let image = pe_image();
        assert_that!(
            PeSections::new(PeLayout::File).find_section(&image, ".hv"),
            some(eq(&(0x210..0x230)))
        );
    }

    #[googletest::test]
    fn finds_section_in_loaded_layout() {
        let image = pe_image();
        assert_that!(
            PeSections::new(PeLayout::Loaded).find_section(&image, ".hv"),
            some(eq(&(0x2000..0x2018)))
        );
    }

    #[googletest::test]
    fn missing_section_is_none() {
        let image = pe_image();
        assert_that!(PeSections::new(PeLayout::File).find_section(&image, ".data"), none());
        assert_that!(PeSections::new(PeLayout::File).find_section(&[0u8; 64], ".hv"), none());
    }
}
