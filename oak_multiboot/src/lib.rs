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

//! Wire structures for the Multiboot (v1) and Multiboot2 boot protocols, and a
//! locator that finds and parses the OS image header a kernel embeds near the
//! start of its image.
//!
//! See <https://www.gnu.org/software/grub/manual/multiboot2/multiboot.html> and
//! <https://www.gnu.org/software/grub/manual/multiboot/multiboot.html> for the
//! protocol definitions.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod header;

use bitflags::bitflags;
use static_assertions::assert_eq_size;
use strum::{Display, FromRepr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use crate::header::{
    find_multiboot2_header, find_multiboot_header, parse, Error, HeaderInfo, LoadWindow, Relocation,
};

/// Magic value identifying a Multiboot2 OS image header.
pub const MULTIBOOT2_HEADER_MAGIC: u32 = 0xE852_50D6;

/// Magic value a Multiboot2 compliant bootloader passes to the OS in `eax`.
pub const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36D7_6289;

/// Alignment of the Multiboot2 header within the OS image.
pub const MULTIBOOT2_HEADER_ALIGN: usize = 8;

/// Alignment of every header tag and information tag.
pub const MULTIBOOT2_TAG_ALIGN: usize = 8;

/// The Multiboot2 header must be contained within this many bytes of the image.
pub const MULTIBOOT2_SEARCH: usize = 32768;

/// Magic value identifying a Multiboot (v1) OS image header.
pub const MULTIBOOT_HEADER_MAGIC: u32 = 0x1BAD_B002;

/// Alignment of the Multiboot header within the OS image.
pub const MULTIBOOT_HEADER_ALIGN: usize = 4;

/// The Multiboot header must be contained within this many bytes of the image.
pub const MULTIBOOT_SEARCH: usize = 8192;

/// Round `value` up to the Multiboot2 tag alignment.
pub const fn align_tag(value: usize) -> usize {
    (value + MULTIBOOT2_TAG_ALIGN - 1) & !(MULTIBOOT2_TAG_ALIGN - 1)
}

/// Protocol version of a located header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum Version {
    V1 = 1,
    V2 = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u32)]
pub enum Architecture {
    /// 32-bit (protected) mode of i386.
    I386 = 0,
    /// 32-bit MIPS.
    Mips32 = 4,
}

/// Fixed part of the Multiboot2 OS image header. Header tags follow directly.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Multiboot2Header {
    pub magic: u32,
    pub architecture: u32,
    /// Length of the header in bytes, including all tags.
    pub header_length: u32,
    /// `magic + architecture + header_length + checksum` must be zero mod 2^32.
    pub checksum: u32,
}
assert_eq_size!(Multiboot2Header, [u8; 16]);

impl Multiboot2Header {
    pub fn new(architecture: Architecture, header_length: u32) -> Self {
        let architecture = architecture as u32;
        Self {
            magic: MULTIBOOT2_HEADER_MAGIC,
            architecture,
            header_length,
            checksum: 0u32
                .wrapping_sub(MULTIBOOT2_HEADER_MAGIC)
                .wrapping_sub(architecture)
                .wrapping_sub(header_length),
        }
    }

    /// Whether this is an i386 header with a consistent checksum.
    pub fn is_valid(&self) -> bool {
        self.magic == MULTIBOOT2_HEADER_MAGIC
            && Architecture::from_repr(self.architecture) == Some(Architecture::I386)
            && self
                .magic
                .wrapping_add(self.architecture)
                .wrapping_add(self.header_length)
                .wrapping_add(self.checksum)
                == 0
    }
}

bitflags! {
    /// Feature requests in the Multiboot (v1) header `flags` field.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MultibootHeaderFlags: u32 {
        /// Boot modules must be aligned on 4 KiB boundaries.
        const PAGE_ALIGN = 1 << 0;
        /// Information on available memory must be provided.
        const MEMORY_INFO = 1 << 1;
        /// Information about the video mode table must be provided.
        const VIDEO_MODE = 1 << 2;
        /// The address fields of the header are valid. Only relevant for non-ELF images.
        const AOUT_KLUDGE = 1 << 16;
    }

    /// Flags common to all Multiboot2 header tags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeaderTagFlags: u16 {
        /// The bootloader may ignore the tag if it does not support it.
        const OPTIONAL = 1 << 0;
    }
}

/// Multiboot (v1) OS image header.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MultibootHeader {
    pub magic: u32,
    pub flags: u32,
    pub checksum: u32,
}
assert_eq_size!(MultibootHeader, [u8; 12]);

impl MultibootHeader {
    pub fn new(flags: MultibootHeaderFlags) -> Self {
        Self {
            magic: MULTIBOOT_HEADER_MAGIC,
            flags: flags.bits(),
            checksum: 0u32.wrapping_sub(MULTIBOOT_HEADER_MAGIC).wrapping_sub(flags.bits()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MULTIBOOT_HEADER_MAGIC
            && self.magic.wrapping_add(self.flags).wrapping_add(self.checksum) == 0
    }

    pub fn flags(&self) -> MultibootHeaderFlags {
        MultibootHeaderFlags::from_bits_retain(self.flags)
    }
}

/// Tag types that can appear in a Multiboot2 OS image header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u16)]
pub enum HeaderTagType {
    End = 0,
    InformationRequest = 1,
    Address = 2,
    EntryAddress = 3,
    ConsoleFlags = 4,
    Framebuffer = 5,
    ModuleAlign = 6,
    EfiBootServices = 7,
    EntryAddressEfi32 = 8,
    EntryAddressEfi64 = 9,
    Relocatable = 10,
}

/// Common prefix of every Multiboot2 header tag.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct HeaderTag {
    pub tag_type: u16,
    pub flags: u16,
    /// Size of the tag in bytes, excluding padding to the next tag.
    pub size: u32,
}
assert_eq_size!(HeaderTag, [u8; 8]);

impl HeaderTag {
    pub fn new(tag_type: HeaderTagType, size: u32) -> Self {
        Self { tag_type: tag_type as u16, flags: 0, size }
    }
}

/// Physical load addresses for the image. All four addresses are physical.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AddressTag {
    pub header: HeaderTag,
    /// Address corresponding to the start of the Multiboot2 header.
    pub header_addr: u32,
    /// Start of the text segment.
    pub load_addr: u32,
    /// End of the data segment.
    pub load_end_addr: u32,
    /// End of the bss segment.
    pub bss_end_addr: u32,
}
assert_eq_size!(AddressTag, [u8; 24]);

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EntryAddressTag {
    pub header: HeaderTag,
    pub entry_addr: u32,
}
assert_eq_size!(EntryAddressTag, [u8; 12]);

/// Placement preference for a relocatable image.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u32)]
pub enum RelocationPreference {
    None = 0,
    Lowest = 1,
    Highest = 2,
}

/// Marks the image as relocatable within `[min_addr, max_addr]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RelocatableTag {
    pub header: HeaderTag,
    pub min_addr: u32,
    pub max_addr: u32,
    pub align: u32,
    pub preference: u32,
}
assert_eq_size!(RelocatableTag, [u8; 24]);

/// Tag types of the boot information structure passed to the OS.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u32)]
pub enum InfoTagType {
    End = 0,
    Cmdline = 1,
    BootLoaderName = 2,
    Module = 3,
}

/// Prefix of a string-carrying information tag, such as the boot command line.
/// A NUL-terminated string follows.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StringTag {
    pub tag_type: u32,
    pub size: u32,
}
assert_eq_size!(StringTag, [u8; 8]);

/// Prefix of a module information tag. The module command line follows.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ModuleTag {
    pub tag_type: u32,
    pub size: u32,
    pub mod_start: u32,
    pub mod_end: u32,
}
assert_eq_size!(ModuleTag, [u8; 16]);
