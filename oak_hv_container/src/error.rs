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

use crate::memory::AllocError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("failed to allocate physical memory")]
    AllocationFailure(#[from] AllocError),
    #[error("malformed container: {0}")]
    MalformedContainer(&'static str),
    #[error("container section not found in the image")]
    SectionNotFound,
    #[error("boot image is not multiboot compatible")]
    NotMultibootCompatible,
    #[error("invalid multiboot header: {0}")]
    InvalidMultibootHeader(#[from] oak_multiboot::Error),
    #[error("invalid ELF image: {0}")]
    InvalidElf(&'static str),
    #[error(
        "segment {index} has file size {file_size:#x} larger than memory size {memory_size:#x}"
    )]
    SegmentSizeViolation { index: usize, file_size: u64, memory_size: u64 },
    #[error("segment {index} at {address:#x} lies outside the load window")]
    SegmentOutsideWindow { index: usize, address: u64 },
    #[error("module index {index} out of range, container holds {count} modules")]
    ModuleIndexOutOfRange { index: usize, count: usize },
    #[error("tag buffer too small: need {needed} bytes, have {available}")]
    TagBufferTooSmall { needed: usize, available: usize },
    #[error("address {0:#x} does not fit the multiboot information structure")]
    AddressOverflow(u64),
    #[error("invalid loader state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = core::result::Result<T, LoadError>;
