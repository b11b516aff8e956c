// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Auxiliary vector support.

use kvmbox::layout::PAGE_SIZE;

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AuxKey {
    /// end of vector
    AT_NULL = 0,
    /// program headers for program
    AT_PHDR = 3,
    /// size of program header entry
    AT_PHENT = 4,
    /// number of program headers
    AT_PHNUM = 5,
    /// system page size
    AT_PAGESZ = 6,
    /// base address of interpreter
    AT_BASE = 7,
    /// entry point of program
    AT_ENTRY = 9,
    /// address of 16 random bytes
    AT_RANDOM = 25,
}

/// The auxiliary-vector values collected while loading the binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct Auxv {
    pub at_phdr: u64,
    pub at_phent: u64,
    pub at_phnum: u64,
    pub at_entry: u64,
    pub at_base: u64,
    pub valid: bool,
}

impl Auxv {
    /// The entries to place on the initial stack, in the order they
    /// appear in memory (the `AT_NULL` terminator is pushed separately).
    pub fn entries(&self) -> Vec<(AuxKey, u64)> {
        let mut out = vec![(AuxKey::AT_PAGESZ, PAGE_SIZE as u64)];
        if self.valid {
            out.push((AuxKey::AT_PHDR, self.at_phdr));
            out.push((AuxKey::AT_PHENT, self.at_phent));
            out.push((AuxKey::AT_PHNUM, self.at_phnum));
            out.push((AuxKey::AT_ENTRY, self.at_entry));
            out.push((AuxKey::AT_BASE, self.at_base));
        }
        out
    }
}
