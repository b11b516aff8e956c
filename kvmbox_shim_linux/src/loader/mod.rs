// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Program loading: ELF segments, the auxiliary vector, and the initial
//! user stack image.

pub mod auxv;
pub mod elf;
pub mod stack;
