// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error handling. See [`Errno`].

use thiserror::Error;

/// Linux error numbers
///
/// This is a transparent wrapper around Linux error numbers (i.e., small
/// positive integers) intended to provide some type safety by expecting
/// explicit conversions to/from raw values. Syscall results hand the
/// *negated* value back to the guest; use [`Errno::as_neg`] for that.
#[derive(PartialEq, Eq, Clone, Copy, Error)]
pub struct Errno {
    value: core::num::NonZeroU8,
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> Self {
        e.value.get().into()
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({} = {})", self.value.get(), self.as_str())
    }
}

impl Errno {
    /// Provide the negative integer representation of the error, as a
    /// syscall result register expects it.
    ///
    /// ```
    /// # use kvmbox_common_linux::errno::Errno;
    /// assert_eq!(-1, Errno::EPERM.as_neg());
    /// ```
    pub fn as_neg(self) -> i64 {
        -i64::from(i32::from(self))
    }

    /// Helper that makes the associated constants on [`Errno`]
    /// significantly more readable.
    const fn from_const(v: u8) -> Self {
        Self {
            value: match core::num::NonZeroU8::new(v) {
                Some(v) => v,
                None => panic!("errno constants are non-zero"),
            },
        }
    }

    pub const EPERM: Self = Self::from_const(1);
    pub const ENOENT: Self = Self::from_const(2);
    pub const ESRCH: Self = Self::from_const(3);
    pub const EINTR: Self = Self::from_const(4);
    pub const EIO: Self = Self::from_const(5);
    pub const EBADF: Self = Self::from_const(9);
    pub const EAGAIN: Self = Self::from_const(11);
    pub const ENOMEM: Self = Self::from_const(12);
    pub const EACCES: Self = Self::from_const(13);
    pub const EFAULT: Self = Self::from_const(14);
    pub const EBUSY: Self = Self::from_const(16);
    pub const EEXIST: Self = Self::from_const(17);
    pub const ENODEV: Self = Self::from_const(19);
    pub const ENOTDIR: Self = Self::from_const(20);
    pub const EISDIR: Self = Self::from_const(21);
    pub const EINVAL: Self = Self::from_const(22);
    pub const ENFILE: Self = Self::from_const(23);
    pub const EMFILE: Self = Self::from_const(24);
    pub const ENOSPC: Self = Self::from_const(28);
    pub const ESPIPE: Self = Self::from_const(29);
    pub const ERANGE: Self = Self::from_const(34);
    pub const ENOSYS: Self = Self::from_const(38);
    pub const EOVERFLOW: Self = Self::from_const(75);

    fn as_str(self) -> &'static str {
        match self.value.get() {
            1 => "EPERM",
            2 => "ENOENT",
            3 => "ESRCH",
            4 => "EINTR",
            5 => "EIO",
            9 => "EBADF",
            11 => "EAGAIN",
            12 => "ENOMEM",
            13 => "EACCES",
            14 => "EFAULT",
            16 => "EBUSY",
            17 => "EEXIST",
            19 => "ENODEV",
            20 => "ENOTDIR",
            21 => "EISDIR",
            22 => "EINVAL",
            23 => "ENFILE",
            24 => "EMFILE",
            28 => "ENOSPC",
            29 => "ESPIPE",
            34 => "ERANGE",
            38 => "ENOSYS",
            75 => "EOVERFLOW",
            _ => "E?",
        }
    }
}

/// Errors when converting to an [`Errno`]
#[derive(Error, Debug)]
pub enum ErrnoConversionError {
    #[error("Expected positive error number")]
    ExpectedPositive,
    #[error("Error number cannot be zero")]
    ExpectedNonZero,
    #[error("Error number is unexpectedly large")]
    ExpectedSmallEnough,
}

impl TryFrom<i32> for Errno {
    type Error = ErrnoConversionError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(ErrnoConversionError::ExpectedPositive);
        }
        let value: u8 = value
            .try_into()
            .map_err(|_| ErrnoConversionError::ExpectedSmallEnough)?;
        Ok(Self {
            value: core::num::NonZeroU8::new(value)
                .ok_or(ErrnoConversionError::ExpectedNonZero)?,
        })
    }
}
