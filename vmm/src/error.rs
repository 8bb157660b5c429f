// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::io;

use hypervisor::{EmulationError, HalError, PlatformError};
use thiserror::Error;
use vm_device::{EmulatorError, IrqError, MemoryAccessError, RegistryError};

/// Error classes reported by the core and by the verbs wrapping it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Invalid,
    NotFound,
    AlreadyExists,
    OutOfMemory,
    IoError,
    BadGuestAccess,
    DecodeFailure,
    Timeout,
    VcpuGone,
    Alignment,
}

impl ErrorKind {
    /// Numeric code returned by management verbs; 0 is success.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Invalid => -22,
            ErrorKind::NotFound => -2,
            ErrorKind::AlreadyExists => -17,
            ErrorKind::OutOfMemory => -12,
            ErrorKind::IoError => -5,
            ErrorKind::BadGuestAccess => -14,
            ErrorKind::DecodeFailure => -38,
            ErrorKind::Timeout => -110,
            ErrorKind::VcpuGone => -3,
            ErrorKind::Alignment => -84,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Invalid => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::IoError => "I/O error",
            ErrorKind::BadGuestAccess => "bad guest access",
            ErrorKind::DecodeFailure => "decode failure",
            ErrorKind::Timeout => "timed out",
            ErrorKind::VcpuGone => "VCPU halted",
            ErrorKind::Alignment => "alignment fault",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Host I/O failure: {0}")]
    Io(#[source] io::Error),

    #[error("Bad guest access at {gpa:#x}")]
    BadGuestAccess { gpa: u64 },

    #[error("Write to read-only region at {gpa:#x}")]
    WriteToReadOnly { gpa: u64 },

    #[error("Unaligned guest access at {0:#x}")]
    Alignment(u64),

    #[error("Cannot emulate instruction: {0}")]
    DecodeFailure(#[source] anyhow::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("VCPU {0} is halted")]
    VcpuGone(String),

    #[error("Emulator error: {0}")]
    Emulator(#[source] EmulatorError),

    #[error("Emulator registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("Interrupt routing: {0}")]
    Irq(#[from] IrqError),

    #[error("HAL: {0}")]
    Hal(#[source] HalError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::Io(_) => ErrorKind::IoError,
            Error::BadGuestAccess { .. } | Error::WriteToReadOnly { .. } => {
                ErrorKind::BadGuestAccess
            }
            Error::Alignment(_) => ErrorKind::Alignment,
            Error::DecodeFailure(_) => ErrorKind::DecodeFailure,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::VcpuGone(_) => ErrorKind::VcpuGone,
            Error::Emulator(e) => match e {
                EmulatorError::BadAccess { .. }
                | EmulatorError::UnsupportedWidth(_)
                | EmulatorError::Memory(_) => ErrorKind::BadGuestAccess,
                EmulatorError::InvalidConfig(_) => ErrorKind::Invalid,
                EmulatorError::Irq(_) => ErrorKind::Invalid,
                EmulatorError::Io(_) => ErrorKind::IoError,
            },
            Error::Registry(RegistryError::Exists(_)) => ErrorKind::AlreadyExists,
            Error::Registry(RegistryError::NotFound(_)) => ErrorKind::NotFound,
            Error::Irq(IrqError::DuplicateChip(_)) => ErrorKind::AlreadyExists,
            Error::Irq(IrqError::NoChip(_)) => ErrorKind::NotFound,
            Error::Irq(_) => ErrorKind::Invalid,
            Error::Hal(HalError::Translation(_)) => ErrorKind::BadGuestAccess,
            Error::Hal(HalError::InvalidCpu(_)) => ErrorKind::Invalid,
            Error::Hal(HalError::GuestExecution(_)) => ErrorKind::IoError,
        }
    }

    /// `<code> <reason>` line printed by management verbs.
    pub fn report(&self) -> String {
        format!("{} {}", self.kind().code(), self)
    }
}

impl From<EmulatorError> for Error {
    fn from(e: EmulatorError) -> Self {
        Error::Emulator(e)
    }
}

impl From<MemoryAccessError> for Error {
    fn from(e: MemoryAccessError) -> Self {
        match e {
            MemoryAccessError::BadGuestAccess { gpa, .. } => Error::BadGuestAccess { gpa },
        }
    }
}

impl From<HalError> for Error {
    fn from(e: HalError) -> Self {
        Error::Hal(e)
    }
}

impl From<PlatformError> for Error {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::BadGuestAccess(gpa) => Error::BadGuestAccess { gpa },
            PlatformError::Alignment(addr) => Error::Alignment(addr),
            e => Error::DecodeFailure(e.into()),
        }
    }
}

impl From<EmulationError> for Error {
    fn from(e: EmulationError) -> Self {
        match e {
            EmulationError::PlatformEmulationError(e) => e.into(),
            e => Error::DecodeFailure(e.into()),
        }
    }
}
