//! The 32-bit version header carried by every contract output.
//!
//! The header is frozen by consensus. On the wire it is a little-endian `u32`
//! with the following layout, least significant bit first:
//!
//! ```text
//!  bits 0..2    format
//!  bits 2..8    root VM identifier
//!  bits 8..16   VM version
//!  bits 16..32  flag options
//! ```
//!
//! Packing and unpacking is done with explicit shifts and masks so the
//! encoding never depends on the host's struct layout or byte order. No field
//! may ever be added.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::AddressVersion;

const FORMAT_BITS: u32 = 2;
const ROOT_VM_BITS: u32 = 6;
const VM_VERSION_BITS: u32 = 8;

const FORMAT_MASK: u32 = (1 << FORMAT_BITS) - 1;
const ROOT_VM_MASK: u32 = (1 << ROOT_VM_BITS) - 1;
const VM_VERSION_MASK: u32 = (1 << VM_VERSION_BITS) - 1;

const ROOT_VM_SHIFT: u32 = FORMAT_BITS;
const VM_VERSION_SHIFT: u32 = ROOT_VM_SHIFT + ROOT_VM_BITS;
const FLAGS_SHIFT: u32 = VM_VERSION_SHIFT + VM_VERSION_BITS;

/// A field value does not fit in its bit width.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum VersionVmError {
    /// `format` is limited to 2 bits.
    #[error("format {0} does not fit in 2 bits")]
    Format(u8),
    /// `root_vm` is limited to 6 bits.
    #[error("root VM identifier {0} does not fit in 6 bits")]
    RootVm(u8),
}

/// Decoded version header.
///
/// Any raw `u32` decodes without failure, including headers naming root VMs
/// that do not exist. Whether the root VM is usable is decided separately by
/// [`VersionVm::root`]. Serialized as the raw header.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(from = "u32", into = "u32")]
pub struct VersionVm {
    format: u8,
    root_vm: u8,
    vm_version: u8,
    flag_options: u16,
}

impl VersionVm {
    /// Builds a header, checking that the narrow fields fit their widths.
    pub const fn new(
        format: u8,
        root_vm: u8,
        vm_version: u8,
        flag_options: u16,
    ) -> Result<Self, VersionVmError> {
        if format as u32 > FORMAT_MASK {
            return Err(VersionVmError::Format(format));
        }
        if root_vm as u32 > ROOT_VM_MASK {
            return Err(VersionVmError::RootVm(root_vm));
        }
        Ok(Self {
            format,
            root_vm,
            vm_version,
            flag_options,
        })
    }

    /// The header of an output that carries no execution.
    pub const fn no_exec() -> Self {
        Self {
            format: 0,
            root_vm: RootVm::NoExec as u8,
            vm_version: 0,
            flag_options: 0,
        }
    }

    /// The header of a plain EVM call (raw value `4`).
    pub const fn evm_default() -> Self {
        Self {
            format: 0,
            root_vm: RootVm::Evm as u8,
            vm_version: 0,
            flag_options: 0,
        }
    }

    /// Unpacks a raw header.
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            format: (raw & FORMAT_MASK) as u8,
            root_vm: ((raw >> ROOT_VM_SHIFT) & ROOT_VM_MASK) as u8,
            vm_version: ((raw >> VM_VERSION_SHIFT) & VM_VERSION_MASK) as u8,
            flag_options: (raw >> FLAGS_SHIFT) as u16,
        }
    }

    /// Packs the header back into its raw form.
    pub const fn to_raw(self) -> u32 {
        (self.format as u32)
            | ((self.root_vm as u32) << ROOT_VM_SHIFT)
            | ((self.vm_version as u32) << VM_VERSION_SHIFT)
            | ((self.flag_options as u32) << FLAGS_SHIFT)
    }

    /// Wire encoding.
    pub const fn to_le_bytes(self) -> [u8; 4] {
        self.to_raw().to_le_bytes()
    }

    /// Inverse of [`VersionVm::to_le_bytes`].
    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_raw(u32::from_le_bytes(bytes))
    }

    pub const fn format(self) -> u8 {
        self.format
    }

    pub const fn root_vm(self) -> u8 {
        self.root_vm
    }

    pub const fn vm_version(self) -> u8 {
        self.vm_version
    }

    pub const fn flag_options(self) -> u16 {
        self.flag_options
    }

    /// The root VM this header selects, if it is one the ledger knows.
    pub fn root(self) -> Option<RootVm> {
        RootVm::try_from(self.root_vm).ok()
    }
}

impl From<u32> for VersionVm {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl From<VersionVm> for u32 {
    fn from(v: VersionVm) -> Self {
        v.to_raw()
    }
}

impl Display for VersionVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "format={} root_vm={} vm_version={} flags={:#06x}",
            self.format, self.root_vm, self.vm_version, self.flag_options
        )
    }
}

/// The closed set of root VM identifiers.
///
/// The set is consensus critical: a new VM kind is a new variant here, never
/// an open-ended registration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[repr(u8)]
pub enum RootVm {
    /// The output carries data but nothing executes it.
    NoExec = 0,
    /// Ethereum virtual machine.
    Evm = 1,
    /// The ledger's own contract VM.
    Native = 2,
}

impl RootVm {
    /// Version of the address a call into this VM targets. `None` for
    /// [`RootVm::NoExec`], which has no accounts.
    pub const fn contract_address_version(self) -> Option<AddressVersion> {
        match self {
            RootVm::NoExec => None,
            RootVm::Evm => Some(AddressVersion::Evm),
            RootVm::Native => Some(AddressVersion::LedgerNative),
        }
    }
}

impl TryFrom<u8> for RootVm {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(RootVm::NoExec),
            1 => Ok(RootVm::Evm),
            2 => Ok(RootVm::Native),
            other => Err(other),
        }
    }
}
