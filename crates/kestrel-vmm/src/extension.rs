//! Required hypervisor extensions.
//!
//! VM creation proceeds only when the backend supports every capability
//! in the required list.  The list is ordered; the first missing entry
//! stops the check and its position becomes the process exit status
//! reported by `kestrel-boot`.

use kvm_ioctls::Cap;
use log::{debug, error};
use thiserror::Error;

use crate::backend::Hypervisor;

/// A named capability the VMM depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    pub name: &'static str,
    pub cap: Cap,
}

impl Extension {
    pub const fn new(name: &'static str, cap: Cap) -> Self {
        Self { name, cap }
    }
}

/// Capabilities an x86_64 guest needs, in the order they are checked.
pub const X86_REQUIRED_EXTENSIONS: &[Extension] = &[
    Extension::new("KVM_CAP_COALESCED_MMIO", Cap::CoalescedMmio),
    Extension::new("KVM_CAP_SET_TSS_ADDR", Cap::SetTssAddr),
    Extension::new("KVM_CAP_PIT2", Cap::Pit2),
    Extension::new("KVM_CAP_USER_MEMORY", Cap::UserMemory),
    Extension::new("KVM_CAP_IRQ_ROUTING", Cap::IrqRouting),
    Extension::new("KVM_CAP_IRQCHIP", Cap::Irqchip),
    Extension::new("KVM_CAP_HLT", Cap::Hlt),
    Extension::new("KVM_CAP_IRQ_INJECT_STATUS", Cap::IrqInjectStatus),
    Extension::new("KVM_CAP_EXT_CPUID", Cap::ExtCpuid),
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtensionError {
    /// `name` (at position `index` of the required list) is missing.
    #[error("Unsupported KVM extension detected: {name}")]
    Unsupported { name: &'static str, index: usize },
}

impl ExtensionError {
    /// Process exit status for this failure: the 1-based position of the
    /// missing extension, so the first entry never maps to success.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unsupported { index, .. } => i32::try_from(*index + 1).unwrap_or(i32::MAX),
        }
    }
}

/// Query every extension in `required` in order.
///
/// Stops at the first unsupported one; later entries are not queried.
pub fn check_extensions<H: Hypervisor>(
    hypervisor: &H,
    required: &[Extension],
) -> Result<(), ExtensionError> {
    for (index, ext) in required.iter().enumerate() {
        if !hypervisor.check_extension(ext.cap) {
            error!("Unsupported KVM extension detected: {}", ext.name);
            return Err(ExtensionError::Unsupported {
                name: ext.name,
                index,
            });
        }
    }
    debug!("All {} required extensions present", required.len());
    Ok(())
}
