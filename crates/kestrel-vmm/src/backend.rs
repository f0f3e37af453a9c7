//! Virtualization backend abstraction.
//!
//! The VMM core talks to the hypervisor through two small traits:
//!
//! - [`Hypervisor`]: the system-level handle (`/dev/kvm`): API version,
//!   capability queries, vCPU limits, and VM creation.
//! - [`VmBackend`]: the VM-level handle: memory-region installation and
//!   architecture-specific VM setup.
//!
//! [`KvmHypervisor`] and [`KvmVm`] implement them over `kvm-ioctls`.
//! Tests substitute in-memory fakes so that lifecycle and bank-table
//! logic can be exercised without `/dev/kvm`.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, KVM_PIT_SPEAKER_DUMMY};
use kvm_ioctls::{Cap, Kvm, VmFd};
use log::debug;

/// Error type returned by backend operations (an `errno` wrapper).
pub type BackendError = kvm_ioctls::Error;

/// TSS region KVM needs on Intel hosts: three pages at the top of the
/// 32-bit address space, inside the PCI gap.
const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

/// System-level virtualization handle.
pub trait Hypervisor: Sized {
    /// VM-level handle created by [`create_vm`](Self::create_vm).
    type Vm: VmBackend;

    /// Whether the host CPU advertises hardware virtualization.
    fn cpu_supports_vm() -> bool;

    /// Open the system device node at `device`.
    fn open(device: &Path) -> Result<Self, BackendError>;

    /// Version reported by the backend's API-version query.
    fn api_version(&self) -> i32;

    /// Whether the backend supports `cap`.
    fn check_extension(&self, cap: Cap) -> bool;

    /// Recommended number of vCPUs for a VM.
    fn recommended_vcpus(&self) -> usize;

    /// Hard upper bound on vCPUs per VM.
    fn max_vcpus(&self) -> usize;

    /// Create a new VM-level handle.
    fn create_vm(&self) -> Result<Self::Vm, BackendError>;
}

/// VM-level virtualization handle.
pub trait VmBackend {
    /// Install (or replace) a guest memory slot.
    ///
    /// # Safety
    ///
    /// `region.userspace_addr .. + region.memory_size` must be a valid
    /// host mapping for as long as the guest can access the slot, and
    /// must not overlap another installed slot.
    unsafe fn install_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), BackendError>;

    /// Uninstall guest memory slot `slot`.  The guest loses access to
    /// the slot's host range.
    fn remove_memory_region(&self, slot: u32) -> Result<(), BackendError>;

    /// Architecture-specific VM setup run once before guest RAM is
    /// registered.
    fn arch_init(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  KVM implementation
// ═══════════════════════════════════════════════════════════════════════

/// `/dev/kvm` system handle.  The descriptor is closed on drop.
pub struct KvmHypervisor {
    kvm: Kvm,
}

impl Hypervisor for KvmHypervisor {
    type Vm = KvmVm;

    fn cpu_supports_vm() -> bool {
        host_cpu_supports_vm()
    }

    fn open(device: &Path) -> Result<Self, BackendError> {
        let path = CString::new(device.as_os_str().as_bytes())
            .map_err(|_| BackendError::new(libc::EINVAL))?;
        let kvm = Kvm::new_with_path(path.as_c_str())?;
        debug!("Opened {}", device.display());
        Ok(Self { kvm })
    }

    fn api_version(&self) -> i32 {
        self.kvm.get_api_version()
    }

    fn check_extension(&self, cap: Cap) -> bool {
        self.kvm.check_extension(cap)
    }

    fn recommended_vcpus(&self) -> usize {
        // kvm-ioctls already falls back to 4 when KVM_CAP_NR_VCPUS is absent.
        self.kvm.get_nr_vcpus()
    }

    fn max_vcpus(&self) -> usize {
        self.kvm.get_max_vcpus()
    }

    fn create_vm(&self) -> Result<KvmVm, BackendError> {
        let fd = self.kvm.create_vm()?;
        Ok(KvmVm { fd })
    }
}

/// KVM VM handle.  The descriptor is closed on drop.
pub struct KvmVm {
    fd: VmFd,
}

impl KvmVm {
    /// The raw `kvm-ioctls` handle, for collaborators that create vCPUs
    /// or devices.
    pub fn fd(&self) -> &VmFd {
        &self.fd
    }
}

impl VmBackend for KvmVm {
    unsafe fn install_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), BackendError> {
        // SAFETY: forwarded from the caller's contract.
        unsafe { self.fd.set_user_memory_region(region) }
    }

    fn remove_memory_region(&self, slot: u32) -> Result<(), BackendError> {
        let region = kvm_userspace_memory_region {
            slot,
            memory_size: 0,
            ..Default::default()
        };
        // SAFETY: a zero-sized region deletes the slot and maps no host
        // memory.
        unsafe { self.fd.set_user_memory_region(region) }
    }

    fn arch_init(&self) -> Result<(), BackendError> {
        // TSS address MUST be set before create_irq_chip on x86_64.
        self.fd.set_tss_address(KVM_TSS_ADDRESS)?;

        // In-kernel PIC, IOAPIC and LAPIC; must precede vCPU creation.
        self.fd.create_irq_chip()?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        self.fd.create_pit2(pit_config)?;

        debug!("x86 VM init: TSS at {:#x}, irqchip, PIT2", KVM_TSS_ADDRESS);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Host CPU probe
// ═══════════════════════════════════════════════════════════════════════

/// CPUID leaf 0x1, ECX bit 5: Intel VMX.
const CPUID_1_ECX_VMX: u32 = 1 << 5;

/// CPUID leaf 0x80000001, ECX bit 2: AMD SVM.
const CPUID_EXT_ECX_SVM: u32 = 1 << 2;

/// CPUID leaf 0x80000000: highest extended leaf.
const CPUID_LEAF_EXT_MAX: u32 = 0x8000_0000;

/// CPUID leaf 0x80000001: extended processor info.
const CPUID_LEAF_EXT_FEATURES: u32 = 0x8000_0001;

/// Returns `true` if the host CPU advertises VMX or SVM.
#[cfg(target_arch = "x86_64")]
pub fn host_cpu_supports_vm() -> bool {
    use std::arch::x86_64::__cpuid;

    // SAFETY: CPUID is available on every x86_64 CPU.
    let features = unsafe { __cpuid(1) };
    if features.ecx & CPUID_1_ECX_VMX != 0 {
        return true;
    }

    // SAFETY: as above.
    let ext_max = unsafe { __cpuid(CPUID_LEAF_EXT_MAX) }.eax;
    if ext_max < CPUID_LEAF_EXT_FEATURES {
        return false;
    }

    // SAFETY: as above; leaf checked against the extended maximum.
    let ext = unsafe { __cpuid(CPUID_LEAF_EXT_FEATURES) };
    ext.ecx & CPUID_EXT_ECX_SVM != 0
}

/// Non-x86 hosts have no CPUID probe; the device open decides.
#[cfg(not(target_arch = "x86_64"))]
pub fn host_cpu_supports_vm() -> bool {
    true
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory backend used by unit tests across the crate.

    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    /// Knobs controlling how [`FakeHypervisor`] behaves.
    #[derive(Debug, Clone)]
    pub struct FakeBehavior {
        pub cpu_supports_vm: bool,
        pub open_errno: Option<i32>,
        pub api_version: i32,
        pub missing_cap: Option<Cap>,
        pub create_vm_errno: Option<i32>,
        pub max_vcpus: usize,
        /// Fail the install of this slot id with `EEXIST`.
        pub reject_slot: Option<u32>,
    }

    impl Default for FakeBehavior {
        fn default() -> Self {
            Self {
                cpu_supports_vm: true,
                open_errno: None,
                api_version: kvm_bindings::KVM_API_VERSION as i32,
                missing_cap: None,
                create_vm_errno: None,
                max_vcpus: 8,
                reject_slot: None,
            }
        }
    }

    thread_local! {
        static BEHAVIOR: RefCell<FakeBehavior> = RefCell::new(FakeBehavior::default());
    }

    /// Set the behavior for fakes created on this thread.
    pub fn set_behavior(behavior: FakeBehavior) {
        BEHAVIOR.with(|b| *b.borrow_mut() = behavior);
    }

    fn behavior() -> FakeBehavior {
        BEHAVIOR.with(|b| b.borrow().clone())
    }

    pub struct FakeHypervisor {
        pub device: PathBuf,
        behavior: FakeBehavior,
    }

    impl Hypervisor for FakeHypervisor {
        type Vm = FakeVm;

        fn cpu_supports_vm() -> bool {
            behavior().cpu_supports_vm
        }

        fn open(device: &Path) -> Result<Self, BackendError> {
            let behavior = behavior();
            if let Some(errno) = behavior.open_errno {
                return Err(BackendError::new(errno));
            }
            Ok(Self {
                device: device.to_path_buf(),
                behavior,
            })
        }

        fn api_version(&self) -> i32 {
            self.behavior.api_version
        }

        fn check_extension(&self, cap: Cap) -> bool {
            self.behavior.missing_cap != Some(cap)
        }

        fn recommended_vcpus(&self) -> usize {
            4
        }

        fn max_vcpus(&self) -> usize {
            self.behavior.max_vcpus
        }

        fn create_vm(&self) -> Result<FakeVm, BackendError> {
            if let Some(errno) = self.behavior.create_vm_errno {
                return Err(BackendError::new(errno));
            }
            Ok(FakeVm {
                reject_slot: self.behavior.reject_slot,
                ..Default::default()
            })
        }
    }

    /// Records every installed region and every removed slot.
    #[derive(Default)]
    pub struct FakeVm {
        pub installed: RefCell<Vec<kvm_userspace_memory_region>>,
        pub removed: RefCell<Vec<u32>>,
        pub reject_slot: Option<u32>,
    }

    impl VmBackend for FakeVm {
        unsafe fn install_memory_region(
            &self,
            region: kvm_userspace_memory_region,
        ) -> Result<(), BackendError> {
            if self.reject_slot == Some(region.slot) {
                return Err(BackendError::new(libc::EEXIST));
            }
            self.installed.borrow_mut().push(region);
            Ok(())
        }

        fn remove_memory_region(&self, slot: u32) -> Result<(), BackendError> {
            let mut installed = self.installed.borrow_mut();
            let before = installed.len();
            installed.retain(|r| r.slot != slot);
            if installed.len() == before {
                return Err(BackendError::new(libc::EINVAL));
            }
            self.removed.borrow_mut().push(slot);
            Ok(())
        }
    }
}
