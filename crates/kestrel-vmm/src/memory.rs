//! Guest memory for the Kestrel VMM.
//!
//! Two pieces live here:
//!
//! - [`GuestRam`] owns the `mmap`-backed guest RAM allocation and the
//!   boot-time writes into it (command line).
//! - [`MemoryRegionTable`] is the bank table: every guest-physical range
//!   the hypervisor knows about, the host-virtual range backing it, and
//!   the slot id it was installed under.  It answers guest→host and
//!   host→guest translation queries.
//!
//! # Guest Physical Memory Layout
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  Real-mode IVT / BDA       │
//! 0x0000_7000  ├───────────────────────────┤
//!              │  Zero page (boot_params)   │
//! 0x0001_0000  ├───────────────────────────┤
//!              │  Flat binary load address  │
//! 0x0002_0000  ├───────────────────────────┤
//!              │  Kernel command line       │
//! 0x000C_0000  ├───────────────────────────┤
//!              │  Firmware (ends at 1 MB)   │
//! 0x0010_0000  ├───────────────────────────┤  ← HIMEM_START (1 MB)
//!              │  Kernel image + initrd     │
//!              │  ...                       │
//! 0xD000_0000  ├───────────────────────────┤  ← GAP_32BIT_START
//!              │  PCI/MMIO hole (no RAM)    │
//! 0x1_0000_0000├───────────────────────────┤
//!              │  RAM above 4 GB (if any)   │
//!              └───────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use kestrel_vmm::backend::{Hypervisor, KvmHypervisor};
//! use kestrel_vmm::memory::{GuestRam, MemoryRegionTable};
//! use vm_memory::GuestAddress;
//!
//! let kvm = KvmHypervisor::open(Path::new("/dev/kvm")).unwrap();
//! let vm = kvm.create_vm().unwrap();
//! let ram = GuestRam::new(128 << 20).unwrap();
//! let mut banks = MemoryRegionTable::new();
//!
//! // SAFETY: no vCPU runs in this example.
//! unsafe { ram.register_banks(&vm, &mut banks) }.unwrap();
//! assert!(banks.translate_to_host(GuestAddress(0x1000)).is_some());
//! ```

use kvm_bindings::kvm_userspace_memory_region;
use log::{debug, info, warn};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::backend::{BackendError, VmBackend};
use crate::verified::memory as verified;

// ═══════════════════════════════════════════════════════════════════════
//  Memory layout constants
// ═══════════════════════════════════════════════════════════════════════

/// Start of high memory where protected-mode kernels are loaded (1 MB).
pub const HIMEM_START: u64 = 0x0010_0000;

/// Guest physical address of the Linux zero page (`boot_params`).
pub const ZERO_PAGE_START: u64 = 0x7000;

/// Guest physical address of the kernel command line.
pub const CMDLINE_START: u64 = 0x20000;

/// Maximum size of the kernel command line, NUL included.
pub const CMDLINE_MAX_SIZE: usize = 0x10000;

/// Real-mode segment at which flat binaries are loaded.
pub const FLAT_BINARY_SEGMENT: u16 = 0x1000;

/// Guest physical address of a flat binary (`0x1000:0x0000`).
pub const FLAT_BINARY_LOAD_ADDR: u64 = (FLAT_BINARY_SEGMENT as u64) << 4;

/// Size of the 32-bit PCI/MMIO hole.
pub const GAP_32BIT_SIZE: u64 = 768 << 20;

/// First address of the 32-bit PCI/MMIO hole; no RAM is mapped here.
pub const GAP_32BIT_START: u64 = (1 << 32) - GAP_32BIT_SIZE;

/// Firmware images end at this address (1 MB).
pub const FIRMWARE_END: u64 = HIMEM_START;

/// End of conventional low memory (below the EBDA).
pub const LOW_MEMORY_END: u64 = 0x9fc00;

/// E820 memory type: usable RAM.
pub const E820_RAM: u32 = 1;

/// Smallest guest RAM that leaves room for a kernel above 1 MB.
pub const MIN_RAM_SIZE: u64 = 2 << 20;

/// Guest page size; guest RAM is sized in whole pages.
pub const PAGE_SIZE: u64 = 0x1000;

const _: () = assert!(ZERO_PAGE_START < FLAT_BINARY_LOAD_ADDR);
const _: () = assert!(FLAT_BINARY_LOAD_ADDR < CMDLINE_START);
const _: () = assert!(CMDLINE_START + CMDLINE_MAX_SIZE as u64 <= LOW_MEMORY_END);
const _: () = assert!(LOW_MEMORY_END < HIMEM_START);

// ═══════════════════════════════════════════════════════════════════════
//  E820 memory map
// ═══════════════════════════════════════════════════════════════════════

/// One entry of the E820 map handed to the guest in `boot_params`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub type_: u32,
}

/// Build the E820 map for `ram_size` bytes of guest RAM.
///
/// Low memory below the EBDA, RAM from 1 MB up to the end of RAM (or
/// the 32-bit hole), and, for large guests, the RAM relocated above
/// 4 GB.  The legacy area `LOW_MEMORY_END..HIMEM_START` and the hole are
/// left out.
pub fn build_e820_map(ram_size: u64) -> Vec<E820Entry> {
    let mut map = vec![E820Entry {
        addr: 0,
        size: LOW_MEMORY_END,
        type_: E820_RAM,
    }];

    for (start, size) in verified::ram_ranges(ram_size) {
        let end = start + size;
        let start = start.max(HIMEM_START);
        if end > start {
            map.push(E820Entry {
                addr: start,
                size: end - start,
                type_: E820_RAM,
            });
        }
    }

    map
}

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors that can occur during guest memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The `vm-memory` crate failed to create the guest RAM mapping.
    #[error("Failed to create guest memory of {size} bytes")]
    Create { size: u64 },

    /// A write to guest physical memory failed.
    #[error("Failed to write to guest memory at {address:#x}")]
    Write { address: u64 },

    /// The kernel command line exceeds [`CMDLINE_MAX_SIZE`].
    #[error("Kernel command line too long: {len} bytes exceeds maximum of {CMDLINE_MAX_SIZE}")]
    CmdlineTooLong { len: usize },

    /// The host address backing a guest address could not be resolved.
    #[error("Failed to resolve host address for guest address {address:#x}")]
    HostAddress { address: u64 },

    /// A bank of zero bytes was offered to the table.
    #[error("Refusing to register empty memory bank at {guest_phys:#x}")]
    EmptyRegion { guest_phys: u64 },

    /// The new bank intersects an existing one in guest or host space.
    #[error(
        "Memory bank {guest_phys:#x}+{size:#x} (host {host_addr:#x}) overlaps slot {existing_slot}"
    )]
    Overlap {
        guest_phys: u64,
        size: u64,
        host_addr: u64,
        existing_slot: u32,
    },

    /// The hypervisor refused to install the region.
    #[error("Hypervisor rejected memory slot {slot}: {source}")]
    BackendRejected {
        slot: u32,
        #[source]
        source: BackendError,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  Bank table
// ═══════════════════════════════════════════════════════════════════════

/// One guest-physical range and the host memory backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBank {
    pub guest_phys_addr: GuestAddress,
    pub host_addr: u64,
    pub size: u64,
    pub slot: u32,
}

impl MemoryBank {
    pub fn contains_guest(&self, addr: GuestAddress) -> bool {
        verified::range_contains(self.guest_phys_addr.0, self.size, addr.0)
    }

    pub fn contains_host(&self, addr: u64) -> bool {
        verified::range_contains(self.host_addr, self.size, addr)
    }

    fn overlaps(&self, guest_phys: u64, host_addr: u64, size: u64) -> bool {
        verified::ranges_overlap(self.guest_phys_addr.0, self.size, guest_phys, size)
            || verified::ranges_overlap(self.host_addr, self.size, host_addr, size)
    }
}

/// Table of installed memory banks.
///
/// Banks are appended during VM setup and released all at once by
/// [`teardown_all`](Self::teardown_all).  Slot ids are handed out in
/// strictly increasing order starting at 0 and are never reused, even
/// when an install fails.
#[derive(Debug, Default)]
pub struct MemoryRegionTable {
    banks: Vec<MemoryBank>,
    next_slot: u32,
}

impl MemoryRegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `size` bytes of host memory at `host_addr` as guest
    /// physical memory at `guest_phys`, returning the slot id used.
    ///
    /// The new range must not intersect any existing bank in guest or
    /// host space.  If the hypervisor rejects the install the table is
    /// left unchanged apart from the consumed slot id.
    ///
    /// # Safety
    ///
    /// `host_addr .. host_addr + size` must be a live host mapping that
    /// stays valid for as long as `vm` can access the slot.
    pub unsafe fn register<V: VmBackend + ?Sized>(
        &mut self,
        vm: &V,
        guest_phys: GuestAddress,
        size: u64,
        host_addr: u64,
    ) -> Result<u32, MemoryError> {
        if size == 0 {
            return Err(MemoryError::EmptyRegion {
                guest_phys: guest_phys.0,
            });
        }

        if let Some(bank) = self
            .banks
            .iter()
            .find(|b| b.overlaps(guest_phys.0, host_addr, size))
        {
            return Err(MemoryError::Overlap {
                guest_phys: guest_phys.0,
                size,
                host_addr,
                existing_slot: bank.slot,
            });
        }

        let slot = self.next_slot;
        self.next_slot += 1;

        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_phys.0,
            memory_size: size,
            userspace_addr: host_addr,
        };

        // SAFETY: the caller guarantees the host range outlives the slot;
        // disjointness from other banks was checked above.
        unsafe { vm.install_memory_region(region) }
            .map_err(|source| MemoryError::BackendRejected { slot, source })?;

        self.banks.push(MemoryBank {
            guest_phys_addr: guest_phys,
            host_addr,
            size,
            slot,
        });

        debug!(
            "Slot {}: guest {:#x}+{:#x} -> host {:#x}",
            slot, guest_phys.0, size, host_addr
        );
        Ok(slot)
    }

    /// Host address backing guest physical address `guest`.
    pub fn translate_to_host(&self, guest: GuestAddress) -> Option<u64> {
        let found = self.banks.iter().find_map(|b| {
            verified::translate(b.guest_phys_addr.0, b.host_addr, b.size, guest.0)
        });
        if found.is_none() {
            warn!("Guest address {:#x} is not in any memory bank", guest.0);
        }
        found
    }

    /// Guest physical address mapped at host address `host`.
    pub fn translate_to_guest(&self, host: u64) -> Option<GuestAddress> {
        let found = self
            .banks
            .iter()
            .find_map(|b| verified::translate(b.host_addr, b.guest_phys_addr.0, b.size, host))
            .map(GuestAddress);
        if found.is_none() {
            warn!("Host address {:#x} is not in any memory bank", host);
        }
        found
    }

    /// Whether `host` lies inside some bank.  Silent on a miss.
    pub fn host_ptr_in_ram(&self, host: u64) -> bool {
        self.banks.iter().any(|b| b.contains_host(host))
    }

    pub fn banks(&self) -> &[MemoryBank] {
        &self.banks
    }

    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    /// Uninstall every bank from `vm` and empty the table.  The slot
    /// counter keeps its value.
    ///
    /// A slot the backend refuses to remove is logged and dropped from
    /// the table anyway; closing the VM handle releases it.
    pub fn teardown_all<V: VmBackend + ?Sized>(&mut self, vm: &V) {
        let released = self.banks.len();
        for bank in self.banks.drain(..) {
            if let Err(e) = vm.remove_memory_region(bank.slot) {
                warn!("Failed to remove memory slot {}: {}", bank.slot, e);
            }
        }
        debug!("Released {} memory banks", released);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestRam
// ═══════════════════════════════════════════════════════════════════════

/// Guest RAM backed by anonymous `mmap` regions.
///
/// RAM that would reach into the 32-bit PCI hole is split: the part
/// below [`GAP_32BIT_START`] stays put and the rest starts at 4 GB.
/// Each resulting range becomes one bank when registered.
pub struct GuestRam {
    memory: GuestMemoryMmap,
    size: u64,
}

impl GuestRam {
    /// Allocate `size` bytes of zeroed guest RAM.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Create`] if the host cannot provide the
    /// mapping.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let ranges: Vec<(GuestAddress, usize)> = verified::ram_ranges(size)
            .into_iter()
            .map(|(start, len)| (GuestAddress(start), len as usize))
            .collect();
        let memory =
            GuestMemoryMmap::from_ranges(&ranges).map_err(|_| MemoryError::Create { size })?;

        info!(
            "Guest RAM created: {} MB in {} range(s)",
            size >> 20,
            ranges.len()
        );

        Ok(Self { memory, size })
    }

    /// Register every RAM range with `vm` as a bank in `table`.
    ///
    /// # Safety
    ///
    /// No vCPU of `vm` may run once this allocation is dropped.  The banks
    /// may be uninstalled afterwards with
    /// [`MemoryRegionTable::teardown_all`] or by closing `vm`.
    pub unsafe fn register_banks<V: VmBackend + ?Sized>(
        &self,
        vm: &V,
        table: &mut MemoryRegionTable,
    ) -> Result<(), MemoryError> {
        for (start, len) in verified::ram_ranges(self.size) {
            let host = self
                .memory
                .get_host_address(GuestAddress(start))
                .map_err(|_| MemoryError::HostAddress { address: start })?
                as u64;
            // SAFETY: `host` is the start of a `len`-byte mapping owned by
            // `self`; the caller guarantees it outlives `vm`'s use.
            unsafe { table.register(vm, GuestAddress(start), len, host)? };
        }
        Ok(())
    }

    /// Write the kernel command line at [`CMDLINE_START`], appending a
    /// NUL terminator if `cmdline` lacks one.  Returns the length written,
    /// terminator included.
    pub fn write_cmdline(&self, cmdline: &[u8]) -> Result<usize, MemoryError> {
        let needs_nul = cmdline.last() != Some(&0);
        let total_len = cmdline.len() + usize::from(needs_nul);

        if total_len > CMDLINE_MAX_SIZE {
            return Err(MemoryError::CmdlineTooLong { len: total_len });
        }

        self.memory
            .write_slice(cmdline, GuestAddress(CMDLINE_START))
            .map_err(|_| MemoryError::Write {
                address: CMDLINE_START,
            })?;

        if needs_nul {
            let nul_addr = CMDLINE_START + cmdline.len() as u64;
            self.memory
                .write_obj(0u8, GuestAddress(nul_addr))
                .map_err(|_| MemoryError::Write { address: nul_addr })?;
        }

        debug!(
            "Command line written at {:#x} ({} bytes)",
            CMDLINE_START, total_len
        );
        Ok(total_len)
    }

    /// The underlying `vm-memory` object, for `linux-loader` and reads.
    #[inline]
    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Total RAM in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
