//! Kestrel VMM: the core of a KVM-based virtual machine monitor.
//!
//! This crate creates a hardware-virtualized guest, lays out and
//! registers its physical memory, loads a kernel image, and coordinates
//! pausing the vCPU threads that run it.  Device emulation and the vCPU
//! run loop live outside this crate.
//!
//! # Architecture
//!
//! - [`vm`]: VM bring-up and teardown, configuration, memory dump
//! - [`backend`]: hypervisor traits and their KVM implementation
//! - [`extension`]: required hypervisor capabilities
//! - [`memory`]: guest RAM and the guest↔host bank table
//! - [`loader`]: bzImage / ELF / flat binary / firmware loading
//! - [`pause`]: pause/resume rendezvous with vCPU threads
//! - [`timer`]: host periodic timer
//! - [`rundir`]: run-state directory
//! - [`verified`]: pure layout and range arithmetic

pub mod backend;
pub mod extension;
pub mod loader;
pub mod memory;
pub mod pause;
pub mod rundir;
pub mod timer;
pub mod verified;
pub mod vm;
