//! VM lifecycle: bring-up, inspection, and teardown.
//!
//! [`Vm::init`] walks the bring-up sequence in order and stops at the
//! first failure:
//!
//! 1. host CPU supports hardware virtualization
//! 2. open the system device (`/dev/kvm`)
//! 3. API version is exactly [`KVM_API_VERSION`]
//! 4. requested vCPU count is within the backend maximum
//! 5. create the VM handle
//! 6. every required extension is present
//! 7. architecture init (TSS, irqchip, PIT)
//! 8. allocate guest RAM and register one bank per RAM range
//! 9. load firmware, or the kernel (+ initrd, command line)
//!
//! Resources acquired before a failing step are released in reverse
//! order as the locals holding them go out of scope.  [`Vm::exit`]
//! consumes the VM: it stops the periodic timer started by
//! [`Vm::start_timer`], then releases guest RAM, the bank table, the VM
//! handle and the system handle, in that order.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use kvm_bindings::{
    KVM_API_VERSION, KVM_EXIT_DCR, KVM_EXIT_DEBUG, KVM_EXIT_EPR, KVM_EXIT_EXCEPTION,
    KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_HYPERCALL, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_INTR,
    KVM_EXIT_IO, KVM_EXIT_IRQ_WINDOW_OPEN, KVM_EXIT_MMIO, KVM_EXIT_NMI, KVM_EXIT_OSI,
    KVM_EXIT_PAPR_HCALL, KVM_EXIT_S390_RESET, KVM_EXIT_S390_SIEIC, KVM_EXIT_S390_TSCH,
    KVM_EXIT_S390_UCONTROL, KVM_EXIT_SET_TPR, KVM_EXIT_SHUTDOWN, KVM_EXIT_SYSTEM_EVENT,
    KVM_EXIT_TPR_ACCESS, KVM_EXIT_UNKNOWN, KVM_EXIT_WATCHDOG,
};
use log::info;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress};

use crate::backend::{BackendError, Hypervisor, KvmHypervisor, VmBackend};
use crate::extension::{check_extensions, ExtensionError, X86_REQUIRED_EXTENSIONS};
use crate::loader::{load_firmware, KernelLoader, LoadedKernel, LoaderError};
use crate::memory::{
    GuestRam, MemoryError, MemoryRegionTable, CMDLINE_MAX_SIZE, MIN_RAM_SIZE, PAGE_SIZE,
};
use crate::pause::PauseCoordinator;
use crate::rundir::{RunDir, RunDirError};
use crate::timer::{PeriodicTimer, TimerError};

/// Default system device node.
pub const DEFAULT_DEVICE: &str = "/dev/kvm";

/// Default guest RAM size (64 MB).
pub const DEFAULT_RAM_SIZE: u64 = 64 << 20;

/// Default kernel command line.
pub const DEFAULT_CMDLINE: &str = "console=ttyS0";

#[derive(Error, Debug)]
pub enum VmError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Your CPU does not support hardware virtualization")]
    VirtualizationUnsupported,

    #[error(
        "Failed to open {}: {source}{}",
        .path.display(),
        .hint.map(|h| format!("\n  {h}")).unwrap_or_default()
    )]
    DeviceOpen {
        path: PathBuf,
        hint: Option<&'static str>,
        #[source]
        source: BackendError,
    },

    #[error("KVM API version mismatch: found {found}, expected {expected}")]
    ApiVersion { found: i32, expected: i32 },

    #[error("Requested {requested} vCPUs but the host allows at most {max}")]
    TooManyVcpus { requested: usize, max: usize },

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] BackendError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("Architecture VM init failed: {0}")]
    ArchInit(#[source] BackendError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    RunDir(#[from] RunDirError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

impl VmError {
    /// Process exit status for a fatal bring-up failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Extension(e) => e.exit_code(),
            _ => 1,
        }
    }
}

/// Explanation printed alongside common device-open failures.
fn open_hint(errno: i32) -> Option<&'static str> {
    match errno {
        libc::ENOENT => Some(
            "Please make sure your kernel has CONFIG_KVM enabled and that the KVM modules are loaded.",
        ),
        libc::ENODEV => Some(
            "KVM driver not available. If the KVM module is loaded then 'dmesg' may offer further clues about the failure.",
        ),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Immutable VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub device: PathBuf,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    /// Takes priority over `kernel` when set.
    pub firmware: Option<PathBuf>,
    pub ram_size: u64,
    pub vcpus: usize,
    pub cmdline: String,
    pub run_dir: Option<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            kernel: None,
            initrd: None,
            firmware: None,
            ram_size: DEFAULT_RAM_SIZE,
            vcpus: 1,
            cmdline: DEFAULT_CMDLINE.to_string(),
            run_dir: None,
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> Result<(), VmError> {
        if self.kernel.is_none() && self.firmware.is_none() {
            return Err(VmError::InvalidConfig("no kernel or firmware image given"));
        }
        if self.ram_size < MIN_RAM_SIZE {
            return Err(VmError::InvalidConfig("guest RAM must be at least 2 MB"));
        }
        if self.ram_size % PAGE_SIZE != 0 {
            return Err(VmError::InvalidConfig("guest RAM must be a whole number of pages"));
        }
        if self.vcpus == 0 {
            return Err(VmError::InvalidConfig("at least one vCPU is required"));
        }
        if self.cmdline.len() >= CMDLINE_MAX_SIZE {
            return Err(VmError::InvalidConfig("kernel command line too long"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Vm
// ═══════════════════════════════════════════════════════════════════════

/// What was placed in guest memory at boot.
#[derive(Debug, Clone, Copy)]
pub enum BootImage {
    Firmware(GuestAddress),
    Kernel(LoadedKernel),
}

/// A created VM with RAM registered and a boot image loaded.
pub struct Vm<H: Hypervisor = KvmHypervisor> {
    // Field order is drop order: timer, RAM, banks, pause coordinator,
    // VM handle, system handle.
    timer: Option<PeriodicTimer<PauseCoordinator>>,
    ram: GuestRam,
    banks: MemoryRegionTable,
    pause: Arc<PauseCoordinator>,
    vm: H::Vm,
    system: H,
    boot: BootImage,
    run_dir: Option<RunDir>,
    config: VmConfig,
}

impl<H: Hypervisor> Vm<H> {
    pub fn init(config: VmConfig) -> Result<Self, VmError> {
        config.validate()?;

        let run_dir = config.run_dir.as_ref().map(RunDir::create).transpose()?;

        if !H::cpu_supports_vm() {
            return Err(VmError::VirtualizationUnsupported);
        }

        let system = H::open(&config.device).map_err(|source| VmError::DeviceOpen {
            path: config.device.clone(),
            hint: open_hint(source.errno()),
            source,
        })?;

        let expected = KVM_API_VERSION as i32;
        let found = system.api_version();
        if found != expected {
            return Err(VmError::ApiVersion { found, expected });
        }

        let max = system.max_vcpus();
        if config.vcpus > max {
            return Err(VmError::TooManyVcpus {
                requested: config.vcpus,
                max,
            });
        }

        let vm = system.create_vm().map_err(VmError::VmCreate)?;

        check_extensions(&system, X86_REQUIRED_EXTENSIONS)?;

        vm.arch_init().map_err(VmError::ArchInit)?;

        let ram = GuestRam::new(config.ram_size)?;
        let mut banks = MemoryRegionTable::new();
        // SAFETY: this crate runs no vCPU; whoever does must stop them
        // before `exit` (or drop) releases `ram`.
        unsafe { ram.register_banks(&vm, &mut banks)? };

        let boot = match (&config.firmware, &config.kernel) {
            (Some(firmware), _) => BootImage::Firmware(load_firmware(&ram, firmware)?),
            (None, Some(kernel)) => BootImage::Kernel(KernelLoader::default().load(
                &ram,
                kernel,
                config.initrd.as_deref(),
                &config.cmdline,
            )?),
            (None, None) => return Err(VmError::InvalidConfig("no kernel or firmware image given")),
        };

        info!(
            "VM ready: {} MB RAM in {} bank(s), {} vCPU(s)",
            config.ram_size >> 20,
            banks.len(),
            config.vcpus
        );

        Ok(Self {
            timer: None,
            ram,
            banks,
            pause: Arc::new(PauseCoordinator::new()),
            vm,
            system,
            boot,
            run_dir,
            config,
        })
    }

    /// Stop the periodic timer, release guest RAM, uninstall every bank,
    /// then close the VM and system handles.
    pub fn exit(self) {
        let Self {
            timer,
            ram,
            mut banks,
            pause,
            vm,
            system,
            ..
        } = self;

        if let Some(timer) = timer {
            timer.stop();
        }
        drop(ram);
        banks.teardown_all(&vm);
        drop(pause);
        drop(vm);
        drop(system);
        info!("VM torn down");
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn ram(&self) -> &GuestRam {
        &self.ram
    }

    pub fn banks(&self) -> &MemoryRegionTable {
        &self.banks
    }

    pub fn backend(&self) -> &H::Vm {
        &self.vm
    }

    pub fn boot_image(&self) -> &BootImage {
        &self.boot
    }

    pub fn run_dir(&self) -> Option<&RunDir> {
        self.run_dir.as_ref()
    }

    /// Shared with vCPU threads so they can acknowledge pauses.
    pub fn pause_coordinator(&self) -> &Arc<PauseCoordinator> {
        &self.pause
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    /// Arm the 1 ms periodic timer on the calling thread, targeting this
    /// VM's pause coordinator.  A no-op if it is already running.
    ///
    /// A `SIGALRM` handler must be installed first; see [`crate::timer`].
    pub fn start_timer(&mut self) -> Result<(), VmError> {
        if self.timer.is_none() {
            self.timer = Some(PeriodicTimer::start(Arc::clone(&self.pause))?);
        }
        Ok(())
    }

    /// Disarm the periodic timer, if running.
    pub fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
    }

    pub fn timer(&self) -> Option<&PeriodicTimer<PauseCoordinator>> {
        self.timer.as_ref()
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    /// vCPU count the backend recommends for one VM.
    pub fn recommended_vcpus(&self) -> usize {
        self.system.recommended_vcpus()
    }

    pub fn max_vcpus(&self) -> usize {
        self.system.max_vcpus()
    }

    /// Hex dump of guest memory, eight bytes per row.
    ///
    /// `size` is rounded down to a multiple of eight.  Rows outside guest
    /// RAM are printed as `<unknown>`.
    pub fn dump_mem<W: Write>(&self, addr: u64, size: u64, out: &mut W) -> io::Result<()> {
        let size = size & !7;
        for offset in (0..size).step_by(8) {
            let row = addr.wrapping_add(offset);
            let mut bytes = [0u8; 8];
            if self.ram.memory().read_slice(&mut bytes, GuestAddress(row)).is_err() {
                writeln!(out, " 0x{row:08x}: <unknown>")?;
                continue;
            }
            let [b0, b1, b2, b3, b4, b5, b6, b7] = bytes;
            writeln!(
                out,
                " 0x{row:08x}: {b0:02x} {b1:02x} {b2:02x} {b3:02x}  {b4:02x} {b5:02x} {b6:02x} {b7:02x}"
            )?;
        }
        Ok(())
    }
}

/// Human-readable name for a `KVM_EXIT_*` reason code.
pub fn exit_reason_name(code: u32) -> &'static str {
    match code {
        KVM_EXIT_UNKNOWN => "KVM_EXIT_UNKNOWN",
        KVM_EXIT_EXCEPTION => "KVM_EXIT_EXCEPTION",
        KVM_EXIT_IO => "KVM_EXIT_IO",
        KVM_EXIT_HYPERCALL => "KVM_EXIT_HYPERCALL",
        KVM_EXIT_DEBUG => "KVM_EXIT_DEBUG",
        KVM_EXIT_HLT => "KVM_EXIT_HLT",
        KVM_EXIT_MMIO => "KVM_EXIT_MMIO",
        KVM_EXIT_IRQ_WINDOW_OPEN => "KVM_EXIT_IRQ_WINDOW_OPEN",
        KVM_EXIT_SHUTDOWN => "KVM_EXIT_SHUTDOWN",
        KVM_EXIT_FAIL_ENTRY => "KVM_EXIT_FAIL_ENTRY",
        KVM_EXIT_INTR => "KVM_EXIT_INTR",
        KVM_EXIT_SET_TPR => "KVM_EXIT_SET_TPR",
        KVM_EXIT_TPR_ACCESS => "KVM_EXIT_TPR_ACCESS",
        KVM_EXIT_S390_SIEIC => "KVM_EXIT_S390_SIEIC",
        KVM_EXIT_S390_RESET => "KVM_EXIT_S390_RESET",
        KVM_EXIT_DCR => "KVM_EXIT_DCR",
        KVM_EXIT_NMI => "KVM_EXIT_NMI",
        KVM_EXIT_INTERNAL_ERROR => "KVM_EXIT_INTERNAL_ERROR",
        KVM_EXIT_OSI => "KVM_EXIT_OSI",
        KVM_EXIT_PAPR_HCALL => "KVM_EXIT_PAPR_HCALL",
        KVM_EXIT_S390_UCONTROL => "KVM_EXIT_S390_UCONTROL",
        KVM_EXIT_WATCHDOG => "KVM_EXIT_WATCHDOG",
        KVM_EXIT_S390_TSCH => "KVM_EXIT_S390_TSCH",
        KVM_EXIT_EPR => "KVM_EXIT_EPR",
        KVM_EXIT_SYSTEM_EVENT => "KVM_EXIT_SYSTEM_EVENT",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{set_behavior, FakeBehavior, FakeHypervisor};
    use crate::loader::ImageFormat;
    use crate::timer::test_support::{install_tick_handler, ticks};
    use kvm_ioctls::Cap;
    use std::io::Write as _;
    use std::time::{Duration, Instant};
    use tempfile::NamedTempFile;

    fn flat_kernel() -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&[0xf4, 0xeb, 0xfe]).unwrap();
        f.flush().unwrap();
        f
    }

    fn config_for(kernel: &NamedTempFile) -> VmConfig {
        VmConfig {
            kernel: Some(kernel.path().to_path_buf()),
            ram_size: 4 << 20,
            ..Default::default()
        }
    }

    fn init_with(behavior: FakeBehavior, config: VmConfig) -> Result<Vm<FakeHypervisor>, VmError> {
        set_behavior(behavior);
        Vm::<FakeHypervisor>::init(config)
    }

    // ─── config ──────────────────────────────────────────────────

    #[test]
    fn default_config() {
        let c = VmConfig::default();
        assert_eq!(c.device, PathBuf::from("/dev/kvm"));
        assert_eq!(c.ram_size, 64 << 20);
        assert_eq!(c.vcpus, 1);
        assert!(matches!(c.validate(), Err(VmError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_zero_vcpus_and_tiny_ram() {
        let kernel = flat_kernel();
        let mut c = config_for(&kernel);
        assert!(c.validate().is_ok());
        c.vcpus = 0;
        assert!(c.validate().is_err());
        c.vcpus = 1;
        c.ram_size = 1 << 20;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_partial_page_ram() {
        let kernel = flat_kernel();
        let mut c = config_for(&kernel);
        c.ram_size = (4 << 20) + 0x800;
        assert!(matches!(c.validate(), Err(VmError::InvalidConfig(_))));

        set_behavior(FakeBehavior::default());
        let err = match Vm::<FakeHypervisor>::init(c) {
            Ok(_) => panic!("unaligned RAM must not reach the backend"),
            Err(e) => e,
        };
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }

    // ─── init ────────────────────────────────────────────────────

    #[test]
    fn init_registers_ram_and_loads_kernel() {
        let kernel = flat_kernel();
        let vm = init_with(FakeBehavior::default(), config_for(&kernel)).unwrap();

        assert_eq!(vm.banks().len(), 1);
        let installed = vm.backend().installed.borrow().clone();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].slot, 0);
        assert_eq!(installed[0].memory_size, 4 << 20);

        match vm.boot_image() {
            BootImage::Kernel(k) => assert_eq!(k.image.format, ImageFormat::Flat),
            other => panic!("unexpected boot image {other:?}"),
        }
        assert_eq!(vm.recommended_vcpus(), 4);
        assert_eq!(vm.max_vcpus(), 8);
        vm.exit();
    }

    #[test]
    fn no_virtualization_support() {
        let kernel = flat_kernel();
        let err = init_with(
            FakeBehavior {
                cpu_supports_vm: false,
                ..Default::default()
            },
            config_for(&kernel),
        )
        .err()
        .unwrap();
        assert!(matches!(err, VmError::VirtualizationUnsupported));
    }

    #[test]
    fn missing_device_has_hint() {
        let kernel = flat_kernel();
        let err = init_with(
            FakeBehavior {
                open_errno: Some(libc::ENOENT),
                ..Default::default()
            },
            config_for(&kernel),
        )
        .err()
        .unwrap();
        match &err {
            VmError::DeviceOpen { hint, .. } => assert!(hint.is_some()),
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().contains("CONFIG_KVM"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn api_version_must_match_exactly() {
        let kernel = flat_kernel();
        let err = init_with(
            FakeBehavior {
                api_version: 11,
                ..Default::default()
            },
            config_for(&kernel),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            VmError::ApiVersion { found: 11, expected: 12 }
        ));
    }

    #[test]
    fn too_many_vcpus() {
        let kernel = flat_kernel();
        let mut config = config_for(&kernel);
        config.vcpus = 9;
        let err = init_with(FakeBehavior::default(), config).err().unwrap();
        assert!(matches!(
            err,
            VmError::TooManyVcpus { requested: 9, max: 8 }
        ));
    }

    #[test]
    fn vm_create_failure() {
        let kernel = flat_kernel();
        let err = init_with(
            FakeBehavior {
                create_vm_errno: Some(libc::ENOMEM),
                ..Default::default()
            },
            config_for(&kernel),
        )
        .err()
        .unwrap();
        assert!(matches!(err, VmError::VmCreate(e) if e.errno() == libc::ENOMEM));
    }

    #[test]
    fn missing_extension_stops_init() {
        let kernel = flat_kernel();
        let err = init_with(
            FakeBehavior {
                missing_cap: Some(Cap::Pit2),
                ..Default::default()
            },
            config_for(&kernel),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            VmError::Extension(ExtensionError::Unsupported {
                name: "KVM_CAP_PIT2",
                index: 2
            })
        ));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn rejected_ram_slot_fails_init() {
        let kernel = flat_kernel();
        let err = init_with(
            FakeBehavior {
                reject_slot: Some(0),
                ..Default::default()
            },
            config_for(&kernel),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            VmError::Memory(MemoryError::BackendRejected { slot: 0, .. })
        ));
    }

    #[test]
    fn empty_kernel_is_unrecognized() {
        let kernel = NamedTempFile::new().unwrap();
        let err = init_with(FakeBehavior::default(), config_for(&kernel))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            VmError::Loader(LoaderError::UnrecognizedKernel { .. })
        ));
    }

    #[test]
    fn firmware_takes_priority_over_kernel() {
        let kernel = flat_kernel();
        let mut fw = NamedTempFile::new().unwrap();
        fw.write_all(&[0x90; 0x1000]).unwrap();
        fw.flush().unwrap();

        let mut config = config_for(&kernel);
        config.firmware = Some(fw.path().to_path_buf());
        let vm = init_with(FakeBehavior::default(), config).unwrap();
        assert!(matches!(
            vm.boot_image(),
            BootImage::Firmware(GuestAddress(0xF_F000))
        ));
        vm.exit();
    }

    #[test]
    fn run_dir_is_created() {
        let kernel = flat_kernel();
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_for(&kernel);
        config.run_dir = Some(tmp.path().join("run"));
        let vm = init_with(FakeBehavior::default(), config).unwrap();
        assert!(vm.run_dir().unwrap().path().is_dir());
        vm.exit();
    }

    #[test]
    fn pause_without_vcpus_is_noop() {
        let kernel = flat_kernel();
        let vm = init_with(FakeBehavior::default(), config_for(&kernel)).unwrap();
        vm.pause();
        vm.resume();
        vm.exit();
    }

    // ─── timer ───────────────────────────────────────────────────

    #[test]
    fn timer_targets_vm_and_stops_on_exit() {
        install_tick_handler();
        let kernel = flat_kernel();
        let mut vm = init_with(FakeBehavior::default(), config_for(&kernel)).unwrap();
        assert!(vm.timer().is_none());

        let pause = Arc::clone(vm.pause_coordinator());
        vm.start_timer().unwrap();
        // Starting twice keeps the first timer.
        vm.start_timer().unwrap();
        let timer = vm.timer().unwrap();
        assert!(Arc::ptr_eq(timer.target(), &pause));
        assert_eq!(Arc::strong_count(&pause), 3);

        let before = ticks();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks() < before + 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(ticks() >= before + 2);

        vm.exit();
        assert_eq!(Arc::strong_count(&pause), 1);
    }

    #[test]
    fn stop_timer_disarms() {
        install_tick_handler();
        let kernel = flat_kernel();
        let mut vm = init_with(FakeBehavior::default(), config_for(&kernel)).unwrap();
        let pause = Arc::clone(vm.pause_coordinator());

        vm.start_timer().unwrap();
        assert_eq!(Arc::strong_count(&pause), 3);
        vm.stop_timer();
        assert!(vm.timer().is_none());
        assert_eq!(Arc::strong_count(&pause), 2);
        vm.stop_timer();
        vm.exit();
    }

    // ─── inspection ──────────────────────────────────────────────

    #[test]
    fn dump_mem_rows() {
        let kernel = flat_kernel();
        let vm = init_with(FakeBehavior::default(), config_for(&kernel)).unwrap();
        vm.ram()
            .memory()
            .write_slice(&[0, 1, 2, 3, 4, 5, 6, 7, 0xa, 0xb, 0xc, 0xd, 0xe, 0xf, 0x10, 0x11], GuestAddress(0x5000))
            .unwrap();

        let mut out = Vec::new();
        vm.dump_mem(0x5000, 20, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            " 0x00005000: 00 01 02 03  04 05 06 07\n 0x00005008: 0a 0b 0c 0d  0e 0f 10 11\n"
        );

        let mut out = Vec::new();
        vm.dump_mem((4 << 20) - 8, 16, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with(" 0x00400000: <unknown>\n"));

        let mut out = Vec::new();
        vm.dump_mem(0x5000, 7, &mut out).unwrap();
        assert!(out.is_empty());
        vm.exit();
    }

    #[test]
    fn exit_reason_names() {
        assert_eq!(exit_reason_name(KVM_EXIT_HLT), "KVM_EXIT_HLT");
        assert_eq!(exit_reason_name(KVM_EXIT_IO), "KVM_EXIT_IO");
        assert_eq!(exit_reason_name(KVM_EXIT_SHUTDOWN), "KVM_EXIT_SHUTDOWN");
        assert_eq!(exit_reason_name(9999), "UNKNOWN");
    }
}
