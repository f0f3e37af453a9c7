//! Guest image loading.
//!
//! [`KernelLoader`] tries a fixed sequence of [`ImageProber`]s against a
//! kernel file (bzImage, then ELF, then flat binary) and stops at the
//! first one that recognizes it.  bzImage and ELF parsing is delegated to
//! `linux-loader`; this module only decides the order, validates the
//! initrd, and writes the Linux boot parameters (zero page, command line,
//! E820 map, initrd placement) for the formats that need them.
//!
//! Firmware images bypass the probers entirely: [`load_firmware`] copies
//! the file so that it ends at 1 MB.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use kestrel_vmm::loader::KernelLoader;
//! use kestrel_vmm::memory::GuestRam;
//!
//! let ram = GuestRam::new(256 << 20).unwrap();
//! let loaded = KernelLoader::default()
//!     .load(&ram, Path::new("bzImage"), Some(Path::new("initrd.cpio.gz")), "console=ttyS0")
//!     .unwrap();
//! println!("{:?} at {:#x}", loaded.image.format, loaded.image.load_addr.0);
//! ```

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use linux_loader::configurator::linux::LinuxBootConfigurator;
use linux_loader::configurator::{BootConfigurator, BootParams};
use linux_loader::loader::bootparam::{boot_params, setup_header};
use linux_loader::loader::bzimage::BzImage;
use linux_loader::loader::elf::Elf;
use linux_loader::loader::KernelLoader as _;
use log::{debug, info, warn};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::memory::{
    build_e820_map, GuestRam, MemoryError, CMDLINE_START, FLAT_BINARY_LOAD_ADDR, HIMEM_START,
    ZERO_PAGE_START,
};
use crate::verified::memory as verified;

const KERNEL_BOOT_FLAG_MAGIC: u16 = 0xaa55;
const KERNEL_HDR_MAGIC: u32 = 0x5372_6448;
const KERNEL_LOADER_OTHER: u8 = 0xff;
const KERNEL_MIN_ALIGNMENT_BYTES: u32 = 0x0100_0000;
const PAGE_SIZE: u64 = 0x1000;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Unable to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The initrd is neither gzip-compressed nor a plain cpio archive.
    #[error("{} is not an initrd", .path.display())]
    NotAnInitrd { path: PathBuf },

    /// No prober recognized the kernel image.
    #[error("{} is not a valid bzImage, ELF or flat binary", .path.display())]
    UnrecognizedKernel { path: PathBuf },

    /// The initrd does not fit in guest RAM below 4 GB after the kernel.
    #[error("Initrd of {size} bytes does not fit at {address:#x}")]
    InitrdPlacement { address: u64, size: u64 },

    /// Firmware image is empty or larger than the legacy BIOS window.
    #[error("Firmware image of {len} bytes does not fit below 1 MB")]
    FirmwareSize { len: u64 },

    #[error("Failed to write boot parameters: {0}")]
    BootParams(#[source] linux_loader::configurator::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Probers
// ═══════════════════════════════════════════════════════════════════════

/// Guest image format that was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    BzImage,
    Elf,
    Flat,
    Firmware,
}

impl ImageFormat {
    /// Formats that boot through the Linux boot protocol.
    pub fn needs_boot_params(self) -> bool {
        matches!(self, Self::BzImage | Self::Elf)
    }
}

/// A recognized image, already copied into guest memory.
#[derive(Debug, Clone, Copy)]
pub struct KernelImage {
    pub format: ImageFormat,
    pub load_addr: GuestAddress,
    /// First guest address past the loaded image.
    pub end: u64,
    /// Setup header carried by bzImages.
    pub setup_header: Option<setup_header>,
}

/// One image format recognizer.
///
/// `probe` returns `None` when the file is not in this format, in which
/// case guest memory must be left untouched.  The file is positioned at
/// offset 0 on entry.
pub trait ImageProber {
    fn name(&self) -> &'static str;
    fn probe(&self, mem: &GuestMemoryMmap, kernel: &mut File) -> Option<KernelImage>;
}

/// Linux bzImage via `linux-loader`.
pub struct BzImageProber;

impl ImageProber for BzImageProber {
    fn name(&self) -> &'static str {
        "bzImage"
    }

    fn probe(&self, mem: &GuestMemoryMmap, kernel: &mut File) -> Option<KernelImage> {
        match BzImage::load(mem, None, kernel, Some(GuestAddress(HIMEM_START))) {
            Ok(result) => Some(KernelImage {
                format: ImageFormat::BzImage,
                load_addr: result.kernel_load,
                end: result.kernel_end,
                setup_header: result.setup_header,
            }),
            Err(e) => {
                debug!("not a bzImage: {}", e);
                None
            }
        }
    }
}

/// ELF vmlinux via `linux-loader`.
pub struct ElfProber;

impl ImageProber for ElfProber {
    fn name(&self) -> &'static str {
        "ELF"
    }

    fn probe(&self, mem: &GuestMemoryMmap, kernel: &mut File) -> Option<KernelImage> {
        match Elf::load(mem, None, kernel, Some(GuestAddress(HIMEM_START))) {
            Ok(result) => Some(KernelImage {
                format: ImageFormat::Elf,
                load_addr: result.kernel_load,
                end: result.kernel_end,
                setup_header: None,
            }),
            Err(e) => {
                debug!("not an ELF image: {}", e);
                None
            }
        }
    }
}

/// Raw code copied verbatim to real-mode address `0x1000:0x0000`.
///
/// Accepts any non-empty file that fits in guest RAM.
pub struct FlatProber;

impl ImageProber for FlatProber {
    fn name(&self) -> &'static str {
        "flat binary"
    }

    fn probe(&self, mem: &GuestMemoryMmap, kernel: &mut File) -> Option<KernelImage> {
        let mut data = Vec::new();
        if let Err(e) = kernel.read_to_end(&mut data) {
            debug!("flat binary read failed: {}", e);
            return None;
        }
        if data.is_empty() {
            return None;
        }
        let load_addr = GuestAddress(FLAT_BINARY_LOAD_ADDR);
        if !mem.check_range(load_addr, data.len()) {
            debug!("flat binary of {} bytes does not fit in guest RAM", data.len());
            return None;
        }
        if let Err(e) = mem.write_slice(&data, load_addr) {
            debug!("flat binary write failed: {}", e);
            return None;
        }
        Some(KernelImage {
            format: ImageFormat::Flat,
            load_addr: GuestAddress(FLAT_BINARY_LOAD_ADDR),
            end: FLAT_BINARY_LOAD_ADDR + data.len() as u64,
            setup_header: None,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  KernelLoader
// ═══════════════════════════════════════════════════════════════════════

/// Where the initrd landed in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitrdPlacement {
    pub addr: GuestAddress,
    pub size: u64,
}

/// Result of [`KernelLoader::load`].
#[derive(Debug, Clone, Copy)]
pub struct LoadedKernel {
    pub image: KernelImage,
    pub initrd: Option<InitrdPlacement>,
}

/// Ordered list of image probers.
pub struct KernelLoader {
    probers: Vec<Box<dyn ImageProber>>,
}

impl Default for KernelLoader {
    /// bzImage, then ELF, then flat binary.
    fn default() -> Self {
        Self::with_probers(vec![
            Box::new(BzImageProber),
            Box::new(ElfProber),
            Box::new(FlatProber),
        ])
    }
}

impl KernelLoader {
    pub fn with_probers(probers: Vec<Box<dyn ImageProber>>) -> Self {
        Self { probers }
    }

    /// Load `kernel_path` (and `initrd_path`, if any) into `ram`.
    ///
    /// The initrd is validated before any prober runs.  For bzImage and
    /// ELF kernels the initrd is copied page-aligned after the kernel and
    /// the command line and zero page are written.  Flat binaries get
    /// neither; a supplied initrd is ignored with a warning.
    pub fn load(
        &self,
        ram: &GuestRam,
        kernel_path: &Path,
        initrd_path: Option<&Path>,
        cmdline: &str,
    ) -> Result<LoadedKernel, LoaderError> {
        info!("Loading kernel from {}", kernel_path.display());
        let mut kernel = open(kernel_path)?;

        let mut initrd = match initrd_path {
            Some(path) => {
                let mut file = open(path)?;
                let valid = initrd_check(&mut file).map_err(|source| LoaderError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                if !valid {
                    return Err(LoaderError::NotAnInitrd {
                        path: path.to_path_buf(),
                    });
                }
                Some((path, file))
            }
            None => None,
        };

        let image = self
            .probe_all(ram.memory(), kernel_path, &mut kernel)?
            .ok_or_else(|| LoaderError::UnrecognizedKernel {
                path: kernel_path.to_path_buf(),
            })?;
        info!(
            "Loaded {:?} image at {:#x}, end {:#x}",
            image.format, image.load_addr.0, image.end
        );

        if !image.format.needs_boot_params() {
            if let Some((path, _)) = initrd {
                warn!(
                    "Loading initrd with flat binary not supported, ignoring {}",
                    path.display()
                );
            }
            return Ok(LoadedKernel {
                image,
                initrd: None,
            });
        }

        let placement = match initrd.as_mut() {
            Some((path, file)) => Some(load_initrd(ram, path, file, image.end)?),
            None => None,
        };

        let cmdline_len = ram.write_cmdline(cmdline.as_bytes())?;
        write_boot_params(ram, image.setup_header, cmdline_len, placement)?;

        Ok(LoadedKernel {
            image,
            initrd: placement,
        })
    }

    fn probe_all(
        &self,
        mem: &GuestMemoryMmap,
        path: &Path,
        kernel: &mut File,
    ) -> Result<Option<KernelImage>, LoaderError> {
        for prober in &self.probers {
            kernel
                .seek(SeekFrom::Start(0))
                .map_err(|source| LoaderError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            if let Some(image) = prober.probe(mem, kernel) {
                return Ok(Some(image));
            }
            warn!("{} is not a {} image", path.display(), prober.name());
        }
        Ok(None)
    }
}

fn open(path: &Path) -> Result<File, LoaderError> {
    File::open(path).map_err(|source| LoaderError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Returns `true` if `reader` starts with gzip or cpio magic.
///
/// Reads four bytes and seeks back to offset 0.  A stream shorter than
/// four bytes is not an initrd.
pub fn initrd_check<R: Read + Seek>(reader: &mut R) -> io::Result<bool> {
    let mut id = [0u8; 4];
    let complete = match reader.read_exact(&mut id) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e),
    };
    reader.seek(SeekFrom::Start(0))?;
    Ok(complete && verified::is_initrd_magic(&id))
}

fn load_initrd(
    ram: &GuestRam,
    path: &Path,
    file: &mut File,
    kernel_end: u64,
) -> Result<InitrdPlacement, LoaderError> {
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let address = kernel_end.next_multiple_of(PAGE_SIZE);
    let size = data.len() as u64;
    let fits_below_4g = address
        .checked_add(size)
        .is_some_and(|end| end <= u64::from(u32::MAX));
    if !fits_below_4g {
        return Err(LoaderError::InitrdPlacement { address, size });
    }

    ram.memory()
        .write_slice(&data, GuestAddress(address))
        .map_err(|_| LoaderError::InitrdPlacement { address, size })?;

    info!("Initrd loaded at {:#x}, size: {} bytes", address, size);
    Ok(InitrdPlacement {
        addr: GuestAddress(address),
        size,
    })
}

/// Write the zero page: setup header, command line pointer, initrd, and
/// the E820 map for the whole of guest RAM.
fn write_boot_params(
    ram: &GuestRam,
    header: Option<setup_header>,
    cmdline_len: usize,
    initrd: Option<InitrdPlacement>,
) -> Result<(), LoaderError> {
    let mut hdr = header.unwrap_or(setup_header {
        boot_flag: KERNEL_BOOT_FLAG_MAGIC,
        header: KERNEL_HDR_MAGIC,
        kernel_alignment: KERNEL_MIN_ALIGNMENT_BYTES,
        ..Default::default()
    });
    hdr.type_of_loader = KERNEL_LOADER_OTHER;
    hdr.cmd_line_ptr = CMDLINE_START as u32;
    hdr.cmdline_size = cmdline_len as u32;

    if let Some(initrd) = initrd {
        // Placement already checked to lie below 4 GB.
        hdr.ramdisk_image = initrd.addr.0 as u32;
        hdr.ramdisk_size = initrd.size as u32;
    }

    let mut params = boot_params {
        hdr,
        ..Default::default()
    };

    let e820 = build_e820_map(ram.size());
    for (slot, entry) in params.e820_table.iter_mut().zip(&e820) {
        slot.addr = entry.addr;
        slot.size = entry.size;
        slot.type_ = entry.type_;
    }
    params.e820_entries = e820.len() as u8;

    let boot_params = BootParams::new(&params, GuestAddress(ZERO_PAGE_START));
    LinuxBootConfigurator::write_bootparams(&boot_params, ram.memory())
        .map_err(LoaderError::BootParams)?;

    debug!(
        "Zero page at {:#x}: {} E820 entries",
        ZERO_PAGE_START,
        e820.len()
    );
    Ok(())
}

/// Copy the firmware image at `path` so that it ends at 1 MB.
pub fn load_firmware(ram: &GuestRam, path: &Path) -> Result<GuestAddress, LoaderError> {
    let data = std::fs::read(path).map_err(|source| LoaderError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let len = data.len() as u64;
    let address = verified::firmware_load_addr(len).ok_or(LoaderError::FirmwareSize { len })?;

    ram.memory()
        .write_slice(&data, GuestAddress(address))
        .map_err(|_| MemoryError::Write { address })?;

    info!(
        "Firmware {} loaded at {:#x} ({} bytes)",
        path.display(),
        address,
        len
    );
    Ok(GuestAddress(address))
}
