//! Bring up a VM, load a kernel, report the memory layout, and tear down.
//!
//! Usage: kestrel-boot <kernel-path> [initrd-path]
//!
//! Guest RAM defaults to 64 MB; set `KESTREL_RAM_MB` to change it.

use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kestrel_vmm::timer::TIMER_SIGNAL;
use kestrel_vmm::vm::{BootImage, Vm, VmConfig};
use vmm_sys_util::signal::register_signal_handler;

static TICKS: AtomicU64 = AtomicU64::new(0);

extern "C" fn on_tick(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        let prog = args.first().map(String::as_str).unwrap_or("kestrel-boot");
        eprintln!("Usage: {} <kernel-path> [initrd-path]", prog);
        std::process::exit(1);
    }

    let mut config = VmConfig {
        kernel: Some(PathBuf::from(&args[1])),
        initrd: args.get(2).map(PathBuf::from),
        ..Default::default()
    };
    if let Some(mb) = env::var("KESTREL_RAM_MB").ok().and_then(|v| v.parse::<u64>().ok()) {
        config.ram_size = mb << 20;
    }

    let mut vm: Vm = match Vm::init(config) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("Fatal: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    log::info!(
        "vCPUs: recommended {}, max {}",
        vm.recommended_vcpus(),
        vm.max_vcpus()
    );
    for bank in vm.banks().banks() {
        log::info!(
            "slot {}: guest {:#x}..{:#x} -> host {:#x}",
            bank.slot,
            bank.guest_phys_addr.0,
            bank.guest_phys_addr.0 + bank.size,
            bank.host_addr,
        );
    }

    let entry = match vm.boot_image() {
        BootImage::Firmware(addr) => *addr,
        BootImage::Kernel(k) => {
            if let Some(initrd) = k.initrd {
                log::info!("initrd at {:#x} ({} bytes)", initrd.addr.0, initrd.size);
            }
            k.image.load_addr
        }
    };
    log::info!("First bytes at {:#x}:", entry.0);
    if let Err(e) = vm.dump_mem(entry.0, 32, &mut io::stdout()) {
        log::warn!("dump failed: {}", e);
    }

    match register_signal_handler(TIMER_SIGNAL, on_tick) {
        Ok(()) => match vm.start_timer() {
            Ok(()) => {
                std::thread::sleep(Duration::from_millis(20));
                vm.stop_timer();
                log::info!("timer ticks in 20 ms: {}", TICKS.load(Ordering::Relaxed));
            }
            Err(e) => log::warn!("periodic timer unavailable: {}", e),
        },
        Err(e) => log::warn!("cannot install tick handler: {}", e),
    }

    vm.exit();
}
