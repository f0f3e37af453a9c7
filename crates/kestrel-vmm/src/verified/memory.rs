//! Pure, verifiable functions for guest memory layout and bank arithmetic.
//!
//! Every function in this module is:
//! - **Pure**: no I/O, no system calls, no side effects beyond the return value.
//! - **Deterministic**: same inputs always produce the same outputs.
//! - **Overflow-safe**: ranges that end exactly at `u64::MAX + 1` are
//!   handled without wrapping.
//! - **Assertion-guarded**: `debug_assert!` postconditions on every
//!   non-trivial function.
//!
//! # Mapping to `memory.rs` / `loader.rs`
//!
//! | Verified function     | Used by                                     |
//! |-----------------------|---------------------------------------------|
//! | [`range_contains`]    | `MemoryBank::contains_guest/contains_host`  |
//! | [`ranges_overlap`]    | `MemoryRegionTable::register`               |
//! | [`translate`]         | `MemoryRegionTable::translate_to_*`         |
//! | [`ram_ranges`]        | `GuestRam::new`                             |
//! | [`is_initrd_magic`]   | `loader::initrd_check`                      |
//! | [`firmware_load_addr`]| `loader::load_firmware`                     |

// ═══════════════════════════════════════════════════════════════════════
//  Constants (mirrored in memory.rs)
// ═══════════════════════════════════════════════════════════════════════

/// Size of the 32-bit physical address space (4 GB).
pub const MAX_32BIT_MEM_SIZE: u64 = 1 << 32;

/// Size of the PCI/MMIO hole just below 4 GB.  Must equal
/// `crate::memory::GAP_32BIT_SIZE`.
pub const GAP_32BIT_SIZE: u64 = 768 << 20;

/// First guest physical address of the PCI/MMIO hole.  Must equal
/// `crate::memory::GAP_32BIT_START`.
pub const GAP_32BIT_START: u64 = MAX_32BIT_MEM_SIZE - GAP_32BIT_SIZE;

/// Firmware images are placed so that their last byte sits just below
/// this address (1 MB).  Must equal `crate::memory::FIRMWARE_END`.
pub const FIRMWARE_END: u64 = 0x0010_0000;

/// Largest firmware image accepted (256 KB, the legacy BIOS area
/// `0xC0000..0x100000`).
pub const FIRMWARE_MAX_SIZE: u64 = 0x0004_0000;

/// First gzip identification byte (RFC 1952).
pub const GZIP_ID1: u8 = 0x1f;

/// Second gzip identification byte (RFC 1952).
pub const GZIP_ID2: u8 = 0x8b;

/// Leading bytes of a plain (uncompressed) cpio archive.
pub const CPIO_MAGIC: [u8; 4] = *b"0707";

// ═══════════════════════════════════════════════════════════════════════
//  Compile-time layout verification
// ═══════════════════════════════════════════════════════════════════════

// The hole is fully inside the 32-bit space and page-aligned.
const _: () = assert!(GAP_32BIT_START < MAX_32BIT_MEM_SIZE);
const _: () = assert!(GAP_32BIT_START % 0x1000 == 0);
const _: () = assert!(GAP_32BIT_START == 0xD000_0000);

// Firmware window lives in the legacy area below 1 MB.
const _: () = assert!(FIRMWARE_MAX_SIZE < FIRMWARE_END);
const _: () = assert!(FIRMWARE_END - FIRMWARE_MAX_SIZE == 0xC_0000);

// ═══════════════════════════════════════════════════════════════════════
//  Range arithmetic
// ═══════════════════════════════════════════════════════════════════════

/// Returns `true` if `addr` lies in `[start, start + size)`.
///
/// Written as a subtraction so that a range touching the top of the
/// address space never wraps.
///
/// # Properties
///
/// - `range_contains(s, 0, a) == false` for all `s`, `a`
/// - `range_contains(s, n, s) == true` for `n > 0`
/// - `range_contains(s, n, s + n) == false`
pub fn range_contains(start: u64, size: u64, addr: u64) -> bool {
    let result = addr >= start && addr - start < size;

    // Postcondition: an empty range contains nothing.
    debug_assert!(size != 0 || !result, "empty range cannot contain {addr:#x}");

    result
}

/// Returns `true` if `[a_start, a_start + a_size)` and
/// `[b_start, b_start + b_size)` share at least one address.
///
/// Empty ranges overlap nothing.
///
/// # Properties
///
/// - symmetric: `ranges_overlap(a, n, b, m) == ranges_overlap(b, m, a, n)`
/// - adjacent ranges (`a + n == b`) do not overlap
pub fn ranges_overlap(a_start: u64, a_size: u64, b_start: u64, b_size: u64) -> bool {
    if a_size == 0 || b_size == 0 {
        return false;
    }

    let result = if a_start <= b_start {
        b_start - a_start < a_size
    } else {
        a_start - b_start < b_size
    };

    // Postcondition: overlap implies each range contains the later start.
    debug_assert!(
        !result
            || range_contains(a_start, a_size, b_start)
            || range_contains(b_start, b_size, a_start),
        "ranges_overlap: inconsistent with range_contains"
    );

    result
}

/// Map `addr` from a range based at `from_base` to the range based at
/// `to_base`, both `size` bytes long.
///
/// Returns `None` if `addr` is outside `[from_base, from_base + size)`
/// or if the translated address would not fit in 64 bits.
///
/// # Properties
///
/// - `translate(t, f, n, translate(f, t, n, a)?) == Some(a)` (round trip)
/// - result, when present, lies in `[to_base, to_base + size)`
pub fn translate(from_base: u64, to_base: u64, size: u64, addr: u64) -> Option<u64> {
    if !range_contains(from_base, size, addr) {
        return None;
    }

    let offset = addr - from_base;
    let result = to_base.checked_add(offset)?;

    // Postcondition: the result lands inside the destination range.
    debug_assert!(
        range_contains(to_base, size, result),
        "translate: {result:#x} escaped destination range"
    );

    Some(result)
}

// ═══════════════════════════════════════════════════════════════════════
//  Guest RAM layout
// ═══════════════════════════════════════════════════════════════════════

/// Split `ram_size` bytes of guest RAM into `(guest_phys, size)` ranges.
///
/// RAM smaller than [`GAP_32BIT_START`] is a single range at 0.  Larger
/// RAM is split around the PCI/MMIO hole: the first
/// [`GAP_32BIT_START`] bytes stay below the hole and the remainder is
/// placed at 4 GB.
///
/// # Properties
///
/// - sum of sizes == `ram_size`
/// - ranges are ascending and pairwise disjoint
/// - no range intersects `[GAP_32BIT_START, 4 GB)`
pub fn ram_ranges(ram_size: u64) -> Vec<(u64, u64)> {
    let result = if ram_size <= GAP_32BIT_START {
        vec![(0, ram_size)]
    } else {
        vec![
            (0, GAP_32BIT_START),
            (MAX_32BIT_MEM_SIZE, ram_size - GAP_32BIT_START),
        ]
    };

    // Postcondition: all RAM accounted for.
    debug_assert_eq!(
        result.iter().map(|&(_, size)| size).sum::<u64>(),
        ram_size,
        "ram_ranges must cover the whole allocation"
    );
    // Postcondition: nothing lands in the hole.
    debug_assert!(
        result.iter().all(|&(start, size)| !ranges_overlap(
            start,
            size,
            GAP_32BIT_START,
            GAP_32BIT_SIZE
        )),
        "ram_ranges must skip the 32-bit gap"
    );

    result
}

/// Returns `true` if the first four bytes of a file identify an initrd:
/// either gzip-compressed (`1f 8b`) or a plain cpio archive (`"0707"`).
pub fn is_initrd_magic(id: &[u8; 4]) -> bool {
    (id[0] == GZIP_ID1 && id[1] == GZIP_ID2) || *id == CPIO_MAGIC
}

/// Guest physical address at which a firmware image of `len` bytes is
/// placed so that it ends at [`FIRMWARE_END`].
///
/// Returns `None` for empty images or images larger than
/// [`FIRMWARE_MAX_SIZE`].
pub fn firmware_load_addr(len: u64) -> Option<u64> {
    if len == 0 || len > FIRMWARE_MAX_SIZE {
        return None;
    }

    let result = FIRMWARE_END - len;

    // Postcondition: image ends exactly at FIRMWARE_END.
    debug_assert_eq!(result + len, FIRMWARE_END);

    Some(result)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
