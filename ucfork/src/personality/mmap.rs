//! Guest `mmap` flag words to host flag words.

use libc::c_int;

/// One guest flag bit and the host flag it stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagMapping {
    /// The flag's C name, for logging
    pub name: &'static str,
    /// Guest bit value
    pub guest: u32,
    /// Host flag value
    pub host: c_int,
}

const fn flag(name: &'static str, guest: u32, host: c_int) -> FlagMapping {
    FlagMapping { name, guest, host }
}

/// Generic linux encoding (x86, arm, aarch64, ppc)
pub static LINUX_MMAP_FLAGS: &[FlagMapping] = &[
    flag("MAP_SHARED", 0x1, libc::MAP_SHARED),
    flag("MAP_PRIVATE", 0x2, libc::MAP_PRIVATE),
    flag("MAP_FIXED", 0x10, libc::MAP_FIXED),
    flag("MAP_ANONYMOUS", 0x20, libc::MAP_ANONYMOUS),
    flag("MAP_NORESERVE", 0x4000, libc::MAP_NORESERVE),
];

/// `MAP_FILE` is 0 on darwin, there is nothing to translate for it.
pub static DARWIN_MMAP_FLAGS: &[FlagMapping] = &[
    flag("MAP_SHARED", 0x1, libc::MAP_SHARED),
    flag("MAP_PRIVATE", 0x2, libc::MAP_PRIVATE),
    flag("MAP_FIXED", 0x10, libc::MAP_FIXED),
    flag("MAP_NORESERVE", 0x40, libc::MAP_NORESERVE),
    flag("MAP_ANON", 0x1000, libc::MAP_ANONYMOUS),
];

/// Translate `guest` through `table`. Bits without a table entry are dropped.
#[must_use]
pub fn translate_mmap_flags(table: &[FlagMapping], guest: u32) -> c_int {
    let mut host = 0;
    let mut known = 0;
    for entry in table {
        if guest & entry.guest != 0 {
            host |= entry.host;
        }
        known |= entry.guest;
    }
    if guest & !known != 0 {
        log::warn!(
            "Dropping unsupported mmap flags 0x{:x} (from 0x{guest:x})",
            guest & !known
        );
    }
    host
}
