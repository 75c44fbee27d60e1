//! The capability interface to the CPU emulation engine.
//!
//! The session never fetches, decodes or executes anything itself. It drives an engine
//! through [`Emulator`]: registers come and go as a sealed [`RegisterContext`], memory is
//! described by [`Mapping`]s, and execution is observed through basic-block hooks.

use core::fmt::{self, Debug, Display, Formatter};
use std::{os::fd::RawFd, path::PathBuf};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::EnumIter;
use ucfork_bolts::Error;

#[cfg(test)]
pub(crate) mod testing;

/// Guest page protection, bit compatible with `PROT_READ | PROT_WRITE | PROT_EXEC`
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
#[repr(u8)]
pub enum MmapPerms {
    /// `---`
    None = 0,
    /// `r--`
    Read = 1,
    /// `-w-`
    Write = 2,
    /// `rw-`
    ReadWrite = 3,
    /// `--x`
    Execute = 4,
    /// `r-x`
    ReadExecute = 5,
    /// `-wx`
    WriteExecute = 6,
    /// `rwx`
    ReadWriteExecute = 7,
}

impl MmapPerms {
    /// Build perms from the low three bits of `bits`, ignoring everything else.
    #[must_use]
    pub fn from_bits_truncate(bits: u32) -> Self {
        match bits & 7 {
            1 => MmapPerms::Read,
            2 => MmapPerms::Write,
            3 => MmapPerms::ReadWrite,
            4 => MmapPerms::Execute,
            5 => MmapPerms::ReadExecute,
            6 => MmapPerms::WriteExecute,
            7 => MmapPerms::ReadWriteExecute,
            _ => MmapPerms::None,
        }
    }

    /// The `PROT_*` bits
    #[must_use]
    pub fn bits(self) -> u8 {
        self.into()
    }

    /// Readable
    #[must_use]
    pub fn is_r(self) -> bool {
        self.bits() & 1 != 0
    }

    /// Writable
    #[must_use]
    pub fn is_w(self) -> bool {
        self.bits() & 2 != 0
    }

    /// Executable
    #[must_use]
    pub fn is_x(self) -> bool {
        self.bits() & 4 != 0
    }
}

impl Display for MmapPerms {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.is_r() { 'r' } else { '-' },
            if self.is_w() { 'w' } else { '-' },
            if self.is_x() { 'x' } else { '-' }
        )
    }
}

/// The file a guest mapping was created from, kept for bookkeeping only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile {
    /// Path the guest opened
    pub path: PathBuf,
    /// File offset of the first mapped byte
    pub offset: u64,
    /// Host descriptor backing the guest's, if it is still open
    pub fd: Option<RawFd>,
}

/// One live guest mapping, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Guest start address
    pub addr: u64,
    /// Length in bytes
    pub size: u64,
    /// Current protection
    pub prot: MmapPerms,
    /// Free form description, e.g. `[stack]` or a library name
    pub desc: String,
    /// Backing file, `None` for anonymous memory
    pub file: Option<MappedFile>,
}

impl Mapping {
    /// An anonymous mapping without description
    #[must_use]
    pub fn new(addr: u64, size: u64, prot: MmapPerms) -> Self {
        Self {
            addr,
            size,
            prot,
            desc: String::new(),
            file: None,
        }
    }

    /// First address past the mapping
    #[must_use]
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }

    /// Whether `addr` lies inside the mapping
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }

    /// `true` if `[addr, addr + size)` shares at least one byte with this mapping
    #[must_use]
    pub fn overlaps(&self, addr: u64, size: u64) -> bool {
        size != 0 && self.size != 0 && addr < self.end() && self.addr < addr.saturating_add(size)
    }
}

impl Display for Mapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x} {}", self.addr, self.end(), self.prot)?;
        if !self.desc.is_empty() {
            write!(f, " [{}]", self.desc)?;
        }
        Ok(())
    }
}

/// The engine's register state, opaque to everything but the engine that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct RegisterContext {
    blob: Box<[u8]>,
}

impl RegisterContext {
    /// Seal an engine specific register dump. Only engines should call this.
    #[must_use]
    pub fn seal(blob: Vec<u8>) -> Self {
        Self {
            blob: blob.into_boxed_slice(),
        }
    }

    /// The raw dump, for the engine that sealed it.
    #[must_use]
    pub fn unseal(&self) -> &[u8] {
        &self.blob
    }

    /// Size of the dump in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.blob.len()
    }

    /// Whether the engine dumped nothing at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }
}

impl Debug for RegisterContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterContext")
            .field("len", &self.blob.len())
            .finish_non_exhaustive()
    }
}

/// How a guest run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// The guest called its exit syscall with this code
    Exit(i32),
    /// The guest hit a fault the engine could not handle
    Crash(String),
    /// A hook or the embedder asked the engine to stop
    Stopped,
}

/// What the engine should do after a block hook returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Keep running
    Continue,
    /// Stop the run before the next block executes
    Stop,
}

/// Called on every basic block entry with the block address and size.
pub type BlockHook = Box<dyn FnMut(u64, u32) -> HookAction>;

/// The narrow surface of a CPU emulation engine the session relies on.
pub trait Emulator {
    /// Dump all cpu state.
    fn save_registers(&mut self) -> Result<RegisterContext, Error>;

    /// Load cpu state from a dump made by this engine.
    fn restore_registers(&mut self, regs: &RegisterContext) -> Result<(), Error>;

    /// All live mappings, sorted by address.
    fn mappings(&self) -> Vec<Mapping>;

    /// Read `len` bytes of guest memory. Fails if any of them is unmapped.
    fn read_memory(&self, addr: u64, len: u64) -> Result<Vec<u8>, Error>;

    /// Write into mapped guest memory, regardless of its protection.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error>;

    /// Map zeroed memory. Fails if the range is already (partially) mapped.
    fn map_memory(&mut self, addr: u64, size: u64, prot: MmapPerms) -> Result<(), Error>;

    /// Drop the mapping `[addr, addr + size)`.
    fn unmap_memory(&mut self, addr: u64, size: u64) -> Result<(), Error>;

    /// Attach bookkeeping to the mapping starting at `addr`.
    fn annotate_mapping(
        &mut self,
        addr: u64,
        desc: &str,
        file: Option<&MappedFile>,
    ) -> Result<(), Error>;

    /// Install a hook called on every basic block entry.
    /// When it returns [`HookAction::Stop`], the engine has to behave as if
    /// [`Emulator::request_stop`] was called.
    fn add_block_hook(&mut self, hook: BlockHook) -> Result<(), Error>;

    /// Run the guest from the current state until it exits, faults or is stopped.
    fn run(&mut self, args: &[String], env: &[String]) -> Result<ExitKind, Error>;

    /// Ask a running guest to stop at the next block boundary.
    fn request_stop(&mut self);
}
