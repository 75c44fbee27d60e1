//! Snapshots of a whole guest: cpu registers plus every mapping and its bytes.
//!
//! A [`Context`] is taken once after the guest has booted and then restored before every
//! forkserver iteration. It is immutable once taken.

use core::fmt::{self, Display, Formatter};

use ucfork_bolts::Error;

use crate::emu::{Emulator, MappedFile, Mapping, MmapPerms, RegisterContext};

/// One saved mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMemRegion {
    /// Guest start address
    pub addr: u64,
    /// Length in bytes
    pub size: u64,
    /// Protection to map it back with
    pub prot: MmapPerms,
    /// Description, e.g. `[heap]`
    pub desc: String,
    /// Backing file, if any
    pub file: Option<MappedFile>,
    /// The saved contents, `size` bytes
    pub data: Vec<u8>,
}

impl ContextMemRegion {
    /// One past the last byte, clamped at the top of the address space
    #[must_use]
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }
}

/// A range that could not be read or unmapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAccessFailure {
    /// First address of the range
    pub start: u64,
    /// One past the last address
    pub end: u64,
    /// What the emulator said
    pub reason: String,
}

impl Display for MemoryAccessFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x} ({})", self.start, self.end, self.reason)
    }
}

fn join_failures(action: &str, failures: &[MemoryAccessFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{action} {failure}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The result of [`Context::save`]: always a context, possibly missing some regions.
#[derive(Debug)]
pub struct SaveOutcome {
    context: Context,
    failures: Vec<MemoryAccessFailure>,
}

impl SaveOutcome {
    /// The saved context, complete or not
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Keep the context, partial or not
    #[must_use]
    pub fn into_context(self) -> Context {
        self.context
    }

    /// Whether every mapping made it into the context
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The ranges that could not be read
    #[must_use]
    pub fn failures(&self) -> &[MemoryAccessFailure] {
        &self.failures
    }

    /// All failed ranges in one message, `None` if every region was saved.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        if self.failures.is_empty() {
            None
        } else {
            Some(Error::memory_access(join_failures("saving", &self.failures)))
        }
    }

    /// For callers that do not accept partial snapshots.
    pub fn into_result(self) -> Result<Context, Error> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self.context),
        }
    }
}

/// Registers plus every mapping of a guest, taken with [`Context::save`]
#[derive(Debug, Clone)]
pub struct Context {
    regs: RegisterContext,
    regions: Vec<ContextMemRegion>,
}

impl Context {
    /// Snapshot registers and all readable mappings of `emu`.
    ///
    /// Failing to read a mapping is not an error here, see [`SaveOutcome`].
    pub fn save<E>(emu: &mut E) -> Result<SaveOutcome, Error>
    where
        E: Emulator + ?Sized,
    {
        let regs = emu.save_registers()?;
        let mut regions = vec![];
        let mut failures = vec![];

        for Mapping {
            addr,
            size,
            prot,
            desc,
            file,
        } in emu.mappings()
        {
            match emu.read_memory(addr, size) {
                Ok(data) => regions.push(ContextMemRegion {
                    addr,
                    size,
                    prot,
                    desc,
                    file,
                    data,
                }),
                Err(err) => failures.push(MemoryAccessFailure {
                    start: addr,
                    end: addr.saturating_add(size),
                    reason: err.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            log::info!("Saved context with {} regions", regions.len());
        } else {
            log::warn!(
                "Saved partial context, {} of {} regions failed",
                failures.len(),
                regions.len() + failures.len()
            );
        }

        Ok(SaveOutcome {
            context: Context { regs, regions },
            failures,
        })
    }

    /// Put `emu` back into the saved state.
    ///
    /// Registers go first, then every live mapping is dropped and the saved ones are
    /// recreated with their contents and bookkeeping. A mapping that survives the
    /// unmap and collides with a saved region is reported as a conflict.
    pub fn restore<E>(&self, emu: &mut E) -> Result<(), Error>
    where
        E: Emulator + ?Sized,
    {
        emu.restore_registers(&self.regs)?;

        let mut failures = vec![];
        for map in emu.mappings() {
            if let Err(err) = emu.unmap_memory(map.addr, map.size) {
                failures.push(MemoryAccessFailure {
                    start: map.addr,
                    end: map.end(),
                    reason: err.to_string(),
                });
            }
        }

        let live = emu.mappings();
        for region in &self.regions {
            if let Some(conflict) = live.iter().find(|m| m.overlaps(region.addr, region.size)) {
                return Err(Error::mapping_conflict(format!(
                    "restoring 0x{:x}-0x{:x} hits live mapping {conflict}",
                    region.addr,
                    region.end()
                )));
            }
            emu.map_memory(region.addr, region.size, region.prot)?;
            emu.write_memory(region.addr, &region.data)?;
            emu.annotate_mapping(region.addr, &region.desc, region.file.as_ref())?;
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::memory_access(join_failures("unmapping", &failures)))
        }
    }

    /// The saved mappings, in the order the emulator listed them
    #[must_use]
    pub fn regions(&self) -> &[ContextMemRegion] {
        &self.regions
    }

    /// The saved cpu state
    #[must_use]
    pub fn registers(&self) -> &RegisterContext {
        &self.regs
    }
}
