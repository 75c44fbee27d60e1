//! A scripted, memory-only [`Emulator`] for tests.
//!
//! It executes nothing: a run replays `script` through the block hooks, applies the
//! scripted guest side effects and returns `exit`.

use std::collections::BTreeMap;

use ucfork_bolts::Error;

use super::{
    BlockHook, Emulator, ExitKind, HookAction, MappedFile, Mapping, MmapPerms, RegisterContext,
};

#[derive(Debug, Clone)]
struct TestMapping {
    size: u64,
    prot: MmapPerms,
    data: Vec<u8>,
    desc: String,
    file: Option<MappedFile>,
}

pub(crate) struct TestEmulator {
    pub regs: Vec<u8>,
    maps: BTreeMap<u64, TestMapping>,
    hooks: Vec<BlockHook>,
    /// Block addresses visited by each run
    pub script: Vec<u64>,
    pub exit: Result<ExitKind, String>,
    /// Writes the guest performs during a run
    pub scribbles: Vec<(u64, Vec<u8>)>,
    /// Mappings the guest creates during a run
    pub new_maps: Vec<(u64, u64)>,
    /// Mapping starts that fail to read
    pub unreadable: Vec<u64>,
    /// Mapping starts that fail to unmap
    pub sticky: Vec<u64>,
    pub stop_requested: bool,
    pub runs: usize,
}

impl TestEmulator {
    pub fn new() -> Self {
        Self {
            regs: vec![0; 16],
            maps: BTreeMap::new(),
            hooks: vec![],
            script: vec![],
            exit: Ok(ExitKind::Exit(0)),
            scribbles: vec![],
            new_maps: vec![],
            unreadable: vec![],
            sticky: vec![],
            stop_requested: false,
            runs: 0,
        }
    }

    /// Map and fill a region in one go
    pub fn with_region(mut self, addr: u64, data: &[u8], prot: MmapPerms, desc: &str) -> Self {
        self.map_memory(addr, data.len() as u64, prot).unwrap();
        self.write_memory(addr, data).unwrap();
        self.annotate_mapping(addr, desc, None).unwrap();
        self
    }

    fn find(&self, addr: u64, len: u64) -> Result<(u64, &TestMapping), Error> {
        self.maps
            .range(..=addr)
            .next_back()
            .filter(|(start, map)| addr.saturating_add(len) <= start.saturating_add(map.size))
            .map(|(start, map)| (*start, map))
            .ok_or_else(|| Error::memory_access(format!("unmapped 0x{addr:x}+0x{len:x}")))
    }
}

impl Emulator for TestEmulator {
    fn save_registers(&mut self) -> Result<RegisterContext, Error> {
        Ok(RegisterContext::seal(self.regs.clone()))
    }

    fn restore_registers(&mut self, regs: &RegisterContext) -> Result<(), Error> {
        self.regs = regs.unseal().to_vec();
        Ok(())
    }

    fn mappings(&self) -> Vec<Mapping> {
        self.maps
            .iter()
            .map(|(addr, map)| Mapping {
                addr: *addr,
                size: map.size,
                prot: map.prot,
                desc: map.desc.clone(),
                file: map.file.clone(),
            })
            .collect()
    }

    fn read_memory(&self, addr: u64, len: u64) -> Result<Vec<u8>, Error> {
        let (start, map) = self.find(addr, len)?;
        if self.unreadable.contains(&start) {
            return Err(Error::memory_access(format!("read fault at 0x{addr:x}")));
        }
        let off = (addr - start) as usize;
        Ok(map.data[off..off + len as usize].to_vec())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        let (start, _) = self.find(addr, data.len() as u64)?;
        let map = self.maps.get_mut(&start).unwrap();
        let off = (addr - start) as usize;
        map.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn map_memory(&mut self, addr: u64, size: u64, prot: MmapPerms) -> Result<(), Error> {
        if self.mappings().iter().any(|m| m.overlaps(addr, size)) {
            return Err(Error::memory_access(format!(
                "0x{addr:x}-0x{:x} already mapped",
                addr.saturating_add(size)
            )));
        }
        self.maps.insert(
            addr,
            TestMapping {
                size,
                prot,
                data: vec![0; size as usize],
                desc: String::new(),
                file: None,
            },
        );
        Ok(())
    }

    fn unmap_memory(&mut self, addr: u64, size: u64) -> Result<(), Error> {
        if self.sticky.contains(&addr) {
            return Err(Error::memory_access(format!("cannot unmap 0x{addr:x}")));
        }
        match self.maps.get(&addr) {
            Some(map) if map.size == size => {
                self.maps.remove(&addr);
                Ok(())
            }
            _ => Err(Error::memory_access(format!(
                "no mapping 0x{addr:x}-0x{:x}",
                addr.saturating_add(size)
            ))),
        }
    }

    fn annotate_mapping(
        &mut self,
        addr: u64,
        desc: &str,
        file: Option<&MappedFile>,
    ) -> Result<(), Error> {
        let map = self
            .maps
            .get_mut(&addr)
            .ok_or_else(|| Error::memory_access(format!("no mapping at 0x{addr:x}")))?;
        map.desc = desc.to_string();
        map.file = file.cloned();
        Ok(())
    }

    fn add_block_hook(&mut self, hook: BlockHook) -> Result<(), Error> {
        self.hooks.push(hook);
        Ok(())
    }

    fn run(&mut self, _args: &[String], _env: &[String]) -> Result<ExitKind, Error> {
        self.runs += 1;
        self.stop_requested = false;

        for reg in &mut self.regs {
            *reg = reg.wrapping_add(1);
        }
        for (addr, data) in self.scribbles.clone() {
            self.write_memory(addr, &data)?;
        }
        for (addr, size) in self.new_maps.clone() {
            self.map_memory(addr, size, MmapPerms::ReadWrite)?;
        }

        for addr in self.script.clone() {
            let mut stop = false;
            for hook in &mut self.hooks {
                if hook(addr, 4) == HookAction::Stop {
                    stop = true;
                }
            }
            if stop {
                self.request_stop();
            }
            if self.stop_requested {
                return Ok(ExitKind::Stopped);
            }
        }

        self.exit.clone().map_err(Error::unknown)
    }

    fn request_stop(&mut self) {
        self.stop_requested = true;
    }
}
