//! AFL style edge coverage, recorded from a basic block hook.

use core::{
    cell::RefCell,
    ops::DerefMut,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{rc::Rc, sync::Arc};

use ucfork_bolts::Error;

use crate::emu::{Emulator, HookAction};

/// The size of the map `afl-fuzz` hands out by default
pub const MAP_SIZE: usize = 1 << 16;

/// Block location used as one half of an edge id
#[must_use]
pub fn hash_block(addr: u64, map_size: usize) -> u64 {
    ((addr >> 4) ^ (addr << 8)) & (map_size as u64 - 1)
}

/// Edge hit counts for one guest, written into `map`.
#[derive(Debug)]
pub struct EdgeCoverage<M> {
    map: M,
    prev_loc: Option<u64>,
    cancel: Arc<AtomicBool>,
}

impl<M> EdgeCoverage<M>
where
    M: DerefMut<Target = [u8]>,
{
    /// `map` has to be a power of two in size.
    pub fn new(map: M) -> Result<Self, Error> {
        if !map.len().is_power_of_two() {
            return Err(Error::illegal_argument(format!(
                "Coverage map size {} is not a power of two",
                map.len()
            )));
        }
        Ok(Self {
            map,
            prev_loc: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start a new run: forget the previous block and hand out a fresh stop flag.
    ///
    /// Setting the returned flag makes the hook stop the guest. Flags from earlier
    /// iterations are no longer looked at.
    pub fn begin_iteration(&mut self) -> Arc<AtomicBool> {
        self.prev_loc = None;
        self.cancel = Arc::new(AtomicBool::new(false));
        self.cancel.clone()
    }

    /// Record entry into the block at `addr`.
    pub fn on_block(&mut self, addr: u64) -> HookAction {
        if self.cancel.load(Ordering::Relaxed) {
            return HookAction::Stop;
        }
        let cur = hash_block(addr, self.map.len());
        if let Some(prev) = self.prev_loc {
            let slot = &mut self.map[(cur ^ prev) as usize];
            *slot = slot.wrapping_add(1);
        }
        self.prev_loc = Some(cur >> 1);
        HookAction::Continue
    }

    /// The coverage bytes
    #[must_use]
    pub fn map(&self) -> &[u8] {
        &self.map
    }

    /// The coverage bytes, for clearing between runs
    pub fn map_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

impl<M> EdgeCoverage<M>
where
    M: DerefMut<Target = [u8]> + 'static,
{
    /// Wire `coverage` into the block hook of `emu`.
    pub fn install<E>(coverage: &Rc<RefCell<Self>>, emu: &mut E) -> Result<(), Error>
    where
        E: Emulator + ?Sized,
    {
        let coverage = coverage.clone();
        emu.add_block_hook(Box::new(move |addr, _size| {
            coverage.borrow_mut().on_block(addr)
        }))
    }
}

#[cfg(test)]
mod tests {
    use core::{cell::RefCell, sync::atomic::Ordering};
    use std::rc::Rc;

    use super::{hash_block, EdgeCoverage, MAP_SIZE};
    use crate::emu::{testing::TestEmulator, Emulator, ExitKind, HookAction};

    #[test]
    fn test_first_block_only_sets_position() {
        let mut cov = EdgeCoverage::new(vec![0_u8; MAP_SIZE]).unwrap();
        cov.begin_iteration();
        assert_eq!(cov.on_block(0x40_1000), HookAction::Continue);
        assert!(cov.map().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_edge_increments_one_slot() {
        let (a, b) = (0x40_1000_u64, 0x40_1234_u64);
        let mut cov = EdgeCoverage::new(vec![0_u8; MAP_SIZE]).unwrap();
        cov.begin_iteration();
        cov.on_block(a);
        cov.on_block(b);

        let slot = (hash_block(b, MAP_SIZE) ^ (hash_block(a, MAP_SIZE) >> 1)) as usize;
        assert_eq!(cov.map()[slot], 1);
        assert_eq!(cov.map().iter().map(|b| u32::from(*b)).sum::<u32>(), 1);
    }

    #[test]
    fn test_counters_wrap() {
        let mut cov = EdgeCoverage::new(vec![0_u8; 16]).unwrap();
        cov.begin_iteration();
        cov.on_block(0);
        for _ in 0..256 {
            cov.on_block(0);
        }
        // block 0 hashes to 0, so the self edge is slot 0
        assert_eq!(cov.map()[0], 0);
        assert!(EdgeCoverage::new(vec![0_u8; 100]).is_err());
    }

    #[test]
    fn test_new_iteration_has_no_previous_block() {
        let mut cov = EdgeCoverage::new(vec![0_u8; MAP_SIZE]).unwrap();
        cov.begin_iteration();
        cov.on_block(0x1000);
        cov.begin_iteration();
        cov.on_block(0x2000);
        assert!(cov.map().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_stale_flag_is_ignored() {
        let mut cov = EdgeCoverage::new(vec![0_u8; MAP_SIZE]).unwrap();
        let old = cov.begin_iteration();
        let current = cov.begin_iteration();
        old.store(true, Ordering::Relaxed);
        assert_eq!(cov.on_block(0x1000), HookAction::Continue);
        current.store(true, Ordering::Relaxed);
        assert_eq!(cov.on_block(0x1010), HookAction::Stop);
    }

    #[test]
    fn test_installed_hook_stops_guest() {
        let cov = Rc::new(RefCell::new(EdgeCoverage::new(vec![0_u8; MAP_SIZE]).unwrap()));
        let mut emu = TestEmulator::new();
        emu.script = vec![0x1000, 0x1010, 0x1020];
        EdgeCoverage::install(&cov, &mut emu).unwrap();

        cov.borrow_mut().begin_iteration();
        assert_eq!(emu.run(&[], &[]).unwrap(), ExitKind::Exit(0));
        assert_eq!(
            cov.borrow().map().iter().map(|b| u32::from(*b)).sum::<u32>(),
            2
        );

        let flag = cov.borrow_mut().begin_iteration();
        flag.store(true, Ordering::Relaxed);
        assert_eq!(emu.run(&[], &[]).unwrap(), ExitKind::Stopped);
    }
}
