//! A SysV shared memory region, as handed out by `afl-fuzz` for its coverage bitmap.
//!
//! The fuzzer creates the segment and exports its id in an environment variable
//! (`__AFL_SHM_ID`); the target only attaches to it. Segments created locally with
//! [`UnixShMem::new`] are removed again on drop, attached ones are only detached.

use core::{
    fmt::{self, Display},
    ops::{Deref, DerefMut},
    ptr, slice,
    str::FromStr,
};
use std::env;

use libc::{c_uchar, shmat, shmctl, shmdt, shmget};

use crate::Error;

/// The environment variable `afl-fuzz` exports the coverage map id in
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// The id of a SysV shared memory segment, as returned by `shmget`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShMemId(i32);

impl ShMemId {
    /// Create a new id from an int
    #[must_use]
    pub const fn from_int(val: i32) -> Self {
        Self(val)
    }

    /// The raw os id
    #[must_use]
    pub const fn as_int(&self) -> i32 {
        self.0
    }
}

impl FromStr for ShMemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl Display for ShMemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The default sharedmap impl for unix using shmctl & shmget
#[derive(Debug)]
pub struct UnixShMem {
    id: ShMemId,
    map: *mut u8,
    map_size: usize,
    owned: bool,
}

impl UnixShMem {
    /// Create a new shared memory mapping, using shmget/shmat
    pub fn new(map_size: usize) -> Result<Self, Error> {
        unsafe {
            let os_id = shmget(
                libc::IPC_PRIVATE,
                map_size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            );

            if os_id < 0_i32 {
                return Err(Error::last_os_error(format!(
                    "Failed to allocate a shared mapping of size {map_size} - check OS limits (i.e shmall, shmmax)"
                )));
            }

            let map = shmat(os_id, ptr::null(), 0) as *mut c_uchar;

            if map as isize == -1 || map.is_null() {
                let err = Error::last_os_error("Failed to map the shared mapping");
                shmctl(os_id, libc::IPC_RMID, ptr::null_mut());
                return Err(err);
            }

            Ok(Self {
                id: ShMemId::from_int(os_id),
                map,
                map_size,
                owned: true,
            })
        }
    }

    /// Attach to the existing shared memory mapping identified by id
    pub fn shmem_from_id_and_size(id: ShMemId, map_size: usize) -> Result<Self, Error> {
        unsafe {
            let map = shmat(id.as_int(), ptr::null(), 0) as *mut c_uchar;

            if map as isize == -1 || map.is_null() {
                return Err(Error::last_os_error(format!(
                    "Failed to map the shared mapping with id {id}"
                )));
            }

            Ok(Self {
                id,
                map,
                map_size,
                owned: false,
            })
        }
    }

    /// Attach to the mapping whose id is stored in `env_name`.
    ///
    /// Returns `Ok(None)` if the variable is not set at all.
    pub fn existing_from_env(env_name: &str, map_size: usize) -> Result<Option<Self>, Error> {
        let Ok(id_str) = env::var(env_name) else {
            return Ok(None);
        };
        let id: ShMemId = id_str.parse()?;
        Self::shmem_from_id_and_size(id, map_size).map(Some)
    }

    /// Get the id of this shared memory mapping
    #[must_use]
    pub fn id(&self) -> ShMemId {
        self.id
    }
}

impl Deref for UnixShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map, self.map_size) }
    }
}

impl DerefMut for UnixShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
    }
}

/// Detaches the memory, and removes the segment if we created it.
impl Drop for UnixShMem {
    fn drop(&mut self) {
        unsafe {
            if self.owned {
                shmctl(self.id.as_int(), libc::IPC_RMID, ptr::null_mut());
            }
            if shmdt(self.map as *const _) != 0 {
                log::warn!("Failed to detach shared map {}", self.id);
            }
        }
    }
}
