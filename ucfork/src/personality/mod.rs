//! The syscall ABI of the guest OS: struct layouts and flag encodings.
//!
//! Everything here is stateless. A [`Personality`] only selects which table to use.

use core::str::FromStr;

use libc::c_int;
use ucfork_bolts::Error;

use crate::loader::{ByteOrder, LoaderHeader};

pub mod mmap;
pub mod stat;

pub use mmap::translate_mmap_flags;
pub use stat::{translate_stat, HostStat};

/// The OS ABIs a guest can be written against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum GuestOs {
    /// Linux syscall ABI
    Linux,
    /// macOS syscall ABI
    Darwin,
}

/// The guest ABI of one image: OS, word size and byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Personality {
    os: GuestOs,
    bits: u32,
    byte_order: ByteOrder,
}

impl Personality {
    /// A personality for an explicit ABI
    #[must_use]
    pub fn new(os: GuestOs, bits: u32, byte_order: ByteOrder) -> Self {
        Self {
            os,
            bits,
            byte_order,
        }
    }

    /// The personality a freshly loaded image asks for.
    pub fn for_header(header: &LoaderHeader) -> Result<Self, Error> {
        let os = GuestOs::from_str(header.os())
            .map_err(|_| Error::not_implemented(format!("No personality for os {}", header.os())))?;
        Ok(Self::new(os, header.bits(), header.byte_order()))
    }

    /// The guest OS
    #[must_use]
    pub fn os(&self) -> GuestOs {
        self.os
    }

    /// 32 or 64
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Lay out `host` as this guest's `struct stat`.
    pub fn translate_stat(&self, host: &HostStat) -> Result<Vec<u8>, Error> {
        match self.os {
            GuestOs::Linux => stat::translate_stat(host, self.bits, self.byte_order),
            GuestOs::Darwin => Err(Error::not_implemented(format!(
                "darwin {}-bit stat translation",
                self.bits
            ))),
        }
    }

    /// Best effort: flags the host does not know are dropped, never rejected.
    #[must_use]
    pub fn translate_mmap_flags(&self, guest: u32) -> c_int {
        let table = match self.os {
            GuestOs::Linux => mmap::LINUX_MMAP_FLAGS,
            GuestOs::Darwin => mmap::DARWIN_MMAP_FLAGS,
        };
        mmap::translate_mmap_flags(table, guest)
    }
}

#[cfg(test)]
mod tests {
    use ucfork_bolts::Error;

    use super::{GuestOs, HostStat, Personality};
    use crate::loader::{Arch, ByteOrder, LoaderHeader};

    #[test]
    fn test_for_header() {
        let header = LoaderHeader::new(Arch::Arm, 32, ByteOrder::Little, "linux", 0x8000);
        let personality = Personality::for_header(&header).unwrap();
        assert_eq!(personality.os(), GuestOs::Linux);
        assert_eq!(personality.bits(), 32);

        let header = LoaderHeader::new(Arch::Arm, 32, ByteOrder::Little, "plan9", 0x8000);
        assert!(matches!(
            Personality::for_header(&header),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn test_darwin_stat_not_implemented() {
        let darwin = Personality::new(GuestOs::Darwin, 64, ByteOrder::Little);
        assert!(matches!(
            darwin.translate_stat(&HostStat::default()),
            Err(Error::NotImplemented(_))
        ));
        // mmap flags still work
        assert_eq!(
            darwin.translate_mmap_flags(0x1002),
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE
        );
    }

    #[test]
    fn test_linux_dispatch() {
        let linux = Personality::new(GuestOs::Linux, 32, ByteOrder::Big);
        assert_eq!(linux.translate_stat(&HostStat::default()).unwrap().len(), 64);
        assert_eq!(linux.translate_mmap_flags(0x21), libc::MAP_SHARED | libc::MAP_ANONYMOUS);
    }
}
