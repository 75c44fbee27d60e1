//! `struct stat` layouts of the guest ABIs we emulate.
//!
//! A layout is a list of [`StatField`]s: where a host value goes and how wide the guest
//! field is. Fields narrower than the host value keep its low bytes only.

use std::{fs::Metadata, os::unix::fs::MetadataExt};

use strum_macros::EnumIter;
use ucfork_bolts::Error;

use crate::loader::ByteOrder;

/// The host side of a `stat` call, widened to 64 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStat {
    /// `st_dev`
    pub dev: u64,
    /// `st_ino`
    pub ino: u64,
    /// `st_mode`, type and permission bits
    pub mode: u32,
    /// `st_nlink`
    pub nlink: u64,
    /// `st_uid`
    pub uid: u32,
    /// `st_gid`
    pub gid: u32,
    /// `st_rdev`
    pub rdev: u64,
    /// `st_size` in bytes
    pub size: i64,
    /// `st_blksize`
    pub blksize: u64,
    /// `st_blocks`, 512 byte units
    pub blocks: u64,
    /// Access time, seconds
    pub atime: i64,
    /// Access time, nanoseconds
    pub atime_nsec: i64,
    /// Modification time, seconds
    pub mtime: i64,
    /// Modification time, nanoseconds
    pub mtime_nsec: i64,
    /// Status change time, seconds
    pub ctime: i64,
    /// Status change time, nanoseconds
    pub ctime_nsec: i64,
}

impl HostStat {
    /// Collect the fields from a host `stat` result
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size() as i64,
            blksize: meta.blksize(),
            blocks: meta.blocks(),
            atime: meta.atime(),
            atime_nsec: meta.atime_nsec(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            ctime: meta.ctime(),
            ctime_nsec: meta.ctime_nsec(),
        }
    }

    /// The raw bits of a field, signed values as two's complement.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn get(&self, key: StatKey) -> u64 {
        match key {
            StatKey::Dev => self.dev,
            StatKey::Ino => self.ino,
            StatKey::Mode => u64::from(self.mode),
            StatKey::Nlink => self.nlink,
            StatKey::Uid => u64::from(self.uid),
            StatKey::Gid => u64::from(self.gid),
            StatKey::Rdev => self.rdev,
            StatKey::Size => self.size as u64,
            StatKey::Blksize => self.blksize,
            StatKey::Blocks => self.blocks,
            StatKey::Atime => self.atime as u64,
            StatKey::AtimeNsec => self.atime_nsec as u64,
            StatKey::Mtime => self.mtime as u64,
            StatKey::MtimeNsec => self.mtime_nsec as u64,
            StatKey::Ctime => self.ctime as u64,
            StatKey::CtimeNsec => self.ctime_nsec as u64,
        }
    }
}

/// Names a [`HostStat`] field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum StatKey {
    /// [`HostStat::dev`]
    Dev,
    /// [`HostStat::ino`]
    Ino,
    /// [`HostStat::mode`]
    Mode,
    /// [`HostStat::nlink`]
    Nlink,
    /// [`HostStat::uid`]
    Uid,
    /// [`HostStat::gid`]
    Gid,
    /// [`HostStat::rdev`]
    Rdev,
    /// [`HostStat::size`]
    Size,
    /// [`HostStat::blksize`]
    Blksize,
    /// [`HostStat::blocks`]
    Blocks,
    /// [`HostStat::atime`]
    Atime,
    /// [`HostStat::atime_nsec`]
    AtimeNsec,
    /// [`HostStat::mtime`]
    Mtime,
    /// [`HostStat::mtime_nsec`]
    MtimeNsec,
    /// [`HostStat::ctime`]
    Ctime,
    /// [`HostStat::ctime_nsec`]
    CtimeNsec,
}

/// Placement of one host value in a guest struct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatField {
    /// The host value
    pub key: StatKey,
    /// Byte offset in the guest struct
    pub offset: usize,
    /// Guest field width in bytes
    pub width: usize,
}

const fn field(key: StatKey, offset: usize, width: usize) -> StatField {
    StatField { key, offset, width }
}

/// A guest `struct stat`. Bytes not covered by a field (padding, reserved) stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatLayout {
    /// `sizeof(struct stat)` on the guest
    pub size: usize,
    /// Fields in offset order
    pub fields: &'static [StatField],
}

impl StatLayout {
    /// Serialize `host` into this layout.
    #[must_use]
    pub fn write(&self, host: &HostStat, byte_order: ByteOrder) -> Vec<u8> {
        let mut buf = vec![0; self.size];
        for f in self.fields {
            byte_order.put_uint(&mut buf[f.offset..f.offset + f.width], host.get(f.key));
        }
        buf
    }

    /// Read a single field back out of a buffer in this layout.
    #[must_use]
    pub fn read(&self, buf: &[u8], key: StatKey, byte_order: ByteOrder) -> Option<u64> {
        let f = self.fields.iter().find(|f| f.key == key)?;
        buf.get(f.offset..f.offset + f.width)
            .map(|bytes| byte_order.get_uint(bytes))
    }
}

/// i386 `struct stat`
pub static LINUX_STAT_32: StatLayout = StatLayout {
    size: 64,
    fields: &[
        field(StatKey::Dev, 0, 4),
        field(StatKey::Ino, 4, 4),
        field(StatKey::Mode, 8, 2),
        field(StatKey::Nlink, 10, 2),
        field(StatKey::Uid, 12, 2),
        field(StatKey::Gid, 14, 2),
        field(StatKey::Rdev, 16, 4),
        field(StatKey::Size, 20, 4),
        field(StatKey::Blksize, 24, 4),
        field(StatKey::Blocks, 28, 4),
        field(StatKey::Atime, 32, 4),
        field(StatKey::AtimeNsec, 36, 4),
        field(StatKey::Mtime, 40, 4),
        field(StatKey::MtimeNsec, 44, 4),
        field(StatKey::Ctime, 48, 4),
        field(StatKey::CtimeNsec, 52, 4),
    ],
};

/// `x86_64` `struct stat`
pub static LINUX_STAT_64: StatLayout = StatLayout {
    size: 144,
    fields: &[
        field(StatKey::Dev, 0, 8),
        field(StatKey::Ino, 8, 8),
        field(StatKey::Nlink, 16, 8),
        field(StatKey::Mode, 24, 4),
        field(StatKey::Uid, 28, 4),
        field(StatKey::Gid, 32, 4),
        field(StatKey::Rdev, 40, 8),
        field(StatKey::Size, 48, 8),
        field(StatKey::Blksize, 56, 8),
        field(StatKey::Blocks, 64, 8),
        field(StatKey::Atime, 72, 8),
        field(StatKey::AtimeNsec, 80, 8),
        field(StatKey::Mtime, 88, 8),
        field(StatKey::MtimeNsec, 96, 8),
        field(StatKey::Ctime, 104, 8),
        field(StatKey::CtimeNsec, 112, 8),
    ],
};

/// The linux `struct stat` for a guest of the given width.
pub fn linux_stat_layout(bits: u32) -> Result<&'static StatLayout, Error> {
    match bits {
        32 => Ok(&LINUX_STAT_32),
        64 => Ok(&LINUX_STAT_64),
        _ => Err(Error::not_implemented(format!(
            "No linux stat layout for {bits}-bit guests"
        ))),
    }
}

/// Translate a host stat into the linux guest layout for `bits`.
pub fn translate_stat(host: &HostStat, bits: u32, byte_order: ByteOrder) -> Result<Vec<u8>, Error> {
    Ok(linux_stat_layout(bits)?.write(host, byte_order))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use strum::IntoEnumIterator;

    use super::{
        linux_stat_layout, translate_stat, HostStat, StatKey, LINUX_STAT_32, LINUX_STAT_64,
    };
    use crate::loader::ByteOrder;

    fn sample() -> HostStat {
        HostStat {
            dev: 0x803,
            ino: 0x1_2345_6789,
            mode: 0o100_644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 4242,
            blksize: 4096,
            blocks: 16,
            atime: 1_700_000_000,
            atime_nsec: 5,
            mtime: 1_700_000_001,
            mtime_nsec: 6,
            ctime: 1_700_000_002,
            ctime_nsec: 7,
        }
    }

    #[test]
    fn test_layouts_are_sane() {
        for layout in [&LINUX_STAT_32, &LINUX_STAT_64] {
            let mut covered = vec![false; layout.size];
            for f in layout.fields {
                for b in &mut covered[f.offset..f.offset + f.width] {
                    assert!(!*b, "{:?} overlaps another field", f.key);
                    *b = true;
                }
            }
            // every key is placed exactly once
            for key in StatKey::iter() {
                assert_eq!(layout.fields.iter().filter(|f| f.key == key).count(), 1);
            }
        }
    }

    #[test]
    fn test_stat_64() {
        let host = sample();
        let buf = translate_stat(&host, 64, ByteOrder::Little).unwrap();
        assert_eq!(buf.len(), 144);
        assert_eq!(&buf[8..16], &0x1_2345_6789_u64.to_le_bytes());
        assert_eq!(&buf[24..28], &0o100_644_u32.to_le_bytes());
        assert_eq!(&buf[48..56], &4242_u64.to_le_bytes());
        assert_eq!(&buf[120..], &[0; 24]);
    }

    #[test]
    fn test_stat_32_truncates_inode() {
        let host = sample();
        let buf = translate_stat(&host, 32, ByteOrder::Little).unwrap();
        assert_eq!(buf.len(), 64);
        let ino = LINUX_STAT_32.read(&buf, StatKey::Ino, ByteOrder::Little);
        assert_eq!(ino, Some(host.ino % (1 << 32)));
        assert_eq!(ino, Some(0x2345_6789));
    }

    #[test]
    fn test_stat_32_big_endian() {
        let host = sample();
        let buf = translate_stat(&host, 32, ByteOrder::Big).unwrap();
        assert_eq!(&buf[8..10], &(0o100_644_u16).to_be_bytes());
        assert_eq!(&buf[12..14], &1000_u16.to_be_bytes());
        assert_eq!(
            LINUX_STAT_32.read(&buf, StatKey::Mtime, ByteOrder::Big),
            Some(1_700_000_001)
        );
    }

    #[test]
    fn test_unknown_width() {
        assert!(linux_stat_layout(16).is_err());
    }

    #[test]
    fn test_from_metadata() {
        let path = std::env::temp_dir().join(format!("ucfork_stat_{}", std::process::id()));
        fs::write(&path, b"0123456789").unwrap();
        let host = HostStat::from_metadata(&fs::metadata(&path).unwrap());
        fs::remove_file(&path).unwrap();

        assert_eq!(host.size, 10);
        assert_eq!(host.mode & libc::S_IFMT as u32, libc::S_IFREG as u32);
        let buf = translate_stat(&host, 64, ByteOrder::Little).unwrap();
        assert_eq!(
            LINUX_STAT_64.read(&buf, StatKey::Size, ByteOrder::Little),
            Some(10)
        );
    }
}
