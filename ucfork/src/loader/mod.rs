//! Executable image loading.
//!
//! A loader turns the raw bytes of an image into the metadata and memory layout the
//! session bootstrap needs. Formats are picked by sniffing the image magic, every format
//! implements [`Loader`] on its own.

use core::ops::Range;
use std::{fs::File, io::Read, path::Path};

use hashbrown::HashMap;
use ucfork_bolts::Error;

use crate::emu::MmapPerms;

pub mod elf;

pub use elf::ElfLoader;

/// Guest architectures we know how to run
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
pub enum Arch {
    /// 32 bit x86
    #[strum(serialize = "x86")]
    X86,
    /// x86-64
    #[strum(serialize = "x86_64")]
    X86_64,
    /// 32 bit ARM
    #[strum(serialize = "arm")]
    Arm,
    /// AArch64
    #[strum(serialize = "arm64")]
    Arm64,
    /// MIPS
    #[strum(serialize = "mips")]
    Mips,
    /// 32 bit PowerPC
    #[strum(serialize = "ppc")]
    Ppc,
    /// 64 bit PowerPC
    #[strum(serialize = "ppc64")]
    Ppc64,
    /// SPARC
    #[strum(serialize = "sparc")]
    Sparc,
}

/// Endianness of the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder {
    /// Store the low `buf.len()` bytes of `value` into `buf`.
    /// Higher bytes are dropped, which is how narrower guest fields get truncated.
    pub fn put_uint(self, buf: &mut [u8], value: u64) {
        let bytes = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        let width = buf.len().min(8);
        match self {
            ByteOrder::Little => buf[..width].copy_from_slice(&bytes[..width]),
            ByteOrder::Big => buf[..width].copy_from_slice(&bytes[8 - width..]),
        }
    }

    /// Read an unsigned value from all of `buf`, at most 8 bytes.
    #[must_use]
    pub fn get_uint(self, buf: &[u8]) -> u64 {
        let width = buf.len().min(8);
        let mut bytes = [0_u8; 8];
        match self {
            ByteOrder::Little => {
                bytes[..width].copy_from_slice(&buf[..width]);
                u64::from_le_bytes(bytes)
            }
            ByteOrder::Big => {
                bytes[8 - width..].copy_from_slice(&buf[..width]);
                u64::from_be_bytes(bytes)
            }
        }
    }
}

/// Per image metadata, fixed once the image is parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderHeader {
    arch: Arch,
    bits: u32,
    byte_order: ByteOrder,
    os: String,
    entry: u64,
}

impl LoaderHeader {
    /// Metadata for an image of `bits` width, starting at `entry`
    #[must_use]
    pub fn new(arch: Arch, bits: u32, byte_order: ByteOrder, os: &str, entry: u64) -> Self {
        Self {
            arch,
            bits,
            byte_order,
            os: os.to_string(),
            entry,
        }
    }

    /// The guest architecture
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// 32 or 64
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// The guest endianness
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// The OS personality tag, e.g. `linux`
    #[must_use]
    pub fn os(&self) -> &str {
        &self.os
    }

    /// Entry point address
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }
}

/// What kind of image it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// Fixed address executable
    Exec,
    /// Position independent executable or shared library
    Dyn,
    /// Anything else, e.g. a relocatable object
    Unknown,
}

/// A loadable segment. It borrows the image bytes, the data is only copied out when
/// [`Segment::data`] is called.
#[derive(Debug, Clone)]
pub struct Segment<'a> {
    /// Where the data starts in the image
    pub file_offset: u64,
    /// Guest load address
    pub addr: u64,
    /// Never smaller than `file_size`, the tail past the file data is zero
    pub mem_size: u64,
    /// Bytes backed by the image
    pub file_size: u64,
    /// Protection to map it with
    pub prot: MmapPerms,
    image: &'a [u8],
}

impl<'a> Segment<'a> {
    /// A segment of `image`. `mem_size` is raised to `file_size` if smaller.
    #[must_use]
    pub fn new(
        image: &'a [u8],
        file_offset: u64,
        addr: u64,
        mem_size: u64,
        file_size: u64,
        prot: MmapPerms,
    ) -> Self {
        Self {
            file_offset,
            addr,
            mem_size: mem_size.max(file_size),
            file_size,
            prot,
            image,
        }
    }

    /// The `file_size` bytes backing this segment.
    /// Whatever lies past the end of the image reads as zero.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        read_padded(self.image, self.file_offset, self.file_size)
    }
}

/// Upper bound for a single padded read, keeps bogus header sizes from exhausting memory
const MAX_PADDED_READ: u64 = 1 << 32;

/// `len` bytes of `image` starting at `offset`, zero padded where the image is short.
pub(crate) fn read_padded(image: &[u8], offset: u64, len: u64) -> Vec<u8> {
    let len = len.min(MAX_PADDED_READ) as usize;
    let start = usize::try_from(offset).map_or(image.len(), |off| off.min(image.len()));
    let end = start.saturating_add(len).min(image.len());
    let mut data = image[start..end].to_vec();
    data.resize(len, 0);
    data
}

/// The program header table, as the guest auxiliary vector wants it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHeaders {
    /// File offset of the table
    pub offset: u64,
    /// The raw table
    pub data: Vec<u8>,
    /// Number of entries
    pub count: usize,
}

/// A named address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name, empty if the string table was unreadable
    pub name: String,
    /// First address
    pub start: u64,
    /// One past the last address
    pub end: u64,
    /// Comes from the dynamic symbol table
    pub dynamic: bool,
}

impl Symbol {
    /// Whether `addr` falls inside the symbol
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// All symbols of an image. Names are not unique.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, Vec<usize>>,
}

impl SymbolTable {
    /// Index `symbols` by name
    #[must_use]
    pub fn new(symbols: Vec<Symbol>) -> Self {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, sym) in symbols.iter().enumerate() {
            by_name.entry(sym.name.clone()).or_default().push(idx);
        }
        Self { symbols, by_name }
    }

    /// All symbols, static ones first
    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Number of symbols
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether there are no symbols at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Every address range known under `name`
    pub fn ranges<'s>(&'s self, name: &str) -> impl Iterator<Item = Range<u64>> + 's {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .map(|idx| self.symbols[*idx].start..self.symbols[*idx].end)
    }

    /// Address of `name`, static symbols win over dynamic ones
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<u64> {
        let candidates = self.by_name.get(name)?;
        candidates
            .iter()
            .map(|idx| &self.symbols[*idx])
            .filter(|sym| sym.start != 0)
            .min_by_key(|sym| sym.dynamic)
            .map(|sym| sym.start)
    }

    /// The symbol covering `addr`, if any
    #[must_use]
    pub fn symbolicate(&self, addr: u64) -> Option<&Symbol> {
        self.symbols
            .iter()
            .filter(|sym| sym.contains(addr))
            .min_by_key(|sym| sym.end - sym.start)
    }
}

/// The contract every image format implements.
pub trait Loader<'a> {
    /// Arch, width, byte order, OS and entry point
    fn header(&self) -> &LoaderHeader;

    /// Executable, shared object, or something else
    fn image_type(&self) -> ImageType;

    /// The dynamic linker requested by the image, `None` for static images
    fn interp(&self) -> Option<String>;

    /// Where the program header table lives, for the auxiliary vector
    fn program_headers(&self) -> Option<ProgramHeaders>;

    /// Loadable segments in file order
    fn segments(&self) -> Result<Vec<Segment<'a>>, Error>;

    /// Address range of the initialized data section
    fn data_segment(&self) -> Option<Range<u64>>;

    /// The symbol table, parsed on first use
    fn symbols(&self) -> Result<&SymbolTable, Error>;
}

/// A known image format
#[derive(Debug, Clone, Copy)]
pub struct ImageFormat {
    /// Short format name, e.g. `elf`
    pub name: &'static str,
    /// Cheap magic check, never fails
    pub detect: fn(&[u8]) -> bool,
    /// Parse an image of this format
    pub load: for<'a> fn(&'a [u8], Option<Arch>) -> Result<Box<dyn Loader<'a> + 'a>, Error>,
}

/// Formats are tried in this order
pub static IMAGE_FORMATS: &[ImageFormat] = &[ImageFormat {
    name: "elf",
    detect: elf::detect,
    load: elf::load_boxed,
}];

/// The name of the first format whose magic matches
#[must_use]
pub fn detect(bytes: &[u8]) -> Option<&'static str> {
    IMAGE_FORMATS
        .iter()
        .find(|format| (format.detect)(bytes))
        .map(|format| format.name)
}

/// Parse `bytes` with the first format whose magic matches.
///
/// `arch` is only consulted when the image does not name a machine itself.
pub fn load<'a>(bytes: &'a [u8], arch: Option<Arch>) -> Result<Box<dyn Loader<'a> + 'a>, Error> {
    let format = IMAGE_FORMATS
        .iter()
        .find(|format| (format.detect)(bytes))
        .ok_or_else(|| Error::illegal_argument("Unrecognized executable format"))?;
    log::debug!("Loading image as {}", format.name);
    (format.load)(bytes, arch)
}

/// Read the image at `path` into `buffer` and [`load`] it.
/// The returned loader borrows `buffer`, so it stays alive as long as the segments do.
pub fn load_file<'a, P>(
    path: P,
    buffer: &'a mut Vec<u8>,
    arch: Option<Arch>,
) -> Result<Box<dyn Loader<'a> + 'a>, Error>
where
    P: AsRef<Path>,
{
    let mut binary_file = File::open(path)?;
    binary_file.read_to_end(buffer)?;
    load(buffer, arch)
}

#[cfg(test)]
mod tests {
    use super::{detect, load, read_padded, Arch, ByteOrder, Symbol, SymbolTable};

    #[test]
    fn test_arch_tags() {
        assert_eq!(Arch::X86_64.to_string(), "x86_64");
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert!("z80".parse::<Arch>().is_err());
    }

    #[test]
    fn test_byte_order_truncates() {
        let mut buf = [0_u8; 4];
        ByteOrder::Little.put_uint(&mut buf, 0x1_2233_4455);
        assert_eq!(buf, [0x55, 0x44, 0x33, 0x22]);
        ByteOrder::Big.put_uint(&mut buf, 0x1_2233_4455);
        assert_eq!(buf, [0x22, 0x33, 0x44, 0x55]);
        assert_eq!(ByteOrder::Big.get_uint(&buf), 0x2233_4455);
    }

    #[test]
    fn test_read_padded() {
        let image = [1_u8, 2, 3, 4];
        assert_eq!(read_padded(&image, 2, 4), [3, 4, 0, 0]);
        assert_eq!(read_padded(&image, 10, 2), [0, 0]);
        assert_eq!(read_padded(&image, 0, 0), Vec::<u8>::new());
    }

    #[test]
    fn test_detect_garbage() {
        assert_eq!(detect(b""), None);
        assert_eq!(detect(b"\x7fEL"), None);
        assert_eq!(detect(b"MZ\x90\x00"), None);
        assert!(load(b"#!/bin/sh\n", None).is_err());
    }

    #[test]
    fn test_symbol_table() {
        let table = SymbolTable::new(vec![
            Symbol {
                name: "main".into(),
                start: 0x1000,
                end: 0x1080,
                dynamic: true,
            },
            Symbol {
                name: "main".into(),
                start: 0x2000,
                end: 0x2040,
                dynamic: false,
            },
            Symbol {
                name: "_start".into(),
                start: 0x2000,
                end: 0x2100,
                dynamic: false,
            },
        ]);
        assert_eq!(table.resolve("main"), Some(0x2000));
        assert_eq!(table.ranges("main").count(), 2);
        assert_eq!(table.symbolicate(0x2010).unwrap().name, "main");
        assert_eq!(table.symbolicate(0x2080).unwrap().name, "_start");
        assert!(table.symbolicate(0x3000).is_none());
        assert_eq!(table.resolve("missing"), None);
    }
}
