//! Utilities to parse and load ELFs

use core::{
    cell::OnceCell,
    fmt::{self, Debug, Formatter},
    ops::Range,
};

use goblin::elf::{
    header::{
        EM_386, EM_AARCH64, EM_ARM, EM_MIPS, EM_NONE, EM_PPC, EM_PPC64, EM_SPARC, EM_X86_64,
        ET_DYN, ET_EXEC,
    },
    program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_INTERP, PT_LOAD, PT_PHDR},
    section_header::{SectionHeader, SHT_DYNSYM, SHT_SYMTAB},
    sym::Symtab,
    Elf,
};
use goblin::{container::Ctx, strtab::Strtab};
use ucfork_bolts::Error;

use super::{
    read_padded, Arch, ByteOrder, ImageType, Loader, LoaderHeader, ProgramHeaders, Segment,
    Symbol, SymbolTable,
};
use crate::emu::MmapPerms;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// The machines we can run, everything else is refused
fn machine_to_arch(machine: u16) -> Option<Arch> {
    match machine {
        EM_386 => Some(Arch::X86),
        EM_X86_64 => Some(Arch::X86_64),
        EM_ARM => Some(Arch::Arm),
        EM_AARCH64 => Some(Arch::Arm64),
        EM_MIPS => Some(Arch::Mips),
        EM_PPC => Some(Arch::Ppc),
        EM_PPC64 => Some(Arch::Ppc64),
        EM_SPARC => Some(Arch::Sparc),
        _ => None,
    }
}

fn flags_to_perms(flags: u32) -> MmapPerms {
    let mut bits = 0;
    if flags & PF_R != 0 {
        bits |= 1;
    }
    if flags & PF_W != 0 {
        bits |= 2;
    }
    if flags & PF_X != 0 {
        bits |= 4;
    }
    MmapPerms::from_bits_truncate(bits)
}

/// Magic check only, safe on truncated input
#[must_use]
pub fn detect(bytes: &[u8]) -> bool {
    bytes.starts_with(ELF_MAGIC)
}

pub(super) fn load_boxed<'a>(
    bytes: &'a [u8],
    arch: Option<Arch>,
) -> Result<Box<dyn Loader<'a> + 'a>, Error> {
    Ok(Box::new(ElfLoader::new(bytes, arch)?))
}

/// An ELF image.
///
/// Only the file header and the program header table have to be intact. Sections and
/// symbols are read on a best effort basis, and dynamic linking tables are never parsed,
/// so truncated images still load as far as their segments go.
pub struct ElfLoader<'a> {
    header: LoaderHeader,
    elf: Elf<'a>,
    ctx: Ctx,
    bytes: &'a [u8],
    symbols: OnceCell<Option<SymbolTable>>,
}

impl Debug for ElfLoader<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfLoader")
            .field("header", &self.header)
            .field("program_headers", &self.elf.program_headers.len())
            .field("section_headers", &self.elf.section_headers.len())
            .field("image_len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

fn malformed(err: goblin::error::Error) -> Error {
    Error::malformed_image(format!("{err}"))
}

impl<'a> ElfLoader<'a> {
    /// Parse the image headers. `arch` is only used for images that name no machine.
    pub fn new(bytes: &'a [u8], arch: Option<Arch>) -> Result<Self, Error> {
        let elf_header = Elf::parse_header(bytes).map_err(malformed)?;
        let ctx = Ctx::new(
            elf_header.container().map_err(malformed)?,
            elf_header.endianness().map_err(malformed)?,
        );
        let mut elf = Elf::lazy_parse(elf_header).map_err(malformed)?;
        elf.program_headers = ProgramHeader::parse(
            bytes,
            elf_header.e_phoff as usize,
            usize::from(elf_header.e_phnum),
            ctx,
        )
        .map_err(malformed)?;

        // everything below is optional
        if elf_header.e_shoff != 0 {
            match SectionHeader::parse(
                bytes,
                elf_header.e_shoff as usize,
                usize::from(elf_header.e_shnum),
                ctx,
            ) {
                Ok(section_headers) => elf.section_headers = section_headers,
                Err(err) => log::warn!("Ignoring unreadable section headers: {err}"),
            }
        }
        if let Some(strtab) = elf
            .section_headers
            .get(usize::from(elf_header.e_shstrndx))
            .and_then(|shdr| read_strtab(bytes, shdr))
        {
            elf.shdr_strtab = strtab;
        }

        let bits = if ctx.container.is_big() { 64 } else { 32 };
        let machine = elf_header.e_machine;
        let arch = match (machine_to_arch(machine), arch) {
            (Some(found), Some(hint)) if found != hint => {
                log::warn!("Image is {found}, ignoring requested arch {hint}");
                found
            }
            (Some(found), _) => found,
            (None, Some(hint)) if machine == EM_NONE => hint,
            (None, _) => {
                return Err(Error::unsupported_architecture(format!(
                    "Unsupported machine: {machine}"
                )))
            }
        };
        let byte_order = if ctx.le.is_little() {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        };

        Ok(Self {
            header: LoaderHeader::new(arch, bits, byte_order, "linux", elf_header.e_entry),
            elf,
            ctx,
            bytes,
            symbols: OnceCell::new(),
        })
    }

    /// The underlying goblin view. Only headers, program headers and sections are filled in.
    #[must_use]
    pub fn goblin(&self) -> &Elf<'a> {
        &self.elf
    }

    /// Symbols of one symbol table section, with the names from its linked string table.
    fn read_symbols(&self, shdr: &SectionHeader, dynamic: bool, out: &mut Vec<Symbol>) {
        let strtab = self
            .elf
            .section_headers
            .get(shdr.sh_link as usize)
            .and_then(|link| read_strtab(self.bytes, link));
        let count = if shdr.sh_entsize == 0 {
            0
        } else {
            (shdr.sh_size / shdr.sh_entsize) as usize
        };
        let syms = match Symtab::parse(self.bytes, shdr.sh_offset as usize, count, self.ctx) {
            Ok(syms) => syms,
            Err(err) => {
                log::warn!("Ignoring unreadable symbol table: {err}");
                return;
            }
        };
        for sym in syms.iter() {
            let name = strtab
                .as_ref()
                .and_then(|strtab| strtab.get_at(sym.st_name))
                .unwrap_or("");
            out.push(Symbol {
                name: name.to_string(),
                start: sym.st_value,
                end: sym.st_value.wrapping_add(sym.st_size),
                dynamic,
            });
        }
    }

    fn parse_symbols(&self) -> Option<SymbolTable> {
        let symtab = self
            .elf
            .section_headers
            .iter()
            .find(|shdr| shdr.sh_type == SHT_SYMTAB)?;

        let mut symbols = vec![];
        self.read_symbols(symtab, false, &mut symbols);
        // a missing dynamic table just means there is nothing to add
        if let Some(dynsym) = self
            .elf
            .section_headers
            .iter()
            .find(|shdr| shdr.sh_type == SHT_DYNSYM)
        {
            self.read_symbols(dynsym, true, &mut symbols);
        }
        Some(SymbolTable::new(symbols))
    }
}

fn read_strtab<'a>(bytes: &'a [u8], shdr: &SectionHeader) -> Option<Strtab<'a>> {
    match Strtab::parse(bytes, shdr.sh_offset as usize, shdr.sh_size as usize, 0) {
        Ok(strtab) => Some(strtab),
        Err(err) => {
            log::warn!("Ignoring unreadable string table: {err}");
            None
        }
    }
}

impl<'a> Loader<'a> for ElfLoader<'a> {
    fn header(&self) -> &LoaderHeader {
        &self.header
    }

    fn image_type(&self) -> ImageType {
        match self.elf.header.e_type {
            ET_EXEC => ImageType::Exec,
            ET_DYN => ImageType::Dyn,
            _ => ImageType::Unknown,
        }
    }

    fn interp(&self) -> Option<String> {
        let phdr = self
            .elf
            .program_headers
            .iter()
            .find(|phdr| phdr.p_type == PT_INTERP)?;
        let data = read_padded(self.bytes, phdr.p_offset, phdr.p_filesz);
        let len = data.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
        Some(String::from_utf8_lossy(&data[..len]).into_owned())
    }

    fn program_headers(&self) -> Option<ProgramHeaders> {
        let phdr = self
            .elf
            .program_headers
            .iter()
            .find(|phdr| phdr.p_type == PT_PHDR)?;
        Some(ProgramHeaders {
            offset: phdr.p_offset,
            data: read_padded(self.bytes, phdr.p_offset, phdr.p_memsz),
            count: self.elf.program_headers.len(),
        })
    }

    fn segments(&self) -> Result<Vec<Segment<'a>>, Error> {
        Ok(self
            .elf
            .program_headers
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| {
                Segment::new(
                    self.bytes,
                    phdr.p_offset,
                    phdr.p_vaddr,
                    phdr.p_memsz,
                    phdr.p_filesz,
                    flags_to_perms(phdr.p_flags),
                )
            })
            .collect())
    }

    fn data_segment(&self) -> Option<Range<u64>> {
        self.elf
            .section_headers
            .iter()
            .find(|shdr| self.elf.shdr_strtab.get_at(shdr.sh_name) == Some(".data"))
            .map(|shdr| shdr.sh_addr..shdr.sh_addr.saturating_add(shdr.sh_size))
    }

    fn symbols(&self) -> Result<&SymbolTable, Error> {
        self.symbols
            .get_or_init(|| self.parse_symbols())
            .as_ref()
            .ok_or_else(|| Error::empty("the image, it has no symbol table"))
    }
}
