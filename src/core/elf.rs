// ELF dynamic-table parsing: the ordered DT_NEEDED list of a shared object.
//
// Read-only. Every field read is bounds-checked against the mapped length;
// a short read is a MalformedBinary error, never a zero-filled value.
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::core::error::{Error, ErrorKind};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

// e_phnum sentinel: the real count lives in section header 0's sh_info.
const PN_XNUM: u16 = 0xffff;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;

/// Parse the shared object at `path` and return its declared runtime
/// dependency names, in dynamic-table order.
pub fn read_dependencies(path: &Path) -> Result<Vec<String>, Error> {
    let file = File::open(path).map_err(|err| {
        Error::new(ErrorKind::Storage)
            .with_message("cannot open shared object")
            .with_path(path)
            .with_source(err)
    })?;
    let map = unsafe {
        Mmap::map(&file).map_err(|err| {
            Error::new(ErrorKind::Storage)
                .with_message("cannot map shared object")
                .with_path(path)
                .with_source(err)
        })?
    };
    read_dependencies_bytes(&map).map_err(|err| err.with_path(path))
}

/// Same as [`read_dependencies`] but over an in-memory image.
pub fn read_dependencies_bytes(data: &[u8]) -> Result<Vec<String>, Error> {
    let image = Image::classify(data)?;
    let layout = image.layout();

    let phoff = image.addr(layout.e_phoff)?;
    let phentsize = u64::from(image.u16(layout.e_phentsize)?);
    if phentsize < layout.min_phentsize {
        return Err(malformed("program header entry too small"));
    }
    let mut phnum = u64::from(image.u16(layout.e_phnum)?);
    if phnum == u64::from(PN_XNUM) {
        // Extended count: e_phnum overflowed, section header 0 holds the truth.
        let shoff = image.addr(layout.e_shoff)?;
        if shoff == 0 {
            return Err(malformed("extended program header count without section headers"));
        }
        phnum = u64::from(image.u32(add(shoff, layout.sh0_info)?)?);
    }

    let dyn_start = find_dynamic(&image, layout, phoff, phentsize, phnum)?;

    // First pass: count DT_NEEDED and find the string table's virtual address.
    let mut needed_count: u32 = 0;
    let mut strtab_vaddr: Option<u64> = None;
    let mut off = dyn_start;
    loop {
        let (tag, value) = image.dyn_entry(off)?;
        if tag == DT_NULL {
            break;
        }
        match tag {
            DT_NEEDED => {
                needed_count = needed_count
                    .checked_add(1)
                    .ok_or_else(|| malformed("needed-entry count overflow"))?;
            }
            DT_STRTAB => strtab_vaddr = Some(value),
            _ => {}
        }
        off = add(off, layout.dyn_entsize)?;
    }
    let Some(strtab_vaddr) = strtab_vaddr else {
        return Err(malformed("dynamic section has no string table"));
    };

    let strtab_off = translate_vaddr(&image, layout, phoff, phentsize, phnum, strtab_vaddr)?;

    // Second pass: resolve each DT_NEEDED value through the string table.
    let mut needed = Vec::with_capacity(needed_count as usize);
    let mut off = dyn_start;
    loop {
        let (tag, value) = image.dyn_entry(off)?;
        if tag == DT_NULL {
            break;
        }
        if tag == DT_NEEDED {
            needed.push(read_cstr(data, add(strtab_off, value)?)?);
        }
        off = add(off, layout.dyn_entsize)?;
    }
    Ok(needed)
}

fn find_dynamic(
    image: &Image<'_>,
    layout: &Layout,
    phoff: u64,
    phentsize: u64,
    phnum: u64,
) -> Result<u64, Error> {
    for i in 0..phnum {
        let ph = add(phoff, mul(i, phentsize)?)?;
        if image.u32(add(ph, layout.ph_type)?)? == PT_DYNAMIC {
            return image.addr(add(ph, layout.ph_offset)?);
        }
    }
    Err(malformed("no dynamic segment"))
}

// DT_STRTAB holds a virtual address; find the loadable segment covering it
// and apply that segment's vaddr-to-file-offset delta.
fn translate_vaddr(
    image: &Image<'_>,
    layout: &Layout,
    phoff: u64,
    phentsize: u64,
    phnum: u64,
    vaddr: u64,
) -> Result<u64, Error> {
    for i in 0..phnum {
        let ph = add(phoff, mul(i, phentsize)?)?;
        if image.u32(add(ph, layout.ph_type)?)? != PT_LOAD {
            continue;
        }
        let p_vaddr = image.addr(add(ph, layout.ph_vaddr)?)?;
        let p_filesz = image.addr(add(ph, layout.ph_filesz)?)?;
        if vaddr >= p_vaddr && vaddr - p_vaddr < p_filesz {
            let p_offset = image.addr(add(ph, layout.ph_offset)?)?;
            return add(p_offset, vaddr - p_vaddr);
        }
    }
    Err(malformed("string table address not covered by any load segment"))
}

fn read_cstr(data: &[u8], offset: u64) -> Result<String, Error> {
    if offset >= data.len() as u64 {
        return Err(truncated());
    }
    let start = offset as usize;
    let len = data[start..]
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| malformed("unterminated dependency name"))?;
    Ok(String::from_utf8_lossy(&data[start..start + len]).into_owned())
}

fn malformed(message: &str) -> Error {
    Error::new(ErrorKind::MalformedBinary).with_message(message)
}

fn truncated() -> Error {
    malformed("truncated file")
}

fn add(a: u64, b: u64) -> Result<u64, Error> {
    a.checked_add(b).ok_or_else(truncated)
}

fn mul(a: u64, b: u64) -> Result<u64, Error> {
    a.checked_mul(b).ok_or_else(truncated)
}

// Width-invariant offsets differ between the two classes only where field
// sizes differ; everything downstream keys off this table.
struct Layout {
    e_phoff: u64,
    e_shoff: u64,
    e_phentsize: u64,
    e_phnum: u64,
    min_phentsize: u64,
    ph_type: u64,
    ph_offset: u64,
    ph_vaddr: u64,
    ph_filesz: u64,
    sh0_info: u64,
    dyn_entsize: u64,
}

const LAYOUT32: Layout = Layout {
    e_phoff: 28,
    e_shoff: 32,
    e_phentsize: 42,
    e_phnum: 44,
    min_phentsize: 32,
    ph_type: 0,
    ph_offset: 4,
    ph_vaddr: 8,
    ph_filesz: 16,
    sh0_info: 28,
    dyn_entsize: 8,
};

const LAYOUT64: Layout = Layout {
    e_phoff: 32,
    e_shoff: 40,
    e_phentsize: 54,
    e_phnum: 56,
    min_phentsize: 56,
    ph_type: 0,
    ph_offset: 8,
    ph_vaddr: 16,
    ph_filesz: 32,
    sh0_info: 44,
    dyn_entsize: 16,
};

struct Image<'a> {
    data: &'a [u8],
    class64: bool,
    little_endian: bool,
}

impl<'a> Image<'a> {
    fn classify(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < EI_NIDENT {
            return Err(truncated());
        }
        if data[0..4] != ELF_MAGIC {
            return Err(malformed("bad magic"));
        }
        let class64 = match data[EI_CLASS] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            _ => return Err(malformed("unsupported word width")),
        };
        let little_endian = match data[EI_DATA] {
            ELFDATA2LSB => true,
            ELFDATA2MSB => false,
            _ => return Err(malformed("unsupported byte order")),
        };
        Ok(Self {
            data,
            class64,
            little_endian,
        })
    }

    fn layout(&self) -> &'static Layout {
        if self.class64 { &LAYOUT64 } else { &LAYOUT32 }
    }

    fn bytes(&self, offset: u64, len: u64) -> Result<&'a [u8], Error> {
        let end = add(offset, len)?;
        if end > self.data.len() as u64 {
            return Err(truncated());
        }
        Ok(&self.data[offset as usize..end as usize])
    }

    fn u16(&self, offset: u64) -> Result<u16, Error> {
        let bytes = self.bytes(offset, 2)?;
        let raw = [bytes[0], bytes[1]];
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    fn u32(&self, offset: u64) -> Result<u32, Error> {
        let bytes = self.bytes(offset, 4)?;
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn u64(&self, offset: u64) -> Result<u64, Error> {
        let bytes = self.bytes(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        })
    }

    // Class-width field: 4 bytes on ELF32, 8 on ELF64.
    fn addr(&self, offset: u64) -> Result<u64, Error> {
        if self.class64 {
            self.u64(offset)
        } else {
            self.u32(offset).map(u64::from)
        }
    }

    fn dyn_entry(&self, offset: u64) -> Result<(u64, u64), Error> {
        let tag = self.addr(offset)?;
        let value = self.addr(add(offset, if self.class64 { 8 } else { 4 })?)?;
        Ok((tag, value))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    // Minimal dynamic shared objects assembled by hand for parser and
    // chain-loading tests. One PT_LOAD covers the whole file at LOAD_VADDR,
    // so vaddr translation is exercised with a nonzero delta.
    pub(crate) const LOAD_VADDR: u64 = 0x40_0000;

    pub(crate) struct Elf64Opts {
        pub le: bool,
        pub extended_phnum: bool,
        pub omit_dynamic: bool,
        pub omit_strtab_entry: bool,
        pub strtab_vaddr_override: Option<u64>,
    }

    impl Default for Elf64Opts {
        fn default() -> Self {
            Self {
                le: true,
                extended_phnum: false,
                omit_dynamic: false,
                omit_strtab_entry: false,
                strtab_vaddr_override: None,
            }
        }
    }

    struct Emit {
        buf: Vec<u8>,
        le: bool,
    }

    impl Emit {
        fn u16(&mut self, value: u16) {
            if self.le {
                self.buf.extend(value.to_le_bytes());
            } else {
                self.buf.extend(value.to_be_bytes());
            }
        }

        fn u32(&mut self, value: u32) {
            if self.le {
                self.buf.extend(value.to_le_bytes());
            } else {
                self.buf.extend(value.to_be_bytes());
            }
        }

        fn u64(&mut self, value: u64) {
            if self.le {
                self.buf.extend(value.to_le_bytes());
            } else {
                self.buf.extend(value.to_be_bytes());
            }
        }

        fn pad(&mut self, len: usize) {
            self.buf.resize(self.buf.len() + len, 0);
        }
    }

    fn strtab_for(deps: &[&str]) -> (Vec<u8>, Vec<u64>) {
        let mut strtab = vec![0u8];
        let mut offsets = Vec::with_capacity(deps.len());
        for dep in deps {
            offsets.push(strtab.len() as u64);
            strtab.extend(dep.as_bytes());
            strtab.push(0);
        }
        (strtab, offsets)
    }

    pub(crate) fn elf64(le: bool, deps: &[&str]) -> Vec<u8> {
        elf64_with(deps, Elf64Opts { le, ..Elf64Opts::default() })
    }

    pub(crate) fn elf64_with(deps: &[&str], opts: Elf64Opts) -> Vec<u8> {
        let phnum: u64 = 2;
        let phoff: u64 = 64;
        let dyn_off = phoff + phnum * 56;
        let dyn_len = (deps.len() as u64 + 2) * 16;
        let strtab_off = dyn_off + dyn_len;
        let (strtab, name_offsets) = strtab_for(deps);
        let shoff = if opts.extended_phnum {
            strtab_off + strtab.len() as u64
        } else {
            0
        };
        let file_len = strtab_off + strtab.len() as u64 + if opts.extended_phnum { 64 } else { 0 };

        let mut e = Emit {
            buf: Vec::new(),
            le: opts.le,
        };
        e.buf.extend([
            0x7f,
            b'E',
            b'L',
            b'F',
            2,
            if opts.le { 1 } else { 2 },
            1,
        ]);
        e.pad(9);
        e.u16(3); // ET_DYN
        e.u16(if opts.le { 0x3e } else { 0xb7 });
        e.u32(1);
        e.u64(0); // e_entry
        e.u64(phoff);
        e.u64(shoff);
        e.u32(0); // e_flags
        e.u16(64); // e_ehsize
        e.u16(56); // e_phentsize
        e.u16(if opts.extended_phnum { 0xffff } else { phnum as u16 });
        e.u16(64); // e_shentsize
        e.u16(if opts.extended_phnum { 1 } else { 0 });
        e.u16(0); // e_shstrndx

        // PT_LOAD covering the whole file
        e.u32(1);
        e.u32(5);
        e.u64(0);
        e.u64(LOAD_VADDR);
        e.u64(LOAD_VADDR);
        e.u64(file_len);
        e.u64(file_len);
        e.u64(0x1000);

        // PT_DYNAMIC (or a NULL segment when omitted)
        e.u32(if opts.omit_dynamic { 0 } else { 2 });
        e.u32(6);
        e.u64(dyn_off);
        e.u64(LOAD_VADDR + dyn_off);
        e.u64(LOAD_VADDR + dyn_off);
        e.u64(dyn_len);
        e.u64(dyn_len);
        e.u64(8);

        for offset in &name_offsets {
            e.u64(1); // DT_NEEDED
            e.u64(*offset);
        }
        if opts.omit_strtab_entry {
            e.u64(0x6ffffef5); // an unrelated tag keeps the entry count intact
            e.u64(0);
        } else {
            e.u64(5); // DT_STRTAB
            e.u64(opts.strtab_vaddr_override.unwrap_or(LOAD_VADDR + strtab_off));
        }
        e.u64(0);
        e.u64(0);

        e.buf.extend(&strtab);

        if opts.extended_phnum {
            // Section header 0: only sh_info is meaningful here.
            e.u32(0);
            e.u32(0);
            e.u64(0);
            e.u64(0);
            e.u64(0);
            e.u64(0);
            e.u32(0);
            e.u32(phnum as u32);
            e.u64(0);
            e.u64(0);
        }

        assert_eq!(e.buf.len() as u64, file_len);
        e.buf
    }

    pub(crate) fn elf32le(deps: &[&str]) -> Vec<u8> {
        let phnum: u32 = 2;
        let phoff: u32 = 52;
        let dyn_off = phoff + phnum * 32;
        let dyn_len = (deps.len() as u32 + 2) * 8;
        let strtab_off = dyn_off + dyn_len;
        let (strtab, name_offsets) = strtab_for(deps);
        let file_len = strtab_off + strtab.len() as u32;
        let vaddr = LOAD_VADDR as u32;

        let mut e = Emit {
            buf: Vec::new(),
            le: true,
        };
        e.buf.extend([0x7f, b'E', b'L', b'F', 1, 1, 1]);
        e.pad(9);
        e.u16(3); // ET_DYN
        e.u16(3); // EM_386
        e.u32(1);
        e.u32(0); // e_entry
        e.u32(phoff);
        e.u32(0); // e_shoff
        e.u32(0); // e_flags
        e.u16(52); // e_ehsize
        e.u16(32); // e_phentsize
        e.u16(phnum as u16);
        e.u16(40); // e_shentsize
        e.u16(0);
        e.u16(0);

        // PT_LOAD
        e.u32(1);
        e.u32(0);
        e.u32(vaddr);
        e.u32(vaddr);
        e.u32(file_len);
        e.u32(file_len);
        e.u32(5);
        e.u32(0x1000);

        // PT_DYNAMIC
        e.u32(2);
        e.u32(dyn_off);
        e.u32(vaddr + dyn_off);
        e.u32(vaddr + dyn_off);
        e.u32(dyn_len);
        e.u32(dyn_len);
        e.u32(6);
        e.u32(4);

        for offset in &name_offsets {
            e.u32(1);
            e.u32(*offset as u32);
        }
        e.u32(5);
        e.u32(vaddr + strtab_off);
        e.u32(0);
        e.u32(0);

        e.buf.extend(&strtab);
        assert_eq!(e.buf.len() as u32, file_len);
        e.buf
    }
}
