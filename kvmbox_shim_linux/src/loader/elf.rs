//! ELF program loader.
//!
//! Loads `PT_LOAD` segments into fresh regions with permissions taken
//! from `p_flags`, zero-fills the gap between file and memory image,
//! resolves a `PT_INTERP` interpreter at a fixed high base, and collects
//! the auxiliary-vector values the stack builder needs.
//!
//! Per the ELF specification whole pages are read from the file, so the
//! bytes before `p_offset`'s page offset and after the last file byte
//! are loaded but never visible to the guest at their own addresses.

use std::path::Path;

use elf::abi;
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::segment::ProgramHeader;
use elf::ElfBytes;
use thiserror::Error;

use kvmbox::layout::LD_LINUX_SO_BASE;
use kvmbox::mm::heap::HeapManager;
use kvmbox::mm::pager::{PageOpts, PagerError};
use kvmbox::mm::region::{RegionError, RegionHandle, RegionManager};
use kvmbox::mm::{offset_in_page, page_begin, pages_from_size, GuestPtr, Purpose};
use kvmbox::platform::VmProvider;

use super::auxv::Auxv;

#[derive(Error, Debug)]
pub enum ElfLoadError {
    #[error("could not read binary: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a valid ELF file: {0}")]
    Parse(#[from] elf::ParseError),
    #[error("only 64-bit ELF binaries are supported")]
    Not64Bit,
    #[error("unsupported ELF kind {0:#x}")]
    UnsupportedKind(u16),
    #[error("segment file size exceeds its memory size")]
    InvalidSegment,
    #[error("more than one PT_INTERP header")]
    DuplicateInterpreter,
    #[error("PT_INTERP after a PT_LOAD header")]
    MisplacedInterpreter,
    #[error("PT_PHDR after a PT_LOAD header")]
    MisplacedPhdrHeader,
    #[error("no loadable segments")]
    NoLoadableSegments,
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Pager(#[from] PagerError),
}

/// A loaded program, ready to enter.
pub struct LoadedElf {
    /// Where execution starts: the interpreter's entry for dynamically
    /// linked binaries, `e_entry` otherwise.
    pub entry_point: GuestPtr,
    pub auxv: Auxv,
    pub statically_linked: bool,
    /// Interpreter path from `PT_INTERP`, if any.
    pub loader_path: Option<String>,
    pub text_region: Option<RegionHandle>,
    pub data_region: Option<RegionHandle>,
}

/// Load the binary at `path` and, if it names an interpreter, that
/// interpreter at [`LD_LINUX_SO_BASE`].
pub fn load_binary<V: VmProvider>(
    path: &Path,
    rm: &mut RegionManager<V>,
    heap: &mut HeapManager,
) -> Result<LoadedElf, ElfLoadError> {
    let mut loaded = load_image(path, rm, heap, 0, false)?;

    if let Some(ref interp) = loaded.loader_path {
        log::debug!("dynamic binary, loading {} at {:#x}", interp, LD_LINUX_SO_BASE);
        let interp_path = interp.clone();
        let ld = load_image(Path::new(&interp_path), rm, heap, LD_LINUX_SO_BASE, true)?;
        loaded.auxv.at_base = LD_LINUX_SO_BASE;
        loaded.entry_point = ld.entry_point;
        loaded.statically_linked = false;
    }
    Ok(loaded)
}

fn load_image<V: VmProvider>(
    path: &Path,
    rm: &mut RegionManager<V>,
    heap: &mut HeapManager,
    load_base: GuestPtr,
    is_interp: bool,
) -> Result<LoadedElf, ElfLoadError> {
    let data = std::fs::read(path)?;
    let elf = ElfBytes::<AnyEndian>::minimal_parse(&data)?;

    if elf.ehdr.class != Class::ELF64 {
        return Err(ElfLoadError::Not64Bit);
    }
    if elf.ehdr.e_type != abi::ET_EXEC && elf.ehdr.e_type != abi::ET_DYN {
        return Err(ElfLoadError::UnsupportedKind(elf.ehdr.e_type));
    }

    let segments = elf
        .segments()
        .ok_or(ElfLoadError::NoLoadableSegments)?;

    let mut loaded = LoadedElf {
        entry_point: load_base + elf.ehdr.e_entry,
        auxv: Auxv::default(),
        statically_linked: true,
        loader_path: None,
        text_region: None,
        data_region: None,
    };
    let mut first_load_vaddr = None;
    let mut saw_load = false;

    for phdr in segments.iter() {
        if phdr.p_filesz > phdr.p_memsz {
            return Err(ElfLoadError::InvalidSegment);
        }
        match phdr.p_type {
            abi::PT_INTERP => {
                if loaded.loader_path.is_some() {
                    return Err(ElfLoadError::DuplicateInterpreter);
                }
                if saw_load {
                    return Err(ElfLoadError::MisplacedInterpreter);
                }
                loaded.loader_path = Some(read_interp_path(&data, &phdr));
            }
            abi::PT_LOAD => {
                saw_load = true;
                first_load_vaddr.get_or_insert(phdr.p_vaddr);
                load_segment(&data, &phdr, load_base, is_interp, rm, heap, &mut loaded)?;
            }
            abi::PT_PHDR => {
                if saw_load {
                    return Err(ElfLoadError::MisplacedPhdrHeader);
                }
            }
            // Everything else is accepted and ignored.
            _ => {}
        }
    }
    if !saw_load {
        return Err(ElfLoadError::NoLoadableSegments);
    }

    zero_nobits_sections(&elf, load_base, rm)?;

    if !is_interp {
        loaded.auxv = Auxv {
            at_phdr: load_base + first_load_vaddr.unwrap_or(0) + elf.ehdr.e_phoff,
            at_phent: elf.ehdr.e_phentsize as u64,
            at_phnum: elf.ehdr.e_phnum as u64,
            at_entry: load_base + elf.ehdr.e_entry,
            at_base: 0,
            valid: true,
        };
    }
    Ok(loaded)
}

fn read_interp_path(data: &[u8], phdr: &ProgramHeader) -> String {
    let start = phdr.p_offset as usize;
    let end = start + phdr.p_filesz as usize;
    let bytes = &data[start..end.min(data.len())];
    let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..nul]).into_owned()
}

fn load_segment<V: VmProvider>(
    data: &[u8],
    phdr: &ProgramHeader,
    load_base: GuestPtr,
    is_interp: bool,
    rm: &mut RegionManager<V>,
    heap: &mut HeapManager,
    loaded: &mut LoadedElf,
) -> Result<(), ElfLoadError> {
    let in_page = offset_in_page(phdr.p_vaddr) as usize;
    let image_size = in_page + phdr.p_memsz as usize;
    let purpose = if phdr.p_flags & abi::PF_X != 0 {
        Purpose::Text
    } else {
        Purpose::Data
    };
    let region = rm.allocate_region(image_size, purpose)?;
    let host = rm.host_base(region);

    // Read whole pages from the file, starting at the page containing
    // p_offset.
    let file_start = page_begin(phdr.p_offset) as usize;
    let want = kvmbox::mm::pagesize_align(in_page + phdr.p_filesz as usize);
    let avail = data.len().saturating_sub(file_start).min(want);
    unsafe {
        std::ptr::write_bytes(host, 0, image_size);
        std::ptr::copy_nonoverlapping(data.as_ptr().add(file_start), host, avail);
        // Zero the tail of the memory image past the file content.
        let zero_from = in_page + phdr.p_filesz as usize;
        std::ptr::write_bytes(host.add(zero_from), 0, phdr.p_memsz as usize - phdr.p_filesz as usize);
    }

    let guest_base = load_base + page_begin(phdr.p_vaddr);
    let pages = pages_from_size(image_size);
    let mut opts = PageOpts::empty();
    if phdr.p_flags & abi::PF_W != 0 {
        opts |= PageOpts::WRITE;
    }
    if phdr.p_flags & abi::PF_X != 0 {
        opts |= PageOpts::EXEC;
    }
    rm.set_guest_addr(region, guest_base);
    rm.pager_mut().map_region(host, guest_base, pages, opts)?;
    log::debug!(
        "PT_LOAD at {:#x}+{:#x} ({} pages, {:?})",
        guest_base,
        image_size,
        pages,
        opts
    );

    if phdr.p_flags & abi::PF_X != 0 {
        loaded.text_region = Some(region);
    } else if phdr.p_flags & abi::PF_W != 0 {
        loaded.data_region = Some(region);
        if !is_interp {
            // The writable segment ends the data image; the heap starts
            // just past it.
            heap.init(rm, region, image_size);
        }
    }
    Ok(())
}

/// Belt and braces with the `p_memsz` zero fill: clear `SHT_NOBITS`
/// sections named `.bss` through their virtual addresses.
fn zero_nobits_sections<V: VmProvider>(
    elf: &ElfBytes<AnyEndian>,
    load_base: GuestPtr,
    rm: &mut RegionManager<V>,
) -> Result<(), ElfLoadError> {
    let Ok((Some(shdrs), Some(strtab))) = elf.section_headers_with_strtab() else {
        return Ok(());
    };
    for shdr in shdrs.iter() {
        if shdr.sh_type != abi::SHT_NOBITS || shdr.sh_size == 0 {
            continue;
        }
        let Ok(name) = strtab.get(shdr.sh_name as usize) else {
            continue;
        };
        if name != ".bss" {
            continue;
        }
        if let Some(host) = rm.pager().get_host_p(load_base + shdr.sh_addr) {
            log::debug!("zeroing .bss: {:#x} bytes at {:#x}", shdr.sh_size, shdr.sh_addr);
            unsafe { std::ptr::write_bytes(host, 0, shdr.sh_size as usize) };
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kvmbox::mm::pager::Pager;
    use kvmbox::platform::mock::MockHypervisor;
    use kvmbox::platform::{HypervisorProvider, VmMode};

    // A minimal static ELF64 image: one RX text segment at 0x400000 and
    // one RW data segment at 0x600000.
    pub(crate) fn make_test_elf(text: &[u8], data_seg: &[u8], bss: usize) -> Vec<u8> {
        let mut out = vec![0u8; 0x3000];
        // e_ident
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little endian
        out[6] = 1; // EV_CURRENT
        let w16 = |out: &mut [u8], off: usize, v: u16| out[off..off + 2].copy_from_slice(&v.to_le_bytes());
        let w32 = |out: &mut [u8], off: usize, v: u32| out[off..off + 4].copy_from_slice(&v.to_le_bytes());
        let w64 = |out: &mut [u8], off: usize, v: u64| out[off..off + 8].copy_from_slice(&v.to_le_bytes());
        w16(&mut out, 16, 2); // ET_EXEC
        w16(&mut out, 18, 62); // EM_X86_64
        w32(&mut out, 20, 1); // version
        w64(&mut out, 24, 0x40_0000 + 0x1000); // e_entry
        w64(&mut out, 32, 64); // e_phoff
        w16(&mut out, 52, 64); // e_ehsize
        w16(&mut out, 54, 56); // e_phentsize
        w16(&mut out, 56, 2); // e_phnum
        // phdr 0: text at file 0x1000, vaddr 0x401000
        let ph = 64;
        w32(&mut out, ph, 1); // PT_LOAD
        w32(&mut out, ph + 4, 0x5); // R+X
        w64(&mut out, ph + 8, 0x1000); // p_offset
        w64(&mut out, ph + 16, 0x40_1000); // p_vaddr
        w64(&mut out, ph + 24, 0x40_1000); // p_paddr
        w64(&mut out, ph + 32, text.len() as u64); // p_filesz
        w64(&mut out, ph + 40, text.len() as u64); // p_memsz
        w64(&mut out, ph + 48, 0x1000); // p_align
        // phdr 1: data at file 0x2000, vaddr 0x600000
        let ph = 64 + 56;
        w32(&mut out, ph, 1);
        w32(&mut out, ph + 4, 0x6); // R+W
        w64(&mut out, ph + 8, 0x2000);
        w64(&mut out, ph + 16, 0x60_0000);
        w64(&mut out, ph + 24, 0x60_0000);
        w64(&mut out, ph + 32, data_seg.len() as u64);
        w64(&mut out, ph + 40, (data_seg.len() + bss) as u64);
        w64(&mut out, ph + 48, 0x1000);

        out[0x1000..0x1000 + text.len()].copy_from_slice(text);
        out[0x2000..0x2000 + data_seg.len()].copy_from_slice(data_seg);
        out
    }

    // An ET_DYN image standing in for the dynamic loader: one RX segment
    // at vaddr 0x1000.
    fn make_interp_elf(text: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 0x2000];
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        let w16 = |out: &mut [u8], off: usize, v: u16| out[off..off + 2].copy_from_slice(&v.to_le_bytes());
        let w32 = |out: &mut [u8], off: usize, v: u32| out[off..off + 4].copy_from_slice(&v.to_le_bytes());
        let w64 = |out: &mut [u8], off: usize, v: u64| out[off..off + 8].copy_from_slice(&v.to_le_bytes());
        w16(&mut out, 16, 3); // ET_DYN
        w16(&mut out, 18, 62);
        w32(&mut out, 20, 1);
        w64(&mut out, 24, 0x1008); // e_entry
        w64(&mut out, 32, 64); // e_phoff
        w16(&mut out, 52, 64);
        w16(&mut out, 54, 56);
        w16(&mut out, 56, 1);
        let ph = 64;
        w32(&mut out, ph, 1); // PT_LOAD
        w32(&mut out, ph + 4, 0x5); // R+X
        w64(&mut out, ph + 8, 0x1000);
        w64(&mut out, ph + 16, 0x1000);
        w64(&mut out, ph + 24, 0x1000);
        w64(&mut out, ph + 32, text.len() as u64);
        w64(&mut out, ph + 40, text.len() as u64);
        w64(&mut out, ph + 48, 0x1000);
        out[0x1000..0x1000 + text.len()].copy_from_slice(text);
        out
    }

    // Like `make_test_elf` but with a PT_INTERP header naming
    // `interp_path`.
    fn make_dynamic_test_elf(text: &[u8], data_seg: &[u8], interp_path: &str) -> Vec<u8> {
        let mut out = vec![0u8; 0x3000];
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        let w16 = |out: &mut [u8], off: usize, v: u16| out[off..off + 2].copy_from_slice(&v.to_le_bytes());
        let w32 = |out: &mut [u8], off: usize, v: u32| out[off..off + 4].copy_from_slice(&v.to_le_bytes());
        let w64 = |out: &mut [u8], off: usize, v: u64| out[off..off + 8].copy_from_slice(&v.to_le_bytes());
        w16(&mut out, 16, 2); // ET_EXEC
        w16(&mut out, 18, 62);
        w32(&mut out, 20, 1);
        w64(&mut out, 24, 0x40_1000);
        w64(&mut out, 32, 64);
        w16(&mut out, 52, 64);
        w16(&mut out, 54, 56);
        w16(&mut out, 56, 3);
        // phdr 0: PT_INTERP
        let ph = 64;
        w32(&mut out, ph, 3); // PT_INTERP
        w32(&mut out, ph + 4, 0x4);
        w64(&mut out, ph + 8, 0x800);
        w64(&mut out, ph + 32, interp_path.len() as u64 + 1);
        w64(&mut out, ph + 40, interp_path.len() as u64 + 1);
        // phdr 1: text
        let ph = 64 + 56;
        w32(&mut out, ph, 1);
        w32(&mut out, ph + 4, 0x5);
        w64(&mut out, ph + 8, 0x1000);
        w64(&mut out, ph + 16, 0x40_1000);
        w64(&mut out, ph + 24, 0x40_1000);
        w64(&mut out, ph + 32, text.len() as u64);
        w64(&mut out, ph + 40, text.len() as u64);
        w64(&mut out, ph + 48, 0x1000);
        // phdr 2: data
        let ph = 64 + 2 * 56;
        w32(&mut out, ph, 1);
        w32(&mut out, ph + 4, 0x6);
        w64(&mut out, ph + 8, 0x2000);
        w64(&mut out, ph + 16, 0x60_0000);
        w64(&mut out, ph + 24, 0x60_0000);
        w64(&mut out, ph + 32, data_seg.len() as u64);
        w64(&mut out, ph + 40, data_seg.len() as u64);
        w64(&mut out, ph + 48, 0x1000);

        out[0x800..0x800 + interp_path.len()].copy_from_slice(interp_path.as_bytes());
        out[0x1000..0x1000 + text.len()].copy_from_slice(text);
        out[0x2000..0x2000 + data_seg.len()].copy_from_slice(data_seg);
        out
    }

    fn load_fixture(
        image: &[u8],
    ) -> (RegionManager<<MockHypervisor as HypervisorProvider>::Vm>, HeapManager, LoadedElf) {
        let dir = std::env::temp_dir().join(format!("kvmbox-elf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fixture.elf");
        std::fs::write(&path, image).unwrap();

        let hv = MockHypervisor::new();
        let vm = hv.create_vm().unwrap();
        let pager = Pager::initialize(vm, VmMode::LongMode).unwrap();
        let mut rm = RegionManager::new(pager);
        let mut heap = HeapManager::new();
        let loaded = load_binary(&path, &mut rm, &mut heap).unwrap();
        (rm, heap, loaded)
    }

    #[test]
    fn static_binary_round_trips() {
        let text = b"\x48\xc7\xc0\x01\x00\x00\x00\x0f\x05"; // mov rax,1; syscall
        let data_seg = b"hello, data";
        let (rm, heap, loaded) = load_fixture(&make_test_elf(text, data_seg, 0x40));

        assert!(loaded.statically_linked);
        assert_eq!(loaded.entry_point, 0x40_1000);
        assert!(loaded.text_region.is_some());
        assert!(loaded.data_region.is_some());

        // Every file byte appears at its virtual address.
        for (i, &b) in text.iter().enumerate() {
            let host = rm.pager().get_host_p(0x40_1000 + i as u64).unwrap();
            assert_eq!(unsafe { *host }, b);
        }
        for (i, &b) in data_seg.iter().enumerate() {
            let host = rm.pager().get_host_p(0x60_0000 + i as u64).unwrap();
            assert_eq!(unsafe { *host }, b);
        }
        // The bss gap reads back zero.
        for i in 0..0x40u64 {
            let host = rm
                .pager()
                .get_host_p(0x60_0000 + data_seg.len() as u64 + i)
                .unwrap();
            assert_eq!(unsafe { *host }, 0);
        }
        // The initial break sits just past the data image.
        assert_eq!(heap.curbrk(), 0x60_1000);
        // Auxv describes the main binary.
        assert!(loaded.auxv.valid);
        assert_eq!(loaded.auxv.at_entry, 0x40_1000);
        assert_eq!(loaded.auxv.at_phnum, 2);
        assert_eq!(loaded.auxv.at_phdr, 0x40_1000 + 64);
    }

    #[test]
    fn dynamic_binary_enters_through_the_interpreter() {
        let dir = std::env::temp_dir().join(format!("kvmbox-elfdyn-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let interp_path = dir.join("ld-fixture.so");
        let interp_text = b"\xf3\x0f\x1e\xfa\x48\x31\xc0\x0f\x05";
        std::fs::write(&interp_path, make_interp_elf(interp_text)).unwrap();

        let main_path = dir.join("dynamic.elf");
        std::fs::write(
            &main_path,
            make_dynamic_test_elf(b"\x90\x90", b"data", interp_path.to_str().unwrap()),
        )
        .unwrap();

        let hv = MockHypervisor::new();
        let vm = hv.create_vm().unwrap();
        let pager = Pager::initialize(vm, VmMode::LongMode).unwrap();
        let mut rm = RegionManager::new(pager);
        let mut heap = HeapManager::new();
        let loaded = load_binary(&main_path, &mut rm, &mut heap).unwrap();

        assert!(!loaded.statically_linked);
        assert_eq!(
            loaded.loader_path.as_deref(),
            Some(interp_path.to_str().unwrap())
        );
        // Execution starts in the interpreter, at its fixed base.
        assert_eq!(loaded.entry_point, LD_LINUX_SO_BASE + 0x1008);
        assert_eq!(loaded.auxv.at_base, LD_LINUX_SO_BASE);
        // The auxv still describes the main binary.
        assert_eq!(loaded.auxv.at_entry, 0x40_1000);
        // Interpreter text is mapped at the fixed base.
        for (i, &b) in interp_text.iter().enumerate() {
            let host = rm
                .pager()
                .get_host_p(LD_LINUX_SO_BASE + 0x1000 + i as u64)
                .unwrap();
            assert_eq!(unsafe { *host }, b);
        }
    }

    #[test]
    fn rejects_32_bit_class() {
        let mut image = make_test_elf(b"\x90", b"", 0);
        image[4] = 1; // ELFCLASS32
        let dir = std::env::temp_dir().join(format!("kvmbox-elf32-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.elf");
        std::fs::write(&path, &image).unwrap();

        let hv = MockHypervisor::new();
        let vm = hv.create_vm().unwrap();
        let pager = Pager::initialize(vm, VmMode::LongMode).unwrap();
        let mut rm = RegionManager::new(pager);
        let mut heap = HeapManager::new();
        assert!(load_binary(&path, &mut rm, &mut heap).is_err());
    }

    #[test]
    fn rejects_filesz_larger_than_memsz() {
        let mut image = make_test_elf(b"\x90", b"", 0);
        // Corrupt phdr 0: filesz > memsz.
        image[64 + 32..64 + 40].copy_from_slice(&0x2000u64.to_le_bytes());
        image[64 + 40..64 + 48].copy_from_slice(&0x1000u64.to_le_bytes());
        let dir = std::env::temp_dir().join(format!("kvmbox-elfsz-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.elf");
        std::fs::write(&path, &image).unwrap();

        let hv = MockHypervisor::new();
        let vm = hv.create_vm().unwrap();
        let pager = Pager::initialize(vm, VmMode::LongMode).unwrap();
        let mut rm = RegionManager::new(pager);
        let mut heap = HeapManager::new();
        assert!(matches!(
            load_binary(&path, &mut rm, &mut heap),
            Err(ElfLoadError::InvalidSegment)
        ));
    }
}
