//! PE64 executable writer.
//!
//! Three sections: `.text` (code), `.rdata` (import directory, lookup
//! table, IAT and name strings), `.data` (interned strings and shared
//! variables). Section alignment 0x1000, file alignment 0x200, console
//! subsystem. DllCharacteristics deliberately omit DYNAMIC_BASE: the
//! generated code references strings and shared variables through
//! absolute 64-bit addresses.

use std::collections::HashMap;

use super::{align_up, pad_to, push_u16, push_u32, push_u64};
use crate::abi::Target;
use crate::encode::Encoder;
use crate::error::Result;
use crate::manifest::ManifestUnit;

pub const IMAGE_BASE: u64 = 0x1_4000_0000;

const SECTION_ALIGN: usize = 0x1000;
const FILE_ALIGN: usize = 0x200;
const TEXT_RVA: u32 = 0x1000;

const SUBSYSTEM_CONSOLE: u16 = 3;

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Functions imported from kernel32.dll. Every IAT slot is exported to
/// the encoder as `__imp_<Name>`.
pub const IMPORT_FUNCS: [&str; 8] = [
    "ExitProcess",
    "GetStdHandle",
    "WriteFile",
    "ReadFile",
    "ReadConsoleA",
    "CreateThread",
    "WaitForSingleObject",
    "CloseHandle",
];

const DLL_NAME: &str = "kernel32.dll";

/// The `.rdata` import block and the IAT slot addresses it exports.
struct ImportSection {
    bytes: Vec<u8>,
    /// RVA of the import directory (data directory 1).
    directory_rva: u32,
    /// RVA and size of the IAT (data directory 12).
    iat_rva: u32,
    iat_size: u32,
    iat: HashMap<String, u64>,
}

fn build_imports(rdata_rva: u32) -> ImportSection {
    let count = IMPORT_FUNCS.len();
    let dir_size = 2 * 20; // one entry + null terminator
    let ilt_off = dir_size;
    let thunk_size = (count + 1) * 8;
    let iat_off = ilt_off + thunk_size;
    let names_off = iat_off + thunk_size;

    // Hint/name entries, each 2-byte hint + NUL-terminated name, padded
    // to even offsets.
    let mut names = Vec::new();
    let mut name_rvas = Vec::with_capacity(count);
    for func in IMPORT_FUNCS {
        if names.len() % 2 != 0 {
            names.push(0);
        }
        name_rvas.push(rdata_rva + (names_off + names.len()) as u32);
        names.extend_from_slice(&0u16.to_le_bytes());
        names.extend_from_slice(func.as_bytes());
        names.push(0);
    }
    if names.len() % 2 != 0 {
        names.push(0);
    }
    let dll_name_rva = rdata_rva + (names_off + names.len()) as u32;
    names.extend_from_slice(DLL_NAME.as_bytes());
    names.push(0);

    let mut bytes = Vec::new();
    // Import directory entry for kernel32.dll.
    push_u32(&mut bytes, rdata_rva + ilt_off as u32); // OriginalFirstThunk
    push_u32(&mut bytes, 0); // TimeDateStamp
    push_u32(&mut bytes, 0); // ForwarderChain
    push_u32(&mut bytes, dll_name_rva);
    push_u32(&mut bytes, rdata_rva + iat_off as u32); // FirstThunk
    // Null terminator entry.
    bytes.extend_from_slice(&[0; 20]);

    // ILT and IAT are identical pre-load: RVAs of the hint/name entries.
    for _ in 0..2 {
        for &rva in &name_rvas {
            push_u64(&mut bytes, u64::from(rva));
        }
        push_u64(&mut bytes, 0);
    }
    bytes.extend_from_slice(&names);

    let mut iat = HashMap::new();
    for (i, func) in IMPORT_FUNCS.iter().enumerate() {
        iat.insert(
            format!("__imp_{func}"),
            IMAGE_BASE + u64::from(rdata_rva) + (iat_off + i * 8) as u64,
        );
    }

    ImportSection {
        bytes,
        directory_rva: rdata_rva,
        iat_rva: rdata_rva + iat_off as u32,
        iat_size: thunk_size as u32,
        iat,
    }
}

/// Encode a manifest and lay it out as a PE64 console executable.
pub fn write(unit: &ManifestUnit) -> Result<Vec<u8>> {
    let mut enc = Encoder::new(Target::Windows);
    enc.encode_unit(unit)?;

    let code_len = enc.code().len();
    let rdata_rva = TEXT_RVA + align_up(code_len.max(1), SECTION_ALIGN) as u32;
    let imports = build_imports(rdata_rva);
    let rdata_len = imports.bytes.len();
    let data_rva = rdata_rva + align_up(rdata_len, SECTION_ALIGN) as u32;
    let data_len = enc.data().len();

    enc.resolve(
        IMAGE_BASE + u64::from(TEXT_RVA),
        IMAGE_BASE + u64::from(data_rva),
        &imports.iat,
    )?;

    let size_of_image = data_rva as usize + align_up(data_len.max(1), SECTION_ALIGN);
    let headers_len = 0x40 + 4 + 20 + 240 + 3 * 40;
    let size_of_headers = align_up(headers_len, FILE_ALIGN);

    let text_raw = size_of_headers;
    let text_raw_size = align_up(code_len.max(1), FILE_ALIGN);
    let rdata_raw = text_raw + text_raw_size;
    let rdata_raw_size = align_up(rdata_len, FILE_ALIGN);
    let data_raw = rdata_raw + rdata_raw_size;
    let data_raw_size = align_up(data_len.max(1), FILE_ALIGN);

    let mut out = Vec::with_capacity(data_raw + data_raw_size);

    // DOS header: magic plus the PE header offset at 0x3C.
    out.extend_from_slice(b"MZ");
    pad_to(&mut out, 0x3C);
    push_u32(&mut out, 0x40);

    // PE signature + COFF header.
    out.extend_from_slice(b"PE\0\0");
    push_u16(&mut out, 0x8664); // machine
    push_u16(&mut out, 3); // sections
    push_u32(&mut out, 0); // timestamp
    push_u32(&mut out, 0); // symbol table
    push_u32(&mut out, 0); // symbol count
    push_u16(&mut out, 240); // optional header size
    push_u16(&mut out, 0x0022); // EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE

    // Optional header (PE32+).
    let opt_start = out.len();
    push_u16(&mut out, 0x20B);
    out.extend_from_slice(&[14, 0]); // linker version
    push_u32(&mut out, text_raw_size as u32);
    push_u32(&mut out, (rdata_raw_size + data_raw_size) as u32);
    push_u32(&mut out, 0); // uninitialized data
    push_u32(&mut out, TEXT_RVA); // entry point
    push_u32(&mut out, TEXT_RVA); // base of code
    push_u64(&mut out, IMAGE_BASE);
    push_u32(&mut out, SECTION_ALIGN as u32);
    push_u32(&mut out, FILE_ALIGN as u32);
    push_u16(&mut out, 6); // OS major
    push_u16(&mut out, 0);
    push_u16(&mut out, 0); // image version
    push_u16(&mut out, 0);
    push_u16(&mut out, 6); // subsystem major
    push_u16(&mut out, 0);
    push_u32(&mut out, 0); // win32 version
    push_u32(&mut out, size_of_image as u32);
    push_u32(&mut out, size_of_headers as u32);
    push_u32(&mut out, 0); // checksum
    push_u16(&mut out, SUBSYSTEM_CONSOLE);
    push_u16(&mut out, 0); // DllCharacteristics: no DYNAMIC_BASE
    push_u64(&mut out, 0x10_0000); // stack reserve
    push_u64(&mut out, 0x1000); // stack commit
    push_u64(&mut out, 0x10_0000); // heap reserve
    push_u64(&mut out, 0x1000); // heap commit
    push_u32(&mut out, 0); // loader flags
    push_u32(&mut out, 16); // data directory count
    for i in 0..16u32 {
        match i {
            1 => {
                push_u32(&mut out, imports.directory_rva);
                push_u32(&mut out, 40);
            }
            12 => {
                push_u32(&mut out, imports.iat_rva);
                push_u32(&mut out, imports.iat_size);
            }
            _ => {
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
            }
        }
    }
    debug_assert_eq!(out.len() - opt_start, 240);

    // Section table.
    let section = |out: &mut Vec<u8>,
                       name: &[u8; 8],
                       vsize: usize,
                       rva: u32,
                       raw_size: usize,
                       raw_ptr: usize,
                       flags: u32| {
        out.extend_from_slice(name);
        push_u32(out, vsize as u32);
        push_u32(out, rva);
        push_u32(out, raw_size as u32);
        push_u32(out, raw_ptr as u32);
        push_u32(out, 0); // relocations
        push_u32(out, 0); // line numbers
        push_u32(out, 0); // counts
        push_u32(out, flags);
    };
    section(
        &mut out,
        b".text\0\0\0",
        code_len.max(1),
        TEXT_RVA,
        text_raw_size,
        text_raw,
        IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
    );
    section(
        &mut out,
        b".rdata\0\0",
        rdata_len,
        rdata_rva,
        rdata_raw_size,
        rdata_raw,
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
    );
    section(
        &mut out,
        b".data\0\0\0",
        data_len.max(1),
        data_rva,
        data_raw_size,
        data_raw,
        IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
    );

    pad_to(&mut out, text_raw);
    out.extend_from_slice(enc.code());
    pad_to(&mut out, rdata_raw);
    out.extend_from_slice(&imports.bytes);
    pad_to(&mut out, data_raw);
    out.extend_from_slice(enc.data());
    pad_to(&mut out, data_raw + data_raw_size);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Inst, Opcode, OPERAND_LABEL};

    fn tiny_unit() -> ManifestUnit {
        let mut unit = ManifestUnit {
            stack_size: 88,
            ..ManifestUnit::default()
        };
        unit.instructions.push(Inst::new(
            Opcode::Jmp,
            [OPERAND_LABEL, 0, 0],
            0,
            "jmp fn_main",
        ));
        unit.instructions
            .push(Inst::new(Opcode::Halt, [0; 3], 0, "halt"));
        unit.labels.insert("fn_main".to_string(), 1);
        unit
    }

    #[test]
    fn dos_and_pe_signatures() {
        let image = write(&tiny_unit()).unwrap();
        assert_eq!(&image[..2], b"MZ");
        let pe_off = u32::from_le_bytes(image[0x3C..0x40].try_into().unwrap()) as usize;
        assert_eq!(pe_off, 0x40);
        assert_eq!(&image[pe_off..pe_off + 4], b"PE\0\0");
        assert_eq!(
            u16::from_le_bytes(image[pe_off + 4..pe_off + 6].try_into().unwrap()),
            0x8664
        );
    }

    #[test]
    fn optional_header_fields() {
        let image = write(&tiny_unit()).unwrap();
        let opt = 0x40 + 4 + 20;
        assert_eq!(
            u16::from_le_bytes(image[opt..opt + 2].try_into().unwrap()),
            0x20B
        );
        let entry = u32::from_le_bytes(image[opt + 16..opt + 20].try_into().unwrap());
        assert_eq!(entry, 0x1000);
        let base = u64::from_le_bytes(image[opt + 24..opt + 32].try_into().unwrap());
        assert_eq!(base, IMAGE_BASE);
        let subsystem = u16::from_le_bytes(image[opt + 68..opt + 70].try_into().unwrap());
        assert_eq!(subsystem, SUBSYSTEM_CONSOLE);
        let dll_chars = u16::from_le_bytes(image[opt + 70..opt + 72].try_into().unwrap());
        assert_eq!(dll_chars, 0, "DYNAMIC_BASE must stay off");
    }

    #[test]
    fn import_table_lists_kernel32_functions() {
        let image = write(&tiny_unit()).unwrap();
        let ascii: Vec<u8> = image.clone();
        let find = |needle: &[u8]| ascii.windows(needle.len()).any(|w| w == needle);
        assert!(find(b"kernel32.dll\0"));
        for func in IMPORT_FUNCS {
            assert!(find(func.as_bytes()), "missing import {func}");
        }
    }

    #[test]
    fn iat_slots_are_exported_with_imp_prefix() {
        let imports = build_imports(0x2000);
        let exit = imports.iat.get("__imp_ExitProcess").copied().unwrap();
        assert_eq!(exit, IMAGE_BASE + 0x2000 + 0x70);
        let close = imports.iat.get("__imp_CloseHandle").copied().unwrap();
        assert_eq!(close, exit + 7 * 8);
        assert_eq!(imports.iat_size, 72);
    }

    #[test]
    fn ilt_and_iat_match_before_load() {
        let imports = build_imports(0x2000);
        let ilt = &imports.bytes[0x28..0x70];
        let iat = &imports.bytes[0x70..0xB8];
        assert_eq!(ilt, iat);
    }
}
