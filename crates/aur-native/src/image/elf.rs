//! ELF64 executable writer.
//!
//! Fixed layout: ELF header (64 bytes), two program headers (56 bytes
//! each), zero padding to the first page, the text segment, page padding,
//! the data segment. Text maps R|X at `0x401000`, data R|W on the next
//! page boundary (`0x402000` whenever the code fits one page). Entry is
//! the first text byte; exit is `syscall(60, code)` emitted by the
//! encoder.

use std::collections::HashMap;

use super::{align_up, pad_to, push_u16, push_u32, push_u64};
use crate::abi::Target;
use crate::encode::Encoder;
use crate::error::Result;
use crate::manifest::ManifestUnit;

pub const IMAGE_BASE: u64 = 0x40_0000;
pub const TEXT_ADDR: u64 = 0x40_1000;

const PAGE: usize = 0x1000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Encode a manifest and lay it out as a loadable ELF64 image.
pub fn write(unit: &ManifestUnit) -> Result<Vec<u8>> {
    let mut enc = Encoder::new(Target::Linux);
    enc.encode_unit(unit)?;

    let code_len = enc.code().len();
    let data_len = enc.data().len();
    let data_addr = TEXT_ADDR + align_up(code_len.max(1), PAGE) as u64;
    enc.resolve(TEXT_ADDR, data_addr, &HashMap::new())?;

    let text_off = PAGE;
    let data_off = text_off + align_up(code_len.max(1), PAGE);

    let mut out = Vec::with_capacity(data_off + data_len);

    // ELF header
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    push_u16(&mut out, 2); // ET_EXEC
    push_u16(&mut out, 0x3E); // EM_X86_64
    push_u32(&mut out, 1);
    push_u64(&mut out, TEXT_ADDR); // entry
    push_u64(&mut out, EHDR_SIZE as u64); // phoff
    push_u64(&mut out, 0); // shoff
    push_u32(&mut out, 0); // flags
    push_u16(&mut out, EHDR_SIZE as u16);
    push_u16(&mut out, PHDR_SIZE as u16);
    push_u16(&mut out, 2); // phnum
    push_u16(&mut out, 0); // shentsize
    push_u16(&mut out, 0); // shnum
    push_u16(&mut out, 0); // shstrndx
    debug_assert_eq!(out.len(), EHDR_SIZE);

    // text program header
    push_u32(&mut out, PT_LOAD);
    push_u32(&mut out, PF_R | PF_X);
    push_u64(&mut out, text_off as u64);
    push_u64(&mut out, TEXT_ADDR);
    push_u64(&mut out, TEXT_ADDR);
    push_u64(&mut out, code_len as u64);
    push_u64(&mut out, code_len as u64);
    push_u64(&mut out, PAGE as u64);

    // data program header
    push_u32(&mut out, PT_LOAD);
    push_u32(&mut out, PF_R | PF_W);
    push_u64(&mut out, data_off as u64);
    push_u64(&mut out, data_addr);
    push_u64(&mut out, data_addr);
    push_u64(&mut out, data_len as u64);
    push_u64(&mut out, data_len as u64);
    push_u64(&mut out, PAGE as u64);
    debug_assert_eq!(out.len(), EHDR_SIZE + 2 * PHDR_SIZE);

    pad_to(&mut out, text_off);
    out.extend_from_slice(enc.code());
    pad_to(&mut out, data_off);
    out.extend_from_slice(enc.data());

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Inst, Opcode};

    fn tiny_unit() -> ManifestUnit {
        let mut unit = ManifestUnit {
            stack_size: 88,
            ..ManifestUnit::default()
        };
        unit.instructions.push(Inst::new(
            Opcode::Jmp,
            [crate::manifest::OPERAND_LABEL, 0, 0],
            0,
            "jmp fn_main",
        ));
        unit.instructions
            .push(Inst::new(Opcode::Halt, [0; 3], 0, "halt"));
        unit.labels.insert("fn_main".to_string(), 1);
        unit
    }

    #[test]
    fn header_fields_are_bit_exact() {
        let image = write(&tiny_unit()).unwrap();
        assert_eq!(&image[..4], b"\x7FELF");
        assert_eq!(image[4], 2, "ELFCLASS64");
        assert_eq!(image[5], 1, "little endian");
        assert_eq!(u16::from_le_bytes([image[16], image[17]]), 2, "ET_EXEC");
        assert_eq!(u16::from_le_bytes([image[18], image[19]]), 0x3E);
        let entry = u64::from_le_bytes(image[24..32].try_into().unwrap());
        assert_eq!(entry, TEXT_ADDR);
        let phnum = u16::from_le_bytes([image[56], image[57]]);
        assert_eq!(phnum, 2);
    }

    #[test]
    fn segments_are_page_aligned_and_typed() {
        let image = write(&tiny_unit()).unwrap();
        let ph = &image[64..64 + 56];
        assert_eq!(u32::from_le_bytes(ph[0..4].try_into().unwrap()), PT_LOAD);
        assert_eq!(
            u32::from_le_bytes(ph[4..8].try_into().unwrap()),
            PF_R | PF_X
        );
        assert_eq!(
            u64::from_le_bytes(ph[8..16].try_into().unwrap()),
            0x1000,
            "text file offset"
        );
        assert_eq!(
            u64::from_le_bytes(ph[16..24].try_into().unwrap()),
            TEXT_ADDR
        );
        let ph2 = &image[64 + 56..64 + 112];
        assert_eq!(
            u32::from_le_bytes(ph2[4..8].try_into().unwrap()),
            PF_R | PF_W
        );
        assert_eq!(
            u64::from_le_bytes(ph2[16..24].try_into().unwrap()),
            0x40_2000,
            "data lands on the page after a one-page text"
        );
    }

    #[test]
    fn code_bytes_start_at_the_text_offset() {
        let image = write(&tiny_unit()).unwrap();
        // First instruction is the entry jump to fn_main.
        assert_eq!(image[0x1000], 0xE9);
    }
}
