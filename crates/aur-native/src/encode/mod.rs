//! x86-64 machine-code generation from a manifest unit.
//!
//! The encoder owns a flat code buffer and a parallel relocation list.
//! Control transfers and data references emit correctly-sized placeholders
//! and record a relocation; `resolve` patches them once the final section
//! addresses are known. One routine per manifest opcode.

mod svc;

use std::collections::HashMap;

use crate::abi::{self, RAX, RCX, RDX, RSP, Target};
use crate::error::{Error, Result};
use crate::manifest::{Inst, ManifestUnit, OPERAND_IMM, OPERAND_LABEL, Opcode, cond};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit PC-relative displacement against a code label.
    Rel32,
    /// Absolute 64-bit address.
    Abs64,
    /// 32-bit PC-relative displacement against a data or IAT address.
    RipData,
}

#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: usize,
    pub target: String,
    pub kind: RelocKind,
}

pub struct Encoder {
    target: Target,
    stack_size: u32,
    code: Vec<u8>,
    data: Vec<u8>,
    relocs: Vec<Relocation>,
    code_labels: HashMap<String, usize>,
    data_labels: HashMap<String, usize>,
    /// UCOMISD leaves CF/ZF like an unsigned compare, so conditional jumps
    /// after FCMP use the unsigned Jcc table.
    last_cmp_float: bool,
    next_local: usize,
}

impl Encoder {
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            stack_size: 0,
            code: Vec::new(),
            data: Vec::new(),
            relocs: Vec::new(),
            code_labels: HashMap::new(),
            data_labels: HashMap::new(),
            last_cmp_float: false,
            next_local: 0,
        }
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocs
    }

    #[must_use]
    pub fn code_label(&self, name: &str) -> Option<usize> {
        self.code_labels.get(name).copied()
    }

    #[must_use]
    pub fn data_label(&self, name: &str) -> Option<usize> {
        self.data_labels.get(name).copied()
    }

    /// Encode a whole unit: data section first (strings, then 8-byte
    /// aligned shared variables), then every instruction, emitting the
    /// frame prologue at each `fn_` label.
    pub fn encode_unit(&mut self, unit: &ManifestUnit) -> Result<()> {
        self.stack_size = unit.stack_size;

        for s in &unit.strings {
            self.data_labels.insert(s.label.clone(), self.data.len());
            self.data.extend_from_slice(s.text.as_bytes());
            self.data.push(0);
        }
        while self.data.len() % 8 != 0 {
            self.data.push(0);
        }
        for sv in &unit.shared {
            self.data_labels.insert(sv.label(), self.data.len());
            self.data.extend_from_slice(&sv.init.to_le_bytes());
        }

        let mut by_index: HashMap<usize, Vec<&String>> = HashMap::new();
        for (name, &idx) in &unit.labels {
            by_index.entry(idx).or_default().push(name);
        }

        for (i, inst) in unit.instructions.iter().enumerate() {
            if let Some(names) = by_index.get(&i) {
                let mut names = names.clone();
                names.sort();
                for name in names {
                    self.code_labels.insert(name.clone(), self.code.len());
                    if name.starts_with("fn_") {
                        self.emit_prologue();
                    }
                }
            }
            self.encode_inst(inst)?;
        }
        if let Some(names) = by_index.get(&unit.instructions.len()) {
            for name in names {
                self.code_labels.insert((*name).clone(), self.code.len());
            }
        }
        tracing::debug!(
            code_bytes = self.code.len(),
            data_bytes = self.data.len(),
            relocations = self.relocs.len(),
            "encoded unit"
        );
        Ok(())
    }

    /// Patch every relocation. Code labels resolve against `code_base`,
    /// data labels against `data_base`, `__imp_*` symbols against the IAT
    /// slot addresses supplied by the image writer.
    pub fn resolve(
        &mut self,
        code_base: u64,
        data_base: u64,
        iat: &HashMap<String, u64>,
    ) -> Result<()> {
        for reloc in &self.relocs {
            let address = if let Some(&off) = self.code_labels.get(&reloc.target) {
                code_base + off as u64
            } else if let Some(&off) = self.data_labels.get(&reloc.target) {
                data_base + off as u64
            } else if let Some(&addr) = iat.get(&reloc.target) {
                addr
            } else {
                return Err(Error::UndefinedSymbol(reloc.target.clone()));
            };
            match reloc.kind {
                RelocKind::Abs64 => {
                    self.code[reloc.offset..reloc.offset + 8]
                        .copy_from_slice(&address.to_le_bytes());
                }
                RelocKind::Rel32 | RelocKind::RipData => {
                    let next = code_base as i64 + reloc.offset as i64 + 4;
                    let disp = address as i64 - next;
                    let disp =
                        i32::try_from(disp).map_err(|_| Error::ImmediateOutOfRange(disp))?;
                    self.code[reloc.offset..reloc.offset + 4]
                        .copy_from_slice(&disp.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    // ── byte-level helpers ──

    pub(crate) fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub(crate) fn emit_imm32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_imm64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
        0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b)
    }

    fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
        (md << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    fn reloc_here(&mut self, target: &str, kind: RelocKind, placeholder: usize) {
        self.relocs.push(Relocation {
            offset: self.code.len(),
            target: target.to_string(),
            kind,
        });
        self.code.extend(std::iter::repeat_n(0u8, placeholder));
    }

    /// Physical register for a virtual GPR operand.
    fn greg(&self, op: u8) -> Result<u8> {
        if op >= abi::NUM_VREGS {
            return Err(Error::MalformedManifest(format!(
                "virtual register r{op} out of range"
            )));
        }
        Ok(self.target.gpr(op))
    }

    /// SSE registers map 1:1.
    fn xreg(op: u8) -> Result<u8> {
        if op >= 16 {
            return Err(Error::MalformedManifest(format!(
                "SSE register f{op} out of range"
            )));
        }
        Ok(op)
    }

    fn label_of(inst: &Inst) -> Result<&str> {
        inst.label_target().ok_or_else(|| {
            Error::MalformedManifest(format!("{:?} needs a label in its comment", inst.op))
        })
    }

    // ── GPR instruction helpers (physical register ids) ──

    /// ALU op with the `op r/m64, r64` encoding (reg field = src).
    fn alu_rr(&mut self, opbyte: u8, src: u8, dst: u8) {
        self.emit(&[
            Self::rex(true, src >= 8, false, dst >= 8),
            opbyte,
            Self::modrm(3, src, dst),
        ]);
    }

    /// ALU op with an imm32 (`0x81 /ext`).
    fn alu_ri(&mut self, ext: u8, dst: u8, imm: i32) {
        self.emit(&[
            Self::rex(true, false, false, dst >= 8),
            0x81,
            Self::modrm(3, ext, dst),
        ]);
        self.emit_imm32(imm);
    }

    pub(crate) fn mov_rr(&mut self, dst: u8, src: u8) {
        self.alu_rr(0x89, src, dst);
    }

    pub(crate) fn mov_ri32(&mut self, dst: u8, imm: i32) {
        self.emit(&[
            Self::rex(true, false, false, dst >= 8),
            0xC7,
            Self::modrm(3, 0, dst),
        ]);
        self.emit_imm32(imm);
    }

    pub(crate) fn movabs(&mut self, dst: u8, value: u64) {
        self.emit(&[Self::rex(true, false, false, dst >= 8), 0xB8 + (dst & 7)]);
        self.emit_imm64(value);
    }

    /// `movabs dst, <label>` with an abs64 relocation.
    pub(crate) fn movabs_label(&mut self, dst: u8, label: &str) {
        self.emit(&[Self::rex(true, false, false, dst >= 8), 0xB8 + (dst & 7)]);
        self.reloc_here(label, RelocKind::Abs64, 8);
    }

    pub(crate) fn push(&mut self, reg: u8) {
        if reg >= 8 {
            self.emit(&[0x41]);
        }
        self.emit(&[0x50 + (reg & 7)]);
    }

    pub(crate) fn pop(&mut self, reg: u8) {
        if reg >= 8 {
            self.emit(&[0x41]);
        }
        self.emit(&[0x58 + (reg & 7)]);
    }

    pub(crate) fn xor_rr(&mut self, dst: u8, src: u8) {
        self.alu_rr(0x31, src, dst);
    }

    pub(crate) fn add_rr(&mut self, dst: u8, src: u8) {
        self.alu_rr(0x01, src, dst);
    }

    pub(crate) fn sub_rr(&mut self, dst: u8, src: u8) {
        self.alu_rr(0x29, src, dst);
    }

    pub(crate) fn test_rr(&mut self, a: u8, b: u8) {
        self.alu_rr(0x85, b, a);
    }

    pub(crate) fn inc(&mut self, reg: u8) {
        self.emit(&[
            Self::rex(true, false, false, reg >= 8),
            0xFF,
            Self::modrm(3, 0, reg),
        ]);
    }

    pub(crate) fn dec(&mut self, reg: u8) {
        self.emit(&[
            Self::rex(true, false, false, reg >= 8),
            0xFF,
            Self::modrm(3, 1, reg),
        ]);
    }

    pub(crate) fn neg(&mut self, reg: u8) {
        self.emit(&[
            Self::rex(true, false, false, reg >= 8),
            0xF7,
            Self::modrm(3, 3, reg),
        ]);
    }

    /// Unsigned `div reg` (RDX:RAX / reg).
    pub(crate) fn div_unsigned(&mut self, reg: u8) {
        self.emit(&[
            Self::rex(true, false, false, reg >= 8),
            0xF7,
            Self::modrm(3, 6, reg),
        ]);
    }

    /// `mov [rsp+disp], reg` / `mov reg, [rsp+disp]`.
    fn rsp_mem(&mut self, opbyte: u8, reg: u8, disp: i32) {
        self.emit(&[
            Self::rex(true, reg >= 8, false, false),
            opbyte,
            Self::modrm(2, reg, RSP),
            0x24,
        ]);
        self.emit_imm32(disp);
    }

    pub(crate) fn store_rsp(&mut self, disp: i32, src: u8) {
        self.rsp_mem(0x89, src, disp);
    }

    pub(crate) fn load_rsp(&mut self, dst: u8, disp: i32) {
        self.rsp_mem(0x8B, dst, disp);
    }

    /// `lea dst, [rsp+disp]`.
    pub(crate) fn lea_rsp(&mut self, dst: u8, disp: i32) {
        self.emit(&[
            Self::rex(true, dst >= 8, false, false),
            0x8D,
            Self::modrm(2, dst, RSP),
            0x24,
        ]);
        self.emit_imm32(disp);
    }

    /// `mov qword [rsp+disp], imm32`.
    pub(crate) fn store_rsp_imm(&mut self, disp: i32, imm: i32) {
        self.emit(&[Self::rex(true, false, false, false), 0xC7, Self::modrm(2, 0, RSP), 0x24]);
        self.emit_imm32(disp);
        self.emit_imm32(imm);
    }

    /// `mov [base], byte`: stores the low byte of `src`.
    /// `base` must not be rsp/rbp-coded and `src` must be a legacy
    /// low-byte register (rax..rbx) unless REX is emitted anyway.
    pub(crate) fn store_byte(&mut self, base: u8, src: u8) {
        if base >= 8 || src >= 8 {
            self.emit(&[Self::rex(false, src >= 8, false, base >= 8)]);
        }
        self.emit(&[0x88, Self::modrm(0, src, base)]);
    }

    /// `mov byte [base], imm8`.
    pub(crate) fn store_byte_imm(&mut self, base: u8, imm: u8) {
        if base >= 8 {
            self.emit(&[Self::rex(false, false, false, true)]);
        }
        self.emit(&[0xC6, Self::modrm(0, 0, base), imm]);
    }

    /// `cmp byte [base+index], imm8`.
    pub(crate) fn cmp_byte_indexed(&mut self, base: u8, index: u8, imm: u8) {
        if base >= 8 || index >= 8 {
            self.emit(&[Self::rex(false, false, index >= 8, base >= 8)]);
        }
        self.emit(&[
            0x80,
            Self::modrm(0, 7, RSP),
            (index & 7) << 3 | (base & 7),
            imm,
        ]);
    }

    /// `movzx dst64, byte [base]`.
    pub(crate) fn load_byte(&mut self, dst: u8, base: u8) {
        self.emit(&[
            Self::rex(true, dst >= 8, false, base >= 8),
            0x0F,
            0xB6,
            Self::modrm(0, dst, base),
        ]);
    }

    pub(crate) fn cmp_ri(&mut self, reg: u8, imm: i32) {
        self.alu_ri(7, reg, imm);
    }

    pub(crate) fn add_ri(&mut self, reg: u8, imm: i32) {
        self.alu_ri(0, reg, imm);
    }

    pub(crate) fn sub_ri(&mut self, reg: u8, imm: i32) {
        self.alu_ri(5, reg, imm);
    }

    pub(crate) fn imul_ri(&mut self, reg: u8, imm: i32) {
        self.emit(&[
            Self::rex(true, reg >= 8, false, reg >= 8),
            0x69,
            Self::modrm(3, reg, reg),
        ]);
        self.emit_imm32(imm);
    }

    pub(crate) fn syscall(&mut self) {
        self.emit(&[0x0F, 0x05]);
    }

    /// `call [rip+disp32]` through an IAT slot.
    pub(crate) fn iat_call(&mut self, name: &str) {
        self.emit(&[0xFF, 0x15]);
        self.reloc_here(&format!("__imp_{name}"), RelocKind::RipData, 4);
    }

    // ── local labels for intra-lowering loops ──

    pub(crate) fn local_label(&mut self) -> String {
        let id = self.next_local;
        self.next_local += 1;
        format!("__local_{id}")
    }

    pub(crate) fn define_local(&mut self, name: &str) {
        self.code_labels.insert(name.to_string(), self.code.len());
    }

    pub(crate) fn jmp_label(&mut self, label: &str) {
        self.emit(&[0xE9]);
        self.reloc_here(label, RelocKind::Rel32, 4);
    }

    /// `jcc` with an explicit second opcode byte (0x80..0x8F).
    pub(crate) fn jcc_label(&mut self, cc_byte: u8, label: &str) {
        self.emit(&[0x0F, cc_byte]);
        self.reloc_here(label, RelocKind::Rel32, 4);
    }

    /// Intern a NUL-terminated constant into the data section.
    pub(crate) fn intern_data_cstr(&mut self, label: &str, text: &str) {
        if self.data_labels.contains_key(label) {
            return;
        }
        self.data_labels.insert(label.to_string(), self.data.len());
        self.data.extend_from_slice(text.as_bytes());
        self.data.push(0);
    }

    // ── SSE helpers ──

    /// Two-operand SSE op `prefix 0F <op2> /r` (reg field = first operand).
    fn sse_rr(&mut self, prefix: u8, op2: u8, reg: u8, rm: u8) {
        self.emit(&[prefix]);
        if reg >= 8 || rm >= 8 {
            self.emit(&[Self::rex(false, reg >= 8, false, rm >= 8)]);
        }
        self.emit(&[0x0F, op2, Self::modrm(3, reg, rm)]);
    }

    /// `movsd xmm, [rsp+disp]` (load = 0x10) or store (0x11).
    fn sse_rsp_mem(&mut self, op2: u8, xmm: u8, disp: i32) {
        self.emit(&[0xF2]);
        if xmm >= 8 {
            self.emit(&[Self::rex(false, true, false, false)]);
        }
        self.emit(&[0x0F, op2, Self::modrm(2, xmm, RSP), 0x24]);
        self.emit_imm32(disp);
    }

    /// `movq gpr, xmm` (66 REX.W 0F 7E /r).
    pub(crate) fn movq_to_gpr(&mut self, gpr: u8, xmm: u8) {
        self.emit(&[
            0x66,
            Self::rex(true, xmm >= 8, false, gpr >= 8),
            0x0F,
            0x7E,
            Self::modrm(3, xmm, gpr),
        ]);
    }

    /// `movq xmm, gpr` (66 REX.W 0F 6E /r).
    pub(crate) fn movq_to_xmm(&mut self, xmm: u8, gpr: u8) {
        self.emit(&[
            0x66,
            Self::rex(true, xmm >= 8, false, gpr >= 8),
            0x0F,
            0x6E,
            Self::modrm(3, xmm, gpr),
        ]);
    }

    /// `cvttsd2si gpr, xmm` (truncating).
    pub(crate) fn cvttsd2si(&mut self, gpr: u8, xmm: u8) {
        self.emit(&[
            0xF2,
            Self::rex(true, gpr >= 8, false, xmm >= 8),
            0x0F,
            0x2C,
            Self::modrm(3, gpr, xmm),
        ]);
    }

    pub(crate) fn cvtsi2sd(&mut self, xmm: u8, gpr: u8) {
        self.emit(&[
            0xF2,
            Self::rex(true, xmm >= 8, false, gpr >= 8),
            0x0F,
            0x2A,
            Self::modrm(3, xmm, gpr),
        ]);
    }

    pub(crate) fn sse_arith(&mut self, op2: u8, dst: u8, src: u8) {
        self.sse_rr(0xF2, op2, dst, src);
    }

    // ── frame handling ──

    /// `sub rsp, stack_size` at every `fn_` label.
    fn emit_prologue(&mut self) {
        let size = self.stack_size as i32;
        self.sub_ri(RSP, size);
    }

    fn emit_epilogue(&mut self) {
        let size = self.stack_size as i32;
        self.add_ri(RSP, size);
    }

    // ── per-opcode dispatch ──

    fn encode_inst(&mut self, inst: &Inst) -> Result<()> {
        match inst.op {
            Opcode::Nop => self.emit(&[0x90]),
            Opcode::Mov => self.encode_mov(inst)?,
            Opcode::Push => {
                let reg = self.greg(inst.ops[0])?;
                self.push(reg);
            }
            Opcode::Pop => {
                let reg = self.greg(inst.ops[0])?;
                self.pop(reg);
            }
            Opcode::Add => self.encode_alu(inst, 0x01, 0)?,
            Opcode::Sub => self.encode_alu(inst, 0x29, 5)?,
            Opcode::And => self.encode_alu(inst, 0x21, 4)?,
            Opcode::Or => self.encode_alu(inst, 0x09, 1)?,
            Opcode::Xor => self.encode_alu(inst, 0x31, 6)?,
            Opcode::Cmp => {
                self.encode_alu(inst, 0x39, 7)?;
                self.last_cmp_float = false;
            }
            Opcode::Not => {
                let dst = self.greg(inst.ops[0])?;
                self.emit(&[
                    Self::rex(true, false, false, dst >= 8),
                    0xF7,
                    Self::modrm(3, 2, dst),
                ]);
            }
            Opcode::Mul => self.encode_mul(inst)?,
            Opcode::Div => self.encode_div(inst, false)?,
            Opcode::Rem => self.encode_div(inst, true)?,
            Opcode::Shl => self.encode_shift(inst, false)?,
            Opcode::Shr => self.encode_shift(inst, true)?,
            Opcode::Jmp => {
                let label = Self::label_of(inst)?.to_string();
                self.jmp_label(&label);
            }
            Opcode::Cjmp => {
                let label = Self::label_of(inst)?.to_string();
                let cc_byte = self.jcc_byte(inst.ops[0])?;
                self.jcc_label(cc_byte, &label);
            }
            Opcode::Call => {
                let label = Self::label_of(inst)?.to_string();
                self.emit(&[0xE8]);
                self.reloc_here(&label, RelocKind::Rel32, 4);
            }
            Opcode::Ret => {
                self.emit_epilogue();
                self.emit(&[0xC3]);
            }
            Opcode::Halt => self.emit_exit()?,
            Opcode::Svc => self.emit_service(inst.imm)?,
            Opcode::StoreStack => {
                let src = self.greg(inst.ops[0])?;
                self.store_rsp(abi::int_slot_offset(inst.imm as usize), src);
            }
            Opcode::LoadStack => {
                let dst = self.greg(inst.ops[0])?;
                self.load_rsp(dst, abi::int_slot_offset(inst.imm as usize));
            }
            Opcode::ArrayAlloc => {
                // Pure allocator bookkeeping; the slots live in the frame.
            }
            Opcode::ArrayLoad => self.encode_array(inst, 0x8B)?,
            Opcode::ArrayStore => self.encode_array(inst, 0x89)?,
            Opcode::Fmov => self.encode_fmov(inst)?,
            Opcode::Fadd => self.encode_sse_binop(inst, 0x58)?,
            Opcode::Fsub => self.encode_sse_binop(inst, 0x5C)?,
            Opcode::Fmul => self.encode_sse_binop(inst, 0x59)?,
            Opcode::Fdiv => self.encode_sse_binop(inst, 0x5E)?,
            Opcode::Fcmp => {
                let a = Self::xreg(inst.ops[0])?;
                let b = Self::xreg(inst.ops[1])?;
                self.sse_rr(0x66, 0x2E, a, b);
                self.last_cmp_float = true;
            }
            Opcode::Fload => {
                let dst = Self::xreg(inst.ops[0])?;
                self.sse_rsp_mem(0x10, dst, abi::float_slot_offset(inst.imm as usize));
            }
            Opcode::Fstore => {
                let src = Self::xreg(inst.ops[0])?;
                self.sse_rsp_mem(0x11, src, abi::float_slot_offset(inst.imm as usize));
            }
            Opcode::CvtSi2Sd => {
                let dst = Self::xreg(inst.ops[0])?;
                let src = self.greg(inst.ops[1])?;
                self.cvtsi2sd(dst, src);
            }
            Opcode::CvtSd2Si => {
                let dst = self.greg(inst.ops[0])?;
                let src = Self::xreg(inst.ops[1])?;
                self.cvttsd2si(dst, src);
            }
            Opcode::Fsqrt => {
                let dst = Self::xreg(inst.ops[0])?;
                let src = Self::xreg(inst.ops[1])?;
                self.sse_rr(0xF2, 0x51, dst, src);
            }
            Opcode::Fabs => self.encode_fabs(inst)?,
            Opcode::Fneg => self.encode_fneg(inst)?,
            Opcode::Ffloor => self.encode_roundsd(inst, 1)?,
            Opcode::Fceil => self.encode_roundsd(inst, 2)?,
            Opcode::Spawn => self.emit_spawn(inst)?,
            Opcode::Join => self.emit_join(inst)?,
            Opcode::AtomicLoad => {
                let dst = self.greg(inst.ops[0])?;
                let label = Self::label_of(inst)?.to_string();
                let scratch = self.target.scratch();
                self.movabs_label(scratch, &label);
                self.emit(&[
                    Self::rex(true, dst >= 8, false, scratch >= 8),
                    0x8B,
                    Self::modrm(0, dst, scratch),
                ]);
            }
            Opcode::AtomicStore => {
                let src = self.greg(inst.ops[0])?;
                let label = Self::label_of(inst)?.to_string();
                let scratch = self.target.scratch();
                self.movabs_label(scratch, &label);
                // lock xchg [scratch], src
                self.emit(&[
                    0xF0,
                    Self::rex(true, src >= 8, false, scratch >= 8),
                    0x87,
                    Self::modrm(0, src, scratch),
                ]);
            }
            Opcode::AtomicAdd => {
                let src = self.greg(inst.ops[0])?;
                let label = Self::label_of(inst)?.to_string();
                let scratch = self.target.scratch();
                self.movabs_label(scratch, &label);
                // lock xadd [scratch], src
                self.emit(&[
                    0xF0,
                    Self::rex(true, src >= 8, false, scratch >= 8),
                    0x0F,
                    0xC1,
                    Self::modrm(0, src, scratch),
                ]);
            }
            Opcode::AtomicFadd => self.encode_atomic_fadd(inst)?,
        }
        Ok(())
    }

    fn encode_mov(&mut self, inst: &Inst) -> Result<()> {
        let dst = self.greg(inst.ops[0])?;
        match inst.ops[1] {
            OPERAND_IMM => self.mov_ri32(dst, inst.imm),
            OPERAND_LABEL => {
                let label = Self::label_of(inst)?.to_string();
                self.movabs_label(dst, &label);
            }
            src => {
                let src = self.greg(src)?;
                self.mov_rr(dst, src);
            }
        }
        Ok(())
    }

    fn encode_alu(&mut self, inst: &Inst, opbyte: u8, imm_ext: u8) -> Result<()> {
        let dst = self.greg(inst.ops[0])?;
        if inst.ops[1] == OPERAND_IMM {
            self.alu_ri(imm_ext, dst, inst.imm);
        } else {
            let src = self.greg(inst.ops[1])?;
            self.alu_rr(opbyte, src, dst);
        }
        Ok(())
    }

    fn encode_mul(&mut self, inst: &Inst) -> Result<()> {
        let dst = self.greg(inst.ops[0])?;
        if inst.ops[1] == OPERAND_IMM {
            self.imul_ri(dst, inst.imm);
        } else {
            let src = self.greg(inst.ops[1])?;
            // imul dst, src (0F AF /r, reg field = dst)
            self.emit(&[
                Self::rex(true, dst >= 8, false, src >= 8),
                0x0F,
                0xAF,
                Self::modrm(3, dst, src),
            ]);
        }
        Ok(())
    }

    /// Signed division. RAX/RDX are saved around CQO+IDIV unless the
    /// destination is one of them; a divisor aliasing RAX/RDX moves to the
    /// encoder scratch first.
    fn encode_div(&mut self, inst: &Inst, want_rem: bool) -> Result<()> {
        if inst.ops[1] == OPERAND_IMM {
            return Err(Error::MalformedManifest(
                "division only takes the two-register form".to_string(),
            ));
        }
        let dst = self.greg(inst.ops[0])?;
        let src = self.greg(inst.ops[1])?;

        let mut divisor = src;
        if divisor == RAX || divisor == RDX {
            let scratch = self.target.scratch();
            self.mov_rr(scratch, divisor);
            divisor = scratch;
        }
        if dst != RAX {
            self.push(RAX);
        }
        if dst != RDX {
            self.push(RDX);
        }
        if dst != RAX {
            self.mov_rr(RAX, dst);
        }
        // cqo
        self.emit(&[0x48, 0x99]);
        // idiv divisor
        self.emit(&[
            Self::rex(true, false, false, divisor >= 8),
            0xF7,
            Self::modrm(3, 7, divisor),
        ]);
        if want_rem {
            if dst != RDX {
                self.mov_rr(dst, RDX);
            }
        } else if dst != RAX {
            self.mov_rr(dst, RAX);
        }
        if dst != RDX {
            self.pop(RDX);
        }
        if dst != RAX {
            self.pop(RAX);
        }
        Ok(())
    }

    /// Shift left / arithmetic shift right. Register counts go through CL
    /// with save/restore and alias handling.
    fn encode_shift(&mut self, inst: &Inst, right: bool) -> Result<()> {
        let ext = if right { 7 } else { 4 };
        let dst = self.greg(inst.ops[0])?;
        if inst.ops[1] == OPERAND_IMM {
            self.emit(&[
                Self::rex(true, false, false, dst >= 8),
                0xC1,
                Self::modrm(3, ext, dst),
                inst.imm as u8,
            ]);
            return Ok(());
        }
        let cnt = self.greg(inst.ops[1])?;
        let shift_cl = |enc: &mut Self, rm: u8| {
            enc.emit(&[
                Self::rex(true, false, false, rm >= 8),
                0xD3,
                Self::modrm(3, ext, rm),
            ]);
        };
        if dst == RCX && cnt == RCX {
            shift_cl(self, RCX);
        } else if dst == RCX {
            // Swap so CL carries the count while cnt's register holds the
            // shifted value, then move the result back.
            self.push(cnt);
            // xchg rcx, cnt
            self.emit(&[
                Self::rex(true, false, false, cnt >= 8),
                0x87,
                Self::modrm(3, RCX, cnt),
            ]);
            shift_cl(self, cnt);
            self.mov_rr(RCX, cnt);
            self.pop(cnt);
        } else if cnt == RCX {
            shift_cl(self, dst);
        } else {
            self.push(RCX);
            self.mov_rr(RCX, cnt);
            shift_cl(self, dst);
            self.pop(RCX);
        }
        Ok(())
    }

    /// Jcc opcode byte for a CJMP condition, from the signed table after an
    /// integer CMP or the unsigned table after UCOMISD.
    fn jcc_byte(&self, cc: u8) -> Result<u8> {
        let byte = if self.last_cmp_float {
            match cc {
                cond::EQ => 0x84,
                cond::NE => 0x85,
                cond::LT => 0x82, // jb
                cond::LE => 0x86, // jbe
                cond::GT => 0x87, // ja
                cond::GE => 0x83, // jae
                _ => {
                    return Err(Error::MalformedManifest(format!(
                        "bad CJMP condition code {cc}"
                    )));
                }
            }
        } else {
            match cc {
                cond::EQ => 0x84,
                cond::NE => 0x85,
                cond::LT => 0x8C, // jl
                cond::LE => 0x8E, // jle
                cond::GT => 0x8F, // jg
                cond::GE => 0x8D, // jge
                _ => {
                    return Err(Error::MalformedManifest(format!(
                        "bad CJMP condition code {cc}"
                    )));
                }
            }
        };
        Ok(byte)
    }

    /// `mov reg, [rsp + index*8 + 32 + base*8]` and the store form, via a
    /// SIB byte with scale=8.
    fn encode_array(&mut self, inst: &Inst, opbyte: u8) -> Result<()> {
        let reg = self.greg(inst.ops[0])?;
        let index = self.greg(inst.ops[1])?;
        let disp = abi::int_slot_offset(inst.imm as usize);
        self.emit(&[
            Self::rex(true, reg >= 8, index >= 8, false),
            opbyte,
            Self::modrm(2, reg, RSP),
            0xC0 | ((index & 7) << 3) | RSP,
        ]);
        self.emit_imm32(disp);
        Ok(())
    }

    fn encode_fmov(&mut self, inst: &Inst) -> Result<()> {
        let dst = Self::xreg(inst.ops[0])?;
        if inst.ops[1] == OPERAND_IMM {
            let bits = inst.float_pattern().ok_or_else(|| {
                Error::MalformedManifest(
                    "fmov constant needs the 64-bit pattern in its comment".to_string(),
                )
            })?;
            // Stage the pattern through a GPR and a stack temporary.
            let scratch = self.target.scratch();
            self.movabs(scratch, bits);
            self.store_rsp(abi::FLOAT_STAGING_OFFSET, scratch);
            self.sse_rsp_mem(0x10, dst, abi::FLOAT_STAGING_OFFSET);
        } else {
            let src = Self::xreg(inst.ops[1])?;
            self.sse_rr(0xF2, 0x10, dst, src);
        }
        Ok(())
    }

    fn encode_sse_binop(&mut self, inst: &Inst, op2: u8) -> Result<()> {
        let dst = Self::xreg(inst.ops[0])?;
        let src = Self::xreg(inst.ops[1])?;
        self.sse_arith(op2, dst, src);
        Ok(())
    }

    /// Clear the sign bit by staging through a GPR.
    fn encode_fabs(&mut self, inst: &Inst) -> Result<()> {
        let dst = Self::xreg(inst.ops[0])?;
        let src = Self::xreg(inst.ops[1])?;
        let scratch = self.target.scratch();
        self.movq_to_gpr(scratch, src);
        // shl/shr by one drops bit 63.
        self.emit(&[
            Self::rex(true, false, false, scratch >= 8),
            0xC1,
            Self::modrm(3, 4, scratch),
            1,
        ]);
        self.emit(&[
            Self::rex(true, false, false, scratch >= 8),
            0xC1,
            Self::modrm(3, 5, scratch),
            1,
        ]);
        self.movq_to_xmm(dst, scratch);
        Ok(())
    }

    fn encode_fneg(&mut self, inst: &Inst) -> Result<()> {
        let dst = Self::xreg(inst.ops[0])?;
        let src = Self::xreg(inst.ops[1])?;
        let scratch = self.target.scratch();
        let scratch2 = self.target.scratch2();
        self.movq_to_gpr(scratch, src);
        self.movabs(scratch2, 0x8000_0000_0000_0000);
        self.xor_rr(scratch, scratch2);
        self.movq_to_xmm(dst, scratch);
        Ok(())
    }

    /// `roundsd dst, src, mode` (1 = floor, 2 = ceil).
    fn encode_roundsd(&mut self, inst: &Inst, mode: u8) -> Result<()> {
        let dst = Self::xreg(inst.ops[0])?;
        let src = Self::xreg(inst.ops[1])?;
        self.emit(&[0x66]);
        if dst >= 8 || src >= 8 {
            self.emit(&[Self::rex(false, dst >= 8, false, src >= 8)]);
        }
        self.emit(&[0x0F, 0x3A, 0x0B, Self::modrm(3, dst, src), mode]);
        Ok(())
    }

    /// Compare-and-swap loop: load, add in xmm15, CMPXCHG, retry on
    /// failure. RAX is preserved around the loop.
    fn encode_atomic_fadd(&mut self, inst: &Inst) -> Result<()> {
        let src = Self::xreg(inst.ops[0])?;
        let label = Self::label_of(inst)?.to_string();
        let scratch = self.target.scratch();
        let scratch2 = self.target.scratch2();
        let xmm = abi::ENCODER_XMM_SCRATCH;

        self.movabs_label(scratch, &label);
        self.push(RAX);
        let retry = self.code.len();
        // mov rax, [scratch]
        self.emit(&[
            Self::rex(true, false, false, scratch >= 8),
            0x8B,
            Self::modrm(0, RAX, scratch),
        ]);
        self.movq_to_xmm(xmm, RAX);
        self.sse_arith(0x58, xmm, src);
        self.movq_to_gpr(scratch2, xmm);
        // lock cmpxchg [scratch], scratch2
        self.emit(&[
            0xF0,
            Self::rex(true, scratch2 >= 8, false, scratch >= 8),
            0x0F,
            0xB1,
            Self::modrm(0, scratch2, scratch),
        ]);
        // jne retry (backward, patched inline)
        let rel = retry as i64 - (self.code.len() as i64 + 6);
        self.emit(&[0x0F, 0x85]);
        self.emit_imm32(rel as i32);
        self.pop(RAX);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Inst;

    fn enc(target: Target, inst: &Inst) -> Vec<u8> {
        let mut e = Encoder::new(target);
        e.encode_inst(inst).unwrap();
        e.code
    }

    #[test]
    fn mov_reg_reg_linux() {
        // r1 -> rdi, r2 -> rsi: mov rdi, rsi = 48 89 F7
        let inst = Inst::new(Opcode::Mov, [1, 2, 0], 0, "mov r1, r2");
        assert_eq!(enc(Target::Linux, &inst), vec![0x48, 0x89, 0xF7]);
    }

    #[test]
    fn mov_reg_imm() {
        // mov rax, 42 = 48 C7 C0 2A 00 00 00
        let inst = Inst::new(Opcode::Mov, [0, OPERAND_IMM, 0], 42, "mov r0, #42");
        assert_eq!(
            enc(Target::Linux, &inst),
            vec![0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn add_with_extended_register() {
        // Linux r5 -> r8: add r8, rdi = 49 01 F8
        let inst = Inst::new(Opcode::Add, [5, 1, 0], 0, "add r5, r1");
        assert_eq!(enc(Target::Linux, &inst), vec![0x49, 0x01, 0xF8]);
    }

    #[test]
    fn cmp_imm_form() {
        // cmp rdi, 0 = 48 81 FF 00 00 00 00
        let inst = Inst::new(Opcode::Cmp, [1, OPERAND_IMM, 0], 0, "cmp r1, #0");
        assert_eq!(
            enc(Target::Linux, &inst),
            vec![0x48, 0x81, 0xFF, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn store_stack_uses_shadow_offset() {
        // mov [rsp+32+6*8], rdi = 48 89 7C 24 50
        let inst = Inst::new(Opcode::StoreStack, [1, OPERAND_IMM, 0], 6, "spill");
        assert_eq!(
            enc(Target::Linux, &inst),
            vec![0x48, 0x89, 0xBC, 0x24, 0x50, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn array_load_uses_sib_scale_8() {
        // mov rsi, [rsp + rdi*8 + 32] = 48 8B B4 FC 20 00 00 00
        let inst = Inst::new(Opcode::ArrayLoad, [2, 1, OPERAND_IMM], 0, "array_load");
        assert_eq!(
            enc(Target::Linux, &inst),
            vec![0x48, 0x8B, 0xB4, 0xFC, 0x20, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn movsd_reg_reg() {
        // movsd xmm0, xmm1 = F2 0F 10 C1
        let inst = Inst::new(Opcode::Fmov, [0, 1, 0], 0, "fmov f0, f1");
        assert_eq!(enc(Target::Linux, &inst), vec![0xF2, 0x0F, 0x10, 0xC1]);
    }

    #[test]
    fn ucomisd_sets_float_cc_table() {
        let mut e = Encoder::new(Target::Linux);
        e.encode_inst(&Inst::new(Opcode::Fcmp, [0, 1, 0], 0, "fcmp f0, f1"))
            .unwrap();
        assert_eq!(&e.code, &[0x66, 0x0F, 0x2E, 0xC1]);
        assert_eq!(e.jcc_byte(cond::LT).unwrap(), 0x82);
        e.encode_inst(&Inst::new(Opcode::Cmp, [0, 1, 0], 0, "cmp r0, r1"))
            .unwrap();
        assert_eq!(e.jcc_byte(cond::LT).unwrap(), 0x8C);
    }

    #[test]
    fn lock_xadd_encoding() {
        let mut e = Encoder::new(Target::Linux);
        e.encode_inst(&Inst::new(
            Opcode::AtomicAdd,
            [1, OPERAND_LABEL, 0],
            0,
            "atomic_add r1, shared_c",
        ))
        .unwrap();
        // movabs r11, imm64 (49 BB + 8 bytes) then F0 49 0F C1 3B
        assert_eq!(&e.code[..2], &[0x49, 0xBB]);
        assert_eq!(&e.code[10..], &[0xF0, 0x49, 0x0F, 0xC1, 0x3B]);
        assert_eq!(e.relocations().len(), 1);
        assert_eq!(e.relocations()[0].kind, RelocKind::Abs64);
        assert_eq!(e.relocations()[0].offset, 2);
    }

    #[test]
    fn rel32_resolution_math() {
        let mut e = Encoder::new(Target::Linux);
        e.code_labels.insert("target".to_string(), 0);
        e.jmp_label("target");
        e.resolve(0x1000, 0x2000, &HashMap::new()).unwrap();
        // jmp at 0: E9 <rel>, next = 0x1000 + 1 + 4, target = 0x1000.
        let rel = i32::from_le_bytes(e.code[1..5].try_into().unwrap());
        assert_eq!(rel, -5);
    }

    #[test]
    fn unknown_symbol_fails_resolution() {
        let mut e = Encoder::new(Target::Linux);
        e.jmp_label("nowhere");
        let err = e.resolve(0x1000, 0x2000, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::UndefinedSymbol(_)));
    }

    #[test]
    fn division_preserves_rax_rdx() {
        // r4 = rcx on Linux, divisor r3 = rdx (aliases RDX, goes through scratch)
        let inst = Inst::new(Opcode::Div, [4, 3, 0], 0, "div r4, r3");
        let bytes = enc(Target::Linux, &inst);
        // mov r11, rdx; push rax; push rdx; mov rax, rcx; cqo; idiv r11;
        // mov rcx, rax; pop rdx; pop rax
        assert_eq!(
            bytes,
            vec![
                0x49, 0x89, 0xD3, // mov r11, rdx
                0x50, // push rax
                0x52, // push rdx
                0x48, 0x89, 0xC8, // mov rax, rcx
                0x48, 0x99, // cqo
                0x49, 0xF7, 0xFB, // idiv r11
                0x48, 0x89, 0xC1, // mov rcx, rax
                0x5A, // pop rdx
                0x58, // pop rax
            ]
        );
    }
}
