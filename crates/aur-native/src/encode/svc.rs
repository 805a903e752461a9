//! OS service lowering: SVC, HALT, SPAWN and JOIN.
//!
//! On Linux every service is a raw `syscall` with SysV argument order. On
//! Windows they go through `kernel32.dll` IAT slots with shadow space and
//! the two stack-argument slots at `[rsp+0x20]`/`[rsp+0x28]`. Integer and
//! float formatting are open-coded division loops filling the
//! `[rsp+0x30..0x50)` buffer from the end.
//!
//! The register file is fully flushed before an SVC instruction, so these
//! sequences may clobber any mapped register except the service arguments
//! themselves.

use super::Encoder;
use crate::abi::{R8, R9, R10, RAX, RBX, RCX, RDX, RDI, RSI, SAVE_AREA_END, SAVE_AREA_OFFSET, Target};
use crate::error::{Error, Result};
use crate::ir::Service;
use crate::manifest::Inst;

const SYS_READ: i32 = 0;
const SYS_WRITE: i32 = 1;
const SYS_EXIT: i32 = 60;

const STD_OUTPUT_HANDLE: i32 = -11;
const STD_INPUT_HANDLE: i32 = -10;

/// Bits of 1e9 as an f64, for the nine-digit fraction scale.
const BILLION_F64: u64 = 0x41CD_CD65_0000_0000;

const EXIT_MSG_LABEL: &str = "__exit_msg";
const EXIT_MSG: &str = "Exit code: ";

impl Encoder {
    pub(super) fn emit_service(&mut self, number: i32) -> Result<()> {
        match number {
            n if n == Service::Print as i32 => self.svc_print(),
            n if n == Service::Exit as i32 => self.svc_exit(),
            n if n == Service::Pause as i32 => self.svc_pause(true),
            n if n == Service::PauseSilent as i32 => self.svc_pause(false),
            n if n == Service::PrintInt as i32 => self.svc_print_int(),
            n if n == Service::InputInt as i32 => self.svc_input_int(),
            n if n == Service::PrintFloat as i32 => self.svc_print_float(),
            other => Err(Error::UnsupportedOpcode(format!("service 0x{other:02X}"))),
        }
    }

    /// Program exit with the code in r0 (rax).
    pub(super) fn emit_exit(&mut self) -> Result<()> {
        match self.target {
            Target::Linux => {
                self.mov_rr(RDI, RAX);
                self.mov_ri32(RAX, SYS_EXIT);
                self.syscall();
            }
            Target::Windows => {
                self.mov_rr(RCX, RAX);
                self.iat_call("ExitProcess");
            }
        }
        Ok(())
    }

    // ── print (service 0x01): NUL-terminated string address in r1 ──

    fn svc_print(&mut self) -> Result<()> {
        match self.target {
            Target::Linux => {
                // buf to rsi, scan for the NUL, write(1, buf, len).
                self.mov_rr(RSI, RDI);
                self.emit_strlen(RSI, RDX);
                self.mov_ri32(RDI, 1);
                self.mov_ri32(RAX, SYS_WRITE);
                self.syscall();
            }
            Target::Windows => {
                // String arrives in rcx; park it in the callee-saved
                // scratch before fetching the console handle.
                self.mov_rr(RSI, RCX);
                self.mov_ri32(RCX, STD_OUTPUT_HANDLE);
                self.iat_call("GetStdHandle");
                self.mov_rr(RDX, RSI);
                self.emit_strlen(RDX, R8);
                self.mov_rr(RCX, RAX);
                self.emit_write_file();
            }
        }
        Ok(())
    }

    /// Count bytes until NUL: `len = 0; while [buf+len] != 0 { len += 1 }`.
    fn emit_strlen(&mut self, buf: u8, len: u8) {
        self.xor_rr(len, len);
        let scan = self.local_label();
        let done = self.local_label();
        self.define_local(&scan);
        self.cmp_byte_indexed(buf, len, 0);
        self.jcc_label(0x84, &done);
        self.inc(len);
        self.jmp_label(&scan);
        self.define_local(&done);
    }

    /// WriteFile(rcx, rdx, r8, &written, NULL); the written count lands in
    /// the spare stack-argument slot.
    fn emit_write_file(&mut self) {
        self.lea_rsp(R9, 0x28);
        self.store_rsp_imm(0x20, 0);
        self.iat_call("WriteFile");
    }

    // ── exit (service 0x02): code in r1 ──

    fn svc_exit(&mut self) -> Result<()> {
        match self.target {
            Target::Linux => {
                // Code already sits in rdi.
                self.mov_ri32(RAX, SYS_EXIT);
                self.syscall();
            }
            Target::Windows => {
                // Code already sits in rcx.
                self.iat_call("ExitProcess");
            }
        }
        Ok(())
    }

    // ── print_int (service 0x05): value in r1 ──

    fn svc_print_int(&mut self) -> Result<()> {
        match self.target {
            Target::Linux => {
                self.mov_rr(RAX, RDI);
                self.emit_itoa_linux();
                self.emit_linux_write_buffer();
            }
            Target::Windows => {
                self.mov_rr(RAX, RCX);
                self.emit_itoa_windows();
                self.emit_windows_write_buffer();
            }
        }
        Ok(())
    }

    /// Decimal conversion of rax into the frame buffer, newline included,
    /// buffer pointer left in rsi. Uses rcx (divisor), rdx (remainder) and
    /// r9 (sign flag).
    fn emit_itoa_linux(&mut self) {
        self.lea_rsp(RSI, SAVE_AREA_END);
        self.dec(RSI);
        self.store_byte_imm(RSI, b'\n');
        self.xor_rr(R9, R9);
        self.test_rr(RAX, RAX);
        let positive = self.local_label();
        self.jcc_label(0x89, &positive); // jns
        self.neg(RAX);
        self.mov_ri32(R9, 1);
        self.define_local(&positive);
        self.mov_ri32(RCX, 10);
        self.emit_digit_loop(RCX);
        self.test_rr(R9, R9);
        let no_sign = self.local_label();
        self.jcc_label(0x84, &no_sign);
        self.dec(RSI);
        self.store_byte_imm(RSI, b'-');
        self.define_local(&no_sign);
    }

    /// Same as the Linux version with the Win64 volatile set: r10 holds
    /// the divisor and rdi the sign flag (callee-saved, survives the
    /// GetStdHandle call that follows).
    fn emit_itoa_windows(&mut self) {
        self.lea_rsp(RSI, SAVE_AREA_END);
        self.dec(RSI);
        self.store_byte_imm(RSI, b'\n');
        self.xor_rr(RDI, RDI);
        self.test_rr(RAX, RAX);
        let positive = self.local_label();
        self.jcc_label(0x89, &positive);
        self.neg(RAX);
        self.mov_ri32(RDI, 1);
        self.define_local(&positive);
        self.mov_ri32(R10, 10);
        self.emit_digit_loop(R10);
        self.test_rr(RDI, RDI);
        let no_sign = self.local_label();
        self.jcc_label(0x84, &no_sign);
        self.dec(RSI);
        self.store_byte_imm(RSI, b'-');
        self.define_local(&no_sign);
    }

    /// `do { rax /= 10; *--rsi = '0' + rem } while rax != 0`.
    fn emit_digit_loop(&mut self, divisor: u8) {
        let digit = self.local_label();
        self.define_local(&digit);
        self.xor_rr(RDX, RDX);
        self.div_unsigned(divisor);
        self.add_ri(RDX, i32::from(b'0'));
        self.dec(RSI);
        self.store_byte(RSI, RDX);
        self.test_rr(RAX, RAX);
        self.jcc_label(0x85, &digit); // jnz
    }

    /// write(1, rsi, buffer_end - rsi).
    fn emit_linux_write_buffer(&mut self) {
        self.lea_rsp(RDX, SAVE_AREA_END);
        self.sub_rr(RDX, RSI);
        self.mov_ri32(RDI, 1);
        self.mov_ri32(RAX, SYS_WRITE);
        self.syscall();
    }

    /// WriteFile(GetStdHandle(-11), rsi, buffer_end - rsi, …).
    fn emit_windows_write_buffer(&mut self) {
        self.mov_ri32(RCX, STD_OUTPUT_HANDLE);
        self.iat_call("GetStdHandle");
        self.mov_rr(RCX, RAX);
        self.mov_rr(RDX, RSI);
        self.lea_rsp(R8, SAVE_AREA_END);
        self.sub_rr(R8, RSI);
        self.emit_write_file();
    }

    // ── print_float (service 0x07): value in f0 ──
    //
    // Prints the truncated integer part, a dot, then nine zero-padded
    // fraction digits scaled by 1e9, then a newline.

    fn svc_print_float(&mut self) -> Result<()> {
        let (sign, divisor, counter) = match self.target {
            Target::Linux => (R9, RCX, R10),
            Target::Windows => (RDI, R10, R11_FOR_COUNTER),
        };

        // Sign: bit 63 of the raw pattern; clear it and remember.
        self.xor_rr(sign, sign);
        self.movq_to_gpr(RAX, 0);
        self.test_rr(RAX, RAX);
        let positive = self.local_label();
        self.jcc_label(0x89, &positive); // jns
        self.shl1(RAX);
        self.shr1(RAX);
        self.movq_to_xmm(0, RAX);
        self.mov_ri32(sign, 1);
        self.define_local(&positive);

        // rbx = integer part, xmm0 = fraction scaled by 1e9.
        self.cvttsd2si(RBX, 0);
        self.cvtsi2sd(1, RBX);
        self.sse_arith(0x5C, 0, 1); // subsd xmm0, xmm1
        self.movabs(RAX, BILLION_F64);
        self.movq_to_xmm(1, RAX);
        self.sse_arith(0x59, 0, 1); // mulsd xmm0, xmm1
        self.cvttsd2si(R8, 0);

        self.lea_rsp(RSI, SAVE_AREA_END);
        self.dec(RSI);
        self.store_byte_imm(RSI, b'\n');

        // Exactly nine fraction digits, zero padded.
        self.mov_ri32(divisor, 10);
        self.mov_ri32(counter, 9);
        self.mov_rr(RAX, R8);
        let frac = self.local_label();
        self.define_local(&frac);
        self.xor_rr(RDX, RDX);
        self.div_unsigned(divisor);
        self.add_ri(RDX, i32::from(b'0'));
        self.dec(RSI);
        self.store_byte(RSI, RDX);
        self.dec(counter);
        self.test_rr(counter, counter);
        self.jcc_label(0x85, &frac);

        self.dec(RSI);
        self.store_byte_imm(RSI, b'.');

        // Integer part.
        self.mov_rr(RAX, RBX);
        self.emit_digit_loop(divisor);

        self.test_rr(sign, sign);
        let no_sign = self.local_label();
        self.jcc_label(0x84, &no_sign);
        self.dec(RSI);
        self.store_byte_imm(RSI, b'-');
        self.define_local(&no_sign);

        match self.target {
            Target::Linux => self.emit_linux_write_buffer(),
            Target::Windows => self.emit_windows_write_buffer(),
        }
        Ok(())
    }

    // ── input_int (service 0x06): result in r0 ──

    fn svc_input_int(&mut self) -> Result<()> {
        match self.target {
            Target::Linux => {
                // read(0, [rsp+0x30], 31)
                self.xor_rr(RDI, RDI);
                self.lea_rsp(RSI, SAVE_AREA_OFFSET);
                self.mov_ri32(RDX, 31);
                self.mov_ri32(RAX, SYS_READ);
                self.syscall();
                self.lea_rsp(RSI, SAVE_AREA_OFFSET);
                self.emit_parse_int(R9);
            }
            Target::Windows => {
                self.mov_ri32(RCX, STD_INPUT_HANDLE);
                self.iat_call("GetStdHandle");
                self.mov_rr(RCX, RAX);
                self.lea_rsp(RDX, SAVE_AREA_OFFSET);
                self.mov_ri32(R8, 31);
                self.lea_rsp(R9, 0x28);
                self.store_rsp_imm(0x20, 0);
                self.iat_call("ReadConsoleA");
                self.lea_rsp(RSI, SAVE_AREA_OFFSET);
                self.emit_parse_int(RDI);
            }
        }
        Ok(())
    }

    /// Parse an optionally signed decimal from [rsi] into rax.
    fn emit_parse_int(&mut self, sign: u8) {
        self.xor_rr(RAX, RAX);
        self.xor_rr(sign, sign);
        self.cmp_byte_indexed(RSI, RAX, b'-');
        let loop_top = self.local_label();
        self.jcc_label(0x85, &loop_top); // jne
        self.mov_ri32(sign, 1);
        self.inc(RSI);
        self.define_local(&loop_top);
        let done = self.local_label();
        self.load_byte(RDX, RSI);
        self.cmp_ri(RDX, i32::from(b'0'));
        self.jcc_label(0x82, &done); // jb
        self.cmp_ri(RDX, i32::from(b'9'));
        self.jcc_label(0x87, &done); // ja
        self.imul_ri(RAX, 10);
        self.sub_ri(RDX, i32::from(b'0'));
        self.add_rr(RAX, RDX);
        self.inc(RSI);
        self.jmp_label(&loop_top);
        self.define_local(&done);
        self.test_rr(sign, sign);
        let no_neg = self.local_label();
        self.jcc_label(0x84, &no_neg);
        self.neg(RAX);
        self.define_local(&no_neg);
    }

    // ── pause (0x03) / pause_silent (0x04): exit code in r0 ──

    fn svc_pause(&mut self, verbose: bool) -> Result<()> {
        match self.target {
            Target::Linux => {
                if verbose {
                    self.push(RAX);
                    self.intern_data_cstr(EXIT_MSG_LABEL, EXIT_MSG);
                    self.movabs_label(RSI, EXIT_MSG_LABEL);
                    self.mov_ri32(RDX, EXIT_MSG.len() as i32);
                    self.mov_ri32(RDI, 1);
                    self.mov_ri32(RAX, SYS_WRITE);
                    self.syscall();
                    // Print the code itself.
                    self.load_rsp(RAX, 0);
                    self.emit_itoa_linux();
                    self.emit_linux_write_buffer();
                    self.pop(RAX);
                    self.push(RAX);
                }
                // Wait for a line on stdin.
                if !verbose {
                    self.push(RAX);
                }
                self.xor_rr(RDI, RDI);
                self.lea_rsp(RSI, SAVE_AREA_OFFSET);
                self.mov_ri32(RDX, 31);
                self.mov_ri32(RAX, SYS_READ);
                self.syscall();
                self.pop(RDI);
                self.mov_ri32(RAX, SYS_EXIT);
                self.syscall();
            }
            Target::Windows => {
                // Exit code survives the calls in rbx (callee-saved).
                self.mov_rr(RBX, RAX);
                if verbose {
                    self.intern_data_cstr(EXIT_MSG_LABEL, EXIT_MSG);
                    self.mov_ri32(RCX, STD_OUTPUT_HANDLE);
                    self.iat_call("GetStdHandle");
                    self.mov_rr(RCX, RAX);
                    self.movabs_label(RDX, EXIT_MSG_LABEL);
                    self.mov_ri32(R8, EXIT_MSG.len() as i32);
                    self.emit_write_file();
                    self.mov_rr(RAX, RBX);
                    self.emit_itoa_windows();
                    self.emit_windows_write_buffer();
                }
                self.mov_ri32(RCX, STD_INPUT_HANDLE);
                self.iat_call("GetStdHandle");
                self.mov_rr(RCX, RAX);
                self.lea_rsp(RDX, SAVE_AREA_OFFSET);
                self.mov_ri32(R8, 31);
                self.lea_rsp(R9, 0x28);
                self.store_rsp_imm(0x20, 0);
                self.iat_call("ReadConsoleA");
                self.mov_rr(RCX, RBX);
                self.iat_call("ExitProcess");
            }
        }
        Ok(())
    }

    // ── SPAWN / JOIN ──

    /// CreateThread(NULL, 0, func, NULL, 0, NULL); handle lands in the
    /// destination register. The four ABI argument registers are saved to
    /// the reserved frame slots around the call.
    pub(super) fn emit_spawn(&mut self, inst: &Inst) -> Result<()> {
        if self.target == Target::Linux {
            // TODO: pick a Linux thread lowering (raw clone vs linking
            // against pthread_create) before enabling SPAWN there.
            return Err(Error::UnsupportedOpcode(
                "spawn is only lowered for the Windows target".to_string(),
            ));
        }
        let dst = self.greg(inst.ops[0])?;
        let label = inst.label_target().ok_or_else(|| {
            Error::MalformedManifest("spawn needs a function label in its comment".to_string())
        })?;
        let label = label.to_string();

        self.save_arg_regs();
        self.store_rsp_imm(0x20, 0); // creation flags
        self.store_rsp_imm(0x28, 0); // lpThreadId
        self.xor_rr(RCX, RCX);
        self.xor_rr(RDX, RDX);
        self.movabs_label(R8, &label);
        self.xor_rr(R9, R9);
        self.iat_call("CreateThread");
        if dst != RAX {
            self.mov_rr(dst, RAX);
        }
        self.restore_arg_regs(Some(dst));
        Ok(())
    }

    /// WaitForSingleObject(handle, INFINITE).
    pub(super) fn emit_join(&mut self, inst: &Inst) -> Result<()> {
        if self.target == Target::Linux {
            // TODO: same decision as SPAWN for the Linux target.
            return Err(Error::UnsupportedOpcode(
                "join is only lowered for the Windows target".to_string(),
            ));
        }
        let handle = self.greg(inst.ops[0])?;
        self.save_arg_regs();
        if handle != RCX {
            self.mov_rr(RCX, handle);
        }
        self.mov_ri32(RDX, -1); // INFINITE
        self.iat_call("WaitForSingleObject");
        self.restore_arg_regs(None);
        Ok(())
    }

    const ARG_REGS: [u8; 4] = [RCX, RDX, R8, R9];

    fn save_arg_regs(&mut self) {
        for (i, &reg) in Self::ARG_REGS.iter().enumerate() {
            self.store_rsp(SAVE_AREA_OFFSET + (i as i32) * 8, reg);
        }
    }

    fn restore_arg_regs(&mut self, skip: Option<u8>) {
        for (i, &reg) in Self::ARG_REGS.iter().enumerate() {
            if skip == Some(reg) {
                continue;
            }
            self.load_rsp(reg, SAVE_AREA_OFFSET + (i as i32) * 8);
        }
    }

    // small shifts used by the float sign handling

    fn shl1(&mut self, reg: u8) {
        self.emit(&[0x48 | u8::from(reg >= 8), 0xD1, 0xE0 | (reg & 7)]);
    }

    fn shr1(&mut self, reg: u8) {
        self.emit(&[0x48 | u8::from(reg >= 8), 0xD1, 0xE8 | (reg & 7)]);
    }
}

/// r11 as the Windows fraction-digit counter (volatile, unmapped during a
/// flushed SVC).
const R11_FOR_COUNTER: u8 = crate::abi::R11;
