//! Expression lowering.
//!
//! Integer results are handed around as `Val` (a register plus whether it
//! came from the scratch pool), floats as `FVal`. The scratch pool only
//! has two integer registers; binary lowering stashes its left operand to
//! a stack slot whenever the pool runs dry or the right operand contains
//! a call, so nesting depth is unbounded.

use super::Codegen;
use crate::abi;
use crate::error::{Error, Result};
use crate::ir::{BinOp, Expr, Literal, MathFunc, Type, UnOp};
use crate::manifest::{Inst, OPERAND_IMM, OPERAND_LABEL, Opcode, cond};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Val {
    pub reg: u8,
    pub temp: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FVal {
    pub reg: u8,
    pub temp: bool,
}

pub(crate) fn cond_code(op: BinOp) -> u8 {
    match op {
        BinOp::Eq => cond::EQ,
        BinOp::Ne => cond::NE,
        BinOp::Lt => cond::LT,
        BinOp::Le => cond::LE,
        BinOp::Gt => cond::GT,
        BinOp::Ge => cond::GE,
        _ => unreachable!("not a comparison operator"),
    }
}

pub(crate) fn negate_cond(cc: u8) -> u8 {
    match cc {
        cond::EQ => cond::NE,
        cond::NE => cond::EQ,
        cond::LT => cond::GE,
        cond::LE => cond::GT,
        cond::GT => cond::LE,
        cond::GE => cond::LT,
        _ => unreachable!("bad condition code"),
    }
}

pub(crate) fn cond_name(cc: u8) -> &'static str {
    match cc {
        cond::EQ => "eq",
        cond::NE => "ne",
        cond::LT => "lt",
        cond::LE => "le",
        cond::GT => "gt",
        cond::GE => "ge",
        _ => unreachable!("bad condition code"),
    }
}

fn imm32(value: i64) -> Option<i32> {
    i32::try_from(value).ok()
}

impl Codegen {
    pub(crate) fn release(&mut self, val: Val) {
        if val.temp {
            self.ints.release_temp(val.reg);
        }
    }

    pub(crate) fn release_f(&mut self, val: FVal) {
        if val.temp {
            self.floats.release_temp(val.reg);
        }
    }

    pub(crate) fn alloc_temp_stashing(&mut self, _protect: &[u8]) -> Result<u8> {
        self.ints.alloc_temp()
    }

    fn load_imm(&mut self, value: i64) -> Result<Val> {
        let imm = imm32(value).ok_or(Error::ImmediateOutOfRange(value))?;
        let reg = self.ints.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::Mov,
            [reg, OPERAND_IMM, 0],
            imm,
            format!("mov r{reg}, #{imm}"),
        ));
        Ok(Val { reg, temp: true })
    }

    /// Move a value into a writable scratch register, reusing it when it
    /// already is one.
    fn writable(&mut self, val: Val) -> Result<u8> {
        if val.temp {
            return Ok(val.reg);
        }
        let reg = self.ints.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::Mov,
            [reg, val.reg, 0],
            0,
            format!("mov r{reg}, r{}", val.reg),
        ));
        Ok(reg)
    }

    fn fwritable(&mut self, val: FVal) -> Result<u8> {
        if val.temp {
            return Ok(val.reg);
        }
        let reg = self.floats.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::Fmov,
            [reg, val.reg, 0],
            0,
            format!("fmov f{reg}, f{}", val.reg),
        ));
        Ok(reg)
    }

    fn cvt_to_float(&mut self, val: Val) -> Result<FVal> {
        let reg = self.floats.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::CvtSi2Sd,
            [reg, val.reg, 0],
            0,
            format!("cvtsi2sd f{reg}, r{}", val.reg),
        ));
        self.release(val);
        Ok(FVal { reg, temp: true })
    }

    fn cvt_to_int(&mut self, val: FVal) -> Result<Val> {
        let reg = self.ints.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::CvtSd2Si,
            [reg, val.reg, 0],
            0,
            format!("cvtsd2si r{reg}, f{}", val.reg),
        ));
        self.release_f(val);
        Ok(Val { reg, temp: true })
    }

    pub(crate) fn lower_int_expr(&mut self, expr: &Expr) -> Result<Val> {
        match expr {
            Expr::Literal(Literal::Int(v)) => self.load_imm(*v),
            Expr::Literal(Literal::Bool(b)) => self.load_imm(i64::from(*b)),
            Expr::Literal(Literal::Str(text)) => {
                let label = self.intern_string(&text.clone());
                let reg = self.ints.alloc_temp()?;
                self.emit(Inst::new(
                    Opcode::Mov,
                    [reg, OPERAND_LABEL, 0],
                    0,
                    format!("mov r{reg}, {label}"),
                ));
                Ok(Val { reg, temp: true })
            }
            Expr::Literal(Literal::Float(_)) => {
                let f = self.lower_float_expr(expr)?;
                self.cvt_to_int(f)
            }
            Expr::Variable { name, .. } => {
                let is_float = self
                    .var_types
                    .get(name)
                    .ok_or_else(|| Error::UndefinedVariable(name.clone()))?
                    .is_float();
                if is_float {
                    let reg = self.floats.get_variable(name, &mut self.out)?;
                    self.cvt_to_int(FVal { reg, temp: false })
                } else {
                    let reg = self.ints.get_variable(name, &mut self.out)?;
                    Ok(Val { reg, temp: false })
                }
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                if op.is_comparison() {
                    self.lower_compare_value(*op, lhs, rhs)
                } else if matches!(op, BinOp::And | BinOp::Or) {
                    self.lower_short_circuit(*op, lhs, rhs)
                } else if lhs.is_float() || rhs.is_float() {
                    let f = self.lower_float_binary(*op, lhs, rhs)?;
                    self.cvt_to_int(f)
                } else {
                    self.lower_int_binary(*op, lhs, rhs)
                }
            }
            Expr::Unary { op, operand, .. } => self.lower_int_unary(*op, operand),
            Expr::Call { name, args, .. } => self.lower_call(name, args),
            Expr::Cast { target, expr } => {
                if target.is_float() {
                    let f = self.lower_float_expr(expr)?;
                    self.cvt_to_int(f)
                } else if expr.is_float() {
                    let f = self.lower_float_expr(expr)?;
                    self.cvt_to_int(f)
                } else {
                    self.lower_int_expr(expr)
                }
            }
            Expr::ArrayLiteral { .. } => Err(Error::InvalidArgument(
                "array literal outside a let binding".to_string(),
            )),
            Expr::ArrayAccess { array, index, .. } => self.lower_array_access(array, index),
            Expr::Spawn { func } => self.lower_spawn(func),
            Expr::AtomicLoad { name, ty } => {
                if ty.is_float() {
                    return Err(Error::InvalidArgument(format!(
                        "atomic.load of float shared variable {name} is not representable"
                    )));
                }
                let label = self.shared_label(name)?;
                let reg = self.ints.alloc_temp()?;
                self.emit(Inst::new(
                    Opcode::AtomicLoad,
                    [reg, OPERAND_LABEL, 0],
                    0,
                    format!("atomic_load r{reg}, {label}"),
                ));
                Ok(Val { reg, temp: true })
            }
            Expr::Input => {
                self.flush_all();
                self.emit(Inst::new(
                    Opcode::Svc,
                    [OPERAND_IMM, 0, 0],
                    i32::from(crate::ir::Service::InputInt as u8),
                    "svc input_int",
                ));
                let reg = self.ints.alloc_temp()?;
                self.emit(Inst::new(
                    Opcode::Mov,
                    [reg, abi::VREG_RET, 0],
                    0,
                    format!("mov r{reg}, r0"),
                ));
                Ok(Val { reg, temp: true })
            }
            Expr::MathCall { .. } => {
                let f = self.lower_float_expr(expr)?;
                self.cvt_to_int(f)
            }
        }
    }

    fn lower_int_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Val> {
        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Rem => Opcode::Rem,
            BinOp::BitAnd => Opcode::And,
            BinOp::BitOr => Opcode::Or,
            BinOp::BitXor => Opcode::Xor,
            BinOp::Shl => Opcode::Shl,
            BinOp::Shr => Opcode::Shr,
            _ => unreachable!("handled elsewhere"),
        };
        let mnemonic = opcode_mnemonic(opcode);

        let l = self.lower_int_expr(lhs)?;
        let dst = self.writable(l)?;

        // Immediate-right form for literals in signed 32-bit range.
        // Division only exists in the two-register form.
        if !matches!(op, BinOp::Div | BinOp::Rem) {
            if let Expr::Literal(Literal::Int(v)) = rhs {
                if let Some(imm) = imm32(*v) {
                    self.emit(Inst::new(
                        opcode,
                        [dst, OPERAND_IMM, 0],
                        imm,
                        format!("{mnemonic} r{dst}, #{imm}"),
                    ));
                    return Ok(Val { reg: dst, temp: true });
                }
            }
        }

        let stashed = if rhs.contains_call() || !self.ints.temp_available() {
            let slot = self.ints.reserve_slot();
            self.emit(Inst::new(
                Opcode::StoreStack,
                [dst, OPERAND_IMM, 0],
                slot as i32,
                format!("stash r{dst} to slot {slot}"),
            ));
            self.ints.release_temp(dst);
            Some(slot)
        } else {
            None
        };

        let r = self.lower_int_expr(rhs)?;
        let dst = if let Some(slot) = stashed {
            let reg = self.ints.alloc_temp()?;
            self.emit(Inst::new(
                Opcode::LoadStack,
                [reg, OPERAND_IMM, 0],
                slot as i32,
                format!("unstash r{reg} from slot {slot}"),
            ));
            reg
        } else {
            dst
        };
        self.emit(Inst::new(
            opcode,
            [dst, r.reg, 0],
            0,
            format!("{mnemonic} r{dst}, r{}", r.reg),
        ));
        self.release(r);
        Ok(Val { reg: dst, temp: true })
    }

    fn lower_int_unary(&mut self, op: UnOp, operand: &Expr) -> Result<Val> {
        if operand.is_float() && op == UnOp::Neg {
            let f = self.lower_float_expr(&Expr::Unary {
                op,
                operand: Box::new(operand.clone()),
                ty: Type::Float,
            })?;
            return self.cvt_to_int(f);
        }
        let v = self.lower_int_expr(operand)?;
        let dst = self.writable(v)?;
        match op {
            UnOp::Neg => {
                // Two's complement in place: -x = ~x + 1.
                self.emit(Inst::new(
                    Opcode::Xor,
                    [dst, OPERAND_IMM, 0],
                    -1,
                    format!("xor r{dst}, #-1"),
                ));
                self.emit(Inst::new(
                    Opcode::Add,
                    [dst, OPERAND_IMM, 0],
                    1,
                    format!("add r{dst}, #1"),
                ));
            }
            UnOp::Not => {
                self.emit(Inst::new(
                    Opcode::Xor,
                    [dst, OPERAND_IMM, 0],
                    1,
                    format!("xor r{dst}, #1"),
                ));
            }
            UnOp::BitNot => {
                self.emit(Inst::new(Opcode::Not, [dst, 0, 0], 0, format!("not r{dst}")));
            }
        }
        Ok(Val { reg: dst, temp: true })
    }

    /// Emit CMP or FCMP for a comparison's operands. The caller chooses
    /// which Jcc to pair with the flags.
    pub(crate) fn lower_compare(&mut self, lhs: &Expr, rhs: &Expr) -> Result<()> {
        if lhs.is_float() || rhs.is_float() {
            let l = self.lower_float_expr(lhs)?;
            let stash = rhs.contains_call().then(|| self.fstash(l)).transpose()?;
            let r = self.lower_float_expr(rhs)?;
            let l = match stash {
                Some(slot) => self.funstash(slot)?,
                None => l,
            };
            self.emit(Inst::new(
                Opcode::Fcmp,
                [l.reg, r.reg, 0],
                0,
                format!("fcmp f{}, f{}", l.reg, r.reg),
            ));
            self.release_f(r);
            self.release_f(l);
            return Ok(());
        }
        let l = self.lower_int_expr(lhs)?;
        if let Expr::Literal(Literal::Int(v)) = rhs {
            if let Some(imm) = imm32(*v) {
                self.emit(Inst::new(
                    Opcode::Cmp,
                    [l.reg, OPERAND_IMM, 0],
                    imm,
                    format!("cmp r{}, #{imm}", l.reg),
                ));
                self.release(l);
                return Ok(());
            }
        }
        let stashed = if rhs.contains_call() {
            let slot = self.ints.reserve_slot();
            self.emit(Inst::new(
                Opcode::StoreStack,
                [l.reg, OPERAND_IMM, 0],
                slot as i32,
                format!("stash r{} to slot {slot}", l.reg),
            ));
            self.release(l);
            Some(slot)
        } else {
            None
        };
        let r = self.lower_int_expr(rhs)?;
        let l = if let Some(slot) = stashed {
            let reg = self.ints.alloc_temp()?;
            self.emit(Inst::new(
                Opcode::LoadStack,
                [reg, OPERAND_IMM, 0],
                slot as i32,
                format!("unstash r{reg} from slot {slot}"),
            ));
            Val { reg, temp: true }
        } else {
            l
        };
        self.emit(Inst::new(
            Opcode::Cmp,
            [l.reg, r.reg, 0],
            0,
            format!("cmp r{}, r{}", l.reg, r.reg),
        ));
        self.release(r);
        self.release(l);
        Ok(())
    }

    /// Materialize a comparison as 0/1.
    fn lower_compare_value(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Val> {
        let cc = cond_code(op);
        self.lower_compare(lhs, rhs)?;
        let reg = self.ints.alloc_temp()?;
        let done = self.new_label();
        // MOV leaves the flags alone, so the result can be staged between
        // the compare and the jump.
        self.emit(Inst::new(
            Opcode::Mov,
            [reg, OPERAND_IMM, 0],
            1,
            format!("mov r{reg}, #1"),
        ));
        self.emit(Inst::new(
            Opcode::Cjmp,
            [cc, OPERAND_LABEL, 0],
            0,
            format!("cjmp {}, {done}", cond_name(cc)),
        ));
        self.emit(Inst::new(
            Opcode::Mov,
            [reg, OPERAND_IMM, 0],
            0,
            format!("mov r{reg}, #0"),
        ));
        self.define_label(&done);
        Ok(Val { reg, temp: true })
    }

    /// `&&` / `||` as a branch diamond; the right-hand side is skipped
    /// entirely when the left side decides the outcome.
    fn lower_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Val> {
        let l = self.lower_int_expr(lhs)?;
        let slot = self.ints.reserve_slot();
        self.emit(Inst::new(
            Opcode::StoreStack,
            [l.reg, OPERAND_IMM, 0],
            slot as i32,
            format!("stash r{} to slot {slot}", l.reg),
        ));
        self.sync_ints();
        self.emit(Inst::new(
            Opcode::Cmp,
            [l.reg, OPERAND_IMM, 0],
            0,
            format!("cmp r{}, #0", l.reg),
        ));
        self.release(l);
        let done = self.new_label();
        let skip_cc = if op == BinOp::And { cond::EQ } else { cond::NE };
        self.emit(Inst::new(
            Opcode::Cjmp,
            [skip_cc, OPERAND_LABEL, 0],
            0,
            format!("cjmp {}, {done}", cond_name(skip_cc)),
        ));
        let r = self.lower_int_expr(rhs)?;
        self.emit(Inst::new(
            Opcode::StoreStack,
            [r.reg, OPERAND_IMM, 0],
            slot as i32,
            format!("stash r{} to slot {slot}", r.reg),
        ));
        self.release(r);
        self.sync_ints();
        self.define_label(&done);
        let reg = self.ints.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::LoadStack,
            [reg, OPERAND_IMM, 0],
            slot as i32,
            format!("unstash r{reg} from slot {slot}"),
        ));
        Ok(Val { reg, temp: true })
    }

    fn lower_array_access(&mut self, array: &str, index: &Expr) -> Result<Val> {
        let info = self
            .arrays
            .get(array)
            .ok_or_else(|| Error::UndefinedVariable(array.to_string()))?
            .clone();
        if let Expr::Literal(Literal::Int(i)) = index {
            let i = usize::try_from(*i).map_err(|_| {
                Error::InvalidArgument(format!("negative index into array {array}"))
            })?;
            if i >= info.len {
                return Err(Error::InvalidArgument(format!(
                    "static index {i} out of bounds for array {array} (len {})",
                    info.len
                )));
            }
            let reg = self.ints.alloc_temp()?;
            self.emit(Inst::new(
                Opcode::LoadStack,
                [reg, OPERAND_IMM, 0],
                (info.base + i) as i32,
                format!("load {array}[{i}]"),
            ));
            return Ok(Val { reg, temp: true });
        }
        let idx = self.lower_int_expr(index)?;
        let reg = self.ints.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::ArrayLoad,
            [reg, idx.reg, OPERAND_IMM],
            info.base as i32,
            format!("array_load r{reg}, {array}[r{}]", idx.reg),
        ));
        self.release(idx);
        Ok(Val { reg, temp: true })
    }

    fn lower_spawn(&mut self, func: &str) -> Result<Val> {
        if !self.functions.contains_key(func) {
            return Err(Error::UndefinedFunction(func.to_string()));
        }
        self.flush_all();
        let reg = self.ints.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::Spawn,
            [reg, OPERAND_LABEL, 0],
            0,
            format!("spawn r{reg}, fn_{func}"),
        ));
        Ok(Val { reg, temp: true })
    }

    /// Stage arguments into stack slots, flush the register file, load the
    /// argument registers and CALL. Returns the callee's signature.
    fn lower_call_common(&mut self, name: &str, args: &[Expr]) -> Result<super::FuncSig> {
        let sig = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UndefinedFunction(name.to_string()))?;
        if args.len() != sig.params.len() {
            return Err(Error::InvalidArgument(format!(
                "call to {name} with {} arguments, expected {}",
                args.len(),
                sig.params.len()
            )));
        }
        if args.len() > 6 {
            return Err(Error::InvalidArgument(format!(
                "call to {name} with more than 6 arguments"
            )));
        }

        enum Stage {
            Int(usize),
            Float(usize),
        }
        let mut stages = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            if sig.params[i].is_float() {
                let v = self.lower_float_expr(arg)?;
                let slot = self.floats.reserve_slot();
                self.emit(Inst::new(
                    Opcode::Fstore,
                    [v.reg, OPERAND_IMM, 0],
                    slot as i32,
                    format!("store arg {i} to float slot {slot}"),
                ));
                self.release_f(v);
                stages.push(Stage::Float(slot));
            } else {
                let v = self.lower_int_expr(arg)?;
                let slot = self.ints.reserve_slot();
                self.emit(Inst::new(
                    Opcode::StoreStack,
                    [v.reg, OPERAND_IMM, 0],
                    slot as i32,
                    format!("store arg {i} to slot {slot}"),
                ));
                self.release(v);
                stages.push(Stage::Int(slot));
            }
        }
        self.flush_all();
        for (i, stage) in stages.iter().enumerate() {
            let vreg = (i + 1) as u8;
            match stage {
                Stage::Int(slot) => self.emit(Inst::new(
                    Opcode::LoadStack,
                    [vreg, OPERAND_IMM, 0],
                    *slot as i32,
                    format!("load arg {i} into r{vreg}"),
                )),
                Stage::Float(slot) => self.emit(Inst::new(
                    Opcode::Fload,
                    [vreg, OPERAND_IMM, 0],
                    *slot as i32,
                    format!("load arg {i} into f{vreg}"),
                )),
            }
        }
        self.emit(Inst::new(
            Opcode::Call,
            [OPERAND_LABEL, 0, 0],
            0,
            format!("call fn_{name}"),
        ));
        Ok(sig)
    }

    pub(crate) fn lower_call(&mut self, name: &str, args: &[Expr]) -> Result<Val> {
        let sig = self.lower_call_common(name, args)?;
        if sig.ret.is_float() {
            let freg = self.floats.alloc_temp()?;
            self.emit(Inst::new(
                Opcode::Fmov,
                [freg, 0, 0],
                0,
                format!("fmov f{freg}, f0"),
            ));
            return self.cvt_to_int(FVal {
                reg: freg,
                temp: true,
            });
        }
        let reg = self.ints.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::Mov,
            [reg, abi::VREG_RET, 0],
            0,
            format!("mov r{reg}, r0"),
        ));
        Ok(Val { reg, temp: true })
    }

    fn lower_call_float(&mut self, name: &str, args: &[Expr]) -> Result<FVal> {
        let sig = self.lower_call_common(name, args)?;
        if sig.ret.is_float() {
            let reg = self.floats.alloc_temp()?;
            self.emit(Inst::new(
                Opcode::Fmov,
                [reg, 0, 0],
                0,
                format!("fmov f{reg}, f0"),
            ));
            Ok(FVal { reg, temp: true })
        } else {
            let reg = self.ints.alloc_temp()?;
            self.emit(Inst::new(
                Opcode::Mov,
                [reg, abi::VREG_RET, 0],
                0,
                format!("mov r{reg}, r0"),
            ));
            self.cvt_to_float(Val { reg, temp: true })
        }
    }

    fn fstash(&mut self, val: FVal) -> Result<usize> {
        let slot = self.floats.reserve_slot();
        self.emit(Inst::new(
            Opcode::Fstore,
            [val.reg, OPERAND_IMM, 0],
            slot as i32,
            format!("stash f{} to float slot {slot}", val.reg),
        ));
        self.release_f(val);
        Ok(slot)
    }

    fn funstash(&mut self, slot: usize) -> Result<FVal> {
        let reg = self.floats.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::Fload,
            [reg, OPERAND_IMM, 0],
            slot as i32,
            format!("unstash f{reg} from float slot {slot}"),
        ));
        Ok(FVal { reg, temp: true })
    }

    fn load_float_const(&mut self, value: f64) -> Result<FVal> {
        let bits = value.to_bits();
        let reg = self.floats.alloc_temp()?;
        self.emit(Inst::new(
            Opcode::Fmov,
            [reg, OPERAND_IMM, 0],
            bits as u32 as i32,
            format!("fmov f{reg}, 0x{bits:016X}"),
        ));
        Ok(FVal { reg, temp: true })
    }

    pub(crate) fn lower_float_expr(&mut self, expr: &Expr) -> Result<FVal> {
        match expr {
            Expr::Literal(Literal::Float(v)) => self.load_float_const(*v),
            Expr::Literal(Literal::Int(v)) => {
                let int = self.load_imm(*v)?;
                self.cvt_to_float(int)
            }
            Expr::Variable { name, .. } => {
                let is_float = self
                    .var_types
                    .get(name)
                    .ok_or_else(|| Error::UndefinedVariable(name.clone()))?
                    .is_float();
                if is_float {
                    let reg = self.floats.get_variable(name, &mut self.out)?;
                    Ok(FVal { reg, temp: false })
                } else {
                    let reg = self.ints.get_variable(name, &mut self.out)?;
                    self.cvt_to_float(Val { reg, temp: false })
                }
            }
            Expr::Binary { op, lhs, rhs, .. } if !op.is_comparison() && !matches!(op, BinOp::And | BinOp::Or) => {
                self.lower_float_binary(*op, lhs, rhs)
            }
            Expr::Unary {
                op: UnOp::Neg,
                operand,
                ..
            } => {
                let v = self.lower_float_expr(operand)?;
                let dst = self.fwritable(v)?;
                self.emit(Inst::new(
                    Opcode::Fneg,
                    [dst, dst, 0],
                    0,
                    format!("fneg f{dst}, f{dst}"),
                ));
                Ok(FVal { reg: dst, temp: true })
            }
            Expr::Cast { target, expr } => {
                if target.is_float() {
                    self.lower_float_expr(expr)
                } else {
                    let v = self.lower_int_expr(expr)?;
                    self.cvt_to_float(v)
                }
            }
            Expr::Call { name, args, .. } => self.lower_call_float(name, args),
            Expr::MathCall { func, args } => self.lower_math_call(*func, args),
            // Bool-producing and integer expressions convert on demand.
            _ => {
                let v = self.lower_int_expr(expr)?;
                self.cvt_to_float(v)
            }
        }
    }

    fn lower_float_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<FVal> {
        let opcode = match op {
            BinOp::Add => Opcode::Fadd,
            BinOp::Sub => Opcode::Fsub,
            BinOp::Mul => Opcode::Fmul,
            BinOp::Div => Opcode::Fdiv,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "operator {op:?} is not defined for float operands"
                )));
            }
        };
        let mnemonic = opcode_mnemonic(opcode);
        let l = self.lower_float_expr(lhs)?;
        let dst = self.fwritable(l)?;
        let stashed = if rhs.contains_call() {
            let slot = self.floats.reserve_slot();
            self.emit(Inst::new(
                Opcode::Fstore,
                [dst, OPERAND_IMM, 0],
                slot as i32,
                format!("stash f{dst} to float slot {slot}"),
            ));
            self.floats.release_temp(dst);
            Some(slot)
        } else {
            None
        };
        let r = self.lower_float_expr(rhs)?;
        let dst = if let Some(slot) = stashed {
            let reg = self.floats.alloc_temp()?;
            self.emit(Inst::new(
                Opcode::Fload,
                [reg, OPERAND_IMM, 0],
                slot as i32,
                format!("unstash f{reg} from float slot {slot}"),
            ));
            reg
        } else {
            dst
        };
        self.emit(Inst::new(
            opcode,
            [dst, r.reg, 0],
            0,
            format!("{mnemonic} f{dst}, f{}", r.reg),
        ));
        self.release_f(r);
        Ok(FVal { reg: dst, temp: true })
    }

    fn lower_math_call(&mut self, func: MathFunc, args: &[Expr]) -> Result<FVal> {
        let arg = args.first().ok_or_else(|| {
            Error::InvalidArgument(format!("math function {func:?} needs an argument"))
        })?;
        if func == MathFunc::Pow {
            let Some(Expr::Literal(Literal::Int(exp))) = args.get(1) else {
                return Err(Error::InvalidArgument(
                    "pow requires an integer literal exponent".to_string(),
                ));
            };
            let exp = u32::try_from(*exp).map_err(|_| {
                Error::InvalidArgument("pow exponent must be non-negative".to_string())
            })?;
            if exp > 64 {
                return Err(Error::InvalidArgument(
                    "pow exponent larger than 64 is not supported".to_string(),
                ));
            }
            let base = self.lower_float_expr(arg)?;
            let dst = self.load_float_const(1.0)?;
            for _ in 0..exp {
                self.emit(Inst::new(
                    Opcode::Fmul,
                    [dst.reg, base.reg, 0],
                    0,
                    format!("fmul f{}, f{}", dst.reg, base.reg),
                ));
            }
            self.release_f(base);
            return Ok(dst);
        }

        let (opcode, mnemonic) = match func {
            MathFunc::Sqrt => (Opcode::Fsqrt, "fsqrt"),
            MathFunc::Abs => (Opcode::Fabs, "fabs"),
            MathFunc::Floor => (Opcode::Ffloor, "ffloor"),
            MathFunc::Ceil => (Opcode::Fceil, "fceil"),
            MathFunc::Pow => unreachable!(),
        };
        let v = self.lower_float_expr(arg)?;
        let (dst, src) = if v.temp {
            (v.reg, v.reg)
        } else {
            let dst = self.floats.alloc_temp()?;
            (dst, v.reg)
        };
        self.emit(Inst::new(
            opcode,
            [dst, src, 0],
            0,
            format!("{mnemonic} f{dst}, f{src}"),
        ));
        Ok(FVal { reg: dst, temp: true })
    }
}

fn opcode_mnemonic(op: Opcode) -> &'static str {
    match op {
        Opcode::Add => "add",
        Opcode::Sub => "sub",
        Opcode::Mul => "mul",
        Opcode::Div => "div",
        Opcode::Rem => "rem",
        Opcode::And => "and",
        Opcode::Or => "or",
        Opcode::Xor => "xor",
        Opcode::Shl => "shl",
        Opcode::Shr => "shr",
        Opcode::Fadd => "fadd",
        Opcode::Fsub => "fsub",
        Opcode::Fmul => "fmul",
        Opcode::Fdiv => "fdiv",
        _ => "op",
    }
}
