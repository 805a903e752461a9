//! Test harness for backend unit and integration tests.
//!
//! Provides terse IR builders, compile helpers for both targets, and
//! pattern assertions over the emitted instruction stream.
//!
//! # Example
//!
//! ```rust
//! use aur_native::test_harness::*;
//! use aur_native::Opcode;
//!
//! let program = flat_program(vec![
//!     let_int("x", int_lit(2)),
//!     ret(Some(add(var_int("x"), int_lit(3)))),
//! ]);
//! let unit = compile_linux(&program).expect("compile");
//! assert!(count_opcode(&unit.instructions, Opcode::Add) >= 1);
//! ```

#![allow(clippy::must_use_candidate, clippy::missing_panics_doc)]

use crate::abi::Target;
use crate::ir::{
    AtomicKind, BinOp, Expr, Function, Literal, MathFunc, Param, Program, Service, SharedDecl,
    Stmt, Type,
};
use crate::manifest::{Inst, ManifestUnit, Opcode};
use crate::{Result, compile};

// ── IR builders ──

pub fn int_lit(v: i64) -> Expr {
    Expr::Literal(Literal::Int(v))
}

pub fn float_lit(v: f64) -> Expr {
    Expr::Literal(Literal::Float(v))
}

pub fn bool_lit(v: bool) -> Expr {
    Expr::Literal(Literal::Bool(v))
}

pub fn str_lit(s: &str) -> Expr {
    Expr::Literal(Literal::Str(s.to_string()))
}

pub fn var_int(name: &str) -> Expr {
    Expr::Variable {
        name: name.to_string(),
        ty: Type::Int,
    }
}

pub fn var_float(name: &str) -> Expr {
    Expr::Variable {
        name: name.to_string(),
        ty: Type::Float,
    }
}

pub fn binary(op: BinOp, lhs: Expr, rhs: Expr, ty: Type) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        ty,
    }
}

pub fn add(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinOp::Add, lhs, rhs, Type::Int)
}

pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinOp::Sub, lhs, rhs, Type::Int)
}

pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinOp::Mul, lhs, rhs, Type::Int)
}

pub fn cmp(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    binary(op, lhs, rhs, Type::Bool)
}

pub fn call(name: &str, args: Vec<Expr>, ty: Type) -> Expr {
    Expr::Call {
        name: name.to_string(),
        args,
        ty,
    }
}

pub fn math(func: MathFunc, args: Vec<Expr>) -> Expr {
    Expr::MathCall { func, args }
}

pub fn let_int(name: &str, value: Expr) -> Stmt {
    Stmt::Let {
        name: name.to_string(),
        ty: Type::Int,
        value,
    }
}

pub fn let_float(name: &str, value: Expr) -> Stmt {
    Stmt::Let {
        name: name.to_string(),
        ty: Type::Float,
        value,
    }
}

pub fn let_typed(name: &str, ty: Type, value: Expr) -> Stmt {
    Stmt::Let {
        name: name.to_string(),
        ty,
        value,
    }
}

pub fn assign(name: &str, value: Expr) -> Stmt {
    Stmt::Assign {
        name: name.to_string(),
        value,
    }
}

pub fn if_stmt(cond: Expr, then_body: Vec<Stmt>, else_body: Option<Vec<Stmt>>) -> Stmt {
    Stmt::If {
        cond,
        then_body,
        else_body,
    }
}

pub fn while_stmt(cond: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::While { cond, body }
}

pub fn request(service: Service, args: Vec<Expr>) -> Stmt {
    Stmt::Request { service, args }
}

pub fn ret(value: Option<Expr>) -> Stmt {
    Stmt::Return(value)
}

pub fn atomic_add(target: &str, value: Expr) -> Stmt {
    Stmt::AtomicOp {
        op: AtomicKind::Add,
        target: target.to_string(),
        value: Some(value),
        expected: None,
        new: None,
    }
}

pub fn param(name: &str, ty: Type) -> Param {
    Param {
        name: name.to_string(),
        ty,
    }
}

pub fn func(name: &str, params: Vec<Param>, ret_ty: Type, body: Vec<Stmt>) -> Function {
    Function {
        name: name.to_string(),
        params,
        ret: ret_ty,
        body,
    }
}

pub fn flat_program(body: Vec<Stmt>) -> Program {
    Program::Flat { body }
}

pub fn module_program(functions: Vec<Function>, shared: Vec<SharedDecl>) -> Program {
    Program::Module { functions, shared }
}

pub fn shared_decl(name: &str, init: u64) -> SharedDecl {
    SharedDecl {
        name: name.to_string(),
        init,
    }
}

// ── compile helpers ──

pub fn compile_linux(program: &Program) -> Result<ManifestUnit> {
    compile(program, Target::Linux)
}

pub fn compile_windows(program: &Program) -> Result<ManifestUnit> {
    compile(program, Target::Windows)
}

// ── pattern assertions ──

/// Pattern matching for instruction fields.
#[derive(Debug, Clone, Copy)]
pub enum Pat<T> {
    /// Match any value.
    Any,
    /// Match an exact value.
    Exact(T),
}

impl<T: PartialEq> Pat<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
        }
    }
}

/// Pattern over one instruction: opcode plus optional operand and
/// immediate constraints.
#[derive(Debug, Clone, Copy)]
pub struct InstPattern {
    pub op: Opcode,
    pub ops: [Pat<u8>; 3],
    pub imm: Pat<i32>,
}

impl InstPattern {
    pub fn opcode(op: Opcode) -> Self {
        Self {
            op,
            ops: [Pat::Any, Pat::Any, Pat::Any],
            imm: Pat::Any,
        }
    }

    pub fn with_op0(mut self, value: u8) -> Self {
        self.ops[0] = Pat::Exact(value);
        self
    }

    pub fn with_op1(mut self, value: u8) -> Self {
        self.ops[1] = Pat::Exact(value);
        self
    }

    pub fn with_imm(mut self, value: i32) -> Self {
        self.imm = Pat::Exact(value);
        self
    }

    pub fn matches(&self, inst: &Inst) -> bool {
        inst.op == self.op
            && self.ops.iter().zip(inst.ops).all(|(p, v)| p.matches(&v))
            && self.imm.matches(&inst.imm)
    }
}

/// Assert the instruction stream contains the patterns as a contiguous
/// run, panicking with a dump of the stream otherwise.
pub fn assert_has_pattern(instructions: &[Inst], patterns: &[InstPattern]) {
    if find_pattern(instructions, patterns).is_none() {
        let dump: Vec<String> = instructions
            .iter()
            .enumerate()
            .map(|(i, inst)| format!("{i:4}: {:?} {:?} imm={} ; {}", inst.op, inst.ops, inst.imm, inst.comment))
            .collect();
        panic!(
            "pattern {patterns:?} not found in instruction stream:\n{}",
            dump.join("\n")
        );
    }
}

/// Index of the first contiguous match, if any.
pub fn find_pattern(instructions: &[Inst], patterns: &[InstPattern]) -> Option<usize> {
    if patterns.is_empty() || instructions.len() < patterns.len() {
        return None;
    }
    (0..=instructions.len() - patterns.len()).find(|&start| {
        patterns
            .iter()
            .zip(&instructions[start..])
            .all(|(p, inst)| p.matches(inst))
    })
}

pub fn count_opcode(instructions: &[Inst], op: Opcode) -> usize {
    instructions.iter().filter(|i| i.op == op).count()
}

pub fn find_opcode(instructions: &[Inst], op: Opcode) -> Option<usize> {
    instructions.iter().position(|i| i.op == op)
}
