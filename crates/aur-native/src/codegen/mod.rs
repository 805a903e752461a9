//! Lowering from the typed IR to the manifest instruction set.
//!
//! The generator walks the tree top-down with one owning context: the
//! emitted instruction list, symbol tables, both register allocators, the
//! array base-slot map and the loop stack all live here and are threaded
//! by exclusive reference.
//!
//! Register discipline: named integer variables are flushed to their spill
//! slots at every control-flow join (branch arms, loop back edges) so the
//! runtime register file agrees with the emission-time allocator state on
//! every path. Floats keep their bindings across joins; loops pre-spill
//! them instead so hot bodies carry no spill stores.

mod expr;
pub mod regalloc;

use std::collections::{BTreeMap, HashMap};

use crate::abi::{self, Target};
use crate::error::{Error, Result};
use crate::ir::{AtomicKind, Expr, Function, Literal, Program, Service, Stmt, Type};
use crate::manifest::{Inst, ManifestUnit, OPERAND_IMM, OPERAND_LABEL, Opcode, SharedVar, StringLit, cond};

pub use regalloc::{FloatAllocator, IntAllocator};

#[derive(Debug, Clone)]
pub(crate) struct FuncSig {
    pub params: Vec<Type>,
    pub ret: Type,
}

#[derive(Debug, Clone)]
pub(crate) struct ArrayInfo {
    pub base: usize,
    pub len: usize,
}

pub struct Codegen {
    pub(crate) target: Target,
    pub(crate) out: Vec<Inst>,
    pub(crate) labels: BTreeMap<String, usize>,
    pub(crate) strings: Vec<StringLit>,
    string_ids: HashMap<String, usize>,
    pub(crate) shared: Vec<SharedVar>,
    pub(crate) ints: IntAllocator,
    pub(crate) floats: FloatAllocator,
    pub(crate) arrays: HashMap<String, ArrayInfo>,
    pub(crate) functions: HashMap<String, FuncSig>,
    pub(crate) var_types: HashMap<String, Type>,
    loop_stack: Vec<LoopLabels>,
    next_label: usize,
    frame_max: u32,
    in_main: bool,
}

#[derive(Debug, Clone)]
struct LoopLabels {
    exit: String,
    cont: String,
}

/// Compile a program into a manifest unit for the given target.
pub fn compile(program: &Program, target: Target) -> Result<ManifestUnit> {
    let mut cg = Codegen::new(target);
    match program {
        Program::Flat { body } => {
            let main = Function {
                name: "main".to_string(),
                params: Vec::new(),
                ret: Type::Int,
                body: body.clone(),
            };
            cg.functions.insert(
                "main".to_string(),
                FuncSig {
                    params: Vec::new(),
                    ret: Type::Int,
                },
            );
            cg.emit(Inst::new(
                Opcode::Jmp,
                [OPERAND_LABEL, 0, 0],
                0,
                "jmp fn_main",
            ));
            cg.lower_function(&main)?;
        }
        Program::Module { functions, shared } => {
            for (i, decl) in shared.iter().enumerate() {
                cg.shared.push(SharedVar {
                    id: i as u32,
                    name: decl.name.clone(),
                    init: decl.init,
                });
            }
            for f in functions {
                cg.functions.insert(
                    f.name.clone(),
                    FuncSig {
                        params: f.params.iter().map(|p| p.ty.clone()).collect(),
                        ret: f.ret.clone(),
                    },
                );
            }
            if !cg.functions.contains_key("main") {
                return Err(Error::UndefinedFunction("main".to_string()));
            }
            cg.emit(Inst::new(
                Opcode::Jmp,
                [OPERAND_LABEL, 0, 0],
                0,
                "jmp fn_main",
            ));
            for f in functions {
                cg.lower_function(f)?;
            }
        }
    }
    Ok(cg.finish())
}

impl Codegen {
    fn new(target: Target) -> Self {
        Self {
            target,
            out: Vec::new(),
            labels: BTreeMap::new(),
            strings: Vec::new(),
            string_ids: HashMap::new(),
            shared: Vec::new(),
            ints: IntAllocator::new(),
            floats: FloatAllocator::new(),
            arrays: HashMap::new(),
            functions: HashMap::new(),
            var_types: HashMap::new(),
            loop_stack: Vec::new(),
            next_label: 0,
            frame_max: 0,
            in_main: false,
        }
    }

    fn finish(self) -> ManifestUnit {
        ManifestUnit {
            instructions: self.out,
            labels: self.labels,
            strings: self.strings,
            shared: self.shared,
            stack_size: abi::align_frame(self.frame_max.max(abi::MIN_FRAME)),
        }
    }

    pub(crate) fn emit(&mut self, inst: Inst) {
        self.out.push(inst);
    }

    pub(crate) fn new_label(&mut self) -> String {
        let id = self.next_label;
        self.next_label += 1;
        format!("L{id}")
    }

    pub(crate) fn define_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.out.len());
    }

    fn last_is_terminator(&self) -> bool {
        self.out.last().is_some_and(Inst::is_terminating)
    }

    /// Intern a string literal, returning its data label.
    pub(crate) fn intern_string(&mut self, text: &str) -> String {
        if let Some(&id) = self.string_ids.get(text) {
            return self.strings[id].label.clone();
        }
        let label = format!("str_{}", self.strings.len());
        self.string_ids.insert(text.to_string(), self.strings.len());
        self.strings.push(StringLit {
            label: label.clone(),
            text: text.to_string(),
        });
        label
    }

    pub(crate) fn shared_label(&self, name: &str) -> Result<String> {
        self.shared
            .iter()
            .find(|sv| sv.name == name)
            .map(SharedVar::label)
            .ok_or_else(|| Error::UndefinedVariable(format!("shared variable {name}")))
    }

    /// Spill all live integer variables so every control-flow path sees
    /// the same (empty) register binding state. Emits only stores, which
    /// leave the flags untouched.
    pub(crate) fn sync_ints(&mut self) {
        self.ints.flush(&mut self.out);
    }

    /// Flush everything live before an instruction that clobbers the whole
    /// volatile register file (CALL, SVC, SPAWN, JOIN).
    pub(crate) fn flush_all(&mut self) {
        self.ints.flush(&mut self.out);
        self.floats.flush(&mut self.out);
    }

    fn lower_function(&mut self, func: &Function) -> Result<()> {
        tracing::debug!(function = %func.name, target = ?self.target, "lowering function");
        self.ints = IntAllocator::new();
        self.floats = FloatAllocator::new();
        self.arrays.clear();
        self.var_types.clear();
        self.loop_stack.clear();
        self.in_main = func.name == "main";

        self.define_label(&format!("fn_{}", func.name));

        if func.params.len() > 6 {
            return Err(Error::InvalidArgument(format!(
                "function {} has {} parameters; at most 6 are supported",
                func.name,
                func.params.len()
            )));
        }
        for (i, p) in func.params.iter().enumerate() {
            let vreg = (i + 1) as u8;
            self.var_types.insert(p.name.clone(), p.ty.clone());
            if p.ty.is_float() {
                if vreg >= abi::NUM_FVAR_REGS {
                    return Err(Error::InvalidArgument(format!(
                        "float parameter {} does not fit the SSE variable pool",
                        p.name
                    )));
                }
                self.floats.bind_param(&p.name, vreg);
            } else if vreg <= abi::LAST_VAR_VREG {
                self.ints.bind_param(&p.name, vreg);
            } else {
                // Sixth argument arrives in the scratch register; park it
                // in a slot before anything else can clobber it.
                let slot = self.ints.reserve_slot();
                self.emit(Inst::new(
                    Opcode::StoreStack,
                    [vreg, OPERAND_IMM, 0],
                    slot as i32,
                    format!("store param {} to slot {slot}", p.name),
                ));
                self.ints.define_spilled(&p.name, slot);
            }
        }

        for stmt in &func.body {
            self.lower_stmt(stmt)?;
        }

        if !self.last_is_terminator() {
            self.emit(Inst::new(
                Opcode::Mov,
                [abi::VREG_RET, OPERAND_IMM, 0],
                0,
                "mov r0, #0",
            ));
            self.emit_return();
        }

        let mut needed = abi::int_slot_offset(self.ints.frame_slots()) as u32;
        if self.floats.frame_slots() > 0 {
            needed = needed.max(abi::float_slot_offset(self.floats.frame_slots()) as u32);
        }
        self.frame_max = self.frame_max.max(needed);
        Ok(())
    }

    fn emit_return(&mut self) {
        if self.in_main {
            self.emit(Inst::new(Opcode::Halt, [0; 3], 0, "halt"));
        } else {
            self.emit(Inst::new(Opcode::Ret, [0; 3], 0, "ret"));
        }
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Let { name, ty, value } => self.lower_let(name, ty, value),
            Stmt::Assign { name, value } => self.lower_assign(name, value),
            Stmt::ArrayAssign { name, index, value } => self.lower_array_assign(name, index, value),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => self.lower_if(cond, then_body, else_body.as_deref()),
            Stmt::While { cond, body } => self.lower_while(cond, body),
            Stmt::For {
                var,
                start,
                end,
                step,
                body,
            } => self.lower_for(var, start, end, step, body),
            Stmt::Break => self.lower_break(),
            Stmt::Continue => self.lower_continue(),
            Stmt::Request { service, args } => self.lower_request(*service, args),
            Stmt::Return(value) => self.lower_return(value.as_ref()),
            Stmt::CallStmt { name, args } => {
                let val = self.lower_call(name, args)?;
                self.release(val);
                Ok(())
            }
            Stmt::Join { handle } => self.lower_join(handle),
            Stmt::AtomicOp {
                op,
                target,
                value,
                expected: _,
                new: _,
            } => self.lower_atomic_op(*op, target, value.as_ref()),
        }
    }

    fn lower_let(&mut self, name: &str, ty: &Type, value: &Expr) -> Result<()> {
        if let Type::Array(elem) = ty {
            return self.lower_array_let(name, elem, value);
        }
        self.var_types.insert(name.to_string(), ty.clone());
        if ty.is_float() {
            let src = self.lower_float_expr(value)?;
            let dst = self.floats.allocate_variable(name, &mut self.out)?;
            if src.reg != dst {
                self.emit(Inst::new(
                    Opcode::Fmov,
                    [dst, src.reg, 0],
                    0,
                    format!("fmov f{dst}, f{}", src.reg),
                ));
            }
            self.floats.mark_initialized(name);
            self.release_f(src);
        } else {
            let src = self.lower_int_expr(value)?;
            let dst = self.ints.allocate_variable(name, &mut self.out)?;
            if src.reg != dst {
                self.emit(Inst::new(
                    Opcode::Mov,
                    [dst, src.reg, 0],
                    0,
                    format!("mov r{dst}, r{}", src.reg),
                ));
            }
            self.ints.mark_initialized(name);
            self.release(src);
        }
        Ok(())
    }

    fn lower_array_let(&mut self, name: &str, elem: &Type, value: &Expr) -> Result<()> {
        if elem.is_float() {
            return Err(Error::InvalidArgument(format!(
                "array<float> is not supported: {name}"
            )));
        }
        let Expr::ArrayLiteral { elements, .. } = value else {
            return Err(Error::InvalidArgument(format!(
                "array {name} must be initialized with an array literal"
            )));
        };
        let base = self.ints.reserve_slots(elements.len());
        self.emit(Inst::new(
            Opcode::ArrayAlloc,
            [OPERAND_IMM, 0, 0],
            elements.len() as i32,
            format!("array_alloc {name} base {base} len {}", elements.len()),
        ));
        self.arrays.insert(
            name.to_string(),
            ArrayInfo {
                base,
                len: elements.len(),
            },
        );
        self.var_types
            .insert(name.to_string(), Type::Array(Box::new(elem.clone())));
        for (i, element) in elements.iter().enumerate() {
            let val = self.lower_int_expr(element)?;
            self.emit(Inst::new(
                Opcode::StoreStack,
                [val.reg, OPERAND_IMM, 0],
                (base + i) as i32,
                format!("store {name}[{i}]"),
            ));
            self.release(val);
        }
        Ok(())
    }

    fn lower_assign(&mut self, name: &str, value: &Expr) -> Result<()> {
        let is_float = self
            .var_types
            .get(name)
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))?
            .is_float();
        if is_float {
            let src = self.lower_float_expr(value)?;
            let dst = self.floats.allocate_variable(name, &mut self.out)?;
            if src.reg != dst {
                self.emit(Inst::new(
                    Opcode::Fmov,
                    [dst, src.reg, 0],
                    0,
                    format!("fmov f{dst}, f{}", src.reg),
                ));
            }
            self.floats.mark_initialized(name);
            self.release_f(src);
        } else {
            let src = self.lower_int_expr(value)?;
            let dst = self.ints.allocate_variable(name, &mut self.out)?;
            if src.reg != dst {
                self.emit(Inst::new(
                    Opcode::Mov,
                    [dst, src.reg, 0],
                    0,
                    format!("mov r{dst}, r{}", src.reg),
                ));
            }
            self.ints.mark_initialized(name);
            self.release(src);
        }
        Ok(())
    }

    fn lower_array_assign(&mut self, name: &str, index: &Expr, value: &Expr) -> Result<()> {
        let info = self
            .arrays
            .get(name)
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))?
            .clone();
        if let Expr::Literal(Literal::Int(i)) = index {
            let i = usize::try_from(*i).map_err(|_| {
                Error::InvalidArgument(format!("negative index into array {name}"))
            })?;
            if i >= info.len {
                return Err(Error::InvalidArgument(format!(
                    "static index {i} out of bounds for array {name} (len {})",
                    info.len
                )));
            }
            let val = self.lower_int_expr(value)?;
            self.emit(Inst::new(
                Opcode::StoreStack,
                [val.reg, OPERAND_IMM, 0],
                (info.base + i) as i32,
                format!("store {name}[{i}]"),
            ));
            self.release(val);
        } else {
            let idx = self.lower_int_expr(index)?;
            let val = self.lower_int_expr(value)?;
            self.emit(Inst::new(
                Opcode::ArrayStore,
                [val.reg, idx.reg, OPERAND_IMM],
                info.base as i32,
                format!("array_store {name}[r{}], r{}", idx.reg, val.reg),
            ));
            self.release(val);
            self.release(idx);
        }
        Ok(())
    }

    fn lower_if(&mut self, cond: &Expr, then_body: &[Stmt], else_body: Option<&[Stmt]>) -> Result<()> {
        let false_label = self.new_label();
        let end_label = if else_body.is_some() {
            self.new_label()
        } else {
            false_label.clone()
        };

        self.lower_branch_cond(cond, &false_label)?;

        for stmt in then_body {
            self.lower_stmt(stmt)?;
        }
        if let Some(else_body) = else_body {
            if !self.last_is_terminator() {
                self.sync_ints();
                self.emit(Inst::new(
                    Opcode::Jmp,
                    [OPERAND_LABEL, 0, 0],
                    0,
                    format!("jmp {end_label}"),
                ));
            }
            self.define_label(&false_label);
            for stmt in else_body {
                self.lower_stmt(stmt)?;
            }
            if !self.last_is_terminator() {
                self.sync_ints();
            }
            self.define_label(&end_label);
        } else {
            if !self.last_is_terminator() {
                self.sync_ints();
            }
            self.define_label(&false_label);
        }
        Ok(())
    }

    /// Emit the comparison for an `if`, jumping to `false_label` with the
    /// negated condition so fall-through enters the then-branch.
    fn lower_branch_cond(&mut self, cond: &Expr, false_label: &str) -> Result<()> {
        if let Expr::Binary { op, lhs, rhs, .. } = cond {
            if op.is_comparison() {
                let cc = expr::cond_code(*op);
                self.lower_compare(lhs, rhs)?;
                self.sync_ints();
                let neg = expr::negate_cond(cc);
                self.emit(Inst::new(
                    Opcode::Cjmp,
                    [neg, OPERAND_LABEL, 0],
                    0,
                    format!("cjmp {}, {false_label}", expr::cond_name(neg)),
                ));
                return Ok(());
            }
        }
        let val = self.lower_int_expr(cond)?;
        self.emit(Inst::new(
            Opcode::Cmp,
            [val.reg, OPERAND_IMM, 0],
            0,
            format!("cmp r{}, #0", val.reg),
        ));
        self.release(val);
        self.sync_ints();
        self.emit(Inst::new(
            Opcode::Cjmp,
            [cond::EQ, OPERAND_LABEL, 0],
            0,
            format!("cjmp eq, {false_label}"),
        ));
        Ok(())
    }

    /// Emit the bottom-of-loop check, jumping back to `body_label` with the
    /// non-negated condition.
    fn lower_loop_cond(&mut self, cond: &Expr, body_label: &str) -> Result<()> {
        if let Expr::Binary { op, lhs, rhs, .. } = cond {
            if op.is_comparison() {
                let cc = expr::cond_code(*op);
                self.lower_compare(lhs, rhs)?;
                self.sync_ints();
                self.emit(Inst::new(
                    Opcode::Cjmp,
                    [cc, OPERAND_LABEL, 0],
                    0,
                    format!("cjmp {}, {body_label}", expr::cond_name(cc)),
                ));
                return Ok(());
            }
        }
        let val = self.lower_int_expr(cond)?;
        self.emit(Inst::new(
            Opcode::Cmp,
            [val.reg, OPERAND_IMM, 0],
            0,
            format!("cmp r{}, #0", val.reg),
        ));
        self.release(val);
        self.sync_ints();
        self.emit(Inst::new(
            Opcode::Cjmp,
            [cond::NE, OPERAND_LABEL, 0],
            0,
            format!("cjmp ne, {body_label}"),
        ));
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<()> {
        let body_label = self.new_label();
        let cond_label = self.new_label();
        let exit_label = self.new_label();

        // Hoist: every live float gets a valid stack copy before the loop
        // so the body itself carries no spill stores.
        self.floats.spill_all(&mut self.out);
        self.sync_ints();

        self.emit(Inst::new(
            Opcode::Jmp,
            [OPERAND_LABEL, 0, 0],
            0,
            format!("jmp {cond_label}"),
        ));
        self.define_label(&body_label);
        self.loop_stack.push(LoopLabels {
            exit: exit_label.clone(),
            cont: cond_label.clone(),
        });
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        self.loop_stack.pop();
        if !self.last_is_terminator() {
            self.sync_ints();
        }
        self.define_label(&cond_label);
        self.lower_loop_cond(cond, &body_label)?;
        self.define_label(&exit_label);
        self.ints.forget();
        Ok(())
    }

    fn lower_for(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: &Expr,
        body: &[Stmt],
    ) -> Result<()> {
        self.lower_let(var, &Type::Int, start)?;

        let body_label = self.new_label();
        let step_label = self.new_label();
        let cond_label = self.new_label();
        let exit_label = self.new_label();

        self.floats.spill_all(&mut self.out);
        self.sync_ints();
        self.emit(Inst::new(
            Opcode::Jmp,
            [OPERAND_LABEL, 0, 0],
            0,
            format!("jmp {cond_label}"),
        ));
        self.define_label(&body_label);
        self.loop_stack.push(LoopLabels {
            exit: exit_label.clone(),
            cont: step_label.clone(),
        });
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        self.loop_stack.pop();
        if !self.last_is_terminator() {
            self.sync_ints();
        }

        self.define_label(&step_label);
        let step_expr = Expr::Binary {
            op: crate::ir::BinOp::Add,
            lhs: Box::new(Expr::Variable {
                name: var.to_string(),
                ty: Type::Int,
            }),
            rhs: Box::new(step.clone()),
            ty: Type::Int,
        };
        self.lower_assign(var, &step_expr)?;
        self.sync_ints();

        self.define_label(&cond_label);
        // Positive steps count up to `end`, negative steps count down.
        let downward = matches!(step, Expr::Literal(Literal::Int(s)) if *s < 0);
        let op = if downward {
            crate::ir::BinOp::Gt
        } else {
            crate::ir::BinOp::Lt
        };
        let cond = Expr::Binary {
            op,
            lhs: Box::new(Expr::Variable {
                name: var.to_string(),
                ty: Type::Int,
            }),
            rhs: Box::new(end.clone()),
            ty: Type::Bool,
        };
        self.lower_loop_cond(&cond, &body_label)?;
        self.define_label(&exit_label);
        self.ints.forget();
        Ok(())
    }

    fn lower_break(&mut self) -> Result<()> {
        let target = self
            .loop_stack
            .last()
            .map(|l| l.exit.clone())
            .ok_or_else(|| Error::InvalidArgument("break outside of a loop".to_string()))?;
        self.sync_ints();
        self.emit(Inst::new(
            Opcode::Jmp,
            [OPERAND_LABEL, 0, 0],
            0,
            format!("jmp {target}"),
        ));
        Ok(())
    }

    fn lower_continue(&mut self) -> Result<()> {
        let target = self
            .loop_stack
            .last()
            .map(|l| l.cont.clone())
            .ok_or_else(|| Error::InvalidArgument("continue outside of a loop".to_string()))?;
        self.sync_ints();
        self.emit(Inst::new(
            Opcode::Jmp,
            [OPERAND_LABEL, 0, 0],
            0,
            format!("jmp {target}"),
        ));
        Ok(())
    }

    fn lower_request(&mut self, service: Service, args: &[Expr]) -> Result<()> {
        match service {
            Service::Print | Service::Exit | Service::PrintInt => {
                let arg = args.first().ok_or_else(|| {
                    Error::InvalidArgument(format!("service {} needs an argument", service.name()))
                })?;
                let val = self.lower_int_expr(arg)?;
                self.flush_all();
                if val.reg != 1 {
                    self.emit(Inst::new(
                        Opcode::Mov,
                        [1, val.reg, 0],
                        0,
                        format!("mov r1, r{}", val.reg),
                    ));
                }
                self.release(val);
            }
            Service::PrintFloat => {
                let arg = args.first().ok_or_else(|| {
                    Error::InvalidArgument("service print_float needs an argument".to_string())
                })?;
                let val = self.lower_float_expr(arg)?;
                self.flush_all();
                if val.reg != 0 {
                    self.emit(Inst::new(
                        Opcode::Fmov,
                        [0, val.reg, 0],
                        0,
                        format!("fmov f0, f{}", val.reg),
                    ));
                }
                self.release_f(val);
            }
            Service::Pause | Service::PauseSilent => {
                if let Some(arg) = args.first() {
                    let val = self.lower_int_expr(arg)?;
                    self.flush_all();
                    if val.reg != abi::VREG_RET {
                        self.emit(Inst::new(
                            Opcode::Mov,
                            [abi::VREG_RET, val.reg, 0],
                            0,
                            format!("mov r0, r{}", val.reg),
                        ));
                    }
                    self.release(val);
                } else {
                    self.flush_all();
                }
            }
            Service::InputInt => {
                self.flush_all();
            }
        }
        self.emit(Inst::new(
            Opcode::Svc,
            [OPERAND_IMM, 0, 0],
            i32::from(service as u8),
            format!("svc {}", service.name()),
        ));
        Ok(())
    }

    fn lower_return(&mut self, value: Option<&Expr>) -> Result<()> {
        if let Some(value) = value {
            if value.is_float() && !self.in_main {
                let val = self.lower_float_expr(value)?;
                if val.reg != 0 {
                    self.emit(Inst::new(
                        Opcode::Fmov,
                        [0, val.reg, 0],
                        0,
                        format!("fmov f0, f{}", val.reg),
                    ));
                }
                self.release_f(val);
            } else {
                let val = self.lower_int_expr(value)?;
                if val.reg != abi::VREG_RET {
                    self.emit(Inst::new(
                        Opcode::Mov,
                        [abi::VREG_RET, val.reg, 0],
                        0,
                        format!("mov r0, r{}", val.reg),
                    ));
                }
                self.release(val);
            }
        }
        self.emit_return();
        Ok(())
    }

    fn lower_join(&mut self, handle: &Expr) -> Result<()> {
        let val = self.lower_int_expr(handle)?;
        self.flush_all();
        self.emit(Inst::new(
            Opcode::Join,
            [val.reg, 0, 0],
            0,
            format!("join r{}", val.reg),
        ));
        self.release(val);
        Ok(())
    }

    fn lower_atomic_op(
        &mut self,
        op: AtomicKind,
        target: &str,
        value: Option<&Expr>,
    ) -> Result<()> {
        let label = self.shared_label(target)?;
        match op {
            AtomicKind::Add | AtomicKind::Store => {
                let value = value.ok_or_else(|| {
                    Error::InvalidArgument(format!("atomic op on {target} needs a value"))
                })?;
                let val = self.lower_int_expr(value)?;
                // LOCK XADD / XCHG write the old value back into the source
                // register, so operate on a copy.
                let tmp = self.alloc_temp_stashing(&[val.reg])?;
                self.emit(Inst::new(
                    Opcode::Mov,
                    [tmp, val.reg, 0],
                    0,
                    format!("mov r{tmp}, r{}", val.reg),
                ));
                self.release(val);
                let opcode = if op == AtomicKind::Add {
                    Opcode::AtomicAdd
                } else {
                    Opcode::AtomicStore
                };
                let name = if op == AtomicKind::Add {
                    "atomic_add"
                } else {
                    "atomic_store"
                };
                self.emit(Inst::new(
                    opcode,
                    [tmp, OPERAND_LABEL, 0],
                    0,
                    format!("{name} r{tmp}, {label}"),
                ));
                self.ints.release_temp(tmp);
            }
            AtomicKind::FAdd => {
                let value = value.ok_or_else(|| {
                    Error::InvalidArgument(format!("atomic op on {target} needs a value"))
                })?;
                let val = self.lower_float_expr(value)?;
                self.emit(Inst::new(
                    Opcode::AtomicFadd,
                    [val.reg, OPERAND_LABEL, 0],
                    0,
                    format!("atomic_fadd f{}, {label}", val.reg),
                ));
                self.release_f(val);
            }
            AtomicKind::Load => {
                // Statement-position atomic load: effect-free, drop it.
            }
            AtomicKind::Cas => {
                // TODO: define the atomic.cas lowering contract (the
                // frontend accepts it but no backend semantics exist yet).
                return Err(Error::UnsupportedOpcode("atomic.cas".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::*;

    #[test]
    fn module_starts_with_a_jump_to_main() {
        let program = flat_program(vec![ret(Some(int_lit(0)))]);
        let unit = compile(&program, Target::Linux).unwrap();
        assert_eq!(unit.instructions[0].op, Opcode::Jmp);
        assert_eq!(unit.instructions[0].label_target(), Some("fn_main"));
        assert_eq!(unit.labels["fn_main"], 1);
    }

    #[test]
    fn falling_off_main_returns_zero() {
        let program = flat_program(vec![let_int("x", int_lit(3))]);
        let unit = compile(&program, Target::Linux).unwrap();
        let n = unit.instructions.len();
        assert_eq!(unit.instructions[n - 1].op, Opcode::Halt);
        assert_eq!(unit.instructions[n - 2].op, Opcode::Mov);
        assert_eq!(unit.instructions[n - 2].ops[0], abi::VREG_RET);
        assert_eq!(unit.instructions[n - 2].imm, 0);
    }

    #[test]
    fn non_main_functions_end_in_ret() {
        let program = module_program(
            vec![
                func("helper", vec![], Type::Int, vec![]),
                func("main", vec![], Type::Int, vec![ret(Some(int_lit(0)))]),
            ],
            vec![],
        );
        let unit = compile(&program, Target::Linux).unwrap();
        let helper_start = unit.labels["fn_helper"];
        let main_start = unit.labels["fn_main"];
        assert!(helper_start < main_start);
        assert_eq!(unit.instructions[main_start - 1].op, Opcode::Ret);
    }

    #[test]
    fn string_literals_are_interned_once() {
        let program = flat_program(vec![
            let_typed("a", Type::Str, str_lit("dup")),
            let_typed("b", Type::Str, str_lit("dup")),
            ret(Some(int_lit(0))),
        ]);
        let unit = compile(&program, Target::Linux).unwrap();
        assert_eq!(unit.strings.len(), 1);
        assert_eq!(unit.strings[0].label, "str_0");
    }

    #[test]
    fn shared_declarations_keep_their_order_and_ids() {
        let program = module_program(
            vec![func("main", vec![], Type::Int, vec![ret(Some(int_lit(0)))])],
            vec![shared_decl("x", 1), shared_decl("y", 2)],
        );
        let unit = compile(&program, Target::Linux).unwrap();
        assert_eq!(unit.shared[0].id, 0);
        assert_eq!(unit.shared[0].name, "x");
        assert_eq!(unit.shared[1].id, 1);
        assert_eq!(unit.shared[1].init, 2);
    }

    #[test]
    fn immediate_right_operands_fold_into_the_instruction() {
        let program = flat_program(vec![
            let_int("x", int_lit(4)),
            let_int("y", add(var_int("x"), int_lit(9))),
            ret(Some(var_int("y"))),
        ]);
        let unit = compile(&program, Target::Linux).unwrap();
        assert_has_pattern(
            &unit.instructions,
            &[InstPattern::opcode(Opcode::Add)
                .with_op1(OPERAND_IMM)
                .with_imm(9)],
        );
    }

    #[test]
    fn division_never_takes_an_immediate() {
        let program = flat_program(vec![
            let_int("x", int_lit(42)),
            let_int(
                "y",
                binary(crate::ir::BinOp::Div, var_int("x"), int_lit(7), Type::Int),
            ),
            ret(Some(var_int("y"))),
        ]);
        let unit = compile(&program, Target::Linux).unwrap();
        let div = &unit.instructions[find_opcode(&unit.instructions, Opcode::Div).unwrap()];
        assert_ne!(div.ops[1], OPERAND_IMM, "divisor must be materialized");
    }

    #[test]
    fn request_arguments_reach_r1() {
        let program = flat_program(vec![
            request(Service::PrintInt, vec![int_lit(7)]),
            ret(Some(int_lit(0))),
        ]);
        let unit = compile(&program, Target::Linux).unwrap();
        let svc = find_opcode(&unit.instructions, Opcode::Svc).unwrap();
        assert_eq!(unit.instructions[svc].imm, Service::PrintInt as i32);
        let mov = &unit.instructions[svc - 1];
        assert_eq!(mov.op, Opcode::Mov);
        assert_eq!(mov.ops[0], 1);
    }
}
