//! Register allocation for the two virtual register files.
//!
//! Named variables are mapped onto a small pool (`r1..r5` for integers,
//! `xmm0..xmm5` for floats) with LRU eviction to dense stack slots. Spill
//! and reload instructions are emitted as side effects into the caller's
//! instruction buffer; the allocator reports the slot high-water mark so
//! the frame size can be computed per function.

use std::collections::HashMap;

use crate::abi::{FIRST_FTEMP, FIRST_INT_SLOT, FIRST_VAR_VREG, LAST_FTEMP, LAST_VAR_VREG, NUM_FVAR_REGS, TEMP_VREGS};
use crate::error::{Error, Result};
use crate::manifest::{Inst, OPERAND_IMM, Opcode};

#[derive(Debug, Default, Clone)]
struct VarState {
    reg: Option<u8>,
    slot: Option<usize>,
    initialized: bool,
    /// Float-only: the spill slot holds the current value, so the variable
    /// can be evicted again without re-spilling.
    stack_valid: bool,
}

#[derive(Debug)]
pub struct IntAllocator {
    vars: HashMap<String, VarState>,
    owner: HashMap<u8, String>,
    /// Registers in recency order, least recently used first.
    lru: Vec<u8>,
    free_temps: Vec<u8>,
    next_slot: usize,
}

impl IntAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vars: HashMap::new(),
            owner: HashMap::new(),
            lru: Vec::new(),
            free_temps: vec![TEMP_VREGS[1], TEMP_VREGS[0]],
            next_slot: FIRST_INT_SLOT,
        }
    }

    fn touch(&mut self, reg: u8) {
        self.lru.retain(|&r| r != reg);
        self.lru.push(reg);
    }

    fn bind(&mut self, name: &str, reg: u8) {
        self.owner.insert(reg, name.to_string());
        self.vars.get_mut(name).expect("bound variable exists").reg = Some(reg);
        self.touch(reg);
    }

    fn unbind(&mut self, reg: u8) {
        if let Some(name) = self.owner.remove(&reg) {
            if let Some(var) = self.vars.get_mut(&name) {
                var.reg = None;
            }
        }
        self.lru.retain(|&r| r != reg);
    }

    /// Find a free variable register, evicting the LRU initialized
    /// variable (with a spill) when the pool is full.
    fn acquire(&mut self, out: &mut Vec<Inst>) -> Result<u8> {
        for reg in FIRST_VAR_VREG..=LAST_VAR_VREG {
            if !self.owner.contains_key(&reg) {
                return Ok(reg);
            }
        }
        let victim_reg = self
            .lru
            .iter()
            .copied()
            .find(|r| {
                self.owner
                    .get(r)
                    .and_then(|n| self.vars.get(n))
                    .is_some_and(|v| v.initialized)
            })
            .or_else(|| self.lru.first().copied())
            .ok_or_else(|| Error::RegisterExhaustion("no evictable integer register".into()))?;

        let name = self.owner[&victim_reg].clone();
        let initialized = self.vars[&name].initialized;
        if initialized {
            let slot = self.ensure_slot(&name);
            out.push(Inst::new(
                Opcode::StoreStack,
                [victim_reg, OPERAND_IMM, 0],
                slot as i32,
                format!("spill {name} to slot {slot}"),
            ));
        }
        self.unbind(victim_reg);
        Ok(victim_reg)
    }

    fn ensure_slot(&mut self, name: &str) -> usize {
        if let Some(slot) = self.vars[name].slot {
            return slot;
        }
        let slot = self.reserve_slot();
        self.vars.get_mut(name).expect("variable exists").slot = Some(slot);
        slot
    }

    /// Register for a variable about to be written. The previous value, if
    /// spilled, is not reloaded.
    pub fn allocate_variable(&mut self, name: &str, out: &mut Vec<Inst>) -> Result<u8> {
        if let Some(reg) = self.vars.get(name).and_then(|v| v.reg) {
            self.touch(reg);
            return Ok(reg);
        }
        self.vars.entry(name.to_string()).or_default();
        let reg = self.acquire(out)?;
        self.bind(name, reg);
        Ok(reg)
    }

    /// Register holding a variable's current value, reloading from its
    /// spill slot when necessary.
    pub fn get_variable(&mut self, name: &str, out: &mut Vec<Inst>) -> Result<u8> {
        let var = self
            .vars
            .get(name)
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))?;
        if let Some(reg) = var.reg {
            self.touch(reg);
            return Ok(reg);
        }
        let slot = var
            .slot
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))?;
        let reg = self.acquire(out)?;
        out.push(Inst::new(
            Opcode::LoadStack,
            [reg, OPERAND_IMM, 0],
            slot as i32,
            format!("reload {name} from slot {slot}"),
        ));
        self.bind(name, reg);
        Ok(reg)
    }

    pub fn mark_initialized(&mut self, name: &str) {
        if let Some(var) = self.vars.get_mut(name) {
            var.initialized = true;
        }
    }

    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn alloc_temp(&mut self) -> Result<u8> {
        self.free_temps
            .pop()
            .ok_or_else(|| Error::RegisterExhaustion("integer scratch pool empty".into()))
    }

    pub fn release_temp(&mut self, reg: u8) {
        if TEMP_VREGS.contains(&reg) && !self.free_temps.contains(&reg) {
            self.free_temps.push(reg);
        }
    }

    #[must_use]
    pub fn temp_available(&self) -> bool {
        !self.free_temps.is_empty()
    }

    /// Reserve one dense stack slot (spills, staging, array storage).
    pub fn reserve_slot(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    /// Reserve a contiguous block of slots, returning the base index.
    pub fn reserve_slots(&mut self, count: usize) -> usize {
        let base = self.next_slot;
        self.next_slot += count;
        base
    }

    /// Spill every initialized live variable and drop all register
    /// bindings. Used before calls and service requests, which clobber the
    /// whole volatile file.
    pub fn flush(&mut self, out: &mut Vec<Inst>) {
        let regs: Vec<u8> = self.lru.clone();
        for reg in regs {
            let Some(name) = self.owner.get(&reg).cloned() else {
                continue;
            };
            if self.vars[&name].initialized {
                let slot = self.ensure_slot(&name);
                out.push(Inst::new(
                    Opcode::StoreStack,
                    [reg, OPERAND_IMM, 0],
                    slot as i32,
                    format!("spill {name} to slot {slot}"),
                ));
            }
            self.unbind(reg);
        }
    }

    /// Drop every register binding without emitting stores. Only valid at
    /// points where all spill slots are known to be current (e.g. a loop
    /// exit reached after a read-only condition check).
    pub fn forget(&mut self) {
        let regs: Vec<u8> = self.lru.clone();
        for reg in regs {
            self.unbind(reg);
        }
    }

    /// Bind a parameter directly to its ABI register.
    pub fn bind_param(&mut self, name: &str, reg: u8) {
        self.vars.insert(
            name.to_string(),
            VarState {
                reg: Some(reg),
                slot: None,
                initialized: true,
                stack_valid: false,
            },
        );
        self.owner.insert(reg, name.to_string());
        self.touch(reg);
    }

    /// Register a parameter that lives in a stack slot from entry on.
    pub fn define_spilled(&mut self, name: &str, slot: usize) {
        self.vars.insert(
            name.to_string(),
            VarState {
                reg: None,
                slot: Some(slot),
                initialized: true,
                stack_valid: false,
            },
        );
    }

    /// High-water mark of dense slot usage for frame sizing.
    #[must_use]
    pub fn frame_slots(&self) -> usize {
        self.next_slot
    }
}

impl Default for IntAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct FloatAllocator {
    vars: HashMap<String, VarState>,
    owner: HashMap<u8, String>,
    lru: Vec<u8>,
    free_temps: Vec<u8>,
    next_slot: usize,
}

impl FloatAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vars: HashMap::new(),
            owner: HashMap::new(),
            lru: Vec::new(),
            free_temps: (FIRST_FTEMP..=LAST_FTEMP).rev().collect(),
            next_slot: 0,
        }
    }

    fn touch(&mut self, reg: u8) {
        self.lru.retain(|&r| r != reg);
        self.lru.push(reg);
    }

    fn bind(&mut self, name: &str, reg: u8) {
        self.owner.insert(reg, name.to_string());
        self.vars.get_mut(name).expect("bound variable exists").reg = Some(reg);
        self.touch(reg);
    }

    fn unbind(&mut self, reg: u8) {
        if let Some(name) = self.owner.remove(&reg) {
            if let Some(var) = self.vars.get_mut(&name) {
                var.reg = None;
            }
        }
        self.lru.retain(|&r| r != reg);
    }

    fn ensure_slot(&mut self, name: &str) -> usize {
        if let Some(slot) = self.vars[name].slot {
            return slot;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.vars.get_mut(name).expect("variable exists").slot = Some(slot);
        slot
    }

    /// Eviction preference: variables whose stack copy is already valid,
    /// then the LRU initialized variable, then anything.
    fn acquire(&mut self, out: &mut Vec<Inst>) -> Result<u8> {
        for reg in 0..NUM_FVAR_REGS {
            if !self.owner.contains_key(&reg) {
                return Ok(reg);
            }
        }
        let state = |this: &Self, reg: &u8| {
            this.owner
                .get(reg)
                .and_then(|n| this.vars.get(n))
                .cloned()
                .unwrap_or_default()
        };
        let victim_reg = self
            .lru
            .iter()
            .copied()
            .find(|r| {
                let v = state(self, r);
                v.stack_valid && v.slot.is_some()
            })
            .or_else(|| {
                self.lru
                    .iter()
                    .copied()
                    .find(|r| state(self, r).initialized)
            })
            .or_else(|| self.lru.first().copied())
            .ok_or_else(|| Error::RegisterExhaustion("no evictable SSE register".into()))?;

        let name = self.owner[&victim_reg].clone();
        let var = self.vars[&name].clone();
        if var.initialized && !(var.stack_valid && var.slot.is_some()) {
            let slot = self.ensure_slot(&name);
            out.push(Inst::new(
                Opcode::Fstore,
                [victim_reg, OPERAND_IMM, 0],
                slot as i32,
                format!("spill {name} to float slot {slot}"),
            ));
            self.vars.get_mut(&name).expect("variable exists").stack_valid = true;
        }
        self.unbind(victim_reg);
        Ok(victim_reg)
    }

    /// Register for a float variable about to be written. Writing makes any
    /// stack copy stale.
    pub fn allocate_variable(&mut self, name: &str, out: &mut Vec<Inst>) -> Result<u8> {
        if let Some(reg) = self.vars.get(name).and_then(|v| v.reg) {
            self.touch(reg);
            self.vars.get_mut(name).expect("variable exists").stack_valid = false;
            return Ok(reg);
        }
        self.vars.entry(name.to_string()).or_default();
        let reg = self.acquire(out)?;
        self.bind(name, reg);
        self.vars.get_mut(name).expect("variable exists").stack_valid = false;
        Ok(reg)
    }

    /// Register holding the variable's value; reloads keep the stack copy
    /// valid so the same variable can be evicted again without re-spilling.
    pub fn get_variable(&mut self, name: &str, out: &mut Vec<Inst>) -> Result<u8> {
        let var = self
            .vars
            .get(name)
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))?;
        if let Some(reg) = var.reg {
            self.touch(reg);
            return Ok(reg);
        }
        let slot = var
            .slot
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))?;
        let reg = self.acquire(out)?;
        out.push(Inst::new(
            Opcode::Fload,
            [reg, OPERAND_IMM, 0],
            slot as i32,
            format!("reload {name} from float slot {slot}"),
        ));
        self.bind(name, reg);
        self.vars.get_mut(name).expect("variable exists").stack_valid = true;
        Ok(reg)
    }

    pub fn mark_initialized(&mut self, name: &str) {
        if let Some(var) = self.vars.get_mut(name) {
            var.initialized = true;
        }
    }

    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn alloc_temp(&mut self) -> Result<u8> {
        self.free_temps
            .pop()
            .ok_or_else(|| Error::RegisterExhaustion("SSE scratch pool empty".into()))
    }

    pub fn release_temp(&mut self, reg: u8) {
        if (FIRST_FTEMP..=LAST_FTEMP).contains(&reg) && !self.free_temps.contains(&reg) {
            self.free_temps.push(reg);
        }
    }

    /// Write every initialized live variable to its slot without dropping
    /// register bindings. Hoisted to loop entries so hot bodies contain no
    /// spill stores.
    pub fn spill_all(&mut self, out: &mut Vec<Inst>) {
        let regs: Vec<u8> = self.lru.clone();
        for reg in regs {
            let Some(name) = self.owner.get(&reg).cloned() else {
                continue;
            };
            let var = self.vars[&name].clone();
            if var.initialized && !(var.stack_valid && var.slot.is_some()) {
                let slot = self.ensure_slot(&name);
                out.push(Inst::new(
                    Opcode::Fstore,
                    [reg, OPERAND_IMM, 0],
                    slot as i32,
                    format!("spill {name} to float slot {slot}"),
                ));
                self.vars.get_mut(&name).expect("variable exists").stack_valid = true;
            }
        }
    }

    /// Spill everything and drop register bindings (call boundaries).
    pub fn flush(&mut self, out: &mut Vec<Inst>) {
        self.spill_all(out);
        let regs: Vec<u8> = self.lru.clone();
        for reg in regs {
            self.unbind(reg);
        }
    }

    /// Bind a float parameter directly to its ABI register.
    pub fn bind_param(&mut self, name: &str, reg: u8) {
        self.vars.insert(
            name.to_string(),
            VarState {
                reg: Some(reg),
                slot: None,
                initialized: true,
                stack_valid: false,
            },
        );
        self.owner.insert(reg, name.to_string());
        self.touch(reg);
    }

    /// Reserve one float slot for staging (call arguments, operand stashes).
    pub fn reserve_slot(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    #[must_use]
    pub fn frame_slots(&self) -> usize {
        self.next_slot
    }
}

impl Default for FloatAllocator {
    fn default() -> Self {
        Self::new()
    }
}
