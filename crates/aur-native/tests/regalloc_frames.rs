//! Frame-size and spill-behavior laws over whole compiled programs.

use aur_native::ir::{BinOp, Service};
use aur_native::test_harness::*;
use aur_native::{Opcode, abi};

/// Enough locals to overflow the five-slot variable pool.
fn spilling_program() -> aur_native::ir::Program {
    let lets: Vec<_> = (0..7).map(|i| let_int(&format!("v{i}"), int_lit(i))).collect();
    let mut body = lets;
    // Touch the earliest variable again so it has to reload.
    body.push(assign("v0", add(var_int("v0"), var_int("v6"))));
    body.push(ret(Some(var_int("v0"))));
    flat_program(body)
}

#[test]
fn spills_appear_once_the_pool_is_full() {
    let unit = compile_linux(&spilling_program()).expect("compile");
    let spills = unit
        .instructions
        .iter()
        .filter(|i| i.op == Opcode::StoreStack && i.comment.starts_with("spill"))
        .count();
    assert!(spills >= 2, "seven locals must evict at least two victims");
    let reloads = unit
        .instructions
        .iter()
        .filter(|i| i.op == Opcode::LoadStack && i.comment.starts_with("reload"))
        .count();
    assert!(reloads >= 1, "v0 must reload from its slot");
}

#[test]
fn frame_covers_every_integer_spill_slot() {
    let unit = compile_linux(&spilling_program()).expect("compile");
    let max_slot = unit
        .instructions
        .iter()
        .filter(|i| matches!(i.op, Opcode::StoreStack | Opcode::LoadStack))
        .map(|i| i.imm)
        .max()
        .expect("spills exist");
    assert!(
        unit.stack_size >= 32 + 8 * (max_slot as u32 + 1),
        "stack_size {} does not cover slot {max_slot}",
        unit.stack_size
    );
}

#[test]
fn frame_covers_every_float_spill_slot() {
    let lets: Vec<_> = (0..8)
        .map(|i| let_float(&format!("f{i}"), float_lit(f64::from(i))))
        .collect();
    let mut body = lets;
    body.push(ret(Some(int_lit(0))));
    let unit = compile_linux(&flat_program(body)).expect("compile");
    let max_float_slot = unit
        .instructions
        .iter()
        .filter(|i| matches!(i.op, Opcode::Fstore | Opcode::Fload))
        .map(|i| i.imm)
        .max()
        .expect("float spills exist");
    assert!(unit.stack_size >= 200 + 8 * (max_float_slot as u32 + 1));
}

#[test]
fn stack_size_satisfies_win64_alignment_rule() {
    for program in [
        flat_program(vec![ret(Some(int_lit(0)))]),
        spilling_program(),
        flat_program(vec![
            let_float("x", float_lit(2.0)),
            request(Service::PrintFloat, vec![var_float("x")]),
            ret(Some(int_lit(0))),
        ]),
    ] {
        let unit = compile_windows(&program).expect("compile");
        assert_eq!(
            unit.stack_size % 16,
            8,
            "stack_size {} breaks the pre-CALL alignment rule",
            unit.stack_size
        );
        assert!(unit.stack_size >= abi::MIN_FRAME);
    }
}

#[test]
fn factorial_loop_compiles_with_spills_and_terminates_in_halt() {
    // fn main() { let n = 5; let f = 1; while n > 0 { f = f*n; n = n-1 } return f }
    let program = flat_program(vec![
        let_int("n", int_lit(5)),
        let_int("f", int_lit(1)),
        while_stmt(
            cmp(BinOp::Gt, var_int("n"), int_lit(0)),
            vec![
                assign("f", mul(var_int("f"), var_int("n"))),
                assign("n", sub(var_int("n"), int_lit(1))),
            ],
        ),
        ret(Some(var_int("f"))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    assert_eq!(
        unit.instructions.last().map(|i| i.op),
        Some(Opcode::Halt),
        "main must terminate with HALT"
    );
    // Loop back-edge discipline: every variable modified in the body is
    // stored to its slot before the condition label.
    let cjmp = find_opcode(&unit.instructions, Opcode::Cjmp).expect("loop check");
    let stores_before_check = unit.instructions[..cjmp]
        .iter()
        .filter(|i| i.op == Opcode::StoreStack && i.comment.starts_with("spill"))
        .count();
    assert!(stores_before_check >= 2, "f and n must persist across the back edge");
}

#[test]
fn six_parameters_park_the_sixth_in_a_slot() {
    use aur_native::ir::Type;
    let params: Vec<_> = (0..6).map(|i| param(&format!("p{i}"), Type::Int)).collect();
    let body = vec![ret(Some(var_int("p5")))];
    let program = module_program(
        vec![
            func("wide", params, Type::Int, body),
            func(
                "main",
                vec![],
                Type::Int,
                vec![ret(Some(call(
                    "wide",
                    (0..6).map(int_lit).collect(),
                    Type::Int,
                )))],
            ),
        ],
        vec![],
    );
    let unit = compile_linux(&program).expect("compile");
    // The sixth parameter arrives in r6 and is parked immediately.
    assert_has_pattern(
        &unit.instructions,
        &[InstPattern::opcode(Opcode::StoreStack).with_op0(6)],
    );
}
