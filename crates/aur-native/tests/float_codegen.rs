//! SSE lowering: loop pre-spill hoisting, float condition tables,
//! mixed-type arithmetic and the math intrinsics.

use aur_native::ir::{BinOp, MathFunc, Service, Type};
use aur_native::manifest::cond;
use aur_native::test_harness::*;
use aur_native::Opcode;

/// Hot float loops carry no spill stores: every live float is written to
/// its slot before the body label.
#[test]
fn float_spills_are_hoisted_out_of_loop_bodies() {
    let program = flat_program(vec![
        let_float("acc", float_lit(0.0)),
        let_float("step", float_lit(1.5)),
        let_int("i", int_lit(10)),
        while_stmt(
            cmp(BinOp::Gt, var_int("i"), int_lit(0)),
            vec![
                assign(
                    "acc",
                    binary(BinOp::Add, var_float("acc"), var_float("step"), Type::Float),
                ),
                assign("i", sub(var_int("i"), int_lit(1))),
            ],
        ),
        request(Service::PrintFloat, vec![var_float("acc")]),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");

    let cjmp_idx = unit
        .instructions
        .iter()
        .rposition(|i| i.op == Opcode::Cjmp && i.ops[0] == cond::GT)
        .expect("loop check");
    let body_target = unit.instructions[cjmp_idx].label_target().unwrap();
    let body_idx = unit.labels[body_target];

    for inst in &unit.instructions[body_idx..=cjmp_idx] {
        let is_spill = matches!(inst.op, Opcode::Fstore | Opcode::Fload)
            && inst.comment.starts_with("spill");
        assert!(
            !is_spill,
            "float spill inside the hot loop body: {inst:?}"
        );
    }

    // The hoisted stores exist, before the body label.
    let hoisted = unit.instructions[..body_idx]
        .iter()
        .filter(|i| i.op == Opcode::Fstore && i.comment.starts_with("spill"))
        .count();
    assert!(hoisted >= 2, "acc and step must pre-spill before the loop");
}

#[test]
fn float_comparisons_emit_fcmp_and_reach_the_unsigned_table() {
    let program = flat_program(vec![
        let_float("x", float_lit(1.0)),
        if_stmt(
            cmp(BinOp::Lt, var_float("x"), float_lit(2.0)),
            vec![ret(Some(int_lit(1)))],
            None,
        ),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    let fcmp = find_opcode(&unit.instructions, Opcode::Fcmp).expect("FCMP emitted");
    let cjmp = find_opcode(&unit.instructions, Opcode::Cjmp).expect("CJMP emitted");
    assert!(fcmp < cjmp);
    // Negated `<` is `>=`; the encoder maps it to JAE after an FCMP.
    assert_eq!(unit.instructions[cjmp].ops[0], cond::GE);
}

#[test]
fn mixed_operands_promote_the_integer_side() {
    let program = flat_program(vec![
        let_int("n", int_lit(3)),
        let_float(
            "x",
            binary(BinOp::Mul, var_int("n"), float_lit(0.5), Type::Float),
        ),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    assert!(count_opcode(&unit.instructions, Opcode::CvtSi2Sd) >= 1);
    assert!(count_opcode(&unit.instructions, Opcode::Fmul) >= 1);
}

#[test]
fn casts_lower_to_the_conversion_opcodes() {
    use aur_native::ir::Expr;
    let program = flat_program(vec![
        let_float("x", float_lit(2.5)),
        let_int(
            "n",
            Expr::Cast {
                target: Type::Int,
                expr: Box::new(var_float("x")),
            },
        ),
        ret(Some(var_int("n"))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    assert!(count_opcode(&unit.instructions, Opcode::CvtSd2Si) >= 1);
}

#[test]
fn math_calls_map_to_their_opcodes() {
    let cases = [
        (MathFunc::Sqrt, Opcode::Fsqrt),
        (MathFunc::Abs, Opcode::Fabs),
        (MathFunc::Floor, Opcode::Ffloor),
        (MathFunc::Ceil, Opcode::Fceil),
    ];
    for (func, opcode) in cases {
        let program = flat_program(vec![
            let_float("x", float_lit(2.0)),
            let_float("y", math(func, vec![var_float("x")])),
            request(Service::PrintFloat, vec![var_float("y")]),
            ret(Some(int_lit(0))),
        ]);
        let unit = compile_linux(&program).expect("compile");
        assert!(
            count_opcode(&unit.instructions, opcode) >= 1,
            "{func:?} did not emit {opcode:?}"
        );
    }
}

#[test]
fn pow_unrolls_to_repeated_multiplication() {
    let program = flat_program(vec![
        let_float("x", float_lit(3.0)),
        let_float("y", math(MathFunc::Pow, vec![var_float("x"), int_lit(4)])),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    assert!(count_opcode(&unit.instructions, Opcode::Fmul) >= 4);
}

#[test]
fn pow_rejects_non_literal_exponents() {
    let program = flat_program(vec![
        let_int("e", int_lit(2)),
        let_float("y", math(MathFunc::Pow, vec![float_lit(2.0), var_int("e")])),
        ret(Some(int_lit(0))),
    ]);
    let err = compile_linux(&program).unwrap_err();
    assert!(matches!(err, aur_native::Error::InvalidArgument(_)));
}

#[test]
fn reloaded_floats_are_evicted_again_without_a_second_spill() {
    // Nine floats cycle through the six-register pool; a variable that
    // was spilled once and only read afterwards must not spill twice.
    let mut body: Vec<_> = (0..7)
        .map(|i| let_float(&format!("f{i}"), float_lit(f64::from(i))))
        .collect();
    // Read f0 (forces a reload), then pressure the pool again.
    body.push(let_float(
        "g",
        binary(BinOp::Add, var_float("f0"), var_float("f1"), Type::Float),
    ));
    body.push(let_float("h", float_lit(9.0)));
    body.push(ret(Some(int_lit(0))));
    let unit = compile_linux(&flat_program(body)).expect("compile");
    let f0_spills = unit
        .instructions
        .iter()
        .filter(|i| i.op == Opcode::Fstore && i.comment.starts_with("spill f0"))
        .count();
    assert_eq!(f0_spills, 1, "a valid stack copy must not be rewritten");
}

#[test]
fn float_constant_materialization_uses_the_comment_channel() {
    let program = flat_program(vec![
        let_float("x", float_lit(0.1)),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    let fmov = unit
        .instructions
        .iter()
        .find(|i| i.op == Opcode::Fmov && i.ops[1] == aur_native::manifest::OPERAND_IMM)
        .expect("constant FMOV");
    assert_eq!(fmov.float_pattern(), Some(0.1f64.to_bits()));
    assert_eq!(fmov.imm, 0.1f64.to_bits() as u32 as i32);
}
