//! Round-trip law: for every compiled program, parsing the emitted
//! manifest text back yields identical opcodes, operands and immediates.

use aur_native::ir::{BinOp, Service, Type};
use aur_native::test_harness::*;
use aur_native::{Error, ManifestUnit};

fn assert_round_trips(unit: &ManifestUnit) {
    let text = unit.to_text();
    let back = ManifestUnit::parse(&text).expect("parse emitted manifest");
    assert_eq!(back.instructions.len(), unit.instructions.len());
    for (a, b) in unit.instructions.iter().zip(&back.instructions) {
        assert_eq!(a.op, b.op, "opcode mismatch: {a:?} vs {b:?}");
        assert_eq!(a.ops, b.ops, "operand mismatch: {a:?} vs {b:?}");
        assert_eq!(a.imm, b.imm, "immediate mismatch: {a:?} vs {b:?}");
    }
    assert_eq!(back.labels, unit.labels);
    assert_eq!(back.strings, unit.strings);
    assert_eq!(back.shared, unit.shared);
    assert_eq!(back.stack_size, unit.stack_size);
}

#[test]
fn arithmetic_program_round_trips() {
    let program = flat_program(vec![
        let_int("a", int_lit(0)),
        let_int("i", int_lit(10)),
        while_stmt(
            cmp(BinOp::Gt, var_int("i"), int_lit(0)),
            vec![
                assign("a", add(var_int("a"), var_int("i"))),
                assign("i", sub(var_int("i"), int_lit(1))),
            ],
        ),
        request(Service::Exit, vec![var_int("a")]),
        ret(Some(var_int("a"))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    assert_round_trips(&unit);
}

#[test]
fn string_and_shared_program_round_trips() {
    let program = module_program(
        vec![
            func(
                "worker",
                vec![],
                Type::Int,
                vec![atomic_add("c", int_lit(1)), ret(Some(int_lit(0)))],
            ),
            func(
                "main",
                vec![],
                Type::Int,
                vec![
                    let_typed("s", Type::Str, str_lit("hi\n\t\"there\"")),
                    request(Service::Print, vec![var_int("s")]),
                    ret(Some(int_lit(0))),
                ],
            ),
        ],
        vec![shared_decl("c", 0)],
    );
    let unit = compile_linux(&program).expect("compile");
    assert!(!unit.strings.is_empty());
    assert!(!unit.shared.is_empty());
    assert_round_trips(&unit);
}

#[test]
fn float_constants_keep_their_pattern_through_text() {
    let program = flat_program(vec![
        let_float("x", float_lit(1.5)),
        request(Service::PrintFloat, vec![var_float("x")]),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    let text = unit.to_text();
    let back = ManifestUnit::parse(&text).expect("parse");
    let pattern: Vec<u64> = back
        .instructions
        .iter()
        .filter_map(aur_native::Inst::float_pattern)
        .collect();
    assert!(
        pattern.contains(&1.5f64.to_bits()),
        "constant pattern lost in {text}"
    );
}

#[test]
fn comments_carry_jump_targets() {
    let program = flat_program(vec![
        if_stmt(
            cmp(BinOp::Lt, int_lit(1), int_lit(2)),
            vec![ret(Some(int_lit(1)))],
            None,
        ),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    let text = unit.to_text();
    let back = ManifestUnit::parse(&text).expect("parse");
    for inst in back
        .instructions
        .iter()
        .filter(|i| matches!(i.op, aur_native::Opcode::Jmp | aur_native::Opcode::Cjmp))
    {
        let target = inst.label_target().expect("jump carries target");
        assert!(
            back.labels.contains_key(target),
            "unresolvable jump target {target}"
        );
    }
}

#[test]
fn unterminated_string_reports_malformed_string() {
    let err = ManifestUnit::parse("string \"no end").unwrap_err();
    assert!(matches!(err, Error::MalformedString(_)));
}

#[test]
fn garbage_directive_reports_malformed_manifest() {
    let err = ManifestUnit::parse("bytes zzz ; nope").unwrap_err();
    assert!(matches!(err, Error::MalformedManifest(_)));
}
