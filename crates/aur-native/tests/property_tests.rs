//! Property-based tests: instruction word packing, manifest text
//! round-trips and compile safety over generated inputs.

use aur_native::ir::BinOp;
use aur_native::manifest::{Inst, ManifestUnit, Opcode, StringLit};
use aur_native::test_harness::*;
use proptest::prelude::*;

fn arb_opcode() -> impl Strategy<Value = Opcode> {
    (0u8..48).prop_map(|b| Opcode::try_from(b).expect("closed opcode range"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Packing five fields and unpacking the word is the identity.
    #[test]
    fn pack_unpack_round_trip(
        op in arb_opcode(),
        op0 in any::<u8>(),
        op1 in any::<u8>(),
        op2 in any::<u8>(),
        imm in any::<i32>(),
    ) {
        let inst = Inst::new(op, [op0, op1, op2], imm, "gen");
        let back = Inst::unpack(inst.word(), "gen").unwrap();
        prop_assert_eq!(back.op, op);
        prop_assert_eq!(back.ops, [op0, op1, op2]);
        prop_assert_eq!(back.imm, imm);
    }

    /// The high half of the word is exactly opcode/operands.
    #[test]
    fn word_field_layout(op in arb_opcode(), op0 in any::<u8>(), imm in any::<i32>()) {
        let inst = Inst::new(op, [op0, 0, 0], imm, "");
        let word = inst.word();
        prop_assert_eq!((word >> 56) as u8, op as u8);
        prop_assert_eq!((word >> 48) as u8, op0);
        prop_assert_eq!(word as u32, imm as u32);
    }

    /// Immediates outside i32 are rejected, inside are accepted.
    #[test]
    fn immediate_range_is_enforced(imm in any::<i64>()) {
        let packed = Inst::pack(Opcode::Mov, [0, 0xFF, 0], imm, "");
        if i32::try_from(imm).is_ok() {
            prop_assert!(packed.is_ok());
        } else {
            prop_assert!(matches!(packed, Err(aur_native::Error::ImmediateOutOfRange(_))));
        }
    }

    /// Manifest text survives a serialize/parse cycle for arbitrary
    /// instruction words and escaped strings.
    #[test]
    fn manifest_text_round_trip(
        words in proptest::collection::vec((arb_opcode(), any::<u8>(), any::<u8>(), any::<i32>()), 0..40),
        strings in proptest::collection::vec("[ -~]{0,20}", 0..4),
        stack in 8u32..4096,
    ) {
        let mut unit = ManifestUnit {
            stack_size: stack,
            ..ManifestUnit::default()
        };
        for (i, (op, a, b, imm)) in words.iter().enumerate() {
            unit.instructions.push(Inst::new(*op, [*a, *b, 0], *imm, format!("inst {i}")));
        }
        for (i, text) in strings.iter().enumerate() {
            unit.strings.push(StringLit { label: format!("str_{i}"), text: text.clone() });
        }
        let back = ManifestUnit::parse(&unit.to_text()).unwrap();
        prop_assert_eq!(back.instructions, unit.instructions);
        prop_assert_eq!(back.strings, unit.strings);
        prop_assert_eq!(back.stack_size, unit.stack_size);
    }

    /// Straight-line arithmetic over two locals always compiles.
    #[test]
    fn arithmetic_compiles_without_panic(
        a in -1000i64..1000,
        b in -1000i64..1000,
        op in prop_oneof![
            Just(BinOp::Add),
            Just(BinOp::Sub),
            Just(BinOp::Mul),
            Just(BinOp::BitAnd),
            Just(BinOp::BitOr),
            Just(BinOp::BitXor),
        ],
    ) {
        let program = flat_program(vec![
            let_int("x", int_lit(a)),
            let_int("y", binary(op, var_int("x"), int_lit(b), aur_native::ir::Type::Int)),
            ret(Some(var_int("y"))),
        ]);
        prop_assert!(compile_linux(&program).is_ok());
    }

    /// Deeply right-nested additions exercise the operand-stash path
    /// without exhausting the scratch pool.
    #[test]
    fn deep_expressions_compile(depth in 1usize..24) {
        let mut expr = int_lit(1);
        for i in 0..depth {
            expr = add(add(int_lit(i as i64), int_lit(2)), expr);
        }
        let program = flat_program(vec![let_int("x", expr), ret(Some(var_int("x")))]);
        prop_assert!(compile_linux(&program).is_ok());
    }

    /// Every compiled loop program satisfies the frame alignment rule.
    #[test]
    fn frames_always_align(n in 1i64..20) {
        let program = flat_program(vec![
            let_int("i", int_lit(n)),
            while_stmt(
                cmp(BinOp::Gt, var_int("i"), int_lit(0)),
                vec![assign("i", sub(var_int("i"), int_lit(1)))],
            ),
            ret(Some(var_int("i"))),
        ]);
        let unit = compile_linux(&program).unwrap();
        prop_assert_eq!(unit.stack_size % 16, 8);
    }
}
