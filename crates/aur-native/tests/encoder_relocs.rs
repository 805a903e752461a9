//! Relocation closure: after `resolve`, every patched slot points exactly
//! at its target address.

use std::collections::HashMap;

use aur_native::abi::Target;
use aur_native::encode::{Encoder, RelocKind};
use aur_native::ir::{BinOp, Service, Type};
use aur_native::test_harness::*;

fn check_closure(unit: &aur_native::ManifestUnit, target: Target) {
    let mut enc = Encoder::new(target);
    enc.encode_unit(unit).expect("encode");

    let code_base: u64 = 0x40_1000;
    let data_base = code_base + ((enc.code().len() as u64 + 0xFFF) & !0xFFF);

    // Synthesize IAT addresses for import relocations on Windows.
    let mut iat = HashMap::new();
    for (i, func) in aur_native::image::pe::IMPORT_FUNCS.iter().enumerate() {
        iat.insert(format!("__imp_{func}"), 0x50_0000 + (i as u64) * 8);
    }
    enc.resolve(code_base, data_base, &iat).expect("resolve");

    assert!(
        !enc.relocations().is_empty(),
        "programs with jumps must record relocations"
    );
    for reloc in enc.relocations() {
        let target_addr = enc
            .code_label(&reloc.target)
            .map(|o| code_base + o as u64)
            .or_else(|| enc.data_label(&reloc.target).map(|o| data_base + o as u64))
            .or_else(|| iat.get(&reloc.target).copied())
            .unwrap_or_else(|| panic!("unresolvable target {}", reloc.target));
        match reloc.kind {
            RelocKind::Abs64 => {
                let patched = u64::from_le_bytes(
                    enc.code()[reloc.offset..reloc.offset + 8].try_into().unwrap(),
                );
                assert_eq!(patched, target_addr, "abs64 slot for {}", reloc.target);
            }
            RelocKind::Rel32 | RelocKind::RipData => {
                let disp = i32::from_le_bytes(
                    enc.code()[reloc.offset..reloc.offset + 4].try_into().unwrap(),
                );
                let next = code_base + reloc.offset as u64 + 4;
                assert_eq!(
                    next.wrapping_add(disp as i64 as u64),
                    target_addr,
                    "rel32 slot for {}",
                    reloc.target
                );
            }
        }
    }
}

#[test]
fn relocation_closure_holds_for_a_loop_program() {
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
        ret(Some(var_int("a"))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    check_closure(&unit, Target::Linux);
}

#[test]
fn relocation_closure_holds_for_strings_and_services() {
    let program = flat_program(vec![
        let_typed("s", Type::Str, str_lit("hello")),
        request(Service::Print, vec![var_int("s")]),
        request(Service::PrintInt, vec![int_lit(42)]),
        ret(Some(int_lit(0))),
    ]);
    let unit = compile_linux(&program).expect("compile");
    check_closure(&unit, Target::Linux);
}

#[test]
fn relocation_closure_holds_for_windows_imports_and_threads() {
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
                    let_typed("t", Type::Thread, aur_native::ir::Expr::Spawn {
                        func: "worker".to_string(),
                    }),
                    aur_native::ir::Stmt::Join {
                        handle: var_int("t"),
                    },
                    let_int("v", aur_native::ir::Expr::AtomicLoad {
                        name: "c".to_string(),
                        ty: Type::Int,
                    }),
                    request(Service::PrintInt, vec![var_int("v")]),
                    ret(Some(int_lit(0))),
                ],
            ),
        ],
        vec![shared_decl("c", 0)],
    );
    let unit = compile_windows(&program).expect("compile");
    check_closure(&unit, Target::Windows);
}

#[test]
fn spawn_is_not_lowered_on_linux() {
    let program = module_program(
        vec![
            func("worker", vec![], Type::Int, vec![ret(Some(int_lit(0)))]),
            func(
                "main",
                vec![],
                Type::Int,
                vec![
                    let_typed("t", Type::Thread, aur_native::ir::Expr::Spawn {
                        func: "worker".to_string(),
                    }),
                    ret(Some(int_lit(0))),
                ],
            ),
        ],
        vec![],
    );
    let unit = compile_linux(&program).expect("codegen itself succeeds");
    let mut enc = Encoder::new(Target::Linux);
    let err = enc.encode_unit(&unit).unwrap_err();
    assert!(matches!(err, aur_native::Error::UnsupportedOpcode(_)));
}
