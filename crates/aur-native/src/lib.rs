#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines,
    clippy::missing_errors_doc
)]

pub mod abi;
pub mod codegen;
pub mod encode;
pub mod error;
pub mod image;
pub mod ir;
pub mod manifest;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use abi::Target;
pub use codegen::compile;
pub use error::{Error, Result};
pub use manifest::{Inst, ManifestUnit, Opcode};

/// Encode a manifest into a loadable executable image for `target`.
pub fn assemble(unit: &ManifestUnit, target: Target) -> Result<Vec<u8>> {
    match target {
        Target::Linux => image::elf::write(unit),
        Target::Windows => image::pe::write(unit),
    }
}

/// Full pipeline: IR program to executable bytes.
pub fn compile_native(program: &ir::Program, target: Target) -> Result<Vec<u8>> {
    let unit = compile(program, target)?;
    assemble(&unit, target)
}
