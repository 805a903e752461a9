//! The textual intermediate form between IR and machine code: a list of
//! packed 64-bit instructions plus labels, interned strings, shared
//! variables and the frame size.

pub mod instruction;
mod text;

use std::collections::BTreeMap;

pub use instruction::{Inst, OPERAND_IMM, OPERAND_LABEL, Opcode, cond};

/// An interned string literal with its auto-generated `str_N` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLit {
    pub label: String,
    pub text: String,
}

/// An 8-byte shared variable, placed in the data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedVar {
    pub id: u32,
    pub name: String,
    pub init: u64,
}

impl SharedVar {
    /// The symbol the data section exports for this variable.
    #[must_use]
    pub fn label(&self) -> String {
        format!("shared_{}", self.name)
    }
}

/// One compiled unit, ready for serialization or encoding.
///
/// Invariant: every label referenced by an instruction resolves to another
/// instruction index, to a string label, or to a shared-variable symbol.
#[derive(Debug, Clone, Default)]
pub struct ManifestUnit {
    pub instructions: Vec<Inst>,
    /// Label name -> instruction index.
    pub labels: BTreeMap<String, usize>,
    pub strings: Vec<StringLit>,
    pub shared: Vec<SharedVar>,
    /// Frame size in bytes (maximum over all functions in the unit).
    pub stack_size: u32,
}

impl ManifestUnit {
    /// Labels defined at a given instruction index.
    #[must_use]
    pub fn labels_at(&self, index: usize) -> Vec<&str> {
        self.labels
            .iter()
            .filter(|&(_, &i)| i == index)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Serialize to the textual manifest form.
    #[must_use]
    pub fn to_text(&self) -> String {
        text::serialize(self)
    }

    /// Parse a textual manifest back into a unit.
    pub fn parse(input: &str) -> crate::Result<Self> {
        text::parse(input)
    }
}
