//! The typed IR consumed by the backend.
//!
//! The frontend (lexer, parser, type checker) is an external collaborator;
//! this module only defines the tree it hands over. Each category is one
//! sum type so every visitor site matches exhaustively.

/// A complete compilation unit.
#[derive(Debug, Clone)]
pub enum Program {
    /// A script: top-level declarations and statements, lowered as `main`.
    Flat { body: Vec<Stmt> },
    /// A module: named functions plus shared (atomic) variable declarations.
    Module {
        functions: Vec<Function>,
        shared: Vec<SharedDecl>,
    },
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// An 8-byte shared variable, visible to all threads via atomic ops.
#[derive(Debug, Clone)]
pub struct SharedDecl {
    pub name: String,
    pub init: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    Thread,
    Array(Box<Type>),
}

impl Type {
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float)
    }
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Let {
        name: String,
        ty: Type,
        value: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    ArrayAssign {
        name: String,
        index: Expr,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        step: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    /// `request service <name>(args)`, an OS service request.
    Request {
        service: Service,
        args: Vec<Expr>,
    },
    Return(Option<Expr>),
    /// A call whose result is discarded.
    CallStmt {
        name: String,
        args: Vec<Expr>,
    },
    /// `join t`: block until the thread held by `handle` finishes.
    Join {
        handle: Expr,
    },
    /// `atomic.<op>(target, ...)` on a shared variable.
    AtomicOp {
        op: AtomicKind,
        target: String,
        value: Option<Expr>,
        expected: Option<Expr>,
        new: Option<Expr>,
    },
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Variable {
        name: String,
        ty: Type,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        ty: Type,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
        ty: Type,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        ty: Type,
    },
    Cast {
        target: Type,
        expr: Box<Expr>,
    },
    ArrayLiteral {
        elements: Vec<Expr>,
        elem_ty: Type,
    },
    ArrayAccess {
        array: String,
        index: Box<Expr>,
        ty: Type,
    },
    /// `spawn f()`: start `f` on a new OS thread, yielding a handle.
    Spawn {
        func: String,
    },
    /// `atomic.load(v)` on a shared variable.
    AtomicLoad {
        name: String,
        ty: Type,
    },
    /// `input()`: read an integer from stdin.
    Input,
    MathCall {
        func: MathFunc,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

/// OS service requests, numbered as carried in the SVC immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Service {
    Print = 0x01,
    Exit = 0x02,
    Pause = 0x03,
    PauseSilent = 0x04,
    PrintInt = 0x05,
    InputInt = 0x06,
    PrintFloat = 0x07,
}

impl Service {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Exit => "exit",
            Self::Pause => "pause",
            Self::PauseSilent => "pause_silent",
            Self::PrintInt => "print_int",
            Self::InputInt => "input_int",
            Self::PrintFloat => "print_float",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicKind {
    Load,
    Store,
    Add,
    FAdd,
    /// Referenced by the frontend but with no defined lowering contract.
    Cas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunc {
    Sqrt,
    Abs,
    Floor,
    Ceil,
    Pow,
}

impl Expr {
    /// Whether evaluating this expression produces a float value.
    #[must_use]
    pub fn is_float(&self) -> bool {
        match self {
            Self::Literal(Literal::Float(_)) => true,
            Self::Literal(_) | Self::Spawn { .. } | Self::Input => false,
            Self::Variable { ty, .. }
            | Self::Binary { ty, .. }
            | Self::Unary { ty, .. }
            | Self::Call { ty, .. }
            | Self::ArrayAccess { ty, .. }
            | Self::AtomicLoad { ty, .. } => ty.is_float(),
            Self::Cast { target, .. } => target.is_float(),
            Self::ArrayLiteral { elem_ty, .. } => elem_ty.is_float(),
            Self::MathCall { .. } => true,
        }
    }

    /// Whether this expression (transitively) performs a function call or a
    /// service request, i.e. clobbers every volatile register.
    #[must_use]
    pub fn contains_call(&self) -> bool {
        match self {
            Self::Call { .. } | Self::Input | Self::Spawn { .. } => true,
            Self::Literal(_) | Self::Variable { .. } | Self::AtomicLoad { .. } => false,
            Self::Binary { lhs, rhs, .. } => lhs.contains_call() || rhs.contains_call(),
            Self::Unary { operand, .. } => operand.contains_call(),
            Self::Cast { expr, .. } => expr.contains_call(),
            Self::ArrayLiteral { elements, .. } => elements.iter().any(Expr::contains_call),
            Self::ArrayAccess { index, .. } => index.contains_call(),
            Self::MathCall { args, .. } => args.iter().any(Expr::contains_call),
        }
    }
}
