#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("malformed string literal: {0}")]
    MalformedString(String),

    #[error("undefined symbol: {0}")]
    UndefinedSymbol(String),

    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("undefined function: {0}")]
    UndefinedFunction(String),

    #[error("immediate out of signed 32-bit range: {0}")]
    ImmediateOutOfRange(i64),

    #[error("register allocator exhausted: {0}")]
    RegisterExhaustion(String),

    #[error("unsupported opcode: {0}")]
    UnsupportedOpcode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
