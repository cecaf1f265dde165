use ember_hir::ExprId;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("unsupported target `{target}`")]
    UnsupportedTarget { target: String },
    #[error("unknown function `{function}`")]
    UnknownFunction { function: String },
    #[error("no instantiation of `{function}` matches `{ty}`")]
    MissingInstantiation { function: String, ty: String },
    #[error("handler {expr} in `{function}` was not typed")]
    MissingHandlerMeta { function: String, expr: ExprId },
    #[error("operation `{operation}` in `{function}` was not resolved")]
    UnresolvedOperation { function: String, operation: String },
    #[error("abi mismatch in `{function}`: {detail}")]
    AbiMismatch { function: String, detail: String },
    #[error("unsupported construct in `{function}`: {detail}")]
    Unsupported { function: String, detail: String },
    #[error("internal lowering error in `{function}`: {detail}")]
    Internal { function: String, detail: String },
    #[error("lowered module is malformed ({count} problems), first: {first}")]
    InvalidMir { count: usize, first: String },
}
