mod compiler;

pub use compiler::{
    CheckResult, CompileResult, check_module, compile_file, compile_module, emit_diagnostics,
    emit_mir, format_diagnostics, load_module, parse_module,
};
