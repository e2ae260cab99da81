// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("failed to generate machine code {0}")]
    CodeGen(#[from] cranelift_codegen::CodegenError),
    #[error("failed to configure code generation {0}")]
    CodeGenSettings(#[from] cranelift_codegen::settings::SetError),
    #[error("failed to determine ISA {0}")]
    TargetLookupError(#[from] cranelift_codegen::isa::LookupError),
    #[error("function `{name}` requires {count} relocation(s) but must be self-contained")]
    UnresolvedRelocations { name: String, count: usize },
}
