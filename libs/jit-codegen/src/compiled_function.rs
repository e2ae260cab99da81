// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cranelift_codegen::isa::unwind::UnwindInfo;

/// Machine code for a single function, ready to be copied into executable memory.
#[derive(Debug)]
pub struct CompiledFunction {
    /// The machine code for this function.
    code: Vec<u8>,
    /// The alignment the function's start address must satisfy.
    alignment: u32,
    /// Unwind information describing the function's frame, if the ISA produced any.
    unwind_info: Option<UnwindInfo>,
}

impl CompiledFunction {
    pub fn new(code: Vec<u8>, alignment: u32, unwind_info: Option<UnwindInfo>) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            code,
            alignment,
            unwind_info,
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn unwind_info(&self) -> Option<&UnwindInfo> {
        self.unwind_info.as_ref()
    }

    /// Splits the function into its code bytes and unwind info.
    pub fn into_parts(self) -> (Vec<u8>, Option<UnwindInfo>) {
        (self.code, self.unwind_info)
    }
}
