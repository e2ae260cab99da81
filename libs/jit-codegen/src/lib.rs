// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Host code generation on top of Cranelift.
//!
//! This crate is deliberately small: it picks the host ISA, owns a pool of reusable
//! compilation contexts, and turns `ir::Function`s into position-independent machine code plus
//! the unwind information a stack walker needs. Placing that code into executable memory is the
//! job of the `code-cache` crate.

mod compiled_function;
mod compiler;
mod error;

pub use compiled_function::CompiledFunction;
pub use compiler::{Compiler, CompilerConfig, OptLevel};
pub use error::Error;

// Re-exports so downstream crates build IR against the exact same Cranelift version.
pub use cranelift_codegen::isa::unwind::UnwindInfo;
pub use cranelift_codegen::{ir, isa};
pub use cranelift_frontend::FunctionBuilder;

pub type Result<T> = core::result::Result<T, Error>;
