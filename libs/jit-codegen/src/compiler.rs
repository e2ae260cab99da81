// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::fmt::Formatter;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir;
use cranelift_codegen::isa::{OwnedTargetIsa, TargetIsa};
use cranelift_codegen::settings::Configurable;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use parking_lot::Mutex;

use crate::{CompiledFunction, Error};

/// Optimization level handed to Cranelift's `opt_level` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    Speed,
    #[default]
    SpeedAndSize,
}

impl OptLevel {
    fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    pub opt_level: OptLevel,
    /// Run the IR verifier before lowering. Cheap enough for the handful of host-side routines,
    /// but it shows up in profiles when translating guest code.
    pub enable_verifier: bool,
}

/// Compiles Cranelift IR for the host ISA.
///
/// Compilation contexts are pooled and reused, so a single `Compiler` can be shared between
/// worker threads.
pub struct Compiler {
    isa: OwnedTargetIsa,
    contexts: Mutex<Vec<CompilationContext>>,
}

struct CompilationContext {
    codegen_context: cranelift_codegen::Context,
    builder_context: FunctionBuilderContext,
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self {
            codegen_context: cranelift_codegen::Context::new(),
            builder_context: FunctionBuilderContext::new(),
        }
    }
}

impl fmt::Debug for Compiler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiler")
            .field("isa", &self.isa.name())
            .field("triple", self.isa.triple())
            .finish_non_exhaustive()
    }
}

impl Compiler {
    /// Creates a compiler for the machine we are running on with the default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if Cranelift has no backend for the host architecture.
    pub fn new_for_host() -> crate::Result<Self> {
        Self::with_config(&CompilerConfig::default())
    }

    /// Creates a compiler for the host machine.
    ///
    /// # Errors
    ///
    /// Returns an error if Cranelift has no backend for the host architecture or rejects one of
    /// the settings derived from `config`.
    pub fn with_config(config: &CompilerConfig) -> crate::Result<Self> {
        let isa_builder = cranelift_codegen::isa::lookup(target_lexicon::HOST)?;
        let mut b = cranelift_codegen::settings::builder();
        b.set("opt_level", config.opt_level.as_setting())?;
        b.set(
            "enable_verifier",
            if config.enable_verifier {
                "true"
            } else {
                "false"
            },
        )?;

        let isa = isa_builder.finish(cranelift_codegen::settings::Flags::new(b))?;
        tracing::debug!(isa = isa.name(), triple = %isa.triple(), "created host compiler");

        Ok(Self {
            isa,
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn target_isa(&self) -> &dyn TargetIsa {
        self.isa.as_ref()
    }

    pub fn pointer_type(&self) -> ir::Type {
        self.isa.pointer_type()
    }

    /// Returns an empty signature using the host's default calling convention.
    pub fn signature(&self) -> ir::Signature {
        ir::Signature::new(self.isa.default_call_conv())
    }

    /// Builds a function with `signature` through a [`FunctionBuilder`] and compiles it.
    ///
    /// The closure receives the builder positioned at the (already sealed) entry block whose
    /// parameters mirror the signature. All remaining blocks are sealed once it returns, so the
    /// closure is free to create forward edges without tracking predecessors itself.
    ///
    /// # Errors
    ///
    /// Returns an error if code generation fails or the resulting code needs relocations.
    pub fn build_function<F>(
        &self,
        name: &str,
        signature: ir::Signature,
        f: F,
    ) -> crate::Result<CompiledFunction>
    where
        F: FnOnce(&mut FunctionBuilder<'_>, ir::Block),
    {
        let mut ctx = self.take_context();
        ctx.codegen_context.func =
            ir::Function::with_name_signature(ir::UserFuncName::testcase(name), signature);

        {
            let mut builder = FunctionBuilder::new(
                &mut ctx.codegen_context.func,
                &mut ctx.builder_context,
            );

            let block0 = builder.create_block();
            builder.append_block_params_for_function_params(block0);
            builder.switch_to_block(block0);
            builder.seal_block(block0);

            f(&mut builder, block0);

            builder.seal_all_blocks();
            builder.finalize();
        }

        self.finish(ctx)
    }

    /// Compiles an already constructed function.
    ///
    /// # Errors
    ///
    /// Returns an error if code generation fails or the resulting code needs relocations.
    pub fn compile(&self, func: ir::Function) -> crate::Result<CompiledFunction> {
        let mut ctx = self.take_context();
        ctx.codegen_context.func = func;
        self.finish(ctx)
    }

    fn take_context(&self) -> CompilationContext {
        let saved_context = self.contexts.lock().pop();
        saved_context
            .map(|mut ctx| {
                ctx.codegen_context.clear();
                ctx
            })
            .unwrap_or_default()
    }

    fn finish(&self, mut ctx: CompilationContext) -> crate::Result<CompiledFunction> {
        let result = self.emit(&mut ctx.codegen_context);

        ctx.codegen_context.clear();
        self.contexts.lock().push(ctx);

        result
    }

    fn emit(&self, context: &mut cranelift_codegen::Context) -> crate::Result<CompiledFunction> {
        let (code, alignment, relocations, unwind_info) = {
            let compiled_code = context
                .compile(self.target_isa(), &mut ControlPlane::default())
                .map_err(|e| e.inner)?;

            let preferred_alignment = self.isa.function_alignment().preferred;
            let alignment = compiled_code.buffer.alignment.max(preferred_alignment);
            let unwind_info = compiled_code.create_unwind_info(self.target_isa())?;

            (
                compiled_code.code_buffer().to_vec(),
                alignment,
                compiled_code.buffer.relocs().len(),
                unwind_info,
            )
        };

        // Code is copied verbatim into the code cache, there is no linking step that could
        // patch call sites, so everything must be reachable through registers.
        if relocations > 0 {
            return Err(Error::UnresolvedRelocations {
                name: context.func.name.to_string(),
                count: relocations,
            });
        }

        tracing::trace!(
            name = %context.func.name,
            size = code.len(),
            alignment,
            has_unwind_info = unwind_info.is_some(),
            "compiled function"
        );

        Ok(CompiledFunction::new(code, alignment, unwind_info))
    }
}
