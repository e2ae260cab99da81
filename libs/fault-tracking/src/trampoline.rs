// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The machine code fault handler.
//!
//! The handler is generated at startup rather than written in Rust because it runs in the
//! middle of an arbitrary instruction of an arbitrary thread: it may not touch thread-locals,
//! allocate or take locks, and everything it needs is baked into the code as constants. The
//! generated function
//!
//! 1. reads the faulting address and the write flag out of the OS provided fault context,
//! 2. scans the [`MAX_TRACKED_RANGES`] slots of the [`FaultConfig`] and, on a hit, invokes the
//!    slot's callback with the page offset and resumes execution if it returns `true`,
//! 3. otherwise asks the [`PartialUnmapState`] whether the fault raced a remap and should be
//!    retried,
//! 4. and finally hands the fault on to whatever handled it before us.

use jit_codegen::ir::condcodes::IntCC;
use jit_codegen::ir::types::{I8, I32, I64};
use jit_codegen::ir::{
    AbiParam, Block, InstBuilder, MemFlags, StackSlot, StackSlotData, StackSlotKind, Type, Value,
};
use jit_codegen::{CompiledFunction, Compiler, FunctionBuilder, ir};

use crate::config::{self, FaultConfig, MAX_TRACKED_RANGES};
use crate::layout::{
    ESR_MAGIC, ESR_SEARCH_LIMIT, ESR_VALUE_OFFSET, ESR_WNR, FaultLayout, Width, WriteFlag,
};
use crate::partial_unmap::PartialUnmapState;

/// `EXCEPTION_ACCESS_VIOLATION`
const ACCESS_VIOLATION: i64 = 0xC000_0005;
/// `EXCEPTION_CONTINUE_EXECUTION`, `-1` as an `i32`.
const CONTINUE_EXECUTION: i64 = 0xFFFF_FFFF;
/// `EXCEPTION_CONTINUE_SEARCH`
const CONTINUE_SEARCH: i64 = 0;

/// How the OS delivers faults to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// A `SA_SIGINFO` signal handler, `fn(signal: i32, info: *mut siginfo_t, context: *mut c_void)`.
    Signal,
    /// A vectored exception handler, `fn(pointers: *mut EXCEPTION_POINTERS) -> i32`.
    VectoredException,
}

impl Flavor {
    pub const HOST: Flavor = if cfg!(windows) {
        Flavor::VectoredException
    } else {
        Flavor::Signal
    };
}

/// Everything the generated handler refers to.
#[derive(Debug, Clone, Copy)]
pub struct TrampolineParams {
    pub flavor: Flavor,
    pub layout: FaultLayout,
    pub config: &'static FaultConfig,
    pub partial_unmap: &'static PartialUnmapState,
    pub page_size: u64,
}

/// Called by the generated code when a fault did not hit a tracked range.
unsafe extern "C" fn retry_from_access_violation(state: *const PartialUnmapState) -> bool {
    // Safety: the pointer is baked into the handler from a `&'static PartialUnmapState`
    let state = unsafe { &*state };
    state.retry_from_access_violation()
}

/// Called by the generated code when there is no previous handler to chain to.
extern "C" fn unhandled_fault(_signal: i32) {
    std::process::abort();
}

/// Generates the fault handler for `params`.
///
/// # Errors
///
/// Returns an error if code generation fails.
pub fn build(compiler: &Compiler, params: &TrampolineParams) -> jit_codegen::Result<CompiledFunction> {
    let ptr_ty = compiler.pointer_type();
    let mut signature = compiler.signature();

    match params.flavor {
        Flavor::Signal => {
            signature.params.push(AbiParam::new(I32));
            signature.params.push(AbiParam::new(ptr_ty));
            signature.params.push(AbiParam::new(ptr_ty));
        }
        Flavor::VectoredException => {
            signature.params.push(AbiParam::new(ptr_ty));
            signature.returns.push(AbiParam::new(I32));
        }
    }

    let signatures = Signatures::new(compiler);

    compiler.build_function("fault_trampoline", signature, |builder, entry| {
        let entry_params = builder.block_params(entry).to_vec();
        let mut emitter = Emitter {
            builder,
            params,
            signatures,
            ptr_ty,
        };

        match params.flavor {
            Flavor::Signal => emitter.emit_signal_handler(&entry_params),
            Flavor::VectoredException => emitter.emit_exception_handler(entry_params[0]),
        }
    })
}

/// Signatures of the functions the handler calls.
struct Signatures {
    callback: ir::Signature,
    retry: ir::Signature,
    abort: ir::Signature,
    previous_one_arg: ir::Signature,
    previous_three_args: ir::Signature,
}

impl Signatures {
    fn new(compiler: &Compiler) -> Self {
        let ptr_ty = compiler.pointer_type();

        let mut callback = compiler.signature();
        callback.params.push(AbiParam::new(I64));
        callback.params.push(AbiParam::new(I64));
        callback.params.push(AbiParam::new(I8).uext());
        callback.params.push(AbiParam::new(I32));
        callback.returns.push(AbiParam::new(I8));

        let mut retry = compiler.signature();
        retry.params.push(AbiParam::new(ptr_ty));
        retry.returns.push(AbiParam::new(I8));

        let mut abort = compiler.signature();
        abort.params.push(AbiParam::new(I32));

        let previous_one_arg = abort.clone();

        let mut previous_three_args = compiler.signature();
        previous_three_args.params.push(AbiParam::new(I32));
        previous_three_args.params.push(AbiParam::new(ptr_ty));
        previous_three_args.params.push(AbiParam::new(ptr_ty));

        Self {
            callback,
            retry,
            abort,
            previous_one_arg,
            previous_three_args,
        }
    }
}

struct Emitter<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    params: &'a TrampolineParams,
    signatures: Signatures,
    ptr_ty: Type,
}

impl Emitter<'_, '_> {
    fn emit_signal_handler(&mut self, entry_params: &[Value]) {
        let [signal, info, context] = *entry_params else {
            unreachable!("signal handler takes three parameters");
        };

        let resume = self.builder.create_block();
        let unhandled = self.builder.create_block();
        let chain = self.builder.create_block();

        self.emit_lookup(info, context, resume, unhandled);

        self.builder.switch_to_block(resume);
        self.builder.ins().return_(&[]);

        self.builder.switch_to_block(unhandled);
        self.emit_retry(resume, chain);

        self.builder.switch_to_block(chain);
        self.emit_chain(signal, info, context);
    }

    fn emit_exception_handler(&mut self, pointers: Value) {
        let access_violation = self.builder.create_block();
        let resume = self.builder.create_block();
        let unhandled = self.builder.create_block();
        let search = self.builder.create_block();

        // EXCEPTION_POINTERS.ExceptionRecord
        let record = self
            .builder
            .ins()
            .load(self.ptr_ty, MemFlags::trusted(), pointers, 0);
        // EXCEPTION_RECORD.ExceptionCode
        let code = self.builder.ins().load(I32, MemFlags::trusted(), record, 0);
        let expected = self.builder.ins().iconst(I32, ACCESS_VIOLATION);
        let is_access_violation = self.builder.ins().icmp(IntCC::Equal, code, expected);
        self.builder
            .ins()
            .brif(is_access_violation, access_violation, &[], search, &[]);

        self.builder.switch_to_block(access_violation);
        // both the address and the write flag live in the exception record
        self.emit_lookup(record, record, resume, unhandled);

        self.builder.switch_to_block(resume);
        let result = self.builder.ins().iconst(I32, CONTINUE_EXECUTION);
        self.builder.ins().return_(&[result]);

        self.builder.switch_to_block(unhandled);
        self.emit_retry(resume, search);

        self.builder.switch_to_block(search);
        let result = self.builder.ins().iconst(I32, CONTINUE_SEARCH);
        self.builder.ins().return_(&[result]);
    }

    fn config_ptr(&mut self) -> Value {
        let addr = core::ptr::from_ref(self.params.config) as i64;
        self.builder.ins().iconst(self.ptr_ty, addr)
    }

    fn function_ptr(&mut self, addr: usize) -> Value {
        self.builder.ins().iconst(self.ptr_ty, addr as i64)
    }

    /// Loads a 32-bit offset out of the config and adds it to `base`.
    fn offset_by_config(&mut self, base: Value, config_offset: i32) -> Value {
        let config_base = self.config_ptr();
        let offset = self
            .builder
            .ins()
            .load(I32, MemFlags::trusted(), config_base, config_offset);
        let offset = self.builder.ins().sextend(self.ptr_ty, offset);
        self.builder.ins().iadd(base, offset)
    }

    /// Emits the tracked range scan, branching to `resume` if a callback handled the fault and to
    /// `unhandled` otherwise.
    fn emit_lookup(&mut self, info: Value, context: Value, resume: Block, unhandled: Block) {
        let address_ptr = self.offset_by_config(info, config::STRUCT_ADDRESS_OFFSET);
        let address = self
            .builder
            .ins()
            .load(I64, MemFlags::trusted(), address_ptr, 0);

        let is_write = self.emit_is_write(context);

        for index in 0..MAX_TRACKED_RANGES {
            let next = self.builder.create_block();
            self.emit_range_check(index, address, is_write, resume, unhandled, next);
            self.builder.switch_to_block(next);
        }

        self.builder.ins().jump(unhandled, &[]);
    }

    fn emit_range_check(
        &mut self,
        index: usize,
        address: Value,
        is_write: Value,
        resume: Block,
        unhandled: Block,
        next: Block,
    ) {
        let check = self.builder.create_block();
        let hit = self.builder.create_block();
        let invoke = self.builder.create_block();

        let slot = config::range_offset(index);
        let config_base = self.config_ptr();
        let flags = MemFlags::trusted();

        let active = self
            .builder
            .ins()
            .load(I32, flags, config_base, slot + config::RANGE_ACTIVE);
        self.builder.ins().brif(active, check, &[], next, &[]);

        self.builder.switch_to_block(check);
        let start = self
            .builder
            .ins()
            .load(I64, flags, config_base, slot + config::RANGE_START);
        let end = self
            .builder
            .ins()
            .load(I64, flags, config_base, slot + config::RANGE_END);
        let above_start = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, address, start);
        let below_end = self.builder.ins().icmp(IntCC::UnsignedLessThan, address, end);
        let in_range = self.builder.ins().band(above_start, below_end);
        self.builder.ins().brif(in_range, hit, &[], next, &[]);

        self.builder.switch_to_block(hit);
        let callback = self
            .builder
            .ins()
            .load(self.ptr_ty, flags, config_base, slot + config::RANGE_CALLBACK);
        // the slot is being torn down concurrently
        self.builder.ins().brif(callback, invoke, &[], unhandled, &[]);

        self.builder.switch_to_block(invoke);
        let page_size = self.params.page_size;
        let offset = self.builder.ins().isub(address, start);
        let page_offset = self
            .builder
            .ins()
            .band_imm(offset, (!(page_size - 1)).cast_signed());
        let page_size = self.builder.ins().iconst(I64, page_size.cast_signed());
        let reserved = self.builder.ins().iconst(I32, 0);

        let sig = self.builder.import_signature(self.signatures.callback.clone());
        let call = self.builder.ins().call_indirect(
            sig,
            callback,
            &[page_offset, page_size, is_write, reserved],
        );
        let handled = self.builder.inst_results(call)[0];
        self.builder.ins().brif(handled, resume, &[], unhandled, &[]);
    }

    /// Computes whether the faulting access was a write as an `i8` holding `0` or `1`.
    fn emit_is_write(&mut self, context: Value) -> Value {
        match self.params.layout.write_flag {
            WriteFlag::Masked { width, mask } => {
                let ptr = self.offset_by_config(context, config::STRUCT_WRITE_OFFSET);
                self.emit_masked(ptr, width, mask)
            }
            WriteFlag::Indirect {
                pointer_offset,
                width,
                mask,
            } => {
                let machine_context =
                    self.builder
                        .ins()
                        .load(self.ptr_ty, MemFlags::trusted(), context, pointer_offset);
                let ptr = self.offset_by_config(machine_context, config::STRUCT_WRITE_OFFSET);
                self.emit_masked(ptr, width, mask)
            }
            WriteFlag::EsrRecord => self.emit_esr_walk(context),
        }
    }

    fn emit_masked(&mut self, ptr: Value, width: Width, mask: i64) -> Value {
        let ty = match width {
            Width::U32 => I32,
            Width::U64 => I64,
        };
        let value = self.builder.ins().load(ty, MemFlags::trusted(), ptr, 0);
        let masked = self.builder.ins().band_imm(value, mask);
        self.builder.ins().icmp_imm(IntCC::NotEqual, masked, 0)
    }

    /// Walks the `{ magic: u32, size: u32 }` headed context records looking for the one holding
    /// the exception syndrome. Accesses are treated as reads if it cannot be found.
    fn emit_esr_walk(&mut self, context: Value) -> Value {
        let head = self.builder.create_block();
        let inspect = self.builder.create_block();
        let check_magic = self.builder.create_block();
        let advance = self.builder.create_block();
        let found = self.builder.create_block();
        let done = self.builder.create_block();

        let is_write = self.stack_slot(1);
        let cursor = self.stack_slot(8);

        let zero = self.builder.ins().iconst(I8, 0);
        self.builder.ins().stack_store(zero, is_write, 0);
        let records = self.offset_by_config(context, config::STRUCT_WRITE_OFFSET);
        self.builder.ins().stack_store(records, cursor, 0);
        let limit = self.builder.ins().iadd_imm(records, ESR_SEARCH_LIMIT);
        self.builder.ins().jump(head, &[]);

        self.builder.switch_to_block(head);
        let current = self.builder.ins().stack_load(self.ptr_ty, cursor, 0);
        let in_bounds = self.builder.ins().icmp(IntCC::UnsignedLessThan, current, limit);
        self.builder.ins().brif(in_bounds, inspect, &[], done, &[]);

        self.builder.switch_to_block(inspect);
        let magic = self
            .builder
            .ins()
            .load(I32, MemFlags::trusted(), current, 0);
        let size = self
            .builder
            .ins()
            .load(I32, MemFlags::trusted(), current, 4);
        let magic_zero = self.builder.ins().icmp_imm(IntCC::Equal, magic, 0);
        let size_zero = self.builder.ins().icmp_imm(IntCC::Equal, size, 0);
        let terminator = self.builder.ins().bor(magic_zero, size_zero);
        self.builder.ins().brif(terminator, done, &[], check_magic, &[]);

        self.builder.switch_to_block(check_magic);
        let esr_magic = self.builder.ins().iconst(I32, ESR_MAGIC);
        let is_esr = self.builder.ins().icmp(IntCC::Equal, magic, esr_magic);
        self.builder.ins().brif(is_esr, found, &[], advance, &[]);

        self.builder.switch_to_block(advance);
        let size = self.builder.ins().uextend(self.ptr_ty, size);
        let next = self.builder.ins().iadd(current, size);
        self.builder.ins().stack_store(next, cursor, 0);
        self.builder.ins().jump(head, &[]);

        self.builder.switch_to_block(found);
        let esr = self
            .builder
            .ins()
            .load(I64, MemFlags::trusted(), current, ESR_VALUE_OFFSET);
        let wnr = self.builder.ins().band_imm(esr, ESR_WNR);
        let flag = self.builder.ins().icmp_imm(IntCC::NotEqual, wnr, 0);
        self.builder.ins().stack_store(flag, is_write, 0);
        self.builder.ins().jump(done, &[]);

        self.builder.switch_to_block(done);
        self.builder.ins().stack_load(I8, is_write, 0)
    }

    fn stack_slot(&mut self, size: u32) -> StackSlot {
        let align_shift = u8::try_from(size.trailing_zeros()).unwrap_or(0);
        self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            align_shift,
        ))
    }

    /// Asks the partial unmap state whether the fault should be retried.
    fn emit_retry(&mut self, resume: Block, fallthrough: Block) {
        let state = core::ptr::from_ref(self.params.partial_unmap) as i64;
        let state = self.builder.ins().iconst(self.ptr_ty, state);
        let retry = self.function_ptr(retry_from_access_violation as usize);

        let sig = self.builder.import_signature(self.signatures.retry.clone());
        let call = self.builder.ins().call_indirect(sig, retry, &[state]);
        let retry = self.builder.inst_results(call)[0];
        self.builder.ins().brif(retry, resume, &[], fallthrough, &[]);
    }

    /// Hands the fault to the previously installed signal handler.
    fn emit_chain(&mut self, signal: Value, info: Value, context: Value) {
        let has_previous = self.builder.create_block();
        let no_previous = self.builder.create_block();
        let three_args = self.builder.create_block();
        let one_arg = self.builder.create_block();

        let config_base = self.config_ptr();
        let previous = self.builder.ins().load(
            self.ptr_ty,
            MemFlags::trusted(),
            config_base,
            config::PREVIOUS_HANDLER,
        );
        self.builder
            .ins()
            .brif(previous, has_previous, &[], no_previous, &[]);

        self.builder.switch_to_block(no_previous);
        self.builder.set_cold_block(no_previous);
        let abort = self.function_ptr(unhandled_fault as usize);
        let sig = self.builder.import_signature(self.signatures.abort.clone());
        self.builder.ins().call_indirect(sig, abort, &[signal]);
        self.builder.ins().return_(&[]);

        self.builder.switch_to_block(has_previous);
        let takes_info = self.builder.ins().load(
            I32,
            MemFlags::trusted(),
            config_base,
            config::PREVIOUS_HANDLER_TAKES_INFO,
        );
        self.builder
            .ins()
            .brif(takes_info, three_args, &[], one_arg, &[]);

        self.builder.switch_to_block(three_args);
        let sig = self
            .builder
            .import_signature(self.signatures.previous_three_args.clone());
        self.builder
            .ins()
            .call_indirect(sig, previous, &[signal, info, context]);
        self.builder.ins().return_(&[]);

        self.builder.switch_to_block(one_arg);
        let sig = self
            .builder
            .import_signature(self.signatures.previous_one_arg.clone());
        self.builder.ins().call_indirect(sig, previous, &[signal]);
        self.builder.ins().return_(&[]);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use code_cache::{JitCache, JitCacheConfig};
    use parking_lot::Mutex;

    use super::*;
    use crate::layout;
    use crate::partial_unmap::{PartialUnmapConfig, PartialUnmapState};

    const PAGE_SIZE: u64 = 0x1000;
    const RANGE_START: u64 = 0x7000_0000_0000;
    const RANGE_END: u64 = RANGE_START + 16 * PAGE_SIZE;

    type SignalHandler = unsafe extern "C" fn(i32, *mut u8, *mut u8);
    type ExceptionHandler = unsafe extern "C" fn(*mut u8) -> i32;

    // the callbacks and previous handlers report through statics
    static SERIAL: Mutex<()> = Mutex::new(());
    static CALLBACK_CALLS: AtomicUsize = AtomicUsize::new(0);
    static CALLBACK_OFFSET: AtomicU64 = AtomicU64::new(0);
    static CALLBACK_PAGE_SIZE: AtomicU64 = AtomicU64::new(0);
    static CALLBACK_WRITE: AtomicBool = AtomicBool::new(false);
    static CALLBACK_RESULT: AtomicBool = AtomicBool::new(true);
    static PREVIOUS_CALLS: AtomicUsize = AtomicUsize::new(0);
    static PREVIOUS_SIGNAL: AtomicUsize = AtomicUsize::new(0);
    static PREVIOUS_CONTEXT: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn record_access(offset: u64, page_size: u64, is_write: bool, _: u32) -> bool {
        CALLBACK_CALLS.fetch_add(1, Ordering::SeqCst);
        CALLBACK_OFFSET.store(offset, Ordering::SeqCst);
        CALLBACK_PAGE_SIZE.store(page_size, Ordering::SeqCst);
        CALLBACK_WRITE.store(is_write, Ordering::SeqCst);
        CALLBACK_RESULT.load(Ordering::SeqCst)
    }

    extern "C" fn previous_three_args(signal: i32, _info: *mut u8, context: *mut u8) {
        PREVIOUS_CALLS.fetch_add(1, Ordering::SeqCst);
        PREVIOUS_SIGNAL.store(signal.cast_unsigned() as usize, Ordering::SeqCst);
        PREVIOUS_CONTEXT.store(context as usize, Ordering::SeqCst);
    }

    extern "C" fn previous_one_arg(signal: i32) {
        PREVIOUS_CALLS.fetch_add(1, Ordering::SeqCst);
        PREVIOUS_SIGNAL.store(signal.cast_unsigned() as usize, Ordering::SeqCst);
    }

    fn reset() {
        for counter in [
            &CALLBACK_CALLS,
            &PREVIOUS_CALLS,
            &PREVIOUS_SIGNAL,
            &PREVIOUS_CONTEXT,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        CALLBACK_OFFSET.store(u64::MAX, Ordering::SeqCst);
        CALLBACK_PAGE_SIZE.store(0, Ordering::SeqCst);
        CALLBACK_WRITE.store(false, Ordering::SeqCst);
        CALLBACK_RESULT.store(true, Ordering::SeqCst);
    }

    struct Harness {
        config: &'static FaultConfig,
        state: &'static PartialUnmapState,
        layout: FaultLayout,
        _cache: JitCache,
        handler: *const u8,
    }

    impl Harness {
        fn new(flavor: Flavor, layout: FaultLayout) -> Self {
            let config: &'static FaultConfig = Box::leak(Box::new(FaultConfig::new()));
            let state: &'static PartialUnmapState =
                Box::leak(Box::new(PartialUnmapState::new(PartialUnmapConfig {
                    max_retries: 0,
                    ..PartialUnmapConfig::default()
                })));
            config.set_struct_offsets(layout.address_offset, layout.write_offset);
            assert!(config.add_tracked_region(RANGE_START, RANGE_END, record_access));

            let compiler = Compiler::new_for_host().unwrap();
            let function = build(
                &compiler,
                &TrampolineParams {
                    flavor,
                    layout,
                    config,
                    partial_unmap: state,
                    page_size: PAGE_SIZE,
                },
            )
            .unwrap();

            let cache = JitCache::new(JitCacheConfig::with_capacity(64 * 1024)).unwrap();
            let handler = cache.map_function(function);

            Self {
                config,
                state,
                layout,
                _cache: cache,
                handler,
            }
        }

        /// Raises a synthetic fault through a signal flavored handler.
        fn signal(&self, address: u64, is_write: bool) -> SyntheticFault {
            let mut fault = SyntheticFault::new(&self.layout, address, is_write);
            // Safety: the handler was built with the signal flavor
            let handler: SignalHandler = unsafe { core::mem::transmute(self.handler) };
            // Safety: both buffers are large enough for every offset the layout names
            unsafe { handler(11, fault.info.as_mut_ptr(), fault.context.as_mut_ptr()) };
            fault
        }

        /// Raises a synthetic fault through an exception flavored handler.
        fn exception(&self, code: u32, address: u64, is_write: bool) -> i32 {
            let mut fault = SyntheticFault::new(&self.layout, address, is_write);
            fault.info[..4].copy_from_slice(&code.to_ne_bytes());

            let mut pointers = [fault.info.as_mut_ptr() as usize, fault.context.as_mut_ptr() as usize];
            // Safety: the handler was built with the exception flavor
            let handler: ExceptionHandler = unsafe { core::mem::transmute(self.handler) };
            // Safety: `pointers` mimics EXCEPTION_POINTERS
            unsafe { handler(pointers.as_mut_ptr().cast()) }
        }
    }

    /// Fault info and context buffers laid out the way the OS would for `layout`.
    struct SyntheticFault {
        info: Vec<u8>,
        context: Vec<u8>,
        machine_context: Box<[u8; 64]>,
    }

    impl SyntheticFault {
        fn new(layout: &FaultLayout, address: u64, is_write: bool) -> Self {
            let mut fault = Self {
                info: vec![0; 256],
                context: vec![0; 0x1D0 + 4096],
                machine_context: Box::new([0; 64]),
            };

            let address_offset = usize::try_from(layout.address_offset).unwrap();
            fault.info[address_offset..address_offset + 8].copy_from_slice(&address.to_ne_bytes());

            // the exception flavor reads both from the record
            let on_record = *layout == layout::WINDOWS_X64;

            let write_offset = usize::try_from(layout.write_offset).unwrap();
            match layout.write_flag {
                WriteFlag::Masked { width, mask } => {
                    let value = if is_write { mask } else { 0 };
                    let target = if on_record {
                        &mut fault.info
                    } else {
                        &mut fault.context
                    };
                    put(target, write_offset, width, value);
                }
                WriteFlag::Indirect {
                    pointer_offset,
                    width,
                    mask,
                } => {
                    let value = if is_write { mask } else { 0 };
                    put(&mut fault.machine_context[..], write_offset, width, value);
                    let pointer = fault.machine_context.as_ptr() as u64;
                    let pointer_offset = usize::try_from(pointer_offset).unwrap();
                    fault.context[pointer_offset..pointer_offset + 8]
                        .copy_from_slice(&pointer.to_ne_bytes());
                }
                WriteFlag::EsrRecord => {
                    // an unrelated record first, then the ESR record
                    let records = &mut fault.context[write_offset..];
                    records[0..4].copy_from_slice(&0x4650_8001_u32.to_ne_bytes());
                    records[4..8].copy_from_slice(&16_u32.to_ne_bytes());

                    let esr = &mut records[16..];
                    esr[0..4].copy_from_slice(&0x4553_5201_u32.to_ne_bytes());
                    esr[4..8].copy_from_slice(&16_u32.to_ne_bytes());
                    let value: u64 = if is_write { 0x9200_0040 } else { 0x9200_0000 };
                    esr[8..16].copy_from_slice(&value.to_ne_bytes());
                }
            }

            fault
        }
    }

    fn put(buf: &mut [u8], offset: usize, width: Width, value: i64) {
        match width {
            Width::U32 => buf[offset..offset + 4]
                .copy_from_slice(&u32::try_from(value).unwrap().to_ne_bytes()),
            Width::U64 => buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes()),
        }
    }

    const SIGNAL_LAYOUTS: [FaultLayout; 4] = [
        layout::LINUX_X86_64,
        layout::LINUX_AARCH64,
        layout::APPLE_X86_64,
        layout::APPLE_AARCH64,
    ];

    #[test_log::test]
    fn hit_reports_page_offset_and_access_kind() {
        let _serial = SERIAL.lock();

        for layout in SIGNAL_LAYOUTS {
            let harness = Harness::new(Flavor::Signal, layout);
            harness.config.set_previous_handler(previous_three_args as usize, true);

            for is_write in [true, false] {
                reset();
                harness.signal(RANGE_START + 3 * PAGE_SIZE + 0x123, is_write);

                assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 1, "{layout:?}");
                assert_eq!(CALLBACK_OFFSET.load(Ordering::SeqCst), 3 * PAGE_SIZE);
                assert_eq!(CALLBACK_PAGE_SIZE.load(Ordering::SeqCst), PAGE_SIZE);
                assert_eq!(CALLBACK_WRITE.load(Ordering::SeqCst), is_write, "{layout:?}");
                assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 0);
            }
        }
    }

    #[test_log::test]
    fn range_bounds_are_half_open() {
        let _serial = SERIAL.lock();
        let harness = Harness::new(Flavor::Signal, layout::LINUX_X86_64);
        harness.config.set_previous_handler(previous_one_arg as usize, false);

        reset();
        harness.signal(RANGE_START, false);
        assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(CALLBACK_OFFSET.load(Ordering::SeqCst), 0);

        reset();
        harness.signal(RANGE_END - 1, false);
        assert_eq!(CALLBACK_OFFSET.load(Ordering::SeqCst), 15 * PAGE_SIZE);

        reset();
        harness.signal(RANGE_END, false);
        assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn miss_chains_to_three_argument_handler() {
        let _serial = SERIAL.lock();
        let harness = Harness::new(Flavor::Signal, layout::LINUX_X86_64);
        harness.config.set_previous_handler(previous_three_args as usize, true);

        reset();
        let fault = harness.signal(RANGE_START - 1, true);

        assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(PREVIOUS_SIGNAL.load(Ordering::SeqCst), 11);
        assert_eq!(
            PREVIOUS_CONTEXT.load(Ordering::SeqCst),
            fault.context.as_ptr() as usize
        );
    }

    #[test_log::test]
    fn miss_chains_to_one_argument_handler() {
        let _serial = SERIAL.lock();
        let harness = Harness::new(Flavor::Signal, layout::LINUX_X86_64);
        harness.config.set_previous_handler(previous_one_arg as usize, false);

        reset();
        harness.signal(0x10, false);

        assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(PREVIOUS_SIGNAL.load(Ordering::SeqCst), 11);
        assert_eq!(PREVIOUS_CONTEXT.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn declined_fault_is_chained() {
        let _serial = SERIAL.lock();
        let harness = Harness::new(Flavor::Signal, layout::LINUX_X86_64);
        harness.config.set_previous_handler(previous_one_arg as usize, false);

        reset();
        CALLBACK_RESULT.store(false, Ordering::SeqCst);
        harness.signal(RANGE_START + PAGE_SIZE, true);

        assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn removed_range_is_not_reported() {
        let _serial = SERIAL.lock();
        let harness = Harness::new(Flavor::Signal, layout::LINUX_X86_64);
        harness.config.set_previous_handler(previous_one_arg as usize, false);
        assert!(harness.config.remove_tracked_region(RANGE_START));

        reset();
        harness.signal(RANGE_START, true);

        assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn fault_after_remap_is_retried() {
        let _serial = SERIAL.lock();
        let harness = Harness::new(Flavor::Signal, layout::LINUX_X86_64);
        harness.config.set_previous_handler(previous_one_arg as usize, false);

        drop(harness.state.begin_remap());

        reset();
        harness.signal(0x10, false);
        assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 0);

        // same generation again, no more retries
        harness.signal(0x10, false);
        assert_eq!(PREVIOUS_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn exception_handler_results() {
        let _serial = SERIAL.lock();
        let harness = Harness::new(Flavor::VectoredException, layout::WINDOWS_X64);

        reset();
        let result = harness.exception(0xC000_0005, RANGE_START + 2 * PAGE_SIZE, true);
        assert_eq!(result, -1);
        assert_eq!(CALLBACK_OFFSET.load(Ordering::SeqCst), 2 * PAGE_SIZE);
        assert!(CALLBACK_WRITE.load(Ordering::SeqCst));

        reset();
        assert_eq!(harness.exception(0xC000_0005, RANGE_START, false), -1);
        assert!(!CALLBACK_WRITE.load(Ordering::SeqCst));

        // not an access violation
        reset();
        assert_eq!(harness.exception(0x8000_0003, RANGE_START, false), 0);
        assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 0);

        // outside every range
        reset();
        assert_eq!(harness.exception(0xC000_0005, 0x10, false), 0);
        assert_eq!(CALLBACK_CALLS.load(Ordering::SeqCst), 0);
    }
}
