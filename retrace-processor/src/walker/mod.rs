//! Per-architecture stack unwinding.
//!
//! Each CPU family has a walker submodule implementing the same two
//! operations: producing the innermost frame from a raw register context,
//! and recovering a caller frame from the current innermost frame. Caller
//! recovery applies a fixed strategy order:
//!
//! 1. **CFI**: evaluate the rule programs covering the frame's instruction
//!    (trust: [`FrameTrust::Cfi`]).
//! 2. **Frame pointer**: follow the family's frame-chaining convention,
//!    where one exists (trust: [`FrameTrust::FramePointer`]).
//! 3. **Stack scan**: if allowed, scan a bounded window of stack memory
//!    above the stack pointer for a plausible return address (trust:
//!    [`FrameTrust::Scan`]).
//!
//! The shared walk loop in [`walk_stack`] drives the strategies and
//! enforces the termination rules: a null or out-of-module instruction
//! pointer, a stack pointer that fails to move strictly upwards (leaf
//! frames excepted), or the configured frame cap all end the walk.

use std::collections::BTreeMap;

use log::trace;

use retrace_common::CpuFamily;
use retrace_unwind::evaluator::{Constant, Evaluator, Identifier, Variable};
use retrace_unwind::{MemoryRegion, RegisterValue, RuntimeEndian};

use crate::context::{CpuContext, RawContext};
use crate::frame::{CallStack, CallStackInfo, FrameTrust, StackFrame};
use crate::module::CodeModuleList;
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolSupplier, Symbolizer};

mod amd64;
mod arm;
mod arm64;
mod mips;
mod ppc;
mod riscv;
mod x86;

/// The endianness used to read a family's stack memory.
///
/// Dumps do not carry an explicit endianness marker; it follows from the
/// CPU family. Of the supported families only PowerPC is big-endian.
pub(crate) fn endian_for(family: CpuFamily) -> RuntimeEndian {
    match family {
        CpuFamily::Ppc32 | CpuFamily::Ppc64 => RuntimeEndian::Big,
        _ => RuntimeEndian::Little,
    }
}

/// Walks the stack of one thread, innermost frame first.
///
/// A thread without a usable context produces an empty stack marked
/// [`CallStackInfo::MissingContext`]. A thread without stack memory
/// produces exactly the context frame.
#[allow(clippy::too_many_arguments)]
pub fn walk_stack<S: SymbolSupplier>(
    thread_id: u32,
    thread_name: Option<String>,
    context: Option<&RawContext>,
    stack_memory: Option<&MemoryRegion<'_>>,
    modules: &CodeModuleList,
    unloaded_modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
) -> CallStack {
    let context = match context.filter(|context| context.is_well_formed()) {
        Some(context) => context,
        None => {
            trace!("thread {:#x} has no usable context", thread_id);
            let mut stack = CallStack::with_info(thread_id, CallStackInfo::MissingContext);
            stack.thread_name = thread_name;
            return stack;
        }
    };

    trace!(
        "unwind: starting walk of thread {:#x} at {:#x}",
        thread_id,
        context.instruction_pointer()
    );

    let mut frames: Vec<StackFrame> = Vec::new();
    let mut maybe_frame = Some(StackFrame::from_context(
        context.clone(),
        FrameTrust::Context,
    ));

    while let Some(mut frame) = maybe_frame {
        symbolizer.fill_source_line_info(&mut frame, modules);
        match frame.function_name.as_deref() {
            Some(name) => trace!("unwind: {:#x} in {}", frame.instruction, name),
            None => trace!("unwind: {:#x}", frame.instruction),
        }
        frames.push(frame);

        if symbolizer.was_interrupted() || frames.len() >= options.frame_limit {
            break;
        }

        let callee = frames.last().unwrap();
        let grand_callee = frames.len().checked_sub(2).and_then(|i| frames.get(i));
        maybe_frame = get_caller_frame(
            callee,
            grand_callee,
            stack_memory,
            modules,
            unloaded_modules,
            symbolizer,
            options,
            options.stack_scan_allowed,
        );
    }

    trace!(
        "unwind: finished walk of thread {:#x} with {} frames",
        thread_id,
        frames.len()
    );

    CallStack {
        thread_id,
        thread_name,
        frames,
        info: CallStackInfo::Ok,
    }
}

/// Recovers the caller of the given frame, or `None` at the bottom of the
/// stack.
///
/// Dispatches to the architecture of the callee's context, then applies the
/// common termination rules to whatever the strategies produced.
#[allow(clippy::too_many_arguments)]
pub fn get_caller_frame<S: SymbolSupplier>(
    callee: &StackFrame,
    grand_callee: Option<&StackFrame>,
    stack_memory: Option<&MemoryRegion<'_>>,
    modules: &CodeModuleList,
    unloaded_modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
    scan_allowed: bool,
) -> Option<StackFrame> {
    let stack = stack_memory?;

    let frame = match &callee.context {
        RawContext::X86(ctx) => {
            x86::get_caller_frame(ctx, callee, stack, modules, symbolizer, options, scan_allowed)
        }
        RawContext::Amd64(ctx) => {
            amd64::get_caller_frame(ctx, callee, stack, modules, symbolizer, options, scan_allowed)
        }
        RawContext::Arm(ctx) => {
            arm::get_caller_frame(ctx, callee, stack, modules, symbolizer, options, scan_allowed)
        }
        RawContext::Arm64(ctx) => arm64::get_caller_frame(
            ctx,
            callee,
            grand_callee,
            stack,
            modules,
            symbolizer,
            options,
            scan_allowed,
        ),
        RawContext::Mips(ctx) => mips::get_caller_frame(
            ctx,
            RawContext::Mips,
            callee,
            stack,
            modules,
            symbolizer,
            options,
            scan_allowed,
        ),
        RawContext::Mips64(ctx) => mips::get_caller_frame(
            ctx,
            RawContext::Mips64,
            callee,
            stack,
            modules,
            symbolizer,
            options,
            scan_allowed,
        ),
        RawContext::Ppc(ctx) => ppc::get_caller_frame(
            ctx,
            RawContext::Ppc,
            callee,
            stack,
            modules,
            symbolizer,
            options,
            scan_allowed,
        ),
        RawContext::Ppc64(ctx) => ppc::get_caller_frame(
            ctx,
            RawContext::Ppc64,
            callee,
            stack,
            modules,
            symbolizer,
            options,
            scan_allowed,
        ),
        RawContext::Riscv32(ctx) => riscv::get_caller_frame(
            ctx,
            RawContext::Riscv32,
            callee,
            stack,
            modules,
            symbolizer,
            options,
            scan_allowed,
        ),
        RawContext::Riscv64(ctx) => riscv::get_caller_frame(
            ctx,
            RawContext::Riscv64,
            callee,
            stack,
            modules,
            symbolizer,
            options,
            scan_allowed,
        ),
    }?;

    // An instruction pointer in the first page is as good as null; treat it
    // as the end of the stack.
    let ip = frame.context.instruction_pointer();
    if ip < 0x1000 {
        trace!("unwind: instruction pointer is nullish, ending walk");
        return None;
    }

    // A return address that no known module covers cannot be symbolicated
    // and is most likely garbage. The probe is the call-site-adjusted
    // address, so a call at the very end of a module still passes.
    let probe = frame.lookup_address();
    if modules.module_at_address(probe).is_none()
        && unloaded_modules.module_at_address(probe).is_none()
    {
        trace!("unwind: {:#x} is outside all modules, ending walk", ip);
        return None;
    }

    // The stack must move strictly upwards, except that a leaf function may
    // not have touched the stack at all (the return address lives in the
    // link register), which only ever applies to the context frame's caller.
    let sp = frame.context.stack_pointer();
    let last_sp = callee.context.stack_pointer();
    if sp <= last_sp {
        let is_leaf = callee.trust == FrameTrust::Context && sp == last_sp;
        if !is_leaf {
            trace!("unwind: stack pointer went backwards, ending walk");
            return None;
        }
    }

    Some(frame)
}

/// Recovers a caller context by evaluating the CFI rules covering the
/// callee's instruction.
///
/// The caller context starts out with the callee's preserved registers
/// forwarded; the rule results overwrite them. Fails if no CFI covers the
/// instruction, if evaluation fails, or if no return address can be
/// determined.
pub(crate) fn recover_caller_by_cfi<C, S>(
    ctx: &C,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<C>
where
    C: CpuContext,
    S: SymbolSupplier,
{
    trace!("unwind: trying cfi");

    ctx.get_register(C::INSTRUCTION_POINTER)?;
    ctx.get_register(C::STACK_POINTER)?;

    let lookup_address = callee.lookup_address();
    let module = modules.module_at_address(lookup_address)?;
    let rules = symbolizer.cfi_rules_for_address(module, lookup_address)?;

    let endian = endian_for(C::cpu_family());
    let mut variables = BTreeMap::new();
    let mut constants = BTreeMap::new();
    for (name, value) in ctx.valid_registers() {
        if let Ok(variable) = name.parse::<Variable>() {
            variables.insert(variable, value);
        } else if let Ok(constant) = name.parse::<Constant>() {
            constants.insert(constant, value);
        }
    }

    let mut evaluator = Evaluator::new(endian)
        .memory(*stack)
        .variables(variables)
        .constants(constants);

    for rule_string in &rules {
        if evaluator.add_cfi_rules_string(rule_string).is_err() {
            trace!("unwind: malformed cfi rules: {}", rule_string);
            return None;
        }
    }

    let caller_registers = match evaluator.evaluate_cfi_rules() {
        Ok(registers) => registers,
        Err(error) => {
            trace!("unwind: cfi evaluation failed: {}", error);
            return None;
        }
    };

    // Forward the preserved registers, then let the rule results overwrite
    // them. The stack pointer and instruction pointer come from the
    // pseudo-registers.
    let mut caller = ctx.clone();
    caller.set_valid_mask(0);
    for &name in C::CALLEE_SAVED {
        if let Some(value) = ctx.get_register(name) {
            caller.set_register(name, value);
        }
    }

    for (identifier, value) in &caller_registers {
        match identifier {
            Identifier::Const(constant) if *constant == Constant::cfa() => {
                caller.set_register(C::STACK_POINTER, *value);
            }
            Identifier::Const(constant) if *constant == Constant::ra() => {
                caller.set_register(C::INSTRUCTION_POINTER, *value);
            }
            Identifier::Var(variable) => {
                caller.set_register(variable.name(), *value);
            }
            Identifier::Const(constant) => {
                caller.set_register(constant.name(), *value);
            }
        }
    }

    if !caller.is_valid(C::INSTRUCTION_POINTER) {
        // Neither an explicit .ra rule nor a direct rule for the
        // instruction pointer: fall back to the recovered conventional
        // link register. Register-poor conventions (x86) have no such
        // fallback; their rule sets must recover the return address.
        let link = C::LINK_REGISTER?;
        let value = caller.get_register(link)?;
        caller.set_register(C::INSTRUCTION_POINTER, value);
    }

    if !caller.is_valid(C::STACK_POINTER) {
        return None;
    }

    trace!(
        "unwind: cfi recovered caller -- pc: {:#x}, sp: {:#x}",
        caller.instruction_pointer(),
        caller.stack_pointer()
    );

    Some(caller)
}

/// Reads one pointer-sized word of stack memory.
pub(crate) fn read_stack_word<C: CpuContext>(
    stack: &MemoryRegion<'_>,
    address: u64,
) -> Option<u64> {
    stack
        .get::<C::Register, _>(address, endian_for(C::cpu_family()))
        .map(RegisterValue::into_u64)
}

/// Tests whether a word could be a return address.
///
/// The word must point into a loaded module and, where symbols for that
/// module are available, into a known function or public symbol. The probe
/// is moved one byte backwards so that a return address just past the end
/// of a function that calls a diverging callee still validates.
pub(crate) fn instruction_seems_valid<S: SymbolSupplier>(
    instruction: u64,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> bool {
    if instruction < 0x1000 {
        return false;
    }

    let probe = instruction.saturating_sub(1);
    match modules.module_at_address(probe) {
        Some(module) => symbolizer.symbols_cover_address(module, probe),
        None => false,
    }
}

/// Scans stack memory above the callee's stack pointer for a plausible
/// return address.
///
/// The scan is word-aligned and bounded: the innermost frame's scan window
/// is [`ProcessorOptions::context_scan_words`] words, every later frame's
/// is [`ProcessorOptions::scan_words`]. Returns the address the candidate
/// was found at and the candidate itself.
pub(crate) fn scan_for_return_address<C, S>(
    ctx: &C,
    callee_trust: FrameTrust,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
) -> Option<(u64, u64)>
where
    C: CpuContext,
    S: SymbolSupplier,
{
    trace!("unwind: trying scan");

    let word = C::Register::WIDTH as u64;
    let last_sp = ctx.get_register(C::STACK_POINTER)?.into_u64();
    let start = last_sp.checked_add(word - 1)? & !(word - 1);

    let words = if callee_trust == FrameTrust::Context {
        options.context_scan_words
    } else {
        options.scan_words
    };

    for i in 0..words as u64 {
        let address_of_ip = start.checked_add(i * word)?;
        let candidate = read_stack_word::<C>(stack, address_of_ip)?;
        if instruction_seems_valid(candidate, modules, symbolizer) {
            trace!(
                "unwind: scan found candidate {:#x} at {:#x}",
                candidate,
                address_of_ip
            );
            return Some((address_of_ip, candidate));
        }
    }

    None
}

#[cfg(test)]
mod tests;
