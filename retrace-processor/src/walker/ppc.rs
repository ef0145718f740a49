//! Stackwalking for PowerPC, shared between the 32-bit and 64-bit variants.
//!
//! PowerPC frames form a back chain: the word at the stack pointer is the
//! caller's stack pointer, and the caller's return address is saved at a
//! fixed offset into the caller's frame.

use log::trace;

use retrace_unwind::{MemoryRegion, RegisterValue};

use super::{instruction_seems_valid, read_stack_word, recover_caller_by_cfi, scan_for_return_address};
use crate::context::{CpuContext, RawContext};
use crate::frame::{FrameTrust, StackFrame};
use crate::module::CodeModuleList;
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolSupplier, Symbolizer};

/// The offset of the saved link register in a frame, from the frame's base.
///
/// The 32-bit ABI reserves two words (back chain and condition register)
/// before the saved LR; the 64-bit ELF ABI reserves a doubleword pair.
fn saved_lr_offset<C: CpuContext>() -> u64 {
    2 * C::Register::WIDTH as u64
}

fn get_caller_by_cfi<C, S>(
    ctx: &C,
    wrap: fn(C) -> RawContext,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame>
where
    C: CpuContext,
    S: SymbolSupplier,
{
    let caller = recover_caller_by_cfi(ctx, callee, stack, modules, symbolizer)?;
    Some(StackFrame::from_context(wrap(caller), FrameTrust::Cfi))
}

fn get_caller_by_back_chain<C, S>(
    ctx: &C,
    wrap: fn(C) -> RawContext,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame>
where
    C: CpuContext,
    S: SymbolSupplier,
{
    trace!("unwind: trying back chain");

    // caller_sp = *sp
    // caller_pc = *(caller_sp + saved_lr_offset)
    let last_sp = ctx.get_register(C::STACK_POINTER)?.into_u64();

    let caller_sp = read_stack_word::<C>(stack, last_sp)?;
    if caller_sp <= last_sp {
        return None;
    }

    let caller_pc = read_stack_word::<C>(stack, caller_sp.checked_add(saved_lr_offset::<C>())?)?;
    if !instruction_seems_valid(caller_pc, modules, symbolizer) {
        return None;
    }

    trace!(
        "unwind: back chain seems valid -- caller_pc: {:#x}, caller_sp: {:#x}",
        caller_pc,
        caller_sp
    );

    let mut caller = C::default();
    caller.set_register(C::INSTRUCTION_POINTER, C::Register::from_u64(caller_pc));
    caller.set_register(C::STACK_POINTER, C::Register::from_u64(caller_sp));

    Some(StackFrame::from_context(
        wrap(caller),
        FrameTrust::FramePointer,
    ))
}

fn get_caller_by_scan<C, S>(
    ctx: &C,
    wrap: fn(C) -> RawContext,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
) -> Option<StackFrame>
where
    C: CpuContext,
    S: SymbolSupplier,
{
    let (address_of_pc, caller_pc) =
        scan_for_return_address(ctx, callee.trust, stack, modules, symbolizer, options)?;
    let caller_sp = address_of_pc + C::Register::WIDTH as u64;

    let mut caller = C::default();
    caller.set_register(C::INSTRUCTION_POINTER, C::Register::from_u64(caller_pc));
    caller.set_register(C::STACK_POINTER, C::Register::from_u64(caller_sp));

    Some(StackFrame::from_context(wrap(caller), FrameTrust::Scan))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn get_caller_frame<C, S>(
    ctx: &C,
    wrap: fn(C) -> RawContext,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
    scan_allowed: bool,
) -> Option<StackFrame>
where
    C: CpuContext,
    S: SymbolSupplier,
{
    get_caller_by_cfi(ctx, wrap, callee, stack, modules, symbolizer)
        .or_else(|| get_caller_by_back_chain(ctx, wrap, stack, modules, symbolizer))
        .or_else(|| {
            scan_allowed
                .then(|| {
                    get_caller_by_scan(ctx, wrap, callee, stack, modules, symbolizer, options)
                })
                .flatten()
        })
}
