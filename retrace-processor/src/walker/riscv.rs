//! Stackwalking for RISC-V, shared between the 32-bit and 64-bit variants.

use log::trace;

use retrace_unwind::{MemoryRegion, RegisterValue};

use super::{read_stack_word, recover_caller_by_cfi, scan_for_return_address};
use crate::context::{CpuContext, RawContext};
use crate::frame::{FrameTrust, StackFrame};
use crate::module::CodeModuleList;
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolSupplier, Symbolizer};

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

fn get_caller_by_frame_pointer<C, S>(
    ctx: &C,
    wrap: fn(C) -> RawContext,
    stack: &MemoryRegion<'_>,
    _modules: &CodeModuleList,
    _symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame>
where
    C: CpuContext,
    S: SymbolSupplier,
{
    trace!("unwind: trying frame pointer");

    // The frame record is the pair (saved fp, saved ra) at the frame
    // pointer, and the return address of the callee is in `ra`:
    //
    // pc := ra
    // ra := *(fp + word)
    // fp := *fp
    // sp := fp + 2*word
    //
    // A frame pointer of zero ends the chain.
    let word = C::Register::WIDTH as u64;
    let fp_name = C::FRAME_POINTER?;
    let lr_name = C::LINK_REGISTER?;

    let last_fp = ctx.get_register(fp_name)?.into_u64();
    let last_sp = ctx.get_register(C::STACK_POINTER)?.into_u64();
    let last_ra = ctx.get_register(lr_name)?.into_u64();

    if last_fp >= u64::MAX - word * 2 {
        return None;
    }

    let (caller_fp, caller_pc, caller_sp, caller_ra) = if last_fp == 0 {
        (0, last_ra, last_sp, 0)
    } else {
        (
            read_stack_word::<C>(stack, last_fp)?,
            last_ra,
            last_fp + word * 2,
            read_stack_word::<C>(stack, last_fp + word)?,
        )
    };

    trace!(
        "unwind: frame pointer seems valid -- caller_pc: {:#x}, caller_sp: {:#x}",
        caller_pc,
        caller_sp
    );

    let mut caller = C::default();
    caller.set_register(C::INSTRUCTION_POINTER, C::Register::from_u64(caller_pc));
    caller.set_register(C::STACK_POINTER, C::Register::from_u64(caller_sp));
    caller.set_register(fp_name, C::Register::from_u64(caller_fp));
    caller.set_register(lr_name, C::Register::from_u64(caller_ra));

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
        .or_else(|| get_caller_by_frame_pointer(ctx, wrap, stack, modules, symbolizer))
        .or_else(|| {
            scan_allowed
                .then(|| {
                    get_caller_by_scan(ctx, wrap, callee, stack, modules, symbolizer, options)
                })
                .flatten()
        })
}
