//! Stackwalking for MIPS, shared between the 32-bit and 64-bit variants.
//!
//! MIPS ABIs do not mandate a frame record that could be chased without
//! unwind information, so recovery falls from CFI straight through to stack
//! scanning.

use retrace_unwind::{MemoryRegion, RegisterValue};

use super::{recover_caller_by_cfi, scan_for_return_address};
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
    get_caller_by_cfi(ctx, wrap, callee, stack, modules, symbolizer).or_else(|| {
        scan_allowed
            .then(|| {
                get_caller_by_scan(ctx, wrap, callee, stack, modules, symbolizer, options)
            })
            .flatten()
    })
}
