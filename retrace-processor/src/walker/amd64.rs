//! Stackwalking for x86-64.

use log::trace;

use retrace_unwind::MemoryRegion;

use super::{
    instruction_seems_valid, read_stack_word, recover_caller_by_cfi, scan_for_return_address,
};
use crate::context::{Amd64Context, CpuContext, RawContext};
use crate::frame::{FrameTrust, StackFrame};
use crate::module::CodeModuleList;
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolSupplier, Symbolizer};

const POINTER_WIDTH: u64 = 8;

const INSTRUCTION_POINTER: &str = "$rip";
const STACK_POINTER: &str = "$rsp";
const FRAME_POINTER: &str = "$rbp";

/// An extremely generous upper bound for the size of a single stack frame,
/// used to reject garbage frame pointers during scanning.
const MAX_REASONABLE_GAP_BETWEEN_FRAMES: u64 = 128 * 1024;

fn get_caller_by_cfi<S: SymbolSupplier>(
    ctx: &Amd64Context,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    let caller = recover_caller_by_cfi(ctx, callee, stack, modules, symbolizer)?;
    Some(StackFrame::from_context(
        RawContext::Amd64(caller),
        FrameTrust::Cfi,
    ))
}

fn get_caller_by_frame_pointer<S: SymbolSupplier>(
    ctx: &Amd64Context,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");

    // The standard %rbp-using convention mirrors the 32-bit one with 8-byte
    // slots:
    //
    // %rip_new = *(%rbp_old + 8)
    // %rsp_new = %rbp_old + 16
    // %rbp_new = *(%rbp_old)
    let last_bp = ctx.get_register(FRAME_POINTER)?;
    let last_sp = ctx.get_register(STACK_POINTER)?;

    if last_bp >= u64::MAX - POINTER_WIDTH * 2 {
        return None;
    }

    let caller_ip = read_stack_word::<Amd64Context>(stack, last_bp + POINTER_WIDTH)?;
    let caller_bp = read_stack_word::<Amd64Context>(stack, last_bp)?;
    let caller_sp = last_bp + POINTER_WIDTH * 2;

    // Assuming coherent frame pointers, the recovered pointers must be
    // well-ordered and the new frame pointer must still be inside stack
    // memory.
    if caller_sp <= last_bp || caller_bp < caller_sp {
        return None;
    }
    read_stack_word::<Amd64Context>(stack, caller_bp)?;

    if !instruction_seems_valid(caller_ip, modules, symbolizer) {
        return None;
    }
    if caller_sp <= last_sp {
        return None;
    }

    trace!(
        "unwind: frame pointer seems valid -- caller_rip: {:#018x}, caller_rsp: {:#018x}",
        caller_ip,
        caller_sp
    );

    let mut caller = Amd64Context::default();
    caller.set_register(INSTRUCTION_POINTER, caller_ip);
    caller.set_register(STACK_POINTER, caller_sp);
    caller.set_register(FRAME_POINTER, caller_bp);

    Some(StackFrame::from_context(
        RawContext::Amd64(caller),
        FrameTrust::FramePointer,
    ))
}

fn get_caller_by_scan<S: SymbolSupplier>(
    ctx: &Amd64Context,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
) -> Option<StackFrame> {
    let (address_of_ip, caller_ip) =
        scan_for_return_address(ctx, callee.trust, stack, modules, symbolizer, options)?;
    let caller_sp = address_of_ip + POINTER_WIDTH;

    // Try to restore %rbp as well, analogous to the x86 scanner: either the
    // callee pushed it right below the return address, or it preserved the
    // caller's value untouched.
    let mut caller_bp = None;
    if let Some(last_bp) = ctx.get_register(FRAME_POINTER) {
        let address_of_bp = address_of_ip.saturating_sub(POINTER_WIDTH);

        if last_bp == address_of_bp {
            if let Some(bp) = read_stack_word::<Amd64Context>(stack, address_of_bp) {
                if bp > address_of_ip
                    && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES
                    && read_stack_word::<Amd64Context>(stack, bp).is_some()
                {
                    caller_bp = Some(bp);
                }
            }
        } else if last_bp >= caller_sp
            && read_stack_word::<Amd64Context>(stack, last_bp).is_some()
        {
            caller_bp = Some(last_bp);
        }
    }

    let mut caller = Amd64Context::default();
    caller.set_register(INSTRUCTION_POINTER, caller_ip);
    caller.set_register(STACK_POINTER, caller_sp);
    if let Some(bp) = caller_bp {
        caller.set_register(FRAME_POINTER, bp);
    }

    Some(StackFrame::from_context(
        RawContext::Amd64(caller),
        FrameTrust::Scan,
    ))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn get_caller_frame<S: SymbolSupplier>(
    ctx: &Amd64Context,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
    scan_allowed: bool,
) -> Option<StackFrame> {
    get_caller_by_cfi(ctx, callee, stack, modules, symbolizer)
        .or_else(|| get_caller_by_frame_pointer(ctx, stack, modules, symbolizer))
        .or_else(|| {
            scan_allowed
                .then(|| get_caller_by_scan(ctx, callee, stack, modules, symbolizer, options))
                .flatten()
        })
}
