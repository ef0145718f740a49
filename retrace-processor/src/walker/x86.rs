//! Stackwalking for 32-bit x86.
//!
//! The x86 and x86-64 walkers share their overall shape but are kept
//! separate so that each can match its ABI's quirks without the other
//! getting in the way.

use log::trace;

use retrace_unwind::MemoryRegion;

use super::{
    instruction_seems_valid, read_stack_word, recover_caller_by_cfi, scan_for_return_address,
};
use crate::context::{CpuContext, RawContext, X86Context};
use crate::frame::{FrameTrust, StackFrame};
use crate::module::CodeModuleList;
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolSupplier, Symbolizer};

const POINTER_WIDTH: u64 = 4;

const INSTRUCTION_POINTER: &str = "$eip";
const STACK_POINTER: &str = "$esp";
const FRAME_POINTER: &str = "$ebp";

/// An extremely generous upper bound for the size of a single stack frame,
/// used to reject garbage frame pointers during scanning.
const MAX_REASONABLE_GAP_BETWEEN_FRAMES: u64 = 128 * 1024;

fn get_caller_by_cfi<S: SymbolSupplier>(
    ctx: &X86Context,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    let caller = recover_caller_by_cfi(ctx, callee, stack, modules, symbolizer)?;
    Some(StackFrame::from_context(
        RawContext::X86(caller),
        FrameTrust::Cfi,
    ))
}

fn get_caller_by_frame_pointer<S: SymbolSupplier>(
    ctx: &X86Context,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");

    // Assume the standard %ebp-using calling convention: the caller PUSHes
    // the return address with CALL, the callee PUSHes the caller's %ebp and
    // copies %esp into %ebp. Then:
    //
    // %eip_new = *(%ebp_old + 4)
    // %esp_new = %ebp_old + 8
    // %ebp_new = *(%ebp_old)
    let last_bp = ctx.get_register(FRAME_POINTER)?.into();
    let last_sp: u64 = ctx.get_register(STACK_POINTER)?.into();

    let caller_ip = read_stack_word::<X86Context>(stack, last_bp + POINTER_WIDTH)?;
    let caller_bp = read_stack_word::<X86Context>(stack, last_bp)?;
    let caller_sp = last_bp + POINTER_WIDTH * 2;

    // Assuming coherent frame pointers, the recovered pointers must be
    // well-ordered and the new frame pointer must still be inside stack
    // memory.
    if caller_sp <= last_bp || caller_bp < caller_sp {
        return None;
    }
    read_stack_word::<X86Context>(stack, caller_bp)?;

    if !instruction_seems_valid(caller_ip, modules, symbolizer) {
        return None;
    }
    if caller_sp <= last_sp {
        return None;
    }

    trace!(
        "unwind: frame pointer seems valid -- caller_eip: {:#010x}, caller_esp: {:#010x}",
        caller_ip,
        caller_sp
    );

    let mut caller = X86Context::default();
    caller.set_register(INSTRUCTION_POINTER, caller_ip as u32);
    caller.set_register(STACK_POINTER, caller_sp as u32);
    caller.set_register(FRAME_POINTER, caller_bp as u32);

    Some(StackFrame::from_context(
        RawContext::X86(caller),
        FrameTrust::FramePointer,
    ))
}

fn get_caller_by_scan<S: SymbolSupplier>(
    ctx: &X86Context,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
) -> Option<StackFrame> {
    let (address_of_ip, caller_ip) =
        scan_for_return_address(ctx, callee.trust, stack, modules, symbolizer, options)?;
    let caller_sp = address_of_ip + POINTER_WIDTH;

    // Try to restore %ebp as well. Two cases are recognized:
    //
    // 1. The callee has the standard prologue; the caller's %ebp was pushed
    //    immediately below the return address.
    //
    // 2. The callee never touched %ebp; it still holds the caller's value.
    let mut caller_bp = None;
    if let Some(last_bp) = ctx.get_register(FRAME_POINTER) {
        let last_bp = u64::from(last_bp);
        let address_of_bp = address_of_ip.saturating_sub(POINTER_WIDTH);

        if last_bp == address_of_bp {
            if let Some(bp) = read_stack_word::<X86Context>(stack, address_of_bp) {
                if bp > address_of_ip
                    && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES
                    && read_stack_word::<X86Context>(stack, bp).is_some()
                {
                    caller_bp = Some(bp);
                }
            }
        } else if last_bp >= caller_sp && read_stack_word::<X86Context>(stack, last_bp).is_some() {
            caller_bp = Some(last_bp);
        }
    }

    let mut caller = X86Context::default();
    caller.set_register(INSTRUCTION_POINTER, caller_ip as u32);
    caller.set_register(STACK_POINTER, caller_sp as u32);
    if let Some(bp) = caller_bp {
        caller.set_register(FRAME_POINTER, bp as u32);
    }

    Some(StackFrame::from_context(
        RawContext::X86(caller),
        FrameTrust::Scan,
    ))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn get_caller_frame<S: SymbolSupplier>(
    ctx: &X86Context,
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
