//! Stackwalking for 64-bit ARM.

use log::trace;

use retrace_unwind::MemoryRegion;

use super::{read_stack_word, recover_caller_by_cfi, scan_for_return_address};
use crate::context::{Arm64Context, CpuContext, RawContext};
use crate::frame::{FrameTrust, StackFrame};
use crate::module::CodeModuleList;
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolSupplier, Symbolizer};

const POINTER_WIDTH: u64 = 8;

const PROGRAM_COUNTER: &str = "pc";
const STACK_POINTER: &str = "sp";
const FRAME_POINTER: &str = "x29";
const LINK_REGISTER: &str = "x30";

/// Strips pointer authentication codes from an address.
///
/// Pointer authentication signs `lr` and `fp` values spilled to the stack
/// with a MAC in the unused high bits. Rather than recovering keys, clear
/// every bit above the valid-address mask derived from the module ranges.
/// The stripped value is only used if it actually lands in a known module,
/// so unsigned pointers into unknown mappings pass through untouched.
fn ptr_auth_strip(modules: &CodeModuleList, ptr: u64) -> u64 {
    let stripped = ptr & modules.address_range_mask();
    if modules.module_at_address(stripped).is_some() {
        stripped
    } else {
        ptr
    }
}

fn get_caller_by_cfi<S: SymbolSupplier>(
    ctx: &Arm64Context,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    let mut caller = recover_caller_by_cfi(ctx, callee, stack, modules, symbolizer)?;

    // The return address was spilled to the stack and may carry an
    // authentication code in its high bits.
    let pc = ptr_auth_strip(modules, caller.instruction_pointer());
    caller.set_register(PROGRAM_COUNTER, pc);
    if let Some(lr) = caller.get_register(LINK_REGISTER) {
        caller.set_register(LINK_REGISTER, ptr_auth_strip(modules, lr));
    }

    Some(StackFrame::from_context(
        RawContext::Arm64(caller),
        FrameTrust::Cfi,
    ))
}

/// Restores the callee's link register through the grand-callee's frame
/// record.
///
/// Frame-pointer unwinding needs the callee's `lr` (it is the caller's
/// `pc`), but a CFI step may have recovered `x29` without `x30`. In the
/// standard convention `fp` and `lr` are pushed as a pair, so if the
/// grand-callee's frame record agrees on the value of `fp`, the `lr` saved
/// next to it is trustworthy.
fn get_link_register_by_frame_pointer<S: SymbolSupplier>(
    ctx: &Arm64Context,
    stack: &MemoryRegion<'_>,
    grand_callee: Option<&StackFrame>,
    modules: &CodeModuleList,
    _symbolizer: &mut Symbolizer<S>,
) -> Option<u64> {
    let grand_callee = grand_callee?;
    let grand_callee_fp = match &grand_callee.context {
        RawContext::Arm64(grand_ctx) => grand_ctx.get_register(FRAME_POINTER)?,
        _ => return None,
    };

    let presumed_fp = read_stack_word::<Arm64Context>(stack, grand_callee_fp)?;

    let last_fp = ctx.get_register(FRAME_POINTER)?;
    let last_sp = ctx.get_register(STACK_POINTER)?;
    if last_fp <= last_sp || presumed_fp != last_fp {
        return None;
    }

    let last_lr = read_stack_word::<Arm64Context>(stack, grand_callee_fp + POINTER_WIDTH)?;
    Some(ptr_auth_strip(modules, last_lr))
}

fn get_caller_by_frame_pointer<S: SymbolSupplier>(
    ctx: &Arm64Context,
    grand_callee: Option<&StackFrame>,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");

    // The frame record is the pair (saved fp, saved lr) at the frame
    // pointer. The return address itself is already in the link register:
    //
    // pc := lr
    // lr := *(fp + 8)
    // fp := *fp
    // sp := fp + 16
    let last_fp = ctx.get_register(FRAME_POINTER)?;
    let last_sp = ctx.get_register(STACK_POINTER)?;
    let last_lr = match ctx.get_register(LINK_REGISTER) {
        Some(lr) => ptr_auth_strip(modules, lr),
        None => {
            get_link_register_by_frame_pointer(ctx, stack, grand_callee, modules, symbolizer)?
        }
    };

    if last_fp >= u64::MAX - POINTER_WIDTH * 2 {
        return None;
    }

    let (caller_fp, caller_lr, caller_sp) = if last_fp == 0 {
        // A zero frame pointer ends the chain; hand back a frame whose
        // stack pointer fails to advance so the walk loop terminates.
        (0, 0, last_sp)
    } else {
        (
            read_stack_word::<Arm64Context>(stack, last_fp)?,
            read_stack_word::<Arm64Context>(stack, last_fp + POINTER_WIDTH)?,
            last_fp + POINTER_WIDTH * 2,
        )
    };

    let caller_pc = last_lr;
    let caller_lr = ptr_auth_strip(modules, caller_lr);

    trace!(
        "unwind: frame pointer seems valid -- caller_pc: {:#018x}, caller_sp: {:#018x}",
        caller_pc,
        caller_sp
    );

    let mut caller = Arm64Context::default();
    caller.set_register(PROGRAM_COUNTER, caller_pc);
    caller.set_register(LINK_REGISTER, caller_lr);
    caller.set_register(FRAME_POINTER, caller_fp);
    caller.set_register(STACK_POINTER, caller_sp);

    Some(StackFrame::from_context(
        RawContext::Arm64(caller),
        FrameTrust::FramePointer,
    ))
}

fn get_caller_by_scan<S: SymbolSupplier>(
    ctx: &Arm64Context,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
) -> Option<StackFrame> {
    let (address_of_pc, caller_pc) =
        scan_for_return_address(ctx, callee.trust, stack, modules, symbolizer, options)?;
    let caller_sp = address_of_pc + POINTER_WIDTH;

    let mut caller = Arm64Context::default();
    caller.set_register(PROGRAM_COUNTER, caller_pc);
    caller.set_register(STACK_POINTER, caller_sp);

    Some(StackFrame::from_context(
        RawContext::Arm64(caller),
        FrameTrust::Scan,
    ))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn get_caller_frame<S: SymbolSupplier>(
    ctx: &Arm64Context,
    callee: &StackFrame,
    grand_callee: Option<&StackFrame>,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
    scan_allowed: bool,
) -> Option<StackFrame> {
    get_caller_by_cfi(ctx, callee, stack, modules, symbolizer)
        .or_else(|| get_caller_by_frame_pointer(ctx, grand_callee, stack, modules, symbolizer))
        .or_else(|| {
            scan_allowed
                .then(|| get_caller_by_scan(ctx, callee, stack, modules, symbolizer, options))
                .flatten()
        })
}
