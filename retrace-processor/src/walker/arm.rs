//! Stackwalking for 32-bit ARM.

use log::trace;

use retrace_unwind::MemoryRegion;

use super::{recover_caller_by_cfi, scan_for_return_address, read_stack_word};
use crate::context::{ArmContext, CpuContext, RawContext};
use crate::frame::{FrameTrust, StackFrame};
use crate::module::CodeModuleList;
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolSupplier, Symbolizer};

const POINTER_WIDTH: u64 = 4;

const PROGRAM_COUNTER: &str = "pc";
const STACK_POINTER: &str = "sp";
const LINK_REGISTER: &str = "lr";

/// Frame pointer candidates, in preference order.
///
/// APCS frames chain through `r11`; thumb code uses `r7` instead. Both
/// conventions store `(saved fp, saved lr)` at the frame pointer.
const FRAME_POINTER_CANDIDATES: &[&str] = &["r11", "r7"];

fn get_caller_by_cfi<S: SymbolSupplier>(
    ctx: &ArmContext,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    let caller = recover_caller_by_cfi(ctx, callee, stack, modules, symbolizer)?;
    Some(StackFrame::from_context(
        RawContext::Arm(caller),
        FrameTrust::Cfi,
    ))
}

fn get_caller_by_frame_pointer<S: SymbolSupplier>(
    ctx: &ArmContext,
    stack: &MemoryRegion<'_>,
    _modules: &CodeModuleList,
    _symbolizer: &mut Symbolizer<S>,
) -> Option<StackFrame> {
    trace!("unwind: trying frame pointer");

    // The return address of the callee is in the link register; for
    // non-leaf callees the prologue spilled it into the frame record along
    // with the caller's frame pointer:
    //
    // pc := lr
    // lr := *(fp + 4)
    // fp := *fp
    // sp := fp + 8
    let last_sp = u64::from(ctx.get_register(STACK_POINTER)?);
    let last_lr = ctx.get_register(LINK_REGISTER)?;

    for &fp_register in FRAME_POINTER_CANDIDATES {
        let last_fp = match ctx.get_register(fp_register) {
            Some(fp) => u64::from(fp),
            None => continue,
        };

        let (caller_fp, caller_lr, caller_sp) = if last_fp == 0 {
            // A zero frame pointer ends the chain; hand back a frame whose
            // stack pointer fails to advance so the walk loop terminates.
            (0, 0, last_sp)
        } else {
            if last_fp <= last_sp {
                continue;
            }
            let fp = match read_stack_word::<ArmContext>(stack, last_fp) {
                Some(fp) => fp,
                None => continue,
            };
            let lr = match read_stack_word::<ArmContext>(stack, last_fp + POINTER_WIDTH) {
                Some(lr) => lr,
                None => continue,
            };
            (fp, lr, last_fp + POINTER_WIDTH * 2)
        };

        let mut caller = ArmContext::default();
        caller.set_register(PROGRAM_COUNTER, last_lr);
        caller.set_register(LINK_REGISTER, caller_lr as u32);
        caller.set_register(fp_register, caller_fp as u32);
        caller.set_register(STACK_POINTER, caller_sp as u32);

        return Some(StackFrame::from_context(
            RawContext::Arm(caller),
            FrameTrust::FramePointer,
        ));
    }

    None
}

fn get_caller_by_scan<S: SymbolSupplier>(
    ctx: &ArmContext,
    callee: &StackFrame,
    stack: &MemoryRegion<'_>,
    modules: &CodeModuleList,
    symbolizer: &mut Symbolizer<S>,
    options: &ProcessorOptions,
) -> Option<StackFrame> {
    let (address_of_pc, caller_pc) =
        scan_for_return_address(ctx, callee.trust, stack, modules, symbolizer, options)?;
    let caller_sp = address_of_pc + POINTER_WIDTH;

    let mut caller = ArmContext::default();
    caller.set_register(PROGRAM_COUNTER, caller_pc as u32);
    caller.set_register(STACK_POINTER, caller_sp as u32);

    Some(StackFrame::from_context(
        RawContext::Arm(caller),
        FrameTrust::Scan,
    ))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn get_caller_frame<S: SymbolSupplier>(
    ctx: &ArmContext,
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
