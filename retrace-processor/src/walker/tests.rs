use std::collections::HashMap;

use similar_asserts::assert_eq;

use retrace_common::ByteView;
use retrace_unwind::MemoryRegion;

use crate::context::{
    Amd64Context, Arm64Context, CpuContext, RawContext, Riscv64Context, X86Context,
};
use crate::frame::FrameTrust;
use crate::module::{CodeModule, CodeModuleList};
use crate::processor::ProcessorOptions;
use crate::symbolizer::{SymbolResult, SymbolSupplier, Symbolizer};
use crate::walker::walk_stack;

struct TestSupplier {
    files: HashMap<String, Vec<u8>>,
}

impl TestSupplier {
    fn empty() -> Self {
        TestSupplier {
            files: HashMap::new(),
        }
    }

    fn with(name: &str, data: &str) -> Self {
        let mut files = HashMap::new();
        files.insert(name.to_string(), data.as_bytes().to_vec());
        TestSupplier { files }
    }
}

impl SymbolSupplier for TestSupplier {
    fn locate_symbols(&mut self, module: &CodeModule) -> SymbolResult {
        match self.files.get(&module.debug_file) {
            Some(bytes) => SymbolResult::Found(ByteView::from_vec(bytes.clone())),
            None => SymbolResult::NotFound,
        }
    }
}

fn module(debug_file: &str, base: u64, size: u64) -> CodeModule {
    CodeModule {
        base_address: base,
        size,
        code_file: debug_file.to_string(),
        code_identifier: String::new(),
        debug_file: debug_file.to_string(),
        debug_identifier: "D3096ED481217FD4C16B29CD9BC208BA0".to_string(),
    }
}

/// A little-endian stack image under construction.
struct StackImage {
    base: u64,
    bytes: Vec<u8>,
}

impl StackImage {
    fn new(base: u64, size: usize) -> Self {
        StackImage {
            base,
            bytes: vec![0; size],
        }
    }

    fn set_u32(&mut self, address: u64, value: u32) {
        let offset = (address - self.base) as usize;
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn set_u64(&mut self, address: u64, value: u64) {
        let offset = (address - self.base) as usize;
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn region(&self) -> MemoryRegion<'_> {
        MemoryRegion {
            base_addr: self.base,
            contents: &self.bytes,
        }
    }
}

const X86_SYMBOLS: &str = "\
MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 app
FILE 0 app.c
FUNC 1200 80 0 crashing_fn
1200 80 42 0
FUNC 12f0 40 0 calling_fn
12f0 40 57 0
STACK CFI INIT 1200 80 .cfa: $ebp 8 + $eip: .cfa -4 ^ $ebp: .cfa -8 ^
";

/// The canonical single-module x86 walk: one module, CFI present, two
/// frames with context and cfi trust.
#[test]
fn test_x86_walk_with_cfi() {
    let modules = CodeModuleList::new(vec![module("app", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::with("app", X86_SYMBOLS));

    let mut stack = StackImage::new(0x7ffe_0000, 0x200);
    stack.set_u32(0x7ffe_0100, 0x7ffe_0200); // saved ebp
    stack.set_u32(0x7ffe_0104, 0x40_1300); // return address

    let mut ctx = X86Context::default();
    ctx.set_register("$eip", 0x40_1234);
    ctx.set_register("$esp", 0x7ffe_0000);
    ctx.set_register("$ebp", 0x7ffe_0100);
    ctx.mark_all_valid();
    let context = RawContext::X86(ctx);

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &ProcessorOptions::default(),
    );

    assert_eq!(result.frames.len(), 2);

    assert_eq!(result.frames[0].instruction, 0x40_1234);
    assert_eq!(result.frames[0].trust, FrameTrust::Context);
    assert_eq!(
        result.frames[0].function_name.as_deref(),
        Some("crashing_fn")
    );
    assert_eq!(result.frames[0].source_line, Some(42));

    assert_eq!(result.frames[1].instruction, 0x40_1300);
    assert_eq!(result.frames[1].trust, FrameTrust::Cfi);
    assert_eq!(
        result.frames[1].function_name.as_deref(),
        Some("calling_fn")
    );
    assert_eq!(result.frames[1].context.get_register("$esp"), Some(0x7ffe_0108));
    assert_eq!(result.frames[1].context.get_register("$ebp"), Some(0x7ffe_0200));

    assert!(result.trust_is_plausible());
}

/// Without symbols and with scanning disabled, the walk ends after the
/// context frame.
#[test]
fn test_scan_disabled_cfi_less_frame() {
    let modules = CodeModuleList::new(vec![module("bare", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::empty());

    let mut stack = StackImage::new(0x7ffe_0000, 0x100);
    // A perfectly plausible return address on the stack, which only a scan
    // would find.
    stack.set_u32(0x7ffe_0004, 0x40_0500);

    let mut ctx = X86Context::default();
    ctx.set_register("$eip", 0x40_1234);
    ctx.set_register("$esp", 0x7ffe_0000);
    ctx.mark_all_valid();
    let context = RawContext::X86(ctx);

    let options = ProcessorOptions {
        stack_scan_allowed: false,
        ..Default::default()
    };

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &options,
    );

    assert_eq!(result.frames.len(), 1);
    assert_eq!(result.frames[0].trust, FrameTrust::Context);
}

/// The same stack with scanning allowed recovers the second frame with
/// scan trust.
#[test]
fn test_scan_recovers_frame() {
    let modules = CodeModuleList::new(vec![module("bare", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::empty());

    let mut stack = StackImage::new(0x7ffe_0000, 0x100);
    stack.set_u32(0x7ffe_0004, 0x40_0500);

    let mut ctx = X86Context::default();
    ctx.set_register("$eip", 0x40_1234);
    ctx.set_register("$esp", 0x7ffe_0000);
    ctx.mark_all_valid();
    let context = RawContext::X86(ctx);

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &ProcessorOptions::default(),
    );

    assert_eq!(result.frames.len(), 2);
    assert_eq!(result.frames[1].instruction, 0x40_0500);
    assert_eq!(result.frames[1].trust, FrameTrust::Scan);
    assert!(result.trust_is_plausible());
}

/// Zero-sized stack memory produces exactly the context frame.
#[test]
fn test_zero_sized_stack_memory() {
    let modules = CodeModuleList::new(vec![module("bare", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::empty());

    let region = MemoryRegion {
        base_addr: 0x7ffe_0000,
        contents: &[],
    };

    let mut ctx = X86Context::default();
    ctx.set_register("$eip", 0x40_1234);
    ctx.set_register("$esp", 0x7ffe_0000);
    ctx.set_register("$ebp", 0x7ffe_0100);
    ctx.mark_all_valid();
    let context = RawContext::X86(ctx);

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&region),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &ProcessorOptions::default(),
    );

    assert_eq!(result.frames.len(), 1);
}

/// An all-zero context produces no frames at all.
#[test]
fn test_all_zero_context() {
    let modules = CodeModuleList::new(vec![module("bare", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::empty());

    let mut ctx = X86Context::default();
    ctx.mark_all_valid();
    let context = RawContext::X86(ctx);

    let stack = StackImage::new(0x7ffe_0000, 0x100);
    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &ProcessorOptions::default(),
    );

    assert!(result.frames.is_empty());
    assert_eq!(result.info, crate::frame::CallStackInfo::MissingContext);
}

/// A CFI rule dereferencing outside the stack region fails cleanly and the
/// walk falls through to the next strategy (here: frame pointer).
#[test]
fn test_cfi_out_of_range_deref_falls_through() {
    const SYMBOLS: &str = "\
MODULE Linux x86_64 D3096ED481217FD4C16B29CD9BC208BA0 app
FUNC 800 100 0 parent_fn
FUNC 1200 80 0 broken_cfi_fn
STACK CFI INIT 1200 80 .cfa: $rsp 8 + .ra: 0xdeadbeef00 ^
";

    let modules = CodeModuleList::new(vec![module("app", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::with("app", SYMBOLS));

    let mut stack = StackImage::new(0x7ffe_0000, 0x200);
    stack.set_u64(0x7ffe_0100, 0x7ffe_0180); // saved rbp, inside the stack
    stack.set_u64(0x7ffe_0108, 0x40_0850); // return address into parent_fn

    let mut ctx = Amd64Context::default();
    ctx.set_register("$rip", 0x40_1234);
    ctx.set_register("$rsp", 0x7ffe_0000);
    ctx.set_register("$rbp", 0x7ffe_0100);
    ctx.mark_all_valid();
    let context = RawContext::Amd64(ctx);

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &ProcessorOptions::default(),
    );

    assert!(result.frames.len() >= 2);
    assert_eq!(result.frames[1].trust, FrameTrust::FramePointer);
    assert_eq!(result.frames[1].instruction, 0x40_0850);
}

/// Pointer authentication bits above the module address range are stripped
/// from frame-record values on ARM64.
#[test]
fn test_arm64_pointer_auth_strip() {
    let modules =
        CodeModuleList::new(vec![module("app", 0xffff_8040_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::empty());

    // 48-bit address space; the frame record's saved lr carries an
    // authentication code in the top bits.
    assert_eq!(modules.address_range_mask(), (1 << 48) - 1);

    let mut stack = StackImage::new(0x7ffe_0000, 0x200);
    stack.set_u64(0x7ffe_0100, 0x7ffe_0180); // saved fp
    stack.set_u64(0x7ffe_0108, 0x8a00_ffff_8040_0100); // signed saved lr
    stack.set_u64(0x7ffe_0180, 0); // next frame record ends the chain
    stack.set_u64(0x7ffe_0188, 0);

    let mut ctx = Arm64Context::default();
    ctx.set_register("pc", 0xffff_8040_1234);
    ctx.set_register("sp", 0x7ffe_0000);
    ctx.set_register("x29", 0x7ffe_0100);
    ctx.set_register("x30", 0xffff_8040_0200);
    ctx.mark_all_valid();
    let context = RawContext::Arm64(ctx);

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &ProcessorOptions::default(),
    );

    assert!(result.frames.len() >= 2);
    let caller = &result.frames[1];
    assert_eq!(caller.trust, FrameTrust::FramePointer);
    // The callee's lr is the caller's pc, and was unsigned.
    assert_eq!(caller.instruction, 0xffff_8040_0200);
    // The lr recovered from the frame record had its signature stripped.
    assert_eq!(
        caller.context.get_register("x30"),
        Some(0x0000_ffff_8040_0100)
    );
}

/// The walk refuses to run past the configured frame cap even on a stack
/// that chains forever.
#[test]
fn test_frame_limit_bounds_walk() {
    let modules = CodeModuleList::new(vec![module("app", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::empty());

    // A ladder of x86 frame records, each pointing at the next.
    let mut stack = StackImage::new(0x7ffe_0000, 0x1000);
    for i in 0..200u64 {
        let frame_base = 0x7ffe_0000 + i * 8;
        stack.set_u32(frame_base, (frame_base + 8) as u32); // saved ebp
        stack.set_u32(frame_base + 4, 0x40_0500); // return address
    }

    let mut ctx = X86Context::default();
    ctx.set_register("$eip", 0x40_1234);
    ctx.set_register("$esp", 0x7ffe_0000);
    ctx.set_register("$ebp", 0x7ffe_0000);
    ctx.mark_all_valid();
    let context = RawContext::X86(ctx);

    let options = ProcessorOptions {
        frame_limit: 16,
        ..Default::default()
    };

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &options,
    );

    assert_eq!(result.frames.len(), 16);
}

/// A recovered stack pointer that fails to advance terminates the walk.
#[test]
fn test_non_advancing_stack_pointer_terminates() {
    let modules = CodeModuleList::new(vec![module("app", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::empty());

    // The frame record points backwards: caller esp would be below the
    // callee's.
    let mut stack = StackImage::new(0x7ffe_0000, 0x200);
    stack.set_u32(0x7ffe_0100, 0x7ffe_0180); // saved ebp
    stack.set_u32(0x7ffe_0104, 0x40_0800); // return address

    let mut ctx = X86Context::default();
    ctx.set_register("$eip", 0x40_1234);
    ctx.set_register("$esp", 0x7ffe_01f0); // above the frame record
    ctx.set_register("$ebp", 0x7ffe_0100);
    ctx.mark_all_valid();
    let context = RawContext::X86(ctx);

    let options = ProcessorOptions {
        stack_scan_allowed: false,
        ..Default::default()
    };

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &options,
    );

    assert_eq!(result.frames.len(), 1);
}

/// RISC-V leaf frames unwind through the link register without touching
/// the stack.
#[test]
fn test_riscv64_leaf_frame_through_ra() {
    const SYMBOLS: &str = "\
MODULE Linux riscv64 D3096ED481217FD4C16B29CD9BC208BA0 app
FUNC 1200 80 0 leaf_fn
STACK CFI INIT 1200 80 .cfa: sp 0 + .ra: ra
";

    let modules = CodeModuleList::new(vec![module("app", 0x40_0000, 0x1_0000)]).unwrap();
    let mut symbolizer = Symbolizer::new(TestSupplier::with("app", SYMBOLS));

    let stack = StackImage::new(0x7ffe_0000, 0x100);

    let mut ctx = Riscv64Context::default();
    ctx.set_register("pc", 0x40_1234);
    ctx.set_register("sp", 0x7ffe_0000);
    ctx.set_register("ra", 0x40_0800);
    ctx.mark_all_valid();
    let context = RawContext::Riscv64(ctx);

    let result = walk_stack(
        1,
        None,
        Some(&context),
        Some(&stack.region()),
        &modules,
        &CodeModuleList::default(),
        &mut symbolizer,
        &ProcessorOptions::default(),
    );

    // The leaf's caller is found via the .ra rule with an unchanged stack
    // pointer, which is allowed exactly once.
    assert_eq!(result.frames.len(), 2);
    assert_eq!(result.frames[1].instruction, 0x40_0800);
    assert_eq!(result.frames[1].trust, FrameTrust::Cfi);
}
