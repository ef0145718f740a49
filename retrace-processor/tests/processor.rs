//! End-to-end tests of the processing pipeline against hand-built dumps.

use std::collections::HashMap;

use similar_asserts::assert_eq;

use retrace_common::{Arch, ByteView};
use retrace_processor::dump::{
    CrashDump, DumpException, DumpHeader, DumpMiscInfo, DumpSystemInfo, DumpThread, Os,
};
use retrace_processor::{
    CallStackInfo, CodeModule, CodeModuleList, CpuContext, FrameTrust, ProcessResult, Processor,
    ProcessorOptions, RawContext, SymbolResult, SymbolSupplier, Symbolizer, X86Context,
};
use retrace_unwind::MemoryRegion;

struct TestSupplier {
    files: HashMap<String, Vec<u8>>,
    interrupt: bool,
}

impl TestSupplier {
    fn empty() -> Self {
        TestSupplier {
            files: HashMap::new(),
            interrupt: false,
        }
    }

    fn with(name: &str, data: &str) -> Self {
        let mut files = HashMap::new();
        files.insert(name.to_string(), data.as_bytes().to_vec());
        TestSupplier {
            files,
            interrupt: false,
        }
    }

    fn interrupting() -> Self {
        TestSupplier {
            files: HashMap::new(),
            interrupt: true,
        }
    }
}

impl SymbolSupplier for TestSupplier {
    fn locate_symbols(&mut self, module: &CodeModule) -> SymbolResult {
        if self.interrupt {
            return SymbolResult::InterruptRetryLater;
        }
        match self.files.get(&module.debug_file) {
            Some(bytes) => SymbolResult::Found(ByteView::from_vec(bytes.clone())),
            None => SymbolResult::NotFound,
        }
    }
}

fn test_module() -> CodeModule {
    CodeModule {
        base_address: 0x40_0000,
        size: 0x10_0000,
        code_file: "app".to_string(),
        code_identifier: "deadbeef".to_string(),
        debug_file: "app".to_string(),
        debug_identifier: "D3096ED481217FD4C16B29CD9BC208BA0".to_string(),
    }
}

fn x86_context(eip: u32, esp: u32, ebp: u32) -> RawContext {
    let mut ctx = X86Context::default();
    ctx.set_register("$eip", eip);
    ctx.set_register("$esp", esp);
    ctx.set_register("$ebp", ebp);
    ctx.mark_all_valid();
    RawContext::X86(ctx)
}

fn x86_thread(thread_id: u32, eip: u32) -> DumpThread<'static> {
    DumpThread {
        thread_id,
        teb: 0,
        context: Some(x86_context(eip, 0x7ffe_0000, 0x7ffe_0100)),
        stack: None,
    }
}

fn linux_system_info() -> DumpSystemInfo {
    DumpSystemInfo {
        os: Os::Linux,
        os_version: "0.0.0 Linux 5.15.0-generic #72 SMP Tue Jan 1 00:00:00 UTC 2030 x86_64"
            .to_string(),
        cpu: Arch::X86,
        cpu_info: "GenuineIntel".to_string(),
        cpu_count: 8,
    }
}

fn base_dump() -> CrashDump<'static> {
    CrashDump {
        header: DumpHeader {
            time_date_stamp: 1_700_000_000,
        },
        system_info: Some(linux_system_info()),
        modules: CodeModuleList::new(vec![test_module()]).unwrap(),
        misc_info: DumpMiscInfo {
            process_id: Some(4711),
            process_create_time: Some(1_699_999_000),
        },
        ..Default::default()
    }
}

/// The crashing thread's stack must start at the exception context's
/// instruction pointer, not at the thread context's.
#[test]
fn test_requesting_thread_substitution() {
    let mut dump = base_dump();
    dump.threads = Some(vec![
        x86_thread(1, 0x40_1000),
        x86_thread(2, 0x40_beef),
        x86_thread(3, 0x40_3000),
    ]);
    dump.exception = Some(DumpException {
        thread_id: 2,
        code: 11, // SIGSEGV
        flags: 0,
        address: 0x16,
        parameters: Vec::new(),
        context: Some(x86_context(0x40_dead, 0x7ffe_0000, 0x7ffe_0100)),
    });

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let state = Processor::new(&mut symbolizer).process(&dump).unwrap();

    assert!(state.crashed);
    assert_eq!(state.crash_reason, "SIGSEGV");
    assert_eq!(state.crash_address, 0x16);
    assert_eq!(state.requesting_thread, Some(1));

    let crashed = state.requesting_thread_stack().unwrap();
    assert_eq!(crashed.thread_id, 2);
    assert_eq!(crashed.frames[0].instruction, 0x40_dead);

    // The other threads keep their own contexts.
    assert_eq!(state.threads[0].frames[0].instruction, 0x40_1000);
    assert_eq!(state.threads[2].frames[0].instruction, 0x40_3000);
}

/// An ill-formed exception context falls back to the thread context.
#[test]
fn test_malformed_exception_context_falls_back() {
    let mut dump = base_dump();
    dump.threads = Some(vec![x86_thread(2, 0x40_beef)]);
    dump.exception = Some(DumpException {
        thread_id: 2,
        code: 11,
        flags: 0,
        address: 0x16,
        parameters: Vec::new(),
        // All-zero instruction pointer: unusable.
        context: Some(RawContext::X86(X86Context::default())),
    });

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let state = Processor::new(&mut symbolizer).process(&dump).unwrap();

    assert_eq!(state.threads[0].frames[0].instruction, 0x40_beef);
}

/// Two threads claiming the exception's thread id abort processing.
#[test]
fn test_duplicate_requesting_threads() {
    let mut dump = base_dump();
    dump.threads = Some(vec![x86_thread(2, 0x40_1000), x86_thread(2, 0x40_2000)]);
    dump.exception = Some(DumpException {
        thread_id: 2,
        code: 11,
        flags: 0,
        address: 0,
        parameters: Vec::new(),
        context: Some(x86_context(0x40_dead, 0x7ffe_0000, 0x7ffe_0100)),
    });

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let error = Processor::new(&mut symbolizer).process(&dump).unwrap_err();

    assert_eq!(error.kind(), ProcessResult::DuplicateRequestingThreads);
}

/// A dump without a thread list cannot be processed at all.
#[test]
fn test_no_thread_list() {
    let dump = base_dump();

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let error = Processor::new(&mut symbolizer).process(&dump).unwrap_err();

    assert_eq!(error.kind(), ProcessResult::NoThreadList);
    assert!(error.kind().is_usable());
}

/// The thread limit truncates the output while always keeping the
/// requesting thread, and the requesting index refers to the truncated
/// list.
#[test]
fn test_thread_limit_keeps_requesting_thread() {
    let mut dump = base_dump();
    let threads: Vec<_> = (0..50).map(|i| x86_thread(100 + i, 0x40_1000)).collect();
    dump.threads = Some(threads);
    dump.exception = Some(DumpException {
        thread_id: 137, // index 37
        code: 11,
        flags: 0,
        address: 0,
        parameters: Vec::new(),
        context: Some(x86_context(0x40_dead, 0x7ffe_0000, 0x7ffe_0100)),
    });

    let options = ProcessorOptions {
        max_thread_count: Some(10),
        ..Default::default()
    };

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let state = Processor::with_options(&mut symbolizer, options)
        .process(&dump)
        .unwrap();

    // Exactly the threads needed to include the requesting one.
    assert_eq!(state.threads.len(), 38);
    assert_eq!(state.requesting_thread, Some(37));
    assert_eq!(state.requesting_thread_stack().unwrap().thread_id, 137);
    assert_eq!(state.original_thread_count, 50);

    // A requesting thread before the limit keeps the limit itself.
    let mut dump = base_dump();
    dump.threads = Some((0..50).map(|i| x86_thread(100 + i, 0x40_1000)).collect());
    dump.exception = Some(DumpException {
        thread_id: 103, // index 3
        code: 11,
        flags: 0,
        address: 0,
        parameters: Vec::new(),
        context: Some(x86_context(0x40_dead, 0x7ffe_0000, 0x7ffe_0100)),
    });

    let options = ProcessorOptions {
        max_thread_count: Some(10),
        ..Default::default()
    };

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let state = Processor::with_options(&mut symbolizer, options)
        .process(&dump)
        .unwrap();

    assert_eq!(state.threads.len(), 10);
    assert_eq!(state.requesting_thread, Some(3));
}

/// The thread that wrote the dump is dropped from the output entirely.
#[test]
fn test_dump_thread_skipped() {
    let mut dump = base_dump();
    dump.threads = Some(vec![
        x86_thread(1, 0x40_1000),
        x86_thread(2, 0x40_2000),
        x86_thread(3, 0x40_3000),
    ]);
    dump.dump_thread_id = Some(2);

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let state = Processor::new(&mut symbolizer).process(&dump).unwrap();

    assert_eq!(state.threads.len(), 2);
    assert_eq!(state.original_thread_count, 2);
    assert_eq!(state.threads[0].thread_id, 1);
    assert_eq!(state.threads[1].thread_id, 3);
}

/// An indicated requesting thread that is not in the thread list clears
/// the requesting index but keeps the result.
#[test]
fn test_requesting_thread_not_found() {
    let mut dump = base_dump();
    dump.threads = Some(vec![x86_thread(1, 0x40_1000)]);
    dump.exception = Some(DumpException {
        thread_id: 99,
        code: 11,
        flags: 0,
        address: 0,
        parameters: Vec::new(),
        context: None,
    });

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let state = Processor::new(&mut symbolizer).process(&dump).unwrap();

    assert!(state.crashed);
    assert_eq!(state.requesting_thread, None);
    assert_eq!(state.threads.len(), 1);
}

/// A supplier interrupt aborts the session without a process state.
#[test]
fn test_symbol_supplier_interrupt() {
    let mut dump = base_dump();
    dump.threads = Some(vec![x86_thread(1, 0x40_1000)]);

    let mut symbolizer = Symbolizer::new(TestSupplier::interrupting());
    let error = Processor::new(&mut symbolizer).process(&dump).unwrap_err();

    assert_eq!(error.kind(), ProcessResult::SymbolSupplierInterrupted);
}

/// Threads without contexts are carried as empty stacks; processing
/// continues.
#[test]
fn test_thread_without_context() {
    let mut dump = base_dump();
    dump.threads = Some(vec![
        DumpThread {
            thread_id: 1,
            teb: 0,
            context: None,
            stack: None,
        },
        x86_thread(2, 0x40_2000),
    ]);

    let mut symbolizer = Symbolizer::new(TestSupplier::empty());
    let state = Processor::new(&mut symbolizer).process(&dump).unwrap();

    assert_eq!(state.threads.len(), 2);
    assert_eq!(state.threads[0].info, CallStackInfo::MissingContext);
    assert!(state.threads[0].frames.is_empty());
    assert_eq!(state.threads[1].frames[0].instruction, 0x40_2000);
}

const X86_SYMBOLS: &str = "\
MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 app
FILE 0 src/server.c
FUNC 1200 80 0 handle_request
1200 80 42 0
FUNC 12f0 40 0 accept_loop
12f0 40 57 0
STACK CFI INIT 1200 80 .cfa: $ebp 8 + $eip: .cfa -4 ^ $ebp: .cfa -8 ^
";

/// Full pipeline: CFI unwinding plus symbolication through the processor,
/// with thread names, system info and bookkeeping sets.
#[test]
fn test_end_to_end_with_symbols() {
    let stack_bytes = {
        let mut bytes = vec![0u8; 0x200];
        bytes[0x100..0x104].copy_from_slice(&0x7ffe_0200u32.to_le_bytes()); // saved ebp
        bytes[0x104..0x108].copy_from_slice(&0x0040_1300u32.to_le_bytes()); // return address
        bytes
    };
    let stack = MemoryRegion {
        base_addr: 0x7ffe_0000,
        contents: &stack_bytes,
    };

    let unsymbolicated = CodeModule {
        base_address: 0x7000_0000,
        size: 0x1000,
        code_file: "libmystery.so".to_string(),
        code_identifier: String::new(),
        debug_file: "libmystery.so".to_string(),
        debug_identifier: "492E2DD23CC306CA9C494EEF1533A3810".to_string(),
    };

    let mut dump = base_dump();
    dump.modules = CodeModuleList::new(vec![test_module(), unsymbolicated]).unwrap();
    dump.threads = Some(vec![DumpThread {
        thread_id: 2,
        teb: 0,
        context: None,
        stack: Some(stack),
    }]);
    dump.exception = Some(DumpException {
        thread_id: 2,
        code: 11,
        flags: 0,
        address: 0x16,
        parameters: vec![1, 0x16],
        context: Some(x86_context(0x40_1234, 0x7ffe_0000, 0x7ffe_0100)),
    });
    dump.thread_names.insert(2, "RequestHandler".to_string());

    // Touch the unsymbolicated module from a second thread so it lands in
    // the missing-symbols set.
    if let Some(threads) = dump.threads.as_mut() {
        threads.push(DumpThread {
            thread_id: 3,
            teb: 0,
            context: Some(x86_context(0x7000_0500, 0x7ffe_0000, 0)),
            stack: None,
        });
    }

    let mut symbolizer = Symbolizer::new(TestSupplier::with("app", X86_SYMBOLS));
    let state = Processor::new(&mut symbolizer).process(&dump).unwrap();

    assert!(state.crashed);
    assert_eq!(state.crash_reason, "SIGSEGV");
    assert_eq!(state.system_info.os_version, "5.15.0-generic");
    assert_eq!(state.system_info.cpu, Arch::X86);
    assert_eq!(state.process_id, Some(4711));
    assert_eq!(state.process_create_time, Some(1_699_999_000));
    assert_eq!(state.time, 1_700_000_000);

    let crashed = state.requesting_thread_stack().unwrap();
    assert_eq!(crashed.thread_name.as_deref(), Some("RequestHandler"));
    assert_eq!(crashed.frames.len(), 2);

    let innermost = &crashed.frames[0];
    assert_eq!(innermost.trust, FrameTrust::Context);
    assert_eq!(innermost.function_name.as_deref(), Some("handle_request"));
    assert_eq!(innermost.source_file.as_deref(), Some("src/server.c"));
    assert_eq!(innermost.source_line, Some(42));
    assert_eq!(
        innermost.module.as_ref().unwrap().code_file,
        "app"
    );

    let caller = &crashed.frames[1];
    assert_eq!(caller.trust, FrameTrust::Cfi);
    assert_eq!(caller.instruction, 0x40_1300);
    assert_eq!(caller.function_name.as_deref(), Some("accept_loop"));

    assert!(crashed.trust_is_plausible());

    let exception = state.exception_record.as_ref().unwrap();
    assert_eq!(exception.code, 11);
    assert_eq!(exception.parameters, vec![1, 0x16]);

    assert_eq!(state.modules_without_symbols.len(), 1);
    assert_eq!(state.modules_without_symbols[0].code_file, "libmystery.so");
    assert!(state.modules_with_corrupt_symbols.is_empty());
}
