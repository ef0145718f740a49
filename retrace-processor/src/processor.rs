//! The top-level processing loop.

use std::cmp;
use std::fmt;

use log::{info, warn};
use thiserror::Error;

use crate::dump::{CrashDump, DumpException, Os, MAX_EXCEPTION_PARAMETERS};
use crate::process_state::{ExceptionRecord, ProcessState, SystemInfo};
use crate::symbolizer::{SymbolSupplier, Symbolizer};
use crate::walker;

/// Result of processing a crash dump.
///
/// Codes other than [`Ok`](Self::Ok) describe why processing stopped. The
/// dump-structural codes are reported by dump readers; the processor itself
/// produces [`NoThreadList`](Self::NoThreadList),
/// [`DuplicateRequestingThreads`](Self::DuplicateRequestingThreads) and
/// [`SymbolSupplierInterrupted`](Self::SymbolSupplierInterrupted).
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProcessResult {
    /// The dump was processed successfully.
    Ok,

    /// The dump file was not found or the buffer was empty.
    DumpNotFound,

    /// The dump file had no header.
    NoDumpHeader,

    /// The dump has no thread list.
    NoThreadList,

    /// There was an error getting one thread's data from the dump.
    InvalidThreadIndex,

    /// There was an error getting a thread id from the thread's data.
    InvalidThreadId,

    /// There was an error getting a thread's name from the dump.
    InvalidThreadName,

    /// There was more than one requesting thread.
    DuplicateRequestingThreads,

    /// The dump processing was interrupted by the symbol supplier (not
    /// fatal); retrying later may succeed.
    SymbolSupplierInterrupted,
}

impl ProcessResult {
    /// Indicates whether a process state produced under this result is
    /// usable.
    ///
    /// Depending on the result, the process state might only contain
    /// partial information. For a complete dump, check for
    /// [`ProcessResult::Ok`] instead.
    pub fn is_usable(self) -> bool {
        matches!(self, ProcessResult::Ok | ProcessResult::NoThreadList)
    }
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = match *self {
            ProcessResult::Ok => "dump processed successfully",
            ProcessResult::DumpNotFound => "file could not be opened",
            ProcessResult::NoDumpHeader => "dump header missing",
            ProcessResult::NoThreadList => "dump has no thread list",
            ProcessResult::InvalidThreadIndex => "could not get thread data",
            ProcessResult::InvalidThreadId => "could not get a thread by id",
            ProcessResult::InvalidThreadName => "could not get a thread's name",
            ProcessResult::DuplicateRequestingThreads => "multiple requesting threads",
            ProcessResult::SymbolSupplierInterrupted => {
                "processing was interrupted (not fatal)"
            }
        };

        write!(f, "{}", formatted)
    }
}

/// An error generated when processing a crash dump fails.
///
/// No partial [`ProcessState`] accompanies an error; a session either
/// completes or reports one failure code.
#[derive(Debug, Error)]
#[error("dump processing failed: {0}")]
pub struct ProcessError(pub ProcessResult);

impl ProcessError {
    /// Returns the result code of this error.
    pub fn kind(&self) -> ProcessResult {
        self.0
    }
}

/// Tunable limits and heuristics of the processor.
#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    /// The maximum number of threads to include in the output.
    ///
    /// The requesting thread is always included, even when it lies beyond
    /// the limit. `None` processes every thread.
    pub max_thread_count: Option<usize>,

    /// The hard cap on frames per walked stack.
    pub frame_limit: usize,

    /// Whether stack scanning may be used when CFI and frame pointers fail.
    pub stack_scan_allowed: bool,

    /// The number of words to scan above the stack pointer.
    pub scan_words: u32,

    /// The number of words to scan for the innermost frame, which tends to
    /// be the most damaged one.
    pub context_scan_words: u32,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions {
            max_thread_count: None,
            frame_limit: 1024,
            stack_scan_allowed: true,
            scan_words: 30,
            context_scan_words: 40,
        }
    }
}

/// Derives a human-readable crash reason from an exception record.
///
/// The code is interpreted per OS family; unrecognized codes fall back to
/// their hexadecimal representation.
fn crash_reason(os: Os, exception: &DumpException) -> String {
    let code = exception.code;
    let reason = match os {
        Os::Windows => match code {
            0x8000_0003 => Some("EXCEPTION_BREAKPOINT"),
            0x8000_0004 => Some("EXCEPTION_SINGLE_STEP"),
            0xc000_0005 => Some("EXCEPTION_ACCESS_VIOLATION"),
            0xc000_001d => Some("EXCEPTION_ILLEGAL_INSTRUCTION"),
            0xc000_008c => Some("EXCEPTION_ARRAY_BOUNDS_EXCEEDED"),
            0xc000_0094 => Some("EXCEPTION_INT_DIVIDE_BY_ZERO"),
            0xc000_00fd => Some("EXCEPTION_STACK_OVERFLOW"),
            0xc000_0374 => Some("EXCEPTION_HEAP_CORRUPTION"),
            _ => None,
        },
        Os::MacOs => match code {
            1 => Some("EXC_BAD_ACCESS"),
            2 => Some("EXC_BAD_INSTRUCTION"),
            3 => Some("EXC_ARITHMETIC"),
            4 => Some("EXC_EMULATION"),
            5 => Some("EXC_SOFTWARE"),
            6 => Some("EXC_BREAKPOINT"),
            _ => None,
        },
        Os::Linux => match code {
            4 => Some("SIGILL"),
            5 => Some("SIGTRAP"),
            6 => Some("SIGABRT"),
            7 => Some("SIGBUS"),
            8 => Some("SIGFPE"),
            11 => Some("SIGSEGV"),
            _ => None,
        },
        Os::Unknown => None,
    };

    match reason {
        Some(reason) => reason.to_string(),
        None => format!("{:#010x}", code),
    }
}

/// Orchestrates the processing of one crash dump into a [`ProcessState`].
///
/// A processor borrows a [`Symbolizer`] so that parsed symbol databases can
/// be shared across dumps; per-dump symbolizer state is reset at the start
/// of each [`process`](Self::process) call. Processing is single-threaded
/// and runs to completion.
pub struct Processor<'sym, S> {
    symbolizer: &'sym mut Symbolizer<S>,
    options: ProcessorOptions,
}

impl<'sym, S: SymbolSupplier> Processor<'sym, S> {
    /// Creates a processor with default options.
    pub fn new(symbolizer: &'sym mut Symbolizer<S>) -> Self {
        Processor {
            symbolizer,
            options: ProcessorOptions::default(),
        }
    }

    /// Creates a processor with the given options.
    pub fn with_options(symbolizer: &'sym mut Symbolizer<S>, options: ProcessorOptions) -> Self {
        Processor {
            symbolizer,
            options,
        }
    }

    /// Processes a parsed crash dump into a [`ProcessState`].
    ///
    /// Walks every thread of the dump, substituting the exception context
    /// for the requesting thread, and assembles the symbolicated output.
    /// Recoverable per-thread and per-frame conditions are recorded in the
    /// state; structural problems abort with an error and no state.
    pub fn process(&mut self, dump: &CrashDump<'_>) -> Result<ProcessState, ProcessError> {
        let threads = dump
            .threads
            .as_ref()
            .ok_or(ProcessError(ProcessResult::NoThreadList))?;

        self.symbolizer.reset();

        let mut state = ProcessState {
            time: dump.header.time_date_stamp,
            process_create_time: dump.misc_info.process_create_time,
            process_id: dump.misc_info.process_id,
            modules: dump.modules.clone(),
            unloaded_modules: dump.unloaded_modules.clone(),
            original_thread_count: threads.len(),
            ..Default::default()
        };

        if let Some(ref info) = dump.system_info {
            state.system_info = SystemInfo::from_dump(info);
        }

        let os = state.system_info.os;

        if let Some(ref exception) = dump.exception {
            state.crashed = true;
            state.crash_address = exception.address;
            state.crash_reason = crash_reason(os, exception);
            state.exception_record = Some(ExceptionRecord {
                code: exception.code,
                flags: exception.flags,
                address: exception.address,
                parameters: exception
                    .parameters
                    .iter()
                    .copied()
                    .take(MAX_EXCEPTION_PARAMETERS)
                    .collect(),
            });
        }

        if let Some(ref assertion) = dump.assertion {
            state.assertion = assertion.clone();
        }

        // The exception's thread is authoritative; a separately recorded
        // requesting thread id only applies when there is no exception.
        let requesting_thread_id = dump
            .exception
            .as_ref()
            .map(|exception| exception.thread_id)
            .or(dump.requesting_thread_id);

        info!(
            "processing dump with {} threads, {} modules{}",
            threads.len(),
            dump.modules.len(),
            if state.crashed { ", crashed" } else { "" }
        );

        let mut found_requesting_thread = false;
        let mut thread_count_limit = threads.len();

        for (thread_index, thread) in threads.iter().enumerate() {
            if thread_index >= thread_count_limit {
                break;
            }

            // The thread that wrote the dump captured its own context and
            // stack in flux; drop it entirely.
            if dump.dump_thread_id == Some(thread.thread_id) {
                state.original_thread_count -= 1;
                continue;
            }

            let mut context = thread.context.as_ref();

            if requesting_thread_id == Some(thread.thread_id) {
                if found_requesting_thread {
                    warn!("duplicate requesting thread {:#x}", thread.thread_id);
                    return Err(ProcessError(ProcessResult::DuplicateRequestingThreads));
                }

                // Record the index in the output list, not the dump: skipped
                // threads shift the two apart.
                state.requesting_thread = Some(state.threads.len());
                found_requesting_thread = true;

                if let Some(max) = self.options.max_thread_count {
                    thread_count_limit = cmp::min(
                        thread_count_limit,
                        cmp::max(state.threads.len() + 1, max),
                    );
                }

                if state.crashed {
                    // Use the exception record's context for the crashed
                    // thread instead of the thread's own: the thread context
                    // is the state inside the exception handler. An
                    // ill-formed exception context falls back to the thread
                    // context.
                    let exception_context = dump
                        .exception
                        .as_ref()
                        .and_then(|exception| exception.context.as_ref())
                        .filter(|context| context.is_well_formed());
                    context = exception_context.or(thread.context.as_ref());
                }
            }

            // If the stack memory could not be resolved from the thread
            // record itself, try to locate a dump memory region containing
            // the thread's stack pointer.
            let fallback_stack = match thread.stack {
                None => context.and_then(|context| {
                    dump.memory_at_address(context.stack_pointer()).copied()
                }),
                Some(_) => None,
            };
            let stack_memory = thread.stack.as_ref().or(fallback_stack.as_ref());

            if stack_memory.is_none() {
                warn!("no stack memory for thread {:#x}", thread.thread_id);
            }

            let stack = walker::walk_stack(
                thread.thread_id,
                dump.thread_names.get(&thread.thread_id).cloned(),
                context,
                stack_memory,
                &state.modules,
                &state.unloaded_modules,
                self.symbolizer,
                &self.options,
            );

            state.threads.push(stack);
        }

        if self.symbolizer.was_interrupted() {
            info!("processing was interrupted by the symbol supplier");
            return Err(ProcessError(ProcessResult::SymbolSupplierInterrupted));
        }

        // If a requesting thread was indicated, it must be present. Its
        // absence invalidates the index but not the whole dump.
        if requesting_thread_id.is_some() && !found_requesting_thread {
            warn!(
                "requesting thread {:#x} not found in dump",
                requesting_thread_id.unwrap()
            );
            state.requesting_thread = None;
        }

        state.modules_without_symbols = self.symbolizer.modules_without_symbols();
        state.modules_with_corrupt_symbols = self.symbolizer.modules_with_corrupt_symbols();

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_reason_strings() {
        let exception = |code| DumpException {
            code,
            ..Default::default()
        };

        assert_eq!(crash_reason(Os::Linux, &exception(11)), "SIGSEGV");
        assert_eq!(
            crash_reason(Os::Windows, &exception(0xc000_0005)),
            "EXCEPTION_ACCESS_VIOLATION"
        );
        assert_eq!(crash_reason(Os::MacOs, &exception(1)), "EXC_BAD_ACCESS");
        assert_eq!(crash_reason(Os::Unknown, &exception(0x42)), "0x00000042");
    }

    #[test]
    fn test_default_options_match_documented_limits() {
        let options = ProcessorOptions::default();
        assert_eq!(options.frame_limit, 1024);
        assert_eq!(options.scan_words, 30);
        assert_eq!(options.context_scan_words, 40);
        assert!(options.stack_scan_allowed);
        assert!(options.max_thread_count.is_none());
    }
}
