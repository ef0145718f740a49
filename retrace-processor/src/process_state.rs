//! The result of processing a crash dump.

use lazy_static::lazy_static;
use regex::Regex;

use retrace_common::Arch;

use crate::dump::{DumpSystemInfo, Os};
use crate::frame::CallStack;
use crate::module::{CodeModule, CodeModuleList};

lazy_static! {
    /// Matches the build string that Linux dump writers generate by running
    /// `uname -srvmo`, roughly "Linux [version] [build...] [arch] GNU/Linux".
    static ref LINUX_BUILD_RE: Regex =
        Regex::new(r"^Linux ([^ ]+) (.*) \w+(?: GNU/Linux)?$").unwrap();
}

/// Information about the CPU and OS on which the dump was generated.
#[derive(Clone, Debug, Default)]
pub struct SystemInfo {
    /// The operating system.
    pub os: Os,

    /// A string identifying the version of the operating system, such as
    /// "5.1.2600" or "10.4.8". Empty if the dump does not carry one.
    pub os_version: String,

    /// A platform-dependent build identifier, such as "Service Pack 2" or
    /// "8L2127".
    pub os_build: String,

    /// The CPU architecture of the crashed process.
    pub cpu: Arch,

    /// A vendor-specific CPU description, such as
    /// "GenuineIntel level 6 model 13 stepping 8".
    pub cpu_info: String,

    /// The number of processors in the system.
    pub cpu_count: u32,
}

impl SystemInfo {
    /// Builds system info from the dump's raw view, splitting the version
    /// string into version and build parts.
    pub(crate) fn from_dump(info: &DumpSystemInfo) -> Self {
        let (os_version, os_build) = split_os_version(&info.os_version);
        SystemInfo {
            os: info.os,
            os_version,
            os_build,
            cpu: info.cpu,
            cpu_info: info.cpu_info.clone(),
            cpu_count: info.cpu_count,
        }
    }
}

/// Splits a captured OS version string into version and build components.
///
/// Windows and macOS dumps provide "version build"; Linux dump writers put
/// the whole `uname` output into the build part, from which the kernel
/// version can be recovered.
fn split_os_version(raw: &str) -> (String, String) {
    let mut parts = raw.splitn(2, ' ');
    let version = parts.next().unwrap_or("0.0.0");
    let build = parts.next().unwrap_or("");

    if version == "0.0.0" {
        if let Some(captures) = LINUX_BUILD_RE.captures(build) {
            let version = captures.get(1).unwrap();
            let build = captures.get(2).unwrap();
            return (version.as_str().into(), build.as_str().into());
        }
    }

    (version.into(), build.into())
}

/// The exception that caused the dump to be written.
#[derive(Clone, Debug, Default)]
pub struct ExceptionRecord {
    /// The OS-specific exception code.
    pub code: u32,

    /// OS-specific exception flags.
    pub flags: u32,

    /// The faulting address.
    pub address: u64,

    /// Additional OS-specific exception parameters.
    pub parameters: Vec<u64>,
}

/// An exploitability rating of the crash.
///
/// The rating is produced by a separate analysis pass; processing itself
/// always reports [`Exploitability::NotAnalyzed`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Exploitability {
    /// No analysis was run.
    #[default]
    NotAnalyzed,
    /// The crash does not look exploitable.
    None,
    /// The crash could be exploitable under some circumstances.
    Interesting,
    /// The crash is probably exploitable.
    Low,
    /// The crash is likely exploitable.
    Medium,
    /// The crash is almost certainly exploitable.
    High,
    /// No analysis engine exists for the dump's platform.
    ErrorNoEngine,
    /// The analysis engine failed.
    ErrorProcessing,
}

/// Snapshot of the state of a process at the time of its crash.
///
/// Produced by [`Processor::process`](crate::Processor::process). The
/// requesting thread's stacks and all per-frame trust levels live in
/// [`threads`](Self::threads).
#[derive(Debug, Default)]
pub struct ProcessState {
    /// The time the dump was written, in seconds since the epoch.
    pub time: u64,

    /// The time the crashed process was started, if known.
    pub process_create_time: Option<u64>,

    /// The id of the crashed process, if known.
    pub process_id: Option<u32>,

    /// True if the process crashed; false if the dump was requested without
    /// an exception.
    pub crashed: bool,

    /// If the process crashed, the type of crash: OS- and possibly
    /// CPU-specific strings such as "EXCEPTION_ACCESS_VIOLATION" (Windows),
    /// "EXC_BAD_ACCESS / KERN_INVALID_ADDRESS" (macOS) or "SIGSEGV" (other
    /// Unix). Empty if the process did not crash.
    pub crash_reason: String,

    /// If the process crashed and the crash reason implicates memory, the
    /// memory address that caused the crash.
    pub crash_address: u64,

    /// A textual representation of a failed assertion, if the dump carries
    /// one.
    pub assertion: String,

    /// The exception record, present if the process crashed.
    pub exception_record: Option<ExceptionRecord>,

    /// The index of the requesting (usually: crashing) thread in
    /// [`threads`](Self::threads), or `None` if no requesting thread was
    /// identified or found.
    ///
    /// This indexes the possibly truncated output list, not the dump's
    /// thread list.
    pub requesting_thread: Option<usize>,

    /// The number of threads in the dump, before any skipping or
    /// truncation.
    pub original_thread_count: usize,

    /// One reconstructed call stack per processed thread, in dump order.
    pub threads: Vec<CallStack>,

    /// Information about the CPU and OS.
    pub system_info: SystemInfo,

    /// Modules loaded at crash time.
    pub modules: CodeModuleList,

    /// Previously loaded modules.
    pub unloaded_modules: CodeModuleList,

    /// Modules for which the symbol supplier had no symbols.
    pub modules_without_symbols: Vec<CodeModule>,

    /// Modules whose symbol files could not be parsed.
    pub modules_with_corrupt_symbols: Vec<CodeModule>,

    /// The exploitability rating of the crash.
    pub exploitability: Exploitability,
}

impl ProcessState {
    /// The call stack of the requesting thread, if one was identified.
    pub fn requesting_thread_stack(&self) -> Option<&CallStack> {
        self.threads.get(self.requesting_thread?)
    }
}
