//! Typed, read-only views of a parsed crash dump.
//!
//! Parsing the OS dump format is the job of a dump reader outside this
//! crate; the processor consumes the resulting views. All memory referenced
//! here is borrowed from the dump's bytes for the duration of a processing
//! call.

use std::collections::BTreeMap;

use retrace_common::Arch;
use retrace_unwind::MemoryRegion;

use crate::context::RawContext;
use crate::module::CodeModuleList;

/// The operating system a dump was captured on.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Os {
    /// Microsoft Windows.
    Windows,
    /// macOS or iOS.
    MacOs,
    /// Linux.
    Linux,
    /// Any other or unrecognized operating system.
    #[default]
    Unknown,
}

impl Os {
    /// The canonical lowercase name of this operating system.
    pub fn name(self) -> &'static str {
        match self {
            Os::Windows => "windows",
            Os::MacOs => "mac",
            Os::Linux => "linux",
            Os::Unknown => "unknown",
        }
    }
}

/// The fixed-size header of a dump.
#[derive(Clone, Copy, Debug, Default)]
pub struct DumpHeader {
    /// The time the dump was written, in seconds since the epoch.
    pub time_date_stamp: u64,
}

/// System information captured in the dump.
#[derive(Clone, Debug, Default)]
pub struct DumpSystemInfo {
    /// The operating system.
    pub os: Os,

    /// The operating system's version and build strings, as captured.
    ///
    /// On Linux this is the raw `uname` output and gets split by the
    /// processor.
    pub os_version: String,

    /// The CPU architecture of the crashed process.
    pub cpu: Arch,

    /// A vendor-specific CPU description, if captured.
    pub cpu_info: String,

    /// The number of processors in the system.
    pub cpu_count: u32,
}

/// The maximum number of exception parameters carried in a dump.
pub const MAX_EXCEPTION_PARAMETERS: usize = 15;

/// The exception record of a crashed process.
#[derive(Clone, Debug, Default)]
pub struct DumpException {
    /// The id of the thread that raised the exception.
    pub thread_id: u32,

    /// The OS-specific exception code.
    pub code: u32,

    /// OS-specific exception flags.
    pub flags: u32,

    /// The faulting address.
    ///
    /// For data access errors this is the accessed address; for code errors
    /// it is the address of the faulting instruction.
    pub address: u64,

    /// Up to [`MAX_EXCEPTION_PARAMETERS`] additional parameters.
    pub parameters: Vec<u64>,

    /// The register context at the point of the exception.
    ///
    /// This context, not the thread's own, describes the state at crash
    /// time; the thread context captures the state inside the exception
    /// handler instead.
    pub context: Option<RawContext>,
}

/// A single thread captured in the dump.
#[derive(Clone, Debug)]
pub struct DumpThread<'d> {
    /// The OS thread identifier.
    pub thread_id: u32,

    /// The address of the thread environment block or TLS area, if any.
    pub teb: u64,

    /// The thread's register context.
    pub context: Option<RawContext>,

    /// The thread's stack memory.
    pub stack: Option<MemoryRegion<'d>>,
}

/// Miscellaneous process information.
#[derive(Clone, Copy, Debug, Default)]
pub struct DumpMiscInfo {
    /// The process id, if captured.
    pub process_id: Option<u32>,

    /// The process creation time in seconds since the epoch, if captured.
    pub process_create_time: Option<u64>,
}

/// A parsed crash dump, assembled by a dump reader.
///
/// All fields are read-only views; optional streams that were absent from
/// the dump are `None` or empty.
#[derive(Clone, Debug, Default)]
pub struct CrashDump<'d> {
    /// The dump header.
    pub header: DumpHeader,

    /// System information, if the stream was present.
    pub system_info: Option<DumpSystemInfo>,

    /// The exception record, present if the process crashed.
    pub exception: Option<DumpException>,

    /// Modules loaded at crash time.
    pub modules: CodeModuleList,

    /// Previously loaded modules whose ranges may have been reused.
    pub unloaded_modules: CodeModuleList,

    /// Raw memory regions included in the dump, addressable by guest
    /// address.
    pub memory_regions: Vec<MemoryRegion<'d>>,

    /// The captured threads, or `None` if the dump carries no thread list.
    pub threads: Option<Vec<DumpThread<'d>>>,

    /// Thread names by thread id.
    pub thread_names: BTreeMap<u32, String>,

    /// Miscellaneous process information.
    pub misc_info: DumpMiscInfo,

    /// The id of the thread that wrote the dump, if recorded.
    ///
    /// A thread dumping itself captures its own context and stack in flux,
    /// so the processor drops this thread from the output.
    pub dump_thread_id: Option<u32>,

    /// The id of the thread that requested the dump, if recorded separately
    /// from the exception.
    pub requesting_thread_id: Option<u32>,

    /// A textual representation of a failed assertion, if the dump carries
    /// one.
    pub assertion: Option<String>,
}

impl<'d> CrashDump<'d> {
    /// Looks up the memory region containing the given guest address.
    ///
    /// This is the fallback for threads whose stack memory descriptor could
    /// not be resolved directly.
    pub fn memory_at_address(&self, address: u64) -> Option<&MemoryRegion<'d>> {
        self.memory_regions
            .iter()
            .find(|region| address >= region.base_addr && address < region.end_addr())
    }
}
