//! Stack frames, call stacks and the trust model.

use std::fmt;
use std::str::FromStr;

use retrace_common::CpuFamily;

use crate::context::RawContext;
use crate::module::CodeModule;

/// Indicates how well the instruction pointer of a stack frame is trusted.
///
/// The stackwalker applies its recovery strategies in decreasing order of
/// reliability and records on every frame which strategy produced it. Since
/// walking can resort to stack scanning, dubious frames are possible and
/// downstream triage weights frames by this value.
///
/// In rough order of "trust metric".
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum FrameTrust {
    /// Unknown trust.
    #[default]
    None,

    /// Scanned the stack, found this (lowest precision).
    Scan,

    /// Found while scanning the stack using call frame info.
    CfiScan,

    /// Derived from the previous frame's frame pointer.
    FramePointer,

    /// Derived from call frame info.
    Cfi,

    /// Explicitly provided by some external stack walker.
    Prewalked,

    /// Given as instruction pointer in a context (highest precision).
    Context,
}

impl fmt::Display for FrameTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match *self {
            FrameTrust::None => "none",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::CfiScan => "call frame info with scanning",
            FrameTrust::FramePointer => "previous frame's frame pointer",
            FrameTrust::Cfi => "call frame info",
            FrameTrust::Prewalked => "recovered by external stack walker",
            FrameTrust::Context => "given as instruction pointer in context",
        };

        write!(f, "{}", string)
    }
}

/// Error when converting a string to [`FrameTrust`].
#[derive(Debug)]
pub struct ParseFrameTrustError;

impl fmt::Display for ParseFrameTrustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse frame trust")
    }
}

impl std::error::Error for ParseFrameTrustError {}

impl FromStr for FrameTrust {
    type Err = ParseFrameTrustError;

    fn from_str(string: &str) -> Result<FrameTrust, Self::Err> {
        Ok(match string {
            "none" => FrameTrust::None,
            "scan" => FrameTrust::Scan,
            "cfiscan" => FrameTrust::CfiScan,
            "fp" => FrameTrust::FramePointer,
            "cfi" => FrameTrust::Cfi,
            "prewalked" => FrameTrust::Prewalked,
            "context" => FrameTrust::Context,
            _ => return Err(ParseFrameTrustError),
        })
    }
}

/// One entry of a frame's inlined-call chain.
///
/// Inline frames are not separate stack frames; they are attached to the
/// physical frame whose instruction range they cover, ordered from the
/// outermost call inwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InlineFrame {
    /// The name of the inlined function.
    pub function_name: String,

    /// The source file containing the call site.
    pub call_file: Option<String>,

    /// The source line of the call site.
    pub call_line: u64,
}

/// A single frame of a reconstructed call stack.
///
/// Contains the recovered register context for this frame, the instruction
/// address used for symbol lookup, and the source information attached by
/// the symbolizer.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// The program counter location as an absolute virtual address.
    ///
    /// For the innermost frame this is the exact instruction pointer. For
    /// all caller frames it is the return address into the caller as
    /// recovered from the stack or a register. Symbol and CFI lookups use
    /// [`lookup_address`](Self::lookup_address) instead, which backs up
    /// into the call instruction.
    pub instruction: u64,

    /// The module containing `instruction`, if any.
    pub module: Option<CodeModule>,

    /// The name of the function containing `instruction`.
    pub function_name: Option<String>,

    /// The start address of that function.
    pub function_base: Option<u64>,

    /// The size in bytes of that function's stack parameters.
    pub parameter_size: Option<u64>,

    /// The source file of the frame's line record.
    pub source_file: Option<String>,

    /// The source line of the frame's line record.
    pub source_line: Option<u64>,

    /// The start address of the frame's line record.
    pub source_line_base: Option<u64>,

    /// The chain of calls inlined at `instruction`, outermost first.
    pub inlines: Vec<InlineFrame>,

    /// How this frame was recovered.
    pub trust: FrameTrust,

    /// The register state of this frame with its validity mask.
    pub context: RawContext,
}

impl StackFrame {
    /// Creates an unsymbolicated frame from a register context.
    ///
    /// The frame's instruction is taken from the context's instruction
    /// pointer.
    pub fn from_context(context: RawContext, trust: FrameTrust) -> Self {
        let instruction = context.instruction_pointer();
        StackFrame {
            instruction,
            module: None,
            function_name: None,
            function_base: None,
            parameter_size: None,
            source_file: None,
            source_line: None,
            source_line_base: None,
            inlines: Vec::new(),
            trust,
            context,
        }
    }

    /// The address used for symbol and CFI lookups for this frame.
    ///
    /// A caller frame's `instruction` is the return address, one
    /// instruction past the call. Looking that address up would resolve
    /// the source location control returns to, which may be on the next
    /// line, or even past the end of the caller when the callee never
    /// returns. Backing up by one instruction (one byte, on variable
    /// length instruction sets) lands inside the call.
    pub fn lookup_address(&self) -> u64 {
        if self.trust == FrameTrust::Context {
            return self.instruction;
        }

        let adjustment = match self.context.cpu_family() {
            CpuFamily::Intel32 | CpuFamily::Amd64 => 1,
            // Thumb instructions are two bytes wide.
            CpuFamily::Arm32 => 2,
            CpuFamily::Arm64 => 4,
            // The call fills a branch delay slot, so the return address is
            // two instructions past the JAL.
            CpuFamily::Mips32 | CpuFamily::Mips64 => 8,
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => 4,
            CpuFamily::Riscv32 | CpuFamily::Riscv64 => 4,
            CpuFamily::Unknown => 0,
            _ => 0,
        };

        self.instruction.saturating_sub(adjustment)
    }
}

/// Information about how the walk of one thread went.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallStackInfo {
    /// The stack was walked from a register context.
    Ok,

    /// The thread had no usable register context; no frames were produced.
    MissingContext,
}

/// The reconstructed call stack of one thread, innermost frame first.
#[derive(Clone, Debug)]
pub struct CallStack {
    /// The identifier of the thread.
    pub thread_id: u32,

    /// The thread's name, if the dump recorded one.
    pub thread_name: Option<String>,

    /// The frames of the stack, innermost first.
    pub frames: Vec<StackFrame>,

    /// How the walk of this thread went.
    pub info: CallStackInfo,
}

impl CallStack {
    /// Creates an empty call stack with the given outcome.
    pub fn with_info(thread_id: u32, info: CallStackInfo) -> Self {
        CallStack {
            thread_id,
            thread_name: None,
            frames: Vec::new(),
            info,
        }
    }

    /// Checks the trust invariant of a walked stack.
    ///
    /// The innermost frame always carries [`FrameTrust::Context`]; no
    /// frame recovered after a CFI frame may claim trust higher than CFI,
    /// because CFI failures fall through to weaker strategies and never
    /// silently upgrade. Diagnostic hook for tests and consumers.
    pub fn trust_is_plausible(&self) -> bool {
        let mut frames = self.frames.iter();

        match frames.next() {
            None => return true,
            Some(first) if first.trust != FrameTrust::Context => return false,
            Some(_) => {}
        }

        let mut after_cfi = false;
        for frame in frames {
            if after_cfi && frame.trust > FrameTrust::Cfi {
                return false;
            }
            if frame.trust == FrameTrust::Cfi {
                after_cfi = true;
            }
        }

        true
    }
}
