//! CPU architectures and their register naming conventions.

use std::fmt;
use std::str;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Names for x86 CPU registers by register number.
static X86: &[&str] = &[
    "$eax", "$ecx", "$edx", "$ebx", "$esp", "$ebp", "$esi", "$edi", "$eip", "$eflags",
];

/// Names for x86_64 CPU registers by register number.
static AMD64: &[&str] = &[
    "$rax", "$rdx", "$rcx", "$rbx", "$rsi", "$rdi", "$rbp", "$rsp", "$r8", "$r9", "$r10", "$r11",
    "$r12", "$r13", "$r14", "$r15", "$rip", "$rflags",
];

/// Names for 32-bit ARM CPU registers by register number.
static ARM: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc", "cpsr",
];

/// Names for 64-bit ARM CPU registers by register number.
static ARM64: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "pc",
];

/// Names for MIPS CPU registers by register number.
static MIPS: &[&str] = &[
    "$zero", "$at", "$v0", "$v1", "$a0", "$a1", "$a2", "$a3", "$t0", "$t1", "$t2", "$t3", "$t4",
    "$t5", "$t6", "$t7", "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7", "$t8", "$t9",
    "$k0", "$k1", "$gp", "$sp", "$fp", "$ra", "$lo", "$hi", "$pc",
];

/// Names for PowerPC CPU registers by register number.
static PPC: &[&str] = &[
    "$r0", "$r1", "$r2", "$r3", "$r4", "$r5", "$r6", "$r7", "$r8", "$r9", "$r10", "$r11", "$r12",
    "$r13", "$r14", "$r15", "$r16", "$r17", "$r18", "$r19", "$r20", "$r21", "$r22", "$r23", "$r24",
    "$r25", "$r26", "$r27", "$r28", "$r29", "$r30", "$r31", "$srr0", "$lr", "$ctr", "$cr", "$xer",
];

/// Names for RISC-V CPU registers by register number.
///
/// The order matches the layout of RISC-V crash contexts: the program counter
/// first, followed by the integer registers in their ABI order.
static RISCV: &[&str] = &[
    "pc", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

/// Represents a family of CPUs.
///
/// This is strongly connected to the [`Arch`] type, but reduces the selection
/// to a range of families with distinct properties, such as a generally common
/// instruction set and pointer size.
#[repr(u32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CpuFamily {
    /// Any other CPU family that is not explicitly supported.
    #[default]
    Unknown = 0,
    /// 32-bit little-endian CPUs using the Intel 8086 instruction set, also known as `x86`.
    Intel32 = 1,
    /// 64-bit little-endian, also known as `x86_64`, now widely used by Intel and AMD.
    Amd64 = 2,
    /// 32-bit ARM.
    Arm32 = 3,
    /// 64-bit ARM (e.g. ARMv8-A).
    Arm64 = 4,
    /// 32-bit big-endian PowerPC.
    Ppc32 = 5,
    /// 64-bit big-endian PowerPC.
    Ppc64 = 6,
    /// 32-bit MIPS.
    Mips32 = 7,
    /// 64-bit MIPS.
    Mips64 = 8,
    /// 32-bit RISC-V.
    Riscv32 = 9,
    /// 64-bit RISC-V.
    Riscv64 = 10,
}

impl CpuFamily {
    /// Returns the native pointer size in bytes.
    ///
    /// This commonly defines the size of CPU registers including the
    /// instruction pointer, and the size of all pointers on the platform.
    /// Returns `None` if the CPU family is unknown.
    ///
    /// # Examples
    ///
    /// ```
    /// use retrace_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.pointer_size(), Some(8));
    /// assert_eq!(CpuFamily::Intel32.pointer_size(), Some(4));
    /// ```
    pub fn pointer_size(self) -> Option<usize> {
        match self {
            CpuFamily::Unknown => None,
            CpuFamily::Amd64
            | CpuFamily::Arm64
            | CpuFamily::Ppc64
            | CpuFamily::Mips64
            | CpuFamily::Riscv64 => Some(8),
            CpuFamily::Intel32
            | CpuFamily::Arm32
            | CpuFamily::Ppc32
            | CpuFamily::Mips32
            | CpuFamily::Riscv32 => Some(4),
        }
    }

    /// Returns instruction alignment if fixed.
    ///
    /// Some instruction sets, such as Intel's x86, use variable length
    /// instruction encoding. Others, such as ARM, have fixed length
    /// instructions. This method returns `Some` for fixed size instructions
    /// and `None` for variable-length instruction sizes.
    pub fn instruction_alignment(self) -> Option<u64> {
        match self {
            CpuFamily::Arm32 => Some(2),
            CpuFamily::Arm64 => Some(4),
            CpuFamily::Ppc32 | CpuFamily::Mips32 | CpuFamily::Mips64 => Some(4),
            CpuFamily::Riscv32 | CpuFamily::Riscv64 => Some(2),
            CpuFamily::Ppc64 => Some(8),
            CpuFamily::Intel32 | CpuFamily::Amd64 => None,
            CpuFamily::Unknown => None,
        }
    }

    /// Returns the name of the instruction pointer register.
    ///
    /// The instruction pointer register holds a pointer to current code
    /// execution at all times. This is a different register on each CPU
    /// family. Returns `None` if the CPU family is unknown.
    pub fn ip_register_name(self) -> Option<&'static str> {
        match self {
            CpuFamily::Intel32 => Some("eip"),
            CpuFamily::Amd64 => Some("rip"),
            CpuFamily::Arm32 | CpuFamily::Arm64 => Some("pc"),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => Some("srr0"),
            CpuFamily::Mips32 | CpuFamily::Mips64 => Some("pc"),
            CpuFamily::Riscv32 | CpuFamily::Riscv64 => Some("pc"),
            CpuFamily::Unknown => None,
        }
    }

    /// Returns the full register name table of this CPU family.
    ///
    /// The table is indexed by register number and uses the same names as
    /// [`cfi_register_name`](Self::cfi_register_name). The table is empty
    /// for unknown families.
    pub fn register_names(self) -> &'static [&'static str] {
        match self {
            CpuFamily::Intel32 => X86,
            CpuFamily::Amd64 => AMD64,
            CpuFamily::Arm32 => ARM,
            CpuFamily::Arm64 => ARM64,
            CpuFamily::Mips32 | CpuFamily::Mips64 => MIPS,
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => PPC,
            CpuFamily::Riscv32 | CpuFamily::Riscv64 => RISCV,
            CpuFamily::Unknown => &[],
        }
    }

    /// Returns the name of a register as used in CFI rule programs.
    ///
    /// Each CPU family specifies its own register set, where the registers
    /// are numbered. This resolves the name of the register for the given
    /// family, if defined. Returns `None` if the CPU family is unknown, or
    /// the register is not defined for the family.
    ///
    /// **Note**: The CFI register name differs from [`ip_register_name`]. On
    /// x86 families registers carry a `$` prefix (`$rip` instead of `rip`),
    /// matching the names emitted into symbol files.
    ///
    /// # Examples
    ///
    /// ```
    /// use retrace_common::CpuFamily;
    ///
    /// // 16 is the instruction pointer register:
    /// assert_eq!(CpuFamily::Amd64.cfi_register_name(16), Some("$rip"));
    /// ```
    ///
    /// [`ip_register_name`]: enum.CpuFamily.html#method.ip_register_name
    pub fn cfi_register_name(self, register: u16) -> Option<&'static str> {
        let index = register as usize;

        let opt = match self {
            CpuFamily::Intel32 => X86.get(index),
            CpuFamily::Amd64 => AMD64.get(index),
            CpuFamily::Arm32 => ARM.get(index),
            CpuFamily::Arm64 => ARM64.get(index),
            CpuFamily::Mips32 | CpuFamily::Mips64 => MIPS.get(index),
            CpuFamily::Ppc32 | CpuFamily::Ppc64 => PPC.get(index),
            CpuFamily::Riscv32 | CpuFamily::Riscv64 => RISCV.get(index),
            CpuFamily::Unknown => None,
        };

        opt.copied().filter(|name| !name.is_empty())
    }
}

/// An error returned for an invalid [`Arch`](enum.Arch.html).
#[derive(Debug)]
pub struct UnknownArchError;

impl fmt::Display for UnknownArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture")
    }
}

impl std::error::Error for UnknownArchError {}

/// An enumeration of CPU architectures.
///
/// The architectures are grouped into families, which can be retrieved by
/// [`cpu_family`]. Each architecture has a canonical name, returned by
/// [`Arch::name`], and can be parsed back from that name. A few common
/// aliases are supported, for instance `"i386"` parses as [`Arch::X86`].
///
/// This enumeration is represented as `u32` for lowlevel APIs. The values are
/// grouped by CPU family for forward compatibility.
///
/// [`cpu_family`]: enum.Arch.html#method.cpu_family
/// [`Arch::name`]: enum.Arch.html#method.name
#[repr(u32)]
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Arch {
    #[default]
    Unknown = 0,
    X86 = 101,
    Amd64 = 201,
    Arm = 301,
    Arm64 = 401,
    Ppc = 501,
    Ppc64 = 601,
    Mips = 701,
    Mips64 = 801,
    Riscv32 = 901,
    Riscv64 = 1001,
}

impl Arch {
    /// Creates an `Arch` from its `u32` representation.
    ///
    /// Returns [`Arch::Unknown`] for unknown values.
    pub fn from_u32(val: u32) -> Arch {
        match val {
            101 => Arch::X86,
            201 => Arch::Amd64,
            301 => Arch::Arm,
            401 => Arch::Arm64,
            501 => Arch::Ppc,
            601 => Arch::Ppc64,
            701 => Arch::Mips,
            801 => Arch::Mips64,
            901 => Arch::Riscv32,
            1001 => Arch::Riscv64,
            _ => Arch::Unknown,
        }
    }

    /// Returns the CPU family of this architecture.
    pub fn cpu_family(self) -> CpuFamily {
        match self {
            Arch::Unknown => CpuFamily::Unknown,
            Arch::X86 => CpuFamily::Intel32,
            Arch::Amd64 => CpuFamily::Amd64,
            Arch::Arm => CpuFamily::Arm32,
            Arch::Arm64 => CpuFamily::Arm64,
            Arch::Ppc => CpuFamily::Ppc32,
            Arch::Ppc64 => CpuFamily::Ppc64,
            Arch::Mips => CpuFamily::Mips32,
            Arch::Mips64 => CpuFamily::Mips64,
            Arch::Riscv32 => CpuFamily::Riscv32,
            Arch::Riscv64 => CpuFamily::Riscv64,
        }
    }

    /// Returns the canonical name of this architecture.
    ///
    /// This is the lowercase name as it appears in symbol file headers.
    pub fn name(self) -> &'static str {
        match self {
            Arch::Unknown => "unknown",
            Arch::X86 => "x86",
            Arch::Amd64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::Mips => "mips",
            Arch::Mips64 => "mips64",
            Arch::Riscv32 => "riscv",
            Arch::Riscv64 => "riscv64",
        }
    }

    /// Returns whether this architecture is well-known.
    pub fn well_known(self) -> bool {
        !matches!(self, Arch::Unknown)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl str::FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(string: &str) -> Result<Arch, UnknownArchError> {
        Ok(match string {
            "unknown" => Arch::Unknown,
            "x86" | "i386" | "i686" => Arch::X86,
            "x86_64" | "amd64" | "x86_64h" => Arch::Amd64,
            "arm" | "armv7" => Arch::Arm,
            "arm64" | "aarch64" | "arm64e" => Arch::Arm64,
            "ppc" | "powerpc" => Arch::Ppc,
            "ppc64" | "powerpc64" => Arch::Ppc64,
            "mips" => Arch::Mips,
            "mips64" => Arch::Mips64,
            "riscv" | "riscv32" => Arch::Riscv32,
            "riscv64" => Arch::Riscv64,
            _ => return Err(UnknownArchError),
        })
    }
}
