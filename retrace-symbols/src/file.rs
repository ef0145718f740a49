//! The owned, aggregated symbol database built from the records of a symbol
//! file.

use std::collections::BTreeMap;
use std::io::{self, Write};

use retrace_common::{Arch, DebugId};

use crate::ranges::RangeMap;
use crate::records::{
    InfoRecord, StackRecord, StackWinRecordType, SymbolError, SymbolView,
};

/// A source line inside a [`Function`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceLine {
    /// The start address of the covered instruction range.
    pub address: u64,
    /// The size of the covered instruction range.
    pub size: u64,
    /// The line number (zero means no line number).
    pub line: u64,
    /// The file identifier, resolvable via [`SymbolFile::file_name`].
    pub file_id: u64,
}

/// An inlined call inside a [`Function`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inlinee {
    /// Nesting depth, starting at 0 for calls made by the function itself.
    pub depth: u64,
    /// The source line of the call site.
    pub call_line: u64,
    /// The file identifier of the call site.
    pub call_file_id: u64,
    /// The identifier of the inlined function's origin name.
    pub origin_id: u64,
    /// The address ranges covered by the inlined code.
    pub ranges: Vec<(u64, u64)>,
}

impl Inlinee {
    /// Returns true if any of this inlinee's ranges covers the address.
    pub fn covers(&self, address: u64) -> bool {
        self.ranges
            .iter()
            .any(|&(start, size)| address >= start && address < start + size)
    }
}

/// A function with its source line mapping and inlined calls.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Function {
    /// The start address relative to the image base.
    pub address: u64,
    /// The size of the function's code in bytes.
    pub size: u64,
    /// The size of the parameters on the runtime stack.
    pub parameter_size: u64,
    /// The demangled function name.
    pub name: String,
    /// Whether this function shares its address with another symbol.
    pub multiple: bool,
    /// Source lines, sorted by address and non-overlapping.
    pub lines: Vec<SourceLine>,
    /// Inlined calls, in file order.
    pub inlinees: Vec<Inlinee>,
}

impl Function {
    /// Looks up the source line covering the given address.
    pub fn line_for_address(&self, address: u64) -> Option<&SourceLine> {
        let index = match self.lines.binary_search_by_key(&address, |line| line.address) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };

        let line = &self.lines[index];
        (address < line.address + line.size).then_some(line)
    }

    /// Returns the chain of inlined calls covering the given address,
    /// ordered from the outermost call (depth 0) inwards.
    ///
    /// The chain ends at the first depth without a covering inlinee.
    pub fn inline_chain_for_address(&self, address: u64) -> Vec<&Inlinee> {
        let mut chain = Vec::new();
        for depth in 0u64.. {
            match self
                .inlinees
                .iter()
                .find(|inlinee| inlinee.depth == depth && inlinee.covers(address))
            {
                Some(inlinee) => chain.push(inlinee),
                None => break,
            }
        }
        chain
    }
}

/// A public symbol.
///
/// Public symbols carry no size; their extent reaches to the next public
/// symbol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicSymbol {
    /// The symbol's address relative to the image base.
    pub address: u64,
    /// The size of the parameters on the runtime stack.
    pub parameter_size: u64,
    /// The demangled name of the symbol.
    pub name: String,
    /// Whether this symbol shares its address with another symbol.
    pub multiple: bool,
}

/// The CFI rules covering one address range.
///
/// The rules in effect at an address are the initial rules patched by every
/// delta whose address is less than or equal to it, in delta order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CfiRules {
    /// The starting address covered by this record.
    pub start: u64,
    /// The number of bytes covered by this record.
    pub size: u64,
    /// The rules in effect at the start of the range.
    pub init: String,
    /// Rule changes within the range, ordered by address.
    pub deltas: Vec<(u64, String)>,
}

impl CfiRules {
    /// Returns the rule strings applicable at the given address: the initial
    /// rules followed by all deltas up to and including the address.
    pub fn rules_at(&self, address: u64) -> Vec<&str> {
        let mut result = vec![self.init.as_str()];
        result.extend(
            self.deltas
                .iter()
                .take_while(|(delta_address, _)| *delta_address <= address)
                .map(|(_, rules)| rules.as_str()),
        );
        result
    }
}

/// A preserved `STACK WIN` record.
///
/// These records are carried through parsing and writing but are not used
/// for unwinding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WinFrameData {
    /// The record type (`0` for FPO, `4` for frame data).
    pub ty: StackWinRecordType,
    /// The starting address covered by this record.
    pub code_start: u32,
    /// The number of bytes covered by this record.
    pub code_size: u32,
    /// Prologue size in bytes.
    pub prolog_size: u16,
    /// Epilogue size in bytes.
    pub epilog_size: u16,
    /// Argument bytes expected by the function.
    pub params_size: u32,
    /// Bytes used for saved registers.
    pub saved_regs_size: u16,
    /// Bytes used for local variables.
    pub locals_size: u32,
    /// Maximum bytes pushed on the stack.
    pub max_stack_size: u32,
    /// Whether the base pointer is allocated as a general-purpose register.
    pub uses_base_pointer: bool,
    /// The unwind program, for frame data records.
    pub program_string: Option<String>,
}

/// An owned, queryable symbol database for a single module.
///
/// Built by [`parse`](Self::parse) from the text format and serialized back
/// with [`write_to`](Self::write_to). For canonical inputs (records in
/// canonical order, lowercase hex, `\n` line endings) parsing and writing
/// round-trips byte-identically.
///
/// Records whose address ranges overlap a previously aggregated record of
/// the same kind are dropped, preserving the first occurrence; the `m`
/// marker emitted by producers configured to allow address collisions is
/// preserved on the surviving record.
#[derive(Debug, Default)]
pub struct SymbolFile {
    os: String,
    arch: Arch,
    debug_id: DebugId,
    name: String,
    code_id: Option<String>,
    files: BTreeMap<u64, String>,
    inline_origins: BTreeMap<u64, String>,
    functions: RangeMap<u64, Function>,
    publics: Vec<PublicSymbol>,
    cfi: RangeMap<u64, CfiRules>,
    win_frame_data: Vec<WinFrameData>,
}

impl SymbolFile {
    /// Parses and aggregates a symbol file from its raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, SymbolError> {
        let view = SymbolView::parse(data)?;

        let mut file = SymbolFile {
            os: view.os().to_string(),
            arch: view.arch(),
            debug_id: view.debug_id(),
            name: view.name().to_string(),
            ..Default::default()
        };

        for record in view.info_records() {
            if let InfoRecord::CodeId { code_id, .. } = record? {
                if !code_id.is_empty() {
                    file.code_id = Some(code_id.to_string());
                }
            }
        }

        for record in view.file_records() {
            let record = record?;
            file.files.insert(record.id, record.name.to_string());
        }

        for record in view.inline_origin_records() {
            let record = record?;
            file.inline_origins
                .insert(record.id, record.name.to_string());
        }

        for record in view.func_records() {
            let record = record?;

            let mut lines = Vec::new();
            for line in record.lines() {
                lines.push(line?);
            }

            let mut inlinees = Vec::new();
            for inlinee in record.inlinees() {
                inlinees.push(inlinee?);
            }

            let function = Function {
                address: record.address,
                size: record.size,
                parameter_size: record.parameter_size,
                name: record.name.to_string(),
                multiple: record.multiple,
                lines: lines
                    .into_iter()
                    .map(|line| SourceLine {
                        address: line.address,
                        size: line.size,
                        line: line.line,
                        file_id: line.file_id,
                    })
                    .collect(),
                inlinees: inlinees
                    .into_iter()
                    .map(|inlinee| Inlinee {
                        depth: inlinee.depth,
                        call_line: inlinee.call_line,
                        call_file_id: inlinee.call_file_id,
                        origin_id: inlinee.origin_id,
                        ranges: inlinee.ranges,
                    })
                    .collect(),
            };

            let range = function.address..function.address + function.size;
            file.functions.insert(range, function);
        }

        for record in view.public_records() {
            let record = record?;
            file.publics.push(PublicSymbol {
                address: record.address,
                parameter_size: record.parameter_size,
                name: record.name.to_string(),
                multiple: record.multiple,
            });
        }
        file.publics.sort_by_key(|symbol| symbol.address);
        file.publics.dedup_by_key(|symbol| symbol.address);

        for record in view.stack_records() {
            match record? {
                StackRecord::Cfi(record) => {
                    let mut deltas = Vec::new();
                    for delta in record.deltas() {
                        let delta = delta?;
                        deltas.push((delta.address, delta.rules.to_string()));
                    }

                    let rules = CfiRules {
                        start: record.start,
                        size: record.size,
                        init: record.init_rules.to_string(),
                        deltas,
                    };

                    file.cfi.insert(record.start..record.start + record.size, rules);
                }
                StackRecord::Win(record) => {
                    file.win_frame_data.push(WinFrameData {
                        ty: record.ty,
                        code_start: record.code_start,
                        code_size: record.code_size,
                        prolog_size: record.prolog_size,
                        epilog_size: record.epilog_size,
                        params_size: record.params_size,
                        saved_regs_size: record.saved_regs_size,
                        locals_size: record.locals_size,
                        max_stack_size: record.max_stack_size,
                        uses_base_pointer: record.uses_base_pointer,
                        program_string: record.program_string.map(str::to_string),
                    });
                }
            }
        }

        Ok(file)
    }

    /// The operating system this module was built for.
    pub fn os(&self) -> &str {
        &self.os
    }

    /// The CPU architecture of this module.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The debug identifier of this module.
    pub fn debug_id(&self) -> DebugId {
        self.debug_id
    }

    /// The name of the original debug file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The code identifier of this module, if present.
    pub fn code_id(&self) -> Option<&str> {
        self.code_id.as_deref()
    }

    /// Resolves a file identifier to its path.
    pub fn file_name(&self, file_id: u64) -> Option<&str> {
        self.files.get(&file_id).map(String::as_str)
    }

    /// Resolves an inline origin identifier to its function name.
    pub fn inline_origin(&self, origin_id: u64) -> Option<&str> {
        self.inline_origins.get(&origin_id).map(String::as_str)
    }

    /// Looks up the function covering the given address.
    ///
    /// Lookup resolves half-open ranges: an address at the shared boundary
    /// of two adjacent functions belongs to the later one.
    pub fn function_for_address(&self, address: u64) -> Option<&Function> {
        self.functions.get_contents(address)
    }

    /// Looks up the public symbol closest below the given address.
    ///
    /// Public symbols have no extent, so this is a nearest-predecessor
    /// search. Prefer [`function_for_address`](Self::function_for_address);
    /// publics only apply when no function covers the address.
    pub fn public_for_address(&self, address: u64) -> Option<&PublicSymbol> {
        let index = match self
            .publics
            .binary_search_by_key(&address, |symbol| symbol.address)
        {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };

        self.publics.get(index)
    }

    /// Looks up the CFI rules covering the given address.
    pub fn cfi_rules_for_address(&self, address: u64) -> Option<&CfiRules> {
        self.cfi.get_contents(address)
    }

    /// Returns true if this module carries any CFI records.
    pub fn has_cfi(&self) -> bool {
        !self.cfi.is_empty()
    }

    /// Returns an iterator over all functions, ordered by address.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().map(|(_, function)| function)
    }

    /// Returns all public symbols, ordered by address.
    pub fn publics(&self) -> &[PublicSymbol] {
        &self.publics
    }

    /// Serializes this database into the canonical text form.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(
            writer,
            "MODULE {} {} {} {}",
            self.os,
            self.arch.name(),
            self.debug_id.breakpad(),
            self.name
        )?;

        if let Some(ref code_id) = self.code_id {
            writeln!(writer, "INFO CODE_ID {}", code_id)?;
        }

        for (id, name) in &self.files {
            writeln!(writer, "FILE {} {}", id, name)?;
        }

        for (id, name) in &self.inline_origins {
            writeln!(writer, "INLINE_ORIGIN {} {}", id, name)?;
        }

        for function in self.functions() {
            let multiple = if function.multiple { "m " } else { "" };
            writeln!(
                writer,
                "FUNC {}{:x} {:x} {:x} {}",
                multiple, function.address, function.size, function.parameter_size, function.name
            )?;

            for inlinee in &function.inlinees {
                write!(
                    writer,
                    "INLINE {} {} {} {}",
                    inlinee.depth, inlinee.call_line, inlinee.call_file_id, inlinee.origin_id
                )?;
                for (address, size) in &inlinee.ranges {
                    write!(writer, " {:x} {:x}", address, size)?;
                }
                writeln!(writer)?;
            }

            for line in &function.lines {
                writeln!(
                    writer,
                    "{:x} {:x} {} {}",
                    line.address, line.size, line.line, line.file_id
                )?;
            }
        }

        for symbol in &self.publics {
            let multiple = if symbol.multiple { "m " } else { "" };
            writeln!(
                writer,
                "PUBLIC {}{:x} {:x} {}",
                multiple, symbol.address, symbol.parameter_size, symbol.name
            )?;
        }

        for (_, rules) in self.cfi.iter() {
            writeln!(
                writer,
                "STACK CFI INIT {:x} {:x} {}",
                rules.start, rules.size, rules.init
            )?;

            for (address, delta) in &rules.deltas {
                writeln!(writer, "STACK CFI {:x} {}", address, delta)?;
            }
        }

        for record in &self.win_frame_data {
            write!(
                writer,
                "STACK WIN {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} ",
                record.ty as u32,
                record.code_start,
                record.code_size,
                record.prolog_size,
                record.epilog_size,
                record.params_size,
                record.saved_regs_size,
                record.locals_size,
                record.max_stack_size,
            )?;

            match record.program_string {
                Some(ref program) => writeln!(writer, "1 {}", program)?,
                None => writeln!(
                    writer,
                    "0 {}",
                    if record.uses_base_pointer { "1" } else { "0" }
                )?,
            }
        }

        Ok(())
    }

    /// Serializes this database into a byte vector in canonical text form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)
            .expect("writing to a Vec cannot fail");
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    const CANONICAL: &str = "\
MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 a.out
INFO CODE_ID d46e2ed4
FILE 0 src/main.c
FILE 1 src/util.c
INLINE_ORIGIN 0 tiny_helper
FUNC 1000 30 0 main
INLINE 0 12 0 0 1008 8
1000 8 11 0
1008 8 3 1
1010 20 13 0
FUNC m 1030 10 4 shared_addr_fn
1030 10 21 1
PUBLIC 2000 0 _start
PUBLIC m 2100 8 thunk
STACK CFI INIT 1000 30 .cfa: $esp 4 + $eip: .cfa 4 - ^
STACK CFI 1001 .cfa: $esp 8 +
STACK CFI 1002 $ebx: .cfa 12 - ^
STACK WIN 4 2170 14 1 0 0 0 0 0 1 $eip $esp ^ = $esp $esp 4 + =
";

    #[test]
    fn test_parse_aggregates() {
        let file = SymbolFile::parse(CANONICAL.as_bytes()).unwrap();

        assert_eq!(file.os(), "Linux");
        assert_eq!(file.arch(), Arch::X86);
        assert_eq!(file.name(), "a.out");
        assert_eq!(file.code_id(), Some("d46e2ed4"));
        assert_eq!(file.file_name(1), Some("src/util.c"));
        assert_eq!(file.inline_origin(0), Some("tiny_helper"));

        let main = file.function_for_address(0x1015).unwrap();
        assert_eq!(main.name, "main");
        assert_eq!(main.lines.len(), 3);

        let line = main.line_for_address(0x1012).unwrap();
        assert_eq!(line.line, 13);

        let chain = main.inline_chain_for_address(0x100a);
        assert_eq!(chain.len(), 1);
        assert_eq!(file.inline_origin(chain[0].origin_id), Some("tiny_helper"));
        assert!(main.inline_chain_for_address(0x1000).is_empty());
    }

    #[test]
    fn test_function_boundary_resolves_to_later() {
        let data = b"\
MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 a.out
FUNC 1000 10 0 first
FUNC 1010 10 0 second
";
        let file = SymbolFile::parse(data).unwrap();
        assert_eq!(file.function_for_address(0x1010).unwrap().name, "second");
        assert_eq!(file.function_for_address(0x100f).unwrap().name, "first");
    }

    #[test]
    fn test_public_nearest_predecessor() {
        let file = SymbolFile::parse(CANONICAL.as_bytes()).unwrap();

        assert_eq!(file.public_for_address(0x2050).unwrap().name, "_start");
        assert_eq!(file.public_for_address(0x2100).unwrap().name, "thunk");
        assert_eq!(file.public_for_address(0x1fff), None);
    }

    #[test]
    fn test_cfi_rules() {
        let file = SymbolFile::parse(CANONICAL.as_bytes()).unwrap();

        let rules = file.cfi_rules_for_address(0x1001).unwrap();
        assert_eq!(
            rules.rules_at(0x1001),
            vec![".cfa: $esp 4 + $eip: .cfa 4 - ^", ".cfa: $esp 8 +"]
        );
        assert_eq!(rules.rules_at(0x1000).len(), 1);
        assert_eq!(rules.rules_at(0x102f).len(), 3);

        assert!(file.cfi_rules_for_address(0x1030).is_none());
        assert!(file.has_cfi());
    }

    #[test]
    fn test_write_parse_roundtrip_byte_identical() {
        let file = SymbolFile::parse(CANONICAL.as_bytes()).unwrap();
        let written = file.to_bytes();
        assert_eq!(String::from_utf8(written.clone()).unwrap(), CANONICAL);

        // And once more through the parser for good measure.
        let reparsed = SymbolFile::parse(&written).unwrap();
        assert_eq!(reparsed.to_bytes(), written);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn arb_name() -> impl Strategy<Value = String> {
            proptest::string::string_regex("[a-zA-Z_][a-zA-Z0-9_:<>() ]{0,24}[a-zA-Z0-9_>)]")
                .unwrap()
        }

        fn arb_functions() -> impl Strategy<Value = Vec<(u64, u64, u64, String)>> {
            // Disjoint ranges by construction: each entry is (gap, size).
            proptest::collection::vec(
                (1u64..0x100, 1u64..0x100, 0u64..16, arb_name()),
                0..8,
            )
            .prop_map(|entries| {
                let mut address = 0x1000;
                let mut functions = Vec::new();
                for (gap, size, param, name) in entries {
                    address += gap;
                    functions.push((address, size, param, name));
                    address += size;
                }
                functions
            })
        }

        proptest! {
            // Building a synthetic symbol file, writing it, parsing it and
            // writing it again must produce identical bytes.
            #[test]
            fn proptest_write_parse_write(functions in arb_functions()) {
                let mut data = String::from(
                    "MODULE Linux x86_64 492E2DD23CC306CA9C494EEF1533A3810 a.out\n",
                );
                for (address, size, param, name) in &functions {
                    data.push_str(&format!("FUNC {:x} {:x} {:x} {}\n", address, size, param, name));
                }

                let parsed = SymbolFile::parse(data.as_bytes()).unwrap();
                let written = parsed.to_bytes();
                prop_assert_eq!(String::from_utf8(written.clone()).unwrap(), data);

                let reparsed = SymbolFile::parse(&written).unwrap();
                prop_assert_eq!(reparsed.to_bytes(), written);
            }
        }
    }
}
