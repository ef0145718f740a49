//! Zero-copy record types and iterators over the raw bytes of a symbol file.
//!
//! Every record type has a `parse` constructor taking a single line of input
//! and an iterator type that skips ahead to the next record of its kind. The
//! iterators exploit the canonical record order (header records first, then
//! functions and publics, then stack records) to stop early where possible.

use std::fmt;
use std::str;

use thiserror::Error;

use retrace_common::{Arch, DebugId, ParseDebugIdError};

use crate::lines::Lines;

/// Length at which the symbol file header will be capped.
///
/// This is a protection against scanning an entire symbol file for a line
/// break if the first characters do not contain one.
const HEADER_CAP: usize = 320;

/// Placeholder used for missing function or symbol names.
const UNKNOWN_NAME: &str = "<unknown>";

/// The kinds of records in a symbol file.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    /// A `FILE` record.
    File,
    /// A `FUNC` record.
    Func,
    /// An `INFO` record.
    Info,
    /// An `INLINE` record.
    Inline,
    /// An `INLINE_ORIGIN` record.
    InlineOrigin,
    /// A source line record.
    Line,
    /// The `MODULE` header record.
    Module,
    /// A `PUBLIC` record.
    Public,
    /// A `STACK CFI` delta record.
    StackCfiDelta,
    /// A `STACK CFI INIT` record.
    StackCfiInit,
    /// A `STACK WIN` record.
    StackWin,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::File => write!(f, "FILE"),
            RecordType::Func => write!(f, "FUNC"),
            RecordType::Info => write!(f, "INFO"),
            RecordType::Inline => write!(f, "INLINE"),
            RecordType::InlineOrigin => write!(f, "INLINE_ORIGIN"),
            RecordType::Line => write!(f, "LINE"),
            RecordType::Module => write!(f, "MODULE"),
            RecordType::Public => write!(f, "PUBLIC"),
            RecordType::StackCfiDelta => write!(f, "STACK CFI"),
            RecordType::StackCfiInit => write!(f, "STACK CFI INIT"),
            RecordType::StackWin => write!(f, "STACK WIN"),
        }
    }
}

/// An error with position information, raised when a single record fails to
/// parse.
#[derive(Clone, Debug)]
pub struct ParseSymbolError {
    message: &'static str,
    input: String,
}

impl fmt::Display for ParseSymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if f.alternate() {
            write!(f, "\n\n{}", self.input)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseSymbolError {}

/// The error kind for [`SymbolError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolErrorKind {
    /// The symbol header (`MODULE` record) is missing.
    InvalidMagic,

    /// A part of the file is not encoded in valid UTF-8.
    BadEncoding,

    /// Parsing of a record failed.
    Parse(RecordType),

    /// The debug id is not valid.
    InvalidDebugId,
}

impl fmt::Display for SymbolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "missing symbol file header"),
            Self::BadEncoding => write!(f, "bad utf-8 sequence"),
            Self::Parse(ty) => write!(f, "failed to parse {} record", ty),
            Self::InvalidDebugId => write!(f, "invalid debug id"),
        }
    }
}

/// An error when dealing with symbol files.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct SymbolError {
    kind: SymbolErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SymbolError {
    /// Creates a new symbol error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: SymbolErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`SymbolErrorKind`] for this error.
    pub fn kind(&self) -> SymbolErrorKind {
        self.kind
    }
}

impl From<SymbolErrorKind> for SymbolError {
    fn from(kind: SymbolErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<str::Utf8Error> for SymbolError {
    fn from(e: str::Utf8Error) -> Self {
        Self::new(SymbolErrorKind::BadEncoding, e)
    }
}

impl From<ParseDebugIdError> for SymbolError {
    fn from(e: ParseDebugIdError) -> Self {
        Self::new(SymbolErrorKind::InvalidDebugId, e)
    }
}

fn next(input: &str) -> Result<(&str, &str), &'static str> {
    if input.is_empty() {
        return Err("unexpected end of input");
    }

    Ok(match input.find(char::is_whitespace) {
        Some(split) => (&input[..split], input[split..].trim_start()),
        None => (input, ""),
    })
}

fn expect<'a>(input: &'a str, prefix: &str) -> Result<&'a str, &'static str> {
    match input.strip_prefix(prefix) {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
            Ok(rest.trim_start())
        }
        _ => Err("unexpected record prefix"),
    }
}

fn next_and<'a, T, F>(input: &'a str, mut parser: F) -> Result<(T, &'a str), &'static str>
where
    F: FnMut(&str) -> Result<T, &'static str>,
{
    next(input).and_then(|(part, rest)| Ok((parser(part)?, rest)))
}

fn parse_hex64(input: &str) -> Result<u64, &'static str> {
    u64::from_str_radix(input, 16).or(Err("expected hex number"))
}

fn parse_hex32(input: &str) -> Result<u32, &'static str> {
    u32::from_str_radix(input, 16).or(Err("expected hex number"))
}

fn parse_hex16(input: &str) -> Result<u16, &'static str> {
    u16::from_str_radix(input, 16).or(Err("expected hex number"))
}

fn parse_u64(input: &str) -> Result<u64, &'static str> {
    input.parse().or(Err("expected number"))
}

fn parse_line_number(input: &str) -> Result<u64, &'static str> {
    // Some producers emit negative line numbers for compiler-generated code;
    // clamp those to zero, which means "no line number".
    let line = input.parse::<i64>().or(Err("expected line number"))?;
    Ok(line.max(0) as u64)
}

fn hex_str(input: &str) -> Result<&str, &'static str> {
    if !input.is_empty() && input.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(input)
    } else {
        Err("expected hex identifier")
    }
}

fn done(input: &str) -> Result<(), &'static str> {
    match input {
        "" => Ok(()),
        _ => Err("unexpected trailing data"),
    }
}

trait ParseRecord<'d>: Sized {
    const RECORD_TYPE: RecordType;

    fn parse_str(input: &'d str) -> Result<Self, &'static str>;

    fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        let string = str::from_utf8(data)?;
        debug_assert!(!string.contains('\n'), "illegal input: {}", string);

        Self::parse_str(string).map_err(|message| {
            let source = ParseSymbolError {
                message,
                input: string.to_owned(),
            };

            SymbolError::new(SymbolErrorKind::Parse(Self::RECORD_TYPE), source)
        })
    }
}

/// A module record, constituting the header of a symbol file.
///
/// Example: `MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 firefox-bin`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModuleRecord<'d> {
    /// Name of the operating system.
    pub os: &'d str,
    /// Name of the CPU architecture.
    pub arch: &'d str,
    /// The debug identifier in its compact hexadecimal form.
    pub id: &'d str,
    /// Name of the original debug file.
    ///
    /// This usually corresponds to the debug file (such as a PDB), but might
    /// not necessarily have a special file extension.
    pub name: &'d str,
}

impl<'d> ModuleRecord<'d> {
    /// Parses a module record from a single line.
    ///
    /// The input may be an entire symbol file; only its first line is
    /// considered.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        let input = str::from_utf8(data)?;

        let go = |input: &'d str| {
            let input = input.lines().next().ok_or("expected module record")?;
            let current = expect(input, "MODULE")?;

            let mut parts = current.splitn(4, char::is_whitespace);

            let os = parts.next().ok_or("expected os")?;
            let arch = parts.next().ok_or("expected arch")?;
            let id = hex_str(parts.next().ok_or("expected id")?)?;
            let name = parts.next().unwrap_or(UNKNOWN_NAME);

            Ok(ModuleRecord { os, arch, id, name })
        };

        go(input).map_err(|message: &'static str| {
            SymbolError::new(
                SymbolErrorKind::Parse(RecordType::Module),
                ParseSymbolError {
                    message,
                    input: input.to_owned(),
                },
            )
        })
    }
}

/// An information record following the module header.
///
/// Only the `CODE_ID` scope is interpreted; it carries the
/// platform-dependent original code identifier of the object file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InfoRecord<'d> {
    /// Information on the code file.
    CodeId {
        /// Identifier of the code file.
        code_id: &'d str,
        /// File name of the code file.
        code_file: &'d str,
    },
    /// Any other INFO record.
    Other {
        /// The scope of this info record.
        scope: &'d str,
        /// The information for this scope.
        info: &'d str,
    },
}

impl<'d> ParseRecord<'d> for InfoRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::Info;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let current = expect(input, "INFO")?;

        if let Ok(rest) = expect(current, "CODE_ID") {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let code_id = hex_str(parts.next().ok_or("expected code id")?)?;
            let code_file = parts.next().unwrap_or("");
            Ok(InfoRecord::CodeId { code_id, code_file })
        } else {
            let mut parts = current.splitn(2, char::is_whitespace);
            let scope = parts.next().ok_or("expected scope")?;
            let info = parts.next().unwrap_or("");
            Ok(InfoRecord::Other { scope, info })
        }
    }
}

impl<'d> InfoRecord<'d> {
    /// Parses an info record from a single line.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

/// An iterator over info records in a symbol file.
#[derive(Clone, Debug)]
pub struct InfoRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> Iterator for InfoRecords<'d> {
    type Item = Result<InfoRecord<'d>, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        while let Some(line) = self.lines.next() {
            if line.starts_with(b"MODULE ") {
                continue;
            }

            // INFO records come right after the header.
            if !line.starts_with(b"INFO ") {
                break;
            }

            return Some(InfoRecord::parse(line));
        }

        self.finished = true;
        None
    }
}

/// A file record, specifying the path to a source code file.
///
/// The ID of this record is referenced by [`LineRecord`]. File records are
/// not necessarily consecutive or sorted by their identifier.
///
/// Example: `FILE 2 src/processor/walker.rs`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileRecord<'d> {
    /// The file's internal identifier.
    pub id: u64,
    /// The path to the source file, usually relative to the compilation
    /// directory.
    pub name: &'d str,
}

impl<'d> ParseRecord<'d> for FileRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::File;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let current = expect(input, "FILE")?;
        let mut parts = current.splitn(2, char::is_whitespace);

        let id = parse_u64(parts.next().ok_or("expected file id")?)?;
        let name = parts.next().unwrap_or(UNKNOWN_NAME);

        Ok(FileRecord { id, name })
    }
}

impl<'d> FileRecord<'d> {
    /// Parses a file record from a single line.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

/// An iterator over file records in a symbol file.
#[derive(Clone, Debug)]
pub struct FileRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> Iterator for FileRecords<'d> {
    type Item = Result<FileRecord<'d>, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        for line in self.lines.by_ref() {
            if line.starts_with(b"MODULE ") || line.starts_with(b"INFO ") {
                continue;
            }

            // FILE records come before all FUNC and stack records, but may be
            // interleaved with INLINE_ORIGIN records.
            if line.starts_with(b"INLINE_ORIGIN ") {
                continue;
            }

            if !line.starts_with(b"FILE ") {
                break;
            }

            return Some(FileRecord::parse(line));
        }

        self.finished = true;
        None
    }
}

/// An inline origin record, naming a function that has been inlined.
///
/// The ID of this record is referenced by [`InlineRecord`]s.
///
/// Example: `INLINE_ORIGIN 1 memcpy`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InlineOriginRecord<'d> {
    /// The origin's internal identifier.
    pub id: u64,
    /// The demangled name of the inlined function.
    pub name: &'d str,
}

impl<'d> ParseRecord<'d> for InlineOriginRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::InlineOrigin;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let current = expect(input, "INLINE_ORIGIN")?;
        let mut parts = current.splitn(2, char::is_whitespace);

        let id = parse_u64(parts.next().ok_or("expected origin id")?)?;
        let name = parts.next().unwrap_or(UNKNOWN_NAME);

        Ok(InlineOriginRecord { id, name })
    }
}

impl<'d> InlineOriginRecord<'d> {
    /// Parses an inline origin record from a single line.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

/// An iterator over inline origin records in a symbol file.
#[derive(Clone, Debug)]
pub struct InlineOriginRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> Iterator for InlineOriginRecords<'d> {
    type Item = Result<InlineOriginRecord<'d>, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        for line in self.lines.by_ref() {
            if line.starts_with(b"MODULE ")
                || line.starts_with(b"INFO ")
                || line.starts_with(b"FILE ")
            {
                continue;
            }

            if !line.starts_with(b"INLINE_ORIGIN ") {
                break;
            }

            return Some(InlineOriginRecord::parse(line));
        }

        self.finished = true;
        None
    }
}

/// A function record including line and inlinee information.
///
/// Example: `FUNC m c184 30 0 process_stack_frame`
#[derive(Clone, Default)]
pub struct FuncRecord<'d> {
    /// Whether this function was referenced multiple times.
    pub multiple: bool,
    /// The start address of this function relative to the image base.
    pub address: u64,
    /// The size of the code covered by this function's line records.
    pub size: u64,
    /// The size of the parameters on the runtime stack.
    pub parameter_size: u64,
    /// The demangled function name.
    pub name: &'d str,
    lines: Lines<'d>,
}

impl<'d> FuncRecord<'d> {
    /// Parses a function record from a single line.
    ///
    /// To iterate over the line and inlinee records that follow, obtain the
    /// record from [`FuncRecords`] instead.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }

    /// Returns an iterator over source line records associated to this
    /// function.
    pub fn lines(&self) -> LineRecords<'d> {
        LineRecords {
            lines: self.lines.clone(),
            finished: false,
        }
    }

    /// Returns an iterator over inlinee records associated to this function.
    pub fn inlinees(&self) -> InlineRecords<'d> {
        InlineRecords {
            lines: self.lines.clone(),
            finished: false,
        }
    }
}

impl<'d> ParseRecord<'d> for FuncRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::Func;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let rest = expect(input, "FUNC")?;

        let (multiple, rest) = match expect(rest, "m") {
            Ok(new_rest) => (true, new_rest),
            Err(_) => (false, rest),
        };

        let (address, rest) = next_and(rest, parse_hex64)?;
        let (size, rest) = next_and(rest, parse_hex64)?;
        let (parameter_size, mut name) = next_and(rest, parse_hex64)?;

        if name.is_empty() {
            name = UNKNOWN_NAME;
        }

        Ok(FuncRecord {
            multiple,
            address,
            size,
            parameter_size,
            name,
            lines: Lines::default(),
        })
    }
}

impl PartialEq for FuncRecord<'_> {
    fn eq(&self, other: &FuncRecord<'_>) -> bool {
        self.multiple == other.multiple
            && self.address == other.address
            && self.size == other.size
            && self.parameter_size == other.parameter_size
            && self.name == other.name
    }
}

impl Eq for FuncRecord<'_> {}

impl fmt::Debug for FuncRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncRecord")
            .field("multiple", &self.multiple)
            .field("address", &self.address)
            .field("size", &self.size)
            .field("parameter_size", &self.parameter_size)
            .field("name", &self.name)
            .finish()
    }
}

/// An iterator over function records in a symbol file.
#[derive(Clone, Debug)]
pub struct FuncRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> Iterator for FuncRecords<'d> {
    type Item = Result<FuncRecord<'d>, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        while let Some(line) = self.lines.next() {
            // FUNC records are always before stack records. Once the first
            // stack record is encountered, there is nothing left to find.
            if line.starts_with(b"STACK ") {
                break;
            }

            if !line.starts_with(b"FUNC ") {
                continue;
            }

            let mut record = FuncRecord::parse(line);
            if let Ok(ref mut record) = record {
                record.lines = self.lines.clone();
            }
            return Some(record);
        }

        self.finished = true;
        None
    }
}

/// A source line record associated to a [`FuncRecord`].
///
/// Line records are so frequent that they do not carry a record identifier.
/// They immediately follow the function record they belong to, which is why
/// an iterator over them is obtained from [`FuncRecord::lines`].
///
/// Example: `c184 7 59 4`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineRecord {
    /// The start address for this line relative to the image base.
    pub address: u64,
    /// The size of the code covered by this line record.
    pub size: u64,
    /// The line number (zero means no line number).
    pub line: u64,
    /// Identifier of the [`FileRecord`] specifying the file name.
    pub file_id: u64,
}

impl LineRecord {
    /// Parses a line record from a single line of input.
    pub fn parse(data: &[u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

impl<'d> ParseRecord<'d> for LineRecord {
    const RECORD_TYPE: RecordType = RecordType::Line;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let (address, rest) = next_and(input, parse_hex64)?;
        let (size, rest) = next_and(rest, parse_hex64)?;
        let (line, rest) = next_and(rest, parse_line_number)?;
        let (file_id, rest) = next_and(rest, parse_u64)?;
        done(rest)?;

        Ok(LineRecord {
            address,
            size,
            line,
            file_id,
        })
    }
}

/// An iterator over line records of a [`FuncRecord`].
#[derive(Clone, Debug)]
pub struct LineRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> Iterator for LineRecords<'d> {
    type Item = Result<LineRecord, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        for line in self.lines.by_ref() {
            // Stop parsing line records once other record types are
            // encountered.
            if line.starts_with(b"FUNC ")
                || line.starts_with(b"PUBLIC ")
                || line.starts_with(b"STACK ")
            {
                break;
            }

            // Inlinee records are interleaved into the function body and are
            // iterated separately. This also covers stray INLINE_ORIGIN
            // records.
            if line.starts_with(b"INLINE") {
                continue;
            }

            // There might be empty lines throughout the file (or at the
            // end). This is the only iterator that cannot rely on a record
            // identifier, so empty lines must be skipped explicitly.
            if line.is_empty() {
                continue;
            }

            let record = match LineRecord::parse(line) {
                Ok(record) => record,
                Err(error) => return Some(Err(error)),
            };

            // Skip line records for empty ranges. These carry no information.
            if record.size > 0 {
                return Some(Ok(record));
            }
        }

        self.finished = true;
        None
    }
}

/// An inlinee record associated to a [`FuncRecord`].
///
/// Each record describes one inlined call within the function: the nesting
/// depth, the source position of the call site, the identity of the inlined
/// function (via [`InlineOriginRecord`]), and one or more address ranges
/// covered by the inlined code.
///
/// Example: `INLINE 0 59 4 1 c184 10 c1a4 8`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InlineRecord {
    /// The nesting depth of this inlined call, starting at 0 for calls made
    /// by the function itself.
    pub depth: u64,
    /// The source line of the call site.
    pub call_line: u64,
    /// Identifier of the [`FileRecord`] containing the call site.
    pub call_file_id: u64,
    /// Identifier of the [`InlineOriginRecord`] naming the inlined function.
    pub origin_id: u64,
    /// The address ranges covered by this inlined call, as `(address, size)`
    /// pairs.
    pub ranges: Vec<(u64, u64)>,
}

impl InlineRecord {
    /// Parses an inlinee record from a single line.
    pub fn parse(data: &[u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

impl<'d> ParseRecord<'d> for InlineRecord {
    const RECORD_TYPE: RecordType = RecordType::Inline;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let rest = expect(input, "INLINE")?;

        let (depth, rest) = next_and(rest, parse_u64)?;
        let (call_line, rest) = next_and(rest, parse_line_number)?;
        let (call_file_id, rest) = next_and(rest, parse_u64)?;
        let (origin_id, mut rest) = next_and(rest, parse_u64)?;

        let mut ranges = Vec::new();
        while !rest.is_empty() {
            let (address, new_rest) = next_and(rest, parse_hex64)?;
            let (size, new_rest) = next_and(new_rest, parse_hex64)?;
            ranges.push((address, size));
            rest = new_rest;
        }

        if ranges.is_empty() {
            return Err("expected at least one address range");
        }

        Ok(InlineRecord {
            depth,
            call_line,
            call_file_id,
            origin_id,
            ranges,
        })
    }
}

/// An iterator over inlinee records of a [`FuncRecord`].
#[derive(Clone, Debug)]
pub struct InlineRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> Iterator for InlineRecords<'d> {
    type Item = Result<InlineRecord, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        for line in self.lines.by_ref() {
            if line.starts_with(b"FUNC ")
                || line.starts_with(b"PUBLIC ")
                || line.starts_with(b"STACK ")
            {
                break;
            }

            if !line.starts_with(b"INLINE ") {
                continue;
            }

            return Some(InlineRecord::parse(line));
        }

        self.finished = true;
        None
    }
}

/// A public function symbol record.
///
/// Public records only carry a start address; their extent reaches to the
/// next public symbol.
///
/// Example: `PUBLIC m 2160 0 Public2_1`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublicRecord<'d> {
    /// Whether this symbol was referenced multiple times.
    pub multiple: bool,
    /// The address of this symbol relative to the image base.
    pub address: u64,
    /// The size of the parameters on the runtime stack.
    pub parameter_size: u64,
    /// The demangled name of the symbol.
    pub name: &'d str,
}

impl<'d> ParseRecord<'d> for PublicRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::Public;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let rest = expect(input, "PUBLIC")?;

        let (multiple, rest) = match expect(rest, "m") {
            Ok(new_rest) => (true, new_rest),
            Err(_) => (false, rest),
        };

        let (address, rest) = next_and(rest, parse_hex64)?;
        let (parameter_size, mut name) = next_and(rest, parse_hex64)?;

        if name.is_empty() {
            name = UNKNOWN_NAME;
        }

        Ok(PublicRecord {
            multiple,
            address,
            parameter_size,
            name,
        })
    }
}

impl<'d> PublicRecord<'d> {
    /// Parses a public symbol record from a single line.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

/// An iterator over public symbol records in a symbol file.
#[derive(Clone, Debug)]
pub struct PublicRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> Iterator for PublicRecords<'d> {
    type Item = Result<PublicRecord<'d>, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        while let Some(line) = self.lines.next() {
            // PUBLIC records are always before stack records. Once the first
            // stack record is encountered, there is nothing left to find.
            if line.starts_with(b"STACK ") {
                break;
            }

            if !line.starts_with(b"PUBLIC ") {
                continue;
            }

            return Some(PublicRecord::parse(line));
        }

        self.finished = true;
        None
    }
}

/// A `STACK CFI` delta record. Always associated with a [`StackCfiRecord`].
///
/// Example: `STACK CFI 804c4b1 .cfa: $esp 8 + $ebp: .cfa 8 - ^`
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct StackCfiDeltaRecord<'d> {
    /// The address from which this delta applies.
    pub address: u64,

    /// The unwind rules that change at this address.
    pub rules: &'d str,
}

impl<'d> ParseRecord<'d> for StackCfiDeltaRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::StackCfiDelta;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let current = expect(input, "STACK")?;
        let current = expect(current, "CFI")?;

        let mut parts = current.splitn(2, char::is_whitespace);

        let address = parse_hex64(parts.next().ok_or("expected address")?)?;
        let rules = parts.next().ok_or("expected rules")?;

        Ok(StackCfiDeltaRecord { address, rules })
    }
}

impl<'d> StackCfiDeltaRecord<'d> {
    /// Parses a single `STACK CFI` delta record.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

/// A call frame information record for platforms other than Windows x86.
///
/// This bundles together a `STACK CFI INIT` record and its associated
/// `STACK CFI` delta records.
///
/// Example: `STACK CFI INIT 804c4b0 40 .cfa: $esp 4 + $eip: .cfa 4 - ^`
#[derive(Clone, Debug, Default)]
pub struct StackCfiRecord<'d> {
    /// The starting address covered by this record.
    pub start: u64,

    /// The number of bytes covered by this record.
    pub size: u64,

    /// The unwind rules in effect at the start of the range.
    pub init_rules: &'d str,

    /// The `STACK CFI` delta records belonging to this record.
    deltas: Lines<'d>,
}

impl<'d> ParseRecord<'d> for StackCfiRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::StackCfiInit;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let current = expect(input, "STACK")?;
        let current = expect(current, "CFI")?;
        let current = expect(current, "INIT")?;

        let mut parts = current.splitn(3, char::is_whitespace);

        let start = parse_hex64(parts.next().ok_or("expected start")?)?;
        let size = parse_hex64(parts.next().ok_or("expected size")?)?;
        let init_rules = parts.next().ok_or("expected init rules")?;

        Ok(StackCfiRecord {
            start,
            size,
            init_rules,
            deltas: Lines::default(),
        })
    }
}

impl<'d> StackCfiRecord<'d> {
    /// Parses a `STACK CFI INIT` record from a single line.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }

    /// Returns an iterator over this record's delta records.
    pub fn deltas(&self) -> StackCfiDeltaRecords<'d> {
        StackCfiDeltaRecords {
            lines: self.deltas.clone(),
        }
    }
}

impl<'d> PartialEq for StackCfiRecord<'d> {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.size == other.size && self.init_rules == other.init_rules
    }
}

impl<'d> Eq for StackCfiRecord<'d> {}

/// An iterator over the delta records of a [`StackCfiRecord`].
#[derive(Clone, Debug, Default)]
pub struct StackCfiDeltaRecords<'d> {
    lines: Lines<'d>,
}

impl<'d> Iterator for StackCfiDeltaRecords<'d> {
    type Item = Result<StackCfiDeltaRecord<'d>, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(line) = self.lines.next() {
            if line.starts_with(b"STACK CFI INIT") || !line.starts_with(b"STACK CFI") {
                self.lines = Lines::default();
            } else {
                return Some(StackCfiDeltaRecord::parse(line));
            }
        }

        None
    }
}

/// Possible types of data held by a [`StackWinRecord`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackWinRecordType {
    /// Frame pointer omitted; FPO info available.
    Fpo = 0,

    /// Frame pointer omitted; frame data info available.
    FrameData = 4,
}

/// A Windows stack frame record, used on x86.
///
/// These records carry the frame layout that Windows toolchains describe in
/// place of CFI: the byte counts of the prologue, epilogue, arguments,
/// saved registers and locals, followed by either an unwind program or a
/// flag telling whether the base pointer was repurposed.
///
/// Example: `STACK WIN 4 2170 14 1 0 0 0 0 0 1 $eip 4 + ^ = $esp $ebp 8 + = $ebp $ebp ^ =`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackWinRecord<'d> {
    /// The type of frame data this record holds.
    pub ty: StackWinRecordType,

    /// The starting address covered by this record, relative to the module's
    /// load address.
    pub code_start: u32,

    /// The number of bytes covered by this record.
    pub code_size: u32,

    /// Bytes of prologue machine code at the start of the range.
    pub prolog_size: u16,

    /// Bytes of epilogue machine code at the end of the range.
    pub epilog_size: u16,

    /// Bytes of arguments this function expects from its caller.
    pub params_size: u32,

    /// Bytes used to save callee-saves registers.
    pub saved_regs_size: u16,

    /// Bytes used for the function's local variables.
    pub locals_size: u32,

    /// The maximum number of bytes pushed on the stack in the frame.
    pub max_stack_size: u32,

    /// Whether the function repurposes the base pointer register as a
    /// general-purpose register.
    ///
    /// Only meaningful for [`Fpo`](StackWinRecordType::Fpo) records.
    pub uses_base_pointer: bool,

    /// A program for recovering the caller's register values.
    ///
    /// Only expected on [`FrameData`](StackWinRecordType::FrameData)
    /// records.
    pub program_string: Option<&'d str>,
}

fn stack_win_record_type(input: &str) -> Result<StackWinRecordType, &'static str> {
    match input {
        "0" => Ok(StackWinRecordType::Fpo),
        "4" => Ok(StackWinRecordType::FrameData),
        _ => Err("unsupported stack win record type"),
    }
}

impl<'d> ParseRecord<'d> for StackWinRecord<'d> {
    const RECORD_TYPE: RecordType = RecordType::StackWin;

    fn parse_str(input: &'d str) -> Result<Self, &'static str> {
        let current = expect(input, "STACK")?;
        let current = expect(current, "WIN")?;

        // Ten fixed header fields, then a trailer that is either the unwind
        // program (which contains spaces itself) or the base pointer flag.
        let mut parts = current.splitn(11, char::is_whitespace);
        let mut header = [""; 10];
        for slot in header.iter_mut() {
            *slot = parts.next().ok_or("truncated header")?;
        }
        let trailer = parts.next().ok_or("expected program string or flag")?;

        // The tenth header field selects the meaning of the trailer.
        let (program_string, uses_base_pointer) = match header[9] {
            "0" => (None, trailer != "0"),
            _ => (Some(trailer), false),
        };

        Ok(StackWinRecord {
            ty: stack_win_record_type(header[0])?,
            code_start: parse_hex32(header[1])?,
            code_size: parse_hex32(header[2])?,
            prolog_size: parse_hex16(header[3])?,
            epilog_size: parse_hex16(header[4])?,
            params_size: parse_hex32(header[5])?,
            saved_regs_size: parse_hex16(header[6])?,
            locals_size: parse_hex32(header[7])?,
            max_stack_size: parse_hex32(header[8])?,
            uses_base_pointer,
            program_string,
        })
    }
}

impl<'d> StackWinRecord<'d> {
    /// Parses a Windows stack record from a single line.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        ParseRecord::parse(data)
    }
}

/// Stack frame information record used for unwinding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StackRecord<'d> {
    /// CFI stack record, used for all platforms other than Windows x86.
    Cfi(StackCfiRecord<'d>),
    /// Windows stack record, used for x86 binaries.
    Win(StackWinRecord<'d>),
}

impl<'d> StackRecord<'d> {
    /// Parses a stack frame information record from a single line.
    pub fn parse(data: &'d [u8]) -> Result<Self, SymbolError> {
        StackCfiRecord::parse(data)
            .map(Self::Cfi)
            .or_else(|_| StackWinRecord::parse(data).map(Self::Win))
    }
}

/// An iterator over stack frame records in a symbol file.
#[derive(Clone, Debug)]
pub struct StackRecords<'d> {
    lines: Lines<'d>,
    finished: bool,
}

impl<'d> StackRecords<'d> {
    /// Creates an iterator over [`StackRecord`]s contained in a slice of
    /// data.
    pub fn new(data: &'d [u8]) -> Self {
        Self {
            lines: Lines::new(data),
            finished: false,
        }
    }
}

impl<'d> Iterator for StackRecords<'d> {
    type Item = Result<StackRecord<'d>, SymbolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        while let Some(line) = self.lines.next() {
            if line.starts_with(b"STACK WIN") {
                return Some(StackRecord::parse(line));
            }

            if line.starts_with(b"STACK CFI INIT") {
                return Some(StackCfiRecord::parse(line).map(|mut r| {
                    r.deltas = self.lines.clone();
                    StackRecord::Cfi(r)
                }));
            }
        }

        self.finished = true;
        None
    }
}

/// A cheap, zero-copy view over the raw bytes of a symbol file.
///
/// The view validates the `MODULE` header on construction and exposes
/// iterators over all record types. It performs no aggregation; use
/// [`SymbolFile`](crate::SymbolFile) to build a queryable database.
pub struct SymbolView<'data> {
    id: DebugId,
    arch: Arch,
    module: ModuleRecord<'data>,
    data: &'data [u8],
}

impl<'data> SymbolView<'data> {
    /// Tests whether the buffer could contain a symbol file.
    pub fn test(data: &[u8]) -> bool {
        data.starts_with(b"MODULE ")
    }

    /// Tries to parse a symbol file header from the given slice.
    pub fn parse(data: &'data [u8]) -> Result<Self, SymbolError> {
        // Ensure that we do not scan the entire file for the first line.
        let header = if data.len() > HEADER_CAP {
            match str::from_utf8(&data[..HEADER_CAP]) {
                Ok(_) => &data[..HEADER_CAP],
                Err(e) => match e.error_len() {
                    None => &data[..e.valid_up_to()],
                    Some(_) => return Err(e.into()),
                },
            }
        } else {
            data
        };

        if !Self::test(header) {
            return Err(SymbolErrorKind::InvalidMagic.into());
        }

        let module = ModuleRecord::parse(header)?;

        Ok(SymbolView {
            id: DebugId::from_breakpad(module.id)?,
            arch: module.arch.parse().unwrap_or_default(),
            module,
            data,
        })
    }

    /// The debug information identifier of this symbol file.
    pub fn debug_id(&self) -> DebugId {
        self.id
    }

    /// The CPU architecture of this symbol file.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The name of the original debug file.
    pub fn name(&self) -> &'data str {
        self.module.name
    }

    /// The operating system name from the header.
    pub fn os(&self) -> &'data str {
        self.module.os
    }

    /// The code identifier of this symbol file, if an `INFO CODE_ID` record
    /// is present.
    pub fn code_id(&self) -> Option<&'data str> {
        for result in self.info_records() {
            if let Ok(InfoRecord::CodeId { code_id, .. }) = result {
                if !code_id.is_empty() {
                    return Some(code_id);
                }
            }
        }

        None
    }

    /// Returns an iterator over info records.
    pub fn info_records(&self) -> InfoRecords<'data> {
        InfoRecords {
            lines: Lines::new(self.data),
            finished: false,
        }
    }

    /// Returns an iterator over file records.
    pub fn file_records(&self) -> FileRecords<'data> {
        FileRecords {
            lines: Lines::new(self.data),
            finished: false,
        }
    }

    /// Returns an iterator over inline origin records.
    pub fn inline_origin_records(&self) -> InlineOriginRecords<'data> {
        InlineOriginRecords {
            lines: Lines::new(self.data),
            finished: false,
        }
    }

    /// Returns an iterator over function records.
    pub fn func_records(&self) -> FuncRecords<'data> {
        FuncRecords {
            lines: Lines::new(self.data),
            finished: false,
        }
    }

    /// Returns an iterator over public symbol records.
    pub fn public_records(&self) -> PublicRecords<'data> {
        PublicRecords {
            lines: Lines::new(self.data),
            finished: false,
        }
    }

    /// Returns an iterator over stack frame records.
    pub fn stack_records(&self) -> StackRecords<'data> {
        StackRecords::new(self.data)
    }

    /// Returns the raw data of the symbol file.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }
}

impl fmt::Debug for SymbolView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolView")
            .field("debug_id", &self.id)
            .field("arch", &self.arch)
            .field("name", &self.module.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_module_record() {
        let record =
            ModuleRecord::parse(b"MODULE Linux x86_64 492E2DD23CC306CA9C494EEF1533A3810 crash")
                .unwrap();

        assert_eq!(
            record,
            ModuleRecord {
                os: "Linux",
                arch: "x86_64",
                id: "492E2DD23CC306CA9C494EEF1533A3810",
                name: "crash",
            }
        );
    }

    #[test]
    fn test_module_record_from_whole_file() {
        let data = b"MODULE mac arm64 5CBF1FC8B4C53F8AA9B1A822B8E4B3FC0 dyld\nFILE 0 a.c\n";
        let record = ModuleRecord::parse(data).unwrap();
        assert_eq!(record.name, "dyld");
    }

    #[test]
    fn test_info_record() {
        let record = InfoRecord::parse(b"INFO CODE_ID 5CF2B26C494a libretrace.so").unwrap();
        assert_eq!(
            record,
            InfoRecord::CodeId {
                code_id: "5CF2B26C494a",
                code_file: "libretrace.so",
            }
        );
    }

    #[test]
    fn test_file_record() {
        let record = FileRecord::parse(b"FILE 37 src/processor/walker.rs").unwrap();
        assert_eq!(record.id, 37);
        assert_eq!(record.name, "src/processor/walker.rs");
    }

    #[test]
    fn test_func_record_with_m() {
        let record = FuncRecord::parse(b"FUNC m c184 30 4 nsQueryInterfaceWithError").unwrap();
        assert!(record.multiple);
        assert_eq!(record.address, 0xc184);
        assert_eq!(record.size, 0x30);
        assert_eq!(record.parameter_size, 4);
        assert_eq!(record.name, "nsQueryInterfaceWithError");
    }

    #[test]
    fn test_func_record_name_with_spaces() {
        let record = FuncRecord::parse(b"FUNC 1130 28 0 std::vector<int>::at(unsigned long)")
            .unwrap();
        assert_eq!(record.name, "std::vector<int>::at(unsigned long)");
    }

    #[test]
    fn test_line_record() {
        let record = LineRecord::parse(b"c184 7 59 4").unwrap();
        assert_eq!(
            record,
            LineRecord {
                address: 0xc184,
                size: 7,
                line: 59,
                file_id: 4,
            }
        );
    }

    #[test]
    fn test_line_record_negative_line() {
        let record = LineRecord::parse(b"e0f9 5 -1 2").unwrap();
        assert_eq!(record.line, 0);
    }

    #[test]
    fn test_inline_record_multiple_ranges() {
        let record = InlineRecord::parse(b"INLINE 1 59 4 2 c184 10 c1a4 8").unwrap();
        assert_eq!(record.depth, 1);
        assert_eq!(record.call_line, 59);
        assert_eq!(record.call_file_id, 4);
        assert_eq!(record.origin_id, 2);
        assert_eq!(record.ranges, vec![(0xc184, 0x10), (0xc1a4, 0x8)]);
    }

    #[test]
    fn test_public_record() {
        let record = PublicRecord::parse(b"PUBLIC m 2160 0 Public2_1").unwrap();
        assert!(record.multiple);
        assert_eq!(record.address, 0x2160);
        assert_eq!(record.parameter_size, 0);
        assert_eq!(record.name, "Public2_1");
    }

    #[test]
    fn test_stack_cfi_init_record() {
        let record =
            StackCfiRecord::parse(b"STACK CFI INIT 804c4b0 40 .cfa: $esp 4 + $eip: .cfa 4 - ^")
                .unwrap();
        assert_eq!(record.start, 0x804c4b0);
        assert_eq!(record.size, 0x40);
        assert_eq!(record.init_rules, ".cfa: $esp 4 + $eip: .cfa 4 - ^");
    }

    #[test]
    fn test_stack_win_record() {
        let record = StackWinRecord::parse(
            b"STACK WIN 4 2170 14 1 0 0 0 0 0 1 $eip $esp ^ = $esp $esp 4 + =",
        )
        .unwrap();
        assert_eq!(record.ty, StackWinRecordType::FrameData);
        assert_eq!(record.code_start, 0x2170);
        assert_eq!(record.code_size, 0x14);
        assert_eq!(
            record.program_string,
            Some("$eip $esp ^ = $esp $esp 4 + =")
        );
    }

    #[test]
    fn test_func_records_with_lines_and_inlinees() {
        let data = b"\
MODULE Linux x86 D3096ED481217FD4C16B29CD9BC208BA0 a.out
FILE 0 a.c
INLINE_ORIGIN 0 inlined_fn
FUNC 1000 30 0 outer_fn
INLINE 0 12 0 0 1000 8
1000 8 11 0
1008 28 12 0
PUBLIC 2000 0 entry
STACK CFI INIT 1000 30 .cfa: $esp 4 +
";

        let view = SymbolView::parse(data).unwrap();
        let funcs: Vec<_> = view.func_records().map(Result::unwrap).collect();
        assert_eq!(funcs.len(), 1);
        assert_eq!(funcs[0].name, "outer_fn");

        let lines: Vec<_> = funcs[0].lines().map(Result::unwrap).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, 11);

        let inlinees: Vec<_> = funcs[0].inlinees().map(Result::unwrap).collect();
        assert_eq!(inlinees.len(), 1);
        assert_eq!(inlinees[0].origin_id, 0);

        let publics: Vec<_> = view.public_records().map(Result::unwrap).collect();
        assert_eq!(publics.len(), 1);

        let stacks: Vec<_> = view.stack_records().map(Result::unwrap).collect();
        assert_eq!(stacks.len(), 1);
    }

    #[test]
    fn test_stack_cfi_deltas() {
        let data = b"\
STACK CFI INIT 804c4b0 40 .cfa: $esp 4 +
STACK CFI 804c4b1 .cfa: $esp 8 +
STACK CFI 804c4b4 $ebx: .cfa 12 - ^
STACK CFI INIT 804c500 10 .cfa: $esp 4 +
";

        let records: Vec<_> = StackRecords::new(data).map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);

        let first = match &records[0] {
            StackRecord::Cfi(record) => record,
            _ => panic!("expected cfi record"),
        };

        let deltas: Vec<_> = first.deltas().map(Result::unwrap).collect();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].address, 0x804c4b1);
        assert_eq!(deltas[1].rules, "$ebx: .cfa 12 - ^");
    }

    #[test]
    fn test_symbol_view_rejects_garbage() {
        let error = SymbolView::parse(b"garbage").unwrap_err();
        assert_eq!(error.kind(), SymbolErrorKind::InvalidMagic);
    }
}
