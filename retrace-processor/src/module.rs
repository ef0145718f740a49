//! Code modules and module lists.

use std::fmt;

use thiserror::Error;

use retrace_common::DebugId;

/// A code module loaded into the process at crash time.
///
/// The `debug_identifier` uniquely identifies the debug information of this
/// module and keys the symbolizer's cache.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CodeModule {
    /// The base address of this module as it was loaded by the process.
    pub base_address: u64,

    /// The size of the module's mapping in bytes.
    pub size: u64,

    /// The path or file name that the module was loaded from.
    pub code_file: String,

    /// An identifying string used to discriminate between multiple versions
    /// and builds of the same module.
    ///
    /// The contents are platform defined: a SHA1 checksum of the code on
    /// Linux, a timestamp and size on Windows, empty on macOS.
    pub code_identifier: String,

    /// The file name containing debug information for this module.
    ///
    /// If debug information is stored separately (a PDB or dSYM), this
    /// differs from `code_file`.
    pub debug_file: String,

    /// A string identifying the specific version and build of the associated
    /// debug file, in compact hexadecimal form.
    pub debug_identifier: String,
}

impl CodeModule {
    /// The half-open address range occupied by this module.
    pub fn range(&self) -> std::ops::Range<u64> {
        self.base_address..self.base_address + self.size
    }

    /// Returns true if the module's range contains the address.
    pub fn contains_address(&self, address: u64) -> bool {
        address >= self.base_address && address < self.base_address + self.size
    }

    /// The parsed debug identifier, if it is well-formed.
    pub fn id(&self) -> Option<DebugId> {
        DebugId::from_breakpad(&self.debug_identifier).ok()
    }

    /// The basename of the code file, for display purposes.
    pub fn basename(&self) -> &str {
        self.code_file
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or(&self.code_file)
    }
}

impl fmt::Display for CodeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:#x}, {:#x})",
            self.basename(),
            self.base_address,
            self.base_address + self.size
        )
    }
}

/// An error constructing a [`CodeModuleList`] from overlapping modules.
///
/// Loaded modules occupy disjoint address ranges; overlap indicates a
/// malformed dump.
#[derive(Debug, Error)]
#[error("modules {first} and {second} overlap")]
pub struct ModuleOverlapError {
    /// Description of the lower module.
    pub first: String,
    /// Description of the overlapping module.
    pub second: String,
}

/// An ordered list of code modules with binary address lookup.
#[derive(Clone, Debug, Default)]
pub struct CodeModuleList {
    modules: Vec<CodeModule>,
}

impl CodeModuleList {
    /// Constructs a module list for the modules loaded at crash time.
    ///
    /// The modules are sorted by base address; overlapping ranges are
    /// rejected.
    pub fn new(mut modules: Vec<CodeModule>) -> Result<Self, ModuleOverlapError> {
        modules.sort_by_key(|module| module.base_address);

        for pair in modules.windows(2) {
            if pair[0].base_address + pair[0].size > pair[1].base_address {
                return Err(ModuleOverlapError {
                    first: pair[0].to_string(),
                    second: pair[1].to_string(),
                });
            }
        }

        Ok(CodeModuleList { modules })
    }

    /// Constructs a module list without rejecting overlaps.
    ///
    /// Unloaded module lists regularly contain overlapping ranges because
    /// addresses are reused; lookups resolve to the module with the highest
    /// base address containing the queried address.
    pub fn unchecked(mut modules: Vec<CodeModule>) -> Self {
        modules.sort_by_key(|module| module.base_address);
        CodeModuleList { modules }
    }

    /// Looks up the module whose range contains the given address.
    pub fn module_at_address(&self, address: u64) -> Option<&CodeModule> {
        let index = match self
            .modules
            .binary_search_by_key(&address, |module| module.base_address)
        {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };

        let module = &self.modules[index];
        module.contains_address(address).then_some(module)
    }

    /// The highest address covered by any module, if the list is non-empty.
    pub fn highest_mapped_address(&self) -> Option<u64> {
        self.modules
            .iter()
            .map(|module| module.base_address + module.size)
            .max()
    }

    /// A mask of the valid address bits, determined from the address range
    /// of the modules.
    ///
    /// Pointer authentication signs the high bits of pointers spilled to the
    /// stack. Any bit above the highest mapped module address cannot be part
    /// of a return address, so the mask is the highest mapped address with
    /// its topmost set bit smeared downwards, widened to at least 48 bits.
    pub fn address_range_mask(&self) -> u64 {
        let mut mask = self.highest_mapped_address().unwrap_or(0);
        mask |= mask >> 1;
        mask |= mask >> 2;
        mask |= mask >> 4;
        mask |= mask >> 8;
        mask |= mask >> 16;
        mask |= mask >> 32;

        mask | ((1 << 48) - 1)
    }

    /// Returns an iterator over the modules in base address order.
    pub fn iter(&self) -> impl Iterator<Item = &CodeModule> {
        self.modules.iter()
    }

    /// The number of modules in the list.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if the list contains no modules.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
