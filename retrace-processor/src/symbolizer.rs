//! Symbol resolution with a per-module cache.

use std::collections::BTreeMap;

use log::{debug, warn};

use retrace_common::ByteView;
use retrace_symbols::SymbolFile;

use crate::frame::{InlineFrame, StackFrame};
use crate::module::{CodeModule, CodeModuleList};

/// The result of a symbol supplier's search for one module's symbol file.
#[derive(Debug)]
pub enum SymbolResult {
    /// The symbol file was located; its bytes follow.
    Found(ByteView<'static>),

    /// No symbol file exists for this module.
    NotFound,

    /// The search was interrupted and may succeed when retried later.
    ///
    /// This aborts the processing session; the processor reports it to the
    /// caller without producing a partial result.
    InterruptRetryLater,
}

/// Locates symbol files for modules.
///
/// Implementations may search directories, caches or network services; the
/// core treats the call as synchronous and opaque. Suppliers may be shared
/// across sessions, in which case they own the synchronization discipline.
pub trait SymbolSupplier {
    /// Locates the symbol file for the given module.
    fn locate_symbols(&mut self, module: &CodeModule) -> SymbolResult;
}

/// The resolution state of one module's symbols.
#[derive(Debug)]
enum ModuleState {
    /// Symbols were found and parsed.
    Loaded(SymbolFile),

    /// The supplier had no symbols for the module.
    NotFound,

    /// Symbols were found but could not be parsed.
    Corrupt,
}

/// Cache key of a module's symbols.
fn module_key(module: &CodeModule) -> (String, String) {
    (module.debug_file.clone(), module.debug_identifier.clone())
}

/// Resolves instruction addresses to functions, source lines and CFI rules.
///
/// The symbolizer asks its [`SymbolSupplier`] for each module at most once
/// per cache lifetime and keeps the parsed [`SymbolFile`]s keyed by
/// `(debug_file, debug_identifier)`. Given a fixed module list and supplier
/// it is idempotent: repeated lookups return the same results.
///
/// A symbolizer outlives a single processing session. [`reset`](Self::reset)
/// clears the per-dump bookkeeping (missing and corrupt module sets, the
/// interrupt flag) while retaining the parsed databases.
pub struct Symbolizer<S> {
    supplier: S,
    cache: BTreeMap<(String, String), ModuleState>,
    modules_without_symbols: BTreeMap<(String, String), CodeModule>,
    modules_with_corrupt_symbols: BTreeMap<(String, String), CodeModule>,
    interrupted: bool,
}

impl<S: SymbolSupplier> Symbolizer<S> {
    /// Creates a symbolizer around the given supplier.
    pub fn new(supplier: S) -> Self {
        Symbolizer {
            supplier,
            cache: BTreeMap::new(),
            modules_without_symbols: BTreeMap::new(),
            modules_with_corrupt_symbols: BTreeMap::new(),
            interrupted: false,
        }
    }

    /// Clears per-dump state for a new processing session.
    ///
    /// Parsed symbol databases are retained so that sessions over related
    /// dumps do not re-parse their symbol files.
    pub fn reset(&mut self) {
        self.modules_without_symbols.clear();
        self.modules_with_corrupt_symbols.clear();
        self.interrupted = false;
    }

    /// Returns true if the supplier asked for the session to be interrupted.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    /// The modules for which no symbols could be located this session.
    pub fn modules_without_symbols(&self) -> Vec<CodeModule> {
        self.modules_without_symbols.values().cloned().collect()
    }

    /// The modules whose symbol files failed to parse this session.
    pub fn modules_with_corrupt_symbols(&self) -> Vec<CodeModule> {
        self.modules_with_corrupt_symbols.values().cloned().collect()
    }

    /// Ensures the module's symbol state is resolved and returns it.
    fn module_state(&mut self, module: &CodeModule) -> Option<&ModuleState> {
        if self.interrupted {
            return None;
        }

        let key = module_key(module);

        if !self.cache.contains_key(&key) {
            let state = match self.supplier.locate_symbols(module) {
                SymbolResult::Found(bytes) => match SymbolFile::parse(&bytes) {
                    Ok(file) => ModuleState::Loaded(file),
                    Err(error) => {
                        warn!(
                            "corrupt symbols for module {}: {}",
                            module.debug_file, error
                        );
                        ModuleState::Corrupt
                    }
                },
                SymbolResult::NotFound => {
                    debug!("no symbols for module {}", module.debug_file);
                    ModuleState::NotFound
                }
                SymbolResult::InterruptRetryLater => {
                    self.interrupted = true;
                    return None;
                }
            };

            self.cache.insert(key.clone(), state);
        }

        match self.cache.get(&key) {
            Some(ModuleState::NotFound) => {
                self.modules_without_symbols
                    .entry(key.clone())
                    .or_insert_with(|| module.clone());
            }
            Some(ModuleState::Corrupt) => {
                self.modules_with_corrupt_symbols
                    .entry(key.clone())
                    .or_insert_with(|| module.clone());
            }
            _ => {}
        }

        self.cache.get(&key)
    }

    /// Returns true if symbols for the module are loaded (resolving them on
    /// first touch).
    pub fn has_symbols(&mut self, module: &CodeModule) -> bool {
        matches!(self.module_state(module), Some(ModuleState::Loaded(_)))
    }

    /// Attaches function, source file and line information to a frame.
    ///
    /// The owning module is looked up in `modules`; a frame outside every
    /// module stays module-less. Missing symbols only leave the frame
    /// unsymbolicated, they never fail the walk.
    pub fn fill_source_line_info(&mut self, frame: &mut StackFrame, modules: &CodeModuleList) {
        let lookup_address = frame.lookup_address();
        let module = match modules.module_at_address(lookup_address) {
            Some(module) => module.clone(),
            None => return,
        };

        let address = lookup_address - module.base_address;
        frame.module = Some(module.clone());

        let file = match self.module_state(&module) {
            Some(ModuleState::Loaded(file)) => file,
            _ => return,
        };

        if let Some(function) = file.function_for_address(address) {
            frame.function_name = Some(function.name.clone());
            frame.function_base = Some(module.base_address + function.address);
            frame.parameter_size = Some(function.parameter_size);

            if let Some(line) = function.line_for_address(address) {
                frame.source_file = file.file_name(line.file_id).map(str::to_string);
                frame.source_line = Some(line.line);
                frame.source_line_base = Some(module.base_address + line.address);
            }

            frame.inlines = function
                .inline_chain_for_address(address)
                .into_iter()
                .map(|inlinee| InlineFrame {
                    function_name: file
                        .inline_origin(inlinee.origin_id)
                        .unwrap_or("<unknown>")
                        .to_string(),
                    call_file: file.file_name(inlinee.call_file_id).map(str::to_string),
                    call_line: inlinee.call_line,
                })
                .collect();
        } else if let Some(public) = file.public_for_address(address) {
            frame.function_name = Some(public.name.clone());
            frame.function_base = Some(module.base_address + public.address);
            frame.parameter_size = Some(public.parameter_size);
        }
    }

    /// Returns the CFI rule strings covering the instruction, if any.
    ///
    /// The returned strings are the record's initial rules followed by all
    /// deltas up to the instruction address, ready to be fed to the rule
    /// evaluator in order.
    pub fn cfi_rules_for_address(
        &mut self,
        module: &CodeModule,
        instruction: u64,
    ) -> Option<Vec<String>> {
        let address = instruction.checked_sub(module.base_address)?;

        let file = match self.module_state(module) {
            Some(ModuleState::Loaded(file)) => file,
            _ => return None,
        };

        let rules = file.cfi_rules_for_address(address)?;
        Some(
            rules
                .rules_at(address)
                .into_iter()
                .map(str::to_string)
                .collect(),
        )
    }

    /// Checks whether a symbol covers the given instruction.
    ///
    /// This refines stack-scan candidate validation: with loaded symbols, a
    /// return address must point at a known function or public symbol. For
    /// modules without (usable) symbols every in-module address passes, so
    /// scanning keeps working on unsymbolicated modules.
    pub fn symbols_cover_address(&mut self, module: &CodeModule, instruction: u64) -> bool {
        let address = match instruction.checked_sub(module.base_address) {
            Some(address) => address,
            None => return false,
        };

        match self.module_state(module) {
            Some(ModuleState::Loaded(file)) => {
                file.function_for_address(address).is_some()
                    || file.public_for_address(address).is_some()
            }
            _ => true,
        }
    }
}
