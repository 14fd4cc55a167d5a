//! Symbol table interface consumed by the code generator, plus the
//! registration of the BCPL runtime routines the emitted code may call.

use crate::ast::VarType;
use crate::error::{CodegenError, CodegenResult};
use rustc_hash::FxHashMap;

/// What kind of thing a symbol names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    LocalVar,
    StaticVar,
    GlobalVar,
    Manifest,
    Label,
    Function,
    FloatFunction,
    Routine,
    RuntimeFunction,
    RuntimeFloatFunction,
    RuntimeRoutine,
    RuntimeFloatRoutine,
}

impl SymbolKind {
    /// Is this one of the runtime-library kinds?
    pub fn is_runtime(self) -> bool {
        matches!(
            self,
            SymbolKind::RuntimeFunction
                | SymbolKind::RuntimeFloatFunction
                | SymbolKind::RuntimeRoutine
                | SymbolKind::RuntimeFloatRoutine
        )
    }
}

/// Parameter type information attached to function symbols.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParameterInfo {
    pub var_type: VarType,
    pub is_optional: bool,
}

impl ParameterInfo {
    pub fn required(var_type: VarType) -> ParameterInfo {
        ParameterInfo { var_type, is_optional: false }
    }
}

/// One symbol table entry.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub var_type: VarType,
    pub parameters: Vec<ParameterInfo>,
    /// Resolved value for manifests and absolute-address symbols.
    pub absolute_value: Option<i64>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, var_type: VarType) -> Symbol {
        Symbol {
            name: name.into(),
            kind,
            var_type,
            parameters: Vec::new(),
            absolute_value: None,
        }
    }
}

/// A scoped symbol table. Scopes form a stack; lookup walks from the
/// innermost scope outward.
#[derive(Debug, Default)]
pub struct SymbolTable {
    scopes: Vec<FxHashMap<String, Symbol>>,
    current_function: Option<String>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            scopes: vec![FxHashMap::default()],
            current_function: None,
        }
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn exit_scope(&mut self) {
        // The global scope is never popped.
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn set_current_function(&mut self, name: &str) {
        self.current_function = Some(name.to_string());
    }

    pub fn current_function(&self) -> Option<&str> {
        self.current_function.as_deref()
    }

    /// Add a symbol to the innermost scope. A duplicate in the same scope
    /// is structural misuse.
    pub fn add_symbol(&mut self, symbol: Symbol) -> CodegenResult<()> {
        let scope = self.scopes.last_mut().expect("at least the global scope");
        if scope.contains_key(&symbol.name) {
            return Err(CodegenError::DuplicateSymbol(symbol.name));
        }
        scope.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    pub fn set_symbol_absolute_value(&mut self, name: &str, value: i64) -> CodegenResult<()> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(symbol) = scope.get_mut(name) {
                symbol.absolute_value = Some(value);
                return Ok(());
            }
        }
        Err(CodegenError::UnknownSymbol(name.to_string()))
    }
}

/// Registration of the BCPL runtime library names. Codegen resolves calls
/// to these by name; the JIT loader binds their final addresses.
pub fn register_runtime_symbols(table: &mut SymbolTable) {
    use VarType::{Float, Integer};

    let func = |name: &str, params: &[VarType]| {
        symbol_with_params(name, SymbolKind::RuntimeFunction, Integer, params)
    };
    let float_func = |name: &str, params: &[VarType]| {
        symbol_with_params(name, SymbolKind::RuntimeFloatFunction, Float, params)
    };
    let routine = |name: &str, params: &[VarType]| {
        symbol_with_params(name, SymbolKind::RuntimeRoutine, Integer, params)
    };
    let float_routine = |name: &str, params: &[VarType]| {
        symbol_with_params(name, SymbolKind::RuntimeFloatRoutine, Float, params)
    };

    let symbols = [
        // Integer-returning functions.
        func("READN", &[]),
        func("RND", &[Integer]),
        func("LENGTH", &[Integer]),
        func("GETBYTE", &[Integer, Integer]),
        func("GETWORD", &[Integer, Integer]),
        // Float-returning functions.
        float_func("READF", &[]),
        float_func("FLTOFX", &[Integer]),
        float_func("FSIN", &[Float]),
        float_func("FCOS", &[Float]),
        float_func("FTAN", &[Float]),
        float_func("FSQRT", &[Float]),
        float_func("FABS", &[Float]),
        float_func("FLOG", &[Float]),
        float_func("FEXP", &[Float]),
        // Routines.
        routine("WRITES", &[Integer]),
        routine("WRITEN", &[Integer]),
        float_routine("WRITEF", &[Float]),
        routine("PUTBYTE", &[Integer, Integer, Integer]),
        routine("PUTWORD", &[Integer, Integer, Integer]),
        routine("EXIT", &[Integer]),
        routine("NEWLINE", &[]),
        routine("NEWPAGE", &[]),
    ];

    for symbol in symbols {
        if let Err(err) = table.add_symbol(symbol) {
            // Re-registration of the runtime set is harmless but noted.
            log::warn!("could not register runtime symbol: {err}");
        }
    }
}

fn symbol_with_params(
    name: &str,
    kind: SymbolKind,
    var_type: VarType,
    params: &[VarType],
) -> Symbol {
    let mut symbol = Symbol::new(name, kind, var_type);
    symbol.parameters = params.iter().map(|&t| ParameterInfo::required(t)).collect();
    symbol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_lookup() {
        let mut table = SymbolTable::new();
        table
            .add_symbol(Symbol::new("a", SymbolKind::GlobalVar, VarType::Integer))
            .unwrap();
        table.enter_scope();
        table
            .add_symbol(Symbol::new("a", SymbolKind::LocalVar, VarType::Float))
            .unwrap();
        assert_eq!(table.lookup("a").unwrap().kind, SymbolKind::LocalVar);
        table.exit_scope();
        assert_eq!(table.lookup("a").unwrap().kind, SymbolKind::GlobalVar);
    }

    #[test]
    fn duplicate_in_same_scope_is_error() {
        let mut table = SymbolTable::new();
        table
            .add_symbol(Symbol::new("x", SymbolKind::LocalVar, VarType::Integer))
            .unwrap();
        assert!(table
            .add_symbol(Symbol::new("x", SymbolKind::LocalVar, VarType::Integer))
            .is_err());
    }

    #[test]
    fn runtime_registration() {
        let mut table = SymbolTable::new();
        register_runtime_symbols(&mut table);
        let fsin = table.lookup("FSIN").unwrap();
        assert_eq!(fsin.kind, SymbolKind::RuntimeFloatFunction);
        assert_eq!(fsin.parameters.len(), 1);
        assert_eq!(fsin.parameters[0].var_type, VarType::Float);
        let writes = table.lookup("WRITES").unwrap();
        assert_eq!(writes.kind, SymbolKind::RuntimeRoutine);
        assert!(table.lookup("NEWPAGE").is_some());
    }
}
