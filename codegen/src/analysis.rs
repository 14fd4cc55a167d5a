//! Per-function metrics produced by the front end's AST analysis and the
//! factory for optimizer-introduced temporaries.

use crate::ast::VarType;
use crate::error::CodegenResult;
use crate::symbols::{Symbol, SymbolKind, SymbolTable};
use rustc_hash::FxHashMap;

/// Metrics the code generator consumes to plan a function's frame and
/// register pressure.
#[derive(Clone, Debug, Default)]
pub struct FunctionMetrics {
    pub num_variables: usize,
    pub num_float_variables: usize,
    pub num_parameters: usize,
    pub makes_calls: bool,
    pub variable_types: FxHashMap<String, VarType>,
}

impl FunctionMetrics {
    /// A crude register-pressure estimate: every integer variable wants a
    /// callee-saved home.
    pub fn register_pressure(&self) -> usize {
        self.num_variables
    }
}

/// Analysis results for a whole program, keyed by function name.
#[derive(Clone, Debug, Default)]
pub struct Analyzer {
    metrics: FxHashMap<String, FunctionMetrics>,
}

impl Analyzer {
    pub fn new() -> Analyzer {
        Analyzer::default()
    }

    pub fn metrics(&self, function: &str) -> Option<&FunctionMetrics> {
        self.metrics.get(function)
    }

    pub fn metrics_mut(&mut self, function: &str) -> &mut FunctionMetrics {
        self.metrics.entry(function.to_string()).or_default()
    }
}

/// Creates uniquely-named temporaries for optimizer-introduced values and
/// registers them with the symbol table and the function's metrics.
#[derive(Debug, Default)]
pub struct TemporaryVariableFactory {
    counter: usize,
}

impl TemporaryVariableFactory {
    pub fn new() -> TemporaryVariableFactory {
        TemporaryVariableFactory::default()
    }

    pub fn create(
        &mut self,
        function_name: &str,
        var_type: VarType,
        symbol_table: &mut SymbolTable,
        analyzer: &mut Analyzer,
    ) -> CodegenResult<String> {
        let temp_name = format!("_opt_temp_{}", self.counter);
        self.counter += 1;

        symbol_table.add_symbol(Symbol::new(&temp_name, SymbolKind::LocalVar, var_type))?;

        let metrics = analyzer.metrics_mut(function_name);
        if var_type == VarType::Float {
            metrics.num_float_variables += 1;
        } else {
            metrics.num_variables += 1;
        }
        metrics.variable_types.insert(temp_name.clone(), var_type);

        Ok(temp_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporaries_are_unique_and_registered() {
        let mut factory = TemporaryVariableFactory::new();
        let mut table = SymbolTable::new();
        let mut analyzer = Analyzer::new();

        let t0 = factory
            .create("F", VarType::Integer, &mut table, &mut analyzer)
            .unwrap();
        let t1 = factory
            .create("F", VarType::Float, &mut table, &mut analyzer)
            .unwrap();

        assert_ne!(t0, t1);
        assert_eq!(table.lookup(&t0).unwrap().kind, SymbolKind::LocalVar);
        let metrics = analyzer.metrics("F").unwrap();
        assert_eq!(metrics.num_variables, 1);
        assert_eq!(metrics.num_float_variables, 1);
        assert_eq!(metrics.variable_types[&t1], VarType::Float);
    }
}
