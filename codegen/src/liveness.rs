//! Variable liveness: control-flow graphs of basic blocks over the AST,
//! per-block `use`/`def` sets, and the backward dataflow fixed point
//!
//! ```text
//! out[B] = U in[S] for each successor S
//! in[B]  = use[B] U (out[B] \ def[B])
//! ```
//!
//! The fixed point is order-independent; iteration order here is only a
//! determinism guarantee for traces and tests.

use crate::ast::{FunctionBody, FunctionDecl, Stmt};
use log::{trace, warn};
use std::collections::{BTreeMap, BTreeSet};

pub type BlockId = usize;

/// A basic block: straight-line statements plus CFG edges.
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    pub id: BlockId,
    pub statements: Vec<Stmt>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
}

/// One function's control-flow graph.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub function: String,
    pub blocks: BTreeMap<BlockId, BasicBlock>,
    pub entry: BlockId,
}

impl Cfg {
    /// Build the CFG for a function body. Conditions stay in the block that
    /// evaluates them; branch and loop bodies get their own blocks.
    pub fn build(function: &FunctionDecl) -> Cfg {
        let mut builder = CfgBuilder::new(&function.name);
        match &function.body {
            FunctionBody::Stmt(stmt) => builder.lower_stmt(stmt),
            FunctionBody::Expr(_) => {
                // An expression body is a single straight-line block; its
                // reads are attributed through the enclosing statement the
                // front end synthesizes, so there is nothing to split.
            }
        }
        builder.finish()
    }
}

struct CfgBuilder {
    function: String,
    blocks: BTreeMap<BlockId, BasicBlock>,
    current: BlockId,
    next_id: BlockId,
}

impl CfgBuilder {
    fn new(function: &str) -> CfgBuilder {
        let mut blocks = BTreeMap::new();
        blocks.insert(0, BasicBlock { id: 0, ..BasicBlock::default() });
        CfgBuilder {
            function: function.to_string(),
            blocks,
            current: 0,
            next_id: 1,
        }
    }

    fn new_block(&mut self) -> BlockId {
        let id = self.next_id;
        self.next_id += 1;
        self.blocks.insert(id, BasicBlock { id, ..BasicBlock::default() });
        id
    }

    fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if let Some(block) = self.blocks.get_mut(&from) {
            if !block.successors.contains(&to) {
                block.successors.push(to);
            }
        }
        if let Some(block) = self.blocks.get_mut(&to) {
            if !block.predecessors.contains(&from) {
                block.predecessors.push(from);
            }
        }
    }

    fn push_stmt(&mut self, stmt: &Stmt) {
        self.blocks
            .get_mut(&self.current)
            .expect("current block exists")
            .statements
            .push(stmt.clone());
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Compound(stmts) => {
                for stmt in stmts {
                    self.lower_stmt(stmt);
                }
            }
            Stmt::Block { statements, .. } => {
                // Declarations' initializer reads belong to the block
                // entry, carried by the Block statement itself.
                self.push_stmt(&strip_body(stmt));
                for stmt in statements {
                    self.lower_stmt(stmt);
                }
            }
            Stmt::If { condition, then_branch } | Stmt::Unless { condition, then_branch } => {
                self.push_stmt(&Stmt::If {
                    condition: condition.clone(),
                    then_branch: Box::new(Stmt::Compound(vec![])),
                });
                let cond_block = self.current;
                let then_block = self.new_block();
                let join = self.new_block();
                self.add_edge(cond_block, then_block);
                self.add_edge(cond_block, join);
                self.current = then_block;
                self.lower_stmt(then_branch);
                self.add_edge(self.current, join);
                self.current = join;
            }
            Stmt::Test { condition, then_branch, else_branch } => {
                self.push_stmt(&Stmt::If {
                    condition: condition.clone(),
                    then_branch: Box::new(Stmt::Compound(vec![])),
                });
                let cond_block = self.current;
                let then_block = self.new_block();
                let else_block = self.new_block();
                let join = self.new_block();
                self.add_edge(cond_block, then_block);
                self.add_edge(cond_block, else_block);
                self.current = then_block;
                self.lower_stmt(then_branch);
                self.add_edge(self.current, join);
                self.current = else_block;
                self.lower_stmt(else_branch);
                self.add_edge(self.current, join);
                self.current = join;
            }
            Stmt::While { condition, body } | Stmt::Until { condition, body } => {
                let header = self.new_block();
                let body_block = self.new_block();
                let exit = self.new_block();
                self.add_edge(self.current, header);
                self.add_edge(header, body_block);
                self.add_edge(header, exit);
                self.current = header;
                self.push_stmt(&Stmt::If {
                    condition: condition.clone(),
                    then_branch: Box::new(Stmt::Compound(vec![])),
                });
                self.current = body_block;
                self.lower_stmt(body);
                self.add_edge(self.current, header);
                self.current = exit;
            }
            Stmt::Repeat { body, condition } => {
                let body_block = self.new_block();
                let exit = self.new_block();
                self.add_edge(self.current, body_block);
                self.current = body_block;
                self.lower_stmt(body);
                if let Some(condition) = condition {
                    self.push_stmt(&Stmt::If {
                        condition: condition.clone(),
                        then_branch: Box::new(Stmt::Compound(vec![])),
                    });
                }
                self.add_edge(self.current, body_block);
                self.add_edge(self.current, exit);
                self.current = exit;
            }
            Stmt::For { var, start, end, step, body } => {
                // The induction variable is written in the entry block.
                self.push_stmt(&Stmt::Assignment {
                    lhs: vec![crate::ast::Expr::VariableAccess(var.clone())],
                    rhs: vec![(**start).clone()],
                });
                let header = self.new_block();
                let body_block = self.new_block();
                let exit = self.new_block();
                self.add_edge(self.current, header);
                self.add_edge(header, body_block);
                self.add_edge(header, exit);
                self.current = header;
                // The header re-reads the induction variable and the bound.
                self.push_stmt(&Stmt::If {
                    condition: Box::new(crate::ast::Expr::BinaryOp {
                        op: crate::ast::BinOp::Le,
                        left: Box::new(crate::ast::Expr::VariableAccess(var.clone())),
                        right: end.clone(),
                        is_float: false,
                    }),
                    then_branch: Box::new(Stmt::Compound(vec![])),
                });
                self.current = body_block;
                self.lower_stmt(body);
                // The increment writes the induction variable again.
                let step_expr = step
                    .clone()
                    .map(|step| (*step).clone())
                    .unwrap_or(crate::ast::Expr::NumberLit(1));
                self.push_stmt(&Stmt::Assignment {
                    lhs: vec![crate::ast::Expr::VariableAccess(var.clone())],
                    rhs: vec![crate::ast::Expr::BinaryOp {
                        op: crate::ast::BinOp::Add,
                        left: Box::new(crate::ast::Expr::VariableAccess(var.clone())),
                        right: Box::new(step_expr),
                        is_float: false,
                    }],
                });
                self.add_edge(self.current, header);
                self.current = exit;
            }
            Stmt::Switchon { expression, cases, default_case } => {
                self.push_stmt(&Stmt::Resultis(expression.clone()));
                let dispatch = self.current;
                let join = self.new_block();
                for (_, case) in cases {
                    let case_block = self.new_block();
                    self.add_edge(dispatch, case_block);
                    self.current = case_block;
                    self.lower_stmt(case);
                    self.add_edge(self.current, join);
                }
                if let Some(default_case) = default_case {
                    let default_block = self.new_block();
                    self.add_edge(dispatch, default_block);
                    self.current = default_block;
                    self.lower_stmt(default_case);
                    self.add_edge(self.current, join);
                } else {
                    self.add_edge(dispatch, join);
                }
                self.current = join;
            }
            other => self.push_stmt(other),
        }
    }

    fn finish(self) -> Cfg {
        Cfg {
            function: self.function,
            blocks: self.blocks,
            entry: 0,
        }
    }
}

/// A Block statement with its nested statements removed; the declarations
/// (and their initializer reads) stay.
fn strip_body(stmt: &Stmt) -> Stmt {
    match stmt {
        Stmt::Block { declarations, .. } => Stmt::Block {
            declarations: declarations.clone(),
            statements: vec![],
        },
        other => other.clone(),
    }
}

/// Per-block liveness sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSets {
    pub use_set: BTreeSet<String>,
    pub def_set: BTreeSet<String>,
    pub in_set: BTreeSet<String>,
    pub out_set: BTreeSet<String>,
}

/// Liveness analysis over a set of CFGs (one per function).
pub struct LivenessAnalysis {
    trace_enabled: bool,
    cfgs: BTreeMap<String, Cfg>,
    sets: BTreeMap<String, BTreeMap<BlockId, BlockSets>>,
}

impl LivenessAnalysis {
    pub fn new(trace_enabled: bool) -> LivenessAnalysis {
        LivenessAnalysis {
            trace_enabled,
            cfgs: BTreeMap::new(),
            sets: BTreeMap::new(),
        }
    }

    pub fn add_cfg(&mut self, cfg: Cfg) {
        self.sets.insert(cfg.function.clone(), BTreeMap::new());
        self.cfgs.insert(cfg.function.clone(), cfg);
    }

    /// Compute every block's `use`/`def` sets, then iterate the dataflow
    /// equations to a fixed point.
    pub fn run(&mut self) {
        let cfgs: Vec<String> = self.cfgs.keys().cloned().collect();
        for function in &cfgs {
            let block_ids: Vec<BlockId> =
                self.cfgs[function].blocks.keys().copied().collect();
            for id in block_ids {
                self.analyze_block(function, id);
            }
        }
        self.run_data_flow_analysis();
    }

    /// Per-block pass: a read before a write adds to `use`; a write adds to
    /// `def` unless the name was already read.
    fn analyze_block(&mut self, function: &str, id: BlockId) {
        let block = match self.cfgs.get(function).and_then(|cfg| cfg.blocks.get(&id)) {
            Some(block) => block,
            None => {
                warn!("liveness: missing block {id} in function '{function}'");
                return;
            }
        };
        if self.trace_enabled {
            trace!("liveness: analyzing block {id} of '{function}'");
        }

        let mut use_set = BTreeSet::new();
        let mut def_set = BTreeSet::new();
        for stmt in &block.statements {
            stmt.for_each_read_variable(&mut |name| {
                if !def_set.contains(name) {
                    use_set.insert(name.to_string());
                }
            });
            stmt.for_each_written_variable(&mut |name| {
                if !use_set.contains(name) {
                    def_set.insert(name.to_string());
                }
            });
        }

        let sets = self.sets.entry(function.to_string()).or_default();
        sets.insert(
            id,
            BlockSets {
                use_set,
                def_set,
                ..BlockSets::default()
            },
        );
    }

    /// Backward dataflow to a fixed point over all CFGs.
    fn run_data_flow_analysis(&mut self) {
        let mut changed = true;
        let mut iteration = 0usize;
        while changed {
            changed = false;
            iteration += 1;
            if self.trace_enabled {
                trace!("liveness: dataflow iteration {iteration}");
            }
            for (function, cfg) in &self.cfgs {
                let sets = match self.sets.get_mut(function) {
                    Some(sets) => sets,
                    None => continue,
                };
                for (id, block) in &cfg.blocks {
                    let mut out_set: BTreeSet<String> = BTreeSet::new();
                    for succ in &block.successors {
                        match sets.get(succ) {
                            Some(succ_sets) => {
                                out_set.extend(succ_sets.in_set.iter().cloned())
                            }
                            None => {
                                warn!(
                                    "liveness: dangling successor {succ} of block {id} in '{function}'"
                                );
                            }
                        }
                    }

                    let entry = sets.entry(*id).or_default();
                    entry.out_set = out_set;

                    let mut in_set = entry.use_set.clone();
                    in_set.extend(
                        entry
                            .out_set
                            .difference(&entry.def_set)
                            .cloned(),
                    );
                    if in_set != entry.in_set {
                        entry.in_set = in_set;
                        changed = true;
                    }
                }
            }
        }
    }

    pub fn block_sets(&self, function: &str, id: BlockId) -> Option<&BlockSets> {
        self.sets.get(function)?.get(&id)
    }

    /// Variables live on entry to `id`.
    pub fn live_in(&self, function: &str, id: BlockId) -> Option<&BTreeSet<String>> {
        self.block_sets(function, id).map(|sets| &sets.in_set)
    }

    /// Variables live on exit from `id`.
    pub fn live_out(&self, function: &str, id: BlockId) -> Option<&BTreeSet<String>> {
        self.block_sets(function, id).map(|sets| &sets.out_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Expr, FunctionBody, FunctionDecl, Stmt};

    fn var(name: &str) -> Expr {
        Expr::VariableAccess(name.to_string())
    }

    fn assign(name: &str, value: Expr) -> Stmt {
        Stmt::Assignment {
            lhs: vec![var(name)],
            rhs: vec![value],
        }
    }

    fn add(left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            op: BinOp::Add,
            left: Box::new(left),
            right: Box::new(right),
            is_float: false,
        }
    }

    fn function(name: &str, body: Stmt) -> FunctionDecl {
        FunctionDecl {
            name: name.to_string(),
            parameters: vec![],
            body: FunctionBody::Stmt(Box::new(body)),
            returns_float: false,
        }
    }

    #[test]
    fn straight_line_use_def() {
        // a := b + 1; c := a  =>  use = {b}, def = {a, c}
        let decl = function(
            "F",
            Stmt::Compound(vec![
                assign("a", add(var("b"), Expr::NumberLit(1))),
                assign("c", var("a")),
            ]),
        );
        let cfg = Cfg::build(&decl);
        let mut analysis = LivenessAnalysis::new(false);
        analysis.add_cfg(cfg);
        analysis.run();

        let sets = analysis.block_sets("F", 0).unwrap();
        assert_eq!(sets.use_set, ["b".to_string()].into());
        assert_eq!(sets.def_set, ["a".to_string(), "c".to_string()].into());
    }

    #[test]
    fn read_after_block_write_is_not_a_use() {
        let decl = function(
            "F",
            Stmt::Compound(vec![
                assign("a", Expr::NumberLit(5)),
                assign("b", var("a")),
            ]),
        );
        let cfg = Cfg::build(&decl);
        let mut analysis = LivenessAnalysis::new(false);
        analysis.add_cfg(cfg);
        analysis.run();

        let sets = analysis.block_sets("F", 0).unwrap();
        assert!(sets.use_set.is_empty());
    }

    #[test]
    fn loop_variable_is_live_around_the_back_edge() {
        // i := 0; WHILE i < n DO i := i + 1
        let decl = function(
            "F",
            Stmt::Compound(vec![
                assign("i", Expr::NumberLit(0)),
                Stmt::While {
                    condition: Box::new(Expr::BinaryOp {
                        op: BinOp::Lt,
                        left: Box::new(var("i")),
                        right: Box::new(var("n")),
                        is_float: false,
                    }),
                    body: Box::new(assign("i", add(var("i"), Expr::NumberLit(1)))),
                },
            ]),
        );
        let cfg = Cfg::build(&decl);
        let header = 1;
        let body = 2;
        let mut analysis = LivenessAnalysis::new(false);
        analysis.add_cfg(cfg);
        analysis.run();

        // `i` and `n` are live into the loop header, and still live out of
        // the body (the back edge re-enters the header).
        let header_in = analysis.live_in("F", header).unwrap();
        assert!(header_in.contains("i"));
        assert!(header_in.contains("n"));
        let body_out = analysis.live_out("F", body).unwrap();
        assert!(body_out.contains("i"));
        assert!(body_out.contains("n"));
    }

    #[test]
    fn fixed_point_satisfies_the_equation() {
        let decl = function(
            "F",
            Stmt::Compound(vec![
                Stmt::Test {
                    condition: Box::new(var("p")),
                    then_branch: Box::new(assign("x", var("a"))),
                    else_branch: Box::new(assign("x", var("b"))),
                },
                assign("y", var("x")),
            ]),
        );
        let cfg = Cfg::build(&decl);
        let ids: Vec<BlockId> = cfg.blocks.keys().copied().collect();
        let mut analysis = LivenessAnalysis::new(false);
        analysis.add_cfg(cfg);
        analysis.run();

        for id in ids {
            let sets = analysis.block_sets("F", id).unwrap();
            let mut expect = sets.use_set.clone();
            expect.extend(sets.out_set.difference(&sets.def_set).cloned());
            assert_eq!(sets.in_set, expect, "equation holds for block {id}");
        }
    }

    #[test]
    fn branch_uses_flow_into_the_condition_block() {
        let decl = function(
            "F",
            Stmt::Compound(vec![Stmt::If {
                condition: Box::new(var("p")),
                then_branch: Box::new(assign("q", var("r"))),
            }]),
        );
        let cfg = Cfg::build(&decl);
        let mut analysis = LivenessAnalysis::new(false);
        analysis.add_cfg(cfg);
        analysis.run();

        let entry_in = analysis.live_in("F", 0).unwrap();
        assert!(entry_in.contains("p"));
        assert!(entry_in.contains("r"));
    }
}
