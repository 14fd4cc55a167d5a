//! The typed AST the code generator consumes. These definitions mirror the
//! front end's node set; the core only reads them.

/// Variable type as resolved by semantic analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum VarType {
    #[default]
    Integer,
    Float,
    /// Not yet resolved; treated as integer width.
    Any,
}

/// A whole translation unit.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub declarations: Vec<Declaration>,
    pub statements: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub enum Declaration {
    /// `LET f(a, b) = expr` or `LET R(a) BE command`.
    Function(FunctionDecl),
    /// `LET a, b = e1, e2` (FLET for floats).
    Let(LetDecl),
    /// `MANIFEST $( NAME = k $)`.
    Manifest { name: String, value: i64 },
    /// `STATIC $( name = init $)`.
    Static { name: String, init: Expr, is_float: bool },
    /// `GLOBAL $( name: slot $)`.
    Global { name: String, slot: u32 },
}

#[derive(Clone, Debug)]
pub struct FunctionDecl {
    pub name: String,
    pub parameters: Vec<String>,
    /// A function has a result expression, a routine has a command body.
    pub body: FunctionBody,
    pub returns_float: bool,
}

#[derive(Clone, Debug)]
pub enum FunctionBody {
    Expr(Box<Expr>),
    Stmt(Box<Stmt>),
}

#[derive(Clone, Debug)]
pub struct LetDecl {
    pub names: Vec<String>,
    pub initializers: Vec<Expr>,
    pub is_float: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Lshift,
    Rshift,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    /// `!e` word indirection.
    Indirect,
    /// `@e` address-of.
    AddrOf,
    /// `FLOAT e` / `FIX e` conversions.
    IntToFloat,
    FloatToInt,
}

#[derive(Clone, Debug)]
pub enum Expr {
    NumberLit(i64),
    FloatLit(f64),
    StringLit(String),
    CharLit(u32),
    VariableAccess(String),
    BinaryOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
        is_float: bool,
    },
    UnaryOp {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// `v!i` — word indexing into a vector.
    VectorAccess {
        vector: Box<Expr>,
        index: Box<Expr>,
    },
    /// `s%i` — character indexing into a string.
    CharIndirection {
        string: Box<Expr>,
        index: Box<Expr>,
    },
    /// `v.!i` — float element indexing.
    FloatVectorIndirection {
        vector: Box<Expr>,
        index: Box<Expr>,
    },
    FunctionCall {
        function: Box<Expr>,
        arguments: Vec<Expr>,
    },
    ConditionalExpr {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `VALOF command` — the command yields via RESULTIS.
    Valof {
        body: Box<Stmt>,
        is_float: bool,
    },
    /// `VEC k` allocation.
    VecAllocation { size: Box<Expr> },
    /// `STRING k` allocation.
    StringAllocation { size: Box<Expr> },
    /// `TABLE e1, e2, …`.
    Table { initializers: Vec<Expr> },
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Assignment {
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
    },
    RoutineCall {
        routine: Box<Expr>,
        arguments: Vec<Expr>,
    },
    If {
        condition: Box<Expr>,
        then_branch: Box<Stmt>,
    },
    Unless {
        condition: Box<Expr>,
        then_branch: Box<Stmt>,
    },
    Test {
        condition: Box<Expr>,
        then_branch: Box<Stmt>,
        else_branch: Box<Stmt>,
    },
    While {
        condition: Box<Expr>,
        body: Box<Stmt>,
    },
    Until {
        condition: Box<Expr>,
        body: Box<Stmt>,
    },
    Repeat {
        body: Box<Stmt>,
        condition: Option<Box<Expr>>,
    },
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Box<Stmt>,
    },
    Switchon {
        expression: Box<Expr>,
        cases: Vec<(i64, Stmt)>,
        default_case: Option<Box<Stmt>>,
    },
    Resultis(Box<Expr>),
    Return,
    Finish,
    Goto(Box<Expr>),
    Label(String),
    Block {
        declarations: Vec<LetDecl>,
        statements: Vec<Stmt>,
    },
    Compound(Vec<Stmt>),
    Free(Box<Expr>),
}

impl Expr {
    /// Walk every variable name read by this expression.
    pub fn for_each_variable(&self, f: &mut impl FnMut(&str)) {
        match self {
            Expr::NumberLit(_) | Expr::FloatLit(_) | Expr::StringLit(_) | Expr::CharLit(_) => {}
            Expr::VariableAccess(name) => f(name),
            Expr::BinaryOp { left, right, .. } => {
                left.for_each_variable(f);
                right.for_each_variable(f);
            }
            Expr::UnaryOp { operand, .. } => operand.for_each_variable(f),
            Expr::VectorAccess { vector, index }
            | Expr::CharIndirection { string: vector, index }
            | Expr::FloatVectorIndirection { vector, index } => {
                vector.for_each_variable(f);
                index.for_each_variable(f);
            }
            Expr::FunctionCall { function, arguments } => {
                function.for_each_variable(f);
                for arg in arguments {
                    arg.for_each_variable(f);
                }
            }
            Expr::ConditionalExpr { condition, then_expr, else_expr } => {
                condition.for_each_variable(f);
                then_expr.for_each_variable(f);
                else_expr.for_each_variable(f);
            }
            Expr::Valof { body, .. } => body.for_each_read_variable(f),
            Expr::VecAllocation { size } | Expr::StringAllocation { size } => {
                size.for_each_variable(f)
            }
            Expr::Table { initializers } => {
                for init in initializers {
                    init.for_each_variable(f);
                }
            }
        }
    }
}

impl Stmt {
    /// Walk every variable name this statement reads, in evaluation order.
    /// Assignment left-hand sides contribute their *address* subexpressions
    /// (a store through `v!i` reads `v` and `i`), but a bare variable on
    /// the left is a write, not a read.
    pub fn for_each_read_variable(&self, f: &mut impl FnMut(&str)) {
        match self {
            Stmt::Assignment { lhs, rhs } => {
                for expr in rhs {
                    expr.for_each_variable(f);
                }
                for target in lhs {
                    match target {
                        Expr::VariableAccess(_) => {}
                        other => other.for_each_variable(f),
                    }
                }
            }
            Stmt::RoutineCall { routine, arguments } => {
                routine.for_each_variable(f);
                for arg in arguments {
                    arg.for_each_variable(f);
                }
            }
            Stmt::If { condition, then_branch } | Stmt::Unless { condition, then_branch } => {
                condition.for_each_variable(f);
                then_branch.for_each_read_variable(f);
            }
            Stmt::Test { condition, then_branch, else_branch } => {
                condition.for_each_variable(f);
                then_branch.for_each_read_variable(f);
                else_branch.for_each_read_variable(f);
            }
            Stmt::While { condition, body } | Stmt::Until { condition, body } => {
                condition.for_each_variable(f);
                body.for_each_read_variable(f);
            }
            Stmt::Repeat { body, condition } => {
                body.for_each_read_variable(f);
                if let Some(condition) = condition {
                    condition.for_each_variable(f);
                }
            }
            Stmt::For { start, end, step, body, .. } => {
                start.for_each_variable(f);
                end.for_each_variable(f);
                if let Some(step) = step {
                    step.for_each_variable(f);
                }
                body.for_each_read_variable(f);
            }
            Stmt::Switchon { expression, cases, default_case } => {
                expression.for_each_variable(f);
                for (_, case) in cases {
                    case.for_each_read_variable(f);
                }
                if let Some(default_case) = default_case {
                    default_case.for_each_read_variable(f);
                }
            }
            Stmt::Resultis(expr) | Stmt::Goto(expr) | Stmt::Free(expr) => {
                expr.for_each_variable(f)
            }
            Stmt::Return | Stmt::Finish | Stmt::Label(_) => {}
            Stmt::Block { declarations, statements } => {
                for decl in declarations {
                    for init in &decl.initializers {
                        init.for_each_variable(f);
                    }
                }
                for stmt in statements {
                    stmt.for_each_read_variable(f);
                }
            }
            Stmt::Compound(statements) => {
                for stmt in statements {
                    stmt.for_each_read_variable(f);
                }
            }
        }
    }

    /// Walk every variable name this statement writes directly (assignment
    /// to a bare variable, FOR loop induction variables, block-local LETs).
    pub fn for_each_written_variable(&self, f: &mut impl FnMut(&str)) {
        match self {
            Stmt::Assignment { lhs, .. } => {
                for target in lhs {
                    if let Expr::VariableAccess(name) = target {
                        f(name);
                    }
                }
            }
            Stmt::For { var, .. } => f(var),
            Stmt::Block { declarations, .. } => {
                for decl in declarations {
                    for name in &decl.names {
                        f(name);
                    }
                }
            }
            _ => {}
        }
    }
}
