use std::rc::Rc;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Lteq,
    Gt,
    Gteq,
    In,
    NotIn,
}

/// Expression nodes. Pure except for calls, filters and tests, which
/// dispatch through the environment registries at render time.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String),
    Const(Value),
    /// Literal template text inside an `Output` statement.
    TemplateData(String),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Chained comparison: `a < b <= c` keeps one left operand and a
    /// list of `(op, operand)` links evaluated left to right.
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    Getattr {
        target: Box<Expr>,
        name: String,
    },
    Getitem {
        target: Box<Expr>,
        key: Box<Expr>,
    },
    /// Only ever appears as the key of a `Getitem`.
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        target: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        var_arg: Option<Box<Expr>>,
        kw_arg: Option<Box<Expr>>,
    },
    Filter {
        name: String,
        /// Absent in `{% filter %}` and `{% set %}` block pipelines,
        /// where the rendered body becomes the operand.
        operand: Option<Box<Expr>>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Test {
        name: String,
        operand: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    /// Inline `a if cond else b`; a missing else branch yields undefined.
    Condition {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    /// `~` string concatenation, n-ary.
    Concat(Vec<Expr>),
}

/// A filter applied without an inline operand (filter blocks, set blocks).
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
}

/// A `{% block %}` definition. The body is reference-counted so
/// inheritance chains can hold on to it past the defining template's
/// render frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDef {
    pub name: String,
    pub scoped: bool,
    pub required: bool,
    pub body: Rc<Vec<Stmt>>,
}

/// A `{% macro %}` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroDecl {
    pub name: String,
    pub args: Vec<String>,
    /// Aligned with the trailing entries of `args`.
    pub defaults: Vec<Expr>,
    pub body: Rc<Vec<Stmt>>,
}

/// Statement nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Mixed literal data and expressions emitted in order.
    Output(Vec<Expr>),
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_body: Vec<Stmt>,
    },
    For {
        targets: Vec<String>,
        iter: Expr,
        body: Rc<Vec<Stmt>>,
        else_body: Vec<Stmt>,
        filter: Option<Expr>,
        recursive: bool,
    },
    Set {
        targets: Vec<String>,
        value: Expr,
    },
    AssignBlock {
        target: String,
        filters: Vec<FilterSpec>,
        body: Vec<Stmt>,
    },
    Block(BlockDef),
    Extends {
        template: Expr,
    },
    Include {
        template: Expr,
        ignore_missing: bool,
        with_context: bool,
    },
    Import {
        template: Expr,
        alias: String,
        with_context: bool,
    },
    FromImport {
        template: Expr,
        names: Vec<(String, Option<String>)>,
        with_context: bool,
    },
    Macro(MacroDecl),
    CallBlock {
        call: Expr,
        caller_args: Vec<String>,
        body: Rc<Vec<Stmt>>,
    },
    FilterBlock {
        filters: Vec<FilterSpec>,
        body: Vec<Stmt>,
    },
    With {
        targets: Vec<String>,
        values: Vec<Expr>,
        body: Vec<Stmt>,
    },
    Do(Expr),
    AutoEscape {
        value: Expr,
        body: Vec<Stmt>,
    },
    /// Pushes evaluated overrides around its body. Has no surface
    /// syntax; AST modifier passes insert it to inject ambient
    /// variables.
    ScopedContextModifier {
        overrides: Vec<(String, Expr)>,
        body: Vec<Stmt>,
    },
}

/// A borrowed reference to either node family, for generic walks.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Stmt(&'a Stmt),
    Expr(&'a Expr),
}

impl Expr {
    /// Direct children, expressions only (expressions never contain
    /// statements).
    pub fn children(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        match self {
            Expr::Name(_) | Expr::Const(_) | Expr::TemplateData(_) => {}
            Expr::Tuple(items) | Expr::List(items) | Expr::Concat(items) => {
                out.extend(items.iter());
            }
            Expr::Dict(pairs) => {
                for (k, v) in pairs {
                    out.push(k);
                    out.push(v);
                }
            }
            Expr::Unary { operand, .. } => out.push(operand),
            Expr::Binary { left, right, .. } => {
                out.push(left);
                out.push(right);
            }
            Expr::Compare { left, ops } => {
                out.push(left);
                out.extend(ops.iter().map(|(_, rhs)| rhs));
            }
            Expr::Getattr { target, .. } => out.push(target),
            Expr::Getitem { target, key } => {
                out.push(target);
                out.push(key);
            }
            Expr::Slice { start, stop, step } => {
                out.extend(start.as_deref());
                out.extend(stop.as_deref());
                out.extend(step.as_deref());
            }
            Expr::Call {
                target,
                args,
                kwargs,
                var_arg,
                kw_arg,
            } => {
                out.push(target);
                out.extend(args.iter());
                out.extend(kwargs.iter().map(|(_, v)| v));
                out.extend(var_arg.as_deref());
                out.extend(kw_arg.as_deref());
            }
            Expr::Filter {
                operand,
                args,
                kwargs,
                ..
            } => {
                out.extend(operand.as_deref());
                out.extend(args.iter());
                out.extend(kwargs.iter().map(|(_, v)| v));
            }
            Expr::Test {
                operand,
                args,
                kwargs,
                ..
            } => {
                out.push(operand);
                out.extend(args.iter());
                out.extend(kwargs.iter().map(|(_, v)| v));
            }
            Expr::Condition {
                test,
                then,
                otherwise,
            } => {
                out.push(test);
                out.push(then);
                out.extend(otherwise.as_deref());
            }
        }
        out
    }
}

impl Stmt {
    /// Direct children of this statement, in source order.
    pub fn children(&self) -> Vec<NodeRef<'_>> {
        fn filter_exprs<'a>(out: &mut Vec<NodeRef<'a>>, filters: &'a [FilterSpec]) {
            for f in filters {
                out.extend(f.args.iter().map(NodeRef::Expr));
                out.extend(f.kwargs.iter().map(|(_, v)| NodeRef::Expr(v)));
            }
        }
        let mut out = Vec::new();
        match self {
            Stmt::Output(items) => out.extend(items.iter().map(NodeRef::Expr)),
            Stmt::If { arms, else_body } => {
                for (cond, body) in arms {
                    out.push(NodeRef::Expr(cond));
                    out.extend(body.iter().map(NodeRef::Stmt));
                }
                out.extend(else_body.iter().map(NodeRef::Stmt));
            }
            Stmt::For {
                iter,
                body,
                else_body,
                filter,
                ..
            } => {
                out.push(NodeRef::Expr(iter));
                if let Some(f) = filter {
                    out.push(NodeRef::Expr(f));
                }
                out.extend(body.iter().map(NodeRef::Stmt));
                out.extend(else_body.iter().map(NodeRef::Stmt));
            }
            Stmt::Set { value, .. } => out.push(NodeRef::Expr(value)),
            Stmt::AssignBlock { filters, body, .. } => {
                filter_exprs(&mut out, filters);
                out.extend(body.iter().map(NodeRef::Stmt));
            }
            Stmt::Block(block) => out.extend(block.body.iter().map(NodeRef::Stmt)),
            Stmt::Extends { template }
            | Stmt::Include { template, .. }
            | Stmt::Import { template, .. }
            | Stmt::FromImport { template, .. } => out.push(NodeRef::Expr(template)),
            Stmt::Macro(decl) => {
                out.extend(decl.defaults.iter().map(NodeRef::Expr));
                out.extend(decl.body.iter().map(NodeRef::Stmt));
            }
            Stmt::CallBlock { call, body, .. } => {
                out.push(NodeRef::Expr(call));
                out.extend(body.iter().map(NodeRef::Stmt));
            }
            Stmt::FilterBlock { filters, body } => {
                filter_exprs(&mut out, filters);
                out.extend(body.iter().map(NodeRef::Stmt));
            }
            Stmt::With { values, body, .. } => {
                out.extend(values.iter().map(NodeRef::Expr));
                out.extend(body.iter().map(NodeRef::Stmt));
            }
            Stmt::Do(expr) => out.push(NodeRef::Expr(expr)),
            Stmt::AutoEscape { value, body } => {
                out.push(NodeRef::Expr(value));
                out.extend(body.iter().map(NodeRef::Stmt));
            }
            Stmt::ScopedContextModifier { overrides, body } => {
                out.extend(overrides.iter().map(|(_, v)| NodeRef::Expr(v)));
                out.extend(body.iter().map(NodeRef::Stmt));
            }
        }
        out
    }
}

/// Pre-order walk over a statement list, visiting every statement and
/// expression. `find_all`-style queries are a filtering fold over this.
pub fn walk<'a>(stmts: &'a [Stmt], visit: &mut dyn FnMut(NodeRef<'a>)) {
    for stmt in stmts {
        walk_node(NodeRef::Stmt(stmt), visit);
    }
}

fn walk_node<'a>(node: NodeRef<'a>, visit: &mut dyn FnMut(NodeRef<'a>)) {
    visit(node);
    match node {
        NodeRef::Stmt(stmt) => {
            for child in stmt.children() {
                walk_node(child, visit);
            }
        }
        NodeRef::Expr(expr) => {
            for child in expr.children() {
                walk_node(NodeRef::Expr(child), visit);
            }
        }
    }
}

/// Every `{% block %}` in the tree, in pre-order.
pub fn find_blocks(stmts: &[Stmt]) -> Vec<&BlockDef> {
    let mut blocks = Vec::new();
    walk(stmts, &mut |node| {
        if let NodeRef::Stmt(Stmt::Block(def)) = node {
            blocks.push(def);
        }
    });
    blocks
}
