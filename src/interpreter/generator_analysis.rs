use crate::ast::*;
use std::collections::HashSet;

/// Shape summary of a plan-driven body, logged when its plan is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorAnalysis {
    pub yield_points: usize,
    pub delegate_points: usize,
    pub await_points: usize,
    pub try_statements: usize,
    pub loops: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendCount {
    pub yields: usize,
    pub awaits: usize,
}

impl SuspendCount {
    pub fn total(self) -> usize {
        self.yields + self.awaits
    }

    fn add(self, other: SuspendCount) -> SuspendCount {
        SuspendCount {
            yields: self.yields + other.yields,
            awaits: self.awaits + other.awaits,
        }
    }
}

pub fn analyze_generator_body(body: &[Statement], is_async: bool) -> GeneratorAnalysis {
    let mut analysis = GeneratorAnalysis::default();
    for stmt in body {
        analyze_statement(stmt, is_async, &mut analysis);
    }
    analysis
}

fn analyze_statement(stmt: &Statement, is_async: bool, analysis: &mut GeneratorAnalysis) {
    let visit_expr = |e: &Expression, analysis: &mut GeneratorAnalysis| {
        count_points(e, is_async, analysis);
    };
    match stmt {
        Statement::Empty
        | Statement::Break(_)
        | Statement::Continue(_)
        | Statement::FunctionDeclaration(_) => {}
        Statement::Expression(e) | Statement::Throw(e) => visit_expr(e, analysis),
        Statement::Return(e) => {
            if let Some(e) = e {
                visit_expr(e, analysis);
            }
        }
        Statement::Block(stmts) => {
            for s in stmts {
                analyze_statement(s, is_async, analysis);
            }
        }
        Statement::Variable(decl) => {
            for d in &decl.declarations {
                if let Some(init) = &d.init {
                    visit_expr(init, analysis);
                }
            }
        }
        Statement::If(i) => {
            visit_expr(&i.test, analysis);
            analyze_statement(&i.consequent, is_async, analysis);
            if let Some(alt) = &i.alternate {
                analyze_statement(alt, is_async, analysis);
            }
        }
        Statement::While(w) => {
            analysis.loops += 1;
            visit_expr(&w.test, analysis);
            analyze_statement(&w.body, is_async, analysis);
        }
        Statement::DoWhile(d) => {
            analysis.loops += 1;
            analyze_statement(&d.body, is_async, analysis);
            visit_expr(&d.test, analysis);
        }
        Statement::For(f) => {
            analysis.loops += 1;
            match &f.init {
                Some(ForInit::Variable(decl)) => {
                    for d in &decl.declarations {
                        if let Some(init) = &d.init {
                            visit_expr(init, analysis);
                        }
                    }
                }
                Some(ForInit::Expression(e)) => visit_expr(e, analysis),
                None => {}
            }
            if let Some(t) = &f.test {
                visit_expr(t, analysis);
            }
            if let Some(u) = &f.update {
                visit_expr(u, analysis);
            }
            analyze_statement(&f.body, is_async, analysis);
        }
        Statement::ForIn(f) => {
            analysis.loops += 1;
            visit_expr(&f.right, analysis);
            analyze_statement(&f.body, is_async, analysis);
        }
        Statement::ForOf(f) => {
            analysis.loops += 1;
            if f.is_await {
                analysis.await_points += 1;
            }
            visit_expr(&f.right, analysis);
            analyze_statement(&f.body, is_async, analysis);
        }
        Statement::Try(t) => {
            analysis.try_statements += 1;
            for s in &t.block {
                analyze_statement(s, is_async, analysis);
            }
            if let Some(h) = &t.handler {
                for s in &h.body {
                    analyze_statement(s, is_async, analysis);
                }
            }
            if let Some(f) = &t.finalizer {
                for s in f {
                    analyze_statement(s, is_async, analysis);
                }
            }
        }
        Statement::Switch(s) => {
            visit_expr(&s.discriminant, analysis);
            for case in &s.cases {
                if let Some(t) = &case.test {
                    visit_expr(t, analysis);
                }
                for c in &case.consequent {
                    analyze_statement(c, is_async, analysis);
                }
            }
        }
        Statement::Labeled(_, inner) => analyze_statement(inner, is_async, analysis),
    }
}

fn count_points(expr: &Expression, is_async: bool, analysis: &mut GeneratorAnalysis) {
    visit_suspends(expr, is_async, &mut |e| match e {
        Expression::Yield(_, true) => analysis.delegate_points += 1,
        Expression::Yield(_, false) => analysis.yield_points += 1,
        _ => analysis.await_points += 1,
    });
}

/// Calls `f` on every suspend expression in `expr`, outermost first.
/// Nested functions are not entered; their suspend points are their own.
fn visit_suspends(expr: &Expression, is_async: bool, f: &mut dyn FnMut(&Expression)) {
    match expr {
        Expression::Yield(arg, _) => {
            f(expr);
            if let Some(arg) = arg {
                visit_suspends(arg, is_async, f);
            }
        }
        Expression::Await(arg) => {
            if is_async {
                f(expr);
            }
            visit_suspends(arg, is_async, f);
        }
        Expression::Literal(_) | Expression::Identifier(_) | Expression::This => {}
        Expression::Function(_) | Expression::ArrowFunction(_) => {}
        Expression::Array(elems) => {
            for e in elems.iter().flatten() {
                visit_suspends(e, is_async, f);
            }
        }
        Expression::Object(props) => {
            for p in props {
                if let PropertyKey::Computed(k) = &p.key {
                    visit_suspends(k, is_async, f);
                }
                visit_suspends(&p.value, is_async, f);
            }
        }
        Expression::Unary(_, e)
        | Expression::Typeof(e)
        | Expression::Void(e)
        | Expression::Spread(e)
        | Expression::Update(_, _, e) => visit_suspends(e, is_async, f),
        Expression::Binary(_, l, r)
        | Expression::Logical(_, l, r)
        | Expression::Assign(_, l, r) => {
            visit_suspends(l, is_async, f);
            visit_suspends(r, is_async, f);
        }
        Expression::Conditional(t, c, a) => {
            visit_suspends(t, is_async, f);
            visit_suspends(c, is_async, f);
            visit_suspends(a, is_async, f);
        }
        Expression::Call(callee, args) | Expression::New(callee, args) => {
            visit_suspends(callee, is_async, f);
            for a in args {
                visit_suspends(a, is_async, f);
            }
        }
        Expression::Member(obj, prop) => {
            visit_suspends(obj, is_async, f);
            if let MemberProperty::Computed(k) = prop {
                visit_suspends(k, is_async, f);
            }
        }
        Expression::Sequence(items) => {
            for e in items {
                visit_suspends(e, is_async, f);
            }
        }
    }
}

pub fn expr_suspend_count(expr: &Expression, is_async: bool) -> SuspendCount {
    let mut count = SuspendCount::default();
    visit_suspends(expr, is_async, &mut |e| {
        let one = match e {
            Expression::Yield(..) => SuspendCount { yields: 1, awaits: 0 },
            _ => SuspendCount { yields: 0, awaits: 1 },
        };
        count = count.add(one);
    });
    count
}

/// `yield (yield x)` and friends.
pub fn has_nested_yield(expr: &Expression) -> bool {
    let mut nested = false;
    visit_suspends(expr, false, &mut |e| {
        if let Expression::Yield(Some(arg), _) = e
            && expr_suspend_count(arg, false).yields > 0
        {
            nested = true;
        }
    });
    nested
}

pub fn expr_contains_suspend(expr: &Expression, is_async: bool) -> bool {
    expr_suspend_count(expr, is_async).total() > 0
}

pub fn pattern_contains_suspend(pattern: &Pattern, is_async: bool) -> bool {
    match pattern {
        Pattern::Identifier(_) => false,
        Pattern::Array(elements) => elements.iter().flatten().any(|elem| match elem {
            ArrayPatternElement::Pattern(p) | ArrayPatternElement::Rest(p) => {
                pattern_contains_suspend(p, is_async)
            }
        }),
        Pattern::Object(props) => props.iter().any(|prop| match prop {
            ObjectPatternProperty::KeyValue(key, p) => {
                matches!(key, PropertyKey::Computed(k) if expr_contains_suspend(k, is_async))
                    || pattern_contains_suspend(p, is_async)
            }
            ObjectPatternProperty::Shorthand(_) => false,
        }),
        Pattern::Assign(inner, default) => {
            pattern_contains_suspend(inner, is_async) || expr_contains_suspend(default, is_async)
        }
        Pattern::Rest(inner) => pattern_contains_suspend(inner, is_async),
    }
}

/// Whether a statement contains a suspend point outside nested functions.
/// A `for await` loop counts as one on its own.
pub fn contains_suspend(stmt: &Statement, is_async: bool) -> bool {
    let e = |expr: &Expression| expr_contains_suspend(expr, is_async);
    let s = |stmt: &Statement| contains_suspend(stmt, is_async);
    match stmt {
        Statement::Empty
        | Statement::Break(_)
        | Statement::Continue(_)
        | Statement::FunctionDeclaration(_) => false,
        Statement::Expression(expr) | Statement::Throw(expr) => e(expr),
        Statement::Block(stmts) => stmts.iter().any(s),
        Statement::Variable(decl) => decl.declarations.iter().any(|d| {
            d.init.as_ref().is_some_and(e) || pattern_contains_suspend(&d.pattern, is_async)
        }),
        Statement::If(if_stmt) => {
            e(&if_stmt.test)
                || s(&if_stmt.consequent)
                || if_stmt.alternate.as_deref().is_some_and(s)
        }
        Statement::While(w) => e(&w.test) || s(&w.body),
        Statement::DoWhile(d) => s(&d.body) || e(&d.test),
        Statement::For(f) => {
            f.init.as_ref().is_some_and(|i| match i {
                ForInit::Variable(v) => v.declarations.iter().any(|d| {
                    d.init.as_ref().is_some_and(e)
                        || pattern_contains_suspend(&d.pattern, is_async)
                }),
                ForInit::Expression(expr) => e(expr),
            }) || f.test.as_ref().is_some_and(e)
                || f.update.as_ref().is_some_and(e)
                || s(&f.body)
        }
        Statement::ForIn(f) => e(&f.right) || s(&f.body) || left_contains_suspend(&f.left, is_async),
        Statement::ForOf(f) => {
            (f.is_await && is_async)
                || e(&f.right)
                || s(&f.body)
                || left_contains_suspend(&f.left, is_async)
        }
        Statement::Return(expr) => expr.as_ref().is_some_and(e),
        Statement::Try(t) => {
            t.block.iter().any(s)
                || t.handler.as_ref().is_some_and(|h| {
                    h.body.iter().any(s)
                        || h.param
                            .as_ref()
                            .is_some_and(|p| pattern_contains_suspend(p, is_async))
                })
                || t.finalizer.as_ref().is_some_and(|f| f.iter().any(s))
        }
        Statement::Switch(sw) => {
            e(&sw.discriminant)
                || sw
                    .cases
                    .iter()
                    .any(|c| c.test.as_ref().is_some_and(e) || c.consequent.iter().any(s))
        }
        Statement::Labeled(_, inner) => s(inner),
    }
}

fn left_contains_suspend(left: &ForInOfLeft, is_async: bool) -> bool {
    match left {
        ForInOfLeft::Variable(_, p) | ForInOfLeft::Pattern(p) => {
            pattern_contains_suspend(p, is_async)
        }
    }
}

/// Names bound by a pattern, in source order.
pub fn collect_pattern_names(pattern: &Pattern, out: &mut Vec<String>) {
    match pattern {
        Pattern::Identifier(name) => out.push(name.clone()),
        Pattern::Array(elements) => {
            for elem in elements.iter().flatten() {
                match elem {
                    ArrayPatternElement::Pattern(p) | ArrayPatternElement::Rest(p) => {
                        collect_pattern_names(p, out);
                    }
                }
            }
        }
        Pattern::Object(props) => {
            for prop in props {
                match prop {
                    ObjectPatternProperty::KeyValue(_, p) => collect_pattern_names(p, out),
                    ObjectPatternProperty::Shorthand(name) => out.push(name.clone()),
                }
            }
        }
        Pattern::Assign(inner, _) | Pattern::Rest(inner) => collect_pattern_names(inner, out),
    }
}

/// `var`-declared names of a function body, nested blocks included.
pub fn collect_var_names(stmts: &[Statement]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for stmt in stmts {
        collect_var_names_in(stmt, &mut names);
    }
    names.retain(|n| seen.insert(n.clone()));
    names
}

fn collect_var_names_in(stmt: &Statement, out: &mut Vec<String>) {
    let var_decl = |decl: &VariableDeclaration, out: &mut Vec<String>| {
        if decl.kind == VarKind::Var {
            for d in &decl.declarations {
                collect_pattern_names(&d.pattern, out);
            }
        }
    };
    match stmt {
        Statement::Variable(decl) => var_decl(decl, out),
        Statement::Block(stmts) => {
            for s in stmts {
                collect_var_names_in(s, out);
            }
        }
        Statement::If(i) => {
            collect_var_names_in(&i.consequent, out);
            if let Some(alt) = &i.alternate {
                collect_var_names_in(alt, out);
            }
        }
        Statement::While(w) => collect_var_names_in(&w.body, out),
        Statement::DoWhile(d) => collect_var_names_in(&d.body, out),
        Statement::For(f) => {
            if let Some(ForInit::Variable(decl)) = &f.init {
                var_decl(decl, out);
            }
            collect_var_names_in(&f.body, out);
        }
        Statement::ForIn(ForInStatement { left, body, .. })
        | Statement::ForOf(ForOfStatement { left, body, .. }) => {
            if let ForInOfLeft::Variable(VarKind::Var, p) = left {
                collect_pattern_names(p, out);
            }
            collect_var_names_in(body, out);
        }
        Statement::Try(t) => {
            for s in &t.block {
                collect_var_names_in(s, out);
            }
            if let Some(h) = &t.handler {
                for s in &h.body {
                    collect_var_names_in(s, out);
                }
            }
            if let Some(f) = &t.finalizer {
                for s in f {
                    collect_var_names_in(s, out);
                }
            }
        }
        Statement::Switch(s) => {
            for case in &s.cases {
                for c in &case.consequent {
                    collect_var_names_in(c, out);
                }
            }
        }
        Statement::Labeled(_, inner) => collect_var_names_in(inner, out),
        _ => {}
    }
}

/// Function declarations directly in `stmts`, hoisted to the top of their scope.
pub fn collect_function_declarations(stmts: &[Statement]) -> Vec<FunctionDecl> {
    stmts
        .iter()
        .filter_map(|s| match s {
            Statement::FunctionDeclaration(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}
