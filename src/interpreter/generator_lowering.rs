use super::generator_analysis::{
    contains_suspend, expr_contains_suspend, expr_suspend_count, has_nested_yield,
    pattern_contains_suspend,
};
use crate::ast::*;
use crate::error::UnsupportedShape;

pub const SLOT_PREFIX: &str = "%resume";

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredBody {
    pub body: Vec<Statement>,
    /// Every resume slot the body writes, in first-write order.
    pub slots: Vec<String>,
}

/// Moves every suspend point into a simple statement shape, storing the
/// resumed value in a fresh `%resumeN` slot read by the original position.
pub fn lower_body(body: &[Statement], is_async: bool) -> Result<LoweredBody> {
    let existing = collect_slots(body);
    let next_slot = existing
        .iter()
        .filter_map(|s| s.strip_prefix(SLOT_PREFIX)?.parse::<usize>().ok())
        .max()
        .map_or(0, |n| n + 1);
    let mut lowering = Lowering {
        is_async,
        next_slot,
    };
    let body = lowering.lower_statements(body)?;
    let slots = collect_slots(&body);
    Ok(LoweredBody { body, slots })
}

struct Lowering {
    is_async: bool,
    next_slot: usize,
}

type Result<T> = std::result::Result<T, UnsupportedShape>;

impl Lowering {
    fn contains(&self, expr: &Expression) -> bool {
        expr_contains_suspend(expr, self.is_async)
    }

    fn is_suspend(&self, expr: &Expression) -> bool {
        match expr {
            Expression::Yield(..) => true,
            Expression::Await(_) => self.is_async,
            _ => false,
        }
    }

    fn is_simple_suspend(&self, expr: &Expression) -> bool {
        match expr {
            Expression::Yield(arg, _) if self.is_suspend(expr) => {
                arg.as_deref().is_none_or(|a| !self.contains(a))
            }
            Expression::Await(arg) if self.is_suspend(expr) => !self.contains(arg),
            _ => false,
        }
    }

    /// A statement-level expression the builder compiles without help.
    fn is_simple_effect(&self, expr: &Expression) -> bool {
        match expr {
            Expression::Assign(AssignOp::Assign, target, value)
                if matches!(**target, Expression::Identifier(_)) =>
            {
                self.is_simple_suspend(value)
            }
            _ => self.is_simple_suspend(expr),
        }
    }

    fn is_lowered_condition(&self, expr: &Expression) -> bool {
        match expr {
            Expression::Sequence(items) => match items.split_last() {
                Some((last, init)) => {
                    !self.contains(last)
                        && init
                            .iter()
                            .all(|e| !self.contains(e) || self.is_simple_effect(e))
                }
                None => true,
            },
            _ => !self.contains(expr),
        }
    }

    fn check(&self, expr: &Expression) -> Result<()> {
        if expr_suspend_count(expr, self.is_async).yields > 1 {
            if has_nested_yield(expr) {
                return Err(UnsupportedShape::new("yield inside another yield's operand"));
            }
            return Err(UnsupportedShape::new(
                "multiple yield expressions in one expression",
            ));
        }
        Ok(())
    }

    fn fresh_slot(&mut self) -> String {
        let name = format!("{SLOT_PREFIX}{}", self.next_slot);
        self.next_slot += 1;
        name
    }

    fn lower_statements(&mut self, stmts: &[Statement]) -> Result<Vec<Statement>> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            out.extend(self.lower_statement(stmt)?);
        }
        Ok(out)
    }

    fn lower_nested(&mut self, stmt: &Statement) -> Result<Box<Statement>> {
        let mut lowered = self.lower_statement(stmt)?;
        if lowered.len() == 1
            && let Some(single) = lowered.pop()
        {
            return Ok(Box::new(single));
        }
        Ok(Box::new(Statement::Block(lowered)))
    }

    fn lower_statement(&mut self, stmt: &Statement) -> Result<Vec<Statement>> {
        if !contains_suspend(stmt, self.is_async) {
            return Ok(vec![stmt.clone()]);
        }
        let mut pre = Vec::new();
        let lowered = match stmt {
            Statement::Expression(expr) => {
                self.check(expr)?;
                self.hoist_effect(expr, &mut pre)?;
                return Ok(pre.into_iter().map(Statement::Expression).collect());
            }
            Statement::Variable(decl) => return self.lower_declaration(decl),
            Statement::Return(Some(expr)) => {
                self.check(expr)?;
                Statement::Return(Some(self.hoist(expr, &mut pre)?))
            }
            Statement::Throw(expr) => {
                self.check(expr)?;
                Statement::Throw(self.hoist(expr, &mut pre)?)
            }
            Statement::Block(stmts) => Statement::Block(self.lower_statements(stmts)?),
            Statement::If(if_stmt) => {
                self.check(&if_stmt.test)?;
                let test = self.hoist(&if_stmt.test, &mut pre)?;
                let consequent = self.lower_nested(&if_stmt.consequent)?;
                let alternate = match &if_stmt.alternate {
                    Some(alt) => Some(self.lower_nested(alt)?),
                    None => None,
                };
                Statement::If(IfStatement {
                    test,
                    consequent,
                    alternate,
                })
            }
            Statement::While(w) => Statement::While(WhileStatement {
                test: self.lower_condition(&w.test)?,
                body: self.lower_nested(&w.body)?,
            }),
            Statement::DoWhile(d) => Statement::DoWhile(DoWhileStatement {
                test: self.lower_condition(&d.test)?,
                body: self.lower_nested(&d.body)?,
            }),
            Statement::For(f) => {
                let init = match &f.init {
                    Some(ForInit::Variable(decl)) => {
                        Some(ForInit::Variable(self.lower_declaration_inline(decl, &mut pre)?))
                    }
                    Some(ForInit::Expression(expr)) if self.contains(expr) => {
                        self.check(expr)?;
                        self.hoist_effect(expr, &mut pre)?;
                        None
                    }
                    other => other.clone(),
                };
                let test = match &f.test {
                    Some(t) => Some(self.lower_condition(t)?),
                    None => None,
                };
                let update = match &f.update {
                    Some(u) => Some(self.lower_condition(u)?),
                    None => None,
                };
                Statement::For(ForStatement {
                    init,
                    test,
                    update,
                    body: self.lower_nested(&f.body)?,
                })
            }
            Statement::ForIn(f) => {
                self.check_left(&f.left)?;
                self.check(&f.right)?;
                Statement::ForIn(ForInStatement {
                    left: f.left.clone(),
                    right: self.hoist(&f.right, &mut pre)?,
                    body: self.lower_nested(&f.body)?,
                })
            }
            Statement::ForOf(f) => {
                self.check_left(&f.left)?;
                self.check(&f.right)?;
                Statement::ForOf(ForOfStatement {
                    left: f.left.clone(),
                    right: self.hoist(&f.right, &mut pre)?,
                    body: self.lower_nested(&f.body)?,
                    is_await: f.is_await,
                })
            }
            Statement::Try(t) => {
                let handler = match &t.handler {
                    Some(h) => {
                        if h
                            .param
                            .as_ref()
                            .is_some_and(|p| pattern_contains_suspend(p, self.is_async))
                        {
                            return Err(UnsupportedShape::new(
                                "suspend point in catch parameter",
                            ));
                        }
                        Some(CatchClause {
                            param: h.param.clone(),
                            body: self.lower_statements(&h.body)?,
                        })
                    }
                    None => None,
                };
                let finalizer = match &t.finalizer {
                    Some(f) => Some(self.lower_statements(f)?),
                    None => None,
                };
                Statement::Try(TryStatement {
                    block: self.lower_statements(&t.block)?,
                    handler,
                    finalizer,
                })
            }
            Statement::Switch(s) => {
                self.check(&s.discriminant)?;
                let discriminant = self.hoist(&s.discriminant, &mut pre)?;
                let mut cases = Vec::with_capacity(s.cases.len());
                for case in &s.cases {
                    if case.test.as_ref().is_some_and(|t| self.contains(t)) {
                        return Err(UnsupportedShape::new("suspend point in switch case test"));
                    }
                    cases.push(SwitchCase {
                        test: case.test.clone(),
                        consequent: self.lower_statements(&case.consequent)?,
                    });
                }
                Statement::Switch(SwitchStatement {
                    discriminant,
                    cases,
                })
            }
            Statement::Labeled(label, body) => {
                // Hoisted statements run before the labeled construct.
                let mut lowered = self.lower_statement(body)?;
                let last = lowered.pop().unwrap_or(Statement::Empty);
                lowered.push(Statement::Labeled(label.clone(), Box::new(last)));
                return Ok(lowered);
            }
            Statement::Empty
            | Statement::Return(None)
            | Statement::Break(_)
            | Statement::Continue(_)
            | Statement::FunctionDeclaration(_) => stmt.clone(),
        };
        let mut out: Vec<Statement> = pre.into_iter().map(Statement::Expression).collect();
        out.push(lowered);
        Ok(out)
    }

    fn check_left(&self, left: &ForInOfLeft) -> Result<()> {
        let (ForInOfLeft::Variable(_, p) | ForInOfLeft::Pattern(p)) = left;
        if pattern_contains_suspend(p, self.is_async) {
            return Err(UnsupportedShape::new("suspend point in loop binding pattern"));
        }
        Ok(())
    }

    /// One declaration statement per declarator, each preceded by its hoisted
    /// suspend points.
    fn lower_declaration(&mut self, decl: &VariableDeclaration) -> Result<Vec<Statement>> {
        let mut out = Vec::new();
        for d in &decl.declarations {
            if pattern_contains_suspend(&d.pattern, self.is_async) {
                return Err(UnsupportedShape::new("suspend point in binding pattern"));
            }
            let init = match &d.init {
                Some(init) if self.contains(init) => {
                    self.check(init)?;
                    let mut pre = Vec::new();
                    let lowered = self.hoist(init, &mut pre)?;
                    out.extend(pre.into_iter().map(Statement::Expression));
                    Some(lowered)
                }
                other => other.clone(),
            };
            out.push(Statement::Variable(VariableDeclaration {
                kind: decl.kind,
                declarations: vec![VariableDeclarator {
                    pattern: d.pattern.clone(),
                    init,
                }],
            }));
        }
        Ok(out)
    }

    /// Keeps the declaration whole (a `for` head), spilling earlier
    /// initializers so they still run before the hoisted suspend point.
    fn lower_declaration_inline(
        &mut self,
        decl: &VariableDeclaration,
        pre: &mut Vec<Expression>,
    ) -> Result<VariableDeclaration> {
        let last = decl
            .declarations
            .iter()
            .rposition(|d| d.init.as_ref().is_some_and(|i| self.contains(i)));
        let mut declarations = Vec::with_capacity(decl.declarations.len());
        for (i, d) in decl.declarations.iter().enumerate() {
            if pattern_contains_suspend(&d.pattern, self.is_async) {
                return Err(UnsupportedShape::new("suspend point in binding pattern"));
            }
            let init = match (&d.init, last) {
                (Some(init), Some(k)) if i < k => {
                    let hoisted = self.hoist(init, pre)?;
                    Some(self.spill(hoisted, pre))
                }
                (Some(init), Some(k)) if i == k => {
                    self.check(init)?;
                    Some(self.hoist(init, pre)?)
                }
                (other, _) => other.clone(),
            };
            declarations.push(VariableDeclarator {
                pattern: d.pattern.clone(),
                init,
            });
        }
        Ok(VariableDeclaration {
            kind: decl.kind,
            declarations,
        })
    }

    /// Loop tests and updates are re-evaluated every iteration, so their
    /// hoisted statements travel with them as a sequence.
    fn lower_condition(&mut self, test: &Expression) -> Result<Expression> {
        if !self.contains(test) {
            return Ok(test.clone());
        }
        self.check(test)?;
        if self.is_lowered_condition(test) {
            return Ok(test.clone());
        }
        let mut pre = Vec::new();
        let last = self.hoist(test, &mut pre)?;
        pre.push(last);
        Ok(Expression::Sequence(pre))
    }

    /// Lowers an expression evaluated only for its effects.
    fn hoist_effect(&mut self, expr: &Expression, pre: &mut Vec<Expression>) -> Result<()> {
        if self.is_simple_effect(expr) {
            pre.push(expr.clone());
            return Ok(());
        }
        if let Expression::Sequence(items) = expr {
            for item in items {
                self.hoist_effect(item, pre)?;
            }
            return Ok(());
        }
        let lowered = self.hoist(expr, pre)?;
        if !is_inert(&lowered) {
            pre.push(lowered);
        }
        Ok(())
    }

    fn suspend_into_slot(&mut self, suspend: Expression, pre: &mut Vec<Expression>) -> Expression {
        let slot = self.fresh_slot();
        pre.push(Expression::assign(Expression::Identifier(slot.clone()), suspend));
        Expression::Identifier(slot)
    }

    /// Stores an already evaluated operand into a slot unless re-reading it
    /// later is unobservable.
    fn spill(&mut self, expr: Expression, pre: &mut Vec<Expression>) -> Expression {
        match expr {
            Expression::Literal(_) => expr,
            Expression::Identifier(ref name) if name.starts_with('%') => expr,
            Expression::Spread(inner) => Expression::Spread(Box::new(self.spill(*inner, pre))),
            other => {
                let slot = self.fresh_slot();
                pre.push(Expression::assign(Expression::Identifier(slot.clone()), other));
                Expression::Identifier(slot)
            }
        }
    }

    /// Lowers `operands` evaluated left to right. Everything before the last
    /// operand holding a suspend point is spilled.
    fn hoist_ordered(
        &mut self,
        operands: &[&Expression],
        pre: &mut Vec<Expression>,
    ) -> Result<Vec<Expression>> {
        let Some(k) = operands.iter().rposition(|o| self.contains(o)) else {
            return Ok(operands.iter().map(|o| (*o).clone()).collect());
        };
        let mut out = Vec::with_capacity(operands.len());
        for (i, operand) in operands.iter().enumerate() {
            if i < k {
                let lowered = self.hoist(operand, pre)?;
                out.push(self.spill(lowered, pre));
            } else if i == k {
                out.push(self.hoist(operand, pre)?);
            } else {
                out.push((*operand).clone());
            }
        }
        Ok(out)
    }

    fn hoist(&mut self, expr: &Expression, pre: &mut Vec<Expression>) -> Result<Expression> {
        if !self.contains(expr) {
            return Ok(expr.clone());
        }
        match expr {
            Expression::Yield(arg, delegate) => {
                let arg = match arg {
                    Some(a) => {
                        if expr_suspend_count(a, self.is_async).yields > 0 {
                            return Err(UnsupportedShape::new(
                                "yield inside another yield's operand",
                            ));
                        }
                        Some(Box::new(self.hoist(a, pre)?))
                    }
                    None => None,
                };
                Ok(self.suspend_into_slot(Expression::Yield(arg, *delegate), pre))
            }
            Expression::Await(arg) => {
                let arg = Box::new(self.hoist(arg, pre)?);
                if self.is_async {
                    Ok(self.suspend_into_slot(Expression::Await(arg), pre))
                } else {
                    Ok(Expression::Await(arg))
                }
            }
            Expression::Unary(op, a) => Ok(Expression::Unary(*op, Box::new(self.hoist(a, pre)?))),
            Expression::Typeof(a) => Ok(Expression::Typeof(Box::new(self.hoist(a, pre)?))),
            Expression::Void(a) => Ok(Expression::Void(Box::new(self.hoist(a, pre)?))),
            Expression::Spread(a) => Ok(Expression::Spread(Box::new(self.hoist(a, pre)?))),
            Expression::Binary(op, l, r) => {
                let mut lowered = self.hoist_ordered(&[l, r], pre)?;
                let r = lowered.pop().unwrap_or(Expression::Literal(Literal::Null));
                let l = lowered.pop().unwrap_or(Expression::Literal(Literal::Null));
                Ok(Expression::binary(*op, l, r))
            }
            Expression::Logical(op, l, r) => {
                if self.contains(r) {
                    return Err(UnsupportedShape::new(
                        "suspend point in conditionally evaluated operand",
                    ));
                }
                Ok(Expression::Logical(*op, Box::new(self.hoist(l, pre)?), r.clone()))
            }
            Expression::Conditional(t, c, a) => {
                if self.contains(c) || self.contains(a) {
                    return Err(UnsupportedShape::new(
                        "suspend point in conditionally evaluated operand",
                    ));
                }
                Ok(Expression::Conditional(
                    Box::new(self.hoist(t, pre)?),
                    c.clone(),
                    a.clone(),
                ))
            }
            Expression::Update(..) => Err(UnsupportedShape::new(
                "suspend point as an update operand",
            )),
            Expression::Assign(op, target, value) => self.hoist_assign(*op, target, value, pre),
            Expression::Call(callee, args) => self.hoist_call(callee, args, pre),
            Expression::New(callee, args) => {
                let mut operands: Vec<&Expression> = vec![callee];
                operands.extend(args.iter());
                let mut lowered = self.hoist_ordered(&operands, pre)?.into_iter();
                let callee = lowered.next().unwrap_or(Expression::Literal(Literal::Null));
                Ok(Expression::New(Box::new(callee), lowered.collect()))
            }
            Expression::Member(obj, MemberProperty::Dot(name)) => Ok(Expression::Member(
                Box::new(self.hoist(obj, pre)?),
                MemberProperty::Dot(name.clone()),
            )),
            Expression::Member(obj, MemberProperty::Computed(key)) => {
                let mut lowered = self.hoist_ordered(&[obj, key], pre)?;
                let key = lowered.pop().unwrap_or(Expression::Literal(Literal::Null));
                let obj = lowered.pop().unwrap_or(Expression::Literal(Literal::Null));
                Ok(Expression::index(obj, key))
            }
            Expression::Array(elems) => {
                let operands: Vec<&Expression> = elems.iter().flatten().collect();
                let mut lowered = self.hoist_ordered(&operands, pre)?.into_iter();
                Ok(Expression::Array(
                    elems
                        .iter()
                        .map(|e| e.as_ref().and_then(|_| lowered.next()))
                        .collect(),
                ))
            }
            Expression::Object(props) => {
                let mut operands: Vec<&Expression> = Vec::new();
                for p in props {
                    if let PropertyKey::Computed(k) = &p.key {
                        operands.push(k);
                    }
                    operands.push(&p.value);
                }
                let mut lowered = self.hoist_ordered(&operands, pre)?.into_iter();
                let mut out = Vec::with_capacity(props.len());
                for p in props {
                    let key = match &p.key {
                        PropertyKey::Computed(k) => PropertyKey::Computed(Box::new(
                            lowered.next().unwrap_or_else(|| (**k).clone()),
                        )),
                        other => other.clone(),
                    };
                    let value = lowered.next().unwrap_or_else(|| p.value.clone());
                    out.push(Property { key, value });
                }
                Ok(Expression::Object(out))
            }
            Expression::Sequence(items) => {
                let Some(k) = items.iter().rposition(|e| self.contains(e)) else {
                    return Ok(expr.clone());
                };
                for item in &items[..k] {
                    self.hoist_effect(item, pre)?;
                }
                if k + 1 == items.len() {
                    return self.hoist(&items[k], pre);
                }
                self.hoist_effect(&items[k], pre)?;
                let rest = &items[k + 1..];
                if rest.len() == 1 {
                    Ok(rest[0].clone())
                } else {
                    Ok(Expression::Sequence(rest.to_vec()))
                }
            }
            Expression::Literal(_)
            | Expression::Identifier(_)
            | Expression::This
            | Expression::Function(_)
            | Expression::ArrowFunction(_) => Ok(expr.clone()),
        }
    }

    fn hoist_assign(
        &mut self,
        op: AssignOp,
        target: &Expression,
        value: &Expression,
        pre: &mut Vec<Expression>,
    ) -> Result<Expression> {
        if self.contains(target) {
            return Err(UnsupportedShape::new("suspend point in assignment target"));
        }
        let target = match target {
            Expression::Member(obj, prop) => {
                let obj = self.spill((**obj).clone(), pre);
                let prop = match prop {
                    MemberProperty::Dot(name) => MemberProperty::Dot(name.clone()),
                    MemberProperty::Computed(k) => {
                        MemberProperty::Computed(Box::new(self.spill((**k).clone(), pre)))
                    }
                };
                Expression::Member(Box::new(obj), prop)
            }
            other => other.clone(),
        };
        match op.binary_op() {
            None => Ok(Expression::assign(target, self.hoist(value, pre)?)),
            Some(binop) => {
                // The old value is read before the right-hand side runs.
                let old = self.spill(target.clone(), pre);
                let value = self.hoist(value, pre)?;
                Ok(Expression::assign(target, Expression::binary(binop, old, value)))
            }
        }
    }

    fn hoist_call(
        &mut self,
        callee: &Expression,
        args: &[Expression],
        pre: &mut Vec<Expression>,
    ) -> Result<Expression> {
        if !args.iter().any(|a| self.contains(a)) {
            return Ok(Expression::call(self.hoist(callee, pre)?, args.to_vec()));
        }
        match callee {
            // Method lookup happens at call time, on the spilled receiver.
            Expression::Member(obj, prop) => {
                let obj = self.hoist(obj, pre)?;
                let obj = self.spill(obj, pre);
                let prop = match prop {
                    MemberProperty::Dot(name) => MemberProperty::Dot(name.clone()),
                    MemberProperty::Computed(k) => {
                        let k = self.hoist(k, pre)?;
                        MemberProperty::Computed(Box::new(self.spill(k, pre)))
                    }
                };
                let operands: Vec<&Expression> = args.iter().collect();
                let args = self.hoist_ordered(&operands, pre)?;
                Ok(Expression::call(Expression::Member(Box::new(obj), prop), args))
            }
            _ => {
                let mut operands: Vec<&Expression> = vec![callee];
                operands.extend(args.iter());
                let mut lowered = self.hoist_ordered(&operands, pre)?.into_iter();
                let callee = lowered.next().unwrap_or(Expression::Literal(Literal::Null));
                Ok(Expression::call(callee, lowered.collect()))
            }
        }
    }
}

fn is_inert(expr: &Expression) -> bool {
    match expr {
        Expression::Literal(_) => true,
        Expression::Identifier(name) => name.starts_with('%'),
        _ => false,
    }
}

/// Resume slots written by `stmts`: the `%`-prefixed assignment targets of
/// statement-level expressions and loop sequences.
pub fn collect_slots(stmts: &[Statement]) -> Vec<String> {
    let mut slots = Vec::new();
    for stmt in stmts {
        collect_slots_in(stmt, &mut slots);
    }
    slots
}

fn note_slot(expr: &Expression, out: &mut Vec<String>) {
    match expr {
        Expression::Assign(AssignOp::Assign, target, _) => {
            if let Expression::Identifier(name) = &**target
                && name.starts_with('%')
                && !out.contains(name)
            {
                out.push(name.clone());
            }
        }
        Expression::Sequence(items) => {
            for item in items {
                note_slot(item, out);
            }
        }
        _ => {}
    }
}

fn collect_slots_in(stmt: &Statement, out: &mut Vec<String>) {
    match stmt {
        Statement::Expression(e) => note_slot(e, out),
        Statement::Block(stmts) => {
            for s in stmts {
                collect_slots_in(s, out);
            }
        }
        Statement::If(i) => {
            collect_slots_in(&i.consequent, out);
            if let Some(alt) = &i.alternate {
                collect_slots_in(alt, out);
            }
        }
        Statement::While(w) => {
            note_slot(&w.test, out);
            collect_slots_in(&w.body, out);
        }
        Statement::DoWhile(d) => {
            collect_slots_in(&d.body, out);
            note_slot(&d.test, out);
        }
        Statement::For(f) => {
            if let Some(ForInit::Expression(e)) = &f.init {
                note_slot(e, out);
            }
            if let Some(t) = &f.test {
                note_slot(t, out);
            }
            if let Some(u) = &f.update {
                note_slot(u, out);
            }
            collect_slots_in(&f.body, out);
        }
        Statement::ForIn(ForInStatement { body, .. })
        | Statement::ForOf(ForOfStatement { body, .. }) => collect_slots_in(body, out),
        Statement::Try(t) => {
            for s in &t.block {
                collect_slots_in(s, out);
            }
            if let Some(h) = &t.handler {
                for s in &h.body {
                    collect_slots_in(s, out);
                }
            }
            if let Some(f) = &t.finalizer {
                for s in f {
                    collect_slots_in(s, out);
                }
            }
        }
        Statement::Switch(s) => {
            for case in &s.cases {
                for c in &case.consequent {
                    collect_slots_in(c, out);
                }
            }
        }
        Statement::Labeled(_, inner) => collect_slots_in(inner, out),
        _ => {}
    }
}
