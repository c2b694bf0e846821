use super::generator_analysis::{collect_function_declarations, collect_var_names};
use super::*;

/// What a loop does with the completion of one body run.
enum LoopControl {
    Next,
    Break,
    Exit(Completion),
}

fn loop_control(completion: Completion, labels: &[String]) -> LoopControl {
    match completion {
        Completion::Normal(_) | Completion::Continue(None) => LoopControl::Next,
        Completion::Continue(Some(l)) if labels.contains(&l) => LoopControl::Next,
        Completion::Break(None) => LoopControl::Break,
        Completion::Break(Some(l)) if labels.contains(&l) => LoopControl::Break,
        other => LoopControl::Exit(other),
    }
}

impl Interpreter {
    pub(crate) fn exec_statements(&mut self, stmts: &[Statement], env: &EnvRef) -> Completion {
        let mut result = JsValue::Undefined;
        for stmt in stmts {
            match self.exec_statement(stmt, env) {
                Completion::Normal(val) => result = val,
                other => return other,
            }
        }
        Completion::Normal(result)
    }

    /// Declares every `var` name of a body in `env`.
    pub(crate) fn hoist_var_declarations(&mut self, stmts: &[Statement], env: &EnvRef) {
        let mut e = env.borrow_mut();
        for name in collect_var_names(stmts) {
            e.declare(&name, BindingKind::Var);
        }
    }

    pub(crate) fn instantiate_function_declarations(
        &mut self,
        functions: &[FunctionDecl],
        env: &EnvRef,
    ) -> Completion {
        for f in functions {
            let kind = FunctionKind::from_flags(f.is_async, f.is_generator);
            let func = match self.create_closure(
                Some(f.name.clone()),
                &f.params,
                &f.body,
                env,
                false,
                kind,
            ) {
                Completion::Normal(v) => v,
                other => return other,
            };
            let mut e = env.borrow_mut();
            e.declare(&f.name, BindingKind::Var);
            let _ = e.set(&f.name, func);
        }
        Completion::Normal(JsValue::Undefined)
    }

    /// A block body in a fresh lexical environment.
    fn exec_block(&mut self, stmts: &[Statement], env: &EnvRef) -> Completion {
        let block_env = Environment::new(Some(env.clone()));
        let functions = collect_function_declarations(stmts);
        if !functions.is_empty() {
            let hoisted = self.instantiate_function_declarations(&functions, &block_env);
            if hoisted.is_abrupt() {
                return hoisted;
            }
        }
        self.exec_statements(stmts, &block_env)
    }

    pub(crate) fn exec_statement(&mut self, stmt: &Statement, env: &EnvRef) -> Completion {
        match stmt {
            Statement::Empty => Completion::Normal(JsValue::Undefined),
            Statement::Expression(expr) => self.eval_expr(expr, env),
            Statement::Block(stmts) => self.exec_block(stmts, env),
            Statement::Variable(decl) => self.exec_variable_declaration(decl, env),
            Statement::If(if_stmt) => {
                let test = match self.eval_expr(&if_stmt.test, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                if to_boolean(&test) {
                    self.exec_statement(&if_stmt.consequent, env)
                } else if let Some(alt) = &if_stmt.alternate {
                    self.exec_statement(alt, env)
                } else {
                    Completion::Normal(JsValue::Undefined)
                }
            }
            Statement::While(_)
            | Statement::DoWhile(_)
            | Statement::For(_)
            | Statement::ForIn(_)
            | Statement::ForOf(_) => self.exec_loop(stmt, &[], env),
            Statement::Return(expr) => {
                let val = if let Some(e) = expr {
                    match self.eval_expr(e, env) {
                        Completion::Normal(v) => v,
                        other => return other,
                    }
                } else {
                    JsValue::Undefined
                };
                Completion::Return(val)
            }
            Statement::Break(label) => Completion::Break(label.clone()),
            Statement::Continue(label) => Completion::Continue(label.clone()),
            Statement::Throw(expr) => {
                let val = match self.eval_expr(expr, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                Completion::Throw(val)
            }
            Statement::Try(t) => self.exec_try(t, env),
            Statement::Switch(s) => self.exec_switch(s, &[], env),
            Statement::Labeled(..) => {
                let mut labels = Vec::new();
                let mut body = stmt;
                while let Statement::Labeled(label, inner) = body {
                    labels.push(label.clone());
                    body = inner;
                }
                let comp = match body {
                    Statement::While(_)
                    | Statement::DoWhile(_)
                    | Statement::For(_)
                    | Statement::ForIn(_)
                    | Statement::ForOf(_) => self.exec_loop(body, &labels, env),
                    Statement::Switch(s) => self.exec_switch(s, &labels, env),
                    other => self.exec_statement(other, env),
                };
                match comp {
                    Completion::Break(Some(l)) if labels.contains(&l) => {
                        Completion::Normal(JsValue::Undefined)
                    }
                    other => other,
                }
            }
            // Hoisted when the enclosing scope was entered.
            Statement::FunctionDeclaration(_) => Completion::Normal(JsValue::Undefined),
        }
    }

    fn exec_loop(&mut self, stmt: &Statement, labels: &[String], env: &EnvRef) -> Completion {
        match stmt {
            Statement::While(w) => self.exec_while(w, labels, env),
            Statement::DoWhile(dw) => self.exec_do_while(dw, labels, env),
            Statement::For(f) => self.exec_for(f, labels, env),
            Statement::ForIn(fi) => {
                self.exec_for_each(&fi.left, &fi.right, &fi.body, true, labels, env)
            }
            Statement::ForOf(fo) if fo.is_await => {
                let err = self.create_syntax_error(
                    "for await is only valid in async functions and async generators",
                );
                Completion::Throw(err)
            }
            Statement::ForOf(fo) => {
                self.exec_for_each(&fo.left, &fo.right, &fo.body, false, labels, env)
            }
            other => self.exec_statement(other, env),
        }
    }

    fn exec_variable_declaration(
        &mut self,
        decl: &VariableDeclaration,
        env: &EnvRef,
    ) -> Completion {
        let kind = BindingKind::from(decl.kind);
        for d in &decl.declarations {
            let val = match (&d.init, &d.pattern) {
                (Some(init), Pattern::Identifier(name)) => {
                    match self.eval_named(init, name, env) {
                        Completion::Normal(v) => v,
                        other => return other,
                    }
                }
                (Some(init), _) => match self.eval_expr(init, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                },
                // `var x;` leaves the hoisted binding alone.
                (None, _) if kind == BindingKind::Var => continue,
                (None, _) => JsValue::Undefined,
            };
            let bound = self.bind_pattern(&d.pattern, val, env, Some(kind));
            if bound.is_abrupt() {
                return bound;
            }
        }
        Completion::Normal(JsValue::Undefined)
    }

    /// Binds `val` to `pat`. With `kind` set the names are declared in `env`
    /// (`var` names are hoisted already, so those assign); with `None` the
    /// pattern is an assignment target resolved through the scope chain.
    pub(crate) fn bind_pattern(
        &mut self,
        pat: &Pattern,
        val: JsValue,
        env: &EnvRef,
        kind: Option<BindingKind>,
    ) -> Completion {
        match pat {
            Pattern::Identifier(name) => self.bind_name(name, val, env, kind),
            Pattern::Assign(inner, default) => {
                let v = if val.is_undefined() {
                    let named = match &**inner {
                        Pattern::Identifier(name) => self.eval_named(default, name, env),
                        _ => self.eval_expr(default, env),
                    };
                    match named {
                        Completion::Normal(v) => v,
                        other => return other,
                    }
                } else {
                    val
                };
                self.bind_pattern(inner, v, env, kind)
            }
            Pattern::Array(elements) => {
                let record = match self.get_iterator(&val) {
                    Ok(r) => r,
                    Err(abrupt) => return abrupt,
                };
                let mut done = false;
                for elem in elements {
                    let bound = match elem {
                        None => {
                            if !done && let Err(abrupt) = self.step_or_done(&record, &mut done) {
                                return abrupt;
                            }
                            continue;
                        }
                        Some(ArrayPatternElement::Pattern(p)) => {
                            let item = match self.step_or_done(&record, &mut done) {
                                Ok(v) => v,
                                Err(abrupt) => return abrupt,
                            };
                            self.bind_pattern(p, item, env, kind)
                        }
                        Some(ArrayPatternElement::Rest(p)) => {
                            let mut rest = Vec::new();
                            while !done {
                                match self.step_or_done(&record, &mut done) {
                                    Ok(v) if !done => rest.push(v),
                                    Ok(_) => {}
                                    Err(abrupt) => return abrupt,
                                }
                            }
                            let arr = self.create_array(rest);
                            self.bind_pattern(p, arr, env, kind)
                        }
                    };
                    if bound.is_abrupt() {
                        if !done {
                            let suppress = matches!(bound, Completion::Throw(_));
                            if let Completion::Fatal(err) =
                                self.iterator_close(&record.iterator, suppress)
                            {
                                return Completion::Fatal(err);
                            }
                        }
                        return bound;
                    }
                }
                if !done {
                    return self.iterator_close(&record.iterator, false);
                }
                Completion::Normal(JsValue::Undefined)
            }
            Pattern::Object(props) => {
                if val.is_nullish() {
                    let err = self.create_type_error(&format!("Cannot destructure '{val}'"));
                    return Completion::Throw(err);
                }
                for prop in props {
                    let bound = match prop {
                        ObjectPatternProperty::Shorthand(name) => {
                            let v = self.get_property(&val, name);
                            self.bind_name(name, v, env, kind)
                        }
                        ObjectPatternProperty::KeyValue(key, pat) => {
                            let key = match self.eval_property_key(key, env) {
                                Ok(k) => k,
                                Err(abrupt) => return abrupt,
                            };
                            let v = self.get_property(&val, &key);
                            self.bind_pattern(pat, v, env, kind)
                        }
                    };
                    if bound.is_abrupt() {
                        return bound;
                    }
                }
                Completion::Normal(JsValue::Undefined)
            }
            Pattern::Rest(inner) => self.bind_pattern(inner, val, env, kind),
        }
    }

    fn bind_name(
        &mut self,
        name: &str,
        val: JsValue,
        env: &EnvRef,
        kind: Option<BindingKind>,
    ) -> Completion {
        let result = match kind {
            Some(k @ (BindingKind::Let | BindingKind::Const)) => {
                let mut e = env.borrow_mut();
                e.declare(name, k);
                e.set(name, val)
            }
            Some(BindingKind::Var) | None => env.borrow_mut().set(name, val),
        };
        match result {
            Ok(()) => Completion::Normal(JsValue::Undefined),
            Err(msg) => {
                let err = self.create_type_error(&to_js_string(&msg));
                Completion::Throw(err)
            }
        }
    }

    /// One destructuring step; sets `done` and yields `undefined` once the
    /// iterator is exhausted.
    fn step_or_done(
        &mut self,
        record: &builtins::iterators::IteratorRecord,
        done: &mut bool,
    ) -> Result<JsValue, Completion> {
        if *done {
            return Ok(JsValue::Undefined);
        }
        match self.iterator_step_value(record) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => {
                *done = true;
                Ok(JsValue::Undefined)
            }
            Err(abrupt) => {
                *done = true;
                Err(abrupt)
            }
        }
    }

    fn exec_while(&mut self, w: &WhileStatement, labels: &[String], env: &EnvRef) -> Completion {
        loop {
            let test = match self.eval_expr(&w.test, env) {
                Completion::Normal(v) => v,
                other => return other,
            };
            if !to_boolean(&test) {
                break;
            }
            match loop_control(self.exec_statement(&w.body, env), labels) {
                LoopControl::Next => {}
                LoopControl::Break => break,
                LoopControl::Exit(c) => return c,
            }
        }
        Completion::Normal(JsValue::Undefined)
    }

    fn exec_do_while(
        &mut self,
        dw: &DoWhileStatement,
        labels: &[String],
        env: &EnvRef,
    ) -> Completion {
        loop {
            match loop_control(self.exec_statement(&dw.body, env), labels) {
                LoopControl::Next => {}
                LoopControl::Break => break,
                LoopControl::Exit(c) => return c,
            }
            let test = match self.eval_expr(&dw.test, env) {
                Completion::Normal(v) => v,
                other => return other,
            };
            if !to_boolean(&test) {
                break;
            }
        }
        Completion::Normal(JsValue::Undefined)
    }

    fn exec_for(&mut self, f: &ForStatement, labels: &[String], env: &EnvRef) -> Completion {
        let mut for_env = Environment::new(Some(env.clone()));
        let mut per_iteration = false;
        if let Some(init) = &f.init {
            let comp = match init {
                ForInit::Variable(decl) => {
                    per_iteration = decl.kind != VarKind::Var;
                    self.exec_variable_declaration(decl, &for_env)
                }
                ForInit::Expression(expr) => self.eval_expr(expr, &for_env),
            };
            if comp.is_abrupt() {
                return comp;
            }
        }
        loop {
            if let Some(test) = &f.test {
                let val = match self.eval_expr(test, &for_env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                if !to_boolean(&val) {
                    break;
                }
            }
            match loop_control(self.exec_statement(&f.body, &for_env), labels) {
                LoopControl::Next => {}
                LoopControl::Break => break,
                LoopControl::Exit(c) => return c,
            }
            // Closures from this iteration keep the old environment.
            if per_iteration {
                for_env = Environment::copy_of(&for_env);
            }
            if let Some(update) = &f.update {
                let comp = self.eval_expr(update, &for_env);
                if comp.is_abrupt() {
                    return comp;
                }
            }
        }
        Completion::Normal(JsValue::Undefined)
    }

    /// `for-in` (over a key snapshot) and synchronous `for-of`.
    fn exec_for_each(
        &mut self,
        left: &ForInOfLeft,
        right: &Expression,
        body: &Statement,
        enumerate_keys: bool,
        labels: &[String],
        env: &EnvRef,
    ) -> Completion {
        let iterable = match self.eval_expr(right, env) {
            Completion::Normal(v) => v,
            other => return other,
        };
        let record = if enumerate_keys {
            self.create_key_iterator(&iterable)
        } else {
            match self.get_iterator(&iterable) {
                Ok(r) => r,
                Err(abrupt) => return abrupt,
            }
        };
        loop {
            let item = match self.iterator_step_value(&record) {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(abrupt) => return abrupt,
            };
            let iter_env = Environment::new(Some(env.clone()));
            let bound = match left {
                ForInOfLeft::Variable(kind, pat) => {
                    self.bind_pattern(pat, item, &iter_env, Some(BindingKind::from(*kind)))
                }
                ForInOfLeft::Pattern(pat) => self.bind_pattern(pat, item, env, None),
            };
            let comp = if bound.is_abrupt() {
                bound
            } else {
                self.exec_statement(body, &iter_env)
            };
            match loop_control(comp, labels) {
                LoopControl::Next => {}
                LoopControl::Break => return self.iterator_close(&record.iterator, false),
                LoopControl::Exit(Completion::Fatal(err)) => return Completion::Fatal(err),
                LoopControl::Exit(c) => {
                    let suppress = matches!(c, Completion::Throw(_));
                    let closed = self.iterator_close(&record.iterator, suppress);
                    if closed.is_abrupt() {
                        return closed;
                    }
                    return c;
                }
            }
        }
        Completion::Normal(JsValue::Undefined)
    }

    fn exec_try(&mut self, t: &TryStatement, env: &EnvRef) -> Completion {
        let result = match self.exec_block(&t.block, env) {
            Completion::Throw(val) => match &t.handler {
                Some(handler) => {
                    let catch_env = Environment::new(Some(env.clone()));
                    let bound = match &handler.param {
                        Some(param) => {
                            self.bind_pattern(param, val, &catch_env, Some(BindingKind::Let))
                        }
                        None => Completion::Normal(JsValue::Undefined),
                    };
                    if bound.is_abrupt() {
                        bound
                    } else {
                        self.exec_block(&handler.body, &catch_env)
                    }
                }
                None => Completion::Throw(val),
            },
            other => other,
        };
        // Fatal errors skip finally blocks too.
        if let Completion::Fatal(_) = result {
            return result;
        }
        if let Some(finalizer) = &t.finalizer {
            let fin_result = self.exec_block(finalizer, env);
            if fin_result.is_abrupt() {
                return fin_result;
            }
        }
        result
    }

    fn exec_switch(&mut self, s: &SwitchStatement, labels: &[String], env: &EnvRef) -> Completion {
        let disc = match self.eval_expr(&s.discriminant, env) {
            Completion::Normal(v) => v,
            other => return other,
        };
        let switch_env = Environment::new(Some(env.clone()));
        let mut matched = None;
        for (i, case) in s.cases.iter().enumerate() {
            let Some(test) = &case.test else {
                continue;
            };
            let test = match self.eval_expr(test, &switch_env) {
                Completion::Normal(v) => v,
                other => return other,
            };
            if strict_equality(&disc, &test) {
                matched = Some(i);
                break;
            }
        }
        let start = matched.or_else(|| s.cases.iter().position(|c| c.test.is_none()));
        let Some(start) = start else {
            return Completion::Normal(JsValue::Undefined);
        };
        for case in &s.cases[start..] {
            for stmt in &case.consequent {
                match self.exec_statement(stmt, &switch_env) {
                    Completion::Normal(_) => {}
                    Completion::Break(None) => return Completion::Normal(JsValue::Undefined),
                    Completion::Break(Some(l)) if labels.contains(&l) => {
                        return Completion::Normal(JsValue::Undefined);
                    }
                    other => return other,
                }
            }
        }
        Completion::Normal(JsValue::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expression as E, Statement as S};
    use pretty_assertions::assert_eq;

    fn run(program: Vec<S>) -> Interpreter {
        let mut interp = Interpreter::new();
        match interp.run(&program) {
            Completion::Normal(_) => {}
            other => panic!("program failed: {other:?}"),
        }
        interp
    }

    #[test]
    fn labeled_continue_in_nested_loops() {
        let interp = run(vec![
            S::let_("n", E::num(0.0)),
            S::labeled(
                "outer",
                S::for_of(
                    VarKind::Const,
                    "i",
                    E::array(vec![E::num(1.0), E::num(2.0), E::num(3.0)]),
                    vec![S::for_of(
                        VarKind::Const,
                        "j",
                        E::array(vec![E::num(1.0), E::num(2.0)]),
                        vec![
                            S::expr(E::assign(
                                E::ident("n"),
                                E::binary(BinaryOp::Add, E::ident("n"), E::num(1.0)),
                            )),
                            S::continue_(Some("outer")),
                        ],
                    )],
                ),
            ),
        ]);
        assert_eq!(interp.get_global("n"), Some(JsValue::Number(3.0)));
    }

    #[test]
    fn break_out_of_for_of_closes_the_iterator() {
        let interp = run(vec![
            S::const_(
                "g",
                E::function(crate::ast::FunctionExpr::generator(
                    &[],
                    vec![S::try_(
                        vec![
                            S::expr(E::yield_(E::num(1.0))),
                            S::expr(E::yield_(E::num(2.0))),
                        ],
                        None,
                        Some(vec![S::expr(E::assign(E::ident("closed"), E::boolean(true)))]),
                    )],
                )),
            ),
            S::for_of(
                VarKind::Const,
                "x",
                E::call(E::ident("g"), vec![]),
                vec![S::break_(None)],
            ),
        ]);
        assert_eq!(interp.get_global("closed"), Some(JsValue::Boolean(true)));
    }

    #[test]
    fn finally_runs_after_catch() {
        let interp = run(vec![
            S::let_("log", E::array(vec![])),
            S::try_(
                vec![S::throw(E::string("x"))],
                Some((
                    Some("e"),
                    vec![S::expr(E::method_call(E::ident("log"), "push", vec![E::ident("e")]))],
                )),
                Some(vec![S::expr(E::method_call(
                    E::ident("log"),
                    "push",
                    vec![E::string("finally")],
                ))]),
            ),
            S::const_("joined", E::method_call(E::ident("log"), "join", vec![])),
        ]);
        assert_eq!(interp.get_global("joined"), Some(JsValue::from_str("x,finally")));
    }

    #[test]
    fn array_destructuring_with_rest_and_defaults() {
        let interp = run(vec![S::Variable(VariableDeclaration {
            kind: VarKind::Const,
            declarations: vec![VariableDeclarator {
                pattern: Pattern::Array(vec![
                    Some(ArrayPatternElement::Pattern(Pattern::ident("a"))),
                    None,
                    Some(ArrayPatternElement::Rest(Pattern::ident("rest"))),
                ]),
                init: Some(E::array(vec![E::num(1.0), E::num(2.0), E::num(3.0), E::num(4.0)])),
            }],
        })]);
        assert_eq!(interp.get_global("a"), Some(JsValue::Number(1.0)));
        let rest = interp.get_global("rest").unwrap();
        assert_eq!(interp.format_value(&rest), "[3, 4]");
    }

    #[test]
    fn for_let_gives_each_iteration_its_own_binding() {
        let interp = run(vec![
            S::let_("fns", E::array(vec![])),
            S::For(ForStatement {
                init: Some(ForInit::Variable(VariableDeclaration {
                    kind: VarKind::Let,
                    declarations: vec![VariableDeclarator {
                        pattern: Pattern::ident("i"),
                        init: Some(E::num(0.0)),
                    }],
                })),
                test: Some(E::binary(BinaryOp::Lt, E::ident("i"), E::num(2.0))),
                update: Some(E::postfix_increment(E::ident("i"))),
                body: Box::new(S::expr(E::method_call(
                    E::ident("fns"),
                    "push",
                    vec![E::arrow(&[], E::ident("i"))],
                ))),
            }),
            S::const_("first", E::call(E::index(E::ident("fns"), E::num(0.0)), vec![])),
        ]);
        assert_eq!(interp.get_global("first"), Some(JsValue::Number(0.0)));
    }

    #[test]
    fn switch_falls_through_until_break() {
        let interp = run(vec![
            S::let_("out", E::string("")),
            S::Switch(SwitchStatement {
                discriminant: E::num(2.0),
                cases: vec![
                    SwitchCase {
                        test: Some(E::num(1.0)),
                        consequent: vec![S::expr(E::assign(E::ident("out"), E::string("one")))],
                    },
                    SwitchCase {
                        test: Some(E::num(2.0)),
                        consequent: vec![S::expr(E::assign(E::ident("out"), E::string("two")))],
                    },
                    SwitchCase {
                        test: None,
                        consequent: vec![
                            S::expr(E::assign(
                                E::ident("out"),
                                E::binary(BinaryOp::Add, E::ident("out"), E::string("+default")),
                            )),
                            S::break_(None),
                        ],
                    },
                ],
            }),
        ]);
        assert_eq!(interp.get_global("out"), Some(JsValue::from_str("two+default")));
    }
}
