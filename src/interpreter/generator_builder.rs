use super::generator_analysis::{
    collect_function_declarations, contains_suspend, expr_contains_suspend,
    pattern_contains_suspend,
};
use super::generator_lowering::lower_body;
use super::generator_plan::{ForBinding, GeneratorPlan, Instruction, LoopKind};
use crate::ast::*;
use crate::error::UnsupportedShape;

type Result<T> = std::result::Result<T, UnsupportedShape>;

const PLACEHOLDER: usize = usize::MAX;

/// Lowers `body` and compiles it back to front into a validated plan.
pub fn build_plan(
    body: &[Statement],
    params: &[Pattern],
    is_async: bool,
) -> Result<GeneratorPlan> {
    if params.iter().any(|p| pattern_contains_suspend(p, is_async)) {
        return Err(UnsupportedShape::new("suspend point in parameter list"));
    }
    let lowered = lower_body(body, is_async)?;
    let mut builder = PlanBuilder::new(is_async);
    let exit = builder.emit(Instruction::Return { argument: None });
    let entry = builder.build_statements(&lowered.body, exit)?;
    let mut slots = lowered.slots;
    slots.extend(builder.temps);
    let plan = GeneratorPlan {
        instructions: builder.instructions,
        entry,
        slots,
    };
    plan.validate()?;
    Ok(plan)
}

struct Breakable {
    labels: Vec<String>,
    kind: LoopKind,
}

pub(crate) struct PlanBuilder {
    instructions: Vec<Instruction>,
    is_async: bool,
    breakables: Vec<Breakable>,
    temps: Vec<String>,
}

impl PlanBuilder {
    pub(crate) fn new(is_async: bool) -> Self {
        PlanBuilder {
            instructions: Vec::new(),
            is_async,
            breakables: Vec::new(),
            temps: Vec::new(),
        }
    }

    pub(crate) fn emit(&mut self, instr: Instruction) -> usize {
        self.instructions.push(instr);
        self.instructions.len() - 1
    }

    fn placeholder(&mut self) -> usize {
        self.emit(Instruction::Jump {
            target: PLACEHOLDER,
        })
    }

    fn patch(&mut self, at: usize, instr: Instruction) {
        self.instructions[at] = instr;
    }

    fn fresh_temp(&mut self, prefix: &str) -> String {
        let name = format!("%{prefix}{}", self.temps.len());
        self.temps.push(name.clone());
        name
    }

    fn contains(&self, stmt: &Statement) -> bool {
        contains_suspend(stmt, self.is_async)
    }

    pub(crate) fn build_statements(&mut self, stmts: &[Statement], next: usize) -> Result<usize> {
        let mut next = next;
        for stmt in stmts.iter().rev() {
            next = self.build_statement(stmt, next)?;
        }
        Ok(next)
    }

    pub(crate) fn build_statement(&mut self, stmt: &Statement, next: usize) -> Result<usize> {
        let mark = self.instructions.len();
        let depth = self.breakables.len();
        let result = self.build_statement_inner(stmt, next);
        if result.is_err() {
            self.instructions.truncate(mark);
            self.breakables.truncate(depth);
        }
        result
    }

    fn build_statement_inner(&mut self, stmt: &Statement, next: usize) -> Result<usize> {
        match stmt {
            Statement::Break(label) => {
                self.check_jump(label.as_deref(), false)?;
                return Ok(self.emit(Instruction::Break {
                    label: label.clone(),
                }));
            }
            Statement::Continue(label) => {
                self.check_jump(label.as_deref(), true)?;
                return Ok(self.emit(Instruction::Continue {
                    label: label.clone(),
                }));
            }
            Statement::Return(argument) if !self.contains(stmt) => {
                return Ok(self.emit(Instruction::Return {
                    argument: argument.clone(),
                }));
            }
            Statement::Throw(argument) if !self.contains(stmt) => {
                return Ok(self.emit(Instruction::Throw {
                    argument: argument.clone(),
                }));
            }
            _ => {}
        }
        if !self.contains(stmt) {
            return Ok(self.emit(Instruction::Evaluate {
                statement: stmt.clone(),
                next,
            }));
        }
        match stmt {
            Statement::Expression(expr) => self.build_effect(expr, next),
            Statement::Block(stmts) => self.build_block(stmts, next),
            Statement::If(if_stmt) => {
                let on_false = match &if_stmt.alternate {
                    Some(alt) => self.build_statement(alt, next)?,
                    None => next,
                };
                let on_true = self.build_statement(&if_stmt.consequent, next)?;
                self.build_condition(&if_stmt.test, on_true, on_false)
            }
            Statement::While(w) => self.build_while(w, Vec::new(), next),
            Statement::DoWhile(d) => self.build_do_while(d, Vec::new(), next),
            Statement::For(f) => self.build_for(f, Vec::new(), next),
            Statement::ForIn(f) => {
                self.build_for_each(&f.left, &f.right, &f.body, false, true, Vec::new(), next)
            }
            Statement::ForOf(f) => self.build_for_each(
                &f.left,
                &f.right,
                &f.body,
                f.is_await,
                false,
                Vec::new(),
                next,
            ),
            Statement::Try(t) => self.build_try(t, next),
            Statement::Switch(s) => self.build_switch(s, Vec::new(), next),
            Statement::Labeled(..) => self.build_labeled(stmt, next),
            other => Err(UnsupportedShape::new(format!(
                "suspend point left in {} after lowering",
                describe(other)
            ))),
        }
    }

    fn check_jump(&self, label: Option<&str>, is_continue: bool) -> Result<()> {
        let found = self.breakables.iter().rev().find(|b| match label {
            Some(l) => b.labels.iter().any(|x| x == l),
            None if is_continue => b.kind == LoopKind::Loop,
            None => b.kind != LoopKind::Block,
        });
        match found {
            Some(b) if is_continue && b.kind != LoopKind::Loop => Err(UnsupportedShape::new(
                format!("continue target {} is not a loop", label.unwrap_or_default()),
            )),
            Some(_) => Ok(()),
            None => Err(UnsupportedShape::new(match label {
                Some(l) => format!("undefined label '{l}'"),
                None if is_continue => "continue outside of a loop".to_string(),
                None => "break outside of a loop or switch".to_string(),
            })),
        }
    }

    /// An expression statement holding suspend points, already in one of
    /// the lowered shapes.
    fn build_effect(&mut self, expr: &Expression, next: usize) -> Result<usize> {
        match expr {
            Expression::Sequence(items) => {
                let mut next = next;
                for item in items.iter().rev() {
                    next = self.build_statement(&Statement::Expression(item.clone()), next)?;
                }
                Ok(next)
            }
            Expression::Assign(AssignOp::Assign, target, value) => match &**target {
                Expression::Identifier(name) => {
                    self.build_suspend(value, Some(name.clone()), next)
                }
                _ => Err(UnsupportedShape::new("suspend point assigned to a non-binding")),
            },
            _ => self.build_suspend(expr, None, next),
        }
    }

    fn build_suspend(
        &mut self,
        expr: &Expression,
        slot: Option<String>,
        next: usize,
    ) -> Result<usize> {
        let operand_ok = |e: &Expression| !expr_contains_suspend(e, self.is_async);
        let instr = match expr {
            Expression::Yield(argument, false)
                if argument.as_deref().is_none_or(operand_ok) =>
            {
                Instruction::Yield {
                    argument: argument.as_deref().cloned(),
                    next: PLACEHOLDER,
                }
            }
            Expression::Yield(Some(argument), true) if operand_ok(&**argument) => {
                Instruction::YieldStar {
                    argument: (**argument).clone(),
                    next: PLACEHOLDER,
                }
            }
            Expression::Await(argument) if self.is_async && operand_ok(&**argument) => {
                Instruction::Await {
                    argument: (**argument).clone(),
                    next: PLACEHOLDER,
                }
            }
            _ => return Err(UnsupportedShape::new("suspend point in an unlowered expression")),
        };
        let store = self.emit(Instruction::StoreResumeValue { slot, next });
        let instr = match instr {
            Instruction::Yield { argument, .. } => Instruction::Yield {
                argument,
                next: store,
            },
            Instruction::YieldStar { argument, .. } => Instruction::YieldStar {
                argument,
                next: store,
            },
            Instruction::Await { argument, .. } => Instruction::Await {
                argument,
                next: store,
            },
            other => other,
        };
        Ok(self.emit(instr))
    }

    /// Compiles a controlling expression. A lowered sequence runs its leading
    /// items as statements before the branch on its last item.
    fn build_condition(&mut self, test: &Expression, on_true: usize, on_false: usize) -> Result<usize> {
        if let Expression::Sequence(items) = test
            && expr_contains_suspend(test, self.is_async)
            && let Some((last, init)) = items.split_last()
        {
            let branch = self.emit(Instruction::Branch {
                condition: last.clone(),
                on_true,
                on_false,
            });
            let init: Vec<Statement> = init.iter().cloned().map(Statement::Expression).collect();
            return self.build_statements(&init, branch);
        }
        if expr_contains_suspend(test, self.is_async) {
            return Err(UnsupportedShape::new("suspend point in an unlowered condition"));
        }
        Ok(self.emit(Instruction::Branch {
            condition: test.clone(),
            on_true,
            on_false,
        }))
    }

    fn build_block(&mut self, stmts: &[Statement], next: usize) -> Result<usize> {
        let pop = self.emit(Instruction::PopScope { next });
        let body = self.build_statements(stmts, pop)?;
        Ok(self.emit(Instruction::PushScope {
            functions: collect_function_declarations(stmts),
            next: body,
        }))
    }

    fn build_loop_body(
        &mut self,
        body: &Statement,
        labels: &[String],
        next: usize,
    ) -> Result<usize> {
        self.breakables.push(Breakable {
            labels: labels.to_vec(),
            kind: LoopKind::Loop,
        });
        let result = self.build_statement(body, next);
        self.breakables.pop();
        result
    }

    fn build_while(&mut self, w: &WhileStatement, labels: Vec<String>, next: usize) -> Result<usize> {
        let exit = self.emit(Instruction::ExitLoop { next });
        let test_slot = self.placeholder();
        let body = self.build_loop_body(&w.body, &labels, test_slot)?;
        let cond = self.build_condition(&w.test, body, exit)?;
        self.patch(test_slot, Instruction::Jump { target: cond });
        Ok(self.emit(Instruction::EnterLoop {
            labels,
            kind: LoopKind::Loop,
            continue_target: Some(test_slot),
            break_target: next,
            next: test_slot,
        }))
    }

    fn build_do_while(
        &mut self,
        d: &DoWhileStatement,
        labels: Vec<String>,
        next: usize,
    ) -> Result<usize> {
        let exit = self.emit(Instruction::ExitLoop { next });
        let test_slot = self.placeholder();
        let body = self.build_loop_body(&d.body, &labels, test_slot)?;
        let cond = self.build_condition(&d.test, body, exit)?;
        self.patch(test_slot, Instruction::Jump { target: cond });
        Ok(self.emit(Instruction::EnterLoop {
            labels,
            kind: LoopKind::Loop,
            continue_target: Some(test_slot),
            break_target: next,
            next: body,
        }))
    }

    fn build_for(&mut self, f: &ForStatement, labels: Vec<String>, next: usize) -> Result<usize> {
        let scoped = matches!(&f.init, Some(ForInit::Variable(d)) if d.kind != VarKind::Var);
        let after = if scoped {
            self.emit(Instruction::PopScope { next })
        } else {
            next
        };
        let exit = self.emit(Instruction::ExitLoop { next: after });
        let test_slot = self.placeholder();
        let update = match &f.update {
            Some(u) => self.build_statement(&Statement::Expression(u.clone()), test_slot)?,
            None => test_slot,
        };
        // Each iteration gets its own copy of the loop bindings.
        let continue_target = if scoped {
            self.emit(Instruction::CopyScope { next: update })
        } else {
            update
        };
        let body = self.build_loop_body(&f.body, &labels, continue_target)?;
        let cond = match &f.test {
            Some(t) => self.build_condition(t, body, exit)?,
            None => body,
        };
        self.patch(test_slot, Instruction::Jump { target: cond });
        let enter = self.emit(Instruction::EnterLoop {
            labels,
            kind: LoopKind::Loop,
            continue_target: Some(continue_target),
            break_target: after,
            next: test_slot,
        });
        let init = match &f.init {
            Some(ForInit::Variable(d)) => {
                self.build_statement(&Statement::Variable(d.clone()), enter)?
            }
            Some(ForInit::Expression(e)) => {
                self.build_statement(&Statement::Expression(e.clone()), enter)?
            }
            None => enter,
        };
        if scoped {
            Ok(self.emit(Instruction::PushScope {
                functions: Vec::new(),
                next: init,
            }))
        } else {
            Ok(init)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_for_each(
        &mut self,
        left: &ForInOfLeft,
        right: &Expression,
        body: &Statement,
        is_async: bool,
        enumerate_keys: bool,
        labels: Vec<String>,
        next: usize,
    ) -> Result<usize> {
        let binding = match left {
            ForInOfLeft::Variable(VarKind::Var, p) | ForInOfLeft::Pattern(p) => ForBinding {
                kind: None,
                pattern: p.clone(),
            },
            ForInOfLeft::Variable(kind, p) => ForBinding {
                kind: Some(*kind),
                pattern: p.clone(),
            },
        };
        let done = self.emit(Instruction::ExitTry {
            next,
            close_iterator: false,
        });
        let exit = self.emit(Instruction::ExitLoop { next: done });
        let move_next = self.placeholder();
        // The iteration scope is pushed by the move-next step itself.
        let pop = self.emit(Instruction::PopScope { next: move_next });
        let body_entry = self.build_loop_body(body, &labels, pop)?;
        self.patch(
            move_next,
            Instruction::ForOfMoveNext {
                binding,
                body: body_entry,
                exit,
                is_async,
            },
        );
        let close = self.emit(Instruction::ExitTry {
            next,
            close_iterator: true,
        });
        let enter = self.emit(Instruction::EnterLoop {
            labels,
            kind: LoopKind::Loop,
            continue_target: Some(move_next),
            break_target: close,
            next: move_next,
        });
        Ok(self.emit(Instruction::ForOfInit {
            iterable: right.clone(),
            is_async,
            enumerate_keys,
            next: enter,
        }))
    }

    fn build_try(&mut self, t: &TryStatement, next: usize) -> Result<usize> {
        let finally_target = match &t.finalizer {
            Some(f) => {
                let end = self.emit(Instruction::EndFinally { next });
                Some(self.build_block(f, end)?)
            }
            None => None,
        };
        let catch_target = match &t.handler {
            Some(h) => {
                let exit = self.emit(Instruction::ExitTry {
                    next,
                    close_iterator: false,
                });
                let pop = self.emit(Instruction::PopScope { next: exit });
                let body = self.build_block(&h.body, pop)?;
                Some(self.emit(Instruction::BindCatch {
                    param: h.param.clone(),
                    next: body,
                }))
            }
            None => None,
        };
        let exit = self.emit(Instruction::ExitTry {
            next,
            close_iterator: false,
        });
        let block = self.build_block(&t.block, exit)?;
        Ok(self.emit(Instruction::EnterTry {
            catch_target,
            finally_target,
            next: block,
        }))
    }

    fn build_switch(&mut self, s: &SwitchStatement, labels: Vec<String>, next: usize) -> Result<usize> {
        let after = self.emit(Instruction::PopScope { next });
        let exit = self.emit(Instruction::ExitLoop { next: after });
        self.breakables.push(Breakable {
            labels: labels.clone(),
            kind: LoopKind::Switch,
        });
        // Case bodies back to front so each falls through into the next.
        let mut entries = vec![exit; s.cases.len()];
        let mut fall = exit;
        for (i, case) in s.cases.iter().enumerate().rev() {
            match self.build_statements(&case.consequent, fall) {
                Ok(entry) => fall = entry,
                Err(e) => {
                    self.breakables.pop();
                    return Err(e);
                }
            }
            entries[i] = fall;
        }
        self.breakables.pop();

        let discriminant = self.fresh_temp("switch");
        let default_target = s
            .cases
            .iter()
            .position(|c| c.test.is_none())
            .map_or(exit, |i| entries[i]);
        let mut dispatch = self.emit(Instruction::Jump {
            target: default_target,
        });
        for (i, case) in s.cases.iter().enumerate().rev() {
            if let Some(test) = &case.test {
                dispatch = self.emit(Instruction::Branch {
                    condition: Expression::binary(
                        BinaryOp::StrictEq,
                        Expression::Identifier(discriminant.clone()),
                        test.clone(),
                    ),
                    on_true: entries[i],
                    on_false: dispatch,
                });
            }
        }
        let store = self.emit(Instruction::Evaluate {
            statement: Statement::Expression(Expression::assign(
                Expression::Identifier(discriminant),
                s.discriminant.clone(),
            )),
            next: dispatch,
        });
        let enter = self.emit(Instruction::EnterLoop {
            labels,
            kind: LoopKind::Switch,
            continue_target: None,
            break_target: after,
            next: store,
        });
        let functions = s
            .cases
            .iter()
            .flat_map(|c| collect_function_declarations(&c.consequent))
            .collect();
        Ok(self.emit(Instruction::PushScope {
            functions,
            next: enter,
        }))
    }

    fn build_labeled(&mut self, stmt: &Statement, next: usize) -> Result<usize> {
        let mut labels = Vec::new();
        let mut inner = stmt;
        while let Statement::Labeled(label, body) = inner {
            labels.push(label.clone());
            inner = body;
        }
        match inner {
            Statement::While(w) => self.build_while(w, labels, next),
            Statement::DoWhile(d) => self.build_do_while(d, labels, next),
            Statement::For(f) => self.build_for(f, labels, next),
            Statement::ForIn(f) => {
                self.build_for_each(&f.left, &f.right, &f.body, false, true, labels, next)
            }
            Statement::ForOf(f) => {
                self.build_for_each(&f.left, &f.right, &f.body, f.is_await, false, labels, next)
            }
            Statement::Switch(s) => self.build_switch(s, labels, next),
            other => {
                let exit = self.emit(Instruction::ExitLoop { next });
                self.breakables.push(Breakable {
                    labels: labels.clone(),
                    kind: LoopKind::Block,
                });
                let body = self.build_statement(other, exit);
                self.breakables.pop();
                Ok(self.emit(Instruction::EnterLoop {
                    labels,
                    kind: LoopKind::Block,
                    continue_target: None,
                    break_target: next,
                    next: body?,
                }))
            }
        }
    }
}

fn describe(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Variable(_) => "a declaration",
        Statement::Return(_) => "a return statement",
        Statement::Throw(_) => "a throw statement",
        _ => "a statement",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(body: Vec<Statement>) -> GeneratorPlan {
        match build_plan(&body, &[], false) {
            Ok(plan) => plan,
            Err(e) => panic!("plan failed: {e}"),
        }
    }

    #[test]
    fn straight_line_yields() {
        let plan = build(vec![
            Statement::expr(Expression::yield_(Expression::num(1.0))),
            Statement::expr(Expression::yield_(Expression::num(2.0))),
        ]);
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.suspend_points(), 2);
        assert_eq!(
            plan.get(plan.entry),
            Some(&Instruction::Yield {
                argument: Some(Expression::num(1.0)),
                next: plan.entry - 1,
            })
        );
    }

    #[test]
    fn resume_values_land_in_slots() {
        let plan = build(vec![
            Statement::let_("x", Expression::yield_(Expression::num(1.0))),
            Statement::return_(Some(Expression::ident("x"))),
        ]);
        assert_eq!(plan.slots, vec!["%resume0".to_string()]);
        assert!(plan.instructions.iter().any(|i| matches!(
            i,
            Instruction::StoreResumeValue { slot: Some(s), .. } if s == "%resume0"
        )));
    }

    #[test]
    fn loops_and_try_are_laid_out() {
        let plan = build(vec![Statement::while_(
            Expression::boolean(true),
            vec![Statement::try_(
                vec![Statement::expr(Expression::yield_(Expression::num(1.0)))],
                None,
                Some(vec![Statement::break_(None)]),
            )],
        )]);
        let text = plan.to_string();
        assert!(text.contains("enter-loop"), "{text}");
        assert!(text.contains("enter-try catch=- finally="), "{text}");
        assert!(text.contains("end-finally"), "{text}");
        assert!(text.contains("branch <cond>"), "{text}");
    }

    #[test]
    fn yielding_loop_tests_compile() {
        let test = || Expression::yield_(Expression::num(1.0));
        for body in [
            vec![Statement::while_(test(), vec![])],
            vec![Statement::do_while(vec![], test())],
        ] {
            let plan = build(body);
            assert_eq!(plan.suspend_points(), 1);
            assert_eq!(plan.slots, vec!["%resume0".to_string()]);
            assert!(plan.validate().is_ok());
        }
    }

    #[test]
    fn switch_dispatches_through_a_temp() {
        let plan = build(vec![Statement::Switch(SwitchStatement {
            discriminant: Expression::ident("k"),
            cases: vec![
                SwitchCase {
                    test: Some(Expression::num(1.0)),
                    consequent: vec![
                        Statement::expr(Expression::yield_(Expression::string("one"))),
                        Statement::break_(None),
                    ],
                },
                SwitchCase {
                    test: None,
                    consequent: vec![Statement::expr(Expression::yield_(Expression::string(
                        "other",
                    )))],
                },
            ],
        })]);
        assert_eq!(plan.slots, vec!["%switch0".to_string()]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn failed_statement_rolls_back() {
        let mut builder = PlanBuilder::new(false);
        builder.emit(Instruction::Return { argument: None });
        let stmt = Statement::while_(
            Expression::boolean(true),
            vec![
                Statement::expr(Expression::yield_(Expression::num(1.0))),
                Statement::break_(Some("nowhere")),
            ],
        );
        let err = builder.build_statement(&stmt, 0).unwrap_err();
        assert_eq!(err.reason, "undefined label 'nowhere'");
        assert_eq!(builder.instructions.len(), 1);
        assert!(builder.breakables.is_empty());
    }

    #[test]
    fn suspend_in_parameter_default_is_rejected() {
        let params = vec![Pattern::Assign(
            Box::new(Pattern::ident("a")),
            Box::new(Expression::yield_empty()),
        )];
        let err = build_plan(&[], &params, false).unwrap_err();
        assert_eq!(err.reason, "suspend point in parameter list");
    }

    #[test]
    fn labeled_continue_resolves_to_outer_loop() {
        let plan = build(vec![Statement::labeled(
            "outer",
            Statement::for_of(
                VarKind::Const,
                "i",
                Expression::ident("xs"),
                vec![Statement::for_of(
                    VarKind::Const,
                    "j",
                    Expression::ident("ys"),
                    vec![
                        Statement::expr(Expression::yield_(Expression::ident("j"))),
                        Statement::continue_(Some("outer")),
                    ],
                )],
            ),
        )]);
        assert!(plan.instructions.iter().any(|i| matches!(
            i,
            Instruction::Continue { label: Some(l) } if l == "outer"
        )));
    }
}
