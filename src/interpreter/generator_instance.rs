use super::builtins::iterators::IteratorRecord;
use super::generator_delegate::DelegatedYieldState;
use super::generator_plan::{GeneratorPlan, Instruction, LoopKind};
use super::*;
use crate::error::{GeneratorError, RuntimeError};
use tracing::{debug, trace};

pub type GeneratorRef = Rc<RefCell<GeneratorInstance>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    SuspendedStart,
    SuspendedYield,
    Executing,
    Completed,
}

/// What a caller delivers when resuming an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeAction {
    Next(JsValue),
    Throw(JsValue),
    Return(JsValue),
    /// Settlement of the promise the instance is awaiting.
    Settled(Result<JsValue, JsValue>),
    /// The native generator this instance delegates to has returned.
    DelegateComplete(JsValue),
    /// The native generator this instance delegates to has thrown.
    DelegateThrew(JsValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorOutcome {
    Yielded(JsValue),
    /// Suspended on a promise-like value; resumes once it settles.
    Awaiting(JsValue),
    Returned(JsValue),
    Threw(JsValue),
    Fatal(RuntimeError),
}

/// One `{ value, done }` step as seen by an embedder.
#[derive(Debug, Clone, PartialEq)]
pub struct IteratorStep {
    pub value: JsValue,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwaitKind {
    /// A plain `await`; the settled value is the resume value.
    Value,
    /// A promise-valued result from the delegated iterator.
    Delegate,
    /// The result of an async iterator's `next()` in `for await`.
    MoveNext,
    /// A promise-valued element produced by a sync iterator in `for await`.
    ForValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TryPhase {
    Try,
    Catch,
    Finally,
}

#[derive(Debug)]
pub(crate) enum FrameKind {
    Try {
        catch_target: Option<usize>,
        finally_target: Option<usize>,
        phase: TryPhase,
    },
    /// Protects a for-of loop; unwinding through it closes the iterator.
    Iterator { record: IteratorRecord },
}

#[derive(Debug)]
pub(crate) struct TryFrame {
    pub(crate) kind: FrameKind,
    pub(crate) scope_depth: usize,
    pub(crate) loop_depth: usize,
    /// The completion a finally block resumes once it ends normally.
    pub(crate) pending: Option<Abrupt>,
}

#[derive(Debug, Clone)]
pub(crate) enum Abrupt {
    Return(JsValue),
    Throw(JsValue),
    Jump {
        target: usize,
        loop_len: usize,
        scope_depth: usize,
        try_depth: usize,
    },
}

#[derive(Debug)]
pub(crate) struct LoopScope {
    labels: Vec<String>,
    kind: LoopKind,
    continue_target: Option<usize>,
    break_target: usize,
    scope_depth: usize,
    try_depth: usize,
}

/// A synchronous instance suspended on a promise. The settlement lands in
/// the shared cell; the next external call picks it up.
pub(crate) struct Parked {
    pub(crate) promise: JsValue,
    pub(crate) settlement: Rc<RefCell<Option<Result<JsValue, JsValue>>>>,
}

pub struct GeneratorInstance {
    pub(crate) plan: Rc<GeneratorPlan>,
    pub(crate) name: String,
    pub(crate) ip: usize,
    pub(crate) state: GeneratorState,
    pub(crate) scopes: Vec<EnvRef>,
    pub(crate) try_frames: Vec<TryFrame>,
    pub(crate) loop_scopes: Vec<LoopScope>,
    pub(crate) delegate: Option<DelegatedYieldState>,
    pub(crate) awaiting: Option<AwaitKind>,
    pub(crate) caught: Option<JsValue>,
    pub(crate) is_async: bool,
    pub(crate) parked: Option<Parked>,
}

impl std::fmt::Debug for GeneratorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorInstance")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("ip", &self.ip)
            .field("try_frames", &self.try_frames.len())
            .field("delegating", &self.delegate.is_some())
            .finish()
    }
}

impl GeneratorInstance {
    /// `env` is the function environment with parameters already bound.
    pub(crate) fn new(plan: Rc<GeneratorPlan>, env: EnvRef, is_async: bool, name: String) -> Self {
        {
            let mut e = env.borrow_mut();
            for slot in &plan.slots {
                e.declare(slot, BindingKind::Var);
            }
        }
        GeneratorInstance {
            ip: plan.entry,
            plan,
            name,
            state: GeneratorState::SuspendedStart,
            scopes: vec![env],
            try_frames: Vec::new(),
            loop_scopes: Vec::new(),
            delegate: None,
            awaiting: None,
            caught: None,
            is_async,
            parked: None,
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub(crate) fn scope(&self) -> EnvRef {
        // The function scope is never popped.
        self.scopes[self.scopes.len() - 1].clone()
    }

    fn restore_depth(&mut self, scope_depth: usize, loop_depth: usize) {
        self.scopes.truncate(scope_depth.max(1));
        self.loop_scopes.truncate(loop_depth);
    }
}

pub(crate) enum Step {
    Outcome(GeneratorOutcome),
    /// Resume this native generator with the action on behalf of the
    /// current instance, which stays `Executing` meanwhile.
    Delegate(GeneratorRef, ResumeAction),
}

pub(crate) enum Flow {
    Continue,
    Done(Step),
}

impl Flow {
    pub(crate) fn outcome(outcome: GeneratorOutcome) -> Flow {
        Flow::Done(Step::Outcome(outcome))
    }
}

impl Interpreter {
    /// Runs one slice of `generator`: applies `action`, then executes until the
    /// next suspend point or completion.
    pub(crate) fn run_instance(&mut self, generator: &GeneratorRef, action: ResumeAction) -> Step {
        let mut action = action;
        let parked = generator.borrow_mut().parked.take();
        if let Some(parked) = parked {
            let settled = parked.settlement.borrow_mut().take();
            match (settled, &action) {
                (Some(result), ResumeAction::Next(_)) => action = ResumeAction::Settled(result),
                (None, ResumeAction::Next(_)) => {
                    // Still pending: same step again, nothing runs.
                    let promise = parked.promise.clone();
                    generator.borrow_mut().parked = Some(parked);
                    return Step::Outcome(GeneratorOutcome::Awaiting(promise));
                }
                _ => generator.borrow_mut().awaiting = None,
            }
        }

        let state = generator.borrow().state;
        trace!(generator = %generator.borrow().name, ?state, ?action, "resume");
        let flow = match state {
            GeneratorState::Completed => {
                return Step::Outcome(match action {
                    ResumeAction::Throw(e) | ResumeAction::DelegateThrew(e) => {
                        GeneratorOutcome::Threw(e)
                    }
                    ResumeAction::Return(v) => GeneratorOutcome::Returned(v),
                    _ => GeneratorOutcome::Returned(JsValue::Undefined),
                });
            }
            GeneratorState::Executing => match action {
                action @ (ResumeAction::DelegateComplete(_) | ResumeAction::DelegateThrew(_)) => {
                    self.delegate_step(generator, action)
                }
                _ => {
                    return Step::Outcome(GeneratorOutcome::Fatal(RuntimeError::GeneratorRunning));
                }
            },
            GeneratorState::SuspendedStart => {
                generator.borrow_mut().state = GeneratorState::Executing;
                match action {
                    ResumeAction::Throw(e) => Flow::outcome(GeneratorOutcome::Threw(e)),
                    ResumeAction::Return(v) => Flow::outcome(GeneratorOutcome::Returned(v)),
                    _ => Flow::Continue,
                }
            }
            GeneratorState::SuspendedYield => {
                generator.borrow_mut().state = GeneratorState::Executing;
                self.apply_resume(generator, action)
            }
        };
        let step = match flow {
            Flow::Done(step) => step,
            Flow::Continue => self.execute(generator),
        };
        self.settle_state(generator, &step);
        step
    }

    fn settle_state(&mut self, generator: &GeneratorRef, step: &Step) {
        let mut g = generator.borrow_mut();
        g.state = match step {
            Step::Delegate(..) => GeneratorState::Executing,
            Step::Outcome(GeneratorOutcome::Yielded(_) | GeneratorOutcome::Awaiting(_)) => {
                GeneratorState::SuspendedYield
            }
            Step::Outcome(_) => {
                g.delegate = None;
                g.awaiting = None;
                g.try_frames.clear();
                g.loop_scopes.clear();
                GeneratorState::Completed
            }
        };
        trace!(generator = %g.name, state = ?g.state, "suspend");
    }

    fn apply_resume(&mut self, generator: &GeneratorRef, action: ResumeAction) -> Flow {
        let awaiting = generator.borrow_mut().awaiting.take();
        let delegating = generator.borrow().delegate.is_some();
        match (awaiting, action) {
            (Some(kind), ResumeAction::Settled(result)) => match (kind, result) {
                (AwaitKind::Value, Ok(value)) => self.store_resume(generator, value),
                (AwaitKind::Delegate, Ok(result)) => self.delegate_result(generator, result),
                (AwaitKind::Delegate, Err(error)) => {
                    self.delegate_step(generator, ResumeAction::Throw(error))
                }
                (AwaitKind::MoveNext, Ok(result)) => self.for_of_result(generator, result),
                (AwaitKind::ForValue, Ok(value)) => self.for_of_bind(generator, value),
                (AwaitKind::MoveNext, Err(error)) => {
                    // A rejected next() leaves the iterator unclosed.
                    generator.borrow_mut().try_frames.pop();
                    self.unwind(generator, Abrupt::Throw(error))
                }
                (_, Err(error)) => self.unwind(generator, Abrupt::Throw(error)),
            },
            (_, ResumeAction::Settled(Ok(value))) => self.store_resume(generator, value),
            (_, ResumeAction::Settled(Err(error))) => self.unwind(generator, Abrupt::Throw(error)),
            (_, action @ (ResumeAction::DelegateComplete(_) | ResumeAction::DelegateThrew(_))) => {
                self.delegate_step(generator, action)
            }
            (_, action) if delegating => self.delegate_step(generator, action),
            (_, ResumeAction::Next(value)) => self.store_resume(generator, value),
            (_, ResumeAction::Throw(error)) => self.unwind(generator, Abrupt::Throw(error)),
            (_, ResumeAction::Return(value)) => self.unwind(generator, Abrupt::Return(value)),
        }
    }

    /// Executes the `StoreResumeValue` the instance is parked on.
    pub(crate) fn store_resume(&mut self, generator: &GeneratorRef, value: JsValue) -> Flow {
        let (instr, env) = {
            let g = generator.borrow();
            (g.plan.instructions[g.ip].clone(), g.scope())
        };
        let Instruction::StoreResumeValue { slot, next } = instr else {
            generator.borrow_mut().ip = self.suspend_next(generator);
            return self.store_resume(generator, value);
        };
        if let Some(slot) = slot
            && let Err(msg) = env.borrow_mut().set(&slot, value)
        {
            let err = self.create_type_error(&to_js_string(&msg));
            return self.unwind(generator, Abrupt::Throw(err));
        }
        generator.borrow_mut().ip = next;
        Flow::Continue
    }

    /// Successor of the suspend instruction at the current position.
    fn suspend_next(&self, generator: &GeneratorRef) -> usize {
        let g = generator.borrow();
        match &g.plan.instructions[g.ip] {
            Instruction::Yield { next, .. }
            | Instruction::YieldStar { next, .. }
            | Instruction::Await { next, .. } => *next,
            _ => g.ip,
        }
    }

    pub(crate) fn finish_delegation(&mut self, generator: &GeneratorRef, value: JsValue) -> Flow {
        debug!(generator = %generator.borrow().name, "delegation finished");
        generator.borrow_mut().delegate = None;
        self.store_resume(generator, value)
    }

    pub(crate) fn completion_flow(&mut self, generator: &GeneratorRef, completion: Completion, next: usize) -> Flow {
        match completion {
            Completion::Normal(_) => {
                generator.borrow_mut().ip = next;
                Flow::Continue
            }
            Completion::Return(v) => self.unwind(generator, Abrupt::Return(v)),
            Completion::Throw(e) => self.unwind(generator, Abrupt::Throw(e)),
            Completion::Break(label) => self.jump(generator, label.as_deref(), false),
            Completion::Continue(label) => self.jump(generator, label.as_deref(), true),
            Completion::Fatal(err) => Flow::outcome(GeneratorOutcome::Fatal(err)),
        }
    }

    fn execute(&mut self, generator: &GeneratorRef) -> Step {
        let plan = generator.borrow().plan.clone();
        loop {
            let (ip, env) = {
                let g = generator.borrow();
                (g.ip, g.scope())
            };
            let instr = &plan.instructions[ip];
            trace!(ip, instruction = %instr, "dispatch");
            if let Flow::Done(step) = self.dispatch(generator, instr, ip, &env) {
                return step;
            }
        }
    }

    fn dispatch(&mut self, generator: &GeneratorRef, instr: &Instruction, ip: usize, env: &EnvRef) -> Flow {
        match instr {
            Instruction::Evaluate { statement, next } => {
                let completion = self.exec_statement(statement, env);
                self.completion_flow(generator, completion, *next)
            }
            Instruction::Yield { argument, next } => {
                let value = match argument {
                    Some(arg) => match self.eval_expr(arg, env) {
                        Completion::Normal(v) => v,
                        other => return self.completion_flow(generator, other, ip),
                    },
                    None => JsValue::Undefined,
                };
                generator.borrow_mut().ip = *next;
                Flow::outcome(GeneratorOutcome::Yielded(value))
            }
            Instruction::Await { argument, next } => {
                let value = match self.eval_expr(argument, env) {
                    Completion::Normal(v) => v,
                    other => return self.completion_flow(generator, other, ip),
                };
                let mut g = generator.borrow_mut();
                g.ip = *next;
                g.awaiting = Some(AwaitKind::Value);
                Flow::outcome(GeneratorOutcome::Awaiting(value))
            }
            Instruction::YieldStar { argument, .. } => {
                let iterable = match self.eval_expr(argument, env) {
                    Completion::Normal(v) => v,
                    other => return self.completion_flow(generator, other, ip),
                };
                self.start_delegation(generator, iterable)
            }
            // Only reachable by falling into it; a resume stores through
            // `store_resume` instead.
            Instruction::StoreResumeValue { .. } => self.store_resume(generator, JsValue::Undefined),
            Instruction::Jump { target } => {
                generator.borrow_mut().ip = *target;
                Flow::Continue
            }
            Instruction::Branch {
                condition,
                on_true,
                on_false,
            } => {
                let value = match self.eval_expr(condition, env) {
                    Completion::Normal(v) => v,
                    other => return self.completion_flow(generator, other, ip),
                };
                generator.borrow_mut().ip = if to_boolean(&value) { *on_true } else { *on_false };
                Flow::Continue
            }
            Instruction::EnterTry {
                catch_target,
                finally_target,
                next,
            } => {
                let mut g = generator.borrow_mut();
                let frame = TryFrame {
                    kind: FrameKind::Try {
                        catch_target: *catch_target,
                        finally_target: *finally_target,
                        phase: TryPhase::Try,
                    },
                    scope_depth: g.scopes.len(),
                    loop_depth: g.loop_scopes.len(),
                    pending: None,
                };
                g.try_frames.push(frame);
                g.ip = *next;
                Flow::Continue
            }
            Instruction::ExitTry {
                next,
                close_iterator,
            } => self.exit_try(generator, *next, *close_iterator),
            Instruction::BindCatch { param, next } => {
                let (scope, caught) = {
                    let mut g = generator.borrow_mut();
                    let scope = Environment::new(Some(g.scope()));
                    g.scopes.push(scope.clone());
                    (scope, g.caught.take().unwrap_or(JsValue::Undefined))
                };
                match param {
                    Some(pattern) => {
                        let completion =
                            self.bind_pattern(pattern, caught, &scope, Some(BindingKind::Let));
                        self.completion_flow(generator, completion, *next)
                    }
                    None => {
                        generator.borrow_mut().ip = *next;
                        Flow::Continue
                    }
                }
            }
            Instruction::EndFinally { next } => {
                let pending = generator.borrow_mut().try_frames.pop().and_then(|f| f.pending);
                match pending {
                    Some(abrupt) => self.unwind(generator, abrupt),
                    None => {
                        generator.borrow_mut().ip = *next;
                        Flow::Continue
                    }
                }
            }
            Instruction::PushScope { functions, next } => {
                let scope = Environment::new(Some(env.clone()));
                let completion = self.instantiate_function_declarations(functions, &scope);
                generator.borrow_mut().scopes.push(scope);
                self.completion_flow(generator, completion, *next)
            }
            Instruction::PopScope { next } => {
                let mut g = generator.borrow_mut();
                if g.scopes.len() > 1 {
                    g.scopes.pop();
                }
                g.ip = *next;
                Flow::Continue
            }
            Instruction::CopyScope { next } => {
                let mut g = generator.borrow_mut();
                let last = g.scopes.len() - 1;
                g.scopes[last] = Environment::copy_of(env);
                g.ip = *next;
                Flow::Continue
            }
            Instruction::EnterLoop {
                labels,
                kind,
                continue_target,
                break_target,
                next,
            } => {
                let mut g = generator.borrow_mut();
                let scope = LoopScope {
                    labels: labels.clone(),
                    kind: *kind,
                    continue_target: *continue_target,
                    break_target: *break_target,
                    scope_depth: g.scopes.len(),
                    try_depth: g.try_frames.len(),
                };
                g.loop_scopes.push(scope);
                g.ip = *next;
                Flow::Continue
            }
            Instruction::ExitLoop { next } => {
                let mut g = generator.borrow_mut();
                g.loop_scopes.pop();
                g.ip = *next;
                Flow::Continue
            }
            Instruction::Break { label } => self.jump(generator, label.as_deref(), false),
            Instruction::Continue { label } => self.jump(generator, label.as_deref(), true),
            Instruction::ForOfInit {
                iterable,
                is_async,
                enumerate_keys,
                next,
            } => {
                let value = match self.eval_expr(iterable, env) {
                    Completion::Normal(v) => v,
                    other => return self.completion_flow(generator, other, ip),
                };
                let record = if *enumerate_keys {
                    Ok(self.create_key_iterator(&value))
                } else if *is_async {
                    self.get_async_iterator(&value)
                } else {
                    self.get_iterator(&value)
                };
                let record = match record {
                    Ok(r) => r,
                    Err(abrupt) => return self.completion_flow(generator, abrupt, ip),
                };
                let mut g = generator.borrow_mut();
                let frame = TryFrame {
                    kind: FrameKind::Iterator { record },
                    scope_depth: g.scopes.len(),
                    loop_depth: g.loop_scopes.len(),
                    pending: None,
                };
                g.try_frames.push(frame);
                g.ip = *next;
                Flow::Continue
            }
            Instruction::ForOfMoveNext { is_async, .. } => {
                let Some(record) = self.current_iterator(generator) else {
                    let err = self.create_type_error("for-of step without an iterator");
                    return self.unwind(generator, Abrupt::Throw(err));
                };
                let result = match self.iterator_call_next(&record, None) {
                    Completion::Normal(r) => r,
                    other => {
                        // A throwing next() leaves the iterator unclosed.
                        generator.borrow_mut().try_frames.pop();
                        return self.completion_flow(generator, other, ip);
                    }
                };
                if *is_async {
                    generator.borrow_mut().awaiting = Some(AwaitKind::MoveNext);
                    return Flow::outcome(GeneratorOutcome::Awaiting(result));
                }
                self.for_of_result(generator, result)
            }
            Instruction::Return { argument } => {
                let value = match argument {
                    Some(arg) => match self.eval_expr(arg, env) {
                        Completion::Normal(v) => v,
                        other => return self.completion_flow(generator, other, ip),
                    },
                    None => JsValue::Undefined,
                };
                self.unwind(generator, Abrupt::Return(value))
            }
            Instruction::Throw { argument } => {
                let value = match self.eval_expr(argument, env) {
                    Completion::Normal(v) => v,
                    other => return self.completion_flow(generator, other, ip),
                };
                self.unwind(generator, Abrupt::Throw(value))
            }
        }
    }

    fn current_iterator(&self, generator: &GeneratorRef) -> Option<IteratorRecord> {
        match generator.borrow().try_frames.last() {
            Some(TryFrame {
                kind: FrameKind::Iterator { record },
                ..
            }) => Some(record.clone()),
            _ => None,
        }
    }

    /// Handles one iterator result of a for-of loop parked on its move-next
    /// instruction.
    fn for_of_result(&mut self, generator: &GeneratorRef, result: JsValue) -> Flow {
        if let Some(reason) = self.malformed_result(&result) {
            return Flow::outcome(GeneratorOutcome::Fatal(
                RuntimeError::MalformedIteratorResult(reason),
            ));
        }
        let done = to_boolean(&self.get_property(&result, "done"));
        if done {
            let exit = match &generator.borrow().plan.instructions[generator.borrow().ip] {
                Instruction::ForOfMoveNext { exit, .. } => *exit,
                _ => generator.borrow().ip,
            };
            generator.borrow_mut().ip = exit;
            return Flow::Continue;
        }
        let value = self.get_property(&result, "value");
        let from_sync = self
            .current_iterator(generator)
            .is_some_and(|r| r.is_async && r.from_sync);
        if from_sync && self.is_promise_like(&value) {
            generator.borrow_mut().awaiting = Some(AwaitKind::ForValue);
            return Flow::outcome(GeneratorOutcome::Awaiting(value));
        }
        self.for_of_bind(generator, value)
    }

    fn for_of_bind(&mut self, generator: &GeneratorRef, value: JsValue) -> Flow {
        let (binding, body, scope) = {
            let mut g = generator.borrow_mut();
            let Instruction::ForOfMoveNext { binding, body, .. } = &g.plan.instructions[g.ip]
            else {
                return Flow::Continue;
            };
            let (binding, body) = (binding.clone(), *body);
            let scope = Environment::new(Some(g.scope()));
            g.scopes.push(scope.clone());
            (binding, body, scope)
        };
        let kind = binding.kind.map(BindingKind::from);
        let completion = self.bind_pattern(&binding.pattern, value, &scope, kind);
        self.completion_flow(generator, completion, body)
    }

    fn exit_try(&mut self, generator: &GeneratorRef, next: usize, close_iterator: bool) -> Flow {
        let mut g = generator.borrow_mut();
        let Some(frame) = g.try_frames.last_mut() else {
            g.ip = next;
            return Flow::Continue;
        };
        match &mut frame.kind {
            FrameKind::Try {
                finally_target: Some(finally),
                phase,
                ..
            } if *phase != TryPhase::Finally => {
                let target = *finally;
                *phase = TryPhase::Finally;
                frame.pending = None;
                g.ip = target;
                Flow::Continue
            }
            FrameKind::Try { .. } => {
                g.try_frames.pop();
                g.ip = next;
                Flow::Continue
            }
            FrameKind::Iterator { record } => {
                let iterator = record.iterator.clone();
                g.try_frames.pop();
                g.ip = next;
                drop(g);
                if close_iterator {
                    match self.iterator_close(&iterator, false) {
                        Completion::Normal(_) => {}
                        other => return self.completion_flow(generator, other, next),
                    }
                }
                Flow::Continue
            }
        }
    }

    /// Resolves `break`/`continue` against the active loop scopes.
    fn jump(&mut self, generator: &GeneratorRef, label: Option<&str>, is_continue: bool) -> Flow {
        let abrupt = {
            let g = generator.borrow();
            g.loop_scopes
                .iter()
                .enumerate()
                .rev()
                .find(|(_, s)| match label {
                    Some(l) => s.labels.iter().any(|x| x == l),
                    None if is_continue => s.kind == LoopKind::Loop,
                    None => s.kind != LoopKind::Block,
                })
                .and_then(|(i, s)| {
                    let (target, loop_len) = if is_continue {
                        (s.continue_target?, i + 1)
                    } else {
                        (s.break_target, i)
                    };
                    Some(Abrupt::Jump {
                        target,
                        loop_len,
                        scope_depth: s.scope_depth,
                        try_depth: s.try_depth,
                    })
                })
        };
        match abrupt {
            Some(abrupt) => self.unwind(generator, abrupt),
            None => {
                let err = self.create_syntax_error(&format!(
                    "Illegal {} statement",
                    if is_continue { "continue" } else { "break" }
                ));
                self.unwind(generator, Abrupt::Throw(err))
            }
        }
    }

    /// Propagates an abrupt completion outward through the try frames,
    /// entering catch and finally blocks on the way.
    pub(crate) fn unwind(&mut self, generator: &GeneratorRef, abrupt: Abrupt) -> Flow {
        let mut abrupt = abrupt;
        loop {
            let mut g = generator.borrow_mut();
            if let Abrupt::Jump {
                target,
                loop_len,
                scope_depth,
                try_depth,
            } = abrupt
                && g.try_frames.len() <= try_depth
            {
                g.scopes.truncate(scope_depth.max(1));
                g.loop_scopes.truncate(loop_len);
                g.ip = target;
                return Flow::Continue;
            }
            let Some(frame) = g.try_frames.last_mut() else {
                drop(g);
                return match abrupt {
                    Abrupt::Throw(e) => Flow::outcome(GeneratorOutcome::Threw(e)),
                    Abrupt::Return(v) => Flow::outcome(GeneratorOutcome::Returned(v)),
                    Abrupt::Jump { .. } => {
                        Flow::outcome(GeneratorOutcome::Returned(JsValue::Undefined))
                    }
                };
            };
            let (scope_depth, loop_depth) = (frame.scope_depth, frame.loop_depth);
            match &mut frame.kind {
                FrameKind::Try {
                    catch_target: Some(catch),
                    phase: phase @ TryPhase::Try,
                    ..
                } if matches!(abrupt, Abrupt::Throw(_)) => {
                    *phase = TryPhase::Catch;
                    let target = *catch;
                    g.restore_depth(scope_depth, loop_depth);
                    if let Abrupt::Throw(e) = abrupt {
                        g.caught = Some(e);
                    }
                    g.ip = target;
                    return Flow::Continue;
                }
                FrameKind::Try {
                    finally_target: Some(finally),
                    phase,
                    ..
                } if *phase != TryPhase::Finally => {
                    *phase = TryPhase::Finally;
                    let target = *finally;
                    frame.pending = Some(abrupt);
                    g.restore_depth(scope_depth, loop_depth);
                    g.ip = target;
                    return Flow::Continue;
                }
                FrameKind::Try { .. } => {
                    // An abrupt exit from a finally block replaces whatever
                    // it was going to resume.
                    g.try_frames.pop();
                }
                FrameKind::Iterator { record } => {
                    let iterator = record.iterator.clone();
                    g.try_frames.pop();
                    g.restore_depth(scope_depth, loop_depth);
                    drop(g);
                    let suppress = matches!(abrupt, Abrupt::Throw(_));
                    match self.iterator_close(&iterator, suppress) {
                        Completion::Normal(_) => {}
                        Completion::Throw(e) => abrupt = Abrupt::Throw(e),
                        Completion::Fatal(err) => {
                            return Flow::outcome(GeneratorOutcome::Fatal(err));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Drives `generator`, following `yield*` into native generators through an
    /// explicit stack rather than nested Rust calls.
    pub(crate) fn resume_generator(
        &mut self,
        generator: &GeneratorRef,
        action: ResumeAction,
    ) -> GeneratorOutcome {
        let mut stack: Vec<GeneratorRef> = vec![generator.clone()];
        let mut action = action;
        loop {
            let top = stack[stack.len() - 1].clone();
            let outcome = match self.run_instance(&top, action) {
                Step::Delegate(inner, inner_action) => {
                    debug!(depth = stack.len(), "entering delegated generator");
                    stack.push(inner);
                    action = inner_action;
                    continue;
                }
                Step::Outcome(outcome) => outcome,
            };
            match outcome {
                GeneratorOutcome::Returned(value) if stack.len() > 1 => {
                    stack.pop();
                    action = ResumeAction::DelegateComplete(value);
                }
                GeneratorOutcome::Threw(error) if stack.len() > 1 => {
                    stack.pop();
                    action = ResumeAction::DelegateThrew(error);
                }
                GeneratorOutcome::Fatal(err) => {
                    for member in &stack[..stack.len() - 1] {
                        let mut m = member.borrow_mut();
                        m.state = GeneratorState::Completed;
                        m.delegate = None;
                    }
                    return GeneratorOutcome::Fatal(err);
                }
                GeneratorOutcome::Awaiting(promise) => {
                    let sync = !top.borrow().is_async;
                    if sync && top.borrow().parked.is_none() {
                        self.park(&top, promise.clone());
                    }
                    for member in &stack[..stack.len() - 1] {
                        member.borrow_mut().state = GeneratorState::SuspendedYield;
                    }
                    return GeneratorOutcome::Awaiting(promise);
                }
                other => {
                    for member in &stack[..stack.len() - 1] {
                        member.borrow_mut().state = GeneratorState::SuspendedYield;
                    }
                    return other;
                }
            }
        }
    }

    fn park(&mut self, generator: &GeneratorRef, promise: JsValue) {
        let settlement: Rc<RefCell<Option<Result<JsValue, JsValue>>>> = Rc::new(RefCell::new(None));
        let cell = settlement.clone();
        debug!(generator = %generator.borrow().name, "parking on promise");
        self.await_value(
            promise.clone(),
            Box::new(move |_, result| {
                *cell.borrow_mut() = Some(result);
            }),
        );
        generator.borrow_mut().parked = Some(Parked {
            promise,
            settlement,
        });
    }

    pub(crate) fn generator_ref(&self, value: &JsValue) -> Option<GeneratorRef> {
        let JsValue::Object(o) = value else {
            return None;
        };
        match &self.get_object(o.id)?.borrow().iterator_state {
            Some(IteratorState::Generator(generator)) => Some(generator.clone()),
            _ => None,
        }
    }

    /// Resumes a generator object from the host side.
    pub fn generator_resume(
        &mut self,
        generator: &JsValue,
        action: ResumeAction,
    ) -> Result<IteratorStep, GeneratorError> {
        let generator = self
            .generator_ref(generator)
            .ok_or(RuntimeError::NotAGenerator)?;
        match self.resume_generator(&generator, action) {
            GeneratorOutcome::Yielded(value) | GeneratorOutcome::Awaiting(value) => {
                Ok(IteratorStep { value, done: false })
            }
            GeneratorOutcome::Returned(value) => Ok(IteratorStep { value, done: true }),
            GeneratorOutcome::Threw(error) => Err(GeneratorError::Thrown(error)),
            GeneratorOutcome::Fatal(err) => Err(GeneratorError::Fatal(err)),
        }
    }

    pub fn generator_state(&self, generator: &JsValue) -> Option<GeneratorState> {
        self.generator_ref(generator).map(|g| g.borrow().state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        BinaryOp, Expression as E, FunctionExpr, Property, PropertyKey, Statement as S, VarKind,
    };
    use pretty_assertions::assert_eq;

    fn num(n: f64) -> JsValue {
        JsValue::Number(n)
    }

    /// Defines `gen` from `body`, then calls it with no arguments.
    fn start(interp: &mut Interpreter, body: Vec<S>) -> JsValue {
        let program = vec![
            S::const_("gen", E::function(FunctionExpr::generator(&[], body))),
            S::const_("it", E::call(E::ident("gen"), vec![])),
        ];
        match interp.run(&program) {
            Completion::Normal(_) => {}
            other => panic!("setup failed: {other:?}"),
        }
        interp.get_global("it").unwrap()
    }

    fn next(interp: &mut Interpreter, it: &JsValue, v: JsValue) -> IteratorStep {
        interp.generator_resume(it, ResumeAction::Next(v)).unwrap()
    }

    fn step(value: JsValue, done: bool) -> IteratorStep {
        IteratorStep { value, done }
    }

    /// An iterable whose `next` returns `result` every time.
    fn iterable_returning(result: E) -> E {
        E::Object(vec![
            Property {
                key: PropertyKey::Computed(Box::new(E::member(E::ident("Symbol"), "iterator"))),
                value: E::function(FunctionExpr::plain(&[], vec![S::return_(Some(E::This))])),
            },
            Property {
                key: PropertyKey::Identifier("next".to_string()),
                value: E::function(FunctionExpr::plain(&[], vec![S::return_(Some(result))])),
            },
        ])
    }

    #[test]
    fn yields_then_completes_and_stays_completed() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::expr(E::yield_(E::num(1.0))),
                S::expr(E::yield_(E::num(2.0))),
            ],
        );
        assert_eq!(interp.generator_state(&it), Some(GeneratorState::SuspendedStart));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(1.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(2.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(JsValue::Undefined, true));
        for _ in 0..3 {
            assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(JsValue::Undefined, true));
        }
        assert_eq!(interp.generator_state(&it), Some(GeneratorState::Completed));
        assert_eq!(interp.diagnostics().failures, vec![]);
    }

    #[test]
    fn resume_value_becomes_yield_result() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::let_("x", E::yield_(E::num(1.0))),
                S::return_(Some(E::binary(BinaryOp::Add, E::ident("x"), E::num(1.0)))),
            ],
        );
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(1.0), false));
        assert_eq!(next(&mut interp, &it, num(41.0)), step(num(42.0), true));
    }

    #[test]
    fn return_runs_finally_before_completing() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![S::try_(
                vec![S::expr(E::yield_(E::num(1.0))), S::expr(E::yield_(E::num(2.0)))],
                None,
                Some(vec![S::expr(E::assign(E::ident("cleaned"), E::boolean(true)))]),
            )],
        );
        next(&mut interp, &it, JsValue::Undefined);
        let done = interp.generator_resume(&it, ResumeAction::Return(num(99.0))).unwrap();
        assert_eq!(done, step(num(99.0), true));
        assert_eq!(interp.get_global("cleaned"), Some(JsValue::Boolean(true)));
    }

    #[test]
    fn finally_can_yield_while_a_return_is_pending() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![S::try_(
                vec![S::expr(E::yield_(E::num(1.0)))],
                None,
                Some(vec![S::expr(E::yield_(E::string("cleanup")))]),
            )],
        );
        next(&mut interp, &it, JsValue::Undefined);
        let cleanup = interp.generator_resume(&it, ResumeAction::Return(num(7.0))).unwrap();
        assert_eq!(cleanup, step(JsValue::from_str("cleanup"), false));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(7.0), true));
    }

    #[test]
    fn throw_from_nested_finally_replaces_pending_completion() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![S::try_(
                vec![S::try_(
                    vec![S::expr(E::yield_(E::num(1.0))), S::return_(Some(E::num(1.0)))],
                    None,
                    Some(vec![S::throw(E::string("inner"))]),
                )],
                Some((Some("e"), vec![S::return_(Some(E::ident("e")))])),
                None,
            )],
        );
        next(&mut interp, &it, JsValue::Undefined);
        assert_eq!(
            next(&mut interp, &it, JsValue::Undefined),
            step(JsValue::from_str("inner"), true)
        );
    }

    #[test]
    fn thrown_value_reaches_catch() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![S::try_(
                vec![S::expr(E::yield_(E::num(1.0)))],
                Some((Some("e"), vec![S::expr(E::yield_(E::ident("e")))])),
                None,
            )],
        );
        next(&mut interp, &it, JsValue::Undefined);
        let caught = interp
            .generator_resume(&it, ResumeAction::Throw(JsValue::from_str("boom")))
            .unwrap();
        assert_eq!(caught, step(JsValue::from_str("boom"), false));
    }

    #[test]
    fn uncaught_throw_completes_the_generator() {
        let mut interp = Interpreter::new();
        let it = start(&mut interp, vec![S::expr(E::yield_(E::num(1.0)))]);
        next(&mut interp, &it, JsValue::Undefined);
        let err = interp
            .generator_resume(&it, ResumeAction::Throw(num(5.0)))
            .unwrap_err();
        assert_eq!(err, GeneratorError::Thrown(num(5.0)));
        assert_eq!(interp.generator_state(&it), Some(GeneratorState::Completed));
    }

    #[test]
    fn labeled_continue_skips_to_outer_iteration() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![S::labeled(
                "outer",
                S::for_of(
                    VarKind::Const,
                    "i",
                    E::array(vec![E::num(1.0), E::num(2.0)]),
                    vec![S::for_of(
                        VarKind::Const,
                        "j",
                        E::array(vec![E::num(10.0), E::num(20.0)]),
                        vec![
                            S::expr(E::yield_(E::binary(
                                BinaryOp::Add,
                                E::ident("i"),
                                E::ident("j"),
                            ))),
                            S::continue_(Some("outer")),
                        ],
                    )],
                ),
            )],
        );
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(11.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(12.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(JsValue::Undefined, true));
    }

    #[test]
    fn yielding_while_test_takes_the_resume_value() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::let_("n", E::num(0.0)),
                S::while_(
                    E::yield_(E::ident("n")),
                    vec![S::expr(E::postfix_increment(E::ident("n")))],
                ),
                S::return_(Some(E::ident("n"))),
            ],
        );
        let t = JsValue::Boolean(true);
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(0.0), false));
        assert_eq!(next(&mut interp, &it, t.clone()), step(num(1.0), false));
        assert_eq!(next(&mut interp, &it, t), step(num(2.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Boolean(false)), step(num(2.0), true));
        assert_eq!(interp.diagnostics().failures, vec![]);
    }

    #[test]
    fn yielding_do_while_test_runs_the_body_first() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::let_("n", E::num(0.0)),
                S::do_while(
                    vec![S::expr(E::postfix_increment(E::ident("n")))],
                    E::yield_(E::ident("n")),
                ),
                S::return_(Some(E::ident("n"))),
            ],
        );
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(1.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Boolean(true)), step(num(2.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Boolean(false)), step(num(2.0), true));
    }

    #[test]
    fn continue_outer_from_labeled_while_rechecks_the_outer_test() {
        let mut interp = Interpreter::new();
        let skipped = || S::expr(E::assign(E::ident("skipped"), E::boolean(true)));
        let it = start(
            &mut interp,
            vec![
                S::let_("i", E::num(0.0)),
                S::labeled(
                    "outer",
                    S::while_(
                        E::binary(BinaryOp::Lt, E::ident("i"), E::num(2.0)),
                        vec![
                            S::expr(E::postfix_increment(E::ident("i"))),
                            S::let_("j", E::num(0.0)),
                            S::labeled(
                                "inner",
                                S::while_(
                                    E::binary(BinaryOp::Lt, E::ident("j"), E::num(5.0)),
                                    vec![
                                        S::expr(E::postfix_increment(E::ident("j"))),
                                        S::expr(E::yield_(E::binary(
                                            BinaryOp::Add,
                                            E::binary(BinaryOp::Mul, E::ident("i"), E::num(10.0)),
                                            E::ident("j"),
                                        ))),
                                        S::continue_(Some("outer")),
                                        skipped(),
                                    ],
                                ),
                            ),
                            skipped(),
                        ],
                    ),
                ),
            ],
        );
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(11.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(21.0), false));
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(JsValue::Undefined, true));
        assert_eq!(interp.get_global("skipped"), None);
    }

    #[test]
    fn throw_into_a_yielding_finally_replaces_the_pending_return() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![S::try_(
                vec![S::try_(
                    vec![S::expr(E::yield_(E::num(1.0)))],
                    None,
                    Some(vec![S::expr(E::yield_(E::string("inner finally")))]),
                )],
                Some((Some("e"), vec![S::return_(Some(E::ident("e")))])),
                None,
            )],
        );
        next(&mut interp, &it, JsValue::Undefined);
        let parked = interp.generator_resume(&it, ResumeAction::Return(num(9.0))).unwrap();
        assert_eq!(parked, step(JsValue::from_str("inner finally"), false));
        let caught = interp
            .generator_resume(&it, ResumeAction::Throw(JsValue::from_str("x")))
            .unwrap();
        assert_eq!(caught, step(JsValue::from_str("x"), true));
    }

    #[test]
    fn break_waits_for_a_yielding_finally() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::while_(
                    E::boolean(true),
                    vec![S::try_(
                        vec![S::expr(E::yield_(E::num(1.0))), S::break_(None)],
                        None,
                        Some(vec![S::expr(E::yield_(E::string("cleanup")))]),
                    )],
                ),
                S::expr(E::yield_(E::string("after"))),
            ],
        );
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(num(1.0), false));
        assert_eq!(
            next(&mut interp, &it, JsValue::Undefined),
            step(JsValue::from_str("cleanup"), false)
        );
        assert_eq!(
            next(&mut interp, &it, JsValue::Undefined),
            step(JsValue::from_str("after"), false)
        );
        assert_eq!(next(&mut interp, &it, JsValue::Undefined), step(JsValue::Undefined, true));
    }

    #[test]
    fn continue_waits_for_a_yielding_finally() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::let_("i", E::num(0.0)),
                S::while_(
                    E::binary(BinaryOp::Lt, E::ident("i"), E::num(2.0)),
                    vec![
                        S::expr(E::postfix_increment(E::ident("i"))),
                        S::try_(
                            vec![S::expr(E::yield_(E::ident("i"))), S::continue_(None)],
                            None,
                            Some(vec![S::expr(E::yield_(E::binary(
                                BinaryOp::Mul,
                                E::ident("i"),
                                E::num(-1.0),
                            )))]),
                        ),
                    ],
                ),
            ],
        );
        let values: Vec<IteratorStep> =
            (0..5).map(|_| next(&mut interp, &it, JsValue::Undefined)).collect();
        assert_eq!(
            values,
            vec![
                step(num(1.0), false),
                step(num(-1.0), false),
                step(num(2.0), false),
                step(num(-2.0), false),
                step(JsValue::Undefined, true),
            ]
        );
    }

    #[test]
    fn for_of_result_without_done_is_fatal() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::const_("src", iterable_returning(E::object(vec![("value", E::num(1.0))]))),
                S::try_(
                    vec![S::for_of(
                        VarKind::Const,
                        "v",
                        E::ident("src"),
                        vec![S::expr(E::yield_(E::ident("v")))],
                    )],
                    Some((Some("e"), vec![S::expr(E::yield_(E::string("caught")))])),
                    Some(vec![S::expr(E::assign(E::ident("finalized"), E::boolean(true)))]),
                ),
            ],
        );
        let err = interp
            .generator_resume(&it, ResumeAction::Next(JsValue::Undefined))
            .unwrap_err();
        assert_eq!(
            err,
            GeneratorError::Fatal(RuntimeError::MalformedIteratorResult(
                "result object has no 'done' property".to_string()
            ))
        );
        assert_eq!(interp.get_global("finalized"), None);
        assert_eq!(interp.generator_state(&it), Some(GeneratorState::Completed));
    }

    #[test]
    fn for_of_result_that_is_not_an_object_is_fatal() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::const_("src", iterable_returning(E::num(1.0))),
                S::try_(
                    vec![S::for_of(
                        VarKind::Const,
                        "v",
                        E::ident("src"),
                        vec![S::expr(E::yield_(E::ident("v")))],
                    )],
                    Some((Some("e"), vec![S::expr(E::yield_(E::string("caught")))])),
                    None,
                ),
            ],
        );
        let err = interp
            .generator_resume(&it, ResumeAction::Next(JsValue::Undefined))
            .unwrap_err();
        assert_eq!(
            err,
            GeneratorError::Fatal(RuntimeError::MalformedIteratorResult(
                "expected an object, got number".to_string()
            ))
        );
    }

    #[test]
    fn reentrant_next_is_fatal() {
        let mut interp = Interpreter::new();
        let it = start(
            &mut interp,
            vec![
                S::expr(E::yield_(E::num(1.0))),
                S::expr(E::method_call(E::ident("it"), "next", vec![])),
                S::expr(E::yield_(E::num(2.0))),
            ],
        );
        next(&mut interp, &it, JsValue::Undefined);
        let err = interp
            .generator_resume(&it, ResumeAction::Next(JsValue::Undefined))
            .unwrap_err();
        assert_eq!(err, GeneratorError::Fatal(RuntimeError::GeneratorRunning));
        assert_eq!(interp.generator_state(&it), Some(GeneratorState::Completed));
    }

    #[test]
    fn not_a_generator() {
        let mut interp = Interpreter::new();
        let err = interp
            .generator_resume(&num(1.0), ResumeAction::Next(JsValue::Undefined))
            .unwrap_err();
        assert_eq!(err, GeneratorError::Fatal(RuntimeError::NotAGenerator));
    }
}
