use super::generator_instance::{GeneratorOutcome, GeneratorRef, ResumeAction};
use super::*;
use tracing::{debug, warn};

pub type AsyncGeneratorRef = Rc<RefCell<AsyncGeneratorState>>;

#[derive(Debug)]
struct AsyncRequest {
    action: ResumeAction,
    promise: JsValue,
}

#[derive(Debug)]
pub struct AsyncGeneratorState {
    instance: GeneratorRef,
    queue: VecDeque<AsyncRequest>,
    running: bool,
}

impl AsyncGeneratorState {
    pub(crate) fn new(instance: GeneratorRef) -> Self {
        AsyncGeneratorState {
            instance,
            queue: VecDeque::new(),
            running: false,
        }
    }
}

impl Interpreter {
    /// `AsyncGenerator.prototype.{next,throw,return}`: queues the request and
    /// returns its promise.
    pub(crate) fn async_generator_enqueue(&mut self, this: &JsValue, action: ResumeAction) -> Completion {
        let promise = self.create_promise_object();
        let state = this
            .as_object()
            .and_then(|o| self.get_object(o.id))
            .and_then(|obj| {
                let o = obj.borrow();
                match &o.iterator_state {
                    Some(IteratorState::AsyncGenerator(s)) => Some(s.clone()),
                    _ => None,
                }
            });
        let Some(state) = state else {
            let method = match action {
                ResumeAction::Throw(_) => "throw",
                ResumeAction::Return(_) => "return",
                _ => "next",
            };
            let err = self.create_type_error(&format!(
                "AsyncGenerator.prototype.{method} called on incompatible receiver"
            ));
            self.reject_promise(&promise, err);
            return Completion::Normal(promise);
        };
        let idle = {
            let mut s = state.borrow_mut();
            s.queue.push_back(AsyncRequest {
                action,
                promise: promise.clone(),
            });
            !s.running
        };
        if idle {
            self.async_generator_drain(&state);
        }
        Completion::Normal(promise)
    }

    fn async_generator_drain(&mut self, state: &AsyncGeneratorRef) {
        loop {
            let (instance, action) = {
                let mut s = state.borrow_mut();
                let Some(request) = s.queue.front() else {
                    s.running = false;
                    return;
                };
                let action = request.action.clone();
                s.running = true;
                (s.instance.clone(), action)
            };
            if !self.async_generator_step(state, &instance, action) {
                // Parked; the settlement job continues the drain.
                return;
            }
        }
    }

    /// Resumes the instance for the request at the head of the queue.
    /// Returns `false` when the instance is now waiting on a promise.
    fn async_generator_step(
        &mut self,
        state: &AsyncGeneratorRef,
        instance: &GeneratorRef,
        action: ResumeAction,
    ) -> bool {
        let outcome = self.resume_generator(instance, action);
        let settled = match outcome {
            GeneratorOutcome::Awaiting(awaited) => {
                debug!(generator = %instance.borrow().name, "async generator awaiting");
                let state = state.clone();
                let instance = instance.clone();
                self.await_value(
                    awaited,
                    Box::new(move |interp, result| {
                        if interp.async_generator_step(&state, &instance, ResumeAction::Settled(result)) {
                            interp.async_generator_drain(&state);
                        }
                    }),
                );
                return false;
            }
            GeneratorOutcome::Yielded(value) => Ok(self.create_iter_result(value, false)),
            GeneratorOutcome::Returned(value) => Ok(self.create_iter_result(value, true)),
            GeneratorOutcome::Threw(error) => Err(error),
            GeneratorOutcome::Fatal(err) => {
                warn!(generator = %instance.borrow().name, error = %err, "async generator failed");
                Err(self.create_error("Error", &err.to_string()))
            }
        };
        let request = state.borrow_mut().queue.pop_front();
        if let Some(request) = request {
            match settled {
                Ok(result) => self.resolve_promise(&request.promise, result),
                Err(error) => self.reject_promise(&request.promise, error),
            }
        }
        true
    }

    /// Runs an `async function` body to its first await and returns the
    /// promise of its completion.
    pub(crate) fn start_async_function(&mut self, instance: GeneratorRef) -> JsValue {
        let promise = self.create_promise_object();
        self.async_function_step(&instance, &promise, ResumeAction::Next(JsValue::Undefined));
        promise
    }

    fn async_function_step(&mut self, instance: &GeneratorRef, promise: &JsValue, action: ResumeAction) {
        match self.resume_generator(instance, action) {
            GeneratorOutcome::Awaiting(awaited) => {
                let instance = instance.clone();
                let promise = promise.clone();
                self.await_value(
                    awaited,
                    Box::new(move |interp, result| {
                        interp.async_function_step(&instance, &promise, ResumeAction::Settled(result));
                    }),
                );
            }
            GeneratorOutcome::Returned(value) => self.resolve_promise(promise, value),
            GeneratorOutcome::Threw(error) => self.reject_promise(promise, error),
            GeneratorOutcome::Yielded(_) => {
                let err = self.create_syntax_error("yield is only valid in generator bodies");
                self.reject_promise(promise, err);
            }
            GeneratorOutcome::Fatal(err) => {
                warn!(function = %instance.borrow().name, error = %err, "async function failed");
                let error = self.create_error("Error", &err.to_string());
                self.reject_promise(promise, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, FunctionExpr, Property, PropertyKey, Statement as S, VarKind};
    use pretty_assertions::assert_eq;

    fn run(program: Vec<S>) -> Interpreter {
        let mut interp = Interpreter::new();
        match interp.run(&program) {
            Completion::Normal(_) => {}
            other => panic!("program failed: {other:?}"),
        }
        interp
    }

    fn log_then(promise: E, body: Vec<E>) -> S {
        S::expr(E::method_call(
            promise,
            "then",
            vec![E::arrow(&["r"], E::method_call(E::ident("console"), "log", body))],
        ))
    }

    fn next(it: &str) -> E {
        E::method_call(E::ident(it), "next", vec![])
    }

    fn r(field: &str) -> E {
        E::member(E::ident("r"), field)
    }

    #[test]
    fn await_inside_an_async_generator() {
        let interp = run(vec![
            S::const_(
                "g",
                E::function(FunctionExpr::async_generator(
                    &[],
                    vec![
                        S::const_(
                            "x",
                            E::await_(E::method_call(E::ident("Promise"), "resolve", vec![E::num(2.0)])),
                        ),
                        S::expr(E::yield_(E::binary(BinaryOp::Mul, E::ident("x"), E::num(3.0)))),
                    ],
                )),
            ),
            S::const_("it", E::call(E::ident("g"), vec![])),
            log_then(next("it"), vec![r("value"), r("done")]),
        ]);
        assert_eq!(interp.console_output(), ["6 false"]);
    }

    #[test]
    fn queued_requests_settle_in_order() {
        let interp = run(vec![
            S::const_(
                "g",
                E::function(FunctionExpr::async_generator(
                    &[],
                    vec![
                        S::expr(E::await_(E::num(0.0))),
                        S::expr(E::yield_(E::num(1.0))),
                        S::expr(E::yield_(E::num(2.0))),
                    ],
                )),
            ),
            S::const_("it", E::call(E::ident("g"), vec![])),
            log_then(next("it"), vec![E::string("a"), r("value")]),
            log_then(next("it"), vec![E::string("b"), r("value")]),
            log_then(next("it"), vec![E::string("c"), r("done")]),
        ]);
        assert_eq!(interp.console_output(), ["a 1", "b 2", "c true"]);
    }

    #[test]
    fn async_function_resolves_with_its_return_value() {
        let interp = run(vec![
            S::const_(
                "f",
                E::function(FunctionExpr::async_plain(
                    &["a"],
                    vec![
                        S::const_("b", E::await_(E::ident("a"))),
                        S::return_(Some(E::binary(BinaryOp::Add, E::ident("b"), E::num(1.0)))),
                    ],
                )),
            ),
            S::const_(
                "p",
                E::call(
                    E::ident("f"),
                    vec![E::method_call(E::ident("Promise"), "resolve", vec![E::num(41.0)])],
                ),
            ),
        ]);
        let p = interp.get_global("p").unwrap();
        assert_eq!(
            interp.promise_status(&p),
            Some(PromiseStatus::Fulfilled(JsValue::Number(42.0)))
        );
    }

    #[test]
    fn async_function_throw_rejects() {
        let interp = run(vec![
            S::const_(
                "f",
                E::function(FunctionExpr::async_plain(&[], vec![S::throw(E::string("boom"))])),
            ),
            S::const_("p", E::call(E::ident("f"), vec![])),
        ]);
        let p = interp.get_global("p").unwrap();
        assert_eq!(
            interp.promise_status(&p),
            Some(PromiseStatus::Rejected(JsValue::from_str("boom")))
        );
    }

    #[test]
    fn yield_star_over_an_async_generator() {
        let interp = run(vec![
            S::const_(
                "inner",
                E::function(FunctionExpr::async_generator(
                    &[],
                    vec![
                        S::expr(E::yield_(E::num(1.0))),
                        S::expr(E::yield_(E::num(2.0))),
                        S::return_(Some(E::string("r"))),
                    ],
                )),
            ),
            S::const_(
                "outer",
                E::function(FunctionExpr::async_generator(
                    &[],
                    vec![
                        S::const_("res", E::yield_star(E::call(E::ident("inner"), vec![]))),
                        S::expr(E::yield_(E::ident("res"))),
                    ],
                )),
            ),
            S::const_("it", E::call(E::ident("outer"), vec![])),
            log_then(next("it"), vec![r("value")]),
            log_then(next("it"), vec![r("value")]),
            log_then(next("it"), vec![r("value")]),
            log_then(next("it"), vec![r("done")]),
        ]);
        assert_eq!(interp.console_output(), ["1", "2", "r", "true"]);
    }

    #[test]
    fn for_await_over_an_array_of_promises() {
        let resolved = |n: f64| E::method_call(E::ident("Promise"), "resolve", vec![E::num(n)]);
        let interp = run(vec![
            S::const_(
                "f",
                E::function(FunctionExpr::async_plain(
                    &[],
                    vec![
                        S::let_("sum", E::num(0.0)),
                        S::for_await_of(
                            "v",
                            E::array(vec![resolved(1.0), E::num(2.0), resolved(3.0)]),
                            vec![S::expr(E::assign(
                                E::ident("sum"),
                                E::binary(BinaryOp::Add, E::ident("sum"), E::ident("v")),
                            ))],
                        ),
                        S::return_(Some(E::ident("sum"))),
                    ],
                )),
            ),
            S::const_("p", E::call(E::ident("f"), vec![])),
        ]);
        let p = interp.get_global("p").unwrap();
        assert_eq!(
            interp.promise_status(&p),
            Some(PromiseStatus::Fulfilled(JsValue::Number(6.0)))
        );
    }

    #[test]
    fn rejected_next_in_for_await_leaves_the_iterator_open() {
        let method = |name: &str, body: Vec<S>| Property {
            key: PropertyKey::Identifier(name.to_string()),
            value: E::function(FunctionExpr::plain(&[], body)),
        };
        let src = E::Object(vec![
            Property {
                key: PropertyKey::Computed(Box::new(E::member(E::ident("Symbol"), "asyncIterator"))),
                value: E::function(FunctionExpr::plain(&[], vec![S::return_(Some(E::This))])),
            },
            method(
                "next",
                vec![S::return_(Some(E::method_call(
                    E::ident("Promise"),
                    "reject",
                    vec![E::string("r")],
                )))],
            ),
            method(
                "return",
                vec![
                    S::expr(E::assign(E::ident("closed"), E::boolean(true))),
                    S::return_(Some(E::object(vec![("done", E::boolean(true))]))),
                ],
            ),
        ]);
        let interp = run(vec![
            S::let_("closed", E::boolean(false)),
            S::const_("src", src),
            S::const_(
                "f",
                E::function(FunctionExpr::async_plain(
                    &[],
                    vec![S::try_(
                        vec![S::for_await_of("x", E::ident("src"), vec![])],
                        Some((Some("e"), vec![S::return_(Some(E::ident("closed")))])),
                        None,
                    )],
                )),
            ),
            S::const_("p", E::call(E::ident("f"), vec![])),
        ]);
        let p = interp.get_global("p").unwrap();
        assert_eq!(
            interp.promise_status(&p),
            Some(PromiseStatus::Fulfilled(JsValue::Boolean(false)))
        );
    }

    #[test]
    fn foreign_receiver_rejects_instead_of_throwing() {
        let mut interp = run(vec![
            S::const_("g", E::function(FunctionExpr::async_generator(&[], vec![]))),
            S::const_("it", E::call(E::ident("g"), vec![])),
        ]);
        let it = interp.get_global("it").unwrap();
        let next = interp.get_property(&it, "next");
        let Completion::Normal(promise) = interp.call_function(&next, &JsValue::Null, &[]) else {
            panic!("next() should return a promise");
        };
        interp.run_jobs();
        assert!(matches!(
            interp.promise_status(&promise),
            Some(PromiseStatus::Rejected(_))
        ));
    }

    #[test]
    fn throw_into_a_suspended_async_generator_reaches_catch() {
        let interp = run(vec![
            S::const_(
                "g",
                E::function(FunctionExpr::async_generator(
                    &[],
                    vec![S::try_(
                        vec![S::expr(E::yield_(E::num(1.0)))],
                        Some((Some("e"), vec![S::expr(E::yield_(E::ident("e")))])),
                        None,
                    )],
                )),
            ),
            S::const_("it", E::call(E::ident("g"), vec![])),
            S::expr(next("it")),
            log_then(
                E::method_call(E::ident("it"), "throw", vec![E::string("caught")]),
                vec![r("value")],
            ),
        ]);
        assert_eq!(interp.console_output(), ["caught"]);
    }

    #[test]
    fn for_of_declarations_in_async_bodies_bind_per_iteration() {
        let interp = run(vec![
            S::const_(
                "f",
                E::function(FunctionExpr::async_plain(
                    &[],
                    vec![
                        S::let_("out", E::array(vec![])),
                        S::for_of(
                            VarKind::Const,
                            "x",
                            E::array(vec![E::num(1.0), E::num(2.0)]),
                            vec![S::expr(E::method_call(
                                E::ident("out"),
                                "push",
                                vec![E::await_(E::ident("x"))],
                            ))],
                        ),
                        S::return_(Some(E::method_call(E::ident("out"), "join", vec![]))),
                    ],
                )),
            ),
            S::const_("p", E::call(E::ident("f"), vec![])),
        ]);
        let p = interp.get_global("p").unwrap();
        assert_eq!(
            interp.promise_status(&p),
            Some(PromiseStatus::Fulfilled(JsValue::from_str("1,2")))
        );
    }
}
