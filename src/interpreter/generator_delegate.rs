use super::builtins::iterators::IteratorRecord;
use super::generator_instance::{Abrupt, AwaitKind, Flow, GeneratorOutcome, ResumeAction, Step};
use super::generator_instance::GeneratorRef;
use super::*;
use crate::error::RuntimeError;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    Next,
    Throw,
    Return,
}

/// Lives on the instance while its `YieldStar` is the active suspend point.
#[derive(Debug)]
pub(crate) struct DelegatedYieldState {
    pub(crate) record: IteratorRecord,
    pub(crate) received: Received,
    /// The inner iterator's last result is a promise being awaited.
    pub(crate) awaiting_result: bool,
    pub(crate) last_value: JsValue,
    /// Set when the inner iterator is an intrinsic generator the driver can
    /// step directly.
    pub(crate) native: Option<GeneratorRef>,
}

impl Interpreter {
    /// Native generators whose `next`/`throw`/`return` are the intrinsics
    /// can be driven by the delegation chain instead of through calls.
    fn native_delegate(&self, value: &JsValue) -> Option<GeneratorRef> {
        let generator = self.generator_ref(value)?;
        let intrinsic = ["next", "throw", "return"].iter().all(|m| {
            matches!(self.get_property(value, m), JsValue::Object(o) if self.generator_methods.contains(&o.id))
        });
        intrinsic.then_some(generator)
    }

    fn has_method(&self, value: &JsValue, which: WellKnownSymbol) -> bool {
        value.is_object() && self.is_callable(&self.get_property(value, &which.property_key()))
    }

    pub(crate) fn start_delegation(&mut self, generator: &GeneratorRef, iterable: JsValue) -> Flow {
        let (is_async, ip) = {
            let g = generator.borrow();
            (g.is_async, g.ip)
        };
        // A sync generator may still delegate to an async-only iterator; its
        // promise results suspend the outer generator.
        let async_only = !is_async
            && !self.has_method(&iterable, WellKnownSymbol::Iterator)
            && self.has_method(&iterable, WellKnownSymbol::AsyncIterator);
        let record = if is_async || async_only {
            self.get_async_iterator(&iterable)
        } else {
            self.get_iterator(&iterable)
        };
        let record = match record {
            Ok(r) => r,
            Err(abrupt) => return self.completion_flow(generator, abrupt, ip),
        };
        let native = if is_async {
            None
        } else {
            self.native_delegate(&record.iterator)
        };
        debug!(
            generator = %generator.borrow().name,
            native = native.is_some(),
            is_async,
            "delegation started"
        );
        generator.borrow_mut().delegate = Some(DelegatedYieldState {
            record,
            received: Received::Next,
            awaiting_result: false,
            last_value: JsValue::Undefined,
            native,
        });
        self.delegate_step(generator, ResumeAction::Next(JsValue::Undefined))
    }

    /// Forwards one external call to the inner iterator.
    pub(crate) fn delegate_step(&mut self, generator: &GeneratorRef, action: ResumeAction) -> Flow {
        let (received, value) = match action {
            ResumeAction::Throw(v) => (Received::Throw, v),
            ResumeAction::Return(v) => (Received::Return, v),
            ResumeAction::Next(v) | ResumeAction::Settled(Ok(v)) => (Received::Next, v),
            ResumeAction::Settled(Err(v)) => (Received::Throw, v),
            ResumeAction::DelegateComplete(v) => {
                let returning = generator
                    .borrow()
                    .delegate
                    .as_ref()
                    .is_some_and(|d| d.received == Received::Return);
                if returning {
                    generator.borrow_mut().delegate = None;
                    return self.unwind(generator, Abrupt::Return(v));
                }
                return self.finish_delegation(generator, v);
            }
            ResumeAction::DelegateThrew(e) => {
                generator.borrow_mut().delegate = None;
                return self.unwind(generator, Abrupt::Throw(e));
            }
        };
        let (record, native, ip) = {
            let mut g = generator.borrow_mut();
            let ip = g.ip;
            let Some(d) = g.delegate.as_mut() else {
                drop(g);
                return self.store_resume(generator, value);
            };
            d.received = received;
            (d.record.clone(), d.native.clone(), ip)
        };

        if let Some(inner) = native {
            let action = match received {
                Received::Next => ResumeAction::Next(value),
                Received::Throw => ResumeAction::Throw(value),
                Received::Return => ResumeAction::Return(value),
            };
            return Flow::Done(Step::Delegate(inner, action));
        }

        let completion = match received {
            Received::Next => self.iterator_call_next(&record, Some(value)),
            Received::Throw => match self.get_method(&record.iterator, "throw") {
                Ok(Some(method)) => self.call_function(&method, &record.iterator, &[value]),
                Ok(None) => {
                    // The protocol is broken: close the inner iterator, then
                    // fail the yield* itself.
                    generator.borrow_mut().delegate = None;
                    match self.iterator_close(&record.iterator, false) {
                        Completion::Normal(_) => {}
                        other => return self.completion_flow(generator, other, ip),
                    }
                    let err =
                        self.create_type_error("The iterator does not provide a 'throw' method");
                    return self.unwind(generator, Abrupt::Throw(err));
                }
                Err(abrupt) => abrupt,
            },
            Received::Return => match self.get_method(&record.iterator, "return") {
                Ok(Some(method)) => self.call_function(&method, &record.iterator, &[value]),
                Ok(None) => {
                    generator.borrow_mut().delegate = None;
                    return self.unwind(generator, Abrupt::Return(value));
                }
                Err(abrupt) => abrupt,
            },
        };
        match completion {
            Completion::Normal(result) => self.delegate_result(generator, result),
            other => {
                generator.borrow_mut().delegate = None;
                self.completion_flow(generator, other, ip)
            }
        }
    }

    /// Why `result` does not have the iterator result shape, if it does not.
    pub(crate) fn malformed_result(&self, result: &JsValue) -> Option<String> {
        match result {
            JsValue::Object(o) => match self.get_object(o.id) {
                Some(obj) if obj.borrow().has_property("done") => None,
                _ => Some("result object has no 'done' property".to_string()),
            },
            other => Some(format!(
                "expected an object, got {}",
                typeof_val(other, &self.objects)
            )),
        }
    }

    /// Interprets one result from the inner iterator.
    pub(crate) fn delegate_result(&mut self, generator: &GeneratorRef, result: JsValue) -> Flow {
        if self.is_promise_like(&result) {
            let mut g = generator.borrow_mut();
            g.awaiting = Some(AwaitKind::Delegate);
            if let Some(d) = g.delegate.as_mut() {
                d.awaiting_result = true;
            }
            debug!(generator = %g.name, "delegation awaiting inner result");
            return Flow::outcome(GeneratorOutcome::Awaiting(result));
        }
        let received = {
            let mut g = generator.borrow_mut();
            match g.delegate.as_mut() {
                Some(d) => {
                    d.awaiting_result = false;
                    d.received
                }
                None => Received::Next,
            }
        };
        if let Some(reason) = self.malformed_result(&result) {
            generator.borrow_mut().delegate = None;
            return Flow::outcome(GeneratorOutcome::Fatal(
                RuntimeError::MalformedIteratorResult(reason),
            ));
        }
        let done = to_boolean(&self.get_property(&result, "done"));
        let value = self.get_property(&result, "value");
        if !done {
            if let Some(d) = generator.borrow_mut().delegate.as_mut() {
                d.last_value = value.clone();
            }
            return Flow::outcome(GeneratorOutcome::Yielded(value));
        }
        if received == Received::Return {
            generator.borrow_mut().delegate = None;
            return self.unwind(generator, Abrupt::Return(value));
        }
        self.finish_delegation(generator, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, FunctionExpr, Property, PropertyKey, Statement as S};
    use crate::error::GeneratorError;
    use crate::interpreter::IteratorStep;
    use pretty_assertions::assert_eq;

    fn run(interp: &mut Interpreter, program: Vec<S>) {
        match interp.run(&program) {
            Completion::Normal(_) => {}
            other => panic!("program failed: {other:?}"),
        }
    }

    fn next(interp: &mut Interpreter, it: &JsValue) -> Result<IteratorStep, GeneratorError> {
        interp.generator_resume(it, ResumeAction::Next(JsValue::Undefined))
    }

    fn yielded(v: JsValue) -> Result<IteratorStep, GeneratorError> {
        Ok(IteratorStep {
            value: v,
            done: false,
        })
    }

    fn finished(v: JsValue) -> Result<IteratorStep, GeneratorError> {
        Ok(IteratorStep {
            value: v,
            done: true,
        })
    }

    /// `{ [Symbol.iterator]() { return this }, ...methods }`
    fn iterator_object(methods: Vec<(&str, FunctionExpr)>) -> E {
        let mut props = vec![Property {
            key: PropertyKey::Computed(Box::new(E::member(E::ident("Symbol"), "iterator"))),
            value: E::function(FunctionExpr::plain(&[], vec![S::return_(Some(E::This))])),
        }];
        for (name, f) in methods {
            props.push(Property {
                key: PropertyKey::Identifier(name.to_string()),
                value: E::function(f),
            });
        }
        E::Object(props)
    }

    fn outer_over(interp: &mut Interpreter, inner: E) -> JsValue {
        run(
            interp,
            vec![
                S::const_("inner", inner),
                S::const_(
                    "outer",
                    E::function(FunctionExpr::generator(
                        &[],
                        vec![
                            S::const_("r", E::yield_star(E::ident("inner"))),
                            S::return_(Some(E::ident("r"))),
                        ],
                    )),
                ),
                S::const_("it", E::call(E::ident("outer"), vec![])),
            ],
        );
        interp.get_global("it").unwrap()
    }

    #[test]
    fn delegates_over_an_array() {
        let mut interp = Interpreter::new();
        let it = outer_over(
            &mut interp,
            E::array(vec![E::num(1.0), E::num(2.0), E::num(3.0)]),
        );
        for n in [1.0, 2.0, 3.0] {
            assert_eq!(next(&mut interp, &it), yielded(JsValue::Number(n)));
        }
        assert_eq!(next(&mut interp, &it), finished(JsValue::Undefined));
    }

    #[test]
    fn inner_return_value_is_the_yield_star_result() {
        let mut interp = Interpreter::new();
        let inner_gen = FunctionExpr::generator(
            &[],
            vec![
                S::expr(E::yield_(E::num(1.0))),
                S::return_(Some(E::string("inner done"))),
            ],
        );
        let it = outer_over(&mut interp, E::call(E::function(inner_gen), vec![]));
        assert_eq!(next(&mut interp, &it), yielded(JsValue::Number(1.0)));
        assert_eq!(next(&mut interp, &it), finished(JsValue::from_str("inner done")));
    }

    #[test]
    fn throw_is_forwarded_to_a_native_inner_generator() {
        let mut interp = Interpreter::new();
        let inner_gen = FunctionExpr::generator(
            &[],
            vec![S::try_(
                vec![S::expr(E::yield_(E::num(1.0)))],
                Some((Some("e"), vec![S::return_(Some(E::ident("e")))])),
                None,
            )],
        );
        let it = outer_over(&mut interp, E::call(E::function(inner_gen), vec![]));
        next(&mut interp, &it).unwrap();
        let step = interp.generator_resume(&it, ResumeAction::Throw(JsValue::from_str("x")));
        assert_eq!(step, finished(JsValue::from_str("x")));
    }

    #[test]
    fn missing_throw_method_raises_type_error_in_outer() {
        let mut interp = Interpreter::new();
        let inner = iterator_object(vec![(
            "next",
            FunctionExpr::plain(
                &[],
                vec![S::return_(Some(E::object(vec![
                    ("value", E::num(1.0)),
                    ("done", E::boolean(false)),
                ])))],
            ),
        )]);
        let it = outer_over(&mut interp, inner);
        assert_eq!(next(&mut interp, &it), yielded(JsValue::Number(1.0)));
        let err = interp
            .generator_resume(&it, ResumeAction::Throw(JsValue::from_str("x")))
            .unwrap_err();
        let GeneratorError::Thrown(error) = err else {
            panic!("expected a thrown TypeError, got {err:?}");
        };
        assert_eq!(
            interp.get_property(&error, "message"),
            JsValue::from_str("The iterator does not provide a 'throw' method")
        );
        assert_eq!(interp.get_property(&error, "name"), JsValue::from_str("TypeError"));
    }

    #[test]
    fn non_object_result_is_fatal() {
        let mut interp = Interpreter::new();
        let inner = iterator_object(vec![(
            "next",
            FunctionExpr::plain(&[], vec![S::return_(Some(E::num(5.0)))]),
        )]);
        let it = outer_over(&mut interp, inner);
        assert_eq!(
            next(&mut interp, &it),
            Err(GeneratorError::Fatal(RuntimeError::MalformedIteratorResult(
                "expected an object, got number".to_string()
            )))
        );
    }

    #[test]
    fn result_without_done_is_fatal_and_skips_finally() {
        let mut interp = Interpreter::new();
        let inner = iterator_object(vec![(
            "next",
            FunctionExpr::plain(
                &[],
                vec![S::return_(Some(E::object(vec![("value", E::num(1.0))])))],
            ),
        )]);
        run(
            &mut interp,
            vec![
                S::const_("inner", inner),
                S::const_(
                    "outer",
                    E::function(FunctionExpr::generator(
                        &[],
                        vec![S::try_(
                            vec![S::expr(E::yield_star(E::ident("inner")))],
                            None,
                            Some(vec![S::expr(E::assign(
                                E::ident("finalized"),
                                E::boolean(true),
                            ))]),
                        )],
                    )),
                ),
                S::const_("it", E::call(E::ident("outer"), vec![])),
            ],
        );
        let it = interp.get_global("it").unwrap();
        assert!(matches!(
            next(&mut interp, &it),
            Err(GeneratorError::Fatal(RuntimeError::MalformedIteratorResult(_)))
        ));
        assert_eq!(interp.get_global("finalized"), None);
        assert_eq!(next(&mut interp, &it), finished(JsValue::Undefined));
    }

    #[test]
    fn return_is_forwarded_and_finishes_outer() {
        let mut interp = Interpreter::new();
        let inner_gen = FunctionExpr::generator(
            &[],
            vec![S::try_(
                vec![S::expr(E::yield_(E::num(1.0)))],
                None,
                Some(vec![S::expr(E::assign(E::ident("innerClosed"), E::boolean(true)))]),
            )],
        );
        let it = outer_over(&mut interp, E::call(E::function(inner_gen), vec![]));
        next(&mut interp, &it).unwrap();
        let step = interp.generator_resume(&it, ResumeAction::Return(JsValue::Number(9.0)));
        assert_eq!(step, finished(JsValue::Number(9.0)));
        assert_eq!(interp.get_global("innerClosed"), Some(JsValue::Boolean(true)));
    }

    #[test]
    fn sync_generator_waits_on_an_async_inner_generator() {
        let mut interp = Interpreter::new();
        let inner_gen = FunctionExpr::async_generator(
            &[],
            vec![S::expr(E::yield_(E::await_(E::method_call(
                E::ident("Promise"),
                "resolve",
                vec![E::num(5.0)],
            ))))],
        );
        let it = outer_over(&mut interp, E::call(E::function(inner_gen), vec![]));
        let pending = next(&mut interp, &it).unwrap();
        assert!(!pending.done);
        assert!(interp.promise_status(&pending.value).is_some());
        interp.run_jobs();
        assert_eq!(next(&mut interp, &it), yielded(JsValue::Number(5.0)));
        let pending = next(&mut interp, &it).unwrap();
        assert!(!pending.done);
        interp.run_jobs();
        assert_eq!(next(&mut interp, &it), finished(JsValue::Undefined));
    }
}
