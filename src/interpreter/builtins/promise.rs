use super::super::*;
use std::cell::Cell;
use tracing::{trace, warn};

/// Receives the settlement of an awaited value.
pub(crate) type Continuation = Box<dyn FnOnce(&mut Interpreter, Result<JsValue, JsValue>)>;

#[derive(Debug, Clone, PartialEq)]
pub enum PromiseStatus {
    Pending,
    Fulfilled(JsValue),
    Rejected(JsValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromiseReactionType {
    Fulfill,
    Reject,
}

enum ReactionHandler {
    /// A `then` callback feeding the derived promise's resolving functions.
    Script {
        handler: Option<JsValue>,
        resolve: JsValue,
        reject: JsValue,
    },
    /// An interpreter-side await. Both reactions share the slot; whichever
    /// runs takes it.
    Native(Rc<RefCell<Option<Continuation>>>),
}

struct PromiseReaction {
    reaction_type: PromiseReactionType,
    handler: ReactionHandler,
}

pub struct PromiseData {
    pub(crate) status: PromiseStatus,
    fulfill_reactions: Vec<PromiseReaction>,
    reject_reactions: Vec<PromiseReaction>,
}

impl PromiseData {
    fn new() -> Self {
        PromiseData {
            status: PromiseStatus::Pending,
            fulfill_reactions: Vec::new(),
            reject_reactions: Vec::new(),
        }
    }
}

impl Interpreter {
    pub(crate) fn setup_promise(&mut self) {
        let proto = self.create_object();
        self.promise_prototype = Some(proto.clone());

        // Promise.prototype.then
        let then_fn = self.create_function(JsFunction::native(
            "then".to_string(),
            2,
            |interp, this, args| {
                let on_fulfilled = args.first().cloned().unwrap_or(JsValue::Undefined);
                let on_rejected = args.get(1).cloned().unwrap_or(JsValue::Undefined);
                interp.promise_then(this, &on_fulfilled, &on_rejected)
            },
        ));
        proto
            .borrow_mut()
            .insert_builtin("then".to_string(), then_fn);

        // Promise.prototype.catch
        let catch_fn = self.create_function(JsFunction::native(
            "catch".to_string(),
            1,
            |interp, this, args| {
                let on_rejected = args.first().cloned().unwrap_or(JsValue::Undefined);
                interp.promise_then(this, &JsValue::Undefined, &on_rejected)
            },
        ));
        proto
            .borrow_mut()
            .insert_builtin("catch".to_string(), catch_fn);

        // Promise constructor
        let ctor = self.create_function(JsFunction::native(
            "Promise".to_string(),
            1,
            |interp, _this, args| {
                let executor = args.first().cloned().unwrap_or(JsValue::Undefined);
                if !interp.is_callable(&executor) {
                    let err = interp.create_type_error("Promise resolver is not a function");
                    return Completion::Throw(err);
                }
                let promise = interp.create_promise_object();
                let promise_id = promise.as_object().map(|o| o.id).unwrap_or_default();
                let (resolve_fn, reject_fn) = interp.create_resolving_functions(promise_id);
                match interp.call_function(&executor, &JsValue::Undefined, &[resolve_fn, reject_fn.clone()]) {
                    Completion::Throw(e) => {
                        let _ = interp.call_function(&reject_fn, &JsValue::Undefined, &[e]);
                    }
                    Completion::Fatal(err) => return Completion::Fatal(err),
                    _ => {}
                }
                Completion::Normal(promise)
            },
        ));
        if let Some(ctor_obj) = ctor.as_object().and_then(|o| self.get_object(o.id)) {
            ctor_obj.borrow_mut().insert_property(
                "prototype".to_string(),
                PropertyDescriptor::data(Self::object_value(&proto), false, false),
            );
        }
        proto
            .borrow_mut()
            .insert_builtin("constructor".to_string(), ctor.clone());

        // Promise.resolve / Promise.reject
        let resolve_fn = self.create_function(JsFunction::native(
            "resolve".to_string(),
            1,
            |interp, _this, args| {
                let value = args.first().cloned().unwrap_or(JsValue::Undefined);
                Completion::Normal(interp.promise_resolve_value(&value))
            },
        ));
        let reject_fn = self.create_function(JsFunction::native(
            "reject".to_string(),
            1,
            |interp, _this, args| {
                let reason = args.first().cloned().unwrap_or(JsValue::Undefined);
                let promise = interp.create_promise_object();
                interp.reject_promise(&promise, reason);
                Completion::Normal(promise)
            },
        ));
        if let Some(ctor_obj) = ctor.as_object().and_then(|o| self.get_object(o.id)) {
            let mut c = ctor_obj.borrow_mut();
            c.insert_builtin("resolve".to_string(), resolve_fn);
            c.insert_builtin("reject".to_string(), reject_fn);
        }

        self.register_global("Promise", BindingKind::Var, ctor);
    }

    pub(crate) fn create_promise_object(&mut self) -> JsValue {
        let obj = self.create_object_with_proto(self.promise_prototype.clone());
        {
            let mut o = obj.borrow_mut();
            o.class_name = "Promise".to_string();
            o.promise = Some(PromiseData::new());
        }
        Self::object_value(&obj)
    }

    pub(crate) fn create_resolving_functions(&mut self, promise_id: u64) -> (JsValue, JsValue) {
        let already_resolved = Rc::new(Cell::new(false));

        let ar1 = already_resolved.clone();
        let resolve_fn = self.create_function(JsFunction::native(
            "".to_string(),
            1,
            move |interp, _this, args| {
                if ar1.get() {
                    return Completion::Normal(JsValue::Undefined);
                }
                ar1.set(true);
                let value = args.first().cloned().unwrap_or(JsValue::Undefined);
                let promise = JsValue::Object(crate::types::JsObject { id: promise_id });
                interp.resolve_promise(&promise, value);
                Completion::Normal(JsValue::Undefined)
            },
        ));

        let ar2 = already_resolved;
        let reject_fn = self.create_function(JsFunction::native(
            "".to_string(),
            1,
            move |interp, _this, args| {
                if ar2.get() {
                    return Completion::Normal(JsValue::Undefined);
                }
                ar2.set(true);
                let reason = args.first().cloned().unwrap_or(JsValue::Undefined);
                let promise = JsValue::Object(crate::types::JsObject { id: promise_id });
                interp.reject_promise(&promise, reason);
                Completion::Normal(JsValue::Undefined)
            },
        ));

        (resolve_fn, reject_fn)
    }

    /// Resolves `promise` with `value`, adopting the state of a thenable.
    pub(crate) fn resolve_promise(&mut self, promise: &JsValue, value: JsValue) {
        if let (JsValue::Object(p), JsValue::Object(v)) = (promise, &value)
            && p.id == v.id
        {
            let err = self.create_type_error("A promise cannot be resolved with itself.");
            self.reject_promise(promise, err);
            return;
        }
        let then_val = self.get_property(&value, "then");
        if value.is_object() && self.is_callable(&then_val) {
            let promise_id = promise.as_object().map(|o| o.id).unwrap_or_default();
            self.promise_resolve_thenable(promise_id, value, then_val);
            return;
        }
        self.settle_promise(promise, PromiseStatus::Fulfilled(value));
    }

    pub(crate) fn reject_promise(&mut self, promise: &JsValue, reason: JsValue) {
        self.settle_promise(promise, PromiseStatus::Rejected(reason));
    }

    fn settle_promise(&mut self, promise: &JsValue, status: PromiseStatus) {
        let Some(obj) = promise.as_object().and_then(|o| self.get_object(o.id)) else {
            return;
        };
        let (reactions, argument) = {
            let mut o = obj.borrow_mut();
            let Some(pd) = o.promise.as_mut() else {
                return;
            };
            if pd.status != PromiseStatus::Pending {
                return;
            }
            let fulfill = std::mem::take(&mut pd.fulfill_reactions);
            let reject = std::mem::take(&mut pd.reject_reactions);
            let (reactions, argument) = match &status {
                PromiseStatus::Fulfilled(v) => (fulfill, v.clone()),
                PromiseStatus::Rejected(r) => (reject, r.clone()),
                PromiseStatus::Pending => return,
            };
            pd.status = status;
            (reactions, argument)
        };
        self.trigger_promise_reactions(reactions, argument);
    }

    fn trigger_promise_reactions(&mut self, reactions: Vec<PromiseReaction>, argument: JsValue) {
        for reaction in reactions {
            let arg = argument.clone();
            self.enqueue_job(Box::new(move |interp| interp.run_reaction(reaction, arg)));
        }
    }

    fn run_reaction(&mut self, reaction: PromiseReaction, argument: JsValue) {
        let settled = match reaction.reaction_type {
            PromiseReactionType::Fulfill => Ok(argument),
            PromiseReactionType::Reject => Err(argument),
        };
        match reaction.handler {
            ReactionHandler::Native(slot) => {
                let continuation = slot.borrow_mut().take();
                if let Some(k) = continuation {
                    k(self, settled);
                }
            }
            ReactionHandler::Script {
                handler,
                resolve,
                reject,
            } => {
                let result = match (handler, settled) {
                    (Some(h), Ok(v) | Err(v)) => {
                        match self.call_function(&h, &JsValue::Undefined, &[v]) {
                            Completion::Normal(v) => Ok(v),
                            Completion::Throw(e) => Err(e),
                            Completion::Fatal(err) => {
                                // No caller to hand it to; the derived promise stays pending.
                                warn!(%err, "fatal error in promise reaction");
                                return;
                            }
                            _ => return,
                        }
                    }
                    (None, settled) => settled,
                };
                let _ = match result {
                    Ok(v) => self.call_function(&resolve, &JsValue::Undefined, &[v]),
                    Err(e) => self.call_function(&reject, &JsValue::Undefined, &[e]),
                };
            }
        }
    }

    fn promise_resolve_thenable(&mut self, promise_id: u64, thenable: JsValue, then_fn: JsValue) {
        let (resolve_fn, reject_fn) = self.create_resolving_functions(promise_id);
        self.enqueue_job(Box::new(move |interp| {
            let result =
                interp.call_function(&then_fn, &thenable, &[resolve_fn, reject_fn.clone()]);
            if let Completion::Throw(e) = result {
                let _ = interp.call_function(&reject_fn, &JsValue::Undefined, &[e]);
            }
        }));
    }

    /// Registers a reaction pair on a native promise, running it straight
    /// away (as a job) when the promise has already settled.
    fn add_reactions(&mut self, promise_id: u64, on_fulfill: PromiseReaction, on_reject: PromiseReaction) {
        let Some(obj) = self.get_object(promise_id) else {
            return;
        };
        let settled = {
            let mut o = obj.borrow_mut();
            let Some(pd) = o.promise.as_mut() else {
                return;
            };
            match &pd.status {
                PromiseStatus::Pending => {
                    pd.fulfill_reactions.push(on_fulfill);
                    pd.reject_reactions.push(on_reject);
                    return;
                }
                PromiseStatus::Fulfilled(v) => (on_fulfill, v.clone()),
                PromiseStatus::Rejected(r) => (on_reject, r.clone()),
            }
        };
        self.trigger_promise_reactions(vec![settled.0], settled.1);
    }

    fn promise_then(
        &mut self,
        promise_val: &JsValue,
        on_fulfilled: &JsValue,
        on_rejected: &JsValue,
    ) -> Completion {
        if !self.is_promise(promise_val) {
            let err = self.create_type_error("Promise.prototype.then called on non-promise");
            return Completion::Throw(err);
        }
        let promise_id = promise_val.as_object().map(|o| o.id).unwrap_or_default();

        let derived = self.create_promise_object();
        let derived_id = derived.as_object().map(|o| o.id).unwrap_or_default();
        let (resolve_fn, reject_fn) = self.create_resolving_functions(derived_id);

        let fulfill_handler = self.is_callable(on_fulfilled).then(|| on_fulfilled.clone());
        let reject_handler = self.is_callable(on_rejected).then(|| on_rejected.clone());

        let on_fulfill = PromiseReaction {
            reaction_type: PromiseReactionType::Fulfill,
            handler: ReactionHandler::Script {
                handler: fulfill_handler,
                resolve: resolve_fn.clone(),
                reject: reject_fn.clone(),
            },
        };
        let on_reject = PromiseReaction {
            reaction_type: PromiseReactionType::Reject,
            handler: ReactionHandler::Script {
                handler: reject_handler,
                resolve: resolve_fn,
                reject: reject_fn,
            },
        };
        self.add_reactions(promise_id, on_fulfill, on_reject);
        Completion::Normal(derived)
    }

    /// `PromiseResolve`: native promises pass through, anything else is
    /// wrapped in a new promise resolved with it.
    pub(crate) fn promise_resolve_value(&mut self, value: &JsValue) -> JsValue {
        if self.is_promise(value) {
            return value.clone();
        }
        let promise = self.create_promise_object();
        self.resolve_promise(&promise, value.clone());
        promise
    }

    /// Runs `continuation` once `value` settles. Plain values and foreign
    /// thenables go through `PromiseResolve` first, so the continuation
    /// always runs from a job, never synchronously.
    pub(crate) fn await_value(&mut self, value: JsValue, continuation: Continuation) {
        let promise = self.promise_resolve_value(&value);
        let promise_id = promise.as_object().map(|o| o.id).unwrap_or_default();
        let slot = Rc::new(RefCell::new(Some(continuation)));
        trace!(promise = promise_id, "await registered");
        self.add_reactions(
            promise_id,
            PromiseReaction {
                reaction_type: PromiseReactionType::Fulfill,
                handler: ReactionHandler::Native(slot.clone()),
            },
            PromiseReaction {
                reaction_type: PromiseReactionType::Reject,
                handler: ReactionHandler::Native(slot),
            },
        );
    }

    pub(crate) fn enqueue_job(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Drains the job queue, including jobs queued while draining.
    pub fn run_jobs(&mut self) {
        let mut ran = 0usize;
        while let Some(job) = self.jobs.pop_front() {
            job(self);
            ran += 1;
        }
        if ran > 0 {
            trace!(jobs = ran, "job queue drained");
        }
    }

    pub(crate) fn is_promise(&self, val: &JsValue) -> bool {
        val.as_object()
            .and_then(|o| self.get_object(o.id))
            .is_some_and(|obj| obj.borrow().promise.is_some())
    }

    /// Duck-typed: any object with a callable `then`.
    pub(crate) fn is_promise_like(&self, val: &JsValue) -> bool {
        val.is_object() && self.is_callable(&self.get_property(val, "then"))
    }

    /// Settlement state of a native promise, for embedders and tests.
    pub fn promise_status(&self, val: &JsValue) -> Option<PromiseStatus> {
        let obj = self.get_object(val.as_object()?.id)?;
        let o = obj.borrow();
        o.promise.as_ref().map(|pd| pd.status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, FunctionExpr, Property, PropertyKey, Statement as S, VarKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn then_callbacks_run_as_jobs_in_order() {
        let mut interp = Interpreter::new();
        let log = |msg: &str| {
            E::function(FunctionExpr::plain(
                &["v"],
                vec![S::expr(E::method_call(
                    E::ident("console"),
                    "log",
                    vec![E::string(msg), E::ident("v")],
                ))],
            ))
        };
        let program = vec![
            S::const_("p", E::method_call(E::ident("Promise"), "resolve", vec![E::num(1.0)])),
            S::expr(E::method_call(E::ident("p"), "then", vec![log("first")])),
            S::expr(E::method_call(E::ident("p"), "then", vec![log("second")])),
            S::expr(E::method_call(E::ident("console"), "log", vec![E::string("sync")])),
        ];
        interp.run(&program);
        assert_eq!(interp.console_output(), ["sync", "first 1", "second 1"]);
    }

    #[test]
    fn rejection_reaches_catch() {
        let mut interp = Interpreter::new();
        let program = vec![
            S::const_("p", E::method_call(E::ident("Promise"), "reject", vec![E::string("no")])),
            S::const_(
                "q",
                E::method_call(
                    E::ident("p"),
                    "catch",
                    vec![E::arrow(&["e"], E::binary(crate::ast::BinaryOp::Add, E::ident("e"), E::string("!")))],
                ),
            ),
        ];
        interp.run(&program);
        let q = interp.get_global("q").unwrap();
        assert_eq!(
            interp.promise_status(&q),
            Some(PromiseStatus::Fulfilled(JsValue::from_str("no!")))
        );
    }

    #[test]
    fn await_value_settles_from_a_job() {
        let mut interp = Interpreter::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        interp.await_value(
            JsValue::Number(4.0),
            Box::new(move |_, result| *sink.borrow_mut() = Some(result)),
        );
        assert_eq!(*seen.borrow(), None);
        interp.run_jobs();
        assert_eq!(*seen.borrow(), Some(Ok(JsValue::Number(4.0))));
    }

    #[test]
    fn thenables_are_adopted() {
        let mut interp = Interpreter::new();
        let program = vec![S::const_(
            "thenable",
            E::object(vec![(
                "then",
                E::function(FunctionExpr::plain(
                    &["resolve"],
                    vec![S::expr(E::call(E::ident("resolve"), vec![E::num(7.0)]))],
                )),
            )]),
        )];
        interp.run(&program);
        let thenable = interp.get_global("thenable").unwrap();
        assert!(interp.is_promise_like(&thenable));
        assert!(!interp.is_promise(&thenable));
        let p = interp.promise_resolve_value(&thenable);
        interp.run_jobs();
        assert_eq!(interp.promise_status(&p), Some(PromiseStatus::Fulfilled(JsValue::Number(7.0))));
    }

    #[test]
    fn fatal_reaction_leaves_the_derived_promise_pending() {
        let mut interp = Interpreter::new();
        let method = |key: PropertyKey, body: Vec<S>| Property {
            key,
            value: E::function(FunctionExpr::plain(&[], body)),
        };
        let malformed = E::Object(vec![
            method(
                PropertyKey::Computed(Box::new(E::member(E::ident("Symbol"), "iterator"))),
                vec![S::return_(Some(E::This))],
            ),
            method(
                PropertyKey::Identifier("next".to_string()),
                vec![S::return_(Some(E::num(1.0)))],
            ),
        ]);
        let program = vec![
            S::const_("bad", malformed),
            S::const_("p", E::method_call(E::ident("Promise"), "resolve", vec![E::num(1.0)])),
            S::const_(
                "derived",
                E::method_call(
                    E::ident("p"),
                    "then",
                    vec![E::function(FunctionExpr::plain(
                        &[],
                        vec![S::for_of(VarKind::Const, "v", E::ident("bad"), vec![])],
                    ))],
                ),
            ),
            S::expr(E::method_call(
                E::ident("p"),
                "then",
                vec![E::arrow(
                    &[],
                    E::method_call(E::ident("console"), "log", vec![E::string("later job")]),
                )],
            )),
        ];
        interp.run(&program);
        let derived = interp.get_global("derived").unwrap();
        assert_eq!(interp.promise_status(&derived), Some(PromiseStatus::Pending));
        assert_eq!(interp.console_output(), ["later job"]);
    }
}
