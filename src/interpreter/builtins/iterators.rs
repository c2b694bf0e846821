use super::super::generator_instance::{GeneratorOutcome, ResumeAction};
use super::super::*;
use crate::error::RuntimeError;

/// An open iterator: the object plus the `next` method read once when it
/// was acquired.
#[derive(Debug, Clone)]
pub(crate) struct IteratorRecord {
    pub(crate) iterator: JsValue,
    pub(crate) next_method: JsValue,
    pub(crate) is_async: bool,
    /// An async iteration running over a synchronous iterator; element
    /// values that are promises get awaited by the consumer.
    pub(crate) from_sync: bool,
}

impl Interpreter {
    pub(crate) fn setup_iterator_prototypes(&mut self) {
        let iter_proto = self.create_object();
        iter_proto.borrow_mut().class_name = "Iterator".to_string();
        let iter_self_fn = self.create_function(JsFunction::native(
            "[Symbol.iterator]".to_string(),
            0,
            |_interp, this, _args| Completion::Normal(this.clone()),
        ));
        iter_proto
            .borrow_mut()
            .insert_builtin(WellKnownSymbol::Iterator.property_key(), iter_self_fn);
        self.iterator_prototype = Some(iter_proto.clone());

        let async_iter_proto = self.create_object();
        async_iter_proto.borrow_mut().class_name = "AsyncIterator".to_string();
        let async_iter_self_fn = self.create_function(JsFunction::native(
            "[Symbol.asyncIterator]".to_string(),
            0,
            |_interp, this, _args| Completion::Normal(this.clone()),
        ));
        async_iter_proto
            .borrow_mut()
            .insert_builtin(WellKnownSymbol::AsyncIterator.property_key(), async_iter_self_fn);
        self.async_iterator_prototype = Some(async_iter_proto);

        // %ArrayIteratorPrototype%
        let array_iter_proto = self.create_object_with_proto(Some(iter_proto));
        array_iter_proto.borrow_mut().class_name = "Array Iterator".to_string();
        let next_fn = self.create_function(JsFunction::native(
            "next".to_string(),
            0,
            |interp, this, _args| interp.array_iterator_next(this),
        ));
        array_iter_proto
            .borrow_mut()
            .insert_builtin("next".to_string(), next_fn);
        self.array_iterator_prototype = Some(array_iter_proto);
    }

    pub(crate) fn create_array_iterator(&mut self, array_id: u64, kind: IteratorKind) -> JsValue {
        let proto = self
            .array_iterator_prototype
            .clone()
            .or(self.iterator_prototype.clone());
        let obj = self.create_object_with_proto(proto);
        {
            let mut o = obj.borrow_mut();
            o.class_name = "Array Iterator".to_string();
            o.iterator_state = Some(IteratorState::ArrayIterator {
                array_id,
                index: 0,
                kind,
                done: false,
            });
        }
        Self::object_value(&obj)
    }

    fn array_iterator_next(&mut self, this: &JsValue) -> Completion {
        let Some(obj) = this.as_object().and_then(|o| self.get_object(o.id)) else {
            let err = self.create_type_error("next method called on incompatible receiver");
            return Completion::Throw(err);
        };
        let Some(IteratorState::ArrayIterator {
            array_id,
            index,
            kind,
            done,
        }) = obj.borrow().iterator_state.clone()
        else {
            let err = self.create_type_error("next method called on incompatible receiver");
            return Completion::Throw(err);
        };
        if done {
            return Completion::Normal(self.create_iter_result(JsValue::Undefined, true));
        }
        let element = self.get_object(array_id).and_then(|arr| {
            let arr = arr.borrow();
            let elems = arr.array_elements.as_ref()?;
            (index < elems.len()).then(|| elems[index].clone())
        });
        let Some(element) = element else {
            if let Some(IteratorState::ArrayIterator { done, .. }) =
                obj.borrow_mut().iterator_state.as_mut()
            {
                *done = true;
            }
            return Completion::Normal(self.create_iter_result(JsValue::Undefined, true));
        };
        if let Some(IteratorState::ArrayIterator { index, .. }) =
            obj.borrow_mut().iterator_state.as_mut()
        {
            *index += 1;
        }
        let value = match kind {
            IteratorKind::Key => JsValue::Number(index as f64),
            IteratorKind::Value => element,
        };
        Completion::Normal(self.create_iter_result(value, false))
    }

    pub(crate) fn create_iter_result(&mut self, value: JsValue, done: bool) -> JsValue {
        let obj = self.create_object();
        {
            let mut o = obj.borrow_mut();
            o.insert_value("value".to_string(), value);
            o.insert_value("done".to_string(), JsValue::Boolean(done));
        }
        Self::object_value(&obj)
    }

    /// `GetMethod`: `None` for a nullish property, a TypeError for anything
    /// else that cannot be called.
    pub(crate) fn get_method(
        &mut self,
        value: &JsValue,
        key: &str,
    ) -> Result<Option<JsValue>, Completion> {
        let method = self.get_property(value, key);
        if method.is_nullish() {
            return Ok(None);
        }
        if !self.is_callable(&method) {
            let err = self.create_type_error(&format!("{key} is not a function"));
            return Err(Completion::Throw(err));
        }
        Ok(Some(method))
    }

    fn open_iterator(
        &mut self,
        value: &JsValue,
        method: &JsValue,
        is_async: bool,
    ) -> Result<IteratorRecord, Completion> {
        let iterator = match self.call_function(method, value, &[]) {
            Completion::Normal(v) => v,
            other => return Err(other),
        };
        if !iterator.is_object() {
            let err = self.create_type_error("Result of the iterator method is not an object");
            return Err(Completion::Throw(err));
        }
        let next_method = self.get_property(&iterator, "next");
        Ok(IteratorRecord {
            iterator,
            next_method,
            is_async,
            from_sync: false,
        })
    }

    pub(crate) fn get_iterator(&mut self, value: &JsValue) -> Result<IteratorRecord, Completion> {
        match self.get_method(value, &WellKnownSymbol::Iterator.property_key())? {
            Some(method) => self.open_iterator(value, &method, false),
            None => {
                let shown = self.format_value(value);
                let err = self.create_type_error(&format!("{shown} is not iterable"));
                Err(Completion::Throw(err))
            }
        }
    }

    /// `Symbol.asyncIterator` first, falling back to the synchronous
    /// protocol.
    pub(crate) fn get_async_iterator(
        &mut self,
        value: &JsValue,
    ) -> Result<IteratorRecord, Completion> {
        match self.get_method(value, &WellKnownSymbol::AsyncIterator.property_key())? {
            Some(method) => self.open_iterator(value, &method, true),
            None => {
                let record = self.get_iterator(value)?;
                Ok(IteratorRecord {
                    is_async: true,
                    from_sync: true,
                    ..record
                })
            }
        }
    }

    /// Calls `next`, passing `value` when one is given. The result is not
    /// inspected; async consumers get a promise back.
    pub(crate) fn iterator_call_next(
        &mut self,
        record: &IteratorRecord,
        value: Option<JsValue>,
    ) -> Completion {
        if !self.is_callable(&record.next_method) {
            let err = self.create_type_error("iterator.next is not a function");
            return Completion::Throw(err);
        }
        let args: Vec<JsValue> = value.into_iter().collect();
        self.call_function(&record.next_method, &record.iterator, &args)
    }

    /// One synchronous step: `Ok(None)` once the iterator reports `done`.
    pub(crate) fn iterator_step_value(
        &mut self,
        record: &IteratorRecord,
    ) -> Result<Option<JsValue>, Completion> {
        let result = match self.iterator_call_next(record, None) {
            Completion::Normal(v) => v,
            other => return Err(other),
        };
        if let Some(reason) = self.malformed_result(&result) {
            return Err(Completion::Fatal(RuntimeError::MalformedIteratorResult(reason)));
        }
        if to_boolean(&self.get_property(&result, "done")) {
            return Ok(None);
        }
        Ok(Some(self.get_property(&result, "value")))
    }

    /// Calls the iterator's `return` method if it has one. With `suppress`
    /// set, the caller is already completing with a throw and anything
    /// `return` does short of a fatal error is ignored.
    pub(crate) fn iterator_close(&mut self, iterator: &JsValue, suppress: bool) -> Completion {
        let method = match self.get_method(iterator, "return") {
            Ok(Some(m)) => m,
            Ok(None) => return Completion::Normal(JsValue::Undefined),
            Err(Completion::Fatal(err)) => return Completion::Fatal(err),
            Err(_) if suppress => return Completion::Normal(JsValue::Undefined),
            Err(other) => return other,
        };
        match self.call_function(&method, iterator, &[]) {
            Completion::Fatal(err) => Completion::Fatal(err),
            _ if suppress => Completion::Normal(JsValue::Undefined),
            Completion::Normal(result) if !result.is_object() => {
                let err = self.create_type_error("iterator result is not an object");
                Completion::Throw(err)
            }
            Completion::Normal(_) => Completion::Normal(JsValue::Undefined),
            other => other,
        }
    }

    /// Snapshot of the enumerable keys `for-in` visits, as an iterator.
    pub(crate) fn create_key_iterator(&mut self, value: &JsValue) -> IteratorRecord {
        let keys: Vec<JsValue> = match value.as_object().and_then(|o| self.get_object(o.id)) {
            Some(obj) => obj
                .borrow()
                .enumerable_keys_with_proto()
                .iter()
                .map(|k| JsValue::from_str(k))
                .collect(),
            None => Vec::new(),
        };
        let array = self.create_array(keys);
        let array_id = array.as_object().map(|o| o.id).unwrap_or_default();
        let iterator = self.create_array_iterator(array_id, IteratorKind::Value);
        let next_method = self.get_property(&iterator, "next");
        IteratorRecord {
            iterator,
            next_method,
            is_async: false,
            from_sync: false,
        }
    }

    /// Drains an iterable into a vector, for spread arguments and literals.
    pub(crate) fn iterate_to_vec(&mut self, value: &JsValue) -> Result<Vec<JsValue>, Completion> {
        let record = self.get_iterator(value)?;
        let mut items = Vec::new();
        while let Some(item) = self.iterator_step_value(&record)? {
            items.push(item);
        }
        Ok(items)
    }

    pub(crate) fn setup_generator_prototype(&mut self) {
        let gen_proto = self.create_object_with_proto(self.iterator_prototype.clone());
        gen_proto.borrow_mut().class_name = "Generator".to_string();

        for (name, arity) in [("next", 1), ("return", 1), ("throw", 1)] {
            let method = self.create_function(JsFunction::native(
                name.to_string(),
                arity,
                move |interp, this, args| {
                    let value = args.first().cloned().unwrap_or(JsValue::Undefined);
                    let action = match name {
                        "return" => ResumeAction::Return(value),
                        "throw" => ResumeAction::Throw(value),
                        _ => ResumeAction::Next(value),
                    };
                    interp.generator_method(this, name, action)
                },
            ));
            // Recorded so `yield*` can recognize intrinsic generators and
            // resume them directly.
            if let JsValue::Object(o) = &method {
                self.generator_methods.push(o.id);
            }
            gen_proto.borrow_mut().insert_builtin(name.to_string(), method);
        }
        gen_proto.borrow_mut().insert_property(
            WellKnownSymbol::ToStringTag.property_key(),
            PropertyDescriptor::data(JsValue::from_str("Generator"), false, false),
        );
        self.generator_prototype = Some(gen_proto);
    }

    fn generator_method(&mut self, this: &JsValue, name: &str, action: ResumeAction) -> Completion {
        let Some(generator) = self.generator_ref(this) else {
            let err = self.create_type_error(&format!(
                "Generator.prototype.{name} called on incompatible receiver"
            ));
            return Completion::Throw(err);
        };
        match self.resume_generator(&generator, action) {
            GeneratorOutcome::Yielded(value) | GeneratorOutcome::Awaiting(value) => {
                Completion::Normal(self.create_iter_result(value, false))
            }
            GeneratorOutcome::Returned(value) => {
                Completion::Normal(self.create_iter_result(value, true))
            }
            GeneratorOutcome::Threw(error) => Completion::Throw(error),
            GeneratorOutcome::Fatal(err) => Completion::Fatal(err),
        }
    }

    pub(crate) fn setup_async_generator_prototype(&mut self) {
        let gen_proto = self.create_object_with_proto(self.async_iterator_prototype.clone());
        gen_proto.borrow_mut().class_name = "AsyncGenerator".to_string();

        for name in ["next", "return", "throw"] {
            let method = self.create_function(JsFunction::native(
                name.to_string(),
                1,
                move |interp, this, args| {
                    let value = args.first().cloned().unwrap_or(JsValue::Undefined);
                    let action = match name {
                        "return" => ResumeAction::Return(value),
                        "throw" => ResumeAction::Throw(value),
                        _ => ResumeAction::Next(value),
                    };
                    interp.async_generator_enqueue(this, action)
                },
            ));
            gen_proto.borrow_mut().insert_builtin(name.to_string(), method);
        }
        gen_proto.borrow_mut().insert_property(
            WellKnownSymbol::ToStringTag.property_key(),
            PropertyDescriptor::data(JsValue::from_str("AsyncGenerator"), false, false),
        );
        self.async_generator_prototype = Some(gen_proto);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, FunctionExpr, Statement as S};
    use pretty_assertions::assert_eq;

    fn values(interp: &mut Interpreter, iterable: &JsValue) -> Vec<JsValue> {
        match interp.iterate_to_vec(iterable) {
            Ok(v) => v,
            Err(c) => panic!("iteration failed: {c:?}"),
        }
    }

    #[test]
    fn arrays_iterate_in_order() {
        let mut interp = Interpreter::new();
        let array = interp.create_array(vec![JsValue::Number(1.0), JsValue::from_str("a")]);
        assert_eq!(
            values(&mut interp, &array),
            vec![JsValue::Number(1.0), JsValue::from_str("a")]
        );
    }

    #[test]
    fn key_iterator_snapshots_enumerable_keys() {
        let mut interp = Interpreter::new();
        interp.run(&[S::const_(
            "o",
            E::object(vec![("a", E::num(1.0)), ("b", E::num(2.0))]),
        )]);
        let o = interp.get_global("o").unwrap();
        let record = interp.create_key_iterator(&o);
        let mut keys = Vec::new();
        while let Ok(Some(k)) = interp.iterator_step_value(&record) {
            keys.push(k);
        }
        assert_eq!(keys, vec![JsValue::from_str("a"), JsValue::from_str("b")]);
    }

    #[test]
    fn non_iterable_is_a_type_error() {
        let mut interp = Interpreter::new();
        let Err(Completion::Throw(err)) = interp.get_iterator(&JsValue::Number(3.0)) else {
            panic!("expected a TypeError");
        };
        assert_eq!(interp.get_property(&err, "name"), JsValue::from_str("TypeError"));
        assert_eq!(
            interp.get_property(&err, "message"),
            JsValue::from_str("3 is not iterable")
        );
    }

    #[test]
    fn async_iteration_falls_back_to_sync_iterators() {
        let mut interp = Interpreter::new();
        let array = interp.create_array(vec![JsValue::Number(1.0)]);
        let Ok(record) = interp.get_async_iterator(&array) else {
            panic!("arrays are iterable");
        };
        assert!(record.is_async && record.from_sync);
    }

    #[test]
    fn close_calls_return_and_suppresses_on_throw() {
        let mut interp = Interpreter::new();
        interp.run(&[S::const_(
            "it",
            E::object(vec![(
                "return",
                E::function(FunctionExpr::plain(
                    &[],
                    vec![
                        S::expr(E::assign(E::ident("closed"), E::boolean(true))),
                        S::throw(E::string("from return")),
                    ],
                )),
            )]),
        )]);
        let it = interp.get_global("it").unwrap();
        assert!(matches!(interp.iterator_close(&it, true), Completion::Normal(_)));
        assert_eq!(interp.get_global("closed"), Some(JsValue::Boolean(true)));
        assert!(matches!(
            interp.iterator_close(&it, false),
            Completion::Throw(JsValue::String(_))
        ));
    }

    #[test]
    fn generator_methods_reject_foreign_receivers() {
        let mut interp = Interpreter::new();
        let program = vec![
            S::const_("g", E::function(FunctionExpr::generator(&[], vec![]))),
            S::const_("next", E::member(E::call(E::ident("g"), vec![]), "next")),
        ];
        interp.run(&program);
        let next = interp.get_global("next").unwrap();
        let Completion::Throw(err) = interp.call_function(&next, &JsValue::Number(1.0), &[])
        else {
            panic!("expected a TypeError");
        };
        assert_eq!(
            interp.get_property(&err, "message"),
            JsValue::from_str("Generator.prototype.next called on incompatible receiver")
        );
    }
}
