pub(crate) mod iterators;
pub(crate) mod promise;

use super::*;

impl Interpreter {
    pub(crate) fn setup_globals(&mut self) {
        // %Object.prototype% first: every other intrinsic hangs off it.
        let object_proto = self.create_object_with_proto(None);
        self.object_prototype = Some(object_proto);

        self.setup_iterator_prototypes();
        self.setup_array_prototype();
        self.setup_generator_prototype();
        self.setup_async_generator_prototype();
        self.setup_promise();
        self.setup_errors();
        self.setup_symbol();

        let console = self.create_object();
        let log_fn = self.create_function(JsFunction::native(
            "log".to_string(),
            0,
            |interp, _this, args| {
                let parts: Vec<String> = args.iter().map(|v| interp.format_value(v)).collect();
                let line = parts.join(" ");
                tracing::debug!(target: "yieldplan::console", "{line}");
                interp.console.push(line);
                Completion::Normal(JsValue::Undefined)
            },
        ));
        console
            .borrow_mut()
            .insert_builtin("log".to_string(), log_fn);
        self.register_global("console", BindingKind::Const, Self::object_value(&console));
    }

    fn setup_array_prototype(&mut self) {
        let proto = self.create_object();
        proto.borrow_mut().class_name = "Array".to_string();
        proto.borrow_mut().array_elements = Some(Vec::new());

        let push_fn = self.create_function(JsFunction::native(
            "push".to_string(),
            1,
            |interp, this, args| {
                let Some(obj) = this.as_object().and_then(|o| interp.get_object(o.id)) else {
                    let err = interp.create_type_error("Array.prototype.push called on non-object");
                    return Completion::Throw(err);
                };
                let pushed = obj.borrow_mut().array_elements.as_mut().map(|elems| {
                    elems.extend(args.iter().cloned());
                    elems.len()
                });
                match pushed {
                    Some(len) => Completion::Normal(JsValue::Number(len as f64)),
                    None => {
                        let err =
                            interp.create_type_error("Array.prototype.push called on non-array");
                        Completion::Throw(err)
                    }
                }
            },
        ));
        proto
            .borrow_mut()
            .insert_builtin("push".to_string(), push_fn);

        let join_fn = self.create_function(JsFunction::native(
            "join".to_string(),
            1,
            |interp, this, args| {
                let sep = match args.first() {
                    None | Some(JsValue::Undefined) => ",".to_string(),
                    Some(v) => to_js_string(v),
                };
                Completion::Normal(JsValue::from_str(&interp.join_array(this, &sep)))
            },
        ));
        proto
            .borrow_mut()
            .insert_builtin("join".to_string(), join_fn);

        let values_fn = self.create_function(JsFunction::native(
            "values".to_string(),
            0,
            |interp, this, _args| match this.as_object() {
                Some(o) => Completion::Normal(interp.create_array_iterator(o.id, IteratorKind::Value)),
                None => {
                    let err = interp.create_type_error("Array.prototype.values called on non-object");
                    Completion::Throw(err)
                }
            },
        ));
        let keys_fn = self.create_function(JsFunction::native(
            "keys".to_string(),
            0,
            |interp, this, _args| match this.as_object() {
                Some(o) => Completion::Normal(interp.create_array_iterator(o.id, IteratorKind::Key)),
                None => {
                    let err = interp.create_type_error("Array.prototype.keys called on non-object");
                    Completion::Throw(err)
                }
            },
        ));
        {
            let mut p = proto.borrow_mut();
            p.insert_builtin("values".to_string(), values_fn.clone());
            p.insert_builtin("keys".to_string(), keys_fn);
            p.insert_builtin(WellKnownSymbol::Iterator.property_key(), values_fn);
        }
        self.array_prototype = Some(proto);
    }

    pub(crate) fn create_array(&mut self, values: Vec<JsValue>) -> JsValue {
        let obj = self.create_object_with_proto(self.array_prototype.clone());
        {
            let mut o = obj.borrow_mut();
            o.class_name = "Array".to_string();
            o.array_elements = Some(values);
        }
        Self::object_value(&obj)
    }

    /// `Array.prototype.join` without the generic-receiver path.
    pub(crate) fn join_array(&self, array: &JsValue, sep: &str) -> String {
        let Some(obj) = array.as_object().and_then(|o| self.get_object(o.id)) else {
            return String::new();
        };
        let obj = obj.borrow();
        let Some(elems) = obj.array_elements.as_ref() else {
            return String::new();
        };
        elems
            .iter()
            .map(|e| match e {
                JsValue::Undefined | JsValue::Null => String::new(),
                JsValue::Object(_) => self.format_value(e),
                other => to_js_string(other),
            })
            .collect::<Vec<_>>()
            .join(sep)
    }

    fn setup_errors(&mut self) {
        let mut base: Option<Rc<RefCell<JsObjectData>>> = None;
        for kind in ["Error", "TypeError", "SyntaxError", "RangeError", "ReferenceError"] {
            let parent = base.clone().or_else(|| self.object_prototype.clone());
            let proto = self.create_object_with_proto(parent);
            {
                let mut p = proto.borrow_mut();
                p.class_name = "Error".to_string();
                p.insert_builtin("name".to_string(), JsValue::from_str(kind));
                p.insert_builtin("message".to_string(), JsValue::from_str(""));
            }
            self.error_prototypes.insert(kind.to_string(), proto.clone());
            if base.is_none() {
                base = Some(proto.clone());
            }

            let ctor = self.create_function(JsFunction::native(
                kind.to_string(),
                1,
                move |interp, _this, args| {
                    let msg = match args.first() {
                        None | Some(JsValue::Undefined) => String::new(),
                        Some(v) => to_js_string(v),
                    };
                    Completion::Normal(interp.create_error(kind, &msg))
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
            self.register_global(kind, BindingKind::Var, ctor);
        }
    }

    fn setup_symbol(&mut self) {
        let symbol_fn = self.create_function(JsFunction::native(
            "Symbol".to_string(),
            0,
            |interp, _this, args| {
                let description = match args.first() {
                    None | Some(JsValue::Undefined) => None,
                    Some(v) => Some(to_js_string(v)),
                };
                Completion::Normal(interp.create_symbol(description.as_deref()))
            },
        ));
        if let Some(obj) = symbol_fn.as_object().and_then(|o| self.get_object(o.id)) {
            let mut o = obj.borrow_mut();
            for (name, which) in [
                ("iterator", WellKnownSymbol::Iterator),
                ("asyncIterator", WellKnownSymbol::AsyncIterator),
                ("toStringTag", WellKnownSymbol::ToStringTag),
            ] {
                o.insert_property(
                    name.to_string(),
                    PropertyDescriptor::data(self.well_known_symbol(which), false, false),
                );
            }
        }
        self.register_global("Symbol", BindingKind::Var, symbol_fn);
    }
}
