use super::async_generator::AsyncGeneratorState;
use super::generator_analysis::collect_function_declarations;
use super::generator_instance::GeneratorInstance;
use super::*;
use crate::types::number_ops;

impl Interpreter {
    pub(crate) fn eval_expr(&mut self, expr: &Expression, env: &EnvRef) -> Completion {
        match expr {
            Expression::Literal(lit) => Completion::Normal(Self::eval_literal(lit)),
            Expression::Identifier(name) => self.lookup_identifier(name, env),
            Expression::This => {
                Completion::Normal(env.borrow().get("this").unwrap_or(JsValue::Undefined))
            }
            Expression::Array(elements) => self.eval_array_literal(elements, env),
            Expression::Object(props) => self.eval_object_literal(props, env),
            Expression::Function(f) => self.eval_function_expr(f, None, env),
            Expression::ArrowFunction(arrow) => self.eval_arrow(arrow, None, env),
            Expression::Unary(op, operand) => {
                let val = match self.eval_expr(operand, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                Completion::Normal(Self::eval_unary(*op, &val))
            }
            Expression::Binary(op, left, right) => {
                let lval = match self.eval_expr(left, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                let rval = match self.eval_expr(right, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                self.eval_binary(*op, &lval, &rval)
            }
            Expression::Logical(op, left, right) => self.eval_logical(*op, left, right, env),
            Expression::Update(op, prefix, arg) => self.eval_update(*op, *prefix, arg, env),
            Expression::Assign(op, left, right) => self.eval_assign(*op, left, right, env),
            Expression::Conditional(test, consequent, alternate) => {
                let val = match self.eval_expr(test, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                if to_boolean(&val) {
                    self.eval_expr(consequent, env)
                } else {
                    self.eval_expr(alternate, env)
                }
            }
            Expression::Call(callee, args) => self.eval_call(callee, args, env),
            Expression::New(callee, args) => self.eval_new(callee, args, env),
            Expression::Member(obj, prop) => {
                let obj_val = match self.eval_expr(obj, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                let key = match self.eval_member_key(prop, env) {
                    Ok(k) => k,
                    Err(abrupt) => return abrupt,
                };
                self.get_member(&obj_val, &key)
            }
            Expression::Sequence(exprs) => {
                let mut val = JsValue::Undefined;
                for e in exprs {
                    val = match self.eval_expr(e, env) {
                        Completion::Normal(v) => v,
                        other => return other,
                    };
                }
                Completion::Normal(val)
            }
            Expression::Spread(_) => {
                let err = self.create_syntax_error("Unexpected spread element");
                Completion::Throw(err)
            }
            // Suspend points are hoisted out of every tree the evaluator sees.
            Expression::Yield(..) => {
                let err = self.create_syntax_error("yield is only valid in generator bodies");
                Completion::Throw(err)
            }
            Expression::Await(_) => {
                let err = self.create_syntax_error("await is only valid in async functions");
                Completion::Throw(err)
            }
            Expression::Typeof(operand) => {
                if let Expression::Identifier(name) = &**operand
                    && !env.borrow().has(name)
                {
                    return Completion::Normal(JsValue::from_str("undefined"));
                }
                let val = match self.eval_expr(operand, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                Completion::Normal(JsValue::from_str(typeof_val(&val, &self.objects)))
            }
            Expression::Void(operand) => match self.eval_expr(operand, env) {
                Completion::Normal(_) => Completion::Normal(JsValue::Undefined),
                other => other,
            },
        }
    }

    /// Evaluates `expr`, naming it `name` when it is an anonymous function.
    pub(crate) fn eval_named(&mut self, expr: &Expression, name: &str, env: &EnvRef) -> Completion {
        match expr {
            Expression::Function(f) if f.name.is_none() => {
                self.eval_function_expr(f, Some(name), env)
            }
            Expression::ArrowFunction(arrow) => self.eval_arrow(arrow, Some(name), env),
            other => self.eval_expr(other, env),
        }
    }

    fn eval_literal(lit: &Literal) -> JsValue {
        match lit {
            Literal::Null => JsValue::Null,
            Literal::Boolean(b) => JsValue::Boolean(*b),
            Literal::Number(n) => JsValue::Number(*n),
            Literal::String(s) => JsValue::String(JsString::from_str(s)),
        }
    }

    fn lookup_identifier(&mut self, name: &str, env: &EnvRef) -> Completion {
        let (value, declared) = {
            let e = env.borrow();
            (e.get(name), e.has(name))
        };
        match value {
            Some(v) => Completion::Normal(v),
            None if declared => {
                let err = self
                    .create_reference_error(&format!("Cannot access '{name}' before initialization"));
                Completion::Throw(err)
            }
            None => {
                let err = self.create_reference_error(&format!("{name} is not defined"));
                Completion::Throw(err)
            }
        }
    }

    fn eval_unary(op: UnaryOp, val: &JsValue) -> JsValue {
        match op {
            UnaryOp::Minus => JsValue::Number(-to_number(val)),
            UnaryOp::Plus => JsValue::Number(to_number(val)),
            UnaryOp::Not => JsValue::Boolean(!to_boolean(val)),
            UnaryOp::BitNot => JsValue::Number(number_ops::bitwise_not(to_number(val))),
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &JsValue, right: &JsValue) -> Completion {
        let lnum = || to_number(left);
        let rnum = || to_number(right);
        let val = match op {
            BinaryOp::Add => {
                if is_string(left) || is_string(right) || left.is_object() || right.is_object() {
                    let ls = self.to_display_string(left);
                    let rs = self.to_display_string(right);
                    JsValue::from_str(&format!("{ls}{rs}"))
                } else {
                    JsValue::Number(lnum() + rnum())
                }
            }
            BinaryOp::Sub => JsValue::Number(lnum() - rnum()),
            BinaryOp::Mul => JsValue::Number(lnum() * rnum()),
            BinaryOp::Div => JsValue::Number(lnum() / rnum()),
            BinaryOp::Mod => JsValue::Number(lnum() % rnum()),
            BinaryOp::Exp => JsValue::Number(number_ops::exponentiate(lnum(), rnum())),
            BinaryOp::Eq => JsValue::Boolean(abstract_equality(left, right)),
            BinaryOp::NotEq => JsValue::Boolean(!abstract_equality(left, right)),
            BinaryOp::StrictEq => JsValue::Boolean(strict_equality(left, right)),
            BinaryOp::StrictNotEq => JsValue::Boolean(!strict_equality(left, right)),
            BinaryOp::Lt => JsValue::Boolean(abstract_relational(left, right) == Some(true)),
            BinaryOp::Gt => JsValue::Boolean(abstract_relational(right, left) == Some(true)),
            BinaryOp::LtEq => JsValue::Boolean(abstract_relational(right, left) == Some(false)),
            BinaryOp::GtEq => JsValue::Boolean(abstract_relational(left, right) == Some(false)),
            BinaryOp::LShift => JsValue::Number(number_ops::left_shift(lnum(), rnum())),
            BinaryOp::RShift => JsValue::Number(number_ops::signed_right_shift(lnum(), rnum())),
            BinaryOp::URShift => {
                JsValue::Number(number_ops::unsigned_right_shift(lnum(), rnum()))
            }
            BinaryOp::BitAnd => JsValue::Number(number_ops::bitwise_and(lnum(), rnum())),
            BinaryOp::BitOr => JsValue::Number(number_ops::bitwise_or(lnum(), rnum())),
            BinaryOp::BitXor => JsValue::Number(number_ops::bitwise_xor(lnum(), rnum())),
            BinaryOp::In => {
                let Some(obj) = right.as_object().and_then(|o| self.get_object(o.id)) else {
                    let err = self.create_type_error(&format!(
                        "Cannot use 'in' operator to search for '{}' in {}",
                        to_property_key(left),
                        self.format_value(right)
                    ));
                    return Completion::Throw(err);
                };
                let found = obj.borrow().has_property(&to_property_key(left));
                JsValue::Boolean(found)
            }
            BinaryOp::Instanceof => {
                if !self.is_callable(right) {
                    let err =
                        self.create_type_error("Right-hand side of 'instanceof' is not callable");
                    return Completion::Throw(err);
                }
                JsValue::Boolean(self.instance_of(left, right))
            }
        };
        Completion::Normal(val)
    }

    /// Walks the prototype chain of `value` looking for `ctor.prototype`.
    fn instance_of(&self, value: &JsValue, ctor: &JsValue) -> bool {
        let Some(proto) = self
            .get_property(ctor, "prototype")
            .as_object()
            .and_then(|p| self.get_object(p.id))
        else {
            return false;
        };
        let Some(obj) = value.as_object().and_then(|o| self.get_object(o.id)) else {
            return false;
        };
        let mut current = obj.borrow().prototype.clone();
        while let Some(p) = current {
            if Rc::ptr_eq(&p, &proto) {
                return true;
            }
            current = p.borrow().prototype.clone();
        }
        false
    }

    /// String conversion for `+`: arrays join, other objects use their
    /// formatted form.
    fn to_display_string(&self, val: &JsValue) -> String {
        match val {
            JsValue::Object(o)
                if self
                    .get_object(o.id)
                    .is_some_and(|obj| obj.borrow().array_elements.is_some()) =>
            {
                self.join_array(val, ",")
            }
            JsValue::Object(_) => self.format_value(val),
            other => to_js_string(other),
        }
    }

    fn eval_logical(
        &mut self,
        op: LogicalOp,
        left: &Expression,
        right: &Expression,
        env: &EnvRef,
    ) -> Completion {
        let lval = match self.eval_expr(left, env) {
            Completion::Normal(v) => v,
            other => return other,
        };
        let short_circuit = match op {
            LogicalOp::And => !to_boolean(&lval),
            LogicalOp::Or => to_boolean(&lval),
            LogicalOp::NullishCoalescing => !lval.is_nullish(),
        };
        if short_circuit {
            Completion::Normal(lval)
        } else {
            self.eval_expr(right, env)
        }
    }

    fn eval_update(
        &mut self,
        op: UpdateOp,
        prefix: bool,
        arg: &Expression,
        env: &EnvRef,
    ) -> Completion {
        let delta = match op {
            UpdateOp::Increment => 1.0,
            UpdateOp::Decrement => -1.0,
        };
        match arg {
            Expression::Identifier(name) => {
                let old_val = match self.lookup_identifier(name, env) {
                    Completion::Normal(v) => to_number(&v),
                    other => return other,
                };
                let new_val = old_val + delta;
                let assigned = self.assign_identifier(name, JsValue::Number(new_val), env);
                if assigned.is_abrupt() {
                    return assigned;
                }
                Completion::Normal(JsValue::Number(if prefix { new_val } else { old_val }))
            }
            Expression::Member(obj, prop) => {
                let obj_val = match self.eval_expr(obj, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                let key = match self.eval_member_key(prop, env) {
                    Ok(k) => k,
                    Err(abrupt) => return abrupt,
                };
                let old_val = match self.get_member(&obj_val, &key) {
                    Completion::Normal(v) => to_number(&v),
                    other => return other,
                };
                let new_val = old_val + delta;
                let assigned = self.set_member(&obj_val, &key, JsValue::Number(new_val));
                if assigned.is_abrupt() {
                    return assigned;
                }
                Completion::Normal(JsValue::Number(if prefix { new_val } else { old_val }))
            }
            _ => {
                let err = self.create_syntax_error("Invalid left-hand side in update expression");
                Completion::Throw(err)
            }
        }
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        left: &Expression,
        right: &Expression,
        env: &EnvRef,
    ) -> Completion {
        match left {
            Expression::Identifier(name) => {
                let val = match op.binary_op() {
                    None => match self.eval_named(right, name, env) {
                        Completion::Normal(v) => v,
                        other => return other,
                    },
                    Some(bin) => {
                        let old = match self.lookup_identifier(name, env) {
                            Completion::Normal(v) => v,
                            other => return other,
                        };
                        let rval = match self.eval_expr(right, env) {
                            Completion::Normal(v) => v,
                            other => return other,
                        };
                        match self.eval_binary(bin, &old, &rval) {
                            Completion::Normal(v) => v,
                            other => return other,
                        }
                    }
                };
                match self.assign_identifier(name, val.clone(), env) {
                    Completion::Normal(_) => Completion::Normal(val),
                    other => other,
                }
            }
            Expression::Member(obj, prop) => {
                let obj_val = match self.eval_expr(obj, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                let key = match self.eval_member_key(prop, env) {
                    Ok(k) => k,
                    Err(abrupt) => return abrupt,
                };
                let val = match op.binary_op() {
                    None => match self.eval_expr(right, env) {
                        Completion::Normal(v) => v,
                        other => return other,
                    },
                    Some(bin) => {
                        let old = match self.get_member(&obj_val, &key) {
                            Completion::Normal(v) => v,
                            other => return other,
                        };
                        let rval = match self.eval_expr(right, env) {
                            Completion::Normal(v) => v,
                            other => return other,
                        };
                        match self.eval_binary(bin, &old, &rval) {
                            Completion::Normal(v) => v,
                            other => return other,
                        }
                    }
                };
                match self.set_member(&obj_val, &key, val.clone()) {
                    Completion::Normal(_) => Completion::Normal(val),
                    other => other,
                }
            }
            _ => {
                let err = self.create_syntax_error("Invalid left-hand side in assignment");
                Completion::Throw(err)
            }
        }
    }

    fn assign_identifier(&mut self, name: &str, val: JsValue, env: &EnvRef) -> Completion {
        let result = env.borrow_mut().set(name, val);
        match result {
            Ok(()) => Completion::Normal(JsValue::Undefined),
            Err(msg) => {
                let err = self.create_type_error(&to_js_string(&msg));
                Completion::Throw(err)
            }
        }
    }

    fn eval_member_key(&mut self, prop: &MemberProperty, env: &EnvRef) -> Result<String, Completion> {
        match prop {
            MemberProperty::Dot(name) => Ok(name.clone()),
            MemberProperty::Computed(expr) => match self.eval_expr(expr, env) {
                Completion::Normal(v) => Ok(to_property_key(&v)),
                other => Err(other),
            },
        }
    }

    pub(crate) fn eval_property_key(
        &mut self,
        key: &PropertyKey,
        env: &EnvRef,
    ) -> Result<String, Completion> {
        match key {
            PropertyKey::Identifier(s) | PropertyKey::String(s) => Ok(s.clone()),
            PropertyKey::Number(n) => Ok(number_ops::to_string(*n)),
            PropertyKey::Computed(expr) => match self.eval_expr(expr, env) {
                Completion::Normal(v) => Ok(to_property_key(&v)),
                other => Err(other),
            },
        }
    }

    fn get_member(&mut self, obj: &JsValue, key: &str) -> Completion {
        match obj {
            JsValue::Undefined | JsValue::Null => {
                let err = self
                    .create_type_error(&format!("Cannot read properties of {obj} (reading '{key}')"));
                Completion::Throw(err)
            }
            JsValue::String(s) => {
                if key == "length" {
                    return Completion::Normal(JsValue::Number(s.len() as f64));
                }
                let unit = key.parse::<usize>().ok().and_then(|i| s.code_units.get(i).copied());
                Completion::Normal(match unit {
                    Some(u) => JsValue::String(JsString { code_units: vec![u] }),
                    None => JsValue::Undefined,
                })
            }
            JsValue::Object(_) => Completion::Normal(self.get_property(obj, key)),
            _ => Completion::Normal(JsValue::Undefined),
        }
    }

    fn set_member(&mut self, obj: &JsValue, key: &str, val: JsValue) -> Completion {
        match obj {
            JsValue::Undefined | JsValue::Null => {
                let err = self
                    .create_type_error(&format!("Cannot set properties of {obj} (setting '{key}')"));
                Completion::Throw(err)
            }
            JsValue::Object(o) => {
                if let Some(target) = self.get_object(o.id) {
                    target.borrow_mut().set_property_value(key, val);
                }
                Completion::Normal(JsValue::Undefined)
            }
            // Primitive wrappers are not modelled; writes are dropped.
            _ => Completion::Normal(JsValue::Undefined),
        }
    }

    fn eval_array_literal(&mut self, elements: &[Option<Expression>], env: &EnvRef) -> Completion {
        let mut values = Vec::with_capacity(elements.len());
        for elem in elements {
            match elem {
                Some(Expression::Spread(inner)) => {
                    let iterable = match self.eval_expr(inner, env) {
                        Completion::Normal(v) => v,
                        other => return other,
                    };
                    match self.iterate_to_vec(&iterable) {
                        Ok(items) => values.extend(items),
                        Err(abrupt) => return abrupt,
                    }
                }
                Some(e) => match self.eval_expr(e, env) {
                    Completion::Normal(v) => values.push(v),
                    other => return other,
                },
                None => values.push(JsValue::Undefined),
            }
        }
        Completion::Normal(self.create_array(values))
    }

    fn eval_object_literal(&mut self, props: &[Property], env: &EnvRef) -> Completion {
        let obj = self.create_object();
        for prop in props {
            let key = match self.eval_property_key(&prop.key, env) {
                Ok(k) => k,
                Err(abrupt) => return abrupt,
            };
            let val = match self.eval_named(&prop.value, &key, env) {
                Completion::Normal(v) => v,
                other => return other,
            };
            obj.borrow_mut().insert_value(key, val);
        }
        Completion::Normal(Self::object_value(&obj))
    }

    fn eval_args(&mut self, args: &[Expression], env: &EnvRef) -> Result<Vec<JsValue>, Completion> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            if let Expression::Spread(inner) = arg {
                let iterable = match self.eval_expr(inner, env) {
                    Completion::Normal(v) => v,
                    other => return Err(other),
                };
                values.extend(self.iterate_to_vec(&iterable)?);
            } else {
                match self.eval_expr(arg, env) {
                    Completion::Normal(v) => values.push(v),
                    other => return Err(other),
                }
            }
        }
        Ok(values)
    }

    fn eval_function_expr(
        &mut self,
        f: &FunctionExpr,
        name_hint: Option<&str>,
        env: &EnvRef,
    ) -> Completion {
        let kind = FunctionKind::from_flags(f.is_async, f.is_generator);
        let Some(own_name) = &f.name else {
            return self.create_closure(
                name_hint.map(str::to_string),
                &f.params,
                &f.body,
                env,
                false,
                kind,
            );
        };
        // A named function expression sees its own name.
        let func_env = Environment::new(Some(env.clone()));
        let func = match self.create_closure(
            Some(own_name.clone()),
            &f.params,
            &f.body,
            &func_env,
            false,
            kind,
        ) {
            Completion::Normal(v) => v,
            other => return other,
        };
        {
            let mut e = func_env.borrow_mut();
            e.declare(own_name, BindingKind::Const);
            let _ = e.set(own_name, func.clone());
        }
        Completion::Normal(func)
    }

    fn eval_arrow(
        &mut self,
        arrow: &ArrowFunction,
        name_hint: Option<&str>,
        env: &EnvRef,
    ) -> Completion {
        let body: Rc<[Statement]> = match &arrow.body {
            ArrowBody::Block(stmts) => stmts.clone(),
            ArrowBody::Expression(expr) => Rc::from(vec![Statement::Return(Some((**expr).clone()))]),
        };
        let kind = FunctionKind::from_flags(arrow.is_async, false);
        self.create_closure(
            name_hint.map(str::to_string),
            &arrow.params,
            &body,
            env,
            true,
            kind,
        )
    }

    /// Creates a user function object. Bodies that run on a plan get it built
    /// here, so an unsupported shape fails at definition time.
    pub(crate) fn create_closure(
        &mut self,
        name: Option<String>,
        params: &[Pattern],
        body: &Rc<[Statement]>,
        env: &EnvRef,
        is_arrow: bool,
        kind: FunctionKind,
    ) -> Completion {
        let plan = if kind.uses_plan() {
            let label = name.as_deref().unwrap_or("anonymous");
            match self.plan_for(body, params, label, kind) {
                Ok(plan) => Some(plan),
                Err(e) => {
                    let err = self.create_syntax_error(&e.to_string());
                    return Completion::Throw(err);
                }
            }
        } else {
            None
        };
        Completion::Normal(self.create_function(JsFunction::User {
            name,
            params: params.to_vec(),
            body: body.clone(),
            closure: env.clone(),
            is_arrow,
            kind,
            plan,
        }))
    }

    fn callee_description(expr: &Expression) -> String {
        match expr {
            Expression::Identifier(name) => name.clone(),
            Expression::Member(obj, MemberProperty::Dot(prop)) => {
                format!("{}.{prop}", Self::callee_description(obj))
            }
            Expression::This => "this".to_string(),
            _ => "expression".to_string(),
        }
    }

    fn eval_call(&mut self, callee: &Expression, args: &[Expression], env: &EnvRef) -> Completion {
        let (func, this) = match callee {
            Expression::Member(obj, prop) => {
                let obj_val = match self.eval_expr(obj, env) {
                    Completion::Normal(v) => v,
                    other => return other,
                };
                let key = match self.eval_member_key(prop, env) {
                    Ok(k) => k,
                    Err(abrupt) => return abrupt,
                };
                match self.get_member(&obj_val, &key) {
                    Completion::Normal(f) => (f, obj_val),
                    other => return other,
                }
            }
            other => match self.eval_expr(other, env) {
                Completion::Normal(f) => (f, JsValue::Undefined),
                abrupt => return abrupt,
            },
        };
        let args = match self.eval_args(args, env) {
            Ok(a) => a,
            Err(abrupt) => return abrupt,
        };
        if !self.is_callable(&func) {
            let err = self.create_type_error(&format!(
                "{} is not a function",
                Self::callee_description(callee)
            ));
            return Completion::Throw(err);
        }
        self.call_function(&func, &this, &args)
    }

    fn eval_new(&mut self, callee: &Expression, args: &[Expression], env: &EnvRef) -> Completion {
        let ctor = match self.eval_expr(callee, env) {
            Completion::Normal(v) => v,
            other => return other,
        };
        let args = match self.eval_args(args, env) {
            Ok(a) => a,
            Err(abrupt) => return abrupt,
        };
        let callable = ctor
            .as_object()
            .and_then(|o| self.get_object(o.id))
            .and_then(|obj| obj.borrow().callable.clone());
        match callable {
            // Native constructors build and return their own object.
            Some(JsFunction::Native(..)) => self.call_function(&ctor, &JsValue::Undefined, &args),
            Some(JsFunction::User {
                is_arrow: false,
                kind: FunctionKind::Normal,
                ..
            }) => {
                let proto = self
                    .get_property(&ctor, "prototype")
                    .as_object()
                    .and_then(|p| self.get_object(p.id))
                    .or_else(|| self.object_prototype.clone());
                let this_obj = Self::object_value(&self.create_object_with_proto(proto));
                match self.call_function(&ctor, &this_obj, &args) {
                    Completion::Normal(v) if v.is_object() => Completion::Normal(v),
                    Completion::Normal(_) => Completion::Normal(this_obj),
                    other => other,
                }
            }
            _ => {
                let err = self.create_type_error(&format!(
                    "{} is not a constructor",
                    Self::callee_description(callee)
                ));
                Completion::Throw(err)
            }
        }
    }

    pub(crate) fn call_function(
        &mut self,
        func_val: &JsValue,
        this_val: &JsValue,
        args: &[JsValue],
    ) -> Completion {
        let callable = func_val
            .as_object()
            .and_then(|o| self.get_object(o.id))
            .and_then(|obj| obj.borrow().callable.clone());
        let Some(func) = callable else {
            let err = self.create_type_error(&format!("{} is not a function", self.format_value(func_val)));
            return Completion::Throw(err);
        };
        let (name, params, body, closure, is_arrow, kind, plan) = match func {
            JsFunction::Native(_, _, f) => return f(self, this_val, args),
            JsFunction::User {
                name,
                params,
                body,
                closure,
                is_arrow,
                kind,
                plan,
            } => (name, params, body, closure, is_arrow, kind, plan),
        };

        let func_env = Environment::new(Some(closure));
        if !is_arrow {
            let mut e = func_env.borrow_mut();
            e.declare("this", BindingKind::Var);
            let _ = e.set("this", this_val.clone());
        }
        let bound = self.bind_parameters(&params, args, &func_env);
        if bound.is_abrupt() {
            return bound;
        }
        self.hoist_var_declarations(&body, &func_env);
        let functions = collect_function_declarations(&body);
        if !functions.is_empty() {
            let hoisted = self.instantiate_function_declarations(&functions, &func_env);
            if hoisted.is_abrupt() {
                return hoisted;
            }
        }

        if kind == FunctionKind::Normal {
            return match self.exec_statements(&body, &func_env) {
                Completion::Normal(_) => Completion::Normal(JsValue::Undefined),
                Completion::Return(v) => Completion::Normal(v),
                Completion::Break(_) | Completion::Continue(_) => {
                    let err = self.create_syntax_error("Illegal break or continue statement");
                    Completion::Throw(err)
                }
                other => other,
            };
        }

        let label = name.unwrap_or_else(|| "anonymous".to_string());
        let plan = match plan {
            Some(p) => p,
            None => match self.plan_for(&body, &params, &label, kind) {
                Ok(p) => p,
                Err(e) => {
                    let err = self.create_syntax_error(&e.to_string());
                    return Completion::Throw(err);
                }
            },
        };
        let instance = GeneratorInstance::new(plan, func_env, kind.is_async(), label);
        let generator = Rc::new(RefCell::new(instance));
        match kind {
            FunctionKind::Generator => {
                let fallback = self.generator_prototype.clone();
                let obj = self.create_generator_object(func_val, fallback, "Generator");
                obj.borrow_mut().iterator_state = Some(IteratorState::Generator(generator));
                Completion::Normal(Self::object_value(&obj))
            }
            FunctionKind::AsyncGenerator => {
                let fallback = self.async_generator_prototype.clone();
                let obj = self.create_generator_object(func_val, fallback, "AsyncGenerator");
                let state = Rc::new(RefCell::new(AsyncGeneratorState::new(generator)));
                obj.borrow_mut().iterator_state = Some(IteratorState::AsyncGenerator(state));
                Completion::Normal(Self::object_value(&obj))
            }
            _ => Completion::Normal(self.start_async_function(generator)),
        }
    }

    fn bind_parameters(&mut self, params: &[Pattern], args: &[JsValue], env: &EnvRef) -> Completion {
        for (i, param) in params.iter().enumerate() {
            if let Pattern::Rest(inner) = param {
                let rest = args.get(i..).unwrap_or(&[]).to_vec();
                let rest_arr = self.create_array(rest);
                return self.bind_pattern(inner, rest_arr, env, Some(BindingKind::Let));
            }
            let val = args.get(i).cloned().unwrap_or(JsValue::Undefined);
            let bound = self.bind_pattern(param, val, env, Some(BindingKind::Let));
            if bound.is_abrupt() {
                return bound;
            }
        }
        Completion::Normal(JsValue::Undefined)
    }

    /// The object backing a generator call, inheriting from the function's
    /// own `prototype` when that is an object.
    fn create_generator_object(
        &mut self,
        func_val: &JsValue,
        fallback: Option<Rc<RefCell<JsObjectData>>>,
        class_name: &str,
    ) -> Rc<RefCell<JsObjectData>> {
        let proto = self
            .get_property(func_val, "prototype")
            .as_object()
            .and_then(|p| self.get_object(p.id))
            .or(fallback);
        let obj = self.create_object_with_proto(proto);
        obj.borrow_mut().class_name = class_name.to_string();
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, FunctionExpr, Statement as S};
    use pretty_assertions::assert_eq;

    fn eval_global(program: Vec<S>, name: &str) -> (Interpreter, JsValue) {
        let mut interp = Interpreter::new();
        match interp.run(&program) {
            Completion::Normal(_) => {}
            other => panic!("program failed: {other:?}"),
        }
        let val = interp.get_global(name).unwrap_or(JsValue::Undefined);
        (interp, val)
    }

    fn thrown(program: Vec<S>) -> (Interpreter, JsValue) {
        let mut interp = Interpreter::new();
        match interp.run(&program) {
            Completion::Throw(e) => (interp, e),
            other => panic!("expected a throw, got {other:?}"),
        }
    }

    #[test]
    fn string_concatenation_and_arithmetic() {
        let (_, v) = eval_global(
            vec![S::const_(
                "s",
                E::binary(
                    BinaryOp::Add,
                    E::string("n="),
                    E::binary(BinaryOp::Mul, E::num(6.0), E::num(7.0)),
                ),
            )],
            "s",
        );
        assert_eq!(v, JsValue::from_str("n=42"));
    }

    #[test]
    fn undefined_identifier_is_a_reference_error() {
        let (interp, err) = thrown(vec![S::expr(E::ident("missing"))]);
        assert_eq!(interp.format_value(&err), "ReferenceError: missing is not defined");
    }

    #[test]
    fn calling_a_non_function_names_the_callee() {
        let (interp, err) = thrown(vec![
            S::const_("o", E::object(vec![("x", E::num(1.0))])),
            S::expr(E::method_call(E::ident("o"), "x", vec![])),
        ]);
        assert_eq!(interp.format_value(&err), "TypeError: o.x is not a function");
    }

    #[test]
    fn closures_capture_their_environment() {
        let (_, v) = eval_global(
            vec![
                S::const_(
                    "counter",
                    E::function(FunctionExpr::plain(
                        &[],
                        vec![
                            S::let_("n", E::num(0.0)),
                            S::return_(Some(E::arrow(&[], E::postfix_increment(E::ident("n"))))),
                        ],
                    )),
                ),
                S::const_("next", E::call(E::ident("counter"), vec![])),
                S::expr(E::call(E::ident("next"), vec![])),
                S::const_("second", E::call(E::ident("next"), vec![])),
            ],
            "second",
        );
        assert_eq!(v, JsValue::Number(1.0));
    }

    #[test]
    fn new_links_the_prototype() {
        let (_, v) = eval_global(
            vec![
                S::FunctionDeclaration(FunctionDecl {
                    name: "Point".to_string(),
                    params: vec![Pattern::ident("x")],
                    body: Rc::from(vec![S::expr(E::assign(
                        E::member(E::This, "x"),
                        E::ident("x"),
                    ))]),
                    is_async: false,
                    is_generator: false,
                }),
                S::const_("p", E::New(Box::new(E::ident("Point")), vec![E::num(3.0)])),
                S::const_(
                    "ok",
                    E::logical(
                        LogicalOp::And,
                        E::binary(BinaryOp::Instanceof, E::ident("p"), E::ident("Point")),
                        E::binary(BinaryOp::StrictEq, E::member(E::ident("p"), "x"), E::num(3.0)),
                    ),
                ),
            ],
            "ok",
        );
        assert_eq!(v, JsValue::Boolean(true));
    }

    #[test]
    fn typeof_tolerates_undeclared_names() {
        let (_, v) = eval_global(
            vec![S::const_("t", E::Typeof(Box::new(E::ident("nowhere"))))],
            "t",
        );
        assert_eq!(v, JsValue::from_str("undefined"));
    }

    #[test]
    fn spread_arguments_expand_iterables() {
        let (interp, v) = eval_global(
            vec![
                S::const_("a", E::array(vec![E::num(1.0)])),
                S::expr(E::method_call(
                    E::ident("a"),
                    "push",
                    vec![E::Spread(Box::new(E::array(vec![E::num(2.0), E::num(3.0)])))],
                )),
            ],
            "a",
        );
        assert_eq!(interp.format_value(&v), "[1, 2, 3]");
    }

    #[test]
    fn unsupported_generator_shape_fails_at_definition() {
        let (interp, err) = thrown(vec![S::const_(
            "g",
            E::function(FunctionExpr::generator(
                &[],
                vec![S::expr(E::binary(
                    BinaryOp::Add,
                    E::yield_(E::num(1.0)),
                    E::yield_(E::num(2.0)),
                ))],
            )),
        )]);
        assert!(
            interp
                .format_value(&err)
                .starts_with("SyntaxError: unsupported generator shape")
        );
        assert_eq!(interp.diagnostics().failures.len(), 1);
    }

    #[test]
    fn generator_objects_inherit_from_the_function_prototype() {
        let (interp, v) = eval_global(
            vec![
                S::const_("g", E::function(FunctionExpr::generator(&[], vec![]))),
                S::const_("it", E::call(E::ident("g"), vec![])),
                S::const_(
                    "ok",
                    E::binary(BinaryOp::Instanceof, E::ident("it"), E::ident("g")),
                ),
            ],
            "ok",
        );
        assert_eq!(v, JsValue::Boolean(true));
        let it = interp.get_global("it").unwrap();
        assert_eq!(
            interp.generator_state(&it),
            Some(GeneratorState::SuspendedStart)
        );
    }
}
