use crate::ast::*;
use crate::types::{JsObject, JsString, JsSymbol, JsValue, WellKnownSymbol};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

mod types;
pub use types::*;

mod helpers;
pub(crate) use helpers::*;
mod exec;
mod eval;
pub(crate) mod builtins;

mod generator_analysis;
pub mod generator_lowering;
pub mod generator_plan;
pub mod generator_builder;
pub mod generator_instance;
mod generator_delegate;
pub mod generator_diagnostics;
pub mod async_generator;

pub use builtins::promise::PromiseStatus;
pub use generator_diagnostics::{PlanDiagnostics, PlanFailure};
pub use generator_instance::{GeneratorOutcome, GeneratorState, IteratorStep, ResumeAction};
pub use generator_plan::{GeneratorPlan, Instruction};

pub(crate) type Job = Box<dyn FnOnce(&mut Interpreter)>;

pub(crate) struct CachedPlan {
    // Held so the body allocation, and with it the cache key, stays unique.
    pub(crate) body: Rc<[Statement]>,
    pub(crate) name: String,
    pub(crate) plan: Rc<GeneratorPlan>,
}

pub struct Interpreter {
    global_env: EnvRef,
    objects: Vec<Option<Rc<RefCell<JsObjectData>>>>,
    object_prototype: Option<Rc<RefCell<JsObjectData>>>,
    array_prototype: Option<Rc<RefCell<JsObjectData>>>,
    iterator_prototype: Option<Rc<RefCell<JsObjectData>>>,
    async_iterator_prototype: Option<Rc<RefCell<JsObjectData>>>,
    array_iterator_prototype: Option<Rc<RefCell<JsObjectData>>>,
    generator_prototype: Option<Rc<RefCell<JsObjectData>>>,
    async_generator_prototype: Option<Rc<RefCell<JsObjectData>>>,
    promise_prototype: Option<Rc<RefCell<JsObjectData>>>,
    error_prototypes: FxHashMap<String, Rc<RefCell<JsObjectData>>>,
    /// Object ids of the intrinsic generator `next`/`throw`/`return`.
    generator_methods: Vec<u64>,
    next_symbol_id: u64,
    plan_cache: FxHashMap<usize, CachedPlan>,
    diagnostics: PlanDiagnostics,
    jobs: VecDeque<Job>,
    console: Vec<String>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        let global = Environment::new(None);

        {
            let mut env = global.borrow_mut();
            for (name, value) in [
                ("undefined", JsValue::Undefined),
                ("NaN", JsValue::Number(f64::NAN)),
                ("Infinity", JsValue::Number(f64::INFINITY)),
                ("this", JsValue::Undefined),
            ] {
                env.bindings.insert(
                    name.to_string(),
                    Binding {
                        value,
                        kind: BindingKind::Const,
                        initialized: true,
                    },
                );
            }
        }

        let mut interp = Self {
            global_env: global,
            objects: Vec::new(),
            object_prototype: None,
            array_prototype: None,
            iterator_prototype: None,
            async_iterator_prototype: None,
            array_iterator_prototype: None,
            generator_prototype: None,
            async_generator_prototype: None,
            promise_prototype: None,
            error_prototypes: FxHashMap::default(),
            generator_methods: Vec::new(),
            next_symbol_id: 1,
            plan_cache: FxHashMap::default(),
            diagnostics: PlanDiagnostics::default(),
            jobs: VecDeque::new(),
            console: Vec::new(),
        };
        interp.setup_globals();
        interp
    }

    fn register_global(&mut self, name: &str, kind: BindingKind, val: JsValue) {
        self.global_env.borrow_mut().declare(name, kind);
        let _ = self.global_env.borrow_mut().set(name, val);
    }

    fn allocate_object_slot(&mut self, obj: Rc<RefCell<JsObjectData>>) -> u64 {
        let id = self.objects.len() as u64;
        obj.borrow_mut().id = Some(id);
        self.objects.push(Some(obj));
        id
    }

    fn create_object(&mut self) -> Rc<RefCell<JsObjectData>> {
        let proto = self.object_prototype.clone();
        self.create_object_with_proto(proto)
    }

    fn create_object_with_proto(
        &mut self,
        prototype: Option<Rc<RefCell<JsObjectData>>>,
    ) -> Rc<RefCell<JsObjectData>> {
        let mut data = JsObjectData::new();
        data.prototype = prototype;
        let obj = Rc::new(RefCell::new(data));
        self.allocate_object_slot(obj.clone());
        obj
    }

    fn object_value(obj: &Rc<RefCell<JsObjectData>>) -> JsValue {
        let id = obj.borrow().id.unwrap_or_default();
        JsValue::Object(JsObject { id })
    }

    fn create_function(&mut self, func: JsFunction) -> JsValue {
        let (fn_name, fn_length, kind, is_arrow) = match &func {
            JsFunction::User {
                name,
                params,
                kind,
                is_arrow,
                ..
            } => {
                let len = params
                    .iter()
                    .filter(|p| !matches!(p, Pattern::Rest(_)))
                    .count();
                (name.clone().unwrap_or_default(), len, *kind, *is_arrow)
            }
            JsFunction::Native(name, arity, _) => {
                (name.clone(), *arity, FunctionKind::Normal, true)
            }
        };
        let mut obj_data = JsObjectData::new();
        obj_data.prototype = self.object_prototype.clone();
        obj_data.callable = Some(func);
        obj_data.class_name = match kind {
            FunctionKind::Normal => "Function",
            FunctionKind::Generator => "GeneratorFunction",
            FunctionKind::Async => "AsyncFunction",
            FunctionKind::AsyncGenerator => "AsyncGeneratorFunction",
        }
        .to_string();
        obj_data.insert_property(
            "length".to_string(),
            PropertyDescriptor::data(JsValue::Number(fn_length as f64), false, false),
        );
        obj_data.insert_property(
            "name".to_string(),
            PropertyDescriptor::data(JsValue::String(JsString::from_str(&fn_name)), false, false),
        );
        // Constructors and generator functions get a prototype object
        if !is_arrow && kind != FunctionKind::Async {
            let proto_parent = match kind {
                FunctionKind::Generator => self.generator_prototype.clone(),
                FunctionKind::AsyncGenerator => self.async_generator_prototype.clone(),
                _ => self.object_prototype.clone(),
            };
            let proto = self.create_object_with_proto(proto_parent);
            obj_data.insert_property(
                "prototype".to_string(),
                PropertyDescriptor::data(Self::object_value(&proto), true, false),
            );
        }
        let obj = Rc::new(RefCell::new(obj_data));
        let func_id = self.allocate_object_slot(obj.clone());
        let func_val = JsValue::Object(JsObject { id: func_id });
        if kind == FunctionKind::Normal
            && !is_arrow
            && let JsValue::Object(proto_ref) = obj.borrow().get_property("prototype")
            && let Some(proto_obj) = self.get_object(proto_ref.id)
        {
            proto_obj
                .borrow_mut()
                .insert_builtin("constructor".to_string(), func_val.clone());
        }
        func_val
    }

    fn get_object(&self, id: u64) -> Option<Rc<RefCell<JsObjectData>>> {
        self.objects.get(id as usize).and_then(|slot| slot.clone())
    }

    pub(crate) fn is_callable(&self, val: &JsValue) -> bool {
        matches!(val, JsValue::Object(o)
            if self.get_object(o.id).is_some_and(|obj| obj.borrow().callable.is_some()))
    }

    fn create_symbol(&mut self, description: Option<&str>) -> JsValue {
        let id = self.next_symbol_id;
        self.next_symbol_id += 1;
        JsValue::Symbol(JsSymbol {
            id,
            description: description.map(JsString::from_str),
        })
    }

    fn create_error(&mut self, kind: &str, msg: &str) -> JsValue {
        let proto = self
            .error_prototypes
            .get(kind)
            .cloned()
            .or_else(|| self.object_prototype.clone());
        let obj = self.create_object_with_proto(proto);
        {
            let mut o = obj.borrow_mut();
            o.class_name = "Error".to_string();
            o.insert_builtin("message".to_string(), JsValue::from_str(msg));
        }
        Self::object_value(&obj)
    }

    pub(crate) fn create_type_error(&mut self, msg: &str) -> JsValue {
        self.create_error("TypeError", msg)
    }

    pub(crate) fn create_syntax_error(&mut self, msg: &str) -> JsValue {
        self.create_error("SyntaxError", msg)
    }

    pub(crate) fn create_reference_error(&mut self, msg: &str) -> JsValue {
        self.create_error("ReferenceError", msg)
    }

    /// Hoists and runs a program in the global scope, then drains the job queue.
    pub fn run(&mut self, program: &[Statement]) -> Completion {
        let global = self.global_env.clone();
        self.hoist_var_declarations(program, &global);
        let functions = generator_analysis::collect_function_declarations(program);
        let hoisted = self.instantiate_function_declarations(&functions, &global);
        if hoisted.is_abrupt() {
            return hoisted;
        }
        let result = self.exec_statements(program, &global);
        self.run_jobs();
        result
    }

    pub fn get_global(&self, name: &str) -> Option<JsValue> {
        self.global_env.borrow().get(name)
    }

    /// Property read for embedders inspecting results.
    pub fn get_property(&self, target: &JsValue, key: &str) -> JsValue {
        match target {
            JsValue::Object(o) => self
                .get_object(o.id)
                .map(|obj| obj.borrow().get_property(key))
                .unwrap_or(JsValue::Undefined),
            _ => JsValue::Undefined,
        }
    }

    pub fn console_output(&self) -> &[String] {
        &self.console
    }

    pub fn diagnostics(&self) -> &PlanDiagnostics {
        &self.diagnostics
    }

    /// Every plan built so far, with the function name it was built for.
    pub fn plans(&self) -> Vec<(String, Rc<GeneratorPlan>)> {
        let mut plans: Vec<_> = self
            .plan_cache
            .values()
            .map(|c| (c.name.clone(), c.plan.clone()))
            .collect();
        plans.sort_by(|a, b| a.0.cmp(&b.0));
        plans
    }

    pub(crate) fn well_known_symbol(&self, which: WellKnownSymbol) -> JsValue {
        // Reserved ids at the top of the range; user symbols count up from 1.
        let id = match which {
            WellKnownSymbol::Iterator => u64::MAX,
            WellKnownSymbol::AsyncIterator => u64::MAX - 1,
            WellKnownSymbol::ToStringTag => u64::MAX - 2,
        };
        JsValue::Symbol(JsSymbol {
            id,
            description: Some(JsString::from_str(which.description())),
        })
    }

    pub fn format_value(&self, val: &JsValue) -> String {
        match val {
            JsValue::Object(o) => {
                if let Some(obj) = self.get_object(o.id) {
                    let obj = obj.borrow();
                    if let Some(elems) = &obj.array_elements {
                        let parts: Vec<String> =
                            elems.iter().map(|e| self.format_value(e)).collect();
                        return format!("[{}]", parts.join(", "));
                    }
                    if obj.promise.is_some() {
                        return "[object Promise]".to_string();
                    }
                    let name = obj.get_property("name");
                    let message = obj.get_property("message");
                    if let JsValue::String(ref msg) = message {
                        let msg_str = msg.to_rust_string();
                        if let JsValue::String(ref n) = name {
                            let n_str = n.to_rust_string();
                            if n_str.is_empty() {
                                return msg_str;
                            }
                            return format!("{n_str}: {msg_str}");
                        }
                        return msg_str;
                    }
                }
                format!("{val}")
            }
            _ => format!("{val}"),
        }
    }
}
