use super::async_generator::AsyncGeneratorRef;
use super::builtins::promise::PromiseData;
use super::generator_instance::GeneratorRef;
use super::generator_plan::GeneratorPlan;
use crate::ast::*;
use crate::error::RuntimeError;
use crate::types::{JsString, JsValue};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug)]
pub enum Completion {
    Normal(JsValue),
    Return(JsValue),
    Throw(JsValue),
    Break(Option<String>),
    Continue(Option<String>),
    /// Runtime-level failure; skips every `catch` and `finally`.
    Fatal(RuntimeError),
}

impl Completion {
    pub(crate) fn is_abrupt(&self) -> bool {
        !matches!(self, Completion::Normal(_))
    }
}

pub type EnvRef = Rc<RefCell<Environment>>;

#[derive(Debug)]
pub struct Environment {
    pub(crate) bindings: FxHashMap<String, Binding>,
    pub(crate) parent: Option<EnvRef>,
}

#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub(crate) value: JsValue,
    pub(crate) kind: BindingKind,
    pub(crate) initialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BindingKind {
    Var,
    Let,
    Const,
}

impl From<VarKind> for BindingKind {
    fn from(kind: VarKind) -> Self {
        match kind {
            VarKind::Var => BindingKind::Var,
            VarKind::Let => BindingKind::Let,
            VarKind::Const => BindingKind::Const,
        }
    }
}

impl Environment {
    pub fn new(parent: Option<EnvRef>) -> EnvRef {
        Rc::new(RefCell::new(Environment {
            bindings: FxHashMap::default(),
            parent,
        }))
    }

    /// A sibling of `env` holding a snapshot of its bindings. Closures that
    /// captured `env` keep seeing the old values.
    pub fn copy_of(env: &EnvRef) -> EnvRef {
        let src = env.borrow();
        Rc::new(RefCell::new(Environment {
            bindings: src.bindings.clone(),
            parent: src.parent.clone(),
        }))
    }

    pub(crate) fn declare(&mut self, name: &str, kind: BindingKind) {
        if kind == BindingKind::Var && self.bindings.contains_key(name) {
            return;
        }
        self.bindings.insert(
            name.to_string(),
            Binding {
                value: JsValue::Undefined,
                kind,
                initialized: kind == BindingKind::Var,
            },
        );
    }

    pub fn set(&mut self, name: &str, value: JsValue) -> Result<(), JsValue> {
        if let Some(binding) = self.bindings.get_mut(name) {
            if binding.kind == BindingKind::Const && binding.initialized {
                return Err(JsValue::String(JsString::from_str(
                    "Assignment to constant variable.",
                )));
            }
            binding.value = value;
            binding.initialized = true;
            Ok(())
        } else if let Some(parent) = &self.parent {
            parent.borrow_mut().set(name, value)
        } else {
            // Global implicit declaration (sloppy mode)
            self.bindings.insert(
                name.to_string(),
                Binding {
                    value,
                    kind: BindingKind::Var,
                    initialized: true,
                },
            );
            Ok(())
        }
    }

    pub fn get(&self, name: &str) -> Option<JsValue> {
        if let Some(binding) = self.bindings.get(name) {
            if !binding.initialized {
                return None; // TDZ
            }
            Some(binding.value.clone())
        } else if let Some(parent) = &self.parent {
            parent.borrow().get(name)
        } else {
            None
        }
    }

    pub fn has(&self, name: &str) -> bool {
        if self.bindings.contains_key(name) {
            true
        } else if let Some(parent) = &self.parent {
            parent.borrow().has(name)
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Normal,
    Generator,
    Async,
    AsyncGenerator,
}

impl FunctionKind {
    pub fn from_flags(is_async: bool, is_generator: bool) -> Self {
        match (is_async, is_generator) {
            (false, false) => FunctionKind::Normal,
            (false, true) => FunctionKind::Generator,
            (true, false) => FunctionKind::Async,
            (true, true) => FunctionKind::AsyncGenerator,
        }
    }

    pub fn is_async(self) -> bool {
        matches!(self, FunctionKind::Async | FunctionKind::AsyncGenerator)
    }

    pub fn is_generator(self) -> bool {
        matches!(self, FunctionKind::Generator | FunctionKind::AsyncGenerator)
    }

    /// Bodies of these kinds run on a plan instead of the tree evaluator.
    pub fn uses_plan(self) -> bool {
        self != FunctionKind::Normal
    }
}

pub type NativeFn = Rc<dyn Fn(&mut super::Interpreter, &JsValue, &[JsValue]) -> Completion>;

#[derive(Clone)]
pub enum JsFunction {
    User {
        name: Option<String>,
        params: Vec<Pattern>,
        body: Rc<[Statement]>,
        closure: EnvRef,
        is_arrow: bool,
        kind: FunctionKind,
        plan: Option<Rc<GeneratorPlan>>,
    },
    Native(String, usize, NativeFn),
}

impl JsFunction {
    pub fn native(
        name: String,
        arity: usize,
        f: impl Fn(&mut super::Interpreter, &JsValue, &[JsValue]) -> Completion + 'static,
    ) -> Self {
        JsFunction::Native(name, arity, Rc::new(f))
    }
}

impl std::fmt::Debug for JsFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsFunction::User { name, kind, .. } => {
                write!(f, "JsFunction::User({name:?}, {kind:?})")
            }
            JsFunction::Native(name, arity, _) => {
                write!(f, "JsFunction::Native({name:?}, {arity})")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub value: JsValue,
    pub writable: bool,
    pub enumerable: bool,
}

impl PropertyDescriptor {
    pub fn data(value: JsValue, writable: bool, enumerable: bool) -> Self {
        Self {
            value,
            writable,
            enumerable,
        }
    }

    pub fn data_default(value: JsValue) -> Self {
        Self::data(value, true, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IteratorKind {
    Key,
    Value,
}

#[derive(Debug, Clone)]
pub enum IteratorState {
    ArrayIterator {
        array_id: u64,
        index: usize,
        kind: IteratorKind,
        done: bool,
    },
    Generator(GeneratorRef),
    AsyncGenerator(AsyncGeneratorRef),
}

pub struct JsObjectData {
    pub id: Option<u64>,
    pub properties: FxHashMap<String, PropertyDescriptor>,
    pub property_order: Vec<String>,
    pub prototype: Option<Rc<RefCell<JsObjectData>>>,
    pub callable: Option<JsFunction>,
    pub array_elements: Option<Vec<JsValue>>,
    pub class_name: String,
    pub iterator_state: Option<IteratorState>,
    pub promise: Option<PromiseData>,
}

impl JsObjectData {
    pub(crate) fn new() -> Self {
        Self {
            id: None,
            properties: FxHashMap::default(),
            property_order: Vec::new(),
            prototype: None,
            callable: None,
            array_elements: None,
            class_name: "Object".to_string(),
            iterator_state: None,
            promise: None,
        }
    }

    pub fn get_property(&self, key: &str) -> JsValue {
        if let Some(desc) = self.properties.get(key) {
            return desc.value.clone();
        }
        if let Some(ref elems) = self.array_elements {
            if key == "length" {
                return JsValue::Number(elems.len() as f64);
            }
            if let Ok(idx) = key.parse::<usize>()
                && idx < elems.len()
            {
                return elems[idx].clone();
            }
        }
        if let Some(proto) = &self.prototype {
            return proto.borrow().get_property(key);
        }
        JsValue::Undefined
    }

    pub fn has_own_property(&self, key: &str) -> bool {
        if self.properties.contains_key(key) {
            return true;
        }
        if let Some(ref elems) = self.array_elements {
            return key == "length"
                || key.parse::<usize>().is_ok_and(|idx| idx < elems.len());
        }
        false
    }

    pub fn has_property(&self, key: &str) -> bool {
        if self.has_own_property(key) {
            return true;
        }
        if let Some(proto) = &self.prototype {
            return proto.borrow().has_property(key);
        }
        false
    }

    pub fn enumerable_keys_with_proto(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut keys = Vec::new();
        if let Some(ref elems) = self.array_elements {
            for idx in 0..elems.len() {
                let k = idx.to_string();
                seen.insert(k.clone());
                keys.push(k);
            }
        }
        // Own enumerable properties (in insertion order)
        for k in &self.property_order {
            if let Some(desc) = self.properties.get(k)
                && desc.enumerable
                && !k.starts_with("Symbol(")
                && seen.insert(k.clone())
            {
                keys.push(k.clone());
            }
        }
        // Prototype chain
        if let Some(ref proto) = self.prototype {
            for k in proto.borrow().enumerable_keys_with_proto() {
                if seen.insert(k.clone()) {
                    keys.push(k);
                }
            }
        }
        keys
    }

    pub fn set_property_value(&mut self, key: &str, value: JsValue) {
        if let Some(ref mut elems) = self.array_elements
            && let Ok(idx) = key.parse::<usize>()
        {
            if idx >= elems.len() {
                elems.resize(idx + 1, JsValue::Undefined);
            }
            elems[idx] = value;
            return;
        }
        if let Some(desc) = self.properties.get_mut(key) {
            if desc.writable {
                desc.value = value;
            }
        } else {
            self.insert_value(key.to_string(), value);
        }
    }

    pub fn insert_value(&mut self, key: String, value: JsValue) {
        self.insert_property(key, PropertyDescriptor::data_default(value));
    }

    pub fn insert_builtin(&mut self, key: String, value: JsValue) {
        self.insert_property(key, PropertyDescriptor::data(value, true, false));
    }

    pub fn insert_property(&mut self, key: String, desc: PropertyDescriptor) {
        if !self.properties.contains_key(&key) {
            self.property_order.push(key.clone());
        }
        self.properties.insert(key, desc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_bindings_reject_reassignment() {
        let env = Environment::new(None);
        env.borrow_mut().declare("x", BindingKind::Const);
        assert!(env.borrow().get("x").is_none());
        assert!(env.borrow_mut().set("x", JsValue::Number(1.0)).is_ok());
        assert!(env.borrow_mut().set("x", JsValue::Number(2.0)).is_err());
        assert_eq!(env.borrow().get("x").and_then(|v| v.as_number()), Some(1.0));
    }

    #[test]
    fn copied_environment_is_detached() {
        let outer = Environment::new(None);
        let env = Environment::new(Some(outer.clone()));
        env.borrow_mut().declare("i", BindingKind::Let);
        env.borrow_mut().set("i", JsValue::Number(0.0)).ok();
        let copy = Environment::copy_of(&env);
        copy.borrow_mut().set("i", JsValue::Number(1.0)).ok();
        assert_eq!(env.borrow().get("i").and_then(|v| v.as_number()), Some(0.0));
        assert_eq!(copy.borrow().get("i").and_then(|v| v.as_number()), Some(1.0));
        assert!(copy.borrow().parent.as_ref().is_some_and(|p| Rc::ptr_eq(p, &outer)));
    }

    #[test]
    fn array_elements_read_through_properties() {
        let mut obj = JsObjectData::new();
        obj.array_elements = Some(vec![JsValue::Number(1.0), JsValue::Number(2.0)]);
        assert_eq!(obj.get_property("length").as_number(), Some(2.0));
        assert_eq!(obj.get_property("1").as_number(), Some(2.0));
        obj.set_property_value("3", JsValue::Number(4.0));
        assert_eq!(obj.get_property("length").as_number(), Some(4.0));
        assert_eq!(obj.enumerable_keys_with_proto(), vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn function_kind_flags() {
        assert_eq!(FunctionKind::from_flags(true, true), FunctionKind::AsyncGenerator);
        assert!(FunctionKind::from_flags(false, true).is_generator());
        assert!(!FunctionKind::Normal.uses_plan());
        assert!(FunctionKind::Async.uses_plan());
    }
}
