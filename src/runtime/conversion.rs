//! Conversion between V8 values and [`JSValue`].

use crate::error::{Error, Result};
use crate::runtime::js_value::{JSValue, LimitTracker};
use deno_core::v8;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// Script function kept alive for the host, with its `this` binding.
pub(crate) struct StoredFunction {
    pub function: v8::Global<v8::Function>,
    pub receiver: Option<v8::Global<v8::Value>>,
}

/// Per-interpreter table backing `JSValue::Function` handles.
#[derive(Default)]
pub(crate) struct FunctionRegistry {
    functions: HashMap<u32, StoredFunction>,
    next_id: u32,
}

impl FunctionRegistry {
    pub fn register(
        &mut self,
        function: v8::Global<v8::Function>,
        receiver: Option<v8::Global<v8::Value>>,
    ) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.functions
            .insert(id, StoredFunction { function, receiver });
        id
    }

    pub fn get(&self, id: u32) -> Result<&StoredFunction> {
        self.functions
            .get(&id)
            .ok_or_else(|| Error::conversion(format!("function handle {id} not found")))
    }

    pub fn release(&mut self, id: u32) -> Result<()> {
        self.functions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::conversion(format!("function handle {id} not found")))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn clear(&mut self) {
        self.functions.clear();
    }
}

/// Read a V8 value into a [`JSValue`], registering any functions found.
pub(crate) fn to_js_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    registry: &mut FunctionRegistry,
    value: v8::Local<'s, v8::Value>,
) -> Result<JSValue> {
    let mut reader = ValueReader {
        registry: Some(registry),
        seen: HashSet::new(),
        tracker: LimitTracker::default(),
    };
    reader.read(scope, value, None)
}

/// Read a V8 value into a [`JSValue`] without creating function handles.
/// Functions anywhere in the value are a conversion error.
pub(crate) fn to_plain_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<JSValue> {
    let mut reader = ValueReader {
        registry: None,
        seen: HashSet::new(),
        tracker: LimitTracker::default(),
    };
    reader.read(scope, value, None)
}

struct ValueReader<'r> {
    // `None` when functions must not be registered.
    registry: Option<&'r mut FunctionRegistry>,
    seen: HashSet<i32>,
    tracker: LimitTracker,
}

impl ValueReader<'_> {
    fn read<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        receiver: Option<v8::Global<v8::Value>>,
    ) -> Result<JSValue> {
        self.tracker.enter()?;
        let result = self.read_inner(scope, value, receiver);
        self.tracker.exit();
        result
    }

    fn read_inner<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        receiver: Option<v8::Global<v8::Value>>,
    ) -> Result<JSValue> {
        if value.is_null_or_undefined() {
            self.tracker.add_bytes(4)?;
            return Ok(JSValue::Null);
        }
        if value.is_boolean() {
            self.tracker.add_bytes(5)?;
            return Ok(JSValue::Bool(value.boolean_value(scope)));
        }
        if value.is_number() {
            let number = value
                .number_value(scope)
                .ok_or_else(|| Error::conversion("failed to read number"))?;
            self.tracker.add_bytes(24)?;
            return Ok(number_to_js_value(number));
        }
        if value.is_string() {
            let text = value.to_rust_string_lossy(scope);
            self.tracker.add_bytes(text.len())?;
            return Ok(JSValue::String(text));
        }
        if value.is_big_int() {
            let bigint = v8::Local::<v8::BigInt>::try_from(value)
                .map_err(|_| Error::conversion("failed to cast to BigInt"))?;
            let (int, lossless) = bigint.i64_value();
            if !lossless {
                return Err(Error::conversion("BigInt value too large for i64"));
            }
            self.tracker.add_bytes(20)?;
            return Ok(JSValue::Int(int));
        }
        if value.is_function() {
            let Some(registry) = self.registry.as_deref_mut() else {
                return Err(Error::conversion("cannot convert a function to a plain value"));
            };
            let function = v8::Local::<v8::Function>::try_from(value)
                .map_err(|_| Error::conversion("failed to cast to function"))?;
            let global = v8::Global::new(scope, function);
            let id = registry.register(global, receiver);
            self.tracker.add_bytes(8)?;
            return Ok(JSValue::Function { id });
        }
        if value.is_symbol() {
            return Err(Error::conversion("cannot convert a symbol"));
        }
        if value.is_object() {
            let object = v8::Local::<v8::Object>::try_from(value)
                .map_err(|_| Error::conversion("failed to cast to object"))?;
            let hash = object.get_identity_hash().get();
            if !self.seen.insert(hash) {
                return Err(Error::conversion("cannot convert circular reference"));
            }
            let converted = if value.is_array() {
                self.read_array(scope, value)
            } else {
                self.read_object(scope, object)
            };
            self.seen.remove(&hash);
            return converted;
        }

        let text = value.to_rust_string_lossy(scope);
        self.tracker.add_bytes(text.len())?;
        Ok(JSValue::String(text))
    }

    fn read_array<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<JSValue> {
        let array = v8::Local::<v8::Array>::try_from(value)
            .map_err(|_| Error::conversion("failed to cast to array"))?;
        let len = array.length();
        let mut items = Vec::with_capacity(len as usize);
        for index in 0..len {
            let item = array
                .get_index(scope, index)
                .ok_or_else(|| Error::conversion(format!("failed to read array index {index}")))?;
            items.push(self.read(scope, item, None)?);
        }
        Ok(JSValue::Array(items))
    }

    fn read_object<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
    ) -> Result<JSValue> {
        let names = object
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| Error::conversion("failed to list object properties"))?;

        let mut map = IndexMap::new();
        for index in 0..names.length() {
            let key = names
                .get_index(scope, index)
                .ok_or_else(|| Error::conversion("failed to read property name"))?;
            let key_str = key.to_rust_string_lossy(scope);
            let item = object
                .get(scope, key)
                .ok_or_else(|| Error::conversion(format!("failed to read property '{key_str}'")))?;

            // Methods keep their owner as `this`.
            let receiver = (item.is_function() && self.registry.is_some()).then(|| {
                let owner: v8::Local<v8::Value> = object.into();
                v8::Global::new(scope, owner)
            });

            self.tracker.add_bytes(key_str.len())?;
            let converted = self.read(scope, item, receiver)?;
            map.insert(key_str, converted);
        }
        Ok(JSValue::Object(map))
    }
}

fn number_to_js_value(number: f64) -> JSValue {
    if number.is_finite() && number.fract() == 0.0 {
        let int = number as i64;
        if int as f64 == number {
            return JSValue::Int(int);
        }
    }
    JSValue::Float(number)
}

/// Build a V8 value from a [`JSValue`], resolving function handles.
pub(crate) fn to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    registry: &FunctionRegistry,
    value: &JSValue,
) -> Result<v8::Local<'s, v8::Value>> {
    Ok(match value {
        JSValue::Null => v8::null(scope).into(),
        JSValue::Bool(b) => v8::Boolean::new(scope, *b).into(),
        JSValue::Int(i) => v8::Number::new(scope, *i as f64).into(),
        JSValue::Float(f) => v8::Number::new(scope, *f).into(),
        JSValue::String(s) => new_string(scope, s)?.into(),
        JSValue::Array(items) => {
            let elements = items
                .iter()
                .map(|item| to_v8(scope, registry, item))
                .collect::<Result<Vec<_>>>()?;
            v8::Array::new_with_elements(scope, &elements).into()
        }
        JSValue::Object(map) => {
            let object = v8::Object::new(scope);
            for (key, item) in map {
                let key = new_string(scope, key)?;
                let item = to_v8(scope, registry, item)?;
                object
                    .set(scope, key.into(), item)
                    .ok_or_else(|| Error::conversion("failed to set object property"))?;
            }
            object.into()
        }
        JSValue::Function { id } => {
            let stored = registry.get(*id)?;
            v8::Local::new(scope, &stored.function).into()
        }
    })
}

pub(crate) fn new_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    text: &str,
) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, text)
        .ok_or_else(|| Error::conversion("string too long for the interpreter"))
}
