//! The interpreter owned by a cell thread.
//!
//! `Interpreter` wraps a `deno_core::JsRuntime` and is the only code that
//! touches V8. Exclusive access is guaranteed by ownership: it lives on the
//! cell thread and every method takes `&mut self`. Host threads reach it
//! through [`crate::runtime::Cell`]; ops reach the rest of the cell through
//! the op state while a call is already in progress.
//!
//! deno_core's own event loop is never polled. After every host entry the
//! microtask queue is checkpointed so native `async` functions keep moving.

use crate::error::{Error, Result};
use crate::runtime::config::CellConfig;
use crate::runtime::conversion::{new_string, to_js_value, to_plain_value, to_v8, FunctionRegistry};
use crate::runtime::event_loop::{DispatchKind, ScriptHost, TaskId, TaskLoop};
use crate::runtime::js_value::JSValue;
use crate::runtime::ops::cell_extension;
use crate::runtime::services::CellServices;
use deno_core::{serde_v8, v8, JsRuntime, RuntimeOptions};
use std::collections::HashMap;
use std::sync::Arc;

/// Handle to a script compiled with [`Interpreter::compile`].
pub type ScriptId = u32;

/// How a completion value is handed back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultMode {
    /// Full conversion; functions become [`JSValue::Function`] handles.
    #[default]
    Handles,
    /// Plain data only. Functions are an error and no handle is created.
    Values,
    /// The value is dropped unconverted and `JSValue::Null` is returned.
    Discard,
}

const GLUE: &[(&str, &str)] = &[
    ("jailcell:internals.js", include_str!("js/00_internals.js")),
    ("jailcell:console.js", include_str!("js/01_console.js")),
    ("jailcell:timers.js", include_str!("js/02_timers.js")),
    ("jailcell:promise.js", include_str!("js/03_promise.js")),
    ("jailcell:fetch.js", include_str!("js/04_fetch.js")),
    ("jailcell:jeth.js", include_str!("js/05_jeth.js")),
];
const DISPATCH: &str = include_str!("js/99_dispatch.js");

struct CompiledScript {
    name: String,
    script: v8::Global<v8::Script>,
}

pub struct Interpreter {
    // V8 handles are declared before the runtime so they drop first.
    dispatcher: v8::Global<v8::Function>,
    functions: FunctionRegistry,
    scripts: HashMap<ScriptId, CompiledScript>,
    next_script_id: ScriptId,
    js_runtime: JsRuntime,
}

impl Interpreter {
    pub(crate) fn new(task_loop: TaskLoop, services: Arc<CellServices>) -> Result<Self> {
        let config: &CellConfig = &services.config;
        config.validate()?;
        let bootstrap_script = config.bootstrap_script.clone();

        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![cell_extension()],
            create_params: config.create_params(),
            ..Default::default()
        });

        {
            let op_state = js_runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(task_loop);
            op_state.put(services);
        }

        for &(name, source) in GLUE {
            js_runtime
                .execute_script(name, source)
                .map_err(|err| Error::init(format!("{name}: {err}")))?;
        }

        let dispatch_value = js_runtime
            .execute_script("jailcell:dispatch.js", DISPATCH)
            .map_err(|err| Error::init(format!("jailcell:dispatch.js: {err}")))?;
        let dispatcher = {
            let scope = &mut js_runtime.handle_scope();
            let local = v8::Local::new(scope, dispatch_value);
            let function = v8::Local::<v8::Function>::try_from(local)
                .map_err(|_| Error::init("dispatch glue did not evaluate to a function"))?;
            v8::Global::new(scope, function)
        };

        let mut interpreter = Self {
            dispatcher,
            functions: FunctionRegistry::default(),
            scripts: HashMap::new(),
            next_script_id: 0,
            js_runtime,
        };

        if let Some(script) = bootstrap_script {
            interpreter.run(&script)?;
        }

        Ok(interpreter)
    }

    /// Compile and run `source` in the global scope.
    pub fn run(&mut self, source: &str) -> Result<JSValue> {
        self.run_as(source, ResultMode::Handles)
    }

    pub fn run_as(&mut self, source: &str, mode: ResultMode) -> Result<JSValue> {
        let result = {
            let scope = &mut self.js_runtime.handle_scope();
            let code = new_string(scope, source)?;
            let tc = &mut v8::TryCatch::new(scope);
            let Some(script) = v8::Script::compile(tc, code, None) else {
                return Err(Error::script(exception_message(tc)));
            };
            match script.run(tc) {
                Some(value) => convert(tc, &mut self.functions, value, mode),
                None => Err(Error::script(exception_message(tc))),
            }
        };
        self.checkpoint();
        result
    }

    /// Compile `source` once for repeated [`run_compiled`](Self::run_compiled) calls.
    pub fn compile(&mut self, name: &str, source: &str) -> Result<ScriptId> {
        let script = {
            let scope = &mut self.js_runtime.handle_scope();
            let code = new_string(scope, source)?;
            let tc = &mut v8::TryCatch::new(scope);
            let script = v8::Script::compile(tc, code, None)
                .ok_or_else(|| Error::script(format!("{name}: {}", exception_message(tc))))?;
            v8::Global::new(tc, script)
        };

        let id = self.next_script_id;
        self.next_script_id += 1;
        self.scripts.insert(
            id,
            CompiledScript {
                name: name.to_string(),
                script,
            },
        );
        Ok(id)
    }

    pub fn run_compiled(&mut self, id: ScriptId) -> Result<JSValue> {
        let compiled = self
            .scripts
            .get(&id)
            .ok_or_else(|| Error::Runtime(format!("compiled script {id} not found")))?;
        let result = {
            let scope = &mut self.js_runtime.handle_scope();
            let script = v8::Local::new(scope, &compiled.script);
            let tc = &mut v8::TryCatch::new(scope);
            match script.run(tc) {
                Some(value) => to_js_value(tc, &mut self.functions, value),
                None => Err(Error::script(format!(
                    "{}: {}",
                    compiled.name,
                    exception_message(tc)
                ))),
            }
        };
        self.checkpoint();
        result
    }

    /// Read a global, or a nested property with a dotted path.
    pub fn get(&mut self, path: &str) -> Result<JSValue> {
        let scope = &mut self.js_runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);
        let (_, value) = resolve_path(tc, path)?;
        to_js_value(tc, &mut self.functions, value)
    }

    /// Assign a global, or a nested property with a dotted path.
    pub fn set(&mut self, path: &str, value: &JSValue) -> Result<()> {
        let scope = &mut self.js_runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);
        let (parent, name) = match path.rsplit_once('.') {
            Some((parent, name)) => (Some(parent), name),
            None => (None, path),
        };
        let target: v8::Local<v8::Value> = match parent {
            Some(parent) => resolve_path(tc, parent)?.1,
            None => tc.get_current_context().global(tc).into(),
        };
        let object = v8::Local::<v8::Object>::try_from(target).map_err(|_| {
            Error::Runtime(format!(
                "TypeError: cannot set '{name}' on non-object '{}'",
                parent.unwrap_or_default()
            ))
        })?;

        let key = new_string(tc, name)?;
        let value = to_v8(tc, &self.functions, value)?;
        object
            .set(tc, key.into(), value)
            .map(|_| ())
            .ok_or_else(|| Error::script(exception_message(tc)))
    }

    /// Call the function at `path`. Without `this` the owning object is the receiver.
    pub fn call(&mut self, path: &str, this: Option<&JSValue>, args: &[JSValue]) -> Result<JSValue> {
        self.call_as(path, this, args, ResultMode::Handles)
    }

    pub fn call_as(
        &mut self,
        path: &str,
        this: Option<&JSValue>,
        args: &[JSValue],
        mode: ResultMode,
    ) -> Result<JSValue> {
        let result = {
            let scope = &mut self.js_runtime.handle_scope();
            let tc = &mut v8::TryCatch::new(scope);
            let (holder, target) = resolve_path(tc, path)?;
            let function = v8::Local::<v8::Function>::try_from(target)
                .map_err(|_| Error::Runtime(format!("TypeError: {path} is not a function")))?;
            let receiver = match this {
                Some(this) => to_v8(tc, &self.functions, this)?,
                None => holder,
            };
            let argv = args
                .iter()
                .map(|arg| to_v8(tc, &self.functions, arg))
                .collect::<Result<Vec<_>>>()?;
            match function.call(tc, receiver, &argv) {
                Some(value) => convert(tc, &mut self.functions, value, mode),
                None => Err(Error::script(exception_message(tc))),
            }
        };
        self.checkpoint();
        result
    }

    /// Call a function previously returned as `JSValue::Function`.
    pub fn call_function(&mut self, id: u32, args: &[JSValue]) -> Result<JSValue> {
        let result = {
            let scope = &mut self.js_runtime.handle_scope();
            let tc = &mut v8::TryCatch::new(scope);
            let (function, receiver) = {
                let stored = self.functions.get(id)?;
                let function = v8::Local::new(tc, &stored.function);
                let receiver = match &stored.receiver {
                    Some(receiver) => v8::Local::new(tc, receiver),
                    None => tc.get_current_context().global(tc).into(),
                };
                (function, receiver)
            };
            let argv = args
                .iter()
                .map(|arg| to_v8(tc, &self.functions, arg))
                .collect::<Result<Vec<_>>>()?;
            match function.call(tc, receiver, &argv) {
                Some(value) => to_js_value(tc, &mut self.functions, value),
                None => Err(Error::script(exception_message(tc))),
            }
        };
        self.checkpoint();
        result
    }

    pub fn release_function(&mut self, id: u32) -> Result<()> {
        self.functions.release(id)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Materialize a host value in the interpreter and read back what
    /// script would see: integral floats become ints, function handles
    /// resolve to the functions they name.
    pub fn to_value(&mut self, value: &JSValue) -> Result<JSValue> {
        let scope = &mut self.js_runtime.handle_scope();
        let local = to_v8(scope, &self.functions, value)?;
        if let JSValue::Function { id } = value {
            return Ok(JSValue::Function { id: *id });
        }
        to_js_value(scope, &mut self.functions, local)
    }

    fn checkpoint(&mut self) {
        self.js_runtime.v8_isolate().perform_microtask_checkpoint();
    }
}

impl ScriptHost for Interpreter {
    fn dispatch(
        &mut self,
        kind: DispatchKind,
        id: TaskId,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let result = {
            let scope = &mut self.js_runtime.handle_scope();
            let dispatcher = v8::Local::new(scope, &self.dispatcher);
            let kind = new_string(scope, kind.as_str())?;
            let id = v8::Number::new(scope, id as f64);
            let payload = serde_v8::to_v8(scope, &payload)
                .map_err(|err| Error::conversion(err.to_string()))?;
            let tc = &mut v8::TryCatch::new(scope);
            let receiver = v8::undefined(tc).into();
            match dispatcher.call(tc, receiver, &[kind.into(), id.into(), payload]) {
                Some(delivered) => Ok(delivered.boolean_value(tc)),
                None => Err(Error::script(exception_message(tc))),
            }
        };
        self.checkpoint();
        result
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        let leaked = self.functions.len();
        if leaked > 0 {
            tracing::debug!(leaked, "function handles not released before shutdown");
        }
        self.functions.clear();
        self.scripts.clear();
    }
}

fn convert<'s>(
    scope: &mut v8::HandleScope<'s>,
    functions: &mut FunctionRegistry,
    value: v8::Local<'s, v8::Value>,
    mode: ResultMode,
) -> Result<JSValue> {
    match mode {
        ResultMode::Handles => to_js_value(scope, functions, value),
        ResultMode::Values => to_plain_value(scope, value),
        ResultMode::Discard => Ok(JSValue::Null),
    }
}

fn exception_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    if tc.has_terminated() {
        return "execution terminated".to_string();
    }
    match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "unknown script error".to_string(),
    }
}

/// Walk a dotted path from the global object. Returns the last holder and the value.
/// Exceptions thrown by getters propagate with the interpreter's message.
fn resolve_path<'s>(
    tc: &mut v8::TryCatch<v8::HandleScope<'s>>,
    path: &str,
) -> Result<(v8::Local<'s, v8::Value>, v8::Local<'s, v8::Value>)> {
    let global: v8::Local<v8::Value> = tc.get_current_context().global(tc).into();
    let mut holder = global;
    let mut value = global;
    for segment in path.split('.') {
        if value.is_null_or_undefined() {
            return Err(Error::Runtime(format!(
                "TypeError: cannot read '{segment}' of undefined in '{path}'"
            )));
        }
        let Some(object) = value.to_object(tc) else {
            return Err(thrown_or(tc, format!("TypeError: '{path}' is not reachable")));
        };
        let key = new_string(tc, segment)?;
        holder = value;
        value = match object.get(tc, key.into()) {
            Some(value) => value,
            None => return Err(thrown_or(tc, format!("failed to read '{segment}' of '{path}'"))),
        };
    }
    Ok((holder, value))
}

fn thrown_or(tc: &mut v8::TryCatch<v8::HandleScope>, fallback: String) -> Error {
    if tc.has_caught() {
        Error::script(exception_message(tc))
    } else {
        Error::Runtime(fallback)
    }
}
