//! Registry of cells keyed by chat id.
//!
//! A [`Jail`] is an explicit context object: it owns the host services every
//! cell shares (background runtime, RPC client, local fetch routes, signal
//! handler) and the cells themselves. Host-facing operations return JSON
//! envelopes, `{"result": ...}` on success and `{"error": "..."}` on failure.

use crate::error::{Error, Result};
use crate::rpc::RpcClient;
use crate::runtime::event_loop::LocalHandler;
use crate::runtime::{Cell, CellConfig, HostServices, JSValue};
use crate::signal::{Signal, SignalHandler};
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::{Handle, Runtime};

/// Evaluates to the JSON text of the cell's status catalog.
const CATALOG_SCRIPT: &str =
    "JSON.stringify(typeof _status_catalog === 'undefined' ? null : _status_catalog)";

#[derive(Default)]
pub struct JailBuilder {
    cell_config: CellConfig,
    rpc_client: Option<Arc<dyn RpcClient>>,
    local_handler: Option<Arc<dyn LocalHandler>>,
    signal_handler: Option<SignalHandler>,
    background: Option<Handle>,
    base_js: String,
}

impl JailBuilder {
    pub fn cell_config(mut self, config: CellConfig) -> Self {
        self.cell_config = config;
        self
    }

    pub fn rpc_client(mut self, client: impl RpcClient + 'static) -> Self {
        self.rpc_client = Some(Arc::new(client));
        self
    }

    /// Handler for `fetch` requests whose URL starts with `/`.
    pub fn local_handler(mut self, handler: impl LocalHandler + 'static) -> Self {
        self.local_handler = Some(Arc::new(handler));
        self
    }

    /// Receives every signal raised by any cell, on that cell's thread.
    pub fn signal_handler(mut self, handler: impl Fn(&Signal) + Send + Sync + 'static) -> Self {
        self.signal_handler = Some(Arc::new(handler));
        self
    }

    /// Run background work on an existing runtime instead of an owned one.
    pub fn background(mut self, handle: Handle) -> Self {
        self.background = Some(handle);
        self
    }

    pub fn base_js(mut self, js: impl Into<String>) -> Self {
        self.base_js = js.into();
        self
    }

    pub fn build(self) -> Result<Jail> {
        self.cell_config.validate()?;

        let (runtime, handle) = match self.background {
            Some(handle) => (None, handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("jailcell-background")
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let services = HostServices {
            background: handle,
            rpc_client: self.rpc_client,
            local_handler: self.local_handler,
            signal_handler: self.signal_handler,
        };

        Ok(Jail {
            cells: RwLock::new(HashMap::new()),
            base_js: RwLock::new(self.base_js),
            config: self.cell_config,
            services,
            runtime,
        })
    }
}

/// Isolated cells sharing one set of host services.
pub struct Jail {
    cells: RwLock<HashMap<String, Cell>>,
    base_js: RwLock<String>,
    config: CellConfig,
    services: HostServices,
    // Owned background runtime, `None` when a handle was supplied.
    runtime: Option<Runtime>,
}

impl Jail {
    pub fn builder() -> JailBuilder {
        JailBuilder::default()
    }

    /// Start a new cell. Fails with [`Error::CellExists`] if `id` is taken.
    ///
    /// The cell is started without holding the registry lock, so lookups
    /// and signal handlers are never blocked by interpreter startup.
    pub fn create_cell(&self, id: &str) -> Result<Cell> {
        if read(&self.cells).contains_key(id) {
            return Err(Error::CellExists(id.to_string()));
        }
        let cell = Cell::spawn(id, self.config.clone(), &self.services)?;

        match write(&self.cells).entry(id.to_string()) {
            Entry::Occupied(_) => {
                // Another caller registered the same id meanwhile.
                cell.stop();
                Err(Error::CellExists(id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(cell.clone());
                tracing::info!(cell = %id, "cell created");
                Ok(cell)
            }
        }
    }

    pub fn cell(&self, id: &str) -> Result<Cell> {
        read(&self.cells)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::CellNotFound(id.to_string()))
    }

    pub fn get_or_create_cell(&self, id: &str) -> Result<Cell> {
        match self.cell(id) {
            Ok(cell) => Ok(cell),
            Err(_) => match self.create_cell(id) {
                // Lost a race with another creator.
                Err(Error::CellExists(_)) => self.cell(id),
                other => other,
            },
        }
    }

    pub fn cell_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.cells).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Script run before the chat code in [`create_and_init_cell`](Self::create_and_init_cell).
    pub fn set_base_js(&self, js: impl Into<String>) {
        *write(&self.base_js) = js.into();
    }

    /// Create the cell if needed, run the base script and `code`, and return
    /// the cell's `_status_catalog`.
    pub fn create_and_init_cell(&self, id: &str, code: &str) -> String {
        make_result(self.init_cell(id, code))
    }

    fn init_cell(&self, id: &str, code: &str) -> Result<Value> {
        let cell = self.get_or_create_cell(id)?;
        let base_js = read(&self.base_js).clone();
        if !base_js.is_empty() {
            cell.exec(&base_js)?;
        }
        cell.exec(code)?;

        match cell.eval(CATALOG_SCRIPT)? {
            JSValue::String(catalog) => Ok(serde_json::from_str(&catalog)?),
            _ => Ok(Value::Null),
        }
    }

    /// Run `code` in an existing cell and return its completion value.
    pub fn execute(&self, id: &str, code: &str) -> String {
        make_result(
            self.cell(id)
                .and_then(|cell| cell.eval(code))
                .and_then(|value| value.to_json()),
        )
    }

    /// Invoke the cell's script-level `call(path, args)` function.
    ///
    /// A string result that is itself JSON is embedded as is.
    pub fn call(&self, id: &str, path: &str, args: &str) -> String {
        make_result(self.cell(id).and_then(|cell| {
            let value = cell.invoke("call", vec![path.into(), args.into()])?;
            match value {
                JSValue::String(text) => {
                    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
                }
                other => other.to_json(),
            }
        }))
    }

    /// Remove a cell and wait for its loop to drain.
    pub fn stop_cell(&self, id: &str) -> Result<()> {
        let cell = write(&self.cells)
            .remove(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        cell.stop_and_wait();
        tracing::info!(cell = %id, "cell removed");
        Ok(())
    }

    /// Stop every cell. Stops are requested together, then each is awaited
    /// within the configured stop timeout.
    pub fn stop(&self) {
        let cells: Vec<Cell> = write(&self.cells).drain().map(|(_, cell)| cell).collect();
        if cells.is_empty() {
            return;
        }
        let signals: Vec<_> = cells.iter().map(|cell| (cell.id().to_string(), cell.stop())).collect();
        for (id, signal) in signals {
            if !signal.wait_timeout(self.config.stop_timeout) {
                tracing::warn!(cell = %id, timeout = ?self.config.stop_timeout, "cell did not stop in time");
            }
        }
        tracing::info!(count = cells.len(), "all cells stopped");
    }
}

impl Drop for Jail {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Jail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jail").field("cells", &self.cell_ids()).finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub fn make_error(message: &str) -> String {
    json!({ "error": message }).to_string()
}

pub fn make_result(result: Result<Value>) -> String {
    match result {
        Ok(value) => json!({ "result": value }).to_string(),
        Err(err) => make_error(&err.to_string()),
    }
}
