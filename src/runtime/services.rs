//! Host facilities shared with cells.

use crate::error::Result;
use crate::rpc::{RpcBridge, RpcClient};
use crate::runtime::config::CellConfig;
use crate::runtime::event_loop::{FetchClient, LocalHandler};
use crate::signal::{Signal, SignalHandler};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Everything a cell needs from its host. Cheap to clone.
#[derive(Clone)]
pub struct HostServices {
    pub background: Handle,
    pub rpc_client: Option<Arc<dyn RpcClient>>,
    pub local_handler: Option<Arc<dyn LocalHandler>>,
    pub signal_handler: Option<SignalHandler>,
}

impl HostServices {
    /// Services backed by `background` with no transport, routes or signals.
    pub fn new(background: Handle) -> Self {
        Self {
            background,
            rpc_client: None,
            local_handler: None,
            signal_handler: None,
        }
    }
}

/// Per-cell view of the host services, stored in the op state.
pub(crate) struct CellServices {
    pub cell_id: String,
    pub config: CellConfig,
    pub rpc: RpcBridge,
    pub fetch: FetchClient,
    signals: Option<SignalHandler>,
}

impl CellServices {
    pub fn new(cell_id: &str, config: &CellConfig, host: &HostServices) -> Result<Self> {
        Ok(Self {
            cell_id: cell_id.to_string(),
            config: config.clone(),
            rpc: RpcBridge::new(host.rpc_client.clone()),
            fetch: FetchClient::new(config.fetch_timeout, host.local_handler.clone())?,
            signals: host.signal_handler.clone(),
        })
    }

    pub fn emit(&self, signal: Signal) {
        tracing::trace!(cell = %self.cell_id, kind = signal.kind(), "emitting signal");
        if let Some(handler) = &self.signals {
            handler(&signal);
        }
    }
}
