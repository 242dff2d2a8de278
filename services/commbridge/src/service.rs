//! Polling orchestrator
//!
//! `CommunicationService` owns the protocol adapters and the live variable
//! set. While polling, every cycle fans out one task per protocol group and
//! waits for all of them before sleeping until the next cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::events::{LogEvent, LogSink};
use crate::protocols::{ProtocolAdapter, ProtocolParams};
use crate::variable::{Variable, VariableId};

const SERVICE_SOURCE: &str = "CommunicationService";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    Idle,
    Polling,
}

/// State shared with the background poll loop
struct Shared {
    adapters: RwLock<HashMap<String, Arc<dyn ProtocolAdapter>>>,
    variables: RwLock<Vec<Arc<Variable>>>,
    sink: LogSink,
}

impl Shared {
    fn adapter(&self, name: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.read().get(name).cloned()
    }

    fn groups(&self) -> BTreeMap<String, Vec<Arc<Variable>>> {
        group_by_protocol(self.variables.read().iter())
    }
}

fn group_by_protocol<'a>(
    variables: impl IntoIterator<Item = &'a Arc<Variable>>,
) -> BTreeMap<String, Vec<Arc<Variable>>> {
    let mut groups: BTreeMap<String, Vec<Arc<Variable>>> = BTreeMap::new();
    for variable in variables {
        groups
            .entry(variable.protocol_name().to_string())
            .or_default()
            .push(Arc::clone(variable));
    }
    groups
}

struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CommunicationService {
    shared: Arc<Shared>,
    configured: Mutex<HashSet<String>>,
    poller: Mutex<Option<Poller>>,
}

impl CommunicationService {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                adapters: RwLock::new(HashMap::new()),
                variables: RwLock::new(Vec::new()),
                sink: LogSink::new(SERVICE_SOURCE),
            }),
            configured: Mutex::new(HashSet::new()),
            poller: Mutex::new(None),
        }
    }

    /// Register an adapter under a protocol name, replacing any previous one
    pub fn register_protocol(&self, name: impl Into<String>, adapter: Arc<dyn ProtocolAdapter>) {
        let name = name.into();
        self.shared
            .sink
            .debug(format!("Registered {} adapter as '{}'", adapter.kind(), name));
        self.shared.adapters.write().insert(name, adapter);
    }

    pub fn protocol_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Wire the adapter's log events into this service's stream and connect it.
    ///
    /// Returns false for an unknown name, a second configuration of the same
    /// name, or a failed connect.
    pub async fn configure_protocol(&self, name: &str, params: &ProtocolParams) -> bool {
        let sink = &self.shared.sink;
        let Some(adapter) = self.shared.adapter(name) else {
            sink.warn(format!("Protocol '{}' is not registered", name));
            return false;
        };
        if !self.configured.lock().insert(name.to_string()) {
            sink.warn(format!("Protocol '{}' is already configured", name));
            return false;
        }

        adapter.attach_log_sink(sink.with_source(name));
        let connected = adapter.connect(params).await;
        if connected {
            sink.info(format!("Protocol '{}' configured and connected", name));
        } else {
            sink.warn(format!(
                "Protocol '{}' configured but not connected, polling will retry",
                name
            ));
        }
        connected
    }

    pub fn add_variable(&self, variable: Variable) -> Arc<Variable> {
        let variable = Arc::new(variable);
        self.shared.variables.write().push(Arc::clone(&variable));
        variable
    }

    pub fn add_variables(&self, variables: impl IntoIterator<Item = Variable>) -> Vec<Arc<Variable>> {
        let added: Vec<Arc<Variable>> = variables.into_iter().map(Arc::new).collect();
        self.shared.variables.write().extend(added.iter().cloned());
        added
    }

    pub fn variables(&self) -> Vec<Arc<Variable>> {
        self.shared.variables.read().clone()
    }

    pub fn find_variable(&self, id: VariableId) -> Option<Arc<Variable>> {
        self.shared
            .variables
            .read()
            .iter()
            .find(|v| v.id() == id)
            .cloned()
    }

    pub fn find_variable_by_name(&self, name: &str) -> Option<Arc<Variable>> {
        self.shared
            .variables
            .read()
            .iter()
            .find(|v| v.name() == name)
            .cloned()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.shared.sink.subscribe()
    }

    pub fn log_sink(&self) -> LogSink {
        self.shared.sink.clone()
    }

    pub fn state(&self) -> PollingState {
        match self.poller.lock().as_ref() {
            Some(poller) if !poller.handle.is_finished() => PollingState::Polling,
            _ => PollingState::Idle,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.state() == PollingState::Polling
    }

    /// Start the poll loop. No-op returning false when already polling or
    /// when `interval` is zero. Must be called inside a tokio runtime.
    pub fn start_polling(&self, interval: Duration) -> bool {
        let sink = &self.shared.sink;
        if interval.is_zero() {
            sink.warn("Polling interval must be greater than zero");
            return false;
        }

        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            sink.warn("Polling already running");
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.shared), interval, token.clone()));
        *poller = Some(Poller { token, handle });
        sink.info(format!("Polling started every {:?}", interval));
        true
    }

    /// Cancel the loop and wait for the in-flight cycle to finish
    pub async fn stop_polling(&self) {
        let Some(Poller { token, handle }) = self.poller.lock().take() else {
            self.shared.sink.debug("Polling not running");
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            self.shared
                .sink
                .error(format!("Poll loop ended abnormally: {}", e));
        }
        self.shared.sink.info("Polling stopped");
    }

    /// Write one variable's setpoint through its owning adapter
    pub async fn write(&self, variable: &Variable) -> Result<()> {
        let adapter = self
            .shared
            .adapter(variable.protocol_name())
            .ok_or_else(|| BridgeError::not_registered(variable.protocol_name()))?;
        adapter.write_variable(variable).await
    }

    /// Write a batch, one call per owning adapter. Every group is attempted;
    /// the first failure is returned.
    pub async fn write_batch(&self, variables: &[Arc<Variable>]) -> Result<()> {
        let sink = &self.shared.sink;
        let mut first_error = None;

        for (protocol, group) in group_by_protocol(variables) {
            let result = match self.shared.adapter(&protocol) {
                Some(adapter) => adapter.write_variables(&group).await,
                None => Err(BridgeError::not_registered(protocol.as_str())),
            };
            if let Err(e) = result {
                sink.error(format!("Batch write to '{}' failed: {}", protocol, e));
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Disconnect every registered adapter, logging failures
    pub async fn disconnect_all(&self) {
        let adapters: Vec<(String, Arc<dyn ProtocolAdapter>)> = self
            .shared
            .adapters
            .read()
            .iter()
            .map(|(name, adapter)| (name.clone(), Arc::clone(adapter)))
            .collect();

        for (name, adapter) in adapters {
            if let Err(e) = adapter.disconnect().await {
                self.shared
                    .sink
                    .error(format!("Disconnect of '{}' failed: {}", name, e));
            }
        }
    }
}

impl Default for CommunicationService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommunicationService {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.token.cancel();
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, interval: Duration, token: CancellationToken) {
    while !token.is_cancelled() {
        poll_cycle(&shared).await;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {},
        }
    }
}

async fn poll_cycle(shared: &Arc<Shared>) {
    let started = Instant::now();
    let mut tasks = Vec::new();

    for (protocol, group) in shared.groups() {
        let Some(adapter) = shared.adapter(&protocol) else {
            shared
                .sink
                .debug(format!("No adapter for '{}', {} variables skipped", protocol, group.len()));
            continue;
        };
        let handle = tokio::spawn(async move { adapter.read_variables(&group).await });
        tasks.push((protocol, handle));
    }

    let (names, handles): (Vec<String>, Vec<_>) = tasks.into_iter().unzip();
    let results = join_all(handles).await;

    for (protocol, result) in names.iter().zip(results) {
        match result {
            Ok(Ok(())) => {},
            Ok(Err(e)) => shared
                .sink
                .error(format!("Read cycle for '{}' failed: {}", protocol, e)),
            Err(e) => shared
                .sink
                .error(format!("Read task for '{}' aborted: {}", protocol, e)),
        }
    }

    shared
        .sink
        .debug(format!("Poll cycle finished in {:?}", started.elapsed()));
}
