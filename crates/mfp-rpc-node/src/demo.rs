//! Classes served by the two node roles.
//!
//! `DspObject` lives in the DSP (slave) process and models one processor in
//! the signal graph. `MfpCommand` lives in the main (master) process and is
//! what the DSP side calls back into.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use mfp_rpc::{CallArgs, MethodError, RpcObject};
use serde_json::{json, Map, Value};
use tracing::info;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// `(source obj_id, outlet, target obj_id, inlet)`
pub type Connection = (u64, u32, u64, u32);

/// Processors and the connections between them.
#[derive(Debug, Default)]
pub struct DspGraph {
    /// obj_id -> inlet count
    processors: HashMap<u64, u32>,
    connections: HashSet<Connection>,
}

impl DspGraph {
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn connections(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self.connections.iter().copied().collect();
        all.sort_unstable();
        all
    }
}

pub type SharedGraph = Arc<Mutex<DspGraph>>;

/// One DSP processor.
pub struct DspObject {
    obj_id: u64,
    name: String,
    outlets: u32,
    params: Mutex<Map<String, Value>>,
    graph: SharedGraph,
}

impl DspObject {
    pub const CLASS: &'static str = "DspObject";

    /// Build from `(obj_id, name, inlets, outlets[, params])`.
    pub fn construct(args: CallArgs, graph: SharedGraph) -> Result<Arc<dyn RpcObject>, MethodError> {
        let obj_id: u64 = args.arg(0)?;
        let name: String = args.arg(1)?;
        let inlets: u32 = args.arg(2)?;
        let outlets: u32 = args.arg(3)?;
        let params: Map<String, Value> = match args.args.get(4) {
            Some(_) => args.arg(4)?,
            None => args.kwarg("params")?.unwrap_or_default(),
        };

        {
            let mut g = lock(&graph);
            if g.processors.contains_key(&obj_id) {
                return Err(MethodError::Failed(format!("obj_id {} already exists", obj_id)));
            }
            g.processors.insert(obj_id, inlets);
        }
        info!("Created processor {} ({})", obj_id, name);

        Ok(Arc::new(Self {
            obj_id,
            name,
            outlets,
            params: Mutex::new(params),
            graph,
        }))
    }

    fn check_link(&self, graph: &DspGraph, outlet: u32, target: u64, inlet: u32) -> Result<(), MethodError> {
        if outlet >= self.outlets {
            return Err(MethodError::Failed(format!(
                "{}: outlet {} out of range ({} outlets)",
                self.name, outlet, self.outlets
            )));
        }
        match graph.processors.get(&target) {
            None => Err(MethodError::Failed(format!("no processor with obj_id {}", target))),
            Some(inlets) if inlet >= *inlets => Err(MethodError::Failed(format!(
                "processor {}: inlet {} out of range ({} inlets)",
                target, inlet, inlets
            ))),
            Some(_) => Ok(()),
        }
    }
}

impl Drop for DspObject {
    fn drop(&mut self) {
        let mut graph = lock(&self.graph);
        graph.processors.remove(&self.obj_id);
        let obj_id = self.obj_id;
        graph
            .connections
            .retain(|(src, _, dst, _)| *src != obj_id && *dst != obj_id);
    }
}

#[async_trait::async_trait]
impl RpcObject for DspObject {
    async fn call_method(&self, method: &str, args: CallArgs) -> Result<Value, MethodError> {
        match method {
            "getparam" => {
                let param: String = args.arg(0)?;
                Ok(lock(&self.params).get(&param).cloned().unwrap_or(Value::Null))
            }
            "setparam" => {
                let param: String = args.arg(0)?;
                let value: Value = args.arg(1)?;
                lock(&self.params).insert(param, value);
                Ok(Value::Null)
            }
            "connect" => {
                let (outlet, target, inlet) = (args.arg(0)?, args.arg(1)?, args.arg(2)?);
                let mut graph = lock(&self.graph);
                self.check_link(&graph, outlet, target, inlet)?;
                graph.connections.insert((self.obj_id, outlet, target, inlet));
                Ok(json!(true))
            }
            "disconnect" => {
                let (outlet, target, inlet): (u32, u64, u32) =
                    (args.arg(0)?, args.arg(1)?, args.arg(2)?);
                let removed = lock(&self.graph)
                    .connections
                    .remove(&(self.obj_id, outlet, target, inlet));
                Ok(json!(removed))
            }
            other => Err(MethodError::NotFound(other.to_string())),
        }
    }
}

/// Command surface of the main process.
#[derive(Default)]
pub struct MfpCommand {
    messages: Mutex<Vec<String>>,
}

impl MfpCommand {
    pub const CLASS: &'static str = "MfpCommand";

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait::async_trait]
impl RpcObject for MfpCommand {
    async fn call_method(&self, method: &str, args: CallArgs) -> Result<Value, MethodError> {
        match method {
            "log" => {
                let message: String = args.arg(0)?;
                info!("[remote] {}", message);
                lock(&self.messages).push(message);
                Ok(Value::Null)
            }
            "message_count" => Ok(json!(lock(&self.messages).len())),
            other => Err(MethodError::NotFound(other.to_string())),
        }
    }
}
