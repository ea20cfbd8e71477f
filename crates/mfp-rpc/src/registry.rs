//! Process-wide tables behind an `RpcHost`.
//!
//! - `ClassRegistry`: class name -> constructor, plus the per-class local flag
//! - `ObjectTable`: rpcid -> live object
//! - `PublisherTable`: class name -> peers that implement it
//! - `CallStats`: per-method call counters
//!
//! The tables are plain data; `RpcHost` owns them and does the locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::object::{CallArgs, MethodError, RpcObject};
use crate::request::{PeerId, RpcId};

/// Builds a new instance of a registered class.
pub type Constructor =
    Arc<dyn Fn(CallArgs) -> Result<Arc<dyn RpcObject>, MethodError> + Send + Sync>;

#[derive(Clone, Default)]
struct ClassEntry {
    constructor: Option<Constructor>,
    local: bool,
}

/// Class name -> constructor and role.
///
/// A class is `local` in this process when its methods run here; otherwise
/// proxies for it marshal every call to a peer.
#[derive(Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassEntry>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor) {
        self.classes.entry(name.into()).or_default().constructor = Some(constructor);
    }

    pub fn set_local(&mut self, name: impl Into<String>, local: bool) {
        self.classes.entry(name.into()).or_default().local = local;
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.classes.get(name).map(|c| c.local).unwrap_or(false)
    }

    pub fn constructor(&self, name: &str) -> Option<Constructor> {
        self.classes.get(name).and_then(|c| c.constructor.clone())
    }

    /// Names of every class with a constructor, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .classes
            .iter()
            .filter(|(_, c)| c.constructor.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Live objects owned by this process.
pub struct ObjectTable {
    objects: HashMap<RpcId, Arc<dyn RpcObject>>,
    next_rpcid: RpcId,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_rpcid: 0,
        }
    }

    /// Store `object` under a fresh rpcid. Ids are never handed out twice.
    pub fn insert(&mut self, object: Arc<dyn RpcObject>) -> RpcId {
        let rpcid = self.next_rpcid;
        self.next_rpcid += 1;
        self.objects.insert(rpcid, object);
        rpcid
    }

    pub fn get(&self, rpcid: RpcId) -> Option<Arc<dyn RpcObject>> {
        self.objects.get(&rpcid).cloned()
    }

    pub fn remove(&mut self, rpcid: RpcId) -> Option<Arc<dyn RpcObject>> {
        self.objects.remove(&rpcid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Which peers have declared they can construct which classes.
#[derive(Debug, Default)]
pub struct PublisherTable {
    publishers: HashMap<String, Vec<PeerId>>,
}

impl PublisherTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer_id` as a publisher of `class`, keeping first-come order.
    pub fn add(&mut self, class: impl Into<String>, peer_id: PeerId) {
        let peers = self.publishers.entry(class.into()).or_default();
        if !peers.contains(&peer_id) {
            peers.push(peer_id);
        }
    }

    /// The publisher a new proxy for `class` should talk to.
    pub fn first(&self, class: &str) -> Option<PeerId> {
        self.publishers.get(class).and_then(|peers| peers.first().copied())
    }

    pub fn publishers(&self, class: &str) -> Vec<PeerId> {
        self.publishers.get(class).cloned().unwrap_or_default()
    }

    /// Forget `peer_id` everywhere. Returns the classes it had published.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Vec<String> {
        let mut affected = Vec::new();
        for (class, peers) in self.publishers.iter_mut() {
            if let Some(pos) = peers.iter().position(|p| *p == peer_id) {
                peers.remove(pos);
                affected.push(class.clone());
            }
        }
        self.publishers.retain(|_, peers| !peers.is_empty());
        affected.sort();
        affected
    }
}

/// Per-method call counters.
#[derive(Debug, Default)]
pub struct CallStats {
    counts: HashMap<String, u64>,
}

impl CallStats {
    pub fn record(&mut self, method: &str) {
        *self.counts.entry(method.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, method: &str) -> u64 {
        self.counts.get(method).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    struct Nop;

    #[async_trait::async_trait]
    impl RpcObject for Nop {
        async fn call_method(&self, method: &str, _args: CallArgs) -> Result<Value, MethodError> {
            Err(MethodError::NotFound(method.to_string()))
        }
    }

    fn nop_constructor() -> Constructor {
        Arc::new(|_| Ok(Arc::new(Nop) as Arc<dyn RpcObject>))
    }

    #[test]
    fn test_class_registry_local_flag() {
        let mut classes = ClassRegistry::new();
        classes.register("DspObject", nop_constructor());
        assert!(!classes.is_local("DspObject"));

        classes.set_local("DspObject", true);
        assert!(classes.is_local("DspObject"));
        assert!(classes.constructor("DspObject").is_some());
        assert!(classes.constructor("Missing").is_none());
    }

    #[test]
    fn test_names_skip_role_only_entries() {
        let mut classes = ClassRegistry::new();
        classes.set_local("GuiCommand", false);
        classes.register("DspObject", nop_constructor());
        assert_eq!(classes.names(), vec!["DspObject".to_string()]);
    }

    #[test]
    fn test_rpcids_are_not_reused() {
        let mut objects = ObjectTable::new();
        let a = objects.insert(Arc::new(Nop));
        let b = objects.insert(Arc::new(Nop));
        objects.remove(a);
        let c = objects.insert(Arc::new(Nop));

        assert_ne!(a, b);
        assert_ne!(c, a);
        assert!(objects.get(a).is_none());
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn test_publisher_order_and_removal() {
        let mut table = PublisherTable::new();
        table.add("Foo", 2);
        table.add("Foo", 1);
        table.add("Foo", 2);
        table.add("Bar", 2);

        assert_eq!(table.first("Foo"), Some(2));
        assert_eq!(table.publishers("Foo"), vec![2, 1]);

        let affected = table.remove_peer(2);
        assert_eq!(affected, vec!["Bar".to_string(), "Foo".to_string()]);
        assert_eq!(table.first("Foo"), Some(1));
        assert_eq!(table.first("Bar"), None);
    }

    #[test]
    fn test_call_stats() {
        let mut stats = CallStats::default();
        stats.record("setparam");
        stats.record("setparam");
        assert_eq!(stats.get("setparam"), 2);
        assert_eq!(stats.get("getparam"), 0);
    }
}
