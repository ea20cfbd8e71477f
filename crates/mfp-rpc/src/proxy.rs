//! Caller-side handle to an RPC object.
//!
//! An `RpcProxy` stands for one instance of a registered class. If the class
//! is local to this process the proxy calls straight into the host's object
//! table; otherwise every call is marshalled to the peer that owns the
//! instance. Both paths report failures the same way.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::host::RpcHost;
use crate::object::CallArgs;
use crate::request::{PeerId, Response, RpcId, Status};

/// Handle to an object, local or remote.
#[derive(Clone)]
pub struct RpcProxy {
    host: RpcHost,
    class: String,
    rpcid: RpcId,
    /// `None` for objects living in this process.
    peer_id: Option<PeerId>,
}

impl std::fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProxy")
            .field("class", &self.class)
            .field("rpcid", &self.rpcid)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl RpcProxy {
    /// Construct a new instance of `class`.
    ///
    /// Local classes are built in this process. Remote ones are built on
    /// `peer_id`, or on the first publisher of the class, or on the host's
    /// default peer.
    pub async fn create(
        host: &RpcHost,
        class: &str,
        args: CallArgs,
        peer_id: Option<PeerId>,
    ) -> Result<Self> {
        if host.is_local(class) {
            let rpcid = host.create_local(class, args)?;
            return Ok(Self::attach(host, class, rpcid, None));
        }

        let peer_id = host.resolve_peer(class, peer_id);
        let mut params = serde_json::to_value(&args)?;
        params["type"] = json!(class);

        let response = host.request(peer_id, "create", params).await?;
        match response.status() {
            Status::Created(rpcid) => {
                debug!("Created remote {} rpcid {} on peer {}", class, rpcid, peer_id);
                Ok(Self::attach(host, class, rpcid, Some(peer_id)))
            }
            Status::NoClass => Err(RpcError::ClassNotFound {
                class: class.to_string(),
            }),
            Status::MethodFailed => Err(RpcError::MethodFailed {
                method: "create".to_string(),
                traceback: failure_text(response),
            }),
            status => Err(RpcError::UnexpectedStatus {
                method: "create".to_string(),
                status,
            }),
        }
    }

    /// Wrap an object that already exists.
    pub fn attach(host: &RpcHost, class: &str, rpcid: RpcId, peer_id: Option<PeerId>) -> Self {
        Self {
            host: host.clone(),
            class: class.to_string(),
            rpcid,
            peer_id,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn rpcid(&self) -> RpcId {
        self.rpcid
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn is_local(&self) -> bool {
        self.peer_id.is_none()
    }

    /// Invoke `method` on the object.
    pub async fn call(&self, method: &str, args: CallArgs) -> Result<Value> {
        let Some(peer_id) = self.peer_id else {
            return self.host.call_local(self.rpcid, method, args).await;
        };

        let mut params = serde_json::to_value(&args)?;
        params["func"] = json!(method);
        params["rpcid"] = json!(self.rpcid);

        let response = self.host.request(peer_id, "call", params).await?;
        match response.status() {
            Status::MethodOk => Ok(response.into_value()),
            Status::NoMethod => Err(RpcError::MethodNotFound {
                method: method.to_string(),
                rpcid: self.rpcid,
            }),
            Status::MethodFailed => Err(RpcError::MethodFailed {
                method: method.to_string(),
                traceback: failure_text(response),
            }),
            status => Err(RpcError::UnexpectedStatus {
                method: method.to_string(),
                status,
            }),
        }
    }

    /// `call`, deserializing the result as `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: CallArgs) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Release the object. Later calls through other handles to the same
    /// rpcid fail with `MethodNotFound`.
    pub async fn delete(self) -> Result<()> {
        let Some(peer_id) = self.peer_id else {
            self.host.delete_local(self.rpcid);
            return Ok(());
        };

        let response = self
            .host
            .request(peer_id, "delete", json!({ "rpcid": self.rpcid }))
            .await?;
        match response.status() {
            Status::Ack => Ok(()),
            status => Err(RpcError::UnexpectedStatus {
                method: "delete".to_string(),
                status,
            }),
        }
    }
}

fn failure_text(response: Response) -> String {
    match response.into_value() {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Generate a typed wrapper around `RpcProxy`.
///
/// Each listed method serializes its arguments positionally, calls through
/// the proxy and deserializes the result.
///
/// ```rust,ignore
/// mfp_rpc::rpc_proxy! {
///     pub struct DspObject: "DspObject" {
///         fn getparam(name: String) -> serde_json::Value;
///         fn setparam(name: String, value: f64) -> ();
///     }
/// }
///
/// let osc = DspObject::create(&host, CallArgs::new(), None).await?;
/// osc.setparam("freq".into(), 440.0).await?;
/// ```
#[macro_export]
macro_rules! rpc_proxy {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $class:literal {
            $( fn $method:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) -> $ret:ty ; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            proxy: $crate::RpcProxy,
        }

        #[allow(dead_code)]
        impl $name {
            pub const CLASS: &'static str = $class;

            pub async fn create(
                host: &$crate::RpcHost,
                args: $crate::CallArgs,
                peer_id: ::std::option::Option<$crate::PeerId>,
            ) -> $crate::Result<Self> {
                ::std::result::Result::Ok(Self {
                    proxy: $crate::RpcProxy::create(host, $class, args, peer_id).await?,
                })
            }

            pub fn proxy(&self) -> &$crate::RpcProxy {
                &self.proxy
            }

            pub async fn delete(self) -> $crate::Result<()> {
                self.proxy.delete().await
            }

            $(
                pub async fn $method(&self, $( $arg: $ty ),*) -> $crate::Result<$ret> {
                    let args: ::std::vec::Vec<$crate::__serde_json::Value> =
                        vec![$( $crate::__serde_json::to_value(&$arg)? ),*];
                    self.proxy
                        .call_as::<$ret>(stringify!($method), $crate::CallArgs::from(args))
                        .await
                }
            )*
        }
    };
}
