//! MFP request pipe - cross-process RPC and transparent object proxies.
//!
//! Two processes joined by a duplex byte channel (normally a child's stdio)
//! exchange length-prefixed JSON requests. On top of that transport, objects
//! of registered classes can be created, called and deleted in a peer process
//! through `RpcProxy` handles that look the same whether the object is local
//! or remote.
//!
//! # Example
//!
//! ```rust,ignore
//! use mfp_rpc::{CallArgs, HostOptions, PeerProcess, RpcHost, RpcProxy};
//! use tokio::process::Command;
//!
//! #[tokio::main]
//! async fn main() -> mfp_rpc::Result<()> {
//!     let host = RpcHost::new(HostOptions::new("main"));
//!
//!     let (mut dsp, pipe) = PeerProcess::spawn("dsp", Command::new("mfp-dsp"))?;
//!     host.manage(1, pipe);
//!
//!     let osc = RpcProxy::create(&host, "Osc", CallArgs::new(), Some(1)).await?;
//!     osc.call("setparam", CallArgs::new().with_arg("freq").with_arg(440.0)).await?;
//!
//!     host.finish().await;
//!     dsp.wait_exit(std::time::Duration::from_secs(2)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod object;
pub mod pipe;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod request;
pub mod shutdown;
pub mod wire;

// Re-export commonly used types
pub use config::{HostOptions, TransportConfig};
pub use error::{Result, RpcError};
pub use host::RpcHost;
pub use object::{CallArgs, MethodError, RpcObject};
pub use pipe::{Inbound, PayloadHandler, PendingReply, Polled, RequestPipe};
pub use pool::{ConsumerPool, InboundHandler};
pub use process::PeerProcess;
pub use proxy::RpcProxy;
pub use registry::{CallStats, ClassRegistry, Constructor, ObjectTable, PublisherTable};
pub use request::{
    Payload, PeerId, Request, RequestId, RequestState, Response, Role, RpcId, Signal, Status,
};
pub use shutdown::ShutdownSignal;
pub use wire::WireMessage;

#[doc(hidden)]
pub use serde_json as __serde_json;
