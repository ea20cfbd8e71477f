//! MFP RPC node - runs one side of a master/slave process pair.
//!
//! `--role master` (the default) spawns this binary again as `--role slave`
//! and talks to it over the child's stdin/stdout. The slave serves
//! `DspObject`, publishes it to the master and calls back into the master's
//! `MfpCommand`. Logs go to stderr since stdout carries the pipe.

mod demo;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use mfp_rpc::{CallArgs, HostOptions, PeerId, PeerProcess, RequestPipe, RpcError, RpcHost, RpcObject};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::demo::{DspGraph, DspObject, MfpCommand};

/// Peer id the master uses for its DSP child.
const DSP_PEER: PeerId = 1;
/// Peer id the slave uses for its parent.
const MASTER_PEER: PeerId = 0;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NodeRole {
    Master,
    Slave,
}

#[derive(Parser, Debug)]
#[command(name = "mfp-rpc-node")]
#[command(about = "Master/slave demo for the MFP request pipe")]
struct Args {
    /// Which end of the pipe this process is
    #[arg(long, value_enum, default_value = "master")]
    role: NodeRole,

    /// Consumer workers per pipe
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Give up on a response after this many milliseconds (default: wait)
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn host_options(&self, node_id: &str) -> HostOptions {
        let options = HostOptions::new(node_id).workers(self.workers);
        match self.request_timeout_ms {
            Some(ms) => options.request_timeout(Duration::from_millis(ms)),
            None => options,
        }
    }
}

mfp_rpc::rpc_proxy! {
    /// Remote handle to a DSP processor.
    struct DspProxy: "DspObject" {
        fn getparam(param: String) -> Value;
        fn setparam(param: String, value: Value) -> ();
        fn connect(outlet: u32, target: u64, inlet: u32) -> bool;
        fn disconnect(outlet: u32, target: u64, inlet: u32) -> bool;
    }
}

mfp_rpc::rpc_proxy! {
    /// Handle to the main process command surface.
    struct CommandProxy: "MfpCommand" {
        fn log(message: String) -> ();
        fn message_count() -> usize;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging. RUST_LOG overrides --debug.
    let log_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.role {
        NodeRole::Master => run_master(&args).await,
        NodeRole::Slave => run_slave(&args).await,
    }
}

async fn run_master(args: &Args) -> Result<()> {
    info!("Starting MFP master");

    let host = RpcHost::new(args.host_options("MFP master"));
    let command = Arc::new(MfpCommand::default());
    let served = command.clone();
    host.register(MfpCommand::CLASS, move |_| Ok(served.clone() as Arc<dyn RpcObject>));
    host.set_local(MfpCommand::CLASS, true);

    let mut child = Command::new(std::env::current_exe()?);
    child.arg("--role").arg("slave");
    child.arg("--workers").arg(args.workers.to_string());
    if args.debug {
        child.arg("--debug");
    }
    let (mut dsp, pipe) = PeerProcess::spawn("JACK DSP", child)?;
    host.manage(DSP_PEER, pipe);

    let result = drive_dsp(&host).await;
    if let Err(e) = &result {
        warn!("DSP session failed: {:#}", e);
    }

    host.finish().await;
    let status = dsp.wait_exit(EXIT_TIMEOUT).await?;
    info!(
        "DSP process exited with {}; {} log messages received",
        status,
        command.messages().len()
    );
    result
}

async fn drive_dsp(host: &RpcHost) -> Result<()> {
    let peer = host
        .wait_for_publisher(DspObject::CLASS, PUBLISH_TIMEOUT)
        .await
        .context("DSP process never published DspObject")?;

    let osc = DspProxy::create(
        host,
        CallArgs::from(vec![json!(1), json!("osc~"), json!(0), json!(1)]),
        Some(peer),
    )
    .await?;
    let dac = DspProxy::create(
        host,
        CallArgs::from(vec![json!(2), json!("dac~"), json!(2), json!(0)])
            .with_kwarg("params", json!({"gain": 0.5})),
        None,
    )
    .await?;

    osc.setparam("freq".to_string(), json!(440.0)).await?;
    info!("osc~ freq = {}", osc.getparam("freq".to_string()).await?);
    info!("dac~ gain = {}", dac.getparam("gain".to_string()).await?);

    if !osc.connect(0, 2, 0).await? {
        bail!("connect osc~ -> dac~ was refused");
    }

    match osc.connect(0, 2, 7).await {
        Err(RpcError::MethodFailed { traceback, .. }) => info!("Bad connect rejected:\n{}", traceback),
        other => warn!("Bad connect unexpectedly returned {:?}", other),
    }
    match osc.proxy().call("bypass", CallArgs::new()).await {
        Err(RpcError::MethodNotFound { method, .. }) => info!("No method {} on osc~", method),
        other => warn!("Unknown method unexpectedly returned {:?}", other),
    }

    osc.disconnect(0, 2, 0).await?;
    dac.delete().await?;
    osc.delete().await?;
    Ok(())
}

async fn run_slave(args: &Args) -> Result<()> {
    info!("Starting MFP DSP slave");

    let host = RpcHost::new(args.host_options("JACK DSP"));
    let graph = Arc::new(Mutex::new(DspGraph::default()));
    host.register(DspObject::CLASS, move |args| {
        DspObject::construct(args, graph.clone())
    });
    host.set_local(DspObject::CLASS, true);
    host.set_local(MfpCommand::CLASS, false);

    let pipe = host.manage(MASTER_PEER, RequestPipe::from_stdio());
    let finished = pipe.shutdown_signal();

    host.publish(MASTER_PEER, &[DspObject::CLASS]).await?;

    let mfp = CommandProxy::create(&host, CallArgs::new(), Some(MASTER_PEER)).await?;
    mfp.log("JACK DSP ready".to_string()).await?;
    info!("Master has {} log messages", mfp.message_count().await?);

    tokio::select! {
        _ = finished.triggered() => info!("Master closed the pipe"),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, exiting");
        }
    }

    host.finish().await;
    Ok(())
}
