//! chainwire CLI: issue calls and subscriptions from the terminal.
//!
//! Usage:
//! ```bash
//! # Probe an endpoint (latency, block number, health)
//! chainwire test --url https://cloudflare-eth.com
//!
//! # Send a JSON-RPC call over HTTP, WebSocket or IPC
//! chainwire call --url wss://ethereum-rpc.publicnode.com --method eth_getBalance \
//!     --params '["0x0000000000000000000000000000000000000000", "latest"]'
//!
//! # Call through a fallback chain described in a JSON file
//! chainwire call --config fallback.json --method eth_blockNumber
//!
//! # Stream new block headers
//! chainwire subscribe --url /tmp/geth.ipc --kind newHeads --count 3
//! ```

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainwire_core::config::{Endpoint, FallbackOptions, TransportOptions};
use chainwire_core::{FallbackTransport, PubSubTransport, RpcClient, RpcTransport};
use chainwire_http::{HttpClientConfig, HttpRpcClient};
use chainwire_ws::WsRpcClient;

#[tokio::main]
async fn main() {
    let mut args: Vec<String> = env::args().collect();
    let log_json = take_switch(&mut args, "--log-json");
    init_tracing(log_json);

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "test" => cmd_test(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "subscribe" => cmd_subscribe(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("chainwire {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Logs go to stderr so command output stays machine-readable.
/// `RUST_LOG` overrides the default `info` level.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    println!("chainwire {}", env!("CARGO_PKG_VERSION"));
    println!("Issue JSON-RPC calls and subscriptions against blockchain nodes\n");
    println!("USAGE:");
    println!("    chainwire [--log-json] <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    test       Probe an endpoint (latency, block number, health)");
    println!("    call       Send a JSON-RPC call");
    println!("    subscribe  Stream subscription pushes (WebSocket or IPC)");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL|PATH>    http(s)://, ws(s):// or an IPC socket path");
    println!("    --config <FILE>     Fallback chain as JSON (test, call)");
    println!("    --method <NAME>     Method to call  [call]");
    println!("    --params <JSON>     Parameter array, e.g. '[\"latest\", false]'");
    println!("    --kind <KIND>       Subscription kind, e.g. newHeads  [subscribe]");
    println!("    --count <N>         Stop after N items  [subscribe]");
    println!("    --log-json          Emit logs as JSON on stderr");
}

async fn cmd_test(args: &[String]) -> Result<(), String> {
    let (transport, chain) = transport_from_args(args)?;
    println!("Testing {}...", transport.url());

    let client = RpcClient::new(transport.clone());
    let start = Instant::now();
    let block: String = client
        .call_as("eth_blockNumber", vec![])
        .await
        .map_err(|e| e.to_string())?;
    let latency = start.elapsed();

    let block_num = u64::from_str_radix(block.trim_start_matches("0x"), 16).unwrap_or(0);

    println!("  Status:       OK");
    println!("  Transport:    {}", transport.kind());
    println!("  Block number: {block_num} ({block})");
    println!("  Latency:      {}ms", latency.as_millis());
    println!("  Health:       {}", transport.health());
    if let Some(chain) = chain {
        for (key, health, failures) in chain.health_summary() {
            println!("    {key:<40} {health:<10} failures={failures}");
        }
    }
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<(), String> {
    let method = parse_flag(args, "--method").ok_or("--method is required")?;
    let params = parse_params(args)?;
    let (transport, _) = transport_from_args(args)?;

    let client = RpcClient::new(transport);
    let result = client.call(&method, params).await.map_err(|e| e.to_string())?;

    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    Ok(())
}

async fn cmd_subscribe(args: &[String]) -> Result<(), String> {
    let url = parse_flag(args, "--url").ok_or("--url is required")?;
    let kind = parse_flag(args, "--kind").unwrap_or_else(|| "newHeads".into());
    let count = match parse_flag(args, "--count") {
        Some(n) => Some(n.parse::<usize>().map_err(|e| format!("--count: {e}"))?),
        None => None,
    };

    let mut params = vec![Value::String(kind)];
    params.extend(parse_params(args)?);

    let transport = pubsub_transport(&TransportOptions::url(url))?;
    let mut sub = transport.subscribe(params).await.map_err(|e| e.to_string())?;
    tracing::info!(subscription = %sub.id(), "subscribed");

    let mut received = 0usize;
    while let Some(item) = sub.recv().await {
        let value = item.map_err(|e| e.to_string())?;
        println!("{value}");
        received += 1;
        if count.is_some_and(|n| received >= n) {
            break;
        }
    }
    sub.unsubscribe();
    Ok(())
}

type Transport = (Arc<dyn RpcTransport>, Option<Arc<FallbackTransport>>);

/// `--config` builds a fallback chain, `--url` a single transport.
fn transport_from_args(args: &[String]) -> Result<Transport, String> {
    if let Some(path) = parse_flag(args, "--config") {
        let text = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
        let options = FallbackOptions::from_json(&text).map_err(|e| e.to_string())?;
        let chain = fallback_transport(&options)?;
        return Ok((chain.clone(), Some(chain)));
    }
    let url = parse_flag(args, "--url").ok_or("--url or --config is required")?;
    Ok((transport(&TransportOptions::url(url), false)?, None))
}

/// Fallback members skip the HTTP retry loop unless `retryCount` is set.
fn transport(options: &TransportOptions, member: bool) -> Result<Arc<dyn RpcTransport>, String> {
    options.validate().map_err(|e| e.to_string())?;
    match options.endpoint().map_err(|e| e.to_string())? {
        Endpoint::Http(url) => {
            let config = if member {
                HttpClientConfig::for_fallback_member(options)
            } else {
                HttpClientConfig::from_options(options)
            };
            let client = HttpRpcClient::new(url, config).map_err(|e| e.to_string())?;
            Ok(Arc::new(client))
        }
        Endpoint::Ws(_) | Endpoint::Ipc(_) => pubsub_transport(options).map(into_rpc),
    }
}

fn pubsub_transport(options: &TransportOptions) -> Result<Arc<dyn PubSub>, String> {
    match options.endpoint().map_err(|e| e.to_string())? {
        Endpoint::Http(url) => Err(format!("{url}: subscriptions need a WebSocket or IPC endpoint")),
        Endpoint::Ws(_) => Ok(Arc::new(WsRpcClient::from_options(options).map_err(|e| e.to_string())?)),
        #[cfg(unix)]
        Endpoint::Ipc(path) => Ok(Arc::new(chainwire_ipc::IpcRpcClient::connect(path, options.socket_config()))),
        #[cfg(not(unix))]
        Endpoint::Ipc(path) => Err(format!("{}: IPC is only supported on Unix", path.display())),
    }
}

fn fallback_transport(options: &FallbackOptions) -> Result<Arc<FallbackTransport>, String> {
    let members = options
        .transports
        .iter()
        .map(|member| transport(member, true))
        .collect::<Result<Vec<_>, _>>()?;
    let chain = Arc::new(FallbackTransport::new(members, options.fallback_config()));
    if chain.start_ranking().is_some() {
        tracing::info!(members = chain.len(), "background ranking started");
    }
    Ok(chain)
}

/// Socket clients implement both traits; this keeps one concrete handle for
/// each role without trait-object upcasting.
trait PubSub: PubSubTransport {
    fn into_rpc(self: Arc<Self>) -> Arc<dyn RpcTransport>;
}

impl<T: PubSubTransport + 'static> PubSub for T {
    fn into_rpc(self: Arc<Self>) -> Arc<dyn RpcTransport> {
        self
    }
}

fn into_rpc(transport: Arc<dyn PubSub>) -> Arc<dyn RpcTransport> {
    transport.into_rpc()
}

fn parse_params(args: &[String]) -> Result<Vec<Value>, String> {
    match parse_flag(args, "--params") {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("--params must be a JSON array: {e}")),
        None => Ok(Vec::new()),
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

/// Remove a boolean switch from `args`, returning whether it was present.
fn take_switch(args: &mut Vec<String>, switch: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != switch);
    args.len() != before
}
