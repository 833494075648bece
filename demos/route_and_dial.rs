//! # Route and Dial Example
//!
//! Builds a [`tunproxy::Runtime`] over in-memory state, routes a few hosts
//! and dials a local echo server through the transport the router picks.
//!
//! A custom subscriber counts how often the counters changed while the
//! connection was open.
//!
//! ## Run
//! ```bash
//! cargo run --example route_and_dial
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tunproxy::{
    Config, Disposition, EventKind, MemoryState, Runtime, SiteRule, StaticAddresses, Subscribe,
};

struct CounterWatch {
    changes: AtomicU64,
}

#[async_trait::async_trait]
impl Subscribe for CounterWatch {
    async fn on_event(&self, _kind: EventKind) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "counter-watch"
    }

    fn kinds(&self) -> Vec<EventKind> {
        vec![EventKind::CountersChanged]
    }
}

async fn echo_server() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(addr)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let state = Arc::new(MemoryState::new());
    state.set_sites(vec![
        SiteRule::forward("example.com").recursive(),
        SiteRule::block("ads.example.net"),
    ]);
    let watch = Arc::new(CounterWatch {
        changes: AtomicU64::new(0),
    });

    let rt = Runtime::builder(Config::default())
        .with_sites(state.clone())
        .with_keys(state.clone())
        .with_server_params(state)
        .with_addresses(Arc::new(StaticAddresses::new([IpAddr::V4(Ipv4Addr::LOCALHOST)])))
        .with_subscribers(vec![Arc::clone(&watch) as Arc<dyn Subscribe>])
        .build()
        .await;
    rt.raise_startup();

    for host in ["www.example.com", "ads.example.net", "localhost"] {
        println!("{host:<18} -> {}", rt.route(host).as_label());
    }

    // The tunnel has no server yet, so forwarded hosts fail fast.
    if let Some(tunnel) = rt.transport_for(Disposition::Forward) {
        if let Err(e) = tunnel.dial("tcp", "www.example.com:80").await {
            println!("tunnel dial: {e} (config error: {})", e.is_config());
        }
    }

    let target = echo_server().await?;
    let direct = rt
        .transport_for(rt.route("localhost"))
        .ok_or_else(|| anyhow::anyhow!("localhost is blocked"))?;
    let mut conn = direct.dial("tcp", &target).await?;
    conn.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await?;
    println!("echo: {}", String::from_utf8_lossy(&buf));
    println!("while open: {:?}", rt.counters().snapshot());

    drop(conn);
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("after close: {:?}", rt.counters().snapshot());
    println!("counter notifications: {}", watch.changes.load(Ordering::Relaxed));

    rt.request_shutdown();
    rt.run_until_shutdown().await?;
    Ok(())
}
