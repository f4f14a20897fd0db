#![allow(dead_code)]

use oxidimse::{AcceptorPolicy, Scp, ServerOptions, dicom_listener_tcp_loop};
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

static INIT_LOGGING: Once = Once::new();

pub(crate) fn init_logging() {
    INIT_LOGGING.call_once(|| {
        tracing::subscriber::set_global_default(
            tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .finish(),
        )
        .unwrap()
    })
}

/// Serve `finite_connections` associations on an ephemeral localhost port.
pub(crate) async fn start_server<T: Scp + 'static>(
    scp: Arc<T>,
    policy: AcceptorPolicy,
    finite_connections: usize,
) -> (SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = tokio::spawn(dicom_listener_tcp_loop(
        listener,
        scp,
        policy,
        ServerOptions::default(),
        Some(finite_connections),
    ));
    (address, server)
}

/// Everything sent on `events` until its sender is dropped.
pub(crate) async fn collect<T>(mut events: UnboundedReceiver<T>) -> Vec<T> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}
