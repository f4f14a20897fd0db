use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::negotiation::AcceptorPolicy;
use crate::scp::{Scp, ServerOptions, handle_association};
use crate::statistics::Statistics;

/// Accept associations on a TCP listener.
///
/// Every TCP connection is handled by [handle_association] on its own task, with `scp`
/// answering its requests.
///
/// `finite_connections` is mostly useful for testing: the loop stops accepting after that
/// many connections, and returns once they are all done.
pub async fn dicom_listener_tcp_loop<T: Scp + 'static>(
    listener: TcpListener,
    scp: Arc<T>,
    policy: AcceptorPolicy,
    options: ServerOptions,
    finite_connections: Option<usize>,
) -> anyhow::Result<()> {
    tracing::info!("listening on: tcp://{}", listener.local_addr()?);
    let policy = Arc::new(policy);
    let options = Arc::new(options);
    let mut associations = JoinSet::new();
    let mut accepted = 0;
    while finite_connections.is_none_or(|n| accepted < n) {
        let (stream, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!("could not accept connection: {e}");
                continue;
            }
        };
        accepted += 1;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("could not set TCP_NODELAY: {e}");
        }
        let ulid = ulid::Ulid::new();
        let span = tracing::info_span!(
            "association",
            association_ulid = %ulid,
            client.address = %peer.ip(),
            client.port = peer.port(),
        );
        let scp = Arc::clone(&scp);
        let policy = Arc::clone(&policy);
        let shared = Arc::clone(&options);
        associations.spawn(
            async move {
                let statistics = Arc::new(Statistics::default());
                let options = ServerOptions {
                    statistics: Arc::new((Arc::clone(&statistics), Arc::clone(&shared.statistics))),
                    ..(*shared).clone()
                };
                match handle_association(stream, scp.as_ref(), &policy, &options).await {
                    Ok(()) => tracing::info!(%statistics, "association finished"),
                    Err(e) => tracing::error!(%statistics, "{:?}", e),
                }
            }
            .instrument(span),
        );
        while let Some(result) = associations.try_join_next() {
            if let Err(e) = result {
                tracing::error!("association task failed: {e}");
            }
        }
    }
    while let Some(result) = associations.join_next().await {
        if let Err(e) = result {
            tracing::error!("association task failed: {e}");
        }
    }
    Ok(())
}
