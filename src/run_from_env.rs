use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::net::TcpListener;

use crate::example_scp::ExampleScp;
use crate::listener_tcp_loop::dicom_listener_tcp_loop;
use crate::settings::OxidimseEnvOptions;
use crate::statistics::{OtelStatistics, Statistics, StatisticsSink};

/// Run the in-memory [ExampleScp] using configuration from environment variables.
///
/// `finite_connections`: shut down the server after the given number of associations.
pub async fn run_server_from_env(finite_connections: Option<usize>) -> anyhow::Result<()> {
    let options = OxidimseEnvOptions::from_env()?;
    let meter_provider = if options.otel_metrics {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .build()?;
        let provider = SdkMeterProvider::builder()
            .with_periodic_exporter(exporter)
            .build();
        global::set_meter_provider(provider.clone());
        Some(provider)
    } else {
        None
    };
    let statistics: Arc<dyn StatisticsSink> = if meter_provider.is_some() {
        Arc::new(OtelStatistics::global())
    } else {
        Arc::new(Statistics::default())
    };

    let address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, options.listener_port);
    let listener = TcpListener::bind(address).await?;
    let result = dicom_listener_tcp_loop(
        listener,
        Arc::new(ExampleScp::with_sample_patients()),
        options.acceptor_policy(),
        options.server_options(statistics),
        finite_connections,
    )
    .await;

    if let Some(provider) = meter_provider {
        provider.shutdown()?;
    }
    result
}
