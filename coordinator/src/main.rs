// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use jm_coordinator::config::CoordinatorConfig;
use jm_coordinator::election::{LeaderElectionClient, LeadershipEvent, StandaloneElectionClient};
use jm_coordinator::grpc_client::JobManagerClientGrpc;
use jm_coordinator::grpc_worker::JobManagerWorkerGrpc;
use jm_coordinator::messages::CoordinatorEvent;
use jm_coordinator::proto::client_grpc_server::ClientGrpcServer;
use jm_coordinator::proto::worker_grpc_server::WorkerGrpcServer;
use jm_coordinator::{coordinator, scheduler::TaskDistribution};
use log::{error, info};
use tonic::transport::Server;

/// The job manager process: a single coordinator that schedules
/// submitted jobs onto registered worker instances.
#[derive(Parser, Debug)]
#[clap(name = "job-manager")]
struct Args {
    /// Address to bind the worker/client gRPC services to.
    #[clap(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// Port to bind the gRPC services to. Forced to an ephemeral port
    /// when `--ha-enabled` is set.
    #[clap(long, default_value_t = 50050)]
    bind_port: u16,

    /// Enable high-availability leader election against etcd.
    #[clap(long)]
    ha_enabled: bool,

    /// Comma-separated etcd endpoints, required when `--ha-enabled` is set.
    #[clap(long, default_value = "")]
    etcd_endpoints: String,

    /// Port to expose Prometheus metrics on. Pass 0 to disable.
    #[clap(long, default_value_t = 9090)]
    metrics_port: u16,

    /// Task slot reservation policy: "bias" or "round-robin".
    #[clap(long, default_value = "bias")]
    task_distribution: String,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn build_config(args: &Args) -> Result<CoordinatorConfig, String> {
    let task_distribution = match args.task_distribution.as_str() {
        "bias" => TaskDistribution::Bias,
        "round-robin" => TaskDistribution::RoundRobin,
        other => return Err(format!("unknown task distribution policy: {other}")),
    };

    let etcd_endpoints: Vec<String> = args
        .etcd_endpoints
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if args.ha_enabled && etcd_endpoints.is_empty() {
        return Err("--ha-enabled requires at least one --etcd-endpoints entry".to_string());
    }

    Ok(CoordinatorConfig::default()
        .with_bind(args.bind_host.clone(), args.bind_port)
        .with_ha_enabled(args.ha_enabled)
        .with_etcd_endpoints(etcd_endpoints)
        .with_task_distribution(task_distribution)
        .with_metrics_bind_port((args.metrics_port != 0).then_some(args.metrics_port)))
}

#[cfg(feature = "etcd")]
async fn build_election_client(
    config: &CoordinatorConfig,
) -> Result<Arc<dyn LeaderElectionClient>, String> {
    if config.ha_enabled {
        let client = jm_coordinator::election::etcd::EtcdElectionClient::connect(
            config.etcd_endpoints.clone(),
            "job-manager-leader".to_string(),
            format!("{}:{}", config.bind_host, config.bind_port),
        )
        .await
        .map_err(|e| e.to_string())?;
        Ok(Arc::new(client))
    } else {
        Ok(Arc::new(StandaloneElectionClient))
    }
}

#[cfg(not(feature = "etcd"))]
async fn build_election_client(
    _config: &CoordinatorConfig,
) -> Result<Arc<dyn LeaderElectionClient>, String> {
    Ok(Arc::new(StandaloneElectionClient))
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    match run().await {
        Ok(()) => std::process::ExitCode::from(0),
        Err(code) => std::process::ExitCode::from(code),
    }
}

async fn run() -> Result<(), u8> {
    init_logging();

    let args = Args::parse();
    let config = build_config(&args).map_err(|e| {
        error!("Invalid configuration: {e}");
        1
    })?;

    let metrics_port = config.metrics_bind_port;
    let metrics: Option<Arc<dyn jm_coordinator::metrics::CoordinatorMetricsCollector>> = {
        #[cfg(feature = "prometheus-metrics")]
        {
            jm_coordinator::metrics::prometheus::PrometheusMetricsCollector::current().ok()
        }
        #[cfg(not(feature = "prometheus-metrics"))]
        {
            None
        }
    };

    let (_state, sender) = coordinator::spawn(config.clone(), metrics);

    let election_client = build_election_client(&config).await.map_err(|e| {
        error!("Failed to set up leader election: {e}");
        1
    })?;

    forward_leadership_events(election_client, sender.clone()).await.map_err(|e| {
        error!("Failed to campaign for leadership: {e}");
        1
    })?;

    #[cfg(feature = "prometheus-metrics")]
    if let Some(port) = metrics_port {
        spawn_metrics_server(port);
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_host, config.bind_port)
        .parse()
        .map_err(|e| {
            error!("Invalid bind address: {e}");
            1
        })?;

    info!("Job manager listening on {addr}");

    Server::builder()
        .add_service(WorkerGrpcServer::new(JobManagerWorkerGrpc::new(sender.clone())))
        .add_service(ClientGrpcServer::new(JobManagerClientGrpc::new(sender)))
        .serve(addr)
        .await
        .map_err(|e| {
            error!("gRPC server exited with an error: {e}");
            2
        })?;

    Ok(())
}

/// A grant is only a proposal until `confirm` returns successfully
/// (Standby -> Confirming -> Leading). A session that fails to confirm is
/// never forwarded as `LeadershipGranted`, so this coordinator stays in
/// standby rather than serving leader duties on a session it doesn't
/// actually hold.
async fn forward_leadership_events(
    election_client: Arc<dyn LeaderElectionClient>,
    sender: jm_core::event_loop::EventSender<CoordinatorEvent>,
) -> Result<(), jm_core::error::JobManagerError> {
    let mut events = election_client.campaign().await?;
    tokio::task::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LeadershipEvent::Granted(session) => {
                    if let Err(e) = election_client.confirm(session).await {
                        error!("Failed to confirm leader session {session}, staying in standby: {e}");
                        continue;
                    }
                    if sender
                        .post_event(CoordinatorEvent::LeadershipGranted(session))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                LeadershipEvent::Lost => {
                    if sender.post_event(CoordinatorEvent::LeadershipLost).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(feature = "prometheus-metrics")]
fn spawn_metrics_server(port: u16) {
    use warp::Filter;

    let metrics_route = warp::path("metrics").and_then(|| async move {
        jm_coordinator::metrics::prometheus::get_metrics()
            .map_err(|_| warp::reject::reject())
    });

    tokio::task::spawn(async move {
        warp::serve(metrics_route)
            .run(([0, 0, 0, 0], port))
            .await;
    });
}
