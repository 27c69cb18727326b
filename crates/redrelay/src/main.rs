use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix;

mod config;
use config::Config;

/// A replication relay between Redis deployments: persists the upstream's
/// replication stream into a durable channel and syncs that channel between
/// peer nodes.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "REDRELAY_CONFIG")]
    config: std::path::PathBuf,

    /// Log filter, e.g. "info" or "syncer=debug,info".
    #[arg(long, default_value = "info", env = "REDRELAY_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log)
        .with_context(|| format!("invalid log filter {:?}", cli.log))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config)?;
    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let channel = channel::Channel::recover(config.channel.clone())
        .await
        .context("recovering replication channel")?;
    let scope = syncer::scope::Scope::new();

    let input: Arc<syncer::SharedInput> = syncer::SharedInput::new(config.seed_run_ids()?);
    let leader = Arc::new(syncer::ReplicaLeader::new(
        input.clone(),
        channel.clone(),
        scope.child(),
    ));
    leader.start();

    let follower = config.replica.leader.clone().map(|peer| {
        let follower = syncer::ReplicaFollower::new(
            peer,
            config.input.address.clone(),
            channel.clone(),
            scope.child(),
        );
        tokio::spawn(async move { follower.run().await })
    });

    // Gracefully exit on either SIGINT (ctrl-c) or SIGTERM.
    let signal = async {
        let mut sigint = unix::signal(unix::SignalKind::interrupt()).unwrap();
        let mut sigterm = unix::signal(unix::SignalKind::terminate()).unwrap();
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
        tracing::info!("caught signal to exit");
    };

    tracing::info!(listen = %config.replica.listen, "serving replica sync");
    let service = proto_grpc::replica::replica_server::ReplicaServer::from_arc(leader.clone());
    tonic::transport::Server::builder()
        .add_service(service)
        .serve_with_shutdown(config.replica.listen, signal)
        .await
        .context("replica sync server failed")?;

    leader.stop();
    scope.cancel();

    if let Some(handle) = follower {
        match handle.await.context("joining follower task")? {
            Ok(()) => (),
            Err(err) if matches!(err, syncer::Error::LeaderTakeover { .. }) => {
                tracing::info!(error = %err, "follower ended with a leadership takeover");
            }
            Err(err) if err.needs_restart() => {
                tracing::error!(error = %err, "follower requires a sync pipeline restart");
            }
            Err(err) => tracing::error!(error = %err, "follower ended with an error"),
        }
    }
    channel.close();
    Ok(())
}
