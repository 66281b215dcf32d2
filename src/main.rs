mod collectors;
mod config;
mod http;
mod metrics;
mod poller;
mod state;

use axum::serve;
use clap::Parser;
use config::Config;
use metrics::Metrics;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpumond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    show_config: bool,
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if !cli.hosts.is_empty() {
        cfg.hosts = cli.hosts.clone();
        if let Err(err) = cfg.validate() {
            error!(error = %err, "некорректный список хостов из --hosts");
            std::process::exit(1);
        }
    }
    if cli.show_config {
        match serde_yaml::to_string(&cfg) {
            Ok(text) => print!("{text}"),
            Err(err) => {
                error!(error = %err, "не удалось сериализовать конфигурацию");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        hosts = cfg.hosts.len(),
        "запуск gpumond"
    );

    let cfg = Arc::new(cfg);
    let shared_state = Arc::new(RwLock::new(State::new(poller::now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };
    metrics.set_hosts_configured(cfg.hosts.len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let mut poller_tasks = Vec::with_capacity(cfg.hosts.len());
    for host in cfg.hosts.iter().cloned() {
        poller_tasks.push(tokio::spawn(poller::poll_host(
            host,
            cfg.clone(),
            shared_state.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        )));
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    for task in poller_tasks {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
