mod config;

use aviary_core::backend::InMemoryBackend;
use aviary_core::config::CoreConfig;
use aviary_core::keys::InMemorySecretStore;
use aviary_core::protocol::InMemoryProtocol;
use aviary_core::storage::DurableStore;
use aviary_core::Fleet;
use aviary_store::{KeyProvider, StoreError};
use bytes::Bytes;
use config::AviaryConfig;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Clone)]
struct DaemonKey;

impl KeyProvider for DaemonKey {
    fn master_key(&self) -> Result<[u8; 32], StoreError> {
        Ok([2u8; 32])
    }
}

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config")]
    Config,
    #[error("fleet")]
    Fleet,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("aviary.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path).map_err(|_| DaemonError::Config)?;
    init_logging(&cfg);
    let fleet = init_fleet(&cfg).await?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = start_control_server(fleet.clone(), shutdown_rx).await?;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    let _ = fleet.stop_all().await;
    Ok(())
}

fn init_logging(cfg: &AviaryConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn init_fleet(cfg: &AviaryConfig) -> Result<Arc<Fleet>, DaemonError> {
    let storage_path = cfg.data_dir.join("core");
    let core_cfg = CoreConfig {
        storage_path: storage_path.to_str().unwrap_or(".aviary").to_string(),
        namespace: cfg.fleet.namespace.clone(),
        max_awake_inboxes: cfg.fleet.max_awake_inboxes,
        eviction_protection_window_ms: cfg.fleet.eviction_protection_window_ms,
        checker_interval_ms: cfg.fleet.checker_interval_ms,
        spare_enabled: cfg.fleet.spare_enabled,
        invite_ttl_ms: cfg.fleet.invite_ttl_ms,
        conversation_ttl_ms: cfg.fleet.conversation_ttl_ms,
        ..CoreConfig::default()
    };
    let store = DurableStore::open(&storage_path, &core_cfg.namespace, &DaemonKey)
        .map_err(|_| DaemonError::Fleet)?;
    let secret = Arc::new(InMemorySecretStore::new());
    let sdk = Arc::new(InMemoryProtocol::new());
    let backend = Arc::new(InMemoryBackend::new());
    let fleet = Fleet::new(core_cfg, secret, store, sdk, backend);
    fleet
        .initialize_on_app_launch()
        .await
        .map_err(|_| DaemonError::Fleet)?;
    fleet.start();
    Ok(fleet)
}

async fn start_control_server(
    fleet: Arc<Fleet>,
    shutdown: oneshot::Receiver<()>,
) -> Result<JoinHandle<()>, DaemonError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(_) => {
            let handle = tokio::spawn(async move {
                let _ = shutdown.await;
            });
            return Ok(handle);
        }
    };
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let fleet_clone = fleet.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let fleet = fleet_clone.clone();
                                    async move { handle_request(fleet, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });
    Ok(handle)
}

async fn handle_request(
    fleet: Arc<Fleet>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method().as_str(), req.uri().path()) {
        ("GET", "/health") => Ok(Response::new(Full::from(
            serde_json::json!({"status":"ok"}).to_string(),
        ))),
        ("GET", "/stats") => {
            let stats = fleet.stats().await;
            let body = serde_json::json!({
                "awake": stats.awake,
                "sleeping": stats.sleeping,
                "spare_ready": stats.spare_ready
            });
            Ok(Response::new(Full::from(body.to_string())))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::from(Bytes::from_static(b"not found")))
            .unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FleetConfig, LoggingConfig};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn config_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf.toml");
        let cfg = format!(
            r#"
data_dir = "{dir}"

[fleet]
namespace = "test"
max_awake_inboxes = 5
spare_enabled = false

[logging]
level = "info"
"#,
            dir = dir.path().display()
        );
        std::fs::write(&path, cfg).unwrap();
        let loaded = config::load_config(&path).unwrap();
        assert_eq!(loaded.fleet.namespace, "test");
        assert_eq!(loaded.fleet.max_awake_inboxes, 5);
        assert!(!loaded.fleet.spare_enabled);
        assert_eq!(loaded.fleet.checker_interval_ms, 60 * 1000);
    }

    #[tokio::test]
    async fn daemon_starts_and_stops() {
        let dir = tempdir().unwrap();
        let cfg = AviaryConfig {
            data_dir: dir.path().to_path_buf(),
            fleet: FleetConfig {
                spare_enabled: false,
                ..FleetConfig::default()
            },
            logging: LoggingConfig {
                level: "error".to_string(),
            },
        };
        init_logging(&cfg);
        let fleet = init_fleet(&cfg).await.unwrap();
        let (tx, rx) = oneshot::channel();
        let handle = start_control_server(fleet.clone(), rx).await.unwrap();
        let _ = tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        let _ = fleet.stop_all().await;
    }
}
