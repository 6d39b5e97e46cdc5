use std::path::PathBuf;
use std::sync::Arc;

use hearth::config::load_config;
use hearth::http::{Request, Response};
use hearth::server::{Application, Dispatch, TransportListener};
use hearth::session::Session;
use hearth::store::build_store;

/// Default dispatch used when the binary runs standalone: echoes the
/// session id and a per-session request counter.
struct EchoDispatch;

#[async_trait::async_trait]
impl Dispatch for EchoDispatch {
    async fn dispatch(
        &self,
        request: &mut Request,
        session: &mut Session,
        _application: &Application,
    ) -> Result<Response, Box<dyn std::error::Error + Send + Sync>> {
        let visits: i64 = session.get("visits").await?.unwrap_or(0) + 1;
        session.set("visits", &visits).await?;
        Ok(Response::text(format!(
            "{} {} session={} visits={}\n",
            request.method,
            request.path,
            session.id(),
            visits
        )))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hearth.toml"));
    let config = Arc::new(load_config(&config_path)?);

    hearth::observability::init_logging(&config.observability.log_filter);
    tracing::info!(config = %config_path.display(), "starting");

    let store = build_store(&config).await?;
    let listener = TransportListener::new(config, store, Arc::new(EchoDispatch));
    listener.run().await?;

    tracing::info!("stopped");
    Ok(())
}
