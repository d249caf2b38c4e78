//! Inicialización de logs para binarios que usan la librería.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Instala un subscriber `fmt` filtrado por `RUST_LOG`.
///
/// The library itself only emits `tracing` events; call this once from the
/// embedding binary if it has no subscriber of its own.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("open_link=debug".parse()?)
                .add_directive("reqwest=info".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    tracing::info!("🎵 open-link v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
