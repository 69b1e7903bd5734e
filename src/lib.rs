pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;

use crate::proxy::controller::CacheController;
use crate::proxy::forward::TcpTransport;
use crate::proxy::layer::{InMemoryLayer, StorageCascade};
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let memory = Arc::new(InMemoryLayer::new(settings.memory_cache_size));
    let cascade = StorageCascade::new(vec![memory]);

    let transport = Arc::new(TcpTransport::new(
        settings.upstream_connect_timeout(),
        settings.upstream_timeout(),
        settings.max_header_size,
        settings.max_body_size,
    ));

    let mut controller = CacheController::new(cascade, transport)
        .with_cache_config(Arc::new(settings.cache_config()?));
    if let Some(forward) = settings.forward_config() {
        controller = controller.with_forward_config(Arc::new(forward));
    }

    let app = proxy::AppContext::new(settings, Arc::new(controller));
    proxy::run(app).await
}
