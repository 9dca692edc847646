//! Demo worker: registers an echo route, exercises its sandbox, and reports
//! healthy while its plugin directory exists.

use std::path::PathBuf;

use async_trait::async_trait;
use plexus_sdk::{Hook, LogLevel, NetworkChannel, Registration, UiSlot, WorkerInfo, WorkerPlugin, serve};

#[derive(Default)]
struct EchoPlugin {
    plugin_dir: Option<PathBuf>,
}

#[async_trait]
impl WorkerPlugin for EchoPlugin {
    fn hooks(&self) -> Vec<Hook> {
        vec![Hook::HealthCheck, Hook::Cleanup]
    }

    async fn accept(&mut self, info: &WorkerInfo) -> Result<(), String> {
        self.plugin_dir = Some(info.plugin_dir.clone());
        Ok(())
    }

    async fn register(&mut self, reg: &mut Registration<'_>) -> Result<(), String> {
        let name = reg.info().plugin.clone();
        let prefix = reg
            .info()
            .config
            .get("route_prefix")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("/api")
            .to_owned();

        let own = reg
            .can_access_file("data/echo.log", true)
            .await
            .map_err(|e| e.to_string())?;
        let outbound = reg
            .can_reach("https://example.com/", NetworkChannel::Http)
            .await
            .map_err(|e| e.to_string())?;
        reg.log(
            LogLevel::Info,
            format!("sandbox probe: own files {own}, outbound http {outbound}"),
        )
        .await
        .map_err(|e| e.to_string())?;

        reg.route("GET", &format!("{prefix}/{name}/echo"))
            .await
            .map_err(|e| e.to_string())?;
        reg.ui(UiSlot::AdminPanel, &format!("{name}-settings"))
            .await
            .map_err(|e| e.to_string())
    }

    async fn health_check(&mut self) -> Result<(), String> {
        match &self.plugin_dir {
            Some(dir) if dir.is_dir() => Ok(()),
            Some(dir) => Err(format!("{} is gone", dir.display())),
            None => Err("no handshake yet".into()),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), plexus_sdk::SdkError> {
    serve(EchoPlugin::default()).await
}
