// SPDX-License-Identifier: MIT
//! Optional local HTTP media relay (spec §4.11): a whitelisted file server
//! reachable only through HMAC-signed, TTL'd URLs, so a OneBot
//! implementation that can't accept `file://` or base64 payloads can still
//! fetch outbound media over plain HTTP without exposing the filesystem.

mod registry;
mod server;
mod sign;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use qqgate_config::MediaRelayConfig;
use qqgate_onebot::sender::RelayUrlIssuer;
use registry::{now_unix, Registry};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub use server::RelayState;

/// Issues relay URLs and owns the registry backing the relay's file server.
/// Cloning is cheap — every field is an `Arc`.
#[derive(Clone)]
pub struct MediaRelay {
    registry: Arc<Registry>,
    mac_key: Arc<Vec<u8>>,
    base_url: String,
    path: String,
    host: String,
    port: u16,
}

impl MediaRelay {
    pub fn new(config: &MediaRelayConfig) -> Self {
        let mac_key = config
            .token
            .clone()
            .unwrap_or_else(|| {
                info!("no relay token configured, generating an ephemeral one for this run");
                Uuid::new_v4().to_string()
            })
            .into_bytes();
        Self {
            registry: Arc::new(Registry::new()),
            mac_key: Arc::new(mac_key),
            base_url: format!("http://{}:{}", config.host, config.port),
            path: config.path.clone(),
            host: config.host.clone(),
            port: config.port,
        }
    }

    /// Spawns the axum server and a background sweep task. Returns once the
    /// server has started listening; both tasks run until `shutdown` fires.
    pub async fn serve(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let ip: IpAddr = self.host.parse().unwrap_or(IpAddr::from([127, 0, 0, 1]));
        let addr = SocketAddr::new(ip, self.port);
        let state = Arc::new(RelayState { registry: self.registry.clone(), mac_key: (*self.mac_key).clone() });
        let router = server::router(&self.path, state);

        let sweep_token = shutdown.clone();
        let sweep_registry = self.registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => sweep_registry.sweep_expired(now_unix()),
                    _ = sweep_token.cancelled() => break,
                }
            }
        });

        server::serve(addr, router, shutdown).await
    }
}

impl RelayUrlIssuer for MediaRelay {
    fn issue_url(&self, local_path: &Path, ttl_secs: u64) -> Option<String> {
        let id = Uuid::new_v4().to_string();
        let exp = now_unix() + ttl_secs as i64;
        self.registry.insert(id.clone(), local_path.to_path_buf(), exp);
        let sig = sign::sign(&self.mac_key, &id, exp);
        Some(format!("{}{}/{id}?exp={exp}&sig={sig}", self.base_url, self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qqgate_config::MediaRelayConfig;

    fn test_config() -> MediaRelayConfig {
        MediaRelayConfig {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 18080,
            path: "/media".into(),
            token: Some("unit-test-secret".into()),
            ttl_sec: 300,
        }
    }

    #[test]
    fn issued_url_carries_signature_and_expiry() {
        let relay = MediaRelay::new(&test_config());
        let url = relay.issue_url(Path::new("/tmp/foo.png"), 300).unwrap();
        assert!(url.starts_with("http://127.0.0.1:18080/media/"));
        assert!(url.contains("exp="));
        assert!(url.contains("sig="));
    }

    #[test]
    fn issued_id_resolves_in_registry() {
        let relay = MediaRelay::new(&test_config());
        let url = relay.issue_url(Path::new("/tmp/foo.png"), 300).unwrap();
        let id = url.rsplit('/').next().unwrap().split('?').next().unwrap();
        assert_eq!(relay.registry.resolve(id, now_unix()), Some(std::path::PathBuf::from("/tmp/foo.png")));
    }
}
