//! Starts/stops a local signing proxy on demand, provisions its TLS
//! material, and gates readiness before any signed vehicle command.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Down,
    Starting,
    Up,
    Stopping,
}

struct Inner {
    state: ProxyState,
    child: Option<Child>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

/// Owns the proxy process. `ensure_up`/`stop` coalesce concurrent callers
/// onto a single in-flight transition via the `Mutex` + `Notify` pair, so
/// a second caller waits on the first rather than racing to spawn twice.
pub struct ProxySupervisor {
    private_key_path: PathBuf,
    binary_path: PathBuf,
    host: String,
    port: u16,
    tls_dir: PathBuf,
    inner: Mutex<Inner>,
    transition_done: Notify,
}

impl ProxySupervisor {
    pub fn new(
        private_key_path: PathBuf,
        binary_path: PathBuf,
        host: impl Into<String>,
        port: u16,
        tls_dir: PathBuf,
    ) -> Self {
        ProxySupervisor {
            private_key_path,
            binary_path,
            host: host.into(),
            port,
            tls_dir,
            inner: Mutex::new(Inner {
                state: ProxyState::Down,
                child: None,
                cert_path: None,
                key_path: None,
            }),
            transition_done: Notify::new(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    pub async fn state(&self) -> ProxyState {
        self.inner.lock().await.state
    }

    /// Idempotent: if already `Up` and a health probe succeeds, returns
    /// immediately. Otherwise provisions TLS material (if absent), spawns
    /// the proxy process bound to the vehicle-cloud private key, and polls
    /// health for up to 10s.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_up(&self) -> Result<String, ProxyError> {
        loop {
            let mut guard = self.inner.lock().await;
            match guard.state {
                ProxyState::Up => {
                    drop(guard);
                    if self.probe().await {
                        return Ok(self.base_url());
                    }
                    // Health regressed under us; fall through and restart.
                    let mut guard = self.inner.lock().await;
                    guard.state = ProxyState::Down;
                }
                ProxyState::Starting | ProxyState::Stopping => {
                    drop(guard);
                    self.transition_done.notified().await;
                    continue;
                }
                ProxyState::Down => {
                    guard.state = ProxyState::Starting;
                    drop(guard);
                    let result = self.start_locked().await;
                    let mut guard = self.inner.lock().await;
                    guard.state = match &result {
                        Ok(_) => ProxyState::Up,
                        Err(_) => ProxyState::Down,
                    };
                    drop(guard);
                    self.transition_done.notify_waiters();
                    return result.map(|_| self.base_url());
                }
            }
        }
    }

    async fn start_locked(&self) -> Result<(), ProxyError> {
        let key_meta = tokio::fs::metadata(&self.private_key_path)
            .await
            .map_err(|_| ProxyError::PrivateKeyNotReady)?;
        if key_meta.len() == 0 {
            return Err(ProxyError::PrivateKeyNotReady);
        }

        let (cert_path, key_path) = self.provision_tls().await?;

        let child = Command::new(&self.binary_path)
            .arg("-tls-key")
            .arg(&key_path)
            .arg("-tls-cert")
            .arg(&cert_path)
            .arg("-key-file")
            .arg(&self.private_key_path)
            .arg("-port")
            .arg(self.port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProxyError::SpawnFailed(e.to_string()))?;

        {
            let mut guard = self.inner.lock().await;
            guard.child = Some(child);
            guard.cert_path = Some(cert_path);
            guard.key_path = Some(key_path);
        }

        let deadline = Duration::from_secs(10);
        let started = tokio::time::Instant::now();
        while started.elapsed() < deadline {
            if self.probe().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.kill_locked().await;
        Err(ProxyError::NotReady)
    }

    /// Self-signed TLS key/cert pair for the local proxy, generated fresh
    /// each start since the material is ephemeral.
    async fn provision_tls(&self) -> Result<(PathBuf, PathBuf), ProxyError> {
        tokio::fs::create_dir_all(&self.tls_dir).await?;
        let cert_path = self.tls_dir.join("proxy-cert.pem");
        let key_path = self.tls_dir.join("proxy-key.pem");

        let host = self.host.clone();
        let certified = tokio::task::spawn_blocking(move || {
            rcgen::generate_simple_self_signed(vec![host])
        })
        .await
        .map_err(|e| ProxyError::SpawnFailed(e.to_string()))?
        .map_err(|e| ProxyError::SpawnFailed(e.to_string()))?;

        tokio::fs::write(&cert_path, certified.cert.pem()).await?;
        tokio::fs::write(&key_path, certified.key_pair.serialize_pem()).await?;

        Ok((cert_path, key_path))
    }

    /// `GET /api/1/vehicles` against the local URL, ignoring certificate
    /// trust. `200`/`401`/`403` all count as "alive".
    pub async fn probe(&self) -> bool {
        let client = match reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(2))
            .build()
        {
            Ok(c) => c,
            Err(_) => return false,
        };

        match client
            .get(format!("{}/api/1/vehicles", self.base_url()))
            .send()
            .await
        {
            Ok(resp) => matches!(resp.status().as_u16(), 200 | 401 | 403),
            Err(_) => false,
        }
    }

    /// Terminate the proxy process, escalating to kill after 10s, and
    /// delete the ephemeral TLS material.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        {
            let mut guard = self.inner.lock().await;
            if guard.state == ProxyState::Down {
                return;
            }
            guard.state = ProxyState::Stopping;
        }

        self.kill_locked().await;

        {
            let mut guard = self.inner.lock().await;
            guard.state = ProxyState::Down;
        }
        self.transition_done.notify_waiters();
    }

    async fn kill_locked(&self) {
        let (child, cert_path, key_path) = {
            let mut guard = self.inner.lock().await;
            (guard.child.take(), guard.cert_path.take(), guard.key_path.take())
        };

        if let Some(mut child) = child {
            if let Some(id) = child.id() {
                let _ = Command::new("kill").arg(id.to_string()).status().await;
            }
            match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(path) = cert_path {
            let _ = tokio::fs::remove_file(path).await;
        }
        if let Some(path) = key_path {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

/// Shared handle type used throughout the Worker Dispatcher.
pub type SharedProxySupervisor = Arc<ProxySupervisor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_up_refuses_missing_private_key() {
        let dir = std::env::temp_dir().join(format!("proxy-test-{}", uuid_like()));
        let missing_key = dir.join("missing-key.pem");
        let supervisor = ProxySupervisor::new(
            missing_key,
            PathBuf::from("/bin/false"),
            "127.0.0.1",
            4443,
            dir.join("tls"),
        );
        let err = supervisor.ensure_up().await.unwrap_err();
        assert!(matches!(err, ProxyError::PrivateKeyNotReady));
    }

    #[tokio::test]
    async fn ensure_up_refuses_empty_private_key() {
        let dir = std::env::temp_dir().join(format!("proxy-test-{}", uuid_like()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let empty_key = dir.join("empty-key.pem");
        tokio::fs::write(&empty_key, b"").await.unwrap();
        let supervisor = ProxySupervisor::new(
            empty_key,
            PathBuf::from("/bin/false"),
            "127.0.0.1",
            4443,
            dir.join("tls"),
        );
        let err = supervisor.ensure_up().await.unwrap_err();
        assert!(matches!(err, ProxyError::PrivateKeyNotReady));
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }
}
