//! Client for communicating with the keyrack daemon
//!
//! One request per connection: write a single JSON document, half-close,
//! read the response to EOF. For the read-side commands an unreachable
//! daemon is a normal state ("nothing unlocked yet"), so GET / STATUS /
//! RELOCK soft-fail to `None` instead of erroring.

use anyhow::{bail, Context, Result};
use keyrack_core::{KeyGrant, SessionContext};
use keyrackd::protocol::{
    GetData, PingData, RelockData, Request, Response, StatusData, StatusEntry, UnlockData,
};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Client for the daemon of this (login session, owner) pair.
    /// `KEYRACK_SOCKET` overrides the derived path.
    pub fn for_owner(ctx: &SessionContext, owner: &str) -> Self {
        let socket_path = std::env::var("KEYRACK_SOCKET")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.socket_path(owner));
        Self { socket_path }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn exchange(&self, stream: &mut UnixStream, request: &Request) -> Result<Response> {
        stream.write_all(&serde_json::to_vec(request)?).await?;
        stream.shutdown().await?;

        let mut body = Vec::new();
        stream.read_to_end(&mut body).await?;
        let response: Response =
            serde_json::from_slice(&body).context("failed to parse daemon response")?;

        if !response.success {
            bail!(
                "daemon refused request: {}",
                response.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(response)
    }

    /// Send a request, treating an unreachable daemon as an error.
    async fn send(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket_path.display()))?;
        self.exchange(&mut stream, request).await
    }

    /// Send a request, treating an unreachable daemon as `None`.
    async fn send_soft(&self, request: &Request) -> Result<Option<Response>> {
        let mut stream = match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("no daemon at {}: {}", self.socket_path.display(), e);
                return Ok(None);
            }
        };
        Ok(Some(self.exchange(&mut stream, request).await?))
    }

    /// Store a batch of grants. Unlike the read commands this is a hard
    /// call: the orchestrator just made sure the daemon is running.
    pub async fn unlock(&self, keys: Vec<KeyGrant>) -> Result<Vec<String>> {
        let resp = self.send(&Request::Unlock { keys }).await?;
        Ok(resp.parse_data::<UnlockData>()?.unlocked)
    }

    pub async fn get(
        &self,
        slugs: Vec<String>,
        org: Option<String>,
        env: Option<String>,
    ) -> Result<Option<Vec<KeyGrant>>> {
        match self.send_soft(&Request::Get { slugs, org, env }).await? {
            None => Ok(None),
            Some(resp) => Ok(Some(resp.parse_data::<GetData>()?.keys)),
        }
    }

    pub async fn status(&self) -> Result<Option<Vec<StatusEntry>>> {
        match self.send_soft(&Request::Status {}).await? {
            None => Ok(None),
            Some(resp) => Ok(Some(resp.parse_data::<StatusData>()?.keys)),
        }
    }

    pub async fn relock(
        &self,
        slugs: Option<Vec<String>>,
        env: Option<String>,
    ) -> Result<Option<Vec<String>>> {
        match self.send_soft(&Request::Relock { slugs, env }).await? {
            None => Ok(None),
            Some(resp) => Ok(Some(resp.parse_data::<RelockData>()?.relocked)),
        }
    }

    /// Liveness probe; `None` when no daemon answers.
    pub async fn ping(&self) -> Option<PingData> {
        match self.send_soft(&Request::Ping {}).await {
            Ok(Some(resp)) => resp.parse_data().ok(),
            _ => None,
        }
    }

    /// Make sure a daemon is answering on this socket, spawning one
    /// detached if needed. The daemon outlives this process.
    pub async fn ensure_running(&self, owner: &str) -> Result<()> {
        if self.ping().await.is_some() {
            return Ok(());
        }

        let binary = daemon_binary();
        debug!("spawning {} for socket {}", binary.display(), self.socket_path.display());
        spawn_detached(&binary, &self.socket_path, owner)?;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.ping().await.is_some() {
                return Ok(());
            }
        }
        bail!(
            "keyrackd did not come up on {} (run `keyrackd --socket {}` by hand to see why)",
            self.socket_path.display(),
            self.socket_path.display()
        )
    }
}

/// Locate the daemon binary: explicit override, then next to our own
/// binary, then $PATH.
fn daemon_binary() -> PathBuf {
    if let Ok(path) = std::env::var("KEYRACKD_BIN") {
        return PathBuf::from(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("keyrackd");
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    PathBuf::from("keyrackd")
}

/// Spawn the daemon in its own session so it survives this process.
fn spawn_detached(binary: &Path, socket: &Path, owner: &str) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new(binary);
    cmd.arg("--socket")
        .arg(socket)
        .arg("--owner")
        .arg(owner)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    cmd.spawn()
        .with_context(|| format!("failed to spawn {}", binary.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrack_core::grade::{DurationClass, KeyGrade, Protection};
    use keyrack_core::grant::KeySource;
    use keyrack_core::session::{peer_session_id, PeerIdentity};
    use keyrackd::Server;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_socket() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("keyrack_client_test_{}_{}.sock", std::process::id(), id))
    }

    fn self_ctx() -> SessionContext {
        let uid = unsafe { libc::getuid() };
        let me = PeerIdentity { uid, pid: Some(std::process::id() as i32) };
        SessionContext { session_id: peer_session_id(&me), uid }
    }

    fn grant(slug: &str) -> KeyGrant {
        KeyGrant {
            slug: slug.to_string(),
            secret: "v".to_string(),
            grade: KeyGrade::new(Protection::Encrypted, DurationClass::Permanent),
            source: KeySource { vault: "age".to_string(), mech: "static".to_string() },
            env: "prod".to_string(),
            org: "acme".to_string(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_read_commands_soft_fail_without_daemon() {
        let client = DaemonClient::new(test_socket());
        assert!(client.status().await.unwrap().is_none());
        assert!(client.get(vec!["a.b.c".to_string()], None, None).await.unwrap().is_none());
        assert!(client.relock(None, None).await.unwrap().is_none());
        assert!(client.ping().await.is_none());
    }

    #[tokio::test]
    async fn test_unlock_is_a_hard_failure_without_daemon() {
        let client = DaemonClient::new(test_socket());
        assert!(client.unlock(vec![grant("acme.prod.A")]).await.is_err());
    }

    #[tokio::test]
    async fn test_round_trip_against_live_daemon() {
        let path = test_socket();
        let server = Server::bind(path.clone(), self_ctx()).unwrap();
        tokio::spawn(server.run());

        let client = DaemonClient::new(path.clone());
        assert!(client.ping().await.is_some());

        let unlocked = client.unlock(vec![grant("acme.prod.A")]).await.unwrap();
        assert_eq!(unlocked, vec!["acme.prod.A"]);

        let keys = client
            .get(vec!["acme.prod.A".to_string()], Some("acme".to_string()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].secret, "v");

        let status = client.status().await.unwrap().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].ttl_left_ms, None);

        let relocked = client.relock(None, None).await.unwrap().unwrap();
        assert_eq!(relocked, vec!["acme.prod.A"]);
        let _ = std::fs::remove_file(&path);
    }
}
