//! Unix-socket server for the keyrack daemon
//!
//! One framed JSON request per connection: the client writes a single
//! document, half-closes, and reads the response to EOF. Session identity
//! is verified per request, before any command dispatches. Each command
//! runs as an atomic unit against the mutex-guarded store.

use crate::protocol::{
    GetData, PingData, RelockData, Request, Response, StatusData, StatusEntry, UnlockData,
};
use anyhow::{Context, Result};
use chrono::Utc;
use keyrack_core::session::{verify_peer, PeerIdentity, SessionContext};
use keyrack_core::{KeyGrant, KeyStore};
use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Requests larger than this are junk, not keys.
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// Socket file is owner-only; the session check is the real boundary.
const SOCKET_MODE: u32 = 0o600;
const SOCKET_DIR_MODE: u32 = 0o700;

pub struct Server {
    socket_path: PathBuf,
    ctx: SessionContext,
    listener: UnixListener,
    store: Arc<Mutex<KeyStore>>,
}

impl Server {
    /// Bind the daemon socket: parent directory created `0700`, stale
    /// socket files removed, socket mode forced to `0600` after bind.
    pub fn bind(socket_path: PathBuf, ctx: SessionContext) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
                fs::set_permissions(parent, fs::Permissions::from_mode(SOCKET_DIR_MODE))?;
            }
        }
        cleanup_stale_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(SOCKET_MODE))?;

        Ok(Self { socket_path, ctx, listener, store: Arc::new(Mutex::new(KeyStore::new())) })
    }

    /// The store handle, shared with every connection task.
    pub fn store(&self) -> Arc<Mutex<KeyStore>> {
        Arc::clone(&self.store)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the process dies. Connections are handled
    /// concurrently; the store mutex serializes their commands.
    pub async fn run(self) -> Result<()> {
        info!(
            socket = %self.socket_path.display(),
            session = %self.ctx.session_id,
            "keyrackd listening"
        );
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let store = Arc::clone(&self.store);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, store, ctx).await {
                    debug!("connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    store: Arc<Mutex<KeyStore>>,
    ctx: SessionContext,
) -> Result<()> {
    let response = match authorize(&stream, &ctx) {
        Err(reason) => {
            warn!("rejected connection: {}", reason);
            Response::err(reason)
        }
        Ok(()) => {
            let mut body = Vec::new();
            (&mut stream)
                .take(MAX_REQUEST_BYTES)
                .read_to_end(&mut body)
                .await
                .context("failed to read request")?;

            match serde_json::from_slice::<Request>(&body) {
                Ok(request) => dispatch(request, &store, &ctx),
                Err(e) => Response::err(format!("invalid request: {}", e)),
            }
        }
    };

    let bytes = serde_json::to_vec(&response)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Session boundary check, per request: unix peer credentials are obtained
/// per-connection, so this can never be an at-startup-only check.
fn authorize(stream: &UnixStream, ctx: &SessionContext) -> std::result::Result<(), String> {
    let cred = stream
        .peer_cred()
        .map_err(|e| format!("failed to read peer credentials: {}", e))?;
    let peer = PeerIdentity { uid: cred.uid(), pid: cred.pid().map(|p| p as i32) };
    verify_peer(ctx, &peer).map_err(|e| format!("session verification failed: {}", e))
}

fn lock_store(store: &Mutex<KeyStore>) -> MutexGuard<'_, KeyStore> {
    // A poisoned mutex only means a panic mid-command; the map itself is
    // still usable.
    store.lock().unwrap_or_else(|e| e.into_inner())
}

/// Dispatch one verified command against the store.
pub fn dispatch(request: Request, store: &Mutex<KeyStore>, ctx: &SessionContext) -> Response {
    match request {
        Request::Unlock { keys } => {
            let mut store = lock_store(store);
            let mut unlocked = Vec::with_capacity(keys.len());
            for grant in keys {
                unlocked.push(grant.slug.clone());
                store.set(grant);
            }
            debug!(count = unlocked.len(), "stored grants");
            Response::ok(&UnlockData { unlocked })
        }

        Request::Get { slugs, org, env } => {
            let mut store = lock_store(store);
            let mut keys: Vec<KeyGrant> = Vec::new();
            for slug in &slugs {
                let matched = store.get(slug).filter(|g| {
                    org.as_deref().map_or(true, |o| g.org == o || g.org == "@all")
                        && env.as_deref().map_or(true, |e| g.env == e)
                });
                if let Some(grant) = matched {
                    keys.push(grant.clone());
                }
            }
            Response::ok(&GetData { keys })
        }

        Request::Status {} => {
            let now = Utc::now();
            let mut store = lock_store(store);
            let keys = store
                .entries(None)
                .into_iter()
                .map(|g| StatusEntry {
                    slug: g.slug.clone(),
                    env: g.env.clone(),
                    org: g.org.clone(),
                    vault: g.source.vault.clone(),
                    mech: g.source.mech.clone(),
                    grade: g.grade,
                    ttl_left_ms: g.ttl_left_ms(now),
                })
                .collect();
            Response::ok(&StatusData { keys })
        }

        Request::Relock { slugs, env } => {
            let mut store = lock_store(store);
            let targets: Vec<String> = match (&slugs, &env) {
                (Some(slugs), _) => slugs.clone(),
                (None, Some(env)) => store
                    .entries(Some(env))
                    .into_iter()
                    .map(|g| g.slug.clone())
                    .collect(),
                (None, None) => store.entries(None).into_iter().map(|g| g.slug.clone()).collect(),
            };
            let relocked: Vec<String> =
                targets.into_iter().filter(|slug| store.del(slug)).collect();
            debug!(count = relocked.len(), "relocked grants");
            Response::ok(&RelockData { relocked })
        }

        Request::Ping {} => {
            let store = lock_store(store);
            Response::ok(&PingData {
                pid: std::process::id(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                session: ctx.session_id.clone(),
                size: store.size(),
            })
        }
    }
}

fn cleanup_stale_socket(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Ok(_) => anyhow::bail!("{} exists and is not a socket", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrack_core::grade::{DurationClass, KeyGrade, Protection};
    use keyrack_core::grant::KeySource;
    use keyrack_core::session::peer_session_id;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_socket() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("keyrackd_test_{}_{}.sock", std::process::id(), id))
    }

    /// A context the current process passes verification against.
    fn self_ctx() -> SessionContext {
        let uid = unsafe { libc::getuid() };
        let me = PeerIdentity { uid, pid: Some(std::process::id() as i32) };
        SessionContext { session_id: peer_session_id(&me), uid }
    }

    fn grant(slug: &str, env: &str, expires_at: Option<DateTime<Utc>>) -> KeyGrant {
        KeyGrant {
            slug: slug.to_string(),
            secret: "v".to_string(),
            grade: KeyGrade::new(Protection::Encrypted, DurationClass::Permanent),
            source: KeySource { vault: "age".to_string(), mech: "static".to_string() },
            env: env.to_string(),
            org: "acme".to_string(),
            expires_at,
        }
    }

    async fn send(path: &Path, request: &Request) -> Response {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(&serde_json::to_vec(request).unwrap()).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn spawn_server(ctx: SessionContext) -> (PathBuf, Arc<Mutex<KeyStore>>) {
        let path = test_socket();
        let server = Server::bind(path.clone(), ctx).unwrap();
        let store = server.store();
        tokio::spawn(server.run());
        (path, store)
    }

    #[tokio::test]
    async fn test_socket_mode_0600() {
        let (path, _store) = spawn_server(self_ctx()).await;
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "socket mode should be 0600, got {mode:04o}");
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_unlock_get_round_trip() {
        let (path, _store) = spawn_server(self_ctx()).await;

        let resp = send(&path, &Request::Unlock {
            keys: vec![grant("acme.prod.DB_URL", "prod", None)],
        })
        .await;
        assert!(resp.success);
        let data: UnlockData = resp.parse_data().unwrap();
        assert_eq!(data.unlocked, vec!["acme.prod.DB_URL"]);

        let resp = send(&path, &Request::Get {
            slugs: vec!["acme.prod.DB_URL".to_string()],
            org: None,
            env: None,
        })
        .await;
        let data: GetData = resp.parse_data().unwrap();
        assert_eq!(data.keys.len(), 1);
        assert_eq!(data.keys[0].secret, "v");
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_get_filters() {
        let (path, _store) = spawn_server(self_ctx()).await;
        let mut shared = grant("all.all.TOKEN", "all", None);
        shared.org = "@all".to_string();
        send(&path, &Request::Unlock {
            keys: vec![grant("acme.prod.A", "prod", None), shared],
        })
        .await;

        // org filter keeps matching org and @all grants
        let resp = send(&path, &Request::Get {
            slugs: vec!["acme.prod.A".to_string(), "all.all.TOKEN".to_string()],
            org: Some("acme".to_string()),
            env: None,
        })
        .await;
        let data: GetData = resp.parse_data().unwrap();
        assert_eq!(data.keys.len(), 2);

        // env filter drops the non-matching grant, silently
        let resp = send(&path, &Request::Get {
            slugs: vec!["acme.prod.A".to_string(), "all.all.TOKEN".to_string()],
            org: None,
            env: Some("prod".to_string()),
        })
        .await;
        let data: GetData = resp.parse_data().unwrap();
        assert_eq!(data.keys.len(), 1);
        assert_eq!(data.keys[0].slug, "acme.prod.A");
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_expired_grants_omitted() {
        let (path, store) = spawn_server(self_ctx()).await;
        send(&path, &Request::Unlock {
            keys: vec![
                grant("acme.prod.LIVE", "prod", Some(Utc::now() + Duration::hours(1))),
                grant("acme.prod.DEAD", "prod", Some(Utc::now() - Duration::seconds(1))),
            ],
        })
        .await;

        let resp = send(&path, &Request::Status {}).await;
        let data: StatusData = resp.parse_data().unwrap();
        assert_eq!(data.keys.len(), 1);
        assert_eq!(data.keys[0].slug, "acme.prod.LIVE");
        assert!(data.keys[0].ttl_left_ms.unwrap() > 0);

        // The read purged the expired grant from the store itself
        assert_eq!(lock_store(&store).size(), 1);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_status_reports_no_expiry_as_null() {
        let (path, _store) = spawn_server(self_ctx()).await;
        send(&path, &Request::Unlock { keys: vec![grant("acme.prod.A", "prod", None)] }).await;
        let resp = send(&path, &Request::Status {}).await;
        assert_eq!(resp.data.unwrap()["keys"][0]["ttl_left_ms"], serde_json::Value::Null);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_relock_env_filter() {
        let (path, store) = spawn_server(self_ctx()).await;
        send(&path, &Request::Unlock {
            keys: vec![
                grant("acme.prod.PROD_KEY", "prod", None),
                grant("acme.sudo.SUDO_KEY", "sudo", None),
                grant("acme.all.ALL_KEY", "all", None),
            ],
        })
        .await;

        let resp = send(&path, &Request::Relock {
            slugs: None,
            env: Some("sudo".to_string()),
        })
        .await;
        let data: RelockData = resp.parse_data().unwrap();
        assert_eq!(data.relocked, vec!["acme.sudo.SUDO_KEY"]);

        let mut remaining: Vec<String> = lock_store(&store)
            .entries(None)
            .into_iter()
            .map(|g| g.slug.clone())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["acme.all.ALL_KEY", "acme.prod.PROD_KEY"]);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_relock_all_and_exact_slugs() {
        let (path, store) = spawn_server(self_ctx()).await;
        send(&path, &Request::Unlock {
            keys: vec![grant("acme.prod.A", "prod", None), grant("acme.prod.B", "prod", None)],
        })
        .await;

        let resp = send(&path, &Request::Relock {
            slugs: Some(vec!["acme.prod.A".to_string(), "acme.prod.MISSING".to_string()]),
            env: None,
        })
        .await;
        let data: RelockData = resp.parse_data().unwrap();
        assert_eq!(data.relocked, vec!["acme.prod.A"]);

        let resp = send(&path, &Request::Relock { slugs: None, env: None }).await;
        let data: RelockData = resp.parse_data().unwrap();
        assert_eq!(data.relocked, vec!["acme.prod.B"]);
        assert_eq!(lock_store(&store).size(), 0);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_session_isolation_rejects_before_dispatch() {
        let mut ctx = self_ctx();
        ctx.session_id = "some-other-login-session".to_string();
        let (path, store) = spawn_server(ctx).await;

        // Syntactically valid UNLOCK, wrong session: rejected, store untouched
        let resp = send(&path, &Request::Unlock {
            keys: vec![grant("acme.prod.A", "prod", None)],
        })
        .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("session"));
        assert_eq!(lock_store(&store).size(), 0);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_malformed_request_gets_structured_error() {
        let (path, _store) = spawn_server(self_ctx()).await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"{\"command\":\"EXPLODE\",\"payload\":{}}").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        let resp: Response = serde_json::from_slice(&body).unwrap();
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("invalid request"));
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let path = test_socket();
        let first = Server::bind(path.clone(), self_ctx()).unwrap();
        drop(first);
        // Stale file left behind; a fresh bind must succeed
        let second = Server::bind(path.clone(), self_ctx()).unwrap();
        assert_eq!(second.socket_path(), path);
        let _ = fs::remove_file(&path);
    }
}
