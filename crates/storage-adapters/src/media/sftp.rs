//! # SFTP blob store
//!
//! Writes blobs to a remote file server over a single key-authenticated SFTP
//! session. All operations are serialized through one client handle behind
//! a mutex. When the session dies a background task reconnects every
//! [`RECONNECT_DELAY`] until it succeeds; while disconnected, writes and
//! deletes fail fast with [`StoreError::NoConnection`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use domains::{blob_keys, BlobStore, FileType, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Failure of a single remote operation.
#[derive(Debug, Error)]
pub enum SftpOpError {
    /// The session is unusable; the handle must be replaced.
    #[error("session lost: {0}")]
    Disconnected(String),
    #[error("{0}")]
    Failed(String),
}

/// A connected SFTP session. Methods block and are run on the blocking pool.
pub trait SftpClient: Send + Sync {
    /// Creates `path` and its missing parents, then writes `data` to a new
    /// file. An existing file is left untouched and counts as success.
    fn write_new(&self, path: &str, data: &[u8]) -> Result<(), SftpOpError>;

    /// Removes `path`; a missing file is not an error.
    fn remove(&self, path: &str) -> Result<(), SftpOpError>;
}

/// Opens new sessions for the reconnect loop.
pub trait SftpConnector: Send + Sync + 'static {
    fn connect(&self) -> Result<Arc<dyn SftpClient>, SftpOpError>;
}

struct Shared {
    client: Mutex<Option<Arc<dyn SftpClient>>>,
    lost: Notify,
    connector: Arc<dyn SftpConnector>,
    retry_delay: Duration,
}

pub struct SftpStore {
    shared: Arc<Shared>,
    /// Remote directory the layout is rooted at
    root: String,
}

impl SftpStore {
    /// Starts disconnected and spawns the reconnect task, which makes the
    /// first connection attempt immediately.
    pub fn spawn(connector: Arc<dyn SftpConnector>, root: impl Into<String>) -> Self {
        Self::spawn_with_delay(connector, root, RECONNECT_DELAY)
    }

    pub fn spawn_with_delay(
        connector: Arc<dyn SftpConnector>,
        root: impl Into<String>,
        retry_delay: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            client: Mutex::new(None),
            lost: Notify::new(),
            connector,
            retry_delay,
        });
        tokio::spawn(reconnect_loop(Arc::clone(&shared)));
        Self {
            shared,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.client.lock().await.is_some()
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.root, key)
    }

    /// Runs `op` against the current client while holding the mutex.
    async fn with_client<F>(&self, op: F) -> Result<(), StoreError>
    where
        F: FnOnce(&dyn SftpClient) -> Result<(), SftpOpError> + Send + 'static,
    {
        let mut guard = self.shared.client.lock().await;
        let client = guard.clone().ok_or(StoreError::NoConnection)?;
        let res = tokio::task::spawn_blocking(move || op(client.as_ref()))
            .await
            .map_err(|e| StoreError::Remote(format!("sftp task failed: {e}")))?;

        match res {
            Ok(()) => Ok(()),
            Err(SftpOpError::Disconnected(msg)) => {
                warn!(error = %msg, "sftp session lost");
                *guard = None;
                self.shared.lost.notify_one();
                Err(StoreError::Remote(msg))
            }
            Err(SftpOpError::Failed(msg)) => Err(StoreError::Remote(msg)),
        }
    }
}

async fn reconnect_loop(shared: Arc<Shared>) {
    loop {
        if shared.client.lock().await.is_some() {
            shared.lost.notified().await;
            continue;
        }

        // Connect outside the mutex; it is only taken for the swap
        let connector = Arc::clone(&shared.connector);
        match tokio::task::spawn_blocking(move || connector.connect()).await {
            Ok(Ok(client)) => {
                *shared.client.lock().await = Some(client);
                info!("sftp connected");
            }
            Ok(Err(e)) => {
                warn!(error = %e, retry_in = ?shared.retry_delay, "sftp connect failed");
                tokio::time::sleep(shared.retry_delay).await;
            }
            Err(e) => {
                warn!(error = %e, "sftp connect task failed");
                tokio::time::sleep(shared.retry_delay).await;
            }
        }
    }
}

#[async_trait]
impl BlobStore for SftpStore {
    async fn write(
        &self,
        sha1: &str,
        file_type: FileType,
        thumb_type: FileType,
        src: Bytes,
        thumb: Option<Bytes>,
    ) -> Result<(), StoreError> {
        let (src_key, thumb_key) = blob_keys(sha1, file_type, thumb_type);
        let mut writes = vec![(self.path(&src_key), src)];
        if let (Some(key), Some(data)) = (thumb_key, thumb) {
            writes.push((self.path(&key), data));
        }
        self.with_client(move |client| {
            writes
                .iter()
                .try_for_each(|(path, data)| client.write_new(path, data))
        })
        .await
    }

    async fn delete(&self, sha1: &str, file_type: FileType, thumb_type: FileType) -> Result<(), StoreError> {
        let (src_key, thumb_key) = blob_keys(sha1, file_type, thumb_type);
        let mut paths = vec![self.path(&src_key)];
        paths.extend(thumb_key.map(|k| self.path(&k)));
        self.with_client(move |client| paths.iter().try_for_each(|p| client.remove(p)))
            .await
    }
}

#[cfg(feature = "media-sftp")]
pub use libssh2::{Ssh2Connector, Ssh2Settings};

#[cfg(feature = "media-sftp")]
mod libssh2 {
    //! libssh2-backed client.

    use std::io::Write;
    use std::net::TcpStream;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};

    use super::{SftpClient, SftpConnector, SftpOpError};

    /// SFTP status codes (draft-ietf-secsh-filexfer-02)
    const FX_NO_SUCH_FILE: i32 = 2;
    const FX_FILE_ALREADY_EXISTS: i32 = 11;

    #[derive(Debug, Clone)]
    pub struct Ssh2Settings {
        pub host: String,
        pub port: u16,
        pub user: String,
        pub private_key: PathBuf,
        pub passphrase: Option<String>,
    }

    pub struct Ssh2Connector {
        settings: Ssh2Settings,
    }

    impl Ssh2Connector {
        pub fn new(settings: Ssh2Settings) -> Self {
            Self { settings }
        }
    }

    impl SftpConnector for Ssh2Connector {
        fn connect(&self) -> Result<Arc<dyn SftpClient>, SftpOpError> {
            let s = &self.settings;
            let tcp = TcpStream::connect((s.host.as_str(), s.port))
                .map_err(|e| SftpOpError::Disconnected(e.to_string()))?;
            let mut session = Session::new().map_err(lost)?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(lost)?;
            session
                .userauth_pubkey_file(&s.user, None, &s.private_key, s.passphrase.as_deref())
                .map_err(lost)?;
            let sftp = session.sftp().map_err(lost)?;
            Ok(Arc::new(Ssh2Client {
                inner: Mutex::new((session, sftp)),
            }))
        }
    }

    struct Ssh2Client {
        inner: Mutex<(Session, Sftp)>,
    }

    fn lost(e: ssh2::Error) -> SftpOpError {
        SftpOpError::Disconnected(e.to_string())
    }

    fn sftp_code(e: &ssh2::Error) -> Option<i32> {
        match e.code() {
            ErrorCode::SFTP(code) => Some(code),
            ErrorCode::Session(_) => None,
        }
    }

    /// Session-level errors mean the transport is gone.
    fn classify(e: ssh2::Error) -> SftpOpError {
        match sftp_code(&e) {
            Some(_) => SftpOpError::Failed(e.to_string()),
            None => lost(e),
        }
    }

    fn mkdir_all(sftp: &Sftp, dir: &Path) -> Result<(), SftpOpError> {
        if sftp.stat(dir).is_ok() {
            return Ok(());
        }
        if let Some(parent) = dir.parent() {
            if !parent.as_os_str().is_empty() {
                mkdir_all(sftp, parent)?;
            }
        }
        match sftp.mkdir(dir, 0o700) {
            Ok(()) => Ok(()),
            // Lost a race with another writer
            Err(_) if sftp.stat(dir).is_ok() => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    impl SftpClient for Ssh2Client {
        fn write_new(&self, path: &str, data: &[u8]) -> Result<(), SftpOpError> {
            let guard = self
                .inner
                .lock()
                .map_err(|_| SftpOpError::Disconnected("client mutex poisoned".into()))?;
            let sftp = &guard.1;
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                mkdir_all(sftp, parent)?;
            }
            let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
            let mut file = match sftp.open_mode(path, flags, 0o660, OpenType::File) {
                Ok(f) => f,
                Err(e) if sftp_code(&e) == Some(FX_FILE_ALREADY_EXISTS) => return Ok(()),
                // Many servers report an existing file as a generic failure
                Err(e) if sftp_code(&e).is_some() && sftp.stat(path).is_ok() => return Ok(()),
                Err(e) => return Err(classify(e)),
            };
            file.write_all(data)
                .map_err(|e| SftpOpError::Disconnected(e.to_string()))
        }

        fn remove(&self, path: &str) -> Result<(), SftpOpError> {
            let guard = self
                .inner
                .lock()
                .map_err(|_| SftpOpError::Disconnected("client mutex poisoned".into()))?;
            match guard.1.unlink(Path::new(path)) {
                Err(e) if sftp_code(&e) != Some(FX_NO_SUCH_FILE) => Err(classify(e)),
                _ => Ok(()),
            }
        }
    }
}
