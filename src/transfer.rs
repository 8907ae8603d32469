//! File transfer engine: uploads and downloads files over a [`Chain`]'s
//! target hop by piping bytes through `cat`, rather than relying on a
//! separate SFTP subsystem.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use russh::ChannelMsg;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::chain::Chain;
use crate::error::{CoreError, Result};

const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub id: String,
    pub remote_path: String,
    pub local_path: String,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub speed: u64,
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
}

impl TransferProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Uploads and downloads over one [`Chain`]. Intermediate progress is
/// delivered best-effort on the supplied channel; the terminal
/// `Completed`/`Failed` record is always sent, awaiting channel capacity
/// rather than being dropped.
pub struct TransferEngine {
    chain: Arc<Chain>,
}

impl TransferEngine {
    pub fn new(chain: Arc<Chain>) -> Self {
        Self { chain }
    }

    /// Resolve the actual remote filename: if `remote_path` ends with `/`
    /// or names an existing remote directory, the local file's basename is
    /// appended; otherwise `remote_path` is used verbatim.
    async fn resolve_remote_file_path(&self, local_path: &Path, remote_path: &str) -> Result<String> {
        let is_dir = if remote_path.ends_with('/') {
            true
        } else {
            let probe = self
                .chain
                .execute(&format!("test -d {} && echo yes", shell_quote(remote_path)))
                .await?;
            probe.stdout_string().trim() == "yes"
        };

        if !is_dir {
            return Ok(remote_path.to_string());
        }

        let file_name = local_path
            .file_name()
            .ok_or_else(|| CoreError::TransferIo(format!("local path {} has no file name", local_path.display())))?;
        let base = remote_path.trim_end_matches('/');
        Ok(format!("{base}/{}", file_name.to_string_lossy()))
    }

    /// Upload a single local file to `remote_path`, chunked in `CHUNK_SIZE`
    /// pieces through `cat > remote_path`. If `remote_path` names a
    /// directory, the local file's basename is appended. On success the
    /// remote file is `chmod 644`d in a fresh session.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let metadata = tokio::fs::metadata(local_path).await?;
        let total_bytes = metadata.len();

        let resolved_path = self.resolve_remote_file_path(local_path, remote_path).await?;

        let mut file = tokio::fs::File::open(local_path).await?;
        let mut channel = self.chain.new_session().await?;
        channel
            .exec(true, format!("cat > {}", shell_quote(&resolved_path)))
            .await
            .map_err(|e| CoreError::TransferIo(e.to_string()))?;

        let start = Instant::now();
        let mut transferred: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];

        let result: Result<()> = async {
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                channel
                    .data(&buf[..n])
                    .await
                    .map_err(|e| CoreError::TransferIo(e.to_string()))?;
                transferred += n as u64;
                emit_progress(
                    &progress,
                    &id,
                    &resolved_path,
                    local_path,
                    TransferDirection::Upload,
                    TransferState::InProgress,
                    total_bytes,
                    transferred,
                    start,
                    None,
                )
                .await;
            }
            channel.eof().await.map_err(|e| CoreError::TransferIo(e.to_string()))?;
            drain_exit_status(&mut channel).await?;

            let chmod = self.chain.execute(&format!("chmod 644 {}", shell_quote(&resolved_path))).await?;
            if !chmod.success() {
                return Err(CoreError::TransferIo(format!(
                    "chmod 644 {resolved_path} failed: {}",
                    chmod.stderr_string()
                )));
            }
            Ok(())
        }
        .await;

        let (state, error) = match &result {
            Ok(()) => (TransferState::Completed, None),
            Err(e) => (TransferState::Failed, Some(e.user_message())),
        };
        emit_terminal(
            &progress,
            &id,
            &resolved_path,
            local_path,
            TransferDirection::Upload,
            state,
            total_bytes,
            transferred,
            start,
            error,
        )
        .await;

        result
    }

    /// Upload every regular file under `local_dir` to `remote_dir`,
    /// preserving relative paths. Best-effort: one file's failure does not
    /// abort the rest.
    pub async fn upload_directory(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<Vec<(std::path::PathBuf, Result<()>)>> {
        let mkdir = self
            .chain
            .execute(&format!("mkdir -p {}", shell_quote(remote_dir)))
            .await?;
        if !mkdir.success() {
            return Err(CoreError::TransferIo(format!(
                "could not create remote directory {remote_dir}: {}",
                mkdir.stderr_string()
            )));
        }

        let mut results = Vec::new();
        let mut entries = tokio::fs::read_dir(local_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), file_name.to_string_lossy());
            let result = self.upload_file(&path, &remote_path, progress.clone()).await;
            results.push((path, result));
        }
        Ok(results)
    }

    /// Download `remote_path` to `local_path` via `stat` (for size) then
    /// `cat remote_path`.
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();

        let stat = self
            .chain
            .execute(&format!("stat -c %s {}", shell_quote(remote_path)))
            .await?;
        if !stat.success() {
            return Err(CoreError::TransferIo(format!(
                "remote file not found: {}",
                stat.stderr_string()
            )));
        }
        let total_bytes: u64 = stat.stdout_string().trim().parse().unwrap_or(0);

        let mut channel = self.chain.new_session().await?;
        channel
            .exec(true, format!("cat {}", shell_quote(remote_path)))
            .await
            .map_err(|e| CoreError::TransferIo(e.to_string()))?;

        let mut file = tokio::fs::File::create(local_path).await?;
        let start = Instant::now();
        let mut transferred: u64 = 0;

        let result: Result<()> = async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        file.write_all(&data).await?;
                        transferred += data.len() as u64;
                        emit_progress(
                            &progress,
                            &id,
                            remote_path,
                            local_path,
                            TransferDirection::Download,
                            TransferState::InProgress,
                            total_bytes,
                            transferred,
                            start,
                            None,
                        )
                        .await;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        let (state, error) = match &result {
            Ok(()) => (TransferState::Completed, None),
            Err(e) => (TransferState::Failed, Some(e.to_string())),
        };
        emit_terminal(
            &progress,
            &id,
            remote_path,
            local_path,
            TransferDirection::Download,
            state,
            total_bytes,
            transferred,
            start,
            error,
        )
        .await;

        result
    }
}

async fn drain_exit_status(channel: &mut russh::Channel<russh::client::Msg>) -> Result<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::ExitStatus { exit_status }) if exit_status != 0 => {
                return Err(CoreError::TransferIo(format!("remote cat exited with status {exit_status}")));
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(()),
            _ => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_progress(
    id: &str,
    remote_path: &str,
    local_path: &Path,
    direction: TransferDirection,
    state: TransferState,
    total_bytes: u64,
    transferred_bytes: u64,
    start: Instant,
    error: Option<String>,
) -> TransferProgress {
    let elapsed = start.elapsed().as_secs_f64().max(0.001);
    let speed = (transferred_bytes as f64 / elapsed) as u64;
    let eta_seconds = if speed > 0 && total_bytes > transferred_bytes {
        Some((total_bytes - transferred_bytes) / speed)
    } else {
        None
    };

    TransferProgress {
        id: id.to_string(),
        remote_path: remote_path.to_string(),
        local_path: local_path.to_string_lossy().into_owned(),
        direction,
        state,
        total_bytes,
        transferred_bytes,
        speed,
        eta_seconds,
        error,
    }
}

#[allow(clippy::too_many_arguments)]
async fn emit_progress(
    tx: &mpsc::Sender<TransferProgress>,
    id: &str,
    remote_path: &str,
    local_path: &Path,
    direction: TransferDirection,
    state: TransferState,
    total_bytes: u64,
    transferred_bytes: u64,
    start: Instant,
    error: Option<String>,
) {
    let progress = build_progress(
        id, remote_path, local_path, direction, state, total_bytes, transferred_bytes, start, error,
    );
    // Best-effort: a full progress channel means the subscriber is slow,
    // not that the transfer should stall. Only intermediate updates are
    // droppable; the terminal record goes through `emit_terminal` instead.
    let _ = tx.try_send(progress);
}

/// Deliver the terminal `Completed`/`Failed` record. Unlike intermediate
/// updates this awaits channel capacity instead of dropping, so callers are
/// guaranteed to observe how a transfer ended.
#[allow(clippy::too_many_arguments)]
async fn emit_terminal(
    tx: &mpsc::Sender<TransferProgress>,
    id: &str,
    remote_path: &str,
    local_path: &Path,
    direction: TransferDirection,
    state: TransferState,
    total_bytes: u64,
    transferred_bytes: u64,
    start: Instant,
    error: Option<String>,
) {
    let progress = build_progress(
        id, remote_path, local_path, direction, state, total_bytes, transferred_bytes, start, error,
    );
    let _ = tx.send(progress).await;
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_handles_zero_total() {
        let progress = TransferProgress {
            id: "x".into(),
            remote_path: "/a".into(),
            local_path: "/b".into(),
            direction: TransferDirection::Upload,
            state: TransferState::Completed,
            total_bytes: 0,
            transferred_bytes: 0,
            speed: 0,
            eta_seconds: None,
            error: None,
        };
        assert_eq!(progress.percentage(), 100.0);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }

    #[tokio::test]
    async fn terminal_record_is_not_dropped_on_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        // Fill the channel so a `try_send` would be rejected.
        tx.try_send(build_progress(
            "filler",
            "/a",
            Path::new("/b"),
            TransferDirection::Upload,
            TransferState::InProgress,
            10,
            1,
            Instant::now(),
            None,
        ))
        .unwrap();

        let send = tokio::spawn(async move {
            emit_terminal(
                &tx,
                "done",
                "/a",
                Path::new("/b"),
                TransferDirection::Upload,
                TransferState::Completed,
                10,
                10,
                Instant::now(),
                None,
            )
            .await;
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, "filler");
        // emit_terminal was blocked until capacity freed up; draining the
        // filler unblocks it rather than silently dropping the record.
        send.await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.id, "done");
        assert_eq!(second.state, TransferState::Completed);
    }
}
