//! Sending side of a transfer session.

use std::path::{Path, PathBuf};

use protocol::{
    build_request_metadata, crypto, EncryptionFlag, FrameCodec, Metadata, ProtocolError, Result,
    TransferProfile, METADATA_FILE_NAME,
};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::observer::TransferObserver;
use super::{cancellable, TransferRequest};

/// Sender settings for one session.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub profile: TransferProfile,
    /// Encrypt every file with this password.
    pub password: Option<String>,
    /// Where encrypted copies are staged.
    pub temp_dir: PathBuf,
}

/// What a finished send moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: usize,
    pub bytes: u64,
}

/// A file to send and the name it travels under.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedFile {
    source: PathBuf,
    wire_name: String,
}

/// Send `request` over `stream`, then halt.
///
/// Failures are reported to `observer` before being returned.
pub async fn send<S>(
    stream: S,
    request: &TransferRequest,
    options: &SendOptions,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<TransferSummary>
where
    S: AsyncWrite + Unpin,
{
    match send_inner(stream, request, options, observer, cancel).await {
        Ok(summary) => {
            info!("Sent {} file(s), {} bytes", summary.files, summary.bytes);
            observer.on_complete();
            Ok(summary)
        }
        Err(e) => {
            warn!("Send failed: {}", e);
            observer.on_error(e.kind(), &e.to_string());
            Err(e)
        }
    }
}

async fn send_inner<S>(
    stream: S,
    request: &TransferRequest,
    options: &SendOptions,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<TransferSummary>
where
    S: AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new(stream);
    let (metadata, plan) = plan_request(request)?;
    let mut summary = TransferSummary::default();

    if let Some(metadata) = metadata {
        let json = metadata.to_json()?;
        debug!("Sending metadata for {} entries", metadata.entries.len());
        cancellable(cancel, async {
            codec
                .write_frame(EncryptionFlag::Plain, METADATA_FILE_NAME, json.len() as u64)
                .await?;
            codec.write_chunk(&json).await
        })
        .await?;
    }

    for file in &plan {
        let bytes = match &options.password {
            Some(password) => {
                send_encrypted(&mut codec, file, password, options, observer, cancel).await?
            }
            None => {
                stream_file(
                    &mut codec,
                    &file.source,
                    EncryptionFlag::Plain,
                    &file.wire_name,
                    options.profile.chunk_size,
                    observer,
                    cancel,
                )
                .await?
            }
        };
        summary.files += 1;
        summary.bytes += bytes;
    }

    cancellable(cancel, codec.write_halt()).await?;
    if let Err(e) = codec.shutdown().await {
        debug!("Shutdown after halt failed: {}", e);
    }
    Ok(summary)
}

async fn send_encrypted<S>(
    codec: &mut FrameCodec<S>,
    file: &PlannedFile,
    password: &str,
    options: &SendOptions,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let source = file.source.clone();
    let temp_dir = options.temp_dir.clone();
    let password = password.to_string();
    let encrypted =
        tokio::task::spawn_blocking(move || crypto::encrypt_file(&source, &temp_dir, &password))
            .await
            .map_err(|e| ProtocolError::Filesystem(format!("encryption task failed: {}", e)))??;

    let result = stream_file(
        codec,
        &encrypted,
        EncryptionFlag::Encrypted,
        &crypto::crypt_name(&file.wire_name),
        options.profile.chunk_size,
        observer,
        cancel,
    )
    .await;

    if let Err(e) = tokio::fs::remove_file(&encrypted).await {
        warn!("Failed to remove {}: {}", encrypted.display(), e);
    }
    result
}

/// Write one frame: header, then the file in `chunk_size` pieces.
async fn stream_file<S>(
    codec: &mut FrameCodec<S>,
    path: &Path,
    flag: EncryptionFlag,
    wire_name: &str,
    chunk_size: usize,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut file = File::open(path)
        .await
        .map_err(|e| ProtocolError::filesystem(path, e))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| ProtocolError::filesystem(path, e))?
        .len();

    debug!("Sending {} ({} bytes, {:?})", wire_name, size, flag);
    observer.on_file_started(wire_name, size);
    cancellable(cancel, codec.write_frame(flag, wire_name, size)).await?;

    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;
    while sent < size {
        let want = (size - sent).min(buffer.len() as u64) as usize;
        let read = file
            .read(&mut buffer[..want])
            .await
            .map_err(|e| ProtocolError::filesystem(path, e))?;
        if read == 0 {
            return Err(ProtocolError::Filesystem(format!(
                "{} shrank to {} bytes while sending {}",
                path.display(),
                sent,
                size
            )));
        }

        cancellable(cancel, codec.write_chunk(&buffer[..read])).await?;
        sent += read as u64;
        observer.on_progress(sent, size);
    }

    if size == 0 {
        observer.on_progress(0, 0);
    }
    cancellable(cancel, codec.flush()).await?;
    Ok(size)
}

/// Decide the metadata frame (if any) and the files in transfer order.
fn plan_request(request: &TransferRequest) -> Result<(Option<Metadata>, Vec<PlannedFile>)> {
    if !request.contains_directory() {
        let plan = request
            .paths()
            .iter()
            .map(|path| {
                Ok(PlannedFile {
                    source: path.clone(),
                    wire_name: file_name(path)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok((None, plan));
    }

    let metadata = build_request_metadata(request.paths())?;
    let mut plan = Vec::new();

    for entry in metadata.file_entries() {
        let source = match (&metadata.root, request.paths()) {
            (Some(_), [root]) => root.join(&entry.relative_path),
            _ => source_for_entry(request.paths(), &entry.relative_path)?,
        };
        plan.push(PlannedFile {
            source,
            wire_name: entry.relative_path.clone(),
        });
    }

    Ok((Some(metadata), plan))
}

/// Locate the requested path an unrooted metadata entry came from.
fn source_for_entry(paths: &[PathBuf], relative: &str) -> Result<PathBuf> {
    for path in paths {
        let name = file_name(path)?;
        if path.is_dir() {
            if let Some(rest) = relative
                .strip_prefix(name.as_str())
                .and_then(|r| r.strip_prefix('/'))
            {
                return Ok(path.join(rest));
            }
        } else if name == relative {
            return Ok(path.clone());
        }
    }
    Err(ProtocolError::Metadata(format!(
        "no requested path provides {:?}",
        relative
    )))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ProtocolError::Filesystem(format!("{} has no file name", path.display())))
}
