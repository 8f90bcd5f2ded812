//! Receiving side of a transfer session.

use std::path::{Path, PathBuf};

use protocol::metadata::safe_join;
use protocol::{
    reconstruct_destination, resolve_entry_path, EncryptionFlag, FrameCodec, FrameHeader,
    Metadata, ProtocolError, Result, TransferProfile,
};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cancellable;
use super::decrypt::PendingDecryption;
use super::observer::TransferObserver;

/// Largest metadata payload accepted.
pub const MAX_METADATA_SIZE: u64 = 16 * 1024 * 1024;

/// Receiver settings for one session.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Default directory for flat transfers and parent of folder transfers.
    pub save_dir: PathBuf,
    pub profile: TransferProfile,
    /// Password attempts allowed for the deferred decryption.
    pub max_password_attempts: u32,
}

/// What a finished receive produced.
#[derive(Debug)]
pub struct ReceiveOutcome {
    /// Where the files went: the reconstructed folder, or the save directory.
    pub destination: PathBuf,
    /// Every file written, in arrival order.
    pub received: Vec<PathBuf>,
    /// Received `.crypt` files awaiting a password.
    pub pending: PendingDecryption,
    /// Whether the sender ended with a halt frame.
    pub halted: bool,
}

/// Read frames from `stream` until halt or a clean close between frames.
///
/// Failures are reported to `observer` before being returned; files already
/// written stay on disk.
pub async fn receive<S>(
    stream: S,
    options: &ReceiveOptions,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<ReceiveOutcome>
where
    S: AsyncRead + Unpin,
{
    match receive_inner(stream, options, observer, cancel).await {
        Ok(outcome) => {
            info!(
                "Received {} file(s) into {}",
                outcome.received.len(),
                outcome.destination.display()
            );
            observer.on_complete();
            Ok(outcome)
        }
        Err(e) => {
            warn!("Receive failed: {}", e);
            observer.on_error(e.kind(), &e.to_string());
            Err(e)
        }
    }
}

async fn receive_inner<S>(
    stream: S,
    options: &ReceiveOptions,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<ReceiveOutcome>
where
    S: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new(stream);
    let mut destination = options.save_dir.clone();
    let mut metadata = Metadata::default();
    let mut received = Vec::new();
    let mut encrypted = Vec::new();
    let mut halted = false;

    fs::create_dir_all(&destination)
        .await
        .map_err(|e| ProtocolError::filesystem(&destination, e))?;

    loop {
        let header = match cancellable(cancel, codec.read_header()).await? {
            Some(header) => header,
            None => {
                debug!("Sender closed the connection between frames");
                break;
            }
        };

        if header.is_halt() {
            debug!("Halt received");
            halted = true;
            break;
        }

        if header.is_metadata() && header.flag == EncryptionFlag::Plain {
            metadata = read_metadata(&mut codec, &header, cancel).await?;
            destination = prepare_destination(&metadata, options)?;
            continue;
        }

        let size_hint = (!header.flag.is_encrypted()).then_some(header.payload_len);
        let target = resolve_entry_path(&destination, &metadata, &header.name, size_hint)?;
        let chunk_size = options.profile.chunk_size;
        write_payload(&mut codec, &header, &target, chunk_size, observer, cancel).await?;

        if header.flag.is_encrypted() {
            encrypted.push(target.clone());
        }
        received.push(target);
    }

    Ok(ReceiveOutcome {
        destination,
        received,
        pending: PendingDecryption::new(encrypted, options.max_password_attempts),
        halted,
    })
}

async fn read_metadata<S>(
    codec: &mut FrameCodec<S>,
    header: &FrameHeader,
    cancel: &CancellationToken,
) -> Result<Metadata>
where
    S: AsyncRead + Unpin,
{
    if header.payload_len > MAX_METADATA_SIZE {
        return Err(ProtocolError::Metadata(format!(
            "metadata of {} bytes exceeds the limit of {}",
            header.payload_len, MAX_METADATA_SIZE
        )));
    }
    let bytes = cancellable(cancel, codec.read_exactly(header.payload_len as usize)).await?;
    let metadata = Metadata::from_json(&bytes)?;
    debug!(
        "Metadata: {} entries, {} bytes total, root {:?}",
        metadata.entries.len(),
        metadata.total_size(),
        metadata.root_folder_name()
    );
    Ok(metadata)
}

/// Folder transfers get a fresh destination folder; flat transfers land in
/// the save directory with the named subdirectories created up front.
fn prepare_destination(metadata: &Metadata, options: &ReceiveOptions) -> Result<PathBuf> {
    if metadata.root.is_some() {
        let destination =
            reconstruct_destination(metadata, &options.save_dir, options.profile.path_rule)?;
        info!("Receiving folder into {}", destination.display());
        return Ok(destination);
    }

    for entry in metadata.directory_entries() {
        let dir = safe_join(&options.save_dir, &entry.relative_path)?;
        std::fs::create_dir_all(&dir).map_err(|e| ProtocolError::filesystem(&dir, e))?;
    }
    Ok(options.save_dir.clone())
}

/// Stream exactly `payload_len` bytes from the connection into `target`.
async fn write_payload<S>(
    codec: &mut FrameCodec<S>,
    header: &FrameHeader,
    target: &Path,
    chunk_size: usize,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ProtocolError::filesystem(parent, e))?;
    }

    debug!(
        "Receiving {} ({} bytes, {:?}) into {}",
        header.name,
        header.payload_len,
        header.flag,
        target.display()
    );
    observer.on_file_started(&header.name, header.payload_len);

    let mut file = File::create(target)
        .await
        .map_err(|e| ProtocolError::filesystem(target, e))?;

    let total = header.payload_len;
    let mut remaining = total;
    while remaining > 0 {
        let chunk =
            cancellable(cancel, codec.read_payload_chunk(remaining, chunk_size.max(1))).await?;
        file.write_all(&chunk)
            .await
            .map_err(|e| ProtocolError::filesystem(target, e))?;
        remaining -= chunk.len() as u64;
        observer.on_progress(total - remaining, total);
    }

    if total == 0 {
        observer.on_progress(0, 0);
    }
    file.flush()
        .await
        .map_err(|e| ProtocolError::filesystem(target, e))?;
    Ok(())
}
