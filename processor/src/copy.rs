//! The verified copy protocol.
//!
//! Source content is streamed to a local temp file and MD5-verified against
//! the source's checksum property before anything touches the destination;
//! the upload then declares the same checksum so the destination can verify
//! on its side. The temp file is removed on drop, on every path.

use crate::{
    clean::clean, DestinationChecksumMismatchSnafu, SourceChecksumMismatchSnafu, StorageSnafu,
    TaskExecutionError, TempFileSnafu,
};
use backoff::{Backoff, BackoffConfig};
use data_types::{ContentId, SpaceId};
use futures::StreamExt;
use md5::{Digest, Md5};
use observability_deps::tracing::{debug, warn};
use snafu::ResultExt;
use std::{ops::ControlFlow, path::Path};
use storage::{hex_encode, ContentProperties, StorageError, StorageErrorKind, StorageProvider};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Total download attempts before a local checksum mismatch becomes fatal.
pub const LOCAL_CHECKSUM_ATTEMPTS: usize = 3;

pub(crate) async fn copy_content(
    src: &dyn StorageProvider,
    dst: &dyn StorageProvider,
    space_id: &SpaceId,
    content_id: &ContentId,
    src_props: &ContentProperties,
    src_checksum: &str,
    backoff_config: &BackoffConfig,
) -> Result<String, TaskExecutionError> {
    let tmp = tempfile::NamedTempFile::new().context(TempFileSnafu)?;
    let path = tmp.path();

    // download, guarding against corrupted reads
    let mut verified = false;
    let mut last_actual = String::new();
    for attempt in 1..=LOCAL_CHECKSUM_ATTEMPTS {
        let actual = download_to(src, space_id, content_id, path, backoff_config).await?;
        if actual == src_checksum {
            verified = true;
            break;
        }
        warn!(
            content_id=%content_id,
            attempt,
            expected=%src_checksum,
            actual=%actual,
            "downloaded content does not match source checksum",
        );
        last_actual = actual;
    }
    if !verified {
        return SourceChecksumMismatchSnafu {
            content_id: content_id.clone(),
            expected: src_checksum.to_owned(),
            actual: last_actual,
        }
        .fail();
    }

    let length = tokio::fs::metadata(path).await.context(TempFileSnafu)?.len();
    let cleaned = clean(src_props);
    let mimetype = src_props
        .mimetype()
        .unwrap_or("application/octet-stream")
        .to_owned();

    // upload declaring the expected checksum; a destination-side checksum
    // disagreement is retried, then fatal
    let uploaded = Backoff::new(backoff_config)
        .retry_with_backoff("upload content", || {
            let fut = async {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(StorageError::from)?;
                let stream = ReaderStream::new(file)
                    .map(|r| r.map_err(StorageError::from))
                    .boxed();
                dst.put_content(
                    space_id,
                    content_id,
                    &mimetype,
                    cleaned.clone(),
                    length,
                    Some(src_checksum),
                    stream,
                )
                .await
            };
            async move {
                match fut.await {
                    Ok(checksum) => ControlFlow::Break(Ok(checksum)),
                    Err(e) if e.is_not_found() => ControlFlow::Break(Err(e)),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await;

    let stored = match uploaded {
        Ok(stored) => stored,
        Err(e) if e.kind() == StorageErrorKind::ChecksumMismatch => {
            return DestinationChecksumMismatchSnafu {
                content_id: content_id.clone(),
                expected: src_checksum.to_owned(),
                actual: e.to_string(),
            }
            .fail()
        }
        Err(e) => {
            return Err(e).context(StorageSnafu {
                operation: "putContent",
            })
        }
    };

    if stored != src_checksum {
        return DestinationChecksumMismatchSnafu {
            content_id: content_id.clone(),
            expected: src_checksum.to_owned(),
            actual: stored,
        }
        .fail();
    }

    debug!(content_id=%content_id, checksum=%stored, bytes=length, "content copied");
    Ok(stored)
}

/// One full download of the content into `path` (truncating), returning the
/// MD5 of what was actually received. Transient failures are retried; an
/// absent source surfaces immediately.
async fn download_to(
    src: &dyn StorageProvider,
    space_id: &SpaceId,
    content_id: &ContentId,
    path: &Path,
    backoff_config: &BackoffConfig,
) -> Result<String, TaskExecutionError> {
    Backoff::new(backoff_config)
        .retry_with_backoff("download content", || {
            let fut = async {
                let mut file = tokio::fs::File::create(path)
                    .await
                    .map_err(StorageError::from)?;
                let mut stream = src.get_content(space_id, content_id).await?;
                let mut hasher = Md5::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    hasher.update(&chunk);
                    file.write_all(&chunk).await.map_err(StorageError::from)?;
                }
                file.flush().await.map_err(StorageError::from)?;
                Ok::<_, StorageError>(hex_encode(&hasher.finalize()))
            };
            async move {
                match fut.await {
                    Ok(checksum) => ControlFlow::Break(Ok(checksum)),
                    Err(e) if e.is_not_found() => ControlFlow::Break(Err(e)),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
        .context(StorageSnafu {
            operation: "getContent",
        })
}
