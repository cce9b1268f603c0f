//! Handler that serves files from a directory tree

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{TftpConfig, WriteConfig};
use crate::handler::{TransferHandler, TransferRequest};
use crate::netascii;
use crate::packet::{BLOCK_SIZE, ErrorCode, TransferMode};
use crate::pipe::{PipeError, PipeReader, PipeWriter};

type HandlerResult<T> = std::result::Result<T, PipeError>;

pub struct DirectoryHandler {
    root_dir: PathBuf,
    write: WriteConfig,
    max_file_size_bytes: u64,
}

impl DirectoryHandler {
    /// Read-only handler rooted at `root_dir` with no size limit.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            write: WriteConfig::default(),
            max_file_size_bytes: 0,
        }
    }

    pub fn from_config(config: &TftpConfig) -> Self {
        Self::new(config.root_dir.clone())
            .with_write_config(config.write.clone())
            .with_max_file_size(config.max_file_size_bytes)
    }

    pub fn with_write_config(mut self, write: WriteConfig) -> Self {
        self.write = write;
        self
    }

    /// 0 disables the limit.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }

    /// Map a request filename into the root directory, refusing anything that
    /// could name a path outside it.
    fn resolve(&self, filename: &str) -> HandlerResult<PathBuf> {
        let normalized = filename.replace('\\', "/");
        let relative = Path::new(normalized.trim_start_matches('/'));

        let mut path = self.root_dir.clone();
        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => {
                    return Err(PipeError::new(
                        ErrorCode::AccessViolation,
                        "Invalid filename",
                    ));
                }
            }
        }
        if depth == 0 {
            return Err(PipeError::new(ErrorCode::AccessViolation, "Invalid filename"));
        }

        Ok(path)
    }

    /// Reject symlinks that lead out of the root directory.
    async fn ensure_contained(&self, path: &Path) -> HandlerResult<()> {
        let root = fs::canonicalize(&self.root_dir)
            .await
            .unwrap_or_else(|_| self.root_dir.clone());
        if let Ok(canonical) = fs::canonicalize(path).await
            && !canonical.starts_with(&root)
        {
            return Err(PipeError::new(ErrorCode::AccessViolation, "Access denied"));
        }
        Ok(())
    }

    fn check_size(&self, size: u64) -> HandlerResult<()> {
        if self.max_file_size_bytes > 0 && size > self.max_file_size_bytes {
            return Err(PipeError::new(ErrorCode::DiskFull, "File too large"));
        }
        Ok(())
    }

    async fn read_file(
        &self,
        request: &TransferRequest,
        writer: &mut PipeWriter,
    ) -> HandlerResult<u64> {
        let path = self.resolve(&request.filename)?;
        self.ensure_contained(&path).await?;

        let mut file = File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipeError::new(
                ErrorCode::FileNotFound,
                format!("File not found: {}", request.filename),
            ),
            _ => PipeError::from(e),
        })?;

        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(PipeError::new(ErrorCode::AccessViolation, "Not a regular file"));
        }
        self.check_size(meta.len())?;

        match request.mode {
            TransferMode::Netascii => {
                // Line ending conversion changes the length, so convert the whole file
                let mut raw = Vec::with_capacity(meta.len() as usize);
                file.read_to_end(&mut raw).await?;
                let data = netascii::encode(&raw);
                for chunk in data.chunks(BLOCK_SIZE) {
                    writer.write(Bytes::copy_from_slice(chunk)).await?;
                }
                Ok(data.len() as u64)
            }
            _ => writer.copy_from(&mut file).await,
        }
    }

    async fn write_file(
        &self,
        request: &TransferRequest,
        reader: &mut PipeReader,
    ) -> HandlerResult<u64> {
        if !self.write.enabled {
            return Err(PipeError::new(ErrorCode::AccessViolation, "Write not supported"));
        }

        let path = self.resolve(&request.filename)?;
        if let Some(parent) = path.parent() {
            self.ensure_contained(parent).await?;
        }
        if !self.write.allow_overwrite && fs::try_exists(&path).await? {
            return Err(PipeError::new(ErrorCode::FileExists, "File already exists"));
        }

        // Stage next to the target so the final rename stays on one filesystem
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = path.with_file_name(format!(".{}.{}.part", file_name, Uuid::new_v4()));

        let result = self.stage(request, reader, &staging).await;
        let result = match result {
            Ok(bytes) => fs::rename(&staging, &path)
                .await
                .map(|()| bytes)
                .map_err(PipeError::from),
            Err(e) => Err(e),
        };

        if result.is_err()
            && let Err(e) = fs::remove_file(&staging).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }
        result
    }

    async fn stage(
        &self,
        request: &TransferRequest,
        reader: &mut PipeReader,
        staging: &Path,
    ) -> HandlerResult<u64> {
        let mut file = File::create(staging).await?;

        let written = match request.mode {
            TransferMode::Netascii => {
                let mut decoder = netascii::Decoder::default();
                let mut total = 0u64;
                while let Some(chunk) = reader.read_chunk().await? {
                    let local = decoder.decode_chunk(&chunk);
                    total += local.len() as u64;
                    self.check_size(total)?;
                    file.write_all(&local).await?;
                }
                let tail = decoder.finish();
                total += tail.len() as u64;
                self.check_size(total)?;
                file.write_all(&tail).await?;
                total
            }
            _ if self.max_file_size_bytes == 0 => reader.copy_to(&mut file).await?,
            _ => {
                let mut total = 0u64;
                while let Some(chunk) = reader.read_chunk().await? {
                    total += chunk.len() as u64;
                    self.check_size(total)?;
                    file.write_all(&chunk).await?;
                }
                total
            }
        };

        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl TransferHandler for DirectoryHandler {
    async fn produce(&self, request: TransferRequest, mut writer: PipeWriter) {
        match self.read_file(&request, &mut writer).await {
            Ok(bytes) => {
                debug!(bytes, "Finished reading {}", request.filename);
                if let Err(e) = writer.close().await {
                    debug!("Transfer of {} did not complete: {}", request.filename, e);
                }
            }
            Err(e) => {
                warn!("Read of {} failed: {}", request.filename, e);
                writer.close_with_error(e).await;
            }
        }
    }

    async fn consume(&self, request: TransferRequest, mut reader: PipeReader) {
        match self.write_file(&request, &mut reader).await {
            Ok(bytes) => info!(bytes, "Stored {}", request.filename),
            Err(e) => {
                warn!("Write of {} failed: {}", request.filename, e);
                reader.close_with_error(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use tempfile::TempDir;

    fn request(filename: &str, mode: TransferMode) -> TransferRequest {
        TransferRequest {
            filename: filename.to_string(),
            mode,
            peer: "127.0.0.1:40000".parse().unwrap(),
        }
    }

    async fn read_via(handler: &DirectoryHandler, req: TransferRequest) -> HandlerResult<Bytes> {
        let (writer, mut reader) = pipe();
        let collect = async move {
            let data = reader.read_to_end().await;
            drop(reader);
            data
        };
        let (_, data) = tokio::join!(handler.produce(req, writer), collect);
        data
    }

    async fn write_via(
        handler: &DirectoryHandler,
        req: TransferRequest,
        data: &[u8],
    ) -> HandlerResult<u64> {
        let (mut writer, mut reader) = pipe();
        let data = Bytes::copy_from_slice(data);
        let feed = async move {
            for chunk in data.chunks(BLOCK_SIZE) {
                if writer.write(Bytes::copy_from_slice(chunk)).await.is_err() {
                    return;
                }
            }
            let _ = writer.close().await;
        };
        let store = async move {
            let stored = handler.write_file(&req, &mut reader).await;
            drop(reader);
            stored
        };
        let (stored, ()) = tokio::join!(store, feed);
        stored
    }

    fn writable(dir: &TempDir) -> DirectoryHandler {
        DirectoryHandler::new(dir.path()).with_write_config(WriteConfig {
            enabled: true,
            allow_overwrite: false,
        })
    }

    #[tokio::test]
    async fn serves_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("boot.img"), vec![5u8; 1500]).unwrap();
        let handler = DirectoryHandler::new(dir.path());

        let data = read_via(&handler, request("boot.img", TransferMode::Octet))
            .await
            .unwrap();
        assert_eq!(data.len(), 1500);
    }

    #[tokio::test]
    async fn missing_file_reports_file_not_found() {
        let dir = TempDir::new().unwrap();
        let handler = DirectoryHandler::new(dir.path());

        let err = read_via(&handler, request("nope.bin", TransferMode::Octet))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
        assert_eq!(err.message(), "File not found: nope.bin");
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let handler = DirectoryHandler::new(dir.path());

        for name in ["../etc/passwd", "a/../../b", "..\\secret", ""] {
            let err = read_via(&handler, request(name, TransferMode::Octet))
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::AccessViolation, "{}", name);
        }
    }

    #[tokio::test]
    async fn leading_slash_stays_inside_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("pxe")).unwrap();
        std::fs::write(dir.path().join("pxe/menu.cfg"), b"default linux").unwrap();
        let handler = DirectoryHandler::new(dir.path());

        let data = read_via(&handler, request("/pxe/menu.cfg", TransferMode::Octet))
            .await
            .unwrap();
        assert_eq!(&data[..], b"default linux");
    }

    #[tokio::test]
    async fn enforces_max_file_size_on_read() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![0u8; 2048]).unwrap();
        let handler = DirectoryHandler::new(dir.path()).with_max_file_size(1024);

        let err = read_via(&handler, request("big.bin", TransferMode::Octet))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DiskFull);
    }

    #[tokio::test]
    async fn netascii_read_converts_line_endings() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("motd.txt"), b"hello\nworld\n").unwrap();
        let handler = DirectoryHandler::new(dir.path());

        let data = read_via(&handler, request("motd.txt", TransferMode::Netascii))
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello\r\nworld\r\n");
    }

    #[tokio::test]
    async fn writes_are_refused_when_disabled() {
        let dir = TempDir::new().unwrap();
        let handler = DirectoryHandler::new(dir.path());

        let err = write_via(&handler, request("up.bin", TransferMode::Octet), b"data")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessViolation);
        assert!(!dir.path().join("up.bin").exists());
    }

    #[tokio::test]
    async fn stores_upload_atomically() {
        let dir = TempDir::new().unwrap();
        let handler = writable(&dir);

        let stored = write_via(&handler, request("up.bin", TransferMode::Octet), &[7u8; 1300])
            .await
            .unwrap();
        assert_eq!(stored, 1300);
        assert_eq!(std::fs::read(dir.path().join("up.bin")).unwrap(), vec![7u8; 1300]);

        // Only the final file remains
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn existing_file_is_protected_without_overwrite() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.cfg"), b"original").unwrap();
        let handler = writable(&dir);

        let err = write_via(&handler, request("keep.cfg", TransferMode::Octet), b"new")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileExists);
        assert_eq!(std::fs::read(dir.path().join("keep.cfg")).unwrap(), b"original");
    }

    #[tokio::test]
    async fn consume_reports_rejection_to_the_writer() {
        let dir = TempDir::new().unwrap();
        let handler = DirectoryHandler::new(dir.path());
        let (mut writer, reader) = pipe();

        handler
            .consume(request("up.bin", TransferMode::Octet), reader)
            .await;
        let err = writer.write(vec![0u8; 16]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessViolation);
        assert_eq!(err.message(), "Write not supported");
    }

    #[tokio::test]
    async fn aborted_upload_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let handler = writable(&dir);
        let (mut writer, reader) = pipe();

        let feed = async move {
            writer.write(vec![1u8; 512]).await.unwrap();
            writer
                .close_with_error(PipeError::new(ErrorCode::NotDefined, "Transfer timed out"))
                .await;
        };
        tokio::join!(
            handler.consume(request("partial.bin", TransferMode::Octet), reader),
            feed
        );

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn enforces_max_file_size_on_write() {
        let dir = TempDir::new().unwrap();
        let handler = writable(&dir).with_max_file_size(1000);

        let err = write_via(&handler, request("huge.bin", TransferMode::Octet), &[0u8; 2048])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DiskFull);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn oversized_netascii_upload_is_refused_before_end_of_data() {
        let dir = TempDir::new().unwrap();
        let handler = writable(&dir).with_max_file_size(1000);
        let (mut writer, mut reader) = pipe();

        // Never closes, so the refusal cannot depend on seeing the end
        let feed = tokio::spawn(async move {
            for _ in 0..4 {
                if writer.write(vec![b'x'; BLOCK_SIZE]).await.is_err() {
                    break;
                }
            }
            std::future::pending::<()>().await;
        });

        let err = handler
            .write_file(&request("text.txt", TransferMode::Netascii), &mut reader)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DiskFull);
        feed.abort();
        assert!(!dir.path().join("text.txt").exists());
    }

    #[tokio::test]
    async fn netascii_write_restores_local_line_endings() {
        let dir = TempDir::new().unwrap();
        let handler = writable(&dir);

        write_via(&handler, request("notes.txt", TransferMode::Netascii), b"a\r\nb\r\0c")
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"a\nb\rc");
    }
}
