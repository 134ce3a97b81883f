//! Files on either end of a transfer.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use tokio::io::AsyncRead;

use toasty_protocol::FileMetadata;
use toasty_protocol::constants::DEFAULT_MIME_TYPE;

use crate::TransferError;

/// A file about to be sent: its metadata plus a byte stream.
pub struct OutgoingFile {
    metadata: FileMetadata,
    pub(crate) reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl OutgoingFile {
    /// Wraps any byte stream. `metadata.size` must match what it yields.
    pub fn new(metadata: FileMetadata, reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            metadata,
            reader: Box::pin(reader),
        }
    }

    /// Builds an outgoing file from an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, mime_type: Option<&str>, data: Vec<u8>) -> Self {
        let metadata = FileMetadata {
            name: name.into(),
            mime_type: mime_type.unwrap_or(DEFAULT_MIME_TYPE).to_owned(),
            size: data.len() as u64,
        };
        Self::new(metadata, std::io::Cursor::new(data))
    }

    /// Opens a file on disk; the name is its final path component.
    pub async fn open(
        path: impl AsRef<Path>,
        mime_type: Option<&str>,
    ) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?;
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let metadata = FileMetadata {
            name,
            mime_type: mime_type.unwrap_or(DEFAULT_MIME_TYPE).to_owned(),
            size,
        };
        Ok(Self::new(metadata, file))
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Vec<u8>,
}

impl ReceivedFile {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes the file into `dir` under its announced name and returns the
    /// path written. The name is reduced to a single path component first.
    pub async fn save_in(&self, dir: impl AsRef<Path>) -> Result<PathBuf, TransferError> {
        let name = sanitize_file_name(&self.metadata.name)?;
        let path = dir.as_ref().join(name);
        tokio::fs::write(&path, &self.data).await?;
        tracing::info!(path = %path.display(), bytes = self.data.len(), "received file saved");
        Ok(path)
    }
}

/// Reduces a remote-supplied file name to its last normal path component.
///
/// Both `/` and `\` count as separators, so a name can never climb out of
/// the directory it is saved in.
pub fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let unified = name.replace('\\', "/");
    let last = Path::new(&unified)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .next_back();

    match last.and_then(|part| part.to_str()) {
        Some(part) if !part.trim().is_empty() => Ok(part.to_owned()),
        _ => Err(TransferError::InvalidFileName(name.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn sanitize_keeps_plain_names() {
        assert_eq!(sanitize_file_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_file_name("my photo.jpg").unwrap(), "my photo.jpg");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("/tmp/evil.sh").unwrap(), "evil.sh");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\doc.txt").unwrap(), "doc.txt");
    }

    #[test]
    fn sanitize_rejects_empty_and_dots() {
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("/").is_err());
        assert!(sanitize_file_name("   ").is_err());
    }

    #[tokio::test]
    async fn open_reads_size_and_name_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello toast").unwrap();

        let mut file = OutgoingFile::open(&path, None).await.unwrap();
        assert_eq!(file.metadata().name, "notes.txt");
        assert_eq!(file.metadata().size, 11);
        assert_eq!(file.metadata().mime_type, DEFAULT_MIME_TYPE);

        let mut buf = Vec::new();
        file.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello toast");
    }

    #[tokio::test]
    async fn open_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = OutgoingFile::open(dir.path().join("absent.bin"), Some("image/png"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[tokio::test]
    async fn save_in_writes_under_sanitized_name() {
        let dir = tempfile::tempdir().unwrap();
        let received = ReceivedFile {
            metadata: FileMetadata {
                name: "../escape.bin".into(),
                mime_type: DEFAULT_MIME_TYPE.into(),
                size: 3,
            },
            data: vec![1, 2, 3],
        };

        let path = received.save_in(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("escape.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
    }
}
