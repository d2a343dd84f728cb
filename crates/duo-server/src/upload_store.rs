use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Route prefix under which stored files are served.
pub const UPLOADS_ROUTE: &str = "/uploads";

/// A file accepted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    /// Name on disk and in the public URL: `<uuid><.ext>`.
    pub file_name: String,
    pub mime_type: String,
    pub size: usize,
}

impl StoredUpload {
    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}{}/{}",
            base_url.trim_end_matches('/'),
            UPLOADS_ROUTE,
            self.file_name
        )
    }
}

/// Local-disk object store for chat attachments. Files are written under
/// fresh random names and never overwritten.
#[derive(Debug, Clone)]
pub struct UploadStore {
    base_path: PathBuf,
    max_size: usize,
}

impl UploadStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::UploadStorage(format!(
                "Failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Upload store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Store `data`, keeping the original file's extension and resolving its
    /// MIME type from the declared content type or, failing that, the name.
    pub async fn store(
        &self,
        original_name: Option<&str>,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<StoredUpload, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty upload".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::UploadTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let file_name = format!(
            "{}{}",
            Uuid::new_v4(),
            original_name.map(extension_of).unwrap_or_default()
        );
        let path = self.base_path.join(&file_name);

        fs::write(&path, data).await.map_err(|e| {
            ServerError::UploadStorage(format!("Failed to write upload {}: {}", file_name, e))
        })?;

        let upload = StoredUpload {
            mime_type: resolve_mime(content_type, original_name),
            size: data.len(),
            file_name,
        };
        debug!(file = %upload.file_name, mime = %upload.mime_type, size = upload.size, "Stored upload");
        Ok(upload)
    }

    pub async fn read(&self, file_name: &str) -> Result<Vec<u8>, ServerError> {
        if file_name.contains(['/', '\\']) || file_name.contains("..") {
            return Err(ServerError::BadRequest("Invalid file name".to_string()));
        }
        fs::read(self.base_path.join(file_name))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ServerError::NotFound(file_name.to_string()),
                _ => ServerError::UploadStorage(format!("Failed to read upload {}: {}", file_name, e)),
            })
    }
}

/// `.ext` of a client-supplied name, if it is a plain short alphanumeric one.
fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 16)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

fn resolve_mime(content_type: Option<&str>, original_name: Option<&str>) -> String {
    let declared = content_type
        .map(str::trim)
        .filter(|ct| !ct.is_empty() && *ct != mime_guess::mime::APPLICATION_OCTET_STREAM.essence_str());
    if let Some(ct) = declared {
        return ct.to_string();
    }

    original_name
        .map(|name| mime_guess::from_path(name).first_or_octet_stream())
        .unwrap_or(mime_guess::mime::APPLICATION_OCTET_STREAM)
        .essence_str()
        .to_string()
}
