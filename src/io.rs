use std::collections::HashMap;
use std::path::{Path, PathBuf};
use anyhow::bail;
use axum::extract::Multipart;
use tokio::fs::{create_dir_all, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::Config;
use crate::err::Error;
use crate::face::FaceImage;

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

pub async fn prepare_io(config: &Config) -> anyhow::Result<()> {
    create_dir_all(config.uploads_dir()).await?;
    create_dir_all(config.encodings_dir()).await?;
    Ok(())
}

pub async fn create_io_file<P: AsRef<Path>>(path: P) -> anyhow::Result<File> {
    let pathbuf = path.as_ref().to_path_buf();
    if let Some(parent) = pathbuf.parent() {
        create_dir_all(parent).await?;
    }
    if pathbuf.exists() {
        bail!("File already exists!")
    }
    return File::create(pathbuf).await.map_err(anyhow::Error::from)
}

/// Writes `bytes` to `path`, replacing whatever was there.
pub async fn write_io_file<P: AsRef<Path>>(path: P, bytes: &[u8]) -> anyhow::Result<()> {
    let pathbuf = path.as_ref();
    if let Some(parent) = pathbuf.parent() {
        create_dir_all(parent).await?;
    }
    let mut writer = BufWriter::new(File::create(pathbuf).await?);
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// A multipart body split into file parts and plain text parts.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub files: HashMap<String, UploadedFile>,
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    /// Reads every part chunk by chunk. `max_bytes` bounds the whole body, text
    /// parts included, and reading stops as soon as it is exceeded.
    pub async fn read(mut multipart: Multipart, max_bytes: usize) -> Result<Self, Error> {
        let mut form = UploadForm::default();
        let mut total = 0usize;
        while let Some(mut field) = multipart.next_field().await? {
            let name = field.name().unwrap_or("").to_string();
            let file_name = field.file_name().map(str::to_string);
            let mut bytes = Vec::new();
            while let Some(chunk) = field.chunk().await? {
                total += chunk.len();
                if total > max_bytes {
                    log::warn!("Upload rejected at `{}`: over {} bytes", name, max_bytes);
                    return Err(Error::InvalidImage {
                        message: format!("Upload exceeds {} bytes", max_bytes),
                    });
                }
                bytes.extend_from_slice(&chunk);
            }
            match file_name {
                Some(file_name) => {
                    form.files.insert(name, UploadedFile { file_name, bytes });
                }
                None => {
                    let text = String::from_utf8(bytes)
                        .map_err(|_| Error::invalid(format!("`{}` is not valid UTF-8", name)))?;
                    form.fields.insert(name, text);
                }
            }
        }
        Ok(form)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn take_file(&mut self, name: &str) -> Option<UploadedFile> {
        self.files.remove(name)
    }

    /// Pulls `name` out of the form and validates it as a face photo.
    pub fn take_image(&mut self, name: &str, max_bytes: usize) -> Result<FaceImage, Error> {
        let file = self.take_file(name).ok_or_else(|| Error::InvalidImage {
            message: "No image provided".to_string(),
        })?;
        FaceImage::from_upload(&file.file_name, file.bytes, max_bytes)
    }
}

pub fn extension_of(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

pub fn allowed_file(file_name: &str) -> bool {
    extension_of(file_name)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Strips everything but ASCII alphanumerics, `.`, `-` and `_` and removes
/// leading dots, so the result is a plain file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

pub fn encoding_backup_path(config: &Config, user: &uuid::Uuid, role: &str) -> PathBuf {
    config.encodings_dir().join(format!("{}_{}.dat", user, role))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::{FromRequest, RequestParts};
    use axum::http::Request;

    const BOUNDARY: &str = "attendance-boundary";

    pub enum Part<'a> {
        Text(&'a str, String),
        File(&'a str, &'a str, Vec<u8>),
    }

    /// Encodes `parts` as a multipart body, returning the content type with it.
    pub fn form_body(parts: Vec<Part<'_>>) -> (String, Vec<u8>) {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, file_name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            name, file_name
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(&bytes);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        (format!("multipart/form-data; boundary={}", BOUNDARY), body)
    }

    async fn multipart(parts: Vec<Part<'_>>) -> Multipart {
        let (content_type, body) = form_body(parts);
        let request = Request::builder()
            .method("POST")
            .header("content-type", content_type)
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(&mut RequestParts::new(request))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn form_splits_text_and_files() {
        let mp = multipart(vec![
            Part::Text("latitude", "12.97".to_string()),
            Part::File("face_image", "me.png", vec![1, 2, 3]),
        ])
        .await;
        let mut form = UploadForm::read(mp, 1024).await.unwrap();
        assert_eq!(form.field("latitude"), Some("12.97"));
        assert_eq!(form.field("longitude"), None);
        let file = form.take_file("face_image").unwrap();
        assert_eq!(file.file_name, "me.png");
        assert_eq!(file.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn oversized_text_field_is_rejected() {
        let mp = multipart(vec![Part::Text("latitude", "9".repeat(4 * 1024 * 1024))]).await;
        let err = UploadForm::read(mp, 1024).await.unwrap_err();
        assert!(matches!(err, Error::InvalidImage { .. }), "{:?}", err);
        assert!(err.is_soft());
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let mp = multipart(vec![Part::File("face_image", "me.png", vec![0; 4096])]).await;
        let err = UploadForm::read(mp, 1024).await.unwrap_err();
        assert!(matches!(err, Error::InvalidImage { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn limit_covers_the_whole_body() {
        let mp = multipart(vec![
            Part::Text("latitude", "1".repeat(600)),
            Part::Text("longitude", "2".repeat(600)),
        ])
        .await;
        assert!(matches!(
            UploadForm::read(mp, 1024).await,
            Err(Error::InvalidImage { .. })
        ));
    }

    #[test]
    fn only_image_extensions_are_allowed() {
        assert!(allowed_file("me.JPG"));
        assert!(allowed_file("face.capture.png"));
        assert!(!allowed_file("notes.txt"));
        assert!(!allowed_file("png"));
    }

    #[test]
    fn sanitizing_drops_paths_and_odd_characters() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("my photo (1).jpg"), "my_photo_1.jpg");
        assert_eq!(sanitize_file_name("..hidden.png"), "hidden.png");
        assert_eq!(sanitize_file_name("C:\\Users\\a\\b.gif"), "b.gif");
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = std::env::temp_dir().join(format!("attendance-io-{}", uuid::Uuid::new_v4()));
        let file = dir.join("nested").join("blob.dat");

        write_io_file(&file, b"encoding").await.unwrap();
        assert_eq!(tokio::fs::read(&file).await.unwrap(), b"encoding");
        assert!(create_io_file(&file).await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
