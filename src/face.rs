//! Face embeddings and nearest-neighbour matching.
//!
//! Detection and encoding are done by an external model behind
//! [`FaceEncoder`]; this module only validates uploads, stores embeddings and
//! compares them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::FaceConfig;
use crate::err::Error;
use crate::io::allowed_file;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f64>);

impl Embedding {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Euclidean distance, or `None` when the vectors differ in length.
    pub fn distance(&self, other: &Embedding) -> Option<f64> {
        if self.0.len() != other.0.len() {
            return None;
        }
        let sum: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        Some(sum.sqrt())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Embedding, Error> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch<I> {
    pub id: I,
    pub distance: f64,
    pub confidence: f64,
}

/// Linear scan for the candidate closest to `sample`.
///
/// The closest candidate wins only if its distance is at most `tolerance`.
/// Ties keep the earlier candidate.
pub fn nearest<I: Clone>(
    sample: &Embedding,
    candidates: &[(I, Embedding)],
    tolerance: f64,
) -> Option<FaceMatch<I>> {
    let mut best: Option<(&I, f64)> = None;
    for (id, known) in candidates {
        let distance = match known.distance(sample) {
            Some(d) => d,
            None => {
                log::warn!(
                    "Skipping stored encoding of length {} (sample has {})",
                    known.len(),
                    sample.len()
                );
                continue;
            }
        };
        match best {
            Some((_, d)) if d <= distance => {}
            _ => best = Some((id, distance)),
        }
    }

    let (id, distance) = best?;
    if distance <= tolerance {
        Some(FaceMatch {
            id: id.clone(),
            distance,
            confidence: confidence(distance, tolerance),
        })
    } else {
        log::info!("No face within tolerance, best distance {:.4}", distance);
        None
    }
}

/// Decodes stored encodings, dropping the ones that no longer parse.
pub fn decode_candidates<I>(rows: impl IntoIterator<Item = (I, Vec<u8>)>) -> Vec<(I, Embedding)> {
    rows.into_iter()
        .filter_map(|(id, bytes)| match Embedding::from_bytes(&bytes) {
            Ok(embedding) => Some((id, embedding)),
            Err(err) => {
                log::warn!("Unreadable stored face encoding: {:?}", err);
                None
            }
        })
        .collect()
}

pub fn verify(stored: &Embedding, sample: &Embedding, tolerance: f64) -> bool {
    stored
        .distance(sample)
        .map(|d| d <= tolerance)
        .unwrap_or(false)
}

pub fn confidence(distance: f64, tolerance: f64) -> f64 {
    (1.0 - distance / tolerance).clamp(0.0, 1.0)
}

/// An uploaded photo that has passed validation.
#[derive(Debug, Clone)]
pub struct FaceImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl FaceImage {
    pub fn from_upload(file_name: &str, bytes: Vec<u8>, max_bytes: usize) -> Result<Self, Error> {
        if file_name.is_empty() {
            return Err(Error::InvalidImage {
                message: "No image selected".to_string(),
            });
        }
        if !allowed_file(file_name) {
            return Err(Error::InvalidImage {
                message: format!("`{}` is not a png, jpg or gif image", file_name),
            });
        }
        if bytes.is_empty() {
            return Err(Error::InvalidImage {
                message: "Empty image".to_string(),
            });
        }
        if bytes.len() > max_bytes {
            return Err(Error::InvalidImage {
                message: format!("Image exceeds {} bytes", max_bytes),
            });
        }
        let decoded = image::load_from_memory(&bytes).map_err(|err| Error::InvalidImage {
            message: format!("Invalid image format: {}", err),
        })?;
        Ok(Self {
            file_name: file_name.to_string(),
            width: decoded.width(),
            height: decoded.height(),
            bytes,
        })
    }
}

#[async_trait]
pub trait FaceEncoder: Send + Sync {
    /// Returns the embedding of the most prominent face, or `None` when the
    /// image contains no face.
    async fn encode(&self, image: &FaceImage) -> anyhow::Result<Option<Embedding>>;
}

pub type SharedEncoder = Arc<dyn FaceEncoder>;

/// Talks to an encoding service that accepts raw image bytes on
/// `POST {base}/encode` and answers `{"encoding": [..] | null}`.
pub struct HttpEncoder {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct EncodeResponse {
    encoding: Option<Vec<f64>>,
}

impl HttpEncoder {
    pub fn new(config: &FaceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.encoder_timeout_secs))
            .build()
            .context("building encoder client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/encode", config.encoder_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl FaceEncoder for HttpEncoder {
    async fn encode(&self, image: &FaceImage) -> anyhow::Result<Option<Embedding>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/octet-stream")
            .body(image.bytes.clone())
            .send()
            .await
            .with_context(|| format!("calling encoder at {}", self.endpoint))?
            .error_for_status()
            .context("encoder rejected image")?;
        let body: EncodeResponse = response.json().await.context("decoding encoder reply")?;
        Ok(body.encoding.map(Embedding))
    }
}

/// Runs the encoder and maps its outcome onto user-facing errors.
pub async fn encode_face(
    encoder: &dyn FaceEncoder,
    image: &FaceImage,
    expected_len: usize,
) -> Result<Embedding, Error> {
    let encoding = encoder.encode(image).await.map_err(|err| {
        log::error!("Face encoder failed: {:?}", err);
        Error::InternalError {
            kind: "EncoderError",
            message: err.to_string(),
        }
    })?;
    match encoding {
        None => {
            log::info!("No face detected in {}", image.file_name);
            Err(Error::NoFaceDetected {
                message: "No face detected. Please try again with better lighting and ensure your face is clearly visible.".to_string(),
            })
        }
        Some(embedding) if embedding.len() != expected_len => Err(Error::InternalError {
            kind: "EncoderError",
            message: format!(
                "encoder produced {} values, expected {}",
                embedding.len(),
                expected_len
            ),
        }),
        Some(embedding) if embedding.0.iter().any(|v| !v.is_finite()) => {
            log::error!("Face encoder returned non-finite values for {}", image.file_name);
            Err(Error::InternalError {
                kind: "EncoderError",
                message: "encoder produced non-finite values".to_string(),
            })
        }
        Some(embedding) => {
            log::debug!(
                "Encoded {}x{} image {}",
                image.width,
                image.height,
                image.file_name
            );
            Ok(embedding)
        }
    }
}
