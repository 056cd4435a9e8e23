//! Local image embedding via a CLIP-style ONNX image encoder
//!
//! The model is loaded lazily on the first embed call and reused for the
//! rest of the process. Per-image failures (corrupt file, unsupported
//! codec) yield `Ok(None)` so a chunk still indexes with its image flag
//! and no vector; a missing model file disables image vectors entirely.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::Array4;
use once_cell::sync::OnceCell;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, warn};

use crate::error::{RecollectError, Result};

/// CLIP ViT-B/32 input resolution
const INPUT_SIZE: u32 = 224;

/// CLIP normalization constants
const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Output dimensions of the image tower
pub const IMAGE_EMBEDDING_DIM: usize = 512;

/// Lazily-initialized local vision encoder
pub struct VisionEmbedder {
    model_path: Option<PathBuf>,
    session: OnceCell<Option<Mutex<Session>>>,
}

impl VisionEmbedder {
    /// `model_path = None` produces an embedder that always returns
    /// `Ok(None)`, which keeps the pipeline shape identical without a
    /// model on disk.
    pub fn new(model_path: Option<PathBuf>) -> Self {
        Self {
            model_path,
            session: OnceCell::new(),
        }
    }

    pub fn dimensions(&self) -> usize {
        IMAGE_EMBEDDING_DIM
    }

    /// Embed one image file. `Ok(None)` means the image (or the model)
    /// was unusable; the caller indexes without a vector.
    pub fn embed_image(&self, path: &Path) -> Result<Option<Vec<f32>>> {
        let Some(session) = self.session()? else {
            return Ok(None);
        };

        let pixels = match self.preprocess(path) {
            Ok(p) => p,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "image preprocessing failed");
                return Ok(None);
            }
        };

        let mut session = session
            .lock()
            .map_err(|_| RecollectError::ImageEmbed("vision session poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs!["pixel_values" => pixels.view()]?)
            .map_err(|e| RecollectError::ImageEmbed(e.to_string()))?;

        let tensor = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecollectError::ImageEmbed(e.to_string()))?;

        let mut vector: Vec<f32> = tensor.iter().copied().collect();
        if vector.is_empty() {
            return Ok(None);
        }
        l2_normalize(&mut vector);
        Ok(Some(vector))
    }

    /// Load the session on first use
    fn session(&self) -> Result<Option<&Mutex<Session>>> {
        let cell = self.session.get_or_try_init(|| -> Result<_> {
            let Some(path) = &self.model_path else {
                debug!("no vision model configured; image vectors disabled");
                return Ok(None);
            };
            if !path.exists() {
                warn!(path = %path.display(), "vision model not found; image vectors disabled");
                return Ok(None);
            }

            let session = Session::builder()
                .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
                .and_then(|b| b.commit_from_file(path))
                .map_err(|e| RecollectError::ImageEmbed(format!("model load: {}", e)))?;

            debug!(path = %path.display(), "loaded vision model");
            Ok(Some(Mutex::new(session)))
        })?;
        Ok(cell.as_ref())
    }

    /// Decode, resize, and normalize to NCHW float32
    fn preprocess(&self, path: &Path) -> Result<Array4<f32>> {
        let img = image::open(path)
            .map_err(|e| RecollectError::ImageEmbed(format!("decode {}: {}", path.display(), e)))?
            .resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::CatmullRom)
            .to_rgb8();

        let side = INPUT_SIZE as usize;
        let mut pixels = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in img.enumerate_pixels() {
            for channel in 0..3 {
                pixels[[0, channel, y as usize, x as usize]] =
                    (pixel[channel] as f32 / 255.0 - MEAN[channel]) / STD[channel];
            }
        }
        Ok(pixels)
    }
}

impl From<ort::Error> for RecollectError {
    fn from(e: ort::Error) -> Self {
        RecollectError::ImageEmbed(e.to_string())
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
