//! 篡改检测 (Tamper classifier)
//!
//! Preprocessing policy, calibration rule and the `classify` entry point.
//! The model's raw scalar is the probability that the image was manipulated.

use std::sync::Arc;

use image::imageops::FilterType;
use tracing::{debug, warn};

use crate::error::{Result, VerifyError};
use crate::evidence::{AuthenticityLabel, Classification};
use crate::model::ModelService;
use crate::predictor::ImageTensor;

/// Pixel scaling used at training time: `value / 255`, RGB order, no mean
/// subtraction. Every predictor input goes through [`preprocess`].
pub const PIXEL_SCALE: f32 = 1.0 / 255.0;

/// Raw scores at or above this are reported as `Fake`.
pub const FAKE_THRESHOLD: f32 = 0.5;

/// Decode to RGB, resize to `side` x `side`, scale to `[0, 1]`.
pub fn preprocess(bytes: &[u8], side: u32) -> Result<ImageTensor> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| VerifyError::Inference(format!("decode: {e}")))?;
    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(&rgb, side, side, FilterType::Triangle);
    let data = resized
        .into_raw()
        .into_iter()
        .map(|v| v as f32 * PIXEL_SCALE)
        .collect();
    let s = side as usize;
    Ok(ImageTensor { data, shape: [1, s, s, 3] })
}

/// Map the raw probability-of-manipulation to a (label, confidence) pair
/// where confidence is always about the reported label.
pub fn calibrate(raw: f32) -> Classification {
    if !raw.is_finite() {
        return Classification::ERROR;
    }
    let raw = raw.clamp(0.0, 1.0);
    if raw >= FAKE_THRESHOLD {
        Classification { label: AuthenticityLabel::Fake, confidence: raw }
    } else {
        Classification { label: AuthenticityLabel::Real, confidence: 1.0 - raw }
    }
}

pub struct Classifier {
    model: Arc<ModelService>,
}

impl Classifier {
    pub fn new(model: Arc<ModelService>) -> Self {
        Self { model }
    }

    /// Never fails: any error becomes `(Error, 0.0)`.
    pub async fn classify(&self, bytes: Arc<[u8]>) -> Classification {
        match self.try_classify(bytes).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "classification failed");
                Classification::ERROR
            }
        }
    }

    /// Same as [`classify`](Self::classify) but keeps the failure reason.
    pub async fn try_classify(&self, bytes: Arc<[u8]>) -> Result<Classification> {
        let predictor = self.model.ensure_ready().await?;
        let side = self.model.input_size();

        let raw = tokio::task::spawn_blocking(move || -> Result<f32> {
            let tensor = preprocess(&bytes, side)?;
            let out = predictor.infer(&tensor)?;
            out.first()
                .copied()
                .ok_or_else(|| VerifyError::Inference("empty model output".into()))
        })
        .await
        .map_err(|e| VerifyError::Inference(format!("inference task: {e}")))??;

        let result = calibrate(raw);
        debug!(raw, label = ?result.label, confidence = result.confidence, "classified");
        if result.label == AuthenticityLabel::Error {
            return Err(VerifyError::Inference(format!("non-finite model output {raw}")));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::predictor::Predictor;
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};

    fn png(img: RgbImage) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn calibration_direction_is_probability_of_fake() {
        let c = calibrate(0.9);
        assert_eq!(c.label, AuthenticityLabel::Fake);
        assert!((c.confidence - 0.9).abs() < 1e-6);

        let c = calibrate(0.2);
        assert_eq!(c.label, AuthenticityLabel::Real);
        assert!((c.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(calibrate(0.5).label, AuthenticityLabel::Fake);
        assert_eq!(calibrate(0.499_99).label, AuthenticityLabel::Real);
    }

    #[test]
    fn confidence_always_in_unit_interval() {
        for i in 0..=100 {
            let c = calibrate(i as f32 / 100.0);
            assert!((0.0..=1.0).contains(&c.confidence));
            assert!(c.confidence >= 0.5);
        }
        assert!((0.0..=1.0).contains(&calibrate(1.7).confidence));
        assert!((0.0..=1.0).contains(&calibrate(-0.3).confidence));
        assert_eq!(calibrate(f32::NAN), Classification::ERROR);
    }

    #[test]
    fn preprocessing_scales_to_unit_range() {
        let white = png(RgbImage::from_pixel(50, 30, Rgb([255, 255, 255])));
        let t = preprocess(&white, 224).unwrap();
        assert_eq!(t.shape, [1, 224, 224, 3]);
        assert_eq!(t.data.len(), 224 * 224 * 3);
        assert!(t.data.iter().all(|v| (v - 1.0).abs() < 1e-6));

        let black = png(RgbImage::from_pixel(10, 10, Rgb([0, 0, 0])));
        let t = preprocess(&black, 224).unwrap();
        assert!(t.data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn preprocessing_keeps_rgb_order() {
        let red = png(RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])));
        let t = preprocess(&red, 4).unwrap();
        assert!((t.data[0] - 1.0).abs() < 1e-6);
        assert_eq!(t.data[1], 0.0);
        assert_eq!(t.data[2], 0.0);
    }

    struct Fixed(f32);
    impl Predictor for Fixed {
        fn infer(&self, t: &ImageTensor) -> Result<Vec<f32>> {
            assert!(t.data.iter().all(|v| (0.0..=1.0).contains(v)));
            Ok(vec![self.0])
        }
        fn kind(&self) -> &'static str {
            "fixed"
        }
    }

    fn classifier(raw: f32) -> Classifier {
        Classifier::new(Arc::new(ModelService::preloaded(
            ModelConfig::default(),
            Arc::new(Fixed(raw)),
        )))
    }

    #[tokio::test]
    async fn classify_reports_calibrated_label() {
        let bytes: Arc<[u8]> = png(RgbImage::from_pixel(32, 32, Rgb([10, 20, 30]))).into();
        let c = classifier(0.9).classify(bytes.clone()).await;
        assert_eq!(c.label, AuthenticityLabel::Fake);
        let c = classifier(0.2).classify(bytes).await;
        assert_eq!(c.label, AuthenticityLabel::Real);
        assert!((c.confidence - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn undecodable_input_is_error_label() {
        let c = classifier(0.1).classify(Arc::from(&b"garbage"[..])).await;
        assert_eq!(c, Classification::ERROR);
    }

    #[tokio::test]
    async fn unavailable_model_is_error_label() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfig { cache_dir: dir.path().to_path_buf(), ..ModelConfig::default() };
        let svc = ModelService::with_loader(cfg, Arc::new(crate::model::TractLoader));
        let c = Classifier::new(Arc::new(svc)).classify(Arc::from(&b"x"[..])).await;
        assert_eq!(c, Classification::ERROR);
    }
}
