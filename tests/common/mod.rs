#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use exif::experimental::Writer;
use exif::{Field, In, Rational, Tag, Value};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};

use jianzhen_core::classifier::Classifier;
use jianzhen_core::config::{Config, MetadataConfig, ModelConfig, NotaryConfig, NotaryKind};
use jianzhen_core::error::Result;
use jianzhen_core::ledger::Ledger;
use jianzhen_core::metadata::MetadataAnalyzer;
use jianzhen_core::mmr_store::MmrStore;
use jianzhen_core::model::ModelService;
use jianzhen_core::notary::{Backend, Notary};
use jianzhen_core::orchestrator::Orchestrator;
use jianzhen_core::predictor::{ImageTensor, Predictor};
use jianzhen_core::signer::CheckpointSigner;
use jianzhen_core::store::EvidenceStore;
use jianzhen_core::tsa::TsaNotary;

/// Returns the same raw score for every input.
pub struct FixedScore(pub f32);

impl Predictor for FixedScore {
    fn infer(&self, _: &ImageTensor) -> Result<Vec<f32>> {
        Ok(vec![self.0])
    }
    fn kind(&self) -> &'static str {
        "fixed"
    }
}

/// A gradient so the perceptual hash is not degenerate.
pub fn plain_jpeg(side: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(side, side, |x, y| {
        Rgb([(x * 255 / side) as u8, (y * 255 / side) as u8, 128])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageOutputFormat::Jpeg(90))
        .unwrap();
    out
}

fn ascii(tag: Tag, s: &str) -> Field {
    Field { tag, ifd_num: In::PRIMARY, value: Value::Ascii(vec![s.as_bytes().to_vec()]) }
}

fn dms(tag: Tag, d: u32, m: u32, s_hundredths: u32) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value: Value::Rational(vec![
            Rational { num: d, denom: 1 },
            Rational { num: m, denom: 1 },
            Rational { num: s_hundredths, denom: 100 },
        ]),
    }
}

pub struct ExifSpec<'a> {
    pub model: Option<&'a str>,
    pub software: Option<&'a str>,
    pub taken_at: Option<&'a str>,
    pub gps: bool,
}

impl Default for ExifSpec<'_> {
    fn default() -> Self {
        Self {
            model: Some("Pixel 7"),
            software: None,
            taken_at: Some("2024:03:09 14:21:05"),
            gps: true,
        }
    }
}

/// Encode the fields as TIFF with the kamadak writer and splice them into
/// the JPEG as an APP1 `Exif\0\0` segment right after SOI.
pub fn jpeg_with_exif(side: u32, spec: &ExifSpec) -> Vec<u8> {
    let mut fields = Vec::new();
    if let Some(m) = spec.model {
        fields.push(ascii(Tag::Model, m));
    }
    if let Some(s) = spec.software {
        fields.push(ascii(Tag::Software, s));
    }
    if let Some(t) = spec.taken_at {
        fields.push(ascii(Tag::DateTimeOriginal, t));
    }
    if spec.gps {
        // 37°25'19.07"N 122°5'6.24"W
        fields.push(ascii(Tag::GPSLatitudeRef, "N"));
        fields.push(dms(Tag::GPSLatitude, 37, 25, 1907));
        fields.push(ascii(Tag::GPSLongitudeRef, "W"));
        fields.push(dms(Tag::GPSLongitude, 122, 5, 624));
    }

    let mut writer = Writer::new();
    for f in &fields {
        writer.push_field(f);
    }
    let mut tiff = Cursor::new(Vec::new());
    writer.write(&mut tiff, false).unwrap();
    let tiff = tiff.into_inner();

    let jpeg = plain_jpeg(side);
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    let len = (2 + 6 + tiff.len()) as u16;
    let mut out = Vec::with_capacity(jpeg.len() + tiff.len() + 10);
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(b"Exif\0\0");
    out.extend_from_slice(&tiff);
    out.extend_from_slice(&jpeg[2..]);
    out
}

pub fn test_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage.db_path = dir.join("db");
    cfg.storage.proof_dir = dir.join("proofs");
    cfg.storage.ledger_path = dir.join("ledger.jsonl");
    cfg.notary.key_path = dir.join("notary.key");
    cfg.model.cache_dir = dir.join("models");
    cfg
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub model: Arc<ModelService>,
}

/// Full pipeline over a temp dir: fixed-score model, MMR notary.
pub fn mmr_pipeline(dir: &Path, raw_score: f32) -> Harness {
    let cfg = test_config(dir);
    let store = EvidenceStore::open(&cfg.storage.db_path).unwrap();
    let signer = Arc::new(CheckpointSigner::load_or_generate(&cfg.notary.key_path).unwrap());
    let mmr = MmrStore::open(store.db(), signer).unwrap();
    let notary = Notary::from_config(&cfg, mmr).unwrap();
    build(cfg.model, store, notary, raw_score)
}

/// Same pipeline but notarizing against a TSA at `tsa_url`.
pub fn tsa_pipeline(dir: &Path, tsa_url: &str, raw_score: f32) -> Harness {
    let cfg = test_config(dir);
    let store = EvidenceStore::open(&cfg.storage.db_path).unwrap();
    let tsa = TsaNotary::new(&NotaryConfig {
        backend: NotaryKind::Tsa,
        tsa_url: tsa_url.to_string(),
        timeout_secs: 2,
        max_retries: 1,
        ..NotaryConfig::default()
    })
    .unwrap();
    let ledger = Ledger::open(&cfg.storage.ledger_path).unwrap();
    let notary = Notary::new(Backend::Tsa(tsa), cfg.storage.proof_dir.clone(), ledger);
    build(cfg.model, store, notary, raw_score)
}

fn build(model_cfg: ModelConfig, store: EvidenceStore, notary: Notary, raw_score: f32) -> Harness {
    let model = Arc::new(ModelService::preloaded(model_cfg, Arc::new(FixedScore(raw_score))));
    let classifier = Arc::new(Classifier::new(model.clone()));
    let metadata = Arc::new(MetadataAnalyzer::new(&MetadataConfig::default(), None));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(store),
        classifier,
        metadata,
        Arc::new(notary),
    ));
    Harness { orchestrator, model }
}
