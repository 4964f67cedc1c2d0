//! 元数据取证 (Metadata forensics)
//!
//! Parses embedded EXIF tags into a flat map and derives device, capture
//! time, GPS position and a list of independent findings. Missing tags are
//! data, not errors; only corrupt containers fail.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use exif::{In, Tag, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MetadataConfig;
use crate::error::{Result, VerifyError};
use crate::geocode::ReverseGeocoder;

pub const MISSING_TIMESTAMP: &str = "Missing timestamp";
pub const MISSING_DEVICE: &str = "Missing device information";
pub const MISSING_GPS: &str = "Missing GPS data";

const SOFTWARE_TAG: &str = "Software";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataStatus {
    Clean,
    PhotoshopDetected,
    NoMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// 6 位小数，例如 `37.422000, -122.084000`
    pub fn display(&self) -> String {
        format!("{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataReport {
    pub status: MetadataStatus,
    pub details: BTreeMap<String, String>,
    pub device: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub timestamp: Option<String>,
    pub inconsistencies: Vec<String>,
}

impl MetadataReport {
    /// What an image without any embedded tags looks like.
    pub fn empty() -> Self {
        Self {
            status: MetadataStatus::NoMetadata,
            details: BTreeMap::new(),
            device: None,
            coordinates: None,
            location: None,
            address: None,
            timestamp: None,
            inconsistencies: Vec::new(),
        }
    }
}

/// Tags pulled out of the container before interpretation.
#[derive(Debug, Clone, Default)]
pub struct RawMetadata {
    pub details: BTreeMap<String, String>,
    pub gps: Option<Coordinates>,
}

/// Read primary-image EXIF fields. An image without an EXIF block yields an
/// empty [`RawMetadata`]; a corrupt block is a [`VerifyError::MetadataParse`].
pub fn read_exif(bytes: &[u8]) -> Result<RawMetadata> {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(RawMetadata::default()),
        Err(e) => return Err(VerifyError::MetadataParse(e.to_string())),
    };

    let mut details = BTreeMap::new();
    for field in exif.fields().filter(|f| f.ifd_num == In::PRIMARY) {
        let value = match &field.value {
            // display_value() quotes ASCII; keep the bare string
            Value::Ascii(parts) => parts
                .iter()
                .map(|p| String::from_utf8_lossy(p).trim_end_matches('\0').to_string())
                .collect::<Vec<_>>()
                .join(" "),
            _ => field.display_value().with_unit(&exif).to_string(),
        };
        details.insert(field.tag.to_string(), value);
    }

    let gps = read_gps(&exif);
    Ok(RawMetadata { details, gps })
}

fn read_gps(exif: &exif::Exif) -> Option<Coordinates> {
    let lat = dms(&exif.get_field(Tag::GPSLatitude, In::PRIMARY)?.value)?;
    let lon = dms(&exif.get_field(Tag::GPSLongitude, In::PRIMARY)?.value)?;
    let lat_ref = ascii(exif.get_field(Tag::GPSLatitudeRef, In::PRIMARY).map(|f| &f.value));
    let lon_ref = ascii(exif.get_field(Tag::GPSLongitudeRef, In::PRIMARY).map(|f| &f.value));
    Some(apply_hemisphere(lat, lat_ref.as_deref(), lon, lon_ref.as_deref()))
}

fn dms(value: &Value) -> Option<[f64; 3]> {
    match value {
        Value::Rational(r) if r.len() >= 3 => {
            let mut out = [0.0; 3];
            for (slot, part) in out.iter_mut().zip(r.iter()) {
                if part.denom == 0 {
                    return None;
                }
                *slot = part.to_f64();
            }
            Some(out)
        }
        _ => None,
    }
}

fn ascii(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Ascii(parts) => parts
            .first()
            .map(|p| String::from_utf8_lossy(p).trim().to_string()),
        _ => None,
    }
}

/// Degrees/minutes/seconds to signed decimal degrees.
pub fn dms_to_decimal(parts: [f64; 3]) -> f64 {
    parts[0] + parts[1] / 60.0 + parts[2] / 3600.0
}

/// South and West references negate. A missing reference is read as N/E.
pub fn apply_hemisphere(
    lat: [f64; 3],
    lat_ref: Option<&str>,
    lon: [f64; 3],
    lon_ref: Option<&str>,
) -> Coordinates {
    let mut latitude = dms_to_decimal(lat);
    let mut longitude = dms_to_decimal(lon);
    if matches!(lat_ref, Some(r) if !r.eq_ignore_ascii_case("N")) {
        latitude = -latitude;
    }
    if matches!(lon_ref, Some(r) if !r.eq_ignore_ascii_case("E")) {
        longitude = -longitude;
    }
    Coordinates { latitude, longitude }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct MetadataAnalyzer {
    device_tags: Vec<String>,
    timestamp_tags: Vec<String>,
    editor_signatures: Vec<String>,
    geocoder: Option<Arc<ReverseGeocoder>>,
}

impl MetadataAnalyzer {
    pub fn new(cfg: &MetadataConfig, geocoder: Option<Arc<ReverseGeocoder>>) -> Self {
        Self {
            device_tags: cfg.device_tags.clone(),
            timestamp_tags: cfg.timestamp_tags.clone(),
            editor_signatures: cfg.editor_signatures.clone(),
            geocoder,
        }
    }

    pub async fn analyze(&self, bytes: &[u8]) -> Result<MetadataReport> {
        let raw = read_exif(bytes)?;
        let mut report = self.interpret(raw);
        if let (Some(geocoder), Some(coords)) = (&self.geocoder, report.coordinates) {
            report.address = geocoder.reverse(coords).await;
        }
        Ok(report)
    }

    /// Pure part of the analysis: everything except the address lookup.
    pub fn interpret(&self, raw: RawMetadata) -> MetadataReport {
        let RawMetadata { details, gps } = raw;
        let has_tags = !details.is_empty();

        let device = first_present(&details, &self.device_tags);
        let timestamp = first_present(&details, &self.timestamp_tags);
        let editor = details.get(SOFTWARE_TAG).and_then(|software| {
            let lowered = software.to_lowercase();
            self.editor_signatures
                .iter()
                .find(|sig| lowered.contains(&sig.to_lowercase()))
                .cloned()
        });

        let mut inconsistencies = Vec::new();
        if timestamp.is_none() {
            inconsistencies.push(MISSING_TIMESTAMP.to_string());
        }
        if device.is_none() {
            inconsistencies.push(MISSING_DEVICE.to_string());
        }
        if gps.is_none() {
            inconsistencies.push(MISSING_GPS.to_string());
        }

        let status = if let Some(sig) = &editor {
            inconsistencies.push(format!("Edited with {sig}"));
            MetadataStatus::PhotoshopDetected
        } else if has_tags {
            MetadataStatus::Clean
        } else {
            MetadataStatus::NoMetadata
        };

        debug!(?status, tags = details.len(), findings = inconsistencies.len(), "metadata interpreted");

        MetadataReport {
            status,
            details,
            device,
            coordinates: gps,
            location: gps.map(|c| c.display()),
            address: None,
            timestamp,
            inconsistencies,
        }
    }
}

fn first_present(details: &BTreeMap<String, String>, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|tag| details.get(tag))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> MetadataAnalyzer {
        MetadataAnalyzer::new(&MetadataConfig::default(), None)
    }

    fn raw(pairs: &[(&str, &str)], gps: Option<Coordinates>) -> RawMetadata {
        RawMetadata {
            details: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            gps,
        }
    }

    #[test]
    fn no_tags_is_no_metadata_not_error() {
        let report = analyzer().interpret(RawMetadata::default());
        assert_eq!(report.status, MetadataStatus::NoMetadata);
        assert!(report.details.is_empty());
        assert!(report.inconsistencies.contains(&MISSING_DEVICE.to_string()));
        assert!(report.inconsistencies.contains(&MISSING_GPS.to_string()));
        assert!(!report.inconsistencies.iter().any(|i| i.contains("Photoshop")));
    }

    #[test]
    fn photoshop_wins_over_everything() {
        let gps = Coordinates { latitude: 1.0, longitude: 2.0 };
        let report = analyzer().interpret(raw(
            &[
                ("Software", "Adobe Photoshop 25.1 (Windows)"),
                ("Model", "Pixel 7"),
                ("DateTimeOriginal", "2024:01:01 10:00:00"),
            ],
            Some(gps),
        ));
        assert_eq!(report.status, MetadataStatus::PhotoshopDetected);
        assert_eq!(report.inconsistencies, vec!["Edited with Photoshop".to_string()]);
    }

    #[test]
    fn device_priority_order() {
        let report = analyzer().interpret(raw(&[("Make", "Google"), ("Model", "Pixel 7")], None));
        assert_eq!(report.device.as_deref(), Some("Pixel 7"));

        let report = analyzer().interpret(raw(&[("Make", "Google"), ("Manufacturer", "X")], None));
        assert_eq!(report.device.as_deref(), Some("Google"));
    }

    #[test]
    fn findings_are_additive() {
        let report = analyzer().interpret(raw(&[("Software", "Photoshop")], None));
        assert_eq!(report.inconsistencies.len(), 4);
        assert_eq!(report.status, MetadataStatus::PhotoshopDetected);
    }

    #[test]
    fn hemisphere_signs() {
        let c = apply_hemisphere([33.0, 51.0, 54.0], Some("S"), [151.0, 12.0, 36.0], Some("E"));
        assert!((c.latitude + 33.865).abs() < 1e-9);
        assert!((c.longitude - 151.21).abs() < 1e-9);
        assert_eq!(c.display(), "-33.865000, 151.210000");

        let c = apply_hemisphere([40.0, 30.0, 0.0], Some("N"), [73.0, 0.0, 0.0], Some("W"));
        assert_eq!(c.display(), "40.500000, -73.000000");
    }

    #[test]
    fn blank_device_tag_is_skipped() {
        let report = analyzer().interpret(raw(&[("Model", "  "), ("Make", "Canon")], None));
        assert_eq!(report.device.as_deref(), Some("Canon"));
    }

    #[test]
    fn image_without_exif_reads_empty() {
        let mut jpeg = Vec::new();
        image::DynamicImage::new_rgb8(4, 4)
            .write_to(&mut jpeg, image::ImageOutputFormat::Jpeg(90))
            .unwrap();
        let raw = read_exif(&jpeg).unwrap();
        assert!(raw.details.is_empty());
        assert!(raw.gps.is_none());
    }
}
