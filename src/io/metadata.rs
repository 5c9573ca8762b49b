use crate::core::reflectance::ReflectanceCalibrator;
use crate::types::{BandCode, S2Error, S2Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Fields encoded in a Sentinel-2 product name, e.g.
/// `S2A_MSIL1C_20230101T032131_N0509_R118_T48QWJ_20230101T050843`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductName {
    pub mission: String,
    pub processing_level: String,
    pub sensing_time: DateTime<Utc>,
    pub baseline: String,
    pub relative_orbit: u32,
    pub tile: String,
}

impl ProductName {
    pub fn parse(name: &str) -> S2Result<Self> {
        let pattern = Regex::new(
            r"(S2[ABCD])_MSI(L1C|L2A)_(\d{8}T\d{6})_N(\d{4})_R(\d{3})_T(\d{2}[A-Z]{3})",
        )
        .map_err(|e| S2Error::Metadata(format!("Regex error: {}", e)))?;

        let caps = pattern
            .captures(name)
            .ok_or_else(|| S2Error::Metadata(format!("Not a Sentinel-2 product name: {}", name)))?;

        let sensing_time = NaiveDateTime::parse_from_str(&caps[3], "%Y%m%dT%H%M%S")
            .map_err(|e| S2Error::Metadata(format!("Invalid sensing time {}: {}", &caps[3], e)))?
            .and_utc();
        let relative_orbit = caps[5]
            .parse::<u32>()
            .map_err(|e| S2Error::Metadata(format!("Invalid relative orbit: {}", e)))?;

        Ok(Self {
            mission: caps[1].to_string(),
            processing_level: caps[2].to_string(),
            sensing_time,
            baseline: caps[4].to_string(),
            relative_orbit,
            tile: caps[6].to_string(),
        })
    }

    /// UTM CRS of the MGRS tile (`EPSG:326zz` north, `EPSG:327zz` south)
    pub fn utm_crs(&self) -> S2Result<String> {
        let zone: u32 = self.tile[..2]
            .parse()
            .map_err(|e| S2Error::Metadata(format!("Invalid UTM zone in tile {}: {}", self.tile, e)))?;
        let latitude_band = self.tile.as_bytes()[2];
        // MGRS latitude bands C..M are south of the equator
        let base = if latitude_band >= b'N' { 32600 } else { 32700 };
        Ok(format!("EPSG:{}", base + zone))
    }
}

/// Product-level metadata from `MTD_MSIL1C.xml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub product_uri: Option<String>,
    pub spacecraft: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub processing_baseline: Option<String>,
    pub quantification_value: Option<f32>,
    /// RADIO_ADD_OFFSET keyed by band_id (classifier band position)
    pub radiometric_offsets: BTreeMap<usize, f32>,
}

impl ProductMetadata {
    pub fn from_file<P: AsRef<Path>>(path: P) -> S2Result<Self> {
        log::debug!("Reading product metadata: {}", path.as_ref().display());
        let xml = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&xml)
    }

    pub fn parse(xml: &str) -> S2Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut meta = ProductMetadata::default();
        let mut curr = String::new();
        let mut band_id: Option<usize> = None;

        loop {
            match reader
                .read_event()
                .map_err(|e| S2Error::Metadata(format!("XML error: {}", e)))?
            {
                Event::Start(ref e) => {
                    curr = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    band_id = None;
                    if curr == "RADIO_ADD_OFFSET" {
                        let attr = e
                            .try_get_attribute("band_id")
                            .map_err(|e| S2Error::Metadata(format!("XML attribute error: {}", e)))?;
                        if let Some(attr) = attr {
                            let value = attr
                                .unescape_value()
                                .map_err(|e| S2Error::Metadata(format!("XML attribute error: {}", e)))?;
                            band_id = value.trim().parse().ok();
                        }
                    }
                }
                Event::End(_) => curr.clear(),
                Event::Text(e) => {
                    let txt = e
                        .unescape()
                        .map_err(|e| S2Error::Metadata(format!("XML text error: {}", e)))?;
                    let txt = txt.trim();
                    match curr.as_str() {
                        "PRODUCT_URI" => meta.product_uri = Some(txt.to_string()),
                        "SPACECRAFT_NAME" => meta.spacecraft = Some(txt.to_string()),
                        "PROCESSING_BASELINE" => meta.processing_baseline = Some(txt.to_string()),
                        "PRODUCT_START_TIME" => {
                            meta.start_time = DateTime::parse_from_rfc3339(txt)
                                .ok()
                                .map(|t| t.with_timezone(&Utc));
                        }
                        "QUANTIFICATION_VALUE" => meta.quantification_value = txt.parse().ok(),
                        "RADIO_ADD_OFFSET" => {
                            if let (Some(id), Ok(offset)) = (band_id, txt.parse::<f32>()) {
                                meta.radiometric_offsets.insert(id, offset);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(meta)
    }

    /// Calibrator for a whole band stack. Level-1C products carry the same
    /// offset for every band, so the blue band's entry stands for all of them.
    pub fn calibrator(&self) -> ReflectanceCalibrator {
        let offsets: Vec<f32> = self.radiometric_offsets.values().copied().collect();
        if offsets.windows(2).any(|w| w[0] != w[1]) {
            log::warn!("Radiometric offsets differ between bands: {:?}", self.radiometric_offsets);
        }
        self.calibrator_for(BandCode::B02)
    }

    /// Calibrator built from the product's offset and quantification value,
    /// falling back to the fixed defaults for anything the product omits
    pub fn calibrator_for(&self, band: BandCode) -> ReflectanceCalibrator {
        let defaults = ReflectanceCalibrator::default();
        ReflectanceCalibrator {
            offset: self
                .radiometric_offsets
                .get(&band.metadata_index())
                .map(|add_offset| -add_offset)
                .unwrap_or(defaults.offset),
            quantification: self.quantification_value.unwrap_or(defaults.quantification),
        }
    }
}
