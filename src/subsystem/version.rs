//! Instrument identity.

use crate::error::{TspError, TspResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Instrument families that differ in how scripts become byte code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstrumentModelFamily {
    /// Series 2600 source-measure units.
    K2600,
    /// Series 3700 switch systems.
    K3700,
    /// Graphical SMUs (2450, 2460, 2461, 2470).
    K2450,
    /// Graphical DMMs (6500, 7510).
    K7500,
    /// Anything else.
    #[default]
    Unknown,
}

impl InstrumentModelFamily {
    /// Classifies a model number such as `2612B` or `DMM7510`.
    pub fn from_model(model: &str) -> Self {
        let digits: String = model
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(char::is_ascii_digit)
            .collect();
        match digits.get(..2) {
            Some("26") => Self::K2600,
            Some("37") => Self::K3700,
            Some("24") => Self::K2450,
            Some("65") | Some("75") => Self::K7500,
            _ => Self::Unknown,
        }
    }
}

/// Dotted firmware version, compared numerically; missing parts count as zero.
#[derive(Debug, Clone, Default)]
pub struct FirmwareVersion(Vec<u32>);

impl FirmwareVersion {
    /// Parses `3.3.5`, `1.7.12b` and similar, ignoring trailing letters.
    pub fn parse(text: &str) -> Option<Self> {
        let parts: Vec<u32> = text
            .trim()
            .split('.')
            .map_while(|p| {
                let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().ok()
            })
            .collect();
        (!parts.is_empty()).then_some(Self(parts))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for FirmwareVersion {}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&text.join("."))
    }
}

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionInfo {
    /// Manufacturer name.
    pub manufacturer: String,
    /// Model number without the `Model ` prefix.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Firmware revision as printed.
    pub firmware_revision: String,
    /// Firmware revision parsed for comparisons.
    pub firmware_version: Option<FirmwareVersion>,
    /// Family derived from the model.
    pub model_family: InstrumentModelFamily,
}

impl VersionInfo {
    /// Parses `manufacturer, model, serial, firmware`.
    pub fn parse(identity: &str) -> TspResult<Self> {
        let fields: Vec<&str> = identity.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return Err(TspError::Parse {
                query: "*IDN?".to_string(),
                reply: identity.to_string(),
            });
        }
        let model = fields[1]
            .strip_prefix("MODEL ")
            .or_else(|| fields[1].strip_prefix("Model "))
            .unwrap_or(fields[1])
            .trim()
            .to_string();
        let firmware_revision = fields[3].to_string();
        Ok(Self {
            manufacturer: fields[0].to_string(),
            model_family: InstrumentModelFamily::from_model(&model),
            model,
            serial_number: fields[2].to_string(),
            firmware_version: FirmwareVersion::parse(&firmware_revision),
            firmware_revision,
        })
    }
}
