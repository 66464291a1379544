//! Alert Types
//!
//! The alert entity, its category table, and the upstream wire records it is
//! built from. Upstream payloads are loosely typed (ids and category codes
//! arrive as either strings or numbers) so deserialization here is lenient;
//! everything downstream works with the normalized [`Alert`].
//!
//! # Wire Format
//!
//! Alerts are published to consumers as JSON objects:
//!
//! ```json
//! {"id":"133","cat":"1","type":"missiles","title":"ירי רקטות וטילים",
//!  "cities":["אשקלון"],"instructions":"...","received_at":"2024-01-01T12:00:00Z"}
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Jerusalem;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Marker the upstream places in area names of system test alerts.
pub const TEST_AREA_MARKER: &str = "בדיקה";

/// Date format used by the upstream history feed.
const HISTORY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// =============================================================================
// Alert Kind
// =============================================================================

/// Semantic alert type resolved from the upstream category code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    /// Rocket and missile fire.
    Missiles,
    /// Radiological event.
    RadiologicalEvent,
    /// Earthquake.
    EarthQuake,
    /// Tsunami.
    Tsunami,
    /// Hostile aircraft intrusion.
    HostileAircraftIntrusion,
    /// Hazardous materials incident.
    HazardousMaterials,
    /// Terrorist infiltration.
    TerroristInfiltration,
    /// Missile drill.
    MissilesDrill,
    /// Earthquake drill.
    EarthQuakeDrill,
    /// Radiological event drill.
    RadiologicalEventDrill,
    /// Tsunami drill.
    TsunamiDrill,
    /// Hostile aircraft intrusion drill.
    HostileAircraftIntrusionDrill,
    /// Hazardous materials drill.
    HazardousMaterialsDrill,
    /// Terrorist infiltration drill.
    TerroristInfiltrationDrill,
    /// Early warning / news flash.
    NewsFlash,
    /// Any category code outside the known table.
    #[serde(other)]
    Unknown,
}

impl AlertKind {
    /// Resolve the kind for an upstream category code.
    #[must_use]
    pub const fn from_category(category: u16) -> Self {
        match category {
            1 => Self::Missiles,
            2 => Self::RadiologicalEvent,
            3 => Self::EarthQuake,
            4 => Self::Tsunami,
            5 => Self::HostileAircraftIntrusion,
            6 => Self::HazardousMaterials,
            7 => Self::TerroristInfiltration,
            8 => Self::MissilesDrill,
            9 => Self::EarthQuakeDrill,
            10 => Self::RadiologicalEventDrill,
            11 => Self::TsunamiDrill,
            12 => Self::HostileAircraftIntrusionDrill,
            13 => Self::HazardousMaterialsDrill,
            14 => Self::TerroristInfiltrationDrill,
            20 => Self::NewsFlash,
            _ => Self::Unknown,
        }
    }

    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Missiles => "missiles",
            Self::RadiologicalEvent => "radiologicalEvent",
            Self::EarthQuake => "earthQuake",
            Self::Tsunami => "tsunami",
            Self::HostileAircraftIntrusion => "hostileAircraftIntrusion",
            Self::HazardousMaterials => "hazardousMaterials",
            Self::TerroristInfiltration => "terroristInfiltration",
            Self::MissilesDrill => "missilesDrill",
            Self::EarthQuakeDrill => "earthQuakeDrill",
            Self::RadiologicalEventDrill => "radiologicalEventDrill",
            Self::TsunamiDrill => "tsunamiDrill",
            Self::HostileAircraftIntrusionDrill => "hostileAircraftIntrusionDrill",
            Self::HazardousMaterialsDrill => "hazardousMaterialsDrill",
            Self::TerroristInfiltrationDrill => "terroristInfiltrationDrill",
            Self::NewsFlash => "newsFlash",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this kind is an exercise rather than a live event.
    #[must_use]
    pub const fn is_drill(self) -> bool {
        matches!(
            self,
            Self::MissilesDrill
                | Self::EarthQuakeDrill
                | Self::RadiologicalEventDrill
                | Self::TsunamiDrill
                | Self::HostileAircraftIntrusionDrill
                | Self::HazardousMaterialsDrill
                | Self::TerroristInfiltrationDrill
        )
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Alert
// =============================================================================

/// A single emergency alert as stored and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireAlert")]
pub struct Alert {
    /// Upstream-assigned identifier. Unique and immutable once stored.
    pub id: String,
    /// Upstream category code.
    #[serde(rename = "cat", serialize_with = "code_as_text")]
    pub category: u16,
    /// Kind derived from `category`.
    #[serde(rename = "type")]
    pub kind: AlertKind,
    /// Alert headline.
    pub title: String,
    /// Affected areas, in upstream order.
    #[serde(rename = "cities")]
    pub areas: Vec<String>,
    /// Protective instructions; may be empty.
    pub instructions: String,
    /// When the relay first observed the alert.
    #[serde(rename = "received_at")]
    pub observed_at: DateTime<Utc>,
}

/// Lenient inbound form of [`Alert`].
#[derive(Deserialize)]
struct WireAlert {
    #[serde(deserialize_with = "loose_text")]
    id: String,
    #[serde(rename = "cat", deserialize_with = "loose_code", default)]
    category: u16,
    #[serde(rename = "type", default)]
    kind: Option<AlertKind>,
    #[serde(default)]
    title: String,
    #[serde(rename = "cities", alias = "data", default)]
    areas: Vec<String>,
    #[serde(default)]
    instructions: String,
    #[serde(rename = "received_at", default = "Utc::now")]
    observed_at: DateTime<Utc>,
}

impl From<WireAlert> for Alert {
    fn from(wire: WireAlert) -> Self {
        Self {
            id: wire.id,
            category: wire.category,
            kind: wire
                .kind
                .unwrap_or_else(|| AlertKind::from_category(wire.category)),
            title: wire.title,
            areas: wire.areas,
            instructions: wire.instructions,
            observed_at: wire.observed_at,
        }
    }
}

impl Alert {
    /// Create an alert, deriving `kind` from `category` and using the title as
    /// the instructions.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        category: u16,
        areas: Vec<String>,
        title: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            category,
            kind: AlertKind::from_category(category),
            instructions: title.clone(),
            title,
            areas,
            observed_at,
        }
    }

    /// Replace the instructions text.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Normalized keys of the affected areas, deduplicated, in upstream order.
    #[must_use]
    pub fn area_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::with_capacity(self.areas.len());
        for area in &self.areas {
            let key = normalize_area(area);
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// Normalize an area name for indexing and comparison.
///
/// Trims, collapses internal whitespace to single spaces, and lowercases.
#[must_use]
pub fn normalize_area(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_test_area(name: &str) -> bool {
    name.contains(TEST_AREA_MARKER)
}

// =============================================================================
// Upstream Records
// =============================================================================

/// A record from the upstream live snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawAlert {
    /// Upstream id.
    #[serde(default, deserialize_with = "loose_text")]
    pub id: String,
    /// Category code.
    #[serde(default, deserialize_with = "loose_code")]
    pub cat: u16,
    /// Headline.
    #[serde(default, deserialize_with = "loose_text")]
    pub title: String,
    /// Affected areas.
    #[serde(default)]
    pub data: Vec<String>,
    /// Instructions text.
    #[serde(default, deserialize_with = "loose_text")]
    pub desc: String,
}

impl RawAlert {
    /// Create a raw record with the given id, category and areas.
    #[must_use]
    pub fn new(id: impl Into<String>, cat: u16, data: Vec<String>) -> Self {
        Self {
            id: id.into(),
            cat,
            data,
            ..Self::default()
        }
    }

    /// Convert into an [`Alert`] observed at `observed_at`.
    ///
    /// Test areas are dropped. Returns `None` for records without an id or
    /// without any remaining area.
    #[must_use]
    pub fn into_alert(self, observed_at: DateTime<Utc>) -> Option<Alert> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return None;
        }

        let areas: Vec<String> = self
            .data
            .iter()
            .map(|area| area.trim())
            .filter(|area| !area.is_empty() && !is_test_area(area))
            .map(str::to_string)
            .collect();
        if areas.is_empty() {
            return None;
        }

        let instructions = if self.desc.trim().is_empty() {
            self.title.clone()
        } else {
            self.desc
        };

        Some(Alert::new(id, self.cat, areas, self.title, observed_at).with_instructions(instructions))
    }
}

/// Errors decoding an upstream payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Body was not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    /// Body was not valid JSON of the expected shape.
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotBody {
    Many(Vec<RawAlert>),
    One(RawAlert),
}

/// Decode a live snapshot body.
///
/// An empty body (after stripping a UTF-8 byte order mark and whitespace)
/// means "no active alerts". The body may be a single object, an array of
/// objects, or several objects concatenated without separators.
///
/// # Errors
///
/// Returns `PayloadError` if the body cannot be decoded.
pub fn parse_snapshot(body: &[u8]) -> Result<Vec<RawAlert>, PayloadError> {
    let text = decode_body(body)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<SnapshotBody>(text) {
        Ok(SnapshotBody::Many(records)) => Ok(records),
        Ok(SnapshotBody::One(record)) => Ok(vec![record]),
        Err(e) if text.contains("}{") => {
            let joined = format!("[{}]", text.replace("}{", "},{"));
            serde_json::from_str::<Vec<RawAlert>>(&joined).map_err(|_| PayloadError::Json(e))
        }
        Err(e) => Err(e.into()),
    }
}

fn decode_body(body: &[u8]) -> Result<&str, PayloadError> {
    let text = std::str::from_utf8(body)?;
    Ok(text.trim_start_matches('\u{feff}').trim())
}

// =============================================================================
// History Feed
// =============================================================================

/// A per-area entry from the upstream history feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryRecord {
    /// Local time of the alert, `YYYY-MM-DD HH:MM:SS`.
    #[serde(rename = "alertDate", default)]
    pub alert_date: String,
    /// Headline.
    #[serde(default, deserialize_with = "loose_text")]
    pub title: String,
    /// Category code.
    #[serde(default, deserialize_with = "loose_code")]
    pub category: u16,
    /// The single affected area of this entry.
    #[serde(default, deserialize_with = "loose_text")]
    pub data: String,
}

/// Decode a history feed body. Anything other than an array yields no records.
///
/// # Errors
///
/// Returns `PayloadError` if the body is not valid JSON.
pub fn parse_history(body: &[u8]) -> Result<Vec<HistoryRecord>, PayloadError> {
    let text = decode_body(body)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_array() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(value)?)
}

/// Group per-area history entries into alerts.
///
/// Entries sharing `alertDate|category` form one alert whose id is derived
/// from that key, so repeated syncs produce the same ids. Groups keep the
/// order in which they first appear.
#[must_use]
pub fn group_history(records: Vec<HistoryRecord>) -> Vec<Alert> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Alert> = Vec::new();

    for record in records {
        let area = record.data.trim();
        let date = record.alert_date.trim();
        if area.is_empty() || date.is_empty() || is_test_area(area) {
            continue;
        }
        let Some(observed_at) = parse_history_date(date) else {
            tracing::debug!(alert_date = date, "Skipping history entry with invalid date");
            continue;
        };

        let key = format!("{date}|{}", record.category);
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            groups.push(Alert::new(
                history_id(&key),
                record.category,
                Vec::new(),
                record.title.clone(),
                observed_at,
            ));
            groups.len() - 1
        });

        let group = &mut groups[slot];
        if !group.areas.iter().any(|existing| existing == area) {
            group.areas.push(area.to_string());
        }
    }

    groups
}

/// History dates are Israel wall-clock time.
fn parse_history_date(date: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(date, HISTORY_DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    // Ambiguous fall-back times take the earlier instant; times skipped by
    // the spring-forward gap are read an hour later.
    Jerusalem
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            Jerusalem
                .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
}

fn history_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut id = String::with_capacity(17);
    id.push('h');
    for byte in &digest[..8] {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

// =============================================================================
// Lenient Field Codecs
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseValue {
    Text(String),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

fn loose_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<LooseValue>::deserialize(deserializer)? {
        Some(LooseValue::Text(s)) => s,
        Some(LooseValue::Unsigned(n)) => n.to_string(),
        Some(LooseValue::Signed(n)) => n.to_string(),
        Some(LooseValue::Float(n)) => n.to_string(),
        None => String::new(),
    })
}

fn loose_code<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<LooseValue>::deserialize(deserializer)? {
        Some(LooseValue::Text(s)) => s.trim().parse().unwrap_or(0),
        Some(LooseValue::Unsigned(n)) => u16::try_from(n).unwrap_or(0),
        Some(LooseValue::Signed(_) | LooseValue::Float(_)) | None => 0,
    })
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn code_as_text<S>(code: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&code.to_string())
}

// =============================================================================
// Tests
// =============================================================================
