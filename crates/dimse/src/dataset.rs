use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// A DICOM attribute tag, packed as `(group << 16) | element`.
pub type Tag = u32;

/// Tags the fabric inspects. Values are the standard DICOM attributes.
pub mod tags {
    use super::Tag;

    pub const ACCESSION_NUMBER: Tag = 0x0008_0050;
    pub const INSTITUTION_NAME: Tag = 0x0008_0080;
    pub const STATION_NAME: Tag = 0x0008_1010;
    pub const STUDY_DESCRIPTION: Tag = 0x0008_1030;
    pub const MODALITY: Tag = 0x0008_0060;
    pub const SOP_INSTANCE_UID: Tag = 0x0008_0018;
    pub const STUDY_DATE: Tag = 0x0008_0020;
    pub const STUDY_TIME: Tag = 0x0008_0030;
    pub const PATIENT_NAME: Tag = 0x0010_0010;
    pub const PATIENT_ID: Tag = 0x0010_0020;
    pub const BODY_PART_EXAMINED: Tag = 0x0018_0015;
    pub const STUDY_INSTANCE_UID: Tag = 0x0020_000D;
    pub const SERIES_INSTANCE_UID: Tag = 0x0020_000E;
    pub const STUDY_RELATED_INSTANCES: Tag = 0x0020_1208;
    pub const SCHEDULED_STATION_AE: Tag = 0x0040_0001;
}

/// A flat string-valued view of a dataset, sufficient for routing
/// conditions, query identifiers, and sync comparisons. Pixel data and
/// nested sequences never cross this boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    elements: BTreeMap<Tag, String>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: Tag) -> Option<&str> {
        self.elements.get(&tag).map(|s| s.as_str())
    }

    pub fn set(&mut self, tag: Tag, value: impl Into<String>) -> &mut Self {
        self.elements.insert(tag, value.into());
        self
    }

    pub fn with(mut self, tag: Tag, value: impl Into<String>) -> Self {
        self.elements.insert(tag, value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &str)> {
        self.elements.iter().map(|(t, v)| (*t, v.as_str()))
    }

    pub fn study_uid(&self) -> Option<&str> {
        self.get(tags::STUDY_INSTANCE_UID)
    }

    pub fn series_uid(&self) -> Option<&str> {
        self.get(tags::SERIES_INSTANCE_UID)
    }

    pub fn sop_instance_uid(&self) -> Option<&str> {
        self.get(tags::SOP_INSTANCE_UID)
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.get(tags::PATIENT_ID)
    }

    pub fn modality(&self) -> Option<&str> {
        self.get(tags::MODALITY)
    }

    /// Number of study-related instances, when the source filled it in.
    pub fn instance_count(&self) -> Option<i64> {
        self.get(tags::STUDY_RELATED_INSTANCES)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Study date + time as a UTC timestamp, when both parse.
    /// DICOM DA is `YYYYMMDD`; TM is `HHMMSS` with optional fraction.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let date = self.get(tags::STUDY_DATE)?;
        let date = NaiveDate::parse_from_str(date.trim(), "%Y%m%d").ok()?;
        let time = match self.get(tags::STUDY_TIME) {
            Some(tm) => {
                let tm = tm.trim();
                let whole = tm.split('.').next().unwrap_or(tm);
                NaiveTime::parse_from_str(whole, "%H%M%S").ok()?
            }
            None => NaiveTime::MIN,
        };
        Some(NaiveDateTime::new(date, time).and_utc())
    }
}
