//! The seam to the local archive. The fabric never touches storage
//! directly; it asks this trait for study summaries (sync diff, prefetch
//! dedup) and for the composite objects a store/forward job pushes out.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use dimse::Dataset;
use models::{Fault, StudyFilter, StudySummary};

#[async_trait]
pub trait LocalArchive: Send + Sync {
    /// Studies matching the filter, as the local side of a comparison.
    async fn query_studies(&self, filter: &StudyFilter) -> Result<Vec<StudySummary>, Fault>;

    async fn has_study(&self, study_uid: &str) -> Result<bool, Fault>;

    /// Instances of a study (optionally narrowed to a series or explicit
    /// SOP instance list) for outbound store.
    async fn fetch_instances(
        &self,
        study_uid: &str,
        series_uid: Option<&str>,
        sop_instance_uids: &[String],
    ) -> Result<Vec<Dataset>, Fault>;
}

/// In-memory archive, used by tests and small deployments.
#[derive(Default)]
pub struct MemoryArchive {
    studies: RwLock<HashMap<String, (StudySummary, Vec<Dataset>)>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_study(&self, summary: StudySummary, instances: Vec<Dataset>) {
        self.studies
            .write()
            .unwrap()
            .insert(summary.study_uid.clone(), (summary, instances));
    }

    pub fn remove_study(&self, study_uid: &str) {
        self.studies.write().unwrap().remove(study_uid);
    }
}

fn matches(filter: &StudyFilter, summary: &StudySummary) -> bool {
    if !filter.modalities.is_empty() && !filter.modalities.contains(&summary.modality) {
        return false;
    }
    if let Some(patient_id) = &filter.patient_id {
        if &summary.patient_id != patient_id {
            return false;
        }
    }
    if let Some(window) = filter.modified_within {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::max_value());
        let cutoff = chrono::Utc::now() - window;
        match summary.last_modified {
            Some(ts) if ts >= cutoff => {}
            _ => return false,
        }
    }
    true
}

#[async_trait]
impl LocalArchive for MemoryArchive {
    async fn query_studies(&self, filter: &StudyFilter) -> Result<Vec<StudySummary>, Fault> {
        let studies = self.studies.read().unwrap();
        Ok(studies
            .values()
            .filter(|(summary, _)| matches(filter, summary))
            .map(|(summary, _)| summary.clone())
            .collect())
    }

    async fn has_study(&self, study_uid: &str) -> Result<bool, Fault> {
        Ok(self.studies.read().unwrap().contains_key(study_uid))
    }

    async fn fetch_instances(
        &self,
        study_uid: &str,
        series_uid: Option<&str>,
        sop_instance_uids: &[String],
    ) -> Result<Vec<Dataset>, Fault> {
        let studies = self.studies.read().unwrap();
        let (_, instances) = studies
            .get(study_uid)
            .ok_or_else(|| Fault::data(format!("study {study_uid} not in local archive")))?;

        let selected: Vec<Dataset> = instances
            .iter()
            .filter(|ds| {
                if let Some(series) = series_uid {
                    if ds.series_uid() != Some(series) {
                        return false;
                    }
                }
                if !sop_instance_uids.is_empty() {
                    return ds
                        .sop_instance_uid()
                        .is_some_and(|uid| sop_instance_uids.iter().any(|s| s == uid));
                }
                true
            })
            .cloned()
            .collect();
        Ok(selected)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dimse::tags;

    fn summary(study_uid: &str, patient: &str, modality: &str) -> StudySummary {
        StudySummary {
            study_uid: study_uid.to_string(),
            patient_id: patient.to_string(),
            modality: modality.to_string(),
            instance_count: 1,
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn filters_apply_to_queries() {
        let archive = MemoryArchive::new();
        archive.put_study(summary("1.1", "P-1", "CT"), vec![]);
        archive.put_study(summary("1.2", "P-2", "MR"), vec![]);

        let all = archive.query_studies(&StudyFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let ct_only = archive
            .query_studies(&StudyFilter {
                modalities: vec!["CT".to_string()],
                ..StudyFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(ct_only.len(), 1);
        assert_eq!(ct_only[0].study_uid, "1.1");

        assert!(archive.has_study("1.2").await.unwrap());
        assert!(!archive.has_study("9.9").await.unwrap());
    }

    #[tokio::test]
    async fn instance_selection_by_series_and_sop() {
        let archive = MemoryArchive::new();
        let instances = vec![
            Dataset::new()
                .with(tags::SERIES_INSTANCE_UID, "s1")
                .with(tags::SOP_INSTANCE_UID, "i1"),
            Dataset::new()
                .with(tags::SERIES_INSTANCE_UID, "s2")
                .with(tags::SOP_INSTANCE_UID, "i2"),
        ];
        archive.put_study(summary("1.1", "P-1", "CT"), instances);

        let all = archive.fetch_instances("1.1", None, &[]).await.unwrap();
        assert_eq!(all.len(), 2);

        let series = archive
            .fetch_instances("1.1", Some("s2"), &[])
            .await
            .unwrap();
        assert_eq!(series.len(), 1);

        let by_sop = archive
            .fetch_instances("1.1", None, &["i1".to_string()])
            .await
            .unwrap();
        assert_eq!(by_sop[0].sop_instance_uid(), Some("i1"));

        assert!(archive.fetch_instances("9.9", None, &[]).await.is_err());
    }
}
