use crate::error::{PipelineError, Result};
use crate::models::{FeedMode, Subject, SubjectId};

#[derive(Debug, Clone, Default)]
pub struct Roster {
    subjects: Vec<Subject>,
}

impl Roster {
    pub fn new(subjects: Vec<Subject>) -> Self {
        Self { subjects }
    }

    /// The demonstration roster: one wearable on the live feed, three simulated.
    pub fn seed() -> Self {
        let subjects = vec![
            (1, "Sharan Karthick", 65, "wearable_001", "Stable", 75.0, 97.0, FeedMode::LiveFeed),
            (2, "Maithreyan", 42, "105B", "Critical", 85.0, 94.0, FeedMode::Synthetic),
            (3, "Ananya", 58, "310C", "Stable", 70.0, 98.0, FeedMode::Synthetic),
            (4, "Zaahid Umar", 73, "117D", "Under Observation", 78.0, 95.0, FeedMode::Synthetic),
        ];

        Self::new(
            subjects
                .into_iter()
                .map(
                    |(id, name, age, device_id, status, heart_rate, spo2, mode)| Subject {
                        id,
                        name: name.to_string(),
                        age,
                        device_id: device_id.to_string(),
                        status: status.to_string(),
                        heart_rate_baseline: heart_rate,
                        spo2_baseline: spo2,
                        mode,
                    },
                )
                .collect(),
        )
    }

    pub fn find(&self, id: SubjectId) -> Option<&Subject> {
        self.subjects.iter().find(|subject| subject.id == id)
    }

    pub fn find_by_device(&self, device_id: &str) -> Option<&Subject> {
        self.subjects
            .iter()
            .find(|subject| subject.device_id == device_id)
    }

    pub fn require(&self, id: SubjectId) -> Result<&Subject> {
        self.find(id).ok_or(PipelineError::SubjectNotFound(id))
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_has_one_live_subject() {
        let roster = Roster::seed();
        assert_eq!(roster.subjects().len(), 4);
        let live: Vec<_> = roster
            .subjects()
            .iter()
            .filter(|subject| subject.mode == FeedMode::LiveFeed)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].device_id, "wearable_001");
    }

    #[test]
    fn lookups_miss_without_panicking() {
        let roster = Roster::seed();
        assert_eq!(roster.find_by_device("310C").map(|s| s.id), Some(3));
        assert!(roster.find(99).is_none());
        assert!(matches!(
            roster.require(99),
            Err(PipelineError::SubjectNotFound(99))
        ));
    }
}
