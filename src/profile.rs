use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Broker topic prefix a profile name is appended to (lowercased).
pub const PROFILE_TOPIC_PREFIX: &str = "heatzone/profiles/";

/// Sub-topics subscribed for every tracked profile.
pub const PROFILE_FIELDS: [&str; 14] = [
    "Temp1",
    "Temp2",
    "Temp3",
    "Temp4",
    "TempAway",
    "TempHoliday",
    "Day1",
    "Day2",
    "Day3",
    "Day4",
    "Day5",
    "Day6",
    "Day7",
    "Activated",
];

/// Fields that must have arrived before a profile is usable.
/// `Activated` is tracked but not required.
pub const REQUIRED_FIELDS: [&str; 13] = [
    "Temp1",
    "Temp2",
    "Temp3",
    "Temp4",
    "TempAway",
    "TempHoliday",
    "Day1",
    "Day2",
    "Day3",
    "Day4",
    "Day5",
    "Day6",
    "Day7",
];

/// One weekly schedule, assembled field by field from broker messages.
///
/// Field values stay raw strings until resolution parses them; a field may
/// be overwritten at any time and the last write wins.
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    topic: String,
    fields: HashMap<String, String>,
    last_update: Option<Instant>,
    last_access: Instant,
}

impl ProfileRecord {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            fields: HashMap::new(),
            last_update: None,
            last_access: Instant::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_complete(&self) -> bool {
        REQUIRED_FIELDS.iter().all(|f| self.fields.contains_key(*f))
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    fn set_field(&mut self, name: &str, value: &str) {
        self.fields.insert(name.to_string(), value.to_string());
        self.last_update = Some(Instant::now());
        self.last_access = Instant::now();
    }
}

/// All currently tracked schedule profiles, keyed by topic.
#[derive(Debug, Default)]
pub struct ScheduleStore {
    records: HashMap<String, ProfileRecord>,
}

impl ScheduleStore {
    /// Overwrites one field, creating the record if it is unknown.
    /// Any string is accepted; validation happens at resolution time.
    pub fn upsert_field(&mut self, topic: &str, field: &str, value: &str) {
        let record = self
            .records
            .entry(topic.to_string())
            .or_insert_with(|| ProfileRecord::new(topic));
        record.set_field(field, value);
        debug!(topic = %topic, field = %field, value = %value, "profile field updated");
    }

    /// Creates an empty record for the topic if it is unknown.
    pub fn ensure(&mut self, topic: &str) {
        self.records
            .entry(topic.to_string())
            .or_insert_with(|| ProfileRecord::new(topic));
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.records.contains_key(topic)
    }

    /// Fetches a record for resolution, refreshing its last-access time so
    /// active profiles are never reaped.
    pub fn lookup(&mut self, topic: &str) -> Option<&ProfileRecord> {
        let record = self.records.get_mut(topic)?;
        record.last_access = Instant::now();
        Some(record)
    }

    pub fn is_expired(&self, topic: &str, timeout: Duration) -> bool {
        match self.records.get(topic) {
            Some(record) => record.last_access.elapsed() > timeout,
            None => true,
        }
    }

    pub fn remove(&mut self, topic: &str) {
        self.records.remove(topic);
    }

    pub fn topics(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_required(store: &mut ScheduleStore, topic: &str) {
        for field in REQUIRED_FIELDS {
            store.upsert_field(topic, field, "x");
        }
    }

    #[tokio::test]
    async fn complete_iff_all_required_fields_present() {
        let mut store = ScheduleStore::default();
        for field in REQUIRED_FIELDS.iter().take(12) {
            store.upsert_field("p", field, "1");
        }
        assert!(!store.lookup("p").unwrap().is_complete());

        store.upsert_field("p", "Day7", "[]");
        assert!(store.lookup("p").unwrap().is_complete());
    }

    #[tokio::test]
    async fn activated_not_required_for_completeness() {
        let mut store = ScheduleStore::default();
        fill_required(&mut store, "p");
        assert!(store.lookup("p").unwrap().is_complete());
        assert!(store.lookup("p").unwrap().field("Activated").is_none());
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let mut store = ScheduleStore::default();
        fill_required(&mut store, "p");
        store.upsert_field("p", "Temp1", "21.5");
        store.upsert_field("p", "Temp1", "21.5");
        let record = store.lookup("p").unwrap();
        assert!(record.is_complete());
        assert_eq!(record.field("Temp1"), Some("21.5"));
    }

    #[tokio::test]
    async fn last_write_wins_per_field() {
        let mut store = ScheduleStore::default();
        store.upsert_field("p", "Temp1", "20.0");
        store.upsert_field("p", "Temp1", "22.0");
        assert_eq!(store.lookup("p").unwrap().field("Temp1"), Some("22.0"));
    }

    #[tokio::test]
    async fn unknown_topic_is_created_implicitly() {
        let mut store = ScheduleStore::default();
        store.upsert_field("fresh", "Temp1", "20.0");
        assert!(store.contains("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_without_access() {
        let mut store = ScheduleStore::default();
        store.ensure("p");
        assert!(!store.is_expired("p", Duration::from_secs(600)));

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(store.is_expired("p", Duration::from_secs(600)));

        store.lookup("p");
        assert!(!store.is_expired("p", Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn missing_topic_counts_as_expired() {
        let store = ScheduleStore::default();
        assert!(store.is_expired("nope", Duration::from_secs(600)));
    }
}
