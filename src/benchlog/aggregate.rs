use std::collections::BTreeMap;
use std::path::Path;

use super::scanner::scan_file;
use super::LogEntry;
use crate::error::LogError;
use crate::extract::ExtractionResult;
use crate::utils::natural_cmp;

/// Latest entry per `(producer, subject_id)`, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultAggregator {
    latest: BTreeMap<(String, String), LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducerStats {
    pub producer: String,
    pub count: usize,
    pub errors: usize,
    pub mean_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub total_time: f64,
    pub mean_confidence: f64,
    pub street_number_rate: f64,
    pub street_name_rate: f64,
    pub unit_number_rate: f64,
    pub any_field_rate: f64,
    /// Street number or street name present; unit numbers alone do not count.
    pub number_or_name_rate: f64,
}

impl ProducerStats {
    fn from_results(producer: &str, results: &[ExtractionResult]) -> Self {
        let count = results.len();
        if count == 0 {
            return ProducerStats {
                producer: producer.to_string(),
                ..Default::default()
            };
        }

        let times: Vec<f64> = results.iter().map(ExtractionResult::processing_time).collect();
        let total_time: f64 = times.iter().sum();
        let confidence: f64 = results.iter().map(ExtractionResult::confidence).sum();
        let detected = |f: fn(&ExtractionResult) -> bool| percent(results.iter().filter(|r| f(r)).count(), count);

        ProducerStats {
            producer: producer.to_string(),
            count,
            errors: results.iter().filter(|r| r.is_failure()).count(),
            mean_time: total_time / count as f64,
            min_time: times.iter().copied().fold(f64::INFINITY, f64::min),
            max_time: times.iter().copied().fold(0.0, f64::max),
            total_time,
            mean_confidence: confidence / count as f64,
            street_number_rate: detected(|r| r.street_number().is_some()),
            street_name_rate: detected(|r| r.street_name().is_some()),
            unit_number_rate: detected(|r| r.unit_number().is_some()),
            any_field_rate: detected(ExtractionResult::has_any_field),
            number_or_name_rate: detected(|r| r.street_number().is_some() || r.street_name().is_some()),
        }
    }
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (count as f64 / total as f64) * 100.0
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_log(path: &Path) -> Result<Self, LogError> {
        let outcome = scan_file(path)?;
        let mut aggregator = Self::new();
        aggregator.ingest(outcome.entries);
        Ok(aggregator)
    }

    /// Later entries replace earlier ones with the same key.
    pub fn insert(&mut self, entry: LogEntry) {
        let key = (entry.producer.clone(), entry.subject_id.clone());
        self.latest.insert(key, entry);
    }

    pub fn ingest(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        for entry in entries {
            self.insert(entry);
        }
    }

    pub fn retain_producers(&mut self, producers: &[String]) {
        self.latest.retain(|(producer, _), _| producers.contains(producer));
    }

    pub fn get(&self, producer: &str, subject_id: &str) -> Option<&LogEntry> {
        self.latest.get(&(producer.to_string(), subject_id.to_string()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.latest.values()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn producers(&self) -> Vec<String> {
        let mut producers: Vec<String> = self.latest.keys().map(|(p, _)| p.clone()).collect();
        producers.dedup();
        producers
    }

    /// Distinct subjects in natural order (`pod_2` before `pod_10`).
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.latest.keys().map(|(_, s)| s.clone()).collect();
        subjects.sort_by(|a, b| natural_cmp(a, b));
        subjects.dedup();
        subjects
    }

    pub fn by_producer(&self, producer: &str) -> Vec<ExtractionResult> {
        let mut results: Vec<ExtractionResult> = self
            .latest
            .iter()
            .filter(|((p, _), _)| p == producer)
            .map(|(_, entry)| entry.result())
            .collect();
        results.sort_by(|a, b| natural_cmp(a.subject_id(), b.subject_id()));
        results
    }

    /// Every producer's result for one subject, keyed by producer.
    pub fn by_subject(&self, subject_id: &str) -> BTreeMap<String, ExtractionResult> {
        self.latest
            .iter()
            .filter(|((_, s), _)| s == subject_id)
            .map(|((p, _), entry)| (p.clone(), entry.result()))
            .collect()
    }

    pub fn producer_stats(&self) -> Vec<ProducerStats> {
        self.producers()
            .iter()
            .map(|p| ProducerStats::from_results(p, &self.by_producer(p)))
            .collect()
    }

    pub fn fastest_producer(&self) -> Option<ProducerStats> {
        self.producer_stats()
            .into_iter()
            .min_by(|a, b| a.mean_time.total_cmp(&b.mean_time))
    }

    pub fn most_confident_producer(&self) -> Option<ProducerStats> {
        self.producer_stats()
            .into_iter()
            .max_by(|a, b| a.mean_confidence.total_cmp(&b.mean_confidence))
    }

    /// Highest share of subjects with a street number or street name.
    pub fn best_detection_producer(&self) -> Option<ProducerStats> {
        self.producer_stats()
            .into_iter()
            .max_by(|a, b| a.number_or_name_rate.total_cmp(&b.number_or_name_rate))
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchlog::scanner::scan_str;

    const LOG: &str = "[A] pod_10.jpg: {\"street_number\": \"1\", \"confidence\": 0.8, \"processing_time\": 2.0}\n\
                       [A] pod_2.jpg: {\"error\": \"timeout\", \"processing_time\": 4.0}\n\
                       [B] pod_2.jpg: {\"street_name\": \"Elm St\", \"confidence\": 0.5, \"processing_time\": 1.0}\n\
                       [A] pod_2.jpg: {\"street_number\": \"7\", \"unit_number\": \"#3\", \"confidence\": 0.6, \"processing_time\": 1.0}\n\
                       [B] pod_10.jpg: {\"confidence\": 0.1, \"processing_time\": 0.5}\n";

    fn aggregator() -> ResultAggregator {
        let mut agg = ResultAggregator::new();
        agg.ingest(scan_str(LOG).entries);
        agg
    }

    #[test]
    fn last_occurrence_wins() {
        let agg = aggregator();
        assert_eq!(agg.len(), 4);
        let entry = agg.get("A", "pod_2.jpg").unwrap();
        assert!(!entry.is_failure());
        assert_eq!(entry.result().street_number(), Some("7"));
    }

    #[test]
    fn replay_is_idempotent() {
        let entries = scan_str(LOG).entries;
        let mut twice = ResultAggregator::new();
        twice.ingest(entries.clone());
        twice.ingest(entries);
        assert_eq!(twice, aggregator());
    }

    #[test]
    fn subjects_in_natural_order() {
        assert_eq!(aggregator().subjects(), vec!["pod_2.jpg", "pod_10.jpg"]);
        let ids: Vec<String> = aggregator()
            .by_producer("A")
            .iter()
            .map(|r| r.subject_id().to_string())
            .collect();
        assert_eq!(ids, vec!["pod_2.jpg", "pod_10.jpg"]);
    }

    #[test]
    fn stats_arithmetic() {
        let stats = aggregator().producer_stats();
        assert_eq!(stats.len(), 2);
        let a = &stats[0];
        assert_eq!(a.producer, "A");
        assert_eq!(a.count, 2);
        assert_eq!(a.errors, 0);
        assert_eq!(a.total_time, 3.0);
        assert_eq!(a.mean_time, 1.5);
        assert_eq!(a.min_time, 1.0);
        assert_eq!(a.max_time, 2.0);
        assert!((a.mean_confidence - 0.7).abs() < 1e-9);
        assert_eq!(a.street_number_rate, 100.0);
        assert_eq!(a.unit_number_rate, 50.0);
        assert_eq!(a.street_name_rate, 0.0);
    }

    #[test]
    fn leaderboard_queries() {
        let agg = aggregator();
        assert_eq!(agg.fastest_producer().unwrap().producer, "B");
        assert_eq!(agg.most_confident_producer().unwrap().producer, "A");
        assert_eq!(agg.best_detection_producer().unwrap().producer, "A");
        assert!(ResultAggregator::new().fastest_producer().is_none());
    }

    #[test]
    fn unit_only_results_do_not_count_as_detections() {
        let log = "[A] p1.jpg: {\"unit_number\": \"#3\"}\n\
                   [A] p2.jpg: {\"unit_number\": \"#4\"}\n\
                   [B] p1.jpg: {\"street_number\": \"9\"}\n\
                   [B] p2.jpg: {}\n";
        let mut agg = ResultAggregator::new();
        agg.ingest(scan_str(log).entries);
        let stats = agg.producer_stats();
        assert_eq!(stats[0].any_field_rate, 100.0);
        assert_eq!(stats[0].number_or_name_rate, 0.0);
        assert_eq!(stats[1].number_or_name_rate, 50.0);
        assert_eq!(agg.best_detection_producer().unwrap().producer, "B");
    }

    #[test]
    fn by_subject_groups_producers() {
        let row = aggregator().by_subject("pod_2.jpg");
        assert_eq!(row.len(), 2);
        assert!(row["A"].unit_number().is_some());
        assert_eq!(row["B"].street_name(), Some("Elm St"));
    }

    #[test]
    fn retain_filters_producers() {
        let mut agg = aggregator();
        agg.retain_producers(&["B".to_string()]);
        assert_eq!(agg.producers(), vec!["B"]);
    }
}
