use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::clock::secs_f64;
use crate::event::Event;

/// Aggregations computable on demand over the events in a window.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    AvgProcessingTime,
    EventRate,
    UniqueEvents,
    PriorityDistribution,
    ErrorRate,
}

impl Aggregation {
    fn key(self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::AvgProcessingTime => "avg_processing_time",
            Aggregation::EventRate => "event_rate",
            Aggregation::UniqueEvents => "unique_events",
            Aggregation::PriorityDistribution => "priority_distribution",
            Aggregation::ErrorRate => "error_rate",
        }
    }
}

struct TimeWindow {
    id: String,
    duration_secs: f64,
    slide_secs: f64,
    filters: HashSet<String>,
    aggregations: Vec<Aggregation>,
    max_events: usize,
    events: VecDeque<Event>,
    last_slide: DateTime<Utc>,
}

impl TimeWindow {
    fn accepts(&self, event: &Event) -> bool {
        self.filters.is_empty() || self.filters.contains(&event.name)
    }

    /// Ingest path: slide check first, then insertion, then retention and
    /// the size cap.
    fn ingest(&mut self, event: &Event, now: DateTime<Utc>) {
        if self.slide_secs > 0.0
            && (now - self.last_slide) >= secs_f64(self.slide_secs)
        {
            // A new slice begins: rebase the aggregation window on
            // (now - duration, now].
            self.last_slide = now;
        }

        self.events.push_back(event.clone());

        let horizon = now - secs_f64(self.duration_secs);
        while self
            .events
            .front()
            .is_some_and(|oldest| oldest.timestamp <= horizon)
        {
            self.events.pop_front();
        }
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    fn aggregate(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for aggregation in &self.aggregations {
            let value = match aggregation {
                Aggregation::Count => json!(self.events.len()),
                Aggregation::AvgProcessingTime => {
                    let samples: Vec<f64> = self
                        .events
                        .iter()
                        .filter_map(Event::processing_time)
                        .collect();
                    if samples.is_empty() {
                        json!(0.0)
                    } else {
                        json!(samples.iter().sum::<f64>() / samples.len() as f64)
                    }
                }
                Aggregation::EventRate => {
                    if self.duration_secs > 0.0 {
                        json!(self.events.len() as f64 / self.duration_secs)
                    } else {
                        json!(0.0)
                    }
                }
                Aggregation::UniqueEvents => {
                    let names: HashSet<&str> =
                        self.events.iter().map(|e| e.name.as_str()).collect();
                    json!(names.len())
                }
                Aggregation::PriorityDistribution => {
                    let mut distribution: HashMap<String, u64> = HashMap::new();
                    for event in &self.events {
                        *distribution.entry(event.priority.to_string()).or_default() += 1;
                    }
                    json!(distribution)
                }
                Aggregation::ErrorRate => {
                    if self.events.is_empty() {
                        json!(0.0)
                    } else {
                        let errors = self.events.iter().filter(|e| e.is_error()).count();
                        json!(errors as f64 / self.events.len() as f64)
                    }
                }
            };
            out.insert(aggregation.key().to_string(), value);
        }
        out
    }
}

impl fmt::Debug for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWindow")
            .field("id", &self.id)
            .field("duration_secs", &self.duration_secs)
            .field("slide_secs", &self.slide_secs)
            .field("events", &self.events.len())
            .field("max_events", &self.max_events)
            .finish()
    }
}

/// Named tumbling/sliding windows with per-window aggregations.
pub struct TimeWindowEngine {
    inner: Mutex<HashMap<String, TimeWindow>>,
    default_max_events: usize,
}

impl fmt::Debug for TimeWindowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimeWindowEngine")
    }
}

impl TimeWindowEngine {
    pub fn new(default_max_events: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            default_max_events: default_max_events.max(1),
        }
    }

    /// Creates a window. `slide_secs == 0` makes it tumbling. Returns false
    /// when the id is already taken.
    pub async fn create(
        &self,
        id: impl Into<String>,
        duration_secs: f64,
        slide_secs: f64,
        filters: HashSet<String>,
        aggregations: Vec<Aggregation>,
        now: DateTime<Utc>,
    ) -> bool {
        let id = id.into();
        let mut windows = self.inner.lock().await;
        if windows.contains_key(&id) {
            return false;
        }
        let aggregations = if aggregations.is_empty() {
            vec![Aggregation::Count]
        } else {
            aggregations
        };
        windows.insert(
            id.clone(),
            TimeWindow {
                id,
                duration_secs: duration_secs.max(0.0),
                slide_secs: slide_secs.max(0.0),
                filters,
                aggregations,
                max_events: self.default_max_events,
                events: VecDeque::new(),
                last_slide: now,
            },
        );
        true
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.lock().await.remove(id).is_some()
    }

    /// Routes one event into every window whose filter set matches.
    pub async fn ingest(&self, event: &Event, now: DateTime<Utc>) {
        let mut windows = self.inner.lock().await;
        for window in windows.values_mut() {
            if window.accepts(event) {
                window.ingest(event, now);
            }
        }
    }

    pub async fn aggregation(&self, id: &str) -> Option<HashMap<String, Value>> {
        let windows = self.inner.lock().await;
        windows.get(id).map(TimeWindow::aggregate)
    }

    pub async fn events(&self, id: &str) -> Option<Vec<Event>> {
        let windows = self.inner.lock().await;
        windows.get(id).map(|w| w.events.iter().cloned().collect())
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Value {
        let windows = self.inner.lock().await;
        let entries: Vec<Value> = windows
            .values()
            .map(|w| {
                json!({
                    "id": w.id,
                    "duration_secs": w.duration_secs,
                    "slide_secs": w.slide_secs,
                    "events": w.events.len(),
                    "filters": w.filters.iter().cloned().collect::<Vec<_>>(),
                })
            })
            .collect();
        json!(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPriority;
    use crate::payload;

    fn ts(secs: f64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros((secs * 1_000_000.0) as i64).unwrap()
    }

    fn hit(at: f64) -> Event {
        Event::new("hit", payload!(), EventPriority::Normal, ts(at))
    }

    async fn engine_with_window(duration: f64, slide: f64) -> TimeWindowEngine {
        let engine = TimeWindowEngine::new(1_000);
        let filters: HashSet<String> = ["hit".to_string()].into_iter().collect();
        assert!(
            engine
                .create(
                    "w",
                    duration,
                    slide,
                    filters,
                    vec![Aggregation::Count, Aggregation::EventRate],
                    ts(0.0),
                )
                .await
        );
        engine
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let engine = engine_with_window(5.0, 0.0).await;
        assert!(
            !engine
                .create("w", 1.0, 0.0, HashSet::new(), vec![], ts(0.0))
                .await
        );
    }

    #[tokio::test]
    async fn retention_drops_events_older_than_duration() {
        let engine = engine_with_window(5.0, 0.0).await;
        engine.ingest(&hit(0.0), ts(0.0)).await;
        engine.ingest(&hit(3.0), ts(3.0)).await;
        // Ingest at t=6: the t=0 event has aged out of (1, 6].
        engine.ingest(&hit(6.0), ts(6.0)).await;

        let events = engine.events("w").await.unwrap();
        let stamps: Vec<f64> = events
            .iter()
            .map(|e| e.timestamp.timestamp_micros() as f64 / 1_000_000.0)
            .collect();
        assert_eq!(stamps, vec![3.0, 6.0]);
    }

    #[tokio::test]
    async fn sliding_count_over_ten_spaced_hits() {
        // Ten "hit" events spaced 0.5 s apart; at t0+5.1 the window still
        // holds all ten, so count = 10 and event_rate = 2.0.
        let engine = engine_with_window(5.0, 1.0).await;
        for i in 0..10 {
            let at = i as f64 * 0.5;
            engine.ingest(&hit(at), ts(at)).await;
        }

        let aggregation = engine.aggregation("w").await.unwrap();
        assert_eq!(aggregation["count"], json!(10));
        assert_eq!(aggregation["event_rate"], json!(2.0));
    }

    #[tokio::test]
    async fn filters_route_only_matching_events() {
        let engine = engine_with_window(5.0, 0.0).await;
        engine
            .ingest(
                &Event::new("miss", payload!(), EventPriority::Normal, ts(1.0)),
                ts(1.0),
            )
            .await;
        engine.ingest(&hit(1.0), ts(1.0)).await;

        let aggregation = engine.aggregation("w").await.unwrap();
        assert_eq!(aggregation["count"], json!(1));
    }

    #[tokio::test]
    async fn empty_filter_set_accepts_everything() {
        let engine = TimeWindowEngine::new(1_000);
        engine
            .create(
                "all",
                10.0,
                0.0,
                HashSet::new(),
                vec![Aggregation::UniqueEvents, Aggregation::PriorityDistribution],
                ts(0.0),
            )
            .await;
        engine
            .ingest(
                &Event::new("a", payload!(), EventPriority::Low, ts(1.0)),
                ts(1.0),
            )
            .await;
        engine
            .ingest(
                &Event::new("b", payload!(), EventPriority::Low, ts(1.5)),
                ts(1.5),
            )
            .await;
        engine
            .ingest(
                &Event::new("b", payload!(), EventPriority::High, ts(2.0)),
                ts(2.0),
            )
            .await;

        let aggregation = engine.aggregation("all").await.unwrap();
        assert_eq!(aggregation["unique_events"], json!(2));
        assert_eq!(aggregation["priority_distribution"]["low"], json!(2));
        assert_eq!(aggregation["priority_distribution"]["high"], json!(1));
    }

    #[tokio::test]
    async fn max_events_caps_the_window() {
        let engine = TimeWindowEngine::new(3);
        engine
            .create("w", 100.0, 0.0, HashSet::new(), vec![Aggregation::Count], ts(0.0))
            .await;
        for i in 0..5 {
            let at = i as f64;
            engine
                .ingest(
                    &Event::new("e", payload!(), EventPriority::Normal, ts(at)),
                    ts(at),
                )
                .await;
        }
        let aggregation = engine.aggregation("w").await.unwrap();
        assert_eq!(aggregation["count"], json!(3));
    }

    #[tokio::test]
    async fn error_rate_and_processing_time() {
        let engine = TimeWindowEngine::new(100);
        engine
            .create(
                "w",
                100.0,
                0.0,
                HashSet::new(),
                vec![Aggregation::ErrorRate, Aggregation::AvgProcessingTime],
                ts(0.0),
            )
            .await;
        engine
            .ingest(
                &Event::new(
                    "job",
                    payload! { "processing_time" => 4.0 },
                    EventPriority::Normal,
                    ts(1.0),
                ),
                ts(1.0),
            )
            .await;
        engine
            .ingest(
                &Event::new(
                    "job",
                    payload! { "failed" => true, "processing_time" => 2.0 },
                    EventPriority::Normal,
                    ts(2.0),
                ),
                ts(2.0),
            )
            .await;

        let aggregation = engine.aggregation("w").await.unwrap();
        assert_eq!(aggregation["error_rate"], json!(0.5));
        assert_eq!(aggregation["avg_processing_time"], json!(3.0));
    }
}
