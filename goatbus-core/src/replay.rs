use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::secs_f64;
use crate::event::Event;
use crate::subscription::SubscriptionId;

/// Unique identifier for replay sessions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReplaySessionId(pub Uuid);

impl Default for ReplaySessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplaySessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ReplaySessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time view of one session's progress.
#[derive(Clone, Debug, Serialize)]
pub struct ReplayStatus {
    pub id: ReplaySessionId,
    pub subscription_id: SubscriptionId,
    pub progress: f64,
    pub cursor: usize,
    pub total: usize,
    pub speed: f64,
    pub paused: bool,
    pub completed: bool,
}

struct ReplaySession {
    id: ReplaySessionId,
    subscription_id: SubscriptionId,
    start: DateTime<Utc>,
    matched: Vec<Event>,
    cursor: usize,
    speed: f64,
    paused: bool,
    completed: bool,
    created_at: DateTime<Utc>,
}

impl ReplaySession {
    fn status(&self) -> ReplayStatus {
        let progress = if self.matched.is_empty() {
            1.0
        } else {
            self.cursor as f64 / self.matched.len() as f64
        };
        ReplayStatus {
            id: self.id,
            subscription_id: self.subscription_id,
            progress,
            cursor: self.cursor,
            total: self.matched.len(),
            speed: self.speed,
            paused: self.paused,
            completed: self.completed,
        }
    }

    /// Events whose virtual time has arrived. Virtual elapsed time runs at
    /// `speed ×` wall time from session creation, measured against the
    /// recorded event spacing.
    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        if self.paused || self.completed {
            return Vec::new();
        }
        let elapsed = (now - self.created_at).num_microseconds().unwrap_or(i64::MAX) as f64
            / 1_000_000.0;
        let virtual_horizon = self.start + secs_f64(elapsed * self.speed);

        let mut due = Vec::new();
        while self.cursor < self.matched.len()
            && self.matched[self.cursor].timestamp <= virtual_horizon
        {
            due.push(self.matched[self.cursor].clone());
            self.cursor += 1;
        }
        if self.cursor >= self.matched.len() {
            self.completed = true;
        }
        due
    }
}

impl fmt::Debug for ReplaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplaySession")
            .field("id", &self.id)
            .field("subscription_id", &self.subscription_id)
            .field("cursor", &self.cursor)
            .field("total", &self.matched.len())
            .field("speed", &self.speed)
            .field("paused", &self.paused)
            .field("completed", &self.completed)
            .finish()
    }
}

struct SubscriberRing {
    ring: VecDeque<Event>,
    capacity: usize,
}

struct ReplayState {
    global: VecDeque<Event>,
    global_capacity: usize,
    per_subscriber: HashMap<SubscriptionId, SubscriberRing>,
    sessions: HashMap<ReplaySessionId, ReplaySession>,
}

/// Bounded global ring of published events plus per-subscriber rings, with
/// time-range queries and controlled replay sessions.
pub struct ReplayStore {
    inner: Mutex<ReplayState>,
}

impl fmt::Debug for ReplayStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplayStore")
    }
}

impl ReplayStore {
    pub fn new(global_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ReplayState {
                global: VecDeque::new(),
                global_capacity: global_capacity.max(1),
                per_subscriber: HashMap::new(),
                sessions: HashMap::new(),
            }),
        }
    }

    /// Appends to the global ring and every subscriber ring. Oldest events
    /// fall off full rings.
    pub async fn record(&self, event: &Event) {
        let mut state = self.inner.lock().await;
        if state.global.len() >= state.global_capacity {
            state.global.pop_front();
        }
        state.global.push_back(event.clone());

        for ring in state.per_subscriber.values_mut() {
            if ring.ring.len() >= ring.capacity {
                ring.ring.pop_front();
            }
            ring.ring.push_back(event.clone());
        }
    }

    pub async fn create_ring(&self, id: SubscriptionId, capacity: usize) {
        let mut state = self.inner.lock().await;
        state.per_subscriber.entry(id).or_insert(SubscriberRing {
            ring: VecDeque::new(),
            capacity: capacity.max(1),
        });
    }

    pub async fn drop_ring(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.lock().await;
        state.per_subscriber.remove(&id).is_some()
    }

    pub async fn subscriber_events(&self, id: SubscriptionId) -> Option<Vec<Event>> {
        let state = self.inner.lock().await;
        state
            .per_subscriber
            .get(&id)
            .map(|ring| ring.ring.iter().cloned().collect())
    }

    /// Global-ring events with `timestamp ∈ [start, end]` whose name passes
    /// the filter set (empty set ⇒ no restriction).
    pub async fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filters: &HashSet<String>,
    ) -> Vec<Event> {
        let state = self.inner.lock().await;
        state
            .global
            .iter()
            .filter(|event| event.timestamp >= start && event.timestamp <= end)
            .filter(|event| filters.is_empty() || filters.contains(&event.name))
            .cloned()
            .collect()
    }

    pub async fn global_len(&self) -> usize {
        self.inner.lock().await.global.len()
    }

    /// Opens a replay session over the matching global-ring slice.
    /// Sessions over an empty slice complete immediately.
    pub async fn start_session(
        &self,
        subscription_id: SubscriptionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filters: &HashSet<String>,
        speed: f64,
        now: DateTime<Utc>,
    ) -> ReplaySessionId {
        let matched = self.range(start, end, filters).await;
        let id = ReplaySessionId::new();
        let completed = matched.is_empty();
        let mut state = self.inner.lock().await;
        state.sessions.insert(
            id,
            ReplaySession {
                id,
                subscription_id,
                start,
                matched,
                cursor: 0,
                speed: if speed > 0.0 { speed } else { 1.0 },
                paused: false,
                completed,
                created_at: now,
            },
        );
        id
    }

    pub async fn pause(&self, id: ReplaySessionId) -> bool {
        let mut state = self.inner.lock().await;
        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.paused = true;
                true
            }
            None => false,
        }
    }

    pub async fn resume(&self, id: ReplaySessionId) -> bool {
        let mut state = self.inner.lock().await;
        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.paused = false;
                true
            }
            None => false,
        }
    }

    pub async fn stop(&self, id: ReplaySessionId) -> bool {
        let mut state = self.inner.lock().await;
        state.sessions.remove(&id).is_some()
    }

    pub async fn status(&self, id: ReplaySessionId) -> Option<ReplayStatus> {
        let state = self.inner.lock().await;
        state.sessions.get(&id).map(ReplaySession::status)
    }

    /// Advances every live session and returns the events due for delivery,
    /// tagged with their target subscription.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<(SubscriptionId, Event)> {
        let mut state = self.inner.lock().await;
        let mut due = Vec::new();
        for session in state.sessions.values_mut() {
            let target = session.subscription_id;
            for event in session.take_due(now) {
                due.push((target, event));
            }
        }
        due
    }

    /// Removes completed sessions and sessions older than `max_age_secs`.
    pub async fn reap_sessions(&self, now: DateTime<Utc>, max_age_secs: f64) -> usize {
        let mut state = self.inner.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, session| {
            !session.completed && (now - session.created_at) < secs_f64(max_age_secs)
        });
        before - state.sessions.len()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        let state = self.inner.lock().await;
        let sessions: Vec<serde_json::Value> = state
            .sessions
            .values()
            .map(|session| {
                let status = session.status();
                json!({
                    "id": status.id.to_string(),
                    "subscription_id": status.subscription_id.to_string(),
                    "progress": status.progress,
                    "paused": status.paused,
                    "completed": status.completed,
                })
            })
            .collect();
        json!({
            "global_events": state.global.len(),
            "subscriber_rings": state.per_subscriber.len(),
            "sessions": sessions,
        })
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

    fn event(name: &str, at: f64) -> Event {
        Event::new(name, payload!(), EventPriority::Normal, ts(at))
    }

    async fn seeded_store() -> ReplayStore {
        let store = ReplayStore::new(100);
        for at in 0..6 {
            store.record(&event("E", at as f64)).await;
        }
        store
    }

    #[tokio::test]
    async fn range_query_is_inclusive_and_filtered() {
        let store = seeded_store().await;
        store.record(&event("other", 2.5)).await;

        let filters: HashSet<String> = ["E".to_string()].into_iter().collect();
        let hits = store.range(ts(1.5), ts(4.0), &filters).await;
        let stamps: Vec<f64> = hits
            .iter()
            .map(|e| e.timestamp.timestamp_micros() as f64 / 1_000_000.0)
            .collect();
        assert_eq!(stamps, vec![2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn empty_filter_set_matches_all_names() {
        let store = seeded_store().await;
        store.record(&event("other", 2.5)).await;
        let hits = store.range(ts(2.0), ts(3.0), &HashSet::new()).await;
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn global_ring_is_bounded() {
        let store = ReplayStore::new(3);
        for at in 0..5 {
            store.record(&event("E", at as f64)).await;
        }
        assert_eq!(store.global_len().await, 3);
        let survivors = store.range(ts(0.0), ts(10.0), &HashSet::new()).await;
        assert_eq!(
            survivors[0].timestamp.timestamp_micros() as f64 / 1_000_000.0,
            2.0
        );
    }

    #[tokio::test]
    async fn subscriber_rings_mirror_publishes() {
        let store = ReplayStore::new(100);
        let id = SubscriptionId::new();
        store.create_ring(id, 2).await;
        for at in 0..3 {
            store.record(&event("E", at as f64)).await;
        }
        let events = store.subscriber_events(id).await.unwrap();
        assert_eq!(events.len(), 2);
        // Oldest dropped.
        assert_eq!(events[0].timestamp, ts(1.0));
    }

    #[tokio::test]
    async fn session_progress_and_pacing() {
        let store = seeded_store().await;
        let target = SubscriptionId::new();
        // Session created at wall time t=100 over [0, 5] at double speed.
        let session = store
            .start_session(target, ts(0.0), ts(5.0), &HashSet::new(), 2.0, ts(100.0))
            .await;

        let status = store.status(session).await.unwrap();
        assert_eq!(status.total, 6);
        assert_eq!(status.progress, 0.0);

        // After 1 s of wall time, 2 s of virtual time has passed: events at
        // 0, 1, 2 are due.
        let due = store.take_due(ts(101.0)).await;
        assert_eq!(due.len(), 3);
        assert!(due.iter().all(|(id, _)| *id == target));

        // After 3 s of wall time the rest is due and the session completes.
        let due = store.take_due(ts(103.0)).await;
        assert_eq!(due.len(), 3);
        let status = store.status(session).await.unwrap();
        assert!(status.completed);
        assert_eq!(status.progress, 1.0);
    }

    #[tokio::test]
    async fn paused_sessions_deliver_nothing() {
        let store = seeded_store().await;
        let session = store
            .start_session(
                SubscriptionId::new(),
                ts(0.0),
                ts(5.0),
                &HashSet::new(),
                1.0,
                ts(100.0),
            )
            .await;
        assert!(store.pause(session).await);
        assert!(store.take_due(ts(200.0)).await.is_empty());
        assert!(store.resume(session).await);
        assert_eq!(store.take_due(ts(200.0)).await.len(), 6);
    }

    #[tokio::test]
    async fn empty_sessions_complete_immediately() {
        let store = ReplayStore::new(10);
        let session = store
            .start_session(
                SubscriptionId::new(),
                ts(0.0),
                ts(5.0),
                &HashSet::new(),
                1.0,
                ts(100.0),
            )
            .await;
        let status = store.status(session).await.unwrap();
        assert!(status.completed);
        assert_eq!(status.progress, 1.0);
    }

    #[tokio::test]
    async fn reaping_removes_completed_and_stale_sessions() {
        let store = seeded_store().await;
        let completed = store
            .start_session(
                SubscriptionId::new(),
                ts(50.0),
                ts(60.0),
                &HashSet::new(),
                1.0,
                ts(100.0),
            )
            .await;
        let stale = store
            .start_session(
                SubscriptionId::new(),
                ts(0.0),
                ts(5.0),
                &HashSet::new(),
                0.000_001,
                ts(100.0),
            )
            .await;

        assert_eq!(store.session_count().await, 2);
        // At t=100+3601 the slow session exceeds the age cap; the empty one
        // completed at creation.
        let reaped = store.reap_sessions(ts(3_701.0), 3_600.0).await;
        assert_eq!(reaped, 2);
        assert!(store.status(completed).await.is_none());
        assert!(store.status(stale).await.is_none());
    }
}
