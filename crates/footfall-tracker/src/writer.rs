//! Signed-delta session versioning.
//!
//! The store cannot update rows. A change to a session is written as a
//! `CANCEL` copy of the last written row followed by an `INSERT` row with
//! the new aggregate, and readers sum the sign per session. For every
//! session the rows ever written therefore collapse to exactly its latest
//! state.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use footfall_types::{
    EventRecord, PageViewRecord, Row, SessionId, SessionKey, SessionRow, Sign, UtmParams,
    VisitAttributes, shorten,
};

use crate::cache::SessionState;
use crate::classify::Referrer;
use crate::config::TrackerConfig;
use crate::request::EventOptions;

/// A session is never continued beyond this age, regardless of activity.
const MAX_SESSION_LENGTH: TimeDelta = TimeDelta::hours(24);
const MAX_EVENT_NAME_LEN: usize = 200;

/// What a hit records besides the session update.
#[derive(Debug, Clone, Copy)]
pub enum HitKind<'a> {
    PageView,
    Event(&'a EventOptions),
}

/// A resolved, classified hit.
#[derive(Debug, Clone, Copy)]
pub struct Hit<'a> {
    /// Key of the visitor as of the hit's day.
    pub key: SessionKey,
    pub time: DateTime<Utc>,
    pub path: &'a str,
    pub title: &'a str,
    pub referrer: &'a Referrer,
    pub utm: &'a UtmParams,
    pub kind: HitKind<'a>,
}

/// Rows to write for one hit, plus the state to cache afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    /// Cancels the previously written session row.
    pub retraction: Option<SessionRow>,
    pub replacement: SessionRow,
    /// The page view or event record.
    pub record: Row,
    pub state: SessionState,
}

impl SessionUpdate {
    /// Splits the update into the rows to enqueue, in write order, and the
    /// state to cache.
    pub fn into_parts(self) -> (Vec<Row>, SessionState) {
        let mut rows = Vec::with_capacity(3);
        if let Some(retraction) = self.retraction {
            rows.push(Row::Session(retraction));
        }
        rows.push(Row::Session(self.replacement));
        rows.push(self.record);
        (rows, self.state)
    }
}

/// Result of applying a hit to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Write(SessionUpdate),
    /// The session is considered a bot. Nothing is written, but the state
    /// keeps the session (and its score) alive.
    Ignored(SessionState),
}

/// Decides between continuing and starting sessions and produces the
/// signed rows for each hit.
#[derive(Debug, Clone)]
pub struct SessionWriter {
    max_age: TimeDelta,
    bot_min_delay: TimeDelta,
    bot_threshold: u8,
    max_page_views: u16,
}

impl SessionWriter {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            max_age: delta(config.session_max_age),
            bot_min_delay: delta(config.bot_min_delay),
            bot_threshold: config.bot_threshold,
            max_page_views: config.max_page_views,
        }
    }

    /// Oldest last-activity time that still continues a session at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_age
    }

    /// Applies `hit` to the visitor's session.
    ///
    /// `attributes` is only called when a new session starts; continued
    /// sessions keep the attributes of their first hit.
    pub fn apply(
        &self,
        existing: Option<&SessionState>,
        hit: &Hit<'_>,
        attributes: impl FnOnce() -> VisitAttributes,
    ) -> Outcome {
        match existing.filter(|state| self.continues(state, hit)) {
            Some(state) => self.continue_session(state, hit),
            None => Outcome::Write(self.start_session(hit, attributes())),
        }
    }

    /// Refreshes the last activity of a session without writing anything.
    ///
    /// The emitted row is left alone so the next hit still retracts it
    /// verbatim.
    pub fn extend(&self, state: &SessionState, time: DateTime<Utc>) -> SessionState {
        let mut extended = state.clone();
        extended.current.time = extended.current.time.max(time);
        extended
    }

    fn continues(&self, state: &SessionState, hit: &Hit<'_>) -> bool {
        let session = &state.current;

        if session.time <= self.window_start(hit.time) {
            return false;
        }
        if hit.time - session.start >= MAX_SESSION_LENGTH {
            return false;
        }

        // a new referrer or campaign starts a new session
        let attributes = &session.attributes;
        if !hit.referrer.is_empty()
            && (hit.referrer.url != attributes.referrer
                || hit.referrer.name != attributes.referrer_name)
        {
            return false;
        }

        !hit.utm.differs_from(&attributes.utm)
    }

    fn start_session(&self, hit: &Hit<'_>, mut attributes: VisitAttributes) -> SessionUpdate {
        attributes.referrer = hit.referrer.url.clone();
        attributes.referrer_name = hit.referrer.name.clone();
        attributes.utm = hit.utm.clone();

        let row = SessionRow {
            sign: Sign::INSERT,
            version: 1,
            client_id: hit.key.client_id,
            visitor_id: hit.key.fingerprint,
            session_id: SessionId::new(rand::random()),
            time: hit.time,
            start: hit.time,
            duration_seconds: 0,
            entry_path: hit.path.to_string(),
            exit_path: hit.path.to_string(),
            entry_title: hit.title.to_string(),
            exit_title: hit.title.to_string(),
            page_views: 1,
            is_bounce: true,
            bot_score: 0,
            attributes,
        };

        SessionUpdate {
            retraction: None,
            record: record(&row, hit, 0),
            state: SessionState {
                current: row.clone(),
                emitted: Some(row.clone()),
            },
            replacement: row,
        }
    }

    fn continue_session(&self, state: &SessionState, hit: &Hit<'_>) -> Outcome {
        let previous = &state.current;
        let mut row = previous.clone();

        row.sign = Sign::INSERT;
        row.time = previous.time.max(hit.time);
        row.duration_seconds = seconds(row.time - row.start);
        row.is_bounce = false;
        let time_on_page = seconds(row.time - previous.time);

        if let HitKind::PageView = hit.kind {
            if !self.bot_min_delay.is_zero() && hit.time - previous.time < self.bot_min_delay {
                row.bot_score = row.bot_score.saturating_add(1);
            }
            if self.max_page_views > 0 && previous.page_views >= self.max_page_views {
                row.bot_score = u8::MAX;
            }

            row.page_views = row.page_views.saturating_add(1);
            row.exit_path = hit.path.to_string();
            row.exit_title = hit.title.to_string();
        }

        if self.bot_threshold > 0 && row.bot_score >= self.bot_threshold {
            return Outcome::Ignored(SessionState {
                current: row,
                emitted: state.emitted.clone(),
            });
        }

        row.version = previous.version + 1;

        Outcome::Write(SessionUpdate {
            retraction: state.emitted.as_ref().map(SessionRow::retraction),
            record: record(&row, hit, time_on_page),
            state: SessionState {
                current: row.clone(),
                emitted: Some(row.clone()),
            },
            replacement: row,
        })
    }
}

/// Builds the page view or event record of a hit for session `row`.
fn record(row: &SessionRow, hit: &Hit<'_>, time_on_page: u32) -> Row {
    match hit.kind {
        HitKind::PageView => Row::PageView(PageViewRecord {
            client_id: row.client_id,
            visitor_id: row.visitor_id,
            session_id: row.session_id,
            session_version: row.version,
            time: hit.time,
            duration_seconds: time_on_page,
            path: hit.path.to_string(),
            title: hit.title.to_string(),
            attributes: row.attributes.clone(),
        }),
        HitKind::Event(event) => Row::Event(EventRecord {
            client_id: row.client_id,
            visitor_id: row.visitor_id,
            session_id: row.session_id,
            session_version: row.version,
            time: hit.time,
            name: shorten(event.name.trim(), MAX_EVENT_NAME_LEN).to_string(),
            duration_seconds: event.duration_seconds,
            meta_keys: event.meta.keys().cloned().collect(),
            meta_values: event.meta.values().cloned().collect(),
            path: hit.path.to_string(),
            title: hit.title.to_string(),
            attributes: row.attributes.clone(),
        }),
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(MAX_SESSION_LENGTH)
}

fn seconds(delta: TimeDelta) -> u32 {
    u32::try_from(delta.num_seconds().max(0)).unwrap_or(u32::MAX)
}
