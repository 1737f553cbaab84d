//! Replays a request log through a tracker backed by a [`MemoryStore`].
//!
//! Each line is one JSON object:
//!
//! ```json
//! {"client_id": 1, "uri": "/pricing?utm_source=x", "remote_addr": "203.0.113.7:5123",
//!  "headers": {"User-Agent": "Mozilla/5.0 ..."}, "title": "Pricing",
//!  "at": "2024-05-02T10:00:00Z"}
//! ```
//!
//! `event` turns the line into a custom event. `at` drives the tracker's
//! clock, so session windows follow the recorded times rather than the
//! replay speed.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use footfall_store::{MemoryStore, Store};
use footfall_tracker::{EventOptions, HitOptions, HitRequest, ManualClock, Tracker, TrackerConfig};
use serde::Deserialize;
use tracing::info;

/// One recorded request.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Entry {
    client_id: u64,
    uri: String,
    #[serde(default)]
    remote_addr: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    referrer: Option<String>,
    #[serde(default)]
    screen_width: u16,
    #[serde(default)]
    screen_height: u16,
    #[serde(default)]
    event: Option<EventEntry>,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EventEntry {
    name: String,
    #[serde(default)]
    duration_seconds: u32,
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

impl Entry {
    fn request(&self) -> HitRequest {
        self.headers.iter().fold(
            HitRequest::new(self.uri.clone(), self.remote_addr.clone()),
            |request, (name, value)| request.with_header(name.clone(), value.clone()),
        )
    }

    fn options(&self) -> HitOptions {
        let options = HitOptions::for_client(self.client_id)
            .with_title(self.title.clone())
            .with_screen(self.screen_width, self.screen_height);
        match &self.referrer {
            Some(referrer) => options.with_referrer(referrer.clone()),
            None => options,
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    lines: usize,
    page_views: usize,
    events: usize,
}

/// Replays `file` and prints the resulting totals.
pub fn run(file: &Path, project_dir: Option<&Path>, print_sessions: bool) -> Result<()> {
    let settings = super::load_config(project_dir)?;
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("failed to open {}", file.display()))?,
    );

    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(Utc::now());
    let tracker = Tracker::builder(Arc::clone(&store) as Arc<dyn Store>)
        .config(TrackerConfig::from_settings(&settings))
        .clock(Arc::new(clock.clone()))
        .build()
        .context("failed to start tracker")?;

    let mut totals = Totals::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", file.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let entry: Entry = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid request", file.display(), index + 1))?;
        if let Some(at) = entry.at {
            clock.set(at);
        }

        let request = entry.request();
        let options = entry.options();
        match &entry.event {
            Some(event) => {
                let event = EventOptions {
                    name: event.name.clone(),
                    duration_seconds: event.duration_seconds,
                    meta: event.meta.clone(),
                };
                tracker.event(&request, &event, &options);
            }
            None => tracker.page_view(&request, &options),
        }
        totals.lines += 1;
    }

    tracker.stop();
    totals.page_views = store.page_views().len();
    totals.events = store.events().len();

    let sessions = store.collapsed_sessions();
    info!(
        lines = totals.lines,
        rows = store.rows().len(),
        "replay finished"
    );

    println!("Replayed {} requests", totals.lines);
    println!("  Page views:       {}", totals.page_views);
    println!("  Events:           {}", totals.events);
    println!("  Sessions:         {}", sessions.len());
    println!("  Session rows:     {}", store.session_rows().len());
    println!(
        "  Bounced sessions: {}",
        sessions.iter().filter(|session| session.is_bounce).count()
    );

    let unmatched = store.unmatched_cancellations();
    if unmatched > 0 {
        println!("  Unmatched cancellations: {unmatched}");
    }

    if print_sessions {
        for session in &sessions {
            println!("{}", serde_json::to_string(session)?);
        }
    }

    Ok(())
}
