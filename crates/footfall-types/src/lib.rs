//! # footfall-types: Core types for `Footfall`
//!
//! This crate contains the shared vocabulary of the ingestion engine:
//! - Entity IDs ([`ClientId`], [`Fingerprint`], [`SessionId`], [`SessionKey`])
//! - The signed indicator column ([`Sign`])
//! - Rows written to the append-only store ([`SessionRow`], [`PageViewRecord`],
//!   [`EventRecord`], [`Row`])
//! - Attributes shared by every row ([`VisitAttributes`], [`UtmParams`])
//! - Input hygiene ([`shorten`])

use std::fmt::{Debug, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod text;

pub use text::shorten;

// ============================================================================
// Entity IDs - All Copy (cheap 8-byte values)
// ============================================================================

/// Identifier of the tenant (website/customer) a hit belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ClientId> for u64 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

/// Anonymous visitor identifier derived from request metadata and a salt.
///
/// The value is a keyed hash and cannot be reversed to the user agent or IP
/// address it was computed from. It is only ever used as a lookup key and as
/// the `visitor_id` column of stored rows.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Fingerprint> for u64 {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Random identifier assigned when a session starts.
///
/// A visitor can have several sessions per day; the session id tells them
/// apart in the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SessionId(u32);

impl SessionId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Cache and lookup key for a visitor's session: (tenant, fingerprint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub client_id: ClientId,
    pub fingerprint: Fingerprint,
}

impl SessionKey {
    pub const fn new(client_id: ClientId, fingerprint: Fingerprint) -> Self {
        Self {
            client_id,
            fingerprint,
        }
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.client_id, self.fingerprint)
    }
}

// ============================================================================
// Signed indicator column
// ============================================================================

/// The `+1`/`-1` marker that lets an append-only store express updates.
///
/// Readers sum the sign per session key; a key is valid while the sum is
/// positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub struct Sign(i8);

impl Sign {
    /// A row that asserts the state it carries.
    pub const INSERT: Sign = Sign(1);
    /// A row that cancels an identical, previously written `INSERT` row.
    pub const CANCEL: Sign = Sign(-1);

    pub fn as_i8(self) -> i8 {
        self.0
    }

    pub fn is_cancel(self) -> bool {
        self == Self::CANCEL
    }
}

impl From<Sign> for i8 {
    fn from(sign: Sign) -> Self {
        sign.0
    }
}

impl TryFrom<i8> for Sign {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::INSERT),
            -1 => Ok(Self::CANCEL),
            other => Err(format!("invalid sign {other}, expected 1 or -1")),
        }
    }
}

impl Display for Sign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

// ============================================================================
// Row attributes
// ============================================================================

/// Campaign parameters taken from the request query string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UtmParams {
    pub source: String,
    pub medium: String,
    pub campaign: String,
    pub content: String,
    pub term: String,
}

impl UtmParams {
    /// Returns true if no parameter is set.
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
            && self.medium.is_empty()
            && self.campaign.is_empty()
            && self.content.is_empty()
            && self.term.is_empty()
    }

    /// Returns true if any parameter set on `self` differs from `current`.
    ///
    /// Unset parameters never count as a change.
    pub fn differs_from(&self, current: &UtmParams) -> bool {
        let changed = |new: &str, old: &str| !new.is_empty() && new != old;

        changed(&self.source, &current.source)
            || changed(&self.medium, &current.medium)
            || changed(&self.campaign, &current.campaign)
            || changed(&self.content, &current.content)
            || changed(&self.term, &current.term)
    }
}

/// Classification results fixed when a session starts and copied onto every
/// row of that session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VisitAttributes {
    pub language: String,
    pub country_code: String,
    pub referrer: String,
    pub referrer_name: String,
    pub os: String,
    pub os_version: String,
    pub browser: String,
    pub browser_version: String,
    pub desktop: bool,
    pub mobile: bool,
    pub screen_width: u16,
    pub screen_height: u16,
    pub screen_class: String,
    pub utm: UtmParams,
}

// ============================================================================
// Stored rows
// ============================================================================

/// One row of the collapsing session table.
///
/// Every change to a session is written as a `CANCEL` copy of the previously
/// written row followed by an `INSERT` row carrying the new aggregate.
/// `version` increases by one with every `INSERT` for the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub sign: Sign,
    pub version: u32,
    pub client_id: ClientId,
    pub visitor_id: Fingerprint,
    pub session_id: SessionId,
    /// Time of the latest hit (last activity).
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub duration_seconds: u32,
    pub entry_path: String,
    pub exit_path: String,
    pub entry_title: String,
    pub exit_title: String,
    pub page_views: u16,
    pub is_bounce: bool,
    pub bot_score: u8,
    #[serde(flatten)]
    pub attributes: VisitAttributes,
}

impl SessionRow {
    /// Returns the key this row collapses under.
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.client_id, self.visitor_id)
    }

    /// Returns a cancelling copy of this row.
    ///
    /// The copy is identical except for the sign, which is what lets the
    /// store match and drop the pair.
    pub fn retraction(&self) -> SessionRow {
        SessionRow {
            sign: Sign::CANCEL,
            ..self.clone()
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.sign.is_cancel()
    }
}

/// Immutable fact: one page view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageViewRecord {
    pub client_id: ClientId,
    pub visitor_id: Fingerprint,
    pub session_id: SessionId,
    /// Version of the session row that was valid when this page view happened.
    pub session_version: u32,
    pub time: DateTime<Utc>,
    /// Seconds spent on the previous page of the same session.
    pub duration_seconds: u32,
    pub path: String,
    pub title: String,
    #[serde(flatten)]
    pub attributes: VisitAttributes,
}

/// Immutable fact: one custom event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub client_id: ClientId,
    pub visitor_id: Fingerprint,
    pub session_id: SessionId,
    pub session_version: u32,
    pub time: DateTime<Utc>,
    pub name: String,
    pub duration_seconds: u32,
    pub meta_keys: Vec<String>,
    pub meta_values: Vec<String>,
    pub path: String,
    pub title: String,
    #[serde(flatten)]
    pub attributes: VisitAttributes,
}

/// Anything the ingestion pipeline hands to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table")]
pub enum Row {
    #[serde(rename = "sessions")]
    Session(SessionRow),
    #[serde(rename = "page_views")]
    PageView(PageViewRecord),
    #[serde(rename = "events")]
    Event(EventRecord),
}

impl Row {
    /// Returns the session row, if this is one.
    pub fn as_session(&self) -> Option<&SessionRow> {
        match self {
            Row::Session(row) => Some(row),
            _ => None,
        }
    }

    /// Returns the name of the table the row belongs to.
    pub fn table(&self) -> &'static str {
        match self {
            Row::Session(_) => "sessions",
            Row::PageView(_) => "page_views",
            Row::Event(_) => "events",
        }
    }
}
