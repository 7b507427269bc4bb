//! Participant roster derived from snapshot presence records.
//!
//! ## Pipeline
//!
//! ```text
//! DocumentSnapshot.presence
//!       │
//!       ▼
//! PresenceAggregator::aggregate(records, self_id)
//!       │  drop self, collapse duplicates (last record wins)
//!       ▼
//! RosterEntry { color, activity, cursor }
//!       │
//!       ▼
//! host UI
//! ```
//!
//! Nothing is kept between calls; every roster is rebuilt from the newest
//! snapshot alone.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{CursorPosition, ParticipantId, PresenceRecord};

// ───────────────────────────────────────────────────────────────────
// Author colors
// ───────────────────────────────────────────────────────────────────

/// Number of distinct author colors.
pub const PALETTE_SIZE: usize = 10;

const SATURATION: f32 = 0.7;
const LIGHTNESS: f32 = 0.6;

/// Display color for a participant's badges and cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl AuthorColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Palette entry `index`, hues evenly spaced around the color wheel.
    pub fn palette(index: usize) -> Self {
        let hue = (index % PALETTE_SIZE) as f32 / PALETTE_SIZE as f32;
        let (r, g, b) = hsl_to_rgb(hue, SATURATION, LIGHTNESS);
        Self {
            r: to_channel(r),
            g: to_channel(g),
            b: to_channel(b),
        }
    }

    /// Stable color for `id` from a palette of `palette_size` entries.
    pub fn for_participant(id: &ParticipantId, palette_size: usize) -> Self {
        let size = palette_size.clamp(1, PALETTE_SIZE);
        Self::palette(stable_hash(id.as_str()) as usize % size)
    }

    /// `#RRGGBB`.
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// 31-multiplier string hash over UTF-16 code units.
///
/// Independent of std's randomized hasher so colors stay the same across
/// processes and releases.
pub fn stable_hash(s: &str) -> u32 {
    let hash = s
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    hash.unsigned_abs()
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    /// Has a cursor in the document.
    Active,
    Idle,
}

/// One remote participant, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub participant_id: ParticipantId,
    pub color: AuthorColor,
    pub activity: Activity,
    pub cursor: Option<CursorPosition>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceAggregator {
    palette_size: usize,
}

impl Default for PresenceAggregator {
    fn default() -> Self {
        Self { palette_size: PALETTE_SIZE }
    }
}

impl PresenceAggregator {
    /// `palette_size` is clamped to `1..=PALETTE_SIZE`.
    pub fn new(palette_size: usize) -> Self {
        Self {
            palette_size: palette_size.clamp(1, PALETTE_SIZE),
        }
    }

    pub fn palette_size(&self) -> usize {
        self.palette_size
    }

    /// Build the roster for everyone except `self_id`.
    ///
    /// Duplicate records for one participant collapse into one entry at the
    /// position of the first, carrying the data of the last.
    pub fn aggregate(&self, records: &[PresenceRecord], self_id: &ParticipantId) -> Vec<RosterEntry> {
        let mut roster: Vec<RosterEntry> = Vec::with_capacity(records.len());
        let mut index: HashMap<&ParticipantId, usize> = HashMap::new();

        for record in records.iter().filter(|r| &r.participant_id != self_id) {
            let entry = self.entry_for(record);
            match index.get(&record.participant_id) {
                Some(&slot) => roster[slot] = entry,
                None => {
                    index.insert(&record.participant_id, roster.len());
                    roster.push(entry);
                }
            }
        }

        roster
    }

    fn entry_for(&self, record: &PresenceRecord) -> RosterEntry {
        RosterEntry {
            participant_id: record.participant_id.clone(),
            color: AuthorColor::for_participant(&record.participant_id, self.palette_size),
            activity: if record.cursor.is_some() { Activity::Active } else { Activity::Idle },
            cursor: record.cursor,
            last_activity: record.last_activity,
        }
    }
}

/// [`PresenceAggregator::aggregate`] with the full palette.
pub fn aggregate(records: &[PresenceRecord], self_id: &ParticipantId) -> Vec<RosterEntry> {
    PresenceAggregator::default().aggregate(records, self_id)
}
