use crate::error::{Error, Result};
use journey_api::StatsResponse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate participant statistics for one bin of a journey.
///
/// Only the style-specific field matching the journey's prompt is `Some`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatBucket {
    pub journey_time_seconds: f64,
    pub bin_width_seconds: f64,
    pub users: u64,
    pub likes: u64,
    /// Responses per option value for numeric prompts.
    pub numeric_active: Option<BTreeMap<i64, u64>>,
    pub press_active: Option<u64>,
    pub press: Option<u64>,
    /// Responses per option index for color prompts.
    pub color_active: Option<Vec<u64>>,
    /// Responses per option index for word prompts.
    pub word_active: Option<Vec<u64>>,
}

impl StatBucket {
    /// A bucket with no participants, published before any data arrives.
    pub fn empty() -> Self {
        Self {
            journey_time_seconds: 0.0,
            bin_width_seconds: 0.0,
            users: 0,
            likes: 0,
            numeric_active: None,
            press_active: None,
            press: None,
            color_active: None,
            word_active: None,
        }
    }

    /// Blend `from` toward `to`. Each count is rounded to the nearest integer;
    /// `progress` is clamped to `[0, 1]`.
    pub fn interpolate(from: &StatBucket, to: &StatBucket, progress: f64) -> StatBucket {
        let progress = progress.clamp(0.0, 1.0);
        StatBucket {
            journey_time_seconds: from.journey_time_seconds
                + (to.journey_time_seconds - from.journey_time_seconds) * progress,
            bin_width_seconds: from.bin_width_seconds,
            users: lerp(from.users, to.users, progress),
            likes: lerp(from.likes, to.likes, progress),
            numeric_active: blend(&from.numeric_active, &to.numeric_active, |a, b| {
                lerp_map(a, b, progress)
            }),
            press_active: blend(&from.press_active, &to.press_active, |a, b| {
                lerp(*a, *b, progress)
            }),
            press: blend(&from.press, &to.press, |a, b| lerp(*a, *b, progress)),
            color_active: blend(&from.color_active, &to.color_active, |a, b| {
                lerp_slice(a, b, progress)
            }),
            word_active: blend(&from.word_active, &to.word_active, |a, b| {
                lerp_slice(a, b, progress)
            }),
        }
    }

    /// Whether every count matches. Times are ignored.
    pub fn same_counts(&self, other: &StatBucket) -> bool {
        self.users == other.users
            && self.likes == other.likes
            && self.numeric_active == other.numeric_active
            && self.press_active == other.press_active
            && self.press == other.press
            && self.color_active == other.color_active
            && self.word_active == other.word_active
    }
}

impl TryFrom<StatsResponse> for StatBucket {
    type Error = Error;

    fn try_from(response: StatsResponse) -> Result<Self> {
        let numeric_active = match response.numeric_active {
            Some(raw) => {
                let mut parsed = BTreeMap::new();
                for (key, count) in raw {
                    let value: i64 = key.trim().parse().map_err(|_| {
                        Error::Protocol(format!("numeric_active key {key:?} is not an integer"))
                    })?;
                    parsed.insert(value, count);
                }
                Some(parsed)
            }
            None => None,
        };

        Ok(StatBucket {
            journey_time_seconds: response.journey_time,
            bin_width_seconds: response.bin_width,
            users: response.users,
            likes: response.likes,
            numeric_active,
            press_active: response.press_active,
            press: response.press,
            color_active: response.color_active,
            word_active: response.word_active,
        })
    }
}

/// Share of `counts` held by each option, as percentages.
///
/// Every option is 0% when nobody has responded.
pub fn percentages(counts: &[u64]) -> Vec<f64> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return vec![0.0; counts.len()];
    }
    counts
        .iter()
        .map(|&count| count as f64 * 100.0 / total as f64)
        .collect()
}

fn lerp(a: u64, b: u64, progress: f64) -> u64 {
    let value = a as f64 + (b as f64 - a as f64) * progress;
    value.round().max(0.0) as u64
}

fn lerp_map(a: &BTreeMap<i64, u64>, b: &BTreeMap<i64, u64>, progress: f64) -> BTreeMap<i64, u64> {
    a.keys()
        .chain(b.keys())
        .map(|key| {
            let from = a.get(key).copied().unwrap_or(0);
            let to = b.get(key).copied().unwrap_or(0);
            (*key, lerp(from, to, progress))
        })
        .collect()
}

fn lerp_slice(a: &[u64], b: &[u64], progress: f64) -> Vec<u64> {
    (0..a.len().max(b.len()))
        .map(|i| {
            let from = a.get(i).copied().unwrap_or(0);
            let to = b.get(i).copied().unwrap_or(0);
            lerp(from, to, progress)
        })
        .collect()
}

/// Blend two optional fields. A side without a value counts as zero.
fn blend<T: Default>(a: &Option<T>, b: &Option<T>, f: impl FnOnce(&T, &T) -> T) -> Option<T> {
    if a.is_none() && b.is_none() {
        return None;
    }
    let zero = T::default();
    Some(f(a.as_ref().unwrap_or(&zero), b.as_ref().unwrap_or(&zero)))
}
