//! Access history and next-asset guesses.

use std::collections::{HashMap, VecDeque};

const MAX_RECENT: usize = 100;
const MAX_FOLLOWERS: usize = 20;
const RECENT_WINDOW: usize = 10;

#[derive(Debug, Default)]
struct AccessRecord {
    count: u32,
    /// Paths seen right after this one, oldest first.
    followers: VecDeque<String>,
}

/// Scores candidates by what followed the current path before, by overall
/// access frequency and by recency.
#[derive(Debug, Default)]
pub struct AccessPredictor {
    records: HashMap<String, AccessRecord>,
    recent: VecDeque<String>,
}

impl AccessPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        self.records.entry(path.to_string()).or_default().count += 1;

        if let Some(last) = self.recent.back() {
            if let Some(prev) = self.records.get_mut(last.as_str()) {
                if !prev.followers.iter().any(|f| f == path) {
                    prev.followers.push_back(path.to_string());
                    if prev.followers.len() > MAX_FOLLOWERS {
                        prev.followers.pop_front();
                    }
                }
            }
        }

        self.recent.push_back(path.to_string());
        if self.recent.len() > MAX_RECENT {
            self.recent.pop_front();
        }
    }

    /// Up to `max` likely next paths after `current`, best first. `current`
    /// itself only appears when it followed itself.
    pub fn predict(&self, current: &str, max: usize) -> Vec<String> {
        if max == 0 {
            return Vec::new();
        }
        let mut scores: HashMap<&str, f32> = HashMap::new();

        if let Some(record) = self.records.get(current) {
            for next in &record.followers {
                *scores.entry(next.as_str()).or_default() += 1.0;
            }
        }

        let mut frequent: Vec<(&str, u32)> = self.records.iter().map(|(p, r)| (p.as_str(), r.count)).collect();
        frequent.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (path, count) in frequent.into_iter().take(max * 2) {
            if path != current {
                *scores.entry(path).or_default() += count as f32 * 0.1;
            }
        }

        let mut weight = 1.0f32;
        for path in self.recent.iter().rev().take(RECENT_WINDOW) {
            if path == current {
                continue;
            }
            *scores.entry(path.as_str()).or_default() += weight * 0.5;
            weight *= 0.8;
        }

        let mut ranked: Vec<(&str, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().take(max).map(|(p, _)| p.to_string()).collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.recent.clear();
    }
}
