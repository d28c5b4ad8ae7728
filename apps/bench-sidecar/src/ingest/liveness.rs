use super::types::Channel;
use crate::error::StaleChannelWarning;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};

/// Channels silent for this many stale windows are forgotten.
const FORGET_AFTER_WINDOWS: i32 = 40;
const MIN_FORGET_AFTER_SECS: i64 = 60;

#[derive(Debug)]
pub(crate) struct LivenessTracker {
    window: ChronoDuration,
    forget_after: ChronoDuration,
    last_seen: HashMap<Channel, DateTime<Utc>>,
    flagged: HashSet<Channel>,
}

impl LivenessTracker {
    pub(crate) fn new(window: ChronoDuration) -> Self {
        Self {
            window,
            forget_after: (window * FORGET_AFTER_WINDOWS)
                .max(ChronoDuration::seconds(MIN_FORGET_AFTER_SECS)),
            last_seen: HashMap::new(),
            flagged: HashSet::new(),
        }
    }

    /// Returns true when the channel was flagged stale and has now recovered.
    pub(crate) fn touch(&mut self, channel: &Channel, at: DateTime<Utc>) -> bool {
        match self.last_seen.get_mut(channel) {
            Some(prev) if at > *prev => *prev = at,
            Some(_) => {}
            None => {
                self.last_seen.insert(channel.clone(), at);
            }
        }
        self.flagged.remove(channel)
    }

    pub(crate) fn last_seen(&self, channel: &Channel) -> Option<DateTime<Utc>> {
        self.last_seen.get(channel).copied()
    }

    /// Flags channels that went silent since the previous check and drops
    /// channels silent past the forget horizon.
    pub(crate) fn check(&mut self, now: DateTime<Utc>) -> Vec<StaleChannelWarning> {
        let forget_after = self.forget_after;
        let flagged = &mut self.flagged;
        self.last_seen.retain(|channel, last_seen| {
            if now - *last_seen > forget_after {
                tracing::debug!(%channel, "forgetting long-silent channel");
                flagged.remove(channel);
                false
            } else {
                true
            }
        });

        let mut newly_stale = Vec::new();
        for warning in self.stale_channels(now) {
            if self.flagged.insert(warning.channel.clone()) {
                newly_stale.push(warning);
            }
        }
        newly_stale
    }

    pub(crate) fn stale_channels(&self, now: DateTime<Utc>) -> Vec<StaleChannelWarning> {
        let mut stale: Vec<StaleChannelWarning> = self
            .last_seen
            .iter()
            .filter_map(|(channel, last_seen)| {
                let silent_for = now - *last_seen;
                if silent_for > self.window && silent_for <= self.forget_after {
                    Some(StaleChannelWarning {
                        channel: channel.clone(),
                        silent_for_ms: silent_for.num_milliseconds(),
                    })
                } else {
                    None
                }
            })
            .collect();
        stale.sort_by(|a, b| a.channel.cmp(&b.channel));
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ChannelKind;

    #[test]
    fn flags_silent_channel_once_and_recovers() {
        let mut tracker = LivenessTracker::new(ChronoDuration::milliseconds(1500));
        let channel = Channel::new("main", ChannelKind::Current);
        let t0 = Utc::now();
        tracker.touch(&channel, t0);

        assert!(tracker.check(t0 + ChronoDuration::milliseconds(1000)).is_empty());

        let warnings = tracker.check(t0 + ChronoDuration::milliseconds(1600));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].channel, channel);
        assert_eq!(warnings[0].silent_for_ms, 1600);

        assert!(tracker.check(t0 + ChronoDuration::milliseconds(2000)).is_empty());
        assert_eq!(
            tracker
                .stale_channels(t0 + ChronoDuration::milliseconds(2000))
                .len(),
            1
        );

        assert!(tracker.touch(&channel, t0 + ChronoDuration::milliseconds(2100)));
        assert!(tracker
            .stale_channels(t0 + ChronoDuration::milliseconds(2200))
            .is_empty());
    }

    #[test]
    fn long_silent_channels_are_forgotten() {
        let mut tracker = LivenessTracker::new(ChronoDuration::milliseconds(1500));
        let gone = Channel::new("relay4", ChannelKind::Pressure);
        let alive = Channel::new("main", ChannelKind::Flow);
        let t0 = Utc::now();
        tracker.touch(&gone, t0);
        assert_eq!(tracker.check(t0 + ChronoDuration::seconds(2)).len(), 1);

        let later = t0 + ChronoDuration::seconds(61);
        tracker.touch(&alive, later);
        assert!(tracker.check(later).is_empty());
        assert_eq!(tracker.last_seen(&gone), None);
        assert!(!tracker.flagged.contains(&gone));
        assert_eq!(tracker.last_seen.len(), 1);

        // A forgotten channel that reports again starts fresh.
        assert!(!tracker.touch(&gone, later));
        assert_eq!(tracker.last_seen(&gone), Some(later));
    }

    #[test]
    fn forget_horizon_scales_with_window() {
        let tracker = LivenessTracker::new(ChronoDuration::seconds(5));
        assert_eq!(tracker.forget_after, ChronoDuration::seconds(200));
        let tracker = LivenessTracker::new(ChronoDuration::zero());
        assert_eq!(tracker.forget_after, ChronoDuration::seconds(60));
    }

    #[test]
    fn older_timestamp_does_not_rewind_last_seen() {
        let mut tracker = LivenessTracker::new(ChronoDuration::seconds(1));
        let channel = Channel::new("main", ChannelKind::Flow);
        let t0 = Utc::now();
        tracker.touch(&channel, t0);
        tracker.touch(&channel, t0 - ChronoDuration::seconds(5));
        assert_eq!(tracker.last_seen(&channel), Some(t0));
    }
}
