//! Amplitude analysis and alarm classification
//!
//! Consumes raw 8-bit unsigned PCM windows, tracks the peak deviation from
//! the midpoint and classifies it against two thresholds with a debounce
//! timer. Pure computation: no I/O, no blocking. Threshold configuration may
//! be changed between analysis calls from a control surface; changes are
//! announced to subscribers.

use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::constants::{
    DEFAULT_ALARM_THRESHOLD, DEFAULT_ALARM_TRIGGER_PERIOD, DEFAULT_NOTIFICATION_THRESHOLD,
    PCM_MIDPOINT,
};

/// Events produced by the analyzer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerEvent {
    /// Peak deviation of the latest window differs from the previous one
    PeakChanged(i32),
    /// Peak crossed into the notification band (one-shot)
    NotifyTriggered,
    /// Peak has been at or above the alarm threshold for the full trigger
    /// period; repeats on every update until the peak drops below threshold
    AlarmTriggered,
    /// A configuration setter was called with a new value
    ConfigChanged(ConfigField),
}

/// Which configuration field changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    NotificationThreshold,
    AlarmThreshold,
    AlarmTriggerPeriod,
}

/// Rolling peak tracker with notification/alarm classification
pub struct AmplitudeAnalyzer {
    peak_value: i32,
    notification_threshold: i32,
    alarm_threshold: i32,
    alarm_trigger_period: Duration,
    /// When the peak first crossed the alarm threshold; `None` while below
    alarm_window_start: Option<Instant>,
    subscribers: Vec<Sender<AnalyzerEvent>>,
}

impl AmplitudeAnalyzer {
    pub fn new() -> Self {
        Self {
            peak_value: 0,
            notification_threshold: DEFAULT_NOTIFICATION_THRESHOLD,
            alarm_threshold: DEFAULT_ALARM_THRESHOLD,
            alarm_trigger_period: DEFAULT_ALARM_TRIGGER_PERIOD,
            alarm_window_start: None,
            subscribers: Vec::new(),
        }
    }

    /// Subscribe to analyzer events
    pub fn subscribe(&mut self) -> Receiver<AnalyzerEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Analyze one window of raw 8-bit unsigned PCM samples
    pub fn analyze(&mut self, window: &[u8]) -> Vec<AnalyzerEvent> {
        self.analyze_at(window, Instant::now())
    }

    /// Analyze with an explicit timestamp; the public `analyze` passes
    /// `Instant::now()`
    pub fn analyze_at(&mut self, window: &[u8], now: Instant) -> Vec<AnalyzerEvent> {
        let peak = peak_deviation(window);
        self.update_peak(peak, now)
    }

    fn update_peak(&mut self, peak: i32, now: Instant) -> Vec<AnalyzerEvent> {
        let mut events = Vec::new();

        if peak != self.peak_value {
            self.peak_value = peak;
            events.push(AnalyzerEvent::PeakChanged(peak));
        }

        match self.alarm_window_start {
            None => {
                if self.peak_value >= self.alarm_threshold {
                    // Crossing the threshold only opens the window; the alarm
                    // itself waits out the trigger period
                    self.alarm_window_start = Some(now);
                } else if self.peak_value >= self.notification_threshold {
                    events.push(AnalyzerEvent::NotifyTriggered);
                }
            }
            Some(start) => {
                if self.peak_value < self.alarm_threshold {
                    self.alarm_window_start = None;
                } else if now.duration_since(start) >= self.alarm_trigger_period {
                    events.push(AnalyzerEvent::AlarmTriggered);
                }
            }
        }

        for event in &events {
            self.emit(event.clone());
        }
        events
    }

    /// Reset to the stop-capture baseline: peak zero, alarm window closed.
    /// Only a `PeakChanged` is announced; the zero peak is never classified.
    pub fn reset(&mut self) {
        self.alarm_window_start = None;
        if self.peak_value != 0 {
            self.peak_value = 0;
            self.emit(AnalyzerEvent::PeakChanged(0));
        }
    }

    pub fn peak_value(&self) -> i32 {
        self.peak_value
    }

    pub fn notification_threshold(&self) -> i32 {
        self.notification_threshold
    }

    /// Set the notification threshold. No-op when unchanged. Values are
    /// accepted unvalidated; a threshold above `alarm_threshold` makes the
    /// notification band empty.
    pub fn set_notification_threshold(&mut self, threshold: i32) {
        if threshold != self.notification_threshold {
            self.notification_threshold = threshold;
            self.emit(AnalyzerEvent::ConfigChanged(ConfigField::NotificationThreshold));
        }
    }

    pub fn alarm_threshold(&self) -> i32 {
        self.alarm_threshold
    }

    /// Set the alarm threshold. No-op when unchanged; otherwise announced
    /// exactly once.
    pub fn set_alarm_threshold(&mut self, threshold: i32) {
        if threshold != self.alarm_threshold {
            self.alarm_threshold = threshold;
            self.emit(AnalyzerEvent::ConfigChanged(ConfigField::AlarmThreshold));
        }
    }

    pub fn alarm_trigger_period(&self) -> Duration {
        self.alarm_trigger_period
    }

    /// Set how long the peak must hold above the alarm threshold before the
    /// alarm fires. No-op when unchanged.
    pub fn set_alarm_trigger_period(&mut self, period: Duration) {
        if period != self.alarm_trigger_period {
            self.alarm_trigger_period = period;
            self.emit(AnalyzerEvent::ConfigChanged(ConfigField::AlarmTriggerPeriod));
        }
    }

    fn emit(&mut self, event: AnalyzerEvent) {
        // Drop subscribers whose receiver side is gone
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for AmplitudeAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Peak absolute deviation from the PCM midpoint over one window
pub fn peak_deviation(window: &[u8]) -> i32 {
    window
        .iter()
        .map(|&sample| (sample as i32 - PCM_MIDPOINT).abs())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A window whose loudest sample deviates by `peak` from the midpoint
    fn window_with_peak(peak: i32) -> Vec<u8> {
        vec![127, (127 + peak) as u8, 127]
    }

    #[test]
    fn peak_is_max_deviation_from_midpoint() {
        assert_eq!(peak_deviation(&[]), 0);
        assert_eq!(peak_deviation(&[127, 127]), 0);
        assert_eq!(peak_deviation(&[127, 130, 120]), 7);
        assert_eq!(peak_deviation(&[0]), 127);
        assert_eq!(peak_deviation(&[255]), 128);
    }

    #[test]
    fn peak_changed_fires_only_on_change() {
        let mut analyzer = AmplitudeAnalyzer::new();
        let now = Instant::now();

        let events = analyzer.analyze_at(&window_with_peak(10), now);
        assert_eq!(events, vec![AnalyzerEvent::PeakChanged(10)]);

        let events = analyzer.analyze_at(&window_with_peak(10), now);
        assert!(events.is_empty());

        let events = analyzer.analyze_at(&window_with_peak(12), now);
        assert_eq!(events, vec![AnalyzerEvent::PeakChanged(12)]);
    }

    #[test]
    fn notification_band_emits_notify() {
        let mut analyzer = AmplitudeAnalyzer::new();
        let events = analyzer.analyze_at(&window_with_peak(45), Instant::now());
        assert!(events.contains(&AnalyzerEvent::NotifyTriggered));
        assert!(!events.contains(&AnalyzerEvent::AlarmTriggered));
    }

    #[test]
    fn alarm_debounce_then_level_triggered() {
        let mut analyzer = AmplitudeAnalyzer::new();
        let start = Instant::now();

        // Crossing the alarm threshold opens the window without firing and
        // without a notification
        let events = analyzer.analyze_at(&window_with_peak(80), start);
        assert_eq!(events, vec![AnalyzerEvent::PeakChanged(80)]);

        // Still inside the trigger period: silence
        let events = analyzer.analyze_at(&window_with_peak(80), start + Duration::from_secs(1));
        assert!(events.is_empty());

        // Past the trigger period: fires, and keeps firing on every update
        let events = analyzer.analyze_at(&window_with_peak(80), start + Duration::from_secs(2));
        assert_eq!(events, vec![AnalyzerEvent::AlarmTriggered]);
        let events = analyzer.analyze_at(&window_with_peak(80), start + Duration::from_secs(3));
        assert_eq!(events, vec![AnalyzerEvent::AlarmTriggered]);

        // Dropping below the threshold closes the window silently
        let events = analyzer.analyze_at(&window_with_peak(10), start + Duration::from_secs(4));
        assert_eq!(events, vec![AnalyzerEvent::PeakChanged(10)]);

        // A fresh crossing has to wait out the full period again
        let later = start + Duration::from_secs(5);
        let events = analyzer.analyze_at(&window_with_peak(80), later);
        assert_eq!(events, vec![AnalyzerEvent::PeakChanged(80)]);
        let events = analyzer.analyze_at(&window_with_peak(80), later + Duration::from_secs(1));
        assert!(events.is_empty());
    }

    #[test]
    fn setters_are_idempotent() {
        let mut analyzer = AmplitudeAnalyzer::new();
        let rx = analyzer.subscribe();

        analyzer.set_alarm_threshold(60); // current value
        assert!(rx.try_recv().is_err());

        analyzer.set_alarm_threshold(70);
        assert_eq!(
            rx.try_recv().unwrap(),
            AnalyzerEvent::ConfigChanged(ConfigField::AlarmThreshold)
        );
        assert!(rx.try_recv().is_err());

        analyzer.set_notification_threshold(30);
        analyzer.set_alarm_trigger_period(DEFAULT_ALARM_TRIGGER_PERIOD);
        assert!(rx.try_recv().is_err());

        analyzer.set_notification_threshold(20);
        analyzer.set_alarm_trigger_period(Duration::from_secs(5));
        assert_eq!(
            rx.try_recv().unwrap(),
            AnalyzerEvent::ConfigChanged(ConfigField::NotificationThreshold)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            AnalyzerEvent::ConfigChanged(ConfigField::AlarmTriggerPeriod)
        );
    }

    #[test]
    fn reset_clears_peak_and_alarm_window() {
        let mut analyzer = AmplitudeAnalyzer::new();
        let start = Instant::now();
        analyzer.analyze_at(&window_with_peak(80), start);

        analyzer.reset();
        assert_eq!(analyzer.peak_value(), 0);

        // Window must be closed: an immediate loud window re-opens it
        // instead of firing a stale alarm
        let events = analyzer.analyze_at(&window_with_peak(80), start + Duration::from_secs(10));
        assert_eq!(events, vec![AnalyzerEvent::PeakChanged(80)]);
    }

    #[test]
    fn reset_never_classifies_the_zero_peak() {
        // A notification threshold at or below zero puts the baseline peak
        // inside the notification band; the reset must not classify it
        let mut analyzer = AmplitudeAnalyzer::new();
        analyzer.set_notification_threshold(0);
        analyzer.analyze_at(&window_with_peak(40), Instant::now());

        let rx = analyzer.subscribe();
        analyzer.reset();
        assert_eq!(rx.try_recv().unwrap(), AnalyzerEvent::PeakChanged(0));
        assert!(rx.try_recv().is_err());

        // Already at baseline: a second reset announces nothing
        analyzer.reset();
        assert!(rx.try_recv().is_err());
    }

    proptest! {
        #[test]
        fn peak_deviation_bounds(window in proptest::collection::vec(any::<u8>(), 0..512)) {
            let peak = peak_deviation(&window);
            prop_assert!(peak >= 0);
            prop_assert!(peak <= crate::constants::MAX_SAMPLE_DEVIATION);
            if let Some(&loudest) = window.iter().max_by_key(|&&s| (s as i32 - 127).abs()) {
                prop_assert_eq!(peak, (loudest as i32 - 127).abs());
            }
        }
    }
}
