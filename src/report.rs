use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::reference::TapId;
use crate::tap_monitor::PourEvent;

/// Result of one full pass over a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    pub count_a: u32,
    pub count_b: u32,
    /// Seconds spent pouring, including pours too short to count.
    pub seconds_a: f64,
    pub seconds_b: f64,
    /// Both taps' events, ordered by start time.
    pub events: Vec<PourEvent>,
    pub video_duration: f64,
    /// Frames fully decoded and classified (skipped frames excluded).
    pub frames_decoded: u64,
}

impl EngineReport {
    pub fn total(&self) -> u32 {
        self.count_a + self.count_b
    }

    pub fn count_for(&self, tap: TapId) -> u32 {
        match tap {
            TapId::A => self.count_a,
            TapId::B => self.count_b,
        }
    }

    /// The report as handed to callers: seconds rounded to two decimals.
    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            count_a: self.count_a,
            count_b: self.count_b,
            total: self.total(),
            seconds_a: round2(self.seconds_a),
            seconds_b: round2(self.seconds_b),
            events: self
                .events
                .iter()
                .map(|e| EventSummary {
                    tap: e.tap,
                    start: round2(e.start),
                    end: round2(e.end),
                    duration: round2(e.duration),
                    beers: e.beers,
                })
                .collect(),
            video_duration: round2(self.video_duration),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub tap: TapId,
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub beers: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub count_a: u32,
    pub count_b: u32,
    pub total: u32,
    pub seconds_a: f64,
    pub seconds_b: f64,
    pub events: Vec<EventSummary>,
    pub video_duration: f64,
}

impl ReportSummary {
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        Ok(())
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Concatenates tap A's then tap B's events and orders them by start time.
/// The sort is stable, so equal starts keep A before B.
pub fn merge_events(tap_a: Vec<PourEvent>, tap_b: Vec<PourEvent>) -> Vec<PourEvent> {
    let mut events = tap_a;
    events.extend(tap_b);
    events.sort_by(|x, y| x.start.total_cmp(&y.start));
    events
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    status: &'a str,
    input_video: &'a str,
    summary: &'a ReportSummary,
    timestamp: String,
}

impl<'a> WebhookPayload<'a> {
    fn success(input_video: &'a str, summary: &'a ReportSummary) -> Self {
        Self {
            status: "success",
            input_video,
            summary,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// POSTs a finished summary to `webhook_url`.
pub async fn call_webhook(webhook_url: &str, input_video: &str, summary: &ReportSummary) -> Result<()> {
    let payload = WebhookPayload::success(input_video, summary);

    let client = reqwest::Client::new();
    let response = client
        .post(webhook_url)
        .json(&payload)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .context("webhook request failed")?;

    let status = response.status();
    if status.is_success() {
        info!("[service] webhook delivered: {}", webhook_url);
    } else {
        let error_text = response.text().await.unwrap_or_default();
        warn!("[service] webhook returned {}: {}", status, error_text);
        anyhow::bail!("webhook returned error status: {}", status);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tap: TapId, start: f64, end: f64) -> PourEvent {
        PourEvent {
            tap,
            start,
            end,
            duration: end - start,
            beers: 1,
        }
    }

    #[test]
    fn test_merge_sorts_by_start() {
        let a = vec![event(TapId::A, 1.0, 5.0), event(TapId::A, 40.0, 50.0)];
        let b = vec![event(TapId::B, 3.0, 9.0), event(TapId::B, 20.0, 30.0)];
        let merged = merge_events(a, b);
        let starts: Vec<f64> = merged.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![1.0, 3.0, 20.0, 40.0]);
    }

    #[test]
    fn test_merge_ties_keep_tap_order() {
        let a = vec![event(TapId::A, 7.0, 10.0)];
        let b = vec![event(TapId::B, 2.0, 4.5), event(TapId::B, 7.0, 12.0)];
        let merged = merge_events(a, b);
        let taps: Vec<TapId> = merged.iter().map(|e| e.tap).collect();
        assert_eq!(taps, vec![TapId::B, TapId::A, TapId::B]);
    }

    #[test]
    fn test_summary_rounds_seconds() {
        let report = EngineReport {
            count_a: 2,
            count_b: 1,
            seconds_a: 31.23456,
            seconds_b: 0.004,
            events: vec![event(TapId::A, 1.0 / 3.0, 25.0 + 2.0 / 3.0)],
            video_duration: 601.999,
            frames_decoded: 12,
        };
        let summary = report.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.seconds_a, 31.23);
        assert_eq!(summary.seconds_b, 0.0);
        assert_eq!(summary.video_duration, 602.0);
        assert_eq!(summary.events[0].start, 0.33);
        assert_eq!(summary.events[0].end, 25.67);
        assert_eq!(summary.events[0].duration, 25.33);
    }

    fn one_pour_summary() -> ReportSummary {
        EngineReport {
            count_a: 1,
            count_b: 0,
            seconds_a: 4.0,
            seconds_b: 0.0,
            events: vec![event(TapId::A, 1.0, 5.0)],
            video_duration: 10.0,
            frames_decoded: 300,
        }
        .summary()
    }

    #[test]
    fn test_webhook_payload_fields() {
        let summary = one_pour_summary();
        let json = serde_json::to_value(WebhookPayload::success("bar/cam1.mp4", &summary)).unwrap();

        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["input_video", "status", "summary", "timestamp"]);
        assert_eq!(json["status"], "success");
        assert_eq!(json["input_video"], "bar/cam1.mp4");
        assert_eq!(json["summary"]["total"], 1);

        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok(), "{}", timestamp);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let summary = one_pour_summary();
        let result = call_webhook("http://127.0.0.1:9/", "cam1.mp4", &summary).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_summary_json_shape() {
        let report = EngineReport {
            count_a: 1,
            count_b: 0,
            seconds_a: 4.0,
            seconds_b: 0.0,
            events: vec![event(TapId::A, 1.0, 5.0)],
            video_duration: 10.0,
            frames_decoded: 300,
        };
        let json = serde_json::to_value(report.summary()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["events"][0]["tap"], "A");
        assert_eq!(json["events"][0]["beers"], 1);
        assert_eq!(json["events"][0]["duration"], 4.0);
        assert!(json.get("frames_decoded").is_none());
    }
}
