//! Progress events streamed while a submission is judged
//!
//! Every event carries the identity of what it reports on, since test cases
//! complete out of order.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::judger::{CategorySummary, JudgeVerdict, SubmissionSummary};

#[derive(Debug, Clone, Serialize)]
pub struct CategoryInfo {
    pub name: String,
    pub points: f64,
    pub test_cases: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JudgeEvent {
    TestSuiteInfo {
        mode: String,
        language: String,
        total_cases: usize,
        max_score: f64,
        categories: Vec<CategoryInfo>,
    },
    TestCaseResult {
        category_index: usize,
        category: String,
        case_index: usize,
        case: String,
        #[serde(flatten)]
        verdict: JudgeVerdict,
    },
    CategoryResult {
        category_index: usize,
        #[serde(flatten)]
        summary: CategorySummary,
    },
    FinalResult {
        #[serde(flatten)]
        summary: SubmissionSummary,
    },
}

/// Receiver of judge progress
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: JudgeEvent);
}

/// A closed receiver just means nobody is listening any more
#[async_trait]
impl EventSink for mpsc::UnboundedSender<JudgeEvent> {
    async fn emit(&self, event: JudgeEvent) {
        let _ = self.send(event);
    }
}

/// Discards every event
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: JudgeEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_survives_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.emit(JudgeEvent::TestSuiteInfo {
            mode: "standard".into(),
            language: "sh".into(),
            total_cases: 0,
            max_score: 0.0,
            categories: vec![],
        })
        .await;
    }

    #[test]
    fn test_event_tagging() {
        let event = JudgeEvent::TestSuiteInfo {
            mode: "standard".into(),
            language: "cpp".into(),
            total_cases: 2,
            max_score: 100.0,
            categories: vec![CategoryInfo {
                name: "all".into(),
                points: 100.0,
                test_cases: vec!["1".into(), "2".into()],
            }],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "test_suite_info");
        assert_eq!(json["categories"][0]["test_cases"][1], "2");
    }
}
