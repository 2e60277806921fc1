use serde::{Deserialize, Serialize};

use crate::citations::{process_document, ProcessedDocument};
use crate::error::FetchError;

/// Opaque survey id assigned by the backend.
pub type JobId = String;

/// Display title used when a source carries no usable title.
pub const UNKNOWN_TITLE: &str = "Unknown title";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position in the pending -> processing -> terminal ordering.
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One referenced paper, as listed in a completed survey.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    /// e.g. the knowledge base the paper was retrieved from
    #[serde(default, rename = "source")]
    pub source_name: Option<String>,
    #[serde(default)]
    pub similarity: Option<f64>,
}

impl SourceRecord {
    pub fn titled(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    pub fn display_title(&self) -> &str {
        match self.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => UNKNOWN_TITLE,
        }
    }
}

/// The `data` object of a progress response, as sent by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressPayload {
    #[serde(default)]
    pub survey_id: Option<String>,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(default)]
    pub progress_msg: Option<String>,
    #[serde(default)]
    pub survey_title: Option<String>,
    #[serde(default)]
    pub survey_content: Option<String>,
    #[serde(default)]
    pub papers: Option<Vec<SourceRecord>>,
}

/// Document and sources delivered with a completed job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurveyContent {
    pub document_body: String,
    pub source_list: Vec<SourceRecord>,
}

/// A validated job status read.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub status: JobStatus,
    /// Clamped into `0.0..=1.0`.
    pub progress: f64,
    pub message: String,
    pub title: Option<String>,
    /// Present only when `status` is `Completed`.
    pub content: Option<SurveyContent>,
}

impl JobReport {
    pub fn progress(status: JobStatus, progress: f64, message: &str) -> Self {
        Self {
            status,
            progress: progress.clamp(0.0, 1.0),
            message: message.to_string(),
            title: None,
            content: None,
        }
    }

    pub fn completed(document_body: &str, source_list: Vec<SourceRecord>) -> Self {
        Self {
            status: JobStatus::Completed,
            progress: 1.0,
            message: String::new(),
            title: None,
            content: Some(SurveyContent {
                document_body: document_body.to_string(),
                source_list,
            }),
        }
    }
}

impl TryFrom<ProgressPayload> for JobReport {
    type Error = FetchError;

    fn try_from(payload: ProgressPayload) -> Result<Self, Self::Error> {
        // Cancelled jobs report -1, so only finiteness is enforced here.
        if !payload.progress.is_finite() {
            return Err(FetchError::malformed(format!(
                "progress is not a finite number: {}",
                payload.progress
            )));
        }

        let content = if payload.status == JobStatus::Completed {
            let document_body = payload.survey_content.ok_or_else(|| {
                FetchError::malformed("completed survey is missing survey_content")
            })?;
            Some(SurveyContent {
                document_body,
                source_list: payload.papers.unwrap_or_default(),
            })
        } else {
            None
        };

        Ok(Self {
            status: payload.status,
            progress: payload.progress.clamp(0.0, 1.0),
            message: payload.progress_msg.unwrap_or_default(),
            title: payload.survey_title,
            content,
        })
    }
}

/// What applying a report did to a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Still pending or processing.
    Progressed,
    /// Entered a terminal status with this report. Happens at most once.
    Finished(JobStatus),
    /// The job was already terminal; the report was dropped.
    Ignored,
}

/// Client-side view of one survey-generation task.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: f64,
    pub progress_message: String,
    pub title: Option<String>,
    pub document_body: Option<String>,
    pub source_list: Option<Vec<SourceRecord>>,
}

impl Job {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            progress_message: String::new(),
            title: None,
            document_body: None,
            source_list: None,
        }
    }

    /// Display form of the completed survey. `None` until the job completes.
    pub fn processed_document(&self) -> Option<ProcessedDocument> {
        let body = self.document_body.as_deref()?;
        Some(process_document(body, self.source_list.as_deref()))
    }

    /// Progress rounded to a whole percentage.
    pub fn progress_percent(&self) -> u8 {
        (self.progress.clamp(0.0, 1.0) * 100.0).round() as u8
    }

    /// Fold a status read into the job.
    ///
    /// Status never moves backwards and nothing changes once a terminal
    /// status was recorded, so completion content is captured exactly once.
    pub fn apply(&mut self, report: JobReport) -> Transition {
        if self.status.is_terminal() {
            return Transition::Ignored;
        }

        if report.status.rank() >= self.status.rank() {
            self.status = report.status;
        }
        self.progress = report.progress;
        self.progress_message = report.message;
        if report.title.is_some() {
            self.title = report.title;
        }

        if !self.status.is_terminal() {
            return Transition::Progressed;
        }

        if let Some(content) = report.content {
            self.document_body = Some(content.document_body);
            self.source_list = Some(content.source_list);
        }
        Transition::Finished(self.status)
    }
}
