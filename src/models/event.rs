use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::answer::{Answer, Backend};

/// Event kinds pushed to room subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "job.event.created")]
    Created,
    #[serde(rename = "job.event.ocr_done")]
    OcrDone,
    #[serde(rename = "job.event.answered")]
    Answered,
    #[serde(rename = "job.event.completed")]
    Completed,
    #[serde(rename = "job.event.error")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobCreated {
    pub job_id: Uuid,
    pub image_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobUpdate {
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerRecord {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub answer: Answer,
}

/// Kind-specific payload. Untagged; the envelope's `event` field tells them apart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EventData {
    Created(JobCreated),
    Answer(AnswerRecord),
    Update(JobUpdate),
    Error(String),
}

/// Envelope written to every subscriber of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubEvent {
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Backend>,
    pub data: EventData,
}

impl HubEvent {
    pub fn created(job_id: Uuid, image_path: impl Into<String>) -> Self {
        Self {
            event: EventKind::Created,
            source: None,
            data: EventData::Created(JobCreated {
                job_id,
                image_path: image_path.into(),
            }),
        }
    }

    pub fn ocr_done(job_id: Uuid, ocr_text: impl Into<String>) -> Self {
        Self {
            event: EventKind::OcrDone,
            source: None,
            data: EventData::Update(JobUpdate {
                job_id,
                ocr_text: Some(ocr_text.into()),
            }),
        }
    }

    pub fn answered(job_id: Uuid, source: Backend, answer: Answer) -> Self {
        Self {
            event: EventKind::Answered,
            source: Some(source),
            data: EventData::Answer(AnswerRecord { job_id, answer }),
        }
    }

    pub fn completed(job_id: Uuid) -> Self {
        Self {
            event: EventKind::Completed,
            source: None,
            data: EventData::Update(JobUpdate {
                job_id,
                ocr_text: None,
            }),
        }
    }

    pub fn error(source: Backend, message: impl Into<String>) -> Self {
        Self {
            event: EventKind::Error,
            source: Some(source),
            data: EventData::Error(message.into()),
        }
    }
}
