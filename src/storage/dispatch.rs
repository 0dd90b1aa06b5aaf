//! Dispatch: handing a routed document to its handler.
//!
//! [`QueueMessage`] is the wire shape between the router and the handlers.
//! Its JSON form is also a valid queue-wrapped trigger body, so a message
//! relayed through an external queue re-enters the pipeline unchanged.

use crate::error::StorageError;
use crate::pipeline::router::HandlerKind;
use crate::types::{DocumentRef, SourceDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// A routed document on its way to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub bucket: String,
    pub key: String,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
    pub routing_decision: HandlerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_document: Option<SourceDocument>,
    pub timestamp: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(document: &DocumentRef, handler: HandlerKind) -> Self {
        Self {
            bucket: document.bucket.clone(),
            key: document.key.clone(),
            document_id: document.document_id.clone(),
            file_extension: document.extension(),
            routing_decision: handler,
            source_document: document.source.clone(),
            timestamp: Utc::now(),
        }
    }

    /// The document this message refers to, id and provenance included.
    pub fn document(&self) -> DocumentRef {
        let mut doc = DocumentRef::new(self.bucket.clone(), self.key.clone())
            .with_document_id(self.document_id.clone());
        if let Some(source) = &self.source_document {
            doc = doc.with_source(source.clone());
        }
        doc
    }
}

/// Sends routed documents to handlers.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: QueueMessage) -> Result<(), StorageError>;
}

/// In-process [`Dispatcher`] over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<QueueMessage>,
}

impl ChannelDispatcher {
    /// Dispatcher plus the receiving end the workers consume.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<QueueMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, message: QueueMessage) -> Result<(), StorageError> {
        debug!(
            "Dispatching {} ({}) to {}",
            message.document_id, message.key, message.routing_decision
        );
        self.tx
            .send(message)
            .map_err(|_| StorageError::Queue("worker channel closed".into()))
    }
}
