//! The [`Pipeline`] entry point: trigger in, committed records out.
//!
//! ```text
//! trigger ──▶ normalize ──▶ route ──┬──▶ dispatch ──▶ handle ──▶ extractor ──▶ commit
//! (3 shapes)                        │   (channel)      │
//!                                   └──▶ REJECTED      └──▶ pdf pages ──▶ dispatch (image)
//! ```
//!
//! ## Two ways to run
//!
//! * **Direct mode**: [`Pipeline::run`] accepts a trigger and drains the
//!   channel until every dispatched message (PDF pages included) is handled.
//!   This is what the CLI does.
//! * **Queue mode**: [`Pipeline::accept`] routes and dispatches; a worker
//!   running [`Pipeline::serve`] handles messages with bounded concurrency.
//!
//! Documents never share state: each message gets its own
//! [`ProcessingContext`], and only a finished context is ever persisted.

use crate::config::PipelineConfig;
use crate::error::TradeDocError;
use crate::pipeline::extractor::{Outcome, ProcessingContext};
use crate::pipeline::handlers::{persist, HandleOutcome, Handlers};
use crate::pipeline::model::VisionModel;
use crate::pipeline::render::PdfRasteriser;
use crate::pipeline::router::{route, HandlerKind, RoutingDecision};
use crate::pipeline::trigger::normalize;
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{Dispatcher, ObjectStore, QueueMessage, RecordStore};
use crate::types::AuditStage;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// What routing did with one document of a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RouteOutcome {
    Dispatched {
        document_id: String,
        key: String,
        handler: HandlerKind,
    },
    /// Unsupported type; a `REJECTED` record was written.
    Rejected {
        document_id: String,
        key: String,
        reason: String,
    },
}

/// Everything one direct-mode run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub routed: Vec<RouteOutcome>,
    pub handled: Vec<HandleOutcome>,
}

/// Router, handlers and persistence wired to concrete backends.
pub struct Pipeline {
    config: PipelineConfig,
    model: Arc<dyn VisionModel>,
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
    dispatcher: Arc<dyn Dispatcher>,
    rasteriser: Arc<dyn PdfRasteriser>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        model: Arc<dyn VisionModel>,
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
        dispatcher: Arc<dyn Dispatcher>,
        rasteriser: Arc<dyn PdfRasteriser>,
    ) -> Self {
        Self {
            config,
            model,
            objects,
            records,
            dispatcher,
            rasteriser,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn records(&self) -> &dyn RecordStore {
        self.records.as_ref()
    }

    fn handlers(&self) -> Handlers<'_> {
        Handlers {
            config: &self.config,
            model: self.model.as_ref(),
            objects: self.objects.as_ref(),
            records: self.records.as_ref(),
            dispatcher: self.dispatcher.as_ref(),
            rasteriser: self.rasteriser.as_ref(),
        }
    }

    /// Normalise a trigger, store any inline content, and route every
    /// document in it: dispatch to a handler or persist a `REJECTED` record.
    pub async fn accept(&self, trigger: &Value) -> Result<Vec<RouteOutcome>, TradeDocError> {
        let requests = normalize(trigger, &self.config.inline_bucket)?;
        let policy = RetryPolicy::for_storage(&self.config);
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let document = request.document;
            if let Some(bytes) = request.inline {
                let metadata = BTreeMap::from([("origin".to_string(), "inline".to_string())]);
                with_retry(&policy, "put_object", || {
                    self.objects
                        .put_object(&document.bucket, &document.key, bytes.clone(), &metadata)
                })
                .await?;
                debug!(
                    "{}: stored inline content at {}",
                    document.document_id,
                    document.location()
                );
            }

            match route(&document) {
                RoutingDecision::Dispatch { handler } => {
                    info!(
                        "{}: routed '{}' → {} ({:?})",
                        document.document_id, document.key, handler, request.shape
                    );
                    let message = QueueMessage::new(&document, handler);
                    with_retry(&policy, "dispatch", || {
                        self.dispatcher.dispatch(message.clone())
                    })
                    .await?;
                    outcomes.push(RouteOutcome::Dispatched {
                        document_id: document.document_id,
                        key: document.key,
                        handler,
                    });
                }
                RoutingDecision::Reject { reason } => {
                    warn!("{}: rejected '{}': {}", document.document_id, document.key, reason);
                    let document_id = document.document_id.clone();
                    let key = document.key.clone();
                    let mut ctx = ProcessingContext::new(document, &self.config);
                    ctx.note(AuditStage::Routing, "reject", reason.clone());
                    let (record, audit) = ctx.finish(Outcome::rejected(None, reason.clone()));
                    persist(self.records.as_ref(), &policy, &record, &audit).await?;
                    outcomes.push(RouteOutcome::Rejected {
                        document_id,
                        key,
                        reason,
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Handle one dispatched message to its terminal state.
    pub async fn handle(&self, message: QueueMessage) -> Result<HandleOutcome, TradeDocError> {
        self.handlers().handle(&message).await
    }

    /// Handle everything currently queued, including messages dispatched
    /// while draining (PDF pages), with `worker_concurrency` in flight.
    ///
    /// Stops at the first error; undelivered messages stay in the channel.
    pub async fn drain(
        &self,
        rx: &mut UnboundedReceiver<QueueMessage>,
    ) -> Result<Vec<HandleOutcome>, TradeDocError> {
        let concurrency = self.config.worker_concurrency.max(1);
        let mut handled = Vec::new();
        loop {
            let mut batch = Vec::new();
            while let Ok(message) = rx.try_recv() {
                batch.push(message);
            }
            if batch.is_empty() {
                return Ok(handled);
            }
            debug!("Draining {} queued message(s)", batch.len());
            let results: Vec<Result<HandleOutcome, TradeDocError>> = stream::iter(batch)
                .map(|message| self.handle(message))
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for result in results {
                handled.push(result?);
            }
        }
    }

    /// Direct mode: accept a trigger and drain the channel to completion.
    pub async fn run(
        &self,
        trigger: &Value,
        rx: &mut UnboundedReceiver<QueueMessage>,
    ) -> Result<RunReport, TradeDocError> {
        let routed = self.accept(trigger).await?;
        let handled = self.drain(rx).await?;
        Ok(RunReport { routed, handled })
    }

    /// Queue mode worker: handle messages until every sender is dropped.
    ///
    /// Failures are logged with their transience; a transient failure
    /// leaves the document without a record so a later delivery can
    /// process it.
    pub async fn serve(self: Arc<Self>, rx: UnboundedReceiver<QueueMessage>) {
        let concurrency = self.config.worker_concurrency.max(1);
        info!("Worker started with concurrency {}", concurrency);
        UnboundedReceiverStream::new(rx)
            .map(|message| {
                let pipeline = Arc::clone(&self);
                async move {
                    let document_id = message.document_id.clone();
                    (document_id, pipeline.handle(message).await)
                }
            })
            .buffer_unordered(concurrency)
            .for_each(|(document_id, result)| async move {
                match result {
                    Ok(outcome) => debug!("{}: {:?}", document_id, outcome),
                    Err(e) => error!(
                        "{}: handling failed (transient={}): {}",
                        document_id,
                        e.is_transient(),
                        e
                    ),
                }
            })
            .await;
        info!("Worker stopped: channel closed");
    }
}
