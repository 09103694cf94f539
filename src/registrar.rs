use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::document::Document;
use crate::error::RegistrarError;
use crate::limiter::AdmissionController;
use crate::metrics::Metrics;
use crate::transport::Transport;

/// Submits documents through the shared limiter, then the transport.
///
/// The limiter lock is released before the transport is called, so a slow
/// registry only delays the caller that owns the slot.
pub struct DocumentRegistrar<T> {
    limiter: Arc<AdmissionController>,
    transport: T,
    metrics: Arc<Metrics>,
    default_deadline: Option<Duration>,
}

impl<T: Transport> DocumentRegistrar<T> {
    pub fn new(limiter: Arc<AdmissionController>, transport: T, metrics: Arc<Metrics>) -> Self {
        Self {
            limiter,
            transport,
            metrics,
            default_deadline: None,
        }
    }

    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn limiter(&self) -> &Arc<AdmissionController> {
        &self.limiter
    }

    pub async fn submit(&self, document: &Document) -> Result<String, RegistrarError> {
        self.submit_with_deadline(document, self.default_deadline).await
    }

    pub async fn submit_with_deadline(
        &self,
        document: &Document,
        deadline: Option<Duration>,
    ) -> Result<String, RegistrarError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("submit", %request_id, doc_id = %document.doc_id);

        async move {
            self.metrics.inc_submissions();

            let admission = match self.limiter.acquire(deadline).await {
                Ok(admission) => admission,
                Err(e) => {
                    if matches!(e, RegistrarError::TimedOut { .. }) {
                        self.metrics.inc_timed_out();
                    }
                    warn!("Not admitted: {}", e);
                    return Err(e);
                }
            };
            self.metrics.inc_admitted();
            debug!(
                slot = admission.slot,
                window = admission.generation,
                waited_ms = admission.waited.as_millis() as u64,
                "Admitted"
            );

            // The slot stays consumed whatever the transport returns.
            match self.transport.send(document).await {
                Ok(body) => {
                    self.metrics.inc_succeeded();
                    info!("Document registered");
                    Ok(body)
                }
                Err(e) => {
                    self.metrics.inc_failed();
                    warn!("Registry call failed: {}", e);
                    Err(e.into())
                }
            }
        }
        .instrument(span)
        .await
    }
}
