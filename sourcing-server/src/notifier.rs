//! Endpoint of the non-sourceable notification queue.
//!
//! Notices are logged here. Mail to the requesting users is sent by the
//! notification side, outside this service.

use async_trait::async_trait;
use sourcing_core::{DataSourcingSetToNonSourceable, Envelope};
use tracing::info;

use crate::messaging::{HandlerError, MessageHandler};

pub struct NonSourceableNotifier;

#[async_trait]
impl MessageHandler for NonSourceableNotifier {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let notice: DataSourcingSetToNonSourceable = envelope.decode().map_err(|e| {
            HandlerError::Malformed(format!(
                "non-sourceable notice {}: {}",
                envelope.message_id, e
            ))
        })?;
        if !notice.is_non_sourceable {
            return Err(HandlerError::Malformed(format!(
                "notice {} does not mark data sourcing {} as non-sourceable",
                envelope.message_id, notice.data_sourcing_id
            )));
        }
        info!(
            "Data sourcing {} for company {} ({} {}) is non-sourceable: {} (correlation {})",
            notice.data_sourcing_id,
            notice.company_id,
            notice.framework,
            notice.reporting_period,
            if notice.reason.is_empty() {
                "no reason given"
            } else {
                notice.reason.as_str()
            },
            envelope.correlation_id
        );
        Ok(())
    }
}
