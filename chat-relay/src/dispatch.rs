//! Fan-out of one envelope to every registered session.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    codec::encode_line,
    envelope::Envelope,
    registry::{ConnId, Registry},
};

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Sends `envelope` to every registered session except `exclude`.
///
/// Recipients are taken from a registry snapshot and written to concurrently.
/// A failed write is logged and skipped; it is never retried and does not
/// affect delivery to anyone else.
pub async fn broadcast(
    registry: &Registry,
    envelope: &Envelope,
    exclude: Option<ConnId>,
) -> Delivery {
    let line = match encode_line(envelope) {
        Ok(line) => line,
        Err(error) => {
            warn!(?error, "failed to encode broadcast envelope");
            return Delivery::default();
        }
    };

    let recipients = registry.snapshot().await;
    let line = &line;
    let sends = recipients
        .iter()
        .filter(|session| Some(session.id()) != exclude)
        .map(|session| async move {
            match session.send(line).await {
                Ok(()) => true,
                Err(error) => {
                    debug!(
                        conn = session.id(),
                        name = session.name(),
                        ?error,
                        "dropping broadcast for unreachable peer"
                    );
                    false
                }
            }
        });

    join_all(sends)
        .await
        .into_iter()
        .fold(Delivery::default(), |mut delivery, ok| {
            if ok {
                delivery.delivered += 1;
            } else {
                delivery.failed += 1;
            }
            delivery
        })
}
