use crate::exchange::{ExchangeClient, ExchangeResult};
use crate::models::{OrderIntent, Rule};
use std::sync::Arc;

/// Keeps at most one outstanding order per rule consistent with the
/// engine's decisions.
///
/// Cancellation always precedes a replacement submission, and a cleared
/// order id requires positive confirmation from the exchange. A timeout is
/// a failure, never an implicit success.
pub struct OrderManager {
    exchange: Arc<dyn ExchangeClient>,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn ExchangeClient>) -> Self {
        Self { exchange }
    }

    /// Cancel the rule's open order, if any.
    ///
    /// No-op when no order is open. The order id is cleared only on
    /// confirmed success; on failure it stays on the rule so the next tick
    /// retries the cancel.
    pub async fn cancel(&self, rule: &mut Rule) -> ExchangeResult<()> {
        let Some(order_id) = rule.open_order_id.clone() else {
            return Ok(());
        };

        match self.exchange.cancel_order(&order_id).await {
            Ok(()) => {
                tracing::debug!(instrument = %rule.instrument_id, %order_id, "cancelled open order");
                rule.open_order_id = None;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    instrument = %rule.instrument_id,
                    %order_id,
                    error = %e,
                    "cancel failed, will retry next tick"
                );
                Err(e)
            }
        }
    }

    /// Submit a new order for the rule.
    ///
    /// Refuses to place while an order id is still live; the caller must
    /// cancel first. On success the returned exchange order id is stored on
    /// the rule. On failure the rule is left unchanged and the error
    /// surfaces to the state machine, which stays in Pending for retry.
    pub async fn submit(&self, rule: &mut Rule, intent: &OrderIntent) -> ExchangeResult<String> {
        if let Some(existing) = &rule.open_order_id {
            return Err(crate::exchange::ExchangeError::Rejected(format!(
                "rule {} already has open order {}",
                rule.instrument_id, existing
            )));
        }

        let order_id = self.exchange.place_order(intent).await?;
        tracing::info!(
            instrument = %rule.instrument_id,
            side = ?intent.side,
            price = intent.price,
            quantity = intent.quantity,
            %order_id,
            "order placed"
        );
        rule.open_order_id = Some(order_id.clone());
        Ok(order_id)
    }
}
