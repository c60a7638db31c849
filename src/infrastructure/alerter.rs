//! The alert dispatch boundary. The core only depends on this trait —
//! wiring a Discord/Telegram/webhook sink is an outer-layer concern the
//! core never imports.

use async_trait::async_trait;
use tracing::info;

use crate::domain::alert::Alert;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn dispatch(&self, alert: &Alert);
}

/// Discards every alert. Used in backtesting and dry-run mode where firing
/// a real notification would be wrong.
pub struct NoopSink;

#[async_trait]
impl AlertSink for NoopSink {
    async fn dispatch(&self, _alert: &Alert) {}
}

/// Logs the alert at info level via `tracing`. The default sink when no
/// outer-layer notifier is configured.
pub struct LoggingSink;

#[async_trait]
impl AlertSink for LoggingSink {
    async fn dispatch(&self, alert: &Alert) {
        info!(
            exchange = %alert.exchange,
            symbol = %alert.symbol,
            signal = alert.signal.as_str(),
            grade = alert.setup_grade,
            score = alert.setup_score,
            source_tf = %alert.source_tf,
            price = alert.price,
            "alert fired"
        );
    }
}
