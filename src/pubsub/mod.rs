//! Pub/Sub over LISTEN/NOTIFY
//!
//! Three consumers share the database's notification bus, each on its own
//! dedicated connection (LISTEN is session-scoped, so pooled connections
//! cannot carry subscriptions):
//!
//! - [`hub`]: client-facing SUBSCRIBE/PUBLISH routing;
//! - [`notifier`]: BRPOP/BLPOP wakeups from keyspace channels;
//! - the cache invalidation listener in [`crate::cache::invalidator`].
//!
//! [`names`] owns the 63-byte channel-name mapping and payload wrapping.

pub mod hub;
pub mod names;
pub mod notifier;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Notification};
use tracing::debug;

/// Opens a dedicated listener connection and returns its client plus the
/// stream of notifications.
///
/// The connection driver runs in a spawned task; when the connection dies
/// the channel closes, which is how callers observe the failure and
/// reconnect.
pub async fn connect_listener(
    config: &tokio_postgres::Config,
) -> Result<
    (
        tokio_postgres::Client,
        mpsc::UnboundedReceiver<Notification>,
    ),
    tokio_postgres::Error,
> {
    let (client, mut connection) = config.connect(tokio_postgres::NoTls).await?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let stream = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(message) = stream.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    if tx.send(n).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "listener connection lost");
                    break;
                }
            }
        }
    });

    Ok((client, rx))
}

/// Quotes a channel name as a LISTEN/UNLISTEN identifier.
pub(crate) fn quote_channel(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_channel() {
        assert_eq!(quote_channel("plain"), "\"plain\"");
        assert_eq!(quote_channel("with\"quote"), "\"with\"\"quote\"");
    }
}
