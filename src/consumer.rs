use crate::handler::{BuildEvent, EventHandler};
use crate::koji::TagDispatcher;
use crate::mbs::ModulemdSource;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Drain newline-delimited JSON build events from a reader and run each
/// through the handler. This is the stand-in for a message-bus consumer:
/// transport concerns (redelivery, acking) stay outside this crate.
///
/// Malformed event lines and per-event handling failures are logged and
/// skipped; only a broken reader ends the loop early.
pub async fn consume<R, S, D>(reader: R, handler: &EventHandler<S, D>) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    S: ModulemdSource,
    D: TagDispatcher,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: BuildEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                log::error!("Ignoring malformed event: {e}");
                continue;
            }
        };
        log::info!("Handling build event for {}", event.nsvc());
        if let Err(e) = handler.handle(&event).await {
            log::error!("Failed to handle event for {}: {e:#}", event.nsvc());
        }
    }
    log::info!("Event stream closed, shutting down");
    Ok(())
}
