use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;

use parley_core::error::Result;
use parley_core::traits::ChannelAdapter;
use parley_core::types::SendReceipt;

/// Prints outbound messages to stdout. Backs the CLI `chat` command.
#[derive(Default)]
pub struct ConsoleAdapter {
    sent: AtomicU64,
}

impl ConsoleAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelAdapter for ConsoleAdapter {
    fn name(&self) -> &str {
        "console"
    }

    fn send(&self, recipient: &str, text: &str) -> BoxFuture<'_, Result<SendReceipt>> {
        let line = format!("[{}] {}", recipient, text);
        Box::pin(async move {
            let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", line)?;
            stdout.flush()?;
            Ok(SendReceipt {
                message_id: Some(format!("console-{}", n)),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receipts_are_numbered() {
        let console = ConsoleAdapter::new();
        let first = console.send("ana", "hola").await.unwrap();
        let second = console.send("ana", "chau").await.unwrap();
        assert_eq!(first.message_id.as_deref(), Some("console-1"));
        assert_eq!(second.message_id.as_deref(), Some("console-2"));
    }
}
