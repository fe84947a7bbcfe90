use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tracing::debug;

use super::{ChangeSink, JsonSerializer};
use crate::postgres::ChangeMessage;
use crate::Result;

/// Writes each message as one JSON line.
pub struct StdoutSink<W = Stdout> {
    writer: W,
    written: u64,
}

impl StdoutSink<Stdout> {
    pub fn new() -> Self {
        Self::with_writer(tokio::io::stdout())
    }
}

impl Default for StdoutSink<Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: AsyncWrite + Unpin + Send> StdoutSink<W> {
    pub fn with_writer(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChangeSink for StdoutSink<W> {
    async fn connect(&mut self) -> Result<()> {
        debug!("Writing change messages to stdout");
        Ok(())
    }

    async fn save_message(&mut self, message: &ChangeMessage) -> Result<()> {
        let mut line = JsonSerializer::serialize(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        self.written += 1;
        Ok(())
    }
}
