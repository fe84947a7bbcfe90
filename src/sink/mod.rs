pub mod postgres;
pub mod serializer;
pub mod stdout;


use async_trait::async_trait;

use crate::postgres::ChangeMessage;
use crate::Result;

pub use postgres::PostgresSink;
pub use serializer::JsonSerializer;
pub use stdout::StdoutSink;

/// Destination for normalized change messages.
///
/// `save_message` is awaited once per message, in capture order. A returned
/// error stops the pipeline; sinks do not retry on their own.
#[async_trait]
pub trait ChangeSink: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn save_message(&mut self, message: &ChangeMessage) -> Result<()>;
}

#[async_trait]
impl<T: ChangeSink + ?Sized> ChangeSink for Box<T> {
    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn save_message(&mut self, message: &ChangeMessage) -> Result<()> {
        (**self).save_message(message).await
    }
}
