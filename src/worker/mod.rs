pub mod dispatch;
pub mod registry;
pub mod tools;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::config::Config;
use crate::line_buffer::LineBuffer;
pub use dispatch::ToolDispatcher;

/// Reads request lines until EOF and answers each one in arrival order.
pub async fn serve<R, W>(mut reader: R, mut writer: W, dispatcher: &ToolDispatcher) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0_u8; 8 * 1024];
    loop {
        let read = reader
            .read(&mut chunk)
            .await
            .context("failed reading worker input")?;
        if read == 0 {
            break;
        }
        for line in buffer.push(&chunk[..read]) {
            let Some(response) = dispatcher.handle_line(&line).await else {
                continue;
            };
            let encoded = response.to_line()?;
            writer
                .write_all(encoded.as_bytes())
                .await
                .context("failed writing worker response")?;
            writer.flush().await.context("failed flushing worker output")?;
        }
    }
    Ok(())
}

/// Worker role bound to process stdio. Logs go to stderr.
pub async fn run_stdio(config: &Config) -> Result<()> {
    let dispatcher = ToolDispatcher::from_config(config)?;
    info!(
        "worker ready (tools={}, completions={}, notifications_dir={})",
        dispatcher.registry().len(),
        dispatcher.completions_enabled(),
        config.notifications.dir.display()
    );
    serve(tokio::io::stdin(), tokio::io::stdout(), &dispatcher).await?;
    info!("worker input closed, exiting");
    Ok(())
}
