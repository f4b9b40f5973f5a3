//! Bidirectional byte pump for one forwarded connection

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Which way the bytes flowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// From the accepted connection to the dialed target
    Request,
    /// From the dialed target back to the accepted connection
    Response,
}

impl fmt::Display for CopyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyDirection::Request => f.write_str("request"),
            CopyDirection::Response => f.write_str("response"),
        }
    }
}

/// Outcome of one copy direction
#[derive(Debug)]
pub struct CopyReport {
    pub direction: CopyDirection,
    pub bytes: u64,
    pub error: Option<io::Error>,
}

/// Join handles for both directions
pub struct CopyHandles {
    pub request: JoinHandle<CopyReport>,
    pub response: JoinHandle<CopyReport>,
}

/// Copy `a -> b` and `b -> a` on two independent tasks
///
/// Each direction runs until its source reaches end-of-stream or fails, then shuts
/// down the destination's write side. Neither direction stops the other.
pub fn spawn_copy<A, B>(a: A, b: B, label: impl Into<String>) -> CopyHandles
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let label = label.into();
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let request = tokio::spawn(pump(a_read, b_write, CopyDirection::Request, label.clone()));
    let response = tokio::spawn(pump(b_read, a_write, CopyDirection::Response, label));

    CopyHandles { request, response }
}

async fn pump<R, W>(mut reader: R, mut writer: W, direction: CopyDirection, label: String) -> CopyReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let result = copy_counting(&mut reader, &mut writer, &mut bytes).await;
    let error = result.err();

    if let Err(e) = writer.shutdown().await {
        debug!(connection = %label, direction = %direction, error = %e, "Shutdown after copy failed");
    }

    match &error {
        None => info!(connection = %label, direction = %direction, bytes = bytes, "Copied"),
        Some(e) => info!(
            connection = %label,
            direction = %direction,
            bytes = bytes,
            error = %e,
            "Copy ended with error"
        ),
    }

    CopyReport {
        direction,
        bytes,
        error,
    }
}

// Like tokio::io::copy, but the byte count survives an error
async fn copy_counting<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.flush().await;
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
