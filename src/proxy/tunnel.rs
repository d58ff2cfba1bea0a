//! Bidirectional byte pipe with an idle timeout.
//!
//! Both copy directions share one activity clock, so a long download with a
//! silent request side is not considered idle. The pipe ends when either
//! direction finishes, fails, or nothing moves for the idle timeout.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished pipe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    /// Client to destination.
    pub sent: u64,
    /// Destination to client.
    pub received: u64,
    /// The pipe was closed by the idle timeout.
    pub idle_timeout: bool,
}

struct ActivityClock {
    start: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.start.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Copy between `client` and `destination` until one side is done.
pub async fn pipe<C, D>(client: C, destination: D, idle_timeout: Duration) -> io::Result<PipeStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let clock = ActivityClock::new();
    let mut stats = PipeStats::default();

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut dest_read, mut dest_write) = tokio::io::split(destination);

    let mut sent = 0u64;
    let mut received = 0u64;

    let outcome = {
        let client_to_dest = copy_tracked(&mut client_read, &mut dest_write, &clock, &mut sent);
        let dest_to_client = copy_tracked(&mut dest_read, &mut client_write, &clock, &mut received);
        let idle = watch_idle(&clock, idle_timeout);

        tokio::select! {
            result = client_to_dest => result.map(|_| false),
            result = dest_to_client => result.map(|_| false),
            _ = idle => Ok(true),
        }
    };

    stats.sent = sent;
    stats.received = received;

    match outcome {
        Ok(idle_timeout) => {
            stats.idle_timeout = idle_timeout;
            if idle_timeout {
                debug!("Tunnel idle, closing");
            }
            Ok(stats)
        }
        Err(e) => Err(e),
    }
}

async fn copy_tracked<R, W>(
    reader: &mut R,
    writer: &mut W,
    clock: &ActivityClock,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        clock.touch();
        *total += n as u64;
    }
}

async fn watch_idle(clock: &ActivityClock, idle_timeout: Duration) {
    loop {
        let idle = clock.idle_for();
        if idle >= idle_timeout {
            return;
        }
        tokio::time::sleep(idle_timeout - idle).await;
    }
}
