//! Timeout-bounded line reader over a child's combined output stream.
//!
//! Partial data survives a timed-out call: bytes read so far stay in the
//! pump's buffer and are completed by the next call.
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Type-erased read end of a child's combined stdout/stderr pipe.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

pub struct OutputPump<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    closed: bool,
    read_error: Option<io::Error>,
}

impl<R: AsyncRead + Unpin> OutputPump<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            closed: false,
            read_error: None,
        }
    }

    /// Read the next line, waiting at most `timeout` (`None` waits forever).
    ///
    /// Returns `(line, false)` with the trailing newline still attached when a
    /// line is available, `("", false)` once the stream is closed, and
    /// `("", true)` when the timeout elapsed first. Use [`Self::is_closed`] to
    /// tell end of stream apart from a timeout.
    pub async fn read_line(&mut self, timeout: Option<Duration>) -> (String, bool) {
        if self.closed {
            return (String::new(), false);
        }

        // read_until appends to `pending` as it goes, so dropping the future
        // on timeout keeps every byte already consumed from the pipe.
        let read = self.reader.read_until(b'\n', &mut self.pending);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => return (String::new(), true),
            },
            None => read.await,
        };

        match result {
            Ok(0) => {
                self.closed = true;
                (self.take_pending(), false)
            }
            Ok(_) => (self.take_pending(), false),
            Err(e) => {
                tracing::debug!(error = %e, "output stream read failed; treating as closed");
                self.closed = true;
                self.read_error = Some(e);
                (self.take_pending(), false)
            }
        }
    }

    /// True once end of stream (or a read error) has been observed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The error that closed the stream early, if any.
    pub fn read_error(&self) -> Option<&io::Error> {
        self.read_error.as_ref()
    }

    /// Take the recorded read error so it is reported only once.
    pub fn take_read_error(&mut self) -> Option<io::Error> {
        self.read_error.take()
    }

    fn take_pending(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_reads_complete_lines_in_order() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);

        tx.write_all(b"first\nsecond\n").await.unwrap();

        assert_eq!(pump.read_line(Some(SHORT)).await, ("first\n".to_string(), false));
        assert_eq!(pump.read_line(Some(SHORT)).await, ("second\n".to_string(), false));
    }

    #[tokio::test]
    async fn test_timeout_returns_empty_and_flag() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);

        assert_eq!(pump.read_line(Some(SHORT)).await, (String::new(), true));
        assert!(!pump.is_closed());
    }

    #[tokio::test]
    async fn test_partial_line_survives_timeout() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);

        tx.write_all(b"par").await.unwrap();
        assert_eq!(pump.read_line(Some(SHORT)).await, (String::new(), true));

        tx.write_all(b"tial\n").await.unwrap();
        assert_eq!(pump.read_line(Some(SHORT)).await, ("partial\n".to_string(), false));
    }

    #[tokio::test]
    async fn test_eof_is_not_a_timeout() {
        let (tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);
        drop(tx);

        assert_eq!(pump.read_line(Some(SHORT)).await, (String::new(), false));
        assert!(pump.is_closed());
        // Stays closed on later calls.
        assert_eq!(pump.read_line(None).await, (String::new(), false));
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_returned_before_close() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);

        tx.write_all(b"done\ntail").await.unwrap();
        drop(tx);

        assert_eq!(pump.read_line(None).await, ("done\n".to_string(), false));
        assert_eq!(pump.read_line(None).await, ("tail".to_string(), false));
        assert_eq!(pump.read_line(None).await, (String::new(), false));
        assert!(pump.is_closed());
    }

    #[tokio::test]
    async fn test_partial_before_eof_after_timeout() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);

        tx.write_all(b"half").await.unwrap();
        assert!(pump.read_line(Some(SHORT)).await.1);
        drop(tx);

        assert_eq!(pump.read_line(Some(SHORT)).await, ("half".to_string(), false));
        assert!(pump.is_closed());
    }

    #[tokio::test]
    async fn test_none_timeout_waits_for_data() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.write_all(b"late\n").await.unwrap();
            tx
        });

        assert_eq!(pump.read_line(None).await, ("late\n".to_string(), false));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut pump = OutputPump::new(rx);

        tx.write_all(b"ok\xff\n").await.unwrap();
        let (line, timed_out) = pump.read_line(Some(SHORT)).await;
        assert!(!timed_out);
        assert_eq!(line, "ok\u{fffd}\n");
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    #[tokio::test]
    async fn test_read_error_is_recorded_and_closes() {
        let mut pump = OutputPump::new(BrokenPipe);

        assert_eq!(pump.read_line(Some(SHORT)).await, (String::new(), false));
        assert!(pump.is_closed());
        assert_eq!(
            pump.read_error().map(io::Error::kind),
            Some(io::ErrorKind::BrokenPipe)
        );
        assert!(pump.take_read_error().is_some());
        assert!(pump.read_error().is_none());
    }
}
