//! One pipe shared by the child's stdout and stderr.
//!
//! Both descriptors are dup'ed from the same write end, so the parent sees a
//! single stream in the order the child wrote it.
use crate::pump::OutputStream;
use std::io::{self, PipeReader};
use std::process::Stdio;

/// Write ends for the child's stdout and stderr, plus the parent's read end.
pub(crate) struct CombinedPipe {
    pub(crate) reader: PipeReader,
    pub(crate) stdout: Stdio,
    pub(crate) stderr: Stdio,
}

pub(crate) fn combined() -> io::Result<CombinedPipe> {
    let (reader, writer) = io::pipe()?;
    let stderr = writer.try_clone()?;
    Ok(CombinedPipe {
        reader,
        stdout: Stdio::from(writer),
        stderr: Stdio::from(stderr),
    })
}

/// Register the read end with the tokio reactor. Requires a runtime context.
#[cfg(unix)]
pub(crate) fn into_stream(reader: PipeReader) -> io::Result<OutputStream> {
    use std::os::fd::OwnedFd;
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok(Box::new(receiver))
}

/// Anonymous pipes cannot be registered with the reactor here, so a blocking
/// thread copies the pipe into an in-memory duplex stream.
#[cfg(not(unix))]
pub(crate) fn into_stream(reader: PipeReader) -> io::Result<OutputStream> {
    use std::io::Read;
    use tokio::io::AsyncWriteExt;

    const BRIDGE_CAPACITY: usize = 64 * 1024;

    let runtime = tokio::runtime::Handle::try_current().map_err(io::Error::other)?;
    let (mut tx, rx) = tokio::io::duplex(BRIDGE_CAPACITY);
    std::thread::Builder::new()
        .name("procwarden-output".to_string())
        .spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if runtime.block_on(tx.write_all(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "output pipe read failed");
                        break;
                    }
                }
            }
        })?;
    Ok(Box::new(rx))
}
