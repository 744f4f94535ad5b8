/// Filesystem change notifications from a single inotify watch.
///
/// The kernel reports raw `inotify_event` records; we decode them, log the
/// file name they carry, and forward nothing but the fact that something
/// changed to the supervisor.
use crate::supervisor::ControlMessage;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use std::fs::File;
use std::io::Read;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

/// Size of the fixed part of an `inotify_event`: wd, mask, cookie, len.
const HEADER_LEN: usize = 16;

/// Room for many events per read; must exceed one header plus `NAME_MAX + 1`.
const READ_BUF_LEN: usize = 4096;

/// One decoded inotify record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    /// Name of the changed entry inside a watched directory; empty when the
    /// watched path itself changed.
    pub name: String,
}

impl ChangeEvent {
    /// The kernel dropped events because its queue filled up.
    pub fn is_overflow(&self) -> bool {
        self.mask & AddWatchFlags::IN_Q_OVERFLOW.bits() != 0
    }

    /// The watch was removed (path deleted, filesystem unmounted).
    pub fn is_ignored(&self) -> bool {
        self.mask & AddWatchFlags::IN_IGNORED.bits() != 0
    }
}

/// Errors decoding a buffer of raw inotify records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes remain than a record header needs.
    TruncatedHeader { available: usize },
    /// The header announces a longer name than the buffer holds.
    TruncatedName { expected: usize, available: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TruncatedHeader { available } => write!(
                f,
                "truncated event header: {} of {} bytes",
                available, HEADER_LEN
            ),
            DecodeError::TruncatedName {
                expected,
                available,
            } => write!(
                f,
                "truncated event name: {} of {} bytes",
                available, expected
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors from setting up or reading the watch. All of them are fatal.
#[derive(Debug)]
pub enum WatchError {
    /// Failed to create the inotify instance.
    Init { source: nix::Error },
    /// Failed to attach the watch to the path.
    AddWatch { path: PathBuf, source: nix::Error },
    /// Failed to register the descriptor with the runtime.
    Register { source: std::io::Error },
    /// Failed to read from the event stream.
    Read { source: std::io::Error },
    /// The event stream held a malformed record.
    Decode { source: DecodeError },
    /// The kernel removed the watch; no further events will arrive.
    WatchRemoved { path: PathBuf },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Init { source } => write!(f, "failed to create inotify instance: {}", source),
            WatchError::AddWatch { path, source } => {
                write!(f, "failed to watch {}: {}", path.display(), source)
            }
            WatchError::Register { source } => {
                write!(f, "failed to register inotify descriptor: {}", source)
            }
            WatchError::Read { source } => write!(f, "failed to read inotify events: {}", source),
            WatchError::Decode { source } => write!(f, "failed to decode inotify events: {}", source),
            WatchError::WatchRemoved { path } => {
                write!(f, "watch on {} was removed by the kernel", path.display())
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Init { source } => Some(source),
            WatchError::AddWatch { source, .. } => Some(source),
            WatchError::Register { source } => Some(source),
            WatchError::Read { source } => Some(source),
            WatchError::Decode { source } => Some(source),
            WatchError::WatchRemoved { .. } => None,
        }
    }
}

/// Extract the name from the nul-padded tail of an inotify record.
///
/// Returns an empty string when there is no nul byte or the name is empty.
pub fn event_name(raw: &[u8]) -> String {
    match raw.iter().position(|&b| b == 0) {
        Some(end) if end > 0 => String::from_utf8_lossy(&raw[..end]).into_owned(),
        _ => String::new(),
    }
}

/// Decode every record in a buffer returned by one read of the inotify fd.
pub fn decode_events(mut buf: &[u8]) -> Result<Vec<ChangeEvent>, DecodeError> {
    let mut events = Vec::new();
    while !buf.is_empty() {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader {
                available: buf.len(),
            });
        }
        let wd = i32::from_ne_bytes(word(buf, 0));
        let mask = u32::from_ne_bytes(word(buf, 4));
        let cookie = u32::from_ne_bytes(word(buf, 8));
        let len = u32::from_ne_bytes(word(buf, 12)) as usize;

        let rest = &buf[HEADER_LEN..];
        if rest.len() < len {
            return Err(DecodeError::TruncatedName {
                expected: len,
                available: rest.len(),
            });
        }
        events.push(ChangeEvent {
            wd,
            mask,
            cookie,
            name: event_name(&rest[..len]),
        });
        buf = &rest[len..];
    }
    Ok(events)
}

fn word(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

/// An inotify instance with one `IN_MODIFY` watch on one path.
///
/// Dropping the handle removes the watch and closes the descriptor.
pub struct WatchHandle {
    inotify: Inotify,
    wd: WatchDescriptor,
    path: PathBuf,
    reader: AsyncFd<File>,
}

impl WatchHandle {
    /// Create the inotify instance and attach the watch. Must run inside a
    /// Tokio runtime.
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| WatchError::Init { source: e })?;
        tracing::debug!(path = %path.display(), "inotify instance created");

        let wd = inotify
            .add_watch(path, AddWatchFlags::IN_MODIFY)
            .map_err(|e| WatchError::AddWatch {
                path: path.to_path_buf(),
                source: e,
            })?;
        tracing::debug!(path = %path.display(), ?wd, "watch attached");

        let fd = inotify
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| WatchError::Register { source: e })?;
        let reader =
            AsyncFd::new(File::from(fd)).map_err(|e| WatchError::Register { source: e })?;

        Ok(Self {
            inotify,
            wd,
            path: path.to_path_buf(),
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next batch of events and decode it.
    pub async fn next_events(&self, buf: &mut [u8]) -> Result<Vec<ChangeEvent>, WatchError> {
        let n = loop {
            let mut guard = self
                .reader
                .readable()
                .await
                .map_err(|e| WatchError::Read { source: e })?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => break result.map_err(|e| WatchError::Read { source: e })?,
                Err(_would_block) => continue,
            }
        };
        if n == 0 {
            return Err(WatchError::Read {
                source: std::io::ErrorKind::UnexpectedEof.into(),
            });
        }
        decode_events(&buf[..n]).map_err(|e| WatchError::Decode { source: e })
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        match self.inotify.rm_watch(self.wd) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "watch removed"),
            // Already gone if the kernel sent IN_IGNORED.
            Err(e) => tracing::debug!(path = %self.path.display(), error = %e, "rm_watch failed"),
        }
    }
}

/// Background reader turning kernel events into `ChangeDetected` messages.
pub struct EventSource {
    handle: WatchHandle,
}

impl EventSource {
    pub fn new(handle: WatchHandle) -> Self {
        Self { handle }
    }

    /// Read events until the watch fails or the supervisor goes away.
    ///
    /// Sending waits while a notification is already pending, so at most one
    /// change is queued ahead of the supervisor.
    pub async fn run(self, commands: mpsc::Sender<ControlMessage>) -> Result<(), WatchError> {
        let mut buf = vec![0u8; READ_BUF_LEN];
        loop {
            for event in self.handle.next_events(&mut buf).await? {
                tracing::debug!(
                    wd = event.wd,
                    mask = event.mask,
                    cookie = event.cookie,
                    name = %event.name,
                    "raw event"
                );
                if event.is_ignored() {
                    return Err(WatchError::WatchRemoved {
                        path: self.handle.path().to_path_buf(),
                    });
                }
                if event.is_overflow() {
                    tracing::warn!("inotify queue overflowed, treating as a change");
                } else {
                    tracing::info!(name = %event.name, "change detected");
                }

                if commands.send(ControlMessage::ChangeDetected).await.is_err() {
                    tracing::debug!("command channel closed, stopping event source");
                    return Ok(());
                }
            }
        }
    }
}
