use super::HandleShared;
use crate::engine::{Progress, ReadOutcome, SeekOrigin, SeekOutcome, TransferIo};

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::rc::Weak;
use tracing::{debug, warn};

/// Upload source of a transfer.
pub(crate) trait Source: Read + Seek {}

impl<T: Read + Seek> Source for T {}

/// Bridges the engine's data callbacks to a handle's source, sink and
/// progress callback.
///
/// Each adapter is taken out of the handle for the duration of a call, so
/// user code running inside one may reconfigure the handle. A replacement
/// installed meanwhile wins over the adapter being put back.
pub(crate) struct HandleIo {
    handle: Weak<HandleShared>,
}

impl HandleIo {
    pub(crate) fn new(handle: Weak<HandleShared>) -> Self {
        Self { handle }
    }
}

impl TransferIo for HandleIo {
    fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        match self.handle.upgrade() {
            Some(handle) => handle.read_source(buf),
            None => ReadOutcome::Abort,
        }
    }

    fn write(&self, data: &[u8]) -> usize {
        match self.handle.upgrade() {
            Some(handle) => handle.write_sink(data),
            None => 0,
        }
    }

    fn seek(&self, offset: i64, origin: SeekOrigin) -> SeekOutcome {
        match self.handle.upgrade() {
            Some(handle) => handle.seek_source(offset, origin),
            None => SeekOutcome::Fail,
        }
    }

    fn wants_progress(&self) -> bool {
        self.handle
            .upgrade()
            .is_some_and(|handle| handle.state.borrow().progress.is_some())
    }

    fn progress(&self, progress: Progress) -> bool {
        match self.handle.upgrade() {
            Some(handle) => handle.report_progress(progress),
            None => false,
        }
    }
}

/// Maps an engine seek request onto [`SeekFrom`]. A negative absolute offset
/// has no mapping.
pub(crate) fn seek_target(offset: i64, origin: SeekOrigin) -> Option<SeekFrom> {
    match origin {
        SeekOrigin::Start => u64::try_from(offset).ok().map(SeekFrom::Start),
        SeekOrigin::Current => Some(SeekFrom::Current(offset)),
        SeekOrigin::End => Some(SeekFrom::End(offset)),
    }
}

impl HandleShared {
    fn read_source(&self, buf: &mut [u8]) -> ReadOutcome {
        let source = self.state.borrow_mut().source.take();
        let Some(mut source) = source else {
            return ReadOutcome::Data(0);
        };

        let outcome = loop {
            match source.read(buf) {
                Ok(n) => break ReadOutcome::Data(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(handle = %self.id, %err, "Source read failed, aborting transfer");
                    break ReadOutcome::Abort;
                }
            }
        };

        let mut state = self.state.borrow_mut();
        if state.source.is_none() {
            state.source = Some(source);
        }
        outcome
    }

    fn write_sink(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let sink = self.state.borrow_mut().sink.take();
        let Some(mut sink) = sink else {
            return data.len();
        };

        let written = match sink.write_all(data) {
            Ok(()) => data.len(),
            Err(err) => {
                warn!(handle = %self.id, %err, "Sink write failed");
                0
            }
        };

        let mut state = self.state.borrow_mut();
        if state.sink.is_none() {
            state.sink = Some(sink);
        }
        written
    }

    fn seek_source(&self, offset: i64, origin: SeekOrigin) -> SeekOutcome {
        let Some(target) = seek_target(offset, origin) else {
            debug!(handle = %self.id, offset, ?origin, "Seek target out of range");
            return SeekOutcome::Fail;
        };
        let source = self.state.borrow_mut().source.take();
        let Some(mut source) = source else {
            return SeekOutcome::Fail;
        };

        let outcome = match source.seek(target) {
            Ok(_) => SeekOutcome::Ok,
            Err(err) => {
                warn!(handle = %self.id, %err, "Source seek failed");
                SeekOutcome::Fail
            }
        };

        let mut state = self.state.borrow_mut();
        if state.source.is_none() {
            state.source = Some(source);
        }
        outcome
    }

    fn report_progress(&self, progress: Progress) -> bool {
        let callback = self.state.borrow_mut().progress.take();
        let Some(mut callback) = callback else {
            return true;
        };

        let proceed = callback(progress);
        if !proceed {
            debug!(handle = %self.id, ?progress, "Progress callback aborted transfer");
        }

        let mut state = self.state.borrow_mut();
        if state.progress.is_none() {
            state.progress = Some(callback);
        }
        proceed
    }
}
