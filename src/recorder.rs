//! Optional capture of emitted node messages.
//!
//! When a recording directory is configured, the transport appends every
//! node message it publishes to `messages.dat` as length+crc framed wire
//! records, up to a configured cap.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::message::NodeMessage;
use crate::wire;

pub const RECORDER_FILE_NAME: &str = "messages.dat";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] wire::DecodeError),
}

pub struct Recorder {
    writer: FrameWriter<BufWriter<File>>,
    path: PathBuf,
    remaining: u64,
}

impl Recorder {
    /// Opens (truncating) `<dir>/messages.dat` with the given entry cap.
    pub fn open(dir: &Path, cap: u64) -> io::Result<Self> {
        let path = dir.join(RECORDER_FILE_NAME);
        let file = File::create(&path)?;
        debug!(path = %path.display(), cap, "opened file for recording");
        Ok(Self {
            writer: FrameWriter::new(BufWriter::new(file)),
            path,
            remaining: cap,
        })
    }

    /// Appends one message. Past the cap this is a no-op; failures disable
    /// recording rather than disturbing the transport.
    pub fn record(&mut self, msg: &NodeMessage) {
        if self.remaining == 0 {
            return;
        }
        let bytes = match wire::encode_node_message(msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "recorder failed to encode message");
                return;
            }
        };
        let written = self
            .writer
            .write_frame(&bytes)
            .and_then(|()| self.writer.flush());
        if let Err(err) = written {
            warn!(%err, path = %self.path.display(), "recorder write failed; disabling");
            self.remaining = 0;
            return;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            debug!(path = %self.path.display(), "recorder reached its entry cap");
        }
    }
}

/// Reads a recorded file back into the node messages it captured, in order.
pub fn replay(path: &Path) -> Result<Vec<NodeMessage>, ReplayError> {
    let file = File::open(path)?;
    let mut reader = FrameReader::new(BufReader::new(file));
    let mut messages = Vec::new();
    while let Some(frame) = reader.read_next()? {
        messages.push(wire::decode_node_message(&frame)?);
    }
    Ok(messages)
}
