//! A pipe-backed edge-triggered signal.
//!
//! Blocking consumers can poll the read end's descriptor for mailbox
//! readiness. Both ends are non-blocking and close-on-exec.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

/// Fire to make the read end readable; extinguish to drain it.
#[derive(Debug)]
pub struct Flare {
    reader: File,
    writer: File,
}

impl Flare {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        Ok(Self {
            reader: File::from(reader),
            writer: File::from(writer),
        })
    }

    /// The descriptor that becomes readable after `fire`.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Makes the read end readable. A full pipe already signals readiness,
    /// so hitting `WouldBlock` counts as success.
    pub fn fire(&self) {
        loop {
            match (&self.writer).write(&[0u8]) {
                Ok(n) if n > 0 => return,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }

    /// Consumes one byte. Returns whether one was drained.
    pub fn extinguish_one(&self) -> bool {
        let mut buf = [0u8; 1];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(1) => return true,
                Ok(_) => return false,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// Drains the pipe completely.
    pub fn extinguish(&self) {
        let mut buf = [0u8; 256];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_extinguished() {
        let flare = Flare::new().unwrap();
        assert!(!flare.extinguish_one());
    }

    #[test]
    fn fire_then_extinguish_one() {
        let flare = Flare::new().unwrap();
        flare.fire();
        assert!(flare.extinguish_one());
        assert!(!flare.extinguish_one());
    }

    #[test]
    fn extinguish_drains_everything() {
        let flare = Flare::new().unwrap();
        for _ in 0..10 {
            flare.fire();
        }
        flare.extinguish();
        assert!(!flare.extinguish_one());
    }

    #[test]
    fn fire_survives_a_full_pipe() {
        let flare = Flare::new().unwrap();
        // Way past any pipe buffer size; must not block or panic.
        for _ in 0..100_000 {
            flare.fire();
        }
        assert!(flare.extinguish_one());
    }
}
