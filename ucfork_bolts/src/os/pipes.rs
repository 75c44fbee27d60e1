//! Unix `pipe` wrapper for `ucfork`
use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
};

#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::{fcntl::OFlag, unistd::pipe2};
#[cfg(not(any(target_os = "linux", target_os = "android")))]
use nix::unistd::pipe;

use crate::Error;

/// Both ends of an anonymous pipe. Either end may be closed or handed out independently.
#[derive(Debug)]
pub struct Pipe {
    read_end: Option<File>,
    write_end: Option<File>,
}

impl Pipe {
    /// Create a new pipe. Both ends are close-on-exec where the OS lets us ask for it.
    pub fn new() -> Result<Self, Error> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let (read_end, write_end) = pipe()?;
        Ok(Self {
            read_end: Some(File::from(read_end)),
            write_end: Some(File::from(write_end)),
        })
    }

    /// Close the read end, readers on the other side will see `EPIPE`
    pub fn close_read_end(&mut self) {
        self.read_end = None;
    }

    /// Close the write end, readers will see EOF once the buffer is drained
    pub fn close_write_end(&mut self) {
        self.write_end = None;
    }

    /// Move the read end out of this pipe
    pub fn take_read_end(&mut self) -> Option<File> {
        self.read_end.take()
    }

    /// Move the write end out of this pipe
    pub fn take_write_end(&mut self) -> Option<File> {
        self.write_end.take()
    }
}

impl Read for Pipe {
    /// Reads a few bytes
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match self.read_end.as_mut() {
            Some(read_end) => read_end.read(buf),
            None => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "Read pipe end was already closed",
            )),
        }
    }
}

impl Write for Pipe {
    /// Writes a few bytes
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self.write_end.as_mut() {
            Some(write_end) => write_end.write(buf),
            None => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "Write pipe end was already closed",
            )),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}
