//! Operating System specific abstractions
//!

pub mod pipes;

use std::{
    fs::File,
    os::fd::{FromRawFd, RawFd},
};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::Error;

/// Take ownership of an inherited, already open descriptor, such as the
/// forkserver channels the fuzzer sets up before exec'ing us.
///
/// The descriptor is marked close-on-exec, so processes we spawn do not inherit it.
///
/// # Safety
/// Nothing else in this process may own or close `fd` afterwards.
pub unsafe fn adopt_fd(fd: RawFd) -> Result<File, Error> {
    if let Err(errno) = fcntl(fd, FcntlArg::F_GETFD) {
        return Err(Error::illegal_argument(format!(
            "Descriptor {fd} is not open: {errno}"
        )));
    }
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(File::from_raw_fd(fd))
}
