//! Session configuration and the environment `afl-fuzz` hands us.

use std::{
    env,
    path::{Component, Path, PathBuf},
};

use typed_builder::TypedBuilder;
use ucfork_bolts::{
    shmem::{ShMemId, SHM_ENV_VAR},
    Error,
};

use crate::{coverage::MAP_SIZE, forkserver::FORKSRV_FD};

/// Set to `1` by `afl-fuzz` when the target should run once instead of serving forks
pub const NO_FORKSRV_ENV_VAR: &str = "AFL_NO_FORKSRV";

/// Upper bound on symlinks followed while resolving a single guest path
pub const MAX_SYMLINK_HOPS: usize = 16;

/// Everything a session needs besides the booted guest
#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionConfig {
    /// Guest absolute paths are looked up below this directory first
    #[builder(default, setter(strip_option, into))]
    load_prefix: Option<PathBuf>,
    /// Spawned every iteration for the fuzzer to supervise and kill
    #[builder(default = PathBuf::from("/bin/cat"), setter(into))]
    decoy_command: PathBuf,
    #[builder(default = MAP_SIZE)]
    map_size: usize,
    #[builder(default = FORKSRV_FD)]
    control_fd: i32,
    #[builder(default = FORKSRV_FD + 1)]
    status_fd: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionConfig {
    /// Guest root on the host, if any
    #[must_use]
    pub fn load_prefix(&self) -> Option<&Path> {
        self.load_prefix.as_deref()
    }

    /// The decoy spawned per iteration
    #[must_use]
    pub fn decoy_command(&self) -> &Path {
        &self.decoy_command
    }

    /// Size of the coverage map in bytes
    #[must_use]
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// Descriptor control messages arrive on
    #[must_use]
    pub fn control_fd(&self) -> i32 {
        self.control_fd
    }

    /// Descriptor pids and statuses are written to
    #[must_use]
    pub fn status_fd(&self) -> i32 {
        self.status_fd
    }

    /// Map a guest path into the load prefix.
    ///
    /// Symlinks inside the prefix are followed, at most [`MAX_SYMLINK_HOPS`] of them.
    /// Returns the prefixed path if it exists (or `force` is set), the original otherwise.
    #[must_use]
    pub fn prefix_path(&self, path: &Path, force: bool) -> PathBuf {
        let Some(prefix) = &self.load_prefix else {
            return path.to_path_buf();
        };

        let original = path.to_path_buf();
        let mut target = reprefix(prefix, path);
        let mut force = force;
        for _ in 0..MAX_SYMLINK_HOPS {
            let Ok(meta) = target.symlink_metadata() else {
                return if force { target } else { original };
            };
            if !meta.file_type().is_symlink() {
                return target;
            }
            let Ok(linked) = target.read_link() else {
                return target;
            };
            if linked.is_absolute() {
                target = reprefix(prefix, &linked);
            } else {
                let dir = target.parent().unwrap_or(prefix);
                target = dir.join(linked);
                force = false;
            }
        }
        log::warn!(
            "Gave up resolving {} after {MAX_SYMLINK_HOPS} symlinks",
            original.display()
        );
        original
    }

    /// An absolute path inside the load prefix, relative to the prefix root.
    /// Anything else is returned unchanged.
    #[must_use]
    pub fn prefix_rel(&self, path: &Path) -> PathBuf {
        let Some(prefix) = &self.load_prefix else {
            return path.to_path_buf();
        };
        if !path.is_absolute() {
            return path.to_path_buf();
        }
        match path.strip_prefix(prefix) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => path.to_path_buf(),
        }
    }
}

fn reprefix(prefix: &Path, path: &Path) -> PathBuf {
    if !path.is_absolute() || path.starts_with(prefix) {
        return path.to_path_buf();
    }
    let rel: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    prefix.join(rel)
}

/// How `afl-fuzz` wants this process to behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkserverMode {
    /// Serve the fork protocol, recording coverage into the given segment
    Forkserver(ShMemId),
    /// Run the guest once and exit, recording coverage if a segment was handed to us
    SingleRun(Option<ShMemId>),
}

impl ForkserverMode {
    /// Read the mode from `__AFL_SHM_ID` and `AFL_NO_FORKSRV`.
    pub fn from_env() -> Result<Self, Error> {
        let shm_id = match env::var(SHM_ENV_VAR) {
            Ok(id) => Some(id.parse::<ShMemId>()?),
            Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err.into()),
        };
        let no_forksrv = env::var(NO_FORKSRV_ENV_VAR).is_ok_and(|v| v == "1");
        Ok(match shm_id {
            Some(id) if !no_forksrv => Self::Forkserver(id),
            _ => Self::SingleRun(shm_id),
        })
    }

    /// The coverage segment, whatever the mode
    #[must_use]
    pub fn shm_id(&self) -> Option<ShMemId> {
        match self {
            Self::Forkserver(id) => Some(*id),
            Self::SingleRun(id) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        os::unix::fs::symlink,
        path::{Path, PathBuf},
    };

    use serial_test::serial;
    use ucfork_bolts::shmem::{ShMemId, SHM_ENV_VAR};

    use super::{ForkserverMode, SessionConfig, NO_FORKSRV_ENV_VAR};

    fn sysroot(name: &str) -> PathBuf {
        let root = env::temp_dir().join(format!("ucfork_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib/libc.so.6"), b"").unwrap();
        root
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.decoy_command(), Path::new("/bin/cat"));
        assert_eq!(config.map_size(), 1 << 16);
        assert_eq!((config.control_fd(), config.status_fd()), (198, 199));
        assert_eq!(
            config.prefix_path(Path::new("/etc/passwd"), false),
            PathBuf::from("/etc/passwd")
        );
    }

    #[test]
    fn test_prefix_path() {
        let root = sysroot("prefix");
        let config = SessionConfig::builder().load_prefix(&root).build();

        assert_eq!(
            config.prefix_path(Path::new("/usr/lib/libc.so.6"), false),
            root.join("usr/lib/libc.so.6")
        );
        // missing files fall back unless forced
        assert_eq!(
            config.prefix_path(Path::new("/lib/missing.so"), false),
            PathBuf::from("/lib/missing.so")
        );
        assert_eq!(
            config.prefix_path(Path::new("/lib/missing.so"), true),
            root.join("lib/missing.so")
        );
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_prefix_symlinks() {
        let root = sysroot("links");
        symlink("../usr/lib/libc.so.6", root.join("lib/rel.so")).unwrap();
        symlink("/usr/lib/libc.so.6", root.join("lib/abs.so")).unwrap();
        symlink("loop_b", root.join("lib/loop_a")).unwrap();
        symlink("loop_a", root.join("lib/loop_b")).unwrap();
        let config = SessionConfig::builder().load_prefix(&root).build();

        let resolved = config.prefix_path(Path::new("/lib/rel.so"), false);
        assert_eq!(fs::canonicalize(resolved).unwrap(), fs::canonicalize(root.join("usr/lib/libc.so.6")).unwrap());
        assert_eq!(
            config.prefix_path(Path::new("/lib/abs.so"), false),
            root.join("usr/lib/libc.so.6")
        );
        assert_eq!(
            config.prefix_path(Path::new("/lib/loop_a"), false),
            PathBuf::from("/lib/loop_a")
        );
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_prefix_rel() {
        let config = SessionConfig::builder().load_prefix("/opt/sysroot").build();
        assert_eq!(
            config.prefix_rel(Path::new("/opt/sysroot/lib/ld.so")),
            PathBuf::from("/lib/ld.so")
        );
        assert_eq!(config.prefix_rel(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
        assert_eq!(config.prefix_rel(Path::new("rel/x")), PathBuf::from("rel/x"));
    }

    #[test]
    #[serial]
    fn test_mode_from_env() {
        env::remove_var(SHM_ENV_VAR);
        env::remove_var(NO_FORKSRV_ENV_VAR);
        assert_eq!(
            ForkserverMode::from_env().unwrap(),
            ForkserverMode::SingleRun(None)
        );

        env::set_var(SHM_ENV_VAR, "42");
        assert_eq!(
            ForkserverMode::from_env().unwrap(),
            ForkserverMode::Forkserver(ShMemId::from_int(42))
        );

        env::set_var(NO_FORKSRV_ENV_VAR, "1");
        let mode = ForkserverMode::from_env().unwrap();
        assert_eq!(mode, ForkserverMode::SingleRun(Some(ShMemId::from_int(42))));
        assert_eq!(mode.shm_id(), Some(ShMemId::from_int(42)));

        env::set_var(SHM_ENV_VAR, "not a number");
        assert!(ForkserverMode::from_env().is_err());

        env::remove_var(SHM_ENV_VAR);
        env::remove_var(NO_FORKSRV_ENV_VAR);
    }
}
