use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

type PrependedPath = Result<OsString, env::JoinPathsError>;

/// Prepend the given `dirs` to the given `path`.
///
/// If a given dir is already in `path` it is moved to the front. Note that
/// this does *not* update the variable in the environment.
pub(crate) fn prepend_to_path(dirs: &[PathBuf], path: Option<OsString>) -> PrependedPath {
    Ok(match path {
        None => env::join_paths(dirs)?,
        Some(path) => {
            let mut paths = dirs.to_vec();
            paths.extend(env::split_paths(&path).filter(|path| !dirs.contains(path)));
            env::join_paths(paths)?
        }
    })
}
