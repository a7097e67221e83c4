//! Shared FIFO helpers for integration tests.

#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

/// Create a named pipe inside `dir`
pub fn make_fifo(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
    path
}

/// Spawn a reader that blocks until a writer opens, then reads to EOF
pub fn spawn_reader(path: PathBuf) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut file = File::open(&path).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        content
    })
}

/// Attach a reader without waiting for a writer.
///
/// Opening read-write never blocks on Linux, so non-blocking writers can
/// connect to it. The returned handle never sees EOF on its own.
pub fn attach_reader(path: &Path) -> File {
    OpenOptions::new().read(true).write(true).open(path).unwrap()
}
