//! End-to-end exercise of the host-bridge protocol: a background thread
//! plays the role of the host-side watcher, reading the FIFO and writing
//! the three result files, while `PipePool::execute` drives the controller
//! side.

use benchctl_core::hostbridge::PipePool;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::time::Duration;

fn mkfifo(path: &std::path::Path) {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).unwrap();
    let result = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    assert_eq!(result, 0, "mkfifo failed: {}", std::io::Error::last_os_error());
}

#[tokio::test]
async fn execute_round_trips_a_command_through_the_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let pipe_path = dir.path().join("host-pipe-xbatctld-0");
    mkfifo(&pipe_path);

    let pipe_dir = dir.path().to_path_buf();
    let host_thread = std::thread::spawn(move || {
        let mut pipe = OpenOptions::new().read(true).open(&pipe_path).unwrap();
        let mut line = String::new();
        pipe.read_to_string(&mut line).unwrap();
        let id = line.split(';').next().unwrap().to_string();

        std::fs::write(pipe_dir.join(format!("{id}_stdout")), "hello from host\n").unwrap();
        std::fs::write(pipe_dir.join(format!("{id}_stderr")), "").unwrap();
        std::fs::write(pipe_dir.join(format!("{id}_ret")), "0").unwrap();
    });

    let pool = PipePool::discover(dir.path(), 5).unwrap();
    let result = pool.execute("echo hello from host", Duration::from_secs(5)).await;

    host_thread.join().unwrap();

    assert!(result.is_success());
    assert_eq!(result.body.trim(), "hello from host");
}
