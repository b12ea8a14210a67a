use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{format_err, Error};

/// Append-only log file, one message per line
///
/// The file is opened with `O_APPEND`, so lines of concurrent writers stay intact as long
/// as each one is smaller than PIPE_BUF (4k on Linux). Inside the process the logger still
/// needs a mutex for shared access.
pub struct FileLogger {
    file: File,
}

impl FileLogger {
    /// Open `file_name` for appending, creating it with mode 0640 when missing.
    pub fn open<P: AsRef<Path>>(file_name: P) -> Result<Self, Error> {
        let file_name = file_name.as_ref();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o640)
            .open(file_name)
            .map_err(|err| format_err!("unable to open log file {:?} - {}", file_name, err))?;

        Ok(Self { file })
    }

    pub fn log<S: AsRef<str>>(&mut self, msg: S) {
        let line = format!("{}\n", msg.as_ref());
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            // log methods must not panic
            log::error!("error writing to log file - {}", err);
        }
    }
}
