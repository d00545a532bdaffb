use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// An open file shared by every descriptor that refers to it. Cloning the
/// `Arc` is `dup`; dropping the last clone closes the file.
pub type FileRef = Arc<Mutex<File>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Console,
    Regular,
}

pub struct File {
    pub kind: FileKind,
    pub path: String,
    pub offset: u64,
    pub readable: bool,
    pub writable: bool,
    /// Contents of a regular file.
    pub data: Vec<u8>,
}

impl File {
    pub fn new_console() -> FileRef {
        Arc::new(Mutex::new(File {
            kind: FileKind::Console,
            path: String::from("console"),
            offset: 0,
            readable: true,
            writable: true,
            data: Vec::new(),
        }))
    }

    pub fn new_regular(path: &str, data: Vec<u8>, readable: bool, writable: bool) -> FileRef {
        Arc::new(Mutex::new(File {
            kind: FileKind::Regular,
            path: String::from(path),
            offset: 0,
            readable,
            writable,
            data,
        }))
    }

    /// Copy bytes starting at `offset` into `buf`, leaving the file offset
    /// alone. Returns the number of bytes copied; past the end that is 0.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        if !self.readable || offset >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }
}

impl Drop for File {
    fn drop(&mut self) {
        log::trace!("fs: closing {}", self.path);
    }
}
