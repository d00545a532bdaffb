use alloc::string::String;
use alloc::sync::Arc;

/// A directory a process can hold as its working directory.
pub type DirRef = Arc<Dentry>;

/// A directory entry: a name bound to an inode number.
#[derive(Debug)]
pub struct Dentry {
    pub name: String,
    pub inode: u64,
}

impl Dentry {
    pub fn new(name: &str, inode: u64) -> DirRef {
        Arc::new(Dentry { name: String::from(name), inode })
    }

    /// The root directory, inode 1.
    pub fn root() -> DirRef {
        Dentry::new("/", 1)
    }
}
