//! Open-file and directory handles held by processes.
//!
//! The process core never interprets file contents beyond reading the
//! backing bytes of a file mapping; it only shares handles between processes
//! and drops them when a process exits.

pub mod dentry;
pub mod file;

pub use dentry::{Dentry, DirRef};
pub use file::{File, FileKind, FileRef};
