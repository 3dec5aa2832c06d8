//! Layer assembly engine.
//!
//! One `LayerWriter` per output layer; every input type (file, empty file,
//! tar, Debian package, symlink) is appended through it so metadata
//! normalization happens in a single place.

pub mod deb;
pub mod writer;

pub use deb::{add_deb, DebError, DebParts, STATUS_DIR};
pub use writer::{Compression, LayerWriter};
