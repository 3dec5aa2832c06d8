//! Shared test utilities for layertar tests.

use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Test environment with a temporary directory for inputs and outputs.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Root of the scratch space
    pub dir: PathBuf,
}

impl TestEnv {
    /// Create a new test environment.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        Self {
            _temp_dir: temp_dir,
            dir,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write a non-executable input file.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        fs::write(&path, contents).expect("Failed to write input file");
        let mut perms = fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    /// Write an executable input file.
    pub fn write_executable(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.write_file(name, contents);
        let mut perms = fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }
}

/// One entry read back out of a produced layer.
#[derive(Debug)]
pub struct LayerEntry {
    pub path: String,
    pub entry_type: tar::EntryType,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    pub link_target: Option<String>,
    pub contents: Vec<u8>,
}

/// Read every entry of a tar stream, in archive order.
pub fn read_entries<R: Read>(reader: R) -> Vec<LayerEntry> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries().expect("unreadable archive") {
        let mut entry = entry.expect("unreadable entry");
        let path = entry
            .path()
            .expect("entry path")
            .to_string_lossy()
            .into_owned();
        let link_target = entry
            .link_name()
            .expect("entry link name")
            .map(|t| t.to_string_lossy().into_owned());
        let header = entry.header();
        let parsed = LayerEntry {
            path,
            entry_type: header.entry_type(),
            mode: header.mode().expect("entry mode"),
            uid: header.uid().expect("entry uid"),
            gid: header.gid().expect("entry gid"),
            uname: header
                .username()
                .expect("entry uname")
                .unwrap_or("")
                .to_string(),
            gname: header
                .groupname()
                .expect("entry gname")
                .unwrap_or("")
                .to_string(),
            link_target,
            contents: Vec::new(),
        };
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).expect("entry contents");
        out.push(LayerEntry { contents, ..parsed });
    }
    out
}

/// Read back an uncompressed layer file.
pub fn read_layer(path: &Path) -> Vec<LayerEntry> {
    read_entries(File::open(path).expect("open layer"))
}

/// Read back a gzip-compressed layer file.
pub fn read_layer_gz(path: &Path) -> Vec<LayerEntry> {
    read_entries(flate2::read::GzDecoder::new(
        File::open(path).expect("open layer"),
    ))
}

/// Read back a bzip2-compressed layer file.
pub fn read_layer_bz2(path: &Path) -> Vec<LayerEntry> {
    read_entries(bzip2::read::BzDecoder::new(
        File::open(path).expect("open layer"),
    ))
}

pub fn find_entry<'a>(entries: &'a [LayerEntry], path: &str) -> &'a LayerEntry {
    entries
        .iter()
        .find(|e| e.path == path)
        .unwrap_or_else(|| panic!("no entry {} in {:?}", path, paths(entries)))
}

pub fn paths(entries: &[LayerEntry]) -> Vec<String> {
    entries.iter().map(|e| e.path.clone()).collect()
}

/// Build an in-memory tar from the closure's appends.
pub fn build_tar<F: FnOnce(&mut tar::Builder<Vec<u8>>)>(build: F) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    build(&mut builder);
    builder.into_inner().expect("finish tar")
}

/// Append a regular file with explicit ownership to a test tar.
#[allow(clippy::too_many_arguments)]
pub fn append_owned_file(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    contents: &[u8],
    mode: u32,
    uid: u64,
    gid: u64,
    uname: &str,
    gname: &str,
) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_mtime(0);
    header.set_username(uname).expect("set uname");
    header.set_groupname(gname).expect("set gname");
    builder
        .append_data(&mut header, path, contents)
        .expect("append file");
}

/// Append a symlink with explicit ownership to a test tar.
pub fn append_owned_symlink(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    target: &str,
    uid: u64,
    gid: u64,
) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_mtime(0);
    builder
        .append_link(&mut header, path, target)
        .expect("append symlink");
}

/// Gzip-compress a blob.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Xz-compress a blob.
pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).expect("xz write");
    encoder.finish().expect("xz finish")
}

/// A control tarball (gzip) holding a single `./control` file.
pub fn control_tar_gz(control_text: &str) -> Vec<u8> {
    gzip(&build_tar(|b| {
        append_owned_file(b, "./control", control_text.as_bytes(), 0o644, 0, 0, "", "");
    }))
}

/// A data tarball (gzip) holding the given payload files, owned by a build
/// user so ownership normalization is observable.
pub fn data_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    gzip(&build_tar(|b| {
        for (path, contents) in files {
            append_owned_file(b, path, contents, 0o644, 1000, 1000, "builder", "builder");
        }
    }))
}

/// Write a `.deb`-style ar container with the given members, in order.
pub fn make_deb(path: &Path, members: &[(&str, &[u8])]) {
    let file = File::create(path).expect("create deb");
    let mut builder = ar::Builder::new(file);
    for (name, data) in members {
        let mut header = ar::Header::new(name.as_bytes().to_vec(), data.len() as u64);
        header.set_mode(0o100644);
        builder.append(&header, *data).expect("append ar member");
    }
}
