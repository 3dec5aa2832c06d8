//! Debian package import.
//!
//! A `.deb` is an `ar` container with a small, conventional set of members:
//! `debian-binary`, a `data.*` tarball holding the package payload, and a
//! `control.*` tarball holding the package metadata. Importing a package
//! merges the payload into the layer and synthesizes a status-directory
//! entry from the `control` metadata file, so that package managers inside
//! the produced image know the package is present.
//!
//! Dependency resolution and maintainer scripts (`preinst`/`postinst`) are
//! not interpreted; only the `Package:` name is read from the metadata.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::writer::{open_tar_stream, LayerWriter};

/// Where per-package metadata snapshots live inside the layer.
pub const STATUS_DIR: &str = "/var/lib/dpkg/status.d";

/// Name of the metadata file inside the control tarball.
pub const PKG_METADATA_FILE: &str = "control";

/// Import failure for a single Debian package.
///
/// Always surfaced to the caller; entries already written for other inputs
/// stay in the layer.
#[derive(Debug, Error)]
pub enum DebError {
    #[error("{} does not contain a data file", .deb.display())]
    MissingData { deb: PathBuf },

    #[error("{} does not contain a control file", .deb.display())]
    MissingControl { deb: PathBuf },

    #[error("{} contains invalid metadata: {}", .deb.display(), .cause)]
    InvalidMetadata { deb: PathBuf, cause: String },

    #[error(
        "unexpected error while importing {}: {}; please report an issue at \
         https://github.com/layertar/layertar/issues",
        .deb.display(),
        .cause
    )]
    Internal { deb: PathBuf, cause: String },
}

/// Which of the two mandatory members a package turned out to contain.
///
/// Both flags are collected over the full container traversal and only
/// checked afterwards, so each deficiency is independently observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebParts {
    Complete,
    MissingData,
    MissingControl,
    MissingBoth,
}

impl DebParts {
    pub fn of(data_found: bool, control_found: bool) -> Self {
        match (data_found, control_found) {
            (true, true) => DebParts::Complete,
            (false, true) => DebParts::MissingData,
            (true, false) => DebParts::MissingControl,
            (false, false) => DebParts::MissingBoth,
        }
    }

    /// Turn a deficiency into its error. The data check comes first when
    /// both members are missing.
    pub fn verify(self, deb: &Path) -> Result<(), DebError> {
        match self {
            DebParts::Complete => Ok(()),
            DebParts::MissingData | DebParts::MissingBoth => Err(DebError::MissingData {
                deb: deb.to_path_buf(),
            }),
            DebParts::MissingControl => Err(DebError::MissingControl {
                deb: deb.to_path_buf(),
            }),
        }
    }
}

/// Extract a Debian package into the layer.
///
/// Iterates the `ar` members in container order. The `data.*` member is
/// merged into the layer like any other tar (ownership forced to `(0, 0)`);
/// the `control.*` member yields a status entry at `STATUS_DIR/<pkg-name>`.
/// Members with any other name (`debian-binary`, `.md5sums`, ...) are
/// ignored.
pub fn add_deb(writer: &mut LayerWriter, deb: &Path) -> Result<()> {
    let file =
        File::open(deb).with_context(|| format!("failed to open package {}", deb.display()))?;
    let mut container = ar::Archive::new(BufReader::new(file));

    let mut data_found = false;
    let mut control_found = false;
    while let Some(entry) = container.next_entry() {
        let mut entry =
            entry.with_context(|| format!("failed to read ar member of {}", deb.display()))?;
        let member = String::from_utf8_lossy(entry.header().identifier()).into_owned();
        let (name, ext) = split_member_name(&member);
        if name == "data" {
            data_found = true;
            let tmpfile = spill_to_temp(&mut entry, &ext)
                .with_context(|| format!("failed to stage data member of {}", deb.display()))?;
            writer.add_tar(tmpfile.path())?;
        } else if name == PKG_METADATA_FILE {
            control_found = true;
            let tmpfile = spill_to_temp(&mut entry, &ext)
                .with_context(|| format!("failed to stage control member of {}", deb.display()))?;
            add_pkg_metadata(writer, tmpfile.path(), deb)?;
        }
    }

    DebParts::of(data_found, control_found).verify(deb)?;
    Ok(())
}

/// Synthesize the status-directory entry from a control tarball.
fn add_pkg_metadata(writer: &mut LayerWriter, metadata_tar: &Path, deb: &Path) -> Result<()> {
    let metadata = extract_control_text(metadata_tar).map_err(|e| DebError::InvalidMetadata {
        deb: deb.to_path_buf(),
        cause: format!("{:#}", e),
    })?;
    let pkg_name = parse_pkg_name(&metadata, deb);
    let dest = format!("{}/{}", STATUS_DIR, pkg_name);

    let internal = |e: anyhow::Error| DebError::Internal {
        deb: deb.to_path_buf(),
        cause: format!("{:#}", e),
    };
    let mut tmpfile = NamedTempFile::new()
        .context("failed to create temporary metadata file")
        .map_err(internal)?;
    tmpfile
        .write_all(metadata.as_bytes())
        .context("failed to write temporary metadata file")
        .map_err(internal)?;
    writer
        .add_file(tmpfile.path(), &dest, None, None, None)
        .map_err(internal)?;
    Ok(())
}

/// Read the text of the `control` member out of a control tarball.
fn extract_control_text(metadata_tar: &Path) -> Result<String> {
    let mut archive = tar::Archive::new(open_tar_stream(metadata_tar)?);
    for entry in archive.entries().context("unreadable control tar")? {
        let mut entry = entry.context("unreadable control tar member")?;
        let is_control = entry
            .path()
            .context("invalid path in control tar")?
            .file_name()
            .map(|n| n == PKG_METADATA_FILE)
            .unwrap_or(false);
        if is_control {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .context("control file is not valid UTF-8")?;
            return Ok(text);
        }
    }
    bail!("no {} member found", PKG_METADATA_FILE)
}

/// Derive the package name from control metadata.
///
/// The first `Package:` line wins; without one, the package file's stem is
/// used instead.
pub fn parse_pkg_name(metadata: &str, deb: &Path) -> String {
    static PKG_NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = PKG_NAME_RE
        .get_or_init(|| Regex::new(r"Package:\s*([\w.+-]+)").expect("package name pattern"));
    if let Some(captures) = re.captures(metadata) {
        return captures[1].to_string();
    }
    deb.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Split an ar member name on its first `.`: logical name, then the
/// remaining extension (`data.tar.gz` -> `("data", "tar.gz")`).
fn split_member_name(member: &str) -> (String, String) {
    match member.split_once('.') {
        Some((name, ext)) => (name.to_string(), ext.to_string()),
        None => (member.to_string(), String::new()),
    }
}

/// Spill an ar member to a scoped temporary file, keeping the extension so
/// that suffix-based decompression still applies. The file is removed when
/// the returned handle drops, on every exit path.
fn spill_to_temp(member: &mut dyn Read, ext: &str) -> Result<NamedTempFile> {
    let suffix = if ext.is_empty() {
        String::new()
    } else {
        format!(".{}", ext)
    };
    let mut tmpfile = tempfile::Builder::new()
        .prefix("layertar-")
        .suffix(&suffix)
        .tempfile()
        .context("failed to create temporary file")?;
    io::copy(member, &mut tmpfile).context("failed to write temporary file")?;
    tmpfile.flush().context("failed to flush temporary file")?;
    Ok(tmpfile)
}
