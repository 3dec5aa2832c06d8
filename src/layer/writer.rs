//! Layer tarball writer.
//!
//! `LayerWriter` owns the output tar stream for one container filesystem
//! layer. Inputs of all kinds (files, empty files, symlinks, whole tar
//! archives) funnel through it so that ownership and mode metadata come out
//! normalized no matter where an entry came from.
//!
//! Entries are appended exactly once, in call order. Nothing is rewritten or
//! deduplicated: adding the same destination twice produces two entries, and
//! extraction-time last-entry-wins semantics are inherited from tar itself.

use anyhow::{bail, Context, Result};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tar::{EntryType, Header};
use xz2::read::XzDecoder;

/// Compression applied to the whole output stream.
///
/// Fixed at creation time; the setting (and the encoders' default levels)
/// never change mid-stream, so identical inputs produce byte-identical
/// layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    /// Parse the CLI compression string.
    ///
    /// Accepts the historical short forms (`gz`, `bz2`) as well as the
    /// spelled-out names. An empty string means no compression.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "" | "none" => Ok(Compression::None),
            "gz" | "gzip" => Ok(Compression::Gzip),
            "bz2" | "bzip2" => Ok(Compression::Bzip2),
            other => bail!("unknown compression {:?} (expected gz or bz2)", other),
        }
    }
}

/// The output stream behind the tar builder, with the configured encoder
/// already applied.
enum LayerStream {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Bzip2(BzEncoder<BufWriter<File>>),
}

impl Write for LayerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LayerStream::Plain(w) => w.write(buf),
            LayerStream::Gzip(w) => w.write(buf),
            LayerStream::Bzip2(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LayerStream::Plain(w) => w.flush(),
            LayerStream::Gzip(w) => w.flush(),
            LayerStream::Bzip2(w) => w.flush(),
        }
    }
}

impl LayerStream {
    /// Write any pending compressed trailer and flush the underlying file.
    fn finish(self) -> io::Result<()> {
        match self {
            LayerStream::Plain(mut w) => w.flush(),
            LayerStream::Gzip(enc) => enc.finish()?.flush(),
            LayerStream::Bzip2(enc) => enc.finish()?.flush(),
        }
    }
}

/// Writer for a single layer tarball.
pub struct LayerWriter {
    builder: tar::Builder<LayerStream>,
    /// Optional directory every non-merged, non-empty-file entry is rooted
    /// under. `/` is treated as unset.
    directory: Option<String>,
}

impl LayerWriter {
    /// Open `output` and set up the tar stream with the given compression.
    ///
    /// `directory` roots file and merged-tar destinations inside the layer.
    pub fn create(output: &Path, directory: Option<&str>, compression: Compression) -> Result<Self> {
        let file = File::create(output)
            .with_context(|| format!("failed to create layer output {}", output.display()))?;
        let out = BufWriter::new(file);
        let stream = match compression {
            Compression::None => LayerStream::Plain(out),
            Compression::Gzip => {
                LayerStream::Gzip(GzEncoder::new(out, flate2::Compression::default()))
            }
            Compression::Bzip2 => {
                LayerStream::Bzip2(BzEncoder::new(out, bzip2::Compression::default()))
            }
        };
        Ok(Self {
            builder: tar::Builder::new(stream),
            directory: directory.map(str::to_string),
        })
    }

    /// Compute the in-layer destination for a file entry: strip leading
    /// slashes, root under the configured directory, normalize.
    fn layer_dest(&self, destfile: &str) -> String {
        let mut dest = destfile.trim_start_matches('/').to_string();
        if let Some(dir) = &self.directory {
            if dir != "/" {
                dest = format!("{}/{}", dir.trim_start_matches('/'), dest);
            }
        }
        normalize_path(&dest)
    }

    /// Add a copy of the file at `src` to the layer as `destfile`.
    ///
    /// When `mode` is unset it is derived from the source: 0o755 for
    /// executables, 0o644 otherwise. Ownership defaults to `(0, 0)` with no
    /// symbolic names.
    pub fn add_file(
        &mut self,
        src: &Path,
        destfile: &str,
        mode: Option<u32>,
        ids: Option<(u64, u64)>,
        names: Option<(&str, &str)>,
    ) -> Result<()> {
        let dest = self.layer_dest(destfile);
        let meta = std::fs::metadata(src)
            .with_context(|| format!("failed to stat input file {}", src.display()))?;
        let mode = mode.unwrap_or(if meta.permissions().mode() & 0o111 != 0 {
            0o755
        } else {
            0o644
        });
        let mut header = file_header(mode, ids, names)?;
        header.set_size(meta.len());
        let file = File::open(src)
            .with_context(|| format!("failed to open input file {}", src.display()))?;
        self.builder
            .append_data(&mut header, &dest, file)
            .with_context(|| format!("failed to append {} to layer", dest))
    }

    /// Add a zero-byte file to the layer as `destfile`.
    ///
    /// Unlike `add_file` the configured directory is NOT applied here; the
    /// historical CLI contract roots empty files at the layer root and
    /// changing that would reshuffle existing layer layouts.
    pub fn add_empty_file(
        &mut self,
        destfile: &str,
        mode: Option<u32>,
        ids: Option<(u64, u64)>,
        names: Option<(&str, &str)>,
    ) -> Result<()> {
        let dest = normalize_path(destfile.trim_start_matches('/'));
        let mut header = file_header(mode.unwrap_or(0o644), ids, names)?;
        header.set_size(0);
        self.builder
            .append_data(&mut header, &dest, io::empty())
            .with_context(|| format!("failed to append empty file {} to layer", dest))
    }

    /// Merge every member of the tar archive at `tar_path` into the layer.
    ///
    /// Member paths are rewritten under the configured directory. Numeric
    /// ownership is forced to `(0, 0)` and symbolic owner names are dropped,
    /// whatever the source archive carried. Entry types, modes, mtimes and
    /// link targets pass through unchanged.
    ///
    /// The archive is decompressed according to its file extension
    /// (`.gz`/`.tgz`, `.bz2`, `.xz`); anything else is read as plain tar.
    pub fn add_tar(&mut self, tar_path: &Path) -> Result<()> {
        let reader = open_tar_stream(tar_path)?;
        let mut archive = tar::Archive::new(reader);
        let entries = archive
            .entries()
            .with_context(|| format!("failed to read tar archive {}", tar_path.display()))?;
        for entry in entries {
            let mut entry = entry
                .with_context(|| format!("failed to read member of {}", tar_path.display()))?;
            let member_path = entry
                .path()
                .with_context(|| format!("invalid member path in {}", tar_path.display()))?
                .to_string_lossy()
                .into_owned();
            let dest = self.merge_dest(&member_path);

            let mut header = entry.header().clone();
            header.set_uid(0);
            header.set_gid(0);
            // v7 headers carry no owner-name fields to clear
            if header.as_ustar().is_some() || header.as_gnu().is_some() {
                header.set_username("").context("failed to clear owner name")?;
                header.set_groupname("").context("failed to clear group name")?;
            }

            match header.entry_type() {
                EntryType::Symlink | EntryType::Link => {
                    let target = entry
                        .link_name()
                        .with_context(|| format!("invalid link target in {}", tar_path.display()))?
                        .with_context(|| {
                            format!("link member {} has no target in {}", dest, tar_path.display())
                        })?
                        .into_owned();
                    self.builder
                        .append_link(&mut header, &dest, &target)
                        .with_context(|| format!("failed to merge link {}", dest))?;
                }
                _ => {
                    self.builder
                        .append_data(&mut header, &dest, &mut entry)
                        .with_context(|| format!("failed to merge member {}", dest))?;
                }
            }
        }
        Ok(())
    }

    /// In-layer destination for a merged tar member.
    fn merge_dest(&self, member: &str) -> String {
        let member = member.trim_start_matches("./").trim_start_matches('/');
        match &self.directory {
            Some(dir) if dir != "/" => {
                normalize_path(&format!("{}/{}", dir.trim_start_matches('/'), member))
            }
            _ => normalize_path(member),
        }
    }

    /// Add a symbolic link at `symlink` pointing to `target`.
    ///
    /// The link path is normalized with leading slashes stripped (tar entry
    /// paths are relative); the target is stored literally and is neither
    /// normalized nor checked for existence.
    pub fn add_link(&mut self, symlink: &str, target: &str) -> Result<()> {
        let dest = normalize_path(symlink.trim_start_matches('/'));
        let mut header = file_header(0o777, None, None)?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        self.builder
            .append_link(&mut header, &dest, target)
            .with_context(|| format!("failed to append symlink {} to layer", dest))
    }

    /// Write the tar trailer and flush everything to disk.
    ///
    /// Must be called once, after the last input; consuming `self` makes an
    /// interleaved or repeated close impossible.
    pub fn finish(self) -> Result<()> {
        let stream = self
            .builder
            .into_inner()
            .context("failed to finalize layer tar stream")?;
        stream.finish().context("failed to flush layer output")?;
        Ok(())
    }
}

/// Build a regular-file header with the shared metadata defaults applied.
fn file_header(
    mode: u32,
    ids: Option<(u64, u64)>,
    names: Option<(&str, &str)>,
) -> Result<Header> {
    let (uid, gid) = ids.unwrap_or((0, 0));
    let (uname, gname) = names.unwrap_or(("", ""));
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_mtime(0);
    header
        .set_username(uname)
        .with_context(|| format!("owner name {:?} does not fit a tar header", uname))?;
    header
        .set_groupname(gname)
        .with_context(|| format!("group name {:?} does not fit a tar header", gname))?;
    Ok(header)
}

/// Open a tar file for reading, decompressing according to its extension.
pub(crate) fn open_tar_stream(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open tar archive {}", path.display()))?;
    let reader = BufReader::new(file);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(if name.ends_with(".gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(reader))
    } else if name.ends_with(".bz2") {
        Box::new(BzDecoder::new(reader))
    } else if name.ends_with(".xz") {
        Box::new(XzDecoder::new(reader))
    } else {
        Box::new(reader)
    })
}

/// Lexically normalize an archive-relative path: collapse duplicate slashes,
/// resolve `.` and `..` segments. Parent segments that would escape the
/// archive root are dropped.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
