//! Command-line surface and driver.
//!
//! Translates the flag vocabulary (repeated `--file in=dest` pairs, per-file
//! mode/owner override maps, `--link sym:target` specs) into calls on the
//! layer engine. All flag-shape validation happens up front, before any
//! archive I/O begins.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::layer::{add_deb, Compression, LayerWriter};

#[derive(Parser)]
#[command(name = "layertar")]
#[command(about = "Assemble a container layer tarball from files, tars, debs and symlinks")]
pub struct Args {
    /// The output file, mandatory
    #[arg(long)]
    pub output: PathBuf,

    /// A file to add to the layer, as input=dest
    #[arg(long = "file")]
    pub files: Vec<String>,

    /// An empty file to add to the layer
    #[arg(long = "empty_file")]
    pub empty_files: Vec<String>,

    /// Force the mode on the added files (in octal)
    #[arg(long)]
    pub mode: Option<String>,

    /// A tar file to merge into the layer
    #[arg(long = "tar")]
    pub tars: Vec<PathBuf>,

    /// A Debian package to add to the layer
    #[arg(long = "deb")]
    pub debs: Vec<PathBuf>,

    /// A symlink to add inside the layer, as linkpath:target
    #[arg(long = "link")]
    pub links: Vec<String>,

    /// Directory in which to store the files inside the layer
    #[arg(long)]
    pub directory: Option<String>,

    /// Compression (`gz` or `bz2`), default is none
    #[arg(long)]
    pub compression: Option<String>,

    /// Specific mode to apply to a specific file, as path/to/file=mode
    #[arg(long = "modes")]
    pub modes: Vec<String>,

    /// Specific owner ids to apply to a specific file, as path/to/file=uid.gid
    #[arg(long = "owners")]
    pub owners: Vec<String>,

    /// The numeric default owner of all files, as uid.gid
    #[arg(long, default_value = "0.0")]
    pub owner: String,

    /// The default owner name of all files, as user.group
    #[arg(long = "owner_name")]
    pub owner_name: Option<String>,

    /// Owner names of an individual file, as path/to/file=user.group
    #[arg(long = "owner_names")]
    pub owner_names: Vec<String>,
}

/// Replace every `@path` argument with the arguments read from that file,
/// one per line. Matches the historical flag-file convention used by build
/// systems that invoke this tool.
pub fn expand_arg_files(argv: Vec<String>) -> Result<Vec<String>> {
    let mut expanded = Vec::with_capacity(argv.len());
    for arg in argv {
        if let Some(path) = arg.strip_prefix('@') {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read argument file {}", path))?;
            expanded.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        } else {
            expanded.push(arg);
        }
    }
    Ok(expanded)
}

/// Default and per-file metadata overrides, keyed by destination path with
/// its leading slash stripped.
pub struct OwnerMaps {
    default_mode: Option<u32>,
    default_ids: (u64, u64),
    default_names: Option<(String, String)>,
    mode_map: HashMap<String, u32>,
    ids_map: HashMap<String, (u64, u64)>,
    names_map: HashMap<String, (String, String)>,
}

impl OwnerMaps {
    pub fn from_args(args: &Args) -> Result<Self> {
        let default_mode = args
            .mode
            .as_deref()
            .map(parse_octal_mode)
            .transpose()
            .context("invalid --mode value")?;
        let default_ids = parse_owner_ids(&args.owner)
            .with_context(|| format!("invalid --owner value {:?}", args.owner))?;
        let default_names = args.owner_name.as_deref().map(parse_owner_names).transpose()?;

        let mut mode_map = HashMap::new();
        for spec in &args.modes {
            let (path, mode) = split_file_spec(spec, "--modes")?;
            mode_map.insert(
                map_key(path),
                parse_octal_mode(mode)
                    .with_context(|| format!("invalid --modes value {:?}", spec))?,
            );
        }

        let mut ids_map = HashMap::new();
        for spec in &args.owners {
            let (path, owner) = split_file_spec(spec, "--owners")?;
            ids_map.insert(
                map_key(path),
                parse_owner_ids(owner)
                    .with_context(|| format!("invalid --owners value {:?}", spec))?,
            );
        }

        let mut names_map = HashMap::new();
        for spec in &args.owner_names {
            let (path, owner) = split_file_spec(spec, "--owner_names")?;
            names_map.insert(map_key(path), parse_owner_names(owner)?);
        }

        Ok(Self {
            default_mode,
            default_ids,
            default_names,
            mode_map,
            ids_map,
            names_map,
        })
    }

    pub fn mode_for(&self, dest: &str) -> Option<u32> {
        self.mode_map
            .get(&map_key(dest))
            .copied()
            .or(self.default_mode)
    }

    pub fn ids_for(&self, dest: &str) -> (u64, u64) {
        self.ids_map
            .get(&map_key(dest))
            .copied()
            .unwrap_or(self.default_ids)
    }

    pub fn names_for(&self, dest: &str) -> Option<(&str, &str)> {
        self.names_map
            .get(&map_key(dest))
            .or(self.default_names.as_ref())
            .map(|(u, g)| (u.as_str(), g.as_str()))
    }
}

/// Map keys match destinations regardless of a leading slash on either side.
fn map_key(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_string()
}

fn split_file_spec<'a>(spec: &'a str, flag: &str) -> Result<(&'a str, &'a str)> {
    spec.split_once('=')
        .with_context(|| format!("{} value {:?} must contain a = separator", flag, spec))
}

fn parse_octal_mode(mode: &str) -> Result<u32> {
    let digits = mode.strip_prefix("0o").unwrap_or(mode);
    u32::from_str_radix(digits, 8).with_context(|| format!("{:?} is not an octal mode", mode))
}

fn parse_owner_ids(owner: &str) -> Result<(u64, u64)> {
    let (uid, gid) = owner
        .split_once('.')
        .with_context(|| format!("owner {:?} must be uid.gid", owner))?;
    let uid = uid
        .parse()
        .with_context(|| format!("invalid uid in {:?}", owner))?;
    let gid = gid
        .parse()
        .with_context(|| format!("invalid gid in {:?}", owner))?;
    Ok((uid, gid))
}

fn parse_owner_names(owner: &str) -> Result<(String, String)> {
    let (user, group) = owner
        .split_once('.')
        .with_context(|| format!("owner name {:?} must be user.group", owner))?;
    Ok((user.to_string(), group.to_string()))
}

fn parse_link(link: &str) -> Result<(&str, &str)> {
    link.split_once(':')
        .with_context(|| format!("--link value {:?} should contain a : separator", link))
}

fn parse_file(file: &str) -> Result<(&str, &str)> {
    file.split_once('=')
        .with_context(|| format!("--file value {:?} must be input=dest", file))
}

/// Assemble the layer described by `args`.
pub fn run(args: &Args) -> Result<()> {
    let maps = OwnerMaps::from_args(args)?;
    let compression = Compression::parse(args.compression.as_deref().unwrap_or(""))?;

    // Validate input shapes before the output file is even created.
    let files = args
        .files
        .iter()
        .map(|f| parse_file(f))
        .collect::<Result<Vec<_>>>()?;
    let links = args
        .links
        .iter()
        .map(|l| parse_link(l))
        .collect::<Result<Vec<_>>>()?;

    let mut writer = LayerWriter::create(&args.output, args.directory.as_deref(), compression)?;

    for (input, dest) in files {
        writer.add_file(
            Path::new(input),
            dest,
            maps.mode_for(dest),
            Some(maps.ids_for(dest)),
            maps.names_for(dest),
        )?;
    }
    for dest in &args.empty_files {
        writer.add_empty_file(dest, None, None, None)?;
    }
    for tar in &args.tars {
        println!("Merging tar {}", tar.display());
        writer.add_tar(tar)?;
    }
    for deb in &args.debs {
        println!("Importing package {}", deb.display());
        add_deb(&mut writer, deb)?;
    }
    for (symlink, target) in links {
        writer.add_link(symlink, target)?;
    }

    writer.finish()?;
    println!("Wrote layer {}", args.output.display());
    Ok(())
}
