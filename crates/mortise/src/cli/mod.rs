//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr, eyre};
use rustix::thread::UnshareFlags;

use crate::idmap::{IdmapSupport, probe_idmapped_mounts};
use crate::mountinfo::{MountTable, ProcMountInfo};
use crate::options::Propagation;
use crate::setup::{MountSetup, setup_mounts};

/// Mortise - container mount setup
#[derive(Parser)]
#[command(name = "mortise")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Print the mount plan of a bundle as JSON
    Plan {
        /// Path to the OCI bundle
        #[arg(short, long)]
        bundle: PathBuf,

        /// Root filesystem (default: root.path of config.json)
        #[arg(long)]
        rootfs: Option<PathBuf>,
    },

    /// Perform the mounts of a bundle
    Mount {
        /// Path to the OCI bundle
        #[arg(short, long)]
        bundle: PathBuf,

        /// Root filesystem (default: root.path of config.json)
        #[arg(long)]
        rootfs: Option<PathBuf>,

        /// Mount inside a new private mount namespace
        #[arg(long)]
        unshare: bool,

        /// Print the resulting mounts under the rootfs
        #[arg(long)]
        print_mountinfo: bool,
    },

    /// Print the live mount table as JSON
    Mountinfo {
        /// Only print the mount that contains this path
        #[arg(long)]
        target: Option<PathBuf>,
    },

    /// Probe an optional kernel feature
    CheckFeature {
        /// Feature to probe
        #[arg(value_enum)]
        feature: Feature,

        /// Path the feature is probed on
        path: PathBuf,
    },
}

/// Probeable features.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Feature {
    /// Id-mapped bind mounts.
    IdmappedMounts,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns any planning, mounting or I/O error, with context.
    pub fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Plan { bundle, rootfs } => {
                let setup = load_setup(&bundle, rootfs)?;
                let plan = setup.plan().wrap_err("Failed to build mount plan")?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                Ok(ExitCode::SUCCESS)
            }

            Commands::Mount {
                bundle,
                rootfs,
                unshare,
                print_mountinfo,
            } => {
                let setup = load_setup(&bundle, rootfs)?;
                if unshare {
                    crate::namespace::unshare(UnshareFlags::NEWNS)
                        .wrap_err("Failed to unshare mount namespace")?;
                    crate::sys::set_propagation(Path::new("/"), Propagation::Rslave)
                        .wrap_err("Failed to make / a slave mount")?;
                }

                let report = setup_mounts(&setup).wrap_err("Mount setup failed")?;
                println!("{}", serde_json::to_string_pretty(&report)?);

                if print_mountinfo {
                    let rootfs = std::fs::canonicalize(setup.rootfs())?;
                    let records: Vec<_> = ProcMountInfo::default()
                        .records()?
                        .into_iter()
                        .filter(|r| r.target.starts_with(&rootfs))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
                Ok(ExitCode::SUCCESS)
            }

            Commands::Mountinfo { target } => {
                let table = ProcMountInfo::default();
                let json = match target {
                    Some(target) => serde_json::to_string_pretty(&table.enclosing(&target)?)?,
                    None => serde_json::to_string_pretty(&table.records()?)?,
                };
                println!("{json}");
                Ok(ExitCode::SUCCESS)
            }

            Commands::CheckFeature { feature, path } => {
                let support = match feature {
                    Feature::IdmappedMounts => probe_idmapped_mounts(&path),
                };
                println!("{support}");
                Ok(match support {
                    IdmapSupport::Supported => ExitCode::SUCCESS,
                    IdmapSupport::Unsupported => ExitCode::from(1),
                    IdmapSupport::Indeterminate => ExitCode::from(2),
                })
            }
        }
    }
}

fn load_setup(bundle: &Path, rootfs: Option<PathBuf>) -> Result<MountSetup> {
    let spec_path = bundle.join("config.json");
    if !spec_path.exists() {
        return Err(eyre!(
            "Bundle config.json not found at {}",
            spec_path.display()
        ));
    }
    let spec = mortise_oci::Spec::load(&spec_path)
        .wrap_err_with(|| format!("Failed to load {}", spec_path.display()))?;

    let rootfs = rootfs
        .or_else(|| spec.root.as_ref().map(|root| bundle.join(&root.path)))
        .ok_or_else(|| eyre!("No rootfs given and config.json has no root.path"))?;

    Ok(MountSetup::from_spec(&spec, rootfs, Some(bundle))?)
}
