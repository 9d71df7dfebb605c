//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// buildenv - Copy-on-write build environments
///
/// Inspects and cleans up the image pool and scratch volumes shared by
/// package builders.
#[derive(Parser, Debug)]
#[command(name = "buildenv")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "BUILDENV_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and manage build environment images
    Image(ImageArgs),

    /// Inspect and remove scratch spaces
    Scratch(ScratchArgs),

    /// Show or initialise configuration
    Config(ConfigArgs),
}

/// Arguments for the image command
#[derive(Parser, Debug)]
pub struct ImageArgs {
    #[command(subcommand)]
    pub action: ImageAction,
}

/// Image subcommands
#[derive(Subcommand, Debug)]
pub enum ImageAction {
    /// List all images
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Find the published image closest to a set of requirements
    Find {
        /// Requirements as `name:arch [op version[, op version...]]`
        #[arg(required = true)]
        requirements: Vec<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// List the packages installed in an image
    Packages {
        /// Image id
        id: String,
    },

    /// Freeze an image and make it available for cloning
    Publish {
        /// Image id
        id: String,
    },

    /// Withdraw an image from cloning
    Unpublish {
        /// Image id
        id: String,
    },

    /// Delete an image
    Delete {
        /// Image id
        id: String,
    },
}

/// Arguments for the scratch command
#[derive(Parser, Debug)]
pub struct ScratchArgs {
    #[command(subcommand)]
    pub action: ScratchAction,
}

/// Scratch subcommands
#[derive(Subcommand, Debug)]
pub enum ScratchAction {
    /// List scratch volumes
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// List the snapshots of a scratch space
    Snapshots {
        /// Scratch space name
        name: String,
    },

    /// Delete a scratch space and all of its snapshots
    Delete {
        /// Scratch space name
        name: String,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_image_list() {
        let cli = Cli::parse_from(["buildenv", "image", "list", "--format", "json"]);
        match cli.command {
            Commands::Image(ImageArgs {
                action: ImageAction::List { format },
            }) => assert!(matches!(format, OutputFormat::Json)),
            _ => panic!("expected image list"),
        }
    }

    #[test]
    fn cli_parses_image_find() {
        let cli = Cli::parse_from(["buildenv", "image", "find", "gcc:amd64 >= 12", "make:amd64"]);
        match cli.command {
            Commands::Image(ImageArgs {
                action: ImageAction::Find { requirements, .. },
            }) => assert_eq!(requirements, vec!["gcc:amd64 >= 12", "make:amd64"]),
            _ => panic!("expected image find"),
        }
    }

    #[test]
    fn cli_find_requires_requirements() {
        assert!(Cli::try_parse_from(["buildenv", "image", "find"]).is_err());
    }

    #[test]
    fn cli_parses_scratch_delete() {
        let cli = Cli::parse_from(["buildenv", "scratch", "delete", "build-42"]);
        match cli.command {
            Commands::Scratch(ScratchArgs {
                action: ScratchAction::Delete { name },
            }) => assert_eq!(name, "build-42"),
            _ => panic!("expected scratch delete"),
        }
    }

    #[test]
    fn cli_parses_config_without_action() {
        let cli = Cli::parse_from(["buildenv", "config"]);
        match cli.command {
            Commands::Config(args) => assert!(args.action.is_none()),
            _ => panic!("expected config"),
        }
    }

    #[test]
    fn cli_parses_config_init() {
        let cli = Cli::parse_from(["buildenv", "config", "init", "--force"]);
        match cli.command {
            Commands::Config(ConfigArgs {
                action: Some(ConfigAction::Init { force }),
            }) => assert!(force),
            _ => panic!("expected config init"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["buildenv", "-vv", "-c", "/tmp/b.toml", "config", "path"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/b.toml")));
    }
}
