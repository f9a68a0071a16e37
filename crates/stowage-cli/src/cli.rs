use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueHint};

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    help_template = "{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}",
    arg_required_else_help = true
)]
pub struct Args {
    /// Set output verbosity
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress outputs
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output as json
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Disable colors in output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Provide custom config file
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a documented default configuration file
    #[clap(name = "defconfig")]
    DefConfig,

    /// Print the resolved configuration paths
    Env,

    /// Publish a new package, or update one when a revision is given
    #[command(arg_required_else_help = true)]
    Publish {
        /// Package manifest (the JSON body `npm publish` sends)
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        manifest: PathBuf,

        /// Package name; defaults to the manifest's `name` field
        #[arg(required = false, long)]
        name: Option<String>,

        /// Current revision of the package, turns the publish into an update
        #[arg(required = false, long)]
        rev: Option<String>,
    },

    /// Add a version to an existing package
    #[command(arg_required_else_help = true)]
    #[clap(name = "add-version")]
    AddVersion {
        package: String,

        #[arg(value_name = "VERSION")]
        pkg_version: String,

        /// Version metadata JSON
        #[arg(value_hint = ValueHint::FilePath)]
        metadata: PathBuf,

        /// Dist-tag to point at the version
        #[arg(required = false, long, default_value = "latest")]
        tag: String,
    },

    /// Upload a tarball as a new attachment of a package
    #[command(arg_required_else_help = true)]
    Upload {
        package: String,

        #[arg(value_hint = ValueHint::FilePath)]
        tarball: PathBuf,

        /// Attachment name; defaults to the tarball's file name
        #[arg(required = false, long)]
        filename: Option<String>,
    },

    /// Remove an attachment that no version references
    #[command(arg_required_else_help = true)]
    #[clap(name = "rm-tarball")]
    RmTarball {
        package: String,

        filename: String,

        /// Current revision of the package
        rev: String,
    },

    /// Remove a package with all of its tarballs
    #[command(arg_required_else_help = true)]
    Unpublish { package: String },

    /// Print a package document
    #[command(arg_required_else_help = true)]
    Show { package: String },

    /// Clean up leftovers of interrupted writes
    Recover,
}
