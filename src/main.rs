use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use colored::Colorize;
use std::path::Path;

use fsextender::device::Context;
use fsextender::exec;
use fsextender::plan::{self, FILTER_LVM_ALREADY_PLACED};
use fsextender::runner::SystemRunner;
use fsextender::scan;
use fsextender::storage::StorageItem;

/// Exit code for usage and planning errors.
const EXIT_USAGE: i32 = 11;
/// Exit code when changes were applied but only take effect after reboot.
const EXIT_NEED_REBOOT: i32 = 128;

/// Grow a filesystem and all storage layers under it to the maximum size
#[derive(Parser, Debug)]
#[command(
    name = "fsextender",
    about = "Extend a filesystem and the partitions/LVM layers under it to use all free disk space",
    long_about = "Extend a filesystem and the partitions/LVM layers under it to use all free disk space.\n\n\
        The positional argument is an absolute path to a mount point, a block\n\
        device, or an LVM logical volume. Without --do the tool only prints the\n\
        plan; with --do it applies every step in dependency order."
)]
struct Cli {
    /// Print the embedded README and exit
    #[arg(long)]
    readme: bool,

    /// Comma-separated path patterns for devices the tool may touch
    #[arg(short, long, default_value = FILTER_LVM_ALREADY_PLACED)]
    filter: String,

    /// Apply the plan instead of only printing it
    #[arg(long = "do")]
    execute: bool,

    /// Mount point, block device, or LVM volume to extend
    path: Option<String>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
        }
    };

    if cli.readme {
        print!("{}", include_str!("../README.md"));
        return 0;
    }

    let Some(path) = cli.path.as_deref() else {
        eprintln!("{}", "One path argument is required, see --help.".red());
        return EXIT_USAGE;
    };
    if !Path::new(path).is_absolute() {
        eprintln!("{}", "The path must be absolute.".red());
        return EXIT_USAGE;
    }

    let runner = SystemRunner;
    let mut ctx = Context::new(&runner);

    let mut plan = match scan_and_plan(&mut ctx, path, &cli.filter) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("{} {}", "ERROR:".red().bold(), e);
            return EXIT_USAGE;
        }
    };

    exec::print_plan(&plan);
    if !cli.execute {
        return 0;
    }

    if exec::execute_plan(&ctx, &mut plan) {
        println!("{}", "NEED REBOOT AND START ME ONCE AGAIN.".yellow().bold());
        EXIT_NEED_REBOOT
    } else {
        println!("{}", "OK".green().bold());
        0
    }
}

fn scan_and_plan(ctx: &mut Context, path: &str, filter: &str) -> Result<Vec<StorageItem>> {
    let storage = scan::scan(ctx, path)?;
    plan::build_plan(storage, filter)
}
