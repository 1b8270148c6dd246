// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! `usvfs`: a small diagnostic binary for exercising a virtual-mapping file
//! without a hooked host process - load it, print the resulting tree, or
//! ask what a given path would reroute to.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use usvfs_core::context::Parameters;
use usvfs_core::path::CwdResolver;
use usvfs_core::tree::{NodeData, NodeHandle};
use usvfs_core::{reroute, reroute_new, Context};

#[derive(Parser)]
#[command(name = "usvfs", about = "Inspect usvfs-rs virtual-mapping files")]
struct Cli {
    /// Path to a virtual-mapping file (mapdir/mapdircreate/mapfile directives)
    mapping_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply every directive and report which ones succeeded
    Link,
    /// Print the resulting virtual tree
    Tree,
    /// Show what a path would reroute to
    Reroute {
        path: String,
        /// Look the path up in the inverse (physical-to-virtual) table
        #[arg(long)]
        inverse: bool,
        /// Use reroute_new semantics (creates the parent directory chain)
        #[arg(long)]
        create: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let text = match std::fs::read_to_string(&cli.mapping_file) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("usvfs: cannot read {}: {err}", cli.mapping_file.display());
            return ExitCode::FAILURE;
        }
    };

    let ctx = match Context::create(Parameters {
        instance_name: "usvfs-cli".to_string(),
        ..Default::default()
    }) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("usvfs: failed to initialize: {err}");
            return ExitCode::FAILURE;
        }
    };

    let entries = match usvfs_core::mapping::parse(&text) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("usvfs: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut any_failed = false;
    for entry in &entries {
        for source in &entry.sources {
            let result = match entry.directive {
                "mapfile" => ctx.link_file(source, &entry.dest),
                "mapdir" => ctx
                    .link_directory_static(source, &entry.dest, usvfs_core::tree::LINKFLAG_RECURSIVE),
                "mapdircreate" => ctx.link_directory_static(
                    source,
                    &entry.dest,
                    usvfs_core::tree::LINKFLAG_RECURSIVE | usvfs_core::tree::LINKFLAG_CREATETARGET,
                ),
                other => unreachable!("unhandled directive {other}"),
            };
            if matches!(cli.command, Command::Link) {
                match &result {
                    Ok(_) => println!("ok    {} {source} -> {}", entry.directive, entry.dest),
                    Err(err) => println!("fail  {} {source} -> {}: {err}", entry.directive, entry.dest),
                }
            }
            if result.is_err() {
                any_failed = true;
            }
        }
    }

    match cli.command {
        Command::Link => {}
        Command::Tree => print_tree(&ctx.tables.main, ctx.tables.main.root(), 0),
        Command::Reroute { path, inverse, create } => {
            let resolver = CwdResolver;
            let tree = ctx.tables.select(inverse);
            if create {
                match reroute_new(tree, &path, &resolver) {
                    Ok(result) => print_reroute(&result),
                    Err(err) => {
                        eprintln!("usvfs: {err}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_reroute(&reroute(tree, &path, &resolver));
            }
        }
    }

    if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_reroute(result: &usvfs_core::Reroute) {
    if result.was_rerouted {
        println!("{} -> {}", result.original, result.result);
    } else {
        println!("{} (not rerouted)", result.original);
    }
}

fn print_tree(tree: &usvfs_core::Tree, handle: NodeHandle, depth: usize) {
    let data: NodeData = tree.data(handle);
    let indent = "  ".repeat(depth);
    let label = if data.name.is_empty() { "<root>" } else { &data.name };
    match &data.link_target {
        Some(target) => println!("{indent}{label} -> {target}"),
        None => println!("{indent}{label}{}", if data.is_directory { "/" } else { "" }),
    }
    for (child, _) in tree.child_nodes(handle) {
        print_tree(tree, child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_link_subcommand() {
        let cli = Cli::parse_from(["usvfs", "mapping.txt", "link"]);
        assert!(matches!(cli.command, Command::Link));
    }

    #[test]
    fn cli_parses_reroute_with_flags() {
        let cli = Cli::parse_from(["usvfs", "mapping.txt", "reroute", "--inverse", "--create", r"C:\x"]);
        match cli.command {
            Command::Reroute { path, inverse, create } => {
                assert_eq!(path, r"C:\x");
                assert!(inverse);
                assert!(create);
            }
            _ => panic!("expected Reroute"),
        }
    }
}
