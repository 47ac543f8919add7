//! Smoke test: initialize the process-wide file system, print the platform
//! directories and shut down again.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use physfs_kit::{SaneConfig, global};

#[derive(Parser)]
#[command(name = "physfs-smoke")]
#[command(about = "Prints the directories physfs-kit finds on this machine.")]
struct CommandLine {
    /// Executable path used to find the base dir (defaults to this program's argv[0])
    argv0: Option<String>,
    /// Organization part of the pref dir
    #[arg(long, default_value = "icculus.org")]
    org: String,
    /// Application part of the pref dir
    #[arg(long, default_value = "physfs-smoke")]
    app: String,
    /// Also print the library version and the supported archive types
    #[arg(long)]
    archivers: bool,
    /// Apply the sane config for --org/--app and print the resulting write dir and search path
    #[arg(long)]
    sane_config: bool,
    /// Archive extension the sane config mounts automatically
    #[arg(long, requires = "sane_config")]
    archive_ext: Option<String>,
    /// Let the sane config mount CD-ROMs
    #[arg(long, requires = "sane_config")]
    cdroms: bool,
    /// Let the sane config put found archives first
    #[arg(long, requires = "sane_config")]
    archives_first: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = CommandLine::parse();
    let argv0 = match args.argv0 {
        Some(argv0) => argv0,
        None => std::env::args().next().unwrap_or_default(),
    };

    println!("testing physfs-kit bindings...");
    println!("init...");
    global::init(&argv0)?;

    if args.archivers {
        output_versions();
        output_archivers()?;
    }

    println!("user dir: {}", global::user_dir()?);
    println!("base dir: {}", global::base_dir()?);
    println!("pref dir: {}", global::pref_dir(&args.org, &args.app)?);

    if args.sane_config {
        let config = SaneConfig {
            archive_ext: args.archive_ext.clone(),
            include_cdroms: args.cdroms,
            archives_first: args.archives_first,
            ..SaneConfig::new(&args.org, &args.app)
        };
        output_sane_config(&config)?;
    }

    println!("deinit...");
    global::deinit()?;
    println!("done!");
    Ok(())
}

fn output_sane_config(config: &SaneConfig) -> Result<()> {
    let (write_dir, search_path) = global::with_vfs(|vfs| {
        vfs.set_sane_config(config)?;
        Ok((vfs.write_dir().unwrap_or_default().to_string(), vfs.search_path()))
    })?;
    println!("write dir: {write_dir}");
    println!("search path:");
    for name in search_path {
        println!(" * {name}");
    }
    Ok(())
}

fn output_versions() {
    let linked = physfs_kit::linked_version();
    println!(
        "physfs-smoke version {}.\n Compiled against physfs-kit version {},\n and linked against {}.\n",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_VERSION"),
        linked
    );
}

fn output_archivers() -> Result<()> {
    let types = global::with_vfs(|vfs| Ok(vfs.supported_archive_types()))?;
    println!("Supported archive types:");
    if types.is_empty() {
        println!(" * Apparently, NONE!");
    }
    for info in types {
        println!(
            " * {}: {}\n    Written by {}.\n    {} symbolic links.",
            info.extension,
            info.description,
            info.author,
            if info.supports_symlinks { "Supports" } else { "Does not support" }
        );
    }
    Ok(())
}
