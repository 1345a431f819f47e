//! Entry point for the elfload loader.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Install the `tracing` subscriber.
//! 3. Pick the function and arguments, falling back to the defaults for well-known files.
//! 4. Load the image with the `X86_64` backend, resolve the function and call it.
//!
//! Error handling is done via `anyhow`; any failure exits with a nonzero status.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use elfload::arch::x86_64::X86_64;
use elfload::config::{default_entry_point, Config};
use elfload::loader::Loader;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let default = default_entry_point(&config.path);
    let function = match (&config.function, default) {
        (Some(function), _) => function.clone(),
        (None, Some(entry)) => entry.function.to_string(),
        (None, None) => anyhow::bail!(
            "no default function for '{}'. Pass a function name explicitly.",
            config.path.display()
        ),
    };
    let args = match default {
        Some(entry) if config.args.is_empty() && entry.function == function => entry.args.to_vec(),
        _ => config.args.clone(),
    };

    let elf = Loader::with_options(X86_64, config.load_options())
        .load(&config.path)
        .with_context(|| format!("failed to load {}", config.path.display()))?;
    let symbol = elf.resolve(&function)?;

    // SAFETY: the user vouches for the image and for `function` taking
    // `args.len()` integers and returning an integer.
    let ret = unsafe { symbol.call(&args)? };

    println!("{function}:{ret}");
    Ok(())
}
