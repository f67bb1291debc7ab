//! # cutethumb
//!
//! Thumbnailer child. Reads one source from stdin and either writes the
//! framed header + thumbnail to stdout and exits 0, or writes a known error
//! code and exits 100. Anything else is treated as an OS failure by the
//! parent. Logs go to stderr, which the parent captures.

use std::io::{self, Read, Write};
use std::process::ExitCode;

use anyhow::Context;
use domains::ThumbError;
use storage_adapters::thumbnailer::{child, process, ChildOptions};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn run() -> anyhow::Result<ExitCode> {
    let mut src = Vec::new();
    io::stdin().lock().read_to_end(&mut src).context("reading source")?;

    let mut out = io::stdout().lock();
    match child::process(&src, &ChildOptions::default()) {
        Ok((header, thumb)) => {
            let frame = process::frame_for(&header, thumb.as_deref()).context("encoding frame")?;
            out.write_all(&frame)?;
            out.flush()?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            write!(out, "{}", e.code())?;
            out.flush()?;
            Ok(ExitCode::from(ThumbError::EXIT_CODE as u8))
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("cutethumb failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
