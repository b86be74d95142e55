#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io::prelude::*;
use std::process::ExitCode;

use anyhow::{Context, Result};
use env_logger::Builder;
use log::{Level, LevelFilter};
use marrow_core::prelude::*;
use marrow_engine::prelude::*;
use marrow_engine::tools;
use marrow_patch::prelude::*;
use owo_colors::OwoColorize;

mod menu;
use menu::Commands;

fn color_level(level: Level) -> String {
    match level {
        Level::Error => level.red().to_string(),
        Level::Warn => level.yellow().to_string(),
        Level::Info => level.green().to_string(),
        Level::Debug => level.blue().to_string(),
        Level::Trace => level.purple().to_string(),
    }
}

const fn level_filter(verbose: usize) -> LevelFilter {
    match verbose {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        //default to off
        _ => LevelFilter::Off,
    }
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Unable to read {path}"))
}

fn write_file(path: &str, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("Unable to write {path}"))
}

// On engine failure, report the status and exit with its code.
fn check_status(status: Status) -> Result<ExitCode> {
    if !status.is_success() {
        log::error!("Operation failed with status {status:?}.");
        return Ok(ExitCode::from(status.code()));
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    //Parse command line input
    let args: menu::Marrow = argp::parse_args_or_exit(argp::DEFAULT);

    // Build up a logger with custom formatting and set it to the verbosity
    // from the command line args
    if args.verbose != 0 {
        Builder::new()
            .format(|buf, record| {
                writeln!(buf, "{} {}", color_level(record.level()), record.args())
            })
            .filter(None, level_filter(args.verbose))
            .init();
    }

    match args.nested {
        Commands::Gen(params) => {
            let old_image = read_file(&params.old_file)?;
            let new_image = read_file(&params.new_file)?;
            let mut patch_writer = EnsemblePatchWriter::new(&old_image, &new_image);
            let status = if params.raw {
                generate_buffer_raw(&old_image, &new_image, &mut patch_writer)
            } else if let Some(impose) = &params.impose {
                generate_buffer_imposed(&old_image, &new_image, impose, &mut patch_writer)
            } else {
                generate_buffer(&old_image, &new_image, &mut patch_writer)
            };
            if !status.is_success() {
                return check_status(status);
            }
            let patch_bytes = patch_writer.to_bytes()?;
            log::info!("Writing file {}", params.patch_file);
            write_file(&params.patch_file, &patch_bytes)?;
            check_status(status)
        }
        Commands::Apply(params) => {
            let old_image = read_file(&params.old_file)?;
            let patch_bytes = read_file(&params.patch_file)?;
            let patch = match EnsemblePatchReader::from_bytes(&patch_bytes) {
                Ok(patch) => patch,
                Err(error) => {
                    log::error!("Invalid patch: {error}");
                    return Ok(ExitCode::from(Status::PatchReadError.code()));
                }
            };
            let mut new_image = vec![0u8; patch.header().new_size.get() as usize];
            let status = apply_buffer(&old_image, &patch, &mut new_image);
            if !status.is_success() {
                return check_status(status);
            }
            log::info!("Writing file {}", params.new_file);
            write_file(&params.new_file, &new_image)?;
            check_status(status)
        }
        Commands::Read(params) => {
            let image = read_file(&params.input)?;
            let mut out = String::new();
            let status = tools::read_references(&image, params.dump, &mut out);
            print!("{out}");
            check_status(status)
        }
        Commands::Detect(params) => {
            let image = read_file(&params.input)?;
            let mut out = String::new();
            let mut sub_regions = Vec::new();
            let status = tools::detect_all(&image, &mut out, &mut sub_regions);
            print!("{out}");
            check_status(status)
        }
        Commands::Match(params) => {
            let old_image = read_file(&params.old_file)?;
            let new_image = read_file(&params.new_file)?;
            let mut out = String::new();
            let status = tools::match_all(
                &old_image,
                &new_image,
                params.impose.as_deref().unwrap_or(""),
                &mut out,
            );
            print!("{out}");
            check_status(status)
        }
        Commands::Crc32(params) => {
            let data = read_file(&params.input)?;
            println!("{:08X}", crc32(&data));
            Ok(ExitCode::SUCCESS)
        }
    }
}
