//! Man page generator for flashit
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir | -]
//!
//! With `-` the page is written to stdout.

use clap::CommandFactory;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[path = "../cli.rs"]
#[allow(dead_code)]
mod cli;

#[path = "../exit.rs"]
#[allow(dead_code)]
mod exit;

const EXIT_STATUS: &[(i32, &str)] = &[
    (exit::SUCCESS, "Image flashed and verified."),
    (exit::GENERAL, "Usage or configuration error."),
    (exit::IMAGE, "Image unreadable, empty, too large or not matching its checksum."),
    (exit::DEVICE_UNAVAILABLE, "Port missing, or held by another session."),
    (exit::NOT_RESPONDING, "Bootloader did not answer after all attempts."),
    (exit::TRANSFER, "A block could not be written."),
    (exit::VERIFICATION, "Device checksum differs from the image."),
    (exit::CANCELLED, "Interrupted by the user."),
];

/// Render the complete page, with an EXIT STATUS section after the options
fn render() -> std::io::Result<Vec<u8>> {
    let man = clap_mangen::Man::new(cli::Cli::command());
    let mut buffer = Vec::new();
    man.render_title(&mut buffer)?;
    man.render_name_section(&mut buffer)?;
    man.render_synopsis_section(&mut buffer)?;
    man.render_description_section(&mut buffer)?;
    man.render_options_section(&mut buffer)?;

    writeln!(buffer, ".SH \"EXIT STATUS\"")?;
    for (code, meaning) in EXIT_STATUS {
        writeln!(buffer, ".TP\n\\fB{}\\fR\n{}", code, meaning)?;
    }

    man.render_version_section(&mut buffer)?;
    Ok(buffer)
}

fn main() -> std::io::Result<()> {
    let page = render()?;

    let target = std::env::args().nth(1).unwrap_or_else(|| "man".to_string());
    if target == "-" {
        return std::io::stdout().write_all(&page);
    }

    let output_dir = PathBuf::from(target);
    fs::create_dir_all(&output_dir)?;
    let output_path = output_dir.join("flashit.1");
    fs::write(&output_path, page)?;

    println!("Man page generated at: {}", output_path.display());
    println!("\nTo view the man page:");
    println!("  man -l {}", output_path.display());

    Ok(())
}
