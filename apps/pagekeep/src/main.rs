//! `pagekeep`: saves a rendered page snapshot as one self-contained HTML file.

mod cli;
mod logging;
mod packager;
mod platform;
mod startup;

use std::process::ExitCode;

fn main() -> ExitCode {
    startup::run()
}
