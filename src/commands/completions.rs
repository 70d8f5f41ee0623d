//! `weft completions`: emit a shell completion script to stdout.

use clap::Command;
use clap_complete::{generate, Shell};
use std::io;

pub fn execute(shell: Shell, cmd: &mut Command) {
    let name = cmd.get_name().to_string();
    generate(shell, cmd, name, &mut io::stdout());
}
