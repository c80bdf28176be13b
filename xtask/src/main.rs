use std::env;

use clap_complete::Shell;
use spotify_skip_tracker::{BIN_NAME, program_arguments};

type DynError = Box<dyn std::error::Error>;

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{}", e);
        std::process::exit(-1);
    }
}

fn try_main() -> Result<(), DynError> {
    let task = env::args().nth(1);
    match task.as_deref() {
        Some("generate-manpage") => generate_manpage()?,
        Some("generate-completions") => generate_completions()?,
        _ => print_help(),
    }
    Ok(())
}

fn print_help() {
    eprintln!(
        "Tasks:
generate-manpage            Generate the man page.
generate-completions        Generate shell completion scripts for bash/zsh/fish.
"
    )
}

fn generate_manpage() -> Result<(), DynError> {
    let out_dir = std::path::PathBuf::new();
    let cmd = program_arguments();

    let man = clap_mangen::Man::new(cmd);
    let mut buffer: Vec<u8> = Default::default();
    man.render(&mut buffer)?;

    std::fs::write(out_dir.join(format!("{BIN_NAME}.1")), buffer)?;

    Ok(())
}

fn generate_completions() -> Result<(), DynError> {
    let out_dir = std::path::PathBuf::new();
    let mut cmd = program_arguments();

    for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
        clap_complete::generate_to(shell, &mut cmd, BIN_NAME, &out_dir)?;
    }

    Ok(())
}
