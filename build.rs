//! Renders the `amqpframe(1)` man page from the CLI definition.

use std::{fs, path::Path};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli.rs"]
#[allow(dead_code, reason = "only the clap definition is needed here")]
mod cli;

const MAN_DIR: &str = "target/generated-man";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");

    let command = cli::Cli::command();
    let page = Path::new(MAN_DIR).join(format!("{}.1", command.get_name()));
    let mut roff = Vec::new();
    Man::new(command).render(&mut roff)?;

    fs::create_dir_all(MAN_DIR)?;
    fs::write(page, roff)?;
    Ok(())
}
