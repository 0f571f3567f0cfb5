//! Various utility functions

use std::io::Write;
use std::process::Command;

use colored::*;

use crate::error::Error;

/// Ask user for confirmation with the given message.
pub fn confirm(msg: String) -> Result<bool, Error> {
    let mut stdout = std::io::stdout();
    print!("{} ({}/{}): ", msg, "y".bold().green(), "N".bold().red());
    stdout.flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.to_lowercase() == "y\n")
}

/// Run the given command as root, by using sudo if necessary.
pub fn run_cmd_as_root<T: Into<String>>(cmd: T) -> Result<(), Error> {
    let mut cmd = cmd.into();
    if !nix::unistd::getuid().is_root() {
        cmd = format!("sudo {}", cmd);
    }

    log::debug!("$ {}", cmd);

    let chunks: Vec<&str> = cmd.split(' ').collect();
    let status = Command::new(chunks[0]).args(&chunks[1..]).status()?;

    if !status.success() {
        return Err(Error::Other("Failed to initialize CAN interface.".into()));
    }

    Ok(())
}
