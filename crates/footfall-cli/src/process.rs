//! PID-file bookkeeping and signalling for the daemon commands.

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

pub fn write_pid(path: &str) -> std::io::Result<()> {
    std::fs::write(path, std::process::id().to_string())
}

pub fn read_pid(path: &str) -> Result<i32> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading PID file {path}"))?;
    raw.trim()
        .parse::<i32>()
        .with_context(|| format!("PID file {path} does not contain a PID"))
}

pub fn stop(pid_file: &str) -> Result<()> {
    let pid = read_pid(pid_file)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("sending SIGTERM to {pid}"))?;
    println!("Sent SIGTERM to process {pid}");
    Ok(())
}

pub fn reload(pid_file: &str) -> Result<()> {
    let pid = read_pid(pid_file)?;
    kill(Pid::from_raw(pid), Signal::SIGHUP)
        .with_context(|| format!("sending SIGHUP to pid {pid}"))?;
    println!("Sent reload signal to pid {pid}");
    Ok(())
}

pub fn status(pid_file: &str) -> Result<()> {
    let pid = match read_pid(pid_file) {
        Ok(pid) => pid,
        Err(_) => {
            println!("Not running (no PID file at {pid_file})");
            return Ok(());
        }
    };

    // Signal 0 checks liveness without touching the process.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => println!("Running (PID {pid})"),
        Err(err) => println!("Not running (process {pid}: {err})"),
    }
    Ok(())
}
