//! Wrapper around the external binary delta tool.
//!
//! Deltas between successive versions of a rootfs are produced by an
//! xdelta3-compatible encoder. The tool is a black box: this module only
//! guarantees that the child process dies when the run is cancelled and
//! that a partial output file never survives a failure.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cancel::Cancellation;

/// Name of the delta encoder binary.
pub const DELTA_COMMAND: &str = "xdelta3";

/// Poll interval while waiting for the encoder to exit.
const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Check whether the delta encoder is available on the host.
pub fn delta_tool_available() -> bool {
    Command::new(DELTA_COMMAND)
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Generate a compressed delta from `source` to `target` at `output`.
///
/// Runs `xdelta3 -e -9 -s <source> <target> <output>`:
/// `-e` encode, `-9` maximum compression, `-s` delta source.
/// On failure or cancellation the partial output file is removed.
pub fn generate_delta(
    cancel: &Cancellation,
    source: &Path,
    target: &Path,
    output: &Path,
) -> Result<()> {
    run_delta_tool(cancel, DELTA_COMMAND, source, target, output)
}

fn run_delta_tool(
    cancel: &Cancellation,
    program: &str,
    source: &Path,
    target: &Path,
    output: &Path,
) -> Result<()> {
    let mut child = Command::new(program)
        .args(["-e", "-9", "-s"])
        .arg(source)
        .arg(target)
        .arg(output)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;

    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            let _ = fs::remove_file(output);
            bail!("Delta generation cancelled");
        }

        match child
            .try_wait()
            .with_context(|| format!("Failed to wait for {program}"))?
        {
            Some(status) => break status,
            None => thread::sleep(WAIT_INTERVAL),
        }
    };

    if !status.success() {
        let _ = fs::remove_file(output);
        bail!("{program} exited with {status}");
    }

    Ok(())
}
