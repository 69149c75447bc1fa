use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::Command;

const AGENT_FILE_NAME: &str = "libhotprobe_agent.so";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the JVMTI agent and the CLI with the same profile
    BuildAgent {
        #[arg(long)]
        release: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildAgent { release } => build_agent(release)?,
    }

    Ok(())
}

fn build_agent(release: bool) -> Result<()> {
    // The agent is not a default member, so plain `cargo build` skips it
    let mut cmd = Command::new("cargo");
    cmd.arg("build")
        .arg("--package")
        .arg("hotprobe-agent")
        .arg("--package")
        .arg("hotprobe");
    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        anyhow::bail!("Failed to build the agent");
    }

    let profile = if release { "release" } else { "debug" };
    let agent = target_dir()?.join(profile).join(AGENT_FILE_NAME);
    if !agent.is_file() {
        anyhow::bail!("{} was not produced", agent.display());
    }

    println!("✓ Agent built successfully");
    println!("  Library: {}", agent.display());
    println!("  Profile: {profile}");
    println!("  hotprobe attach finds it next to the hotprobe binary");

    Ok(())
}

fn target_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("CARGO_TARGET_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    let root = manifest.parent().context("xtask has no parent directory")?;
    Ok(root.join("target"))
}
