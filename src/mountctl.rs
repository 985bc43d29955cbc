//! Mountpoint lifecycle helper.
//!
//! `query` describes the mount state of a path, `umount` attempts a
//! graceful unmount, and `forceunmount` terminates every process still
//! holding the mountpoint (by working directory or open file) before
//! retrying.
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sysinfo::{Pid, Process, Signal, System};
use tracing::{info, warn};

/// One line of /proc/mounts.
struct MountInfo {
    name: String,
    mountpoint: String,
    fstype: String,
    options: String,
}

impl MountInfo {
    fn parse(line: &str) -> Option<MountInfo> {
        let mut parts = line.split_whitespace();
        Some(MountInfo {
            name: parts.next()?.to_string(),
            mountpoint: parts.next()?.to_string(),
            fstype: parts.next()?.to_string(),
            options: parts.next()?.to_string(),
        })
    }

    fn description(&self) -> String {
        format!(
            "{} ({}) is {} mount with options {}",
            self.mountpoint, self.name, self.fstype, self.options
        )
    }
}

/// Reject relative paths and plain files before doing anything.
fn validate(mountpoint: &str) -> Result<&Path> {
    let path = Path::new(mountpoint);
    if !path.is_absolute() {
        bail!("{mountpoint} must be absolute");
    }
    if path.is_file() {
        bail!("{mountpoint} is a file, not a directory");
    }
    Ok(path)
}

/// The /proc/mounts entry for `mountpoint`, if mounted.
fn find_mount(mountpoint: &str) -> Result<Option<MountInfo>> {
    let mounts = fs::read_to_string("/proc/mounts").context("reading /proc/mounts")?;
    let mut matching: Vec<MountInfo> = mounts
        .lines()
        .filter_map(MountInfo::parse)
        .filter(|m| m.mountpoint == mountpoint)
        .collect();
    if matching.len() > 1 {
        bail!("duplicate mounts at {mountpoint}");
    }
    Ok(matching.pop())
}

/// Check a mountpoint and print its description.
pub fn query(mountpoint: &str) -> Result<()> {
    let path = validate(mountpoint)?;
    if !path.exists() {
        println!("{mountpoint} does not exist");
        return Ok(());
    }
    if !path.is_dir() {
        println!("{mountpoint} is not a directory");
        return Ok(());
    }
    match find_mount(mountpoint)? {
        Some(info) => println!("{}", info.description()),
        None => println!("{mountpoint} is an unmounted directory"),
    }
    Ok(())
}

/// Attempt an unmount. Returns the umount error text on failure; `None`
/// when nothing is mounted there or the unmount succeeded.
fn try_umount(mountpoint: &str) -> Result<Option<String>> {
    if find_mount(mountpoint)?.is_none() {
        return Ok(None);
    }
    let output = Command::new("umount")
        .arg(mountpoint)
        .output()
        .context("failed to run umount")?;
    if output.status.success() {
        Ok(None)
    } else {
        Ok(Some(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Try to unmount the directory gracefully.
pub fn umount(mountpoint: &str) -> Result<()> {
    validate(mountpoint)?;
    match try_umount(mountpoint)? {
        None => Ok(()),
        Some(err) => bail!("{err}"),
    }
}

/// Forcefully unmount by killing the processes using the mountpoint.
pub fn forceunmount(mountpoint: &str) -> Result<()> {
    validate(mountpoint)?;
    let err = match try_umount(mountpoint)? {
        None => return Ok(()),
        Some(err) => err,
    };
    if !err.contains("target is busy") {
        warn!("{err}");
        return Ok(());
    }

    kill_users(mountpoint);
    match try_umount(mountpoint)? {
        None => Ok(()),
        Some(_) => bail!("unable to umount {mountpoint}"),
    }
}

/// Terminate every process whose working directory or open files lie
/// beneath the mountpoint; survivors of a brief grace period are killed.
fn kill_users(mountpoint: &str) {
    let mut system = System::new_all();
    let users: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, process)| uses_mountpoint(**pid, process, mountpoint))
        .map(|(pid, _)| *pid)
        .collect();
    if users.is_empty() {
        return;
    }

    for pid in &users {
        if let Some(process) = system.process(*pid) {
            info!(pid = pid.as_u32(), name = process.name(), "terminating");
            process.kill_with(Signal::Term);
        }
    }

    thread::sleep(Duration::from_millis(500));
    system.refresh_processes();
    for pid in &users {
        if let Some(process) = system.process(*pid) {
            warn!(pid = pid.as_u32(), "escalating to kill");
            process.kill();
        }
    }
}

fn uses_mountpoint(pid: Pid, process: &Process, mountpoint: &str) -> bool {
    if process
        .cwd()
        .map_or(false, |cwd| cwd.starts_with(mountpoint))
    {
        return true;
    }
    open_files(pid)
        .iter()
        .any(|file| file.starts_with(mountpoint))
}

/// Paths currently open by a process, from /proc/<pid>/fd.
fn open_files(pid: Pid) -> Vec<PathBuf> {
    let fd_dir = PathBuf::from(format!("/proc/{}/fd", pid.as_u32()));
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(fd_dir) {
        for entry in entries.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                files.push(target);
            }
        }
    }
    files
}
