//! Keep the mountpoint out of the locate database.
//!
//! updatedb crawls mounted file-systems by default; letting it walk a
//! synthesized archive tree would pull every member through the decoder on
//! every scan. Rewrites the PRUNEPATHS value of updatedb.conf to include
//! the mountpoint, idempotently.
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Add `mountpoint` to PRUNEPATHS in the given configuration file.
///
/// A missing configuration file is not an error (the host simply has no
/// locate installation); a configuration without a PRUNEPATHS line is.
pub fn exclude(mountpoint: &str, config: &Path) -> Result<()> {
    if !config.is_file() {
        info!(config = %config.display(), "updatedb configuration not present");
        return Ok(());
    }

    let original = fs::read_to_string(config)
        .with_context(|| format!("reading {}", config.display()))?;
    let rewritten = rewrite(&original, mountpoint)?;
    if rewritten == original {
        return Ok(());
    }

    // Swap the file in whole so a concurrent updatedb never sees a torn
    // configuration.
    let tmp = config.with_extension("tmp");
    fs::write(&tmp, &rewritten).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, config)?;
    info!(config = %config.display(), mountpoint, "added to PRUNEPATHS");
    Ok(())
}

/// Append `mountpoint` to the quoted PRUNEPATHS value, preserving every
/// other line.
fn rewrite(contents: &str, mountpoint: &str) -> Result<String> {
    let mut lines = Vec::new();
    let mut found = false;

    for line in contents.lines() {
        if line.starts_with("PRUNEPATHS") {
            found = true;
            if !line.contains(mountpoint) {
                let parts: Vec<&str> = line.splitn(3, '"').collect();
                if parts.len() == 3 {
                    lines.push(format!("{}\"{} {}\"{}", parts[0], parts[1], mountpoint, parts[2]));
                    continue;
                }
                warn!(line, "PRUNEPATHS line did not split at quotes");
            }
        }
        lines.push(line.to_string());
    }

    if !found {
        bail!("PRUNEPATHS not found in configuration");
    }
    Ok(lines.join("\n") + "\n")
}
