/// Backend status persistence
///
/// One line per backend, `up` / `down` / `unused`, rewritten on every
/// transition and loaded at boot so a restarted proxy does not
/// resurrect a failed-over node. The rewrite goes through a temp file
/// and rename so readers never observe a half-written file.
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use super::{BackendDescriptor, NodeStatus};

fn status_word(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Up | NodeStatus::ConnectWait => "up",
        NodeStatus::Down | NodeStatus::Quarantined => "down",
    }
}

/// Load saved statuses. Entries beyond the configured node count are
/// ignored; `unused` lines yield None so the configured default wins.
pub fn load(path: &Path) -> io::Result<Vec<Option<NodeStatus>>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(|line| match line.trim() {
            "up" => Some(NodeStatus::ConnectWait),
            "down" => Some(NodeStatus::Down),
            _ => None,
        })
        .collect())
}

/// Atomically rewrite the status file
pub fn save(path: &Path, descriptors: &[BackendDescriptor]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        for desc in descriptors {
            writeln!(tmp, "{}", status_word(desc.status))?;
        }
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}
