//! Node identity resolution.

use std::path::Path;

use crate::collector::traits::FileSystem;

/// Downward-API files that may hold the node name, in lookup order.
pub const NODE_NAME_FILES: [&str; 2] = ["/etc/podinfo/nodename", "/etc/hostname-node"];

/// Picks the node name: explicit override, then a downward-API file, then
/// the hostname. Returns an empty string when nothing is known.
pub fn resolve_node_name<F: FileSystem + ?Sized>(
    fs: &F,
    explicit: Option<&str>,
    hostname: Option<String>,
) -> String {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    for file in NODE_NAME_FILES {
        if let Ok(content) = fs.read_to_string(Path::new(file)) {
            let name = content.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    hostname
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

/// [`resolve_node_name`] with the local hostname as last resort.
pub fn detect_node_name<F: FileSystem + ?Sized>(fs: &F, explicit: Option<&str>) -> String {
    resolve_node_name(fs, explicit, local_hostname())
}

fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
}
