use std::path::Path;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::event_capture::VaultEvent;

/// Watches the vault root recursively. The watcher must be kept alive for events to flow.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<VaultEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        match res {
            Ok(event) => {
                for mapped in map_event(event) {
                    let _ = tx.send(mapped);
                }
            }
            Err(err) => tracing::warn!(error = %err, "vault watcher error"),
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(event: Event) -> Vec<VaultEvent> {
    let mut paths = event.paths;
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths.into_iter().map(VaultEvent::Delete).collect(),
            RenameMode::To => paths.into_iter().map(VaultEvent::Create).collect(),
            _ if paths.len() >= 2 => {
                let to = paths.swap_remove(1);
                let from = paths.swap_remove(0);
                vec![VaultEvent::Rename { from, to }]
            }
            // Single-path renames do not say which side they are; the capture stage
            // checks whether the path still exists.
            _ => paths.into_iter().map(VaultEvent::Modify).collect(),
        },
        EventKind::Create(_) => paths.into_iter().map(VaultEvent::Create).collect(),
        EventKind::Modify(_) => paths.into_iter().map(VaultEvent::Modify).collect(),
        EventKind::Remove(_) => paths.into_iter().map(VaultEvent::Delete).collect(),
        _ => Vec::new(),
    }
}
