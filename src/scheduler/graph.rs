//! Cross-video dependency graph checks.

use crate::error::{Result, VidwikiError};
use crate::task::VideoTask;
use std::collections::{HashMap, HashSet};

/// Reject `candidate` if its dependencies lead back to it.
///
/// `existing` is every task already stored. The stored graph is acyclic, so
/// any new cycle must pass through the candidate.
pub fn check_acyclic(candidate: &VideoTask, existing: &[VideoTask]) -> Result<()> {
    let mut edges: HashMap<&str, Vec<&str>> = existing
        .iter()
        .map(|task| {
            let deps = task.dependencies.iter().map(|d| d.video_id.as_str()).collect();
            (task.id.as_str(), deps)
        })
        .collect();
    edges.insert(
        candidate.id.as_str(),
        candidate.dependencies.iter().map(|d| d.video_id.as_str()).collect(),
    );

    if let Some(path) = find_path_back(&candidate.id, &edges) {
        return Err(VidwikiError::DependencyCycle(path.join(" -> ")));
    }
    Ok(())
}

/// Depth-first search for a path from `start` back to itself.
fn find_path_back<'a>(
    start: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
) -> Option<Vec<&'a str>> {
    let mut visited = HashSet::new();
    let mut stack: Vec<(&str, Vec<&str>)> = vec![(start, vec![start])];

    while let Some((node, path)) = stack.pop() {
        for &next in edges.get(node).map(Vec::as_slice).unwrap_or_default() {
            if next == start {
                let mut cycle = path.clone();
                cycle.push(start);
                return Some(cycle);
            }
            if visited.insert(next) {
                let mut extended = path.clone();
                extended.push(next);
                stack.push((next, extended));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::task;
    use crate::task::{Dependency, Priority, Stage};

    fn depends(id: &str, on: &[&str]) -> VideoTask {
        task(id, Priority::Normal).with_dependencies(
            on.iter().map(|d| Dependency::new(*d, Stage::Completed)).collect(),
        )
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = check_acyclic(&depends("a", &["a"]), &[]).unwrap_err();
        assert!(matches!(err, VidwikiError::DependencyCycle(path) if path == "a -> a"));
    }

    #[test]
    fn test_indirect_cycle_rejected() {
        let existing = vec![depends("b", &["c"]), depends("c", &["a"])];
        let err = check_acyclic(&depends("a", &["b"]), &existing).unwrap_err();
        assert!(matches!(err, VidwikiError::DependencyCycle(path) if path == "a -> b -> c -> a"));
    }

    #[test]
    fn test_diamond_is_fine() {
        let existing = vec![depends("b", &["d"]), depends("c", &["d"]), depends("d", &[])];
        assert!(check_acyclic(&depends("a", &["b", "c"]), &existing).is_ok());
        // Unknown dependencies are allowed; they may be enqueued later.
        assert!(check_acyclic(&depends("x", &["missing"]), &existing).is_ok());
    }
}
