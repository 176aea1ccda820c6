//! Dependency graph validation and readiness for session groups.
//!
//! Pure functions over a group's specs. The scheduler loop calls
//! [`settle`] on every pass and [`admissible`] to pick what to start.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;

use crate::models::session_group::{SessionGroup, SessionSpec, SpecStatus};
use crate::{AppError, Result};

/// Validate ids, references, and acyclicity of a full spec set.
///
/// # Errors
///
/// - `AppError::Validation` for blank or duplicate ids, or a `depends_on`
///   id that does not exist.
/// - `AppError::CircularDependency` with the full cycle path, starting and
///   ending on the same id, following `depends_on` edges.
pub fn validate(specs: &[SessionSpec]) -> Result<()> {
    let mut seen = HashSet::with_capacity(specs.len());
    for spec in specs {
        if spec.id.trim().is_empty() {
            return Err(AppError::Validation("spec id must not be empty".into()));
        }
        if !seen.insert(spec.id.as_str()) {
            return Err(AppError::Validation(format!("duplicate spec id: {}", spec.id)));
        }
    }

    for spec in specs {
        if let Some(missing) = spec.depends_on.iter().find(|dep| !seen.contains(dep.as_str())) {
            return Err(AppError::Validation(format!(
                "spec {} depends on unknown spec {missing}",
                spec.id
            )));
        }
    }

    match find_cycle(specs) {
        Some(cycle) => Err(AppError::CircularDependency { cycle }),
        None => Ok(()),
    }
}

/// First cycle found by depth-first search in insertion order.
#[must_use]
pub fn find_cycle(specs: &[SessionSpec]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id)?;
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| (*s).to_owned()).collect();
                cycle.push(id.to_owned());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        stack.push(id);
        for dep in edges.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(cycle) = visit(*dep, edges, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let edges: HashMap<&str, Vec<&str>> = specs
        .iter()
        .map(|spec| {
            (
                spec.id.as_str(),
                spec.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let mut marks = HashMap::new();
    let mut stack = Vec::new();

    specs
        .iter()
        .find_map(|spec| visit(&spec.id, &edges, &mut marks, &mut stack))
}

/// Cycle that an edge `spec_id -> depends_on` would close, if any.
///
/// The path starts at `spec_id`, crosses the new edge, and returns to
/// `spec_id` along existing edges.
#[must_use]
pub fn cycle_through_edge(
    specs: &[SessionSpec],
    spec_id: &str,
    depends_on: &str,
) -> Option<Vec<String>> {
    if spec_id == depends_on {
        return Some(vec![spec_id.to_owned(), spec_id.to_owned()]);
    }

    let edges: HashMap<&str, &SessionSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut parents: HashMap<&str, &str> = HashMap::new();
    let mut queue = VecDeque::from([depends_on]);
    let mut visited = HashSet::from([depends_on]);

    while let Some(current) = queue.pop_front() {
        let Some(spec) = edges.get(current) else {
            continue;
        };
        for dep in &spec.depends_on {
            if dep == spec_id {
                let mut path = vec![spec_id.to_owned()];
                let mut back = vec![current];
                let mut cursor = current;
                while let Some(&parent) = parents.get(cursor) {
                    back.push(parent);
                    cursor = parent;
                }
                path.extend(back.into_iter().rev().map(str::to_owned));
                path.push(spec_id.to_owned());
                return Some(path);
            }
            if visited.insert(dep.as_str()) {
                parents.insert(dep.as_str(), current);
                queue.push_back(dep.as_str());
            }
        }
    }
    None
}

/// Recompute readiness and propagate skips to a fixpoint.
///
/// A waiting spec with a `failed` or `skipped` dependency becomes `skipped`
/// (transitively, within one call). A `pending` spec whose dependencies are
/// all `completed` becomes `ready`; a `ready` spec that gained an unfinished
/// dependency returns to `pending`. Returns the ids newly skipped.
pub fn settle(group: &mut SessionGroup) -> Vec<String> {
    let mut skipped = Vec::new();
    loop {
        let statuses: HashMap<String, SpecStatus> = group
            .specs
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect();
        let mut changed = false;

        for spec in &mut group.specs {
            if !matches!(spec.status, SpecStatus::Pending | SpecStatus::Ready) {
                continue;
            }
            let blocker = spec.depends_on.iter().find_map(|dep| match statuses.get(dep) {
                Some(status @ (SpecStatus::Failed | SpecStatus::Skipped)) => Some((dep, *status)),
                _ => None,
            });
            if let Some((dep, status)) = blocker {
                spec.status = SpecStatus::Skipped;
                spec.error = Some(format!("dependency {dep} {status}"));
                spec.completed_at = Some(Utc::now());
                skipped.push(spec.id.clone());
                changed = true;
                continue;
            }

            let deps_done = spec
                .depends_on
                .iter()
                .all(|dep| statuses.get(dep) == Some(&SpecStatus::Completed));
            let next = if deps_done {
                SpecStatus::Ready
            } else {
                SpecStatus::Pending
            };
            if spec.status != next {
                spec.status = next;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
    if !skipped.is_empty() {
        group.touch();
    }
    skipped
}

/// Indices of `ready` specs to admit now, in insertion order, limited to
/// the free slots under `max_concurrent`.
#[must_use]
pub fn admissible(group: &SessionGroup) -> Vec<usize> {
    let cap = usize::try_from(group.max_concurrent).unwrap_or(usize::MAX);
    let free = cap.saturating_sub(group.running_count());
    group
        .specs
        .iter()
        .enumerate()
        .filter(|(_, spec)| spec.status == SpecStatus::Ready)
        .map(|(index, _)| index)
        .take(free)
        .collect()
}
