//! Container tree operations.
//!
//! A page stores its containers as a flat list linked by `parent` and
//! `children`. Every operation here takes the current list by reference and
//! returns a brand new list; nothing is mutated in place, so downstream
//! equality checks on the collection stay meaningful.

use crate::{Container, Id};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("page has no root container")]
    MissingRoot,
    #[error("page has more than one root container: {0:?}")]
    MultipleRoots(Vec<Id>),
    #[error("container id '{0}' is used more than once")]
    DuplicateId(Id),
    #[error("unknown container '{0}'")]
    UnknownContainer(Id),
    #[error("container '{parent}' lists missing child '{child}'")]
    DanglingChild { parent: Id, child: Id },
    #[error("container '{child}' is listed by '{listed_by}' but its parent is {parent:?}")]
    ParentMismatch {
        child: Id,
        listed_by: Id,
        parent: Option<Id>,
    },
    #[error("container '{0}' is not reachable from the root")]
    Orphan(Id),
    #[error("the root container cannot be removed or moved")]
    RootIsFixed,
    #[error("cannot move '{0}' into its own subtree")]
    Cycle(Id),
}

/// Checks the tree invariants and returns the root id.
///
/// Exactly one container has no parent, every child id resolves, each child
/// points back at the container listing it, and every container is reachable
/// from the root.
pub fn validate_tree(containers: &[Container]) -> Result<Id, ModelError> {
    let mut by_id = HashMap::with_capacity(containers.len());
    for container in containers {
        if by_id.insert(&container.id, container).is_some() {
            return Err(ModelError::DuplicateId(container.id.clone()));
        }
    }

    let roots: Vec<&Id> = containers
        .iter()
        .filter(|container| container.is_root())
        .map(|container| &container.id)
        .collect();
    let root = match roots.as_slice() {
        [] => return Err(ModelError::MissingRoot),
        [root] => (*root).clone(),
        _ => return Err(ModelError::MultipleRoots(roots.into_iter().cloned().collect())),
    };

    for container in containers {
        for child in &container.children {
            let Some(child_container) = by_id.get(child) else {
                return Err(ModelError::DanglingChild {
                    parent: container.id.clone(),
                    child: child.clone(),
                });
            };
            if child_container.parent.as_ref() != Some(&container.id) {
                return Err(ModelError::ParentMismatch {
                    child: child.clone(),
                    listed_by: container.id.clone(),
                    parent: child_container.parent.clone(),
                });
            }
        }
    }

    let reachable: HashSet<Id> = walk_ids(containers, &root).into_iter().collect();
    if let Some(orphan) = containers
        .iter()
        .find(|container| !reachable.contains(&container.id))
    {
        return Err(ModelError::Orphan(orphan.id.clone()));
    }
    Ok(root)
}

pub fn root(containers: &[Container]) -> Option<&Container> {
    containers.iter().find(|container| container.is_root())
}

pub fn find<'a>(containers: &'a [Container], id: &Id) -> Option<&'a Container> {
    containers.iter().find(|container| &container.id == id)
}

/// Depth-first, pre-order traversal from the root following `children` order.
pub fn walk(containers: &[Container]) -> Vec<&Container> {
    let Some(root) = root(containers) else {
        return Vec::new();
    };
    walk_ids(containers, &root.id)
        .iter()
        .filter_map(|id| find(containers, id))
        .collect()
}

/// Ids of `id` and all of its descendants, pre-order.
pub fn subtree(containers: &[Container], id: &Id) -> Vec<Id> {
    walk_ids(containers, id)
}

fn walk_ids(containers: &[Container], start: &Id) -> Vec<Id> {
    let by_id: HashMap<&Id, &Container> = containers
        .iter()
        .map(|container| (&container.id, container))
        .collect();
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![start.clone()];
    while let Some(id) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let Some(container) = by_id.get(&id) else {
            continue;
        };
        order.push(id);
        for child in container.children.iter().rev() {
            stack.push(child.clone());
        }
    }
    order
}

/// Inserts `container` as a child of `parent` at `index` (clamped).
pub fn insert_container(
    containers: &[Container],
    mut container: Container,
    parent: &Id,
    index: usize,
) -> Result<Vec<Container>, ModelError> {
    if find(containers, &container.id).is_some() {
        return Err(ModelError::DuplicateId(container.id));
    }
    if find(containers, parent).is_none() {
        return Err(ModelError::UnknownContainer(parent.clone()));
    }
    container.parent = Some(parent.clone());
    let new_id = container.id.clone();
    let mut next: Vec<Container> = containers
        .iter()
        .map(|existing| {
            let mut existing = existing.clone();
            if &existing.id == parent {
                let index = index.min(existing.children.len());
                existing.children.insert(index, new_id.clone());
            }
            existing
        })
        .collect();
    next.push(container);
    Ok(next)
}

/// Removes a container together with its whole subtree.
pub fn remove_container(containers: &[Container], id: &Id) -> Result<Vec<Container>, ModelError> {
    let target = find(containers, id).ok_or_else(|| ModelError::UnknownContainer(id.clone()))?;
    if target.is_root() {
        return Err(ModelError::RootIsFixed);
    }
    let doomed: HashSet<Id> = subtree(containers, id).into_iter().collect();
    Ok(containers
        .iter()
        .filter(|container| !doomed.contains(&container.id))
        .map(|container| {
            let mut container = container.clone();
            container.children.retain(|child| child != id);
            container
        })
        .collect())
}

/// Moves a container (with its subtree) under `new_parent` at `index`.
///
/// `index` is interpreted against the new parent's children after the
/// container has been detached, so moving within the same parent works the
/// way a drop indicator suggests.
pub fn move_container(
    containers: &[Container],
    id: &Id,
    new_parent: &Id,
    index: usize,
) -> Result<Vec<Container>, ModelError> {
    let target = find(containers, id).ok_or_else(|| ModelError::UnknownContainer(id.clone()))?;
    if target.is_root() {
        return Err(ModelError::RootIsFixed);
    }
    if find(containers, new_parent).is_none() {
        return Err(ModelError::UnknownContainer(new_parent.clone()));
    }
    if subtree(containers, id).contains(new_parent) {
        return Err(ModelError::Cycle(id.clone()));
    }
    Ok(containers
        .iter()
        .map(|container| {
            let mut container = container.clone();
            container.children.retain(|child| child != id);
            if &container.id == new_parent {
                let index = index.min(container.children.len());
                container.children.insert(index, id.clone());
            }
            if &container.id == id {
                container.parent = Some(new_parent.clone());
            }
            container
        })
        .collect())
}

/// Replaces (or adds) one property formula.
pub fn update_property(
    containers: &[Container],
    id: &Id,
    name: &str,
    formula: &str,
) -> Result<Vec<Container>, ModelError> {
    find(containers, id).ok_or_else(|| ModelError::UnknownContainer(id.clone()))?;
    Ok(containers
        .iter()
        .map(|container| {
            let mut container = container.clone();
            if &container.id == id {
                container.properties.insert(
                    name.to_owned(),
                    crate::Property {
                        formula: formula.to_owned(),
                    },
                );
            }
            container
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<Container> {
        let mut root = Container::new("root", "Column");
        root.children = vec![Id::from("a"), Id::from("b")];
        let mut a = Container::new("a", "Row");
        a.parent = Some(Id::from("root"));
        a.children = vec![Id::from("a1")];
        let mut a1 = Container::new("a1", "Text");
        a1.parent = Some(Id::from("a"));
        let mut b = Container::new("b", "Button");
        b.parent = Some(Id::from("root"));
        vec![root, a, a1, b]
    }

    fn ids(containers: &[Container]) -> Vec<&str> {
        walk(containers).iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn validate_accepts_well_formed_tree() {
        assert_eq!(validate_tree(&page()), Ok(Id::from("root")));
    }

    #[test]
    fn validate_rejects_second_root() {
        let mut containers = page();
        containers.push(Container::new("stray", "Text"));
        assert!(matches!(
            validate_tree(&containers),
            Err(ModelError::MultipleRoots(_))
        ));
    }

    #[test]
    fn validate_rejects_dangling_child() {
        let mut containers = page();
        containers[0].children.push(Id::from("ghost"));
        assert_eq!(
            validate_tree(&containers),
            Err(ModelError::DanglingChild {
                parent: Id::from("root"),
                child: Id::from("ghost"),
            })
        );
    }

    #[test]
    fn walk_is_preorder_in_children_order() {
        assert_eq!(ids(&page()), vec!["root", "a", "a1", "b"]);
    }

    #[test]
    fn insert_clamps_index_and_leaves_input_untouched() {
        let before = page();
        let after = insert_container(&before, Container::new("c", "Text"), &Id::from("root"), 99)
            .unwrap();
        assert_eq!(before.len(), 4);
        assert_eq!(ids(&after), vec!["root", "a", "a1", "b", "c"]);
        assert_eq!(validate_tree(&after), Ok(Id::from("root")));
    }

    #[test]
    fn remove_drops_subtree() {
        let after = remove_container(&page(), &Id::from("a")).unwrap();
        assert_eq!(ids(&after), vec!["root", "b"]);
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn root_cannot_be_removed() {
        assert_eq!(
            remove_container(&page(), &Id::from("root")),
            Err(ModelError::RootIsFixed)
        );
    }

    #[test]
    fn move_reorders_within_parent() {
        let after = move_container(&page(), &Id::from("b"), &Id::from("root"), 0).unwrap();
        assert_eq!(ids(&after), vec!["root", "b", "a", "a1"]);
    }

    #[test]
    fn move_into_own_subtree_is_rejected() {
        assert_eq!(
            move_container(&page(), &Id::from("a"), &Id::from("a1"), 0),
            Err(ModelError::Cycle(Id::from("a")))
        );
    }

    #[test]
    fn update_property_replaces_formula() {
        let after =
            update_property(&page(), &Id::from("b"), "label", "module.exports = 'Go'").unwrap();
        let b = find(&after, &Id::from("b")).unwrap();
        assert_eq!(b.properties["label"].formula, "module.exports = 'Go'");
    }
}
