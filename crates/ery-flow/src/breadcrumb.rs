//! Per-hand breadcrumb history as an arena-backed doubly linked list.
//!
//! Deleting a stage definition removes its stages and their breadcrumbs.
//! [`plan_repair`] computes, from a snapshot taken before anything is removed,
//! how surviving breadcrumbs and hand pointers must be rewired; the resulting
//! [`RepairPlan`] is then applied in one step.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ery_types::{EryError, NotFoundKind, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::BreadcrumbType;
use crate::runtime::{HandId, Runtime, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreadcrumbId(pub u64);

impl fmt::Display for BreadcrumbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crumb#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBreadcrumb {
    pub id: BreadcrumbId,
    pub hand: HandId,
    pub stage: StageId,
    pub previous: Option<BreadcrumbId>,
    pub next: Option<BreadcrumbId>,
}

/// Owns every breadcrumb, keyed by id. Ids are allocated in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreadcrumbArena {
    crumbs: BTreeMap<BreadcrumbId, StageBreadcrumb>,
    next_id: u64,
}

impl BreadcrumbArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BreadcrumbId) -> Result<&StageBreadcrumb> {
        self.crumbs.get(&id).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Breadcrumb, format!("no breadcrumb {}", id))
        })
    }

    fn get_mut(&mut self, id: BreadcrumbId) -> Result<&mut StageBreadcrumb> {
        self.crumbs.get_mut(&id).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Breadcrumb, format!("no breadcrumb {}", id))
        })
    }

    pub fn contains(&self, id: BreadcrumbId) -> bool {
        self.crumbs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.crumbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crumbs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageBreadcrumb> {
        self.crumbs.values()
    }

    /// Breadcrumbs of one hand, in creation order.
    pub fn for_hand(&self, hand: HandId) -> Vec<&StageBreadcrumb> {
        self.crumbs.values().filter(|c| c.hand == hand).collect()
    }

    /// Breadcrumbs pointing at any of `stages`.
    pub fn on_stages(&self, stages: &BTreeSet<StageId>) -> BTreeSet<BreadcrumbId> {
        self.crumbs
            .values()
            .filter(|c| stages.contains(&c.stage))
            .map(|c| c.id)
            .collect()
    }

    /// Append a breadcrumb for `stage` after `last`.
    ///
    /// The new crumb points back to `last` when its own type links backward;
    /// `last` points forward to it when `last`'s type links forward.
    pub fn create_breadcrumb(
        &mut self,
        hand: HandId,
        stage: StageId,
        breadcrumb_type: BreadcrumbType,
        last: Option<(BreadcrumbId, BreadcrumbType)>,
    ) -> Result<BreadcrumbId> {
        if let Some((last_id, _)) = last {
            self.get(last_id)?;
        }
        let id = BreadcrumbId(self.next_id);
        self.next_id += 1;

        let previous = match last {
            Some((last_id, _)) if breadcrumb_type.links_backward() => Some(last_id),
            _ => None,
        };
        self.crumbs.insert(
            id,
            StageBreadcrumb {
                id,
                hand,
                stage,
                previous,
                next: None,
            },
        );
        if let Some((last_id, last_type)) = last {
            if last_type.links_forward() {
                self.get_mut(last_id)?.next = Some(id);
            }
        }
        tracing::debug!(hand = %hand, crumb = %id, previous = ?previous, "breadcrumb created");
        Ok(id)
    }

    /// Fail on any link that points at a crumb missing from the arena.
    pub fn check_links(&self) -> Result<()> {
        for crumb in self.crumbs.values() {
            for (direction, link) in [("previous", crumb.previous), ("next", crumb.next)] {
                if let Some(target) = link {
                    if !self.crumbs.contains_key(&target) {
                        let message = format!("{} of {} points at missing {}", direction, crumb.id, target);
                        tracing::error!(crumb = %crumb.id, target = %target, direction, "breadcrumb link dangles");
                        return Err(EryError::BreadcrumbCorrupted(message));
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

/// New link values for one surviving breadcrumb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkChange {
    pub id: BreadcrumbId,
    pub previous: Option<BreadcrumbId>,
    pub next: Option<BreadcrumbId>,
}

/// The rewiring computed by [`plan_repair`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairPlan {
    pub link_changes: Vec<LinkChange>,
    pub hand_changes: Vec<(HandId, Option<BreadcrumbId>)>,
    pub removed: Vec<BreadcrumbId>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.link_changes.is_empty() && self.hand_changes.is_empty() && self.removed.is_empty()
    }

    /// Commit link changes, hand pointers and removals together.
    pub fn apply(&self, runtime: &mut Runtime) -> Result<()> {
        for change in &self.link_changes {
            if !runtime.breadcrumbs.contains(change.id) {
                return Err(EryError::BreadcrumbCorrupted(format!(
                    "repair targets missing {}",
                    change.id
                )));
            }
        }
        for (hand, _) in &self.hand_changes {
            runtime.hand(*hand)?;
        }

        for change in &self.link_changes {
            let crumb = runtime.breadcrumbs.get_mut(change.id)?;
            crumb.previous = change.previous;
            crumb.next = change.next;
        }
        for (hand, pointer) in &self.hand_changes {
            runtime.hand_mut(*hand)?.current_breadcrumb = *pointer;
        }
        for id in &self.removed {
            runtime.breadcrumbs.crumbs.remove(id);
        }
        tracing::debug!(
            links = self.link_changes.len(),
            hands = self.hand_changes.len(),
            removed = self.removed.len(),
            "breadcrumb repair applied"
        );
        Ok(())
    }
}

/// Plan the rewiring needed before removing the `doomed` breadcrumbs.
///
/// Doomed crumbs are processed in id order against a scratch copy:
/// 1. A hand pointing at the crumb moves to its `next`, else its `previous`, else nothing.
/// 2. With both neighbours present, `previous.next` is relinked when the previous
///    crumb's type links forward and `next.previous` when the next crumb's type
///    links backward. With one neighbour, that neighbour's pointer is cleared.
///
/// Afterwards any surviving pointer into a removed crumb is nulled, and hand
/// pointers still on a removed crumb are cleared.
pub fn plan_repair(
    arena: &BreadcrumbArena,
    doomed: &BTreeSet<BreadcrumbId>,
    breadcrumb_type: impl Fn(StageId) -> Option<BreadcrumbType>,
    hand_pointers: &BTreeMap<HandId, Option<BreadcrumbId>>,
) -> Result<RepairPlan> {
    arena.check_links()?;
    for id in doomed {
        arena.get(*id)?;
    }

    let type_of = |crumbs: &BTreeMap<BreadcrumbId, StageBreadcrumb>, id: BreadcrumbId| -> Result<BreadcrumbType> {
        let crumb = crumbs
            .get(&id)
            .ok_or_else(|| EryError::BreadcrumbCorrupted(format!("missing {}", id)))?;
        breadcrumb_type(crumb.stage).ok_or_else(|| {
            tracing::error!(crumb = %id, stage = %crumb.stage, "breadcrumb stage has no definition");
            EryError::BreadcrumbCorrupted(format!("stage {} of {} has no definition", crumb.stage, id))
        })
    };

    let mut scratch = arena.crumbs.clone();
    let mut pointers = hand_pointers.clone();

    for id in doomed {
        let (previous, next) = match scratch.get(id) {
            Some(crumb) => (crumb.previous, crumb.next),
            None => continue,
        };

        for pointer in pointers.values_mut() {
            if *pointer == Some(*id) {
                *pointer = next.or(previous);
            }
        }

        match (previous, next) {
            (Some(p), Some(n)) => {
                if type_of(&scratch, p)?.links_forward() {
                    if let Some(crumb) = scratch.get_mut(&p) {
                        crumb.next = Some(n);
                    }
                }
                if type_of(&scratch, n)?.links_backward() {
                    if let Some(crumb) = scratch.get_mut(&n) {
                        crumb.previous = Some(p);
                    }
                }
            }
            (Some(p), None) => {
                if let Some(crumb) = scratch.get_mut(&p) {
                    crumb.next = None;
                }
            }
            (None, Some(n)) => {
                if let Some(crumb) = scratch.get_mut(&n) {
                    crumb.previous = None;
                }
            }
            (None, None) => {}
        }
    }

    // Anything still pointing into a removed crumb is nulled.
    for crumb in scratch.values_mut() {
        if crumb.previous.is_some_and(|p| doomed.contains(&p)) {
            crumb.previous = None;
        }
        if crumb.next.is_some_and(|n| doomed.contains(&n)) {
            crumb.next = None;
        }
    }
    for pointer in pointers.values_mut() {
        if pointer.is_some_and(|p| doomed.contains(&p)) {
            *pointer = None;
        }
    }

    let link_changes = scratch
        .values()
        .filter(|c| !doomed.contains(&c.id))
        .filter_map(|c| {
            let before = arena.crumbs.get(&c.id)?;
            (before.previous != c.previous || before.next != c.next).then(|| LinkChange {
                id: c.id,
                previous: c.previous,
                next: c.next,
            })
        })
        .collect();
    let hand_changes = pointers
        .iter()
        .filter(|(hand, pointer)| hand_pointers.get(*hand) != Some(*pointer))
        .map(|(hand, pointer)| (*hand, *pointer))
        .collect();

    Ok(RepairPlan {
        link_changes,
        hand_changes,
        removed: doomed.iter().copied().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Hand;

    struct Chain {
        runtime: Runtime,
        hand: HandId,
        types: BTreeMap<StageId, BreadcrumbType>,
        crumbs: Vec<BreadcrumbId>,
        stages: Vec<StageId>,
    }

    /// One crumb per entry of `types`, created in order as a single hand walks forward.
    fn chain(types: &[BreadcrumbType]) -> Chain {
        let mut runtime = Runtime::new();
        let hand = runtime.insert_hand(Hand::new("m", "Web", "en"));
        let mut map = BTreeMap::new();
        let mut crumbs = Vec::new();
        let mut stages = Vec::new();
        let mut last: Option<(BreadcrumbId, BreadcrumbType)> = None;
        for (i, t) in types.iter().enumerate() {
            let stage = runtime.create_stage(crate::catalog::StageKey::new("m", format!("S{}", i)));
            map.insert(stage, *t);
            let id = runtime
                .breadcrumbs_mut()
                .create_breadcrumb(hand, stage, *t, last)
                .unwrap();
            last = Some((id, *t));
            crumbs.push(id);
            stages.push(stage);
        }
        runtime.hand_mut(hand).unwrap().current_breadcrumb = last.map(|(id, _)| id);
        Chain {
            runtime,
            hand,
            types: map,
            crumbs,
            stages,
        }
    }

    fn repair(chain: &mut Chain, doomed: &[BreadcrumbId]) -> RepairPlan {
        let doomed: BTreeSet<BreadcrumbId> = doomed.iter().copied().collect();
        let types = chain.types.clone();
        let plan = plan_repair(
            chain.runtime.breadcrumbs(),
            &doomed,
            |stage| types.get(&stage).copied(),
            &chain.runtime.hand_pointers(),
        )
        .unwrap();
        plan.apply(&mut chain.runtime).unwrap();
        plan
    }

    fn crumb(chain: &Chain, i: usize) -> &StageBreadcrumb {
        chain.runtime.breadcrumbs().get(chain.crumbs[i]).unwrap()
    }

    #[test]
    fn create_links_both_ways_for_all() {
        let c = chain(&[BreadcrumbType::All, BreadcrumbType::All]);
        assert_eq!(crumb(&c, 0).next, Some(c.crumbs[1]));
        assert_eq!(crumb(&c, 1).previous, Some(c.crumbs[0]));
    }

    #[test]
    fn create_respects_types() {
        // A `back` crumb never points forward; a `none` crumb never points back
        let c = chain(&[BreadcrumbType::Back, BreadcrumbType::None, BreadcrumbType::All]);
        assert_eq!(crumb(&c, 0).next, None);
        assert_eq!(crumb(&c, 1).previous, None);
        assert_eq!(crumb(&c, 1).next, None);
        assert_eq!(crumb(&c, 2).previous, Some(c.crumbs[1]));
    }

    #[test]
    fn middle_deletion_relinks_neighbours() {
        let mut c = chain(&[BreadcrumbType::All, BreadcrumbType::All, BreadcrumbType::All]);
        let b = c.crumbs[1];
        repair(&mut c, &[b]);
        assert_eq!(crumb(&c, 0).next, Some(c.crumbs[2]));
        assert_eq!(crumb(&c, 2).previous, Some(c.crumbs[0]));
        assert!(!c.runtime.breadcrumbs().contains(b));
    }

    #[test]
    fn middle_deletion_honours_types() {
        // Previous is `back` so it may not point forward; next is `all` so it may point back
        let mut c = chain(&[BreadcrumbType::Back, BreadcrumbType::All, BreadcrumbType::All]);
        c.runtime.breadcrumbs_mut().get_mut(c.crumbs[0]).unwrap().next = Some(c.crumbs[1]);
        let b = c.crumbs[1];
        repair(&mut c, &[b]);
        assert_eq!(crumb(&c, 0).next, None);
        assert_eq!(crumb(&c, 2).previous, Some(c.crumbs[0]));
    }

    #[test]
    fn current_pointer_advances_to_next() {
        let mut c = chain(&[BreadcrumbType::All, BreadcrumbType::All, BreadcrumbType::All]);
        let (a, b, last) = (c.crumbs[0], c.crumbs[1], c.crumbs[2]);
        c.runtime.hand_mut(c.hand).unwrap().current_breadcrumb = Some(b);
        let plan = repair(&mut c, &[b]);
        assert_eq!(c.runtime.hand(c.hand).unwrap().current_breadcrumb, Some(last));
        assert_eq!(plan.hand_changes, vec![(c.hand, Some(last))]);
        assert_eq!(crumb(&c, 0).id, a);
    }

    #[test]
    fn current_pointer_retreats_to_previous() {
        let mut c = chain(&[BreadcrumbType::All, BreadcrumbType::All]);
        let (a, b) = (c.crumbs[0], c.crumbs[1]);
        repair(&mut c, &[b]);
        assert_eq!(c.runtime.hand(c.hand).unwrap().current_breadcrumb, Some(a));
        assert_eq!(crumb(&c, 0).next, None);
    }

    #[test]
    fn current_pointer_clears_without_neighbours() {
        let mut c = chain(&[BreadcrumbType::All]);
        let only = c.crumbs[0];
        repair(&mut c, &[only]);
        assert_eq!(c.runtime.hand(c.hand).unwrap().current_breadcrumb, None);
        assert!(c.runtime.breadcrumbs().is_empty());
    }

    #[test]
    fn adjacent_deletions_chain_through() {
        let mut c = chain(&[
            BreadcrumbType::All,
            BreadcrumbType::All,
            BreadcrumbType::All,
            BreadcrumbType::All,
        ]);
        let (b, cc) = (c.crumbs[1], c.crumbs[2]);
        c.runtime.hand_mut(c.hand).unwrap().current_breadcrumb = Some(b);
        repair(&mut c, &[b, cc]);
        assert_eq!(crumb(&c, 0).next, Some(c.crumbs[3]));
        assert_eq!(crumb(&c, 3).previous, Some(c.crumbs[0]));
        assert_eq!(c.runtime.hand(c.hand).unwrap().current_breadcrumb, Some(c.crumbs[3]));
    }

    #[test]
    fn plan_is_pure_until_applied() {
        let c = chain(&[BreadcrumbType::All, BreadcrumbType::All, BreadcrumbType::All]);
        let doomed: BTreeSet<_> = [c.crumbs[1]].into_iter().collect();
        let before = c.runtime.breadcrumbs().clone();
        let plan = plan_repair(
            c.runtime.breadcrumbs(),
            &doomed,
            |stage| c.types.get(&stage).copied(),
            &c.runtime.hand_pointers(),
        )
        .unwrap();
        assert!(!plan.is_empty());
        assert_eq!(c.runtime.breadcrumbs(), &before);
        assert_eq!(c.stages.len(), 3);
    }

    #[test]
    fn dangling_link_is_corruption() {
        let mut c = chain(&[BreadcrumbType::All, BreadcrumbType::All]);
        c.runtime.breadcrumbs_mut().get_mut(c.crumbs[0]).unwrap().next = Some(BreadcrumbId(99));
        let doomed: BTreeSet<_> = [c.crumbs[1]].into_iter().collect();
        let err = plan_repair(
            c.runtime.breadcrumbs(),
            &doomed,
            |stage| c.types.get(&stage).copied(),
            &c.runtime.hand_pointers(),
        )
        .unwrap_err();
        assert!(matches!(err, EryError::BreadcrumbCorrupted(_)));
    }
}
