//! Per-target hook chain: slab storage with stable, generation-checked
//! identity, plus priority-driven placement.
//!
//! The chain order is a vector of slot indices (head first). Slots are
//! never moved by unrelated inserts or removals, so a `(slot, generation)`
//! pair keeps naming the same hook for its whole lifetime.

use std::collections::{HashMap, VecDeque};

use crate::errors::InstallError;
use crate::types::{HookInfo, NameInfo};

pub(crate) struct HookChain {
    slots: Vec<Option<HookInfo>>,
    generations: Vec<u32>,
    /// Slot indices in call order, head first.
    order: Vec<usize>,
}

impl HookChain {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            generations: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The hook at chain position `pos` (0 = head).
    pub fn hook_at(&self, pos: usize) -> &HookInfo {
        let slot = self.order[pos];
        self.slots[slot].as_ref().expect("chain order names a live slot")
    }

    pub fn generation(&self, slot: usize) -> u32 {
        self.generations[slot]
    }

    /// Chain position of `slot`, if it is live and the generation matches.
    pub fn position_of(&self, slot: usize, generation: u32) -> Option<usize> {
        if slot >= self.slots.len() || self.generations[slot] != generation {
            return None;
        }
        self.slots[slot].as_ref()?;
        self.order.iter().position(|&s| s == slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookInfo> {
        self.order.iter().map(move |&slot| {
            self.slots[slot].as_ref().expect("chain order names a live slot")
        })
    }

    fn alloc_slot(&mut self, hook: HookInfo) -> usize {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(hook);
            slot
        } else {
            self.slots.push(Some(hook));
            self.generations.push(0);
            self.slots.len() - 1
        }
    }

    fn free_slot(&mut self, slot: usize) -> HookInfo {
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.slots[slot].take().expect("freeing a live slot")
    }

    /// Append without any priority handling (first hook on a target).
    pub fn append(&mut self, hook: HookInfo) -> usize {
        let slot = self.alloc_slot(hook);
        self.order.push(slot);
        slot
    }

    /// Remove the hook at chain position `pos`.
    pub fn remove_at(&mut self, pos: usize) -> HookInfo {
        let slot = self.order.remove(pos);
        self.free_slot(slot)
    }

    /// Insert `hook` at a priority-legal position.
    ///
    /// Returns the new slot and whether a topological sort reordered the
    /// chain (in which case every link must be rewritten, not just the
    /// neighbors). On error the chain is untouched.
    pub fn place(&mut self, hook: HookInfo) -> Result<(usize, bool), InstallError> {
        // A final hook is pinned to the tail; two finals cannot coexist.
        if hook.priority.is_final {
            if let Some(last) = self.order.last().map(|&s| self.slots[s].as_ref().unwrap()) {
                if last.priority.is_final {
                    return Err(InstallError::TargetBadPriorities {
                        name: hook.name.clone(),
                        message: format!(
                            "cannot install a 'final' hook after another 'final' hook with name: {}",
                            last.name
                        ),
                    });
                }
            }
            let slot = self.alloc_slot(hook);
            self.order.push(slot);
            return Ok((slot, false));
        }

        // A sort is needed when the incoming hook carries constraints, or
        // when any existing hook's constraints mention it.
        let requires_sort = !hook.priority.afters.is_empty()
            || !hook.priority.befores.is_empty()
            || self.iter().any(|existing| {
                existing
                    .priority
                    .afters
                    .iter()
                    .chain(existing.priority.befores.iter())
                    .any(|filter| filter.matches(&hook.name))
            });

        if requires_sort {
            let name = hook.name.clone();
            let slot = self.alloc_slot(hook);
            // Sort a scratch order with the incoming hook at the front;
            // commit only on success so a failure rolls back cleanly.
            let mut scratch = Vec::with_capacity(self.order.len() + 1);
            scratch.push(slot);
            scratch.extend_from_slice(&self.order);
            let (sorted, cycles) = self.topological_sort(&scratch);

            if cycles.contains(&slot) {
                let cycle_names: Vec<String> = cycles
                    .iter()
                    .map(|&s| self.slots[s].as_ref().unwrap().name.to_string())
                    .collect();
                self.free_slot(slot);
                return Err(InstallError::TargetBadPriorities {
                    name,
                    message: format!(
                        "cannot install hook due to cycles in priorities involving hook name: {}",
                        cycle_names.join(",")
                    ),
                });
            }

            for &s in &cycles {
                log::warn!(
                    "cycle in hook priorities involving {}; cycle hooks keep their original order",
                    self.slots[s].as_ref().unwrap().name
                );
            }
            let mut combined = sorted;
            combined.extend_from_slice(&cycles);
            // Final hooks stay pinned to the tail even when the sort would
            // have been happy to pop them earlier.
            let is_final = |&s: &usize| self.slots[s].as_ref().unwrap().priority.is_final;
            let mut order: Vec<usize> =
                combined.iter().copied().filter(|s| !is_final(s)).collect();
            order.extend(combined.iter().copied().filter(is_final));
            self.order = order;
            log::debug!("chain order after sort: {}", self.describe());
            return Ok((slot, true));
        }

        // Fast path: no constraints anywhere, newest runs first.
        if hook.priority.afters.is_empty() && hook.priority.befores.is_empty() {
            let slot = self.alloc_slot(hook);
            self.order.insert(0, slot);
            return Ok((slot, false));
        }

        // Linear scan: insert before the first hook none of our `afters`
        // match; fall back to the head.
        let mut insert_pos = 0;
        let mut found = false;
        for (pos, existing) in self.iter().enumerate() {
            if hook
                .priority
                .afters
                .iter()
                .any(|filter| filter.matches(&existing.name))
            {
                continue;
            }
            insert_pos = pos;
            found = true;
            break;
        }
        if !found {
            insert_pos = 0;
        }
        let slot = self.alloc_slot(hook);
        self.order.insert(insert_pos, slot);
        Ok((slot, false))
    }

    /// Kahn's algorithm over name identities, with final hooks spliced to
    /// the tail first and ties broken by current order. Returns the sorted
    /// order and the slots left in cycles (original relative order).
    fn topological_sort(&self, order: &[usize]) -> (Vec<usize>, Vec<usize>) {
        // Finals to the tail, preserving relative order on both sides.
        let mut work: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&s| !self.slots[s].as_ref().unwrap().priority.is_final)
            .collect();
        work.extend(
            order
                .iter()
                .copied()
                .filter(|&s| self.slots[s].as_ref().unwrap().priority.is_final),
        );

        let hook = |slot: usize| self.slots[slot].as_ref().unwrap();

        log::debug!("initial hook order before topological sort: {}", {
            let names: Vec<String> = work.iter().map(|&s| hook(s).name.to_string()).collect();
            names.join(" -> ")
        });

        let mut name_to_slot: HashMap<NameInfo, usize> = HashMap::new();
        for &slot in &work {
            name_to_slot.insert(hook(slot).name.clone(), slot);
        }

        // An edge key -> value means key runs before value; `before`
        // constraints are converted to `after` edges on the matched hooks.
        let mut graph: HashMap<NameInfo, Vec<NameInfo>> = HashMap::new();
        let find_matches = |filter: &crate::types::NameFilter, this: &NameInfo| -> Vec<NameInfo> {
            work.iter()
                .map(|&s| &hook(s).name)
                .filter(|name| *name != this && filter.matches(name))
                .cloned()
                .collect()
        };

        for &slot in &work {
            let h = hook(slot);
            for after in &h.priority.afters {
                for matched in find_matches(after, &h.name) {
                    graph.entry(matched).or_default().push(h.name.clone());
                }
            }
            for before in &h.priority.befores {
                for matched in find_matches(before, &h.name) {
                    graph.entry(h.name.clone()).or_default().push(matched);
                }
            }
        }

        let mut in_degree: HashMap<NameInfo, i32> = HashMap::new();
        for &slot in &work {
            in_degree.insert(hook(slot).name.clone(), 0);
        }
        for successors in graph.values() {
            for succ in successors {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg += 1;
                }
            }
        }

        let mut queue: VecDeque<NameInfo> = work
            .iter()
            .filter(|&&s| in_degree.get(&hook(s).name) == Some(&0))
            .map(|&s| hook(s).name.clone())
            .collect();

        let mut sorted = Vec::with_capacity(work.len());
        let mut taken = vec![false; self.slots.len()];
        while let Some(current) = queue.pop_front() {
            let Some(&slot) = name_to_slot.get(&current) else {
                continue;
            };
            if taken[slot] {
                continue;
            }
            taken[slot] = true;
            sorted.push(slot);
            if let Some(successors) = graph.get(&current) {
                for succ in successors.clone() {
                    if let Some(deg) = in_degree.get_mut(&succ) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(succ);
                        }
                    }
                }
            }
        }

        let cycles: Vec<usize> = work.iter().copied().filter(|&s| !taken[s]).collect();
        (sorted, cycles)
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self.iter().map(|h| h.name.to_string()).collect();
        names.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NameFilter, Priority};

    fn hook(name: &str, namespace: &str, priority: Priority) -> HookInfo {
        let mut info = HookInfo::new(
            core::ptr::null(),
            core::ptr::null_mut(),
            core::ptr::null_mut(),
            if namespace.is_empty() {
                NameInfo::new(name)
            } else {
                NameInfo::namespaced(name, namespace)
            },
            priority,
        );
        info.metadata.need_orig = false;
        info
    }

    fn after(name: &str) -> Priority {
        Priority {
            afters: vec![NameFilter::by_name(name)],
            ..Default::default()
        }
    }

    fn names(chain: &HookChain) -> Vec<String> {
        chain.iter().map(|h| h.name.name.clone()).collect()
    }

    #[test]
    fn unconstrained_installs_are_newest_first() {
        let mut chain = HookChain::new();
        for name in ["h1", "h2", "h3"] {
            chain.place(hook(name, "", Priority::default())).unwrap();
        }
        assert_eq!(names(&chain), ["h3", "h2", "h1"]);
    }

    #[test]
    fn name_afters_pull_the_dependency_forward() {
        let mut chain = HookChain::new();
        chain.place(hook("B", "", after("A"))).unwrap();
        chain.place(hook("A", "", Priority::default())).unwrap();
        assert_eq!(names(&chain), ["A", "B"]);
    }

    #[test]
    fn namespace_befores_jump_the_whole_group() {
        let mut chain = HookChain::new();
        chain.place(hook("one", "common", Priority::default())).unwrap();
        chain.place(hook("two", "common", Priority::default())).unwrap();
        let prior = hook(
            "prior",
            "",
            Priority {
                befores: vec![NameFilter::by_namespace("common")],
                ..Default::default()
            },
        );
        chain.place(prior).unwrap();
        // Newest-wins put two ahead of one; prior slots in front of both.
        assert_eq!(names(&chain), ["prior", "two", "one"]);
    }

    #[test]
    fn five_hooks_installed_scrambled_sort_into_a_chain() {
        let mut chain = HookChain::new();
        chain.place(hook("h3", "", after("h2"))).unwrap();
        chain.place(hook("h5", "", after("h4"))).unwrap();
        chain.place(hook("h2", "", after("h1"))).unwrap();
        chain.place(hook("h4", "", after("h3"))).unwrap();
        chain.place(hook("h1", "", Priority::default())).unwrap();
        assert_eq!(names(&chain), ["h1", "h2", "h3", "h4", "h5"]);
    }

    #[test]
    fn cycle_involving_the_incoming_hook_fails_and_rolls_back() {
        let mut chain = HookChain::new();
        chain.place(hook("X", "", after("Y"))).unwrap();
        let err = chain.place(hook("Y", "", after("X"))).unwrap_err();
        match err {
            InstallError::TargetBadPriorities { message, .. } => {
                assert!(message.contains("cycle"), "message: {message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Previous state intact.
        assert_eq!(names(&chain), ["X"]);
    }

    #[test]
    fn second_final_hook_is_rejected() {
        let mut chain = HookChain::new();
        let fin = |name: &str| {
            hook(
                name,
                "",
                Priority {
                    is_final: true,
                    ..Default::default()
                },
            )
        };
        chain.place(fin("final1")).unwrap();
        let err = chain.place(fin("final2")).unwrap_err();
        assert!(matches!(err, InstallError::TargetBadPriorities { .. }));
        assert_eq!(names(&chain), ["final1"]);
    }

    #[test]
    fn final_hook_stays_last_through_sorts() {
        let mut chain = HookChain::new();
        chain
            .place(hook(
                "last",
                "",
                Priority {
                    is_final: true,
                    ..Default::default()
                },
            ))
            .unwrap();
        chain.place(hook("B", "", after("A"))).unwrap();
        chain.place(hook("A", "", Priority::default())).unwrap();
        assert_eq!(names(&chain), ["A", "B", "last"]);
    }

    #[test]
    fn handles_survive_unrelated_removals() {
        let mut chain = HookChain::new();
        let (slot_a, _) = chain.place(hook("a", "", Priority::default())).unwrap();
        let (slot_b, _) = chain.place(hook("b", "", Priority::default())).unwrap();
        let (slot_c, _) = chain.place(hook("c", "", Priority::default())).unwrap();
        let gen_a = chain.generation(slot_a);

        // Chain is [c, b, a]; removing b must not disturb a's identity.
        let pos_b = chain.position_of(slot_b, chain.generation(slot_b)).unwrap();
        chain.remove_at(pos_b);
        assert_eq!(chain.position_of(slot_a, gen_a), Some(1));
        assert_eq!(chain.position_of(slot_c, chain.generation(slot_c)), Some(0));

        // A new hook may reuse b's slot; the stale generation must miss.
        let stale_gen = chain.generation(slot_b).wrapping_sub(1);
        let (slot_d, _) = chain.place(hook("d", "", Priority::default())).unwrap();
        assert_eq!(slot_d, slot_b, "slot is recycled");
        assert_eq!(chain.position_of(slot_b, stale_gen), None);
    }
}
