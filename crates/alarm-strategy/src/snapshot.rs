//! Immutable strategy snapshot.
//!
//! Strategies live in one arena and their items in a second, flat arena.
//! Each strategy owns a contiguous index range of the item arena, and
//! every item slot points back at its strategy by index, so lookups in
//! either direction need no reference cycles.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;

use alarm_core::{Item, ItemId, ItemKey, Strategy, StrategyId};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct ItemSlot {
    strategy: usize,
    item: usize,
}

/// An item together with the strategy that owns it.
#[derive(Debug, Clone, Copy)]
pub struct ItemRef<'a> {
    pub strategy: &'a Strategy,
    pub item: &'a Item,
}

impl ItemRef<'_> {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.strategy.id, self.item.id)
    }
}

#[derive(Debug, Default)]
pub struct StrategySnapshot {
    version: u64,
    loaded_at: i64,
    strategies: Vec<Strategy>,
    items: Vec<ItemSlot>,
    item_ranges: Vec<Range<usize>>,
    by_id: HashMap<StrategyId, usize>,
    by_item_id: HashMap<ItemId, usize>,
    by_priority_group: HashMap<String, Vec<usize>>,
    by_query_md5: HashMap<String, Vec<usize>>,
}

impl StrategySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Index `strategies`. Strategies with no items, a repeated id, or an
    /// item id already owned by another strategy are skipped; the number
    /// skipped is returned alongside.
    pub fn build(strategies: Vec<Strategy>, version: u64, loaded_at: i64) -> (Self, usize) {
        let mut snapshot = Self {
            version,
            loaded_at,
            ..Self::default()
        };
        let mut seen_items: HashSet<ItemId> = HashSet::new();
        let mut skipped = 0;

        for strategy in strategies {
            if strategy.items.is_empty() {
                warn!(strategy_id = strategy.id, "strategy without items skipped");
                skipped += 1;
                continue;
            }
            if snapshot.by_id.contains_key(&strategy.id) {
                warn!(strategy_id = strategy.id, "duplicate strategy id skipped");
                skipped += 1;
                continue;
            }
            if let Some(item) = strategy.items.iter().find(|i| seen_items.contains(&i.id)) {
                warn!(
                    strategy_id = strategy.id,
                    item_id = item.id,
                    "item owned by another strategy, strategy skipped"
                );
                skipped += 1;
                continue;
            }

            let idx = snapshot.strategies.len();
            let start = snapshot.items.len();
            for (item_idx, item) in strategy.items.iter().enumerate() {
                let slot = snapshot.items.len();
                seen_items.insert(item.id);
                snapshot.items.push(ItemSlot {
                    strategy: idx,
                    item: item_idx,
                });
                snapshot.by_item_id.insert(item.id, slot);
                if !item.query_md5.is_empty() {
                    snapshot
                        .by_query_md5
                        .entry(item.query_md5.clone())
                        .or_default()
                        .push(slot);
                }
            }
            snapshot.item_ranges.push(start..snapshot.items.len());
            snapshot.by_id.insert(strategy.id, idx);
            if strategy.in_priority_group() {
                snapshot
                    .by_priority_group
                    .entry(strategy.priority_group_key.clone())
                    .or_default()
                    .push(idx);
            }
            snapshot.strategies.push(strategy);
        }

        let strategies = &snapshot.strategies;
        for members in snapshot.by_priority_group.values_mut() {
            members.sort_by(|a, b| {
                strategies[*b]
                    .priority
                    .cmp(&strategies[*a].priority)
                    .then(strategies[*a].id.cmp(&strategies[*b].id))
            });
        }
        (snapshot, skipped)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> i64 {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn ids(&self) -> BTreeSet<StrategyId> {
        self.by_id.keys().copied().collect()
    }

    pub fn get(&self, id: StrategyId) -> Option<&Strategy> {
        self.by_id.get(&id).map(|idx| &self.strategies[*idx])
    }

    pub fn strategies(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.iter()
    }

    fn resolve(&self, slot: usize) -> ItemRef<'_> {
        let ItemSlot { strategy, item } = self.items[slot];
        let strategy = &self.strategies[strategy];
        ItemRef {
            strategy,
            item: &strategy.items[item],
        }
    }

    pub fn items_of(&self, id: StrategyId) -> impl Iterator<Item = ItemRef<'_>> {
        let range = self
            .by_id
            .get(&id)
            .map(|idx| self.item_ranges[*idx].clone())
            .unwrap_or(0..0);
        range.map(|slot| self.resolve(slot))
    }

    /// Look up an item, checking it still belongs to the expected strategy.
    pub fn item(&self, key: ItemKey) -> Option<ItemRef<'_>> {
        self.by_item_id
            .get(&key.item_id)
            .map(|slot| self.resolve(*slot))
            .filter(|r| r.strategy.id == key.strategy_id)
    }

    pub fn item_by_id(&self, item_id: ItemId) -> Option<ItemRef<'_>> {
        self.by_item_id.get(&item_id).map(|slot| self.resolve(*slot))
    }

    pub fn all_items(&self) -> impl Iterator<Item = ItemRef<'_>> {
        (0..self.items.len()).map(|slot| self.resolve(slot))
    }

    pub fn by_query_md5(&self, query_md5: &str) -> impl Iterator<Item = ItemRef<'_>> {
        self.by_query_md5
            .get(query_md5)
            .into_iter()
            .flatten()
            .map(|slot| self.resolve(*slot))
    }

    /// Strategies sharing `priority_group_key`, highest priority first.
    pub fn priority_group(&self, key: &str) -> impl Iterator<Item = &Strategy> {
        self.by_priority_group
            .get(key)
            .into_iter()
            .flatten()
            .map(|idx| &self.strategies[*idx])
    }

    pub fn query_groups(&self) -> impl Iterator<Item = &str> {
        self.by_query_md5.keys().map(String::as_str)
    }

    /// Opaque pointer to the strategy definition this snapshot saw.
    pub fn snapshot_key(&self, strategy_id: StrategyId) -> String {
        format!("bkmonitor.STRATEGY_SNAPSHOT.{strategy_id}.{}", self.version)
    }
}
