use crate::models::CatalogItem;
use rand::{Rng, seq::IndexedRandom};

fn richness(item: &CatalogItem) -> usize {
    item.populated_fields() + usize::from(!item.image_files.is_empty())
}

/// Picks test samples that stress a recipe differently: the richest item,
/// the sparsest, one from another category, then random fill.
pub fn select_diverse_samples<'a, R: Rng + ?Sized>(
    items: &'a [CatalogItem],
    count: usize,
    rng: &mut R,
) -> Vec<&'a CatalogItem> {
    if items.len() <= count {
        return items.iter().collect();
    }

    let mut remaining: Vec<&CatalogItem> = items.iter().collect();
    let mut selected: Vec<&CatalogItem> = Vec::with_capacity(count);

    // max_by_key keeps the last maximum; prefer the earliest instead.
    if let Some(index) = (0..remaining.len()).rev().max_by_key(|&i| richness(remaining[i])) {
        selected.push(remaining.remove(index));
    }
    if selected.len() < count {
        if let Some(index) = (0..remaining.len()).min_by_key(|&i| richness(remaining[i])) {
            selected.push(remaining.remove(index));
        }
    }

    if selected.len() < count {
        let seen: Vec<Option<String>> = selected
            .iter()
            .map(|item| item.field_str("category"))
            .collect();
        let other_category: Vec<usize> = (0..remaining.len())
            .filter(|&i| {
                let category = remaining[i].field_str("category");
                category.is_some() && !seen.contains(&category)
            })
            .collect();
        let pool: Vec<usize> = if other_category.is_empty() {
            (0..remaining.len()).collect()
        } else {
            other_category
        };
        if let Some(&index) = pool.choose(rng) {
            selected.push(remaining.remove(index));
        }
    }

    while selected.len() < count && !remaining.is_empty() {
        let index = rng.random_range(0..remaining.len());
        selected.push(remaining.remove(index));
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn item(id: &str, fields: usize, category: Option<&str>) -> CatalogItem {
        let mut item = CatalogItem::new(id);
        for i in 0..fields {
            item.fields.insert(format!("f{i}"), format!("v{i}").into());
        }
        if let Some(category) = category {
            item.fields.insert("category".into(), category.into());
        }
        item
    }

    #[test]
    fn small_catalogs_are_returned_whole() {
        let items = vec![item("a", 1, None), item("b", 2, None)];
        let picked = select_diverse_samples(&items, 3, &mut SmallRng::seed_from_u64(1));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn picks_richest_sparsest_then_new_category() {
        let items = vec![
            item("mid", 3, Some("mugs")),
            item("rich", 6, Some("mugs")),
            item("sparse", 0, Some("mugs")),
            item("same", 2, Some("mugs")),
            item("other", 2, Some("vases")),
        ];
        for seed in 0..8 {
            let picked = select_diverse_samples(&items, 3, &mut SmallRng::seed_from_u64(seed));
            let ids: Vec<&str> = picked.iter().map(|item| item.id.as_str()).collect();
            assert_eq!(ids, vec!["rich", "sparse", "other"]);
        }
    }

    #[test]
    fn fills_remaining_slots_without_repeats() {
        let items: Vec<CatalogItem> = (0..10).map(|i| item(&format!("i{i}"), i % 4, None)).collect();
        let picked = select_diverse_samples(&items, 5, &mut SmallRng::seed_from_u64(7));
        let mut ids: Vec<&str> = picked.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], "i3");
        assert_eq!(ids[1], "i0");
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }
}
