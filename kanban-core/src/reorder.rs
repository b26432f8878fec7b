/// Pure ordering helpers shared by the drag interpreter and the adapter.
///
/// All functions work on owned id lists and never fail: out-of-range indices
/// clamp to the end of the list.

/// Remove the entry at `from` and reinsert it at `to`.
/// Returns the list unchanged when `from` is out of range.
pub fn move_item(mut ids: Vec<String>, from: usize, to: usize) -> Vec<String> {
    if from >= ids.len() {
        return ids;
    }
    let item = ids.remove(from);
    let to = to.min(ids.len());
    ids.insert(to, item);
    ids
}

/// Remove every occurrence of `id`.
pub fn remove_id(mut ids: Vec<String>, id: &str) -> Vec<String> {
    ids.retain(|existing| existing != id);
    ids
}

/// Insert `id` at `index` (clamped), removing any previous occurrence first
/// so the id appears exactly once.
pub fn insert_at(ids: Vec<String>, id: &str, index: usize) -> Vec<String> {
    let mut ids = remove_id(ids, id);
    let index = index.min(ids.len());
    ids.insert(index, id.to_string());
    ids
}

pub fn position(ids: &[String], id: &str) -> Option<usize> {
    ids.iter().position(|existing| existing == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn test_move_item_forward_and_back() {
        assert_eq!(move_item(ids(&["a", "b", "c"]), 0, 2), ids(&["b", "c", "a"]));
        assert_eq!(move_item(ids(&["a", "b", "c"]), 2, 0), ids(&["c", "a", "b"]));
        assert_eq!(move_item(ids(&["a", "b", "c"]), 1, 1), ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_move_item_clamps_and_ignores_bad_source() {
        assert_eq!(move_item(ids(&["a", "b"]), 0, 10), ids(&["b", "a"]));
        assert_eq!(move_item(ids(&["a", "b"]), 5, 0), ids(&["a", "b"]));
    }

    #[test]
    fn test_move_item_is_permutation_for_all_positions() {
        let base = ids(&["a", "b", "c", "d", "e"]);
        for from in 0..base.len() {
            for to in 0..base.len() {
                let moved = move_item(base.clone(), from, to);
                assert_eq!(sorted(moved.clone()), sorted(base.clone()));
                assert_eq!(moved[to], base[from]);
            }
        }
    }

    #[test]
    fn test_insert_at_keeps_single_occurrence() {
        assert_eq!(insert_at(ids(&["x", "t1", "y"]), "t1", 0), ids(&["t1", "x", "y"]));
        assert_eq!(insert_at(ids(&[]), "t1", 3), ids(&["t1"]));
        assert_eq!(insert_at(ids(&["a", "b"]), "t1", 1), ids(&["a", "t1", "b"]));
    }

    #[test]
    fn test_remove_id_preserves_relative_order() {
        assert_eq!(remove_id(ids(&["a", "t", "b", "t"]), "t"), ids(&["a", "b"]));
        assert_eq!(remove_id(ids(&["a"]), "zz"), ids(&["a"]));
        assert_eq!(position(&ids(&["a", "b"]), "b"), Some(1));
    }
}
