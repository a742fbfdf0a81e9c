use kernel_env::{PageDesc, VmemFlags, VmemTree};
use proptest::prelude::*;
use std::collections::BTreeMap;

const PAGE: u64 = 0x1000;

fn desc(size: u64) -> PageDesc {
    PageDesc {
        valid: true,
        flags: VmemFlags::user_rw(),
        vmo: None,
        offset: 0,
        size,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Declare { page: u64, pages: u64 },
    Kill { nth: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..512_u64, 1..8_u64).prop_map(|(page, pages)| Op::Declare { page, pages }),
        1 => any::<usize>().prop_map(|nth| Op::Kill { nth }),
    ]
}

/// Live ranges only; dead ones vanish from the model.
fn model_find(model: &BTreeMap<u64, u64>, addr: u64) -> Option<u64> {
    model
        .range(..=addr)
        .next_back()
        .filter(|&(&k, &size)| addr - k < size)
        .map(|(&k, _)| k)
}

proptest! {
    #[test]
    fn behaves_like_a_map_of_disjoint_ranges(ops in prop::collection::vec(op(), 1..300)) {
        let mut tree = VmemTree::new();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Declare { page, pages } => {
                    let (start, size) = (page * PAGE, pages * PAGE);
                    let clash = model
                        .iter()
                        .any(|(&k, &s)| k < start + size && start < k + s);
                    prop_assert_eq!(tree.overlaps(start, size), clash);
                    if !clash {
                        tree.insert(start, desc(size));
                        model.insert(start, size);
                    }
                }
                Op::Kill { nth } => {
                    if model.is_empty() {
                        continue;
                    }
                    let start = *model.keys().nth(nth % model.len()).unwrap();
                    model.remove(&start);
                    tree.get_mut(start).unwrap().valid = false;
                }
            }
        }

        for page in 0..520 {
            let addr = page * PAGE + 0x10;
            prop_assert_eq!(tree.find(addr).map(|(k, _)| k), model_find(&model, addr));
        }

        let live: Vec<u64> = tree.iter().filter(|(_, d)| d.valid).map(|(k, _)| k).collect();
        prop_assert_eq!(live, model.keys().copied().collect::<Vec<_>>());

        if let Some(gap) = tree.find_gap(0, 4 * PAGE) {
            prop_assert!(!tree.overlaps(gap, 4 * PAGE));
            prop_assert!(model.iter().all(|(&k, &s)| k + s <= gap || k >= gap + 4 * PAGE));
        }
    }
}

#[test]
fn thousands_of_ranges_stay_ordered() {
    let mut tree = VmemTree::new();
    // insert in a scrambled order so splits hit every position
    for i in 0..4_000_u64 {
        let slot = (i * 2_654_435_761) % 4_000;
        assert!(tree.insert(slot * 2 * PAGE, desc(PAGE)).is_none());
    }
    assert_eq!(tree.len(), 4_000);
    assert!(tree.depth() >= 3);

    let keys: Vec<u64> = tree.iter().map(|(k, _)| k).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(tree.find(1_234 * 2 * PAGE + 0x800).map(|(k, _)| k), Some(1_234 * 2 * PAGE));
    assert!(tree.find(1_234 * 2 * PAGE + PAGE).is_none());
    assert_eq!(tree.find_gap(0, PAGE), Some(PAGE));
    assert_eq!(tree.find_gap(0, 2 * PAGE), Some(8_000 * PAGE - PAGE));
}
