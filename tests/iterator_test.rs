use std::collections::HashSet;

use int62set_rs::{Error, Int62Set};

#[test]
fn empty_set_iterator() {
    let set = Int62Set::with_buckets(8).unwrap();
    let mut iter = set.iter();
    assert!(!iter.has_next());
    assert!(!iter.has_next(), "exhausted must stay exhausted");
    assert_eq!(iter.try_next(), Err(Error::Exhausted));
}

#[test]
fn iteration_visits_every_value_once() {
    let set = Int62Set::with_buckets(8).unwrap();
    for i in 0..10_000u64 {
        set.add(i).unwrap();
    }
    assert_eq!(set.len(), 10_000);

    let mut witness = HashSet::new();
    let mut iter = set.iter();
    while iter.has_next() {
        let value = iter.try_next().unwrap();
        assert!(value < 10_000, "spurious value {}", value);
        assert!(witness.insert(value), "duplicate value {}", value);
    }
    assert_eq!(witness.len(), 10_000);
}

#[test]
fn iterate_and_remove_drains_the_set() {
    let set = Int62Set::with_buckets(8).unwrap();
    for i in 0..10_000u64 {
        set.add(i).unwrap();
    }

    let mut iter = set.iter();
    while iter.has_next() {
        let value = iter.try_next().unwrap();
        iter.remove().unwrap();
        assert!(!set.contains(value), "value {} survived removal", value);
    }

    assert_eq!(set.len(), 0);
    assert!(set.is_empty());
}

#[test]
fn unchecked_iterate_and_remove() {
    // Same drain without consulting has_next between steps.
    let set = Int62Set::with_buckets(8).unwrap();
    for i in 0..10_000u64 {
        set.add(i).unwrap();
    }

    let mut iter = set.iter();
    for _ in 0..10_000 {
        let value = iter.try_next().unwrap();
        iter.remove().unwrap();
        assert!(!set.contains(value));
    }
    assert_eq!(iter.try_next(), Err(Error::Exhausted));
    assert!(set.is_empty());
}

#[test]
fn remove_error_states() {
    let set = Int62Set::with_buckets(1).unwrap();
    set.add(5).unwrap();
    set.add(6).unwrap();

    // remove before any next.
    let mut iter = set.iter();
    assert_eq!(iter.remove(), Err(Error::NoCurrentElement));

    // remove twice after one next: the element is consumed by the first.
    let mut iter = set.iter();
    let _ = iter.try_next().unwrap();
    assert_eq!(iter.remove(), Ok(()));
    assert_eq!(iter.remove(), Err(Error::NoCurrentElement));
}

#[test]
fn remove_after_external_removal() {
    let set = Int62Set::with_buckets(1).unwrap();
    set.add(17).unwrap();

    let mut iter = set.iter();
    let value = iter.try_next().unwrap();
    assert_eq!(value, 17);

    // Someone else removes it first.
    assert_eq!(set.remove(17), Ok(true));
    assert_eq!(iter.remove(), Err(Error::AlreadyRemoved));
}

#[test]
fn iterator_trait_adapter() {
    let set = Int62Set::with_buckets(4).unwrap();
    for i in 0..64u64 {
        set.add(i).unwrap();
    }

    let collected: HashSet<u64> = (&set).into_iter().collect();
    assert_eq!(collected.len(), 64);
    assert_eq!(collected, (0..64).collect::<HashSet<u64>>());

    let sum: u64 = set.iter().sum();
    assert_eq!(sum, (0..64).sum());
}

#[test]
fn iterators_survive_interleaved_inserts() {
    // A chorus of iterators created while the set keeps growing: each must
    // keep returning unique, already-inserted values.
    let set = Int62Set::with_buckets(1).unwrap();
    let rounds = 300usize;
    let mut witnesses: Vec<HashSet<u64>> = Vec::with_capacity(rounds);
    let mut iterators = Vec::with_capacity(rounds);

    for i in 0..rounds {
        set.add(i as u64).unwrap();
        witnesses.push(HashSet::new());
        iterators.push(set.iter());
        for j in 0..=i {
            if iterators[j].has_next() {
                let value = iterators[j].try_next().unwrap();
                assert!(
                    witnesses[j].insert(value),
                    "iterator {} returned duplicate {} after adding {}",
                    j,
                    value,
                    i
                );
                assert_eq!(
                    set.add(value),
                    Ok(false),
                    "iterator returned a value the set does not hold"
                );
            }
        }
    }

    assert!(!iterators[0].has_next(), "first iterator should be exhausted");
    assert!(!iterators[0].has_next(), "exhausted must stay exhausted");
}

#[test]
fn has_next_hint_can_be_invalidated_by_removal() {
    let set = Int62Set::with_buckets(1).unwrap();
    set.add(3).unwrap();

    let mut iter = set.iter();
    assert!(iter.has_next());

    // The value vanishes between the hint and the read.
    assert_eq!(set.remove(3), Ok(true));
    assert_eq!(iter.try_next(), Err(Error::Exhausted));
}
