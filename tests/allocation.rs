//! Global-allocator smoke tests: `Dmallox` standing in as
//! `#[global_allocator]` has to work with ordinary standard-library
//! collection types, not just the direct `AllocatorContext` API.

use dmallox::Dmallox;

#[global_allocator]
static ALLOCATOR: Dmallox = Dmallox::new();

#[test]
fn vec() {
    let mut v = vec![1, 2, 3];
    v.push(4);

    assert_eq!((1..=4).collect::<Vec<_>>(), v);
}

#[test]
fn map_and_formatting() {
    let mut map = std::collections::BTreeMap::new();
    map.insert(10, "Hello");
    map.insert(11, "world");
    map.insert(20, "Hallo");
    map.insert(21, "Welt");
    map.insert(-1, "english");
    map.insert(-2, "german");

    let english = format!("[{}]: {}, {}!", map[&-1], map[&10], map[&11]);
    let german = format!("[{}]: {}, {}!", map[&-2], map[&20], map[&21]);
    assert_eq!(english, "[english]: Hello, world!");
    assert_eq!(german, "[german]: Hallo, Welt!");
}

#[test]
fn large_vec_forces_growth_and_reallocation() {
    let mut v: Vec<u64> = Vec::new();
    for i in 0..10_000 {
        v.push(i);
    }
    assert_eq!(v.len(), 10_000);
    assert_eq!(v[9_999], 9_999);
}

#[test]
fn many_small_strings_exercise_the_divided_engine() {
    let strings: Vec<String> = (0..500).map(|i| format!("entry-{i}")).collect();
    assert_eq!(strings[499], "entry-499");
    drop(strings);
}
