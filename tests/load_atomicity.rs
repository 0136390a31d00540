//! End-to-end properties of the load engine: transactional atomicity,
//! initializer ordering, re-entry, and cross-thread serialization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use dylink::bootstrap;
use dylink::sync::{ThreadIdSource, ThreadToken};
use dylink::testing::{map_image, ArenaMapper, ImageBuilder, ImageStore};
use dylink::{AnyVersion, LoadError, LoadFlags, Loader};

/// Thread identity from real host threads.
struct StdThreads;

impl ThreadIdSource for StdThreads {
    fn current_thread(&self) -> ThreadToken {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        thread_local! {
            static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        ThreadToken(ID.with(|id| *id))
    }
}

fn harness() -> (Arc<ImageStore>, Arc<ArenaMapper>, Arc<Loader>) {
    let store = Arc::new(ImageStore::new());
    let mapper = Arc::new(ArenaMapper::new());
    let format: Arc<ImageStore> = Arc::clone(&store);
    let segments: Arc<ArenaMapper> = Arc::clone(&mapper);
    let loader = Arc::new(Loader::new(
        format,
        segments,
        Arc::new(StdThreads),
        Arc::new(AnyVersion),
    ));
    (store, mapper, loader)
}

/// The dyld "dlopen fail cleanly" scenario: loading a chain a → b → c where
/// c cannot satisfy b's binding must leave no trace of any of the three.
#[test]
fn failed_chain_leaves_no_residue() {
    let (store, mapper, loader) = harness();

    // Baseline image so the pre-attempt state is non-trivial.
    ImageBuilder::new("libsystem.so").build_into(&store);
    loader.load("libsystem.so", LoadFlags::NOW).unwrap();

    ImageBuilder::new("liba.so").dep("libb.so").build_into(&store);
    ImageBuilder::new("libb.so")
        .dep("libc.so")
        .bind(0x10, "extra_symbol", 0)
        .build_into(&store);
    // libc.so exists but does not export what libb.so needs.
    ImageBuilder::new("libc.so").export("base_symbol", 0x10).build_into(&store);

    let count_before = loader.image_count();
    let resident_before = mapper.resident().len();

    let err = loader.load("liba.so", LoadFlags::NOW).unwrap_err();
    assert!(matches!(err, LoadError::UnresolvedSymbol { .. }));

    // Registry identical to its pre-attempt state.
    assert_eq!(loader.image_count(), count_before);
    for index in 0..loader.image_count() {
        let name = loader.image_name_at(index).unwrap();
        assert!(
            !name.starts_with("liba") && !name.starts_with("libb") && !name.starts_with("libc"),
            "unexpected loaded image: {}",
            name
        );
    }
    // No mapping introduced by the failed attempt remains resident.
    assert_eq!(mapper.resident().len(), resident_before);

    // The same identifier can be re-issued once the store is repaired.
    ImageBuilder::new("libc.so").export("extra_symbol", 0x20).build_into(&store);
    loader.load("liba.so", LoadFlags::NOW).unwrap();
    assert_eq!(loader.image_count(), count_before + 3);
}

/// Initializers run strictly dependency-first across the whole graph.
#[test]
fn initializers_run_in_topological_order() {
    let (store, _mapper, loader) = harness();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let record = |name: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
        let order = Arc::clone(order);
        move |_: &Loader| {
            order.lock().unwrap().push(name);
            Ok(())
        }
    };

    ImageBuilder::new("a.so")
        .dep("b.so")
        .dep("c.so")
        .initializer(record("a", &order))
        .build_into(&store);
    ImageBuilder::new("b.so")
        .dep("d.so")
        .initializer(record("b", &order))
        .build_into(&store);
    ImageBuilder::new("c.so")
        .dep("d.so")
        .initializer(record("c", &order))
        .build_into(&store);
    ImageBuilder::new("d.so")
        .initializer(record("d", &order))
        .build_into(&store);

    loader.load("a.so", LoadFlags::NOW).unwrap();

    let ran = order.lock().unwrap().clone();
    let position = |name| ran.iter().position(|n| *n == name).unwrap();
    assert_eq!(ran.len(), 4);
    assert!(position("d") < position("b"));
    assert!(position("d") < position("c"));
    assert!(position("b") < position("a"));
    assert!(position("c") < position("a"));

    // Commit publishes in the same dependency-first order.
    assert_eq!(loader.image_name_at(0).as_deref(), Some("d.so"));
    assert_eq!(loader.image_name_at(3).as_deref(), Some("a.so"));
}

/// Concurrent loads of the same graph serialize on the load lock: one
/// transaction maps, the rest reuse.
#[test]
fn concurrent_loads_share_one_mapping() {
    let (store, mapper, loader) = harness();
    ImageBuilder::new("app").dep("libshared.so").build_into(&store);
    ImageBuilder::new("libshared.so").build_into(&store);

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let mut workers = Vec::new();
    for _ in 0..threads {
        let loader = Arc::clone(&loader);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            barrier.wait();
            loader.load("app", LoadFlags::NOW).map(|handle| handle.base())
        }));
    }

    let bases: Vec<u64> = workers
        .into_iter()
        .map(|worker| worker.join().unwrap().unwrap())
        .collect();

    // Every caller got the same mapping.
    assert!(bases.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(mapper.map_calls("app"), 1);
    assert_eq!(mapper.map_calls("libshared.so"), 1);
    assert_eq!(loader.image_count(), 2);
}

/// Introspection readers never observe a half-committed transaction: the
/// image count only ever jumps by whole graphs.
#[test]
fn readers_observe_whole_commits_only() {
    let (store, _mapper, loader) = harness();
    for index in 0..3 {
        let app = format!("app{}.so", index);
        let lib = format!("lib{}.so", index);
        ImageBuilder::new(&app).dep(&lib).build_into(&store);
        ImageBuilder::new(&lib).build_into(&store);
    }

    let reader = {
        let loader = Arc::clone(&loader);
        thread::spawn(move || {
            let mut samples = Vec::new();
            for _ in 0..1_000_000 {
                let count = loader.image_count();
                samples.push(count);
                if count == 6 {
                    break;
                }
            }
            samples
        })
    };

    for index in 0..3 {
        loader
            .load(&format!("app{}.so", index), LoadFlags::NOW)
            .unwrap();
    }

    let samples = reader.join().unwrap();
    assert!(samples.windows(2).all(|pair| pair[0] <= pair[1]));
    // Each transaction commits two images at once; odd counts would mean a
    // reader saw a partial append.
    assert!(samples.iter().all(|count| count % 2 == 0));
}

/// The process entry sequence: the loader relocates itself, freezes its
/// constant data, and only then starts loading program images.
#[test]
fn bootstrap_then_first_load() {
    let (store, mapper, loader) = harness();

    let own_layout = ImageBuilder::new("dylink")
        .rebase(0x10, 0x2008)
        .const_rebase(0x8, 0x40)
        .build();
    let own_base = map_image(&mapper, &own_layout);
    let receipt = bootstrap::relocate_self(&own_layout, own_base, mapper.as_ref()).unwrap();
    assert_eq!(receipt.rebases_applied, 2);
    assert!(!mapper.is_writable(own_base + 0x2000, 8));

    ImageBuilder::new("app").build_into(&store);
    let handle = loader.load("app", LoadFlags::NOW).unwrap();
    assert_eq!(handle.path(), "app");
    assert_eq!(loader.image_count(), 1);
}
