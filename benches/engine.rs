use criterion::{criterion_group, criterion_main, Criterion};
use embercask::{Engine, Options};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn rand_key(rng: &mut StdRng) -> Bytes {
    Bytes::from(format!("bench-key-{:09}", rng.gen_range(0..100_000u64)))
}

fn rand_value(rng: &mut StdRng) -> Bytes {
    let mut value = vec![0u8; 128];
    rng.fill(value.as_mut_slice());
    Bytes::from(value)
}

fn bench_engine(c: &mut Criterion) {
    let dir = tempfile::TempDir::with_prefix("embercask-bench").expect("tempdir");
    let options = Options { dir_path: dir.path().to_path_buf(), ..Options::default() };
    let engine = Engine::open(options).expect("open engine");

    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..10_000 {
        engine.put(rand_key(&mut rng), rand_value(&mut rng)).expect("seed put");
    }

    c.bench_function("put", |b| {
        b.iter(|| {
            engine.put(rand_key(&mut rng), rand_value(&mut rng)).expect("bench put");
        })
    });

    c.bench_function("get", |b| {
        b.iter(|| match engine.get(rand_key(&mut rng)) {
            Ok(_) | Err(embercask::Errors::KeyNotFound) => {}
            Err(err) => panic!("bench get: {err}"),
        })
    });

    c.bench_function("delete", |b| {
        b.iter(|| {
            engine.delete(rand_key(&mut rng)).expect("bench delete");
        })
    });
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
