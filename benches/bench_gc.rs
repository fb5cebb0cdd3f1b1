use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emberlisp::{Interp, StdPlatform};

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("gc full cycle under live data", |b| {
        let mut interp = Interp::new(Box::new(StdPlatform));
        interp.dostring("(set 'live (map (lambda (list $0 $0)) (range 64)))", &mut |_, _| {});
        b.iter(|| {
            // Churn some garbage, then collect.
            for i in 0..256 {
                interp.make_integer(black_box(i));
            }
            interp.collect_garbage()
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
