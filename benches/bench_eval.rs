use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emberlisp::{Interp, StdPlatform};

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("eval arithmetic", |b| {
        let mut interp = Interp::new(Box::new(StdPlatform));
        b.iter(|| interp.dostring(black_box("(+ 1 (* 2 3) (- 10 4))"), &mut |_, _| {}));
    });

    c.bench_function("eval map over range", |b| {
        let mut interp = Interp::new(Box::new(StdPlatform));
        b.iter(|| {
            interp.dostring(
                black_box("(map (lambda (* $0 $0)) (range 32))"),
                &mut |_, _| {},
            )
        });
    });

    c.bench_function("read nested lists", |b| {
        let mut interp = Interp::new(Box::new(StdPlatform));
        b.iter(|| {
            interp.dostring(
                black_box("'(a (b (c (d (e 1 2 3)))) (f g) (h i j))"),
                &mut |_, _| {},
            )
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
