use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emberlisp::{Interp, StdPlatform};

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("vm tail-recursive countdown", |b| {
        let mut interp = Interp::new(Box::new(StdPlatform));
        interp.dostring(
            "(set 'spin (compile (lambda (if (equal $0 0) 'done (spin (- $0 1))))))",
            &mut |_, _| {},
        );
        b.iter(|| interp.dostring(black_box("(spin 1000)"), &mut |_, _| {}));
    });

    c.bench_function("vm compiled let and arithmetic", |b| {
        let mut interp = Interp::new(Box::new(StdPlatform));
        interp.dostring(
            "(set 'poly (compile (lambda (let ((x $0)) (+ (* x x) (* 3 x) 1)))))",
            &mut |_, _| {},
        );
        b.iter(|| interp.dostring(black_box("(poly 17)"), &mut |_, _| {}));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
