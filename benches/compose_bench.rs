use criterion::{black_box, criterion_group, criterion_main, Criterion};
use newscard::resolve::{content_key, normalize};
use newscard::{Compositor, Resolution, Viewport};

fn bench_normalize(c: &mut Criterion) {
    let links = [
        "https://drive.google.com/file/d/1AbC-xyz_9/view?usp=sharing",
        "https://www.dropbox.com/s/abc123/photo.jpg?dl=0",
        "https://cdn.example.com/img/photo.jpg",
    ];
    c.bench_function("normalize_share_links", |b| {
        b.iter(|| {
            for link in links {
                black_box(normalize(black_box(link)));
            }
        })
    });

    c.bench_function("content_key", |b| {
        b.iter(|| content_key(black_box("https://cdn.example.com/img/photo.jpg")))
    });
}

fn bench_compose(c: &mut Criterion) {
    let compositor = Compositor::new(Viewport::default());
    let background = Resolution::Local {
        path: "/srv/out/job-bg-0123456789abcdef.jpg".into(),
        href: "file:///srv/out/job-bg-0123456789abcdef.jpg".into(),
        cache_hit: true,
    };
    let news = Resolution::Degraded {
        href: "https://cdn.example.com/img/photo.jpg".into(),
        reason: "404".into(),
    };
    let headline = "Storm <warning> issued for the coast as rivers rise & roads close";

    c.bench_function("compose_card", |b| {
        b.iter(|| compositor.compose(black_box(headline), &background, &news))
    });
}

criterion_group!(benches, bench_normalize, bench_compose);
criterion_main!(benches);
