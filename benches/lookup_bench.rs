use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mmdb_reader::{DataValue, DatabaseBuilder, IpVersion, OpenMode, PathElement, Reader};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::hint::black_box;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};

const QUERIES: usize = 10_000;

/// Database of `count` random /24 networks and the queries to run against it
fn build_database(count: usize, ip_version: IpVersion) -> (Vec<u8>, Vec<IpAddr>) {
    let mut rng = StdRng::seed_from_u64(0x6d6d_6462);
    let mut builder = DatabaseBuilder::new().with_ip_version(ip_version);

    let records = (0..20)
        .map(|i| {
            DataValue::from_json(&json!({
                "country": {"iso_code": format!("C{}", i), "names": {"en": format!("Country {}", i)}},
                "location": {"latitude": i as f64, "longitude": -(i as f64)}
            }))
            .unwrap()
        })
        .collect::<Vec<_>>();

    let mut networks = Vec::with_capacity(count);
    for i in 0..count {
        let net: u32 = rng.random::<u32>() & 0xFFFF_FF00;
        networks.push(net);
        builder
            .add_network(IpAddr::V4(Ipv4Addr::from(net)), 24, records[i % records.len()].clone())
            .unwrap();
    }

    // Half the queries hit a network, half are random
    let queries = (0..QUERIES)
        .map(|i| {
            let addr = if i % 2 == 0 {
                networks[rng.random_range(0..networks.len())] | rng.random_range(0..256u32)
            } else {
                rng.random::<u32>()
            };
            IpAddr::V4(Ipv4Addr::from(addr))
        })
        .collect();

    (builder.build().unwrap(), queries)
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(QUERIES as u64));

    for count in [1_000, 100_000].iter() {
        for version in [IpVersion::V4, IpVersion::V6] {
            let (db, queries) = build_database(*count, version);
            let reader = Reader::from_bytes(db).unwrap();
            let label = format!("ipv{}_tree", version.number());

            group.bench_with_input(BenchmarkId::new(label.clone(), count), count, |b, _| {
                b.iter(|| {
                    for ip in &queries {
                        black_box(reader.lookup(black_box(*ip)).unwrap());
                    }
                });
            });

            group.bench_with_input(
                BenchmarkId::new(format!("{}_offset_only", label), count),
                count,
                |b, _| {
                    b.iter(|| {
                        for ip in &queries {
                            black_box(reader.lookup_offset(black_box(*ip)).unwrap());
                        }
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_open_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("open");

    let (db, queries) = build_database(100_000, IpVersion::V6);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&db).unwrap();
    file.flush().unwrap();

    for mode in [OpenMode::Mmap, OpenMode::Memory] {
        group.bench_function(format!("{:?}", mode), |b| {
            b.iter(|| {
                let reader = Reader::options().mode(mode).open(file.path()).unwrap();
                black_box(reader.lookup(queries[0]).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_decode_path(c: &mut Criterion) {
    let (db, queries) = build_database(10_000, IpVersion::V4);
    let reader = Reader::from_bytes(db).unwrap();
    let path: [PathElement<'_>; 3] = ["country".into(), "names".into(), "en".into()];

    c.bench_function("lookup_path", |b| {
        b.iter(|| {
            for ip in &queries {
                black_box(reader.lookup_path(black_box(*ip), &path).unwrap());
            }
        });
    });
}

criterion_group!(benches, bench_lookup, bench_open_modes, bench_decode_path);
criterion_main!(benches);
