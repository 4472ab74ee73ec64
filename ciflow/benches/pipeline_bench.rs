//! Benchmarks for the credential file codec and report aggregation.

use ciflow::context::RunIdentity;
use ciflow::credentials::envfile;
use ciflow::credentials::{CredentialEnv, CredentialSet};
use ciflow::report::{ReportAggregator, StageOutput};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn credential_env() -> CredentialEnv {
    CredentialEnv {
        credentials: CredentialSet {
            access_key_id: "ASIAEXAMPLEKEY000001".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfi'CYEXAMPLEKEY".to_string(),
            session_token: "IQoJb3JpZ2luX2VjE".repeat(40),
        },
        region: "us-east-1".to_string(),
    }
}

fn codec_benchmark(c: &mut Criterion) {
    let env = credential_env();
    let text = envfile::render(&env).expect("render");

    c.bench_function("envfile_render", |b| b.iter(|| envfile::render(black_box(&env))));
    c.bench_function("envfile_parse", |b| b.iter(|| envfile::parse(black_box(&text))));
}

fn aggregation_benchmark(c: &mut Criterion) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("test-etl-allure");
    std::fs::create_dir_all(&dir).expect("results dir");
    for i in 0..200 {
        let status = if i % 10 == 0 { "failed" } else { "passed" };
        std::fs::write(
            dir.join(format!("{i:04}-result.json")),
            format!(r#"{{"name": "test_{i}", "status": "{status}", "start": 0, "stop": {i}}}"#),
        )
        .expect("result file");
    }

    let identity = RunIdentity::new("bench", "ciflow").expect("identity");
    let aggregator = ReportAggregator::new(&identity);
    let outputs = vec![
        StageOutput::new("test-etl-allure", Some(dir)),
        StageOutput::new("test-run-1", None),
    ];

    c.bench_function("aggregate_200_results", |b| {
        b.iter(|| aggregator.collect(black_box(&outputs)));
    });
}

criterion_group!(benches, codec_benchmark, aggregation_benchmark);
criterion_main!(benches);
